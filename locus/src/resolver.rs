use indexmap::IndexMap;

use crate::error::{LocusError, Result};
use crate::identity::{HostKey, ProcessIdentity};
use crate::substrate::Substrate;
use crate::types::{HOSTNAME_BUF_SIZE, Rank};

/// The processes sharing one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocaleGroup {
    /// Locale id, dense in `[0, locales)`.
    pub locale: i32,
    /// Host name of the locale (decoded from the exchanged key).
    pub hostname: String,
    /// Global ranks on this locale, ascending.
    pub members: Vec<Rank>,
}

impl LocaleGroup {
    /// Lowest global rank on the locale.
    pub fn lead(&self) -> Rank {
        self.members[0]
    }

    pub fn size(&self) -> i32 {
        self.members.len() as i32
    }
}

/// Where one process sits in the locale map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocaleAssignment {
    /// Number of distinct locales in the job.
    pub locales: i32,
    /// Locale id of the process.
    pub locale: i32,
    /// Position of the process among its locale's members.
    pub locale_rank: Rank,
    /// Number of processes on the locale.
    pub locale_size: i32,
}

/// Mapping from every global rank to its locale.
///
/// Built from the host keys of all ranks in rank order. Locale ids are
/// handed out by first appearance, so any process holding the same keys
/// builds the same map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocaleMap {
    groups: Vec<LocaleGroup>,
    /// Locale id of each global rank.
    locale_of: Vec<i32>,
}

impl LocaleMap {
    /// Build the map from one key per global rank, indexed by rank.
    pub fn from_host_keys(keys: &[HostKey]) -> Self {
        let mut by_host: IndexMap<&HostKey, Vec<Rank>> = IndexMap::new();
        let mut locale_of = Vec::with_capacity(keys.len());

        for (rank, key) in keys.iter().enumerate() {
            let entry = by_host.entry(key);
            locale_of.push(entry.index() as i32);
            entry.or_default().push(rank as Rank);
        }

        let groups = by_host
            .into_iter()
            .enumerate()
            .map(|(locale, (key, members))| LocaleGroup {
                locale: locale as i32,
                hostname: key.to_name(),
                members,
            })
            .collect();

        Self { groups, locale_of }
    }

    /// Convenience wrapper over [`from_host_keys`](Self::from_host_keys).
    pub fn from_hostnames<S: AsRef<str>>(names: &[S]) -> Self {
        let keys: Vec<HostKey> = names.iter().map(|n| HostKey::new(n.as_ref())).collect();
        Self::from_host_keys(&keys)
    }

    /// Parse the result of the host-name all-gather.
    pub fn from_gathered(gathered: &[u8], size: i32) -> Result<Self> {
        let expected = size as usize * HOSTNAME_BUF_SIZE;
        if gathered.len() != expected {
            return Err(LocusError::Topology {
                reason: format!(
                    "host-name exchange returned {} bytes, expected {expected}",
                    gathered.len()
                ),
            });
        }
        let keys: Vec<HostKey> = gathered
            .chunks_exact(HOSTNAME_BUF_SIZE)
            .filter_map(HostKey::from_bytes)
            .collect();
        Ok(Self::from_host_keys(&keys))
    }

    /// Number of distinct locales.
    pub fn locales(&self) -> i32 {
        self.groups.len() as i32
    }

    /// Number of ranks covered by the map.
    pub fn size(&self) -> i32 {
        self.locale_of.len() as i32
    }

    /// All locale groups, ordered by locale id.
    pub fn groups(&self) -> &[LocaleGroup] {
        &self.groups
    }

    pub fn group(&self, locale: i32) -> Option<&LocaleGroup> {
        usize::try_from(locale).ok().and_then(|l| self.groups.get(l))
    }

    /// Locale id of a global rank.
    pub fn locale_of(&self, rank: Rank) -> Option<i32> {
        usize::try_from(rank)
            .ok()
            .and_then(|r| self.locale_of.get(r))
            .copied()
    }

    /// Lowest global rank of each locale, ordered by locale id.
    pub fn leads(&self) -> Vec<Rank> {
        self.groups.iter().map(LocaleGroup::lead).collect()
    }

    /// Locale coordinates of `rank`.
    pub fn assignment(&self, rank: Rank) -> Result<LocaleAssignment> {
        let locale = self.locale_of(rank).ok_or_else(|| LocusError::Topology {
            reason: format!("rank {rank} outside job of size {}", self.size()),
        })?;
        let group = &self.groups[locale as usize];
        let locale_rank = group
            .members
            .binary_search(&rank)
            .map_err(|_| LocusError::Topology {
                reason: format!("rank {rank} missing from locale {locale}"),
            })? as Rank;

        Ok(LocaleAssignment {
            locales: self.locales(),
            locale,
            locale_rank,
            locale_size: group.size(),
        })
    }
}

/// Discover the locale map. Collective over the default scope.
///
/// Every rank contributes its fixed-width host key; every rank then runs the
/// same first-appearance grouping over the same gathered bytes.
pub fn resolve_locales<S: Substrate + ?Sized>(
    substrate: &S,
    world: &S::Scope,
    identity: &ProcessIdentity,
) -> Result<LocaleMap> {
    let key = identity.host_key();
    let gathered = substrate.all_gather(world, key.as_bytes())?;
    let map = LocaleMap::from_gathered(&gathered, identity.size)?;

    tracing::debug!(
        rank = identity.rank,
        locales = map.locales(),
        "locale map resolved"
    );
    Ok(map)
}
