use crate::identity::ProcessIdentity;
use crate::resolver::LocaleAssignment;
use crate::types::{Rank, UNSET};

/// This process's place in the job, as published by `init()`.
///
/// Every field reads [`UNSET`] (`-1`) until then.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    /// Global rank of this process.
    pub rank: Rank,
    /// Total number of processes in the job.
    pub size: i32,
    /// Total number of locales (nodes) in the job.
    pub locales: i32,
    /// Locale id of this process.
    pub locale: i32,
    /// Node-local rank of this process.
    pub locale_rank: Rank,
    /// Number of processes on this locale.
    pub locale_size: i32,
}

impl Default for Topology {
    fn default() -> Self {
        Self::UNPUBLISHED
    }
}

impl Topology {
    pub const UNPUBLISHED: Topology = Topology {
        rank: UNSET,
        size: UNSET,
        locales: UNSET,
        locale: UNSET,
        locale_rank: UNSET,
        locale_size: UNSET,
    };

    pub fn new(identity: &ProcessIdentity, assignment: &LocaleAssignment) -> Self {
        Self {
            rank: identity.rank,
            size: identity.size,
            locales: assignment.locales,
            locale: assignment.locale,
            locale_rank: assignment.locale_rank,
            locale_size: assignment.locale_size,
        }
    }

    pub fn is_published(&self) -> bool {
        *self != Self::UNPUBLISHED
    }

    /// Alias for `size`.
    pub fn ranks(&self) -> i32 {
        self.size
    }

    /// Alias for `locale_size`.
    pub fn locale_ranks(&self) -> i32 {
        self.locale_size
    }

    /// True if this process has the lowest rank on its locale.
    pub fn is_locale_lead(&self) -> bool {
        self.is_published() && self.locale_rank == 0
    }

    /// True if the whole job runs on one locale.
    pub fn is_single_locale(&self) -> bool {
        self.locales == 1
    }
}
