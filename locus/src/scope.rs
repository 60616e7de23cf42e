//! Scope bookkeeping shared by substrates that implement collectives
//! themselves instead of delegating to a native communicator.

use crate::error::{LocusError, Result};
use crate::types::Rank;
use std::sync::atomic::{AtomicU64, Ordering};

/// Width of one `(color, key)` entry in a split exchange.
pub const SPLIT_ENTRY_SIZE: usize = 8;

/// A communication scope: an ordered set of job ranks plus the counters
/// needed to tell successive collectives on it apart.
///
/// `comm_id` is 0 for the default scope. Split scopes derive theirs from the
/// parent id, the parent's split generation and the color, so every member
/// computes the same id without talking to anyone.
#[derive(Debug)]
pub struct GroupScope {
    comm_id: u64,
    rank: Rank,
    /// Job-wide rank of each member, indexed by scope rank.
    members: Vec<Rank>,
    epoch: AtomicU64,
    split_generation: AtomicU64,
}

impl GroupScope {
    /// The default scope for a job of `size` ranks, seen from `rank`.
    pub fn world(rank: Rank, size: i32) -> Self {
        Self {
            comm_id: 0,
            rank,
            members: (0..size).collect(),
            epoch: AtomicU64::new(0),
            split_generation: AtomicU64::new(0),
        }
    }

    pub fn comm_id(&self) -> u64 {
        self.comm_id
    }

    /// This process's rank inside the scope.
    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn size(&self) -> i32 {
        self.members.len() as i32
    }

    /// Job-wide ranks of the members, in scope-rank order.
    pub fn members(&self) -> &[Rank] {
        &self.members
    }

    /// Job-wide rank of this process.
    pub fn global_rank(&self) -> Rank {
        self.members[self.rank as usize]
    }

    /// Claim the sequence number for the next collective on this scope.
    ///
    /// All members call collectives in the same order, so they draw the same
    /// numbers.
    pub fn next_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::Relaxed)
    }

    /// Build this process's sub-scope from the `(color, key)` entries
    /// gathered from every member of `self`.
    ///
    /// `gathered` holds `size() * SPLIT_ENTRY_SIZE` bytes in scope-rank order.
    pub fn derive_split(&self, gathered: &[u8], color: i32) -> Result<GroupScope> {
        let size = self.members.len();
        if gathered.len() != size * SPLIT_ENTRY_SIZE {
            return Err(LocusError::Topology {
                reason: format!(
                    "split exchange returned {} bytes, expected {}",
                    gathered.len(),
                    size * SPLIT_ENTRY_SIZE
                ),
            });
        }

        // Same color, sorted by (key, parent rank).
        let mut group: Vec<(Rank, i32)> = gathered
            .chunks_exact(SPLIT_ENTRY_SIZE)
            .enumerate()
            .filter_map(|(parent_rank, entry)| {
                let (c, k) = decode_split_entry(entry);
                (c == color).then_some((parent_rank as Rank, k))
            })
            .collect();
        group.sort_by_key(|&(parent_rank, k)| (k, parent_rank));

        let rank = group
            .iter()
            .position(|&(r, _)| r == self.rank)
            .ok_or_else(|| LocusError::Topology {
                reason: format!("rank {} missing from its own split group", self.rank),
            })? as Rank;

        let members = group
            .iter()
            .map(|&(parent_rank, _)| self.members[parent_rank as usize])
            .collect();

        let generation = self.split_generation.fetch_add(1, Ordering::Relaxed);

        Ok(GroupScope {
            comm_id: split_comm_id(self.comm_id, generation, color),
            rank,
            members,
            epoch: AtomicU64::new(0),
            split_generation: AtomicU64::new(0),
        })
    }
}

/// Encode one split entry: `[color: i32 LE][key: i32 LE]`.
pub fn encode_split_entry(color: i32, key: i32) -> [u8; SPLIT_ENTRY_SIZE] {
    let mut entry = [0u8; SPLIT_ENTRY_SIZE];
    entry[..4].copy_from_slice(&color.to_le_bytes());
    entry[4..].copy_from_slice(&key.to_le_bytes());
    entry
}

fn decode_split_entry(entry: &[u8]) -> (i32, i32) {
    let mut color = [0u8; 4];
    let mut key = [0u8; 4];
    color.copy_from_slice(&entry[..4]);
    key.copy_from_slice(&entry[4..SPLIT_ENTRY_SIZE]);
    (i32::from_le_bytes(color), i32::from_le_bytes(key))
}

/// FNV-1a over (parent id, generation, color), never 0 (reserved for the
/// default scope).
fn split_comm_id(parent: u64, generation: u64, color: i32) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325;
    let bytes = parent
        .to_le_bytes()
        .into_iter()
        .chain(generation.to_le_bytes())
        .chain(color.to_le_bytes());
    for b in bytes {
        h ^= b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    if h == 0 { 1 } else { h }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gathered(entries: &[(i32, i32)]) -> Vec<u8> {
        entries
            .iter()
            .flat_map(|&(c, k)| encode_split_entry(c, k))
            .collect()
    }

    #[test]
    fn test_world_scope() {
        let scope = GroupScope::world(2, 4);
        assert_eq!(scope.comm_id(), 0);
        assert_eq!(scope.rank(), 2);
        assert_eq!(scope.size(), 4);
        assert_eq!(scope.members(), &[0, 1, 2, 3]);
        assert_eq!(scope.global_rank(), 2);
    }

    #[test]
    fn test_split_orders_by_key_then_rank() {
        // Ranks 0..4; color = rank % 2, keys reversed.
        let all = gathered(&[(0, 9), (1, 9), (0, 1), (1, 1)]);

        let scope = GroupScope::world(0, 4);
        let sub = scope.derive_split(&all, 0).unwrap();
        assert_eq!(sub.members(), &[2, 0]);
        assert_eq!(sub.rank(), 1);
        assert_eq!(sub.size(), 2);

        let scope = GroupScope::world(3, 4);
        let sub = scope.derive_split(&all, 1).unwrap();
        assert_eq!(sub.members(), &[3, 1]);
        assert_eq!(sub.rank(), 0);
    }

    #[test]
    fn test_split_ties_broken_by_parent_rank() {
        let all = gathered(&[(5, 0), (5, 0), (5, 0)]);
        let sub = GroupScope::world(1, 3).derive_split(&all, 5).unwrap();
        assert_eq!(sub.members(), &[0, 1, 2]);
        assert_eq!(sub.rank(), 1);
    }

    #[test]
    fn test_split_comm_ids_agree_and_differ() {
        let all = gathered(&[(0, 0), (0, 1), (1, 2), (1, 3)]);
        let a0 = GroupScope::world(0, 4).derive_split(&all, 0).unwrap();
        let a1 = GroupScope::world(1, 4).derive_split(&all, 0).unwrap();
        let b2 = GroupScope::world(2, 4).derive_split(&all, 1).unwrap();
        assert_eq!(a0.comm_id(), a1.comm_id());
        assert_ne!(a0.comm_id(), b2.comm_id());
        assert_ne!(a0.comm_id(), 0);
    }

    #[test]
    fn test_successive_splits_get_new_ids() {
        let all = gathered(&[(0, 0), (0, 1)]);
        let world = GroupScope::world(0, 2);
        let first = world.derive_split(&all, 0).unwrap();
        let second = world.derive_split(&all, 0).unwrap();
        assert_ne!(first.comm_id(), second.comm_id());
    }

    #[test]
    fn test_nested_split_maps_to_job_ranks() {
        // Split {0,1,2,3} into {1,3} then split that by key only.
        let world = GroupScope::world(3, 4);
        let odd = world
            .derive_split(&gathered(&[(0, 0), (1, 1), (0, 2), (1, 3)]), 1)
            .unwrap();
        assert_eq!(odd.members(), &[1, 3]);

        let reversed = odd.derive_split(&gathered(&[(0, 1), (0, 0)]), 0).unwrap();
        assert_eq!(reversed.members(), &[3, 1]);
        assert_eq!(reversed.rank(), 0);
        assert_eq!(reversed.global_rank(), 3);
    }

    #[test]
    fn test_split_rejects_short_exchange() {
        let err = GroupScope::world(0, 2)
            .derive_split(&[0u8; 8], 0)
            .unwrap_err();
        assert!(err.to_string().contains("expected 16"));
    }

    #[test]
    fn test_epochs_advance() {
        let scope = GroupScope::world(0, 1);
        assert_eq!(scope.next_epoch(), 0);
        assert_eq!(scope.next_epoch(), 1);
    }
}
