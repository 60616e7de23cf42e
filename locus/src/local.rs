//! In-process substrate: every rank is a thread of the current process.
//!
//! Collectives meet in a shared rendezvous table keyed by
//! `(comm_id, epoch)`. Each rank deposits its block, waits until the whole
//! scope has arrived, copies out the result, and the last one out removes
//! the slot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::error::{LocusError, Result};
use crate::scope::{GroupScope, encode_split_entry};
use crate::substrate::Substrate;
use crate::types::Rank;

type SlotKey = (u64, u64);

struct Slot {
    blocks: Vec<Option<Vec<u8>>>,
    arrived: usize,
    departed: usize,
}

struct Shared {
    hosts: Vec<String>,
    slots: Mutex<HashMap<SlotKey, Slot>>,
    arrived: Condvar,
    shutdown: Vec<AtomicBool>,
}

/// A simulated job: one host name per rank.
///
/// Host names are arbitrary strings, so any node layout can be simulated
/// on one machine.
#[derive(Clone)]
pub struct LocalCluster {
    shared: Arc<Shared>,
}

impl LocalCluster {
    /// A job with one rank per entry of `hosts`, ranked in order.
    pub fn new<I, H>(hosts: I) -> Self
    where
        I: IntoIterator<Item = H>,
        H: Into<String>,
    {
        let hosts: Vec<String> = hosts.into_iter().map(Into::into).collect();
        let shutdown = hosts.iter().map(|_| AtomicBool::new(false)).collect();
        Self {
            shared: Arc::new(Shared {
                hosts,
                slots: Mutex::new(HashMap::new()),
                arrived: Condvar::new(),
                shutdown,
            }),
        }
    }

    pub fn size(&self) -> i32 {
        self.shared.hosts.len() as i32
    }

    /// One substrate per rank, in rank order.
    ///
    /// Each call hands out a fresh set; use one set per job.
    pub fn substrates(&self) -> Vec<LocalSubstrate> {
        (0..self.size())
            .map(|rank| LocalSubstrate {
                rank,
                shared: Arc::clone(&self.shared),
                started: false,
                down: false,
            })
            .collect()
    }

    pub fn into_substrates(self) -> Vec<LocalSubstrate> {
        self.substrates()
    }

    /// Whether rank `rank` has completed `shutdown`.
    pub fn is_rank_shutdown(&self, rank: Rank) -> bool {
        usize::try_from(rank)
            .ok()
            .and_then(|r| self.shared.shutdown.get(r))
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    /// Run `f` once per rank, each on its own thread, and collect the
    /// results in rank order.
    ///
    /// A panic on any rank is resumed on the caller's thread once all ranks
    /// have finished.
    pub fn run<F, T>(&self, f: F) -> Vec<T>
    where
        F: Fn(LocalSubstrate) -> T + Sync,
        T: Send,
    {
        let substrates = self.substrates();
        let f = &f;
        std::thread::scope(|s| {
            let handles: Vec<_> = substrates
                .into_iter()
                .map(|substrate| s.spawn(move || f(substrate)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        })
    }
}

/// One rank's view of a [`LocalCluster`].
pub struct LocalSubstrate {
    rank: Rank,
    shared: Arc<Shared>,
    started: bool,
    down: bool,
}

impl LocalSubstrate {
    fn ensure_running(&self, operation: &'static str) -> Result<()> {
        if !self.started {
            return Err(LocusError::substrate(operation, "substrate not started"));
        }
        if self.down {
            return Err(LocusError::substrate(operation, "substrate already shut down"));
        }
        Ok(())
    }

    /// Deposit `block` and return every member's block in scope-rank order.
    fn exchange(
        &self,
        operation: &'static str,
        scope: &GroupScope,
        block: &[u8],
    ) -> Result<Vec<Vec<u8>>> {
        self.ensure_running(operation)?;

        let key = (scope.comm_id(), scope.next_epoch());
        let size = scope.size() as usize;

        let mut slots = self
            .shared
            .slots
            .lock()
            .map_err(|_| LocusError::LockPoisoned("local rendezvous"))?;
        let slot = slots.entry(key).or_insert_with(|| Slot {
            blocks: vec![None; size],
            arrived: 0,
            departed: 0,
        });
        slot.blocks[scope.rank() as usize] = Some(block.to_vec());
        slot.arrived += 1;
        if slot.arrived == size {
            self.shared.arrived.notify_all();
        }

        let mut slots = self
            .shared
            .arrived
            .wait_while(slots, |slots| {
                slots.get(&key).is_some_and(|slot| slot.arrived < size)
            })
            .map_err(|_| LocusError::LockPoisoned("local rendezvous"))?;

        let slot = slots
            .get_mut(&key)
            .ok_or_else(|| LocusError::substrate(operation, "rendezvous slot vanished"))?;
        let blocks = slot
            .blocks
            .iter()
            .map(|b| b.clone().unwrap_or_default())
            .collect();
        slot.departed += 1;
        if slot.departed == size {
            slots.remove(&key);
        }

        tracing::trace!(
            rank = self.rank,
            comm_id = key.0,
            epoch = key.1,
            operation,
            "local exchange complete"
        );
        Ok(blocks)
    }
}

impl Substrate for LocalSubstrate {
    type Scope = GroupScope;

    fn startup(&mut self) -> Result<()> {
        if self.started {
            return Err(LocusError::substrate("startup", "startup called twice"));
        }
        self.started = true;
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        self.ensure_running("shutdown")?;
        self.down = true;
        self.shared.shutdown[self.rank as usize].store(true, Ordering::Release);
        Ok(())
    }

    fn is_shutdown(&self) -> bool {
        self.down
    }

    fn self_rank(&self) -> Result<Rank> {
        self.ensure_running("self_rank")?;
        Ok(self.rank)
    }

    fn group_size(&self) -> Result<i32> {
        self.ensure_running("group_size")?;
        Ok(self.shared.hosts.len() as i32)
    }

    fn host_name(&self) -> Result<String> {
        Ok(self.shared.hosts[self.rank as usize].clone())
    }

    fn world(&self) -> Result<GroupScope> {
        self.ensure_running("world")?;
        Ok(GroupScope::world(self.rank, self.shared.hosts.len() as i32))
    }

    fn scope_rank(&self, scope: &GroupScope) -> Rank {
        scope.rank()
    }

    fn scope_size(&self, scope: &GroupScope) -> i32 {
        scope.size()
    }

    fn all_gather(&self, scope: &GroupScope, local: &[u8]) -> Result<Vec<u8>> {
        let blocks = self.exchange("all_gather", scope, local)?;
        if let Some(odd) = blocks.iter().find(|b| b.len() != local.len()) {
            return Err(LocusError::substrate(
                "all_gather",
                format!(
                    "block size mismatch: local {} bytes, peer {} bytes",
                    local.len(),
                    odd.len()
                ),
            ));
        }
        Ok(blocks.concat())
    }

    fn split(&self, parent: &GroupScope, color: i32, key: i32) -> Result<GroupScope> {
        let entry = encode_split_entry(color, key);
        let gathered = self.all_gather(parent, &entry)?;
        parent.derive_split(&gathered, color)
    }

    fn barrier(&self, scope: &GroupScope) -> Result<()> {
        self.exchange("barrier", scope, &[])?;
        Ok(())
    }

    fn release(&self, scope: GroupScope) -> Result<()> {
        self.ensure_running("release")?;
        drop(scope);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(cluster: &LocalCluster) -> Vec<LocalSubstrate> {
        let mut subs = cluster.substrates();
        for s in &mut subs {
            s.startup().unwrap();
        }
        subs
    }

    #[test]
    fn test_all_gather_orders_by_rank() {
        let cluster = LocalCluster::new(["a", "b", "c"]);
        let results = cluster.run(|mut s| {
            s.startup().unwrap();
            let world = s.world().unwrap();
            let rank = s.self_rank().unwrap() as u8;
            s.all_gather(&world, &[rank, rank]).unwrap()
        });
        for gathered in results {
            assert_eq!(gathered, vec![0, 0, 1, 1, 2, 2]);
        }
    }

    #[test]
    fn test_repeated_collectives_do_not_mix() {
        let cluster = LocalCluster::new(["a"; 4]);
        let results = cluster.run(|mut s| {
            s.startup().unwrap();
            let world = s.world().unwrap();
            let rank = s.self_rank().unwrap() as u8;
            (0..20u8)
                .map(|round| {
                    s.barrier(&world).unwrap();
                    s.all_gather(&world, &[round, rank]).unwrap()
                })
                .collect::<Vec<_>>()
        });
        for per_rank in results {
            for (round, gathered) in per_rank.iter().enumerate() {
                let r = round as u8;
                assert_eq!(gathered, &vec![r, 0, r, 1, r, 2, r, 3]);
            }
        }
    }

    #[test]
    fn test_split_then_gather_inside_group() {
        let cluster = LocalCluster::new(["a"; 4]);
        let results = cluster.run(|mut s| {
            s.startup().unwrap();
            let world = s.world().unwrap();
            let rank = s.self_rank().unwrap();
            let sub = s.split(&world, rank % 2, -rank).unwrap();
            let gathered = s.all_gather(&sub, &[rank as u8]).unwrap();
            s.barrier(&sub).unwrap();
            s.release(sub).unwrap();
            gathered
        });
        // Keys are negated ranks, so each group is ordered high rank first.
        assert_eq!(results, vec![vec![2, 0], vec![3, 1], vec![2, 0], vec![3, 1]]);
    }

    #[test]
    fn test_lifecycle_errors() {
        let cluster = LocalCluster::new(["a"]);
        let mut s = cluster.substrates().remove(0);
        assert!(s.self_rank().is_err());
        assert!(s.world().is_err());
        assert_eq!(s.host_name().unwrap(), "a");

        s.startup().unwrap();
        assert!(s.startup().is_err());
        s.shutdown().unwrap();
        assert!(s.is_shutdown());
        assert!(cluster.is_rank_shutdown(0));
        assert!(s.shutdown().is_err());
        assert!(s.self_rank().is_err());
    }

    #[test]
    fn test_single_rank_collectives_complete_inline() {
        let cluster = LocalCluster::new(["only"]);
        let subs = started(&cluster);
        let s = &subs[0];
        let world = s.world().unwrap();
        s.barrier(&world).unwrap();
        assert_eq!(s.all_gather(&world, b"xy").unwrap(), b"xy".to_vec());
        let sub = s.split(&world, 3, 0).unwrap();
        assert_eq!(sub.members(), &[0]);
    }

    #[test]
    fn test_is_rank_shutdown_out_of_range() {
        let cluster = LocalCluster::new(["a"]);
        assert!(!cluster.is_rank_shutdown(-1));
        assert!(!cluster.is_rank_shutdown(1));
    }
}
