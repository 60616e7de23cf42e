use crate::error::Result;
use crate::types::Rank;

/// The process-group communication layer a [`Connection`](crate::Connection)
/// is built on.
///
/// Every method that moves data between processes is collective: all ranks
/// of the scope must call it, in the same order, and it blocks until they
/// have. There are no timeouts; a rank that never arrives stalls its peers.
///
/// Implementations: [`LocalSubstrate`](crate::LocalSubstrate) (threads in one
/// process) and `locus_tcp::TcpSubstrate` (one OS process per rank).
pub trait Substrate {
    /// Handle to a communication scope (a communicator).
    type Scope;

    /// Bring up the process group. Called once, before anything but
    /// `host_name`.
    fn startup(&mut self) -> Result<()>;

    /// Tear down the process group. Called once, after everything else.
    fn shutdown(&mut self) -> Result<()>;

    /// Whether `shutdown` has completed.
    fn is_shutdown(&self) -> bool;

    /// This process's rank in the default scope.
    fn self_rank(&self) -> Result<Rank>;

    /// Number of processes in the default scope.
    fn group_size(&self) -> Result<i32>;

    /// Name of the host this process runs on.
    fn host_name(&self) -> Result<String>;

    /// The default scope containing every process of the job.
    fn world(&self) -> Result<Self::Scope>;

    /// This process's rank inside `scope`.
    fn scope_rank(&self, scope: &Self::Scope) -> Rank;

    /// Number of processes inside `scope`.
    fn scope_size(&self, scope: &Self::Scope) -> i32;

    /// Gather an equally sized byte block from every rank of `scope`.
    ///
    /// Returns the blocks concatenated in scope-rank order.
    fn all_gather(&self, scope: &Self::Scope, local: &[u8]) -> Result<Vec<u8>>;

    /// Partition `parent` by `color`; each part is ordered by `key`, ties
    /// broken by parent rank.
    fn split(&self, parent: &Self::Scope, color: i32, key: i32) -> Result<Self::Scope>;

    /// Block until every rank of `scope` has entered the barrier.
    fn barrier(&self, scope: &Self::Scope) -> Result<()>;

    /// Release a scope obtained from `split`.
    fn release(&self, scope: Self::Scope) -> Result<()>;
}
