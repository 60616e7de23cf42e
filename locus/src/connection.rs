use crate::config::{FailurePolicy, LocusConfig};
use crate::error::{LocusError, Result, abort_on_error};
use crate::identity::ProcessIdentity;
use crate::partition::{Partition, partition};
use crate::resolver::{LocaleAssignment, LocaleMap, resolve_locales};
use crate::substrate::Substrate;
use crate::topology::Topology;
use crate::types::{ConnectionState, Rank};

/// A process's membership in a job laid out over multi-core nodes
/// ("locales").
///
/// After [`init`](Self::init) every process holds two identities and two
/// synchronization domains:
///
/// - a job-wide rank and scope covering all processes on all nodes, and
/// - a node-local rank and scope covering only the processes on its node,
///   so node-local barriers do not involve other nodes.
///
/// Call [`finalize`](Self::finalize) before the connection goes out of scope.
/// Dropping an initialized connection logs a warning and finalizes on a
/// best-effort basis, which may deadlock if peers have already moved on.
///
/// ```no_run
/// use locus::{Connection, LocalCluster, LocusConfig};
///
/// # fn main() -> locus::Result<()> {
/// let locales = LocalCluster::new(["node0", "node0", "node1"]).run(|substrate| {
///     let mut conn = Connection::connect(substrate, LocusConfig::propagating())?;
///     conn.locale_barrier()?;
///     let locale = conn.locale();
///     conn.finalize()?;
///     Ok::<_, locus::LocusError>(locale)
/// });
/// assert_eq!(locales.into_iter().collect::<locus::Result<Vec<_>>>()?, vec![0, 0, 1]);
/// # Ok(())
/// # }
/// ```
pub struct Connection<S: Substrate> {
    substrate: S,
    config: LocusConfig,
    state: ConnectionState,
    /// Written once by `init`.
    topology: Topology,
    identity: Option<ProcessIdentity>,
    locale_map: Option<LocaleMap>,
    scopes: Option<Partition<S>>,
}

impl<S: Substrate> Connection<S> {
    /// Wrap a substrate, configured from the environment.
    pub fn new(substrate: S) -> Self {
        Self::with_config(substrate, LocusConfig::from_env())
    }

    pub fn with_config(substrate: S, config: LocusConfig) -> Self {
        Self {
            substrate,
            config,
            state: ConnectionState::Uninitialized,
            topology: Topology::UNPUBLISHED,
            identity: None,
            locale_map: None,
            scopes: None,
        }
    }

    /// Wrap a substrate and initialize it in one step.
    pub fn connect(substrate: S, config: LocusConfig) -> Result<Self> {
        let mut conn = Self::with_config(substrate, config);
        conn.init()?;
        Ok(conn)
    }

    /// Start the substrate, discover locales and form both scopes.
    ///
    /// Collective: every process of the job must call it. Valid only on an
    /// uninitialized connection.
    pub fn init(&mut self) -> Result<()> {
        let result = self.try_init();
        self.guard("init", result)
    }

    fn try_init(&mut self) -> Result<()> {
        self.expect_state("init", ConnectionState::Uninitialized)?;

        self.substrate.startup()?;
        let (identity, map, assignment, scopes) = match self.discover() {
            Ok(parts) => parts,
            Err(e) => {
                // Started but never published; nothing else will shut it down.
                if let Err(down) = self.substrate.shutdown() {
                    tracing::error!("shutdown after failed init also failed: {down}");
                }
                return Err(e);
            }
        };

        self.topology = Topology::new(&identity, &assignment);
        self.identity = Some(identity);
        self.locale_map = Some(map);
        self.scopes = Some(scopes);
        self.state = ConnectionState::Initialized;

        tracing::info!(
            rank = self.topology.rank,
            size = self.topology.size,
            locale = self.topology.locale,
            locale_rank = self.topology.locale_rank,
            locale_size = self.topology.locale_size,
            locales = self.topology.locales,
            "connection initialized"
        );
        Ok(())
    }

    /// Everything `init` does between startup and publishing.
    fn discover(&self) -> Result<(ProcessIdentity, LocaleMap, LocaleAssignment, Partition<S>)> {
        let identity = ProcessIdentity::query(&self.substrate)?;
        let world = self.substrate.world()?;

        let map = resolve_locales(&self.substrate, &world, &identity)?;
        let assignment = map.assignment(identity.rank)?;
        let scopes = partition(
            &self.substrate,
            world,
            &identity,
            &assignment,
            self.config.verify_locale_scope,
        )?;
        Ok((identity, map, assignment, scopes))
    }

    /// Release the node-local scope and shut the substrate down.
    ///
    /// Collective. Valid only on an initialized connection; a second call
    /// fails.
    pub fn finalize(&mut self) -> Result<()> {
        let result = self.try_finalize();
        self.guard("finalize", result)
    }

    fn try_finalize(&mut self) -> Result<()> {
        self.expect_state("finalize", ConnectionState::Initialized)?;

        if let Some(Partition { world, locale }) = self.scopes.take() {
            self.substrate.release(locale)?;
            drop(world);
        }
        self.substrate.shutdown()?;
        self.state = ConnectionState::Finalized;

        tracing::info!(rank = self.topology.rank, "connection finalized");
        Ok(())
    }

    /// Block until every process of the job has reached this barrier.
    pub fn barrier(&self) -> Result<()> {
        let result = self
            .partition("barrier")
            .and_then(|p| self.substrate.barrier(&p.world));
        self.guard("barrier", result)
    }

    /// Block until every process on this locale has reached this barrier.
    ///
    /// Processes on other locales are not involved.
    pub fn locale_barrier(&self) -> Result<()> {
        let result = self
            .partition("locale_barrier")
            .and_then(|p| self.substrate.barrier(&p.locale));
        self.guard("locale_barrier", result)
    }

    /// Host name of this process. Needs no prior `init`.
    pub fn hostname(&self) -> Result<String> {
        if let Some(identity) = &self.identity {
            return Ok(identity.hostname.clone());
        }
        let result = self.substrate.host_name();
        self.guard("hostname", result)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Read-only view of the published topology.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Global rank of this process.
    pub fn rank(&self) -> Rank {
        self.topology.rank
    }

    /// Total number of processes in the job.
    pub fn size(&self) -> i32 {
        self.topology.size
    }

    /// Alias for [`size`](Self::size).
    pub fn ranks(&self) -> i32 {
        self.topology.ranks()
    }

    /// Total number of locales in the job.
    pub fn locales(&self) -> i32 {
        self.topology.locales
    }

    /// Locale id of this process.
    pub fn locale(&self) -> i32 {
        self.topology.locale
    }

    /// Node-local rank of this process.
    pub fn locale_rank(&self) -> Rank {
        self.topology.locale_rank
    }

    /// Number of processes on this locale.
    pub fn locale_size(&self) -> i32 {
        self.topology.locale_size
    }

    /// Alias for [`locale_size`](Self::locale_size).
    pub fn locale_ranks(&self) -> i32 {
        self.topology.locale_ranks()
    }

    pub fn is_locale_lead(&self) -> bool {
        self.topology.is_locale_lead()
    }

    pub fn is_single_locale(&self) -> bool {
        self.topology.is_single_locale()
    }

    /// The locale map every process agreed on, once initialized.
    pub fn locale_map(&self) -> Option<&LocaleMap> {
        self.locale_map.as_ref()
    }

    /// Job-wide scope, for running other collectives on it.
    pub fn world_scope(&self) -> Option<&S::Scope> {
        self.scopes.as_ref().map(|p| &p.world)
    }

    /// Node-local scope, for running other collectives on it.
    pub fn locale_scope(&self) -> Option<&S::Scope> {
        self.scopes.as_ref().map(|p| &p.locale)
    }

    pub fn substrate(&self) -> &S {
        &self.substrate
    }

    fn expect_state(&self, operation: &'static str, expected: ConnectionState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(LocusError::invalid_state(operation, expected, self.state))
        }
    }

    fn partition(&self, operation: &'static str) -> Result<&Partition<S>> {
        self.expect_state(operation, ConnectionState::Initialized)?;
        self.scopes.as_ref().ok_or_else(|| {
            LocusError::invalid_state(operation, ConnectionState::Initialized, self.state)
        })
    }

    fn guard<T>(&self, operation: &'static str, result: Result<T>) -> Result<T> {
        match (result, self.config.on_error) {
            (Err(e), FailurePolicy::Abort) => abort_on_error(operation, &e),
            (result, _) => result,
        }
    }
}

impl<S: Substrate> Drop for Connection<S> {
    fn drop(&mut self) {
        if self.state != ConnectionState::Initialized || self.substrate.is_shutdown() {
            return;
        }
        tracing::warn!(
            rank = self.topology.rank,
            "connection dropped without finalize(); finalizing now, which may deadlock"
        );
        if let Err(e) = self.try_finalize() {
            tracing::error!(rank = self.topology.rank, "best-effort finalize failed: {e}");
        }
    }
}
