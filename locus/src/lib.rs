//! Two-level process topology for jobs on clusters of multi-core nodes.
//!
//! Every process gets a job-wide rank and a node-local ("locale") rank,
//! plus a barrier scope for each level. Locales are discovered at
//! [`Connection::init`] by exchanging host names; every process groups the
//! same gathered names the same way, so no coordinator is needed.

pub mod config;
pub mod connection;
pub mod error;
pub mod identity;
pub mod local;
pub mod partition;
pub mod resolver;
pub mod scope;
pub mod substrate;
pub mod topology;
pub mod types;

pub use config::{FailurePolicy, LocusConfig};
pub use connection::Connection;
pub use error::{LocusError, Result};
pub use identity::{HostKey, ProcessIdentity, local_hostname};
pub use local::{LocalCluster, LocalSubstrate};
pub use resolver::{LocaleAssignment, LocaleGroup, LocaleMap};
pub use scope::GroupScope;
pub use substrate::Substrate;
pub use topology::Topology;
pub use types::{ConnectionState, HOSTNAME_BUF_SIZE, Rank, UNSET};
