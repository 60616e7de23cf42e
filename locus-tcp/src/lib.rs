//! Multi-process substrate for `locus`: one OS process per rank, with
//! collectives relayed through a small TCP hub.
//!
//! ```no_run
//! use locus::{Connection, LocusConfig};
//! use locus_tcp::TcpSubstrate;
//!
//! let substrate = TcpSubstrate::from_env()?;
//! let conn = Connection::connect(substrate, LocusConfig::from_env())?;
//! println!("rank {} is locale rank {} on locale {}", conn.rank(), conn.locale_rank(), conn.locale());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod error;
pub mod hub;
pub mod protocol;
pub mod substrate;

pub use config::{HubMode, TcpConfig};
pub use error::{Result, TcpError};
pub use hub::Hub;
pub use protocol::HubMessage;
pub use substrate::TcpSubstrate;
