use crate::types::{ConnectionState, Rank};

pub type Result<T> = std::result::Result<T, LocusError>;

#[derive(Debug, thiserror::Error)]
pub enum LocusError {
    #[error("substrate call {operation} failed: {message}")]
    Substrate {
        operation: &'static str,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("{operation} called while {actual} (requires {expected})")]
    InvalidState {
        operation: &'static str,
        expected: ConnectionState,
        actual: ConnectionState,
    },

    #[error("topology error: {reason}")]
    Topology { reason: String },

    #[error(
        "node-local scope disagrees with locale assignment: scope rank {scope_rank}/{scope_size}, locale rank {locale_rank}/{locale_size}"
    )]
    ScopeMismatch {
        locale_rank: Rank,
        locale_size: i32,
        scope_rank: Rank,
        scope_size: i32,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl LocusError {
    /// Create a `Substrate` error with just a message.
    pub fn substrate(operation: &'static str, msg: impl Into<String>) -> Self {
        Self::Substrate {
            operation,
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Substrate` error with a message and a source error.
    pub fn substrate_with_source(
        operation: &'static str,
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Substrate {
            operation,
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an `InvalidState` error.
    pub fn invalid_state(
        operation: &'static str,
        expected: ConnectionState,
        actual: ConnectionState,
    ) -> Self {
        Self::InvalidState {
            operation,
            expected,
            actual,
        }
    }
}

/// Report a failed call and terminate the process with status 1.
///
/// A collective that failed on one rank leaves its peers blocked, so there is
/// nothing to recover locally.
pub fn abort_on_error(call: &str, err: &LocusError) -> ! {
    tracing::error!(call, error = %err, "fatal: aborting process");
    eprintln!("locus call failed: {call}: {err}");
    std::process::exit(1)
}

/// Evaluate a `locus::Result` expression and exit the process on error.
///
/// The diagnostic names the failing call as written at the call site.
///
/// ```no_run
/// use locus::{Connection, LocalCluster, check};
///
/// let mut substrates = LocalCluster::new(["node0"]).into_substrates();
/// let mut conn = Connection::new(substrates.remove(0));
/// check!(conn.init());
/// check!(conn.barrier());
/// check!(conn.finalize());
/// ```
#[macro_export]
macro_rules! check {
    ($call:expr) => {
        match $call {
            Ok(value) => value,
            Err(err) => $crate::error::abort_on_error(stringify!($call), &err),
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substrate_display() {
        let e = LocusError::substrate("all_gather", "peer hung up");
        assert_eq!(
            e.to_string(),
            "substrate call all_gather failed: peer hung up"
        );
    }

    #[test]
    fn test_invalid_state_display() {
        let e = LocusError::invalid_state(
            "finalize",
            ConnectionState::Initialized,
            ConnectionState::Uninitialized,
        );
        assert_eq!(
            e.to_string(),
            "finalize called while uninitialized (requires initialized)"
        );
    }

    #[test]
    fn test_source_is_preserved() {
        use std::error::Error;

        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let e = LocusError::substrate_with_source("barrier", "hub connection lost", io);
        assert!(e.source().is_some());
        assert!(e.to_string().contains("hub connection lost"));
    }

    #[test]
    fn test_check_passes_values_through() {
        fn ok() -> Result<u32> {
            Ok(7)
        }
        assert_eq!(crate::check!(ok()), 7);
    }

    #[test]
    fn test_all_variants_display() {
        let errors: Vec<LocusError> = vec![
            LocusError::substrate("startup", "x"),
            LocusError::invalid_state(
                "init",
                ConnectionState::Uninitialized,
                ConnectionState::Initialized,
            ),
            LocusError::Topology {
                reason: "own rank missing".into(),
            },
            LocusError::ScopeMismatch {
                locale_rank: 1,
                locale_size: 2,
                scope_rank: 0,
                scope_size: 2,
            },
            LocusError::Config("bad value".into()),
            LocusError::LockPoisoned("rendezvous"),
        ];
        for e in &errors {
            assert!(!e.to_string().is_empty(), "empty display for {e:?}");
        }
    }
}
