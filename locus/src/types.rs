/// Rank of a process within a scope (0-indexed).
///
/// Signed so that the `-1` sentinel of an unpublished topology is
/// representable in the same type as a real rank.
pub type Rank = i32;

/// Sentinel carried by every topology field before `init()` publishes it.
pub const UNSET: i32 = -1;

/// Width of the host-name buffer exchanged during locale discovery.
///
/// Longer names are truncated; names are compared over the full,
/// zero-padded buffer.
pub const HOSTNAME_BUF_SIZE: usize = 256;

/// Lifecycle state of a [`Connection`](crate::Connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Uninitialized,
    Initialized,
    Finalized,
}

impl ConnectionState {
    /// Human-readable name.
    pub const fn name(self) -> &'static str {
        match self {
            ConnectionState::Uninitialized => "uninitialized",
            ConnectionState::Initialized => "initialized",
            ConnectionState::Finalized => "finalized",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
