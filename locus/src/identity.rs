use crate::error::Result;
use crate::substrate::Substrate;
use crate::types::{HOSTNAME_BUF_SIZE, Rank};

/// A host name as exchanged during locale discovery: a fixed-width,
/// zero-padded byte buffer.
///
/// Two processes share a locale iff their keys are byte-for-byte equal.
/// Names longer than [`HOSTNAME_BUF_SIZE`] are truncated, so hosts that
/// differ only past that point collide.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostKey([u8; HOSTNAME_BUF_SIZE]);

impl HostKey {
    /// Pad (or truncate) `name` into a key.
    pub fn new(name: &str) -> Self {
        let mut buf = [0u8; HOSTNAME_BUF_SIZE];
        let bytes = name.as_bytes();
        let copy_len = bytes.len().min(HOSTNAME_BUF_SIZE);
        buf[..copy_len].copy_from_slice(&bytes[..copy_len]);
        Self(buf)
    }

    /// Rebuild a key from one gathered block.
    ///
    /// Returns `None` if `bytes` is not exactly `HOSTNAME_BUF_SIZE` long.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let buf: [u8; HOSTNAME_BUF_SIZE] = bytes.try_into().ok()?;
        Some(Self(buf))
    }

    pub fn as_bytes(&self) -> &[u8; HOSTNAME_BUF_SIZE] {
        &self.0
    }

    /// The name up to the first NUL, lossily decoded.
    pub fn to_name(&self) -> String {
        let end = self
            .0
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(HOSTNAME_BUF_SIZE);
        String::from_utf8_lossy(&self.0[..end]).into_owned()
    }
}

impl std::fmt::Debug for HostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("HostKey").field(&self.to_name()).finish()
    }
}

/// Facts about this process that the substrate knows without any exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessIdentity {
    /// Global rank in the job.
    pub rank: Rank,
    /// Number of processes in the job.
    pub size: i32,
    /// Host name as reported by the substrate.
    pub hostname: String,
}

impl ProcessIdentity {
    /// Query rank, size and host name from a started substrate.
    pub fn query<S: Substrate + ?Sized>(substrate: &S) -> Result<Self> {
        let identity = Self {
            rank: substrate.self_rank()?,
            size: substrate.group_size()?,
            hostname: substrate.host_name()?,
        };
        if identity.is_truncated() {
            tracing::warn!(
                rank = identity.rank,
                len = identity.hostname.len(),
                "host name exceeds {HOSTNAME_BUF_SIZE} bytes; locale matching uses the truncated prefix"
            );
        }
        Ok(identity)
    }

    pub fn host_key(&self) -> HostKey {
        HostKey::new(&self.hostname)
    }

    /// Whether the host name does not fit the exchange buffer.
    pub fn is_truncated(&self) -> bool {
        self.hostname.len() > HOSTNAME_BUF_SIZE
    }
}

/// Host name of the machine this process runs on.
pub fn local_hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}
