//! Launch configuration for a [`TcpSubstrate`](crate::TcpSubstrate).
//!
//! Rank and job size come from the job launcher. Besides the `LOCUS_`
//! variables, the rank/size variables exported by common MPI launchers are
//! recognized so jobs can be started with `mpirun` unchanged.

use std::time::Duration;

use locus::Rank;

use crate::error::{Result, TcpError};

/// Who runs the rendezvous hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubMode {
    /// Rank 0 binds `hub_addr` and serves the hub inside its own process.
    Embedded,
    /// The hub is started separately; every rank only connects.
    External,
}

impl std::str::FromStr for HubMode {
    type Err = TcpError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "embedded" => Ok(HubMode::Embedded),
            "external" => Ok(HubMode::External),
            other => Err(TcpError::Config(format!(
                "unknown hub mode {other:?} (expected embedded or external)"
            ))),
        }
    }
}

const RANK_VARS: &[&str] = &[
    "LOCUS_RANK",
    // OpenMPI
    "OMPI_COMM_WORLD_RANK",
    // Intel MPI, MPICH
    "PMI_RANK",
    // MVAPICH
    "MV2_COMM_WORLD_RANK",
];

const SIZE_VARS: &[&str] = &[
    "LOCUS_WORLD_SIZE",
    "OMPI_COMM_WORLD_SIZE",
    "PMI_SIZE",
    "MV2_COMM_WORLD_SIZE",
];

#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Global rank of this process.
    pub rank: Rank,

    /// Number of processes in the job.
    pub world_size: i32,

    /// Address of the hub as `host:port`; the host may be a name.
    pub hub_addr: String,

    pub hub: HubMode,

    /// Host name to report instead of the machine's own.
    pub hostname: Option<String>,

    /// How long a rank keeps retrying to reach the hub.
    pub connect_timeout: Duration,

    /// How long the hub waits for the whole job to join.
    pub formation_timeout: Duration,
}

impl TcpConfig {
    pub fn new(rank: Rank, world_size: i32, hub_addr: impl Into<String>) -> Self {
        Self {
            rank,
            world_size,
            hub_addr: hub_addr.into(),
            hub: HubMode::Embedded,
            hostname: None,
            connect_timeout: Duration::from_secs(60),
            formation_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_hub_mode(mut self, hub: HubMode) -> Self {
        self.hub = hub;
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Load config from environment variables.
    ///
    /// Recognized variables:
    /// - `LOCUS_RANK` (or `OMPI_COMM_WORLD_RANK`, `PMI_RANK`, `MV2_COMM_WORLD_RANK`)
    /// - `LOCUS_WORLD_SIZE` (or `OMPI_COMM_WORLD_SIZE`, `PMI_SIZE`, `MV2_COMM_WORLD_SIZE`)
    /// - `LOCUS_HUB_ADDR` (required, `host:port`)
    /// - `LOCUS_HUB` (`embedded` or `external`)
    /// - `LOCUS_HOSTNAME`
    /// - `LOCUS_CONNECT_TIMEOUT_SECS`
    /// - `LOCUS_FORMATION_TIMEOUT_SECS`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reads through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let (rank_var, rank) = first_set(&lookup, RANK_VARS)
            .ok_or_else(|| TcpError::Config("no rank variable set".into()))?;
        let rank: Rank = parse_var(rank_var, &rank)?;

        let (size_var, size) = first_set(&lookup, SIZE_VARS)
            .ok_or_else(|| TcpError::Config("no world size variable set".into()))?;
        let world_size: i32 = parse_var(size_var, &size)?;

        let hub_addr = lookup("LOCUS_HUB_ADDR")
            .ok_or_else(|| TcpError::Config("LOCUS_HUB_ADDR not set".into()))?;

        let mut cfg = Self::new(rank, world_size, hub_addr.trim());

        if let Some(v) = lookup("LOCUS_HUB") {
            cfg.hub = v.parse()?;
        }
        if let Some(v) = lookup("LOCUS_HOSTNAME") {
            cfg.hostname = Some(v);
        }
        if let Some(v) = lookup("LOCUS_CONNECT_TIMEOUT_SECS") {
            cfg.connect_timeout =
                Duration::from_secs(parse_var("LOCUS_CONNECT_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = lookup("LOCUS_FORMATION_TIMEOUT_SECS") {
            cfg.formation_timeout =
                Duration::from_secs(parse_var("LOCUS_FORMATION_TIMEOUT_SECS", &v)?);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Check that the rank fits the job and the hub address has a port.
    pub fn validate(&self) -> Result<()> {
        check_hub_addr(&self.hub_addr)?;
        if self.world_size <= 0 {
            return Err(TcpError::Config(format!(
                "world size must be positive, got {}",
                self.world_size
            )));
        }
        if self.rank < 0 || self.rank >= self.world_size {
            return Err(TcpError::Config(format!(
                "rank {} outside job of size {}",
                self.rank, self.world_size
            )));
        }
        Ok(())
    }

    /// Whether this process serves the hub.
    pub fn hosts_hub(&self) -> bool {
        self.hub == HubMode::Embedded && self.rank == 0
    }
}

/// Names are resolved only when connecting, so this checks shape alone.
fn check_hub_addr(addr: &str) -> Result<()> {
    let bad = |why: &str| TcpError::Config(format!("hub address {addr:?}: {why}"));
    let (host, port) = addr.rsplit_once(':').ok_or_else(|| bad("expected host:port"))?;
    if host.trim_start_matches('[').trim_end_matches(']').is_empty() {
        return Err(bad("missing host"));
    }
    port.parse::<u16>().map_err(|e| bad(&e.to_string()))?;
    Ok(())
}

/// First variable of `vars` that is set, with its value.
fn first_set(
    lookup: &impl Fn(&str) -> Option<String>,
    vars: &[&'static str],
) -> Option<(&'static str, String)> {
    vars.iter().find_map(|&k| lookup(k).map(|v| (k, v)))
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| TcpError::Config(format!("{name}={value:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_from_lookup_locus_vars() {
        let cfg = TcpConfig::from_lookup(lookup_from(&[
            ("LOCUS_RANK", "3"),
            ("LOCUS_WORLD_SIZE", "8"),
            ("LOCUS_HUB_ADDR", "10.0.0.1:7000"),
            ("LOCUS_HUB", "external"),
            ("LOCUS_HOSTNAME", "node3"),
            ("LOCUS_CONNECT_TIMEOUT_SECS", "5"),
        ]))
        .unwrap();
        assert_eq!(cfg.rank, 3);
        assert_eq!(cfg.world_size, 8);
        assert_eq!(cfg.hub_addr, "10.0.0.1:7000");
        assert_eq!(cfg.hub, HubMode::External);
        assert_eq!(cfg.hostname.as_deref(), Some("node3"));
        assert_eq!(cfg.connect_timeout, Duration::from_secs(5));
        assert!(!cfg.hosts_hub());
    }

    #[test]
    fn test_launcher_fallback() {
        let cfg = TcpConfig::from_lookup(lookup_from(&[
            ("OMPI_COMM_WORLD_RANK", "0"),
            ("PMI_SIZE", "2"),
            ("LOCUS_HUB_ADDR", "127.0.0.1:9000"),
        ]))
        .unwrap();
        assert_eq!(cfg.rank, 0);
        assert_eq!(cfg.world_size, 2);
        assert_eq!(cfg.hub, HubMode::Embedded);
        assert!(cfg.hosts_hub());
    }

    #[test]
    fn test_missing_hub_addr() {
        let err = TcpConfig::from_lookup(lookup_from(&[
            ("LOCUS_RANK", "0"),
            ("LOCUS_WORLD_SIZE", "1"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("LOCUS_HUB_ADDR"));
    }

    #[test]
    fn test_hub_addr_accepts_host_names() {
        let cfg = TcpConfig::from_lookup(lookup_from(&[
            ("LOCUS_RANK", "1"),
            ("LOCUS_WORLD_SIZE", "2"),
            ("LOCUS_HUB_ADDR", "localhost:7400"),
        ]))
        .unwrap();
        assert_eq!(cfg.hub_addr, "localhost:7400");
        assert!(TcpConfig::new(0, 1, "node0.cluster:7400").validate().is_ok());
        assert!(TcpConfig::new(0, 1, "[::1]:7400").validate().is_ok());
    }

    #[test]
    fn test_hub_addr_needs_port() {
        for addr in ["node0", "node0:", ":7400", "node0:http", "node0:70000"] {
            let err = TcpConfig::new(0, 1, addr).validate().unwrap_err();
            assert!(err.to_string().contains("hub address"), "{addr}: {err}");
        }
    }

    #[test]
    fn test_rank_outside_job() {
        let err = TcpConfig::from_lookup(lookup_from(&[
            ("LOCUS_RANK", "4"),
            ("LOCUS_WORLD_SIZE", "4"),
            ("LOCUS_HUB_ADDR", "127.0.0.1:9000"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("rank 4"), "got: {err}");
    }

    #[test]
    fn test_bad_number_names_variable() {
        let err = TcpConfig::from_lookup(lookup_from(&[
            ("LOCUS_RANK", "zero"),
            ("LOCUS_WORLD_SIZE", "4"),
            ("LOCUS_HUB_ADDR", "127.0.0.1:9000"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("LOCUS_RANK"), "got: {err}");
    }
}
