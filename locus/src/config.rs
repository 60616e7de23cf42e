//! Runtime configuration for a [`Connection`](crate::Connection).
//!
//! Defaults match the classic fail-fast behavior of a cluster job. Override
//! via environment variables (prefixed `LOCUS_`) or by constructing a custom
//! `LocusConfig`.

use crate::error::{LocusError, Result};

/// What a connection does when a substrate call or a lifecycle check fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Log the failing operation and exit the process with status 1.
    Abort,
    /// Return the error to the caller.
    Propagate,
}

impl std::str::FromStr for FailurePolicy {
    type Err = LocusError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(FailurePolicy::Abort),
            "propagate" | "return" => Ok(FailurePolicy::Propagate),
            other => Err(LocusError::Config(format!(
                "unknown failure policy {other:?} (expected abort or propagate)"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocusConfig {
    /// Failure handling for substrate errors and lifecycle violations.
    pub on_error: FailurePolicy,

    /// Check that the node-local scope ranks ranks exactly like the
    /// locale assignment did.
    pub verify_locale_scope: bool,
}

impl Default for LocusConfig {
    fn default() -> Self {
        Self {
            on_error: FailurePolicy::Abort,
            verify_locale_scope: true,
        }
    }
}

impl LocusConfig {
    /// Config that returns errors instead of exiting.
    pub fn propagating() -> Self {
        Self {
            on_error: FailurePolicy::Propagate,
            ..Self::default()
        }
    }

    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `LOCUS_ON_ERROR` (`abort` or `propagate`)
    /// - `LOCUS_VERIFY_LOCALE_SCOPE` (`0`/`1`, `false`/`true`)
    ///
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reads through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(v) = lookup("LOCUS_ON_ERROR") {
            match v.parse::<FailurePolicy>() {
                Ok(policy) => cfg.on_error = policy,
                Err(e) => tracing::warn!("ignoring LOCUS_ON_ERROR: {e}"),
            }
        }
        if let Some(v) = lookup("LOCUS_VERIFY_LOCALE_SCOPE") {
            match parse_flag(&v) {
                Some(flag) => cfg.verify_locale_scope = flag,
                None => tracing::warn!(value = %v, "ignoring LOCUS_VERIFY_LOCALE_SCOPE"),
            }
        }

        cfg
    }
}

/// Parse a boolean-ish environment value.
pub fn parse_flag(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
