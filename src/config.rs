//! Configuration options consumed by the connection subsystem.
//!
//! Mirrors the small option set `spec.md` §6 enumerates, plus the tuning
//! knobs the Open Questions in §9 ask to be made configurable instead of
//! hardcoded.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Fair-share read quantum, in octets, used when link padding is disabled.
///
/// The reference source hardcodes `at_most = 103`, overriding its own
/// fair-share computation (Open Question (b) in `spec.md` §9). We keep 103
/// as the default so behavior matches the source exactly, but make it a
/// knob rather than a literal buried in `read_to_buf`.
pub const DEFAULT_FAIR_SHARE: usize = 103;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Am I a relay (can accept OR links) or a pure client?
    pub onion_router: bool,

    /// Defer outbuf flushing to the cell scheduler instead of flushing
    /// immediately on every `write_to_buf`.
    pub link_padding: bool,

    /// Token-bucket cap (bandwidth) assigned to OR peers with no identity
    /// cert, i.e. ordinary onion-proxy clients.
    pub default_bandwidth_op: u32,

    pub or_port: Option<u16>,
    pub ap_port: Option<u16>,
    pub dir_port: Option<u16>,

    /// Process-wide read allowance refilled once per second.
    pub global_bucket_cap: u64,

    /// Octets a single `read_to_buf` call may take when link padding is
    /// off, before the per-link receiver bucket clamp. See
    /// `DEFAULT_FAIR_SHARE` for why the reference value is what it is.
    pub fair_share: usize,

    /// Upper bound on `Connection::outbuf` size before `write_to_buf`
    /// refuses more data. Not in the distilled spec's component list, but
    /// present in the original source as a per-connection backpressure cap.
    pub max_outbuf_bytes: usize,

    /// Fixed capacity of the connection table. `None` means unbounded.
    pub table_capacity: Option<usize>,

    /// Connections idle longer than this (no read or write) are marked for
    /// close on the next tick. `None` disables the sweep, matching the
    /// spec's "no reconnection retries" Non-goal by default.
    pub idle_timeout: Option<Duration>,
}

impl Config {
    /// Parse a config from TOML text, the way Cyclone's `ConfigManager`
    /// reads its own config file.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::config(format!("failed to parse config: {e}")))
    }

    /// Read and parse a TOML config file from disk.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::config(format!("failed to read config file {}: {e}", path.as_ref().display())))?;
        Self::from_toml_str(&text)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            onion_router: false,
            link_padding: false,
            default_bandwidth_op: 0,
            or_port: None,
            ap_port: None,
            dir_port: None,
            global_bucket_cap: 8192,
            fair_share: DEFAULT_FAIR_SHARE,
            max_outbuf_bytes: 16 * 1024 * 1024,
            table_capacity: None,
            idle_timeout: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_toml_str_parses_a_partial_override() {
        let config = Config::from_toml_str(
            r#"
            onion_router = true
            link_padding = false
            default_bandwidth_op = 20000
            or_port = 9001
            ap_port = 9050
            dir_port = 9030
            global_bucket_cap = 8192
            fair_share = 103
            max_outbuf_bytes = 16777216
            table_capacity = 4096
            "#,
        )
        .unwrap();

        assert!(config.onion_router);
        assert_eq!(config.or_port, Some(9001));
        assert_eq!(config.fair_share, DEFAULT_FAIR_SHARE);
        assert!(config.idle_timeout.is_none());
    }

    #[test]
    fn from_toml_str_reports_a_config_error_on_malformed_input() {
        let err = Config::from_toml_str("this is not valid toml = = =").unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn load_from_file_reports_a_config_error_when_missing() {
        let err = Config::load_from_file("/nonexistent/relay-conn-config.toml").unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }
}
