//! Server configuration: TOML file plus CLI/env overrides.
//!
//! Resolution order is defaults → TOML file → env vars → CLI flags; the
//! later layers are applied in `main`. Only what the daemon itself needs
//! lives here — protocol tunables are handed down as a
//! [`grapevine_cluster::ClusterConfig`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use grapevine_cluster::ClusterConfig;
use serde::{Deserialize, Serialize};

/// Top-level daemon configuration, one-to-one with the TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct GrapevineConfig {
    /// Address both listeners bind to.
    pub bind: String,
    /// Client (admin) port. The cluster bus listens on
    /// `port + cluster-port-offset`.
    pub port: u16,
    pub cluster_port_offset: u16,
    /// Directory holding nodes.conf.
    pub data_dir: String,
    pub node_timeout_ms: u64,
    pub migration_barrier: usize,
    pub require_full_coverage: bool,
    /// Address overrides announced to peers instead of the bind address
    /// (NAT / container deployments).
    pub announce_ip: Option<String>,
    pub announce_port: Option<u16>,
    pub announce_bus_port: Option<u16>,
}

impl Default for GrapevineConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 7000,
            cluster_port_offset: 10_000,
            data_dir: ".".to_string(),
            node_timeout_ms: 15_000,
            migration_barrier: 1,
            require_full_coverage: true,
            announce_ip: None,
            announce_port: None,
            announce_bus_port: None,
        }
    }
}

impl GrapevineConfig {
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config file '{}': {e}", path.display()))?;
        toml::from_str(&text)
            .map_err(|e| format!("failed to parse config file '{}': {e}", path.display()))
    }

    pub fn to_toml(&self) -> Result<String, String> {
        toml::to_string_pretty(self).map_err(|e| format!("failed to serialize config: {e}"))
    }

    /// The cluster bus port. `None` when the offset pushes it past u16.
    pub fn bus_port(&self) -> Option<u16> {
        self.port.checked_add(self.cluster_port_offset)
    }

    pub fn nodes_conf_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("nodes.conf")
    }

    /// Protocol tunables handed to the engine.
    pub fn cluster_config(&self) -> ClusterConfig {
        ClusterConfig {
            node_timeout: Duration::from_millis(self.node_timeout_ms),
            migration_barrier: self.migration_barrier,
            require_full_coverage: self.require_full_coverage,
            announce_ip: self.announce_ip.clone(),
            announce_port: self.announce_port,
            announce_bus_port: self.announce_bus_port,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_expected_ports() {
        let cfg = GrapevineConfig::default();
        assert_eq!(cfg.port, 7000);
        assert_eq!(cfg.bus_port(), Some(17_000));
        assert_eq!(cfg.node_timeout_ms, 15_000);
        assert!(cfg.require_full_coverage);
    }

    #[test]
    fn bus_port_overflow_is_caught() {
        let cfg = GrapevineConfig {
            port: 60_000,
            cluster_port_offset: 10_000,
            ..Default::default()
        };
        assert_eq!(cfg.bus_port(), None);
    }

    #[test]
    fn toml_roundtrip() {
        let cfg = GrapevineConfig {
            bind: "0.0.0.0".to_string(),
            port: 7100,
            announce_ip: Some("203.0.113.9".to_string()),
            ..Default::default()
        };
        let text = cfg.to_toml().unwrap();
        let back: GrapevineConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.bind, "0.0.0.0");
        assert_eq!(back.port, 7100);
        assert_eq!(back.announce_ip.as_deref(), Some("203.0.113.9"));
    }

    #[test]
    fn kebab_case_keys_parse() {
        let cfg: GrapevineConfig = toml::from_str(
            "port = 7200\nnode-timeout-ms = 5000\nrequire-full-coverage = false\n",
        )
        .unwrap();
        assert_eq!(cfg.port, 7200);
        assert_eq!(cfg.node_timeout_ms, 5_000);
        assert!(!cfg.require_full_coverage);
        // unspecified fields keep their defaults
        assert_eq!(cfg.cluster_port_offset, 10_000);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<GrapevineConfig>("prot = 7000\n").is_err());
    }

    #[test]
    fn from_file_reports_missing_file() {
        let err = GrapevineConfig::from_file(Path::new("/nonexistent/grapevine.toml")).unwrap_err();
        assert!(err.contains("failed to read config file"));
    }
}
