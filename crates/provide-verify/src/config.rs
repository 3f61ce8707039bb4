//! Harness configuration.
//!
//! Every field has a default so a YAML file only needs to name what it
//! overrides:
//!
//! ```yaml
//! poll_interval: 5s
//! stall_threshold: 3m
//! prefix_bits: 10
//! kubo:
//!   repo: ./.ipfs
//!   provide_interval: 8m
//! ```

use crate::error::{Result, VerifyError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Substring that marks a provider-record event in the node's debug log.
pub const PROVIDE_MARKER: &str = "sent provider record";

/// Substring the node prints on its readiness channel once it is serving.
pub const READY_MARKER: &str = "Daemon is ready";

/// The empty UnixFS directory created by `ipfs init`.
pub const EMPTY_DIR_CID: &str = "QmUNLLsPACCz1vLxQVkXqqLX5R1X345qqfHbsf67hvA3Nn";

/// Top-level configuration of a verification run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// How often the supervisor samples progress.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Time without new root advertisements before a stall is diagnosed.
    #[serde(with = "humantime_serde")]
    pub stall_threshold: Duration,
    /// How long the record monitor sleeps when no new log lines arrived.
    #[serde(with = "humantime_serde")]
    pub scan_interval: Duration,
    /// Upper bound on waiting for the readiness marker.
    #[serde(with = "humantime_serde")]
    pub ready_timeout: Duration,
    /// Delay before collecting diagnostics after a failed startup.
    #[serde(with = "humantime_serde")]
    pub startup_settle: Duration,
    /// Grace period between SIGTERM and SIGKILL when stopping the node.
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
    /// Keep the node running after completion and report how often each
    /// tracked item gets re-advertised, until Ctrl-C or node exit.
    pub keep_monitoring: bool,
    /// Cadence of the advertisement-count report while keep-monitoring.
    #[serde(with = "humantime_serde")]
    pub distribution_interval: Duration,
    /// Number of leading Kademlia bits used to group missing items.
    pub prefix_bits: u8,
    /// Readiness marker on the node's stdout.
    pub ready_marker: String,
    /// Provider-record marker on the node's stderr.
    pub provide_marker: String,
    /// Environment variable that sets the node's log levels.
    pub log_level_env: String,
    /// Subsystems switched to debug level through `log_level_env`.
    pub log_subsystems: Vec<String>,
    /// Longest line kept from either channel; longer lines are truncated.
    pub max_line_length: usize,
    /// Retention cap for each line buffer. `None` keeps every line.
    pub max_buffered_lines: Option<usize>,
    /// Kubo repository settings used by the `run` command.
    pub kubo: KuboConfig,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            stall_threshold: Duration::from_secs(120),
            scan_interval: Duration::from_millis(500),
            ready_timeout: Duration::from_secs(300),
            startup_settle: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(15),
            keep_monitoring: false,
            distribution_interval: Duration::from_secs(60),
            prefix_bits: 8,
            ready_marker: READY_MARKER.to_string(),
            provide_marker: PROVIDE_MARKER.to_string(),
            log_level_env: "GOLOG_LOG_LEVEL".to_string(),
            log_subsystems: vec!["dht".to_string(), "dht/provider".to_string()],
            max_line_length: 1 << 20,
            max_buffered_lines: None,
            kubo: KuboConfig::default(),
        }
    }
}

impl VerifierConfig {
    /// Load a YAML configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, does not parse, or fails
    /// [`validate`](Self::validate).
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&text)
            .map_err(|e| VerifyError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if !(1..=32).contains(&self.prefix_bits) {
            return Err(VerifyError::Config(format!(
                "prefix_bits must be within 1..=32, got {}",
                self.prefix_bits
            )));
        }
        if self.poll_interval.is_zero()
            || self.scan_interval.is_zero()
            || self.distribution_interval.is_zero()
        {
            return Err(VerifyError::Config(
                "poll_interval, scan_interval and distribution_interval must be non-zero"
                    .to_string(),
            ));
        }
        if self.ready_marker.is_empty() || self.provide_marker.is_empty() {
            return Err(VerifyError::Config("markers must not be empty".to_string()));
        }
        if self.max_line_length == 0 {
            return Err(VerifyError::Config("max_line_length must be non-zero".to_string()));
        }
        if self.max_buffered_lines == Some(0) {
            return Err(VerifyError::Config(
                "max_buffered_lines must be non-zero when set".to_string(),
            ));
        }
        Ok(())
    }

    /// Value for `log_level_env`, e.g. `dht=debug,dht/provider=debug`.
    pub fn log_level_directive(&self) -> String {
        self.log_subsystems
            .iter()
            .map(|s| format!("{s}=debug"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Settings for preparing a throwaway Kubo repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KuboConfig {
    /// The `ipfs` executable.
    pub binary: PathBuf,
    /// `IPFS_PATH` of the repository. Wiped before each run.
    pub repo: PathBuf,
    /// `Provide.DHT.Interval`.
    pub provide_interval: String,
    /// `Provide.Strategy`.
    pub provide_strategy: String,
    /// `Addresses.API`.
    pub api_addr: String,
    /// `Addresses.Gateway`.
    pub gateway_addr: String,
    /// `Addresses.Swarm`.
    pub swarm_addrs: Vec<String>,
    /// Turn the telemetry plugin off.
    pub disable_telemetry: bool,
    /// Fixed node identity written into the repository config.
    ///
    /// Unset by default: `ipfs init` generates a fresh key per run. Pin one
    /// (see `config/pinned-identity.yaml`) to keep the node at the same
    /// keyspace position across runs.
    pub identity: Option<KuboIdentity>,
}

impl Default for KuboConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ipfs"),
            repo: PathBuf::from(".ipfs"),
            provide_interval: "10m".to_string(),
            provide_strategy: "pinned".to_string(),
            // Alternate ports so a regular daemon on the host keeps running
            api_addr: "/ip4/127.0.0.1/tcp/5401".to_string(),
            gateway_addr: "/ip4/127.0.0.1/tcp/8480".to_string(),
            swarm_addrs: vec![
                "/ip4/0.0.0.0/tcp/4401".to_string(),
                "/ip6/::/tcp/4401".to_string(),
                "/ip4/0.0.0.0/udp/4401/quic-v1".to_string(),
                "/ip6/::/udp/4401/quic-v1".to_string(),
            ],
            disable_telemetry: true,
            identity: None,
        }
    }
}

/// Peer identity for the node, as stored under `Identity` in the Kubo config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KuboIdentity {
    /// Base58 peer id.
    #[serde(rename = "PeerID")]
    pub peer_id: String,
    /// Base64 protobuf-encoded private key.
    #[serde(rename = "PrivKey")]
    pub priv_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = VerifierConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert_eq!(config.stall_threshold, Duration::from_secs(120));
        assert_eq!(config.prefix_bits, 8);
    }

    #[test]
    fn test_log_level_directive() {
        let config = VerifierConfig::default();
        assert_eq!(config.log_level_directive(), "dht=debug,dht/provider=debug");
    }

    #[test]
    fn test_partial_yaml_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "poll_interval: 5s\nstall_threshold: 3m\nprefix_bits: 10\nkubo:\n  provide_interval: 8m\n"
        )
        .unwrap();

        let config = VerifierConfig::from_file(file.path()).unwrap();
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.stall_threshold, Duration::from_secs(180));
        assert_eq!(config.prefix_bits, 10);
        assert_eq!(config.kubo.provide_interval, "8m");
        assert_eq!(config.kubo.provide_strategy, "pinned");
        assert_eq!(config.ready_marker, READY_MARKER);
    }

    #[test]
    fn test_invalid_prefix_bits_rejected() {
        let config = VerifierConfig {
            prefix_bits: 33,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(VerifyError::Config(_))));
    }

    #[test]
    fn test_keep_monitoring_settings() {
        let config: VerifierConfig =
            serde_yaml::from_str("keep_monitoring: true\ndistribution_interval: 30s\n").unwrap();
        assert!(config.keep_monitoring);
        assert_eq!(config.distribution_interval, Duration::from_secs(30));
        assert_eq!(VerifierConfig::default().distribution_interval, Duration::from_secs(60));

        let config = VerifierConfig {
            distribution_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pinned_identity_config_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/pinned-identity.yaml");
        let config = VerifierConfig::from_file(&path).unwrap();
        let identity = config.kubo.identity.unwrap();
        assert_eq!(identity.peer_id, "12D3KooWPGUHammYxStT9qMmKidZBUChutLLLXjmumoXhQRofhNp");
        assert!(identity.priv_key.starts_with("CAESQ"));
        assert_eq!(config.kubo.provide_interval, "10m");
    }

    #[test]
    fn test_identity_uses_kubo_field_names() {
        let identity = KuboIdentity {
            peer_id: "12D3Koo".to_string(),
            priv_key: "CAES".to_string(),
        };
        let json = serde_json::to_value(&identity).unwrap();
        assert_eq!(json["PeerID"], "12D3Koo");
        assert_eq!(json["PrivKey"], "CAES");
    }
}
