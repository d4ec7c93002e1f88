//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Command line**: `--log-level`, `--kubeconfig`
//! 2. **Environment variables**: `ALI_STUB_REGISTER_ADDR`,
//!    `KUBERNETES_CLUSTER_ID`, `TUNNELS_PER_AGENT`, `KUBERNETES_SERVICE_HOST`,
//!    `KUBERNETES_SERVICE_PORT`, `INTERNAL_ENDPOINT`, `LOG_LEVEL`
//! 3. **Config file**: path via `--config <path>`, or `connector.toml` in CWD
//! 4. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [relay]
//! addr = "relay.example.com:8443"
//! tunnels_per_agent = 1
//! credentials_dir = "/ack-credentials"   # holds cert, key and ca
//! dial_max_elapsed_secs = 0              # 0 = redial forever
//! dial_timeout_secs = 30
//!
//! [cluster]
//! id = "c5f0a1"
//! api_server = "https://10.96.0.1:443"   # default: from the kube config
//! token_path = "/var/run/secrets/kubernetes.io/serviceaccount/token"
//! probe_label_selector = "alibabacloud.com/external=true"
//! intranet = "false"
//!
//! [timing]
//! heartbeat_interval_secs = 15
//! health_check_interval_secs = 75
//! heartbeat_write_timeout_secs = 15
//! meta_interval_secs = 3
//! meta_io_timeout_secs = 3
//! meta_refresh_every = 20
//! flap_window_secs = 5
//!
//! [logging]
//! level = "info"
//!
//! [healthz]
//! listen = "0.0.0.0:10254"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::identity::DEFAULT_TOKEN_PATH;
use crate::tunnel::agent::{AgentOptions, MAX_CONSECUTIVE_MALFORMED};
use crate::tunnel::backoff::BackoffPolicy;
use crate::tunnel::heartbeat::{HeartbeatConfig, DEFAULT_PROBE_LABEL_SELECTOR};
use crate::tunnel::meta::MetaSyncConfig;

pub const ENV_RELAY_ADDR: &str = "ALI_STUB_REGISTER_ADDR";
pub const ENV_CLUSTER_ID: &str = "KUBERNETES_CLUSTER_ID";
pub const ENV_TUNNELS_PER_AGENT: &str = "TUNNELS_PER_AGENT";
pub const ENV_SERVICE_HOST: &str = "KUBERNETES_SERVICE_HOST";
pub const ENV_SERVICE_PORT: &str = "KUBERNETES_SERVICE_PORT";
pub const ENV_INTERNAL_ENDPOINT: &str = "INTERNAL_ENDPOINT";
pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL";

const DEFAULT_CONFIG_FILE: &str = "connector.toml";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub healthz: HealthzConfig,
}

/// Where the relay lives and how to authenticate to it.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// `host:port` of the relay. Required.
    #[serde(default)]
    pub addr: String,
    /// Request channels per cycle (default 1).
    #[serde(default = "default_tunnels_per_agent")]
    pub tunnels_per_agent: usize,
    /// Directory holding the `cert`, `key` and `ca` PEM files.
    #[serde(default = "default_credentials_dir")]
    pub credentials_dir: PathBuf,
    /// Give up redialling a long-lived channel after this long; 0 never
    /// gives up.
    #[serde(default)]
    pub dial_max_elapsed_secs: u64,
    /// Budget for one TCP connect plus TLS handshake (default 30).
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,
}

/// The cluster being exposed.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Cluster id. Required, informational.
    #[serde(default)]
    pub id: String,
    /// API server URL; the kube config's cluster URL when unset.
    pub api_server: Option<String>,
    /// Service-account token the cluster identity is derived from.
    #[serde(default = "default_token_path")]
    pub token_path: PathBuf,
    /// Kubeconfig file; in-cluster credentials when unset.
    pub kubeconfig: Option<PathBuf>,
    #[serde(default = "default_probe_label_selector")]
    pub probe_label_selector: String,
    /// Raw intranet flag; must be `true` or `false` for metadata to be sent.
    pub intranet: Option<String>,
}

/// Cadences and deadlines. Defaults match what the relay expects.
#[derive(Debug, Clone, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_heartbeat_write_timeout")]
    pub heartbeat_write_timeout_secs: u64,
    #[serde(default = "default_meta_interval")]
    pub meta_interval_secs: u64,
    #[serde(default = "default_meta_io_timeout")]
    pub meta_io_timeout_secs: u64,
    #[serde(default = "default_meta_refresh_every")]
    pub meta_refresh_every: u32,
    #[serde(default = "default_flap_window")]
    pub flap_window_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// `tracing` filter directive (default `info`). `RUST_LOG` wins.
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthzConfig {
    #[serde(default = "default_healthz_listen")]
    pub listen: String,
}

fn default_tunnels_per_agent() -> usize {
    1
}
fn default_credentials_dir() -> PathBuf {
    PathBuf::from("/ack-credentials")
}
fn default_token_path() -> PathBuf {
    PathBuf::from(DEFAULT_TOKEN_PATH)
}
fn default_probe_label_selector() -> String {
    DEFAULT_PROBE_LABEL_SELECTOR.to_string()
}
fn default_heartbeat_interval() -> u64 {
    15
}
fn default_health_check_interval() -> u64 {
    75
}
fn default_heartbeat_write_timeout() -> u64 {
    15
}
fn default_meta_interval() -> u64 {
    3
}
fn default_meta_io_timeout() -> u64 {
    3
}
fn default_meta_refresh_every() -> u32 {
    20
}
fn default_dial_timeout() -> u64 {
    30
}
fn default_flap_window() -> u64 {
    5
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_healthz_listen() -> String {
    "0.0.0.0:10254".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            addr: String::new(),
            tunnels_per_agent: default_tunnels_per_agent(),
            credentials_dir: default_credentials_dir(),
            dial_max_elapsed_secs: 0,
            dial_timeout_secs: default_dial_timeout(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            api_server: None,
            token_path: default_token_path(),
            kubeconfig: None,
            probe_label_selector: default_probe_label_selector(),
            intranet: None,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval(),
            health_check_interval_secs: default_health_check_interval(),
            heartbeat_write_timeout_secs: default_heartbeat_write_timeout(),
            meta_interval_secs: default_meta_interval(),
            meta_io_timeout_secs: default_meta_io_timeout(),
            meta_refresh_every: default_meta_refresh_every(),
            flap_window_secs: default_flap_window(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for HealthzConfig {
    fn default() -> Self {
        Self {
            listen: default_healthz_listen(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file. Otherwise looks for
    /// `connector.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(Path::new(p))?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Config::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))
    }

    /// Overlay environment variables. Empty values count as unset.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(addr) = get(ENV_RELAY_ADDR) {
            self.relay.addr = addr;
        }
        if !self.relay.addr.is_empty() {
            self.relay.addr = normalize_address(&self.relay.addr)?;
        }
        if let Some(id) = get(ENV_CLUSTER_ID) {
            self.cluster.id = id;
        }
        if let Some(n) = get(ENV_TUNNELS_PER_AGENT) {
            self.relay.tunnels_per_agent = n.trim().parse().ok().filter(|n| *n > 0).unwrap_or(1);
        }
        if let (Some(host), Some(port)) = (get(ENV_SERVICE_HOST), get(ENV_SERVICE_PORT)) {
            let host = if host.contains(':') && !host.starts_with('[') {
                format!("[{host}]")
            } else {
                host
            };
            self.cluster.api_server = Some(format!("https://{host}:{port}"));
        }
        if let Some(intranet) = lookup(ENV_INTERNAL_ENDPOINT) {
            self.cluster.intranet = Some(intranet);
        }
        if let Some(level) = get(ENV_LOG_LEVEL).and_then(|v| v.trim().parse::<i32>().ok()) {
            self.logging.level = log_filter_for_level(level).to_string();
        }
        Ok(())
    }

    /// Reject configurations the connector cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.relay.addr.is_empty() {
            return Err(Error::Config(format!("{ENV_RELAY_ADDR} is empty")));
        }
        if self.cluster.id.is_empty() {
            return Err(Error::Config(format!("{ENV_CLUSTER_ID} is empty")));
        }
        if self.relay.tunnels_per_agent == 0 {
            return Err(Error::Config("tunnels_per_agent must be at least 1".into()));
        }
        let t = &self.timing;
        let durations = [
            ("relay.dial_timeout_secs", self.relay.dial_timeout_secs),
            ("timing.heartbeat_interval_secs", t.heartbeat_interval_secs),
            ("timing.health_check_interval_secs", t.health_check_interval_secs),
            ("timing.heartbeat_write_timeout_secs", t.heartbeat_write_timeout_secs),
            ("timing.meta_interval_secs", t.meta_interval_secs),
            ("timing.meta_io_timeout_secs", t.meta_io_timeout_secs),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, secs)| *secs == 0) {
            return Err(Error::Config(format!("{name} must be non-zero")));
        }
        Ok(())
    }

    pub fn cert_path(&self) -> PathBuf {
        self.relay.credentials_dir.join("cert")
    }

    pub fn key_path(&self) -> PathBuf {
        self.relay.credentials_dir.join("key")
    }

    pub fn ca_path(&self) -> PathBuf {
        self.relay.credentials_dir.join("ca")
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.relay.dial_timeout_secs)
    }

    pub fn flap_window(&self) -> Duration {
        Duration::from_secs(self.timing.flap_window_secs)
    }

    pub fn dial_backoff(&self) -> BackoffPolicy {
        let max_elapsed = (self.relay.dial_max_elapsed_secs > 0)
            .then(|| Duration::from_secs(self.relay.dial_max_elapsed_secs));
        BackoffPolicy {
            max_elapsed_time: max_elapsed,
            ..BackoffPolicy::channel_dial()
        }
    }

    pub fn agent_options(&self) -> AgentOptions {
        let t = &self.timing;
        AgentOptions {
            tunnels_per_agent: self.relay.tunnels_per_agent,
            max_malformed: MAX_CONSECUTIVE_MALFORMED,
            heartbeat: HeartbeatConfig {
                beat_interval: Duration::from_secs(t.heartbeat_interval_secs),
                check_interval: Duration::from_secs(t.health_check_interval_secs),
                write_timeout: Duration::from_secs(t.heartbeat_write_timeout_secs),
            },
            meta: MetaSyncConfig {
                interval: Duration::from_secs(t.meta_interval_secs),
                io_timeout: Duration::from_secs(t.meta_io_timeout_secs),
                refresh_every: t.meta_refresh_every,
            },
        }
    }
}

/// `8443` → `127.0.0.1:8443`, `:8443` → `127.0.0.1:8443`, otherwise the
/// address must already be `host:port`.
pub fn normalize_address(addr: &str) -> Result<String> {
    let addr = addr.trim();
    let addr = if addr.parse::<u16>().is_ok() {
        format!(":{addr}")
    } else {
        addr.to_string()
    };
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| Error::Config(format!("relay address {addr:?} is missing a port")))?;
    if port.parse::<u16>().is_err() {
        return Err(Error::Config(format!("relay address {addr:?} has a bad port")));
    }
    if host.contains(':') && !host.starts_with('[') {
        return Err(Error::Config(format!("relay address {addr:?} has too many colons")));
    }
    let host = if host.is_empty() { "127.0.0.1" } else { host };
    Ok(format!("{host}:{port}"))
}

/// Numeric level: -1 trace, 0 debug, 1 info, 2 warn, anything higher error.
pub fn log_filter_for_level(level: i32) -> &'static str {
    match level {
        i32::MIN..=-1 => "trace",
        0 => "debug",
        1 => "info",
        2 => "warn",
        _ => "error",
    }
}
