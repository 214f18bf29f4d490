//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **CLI flags**: `--server-url`, `--token`, `--kubeconfig` (applied by
//!    `main` through [`Config::apply_overrides`])
//! 2. **Environment variables**: `KUBETETHER_SERVER_URL`, `KUBETETHER_TOKEN`,
//!    `KUBETETHER_KUBECONFIG`
//! 3. **Config file**: path via `--config <path>`, or `kubetether.toml` in CWD
//! 4. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! url = "ws://osp.example.com:8080"
//! path = "/osp/kube/connect"
//! token = "agent-token"
//!
//! [transport]
//! reconnect_interval_secs = 5
//! heartbeat_interval_secs = 30
//! outbound_queue_size = 1024
//! request_queue_size = 256
//!
//! [kubernetes]
//! kubectl = "kubectl"
//! kubeconfig = "/etc/kubetether/kubeconfig"
//! watch_restart_secs = 5
//!
//! [sessions]
//! log_tail_lines = 100
//!
//! [logging]
//! level = "info"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "kubetether.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config read failed: {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("config parse failed: {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub kubernetes: KubernetesConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where the agent dials and how it authenticates.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Scheme and authority of the control server (default `ws://127.0.0.1:8080`).
    #[serde(default = "default_server_url")]
    pub url: String,
    /// Connect path appended to `url` (default `/osp/kube/connect`).
    #[serde(default = "default_server_path")]
    pub path: String,
    /// Agent token, sent as the `token` header. Override with `KUBETETHER_TOKEN`.
    #[serde(default)]
    pub token: String,
}

/// Reconnect and outbound-buffer settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    /// Fixed delay between reconnect attempts (default 5). No backoff growth.
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,
    /// Seconds between WebSocket pings, 0 disables (default 30).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Envelopes held while the writer is behind or disconnected (default 1024).
    /// The oldest envelope is dropped when full.
    #[serde(default = "default_outbound_queue_size")]
    pub outbound_queue_size: usize,
    /// Capacity of the decoded-request channel (default 256).
    #[serde(default = "default_request_queue_size")]
    pub request_queue_size: usize,
}

/// Settings for the kubectl-backed cluster client.
#[derive(Debug, Clone, Deserialize)]
pub struct KubernetesConfig {
    /// kubectl binary (default `kubectl`, resolved via `PATH`).
    #[serde(default = "default_kubectl")]
    pub kubectl: String,
    /// Optional kubeconfig path. Override with `KUBETETHER_KUBECONFIG`.
    pub kubeconfig: Option<String>,
    /// Optional kubeconfig context.
    pub context: Option<String>,
    /// Delay before restarting a watch process that exited (default 5).
    #[serde(default = "default_watch_restart")]
    pub watch_restart_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionsConfig {
    /// Lines of history sent before following a log (default 100).
    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_server_url() -> String {
    "ws://127.0.0.1:8080".to_string()
}
fn default_server_path() -> String {
    "/osp/kube/connect".to_string()
}
fn default_reconnect_interval() -> u64 {
    5
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_outbound_queue_size() -> usize {
    1024
}
fn default_request_queue_size() -> usize {
    256
}
fn default_kubectl() -> String {
    "kubectl".to_string()
}
fn default_watch_restart() -> u64 {
    5
}
fn default_log_tail_lines() -> u32 {
    100
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: default_server_url(),
            path: default_server_path(),
            token: String::new(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            reconnect_interval_secs: default_reconnect_interval(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            outbound_queue_size: default_outbound_queue_size(),
            request_queue_size: default_request_queue_size(),
        }
    }
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            kubectl: default_kubectl(),
            kubeconfig: None,
            context: None,
            watch_restart_secs: default_watch_restart(),
        }
    }
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            log_tail_lines: default_log_tail_lines(),
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

impl ServerConfig {
    /// Full connect URL: `url` with `path` appended, avoiding a doubled `/`.
    pub fn connect_url(&self) -> String {
        let base = self.url.trim_end_matches('/');
        if self.path.is_empty() {
            base.to_string()
        } else if self.path.starts_with('/') {
            format!("{base}{}", self.path)
        } else {
            format!("{base}/{}", self.path)
        }
    }
}

impl TransportConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_secs > 0)
            .then(|| Duration::from_secs(self.heartbeat_interval_secs))
    }
}

/// Values given on the command line; `None` leaves the loaded value alone.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub server_url: Option<String>,
    pub token: Option<String>,
    pub kubeconfig: Option<String>,
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `kubetether.toml`
    /// in the current directory is used when present.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("KUBETETHER_SERVER_URL") {
            self.server.url = url;
        }
        if let Some(token) = lookup("KUBETETHER_TOKEN") {
            self.server.token = token;
        }
        if let Some(kubeconfig) = lookup("KUBETETHER_KUBECONFIG") {
            self.kubernetes.kubeconfig = Some(kubeconfig);
        }
    }

    /// Apply command-line overrides on top of file and env values.
    pub fn apply_overrides(&mut self, overrides: Overrides) {
        if let Some(url) = overrides.server_url {
            self.server.url = url;
        }
        if let Some(token) = overrides.token {
            self.server.token = token;
        }
        if let Some(kubeconfig) = overrides.kubeconfig {
            self.kubernetes.kubeconfig = Some(kubeconfig);
        }
    }
}
