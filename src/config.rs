//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `KUBESOCK_LISTEN`, `KUBESOCK_API_KEY`,
//!    `KUBESOCK_KUBECONFIG`, `KUBESOCK_BIND_TIMEOUT_SECS`
//! 2. **Config file**: path via `--config <path>`, or `kubesock.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:4654"
//! max_sessions = 512
//! max_concurrent_requests = 64
//! cors = true
//!
//! [auth]
//! api_key = "your-secret-key"   # omit to disable authentication
//!
//! [sessions]
//! bind_timeout_secs = 30
//! logs_bind_timeout_secs = 10
//! terminal_exit_grace_ms = 2000
//!
//! [kube]
//! kubectl = "kubectl"
//! kubeconfig = "~/.kube/config"
//! context = "staging"
//! request_timeout_secs = 30
//!
//! [helm]
//! helm = "helm"
//! timeout_secs = 300
//! pull_dir = "/var/cache/kubesock/charts"
//!
//! [terminal]
//! default_rows = 24
//! default_cols = 80
//! shells = ["bash", "sh", "powershell", "cmd"]
//!
//! [logging]
//! level = "info"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::util::expand_tilde;

/// Config file looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "kubesock.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid value for {var}: {value}")]
    Env { var: &'static str, value: String },
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub kube: KubeConfig,
    #[serde(default)]
    pub helm: HelmConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server and resource-limit settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:4654`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum live sessions, bound or pending (default 512).
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Maximum in-flight session creation calls (default 64).
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    /// Send permissive CORS headers (default true).
    #[serde(default = "default_true")]
    pub cors: bool,
}

/// Authentication settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared Bearer token. Override with `KUBESOCK_API_KEY`. Unset
    /// disables authentication.
    #[serde(default)]
    pub api_key: Option<String>,
}

/// Session lifecycle timing.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionsConfig {
    /// Seconds a resource or terminal session may stay unbound (default 30).
    #[serde(default = "default_bind_timeout_secs")]
    pub bind_timeout_secs: u64,
    /// Seconds a log session may stay unbound (default 10).
    #[serde(default = "default_logs_bind_timeout_secs")]
    pub logs_bind_timeout_secs: u64,
    /// Milliseconds a remote shell gets to exit after the client closes,
    /// before it is killed (default 2000).
    #[serde(default = "default_terminal_exit_grace_ms")]
    pub terminal_exit_grace_ms: u64,
}

/// `kubectl` invocation settings.
#[derive(Debug, Clone, Deserialize)]
pub struct KubeConfig {
    /// kubectl binary (default `kubectl`, resolved through `PATH`).
    #[serde(default = "default_kubectl")]
    pub kubectl: String,
    /// Kubeconfig file. Override with `KUBESOCK_KUBECONFIG`.
    #[serde(default)]
    pub kubeconfig: Option<String>,
    /// Context to use instead of the kubeconfig's current one.
    #[serde(default)]
    pub context: Option<String>,
    /// Timeout for a single cluster call in seconds (default 30).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// `helm` invocation settings.
#[derive(Debug, Clone, Deserialize)]
pub struct HelmConfig {
    /// helm binary (default `helm`).
    #[serde(default = "default_helm")]
    pub helm: String,
    /// Timeout for install/upgrade/uninstall/pull in seconds (default 300).
    #[serde(default = "default_helm_timeout_secs")]
    pub timeout_secs: u64,
    /// Where pulled chart archives are stored (default: system temp dir).
    #[serde(default)]
    pub pull_dir: Option<String>,
}

/// Interactive terminal settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TerminalConfig {
    /// Rows of a new terminal before the client's first resize (default 24).
    #[serde(default = "default_rows")]
    pub default_rows: u16,
    /// Columns of a new terminal before the client's first resize (default 80).
    #[serde(default = "default_cols")]
    pub default_cols: u16,
    /// Shells a terminal session may run.
    #[serde(default = "default_shells")]
    pub shells: Vec<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:4654".to_string()
}
fn default_max_sessions() -> usize {
    512
}
fn default_max_concurrent_requests() -> usize {
    64
}
fn default_true() -> bool {
    true
}
fn default_bind_timeout_secs() -> u64 {
    30
}
fn default_logs_bind_timeout_secs() -> u64 {
    10
}
fn default_terminal_exit_grace_ms() -> u64 {
    2000
}
fn default_kubectl() -> String {
    "kubectl".to_string()
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_helm() -> String {
    "helm".to_string()
}
fn default_helm_timeout_secs() -> u64 {
    300
}
fn default_rows() -> u16 {
    24
}
fn default_cols() -> u16 {
    80
}
fn default_shells() -> Vec<String> {
    ["bash", "sh", "powershell", "cmd"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_sessions: default_max_sessions(),
            max_concurrent_requests: default_max_concurrent_requests(),
            cors: default_true(),
        }
    }
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            bind_timeout_secs: default_bind_timeout_secs(),
            logs_bind_timeout_secs: default_logs_bind_timeout_secs(),
            terminal_exit_grace_ms: default_terminal_exit_grace_ms(),
        }
    }
}

impl Default for KubeConfig {
    fn default() -> Self {
        Self {
            kubectl: default_kubectl(),
            kubeconfig: None,
            context: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for HelmConfig {
    fn default() -> Self {
        Self {
            helm: default_helm(),
            timeout_secs: default_helm_timeout_secs(),
            pull_dir: None,
        }
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            default_rows: default_rows(),
            default_cols: default_cols(),
            shells: default_shells(),
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

impl SessionsConfig {
    pub fn bind_timeout(&self) -> Duration {
        Duration::from_secs(self.bind_timeout_secs)
    }

    pub fn logs_bind_timeout(&self) -> Duration {
        Duration::from_secs(self.logs_bind_timeout_secs)
    }

    pub fn terminal_exit_grace(&self) -> Duration {
        Duration::from_millis(self.terminal_exit_grace_ms)
    }
}

impl KubeConfig {
    /// Kubeconfig path with a leading `~` expanded.
    pub fn kubeconfig_path(&self) -> Option<String> {
        self.kubeconfig
            .as_deref()
            .map(|p| expand_tilde(p).into_owned())
    }
}

impl HelmConfig {
    pub fn pull_dir(&self) -> PathBuf {
        self.pull_dir
            .as_deref()
            .map_or_else(std::env::temp_dir, |p| PathBuf::from(expand_tilde(p).into_owned()))
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file. Otherwise looks for
    /// `kubesock.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::from_file(DEFAULT_CONFIG_FILE)?,
            None => Self::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply environment overrides, reading variables through `lookup`.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(listen) = lookup("KUBESOCK_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(key) = lookup("KUBESOCK_API_KEY") {
            self.auth.api_key = (!key.is_empty()).then_some(key);
        }
        if let Some(path) = lookup("KUBESOCK_KUBECONFIG") {
            self.kube.kubeconfig = Some(path);
        }
        if let Some(value) = lookup("KUBESOCK_BIND_TIMEOUT_SECS") {
            self.sessions.bind_timeout_secs = value.parse().map_err(|_| ConfigError::Env {
                var: "KUBESOCK_BIND_TIMEOUT_SECS",
                value,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_apply_to_an_empty_file() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:4654");
        assert_eq!(config.sessions.bind_timeout(), Duration::from_secs(30));
        assert_eq!(config.sessions.logs_bind_timeout(), Duration::from_secs(10));
        assert_eq!(config.terminal.shells, vec!["bash", "sh", "powershell", "cmd"]);
        assert!(config.auth.api_key.is_none());
        assert!(config.server.cors);
    }

    #[test]
    fn file_values_override_defaults_per_field() {
        let config = Config::parse(
            r#"
            [sessions]
            bind_timeout_secs = 5

            [kube]
            context = "staging"
            "#,
        )
        .unwrap();
        assert_eq!(config.sessions.bind_timeout_secs, 5);
        assert_eq!(config.sessions.logs_bind_timeout_secs, 10);
        assert_eq!(config.kube.context.as_deref(), Some("staging"));
        assert_eq!(config.kube.kubectl, "kubectl");
    }

    #[test]
    fn environment_wins_over_file() {
        let mut config = Config::parse("[server]\nlisten = \"127.0.0.1:1\"\n").unwrap();
        let env: HashMap<&str, &str> = [
            ("KUBESOCK_LISTEN", "127.0.0.1:9000"),
            ("KUBESOCK_API_KEY", "s3cret"),
            ("KUBESOCK_BIND_TIMEOUT_SECS", "12"),
        ]
        .into();
        config
            .apply_env(|var| env.get(var).map(ToString::to_string))
            .unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:9000");
        assert_eq!(config.auth.api_key.as_deref(), Some("s3cret"));
        assert_eq!(config.sessions.bind_timeout_secs, 12);
    }

    #[test]
    fn bad_environment_value_is_an_error() {
        let mut config = Config::default();
        let err = config
            .apply_env(|var| (var == "KUBESOCK_BIND_TIMEOUT_SECS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("KUBESOCK_BIND_TIMEOUT_SECS"));
    }

    #[test]
    fn unparseable_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kubesock.toml");
        std::fs::write(&path, "[server\nlisten = 1").unwrap();
        let err = Config::load(path.to_str()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn missing_file_is_reported() {
        let err = Config::load(Some("/nonexistent/kubesock.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
