//! External collaborators behind the stream bridges.
//!
//! Each concern is a trait so the bridges can be driven by fakes in tests.
//! The production implementations shell out to the cluster tooling:
//!
//! - [`kubectl::Kubectl`]: [`ClusterBackend`] and [`LogBackend`]
//! - [`helm::HelmCli`]: [`PackageBackend`], with chart tags from [`tags`]
//! - [`exec::PtyExec`]: [`ExecBackend`], `kubectl exec` inside a local PTY

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::bridges::{BridgeError, ByteSink, ByteSource, SizeSource};
use crate::config::Config;
use crate::protocol::{HelmOptions, KubeGvrk, ResourceOptions};
use crate::sessions::resize::TerminalSize;

pub mod cli;
pub mod exec;
pub mod helm;
pub mod kubectl;
pub mod pty;
pub mod tags;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },
    /// The tool ran and reported failure; `message` is its stderr.
    #[error("{message}")]
    Failed { command: String, message: String },
    #[error("{0} timed out")]
    Timeout(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("failed to decode {what}: {reason}")]
    Decode { what: String, reason: String },
    #[error("HTTP request failed: {0}")]
    Http(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The client side of an interactive stream failed.
    #[error(transparent)]
    Stream(#[from] BridgeError),
}

impl BackendError {
    /// True when the cluster does not serve the requested resource type.
    pub fn is_missing_resource(&self) -> bool {
        match self {
            BackendError::Failed { message, .. } => {
                message.contains("could not find the requested resource")
                    || message.contains("the server doesn't have a resource type")
                    || message.contains("(NotFound)")
            }
            _ => false,
        }
    }
}

/// Object CRUD against the cluster API.
///
/// `namespace` is `None` for cluster-scoped kinds, `Some("")` for "all
/// namespaces" on list calls.
#[async_trait]
pub trait ClusterBackend: Send + Sync {
    async fn list(
        &self,
        gvrk: &KubeGvrk,
        namespace: Option<&str>,
        options: &ResourceOptions,
    ) -> Result<Value, BackendError>;

    async fn get(
        &self,
        gvrk: &KubeGvrk,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Value, BackendError>;

    async fn update(
        &self,
        gvrk: &KubeGvrk,
        namespace: Option<&str>,
        name: &str,
        object: &Value,
    ) -> Result<Value, BackendError>;

    async fn delete(
        &self,
        gvrk: &KubeGvrk,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), BackendError>;
}

/// Where a chart comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChartRef {
    pub name: String,
    pub version: String,
    pub repo_url: String,
    pub is_oci: bool,
}

impl From<&HelmOptions> for ChartRef {
    fn from(opts: &HelmOptions) -> Self {
        Self {
            name: opts.chart_name.clone(),
            version: opts.chart_version.clone(),
            repo_url: opts.repo_url.clone(),
            is_oci: opts.is_oci || opts.repo_url.starts_with("oci://"),
        }
    }
}

/// Install or upgrade parameters.
#[derive(Debug, Clone, Default)]
pub struct ReleaseSpec {
    pub name: String,
    pub namespace: String,
    pub chart: ChartRef,
    /// Values document, already validated as YAML.
    pub values: String,
    pub dry_run: bool,
    pub reuse_values: bool,
}

/// Release operations of the package manager.
#[async_trait]
pub trait PackageBackend: Send + Sync {
    async fn list(&self, namespace: &str) -> Result<Value, BackendError>;
    async fn get(&self, name: &str, namespace: &str) -> Result<Value, BackendError>;
    async fn install(&self, spec: &ReleaseSpec) -> Result<Value, BackendError>;
    async fn upgrade(&self, spec: &ReleaseSpec) -> Result<Value, BackendError>;
    /// Returns the release's uninstall description.
    async fn uninstall(
        &self,
        name: &str,
        namespace: &str,
        dry_run: bool,
    ) -> Result<String, BackendError>;
    /// Download a chart archive, returning its local path.
    async fn pull(&self, chart: &ChartRef) -> Result<String, BackendError>;
    /// Default values of a chart, as YAML.
    async fn show_values(&self, chart: &ChartRef) -> Result<String, BackendError>;
    /// Available versions of a chart, newest first.
    async fn tags(&self, chart: &ChartRef) -> Result<Vec<String>, BackendError>;
}

/// A container inside a pod.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodTarget {
    pub name: String,
    pub namespace: String,
    pub container: String,
}

impl PodTarget {
    pub fn validate(&self) -> Result<(), BackendError> {
        check_name("pod name", &self.name)?;
        check_name("namespace", &self.namespace)?;
        check_name("container name", &self.container)
    }
}

/// Reject a client-supplied name the command-line tools would parse as a
/// flag.
pub fn check_name(what: &str, value: &str) -> Result<(), BackendError> {
    if value.starts_with('-') {
        return Err(BackendError::InvalidRequest(format!(
            "invalid {what} '{value}': must not start with '-'"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub target: PodTarget,
    pub command: Vec<String>,
    pub initial_size: TerminalSize,
}

/// I/O capabilities handed to an [`ExecBackend`]. With a TTY the remote side
/// merges stderr into stdout, so `stderr` may be `None`.
pub struct ExecStreams {
    pub stdin: Arc<dyn ByteSource>,
    pub stdout: Arc<dyn ByteSink>,
    pub stderr: Option<Arc<dyn ByteSink>>,
    pub resize: Arc<dyn SizeSource>,
}

/// Interactive command execution in a container.
#[async_trait]
pub trait ExecBackend: Send + Sync {
    /// Run `request` until the remote process exits, the input fails, or
    /// `cancel` fires. `Ok` means the process ended normally.
    async fn stream(
        &self,
        request: &ExecRequest,
        streams: ExecStreams,
        cancel: CancellationToken,
    ) -> Result<(), BackendError>;

    /// Run a non-interactive command and capture its stdout.
    async fn capture(&self, target: &PodTarget, command: &[String])
        -> Result<String, BackendError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogRequest {
    pub target: PodTarget,
    pub follow: bool,
    pub tail_lines: Option<i64>,
}

/// An open log stream.
#[async_trait]
pub trait LogStream: Send {
    /// Next line including its trailing newline; `None` at end of stream.
    async fn next_line(&mut self) -> Result<Option<String>, BackendError>;
}

#[async_trait]
pub trait LogBackend: Send + Sync {
    async fn open(&self, request: &LogRequest) -> Result<Box<dyn LogStream>, BackendError>;
}

/// The full set of collaborators, cloned into every handler.
#[derive(Clone)]
pub struct Backends {
    pub cluster: Arc<dyn ClusterBackend>,
    pub packages: Arc<dyn PackageBackend>,
    pub exec: Arc<dyn ExecBackend>,
    pub logs: Arc<dyn LogBackend>,
}

impl Backends {
    /// The CLI-backed collaborators described by `config`.
    pub fn from_config(config: &Config) -> Result<Self, BackendError> {
        let kubectl = kubectl::Kubectl::new(&config.kube);
        let helm = helm::HelmCli::new(&config.helm, &config.kube)?;
        let exec = exec::PtyExec::new(
            exec::Launcher::Kubectl(kubectl.clone()),
            config.sessions.terminal_exit_grace(),
        );
        let kubectl = Arc::new(kubectl);
        Ok(Self {
            cluster: Arc::clone(&kubectl) as Arc<dyn ClusterBackend>,
            packages: Arc::new(helm),
            exec: Arc::new(exec),
            logs: kubectl,
        })
    }
}
