//! Cluster and log backends on top of `kubectl`.
//!
//! Lists go through `kubectl get --raw` against the API path so selectors,
//! paging and server-side timeouts map one to one onto query parameters.
//! Single objects use the typed verbs (`get`, `replace`, `delete`).

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::debug;

use super::cli::{self, read_capped};
use super::{
    check_name, BackendError, ClusterBackend, LogBackend, LogRequest, LogStream, PodTarget,
};
use crate::config::KubeConfig;
use crate::protocol::{KubeGvrk, ResourceOptions};

/// Stderr kept from a log stream for the error report.
const MAX_LOG_STDERR: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct Kubectl {
    program: String,
    kubeconfig: Option<String>,
    context: Option<String>,
    timeout: Duration,
}

impl Kubectl {
    pub fn new(config: &KubeConfig) -> Self {
        Self {
            program: config.kubectl.clone(),
            kubeconfig: config.kubeconfig_path(),
            context: config.context.clone(),
            timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// `--kubeconfig`/`--context` followed by `args`.
    pub fn args<I, S>(&self, args: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out = Vec::new();
        if let Some(path) = &self.kubeconfig {
            out.push(format!("--kubeconfig={path}"));
        }
        if let Some(context) = &self.context {
            out.push(format!("--context={context}"));
        }
        out.extend(args.into_iter().map(Into::into));
        out
    }

    /// Arguments of `kubectl exec` into `target`. With `tty`, stdin is kept
    /// open and a terminal is requested.
    pub fn exec_args(&self, target: &PodTarget, tty: bool, command: &[String]) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        if tty {
            args.push("-i".into());
            args.push("-t".into());
        }
        args.push(target.name.clone());
        args.push(format!("--namespace={}", target.namespace));
        if !target.container.is_empty() {
            args.push(format!("--container={}", target.container));
        }
        args.push("--".into());
        args.extend(command.iter().cloned());
        self.args(args)
    }

    async fn run(&self, args: Vec<String>, input: Option<&[u8]>) -> Result<String, BackendError> {
        cli::run(&self.program, &args, input, self.timeout).await
    }
}

fn decode(what: &str, raw: &str) -> Result<Value, BackendError> {
    serde_json::from_str(raw).map_err(|e| BackendError::Decode {
        what: what.to_string(),
        reason: e.to_string(),
    })
}

/// REST path of a collection (or of one object when `name` is set).
/// `None` or an empty namespace addresses the cluster-wide collection.
pub fn api_path(gvrk: &KubeGvrk, namespace: Option<&str>, name: Option<&str>) -> String {
    let mut path = if gvrk.group.is_empty() {
        format!("/api/{}", gvrk.version)
    } else {
        format!("/apis/{}/{}", gvrk.group, gvrk.version)
    };
    if let Some(ns) = namespace.filter(|ns| !ns.is_empty()) {
        path.push_str("/namespaces/");
        path.push_str(ns);
    }
    path.push('/');
    path.push_str(&gvrk.resource);
    if let Some(name) = name {
        path.push('/');
        path.push_str(name);
    }
    path
}

/// List path with selectors and paging as percent-encoded query parameters.
pub fn list_url(gvrk: &KubeGvrk, namespace: Option<&str>, options: &ResourceOptions) -> String {
    let path = api_path(gvrk, namespace, None);
    let Ok(mut url) = Url::parse("http://cluster.invalid") else {
        return path;
    };
    url.set_path(&path);
    {
        let mut query = url.query_pairs_mut();
        if !options.field_selector.is_empty() {
            query.append_pair("fieldSelector", &options.field_selector);
        }
        if !options.label_selector.is_empty() {
            query.append_pair("labelSelector", &options.label_selector);
        }
        if options.limit > 0 {
            query.append_pair("limit", &options.limit.to_string());
        }
        if !options.continue_token.is_empty() {
            query.append_pair("continue", &options.continue_token);
        }
        if let Some(secs) = options.timeout_seconds {
            query.append_pair("timeoutSeconds", &secs.to_string());
        }
    }
    match url.query() {
        Some(q) if !q.is_empty() => format!("{}?{q}", url.path()),
        _ => url.path().to_string(),
    }
}

fn namespace_arg(namespace: Option<&str>) -> Option<String> {
    namespace
        .filter(|ns| !ns.is_empty())
        .map(|ns| format!("--namespace={ns}"))
}

/// `verb flags... -- resource name` for a single object. Client-supplied
/// names only ever appear after the end-of-options marker.
pub fn object_args(
    verb: &str,
    gvrk: &KubeGvrk,
    namespace: Option<&str>,
    name: &str,
    flags: &[&str],
) -> Result<Vec<String>, BackendError> {
    check_name("resource", &gvrk.resource)?;
    check_name("object name", name)?;
    check_name("namespace", namespace.unwrap_or_default())?;
    let mut args = vec![verb.to_string()];
    args.extend(namespace_arg(namespace));
    args.extend(flags.iter().map(ToString::to_string));
    args.push("--".into());
    args.push(gvrk.qualified_resource());
    args.push(name.to_string());
    Ok(args)
}

#[async_trait]
impl ClusterBackend for Kubectl {
    async fn list(
        &self,
        gvrk: &KubeGvrk,
        namespace: Option<&str>,
        options: &ResourceOptions,
    ) -> Result<Value, BackendError> {
        let url = list_url(gvrk, namespace, options);
        let raw = self.run(self.args(["get", "--raw", url.as_str()]), None).await?;
        decode(&gvrk.resource, &raw)
    }

    async fn get(
        &self,
        gvrk: &KubeGvrk,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Value, BackendError> {
        let args = object_args("get", gvrk, namespace, name, &["--output=json"])?;
        let raw = self.run(self.args(args), None).await?;
        decode(&gvrk.resource, &raw)
    }

    async fn update(
        &self,
        gvrk: &KubeGvrk,
        namespace: Option<&str>,
        name: &str,
        object: &Value,
    ) -> Result<Value, BackendError> {
        check_name("namespace", namespace.unwrap_or_default())?;
        let mut body = object.clone();
        let Some(fields) = body.as_object_mut() else {
            return Err(BackendError::InvalidRequest("object must be a JSON map".into()));
        };
        fields
            .entry("apiVersion")
            .or_insert_with(|| Value::String(gvrk.api_version()));
        if !gvrk.kind.is_empty() {
            fields
                .entry("kind")
                .or_insert_with(|| Value::String(gvrk.kind.clone()));
        }
        let metadata = fields
            .entry("metadata")
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if let Some(metadata) = metadata.as_object_mut() {
            metadata
                .entry("name")
                .or_insert_with(|| Value::String(name.to_string()));
        }

        let mut args = vec!["replace".to_string(), "--filename=-".into()];
        args.extend(namespace_arg(namespace));
        args.push("--validate=strict".into());
        args.push("--output=json".into());
        let raw = self.run(self.args(args), Some(body.to_string().as_bytes())).await?;
        decode(&gvrk.resource, &raw)
    }

    async fn delete(
        &self,
        gvrk: &KubeGvrk,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), BackendError> {
        let args = object_args("delete", gvrk, namespace, name, &["--wait=false"])?;
        self.run(self.args(args), None).await.map(|_| ())
    }
}

/// `kubectl logs` output read line by line.
pub struct KubectlLogStream {
    command: String,
    child: Child,
    lines: BufReader<ChildStdout>,
    stderr: Option<JoinHandle<Vec<u8>>>,
}

#[async_trait]
impl LogStream for KubectlLogStream {
    async fn next_line(&mut self) -> Result<Option<String>, BackendError> {
        let mut buf = Vec::new();
        let n = self.lines.read_until(b'\n', &mut buf).await?;
        if n > 0 {
            return Ok(Some(String::from_utf8_lossy(&buf).into_owned()));
        }

        let status = self.child.wait().await?;
        let stderr = match self.stderr.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        };
        if status.success() {
            debug!("{} finished", self.command);
            return Ok(None);
        }
        let stderr = String::from_utf8_lossy(&stderr).trim().to_string();
        Err(BackendError::Failed {
            command: self.command.clone(),
            message: if stderr.is_empty() {
                format!("{} exited with {status}", self.command)
            } else {
                stderr
            },
        })
    }
}

impl Drop for KubectlLogStream {
    fn drop(&mut self) {
        if let Some(task) = self.stderr.take() {
            task.abort();
        }
    }
}

/// Arguments of `kubectl logs` for `request`.
pub fn log_args(request: &LogRequest) -> Vec<String> {
    let mut args = vec![
        "logs".to_string(),
        request.target.name.clone(),
        format!("--namespace={}", request.target.namespace),
    ];
    if !request.target.container.is_empty() {
        args.push(format!("--container={}", request.target.container));
    }
    if request.follow {
        args.push("--follow".into());
    }
    if let Some(n) = request.tail_lines {
        args.push(format!("--tail={n}"));
    }
    args
}

#[async_trait]
impl LogBackend for Kubectl {
    async fn open(&self, request: &LogRequest) -> Result<Box<dyn LogStream>, BackendError> {
        request.target.validate()?;
        let args = self.args(log_args(request));
        let command = cli::describe(&self.program, &args);
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BackendError::Spawn {
                program: self.program.clone(),
                reason: e.to_string(),
            })?;

        let stdout = child.stdout.take().ok_or_else(|| BackendError::Spawn {
            program: self.program.clone(),
            reason: "stdout pipe unavailable".into(),
        })?;
        let stderr = child.stderr.take().map(|mut pipe| {
            tokio::spawn(async move { read_capped(&mut pipe, MAX_LOG_STDERR).await })
        });

        Ok(Box::new(KubectlLogStream {
            command,
            child,
            lines: BufReader::new(stdout),
            stderr,
        }))
    }
}
