//! Package backend on top of the `helm` CLI.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use super::tags::TagLookup;
use super::{check_name, cli, BackendError, ChartRef, PackageBackend, ReleaseSpec};
use crate::config::{HelmConfig, KubeConfig};
use crate::util::gen_session_id;

#[derive(Clone)]
pub struct HelmCli {
    program: String,
    kubeconfig: Option<String>,
    context: Option<String>,
    timeout: Duration,
    pull_dir: PathBuf,
    tags: TagLookup,
}

/// Install and upgrade share everything but the verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Install,
    Upgrade,
}

impl HelmCli {
    pub fn new(helm: &HelmConfig, kube: &KubeConfig) -> Result<Self, BackendError> {
        let timeout = Duration::from_secs(helm.timeout_secs);
        Ok(Self {
            program: helm.helm.clone(),
            kubeconfig: kube.kubeconfig_path(),
            context: kube.context.clone(),
            timeout,
            pull_dir: helm.pull_dir(),
            tags: TagLookup::new(Duration::from_secs(kube.request_timeout_secs))?,
        })
    }

    /// `verb flags... -- positionals...`, with the cluster flags appended to
    /// `flags`. Client-supplied names only ever follow the `--`.
    fn args(&self, verb: &[&str], mut flags: Vec<String>, positionals: Vec<String>) -> Vec<String> {
        if let Some(path) = &self.kubeconfig {
            flags.push(format!("--kubeconfig={path}"));
        }
        if let Some(context) = &self.context {
            flags.push(format!("--kube-context={context}"));
        }
        let mut out: Vec<String> = verb.iter().map(ToString::to_string).collect();
        out.extend(flags);
        if !positionals.is_empty() {
            out.push("--".into());
            out.extend(positionals);
        }
        out
    }

    async fn run(&self, args: Vec<String>) -> Result<String, BackendError> {
        cli::run(&self.program, &args, None, self.timeout).await
    }

    fn release_args(
        &self,
        verb: Verb,
        spec: &ReleaseSpec,
        values: Option<&Path>,
    ) -> Result<Vec<String>, BackendError> {
        if spec.name.is_empty() {
            return Err(BackendError::InvalidRequest("release name is required".into()));
        }
        check_name("release name", &spec.name)?;
        check_name("namespace", &spec.namespace)?;
        let chart = chart_args(&spec.chart)?;
        let mut flags = chart.flags;
        flags.push(format!("--namespace={}", spec.namespace));
        if let Some(path) = values {
            flags.push(format!("--values={}", path.display()));
        }
        if spec.dry_run {
            flags.push("--dry-run".into());
        }
        if verb == Verb::Upgrade && spec.reuse_values {
            flags.push("--reuse-values".into());
        }
        flags.push("--output=json".into());
        let verb = match verb {
            Verb::Install => "install",
            Verb::Upgrade => "upgrade",
        };
        Ok(self.args(&[verb], flags, vec![spec.name.clone(), chart.reference]))
    }

    async fn release(&self, verb: Verb, spec: &ReleaseSpec) -> Result<Value, BackendError> {
        // Reject bad names before the values file is written.
        self.release_args(verb, spec, None)?;
        // Held until helm has read it; removed on drop.
        let values = if spec.values.trim().is_empty() {
            None
        } else {
            Some(write_values(&spec.values)?)
        };
        let args = self.release_args(verb, spec, values.as_ref().map(NamedTempFile::path))?;
        let raw = self.run(args).await?;
        info!("helm {verb:?} of release {}/{} done", spec.namespace, spec.name);
        decode("release", &raw)
    }
}

fn write_values(values: &str) -> Result<NamedTempFile, BackendError> {
    use std::io::Write;
    let mut file = tempfile::Builder::new()
        .prefix("kubesock-values-")
        .suffix(".yaml")
        .tempfile()?;
    file.write_all(values.as_bytes())?;
    file.flush()?;
    Ok(file)
}

fn decode(what: &str, raw: &str) -> Result<Value, BackendError> {
    serde_json::from_str(raw).map_err(|e| BackendError::Decode {
        what: what.to_string(),
        reason: e.to_string(),
    })
}

/// How a chart is named on the helm command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartArgs {
    /// Positional chart reference.
    pub reference: String,
    pub flags: Vec<String>,
}

/// Chart reference arguments. An OCI chart is addressed by its full
/// `oci://` reference; an HTTP chart by name plus `--repo`.
pub fn chart_args(chart: &ChartRef) -> Result<ChartArgs, BackendError> {
    let mut flags = Vec::new();
    let reference = if chart.is_oci && !chart.repo_url.is_empty() {
        chart.repo_url.clone()
    } else {
        if !chart.repo_url.is_empty() {
            flags.push(format!("--repo={}", chart.repo_url));
        }
        chart.name.clone()
    };
    check_name("chart name", &reference)?;
    if !chart.version.is_empty() {
        flags.push(format!("--version={}", chart.version));
    }
    Ok(ChartArgs { reference, flags })
}

/// First chart archive in `dir`.
async fn find_archive(dir: &Path) -> Result<PathBuf, BackendError> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "tgz") {
            return Ok(path);
        }
    }
    Err(BackendError::Failed {
        command: "helm pull".into(),
        message: format!("no chart archive was written to {}", dir.display()),
    })
}

#[async_trait]
impl PackageBackend for HelmCli {
    async fn list(&self, namespace: &str) -> Result<Value, BackendError> {
        let mut flags = vec!["--output=json".to_string()];
        if namespace.is_empty() {
            flags.push("--all-namespaces".into());
        } else {
            flags.push(format!("--namespace={namespace}"));
        }
        let raw = self.run(self.args(&["list"], flags, Vec::new())).await?;
        decode("release list", &raw)
    }

    async fn get(&self, name: &str, namespace: &str) -> Result<Value, BackendError> {
        check_name("release name", name)?;
        let flags = vec![format!("--namespace={namespace}"), "--output=json".into()];
        let raw = self
            .run(self.args(&["status"], flags, vec![name.to_string()]))
            .await?;
        decode("release", &raw)
    }

    async fn install(&self, spec: &ReleaseSpec) -> Result<Value, BackendError> {
        self.release(Verb::Install, spec).await
    }

    async fn upgrade(&self, spec: &ReleaseSpec) -> Result<Value, BackendError> {
        self.release(Verb::Upgrade, spec).await
    }

    async fn uninstall(
        &self,
        name: &str,
        namespace: &str,
        dry_run: bool,
    ) -> Result<String, BackendError> {
        check_name("release name", name)?;
        let mut flags = vec![format!("--namespace={namespace}")];
        if dry_run {
            flags.push("--dry-run".into());
        }
        let out = self
            .run(self.args(&["uninstall"], flags, vec![name.to_string()]))
            .await?;
        Ok(out.trim().to_string())
    }

    async fn pull(&self, chart: &ChartRef) -> Result<String, BackendError> {
        let args = chart_args(chart)?;
        let dest = self.pull_dir.join(format!("kubesock-pull-{}", gen_session_id()));
        tokio::fs::create_dir_all(&dest).await?;
        let mut flags = args.flags;
        flags.push(format!("--destination={}", dest.display()));
        self.run(self.args(&["pull"], flags, vec![args.reference])).await?;
        let archive = find_archive(&dest).await?;
        debug!("Pulled chart {} to {}", chart.name, archive.display());
        Ok(archive.to_string_lossy().into_owned())
    }

    async fn show_values(&self, chart: &ChartRef) -> Result<String, BackendError> {
        let args = chart_args(chart)?;
        self.run(self.args(&["show", "values"], args.flags, vec![args.reference]))
            .await
    }

    async fn tags(&self, chart: &ChartRef) -> Result<Vec<String>, BackendError> {
        self.tags.tags(chart).await
    }
}
