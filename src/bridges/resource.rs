//! Resource-operation bridge: one backend call per request envelope.
//!
//! Arguments arrive as a JSON [`ResourceRequest`] in the envelope's `data`;
//! results go back in the reply's `data`, failures in its `error`. A failed
//! call never ends the session.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::backend::{BackendError, ChartRef, ClusterBackend, PackageBackend, ReleaseSpec};
use crate::dispatch::OpHandler;
use crate::protocol::{Envelope, KubeGvrk, Op, ResourceRequest};

/// Reply payload of `helmGetTags`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartTags {
    pub chart_name: String,
    pub chart_tags: Vec<String>,
}

pub struct ResourceBridge {
    cluster: Arc<dyn ClusterBackend>,
    packages: Arc<dyn PackageBackend>,
}

impl ResourceBridge {
    pub fn new(cluster: Arc<dyn ClusterBackend>, packages: Arc<dyn PackageBackend>) -> Self {
        Self { cluster, packages }
    }

    async fn list_all(&self, request: &ResourceRequest) -> (String, Option<BackendError>) {
        let mut lists = BTreeMap::new();
        let mut failure = None;
        for gvrk in &request.kube_gvrk_list {
            let list = match self
                .cluster
                .list(gvrk, scope(gvrk, &request.namespace), &request.kube_options)
                .await
            {
                Ok(list) => list,
                Err(e) => {
                    if e.is_missing_resource() {
                        debug!("listAll: {} not served, skipping", gvrk.qualified_resource());
                    } else {
                        failure = Some(e);
                    }
                    json!({ "items": [] })
                }
            };
            lists.insert(gvrk.resource.clone(), list);
        }
        (Value::from(serde_json::Map::from_iter(lists)).to_string(), failure)
    }

    async fn call(&self, op: Op, request: &ResourceRequest) -> Result<String, BackendError> {
        let gvrk = &request.kube_gvrk;
        let namespace = scope(gvrk, &request.namespace);
        match op {
            Op::List => {
                let list = self.cluster.list(gvrk, namespace, &request.kube_options).await?;
                Ok(list.to_string())
            }
            Op::Get => {
                let mut object = self.cluster.get(gvrk, namespace, &request.name).await?;
                strip_server_fields(&mut object);
                Ok(object.to_string())
            }
            Op::Update => {
                let body: Value = serde_json::from_str(&request.data).map_err(|e| {
                    BackendError::InvalidRequest(format!("object is not valid JSON: {e}"))
                })?;
                let mut object = self
                    .cluster
                    .update(gvrk, namespace, &request.name, &body)
                    .await?;
                strip_server_fields(&mut object);
                Ok(object.to_string())
            }
            Op::Delete => {
                self.cluster.delete(gvrk, namespace, &request.name).await?;
                Ok(String::new())
            }
            Op::HelmList => Ok(self.packages.list(&request.namespace).await?.to_string()),
            Op::HelmGet => Ok(self
                .packages
                .get(&request.name, &request.namespace)
                .await?
                .to_string()),
            Op::HelmInstall => Ok(self
                .packages
                .install(&release_spec(request)?)
                .await?
                .to_string()),
            Op::HelmUpgrade => Ok(self
                .packages
                .upgrade(&release_spec(request)?)
                .await?
                .to_string()),
            Op::HelmUninstall => {
                self.packages
                    .uninstall(&request.name, &request.namespace, request.helm_options.dry_run)
                    .await
            }
            Op::HelmPull => self.packages.pull(&ChartRef::from(&request.helm_options)).await,
            Op::HelmShowValues => {
                self.packages
                    .show_values(&ChartRef::from(&request.helm_options))
                    .await
            }
            Op::HelmGetTags => {
                let chart = ChartRef::from(&request.helm_options);
                let tags = ChartTags {
                    chart_tags: self.packages.tags(&chart).await?,
                    chart_name: chart.name,
                };
                serde_json::to_string(&tags).map_err(|e| BackendError::Decode {
                    what: "chart tags".into(),
                    reason: e.to_string(),
                })
            }
            other => Err(BackendError::InvalidRequest(format!(
                "'{other}' is not a resource operation"
            ))),
        }
    }
}

/// Tags served by [`ResourceBridge`].
pub fn is_resource_op(op: Op) -> bool {
    matches!(
        op,
        Op::List
            | Op::ListAll
            | Op::Get
            | Op::Update
            | Op::Delete
            | Op::HelmList
            | Op::HelmGet
            | Op::HelmInstall
            | Op::HelmUpgrade
            | Op::HelmUninstall
            | Op::HelmPull
            | Op::HelmShowValues
            | Op::HelmGetTags
    )
}

/// Cluster-scoped kinds ignore the requested namespace.
fn scope<'a>(gvrk: &KubeGvrk, namespace: &'a str) -> Option<&'a str> {
    gvrk.is_namespaced.then_some(namespace)
}

/// Drop the fields that would make a round-tripped object conflict or bloat.
fn strip_server_fields(object: &mut Value) {
    if let Some(metadata) = object.get_mut("metadata").and_then(Value::as_object_mut) {
        metadata.remove("resourceVersion");
        metadata.remove("managedFields");
    }
}

fn release_spec(request: &ResourceRequest) -> Result<ReleaseSpec, BackendError> {
    if !request.data.trim().is_empty() {
        serde_yaml::from_str::<serde_yaml::Value>(&request.data)
            .map_err(|e| BackendError::InvalidRequest(format!("values are not valid YAML: {e}")))?;
    }
    Ok(ReleaseSpec {
        name: request.name.clone(),
        namespace: request.namespace.clone(),
        chart: ChartRef::from(&request.helm_options),
        values: request.data.clone(),
        dry_run: request.helm_options.dry_run,
        reuse_values: request.helm_options.reuse_values,
    })
}

#[async_trait]
impl OpHandler for ResourceBridge {
    async fn handle(&self, request: &Envelope) -> Option<Envelope> {
        if !is_resource_op(request.op) {
            return None;
        }
        let mut reply = Envelope::reply_to(request);

        let args: ResourceRequest = if request.data.trim().is_empty() {
            ResourceRequest::default()
        } else {
            match serde_json::from_str(&request.data) {
                Ok(args) => args,
                Err(e) => {
                    reply.error = format!("invalid request payload: {e}");
                    return Some(reply);
                }
            }
        };

        if request.op == Op::ListAll {
            let (data, failure) = self.list_all(&args).await;
            reply.data = data;
            if let Some(e) = failure {
                warn!("Session {}: listAll failed: {e}", request.session_id);
                reply.error = e.to_string();
            }
            return Some(reply);
        }

        match self.call(request.op, &args).await {
            Ok(data) => reply.data = data,
            Err(e) => {
                warn!("Session {}: {} failed: {e}", request.session_id, request.op);
                reply.error = e.to_string();
            }
        }
        Some(reply)
    }
}
