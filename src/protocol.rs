//! Wire protocol shared by every stream kind.
//!
//! Every frame on a stream is one JSON [`Envelope`]:
//!
//! ```json
//! {"op": "list", "data": "{...}", "sessionId": "9f3c...", "error": "", "statusCode": 0, "opId": "7"}
//! ```
//!
//! Requests and replies share the same shape. Client-originated tags are
//! `bind`, the resource and package operations, `stdin`, `resize` and
//! `close`; the server originates `stdout`, `toast`, `close` and the replies
//! (which reuse the request's tag).
//!
//! Resource operations carry their arguments as a JSON-encoded
//! [`ResourceRequest`] inside `data`.

use serde::{Deserialize, Serialize};

/// End-of-transmission byte delivered to a remote process when its input ends.
pub const END_OF_TRANSMISSION: u8 = 0x04;

/// Operation tag of an [`Envelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Op {
    Bind,
    List,
    ListAll,
    Get,
    Update,
    Delete,
    HelmList,
    HelmGet,
    HelmInstall,
    HelmUpgrade,
    HelmUninstall,
    HelmPull,
    HelmShowValues,
    HelmGetTags,
    Stdin,
    Stdout,
    Resize,
    Toast,
    Close,
    /// Any tag this server does not know.
    #[default]
    #[serde(other)]
    Unknown,
}

impl Op {
    /// Wire name of the tag.
    pub fn as_str(self) -> &'static str {
        match self {
            Op::Bind => "bind",
            Op::List => "list",
            Op::ListAll => "listAll",
            Op::Get => "get",
            Op::Update => "update",
            Op::Delete => "delete",
            Op::HelmList => "helmList",
            Op::HelmGet => "helmGet",
            Op::HelmInstall => "helmInstall",
            Op::HelmUpgrade => "helmUpgrade",
            Op::HelmUninstall => "helmUninstall",
            Op::HelmPull => "helmPull",
            Op::HelmShowValues => "helmShowValues",
            Op::HelmGetTags => "helmGetTags",
            Op::Stdin => "stdin",
            Op::Stdout => "stdout",
            Op::Resize => "resize",
            Op::Toast => "toast",
            Op::Close => "close",
            Op::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit exchanged in both directions on a bound stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default)]
    pub op: Op,
    /// Opaque payload, often itself JSON.
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub session_id: String,
    /// Empty means no error.
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub status_code: u32,
    /// Correlation id, echoed on the reply to the request that carried it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
}

impl Envelope {
    pub fn new(op: Op) -> Self {
        Self {
            op,
            ..Self::default()
        }
    }

    /// Envelope with `op` and `data` set, everything else empty.
    pub fn with_data(op: Op, data: impl Into<String>) -> Self {
        Self {
            op,
            data: data.into(),
            ..Self::default()
        }
    }

    /// Reply skeleton for `request`: same tag, same correlation id.
    pub fn reply_to(request: &Envelope) -> Self {
        Self {
            op: request.op,
            session_id: request.session_id.clone(),
            op_id: request.op_id.clone(),
            ..Self::default()
        }
    }

    /// Final envelope sent before a stream is closed.
    pub fn close(session_id: &str, status: CloseStatus, reason: &str) -> Self {
        Self {
            op: Op::Close,
            data: reason.to_string(),
            session_id: session_id.to_string(),
            error: if status == CloseStatus::Error {
                reason.to_string()
            } else {
                String::new()
            },
            status_code: u32::from(status.code()),
            ..Self::default()
        }
    }
}

/// Status attached to a session termination, doubling as the WebSocket
/// close code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseStatus {
    Info,
    Warning,
    Error,
}

impl CloseStatus {
    pub fn code(self) -> u16 {
        match self {
            CloseStatus::Info => 3000,
            CloseStatus::Warning => 3001,
            CloseStatus::Error => 3002,
        }
    }
}

/// Group/version/resource/kind of a cluster object type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeGvrk {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub resource: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub is_namespaced: bool,
}

impl KubeGvrk {
    /// `resource.version.group` form understood by `kubectl get`. Core group
    /// resources are addressed by bare name.
    pub fn qualified_resource(&self) -> String {
        if self.group.is_empty() {
            self.resource.clone()
        } else if self.version.is_empty() {
            format!("{}.{}", self.resource, self.group)
        } else {
            format!("{}.{}.{}", self.resource, self.version, self.group)
        }
    }

    /// `group/version` form used in object bodies.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

/// Selectors and paging for list calls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceOptions {
    #[serde(default)]
    pub field_selector: String,
    #[serde(default)]
    pub label_selector: String,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub limit: i64,
    #[serde(default, rename = "continue")]
    pub continue_token: String,
}

/// Chart coordinates and flags for package operations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelmOptions {
    #[serde(default)]
    pub chart_name: String,
    #[serde(default)]
    pub chart_version: String,
    #[serde(default, rename = "repoURL")]
    pub repo_url: String,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default, rename = "isOCI")]
    pub is_oci: bool,
    #[serde(default)]
    pub reuse_values: bool,
}

/// Arguments of a resource or package operation, JSON-encoded in
/// [`Envelope::data`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequest {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "kubeGVRK")]
    pub kube_gvrk: KubeGvrk,
    #[serde(default, rename = "kubeGVRKList")]
    pub kube_gvrk_list: Vec<KubeGvrk>,
    /// Object body for `update`, values YAML for install/upgrade.
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub kube_options: ResourceOptions,
    #[serde(default)]
    pub helm_options: HelmOptions,
}

/// Response body of every session creation call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateResponse {
    pub session_id: String,
    pub status_code: u32,
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_uses_camel_case_fields() {
        let env = Envelope {
            op: Op::ListAll,
            data: "x".into(),
            session_id: "abc".into(),
            status_code: 3000,
            op_id: Some("1".into()),
            ..Envelope::default()
        };
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["op"], "listAll");
        assert_eq!(v["sessionId"], "abc");
        assert_eq!(v["statusCode"], 3000);
        assert_eq!(v["opId"], "1");
        assert!(v.get("rows").is_none());
    }

    #[test]
    fn unknown_op_does_not_fail_decoding() {
        let env: Envelope = serde_json::from_str(r#"{"op":"teleport","data":"x"}"#).unwrap();
        assert_eq!(env.op, Op::Unknown);
        assert_eq!(env.data, "x");
    }

    #[test]
    fn sparse_client_frames_decode() {
        let env: Envelope =
            serde_json::from_str(r#"{"op":"resize","cols":120,"rows":40}"#).unwrap();
        assert_eq!(env.op, Op::Resize);
        assert_eq!(env.rows, Some(40));
        assert_eq!(env.cols, Some(120));
        assert!(env.session_id.is_empty());
    }

    #[test]
    fn reply_keeps_tag_and_correlation() {
        let req = Envelope {
            op: Op::HelmGet,
            session_id: "s".into(),
            op_id: Some("42".into()),
            ..Envelope::default()
        };
        let reply = Envelope::reply_to(&req);
        assert_eq!(reply.op, Op::HelmGet);
        assert_eq!(reply.op_id.as_deref(), Some("42"));
        assert!(reply.error.is_empty());
    }

    #[test]
    fn close_envelope_carries_reason_and_code() {
        let info = Envelope::close("s", CloseStatus::Info, "Process exited");
        assert_eq!(info.op, Op::Close);
        assert_eq!(info.status_code, 3000);
        assert_eq!(info.data, "Process exited");
        assert!(info.error.is_empty());

        let err = Envelope::close("s", CloseStatus::Error, "boom");
        assert_eq!(err.status_code, 3002);
        assert_eq!(err.error, "boom");
    }

    #[test]
    fn request_payload_matches_client_field_names() {
        let raw = r#"{
            "namespace": "default",
            "kubeGVRK": {"group": "apps", "version": "v1", "resource": "deployments", "kind": "Deployment", "isNamespaced": true},
            "kubeOptions": {"labelSelector": "app=web", "continue": "tok"},
            "helmOptions": {"repoURL": "https://charts.example", "isOCI": false}
        }"#;
        let req: ResourceRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(req.kube_gvrk.qualified_resource(), "deployments.v1.apps");
        assert_eq!(req.kube_gvrk.api_version(), "apps/v1");
        assert_eq!(req.kube_options.continue_token, "tok");
        assert_eq!(req.helm_options.repo_url, "https://charts.example");
    }

    #[test]
    fn core_group_resource_is_bare_name() {
        let gvrk = KubeGvrk {
            version: "v1".into(),
            resource: "pods".into(),
            ..KubeGvrk::default()
        };
        assert_eq!(gvrk.qualified_resource(), "pods");
        assert_eq!(gvrk.api_version(), "v1");
    }
}
