//! End-to-end: creation calls over HTTP, streams over WebSocket, backed by
//! in-process fakes and a local PTY.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use kubesock::backend::exec::{Launcher, PtyExec};
use kubesock::backend::{
    BackendError, Backends, ChartRef, ClusterBackend, LogBackend, LogRequest, LogStream,
    PackageBackend, ReleaseSpec,
};
use kubesock::protocol::{CreateResponse, Envelope, KubeGvrk, Op, ResourceOptions};
use kubesock::{routes, AppState, Config};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct FakeCluster;

#[async_trait]
impl ClusterBackend for FakeCluster {
    async fn list(
        &self,
        gvrk: &KubeGvrk,
        namespace: Option<&str>,
        _options: &ResourceOptions,
    ) -> Result<Value, BackendError> {
        Ok(json!({
            "kind": format!("{}List", gvrk.kind),
            "items": [{ "metadata": { "name": "web-0", "namespace": namespace } }],
        }))
    }

    async fn get(
        &self,
        _gvrk: &KubeGvrk,
        _namespace: Option<&str>,
        name: &str,
    ) -> Result<Value, BackendError> {
        Err(BackendError::Failed {
            command: "kubectl get".into(),
            message: format!("Error from server (NotFound): pods \"{name}\" not found"),
        })
    }

    async fn update(
        &self,
        _gvrk: &KubeGvrk,
        _namespace: Option<&str>,
        _name: &str,
        object: &Value,
    ) -> Result<Value, BackendError> {
        Ok(object.clone())
    }

    async fn delete(
        &self,
        _gvrk: &KubeGvrk,
        _namespace: Option<&str>,
        _name: &str,
    ) -> Result<(), BackendError> {
        Ok(())
    }
}

struct NoPackages;

fn unavailable<T>() -> Result<T, BackendError> {
    Err(BackendError::InvalidRequest("package backend unavailable".into()))
}

#[async_trait]
impl PackageBackend for NoPackages {
    async fn list(&self, _namespace: &str) -> Result<Value, BackendError> {
        unavailable()
    }
    async fn get(&self, _name: &str, _namespace: &str) -> Result<Value, BackendError> {
        unavailable()
    }
    async fn install(&self, _spec: &ReleaseSpec) -> Result<Value, BackendError> {
        unavailable()
    }
    async fn upgrade(&self, _spec: &ReleaseSpec) -> Result<Value, BackendError> {
        unavailable()
    }
    async fn uninstall(&self, _name: &str, _namespace: &str, _dry_run: bool) -> Result<String, BackendError> {
        unavailable()
    }
    async fn pull(&self, _chart: &ChartRef) -> Result<String, BackendError> {
        unavailable()
    }
    async fn show_values(&self, _chart: &ChartRef) -> Result<String, BackendError> {
        unavailable()
    }
    async fn tags(&self, _chart: &ChartRef) -> Result<Vec<String>, BackendError> {
        Ok(vec!["2.0.0".into(), "1.0.0".into()])
    }
}

struct FakeLogs;

struct Lines(VecDeque<String>);

#[async_trait]
impl LogStream for Lines {
    async fn next_line(&mut self) -> Result<Option<String>, BackendError> {
        Ok(self.0.pop_front())
    }
}

#[async_trait]
impl LogBackend for FakeLogs {
    async fn open(&self, request: &LogRequest) -> Result<Box<dyn LogStream>, BackendError> {
        let name = &request.target.name;
        Ok(Box::new(Lines(
            [format!("{name} starting\n"), format!("{name} ready\n")].into(),
        )))
    }
}

async fn start(config: Config) -> SocketAddr {
    let backends = Backends {
        cluster: Arc::new(FakeCluster),
        packages: Arc::new(NoPackages),
        exec: Arc::new(PtyExec::new(Launcher::Direct, Duration::from_millis(500))),
        logs: Arc::new(FakeLogs),
    };
    let app = routes::router(AppState::new(config, backends));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn create(addr: SocketAddr, path: &str) -> CreateResponse {
    reqwest::get(format!("http://{addr}{path}"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

async fn connect(addr: SocketAddr, path: &str) -> Ws {
    let (ws, _) = connect_async(format!("ws://{addr}{path}")).await.unwrap();
    ws
}

async fn send(ws: &mut Ws, envelope: &Envelope) {
    let text = serde_json::to_string(envelope).unwrap();
    ws.send(Message::Text(text.into())).await.unwrap();
}

/// Next envelope, or `None` once the server closes or goes quiet.
async fn recv(ws: &mut Ws) -> Option<Envelope> {
    loop {
        match tokio::time::timeout(Duration::from_secs(10), ws.next()).await.ok()?? {
            Ok(Message::Text(text)) => return Some(serde_json::from_str(text.as_str()).unwrap()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

fn addressed(op: Op, id: &str, data: impl Into<String>) -> Envelope {
    let mut env = Envelope::with_data(op, data);
    env.session_id = id.to_string();
    env
}

async fn bind(addr: SocketAddr, path: &str, id: &str) -> Ws {
    let mut ws = connect(addr, path).await;
    send(&mut ws, &addressed(Op::Bind, id, "")).await;
    let ack = recv(&mut ws).await.expect("bind acknowledgement");
    assert_eq!(ack.op, Op::Bind);
    assert_eq!(ack.session_id, id);
    ws
}

async fn live_sessions(addr: SocketAddr) -> u64 {
    let health: Value = reqwest::get(format!("http://{addr}/healthz"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    health["sessions"].as_u64().unwrap()
}

#[tokio::test]
async fn resource_session_lists_and_closes() {
    let addr = start(Config::default()).await;
    let created = create(addr, "/srv/data/ws").await;
    assert_eq!(created.status_code, 200);
    assert_eq!(created.session_id.len(), 32);
    assert_eq!(live_sessions(addr).await, 1);

    let id = created.session_id;
    let mut ws = bind(addr, "/srv/data", &id).await;

    let request = json!({
        "namespace": "default",
        "kubeGVRK": { "group": "", "version": "v1", "resource": "pods", "kind": "Pod", "isNamespaced": true },
    });
    let mut list = addressed(Op::List, &id, request.to_string());
    list.op_id = Some("1".into());
    send(&mut ws, &list).await;
    let mut get = addressed(Op::Get, &id, json!({ "name": "gone" }).to_string());
    get.op_id = Some("2".into());
    send(&mut ws, &get).await;

    let reply = recv(&mut ws).await.unwrap();
    assert_eq!(reply.op, Op::List);
    assert_eq!(reply.op_id.as_deref(), Some("1"));
    assert!(reply.error.is_empty());
    let data: Value = serde_json::from_str(&reply.data).unwrap();
    assert_eq!(data["kind"], "PodList");
    assert_eq!(data["items"][0]["metadata"]["namespace"], "default");

    // A backend failure is reported inline and the session stays up.
    let reply = recv(&mut ws).await.unwrap();
    assert_eq!(reply.op, Op::Get);
    assert_eq!(reply.op_id.as_deref(), Some("2"));
    assert!(reply.error.contains("NotFound"));

    send(&mut ws, &addressed(Op::HelmGetTags, &id, json!({ "helmOptions": { "chartName": "nginx" } }).to_string())).await;
    let reply = recv(&mut ws).await.unwrap();
    let tags: Value = serde_json::from_str(&reply.data).unwrap();
    assert_eq!(tags, json!({ "chartName": "nginx", "chartTags": ["2.0.0", "1.0.0"] }));

    send(&mut ws, &addressed(Op::Close, &id, "")).await;
    let close = recv(&mut ws).await.unwrap();
    assert_eq!(close.op, Op::Close);
    assert_eq!(close.status_code, 3000);
    assert_eq!(live_sessions(addr).await, 0);
}

#[tokio::test]
async fn foreign_session_ids_are_ignored() {
    let addr = start(Config::default()).await;
    let id = create(addr, "/srv/data/ws").await.session_id;
    let mut ws = bind(addr, "/srv/data", &id).await;

    send(&mut ws, &addressed(Op::List, "someone-else", "{}")).await;
    send(&mut ws, &addressed(Op::Delete, &id, json!({ "name": "web-0" }).to_string())).await;
    let reply = recv(&mut ws).await.unwrap();
    assert_eq!(reply.op, Op::Delete);
    assert!(reply.error.is_empty());
}

#[tokio::test]
async fn unbound_session_is_reclaimed() {
    let mut config = Config::default();
    config.sessions.bind_timeout_secs = 1;
    let addr = start(config).await;
    let id = create(addr, "/srv/data/ws").await.session_id;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(live_sessions(addr).await, 0);

    let mut ws = connect(addr, "/srv/data").await;
    send(&mut ws, &addressed(Op::Bind, &id, "")).await;
    assert!(recv(&mut ws).await.is_none());
}

#[tokio::test]
async fn bind_on_the_wrong_endpoint_is_dropped() {
    let addr = start(Config::default()).await;
    let id = create(addr, "/srv/data/ws").await.session_id;

    let mut ws = connect(addr, "/srv/logs").await;
    send(&mut ws, &addressed(Op::Bind, &id, "")).await;
    assert!(recv(&mut ws).await.is_none());

    // The session is still there for the right endpoint.
    bind(addr, "/srv/data", &id).await;
}

#[tokio::test]
async fn log_session_streams_lines_then_ends() {
    let addr = start(Config::default()).await;
    let created = create(addr, "/srv/logs/stream?name=web-0&namespace=apps&follow=true&tailLines=10").await;
    assert_eq!(created.status_code, 200);
    let id = created.session_id;
    let mut ws = bind(addr, "/srv/logs", &id).await;

    let first = recv(&mut ws).await.unwrap();
    assert_eq!(first.op, Op::Stdout);
    assert_eq!(first.data, "web-0 starting\n");
    assert_eq!(recv(&mut ws).await.unwrap().data, "web-0 ready\n");

    let close = recv(&mut ws).await.unwrap();
    assert_eq!(close.op, Op::Close);
    assert_eq!(close.status_code, 3000);
    assert_eq!(close.data, "Log stream ended");
    assert_eq!(live_sessions(addr).await, 0);
}

#[tokio::test]
async fn invalid_log_query_is_rejected() {
    let addr = start(Config::default()).await;
    let resp = reqwest::get(format!("http://{addr}/srv/logs/stream?name=web-0&tailLines=lots"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: CreateResponse = resp.json().await.unwrap();
    assert!(body.session_id.is_empty());
    assert_eq!(body.status_code, 400);
}

/// Read terminal output until `needle` shows up.
async fn output_until(ws: &mut Ws, needle: &str) -> String {
    let mut seen = String::new();
    while let Some(env) = recv(ws).await {
        if env.op == Op::Stdout {
            seen.push_str(&env.data);
            if seen.contains(needle) {
                return seen;
            }
        }
    }
    panic!("'{needle}' never appeared in terminal output: {seen:?}");
}

#[tokio::test]
async fn terminal_session_runs_a_shell() {
    let addr = start(Config::default()).await;
    let created = create(addr, "/srv/shell/exec?name=web-0&namespace=apps&container=app").await;
    assert_eq!(created.status_code, 200);
    let id = created.session_id;
    let mut ws = bind(addr, "/srv/shell", &id).await;

    let mut resize = addressed(Op::Resize, &id, "");
    resize.rows = Some(40);
    resize.cols = Some(120);
    send(&mut ws, &resize).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    send(&mut ws, &addressed(Op::Stdin, &id, "stty size; echo kube$((40+2))sock\n")).await;
    let out = output_until(&mut ws, "kube42sock").await;
    assert!(out.contains("40 120"), "{out:?}");

    send(&mut ws, &addressed(Op::Stdin, &id, "exit 0\n")).await;
    loop {
        let env = recv(&mut ws).await.expect("close envelope");
        if env.op == Op::Close {
            assert_eq!(env.status_code, 3000);
            assert_eq!(env.data, "Process exited");
            break;
        }
    }
}

#[tokio::test]
async fn api_key_guards_creation_and_streams() {
    let mut config = Config::default();
    config.auth.api_key = Some("s3cret".into());
    let addr = start(config).await;
    let client = reqwest::Client::new();

    let resp = client.get(format!("http://{addr}/srv/data/ws")).send().await.unwrap();
    assert_eq!(resp.status(), 401);
    let resp = client
        .get(format!("http://{addr}/srv/data/ws"))
        .bearer_auth("wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    let created: CreateResponse = client
        .get(format!("http://{addr}/srv/data/ws"))
        .bearer_auth("s3cret")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(created.status_code, 200);

    assert!(connect_async(format!("ws://{addr}/srv/data")).await.is_err());
    let _ws = bind(addr, "/srv/data?token=s3cret", &created.session_id).await;

    // Health stays open.
    assert_eq!(live_sessions(addr).await, 1);
}
