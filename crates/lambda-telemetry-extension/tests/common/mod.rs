//! Shared test utilities: a minimal in-process Lambda platform exposing the
//! Extensions API and Telemetry API endpoints the extension talks to.

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

pub struct PlatformState {
    pub subscribe_status: u16,
    event_rx: Mutex<mpsc::UnboundedReceiver<Value>>,
    registrations: Mutex<Vec<String>>,
    subscriptions: Mutex<Vec<Value>>,
    init_errors: Mutex<Vec<String>>,
    exit_errors: Mutex<Vec<String>>,
}

/// In-process mock of the Lambda control plane.
pub struct MockPlatform {
    addr: SocketAddr,
    state: Arc<PlatformState>,
    event_tx: mpsc::UnboundedSender<Value>,
    _server: JoinHandle<()>,
}

impl MockPlatform {
    /// Starts the platform on an ephemeral port. `subscribe_status` is the
    /// status returned by the telemetry subscription endpoint (200 or 202).
    pub async fn start(subscribe_status: u16) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let state = Arc::new(PlatformState {
            subscribe_status,
            event_rx: Mutex::new(event_rx),
            registrations: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            init_errors: Mutex::new(Vec::new()),
            exit_errors: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/2020-01-01/extension/register", post(register))
            .route("/2020-01-01/extension/event/next", get(next_event))
            .route("/2020-01-01/extension/init/error", post(init_error))
            .route("/2020-01-01/extension/exit/error", post(exit_error))
            .route("/2022-07-01/telemetry", put(subscribe))
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            addr,
            state,
            event_tx,
            _server: server,
        }
    }

    /// Host:port string for `AWS_LAMBDA_RUNTIME_API`-style configuration.
    pub fn runtime_api(&self) -> String {
        format!("{}", self.addr)
    }

    /// Queues an INVOKE event for the next `/event/next` poll.
    pub fn send_invoke(&self, request_id: &str) {
        self.event_tx
            .send(json!({
                "eventType": "INVOKE",
                "deadlineMs": 1676842262821i64,
                "requestId": request_id,
                "invokedFunctionArn": "arn:aws:lambda:us-east-1:123456789012:function:test",
                "tracing": {"type": "X-Amzn-Trace-Id", "value": "Root=1-00000000"}
            }))
            .unwrap();
    }

    /// Queues a SHUTDOWN event for the next `/event/next` poll.
    pub fn send_shutdown(&self) {
        self.event_tx
            .send(json!({
                "eventType": "SHUTDOWN",
                "deadlineMs": 1676842262821i64,
                "shutdownReason": "spindown"
            }))
            .unwrap();
    }

    pub async fn registrations(&self) -> Vec<String> {
        self.state.registrations.lock().await.clone()
    }

    pub async fn subscriptions(&self) -> Vec<Value> {
        self.state.subscriptions.lock().await.clone()
    }

    pub async fn init_errors(&self) -> Vec<String> {
        self.state.init_errors.lock().await.clone()
    }

    pub async fn exit_errors(&self) -> Vec<String> {
        self.state.exit_errors.lock().await.clone()
    }

    /// Waits until a subscription has been captured and returns its
    /// destination URI.
    pub async fn subscribed_uri(&self, timeout: std::time::Duration) -> String {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(subscription) = self.state.subscriptions.lock().await.first() {
                return subscription["destination"]["URI"]
                    .as_str()
                    .expect("subscription missing destination URI")
                    .to_string();
            }

            assert!(
                tokio::time::Instant::now() < deadline,
                "no subscription captured within {:?}",
                timeout
            );
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }
}

async fn register(State(state): State<Arc<PlatformState>>, headers: HeaderMap) -> Response {
    let name = headers
        .get("Lambda-Extension-Name")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    if name.is_empty() {
        return (StatusCode::BAD_REQUEST, "Missing Lambda-Extension-Name").into_response();
    }

    state.registrations.lock().await.push(name);

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        "Lambda-Extension-Identifier",
        "test-extension-id".parse().unwrap(),
    );

    (
        StatusCode::OK,
        response_headers,
        Json(json!({
            "functionName": "test-function",
            "functionVersion": "$LATEST",
            "handler": "index.handler"
        })),
    )
        .into_response()
}

async fn next_event(State(state): State<Arc<PlatformState>>, headers: HeaderMap) -> Response {
    if headers.get("Lambda-Extension-Identifier").is_none() {
        return (StatusCode::FORBIDDEN, "Missing Lambda-Extension-Identifier").into_response();
    }

    // Long poll: block until an event is queued.
    let event = state.event_rx.lock().await.recv().await;
    match event {
        Some(event) => Json(event).into_response(),
        None => (StatusCode::INTERNAL_SERVER_ERROR, "event queue closed").into_response(),
    }
}

async fn init_error(State(state): State<Arc<PlatformState>>, headers: HeaderMap) -> Response {
    let error_type = headers
        .get("Lambda-Extension-Function-Error-Type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    state.init_errors.lock().await.push(error_type);

    Json(json!({"status": "OK"})).into_response()
}

async fn exit_error(State(state): State<Arc<PlatformState>>, headers: HeaderMap) -> Response {
    let error_type = headers
        .get("Lambda-Extension-Function-Error-Type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    state.exit_errors.lock().await.push(error_type);

    Json(json!({"status": "OK"})).into_response()
}

async fn subscribe(
    State(state): State<Arc<PlatformState>>,
    Json(subscription): Json<Value>,
) -> Response {
    state.subscriptions.lock().await.push(subscription);

    match state.subscribe_status {
        200 => (StatusCode::OK, "OK").into_response(),
        202 => (StatusCode::ACCEPTED, "Telemetry API not supported").into_response(),
        status => (
            StatusCode::from_u16(status).unwrap(),
            "subscription rejected",
        )
            .into_response(),
    }
}
