//! Telemetry listener and invocation drain correlation.
//!
//! The listener hosts the HTTP endpoint the platform pushes telemetry
//! batches to. Decoded events feed a FIFO correlation queue consumed by
//! [`TelemetryListener::wait_for_drain`], which blocks until the
//! `platform.runtimeDone` event for the awaited invocation has been observed.
//!
//! The platform protocol allows at most one invocation in flight, so the
//! queue has a single consumer at a time; the receiver sits behind a mutex
//! to enforce that.

use crate::config::ListenerConfig;
use crate::pipeline::TelemetrySink;
use axum::{
    Router, body::Bytes, extract::State, http::StatusCode, response::IntoResponse, routing::post,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Event kind signalling that the runtime finished an invocation.
pub const PLATFORM_RUNTIME_DONE: &str = "platform.runtimeDone";

/// Event kind signalling that the platform dropped buffered events.
pub const PLATFORM_LOGS_DROPPED: &str = "platform.logsDropped";

/// A single telemetry event pushed by the platform.
///
/// The `record` payload is kind-specific; for platform lifecycle events it is
/// an object carrying, among other fields, the `requestId` of the invocation
/// it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// Event time in ISO 8601 format.
    pub time: String,
    /// Event kind, e.g. `platform.runtimeDone`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Kind-specific payload.
    #[serde(default)]
    pub record: serde_json::Value,
}

impl TelemetryEvent {
    /// Returns the request id carried in the record, if present.
    pub fn request_id(&self) -> Option<&str> {
        self.record.get("requestId").and_then(serde_json::Value::as_str)
    }
}

/// Error from waiting on invocation drain.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum DrainError {
    /// The wait was cancelled before a matching event arrived.
    #[error("drain wait cancelled")]
    Cancelled,

    /// The event queue closed while waiting. Only possible once the listener
    /// has been torn down.
    #[error("telemetry event queue closed")]
    QueueClosed,
}

/// Error from stopping the listener.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    /// In-flight requests did not finish within the grace period.
    #[error("listener did not stop within the shutdown grace period")]
    GracePeriodExceeded,
}

struct ListenerState {
    queue_tx: mpsc::UnboundedSender<TelemetryEvent>,
    sink: Option<Arc<dyn TelemetrySink>>,
}

/// HTTP listener receiving pushed telemetry batches.
pub struct TelemetryListener {
    config: ListenerConfig,
    state: Arc<ListenerState>,
    queue_rx: Mutex<mpsc::UnboundedReceiver<TelemetryEvent>>,
    local_addr: OnceLock<SocketAddr>,
    shutdown: CancellationToken,
    serve_task: Mutex<Option<JoinHandle<()>>>,
}

impl TelemetryListener {
    /// Creates a listener.
    ///
    /// When `sink` is given, every decoded batch is also handed to it,
    /// feeding the processing pipeline.
    pub fn new(config: ListenerConfig, sink: Option<Arc<dyn TelemetrySink>>) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();

        Self {
            config,
            state: Arc::new(ListenerState { queue_tx, sink }),
            queue_rx: Mutex::new(queue_rx),
            local_addr: OnceLock::new(),
            shutdown: CancellationToken::new(),
            serve_task: Mutex::new(None),
        }
    }

    /// Binds the endpoint and starts serving.
    ///
    /// The socket is bound and accepting connections before this returns, so
    /// a subscription sent immediately afterwards cannot race the listener.
    /// Returns the URI to advertise in the subscription request.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&self) -> Result<String, std::io::Error> {
        let app = Router::new()
            .route("/", post(handle_telemetry))
            .with_state(Arc::clone(&self.state));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let _ = self.local_addr.set(local_addr);

        let shutdown = self.shutdown.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
            {
                tracing::error!(error = %e, "Telemetry listener stopped unexpectedly");
            }
        });
        *self.serve_task.lock().await = Some(task);

        tracing::info!(port = local_addr.port(), "Telemetry listener started");

        Ok(self.uri())
    }

    /// Returns the URI the platform can reach the listener on.
    ///
    /// Inside the real sandbox the execution environment resolves
    /// `sandbox.localdomain`; a local emulator reaches the listener over
    /// loopback instead.
    pub fn uri(&self) -> String {
        let port = self
            .local_addr
            .get()
            .map(SocketAddr::port)
            .unwrap_or(self.config.port);

        if self.config.local_mode {
            format!("http://127.0.0.1:{}", port)
        } else {
            format!("http://sandbox.localdomain:{}", port)
        }
    }

    /// Blocks until the `platform.runtimeDone` event for `request_id` has
    /// been received, confirming all telemetry for that invocation arrived.
    ///
    /// Events are consumed in arrival order. `platform.logsDropped` is
    /// reported as a warning and skipped; every other kind is skipped
    /// silently. A `runtimeDone` for a different request id cannot happen
    /// while the protocol's single-invocation guarantee holds, so one is
    /// logged and discarded rather than treated as fatal.
    ///
    /// # Errors
    ///
    /// Returns [`DrainError::Cancelled`] promptly once `cancel` fires, and
    /// [`DrainError::QueueClosed`] if the listener was torn down.
    pub async fn wait_for_drain(
        &self,
        cancel: &CancellationToken,
        request_id: &str,
    ) -> Result<(), DrainError> {
        let mut queue = self.queue_rx.lock().await;

        loop {
            // Block for one event, then take whatever else is already queued.
            // No minimum batch size: a short-lived invocation that emits few
            // events must still complete the wait.
            let first = tokio::select! {
                _ = cancel.cancelled() => return Err(DrainError::Cancelled),
                event = queue.recv() => event.ok_or(DrainError::QueueClosed)?,
            };

            let mut batch = vec![first];
            while let Ok(event) = queue.try_recv() {
                batch.push(event);
            }

            for event in batch {
                match event.kind.as_str() {
                    PLATFORM_LOGS_DROPPED => {
                        tracing::warn!(
                            record = %event.record,
                            "Platform dropped telemetry events"
                        );
                    }
                    PLATFORM_RUNTIME_DONE => match event.request_id() {
                        Some(id) if id == request_id => {
                            tracing::debug!(request_id, "Invocation drained");
                            return Ok(());
                        }
                        other => {
                            tracing::warn!(
                                awaited = request_id,
                                got = ?other,
                                "runtimeDone for a different request id, discarding"
                            );
                        }
                    },
                    _ => {}
                }
            }
        }
    }

    /// Stops the endpoint, letting in-flight requests finish within the
    /// configured grace period. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if serving did not stop within the grace period.
    pub async fn shutdown(&self) -> Result<(), ShutdownError> {
        self.shutdown.cancel();

        let task = self.serve_task.lock().await.take();
        if let Some(task) = task {
            if tokio::time::timeout(self.config.shutdown_grace, task)
                .await
                .is_err()
            {
                return Err(ShutdownError::GracePeriodExceeded);
            }
            tracing::info!("Telemetry listener stopped");
        }

        Ok(())
    }
}

/// Accepts a pushed batch.
///
/// The platform retries pushes it considers failed, so the response is 200
/// once the body has been read, decodable or not. Decode warnings go to
/// stderr; only `platform` events are subscribed, so extension output is not
/// re-ingested and cannot loop back through this handler.
async fn handle_telemetry(
    State(state): State<Arc<ListenerState>>,
    body: Bytes,
) -> impl IntoResponse {
    let events: Vec<TelemetryEvent> = match serde_json::from_slice(&body) {
        Ok(events) => events,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to decode telemetry batch, dropping");
            return StatusCode::OK;
        }
    };

    tracing::debug!(count = events.len(), "Received telemetry events");

    if let Some(sink) = &state.sink {
        sink.submit(events.clone());
    }

    for event in events {
        if state.queue_tx.send(event).is_err() {
            // Consumer dropped mid-shutdown; the push is still acknowledged.
            break;
        }
    }

    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn event(kind: &str, request_id: &str) -> TelemetryEvent {
        TelemetryEvent {
            time: "2022-10-12T00:00:00.000Z".to_string(),
            kind: kind.to_string(),
            record: json!({ "requestId": request_id, "status": "success" }),
        }
    }

    fn test_listener() -> TelemetryListener {
        TelemetryListener::new(ListenerConfig::default(), None)
    }

    #[test]
    fn test_decode_platform_batch() {
        let json = r#"[
            {
                "time": "2022-10-12T00:03:50.000Z",
                "type": "platform.start",
                "record": {"requestId": "6f7f0961", "version": "$LATEST"}
            },
            {
                "time": "2022-10-12T00:03:50.930Z",
                "type": "platform.runtimeDone",
                "record": {"requestId": "6f7f0961", "status": "success"}
            }
        ]"#;

        let events: Vec<TelemetryEvent> = serde_json::from_str(json).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, "platform.start");
        assert_eq!(events[1].kind, PLATFORM_RUNTIME_DONE);
        assert_eq!(events[1].request_id(), Some("6f7f0961"));
    }

    #[test]
    fn test_request_id_absent() {
        let event = TelemetryEvent {
            time: "2022-10-12T00:00:00.000Z".to_string(),
            kind: "platform.logsDropped".to_string(),
            record: json!({ "droppedRecords": 5 }),
        };
        assert!(event.request_id().is_none());
    }

    #[test]
    fn test_uri_selection() {
        let sandbox = TelemetryListener::new(ListenerConfig::default(), None);
        assert_eq!(sandbox.uri(), "http://sandbox.localdomain:4323");

        let local = TelemetryListener::new(
            ListenerConfig {
                local_mode: true,
                ..ListenerConfig::default()
            },
            None,
        );
        assert_eq!(local.uri(), "http://127.0.0.1:4323");
    }

    #[tokio::test]
    async fn test_wait_for_drain_matches_request_id() {
        let listener = test_listener();
        let cancel = CancellationToken::new();

        listener
            .state
            .queue_tx
            .send(event("platform.start", "abc"))
            .unwrap();
        listener
            .state
            .queue_tx
            .send(event(PLATFORM_RUNTIME_DONE, "abc"))
            .unwrap();

        listener.wait_for_drain(&cancel, "abc").await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_drain_skips_other_request_ids() {
        let listener = test_listener();
        let cancel = CancellationToken::new();

        listener
            .state
            .queue_tx
            .send(event(PLATFORM_RUNTIME_DONE, "other"))
            .unwrap();
        listener
            .state
            .queue_tx
            .send(event(PLATFORM_RUNTIME_DONE, "abc"))
            .unwrap();

        listener.wait_for_drain(&cancel, "abc").await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_drain_skips_logs_dropped() {
        let listener = test_listener();
        let cancel = CancellationToken::new();

        listener
            .state
            .queue_tx
            .send(TelemetryEvent {
                time: "2022-10-12T00:00:00.000Z".to_string(),
                kind: PLATFORM_LOGS_DROPPED.to_string(),
                record: json!({ "droppedRecords": 3 }),
            })
            .unwrap();
        listener
            .state
            .queue_tx
            .send(event(PLATFORM_RUNTIME_DONE, "abc"))
            .unwrap();

        listener.wait_for_drain(&cancel, "abc").await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_drain_cancellation() {
        let listener = test_listener();
        let cancel = CancellationToken::new();

        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel_clone.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            listener.wait_for_drain(&cancel, "never-arrives"),
        )
        .await
        .expect("wait did not return after cancellation");

        assert!(matches!(result, Err(DrainError::Cancelled)));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let listener = test_listener();
        listener.shutdown().await.unwrap();
        listener.shutdown().await.unwrap();
    }
}
