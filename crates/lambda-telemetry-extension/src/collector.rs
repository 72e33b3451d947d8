//! Telemetry forwarding engine.
//!
//! A deliberately small [`PipelineEngine`] implementation: batches handed to
//! the [`CollectorHandle`] are queued and forwarded as JSON to a configured
//! HTTP endpoint. Each queued batch counts as one unit of work from
//! submission until the forward attempt finishes, which is what the degraded
//! drain strategy observes.
//!
//! Forwarding is single-attempt: a failed batch is logged and dropped. The
//! platform's own buffering, not this engine, is the delivery guarantee for
//! telemetry still in flight at shutdown.

use crate::config::ForwarderConfig;
use crate::listener::TelemetryEvent;
use crate::pipeline::{ActivityTracker, EngineError, PipelineEngine, TelemetrySink, WorkGuard};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Error from a forward attempt.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    /// HTTP request failed.
    #[error("HTTP request failed")]
    Http(#[from] reqwest::Error),

    /// The endpoint returned an error status.
    #[error("endpoint returned {status}: {body}")]
    Status {
        /// HTTP status code returned by the endpoint.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },
}

struct Submission {
    events: Vec<TelemetryEvent>,
    _guard: WorkGuard,
}

/// Cloneable handle used to submit batches into the engine.
#[derive(Clone)]
pub struct CollectorHandle {
    batch_tx: mpsc::Sender<Submission>,
    activity: ActivityTracker,
}

impl TelemetrySink for CollectorHandle {
    fn submit(&self, events: Vec<TelemetryEvent>) {
        let submission = Submission {
            events,
            _guard: self.activity.begin(),
        };

        if let Err(e) = self.batch_tx.try_send(submission) {
            tracing::warn!(error = %e, "Collector queue rejected batch");
        }
    }
}

/// Engine forwarding telemetry batches to an HTTP endpoint.
pub struct CollectorEngine {
    config: ForwarderConfig,
    client: reqwest::Client,
    activity: ActivityTracker,
    batch_rx: Mutex<Option<mpsc::Receiver<Submission>>>,
}

impl CollectorEngine {
    /// Creates the engine and the handle that feeds it.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(config: ForwarderConfig) -> Result<(Arc<Self>, CollectorHandle), ForwardError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(ForwardError::Http)?;

        let (batch_tx, batch_rx) = mpsc::channel(config.queue_size);
        let activity = ActivityTracker::new();

        let engine = Arc::new(Self {
            config,
            client,
            activity: activity.clone(),
            batch_rx: Mutex::new(Some(batch_rx)),
        });

        let handle = CollectorHandle { batch_tx, activity };

        Ok((engine, handle))
    }

    async fn forward(&self, events: &[TelemetryEvent]) {
        let Some(endpoint) = &self.config.endpoint else {
            tracing::debug!(count = events.len(), "No forwarder endpoint configured, dropping batch");
            return;
        };

        match self.try_forward(endpoint, events).await {
            Ok(()) => tracing::debug!(count = events.len(), "Forwarded telemetry batch"),
            Err(e) => tracing::warn!(error = %e, "Failed to forward telemetry batch"),
        }
    }

    async fn try_forward(
        &self,
        endpoint: &str,
        events: &[TelemetryEvent],
    ) -> Result<(), ForwardError> {
        let response = self.client.post(endpoint).json(events).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ForwardError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl PipelineEngine for CollectorEngine {
    async fn run(
        self: Arc<Self>,
        ready: watch::Sender<bool>,
        cancel: CancellationToken,
    ) -> Result<(), EngineError> {
        let mut batch_rx = self
            .batch_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| EngineError::msg("collector engine already ran"))?;

        let _ = ready.send(true);
        tracing::debug!("Collector engine running");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                submission = batch_rx.recv() => match submission {
                    Some(submission) => self.forward(&submission.events).await,
                    None => break,
                }
            }
        }

        // Hand off whatever was queued before the cancellation landed.
        while let Ok(submission) = batch_rx.try_recv() {
            self.forward(&submission.events).await;
        }

        Ok(())
    }

    fn activity(&self) -> ActivityTracker {
        self.activity.clone()
    }
}
