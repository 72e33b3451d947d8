//! Pipeline hosting.
//!
//! The telemetry-processing engine is opaque to the lifecycle coordinator:
//! it is started once, runs on its own task until cancelled, and is stopped
//! once. This module owns that lifecycle and exposes the activity gauge the
//! degraded drain strategy polls when the Telemetry API is unavailable.

use crate::config::DrainConfig;
use crate::listener::{DrainError, TelemetryEvent};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Error raised by a pipeline engine.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct EngineError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl EngineError {
    /// Creates an error from a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Creates an error wrapping a source error.
    pub fn new(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Sink for telemetry batches flowing into the pipeline.
///
/// Submission must not block: implementations enqueue or drop.
pub trait TelemetrySink: Send + Sync {
    /// Hands a decoded batch to the pipeline.
    fn submit(&self, events: Vec<TelemetryEvent>);
}

/// Tracks units of work in flight inside the engine.
///
/// Cloned trackers share state. [`ActivityTracker::begin`] returns a guard
/// that keeps the unit counted until dropped.
#[derive(Clone, Default)]
pub struct ActivityTracker {
    active: Arc<AtomicUsize>,
    submitted: Arc<Notify>,
}

impl ActivityTracker {
    /// Creates a tracker with no active work.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a unit of work; it stays active until the guard drops.
    pub fn begin(&self) -> WorkGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        self.submitted.notify_one();
        WorkGuard {
            active: Arc::clone(&self.active),
        }
    }

    /// Returns the number of active units of work.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Resolves once work has been submitted. A submission that happened
    /// while nobody was waiting leaves a stored permit, so this also
    /// resolves immediately after recent activity.
    pub async fn submitted(&self) {
        self.submitted.notified().await;
    }
}

/// RAII guard for one unit of work.
pub struct WorkGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A long-running telemetry-processing engine hosted by [`PipelineHost`].
#[async_trait]
pub trait PipelineEngine: Send + Sync + 'static {
    /// Runs the engine until `cancel` fires.
    ///
    /// Implementations must send `true` on `ready` once they are serving;
    /// the host blocks `start` on that signal.
    async fn run(
        self: Arc<Self>,
        ready: watch::Sender<bool>,
        cancel: CancellationToken,
    ) -> Result<(), EngineError>;

    /// Returns the tracker observing the engine's in-flight work.
    fn activity(&self) -> ActivityTracker;
}

/// Error from pipeline lifecycle operations.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The engine failed before reporting itself ready.
    #[error("pipeline failed to start")]
    Start(#[source] EngineError),

    /// The engine's run loop exited with an error.
    #[error("pipeline stopped with an error")]
    Stopped(#[source] EngineError),

    /// The engine task panicked.
    #[error("pipeline task panicked")]
    Panicked,
}

/// Owns the engine's lifecycle: start, await readiness, stop.
pub struct PipelineHost {
    engine: Arc<dyn PipelineEngine>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<Result<(), EngineError>>>>,
}

impl PipelineHost {
    /// Creates a host for the given engine.
    pub fn new(engine: Arc<dyn PipelineEngine>) -> Self {
        Self {
            engine,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Spawns the engine and returns once it reports ready.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Start`] if the engine exits before becoming
    /// ready.
    pub async fn start(&self) -> Result<(), PipelineError> {
        let (ready_tx, mut ready_rx) = watch::channel(false);
        let task = tokio::spawn(
            Arc::clone(&self.engine).run(ready_tx, self.cancel.clone()),
        );

        loop {
            if ready_rx.changed().await.is_err() {
                // Sender dropped: the run future finished without readiness.
                let error = match task.await {
                    Ok(Ok(())) => EngineError::msg("engine exited before becoming ready"),
                    Ok(Err(e)) => e,
                    Err(e) => EngineError::new("engine task failed", e),
                };
                return Err(PipelineError::Start(error));
            }

            if *ready_rx.borrow() {
                break;
            }
        }

        *self.task.lock().await = Some(task);
        tracing::info!("Pipeline started");
        Ok(())
    }

    /// Initiates graceful shutdown and blocks until the run loop has fully
    /// exited. Idempotent: a second call is a no-op.
    ///
    /// # Errors
    ///
    /// Surfaces an error the engine raised after start, including
    /// asynchronous failures that occurred between `start` and `stop`.
    pub async fn stop(&self) -> Result<(), PipelineError> {
        self.cancel.cancel();

        let task = self.task.lock().await.take();
        match task {
            None => Ok(()),
            Some(task) => match task.await {
                Ok(Ok(())) => {
                    tracing::info!("Pipeline stopped");
                    Ok(())
                }
                Ok(Err(e)) => Err(PipelineError::Stopped(e)),
                Err(_) => Err(PipelineError::Panicked),
            },
        }
    }

    /// Degraded drain: approximates invocation drain by watching the
    /// engine's activity instead of correlating telemetry.
    ///
    /// Waits up to the configured activity timeout for work to be submitted
    /// (a short-lived invocation may submit nothing at all), then polls the
    /// active-work gauge until it reaches zero. There is no overall timeout.
    ///
    /// # Errors
    ///
    /// Returns [`DrainError::Cancelled`] promptly once `cancel` fires.
    pub async fn wait_for_idle(
        &self,
        cancel: &CancellationToken,
        config: &DrainConfig,
    ) -> Result<(), DrainError> {
        let activity = self.engine.activity();

        let _ = tokio::time::timeout(config.activity_timeout, activity.submitted()).await;

        loop {
            if activity.active() == 0 {
                return Ok(());
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(DrainError::Cancelled),
                _ = tokio::time::sleep(config.poll_interval) => {}
            }
        }
    }
}
