//! Extension runtime orchestrator.
//!
//! Sequences the extension lifecycle against the platform:
//! register, start the telemetry listener, subscribe, start the pipeline,
//! then loop between waiting for the next lifecycle event and waiting for
//! the invocation's telemetry to drain, until a SHUTDOWN event or a process
//! signal drives the shutdown sequence.
//!
//! The loop itself is sequential; concurrency lives in the listener's serve
//! task and the pipeline's run task. Everything that blocks honours the
//! shared cancellation token.

use crate::collector::{CollectorEngine, ForwardError};
use crate::config::Config;
use crate::extension_api::{ApiError, EventType, ExtensionApiClient};
use crate::listener::TelemetryListener;
use crate::pipeline::{PipelineEngine, PipelineError, PipelineHost, TelemetrySink};
use crate::telemetry_api::{BufferingConfig, SubscribeOutcome, TelemetryApiClient};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// How invocation drain is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainMode {
    /// Correlate pushed telemetry with the invocation's request id.
    Telemetry,
    /// Telemetry API unavailable: poll the pipeline's activity gauge.
    Polling,
}

/// Errors from the extension runtime.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// No control-plane address was configured.
    #[error("control-plane address missing: AWS_LAMBDA_RUNTIME_API is not set")]
    MissingRuntimeApi,

    /// Registration with the Extensions API failed.
    #[error("failed to register with the Extensions API")]
    Register(#[source] ApiError),

    /// The telemetry listener could not be started.
    #[error("failed to start the telemetry listener")]
    ListenerStart(#[source] std::io::Error),

    /// The Telemetry API subscription failed hard.
    #[error("failed to subscribe to the Telemetry API")]
    Subscribe(#[source] ApiError),

    /// The pipeline engine could not be created.
    #[error("failed to create the pipeline engine")]
    EngineInit(#[source] ForwardError),

    /// The pipeline could not be started.
    #[error("failed to start the pipeline")]
    PipelineStart(#[source] PipelineError),
}

impl RuntimeError {
    /// Error type reported to the platform's error endpoints.
    fn error_type(&self) -> &'static str {
        match self {
            RuntimeError::MissingRuntimeApi => "Extension.NoRuntimeApi",
            RuntimeError::Register(_) => "Extension.RegisterFailed",
            RuntimeError::ListenerStart(_) => "Extension.ListenerStartFailed",
            RuntimeError::Subscribe(_) => "Extension.SubscribeFailed",
            RuntimeError::EngineInit(_) => "Extension.PipelineInitFailed",
            RuntimeError::PipelineStart(_) => "Extension.PipelineStartFailed",
        }
    }
}

/// Extension runtime that orchestrates all components.
pub struct ExtensionRuntime {
    config: Config,
    cancel: CancellationToken,
    engine: Option<EngineParts>,
}

struct EngineParts {
    engine: Arc<dyn PipelineEngine>,
    sink: Option<Arc<dyn TelemetrySink>>,
}

impl ExtensionRuntime {
    /// Creates a runtime with the given configuration, hosting the built-in
    /// forwarding engine.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
            engine: None,
        }
    }

    /// Replaces the hosted engine, and optionally the sink the listener
    /// feeds decoded batches to.
    pub fn with_engine(
        mut self,
        engine: Arc<dyn PipelineEngine>,
        sink: Option<Arc<dyn TelemetrySink>>,
    ) -> Self {
        self.engine = Some(EngineParts { engine, sink });
        self
    }

    /// Returns a handle to the shared cancellation token. Cancelling it
    /// aborts any in-flight wait and drives the runtime to shutdown.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs the extension to completion.
    ///
    /// # Errors
    ///
    /// Returns an error if any startup step fails. Startup failures after
    /// registration are also reported to the platform via `/init/error`
    /// before returning.
    pub async fn run(self) -> Result<(), RuntimeError> {
        let runtime_api = self
            .config
            .runtime_api
            .clone()
            .ok_or(RuntimeError::MissingRuntimeApi)?;

        let extension_api = ExtensionApiClient::new(&runtime_api);
        let extension_name = self.config.extension.resolved_name();

        // No identifier exists until registration succeeds, so there is
        // nowhere to report a registration failure.
        let registration = extension_api
            .register(&extension_name)
            .await
            .map_err(RuntimeError::Register)?;

        let (listener, host, drain_mode) = match self
            .start_components(&runtime_api, &registration.extension_id)
            .await
        {
            Ok(parts) => parts,
            Err(e) => {
                if let Err(report_err) = extension_api.init_error(e.error_type()).await {
                    tracing::warn!(error = %report_err, "Failed to report init error");
                }
                return Err(e);
            }
        };

        tracing::info!(?drain_mode, "Extension ready");
        self.event_loop(&extension_api, &listener, &host, drain_mode)
            .await;

        // Shutdown sequence: both steps always run; errors are collected and
        // reported once.
        let mut failures = Vec::new();

        if let Err(e) = listener.shutdown().await {
            tracing::error!(error = %e, "Failed to stop the telemetry listener");
            failures.push("Extension.ListenerStopFailed");
        }

        if let Err(e) = host.stop().await {
            tracing::error!(error = %e, "Failed to stop the pipeline");
            failures.push("Extension.PipelineStopFailed");
        }

        if let Some(error_type) = failures.first() {
            if let Err(report_err) = extension_api.exit_error(error_type).await {
                tracing::warn!(error = %report_err, "Failed to report exit error");
            }
        }

        tracing::info!("Extension stopped");
        Ok(())
    }

    async fn start_components(
        &self,
        runtime_api: &str,
        extension_id: &str,
    ) -> Result<(TelemetryListener, PipelineHost, DrainMode), RuntimeError> {
        let (engine, sink) = match &self.engine {
            Some(parts) => (Arc::clone(&parts.engine), parts.sink.clone()),
            None => {
                let (engine, handle) = CollectorEngine::new(self.config.forwarder.clone())
                    .map_err(RuntimeError::EngineInit)?;
                (
                    engine as Arc<dyn PipelineEngine>,
                    Some(Arc::new(handle) as Arc<dyn TelemetrySink>),
                )
            }
        };

        // The listener must be accepting connections before the subscription
        // names it as a destination.
        let listener = TelemetryListener::new(self.config.listener.clone(), sink);
        let listener_uri = listener
            .start()
            .await
            .map_err(RuntimeError::ListenerStart)?;

        let telemetry_api = TelemetryApiClient::new(runtime_api);
        let outcome = telemetry_api
            .subscribe(
                extension_id,
                &listener_uri,
                BufferingConfig::from(&self.config.subscription),
            )
            .await
            .map_err(RuntimeError::Subscribe)?;

        let drain_mode = match outcome {
            SubscribeOutcome::Subscribed(_) => DrainMode::Telemetry,
            SubscribeOutcome::Unsupported => DrainMode::Polling,
        };

        let host = PipelineHost::new(engine);
        host.start().await.map_err(RuntimeError::PipelineStart)?;

        Ok((listener, host, drain_mode))
    }

    async fn event_loop(
        &self,
        extension_api: &ExtensionApiClient,
        listener: &TelemetryListener,
        host: &PipelineHost,
        drain_mode: DrainMode,
    ) {
        loop {
            if self.cancel.is_cancelled() {
                tracing::info!("Cancellation requested, shutting down");
                return;
            }

            let event = match extension_api.next_event(&self.cancel).await {
                Ok(event) => event,
                Err(ApiError::Cancelled) => {
                    tracing::info!("Event wait cancelled, shutting down");
                    return;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed waiting for the next event");
                    if let Err(report_err) =
                        extension_api.exit_error("Extension.EventWaitFailed").await
                    {
                        tracing::warn!(error = %report_err, "Failed to report exit error");
                    }
                    return;
                }
            };

            match event.event_type {
                EventType::Invoke => {
                    tracing::debug!(request_id = %event.request_id, "Invocation started");

                    // Drain is best-effort: an error here must not take the
                    // event loop down with it.
                    let drained = match drain_mode {
                        DrainMode::Telemetry => {
                            listener.wait_for_drain(&self.cancel, &event.request_id).await
                        }
                        DrainMode::Polling => {
                            host.wait_for_idle(&self.cancel, &self.config.drain).await
                        }
                    };

                    if let Err(e) = drained {
                        tracing::warn!(
                            request_id = %event.request_id,
                            error = %e,
                            "Invocation drain did not complete"
                        );
                    }
                }
                EventType::Shutdown => {
                    tracing::info!("Shutdown event received");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_runtime_api_is_fatal() {
        let runtime = ExtensionRuntime::new(Config::default());
        let err = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(runtime.run())
            .unwrap_err();

        assert!(matches!(err, RuntimeError::MissingRuntimeApi));
    }

    #[test]
    fn test_error_types_are_stable() {
        assert_eq!(
            RuntimeError::MissingRuntimeApi.error_type(),
            "Extension.NoRuntimeApi"
        );
        assert_eq!(
            RuntimeError::Register(ApiError::Cancelled).error_type(),
            "Extension.RegisterFailed"
        );
    }

    #[test]
    fn test_cancellation_token_is_shared() {
        let runtime = ExtensionRuntime::new(Config::default());
        let token = runtime.cancellation_token();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(runtime.cancel.is_cancelled());
    }
}
