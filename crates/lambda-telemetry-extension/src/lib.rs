//! AWS Lambda extension guaranteeing telemetry hand-off before the sandbox
//! freezes.
//!
//! The extension registers with the Extensions API, subscribes to the
//! Telemetry API, and after every invocation blocks the event loop until the
//! platform's `platform.runtimeDone` event for that invocation has been
//! received. Where the Telemetry API is unavailable (local emulators), it
//! falls back to polling the processing pipeline's activity instead.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod collector;
pub mod config;
pub mod error;
pub mod extension_api;
pub mod listener;
pub mod pipeline;
pub mod runtime;
pub mod telemetry_api;

pub use collector::{CollectorEngine, CollectorHandle, ForwardError};
pub use config::{
    Config, DrainConfig, ExtensionConfig, ForwarderConfig, ListenerConfig, SubscriptionConfig,
};
pub use error::{ExtensionError, Result};
pub use extension_api::{
    ApiError, EventType, ExtensionApiClient, NextEventResponse, RegisterResponse,
};
pub use listener::{
    DrainError, PLATFORM_LOGS_DROPPED, PLATFORM_RUNTIME_DONE, ShutdownError, TelemetryEvent,
    TelemetryListener,
};
pub use pipeline::{
    ActivityTracker, EngineError, PipelineEngine, PipelineError, PipelineHost, TelemetrySink,
    WorkGuard,
};
pub use runtime::{DrainMode, ExtensionRuntime, RuntimeError};
pub use telemetry_api::{
    BufferingConfig, DestinationConfig, SubscribeOutcome, TelemetryApiClient,
    TelemetrySubscription, TelemetryType,
};
