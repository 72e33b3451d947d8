//! Extensions API client.
//!
//! This module speaks the Lambda Extensions API: registration, the long-poll
//! for lifecycle events, and the init/exit error reports. The client owns its
//! HTTP transport; nothing here retries — a control-plane failure is the
//! caller's problem and, during startup, fatal to the process.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;

const SCHEMA_VERSION: &str = "2020-01-01";

const EXTENSION_NAME_HEADER: &str = "Lambda-Extension-Name";
const EXTENSION_IDENTIFIER_HEADER: &str = "Lambda-Extension-Identifier";
const EXTENSION_ERROR_TYPE_HEADER: &str = "Lambda-Extension-Function-Error-Type";

/// Lifecycle event kinds delivered by `/event/next`.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// A function invocation is starting.
    Invoke,
    /// The execution environment is about to be terminated.
    Shutdown,
}

/// Response body of `/register`, plus the identifier assigned by the platform.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    /// Name of the hosted function.
    pub function_name: String,
    /// Version of the hosted function.
    pub function_version: String,
    /// Handler of the hosted function.
    pub handler: String,
    /// Identifier assigned on registration, captured from the
    /// `Lambda-Extension-Identifier` response header.
    #[serde(skip)]
    pub extension_id: String,
}

/// Response body of `/event/next`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextEventResponse {
    /// Kind of event.
    pub event_type: EventType,
    /// Function deadline as milliseconds since epoch.
    #[serde(default)]
    pub deadline_ms: i64,
    /// Request id of the invocation. Empty for SHUTDOWN events.
    #[serde(default)]
    pub request_id: String,
    /// ARN of the invoked function.
    #[serde(default)]
    pub invoked_function_arn: String,
    /// Tracing metadata for the invocation.
    #[serde(default)]
    pub tracing: Option<TracingInfo>,
}

/// Tracing metadata attached to an INVOKE event.
#[derive(Debug, Clone, Deserialize)]
pub struct TracingInfo {
    /// Trace header type.
    #[serde(rename = "type", default)]
    pub trace_type: Option<String>,
    /// Trace header value.
    #[serde(default)]
    pub value: Option<String>,
}

/// Response body of `/init/error` and `/exit/error`.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusResponse {
    /// Acknowledgement status.
    pub status: String,
}

/// Error from Extensions API operations.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Connection-level failure.
    #[error("HTTP request failed")]
    Http(#[from] reqwest::Error),

    /// The control plane returned a non-200 status.
    #[error("request failed with status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },

    /// The registration response carried no identifier header.
    #[error("registration response missing {EXTENSION_IDENTIFIER_HEADER} header")]
    MissingIdentifier,

    /// The operation was cancelled before a response arrived.
    #[error("operation cancelled")]
    Cancelled,
}

/// Client for the Lambda Extensions API.
///
/// Construct one per process with [`ExtensionApiClient::new`] and call
/// [`register`](Self::register) before anything else; the identifier captured
/// there is attached to every subsequent call.
pub struct ExtensionApiClient {
    base_url: String,
    client: reqwest::Client,
    extension_id: std::sync::OnceLock<String>,
}

impl ExtensionApiClient {
    /// Creates a client for the control plane at `runtime_api` (host:port).
    pub fn new(runtime_api: &str) -> Self {
        Self {
            base_url: format!("http://{}/{}/extension", runtime_api, SCHEMA_VERSION),
            client: reqwest::Client::new(),
            extension_id: std::sync::OnceLock::new(),
        }
    }

    /// Returns the identifier captured at registration, if any.
    pub fn extension_id(&self) -> Option<&str> {
        self.extension_id.get().map(String::as_str)
    }

    /// Registers the extension for INVOKE and SHUTDOWN events.
    ///
    /// # Errors
    ///
    /// Fails on transport errors, non-200 responses, or a response without
    /// the identifier header.
    pub async fn register(&self, extension_name: &str) -> Result<RegisterResponse, ApiError> {
        let url = format!("{}/register", self.base_url);

        let response = self
            .client
            .post(&url)
            .header(EXTENSION_NAME_HEADER, extension_name)
            .json(&json!({ "events": [EventType::Invoke, EventType::Shutdown] }))
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() != 200 {
            return Err(ApiError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let extension_id = response
            .headers()
            .get(EXTENSION_IDENTIFIER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or(ApiError::MissingIdentifier)?;

        let mut body: RegisterResponse = response.json().await?;
        body.extension_id = extension_id.clone();
        let _ = self.extension_id.set(extension_id);

        tracing::info!(
            function = %body.function_name,
            version = %body.function_version,
            "Registered with Extensions API"
        );

        Ok(body)
    }

    /// Long-polls for the next lifecycle event.
    ///
    /// Blocks until the platform has an event. Cancelling `cancel` aborts the
    /// in-flight request (the connection is dropped, not merely the local
    /// wait) and returns [`ApiError::Cancelled`].
    pub async fn next_event(&self, cancel: &CancellationToken) -> Result<NextEventResponse, ApiError> {
        let url = format!("{}/event/next", self.base_url);

        let request = self
            .client
            .get(&url)
            .header(EXTENSION_IDENTIFIER_HEADER, self.current_id())
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ApiError::Cancelled),
            response = request => response?,
        };

        let status = response.status();
        if status.as_u16() != 200 {
            return Err(ApiError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        Ok(response.json().await?)
    }

    /// Reports an initialization failure to the platform.
    ///
    /// Best-effort: callers log the returned error and move on; this is never
    /// retried and never escalated.
    pub async fn init_error(&self, error_type: &str) -> Result<StatusResponse, ApiError> {
        self.report_error("init/error", error_type).await
    }

    /// Reports a failure encountered after initialization, before exiting.
    pub async fn exit_error(&self, error_type: &str) -> Result<StatusResponse, ApiError> {
        self.report_error("exit/error", error_type).await
    }

    async fn report_error(&self, action: &str, error_type: &str) -> Result<StatusResponse, ApiError> {
        let url = format!("{}/{}", self.base_url, action);

        let response = self
            .client
            .post(&url)
            .header(EXTENSION_IDENTIFIER_HEADER, self.current_id())
            .header(EXTENSION_ERROR_TYPE_HEADER, error_type)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() != 200 {
            return Err(ApiError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        Ok(response.json().await?)
    }

    fn current_id(&self) -> &str {
        self.extension_id.get().map(String::as_str).unwrap_or("")
    }
}
