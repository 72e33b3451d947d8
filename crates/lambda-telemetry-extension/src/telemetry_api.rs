//! Telemetry API subscription client.
//!
//! A subscription is a single PUT telling the platform where to push
//! telemetry and under what buffering policy. It is sent exactly once, after
//! the listener is bound and accepting connections — the platform starts
//! pushing as soon as the subscription is acknowledged.

use crate::config::SubscriptionConfig;
use crate::extension_api::ApiError;
use serde::{Deserialize, Serialize};

const SCHEMA_VERSION: &str = "2022-07-01";

const EXTENSION_IDENTIFIER_HEADER: &str = "Lambda-Extension-Identifier";

/// Telemetry streams that can be subscribed to.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryType {
    /// Platform lifecycle events (start, runtimeDone, report, logsDropped).
    Platform,
    /// Function logs from stdout/stderr.
    Function,
    /// Extension logs.
    Extension,
}

/// Buffering policy for the subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferingConfig {
    /// Maximum number of events to buffer before a push.
    pub max_items: u32,
    /// Maximum size in bytes to buffer before a push.
    pub max_bytes: u32,
    /// Maximum time in milliseconds to buffer before a push.
    pub timeout_ms: u32,
}

impl From<&SubscriptionConfig> for BufferingConfig {
    fn from(config: &SubscriptionConfig) -> Self {
        Self {
            max_items: config.max_items,
            max_bytes: config.max_bytes,
            timeout_ms: config.timeout_ms,
        }
    }
}

/// Destination the platform pushes telemetry to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationConfig {
    /// Transport protocol; only HTTP is supported.
    pub protocol: String,
    /// HTTP method used for pushes.
    pub method: String,
    /// Payload encoding.
    pub encoding: String,
    /// URI of the listener endpoint.
    #[serde(rename = "URI")]
    pub uri: String,
}

/// Subscription request sent to the Telemetry API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySubscription {
    /// Schema version.
    pub schema_version: String,
    /// Telemetry streams to receive.
    pub types: Vec<TelemetryType>,
    /// Buffering policy.
    pub buffering: BufferingConfig,
    /// Push destination.
    pub destination: DestinationConfig,
}

impl TelemetrySubscription {
    /// Creates a subscription for platform events pushed to `listener_uri`.
    pub fn platform_events(listener_uri: impl Into<String>, buffering: BufferingConfig) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            types: vec![TelemetryType::Platform],
            buffering,
            destination: DestinationConfig {
                protocol: "HTTP".to_string(),
                method: "POST".to_string(),
                encoding: "JSON".to_string(),
                uri: listener_uri.into(),
            },
        }
    }
}

/// Outcome of a subscription request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// The platform accepted the subscription and will push telemetry.
    Subscribed(String),
    /// The platform answered 202: the Telemetry API is not available in this
    /// execution environment (typically a local emulator). Not an error —
    /// callers fall back to the degraded drain strategy.
    Unsupported,
}

/// Client for the Telemetry API subscription endpoint.
pub struct TelemetryApiClient {
    base_url: String,
    client: reqwest::Client,
}

impl TelemetryApiClient {
    /// Creates a client for the Telemetry API at `runtime_api` (host:port).
    pub fn new(runtime_api: &str) -> Self {
        Self {
            base_url: format!("http://{}/{}/telemetry", runtime_api, SCHEMA_VERSION),
            client: reqwest::Client::new(),
        }
    }

    /// Sends the subscription request.
    ///
    /// # Errors
    ///
    /// Fails on transport errors or any status other than 200 and 202.
    pub async fn subscribe(
        &self,
        extension_id: &str,
        listener_uri: &str,
        buffering: BufferingConfig,
    ) -> Result<SubscribeOutcome, ApiError> {
        let subscription = TelemetrySubscription::platform_events(listener_uri, buffering);

        let response = self
            .client
            .put(&self.base_url)
            .header(EXTENSION_IDENTIFIER_HEADER, extension_id)
            .json(&subscription)
            .send()
            .await?;

        match response.status().as_u16() {
            200 => {
                let body = response.text().await.unwrap_or_default();
                tracing::info!(uri = %subscription.destination.uri, "Subscribed to Telemetry API");
                Ok(SubscribeOutcome::Subscribed(body))
            }
            202 => {
                tracing::warn!(
                    "Telemetry API not available in this environment, falling back to polling drain"
                );
                Ok(SubscribeOutcome::Unsupported)
            }
            status => Err(ApiError::Status {
                status,
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffering() -> BufferingConfig {
        BufferingConfig::from(&SubscriptionConfig::default())
    }

    #[test]
    fn test_subscription_wire_format() {
        let sub = TelemetrySubscription::platform_events("http://sandbox.localdomain:4323", buffering());
        let json = serde_json::to_value(&sub).unwrap();

        assert_eq!(json["schemaVersion"], "2022-07-01");
        assert_eq!(json["types"], serde_json::json!(["platform"]));
        assert_eq!(json["buffering"]["maxItems"], 1000);
        assert_eq!(json["buffering"]["maxBytes"], 262144);
        assert_eq!(json["buffering"]["timeoutMs"], 100);
        assert_eq!(json["destination"]["protocol"], "HTTP");
        assert_eq!(json["destination"]["method"], "POST");
        assert_eq!(json["destination"]["encoding"], "JSON");
        assert_eq!(json["destination"]["URI"], "http://sandbox.localdomain:4323");
    }

    #[test]
    fn test_base_url() {
        let client = TelemetryApiClient::new("127.0.0.1:9001");
        assert_eq!(client.base_url, "http://127.0.0.1:9001/2022-07-01/telemetry");
    }

    #[test]
    fn test_buffering_from_config() {
        let config = SubscriptionConfig {
            max_items: 500,
            max_bytes: 1024,
            timeout_ms: 25,
        };
        let buffering = BufferingConfig::from(&config);
        assert_eq!(buffering.max_items, 500);
        assert_eq!(buffering.max_bytes, 1024);
        assert_eq!(buffering.timeout_ms, 25);
    }
}
