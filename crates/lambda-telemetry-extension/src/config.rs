//! Configuration loading and management.
//!
//! This module provides layered configuration for the extension using figment.
//! Configuration is loaded from (in order of priority):
//! 1. Default values (compiled in)
//! 2. Config file: `/var/task/telemetry-extension.toml` (optional)
//! 3. Platform-provided environment variables (`AWS_*`)
//! 4. Extension-specific environment variables (`LAMBDA_TELEMETRY_*`)
//!
//! The platform variables are read once here; no other module consults the
//! process environment.
//!
//! | Variable | Config Path | Description |
//! |----------|-------------|-------------|
//! | `AWS_LAMBDA_RUNTIME_API` | `runtime_api` | Control-plane host:port |
//! | `AWS_SAM_LOCAL` | `listener.local_mode` | Running under a local emulator |

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "/var/task/telemetry-extension.toml";
const ENV_PREFIX: &str = "LAMBDA_TELEMETRY_";

/// Main configuration struct for the extension.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Control-plane host:port, normally supplied by the platform via
    /// `AWS_LAMBDA_RUNTIME_API`.
    pub runtime_api: Option<String>,
    /// Extension identity configuration.
    pub extension: ExtensionConfig,
    /// Telemetry listener configuration.
    pub listener: ListenerConfig,
    /// Telemetry API subscription buffering.
    pub subscription: SubscriptionConfig,
    /// Drain behaviour configuration.
    pub drain: DrainConfig,
    /// Forwarder pipeline configuration.
    pub forwarder: ForwarderConfig,
}

impl Config {
    /// Loads configuration from all sources.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration parsing fails.
    #[allow(clippy::result_large_err)]
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from_path(DEFAULT_CONFIG_PATH)
    }

    /// Loads configuration from a custom config file path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration parsing fails.
    #[allow(clippy::result_large_err)]
    pub fn load_from_path<P: AsRef<Path>>(config_path: P) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));

        if config_path.as_ref().exists() {
            figment = figment.merge(Toml::file(config_path));
        }

        figment = figment.merge(platform_env());
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("_"));

        figment.extract()
    }
}

/// Extension identity configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtensionConfig {
    /// Name used to register with the Extensions API. When unset, the
    /// executable's file name is used — the platform requires the registered
    /// name to match the file deployed in the layer.
    pub name: Option<String>,
}

impl ExtensionConfig {
    /// Returns the effective extension name.
    pub fn resolved_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }

        std::env::current_exe()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string())
    }
}

/// Telemetry listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Port the listener binds on.
    pub port: u16,
    /// Whether the process runs under a local emulator rather than the real
    /// sandbox. Selects the URI advertised to the Telemetry API.
    pub local_mode: bool,
    /// Grace period for in-flight requests on shutdown, in milliseconds.
    #[serde(with = "duration_ms")]
    pub shutdown_grace: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            port: 4323,
            local_mode: false,
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

/// Buffering policy sent with the Telemetry API subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    /// Maximum number of events buffered platform-side before a push.
    pub max_items: u32,
    /// Maximum buffered bytes platform-side before a push.
    pub max_bytes: u32,
    /// Maximum buffering time platform-side before a push, in milliseconds.
    pub timeout_ms: u32,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            max_items: 1000,
            max_bytes: 256 * 1024,
            timeout_ms: 100,
        }
    }
}

/// Drain behaviour configuration.
///
/// The polling fields apply only to the degraded strategy used when the
/// Telemetry API is unavailable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DrainConfig {
    /// How long to wait for the pipeline to signal submitted work before
    /// polling its active-work gauge, in milliseconds.
    #[serde(with = "duration_ms")]
    pub activity_timeout: Duration,
    /// Interval between active-work polls, in milliseconds.
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            activity_timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// Forwarder pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwarderConfig {
    /// Endpoint telemetry batches are forwarded to. When unset, batches are
    /// dropped after being counted.
    pub endpoint: Option<String>,
    /// Request timeout in milliseconds.
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    /// Capacity of the pending-batch queue.
    pub queue_size: usize,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout: Duration::from_millis(500),
            queue_size: 256,
        }
    }
}

/// Partial config for platform-provided env var overrides.
#[derive(Debug, Default, Serialize)]
struct PartialConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    runtime_api: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    listener: Option<PartialListenerConfig>,
}

#[derive(Debug, Serialize)]
struct PartialListenerConfig {
    local_mode: bool,
}

fn platform_env() -> Serialized<PartialConfig> {
    let mut config = PartialConfig::default();

    if let Ok(api) = std::env::var("AWS_LAMBDA_RUNTIME_API") {
        config.runtime_api = Some(api);
    }

    if let Ok(local) = std::env::var("AWS_SAM_LOCAL") {
        if local == "true" {
            config.listener = Some(PartialListenerConfig { local_mode: true });
        }
    }

    Serialized::defaults(config)
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
