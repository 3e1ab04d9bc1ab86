//! Endpoint configuration file schema.

use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{duration::parse_duration, error::Result};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConveyorConfig {
    pub endpoint: EndpointConfig,
    pub recoverability: RecoverabilityConfig,
    pub pipeline: PipelineConfig,
    pub routing: RoutingConfig,
    pub metrics: MetricsConfig,
}

/// Endpoint identity and receive loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Logical endpoint name; also the shared receive queue.
    pub name: String,
    /// Distinguishes this instance when the endpoint is scaled out.
    pub instance_discriminator: Option<String>,
    /// A send-only endpoint never receives messages.
    pub send_only: bool,
    /// Reply-to address written on outgoing messages instead of the
    /// endpoint's own queue.
    pub public_return_address: Option<String>,
    /// Messages processed concurrently.
    pub concurrency: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            name: "conveyor".into(),
            instance_discriminator: None,
            send_only: false,
            public_return_address: None,
            concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverabilityConfig {
    pub immediate_retries: u32,
    pub delayed_retries: u32,
    /// Delay added per delayed retry, e.g. `"10s"`.
    pub time_increase: String,
    pub error_queue: String,
}

impl Default for RecoverabilityConfig {
    fn default() -> Self {
        Self {
            immediate_retries: 5,
            delayed_retries: 3,
            time_increase: "10s".into(),
            error_queue: "error".into(),
        }
    }
}

impl RecoverabilityConfig {
    pub fn time_increase(&self) -> Result<Duration> {
        parse_duration(&self.time_increase)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Fail instead of overwrite when a context extension is set twice.
    pub strict_extensions: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionModeConfig {
    #[default]
    Native,
    MessageDriven,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Message type -> destination endpoint.
    pub routes: HashMap<String, String>,
    /// Event type -> publishing endpoint, for message-driven subscriptions.
    pub publishers: HashMap<String, String>,
    pub subscription_mode: SubscriptionModeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    /// Labels added to every metric.
    pub labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            labels: HashMap::new(),
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config: ConveyorConfig = toml::from_str("").unwrap();
        assert_eq!(config.endpoint.name, "conveyor");
        assert_eq!(config.endpoint.concurrency, 4);
        assert_eq!(config.recoverability.immediate_retries, 5);
        assert_eq!(
            config.recoverability.time_increase().unwrap(),
            Duration::from_secs(10)
        );
        assert_eq!(config.routing.subscription_mode, SubscriptionModeConfig::Native);
    }

    #[test]
    fn parses_every_section() {
        let config: ConveyorConfig = toml::from_str(
            r#"
            [endpoint]
            name = "Sales"
            instance_discriminator = "blue"
            concurrency = 8

            [recoverability]
            immediate_retries = 2
            delayed_retries = 1
            time_increase = "500ms"
            error_queue = "sales-errors"

            [pipeline]
            strict_extensions = true

            [routing]
            subscription_mode = "message_driven"

            [routing.routes]
            PlaceOrder = "Sales"

            [routing.publishers]
            OrderPlaced = "Sales"

            [metrics]
            enabled = false
            "#,
        )
        .unwrap();

        assert_eq!(config.endpoint.instance_discriminator.as_deref(), Some("blue"));
        assert_eq!(
            config.recoverability.time_increase().unwrap(),
            Duration::from_millis(500)
        );
        assert!(config.pipeline.strict_extensions);
        assert_eq!(config.routing.routes["PlaceOrder"], "Sales");
        assert_eq!(
            config.routing.subscription_mode,
            SubscriptionModeConfig::MessageDriven
        );
        assert!(!config.metrics.enabled);
    }
}
