//! Metrics recorder initialization and configuration.

use {anyhow::Result, tracing::info};

/// Handle to the metrics system, providing access to exported metrics.
#[derive(Clone)]
pub struct MetricsHandle {
    #[cfg(feature = "prometheus")]
    prometheus_handle: metrics_exporter_prometheus::PrometheusHandle,
}

impl MetricsHandle {
    /// Render metrics in Prometheus text format.
    ///
    /// Returns an empty string when the `prometheus` feature is disabled.
    #[must_use]
    pub fn render(&self) -> String {
        #[cfg(feature = "prometheus")]
        {
            self.prometheus_handle.render()
        }
        #[cfg(not(feature = "prometheus"))]
        {
            String::new()
        }
    }
}

/// Configuration for the metrics system.
#[derive(Debug, Clone, Default)]
pub struct MetricsRecorderConfig {
    /// Whether metrics collection is enabled
    pub enabled: bool,
    /// Global labels to add to all metrics, e.g. the endpoint name
    pub global_labels: Vec<(String, String)>,
}

/// Initialize the metrics system.
///
/// Call once at process startup. When the `prometheus` feature is enabled
/// this installs the Prometheus recorder; otherwise the `metrics` facade
/// stays a no-op.
///
/// # Errors
///
/// Returns an error if the recorder cannot be installed.
pub fn init_metrics(config: MetricsRecorderConfig) -> Result<MetricsHandle> {
    if !config.enabled {
        info!("metrics collection is disabled");
        return Ok(MetricsHandle {
            #[cfg(feature = "prometheus")]
            prometheus_handle: init_prometheus_disabled()?,
        });
    }

    #[cfg(feature = "prometheus")]
    {
        let handle = init_prometheus(config)?;
        info!("prometheus metrics exporter initialized");
        Ok(MetricsHandle {
            prometheus_handle: handle,
        })
    }

    #[cfg(not(feature = "prometheus"))]
    {
        let _ = config;
        info!("metrics feature not enabled at compile time");
        Ok(MetricsHandle {})
    }
}

#[cfg(feature = "prometheus")]
fn init_prometheus(
    config: MetricsRecorderConfig,
) -> Result<metrics_exporter_prometheus::PrometheusHandle> {
    use {
        crate::buckets,
        metrics_exporter_prometheus::{Matcher, PrometheusBuilder},
    };

    let mut builder = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(crate::pipeline::EXECUTION_DURATION_SECONDS.to_string()),
            &buckets::PIPELINE_DURATION,
        )?
        .set_buckets_for_metric(
            Matcher::Full(crate::endpoint::PROCESSING_DURATION_SECONDS.to_string()),
            &buckets::PROCESSING_DURATION,
        )?;

    for (key, value) in config.global_labels {
        builder = builder.add_global_label(key, value);
    }

    // install_recorder() sets the global recorder without spawning an HTTP
    // listener; the handle renders on demand.
    let handle = builder.install_recorder()?;

    Ok(handle)
}

#[cfg(feature = "prometheus")]
fn init_prometheus_disabled() -> Result<metrics_exporter_prometheus::PrometheusHandle> {
    // A recorder that is never fed renders only metadata.
    let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
    Ok(recorder.handle())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_recorder_renders_nothing_observable() {
        let config = MetricsRecorderConfig {
            enabled: false,
            ..Default::default()
        };
        let handle = init_metrics(config).unwrap();
        let output = handle.render();
        assert!(output.is_empty() || output.contains('#'));
    }
}
