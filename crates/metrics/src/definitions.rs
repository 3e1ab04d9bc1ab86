//! Metric name and label definitions.
//!
//! Every metric emitted by the conveyor crates is named here so the set of
//! exported series is documented in one place.

/// Pipeline execution metrics
pub mod pipeline {
    /// Total number of pipeline executions, labeled by stage
    pub const EXECUTIONS_TOTAL: &str = "conveyor_pipeline_executions_total";
    /// Executions that ended because a behavior did not call its continuation
    pub const SHORT_CIRCUITS_TOTAL: &str = "conveyor_pipeline_short_circuits_total";
    /// Executions that failed with an error
    pub const FAILURES_TOTAL: &str = "conveyor_pipeline_failures_total";
    /// Duration of one pipeline execution in seconds
    pub const EXECUTION_DURATION_SECONDS: &str = "conveyor_pipeline_execution_duration_seconds";
}

/// Recoverability decisions
pub mod recoverability {
    /// Failures handed to the recoverability engine
    pub const FAILURES_TOTAL: &str = "conveyor_recoverability_failures_total";
    /// Immediate retries decided
    pub const IMMEDIATE_RETRIES_TOTAL: &str = "conveyor_recoverability_immediate_retries_total";
    /// Delayed retries decided
    pub const DELAYED_RETRIES_TOTAL: &str = "conveyor_recoverability_delayed_retries_total";
    /// Messages moved to the error queue
    pub const MOVED_TO_ERROR_TOTAL: &str = "conveyor_recoverability_moved_to_error_total";
    /// Message identities currently tracked with a failure record
    pub const TRACKED_FAILURES: &str = "conveyor_recoverability_tracked_failures";
}

/// Outgoing routing
pub mod routing {
    /// Routing resolution failures, labeled by operation
    pub const RESOLUTION_ERRORS_TOTAL: &str = "conveyor_routing_resolution_errors_total";
    /// Publishes that resolved to no subscriber
    pub const PUBLISH_WITHOUT_SUBSCRIBERS_TOTAL: &str =
        "conveyor_routing_publish_without_subscribers_total";
}

/// Endpoint receive loop and dispatch
pub mod endpoint {
    /// Messages taken from the input queue
    pub const MESSAGES_RECEIVED_TOTAL: &str = "conveyor_endpoint_messages_received_total";
    /// Messages processed successfully
    pub const MESSAGES_PROCESSED_TOTAL: &str = "conveyor_endpoint_messages_processed_total";
    /// Transport operations dispatched
    pub const OPERATIONS_DISPATCHED_TOTAL: &str = "conveyor_endpoint_operations_dispatched_total";
    /// Messages currently being processed
    pub const IN_FLIGHT: &str = "conveyor_endpoint_in_flight";
    /// End-to-end processing time of one message in seconds
    pub const PROCESSING_DURATION_SECONDS: &str = "conveyor_endpoint_processing_duration_seconds";
}

/// Configuration metrics
pub mod config {
    /// Configuration loads by outcome
    pub const LOADS_TOTAL: &str = "conveyor_config_loads_total";
    /// Validation diagnostics emitted, labeled by severity
    pub const DIAGNOSTICS_TOTAL: &str = "conveyor_config_diagnostics_total";
}

/// Common label keys used across metrics
pub mod labels {
    pub const STAGE: &str = "stage";
    pub const STEP: &str = "step";
    pub const ACTION: &str = "action";
    pub const OPERATION: &str = "operation";
    pub const MESSAGE_TYPE: &str = "message_type";
    pub const ENDPOINT: &str = "endpoint";
    pub const SEVERITY: &str = "severity";
    pub const SUCCESS: &str = "success";
}

/// Standard histogram buckets for different metric types
pub mod buckets {
    use once_cell::sync::Lazy;

    /// Pipeline execution duration buckets (in seconds)
    /// Covers 100µs to 10s
    pub static PIPELINE_DURATION: Lazy<Vec<f64>> = Lazy::new(|| {
        vec![
            0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 10.0,
        ]
    });

    /// Message processing duration buckets (in seconds)
    /// Covers 1ms to 60s, retries included
    pub static PROCESSING_DURATION: Lazy<Vec<f64>> = Lazy::new(|| {
        vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
        ]
    });
}
