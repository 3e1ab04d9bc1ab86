//! Metrics collection and export for conveyor.
//!
//! Library crates record through the `metrics` facade behind their own
//! optional `metrics` feature; the binary decides whether a recorder is
//! installed.
//!
//! # Usage
//!
//! ```rust,ignore
//! use conveyor_metrics::{counter, labels, recoverability};
//!
//! counter!(recoverability::IMMEDIATE_RETRIES_TOTAL, labels::ENDPOINT => "Sales").increment(1);
//! ```
//!
//! # Features
//!
//! - `prometheus`: render collected metrics in Prometheus text format

mod definitions;
mod recorder;

pub use {
    definitions::*,
    recorder::{MetricsHandle, MetricsRecorderConfig, init_metrics},
};

// Re-export metrics macros for convenience
pub use metrics::{counter, gauge, histogram};
