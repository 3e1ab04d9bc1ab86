//! Recoverability: deciding whether a failed message is retried right away,
//! retried later through the transport, or moved to the error queue.

pub mod action;
pub mod config;
pub mod engine;
pub mod error;
pub mod fault;
pub mod policy;

pub use {
    action::{ErrorContext, FailureRecord, RecoverabilityAction},
    config::{DelayedConfig, FailedConfig, ImmediateConfig, RecoverabilityConfig},
    engine::{Decision, Recoverability},
    error::{Error, Result},
    fault::{apply_delayed_retry_headers, apply_fault_headers},
    policy::{DefaultRecoverabilityPolicy, PolicyMatcher, RecoverabilityPolicy},
};
