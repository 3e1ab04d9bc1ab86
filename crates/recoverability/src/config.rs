//! Retry limits, the error queue and unrecoverable error classification.

use std::{any::type_name, fmt, sync::Arc, time::Duration};

use tracing::warn;

use conveyor_common::Unrecoverable;

use crate::error::{Error, Result};

pub const DEFAULT_IMMEDIATE_RETRIES: u32 = 5;
pub const DEFAULT_DELAYED_RETRIES: u32 = 3;
pub const DEFAULT_TIME_INCREASE: Duration = Duration::from_secs(10);
pub const DEFAULT_ERROR_QUEUE: &str = "error";

type Predicate = Arc<dyn Fn(&anyhow::Error) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImmediateConfig {
    pub max_retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayedConfig {
    pub max_retries: u32,
    /// Added to the delay for every further delayed retry.
    pub time_increase: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedConfig {
    pub error_queue: String,
}

/// Settings the default policy decides from; custom policies receive them
/// too.
#[derive(Clone)]
pub struct RecoverabilityConfig {
    pub immediate: ImmediateConfig,
    pub delayed: DelayedConfig,
    pub failed: FailedConfig,
    unrecoverable: Vec<(&'static str, Predicate)>,
}

impl Default for RecoverabilityConfig {
    fn default() -> Self {
        Self::new(DEFAULT_ERROR_QUEUE)
    }
}

impl fmt::Debug for RecoverabilityConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoverabilityConfig")
            .field("immediate", &self.immediate)
            .field("delayed", &self.delayed)
            .field("failed", &self.failed)
            .field(
                "unrecoverable",
                &self.unrecoverable.iter().map(|(name, _)| *name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl RecoverabilityConfig {
    /// Default limits with [`Unrecoverable`] registered as unrecoverable.
    pub fn new(error_queue: impl Into<String>) -> Self {
        let mut config = Self {
            immediate: ImmediateConfig {
                max_retries: DEFAULT_IMMEDIATE_RETRIES,
            },
            delayed: DelayedConfig {
                max_retries: DEFAULT_DELAYED_RETRIES,
                time_increase: DEFAULT_TIME_INCREASE,
            },
            failed: FailedConfig {
                error_queue: error_queue.into(),
            },
            unrecoverable: Vec::new(),
        };
        config.add_unrecoverable_error::<Unrecoverable>();
        config
    }

    #[must_use]
    pub fn with_immediate_retries(mut self, max_retries: u32) -> Self {
        self.immediate.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_delayed_retries(mut self, max_retries: u32, time_increase: Duration) -> Self {
        self.delayed = DelayedConfig {
            max_retries,
            time_increase,
        };
        self
    }

    /// Treat any failure whose error chain contains an `E` as unrecoverable.
    pub fn add_unrecoverable_error<E>(&mut self) -> &mut Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let predicate: Predicate = Arc::new(|error: &anyhow::Error| {
            error.chain().any(|cause| cause.is::<E>())
        });
        self.unrecoverable.push((type_name::<E>(), predicate));
        self
    }

    pub fn add_unrecoverable_predicate<F>(&mut self, predicate: F) -> &mut Self
    where
        F: Fn(&anyhow::Error) -> bool + Send + Sync + 'static,
    {
        self.unrecoverable
            .push(("custom predicate", Arc::new(predicate)));
        self
    }

    /// Name of the first classifier matching `error`, if any.
    pub fn unrecoverable_match(&self, error: &anyhow::Error) -> Option<&'static str> {
        self.unrecoverable
            .iter()
            .find(|(_, predicate)| predicate(error))
            .map(|(name, _)| *name)
    }

    pub fn is_unrecoverable(&self, error: &anyhow::Error) -> bool {
        self.unrecoverable_match(error).is_some()
    }

    /// Turn delayed retries off when the transport cannot delay delivery.
    pub fn disable_delayed_retries_if_unsupported(&mut self, supports_delayed_delivery: bool) {
        if supports_delayed_delivery || self.delayed.max_retries == 0 {
            return;
        }
        warn!(
            configured = self.delayed.max_retries,
            "transport does not support delayed delivery, delayed retries disabled"
        );
        self.delayed.max_retries = 0;
    }

    pub fn validate(&self) -> Result<()> {
        if self.failed.error_queue.trim().is_empty() {
            return Err(Error::EmptyErrorQueue);
        }
        if self.delayed.max_retries > 0 && self.delayed.time_increase.is_zero() {
            return Err(Error::ZeroTimeIncrease {
                max_retries: self.delayed.max_retries,
            });
        }
        Ok(())
    }
}
