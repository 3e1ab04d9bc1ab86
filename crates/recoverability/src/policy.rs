//! The default retry policy and user supplied replacements.

use std::sync::Arc;

use tracing::debug;

use crate::{
    action::{ErrorContext, RecoverabilityAction},
    config::RecoverabilityConfig,
};

/// A user policy. It fully replaces the default decision for the failures it
/// is registered for and must not have side effects on engine state.
pub type RecoverabilityPolicy =
    Arc<dyn Fn(&RecoverabilityConfig, &ErrorContext<'_>) -> RecoverabilityAction + Send + Sync>;

/// Selects the failures a custom policy applies to.
pub type PolicyMatcher = Arc<dyn Fn(&ErrorContext<'_>) -> bool + Send + Sync>;

/// Immediate retries first, then delayed retries with a linearly growing
/// delay, then the error queue. Unrecoverable errors go to the error queue
/// on their first occurrence.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRecoverabilityPolicy;

impl DefaultRecoverabilityPolicy {
    pub fn invoke(config: &RecoverabilityConfig, context: &ErrorContext<'_>) -> RecoverabilityAction {
        if let Some(classifier) = config.unrecoverable_match(context.error) {
            debug!(
                message_id = context.message_id(),
                classifier, "unrecoverable failure, skipping retries"
            );
            return RecoverabilityAction::move_to_error(&config.failed.error_queue);
        }

        let immediate = config.immediate.max_retries;
        if context.attempt <= immediate {
            return RecoverabilityAction::immediate_retry();
        }

        let delayed_attempt = context.attempt - immediate;
        if delayed_attempt <= config.delayed.max_retries {
            let delay = config.delayed.time_increase.saturating_mul(delayed_attempt);
            return RecoverabilityAction::delayed_retry(delay);
        }

        RecoverabilityAction::move_to_error(&config.failed.error_queue)
    }
}

pub(crate) struct CustomPolicy {
    pub(crate) matcher: Option<PolicyMatcher>,
    pub(crate) policy: RecoverabilityPolicy,
}

impl CustomPolicy {
    pub(crate) fn matches(&self, context: &ErrorContext<'_>) -> bool {
        self.matcher.as_ref().is_none_or(|matcher| matcher(context))
    }
}
