//! Per-message failure bookkeeping and the decision entry point.

use std::sync::Arc;

use {
    chrono::Utc,
    dashmap::DashMap,
    tracing::{debug, info, warn},
};

#[cfg(feature = "metrics")]
use conveyor_metrics::{counter, gauge, labels, recoverability as recoverability_metrics};
use conveyor_common::IncomingMessage;

use crate::{
    action::{ErrorContext, FailureRecord, RecoverabilityAction},
    config::RecoverabilityConfig,
    policy::{CustomPolicy, DefaultRecoverabilityPolicy, PolicyMatcher, RecoverabilityPolicy},
};

/// The outcome of one failure: the action plus the bookkeeping it was
/// decided from.
#[derive(Debug, Clone)]
pub struct Decision {
    pub action: RecoverabilityAction,
    pub record: FailureRecord,
}

/// Decides what happens to failed messages.
///
/// The engine performs no I/O. It counts failures per message id, asks the
/// matching policy for an action and forgets the message once the action is
/// terminal or [`record_success`](Self::record_success) is called. Safe to
/// share between workers; no lock is held while a policy runs.
pub struct Recoverability {
    config: RecoverabilityConfig,
    custom: Vec<CustomPolicy>,
    failures: DashMap<String, FailureRecord>,
}

impl Recoverability {
    pub fn new(config: RecoverabilityConfig) -> Self {
        info!(
            immediate_retries = config.immediate.max_retries,
            delayed_retries = config.delayed.max_retries,
            error_queue = %config.failed.error_queue,
            "recoverability configured"
        );
        Self {
            config,
            custom: Vec::new(),
            failures: DashMap::new(),
        }
    }

    /// Replace the default policy for every failure.
    #[must_use]
    pub fn custom_policy<F>(mut self, policy: F) -> Self
    where
        F: Fn(&RecoverabilityConfig, &ErrorContext<'_>) -> RecoverabilityAction
            + Send
            + Sync
            + 'static,
    {
        self.custom.push(CustomPolicy {
            matcher: None,
            policy: Arc::new(policy),
        });
        self
    }

    /// Replace the default policy for failures selected by `matcher`.
    /// Policies are consulted in registration order.
    #[must_use]
    pub fn custom_policy_for<M, F>(mut self, matcher: M, policy: F) -> Self
    where
        M: Fn(&ErrorContext<'_>) -> bool + Send + Sync + 'static,
        F: Fn(&RecoverabilityConfig, &ErrorContext<'_>) -> RecoverabilityAction
            + Send
            + Sync
            + 'static,
    {
        let matcher: PolicyMatcher = Arc::new(matcher);
        let policy: RecoverabilityPolicy = Arc::new(policy);
        self.custom.push(CustomPolicy {
            matcher: Some(matcher),
            policy,
        });
        self
    }

    pub fn config(&self) -> &RecoverabilityConfig {
        &self.config
    }

    /// Decide the action for a failed processing attempt.
    ///
    /// `delivery_attempt` is the transport's delivery count for the message;
    /// the tracked attempt never falls behind it.
    pub fn handle_failure(
        &self,
        message: &IncomingMessage,
        error: &anyhow::Error,
        delivery_attempt: u32,
    ) -> RecoverabilityAction {
        self.evaluate(message, error, delivery_attempt).action
    }

    /// Like [`handle_failure`](Self::handle_failure), also returning the
    /// failure record for fault headers.
    pub fn evaluate(
        &self,
        message: &IncomingMessage,
        error: &anyhow::Error,
        delivery_attempt: u32,
    ) -> Decision {
        let message_id = message.message_id.as_str();
        let now = Utc::now();
        let record = {
            let mut entry = self
                .failures
                .entry(message_id.to_string())
                .or_insert_with(|| FailureRecord::new(now));
            entry.attempts = (entry.attempts + 1).max(delivery_attempt);
            entry.errors.push(error.to_string());
            entry.last_failure = now;
            entry.clone()
        };

        let context = ErrorContext {
            message,
            error,
            attempt: record.attempts,
            delayed_retries: message.delayed_retries(),
        };
        let action = match self.custom.iter().find(|custom| custom.matches(&context)) {
            Some(custom) => (custom.policy)(&self.config, &context),
            None => DefaultRecoverabilityPolicy::invoke(&self.config, &context),
        };

        if action.is_terminal() {
            self.failures.remove(message_id);
        }

        #[cfg(feature = "metrics")]
        {
            counter!(recoverability_metrics::FAILURES_TOTAL, labels::ACTION => action.as_str())
                .increment(1);
            match &action {
                RecoverabilityAction::ImmediateRetry => {
                    counter!(recoverability_metrics::IMMEDIATE_RETRIES_TOTAL).increment(1);
                },
                RecoverabilityAction::DelayedRetry { .. } => {
                    counter!(recoverability_metrics::DELAYED_RETRIES_TOTAL).increment(1);
                },
                RecoverabilityAction::MoveToError { .. } => {
                    counter!(recoverability_metrics::MOVED_TO_ERROR_TOTAL).increment(1);
                },
            }
            gauge!(recoverability_metrics::TRACKED_FAILURES).set(self.failures.len() as f64);
        }

        match &action {
            RecoverabilityAction::MoveToError { error_queue } => warn!(
                message_id,
                attempts = record.attempts,
                error_queue = %error_queue,
                error = %error,
                "moving message to error queue"
            ),
            _ => warn!(
                message_id,
                attempt = record.attempts,
                action = %action,
                error = %error,
                "message processing failed, retrying"
            ),
        }

        Decision { action, record }
    }

    /// Forget the failures of a message that has now been processed.
    pub fn record_success(&self, message_id: &str) -> bool {
        let removed = self.failures.remove(message_id).is_some();
        if removed {
            debug!(message_id, "message succeeded after retries");
            #[cfg(feature = "metrics")]
            gauge!(recoverability_metrics::TRACKED_FAILURES).set(self.failures.len() as f64);
        }
        removed
    }

    /// Drop the failures of a message that will not be seen again, without
    /// treating it as a success.
    pub fn forget(&self, message_id: &str) -> bool {
        let removed = self.failures.remove(message_id).is_some();
        if removed {
            debug!(message_id, "failure record dropped");
            #[cfg(feature = "metrics")]
            gauge!(recoverability_metrics::TRACKED_FAILURES).set(self.failures.len() as f64);
        }
        removed
    }

    /// Number of message ids with failures on record.
    pub fn tracked(&self) -> usize {
        self.failures.len()
    }

    pub fn attempts(&self, message_id: &str) -> Option<u32> {
        self.failures.get(message_id).map(|record| record.attempts)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        conveyor_common::{Headers, MessageId, Unrecoverable},
        std::{
            sync::atomic::{AtomicU32, Ordering},
            time::Duration,
        },
    };

    fn message(id: &str) -> IncomingMessage {
        IncomingMessage::new(MessageId::new(id).unwrap(), Headers::new(), "")
    }

    fn engine() -> Recoverability {
        Recoverability::new(
            RecoverabilityConfig::new("errors")
                .with_immediate_retries(2)
                .with_delayed_retries(2, Duration::from_secs(5)),
        )
    }

    #[test]
    fn failures_progress_through_every_tier_then_clear() {
        let engine = engine();
        let msg = message("m-1");
        let error = anyhow::anyhow!("db timeout");

        let actions: Vec<_> = (0..5)
            .map(|_| engine.handle_failure(&msg, &error, 1))
            .collect();

        assert_eq!(actions, vec![
            RecoverabilityAction::ImmediateRetry,
            RecoverabilityAction::ImmediateRetry,
            RecoverabilityAction::delayed_retry(Duration::from_secs(5)),
            RecoverabilityAction::delayed_retry(Duration::from_secs(10)),
            RecoverabilityAction::move_to_error("errors"),
        ]);
        assert_eq!(engine.tracked(), 0);
    }

    #[test]
    fn delays_never_decrease() {
        let engine = engine();
        let msg = message("m-1");
        let error = anyhow::anyhow!("boom");
        let mut last = Duration::ZERO;
        for _ in 0..5 {
            if let RecoverabilityAction::DelayedRetry { delay } = engine.handle_failure(&msg, &error, 1) {
                assert!(delay >= last);
                last = delay;
            }
        }
    }

    #[test]
    fn identities_are_counted_independently() {
        let engine = engine();
        let error = anyhow::anyhow!("boom");
        engine.handle_failure(&message("a"), &error, 1);
        engine.handle_failure(&message("a"), &error, 1);
        engine.handle_failure(&message("b"), &error, 1);
        assert_eq!(engine.attempts("a"), Some(2));
        assert_eq!(engine.attempts("b"), Some(1));
    }

    #[test]
    fn delivery_attempt_from_transport_is_respected() {
        let engine = engine();
        let action = engine.handle_failure(&message("m-1"), &anyhow::anyhow!("boom"), 3);
        assert_eq!(action, RecoverabilityAction::delayed_retry(Duration::from_secs(5)));
    }

    #[test]
    fn success_clears_the_record() {
        let engine = engine();
        engine.handle_failure(&message("m-1"), &anyhow::anyhow!("boom"), 1);
        assert!(engine.record_success("m-1"));
        assert!(!engine.record_success("m-1"));
        assert_eq!(engine.tracked(), 0);
    }

    #[test]
    fn forget_drops_only_the_named_record() {
        let engine = engine();
        let error = anyhow::anyhow!("boom");
        engine.handle_failure(&message("a"), &error, 1);
        engine.handle_failure(&message("b"), &error, 1);

        assert!(engine.forget("a"));
        assert!(!engine.forget("a"));
        assert_eq!(engine.attempts("a"), None);
        assert_eq!(engine.attempts("b"), Some(1));
    }

    #[test]
    fn unrecoverable_failure_counts_then_clears() {
        let engine = engine();
        let decision = engine.evaluate(
            &message("m-1"),
            &anyhow::Error::new(Unrecoverable::new("bad body")),
            1,
        );
        assert_eq!(decision.action, RecoverabilityAction::move_to_error("errors"));
        assert_eq!(decision.record.attempts, 1);
        assert_eq!(engine.tracked(), 0);
    }

    #[test]
    fn custom_policy_replaces_the_default_for_every_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&calls);
        let engine = engine().custom_policy(move |config, _| {
            seen.fetch_add(1, Ordering::SeqCst);
            RecoverabilityAction::move_to_error(&config.failed.error_queue)
        });

        let action = engine.handle_failure(&message("m-1"), &anyhow::anyhow!("boom"), 1);

        assert_eq!(action, RecoverabilityAction::move_to_error("errors"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.tracked(), 0);
    }

    #[test]
    fn matched_custom_policy_only_applies_to_its_failures() {
        let engine = engine().custom_policy_for(
            |ctx| ctx.error.to_string().contains("throttled"),
            |_, ctx| RecoverabilityAction::delayed_retry(Duration::from_secs(60) * ctx.attempt),
        );

        assert_eq!(
            engine.handle_failure(&message("a"), &anyhow::anyhow!("throttled"), 1),
            RecoverabilityAction::delayed_retry(Duration::from_secs(60))
        );
        assert_eq!(
            engine.handle_failure(&message("b"), &anyhow::anyhow!("boom"), 1),
            RecoverabilityAction::ImmediateRetry
        );
    }

    #[test]
    fn custom_policy_can_delegate_to_default() {
        let engine = engine().custom_policy(|config, ctx| {
            match DefaultRecoverabilityPolicy::invoke(config, ctx) {
                RecoverabilityAction::DelayedRetry { .. } => {
                    RecoverabilityAction::move_to_error("parking")
                },
                other => other,
            }
        });
        let msg = message("m-1");
        let error = anyhow::anyhow!("boom");
        assert_eq!(engine.handle_failure(&msg, &error, 1), RecoverabilityAction::ImmediateRetry);
        assert_eq!(engine.handle_failure(&msg, &error, 1), RecoverabilityAction::ImmediateRetry);
        assert_eq!(
            engine.handle_failure(&msg, &error, 1),
            RecoverabilityAction::move_to_error("parking")
        );
    }

    #[test]
    fn concurrent_failures_are_not_lost() {
        let engine = Arc::new(
            Recoverability::new(RecoverabilityConfig::new("errors").with_immediate_retries(1000)),
        );
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || {
                    let msg = message("shared");
                    let error = anyhow::anyhow!("boom");
                    for _ in 0..50 {
                        engine.handle_failure(&msg, &error, 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(engine.attempts("shared"), Some(400));
    }
}
