//! Subscription storage and the guards applied before subscribing.

use std::collections::BTreeSet;

use {async_trait::async_trait, dashmap::DashMap, tracing::debug};

use conveyor_common::{MessageIntent, MessageKind, MessageMetadata};

use crate::error::{Error, Result};

/// How the transport delivers published events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionMode {
    /// The transport multicasts events to subscribers itself.
    Native,
    /// The publisher keeps a subscriber list and sends one copy to each.
    MessageDriven,
}

/// Subscriber addresses per event type, kept by publishers in
/// message-driven mode.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn subscribe(&self, subscriber: &str, message_type: &str) -> anyhow::Result<()>;

    async fn unsubscribe(&self, subscriber: &str, message_type: &str) -> anyhow::Result<()>;

    /// Subscribers of `message_type`, in a stable order.
    async fn subscribers(&self, message_type: &str) -> anyhow::Result<Vec<String>>;
}

#[derive(Debug, Default)]
pub struct InMemorySubscriptionStore {
    subscribers: DashMap<String, BTreeSet<String>>,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn subscribe(&self, subscriber: &str, message_type: &str) -> anyhow::Result<()> {
        self.subscribers
            .entry(message_type.to_string())
            .or_default()
            .insert(subscriber.to_string());
        debug!(subscriber, message_type, "subscriber added");
        Ok(())
    }

    async fn unsubscribe(&self, subscriber: &str, message_type: &str) -> anyhow::Result<()> {
        if let Some(mut entry) = self.subscribers.get_mut(message_type) {
            entry.remove(subscriber);
        }
        self.subscribers
            .remove_if(message_type, |_, subscribers| subscribers.is_empty());
        debug!(subscriber, message_type, "subscriber removed");
        Ok(())
    }

    async fn subscribers(&self, message_type: &str) -> anyhow::Result<Vec<String>> {
        Ok(self
            .subscribers
            .get(message_type)
            .map(|entry| entry.iter().cloned().collect())
            .unwrap_or_default())
    }
}

// ── Guards ──────────────────────────────────────────────────────────────────

/// Checks applied to subscribe and unsubscribe requests before anything is
/// sent or stored.
#[derive(Debug, Clone, Copy)]
pub struct SubscriptionGuard {
    send_only: bool,
    mode: SubscriptionMode,
}

impl SubscriptionGuard {
    pub fn new(send_only: bool, mode: SubscriptionMode) -> Self {
        Self { send_only, mode }
    }

    pub fn mode(&self) -> SubscriptionMode {
        self.mode
    }

    pub fn ensure_can_subscribe(&self, metadata: &MessageMetadata) -> Result<()> {
        if self.send_only {
            return Err(Error::SendOnlySubscribe {
                message_type: metadata.message_type.clone(),
            });
        }
        ensure_not_command(MessageIntent::Subscribe, metadata)
    }

    pub fn ensure_can_unsubscribe(&self, metadata: &MessageMetadata) -> Result<()> {
        if self.send_only {
            return Err(Error::SendOnlyUnsubscribe {
                message_type: metadata.message_type.clone(),
            });
        }
        ensure_not_command(MessageIntent::Unsubscribe, metadata)
    }
}

fn ensure_not_command(intent: MessageIntent, metadata: &MessageMetadata) -> Result<()> {
    if metadata.kind == MessageKind::Command {
        return Err(Error::CommandSubscription {
            intent,
            message_type: metadata.message_type.clone(),
        });
    }
    Ok(())
}
