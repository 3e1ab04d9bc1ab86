//! The contract between the endpoint and the queueing infrastructure.

use std::time::Duration;

use async_trait::async_trait;

use conveyor_common::{IncomingMessage, OutgoingMessage, RoutingStrategy, TransportOperation};

/// What the transport can do natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportCapabilities {
    /// Events are multicast by the transport; no subscriber list needed.
    pub native_publish_subscribe: bool,
    /// Messages can be scheduled for later delivery.
    pub delayed_delivery: bool,
    /// Messages whose time to be received elapsed are dropped unread.
    pub discard_expired: bool,
}

impl Default for TransportCapabilities {
    fn default() -> Self {
        Self {
            native_publish_subscribe: true,
            delayed_delivery: true,
            discard_expired: true,
        }
    }
}

/// A message handed to the receive loop.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message: IncomingMessage,
    /// How often the transport delivered this message, starting at 1.
    pub delivery_attempt: u32,
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn capabilities(&self) -> TransportCapabilities;

    /// Wait for the next message on `queue`. `None` means the queue is
    /// closed and the receive loop should stop.
    async fn receive(&self, queue: &str) -> anyhow::Result<Option<ReceivedMessage>>;

    async fn send(&self, message: OutgoingMessage, destination: &str) -> anyhow::Result<()>;

    /// Multicast an event to every native subscriber of `message_type`.
    async fn publish(&self, message: OutgoingMessage, message_type: &str) -> anyhow::Result<()>;

    async fn schedule_delayed_delivery(
        &self,
        message: OutgoingMessage,
        destination: &str,
        delay: Duration,
    ) -> anyhow::Result<()>;

    async fn move_to_error(&self, message: OutgoingMessage, error_queue: &str) -> anyhow::Result<()>;

    async fn subscribe(&self, subscriber: &str, message_type: &str) -> anyhow::Result<()>;

    async fn unsubscribe(&self, subscriber: &str, message_type: &str) -> anyhow::Result<()>;

    /// Dispatch a batch of operations, in order.
    async fn dispatch(&self, operations: Vec<TransportOperation>) -> anyhow::Result<()> {
        for operation in operations {
            match operation.strategy {
                RoutingStrategy::Unicast { destination } => {
                    self.send(operation.message, &destination).await?;
                },
                RoutingStrategy::Multicast { message_type } => {
                    self.publish(operation.message, &message_type).await?;
                },
            }
        }
        Ok(())
    }
}
