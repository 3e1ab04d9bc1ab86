//! In-process transport for tests and the demo binary.

use std::{
    collections::{BTreeSet, VecDeque},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    dashmap::DashMap,
    tokio::{sync::Notify, time::Instant},
    tracing::{debug, trace},
};

use conveyor_common::{IncomingMessage, OutgoingMessage, headers};

use crate::transport::{ReceivedMessage, Transport, TransportCapabilities};

struct Envelope {
    received: ReceivedMessage,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct Queue {
    items: Mutex<VecDeque<Envelope>>,
    notify: Notify,
}

impl Queue {
    fn push(&self, envelope: Envelope) {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(envelope);
        self.notify.notify_one();
    }

    /// Next unexpired message; expired ones are dropped on the way.
    fn pop(&self, queue: &str) -> Option<ReceivedMessage> {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        while let Some(envelope) = items.pop_front() {
            if envelope.expires_at.is_some_and(|at| at <= now) {
                debug!(
                    queue,
                    message_id = %envelope.received.message.message_id,
                    "discarding expired message"
                );
                continue;
            }
            return Some(envelope.received);
        }
        None
    }

    fn len(&self) -> usize {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Named FIFO queues plus a native subscription table, shared by every
/// endpoint attached to it.
#[derive(Default)]
pub struct InMemoryBroker {
    queues: DashMap<String, Arc<Queue>>,
    subscribers: DashMap<String, BTreeSet<String>>,
    closed: AtomicBool,
}

impl InMemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn queue(&self, name: &str) -> Arc<Queue> {
        Arc::clone(self.queues.entry(name.to_string()).or_default().value())
    }

    pub fn enqueue(&self, queue: &str, message: OutgoingMessage) {
        let expires_at = message
            .headers
            .get(headers::TIME_TO_BE_RECEIVED)
            .and_then(|ms| ms.parse::<u64>().ok())
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        trace!(queue, message_id = %message.message_id, "enqueue");
        self.queue(queue).push(Envelope {
            received: ReceivedMessage {
                message: IncomingMessage::new(message.message_id, message.headers, message.body),
                delivery_attempt: 1,
            },
            expires_at,
        });
    }

    /// Take the next message from `queue` without waiting.
    pub fn try_receive(&self, queue: &str) -> Option<IncomingMessage> {
        self.queue(queue).pop(queue).map(|received| received.message)
    }

    /// Wait for the next message on `queue`; `None` once the broker is
    /// closed.
    pub async fn receive(&self, queue: &str) -> Option<ReceivedMessage> {
        let queue_ref = self.queue(queue);
        loop {
            let notified = queue_ref.notify.notified();
            if let Some(received) = queue_ref.pop(queue) {
                return Some(received);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    pub fn len(&self, queue: &str) -> usize {
        self.queues.get(queue).map_or(0, |q| q.len())
    }

    pub fn is_empty(&self, queue: &str) -> bool {
        self.len(queue) == 0
    }

    /// Wake every receiver; pending receives return `None` once their queue
    /// is drained.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for queue in &self.queues {
            queue.notify.notify_waiters();
        }
    }

    pub fn subscribe(&self, subscriber: &str, message_type: &str) {
        self.subscribers
            .entry(message_type.to_string())
            .or_default()
            .insert(subscriber.to_string());
    }

    pub fn unsubscribe(&self, subscriber: &str, message_type: &str) {
        if let Some(mut subscribers) = self.subscribers.get_mut(message_type) {
            subscribers.remove(subscriber);
        }
    }

    pub fn subscribers(&self, message_type: &str) -> Vec<String> {
        self.subscribers
            .get(message_type)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// [`Transport`] over an [`InMemoryBroker`].
#[derive(Clone)]
pub struct InMemoryTransport {
    broker: Arc<InMemoryBroker>,
    capabilities: TransportCapabilities,
}

impl InMemoryTransport {
    pub fn new(broker: Arc<InMemoryBroker>) -> Self {
        Self {
            broker,
            capabilities: TransportCapabilities::default(),
        }
    }

    /// Pretend to lack some native features, e.g. to exercise
    /// message-driven pub/sub.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: TransportCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn broker(&self) -> &Arc<InMemoryBroker> {
        &self.broker
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn capabilities(&self) -> TransportCapabilities {
        self.capabilities
    }

    async fn receive(&self, queue: &str) -> anyhow::Result<Option<ReceivedMessage>> {
        Ok(self.broker.receive(queue).await)
    }

    async fn send(&self, message: OutgoingMessage, destination: &str) -> anyhow::Result<()> {
        self.broker.enqueue(destination, message);
        Ok(())
    }

    async fn publish(&self, message: OutgoingMessage, message_type: &str) -> anyhow::Result<()> {
        if !self.capabilities.native_publish_subscribe {
            anyhow::bail!("native publish is not supported by this transport");
        }
        for subscriber in self.broker.subscribers(message_type) {
            self.broker.enqueue(&subscriber, message.clone());
        }
        Ok(())
    }

    async fn schedule_delayed_delivery(
        &self,
        message: OutgoingMessage,
        destination: &str,
        delay: Duration,
    ) -> anyhow::Result<()> {
        if !self.capabilities.delayed_delivery {
            anyhow::bail!("delayed delivery is not supported by this transport");
        }
        let broker = Arc::clone(&self.broker);
        let destination = destination.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            broker.enqueue(&destination, message);
        });
        Ok(())
    }

    async fn move_to_error(&self, message: OutgoingMessage, error_queue: &str) -> anyhow::Result<()> {
        self.broker.enqueue(error_queue, message);
        Ok(())
    }

    async fn subscribe(&self, subscriber: &str, message_type: &str) -> anyhow::Result<()> {
        self.broker.subscribe(subscriber, message_type);
        Ok(())
    }

    async fn unsubscribe(&self, subscriber: &str, message_type: &str) -> anyhow::Result<()> {
        self.broker.unsubscribe(subscriber, message_type);
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        conveyor_common::{Headers, MessageId, RoutingStrategy, TransportOperation},
    };

    fn message(id: &str) -> OutgoingMessage {
        OutgoingMessage::new(MessageId::new(id).unwrap(), Headers::new(), "{}")
    }

    #[tokio::test]
    async fn queues_are_fifo() {
        let broker = InMemoryBroker::new();
        broker.enqueue("Sales", message("a"));
        broker.enqueue("Sales", message("b"));
        assert_eq!(broker.len("Sales"), 2);
        assert_eq!(broker.receive("Sales").await.unwrap().message.message_id.as_str(), "a");
        assert_eq!(broker.try_receive("Sales").unwrap().message_id.as_str(), "b");
        assert!(broker.is_empty("Sales"));
    }

    #[tokio::test]
    async fn receive_waits_for_a_message() {
        let broker = InMemoryBroker::new();
        let waiting = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move { broker.receive("Sales").await })
        };
        tokio::task::yield_now().await;
        broker.enqueue("Sales", message("late"));
        let received = waiting.await.unwrap().unwrap();
        assert_eq!(received.message.message_id.as_str(), "late");
        assert_eq!(received.delivery_attempt, 1);
    }

    #[tokio::test]
    async fn close_releases_waiting_receivers() {
        let broker = InMemoryBroker::new();
        let waiting = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move { broker.receive("Sales").await })
        };
        tokio::task::yield_now().await;
        broker.close();
        assert!(waiting.await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_messages_are_discarded() {
        let broker = InMemoryBroker::new();
        let mut expiring = message("old");
        expiring
            .headers
            .insert(headers::TIME_TO_BE_RECEIVED.into(), "100".into());
        broker.enqueue("Sales", expiring);
        broker.enqueue("Sales", message("fresh"));

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(broker.try_receive("Sales").unwrap().message_id.as_str(), "fresh");
        assert!(broker.try_receive("Sales").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_delivery_arrives_after_delay() {
        let transport = InMemoryTransport::new(InMemoryBroker::new());
        transport
            .schedule_delayed_delivery(message("later"), "Sales", Duration::from_secs(5))
            .await
            .unwrap();
        tokio::task::yield_now().await;
        assert!(transport.broker().is_empty("Sales"));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(transport.broker().len("Sales"), 1);
    }

    #[tokio::test]
    async fn dispatch_fans_out_multicast_to_native_subscribers() {
        let transport = InMemoryTransport::new(InMemoryBroker::new());
        transport.subscribe("Shipping", "OrderPlaced").await.unwrap();
        transport.subscribe("Billing", "OrderPlaced").await.unwrap();

        transport
            .dispatch(vec![
                TransportOperation {
                    message: message("evt"),
                    strategy: RoutingStrategy::multicast("OrderPlaced"),
                },
                TransportOperation {
                    message: message("cmd"),
                    strategy: RoutingStrategy::unicast("Billing"),
                },
            ])
            .await
            .unwrap();

        assert_eq!(transport.broker().len("Shipping"), 1);
        assert_eq!(transport.broker().len("Billing"), 2);
    }

    #[tokio::test]
    async fn unsupported_capabilities_fail() {
        let transport = InMemoryTransport::new(InMemoryBroker::new()).with_capabilities(
            TransportCapabilities {
                native_publish_subscribe: false,
                delayed_delivery: false,
                discard_expired: true,
            },
        );
        assert!(transport.publish(message("e"), "OrderPlaced").await.is_err());
        assert!(
            transport
                .schedule_delayed_delivery(message("d"), "Sales", Duration::from_secs(1))
                .await
                .is_err()
        );
    }
}
