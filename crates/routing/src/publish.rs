//! Destination resolution for published events.

use std::sync::Arc;

use {
    async_trait::async_trait,
    tracing::{debug, info},
};

#[cfg(feature = "metrics")]
use conveyor_metrics::{counter, labels, routing as routing_metrics};
use {
    conveyor_common::{MessageIntent, RoutingStrategy},
    conveyor_pipeline::{Behavior, Next, OutgoingLogicalContext},
};

use crate::subscriptions::{SubscriptionMode, SubscriptionStore};

/// Routes publishes to subscribers.
///
/// With native pub/sub the transport fans out a single multicast. In
/// message-driven mode one unicast per stored subscriber is produced;
/// publishing an event nobody subscribed to is not an error.
pub struct DetermineRouteForPublishBehavior {
    mode: SubscriptionMode,
    store: Option<Arc<dyn SubscriptionStore>>,
}

impl DetermineRouteForPublishBehavior {
    pub fn native() -> Self {
        Self {
            mode: SubscriptionMode::Native,
            store: None,
        }
    }

    pub fn message_driven(store: Arc<dyn SubscriptionStore>) -> Self {
        Self {
            mode: SubscriptionMode::MessageDriven,
            store: Some(store),
        }
    }

    pub fn mode(&self) -> SubscriptionMode {
        self.mode
    }

    pub async fn resolve(&self, message_type: &str) -> anyhow::Result<Vec<RoutingStrategy>> {
        let Some(store) = &self.store else {
            return Ok(vec![RoutingStrategy::multicast(message_type)]);
        };
        let subscribers = store.subscribers(message_type).await?;
        Ok(subscribers
            .into_iter()
            .map(RoutingStrategy::unicast)
            .collect())
    }
}

#[async_trait]
impl Behavior<OutgoingLogicalContext> for DetermineRouteForPublishBehavior {
    async fn invoke(
        &self,
        context: &mut OutgoingLogicalContext,
        next: Next<'_, OutgoingLogicalContext>,
    ) -> anyhow::Result<()> {
        if context.intent() == MessageIntent::Publish {
            let message_type = context.message().message_type().to_string();
            let strategies = self.resolve(&message_type).await?;
            if strategies.is_empty() {
                #[cfg(feature = "metrics")]
                counter!(
                    routing_metrics::PUBLISH_WITHOUT_SUBSCRIBERS_TOTAL,
                    labels::MESSAGE_TYPE => message_type.clone()
                )
                .increment(1);
                info!(message_type = %message_type, "no subscribers for published event");
            } else {
                debug!(
                    message_type = %message_type,
                    destinations = strategies.len(),
                    "publish routed"
                );
            }
            context.routing_strategies = strategies;
        }
        next.run(context).await
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::subscriptions::InMemorySubscriptionStore,
        conveyor_common::{
            ContextBag, Headers, LogicalMessage, MessageId, MessageMetadata, RoutingOptions,
        },
        conveyor_pipeline::{PipelineBuilder, RegisterStep, ServiceProvider},
        serde_json::json,
        tokio_util::sync::CancellationToken,
    };

    async fn publish(behavior: DetermineRouteForPublishBehavior) -> Vec<RoutingStrategy> {
        let mut ctx = OutgoingLogicalContext::new(
            MessageId::generate(),
            MessageIntent::Publish,
            Headers::new(),
            LogicalMessage::new(Arc::new(MessageMetadata::event("OrderPlaced")), json!({})),
            RoutingOptions::default(),
            ContextBag::default(),
            ServiceProvider::empty(),
        );
        let mut builder = PipelineBuilder::new("outgoing-logical");
        builder.register(RegisterStep::new("publish-route", behavior));
        builder
            .build()
            .unwrap()
            .execute(&mut ctx, &CancellationToken::new())
            .await
            .unwrap();
        ctx.routing_strategies
    }

    #[tokio::test]
    async fn native_publish_multicasts_by_type() {
        assert_eq!(
            publish(DetermineRouteForPublishBehavior::native()).await,
            vec![RoutingStrategy::multicast("OrderPlaced")]
        );
    }

    #[tokio::test]
    async fn message_driven_publish_unicasts_to_each_subscriber() {
        let store = Arc::new(InMemorySubscriptionStore::new());
        store.subscribe("Shipping", "OrderPlaced").await.unwrap();
        store.subscribe("Billing", "OrderPlaced").await.unwrap();
        store.subscribe("Audit", "OrderCancelled").await.unwrap();

        assert_eq!(
            publish(DetermineRouteForPublishBehavior::message_driven(store)).await,
            vec![
                RoutingStrategy::unicast("Billing"),
                RoutingStrategy::unicast("Shipping"),
            ]
        );
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_not_an_error() {
        let store = Arc::new(InMemorySubscriptionStore::new());
        assert!(
            publish(DetermineRouteForPublishBehavior::message_driven(store))
                .await
                .is_empty()
        );
    }
}
