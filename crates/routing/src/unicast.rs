//! Destination resolution for replies and sends.

use std::sync::Arc;

use {async_trait::async_trait, tracing::debug};

#[cfg(feature = "metrics")]
use conveyor_metrics::{counter, labels, routing as routing_metrics};
use {
    conveyor_common::{MessageIntent, ReceiveAddresses, RoutingStrategy},
    conveyor_pipeline::{Behavior, Next, OutgoingLogicalContext},
};

use crate::{
    error::{Error, Result},
    table::RoutingTable,
};

fn resolution_failed(intent: MessageIntent, error: Error) -> anyhow::Error {
    #[cfg(feature = "metrics")]
    counter!(routing_metrics::RESOLUTION_ERRORS_TOTAL, labels::OPERATION => intent.as_str())
        .increment(1);
    debug!(%intent, %error, "route resolution failed");
    error.into()
}

// ── Reply ───────────────────────────────────────────────────────────────────

/// Routes replies back to the sender of the message being handled.
#[derive(Debug, Default)]
pub struct DetermineRouteForReplyBehavior;

impl DetermineRouteForReplyBehavior {
    pub fn resolve(context: &OutgoingLogicalContext) -> Result<String> {
        if let Some(destination) = context.routing.destination() {
            return Ok(destination.to_string());
        }
        context
            .incoming_message()
            .and_then(|incoming| incoming.reply_to_address().map(ToString::to_string))
            .ok_or_else(|| Error::NoReplyDestination {
                message_type: context.message().message_type().to_string(),
            })
    }
}

#[async_trait]
impl Behavior<OutgoingLogicalContext> for DetermineRouteForReplyBehavior {
    async fn invoke(
        &self,
        context: &mut OutgoingLogicalContext,
        next: Next<'_, OutgoingLogicalContext>,
    ) -> anyhow::Result<()> {
        if context.intent() == MessageIntent::Reply {
            let destination = Self::resolve(context)
                .map_err(|e| resolution_failed(MessageIntent::Reply, e))?;
            context.routing_strategies = vec![RoutingStrategy::unicast(destination)];
        }
        next.run(context).await
    }
}

// ── Send ────────────────────────────────────────────────────────────────────

/// Routes sends: explicit destination, then the self-routing options, then
/// the routing table.
pub struct DetermineRouteForSendBehavior {
    addresses: ReceiveAddresses,
    table: Arc<dyn RoutingTable>,
}

impl DetermineRouteForSendBehavior {
    pub fn new(addresses: ReceiveAddresses, table: Arc<dyn RoutingTable>) -> Self {
        Self { addresses, table }
    }

    pub fn resolve(&self, context: &OutgoingLogicalContext) -> Result<String> {
        let routing = &context.routing;
        if let Some(destination) = routing.destination() {
            return Ok(destination.to_string());
        }
        if routing.is_routing_to_this_instance() {
            return self
                .addresses
                .instance_receive_address()
                .map(ToString::to_string)
                .ok_or(Error::NoInstanceDiscriminator);
        }
        if let Some(instance) = routing.specific_instance() {
            return Ok(ReceiveAddresses::instance_address(
                self.addresses.main_receive_address(),
                instance,
            ));
        }
        if routing.is_routing_to_this_endpoint() {
            return Ok(self.addresses.main_receive_address().to_string());
        }

        let message_type = context.message().message_type();
        self.table
            .route(message_type)
            .ok_or_else(|| Error::no_route(message_type))
    }
}

#[async_trait]
impl Behavior<OutgoingLogicalContext> for DetermineRouteForSendBehavior {
    async fn invoke(
        &self,
        context: &mut OutgoingLogicalContext,
        next: Next<'_, OutgoingLogicalContext>,
    ) -> anyhow::Result<()> {
        if context.intent() == MessageIntent::Send {
            let destination = self
                .resolve(context)
                .map_err(|e| resolution_failed(MessageIntent::Send, e))?;
            debug!(
                message_id = %context.message_id(),
                message_type = context.message().message_type(),
                %destination,
                "send routed"
            );
            context.routing_strategies = vec![RoutingStrategy::unicast(destination)];
        }
        next.run(context).await
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::table::StaticRoutingTable,
        conveyor_common::{
            ContextBag, Headers, IncomingMessage, LogicalMessage, MessageId, MessageMetadata,
            RoutingOptions, headers,
        },
        conveyor_pipeline::{PipelineBuilder, RegisterStep, ServiceProvider},
        rstest::rstest,
        serde_json::json,
        tokio_util::sync::CancellationToken,
    };

    fn context(intent: MessageIntent, routing: RoutingOptions, bag: ContextBag) -> OutgoingLogicalContext {
        OutgoingLogicalContext::new(
            MessageId::generate(),
            intent,
            Headers::new(),
            LogicalMessage::new(Arc::new(MessageMetadata::message("OrderAccepted")), json!({})),
            routing,
            bag,
            ServiceProvider::empty(),
        )
    }

    fn replying_to(reply_to: Option<&str>) -> ContextBag {
        let mut incoming_headers = Headers::new();
        if let Some(address) = reply_to {
            incoming_headers.insert(headers::REPLY_TO_ADDRESS.into(), address.into());
        }
        let mut bag = ContextBag::default();
        bag.set(IncomingMessage::new(
            MessageId::new("incoming").unwrap(),
            incoming_headers,
            "",
        ))
        .unwrap();
        bag.child()
    }

    #[test]
    fn reply_routes_to_incoming_reply_to_address() {
        let ctx = context(MessageIntent::Reply, RoutingOptions::default(), replying_to(Some("X")));
        assert_eq!(DetermineRouteForReplyBehavior::resolve(&ctx).unwrap(), "X");
    }

    #[test]
    fn reply_prefers_explicit_destination() {
        let mut routing = RoutingOptions::default();
        routing.set_destination("Elsewhere").unwrap();
        let ctx = context(MessageIntent::Reply, routing, replying_to(Some("X")));
        assert_eq!(
            DetermineRouteForReplyBehavior::resolve(&ctx).unwrap(),
            "Elsewhere"
        );
    }

    #[rstest]
    #[case::no_reply_to_header(replying_to(None))]
    #[case::outside_a_handler(ContextBag::default())]
    fn reply_without_destination_names_the_message_type(#[case] bag: ContextBag) {
        let ctx = context(MessageIntent::Reply, RoutingOptions::default(), bag);
        let err = DetermineRouteForReplyBehavior::resolve(&ctx).unwrap_err();
        assert!(matches!(err, Error::NoReplyDestination { .. }));
        assert!(err.to_string().contains("OrderAccepted"));
    }

    #[tokio::test]
    async fn reply_behavior_sets_single_unicast_strategy() {
        let mut ctx = context(MessageIntent::Reply, RoutingOptions::default(), replying_to(Some("X")));
        let mut builder = PipelineBuilder::new("outgoing-logical");
        builder.register(RegisterStep::new("reply-route", DetermineRouteForReplyBehavior));
        builder
            .build()
            .unwrap()
            .execute(&mut ctx, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(ctx.routing_strategies, vec![RoutingStrategy::unicast("X")]);
    }

    fn send_router(addresses: ReceiveAddresses) -> DetermineRouteForSendBehavior {
        DetermineRouteForSendBehavior::new(
            addresses,
            Arc::new(StaticRoutingTable::default().with_route("OrderAccepted", "Billing")),
        )
    }

    #[test]
    fn send_uses_routing_table_by_default() {
        let ctx = context(MessageIntent::Send, RoutingOptions::default(), ContextBag::default());
        let router = send_router(ReceiveAddresses::new("Sales"));
        assert_eq!(router.resolve(&ctx).unwrap(), "Billing");
    }

    #[test]
    fn send_explicit_destination_wins() {
        let mut routing = RoutingOptions::default();
        routing.set_destination("Shipping").unwrap();
        let ctx = context(MessageIntent::Send, routing, ContextBag::default());
        let router = send_router(ReceiveAddresses::new("Sales"));
        assert_eq!(router.resolve(&ctx).unwrap(), "Shipping");
    }

    #[test]
    fn send_to_this_endpoint_resolves_to_self() {
        let mut routing = RoutingOptions::default();
        routing.route_to_this_endpoint().unwrap();
        let ctx = context(MessageIntent::Send, routing, ContextBag::default());
        let router = send_router(ReceiveAddresses::with_instance("Sales", "Sales-blue"));
        assert_eq!(router.resolve(&ctx).unwrap(), "Sales");
    }

    #[test]
    fn send_to_specific_instance_appends_suffix() {
        let mut routing = RoutingOptions::default();
        routing.route_to_specific_instance("green").unwrap();
        let ctx = context(MessageIntent::Send, routing, ContextBag::default());
        let router = send_router(ReceiveAddresses::new("Sales"));
        assert_eq!(router.resolve(&ctx).unwrap(), "Sales-green");
    }

    #[test]
    fn send_to_this_instance_requires_discriminator() {
        let mut routing = RoutingOptions::default();
        routing.route_to_this_instance().unwrap();
        let ctx = context(MessageIntent::Send, routing, ContextBag::default());

        let err = send_router(ReceiveAddresses::new("Sales"))
            .resolve(&ctx)
            .unwrap_err();
        assert!(matches!(err, Error::NoInstanceDiscriminator));

        let router = send_router(ReceiveAddresses::with_instance("Sales", "Sales-blue"));
        assert_eq!(router.resolve(&ctx).unwrap(), "Sales-blue");
    }

    #[tokio::test]
    async fn send_without_route_fails_before_dispatch() {
        let mut ctx = context(MessageIntent::Send, RoutingOptions::default(), ContextBag::default());
        let router = DetermineRouteForSendBehavior::new(
            ReceiveAddresses::new("Sales"),
            Arc::new(StaticRoutingTable::default()),
        );
        let mut builder = PipelineBuilder::new("outgoing-logical");
        builder.register(RegisterStep::new("send-route", router));
        let err = builder
            .build()
            .unwrap()
            .execute(&mut ctx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::NoRoute { message_type }) if message_type == "OrderAccepted"
        ));
        assert!(ctx.routing_strategies.is_empty());
    }

    #[tokio::test]
    async fn route_behaviors_ignore_other_intents() {
        let mut ctx = context(MessageIntent::Publish, RoutingOptions::default(), ContextBag::default());
        let mut builder = PipelineBuilder::new("outgoing-logical");
        builder.register(RegisterStep::new("reply-route", DetermineRouteForReplyBehavior));
        builder.register(RegisterStep::new(
            "send-route",
            send_router(ReceiveAddresses::new("Sales")),
        ));
        builder
            .build()
            .unwrap()
            .execute(&mut ctx, &CancellationToken::new())
            .await
            .unwrap();
        assert!(ctx.routing_strategies.is_empty());
    }
}
