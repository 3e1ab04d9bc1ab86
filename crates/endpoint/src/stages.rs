//! Connectors between stages and the terminal steps of each stage.
//!
//! Every connector is registered as the terminal step of its stage. It
//! builds the context of the next stage from its own and runs that stage's
//! pipeline with the same cancellation token.

use std::{collections::HashSet, sync::Arc};

use {
    async_trait::async_trait,
    chrono::Utc,
    tracing::{debug, info},
};

use {
    conveyor_common::{
        LogicalMessage, MessageIntent, MessageMetadata, OutgoingMessage, TransportOperation,
        Unrecoverable, headers,
    },
    conveyor_pipeline::{
        Behavior, IncomingLogicalContext, IncomingPhysicalContext, InvokeHandlerContext,
        MessageMetadataRegistry, MessageSerializer, Next, OutgoingLogicalContext,
        OutgoingPhysicalContext, Pipeline,
    },
    conveyor_routing::SubscriptionStore,
};

use crate::{
    handler::{HandlerRegistry, MessageHandler, MessageHandlerContext},
    outgoing::{OutgoingPipeline, PendingOperations, dispatch_operations},
    transport::Transport,
};

/// Ids of the steps the endpoint registers, for ordering custom steps
/// against them.
pub mod steps {
    pub const SUBSCRIPTION_REQUESTS: &str = "subscription-requests";
    pub const DESERIALIZE: &str = "deserialize";
    pub const MUTATE_INCOMING: &str = "mutate-incoming";
    pub const LOAD_HANDLERS: &str = "load-handlers";
    pub const INVOKE_HANDLER: &str = "invoke-handler";
    pub const MUTATE_OUTGOING: &str = "mutate-outgoing";
    pub const CAUSATION: &str = "causation";
    pub const TIME_TO_BE_RECEIVED: &str = "time-to-be-received";
    pub const REPLY_TO: &str = "reply-to";
    pub const ROUTE_SEND: &str = "route-send";
    pub const ROUTE_REPLY: &str = "route-reply";
    pub const ROUTE_PUBLISH: &str = "route-publish";
    pub const SERIALIZE: &str = "serialize";
    pub const DISPATCH: &str = "dispatch";
}

/// `metadata`'s type followed by its ancestors, nearest first.
pub(crate) fn ancestry(registry: &MessageMetadataRegistry, metadata: &MessageMetadata) -> Vec<String> {
    let mut types = vec![metadata.message_type.clone()];
    let mut seen: HashSet<String> = types.iter().cloned().collect();
    let mut parent = metadata.parent.clone();
    while let Some(name) = parent {
        if !seen.insert(name.clone()) {
            break;
        }
        parent = registry.get(&name).and_then(|m| m.parent.clone());
        types.push(name);
    }
    types
}

// ── Incoming ────────────────────────────────────────────────────────────────

/// Physical → logical: resolve the enclosed type and deserialize the body.
///
/// A message whose type is unknown or whose body cannot be read will fail
/// the same way on every attempt, so these failures are [`Unrecoverable`].
pub(crate) struct DeserializeConnector {
    registry: Arc<MessageMetadataRegistry>,
    serializer: Arc<dyn MessageSerializer>,
    logical: Arc<Pipeline<IncomingLogicalContext>>,
}

impl DeserializeConnector {
    pub(crate) fn new(
        registry: Arc<MessageMetadataRegistry>,
        serializer: Arc<dyn MessageSerializer>,
        logical: Arc<Pipeline<IncomingLogicalContext>>,
    ) -> Self {
        Self {
            registry,
            serializer,
            logical,
        }
    }

    fn metadata(&self, context: &IncomingPhysicalContext) -> Result<Arc<MessageMetadata>, Unrecoverable> {
        let enclosed = context
            .message
            .headers
            .get(headers::ENCLOSED_MESSAGE_TYPES)
            .ok_or_else(|| Unrecoverable::new("message carries no enclosed message type"))?;
        enclosed
            .split(';')
            .map(str::trim)
            .find_map(|message_type| self.registry.get(message_type))
            .ok_or_else(|| {
                Unrecoverable::new(format!("no message type registered for `{enclosed}`"))
            })
    }
}

#[async_trait]
impl Behavior<IncomingPhysicalContext> for DeserializeConnector {
    async fn invoke(
        &self,
        context: &mut IncomingPhysicalContext,
        next: Next<'_, IncomingPhysicalContext>,
    ) -> anyhow::Result<()> {
        let metadata = self.metadata(context)?;
        let instance = self
            .serializer
            .deserialize(&metadata, &context.message.body)
            .map_err(|source| {
                Unrecoverable::with_source(
                    format!("body of message `{}` could not be deserialized", context.message_id()),
                    source,
                )
            })?;

        let mut logical = IncomingLogicalContext::new(
            context.message_id().clone(),
            context.message.headers.clone(),
            LogicalMessage::new(metadata, instance),
            context.extensions.child(),
            context.services.clone(),
        );
        self.logical
            .execute(&mut logical, next.cancellation_token())
            .await?;
        Ok(())
    }
}

/// Logical → invoke-handler: run the invoke stage once per handler.
///
/// Handlers come from the endpoint's registrations and from the service
/// provider; a handler for an ancestor type also sees derived messages.
pub(crate) struct LoadHandlersConnector {
    handlers: Arc<HandlerRegistry>,
    registry: Arc<MessageMetadataRegistry>,
    invoke: Arc<Pipeline<InvokeHandlerContext>>,
}

impl LoadHandlersConnector {
    pub(crate) fn new(
        handlers: Arc<HandlerRegistry>,
        registry: Arc<MessageMetadataRegistry>,
        invoke: Arc<Pipeline<InvokeHandlerContext>>,
    ) -> Self {
        Self {
            handlers,
            registry,
            invoke,
        }
    }
}

/// The handler an invoke-handler execution is for.
pub(crate) struct CurrentHandler(pub(crate) Arc<dyn MessageHandler>);

#[async_trait]
impl Behavior<IncomingLogicalContext> for LoadHandlersConnector {
    async fn invoke(
        &self,
        context: &mut IncomingLogicalContext,
        next: Next<'_, IncomingLogicalContext>,
    ) -> anyhow::Result<()> {
        let types = ancestry(&self.registry, &context.message().metadata);
        let mut handlers: Vec<Arc<dyn MessageHandler>> =
            self.handlers.for_types(&types).cloned().collect();
        handlers.extend(
            context
                .services
                .resolve_all::<dyn MessageHandler>()
                .into_iter()
                .filter(|handler| types.iter().any(|t| t == handler.message_type())),
        );

        if handlers.is_empty() {
            anyhow::bail!(
                "no handlers could be found for message type `{}`",
                context.message().message_type()
            );
        }

        for handler in handlers {
            let mut invoke = InvokeHandlerContext::new(
                context.message_id().clone(),
                context.headers.clone(),
                context.message().clone(),
                handler.name(),
                context.extensions.child(),
                context.services.clone(),
            );
            invoke.extensions.set(CurrentHandler(handler))?;
            self.invoke
                .execute(&mut invoke, next.cancellation_token())
                .await?;
            if invoke.dispatching_stopped() {
                debug!(
                    message_id = %context.message_id(),
                    handler = invoke.handler(),
                    "handler stopped dispatching"
                );
                break;
            }
        }
        Ok(())
    }
}

/// Terminal of the invoke-handler stage: call the user handler.
pub(crate) struct InvokeHandlerTerminator {
    outgoing: Arc<OutgoingPipeline>,
}

impl InvokeHandlerTerminator {
    pub(crate) fn new(outgoing: Arc<OutgoingPipeline>) -> Self {
        Self { outgoing }
    }
}

#[async_trait]
impl Behavior<InvokeHandlerContext> for InvokeHandlerTerminator {
    async fn invoke(
        &self,
        context: &mut InvokeHandlerContext,
        next: Next<'_, InvokeHandlerContext>,
    ) -> anyhow::Result<()> {
        let Some(CurrentHandler(handler)) = context.extensions.get::<CurrentHandler>() else {
            anyhow::bail!("no handler set for invoke-handler step `{}`", context.handler());
        };
        let handler = Arc::clone(handler);

        let mut handler_context = MessageHandlerContext::new(
            context.message_id().clone(),
            context.headers.clone(),
            Arc::clone(&self.outgoing),
            context.extensions.clone(),
            next.cancellation_token().clone(),
        );
        handler
            .handle(&context.message().instance, &mut handler_context)
            .await?;
        if handler_context.dispatching_stopped() {
            context.do_not_continue_dispatching();
        }
        Ok(())
    }
}

/// Short-circuits subscribe/unsubscribe control messages and records them
/// in the subscription store. Only registered for message-driven pub/sub.
pub(crate) struct SubscriptionRequestBehavior {
    store: Arc<dyn SubscriptionStore>,
}

impl SubscriptionRequestBehavior {
    pub(crate) fn new(store: Arc<dyn SubscriptionStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Behavior<IncomingPhysicalContext> for SubscriptionRequestBehavior {
    async fn invoke(
        &self,
        context: &mut IncomingPhysicalContext,
        next: Next<'_, IncomingPhysicalContext>,
    ) -> anyhow::Result<()> {
        let intent = match context.message.headers.get(headers::MESSAGE_INTENT) {
            Some(intent) if intent == MessageIntent::Subscribe.as_str() => MessageIntent::Subscribe,
            Some(intent) if intent == MessageIntent::Unsubscribe.as_str() => {
                MessageIntent::Unsubscribe
            },
            _ => return next.run(context).await,
        };

        let message_type = context
            .message
            .headers
            .get(headers::SUBSCRIPTION_MESSAGE_TYPE)
            .ok_or_else(|| Unrecoverable::new(format!("{intent} request without message type")))?;
        let subscriber = context
            .message
            .reply_to_address()
            .ok_or_else(|| Unrecoverable::new(format!("{intent} request without reply-to address")))?;

        if intent == MessageIntent::Subscribe {
            self.store.subscribe(subscriber, message_type).await?;
        } else {
            self.store.unsubscribe(subscriber, message_type).await?;
        }
        info!(%intent, subscriber, message_type = %message_type, "subscription request handled");
        Ok(())
    }
}

// ── Outgoing ────────────────────────────────────────────────────────────────

/// Logical → physical: serialize the instance and stamp the standard
/// headers.
pub(crate) struct SerializeConnector {
    serializer: Arc<dyn MessageSerializer>,
    physical: Arc<Pipeline<OutgoingPhysicalContext>>,
    endpoint: String,
}

impl SerializeConnector {
    pub(crate) fn new(
        serializer: Arc<dyn MessageSerializer>,
        physical: Arc<Pipeline<OutgoingPhysicalContext>>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            serializer,
            physical,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Behavior<OutgoingLogicalContext> for SerializeConnector {
    async fn invoke(
        &self,
        context: &mut OutgoingLogicalContext,
        next: Next<'_, OutgoingLogicalContext>,
    ) -> anyhow::Result<()> {
        if context.routing_strategies.is_empty() {
            debug!(
                message_id = %context.message_id(),
                message_type = %context.message().message_type(),
                "nothing to dispatch"
            );
            return Ok(());
        }

        let message = context.message();
        let body = self.serializer.serialize(&message.metadata, &message.instance)?;

        let mut message_headers = context.headers.clone();
        message_headers.insert(headers::MESSAGE_ID.into(), context.message_id().to_string());
        message_headers.insert(
            headers::ENCLOSED_MESSAGE_TYPES.into(),
            message.message_type().to_string(),
        );
        message_headers.insert(
            headers::CONTENT_TYPE.into(),
            self.serializer.content_type().to_string(),
        );
        message_headers.insert(
            headers::MESSAGE_INTENT.into(),
            context.intent().as_str().to_string(),
        );
        message_headers
            .entry(headers::TIME_SENT.into())
            .or_insert_with(|| Utc::now().to_rfc3339());
        message_headers
            .entry(headers::ORIGINATING_ENDPOINT.into())
            .or_insert_with(|| self.endpoint.clone());

        let mut physical = OutgoingPhysicalContext::new(
            context.message_id().clone(),
            message_headers,
            body,
            context.routing_strategies.clone(),
            context.extensions.child(),
            context.services.clone(),
        );
        self.physical
            .execute(&mut physical, next.cancellation_token())
            .await?;
        Ok(())
    }
}

/// Terminal of the outgoing physical stage.
///
/// Inside a handler the operations join the pending batch of the incoming
/// message; outside they go to the transport immediately.
pub(crate) struct DispatchConnector {
    transport: Arc<dyn Transport>,
}

impl DispatchConnector {
    pub(crate) fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl Behavior<OutgoingPhysicalContext> for DispatchConnector {
    async fn invoke(
        &self,
        context: &mut OutgoingPhysicalContext,
        _next: Next<'_, OutgoingPhysicalContext>,
    ) -> anyhow::Result<()> {
        let operations: Vec<TransportOperation> = context
            .routing_strategies
            .iter()
            .map(|strategy| TransportOperation {
                message: OutgoingMessage::new(
                    context.message_id().clone(),
                    context.headers.clone(),
                    context.body.clone(),
                ),
                strategy: strategy.clone(),
            })
            .collect();

        match context.extensions.get_arc::<PendingOperations>() {
            Some(pending) => {
                debug!(
                    message_id = %context.message_id(),
                    count = operations.len(),
                    "operations batched until handlers complete"
                );
                pending.push(operations);
                Ok(())
            },
            None => dispatch_operations(self.transport.as_ref(), operations).await,
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        conveyor_common::{ContextBag, Headers, IncomingMessage, MessageId},
        conveyor_pipeline::{JsonSerializer, PipelineBuilder, RegisterStep, ServiceProvider},
        conveyor_routing::InMemorySubscriptionStore,
        rstest::rstest,
        steps::{DESERIALIZE, SUBSCRIPTION_REQUESTS},
        tokio_util::sync::CancellationToken,
    };

    fn registry() -> Arc<MessageMetadataRegistry> {
        let mut registry = MessageMetadataRegistry::new();
        registry.register(MessageMetadata::event("OrderEvent"));
        registry.register(MessageMetadata::event("OrderPlaced").with_parent("OrderEvent"));
        Arc::new(registry)
    }

    fn incoming(headers: &[(&str, &str)], body: &'static str) -> IncomingPhysicalContext {
        let headers: Headers = headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        IncomingPhysicalContext::new(
            IncomingMessage::new(MessageId::generate(), headers, body),
            ContextBag::default(),
            ServiceProvider::empty(),
        )
    }

    fn deserialize_only() -> Pipeline<IncomingPhysicalContext> {
        let mut logical = PipelineBuilder::<IncomingLogicalContext>::new("incoming-logical");
        logical.register(RegisterStep::new("noop", Noop));
        let mut physical = PipelineBuilder::new("incoming-physical");
        physical.terminate_with(RegisterStep::new(
            DESERIALIZE,
            DeserializeConnector::new(
                registry(),
                Arc::new(JsonSerializer),
                Arc::new(logical.build().unwrap()),
            ),
        ));
        physical.build().unwrap()
    }

    struct Noop;

    #[async_trait]
    impl Behavior<IncomingLogicalContext> for Noop {
        async fn invoke(
            &self,
            context: &mut IncomingLogicalContext,
            next: Next<'_, IncomingLogicalContext>,
        ) -> anyhow::Result<()> {
            next.run(context).await
        }
    }

    #[test]
    fn ancestry_lists_nearest_first() {
        let registry = registry();
        let placed = registry.get("OrderPlaced").unwrap();
        assert_eq!(ancestry(&registry, &placed), ["OrderPlaced", "OrderEvent"]);
    }

    #[rstest]
    #[case::missing_type(&[], "{}")]
    #[case::unknown_type(&[(headers::ENCLOSED_MESSAGE_TYPES, "Nope")], "{}")]
    #[case::bad_body(&[(headers::ENCLOSED_MESSAGE_TYPES, "OrderPlaced")], "{oops")]
    #[tokio::test]
    async fn unreadable_messages_are_unrecoverable(
        #[case] headers: &[(&str, &str)],
        #[case] body: &'static str,
    ) {
        let mut context = incoming(headers, body);
        let error = deserialize_only()
            .execute(&mut context, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(error.is::<Unrecoverable>(), "{error:#}");
    }

    #[tokio::test]
    async fn known_message_reaches_logical_stage() {
        let mut context = incoming(&[(headers::ENCLOSED_MESSAGE_TYPES, "OrderPlaced")], r#"{"id":1}"#);
        deserialize_only()
            .execute(&mut context, &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn subscription_requests_are_recorded_and_short_circuit() {
        let store = Arc::new(InMemorySubscriptionStore::new());
        let mut builder = PipelineBuilder::new("incoming-physical");
        builder.register(RegisterStep::new(
            SUBSCRIPTION_REQUESTS,
            SubscriptionRequestBehavior::new(store.clone()),
        ));
        let pipeline = builder.build().unwrap();

        let mut context = incoming(
            &[
                (headers::MESSAGE_INTENT, "Subscribe"),
                (headers::SUBSCRIPTION_MESSAGE_TYPE, "OrderPlaced"),
                (headers::REPLY_TO_ADDRESS, "Shipping"),
            ],
            "",
        );
        let outcome = pipeline
            .execute(&mut context, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, conveyor_pipeline::Outcome::ShortCircuited { .. }));
        assert_eq!(store.subscribers("OrderPlaced").await.unwrap(), ["Shipping"]);

        let mut context = incoming(
            &[
                (headers::MESSAGE_INTENT, "Unsubscribe"),
                (headers::SUBSCRIPTION_MESSAGE_TYPE, "OrderPlaced"),
                (headers::REPLY_TO_ADDRESS, "Shipping"),
            ],
            "",
        );
        pipeline
            .execute(&mut context, &CancellationToken::new())
            .await
            .unwrap();
        assert!(store.subscribers("OrderPlaced").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn subscription_request_without_subscriber_is_unrecoverable() {
        let mut builder = PipelineBuilder::new("incoming-physical");
        builder.register(RegisterStep::new(
            SUBSCRIPTION_REQUESTS,
            SubscriptionRequestBehavior::new(Arc::new(InMemorySubscriptionStore::new())),
        ));
        let mut context = incoming(
            &[
                (headers::MESSAGE_INTENT, "Subscribe"),
                (headers::SUBSCRIPTION_MESSAGE_TYPE, "OrderPlaced"),
            ],
            "",
        );
        let error = builder
            .build()
            .unwrap()
            .execute(&mut context, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(error.is::<Unrecoverable>());
    }
}
