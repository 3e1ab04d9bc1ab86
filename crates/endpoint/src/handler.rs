//! User message handlers and the context they run with.

use std::{collections::HashMap, sync::Arc};

use {
    async_trait::async_trait, serde::Serialize, serde_json::Value,
    tokio_util::sync::CancellationToken,
};

use conveyor_common::{
    ContextBag, Headers, MessageId, MessageIntent, PublishOptions, ReplyOptions, RoutingOptions,
    SendOptions,
};

use crate::outgoing::{OutgoingPipeline, OutgoingRequest};

/// Handles one message type.
///
/// A handler registered for a type also receives messages of types that
/// declare it as an ancestor.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn message_type(&self) -> &str;

    /// Name used in logs and the invoke-handler context.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn handle(
        &self,
        message: &Value,
        context: &mut MessageHandlerContext,
    ) -> anyhow::Result<()>;
}

/// What a handler can do while processing a message.
///
/// Messages sent from here are held back until every handler of the
/// incoming message succeeded.
pub struct MessageHandlerContext {
    message_id: MessageId,
    headers: Headers,
    outgoing: Arc<OutgoingPipeline>,
    extensions: ContextBag,
    cancellation: CancellationToken,
    stop_dispatching: bool,
}

impl MessageHandlerContext {
    pub(crate) fn new(
        message_id: MessageId,
        headers: Headers,
        outgoing: Arc<OutgoingPipeline>,
        extensions: ContextBag,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            message_id,
            headers,
            outgoing,
            extensions,
            cancellation,
            stop_dispatching: false,
        }
    }

    /// Id of the message being handled.
    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub async fn send<T: Serialize + Sync>(
        &self,
        message_type: &str,
        message: &T,
        options: SendOptions,
    ) -> anyhow::Result<()> {
        self.dispatch(MessageIntent::Send, message_type, message, options.into_parts())
            .await
    }

    /// Send to this endpoint's own queue.
    pub async fn send_local<T: Serialize + Sync>(
        &self,
        message_type: &str,
        message: &T,
        mut options: SendOptions,
    ) -> anyhow::Result<()> {
        options.route_to_this_endpoint()?;
        self.send(message_type, message, options).await
    }

    pub async fn publish<T: Serialize + Sync>(
        &self,
        message_type: &str,
        message: &T,
        options: PublishOptions,
    ) -> anyhow::Result<()> {
        self.dispatch(MessageIntent::Publish, message_type, message, options.into_parts())
            .await
    }

    /// Reply to the sender of the message being handled.
    pub async fn reply<T: Serialize + Sync>(
        &self,
        message_type: &str,
        message: &T,
        options: ReplyOptions,
    ) -> anyhow::Result<()> {
        self.dispatch(MessageIntent::Reply, message_type, message, options.into_parts())
            .await
    }

    /// Skip the handlers that would run after this one.
    pub fn do_not_continue_dispatching(&mut self) {
        self.stop_dispatching = true;
    }

    pub fn dispatching_stopped(&self) -> bool {
        self.stop_dispatching
    }

    async fn dispatch<T: Serialize + Sync>(
        &self,
        intent: MessageIntent,
        message_type: &str,
        message: &T,
        (message_id, headers, routing): (MessageId, Headers, RoutingOptions),
    ) -> anyhow::Result<()> {
        let request = OutgoingRequest {
            intent,
            message_type: message_type.to_string(),
            instance: serde_json::to_value(message)?,
            message_id,
            headers,
            routing,
        };
        self.outgoing
            .dispatch(request, Some(&self.extensions), &self.cancellation)
            .await
    }
}

/// Handlers registered on the endpoint, by the message type they handle.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    by_type: HashMap<String, Vec<Arc<dyn MessageHandler>>>,
}

impl HandlerRegistry {
    pub(crate) fn add(&mut self, handler: Arc<dyn MessageHandler>) {
        self.by_type
            .entry(handler.message_type().to_string())
            .or_default()
            .push(handler);
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<dyn MessageHandler>> {
        self.by_type.values().flatten()
    }

    /// Handlers for `types`, most-derived type first, each in registration
    /// order.
    pub(crate) fn for_types<'a>(
        &'a self,
        types: &'a [String],
    ) -> impl Iterator<Item = &'a Arc<dyn MessageHandler>> + 'a {
        types
            .iter()
            .filter_map(|message_type| self.by_type.get(message_type))
            .flatten()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str, &'static str);

    #[async_trait]
    impl MessageHandler for Named {
        fn message_type(&self) -> &str {
            self.0
        }

        fn name(&self) -> &str {
            self.1
        }

        async fn handle(&self, _: &Value, _: &mut MessageHandlerContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn handlers_are_listed_most_derived_first() {
        let mut registry = HandlerRegistry::default();
        registry.add(Arc::new(Named("OrderEvent", "audit")));
        registry.add(Arc::new(Named("OrderPlaced", "ship")));
        registry.add(Arc::new(Named("OrderPlaced", "bill")));
        registry.add(Arc::new(Named("Unrelated", "noise")));

        let types = vec!["OrderPlaced".to_string(), "OrderEvent".to_string()];
        let names: Vec<&str> = registry.for_types(&types).map(|h| h.name()).collect();
        assert_eq!(names, ["ship", "bill", "audit"]);
        assert_eq!(registry.iter().count(), 4);
    }
}
