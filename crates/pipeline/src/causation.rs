//! Conversation, correlation and related-to headers on outgoing messages.

use std::sync::Arc;

use {async_trait::async_trait, tracing::debug};

use conveyor_common::{MessageId, MessageIntent, headers};

use crate::{
    behavior::{Behavior, Next},
    context::OutgoingLogicalContext,
    error::{Error, Result},
};

/// Conversation id chosen by a custom strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationId {
    /// Let the endpoint generate one.
    Default,
    Custom(String),
}

impl ConversationId {
    pub fn custom(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(Error::EmptyConversationId);
        }
        Ok(Self::Custom(value))
    }
}

/// User callback choosing the conversation id of a message that starts a
/// new conversation. It sees the outgoing message and its headers.
pub type ConversationIdStrategy =
    Arc<dyn Fn(&OutgoingLogicalContext) -> anyhow::Result<ConversationId> + Send + Sync>;

/// Stamps causation headers on every outgoing message.
///
/// Inside a handler the incoming conversation id is carried over and the
/// incoming message id becomes the related-to value. Outside a handler a
/// new conversation starts, using the custom strategy when one is set.
#[derive(Default)]
pub struct AttachCausationHeadersBehavior {
    strategy: Option<ConversationIdStrategy>,
}

impl AttachCausationHeadersBehavior {
    pub fn new(strategy: Option<ConversationIdStrategy>) -> Self {
        Self { strategy }
    }

    fn new_conversation_id(&self, context: &OutgoingLogicalContext) -> Result<String> {
        let Some(strategy) = &self.strategy else {
            return Ok(MessageId::generate().to_string());
        };
        match strategy(context) {
            Ok(ConversationId::Custom(id)) => Ok(id),
            Ok(ConversationId::Default) => Ok(MessageId::generate().to_string()),
            Err(source) => Err(Error::ConversationIdStrategy { source }),
        }
    }
}

#[async_trait]
impl Behavior<OutgoingLogicalContext> for AttachCausationHeadersBehavior {
    async fn invoke(
        &self,
        context: &mut OutgoingLogicalContext,
        next: Next<'_, OutgoingLogicalContext>,
    ) -> anyhow::Result<()> {
        let incoming = context.incoming_message();

        let incoming_conversation = incoming
            .as_ref()
            .and_then(|m| m.headers.get(headers::CONVERSATION_ID).cloned());
        match incoming_conversation {
            Some(incoming_id) => {
                if let Some(requested) = context.headers.get(headers::CONVERSATION_ID)
                    && *requested != incoming_id
                {
                    return Err(Error::ConversationIdOverride {
                        requested: requested.clone(),
                        incoming: incoming_id,
                    }
                    .into());
                }
                context
                    .headers
                    .insert(headers::CONVERSATION_ID.into(), incoming_id);
            },
            None if context.headers.contains_key(headers::CONVERSATION_ID) => {},
            None => {
                let id = self.new_conversation_id(context)?;
                debug!(conversation_id = %id, "starting new conversation");
                context.headers.insert(headers::CONVERSATION_ID.into(), id);
            },
        }

        let correlation_id = match (&incoming, context.intent()) {
            (Some(incoming), MessageIntent::Reply) => incoming
                .headers
                .get(headers::CORRELATION_ID)
                .cloned()
                .unwrap_or_else(|| incoming.message_id.to_string()),
            _ => context.message_id().to_string(),
        };
        context
            .headers
            .entry(headers::CORRELATION_ID.into())
            .or_insert(correlation_id);

        if let Some(incoming) = &incoming {
            context
                .headers
                .insert(headers::RELATED_TO.into(), incoming.message_id.to_string());
        }

        next.run(context).await
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            pipeline::{PipelineBuilder, RegisterStep},
            services::ServiceProvider,
        },
        bytes::Bytes,
        conveyor_common::{
            ContextBag, Headers, IncomingMessage, LogicalMessage, MessageMetadata, RoutingOptions,
        },
        serde_json::json,
        tokio_util::sync::CancellationToken,
    };

    fn outgoing(bag: ContextBag, intent: MessageIntent) -> OutgoingLogicalContext {
        OutgoingLogicalContext::new(
            MessageId::generate(),
            intent,
            Headers::new(),
            LogicalMessage::new(Arc::new(MessageMetadata::command("ShipOrder")), json!({})),
            RoutingOptions::default(),
            bag,
            ServiceProvider::empty(),
        )
    }

    async fn run(
        behavior: AttachCausationHeadersBehavior,
        context: &mut OutgoingLogicalContext,
    ) -> anyhow::Result<()> {
        let mut builder = PipelineBuilder::new("outgoing-logical");
        builder.register(RegisterStep::new("causation", behavior));
        builder
            .build()?
            .execute(context, &CancellationToken::new())
            .await
            .map(|_| ())
    }

    fn bag_with_incoming(headers: Headers) -> (ContextBag, MessageId) {
        let id = MessageId::new("incoming-1").unwrap();
        let mut bag = ContextBag::default();
        bag.set(IncomingMessage::new(id.clone(), headers, Bytes::new()))
            .unwrap();
        (bag.child(), id)
    }

    #[test]
    fn empty_custom_conversation_id_is_rejected() {
        assert!(matches!(
            ConversationId::custom(""),
            Err(Error::EmptyConversationId)
        ));
        assert_eq!(
            ConversationId::custom("abc").unwrap(),
            ConversationId::Custom("abc".into())
        );
    }

    #[tokio::test]
    async fn conversation_id_is_propagated_from_incoming() {
        let mut incoming_headers = Headers::new();
        incoming_headers.insert(headers::CONVERSATION_ID.into(), "conv-1".into());
        let (bag, incoming_id) = bag_with_incoming(incoming_headers);
        let mut context = outgoing(bag, MessageIntent::Send);

        run(AttachCausationHeadersBehavior::default(), &mut context)
            .await
            .unwrap();

        assert_eq!(context.headers[headers::CONVERSATION_ID], "conv-1");
        assert_eq!(context.headers[headers::RELATED_TO], incoming_id.as_str());
    }

    #[tokio::test]
    async fn overriding_incoming_conversation_id_fails() {
        let mut incoming_headers = Headers::new();
        incoming_headers.insert(headers::CONVERSATION_ID.into(), "conv-1".into());
        let (bag, _) = bag_with_incoming(incoming_headers);
        let mut context = outgoing(bag, MessageIntent::Send);
        context
            .headers
            .insert(headers::CONVERSATION_ID.into(), "mine".into());

        let err = run(AttachCausationHeadersBehavior::default(), &mut context)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::ConversationIdOverride { .. })
        ));
    }

    #[tokio::test]
    async fn custom_strategy_starts_new_conversation() {
        let strategy: ConversationIdStrategy = Arc::new(|ctx: &OutgoingLogicalContext| -> anyhow::Result<ConversationId> {
            Ok(ConversationId::custom(format!(
                "conv-{}",
                ctx.message().message_type()
            ))?)
        });
        let mut context = outgoing(ContextBag::default(), MessageIntent::Send);

        run(AttachCausationHeadersBehavior::new(Some(strategy)), &mut context)
            .await
            .unwrap();

        assert_eq!(context.headers[headers::CONVERSATION_ID], "conv-ShipOrder");
        assert!(!context.headers.contains_key(headers::RELATED_TO));
    }

    #[tokio::test]
    async fn failing_strategy_is_wrapped() {
        let strategy: ConversationIdStrategy =
            Arc::new(|_: &OutgoingLogicalContext| -> anyhow::Result<ConversationId> {
                anyhow::bail!("strategy exploded")
            });
        let mut context = outgoing(ContextBag::default(), MessageIntent::Send);

        let err = run(AttachCausationHeadersBehavior::new(Some(strategy)), &mut context)
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "Failed to execute the custom conversation ID strategy"
        );
        let chain: Vec<String> = err.chain().map(ToString::to_string).collect();
        assert!(chain.iter().any(|e| e == "strategy exploded"));
    }

    #[tokio::test]
    async fn reply_correlates_with_incoming_message() {
        let (bag, incoming_id) = bag_with_incoming(Headers::new());
        let mut context = outgoing(bag, MessageIntent::Reply);

        run(AttachCausationHeadersBehavior::default(), &mut context)
            .await
            .unwrap();

        assert_eq!(
            context.headers[headers::CORRELATION_ID],
            incoming_id.as_str()
        );
        assert!(context.headers.contains_key(headers::CONVERSATION_ID));
    }
}
