//! Sending messages from outside a handler.

use std::sync::Arc;

use {serde::Serialize, tokio_util::sync::CancellationToken, tracing::info};

use {
    conveyor_common::{
        Headers, MessageId, MessageIntent, OutgoingMessage, PublishOptions, ReceiveAddresses,
        RoutingOptions, SendOptions, headers,
    },
    conveyor_routing::{RoutingTable, SubscriptionGuard, SubscriptionMode},
};

use crate::{
    error::Error,
    outgoing::{OutgoingPipeline, OutgoingRequest},
    transport::Transport,
};

/// Handle for sending, publishing and managing subscriptions.
///
/// Cheap to clone. Operations go to the transport right away; there is no
/// incoming message to batch them with.
#[derive(Clone)]
pub struct MessageSession {
    outgoing: Arc<OutgoingPipeline>,
    transport: Arc<dyn Transport>,
    table: Arc<dyn RoutingTable>,
    guard: SubscriptionGuard,
    addresses: Option<ReceiveAddresses>,
    cancellation: CancellationToken,
}

impl MessageSession {
    pub(crate) fn new(
        outgoing: Arc<OutgoingPipeline>,
        transport: Arc<dyn Transport>,
        table: Arc<dyn RoutingTable>,
        guard: SubscriptionGuard,
        addresses: Option<ReceiveAddresses>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            outgoing,
            transport,
            table,
            guard,
            addresses,
            cancellation,
        }
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

    /// Subscribe this endpoint to an event.
    ///
    /// With native pub/sub the transport records the subscription; in
    /// message-driven mode a subscribe request goes to the publisher
    /// configured for the event.
    pub async fn subscribe(&self, message_type: &str) -> anyhow::Result<()> {
        let metadata = self.outgoing.registry().require(message_type)?;
        self.guard.ensure_can_subscribe(&metadata)?;
        self.change_subscription(MessageIntent::Subscribe, message_type)
            .await
    }

    pub async fn unsubscribe(&self, message_type: &str) -> anyhow::Result<()> {
        let metadata = self.outgoing.registry().require(message_type)?;
        self.guard.ensure_can_unsubscribe(&metadata)?;
        self.change_subscription(MessageIntent::Unsubscribe, message_type)
            .await
    }

    async fn change_subscription(
        &self,
        intent: MessageIntent,
        message_type: &str,
    ) -> anyhow::Result<()> {
        let addresses = self.addresses.as_ref().ok_or(Error::SendOnlyReceive)?;
        let subscriber = addresses.main_receive_address();

        match (self.guard.mode(), intent) {
            (SubscriptionMode::Native, MessageIntent::Subscribe) => {
                self.transport.subscribe(subscriber, message_type).await?;
            },
            (SubscriptionMode::Native, _) => {
                self.transport.unsubscribe(subscriber, message_type).await?;
            },
            (SubscriptionMode::MessageDriven, _) => {
                let publisher = self.table.publisher(message_type).ok_or_else(|| {
                    conveyor_routing::Error::NoPublisher {
                        message_type: message_type.to_string(),
                    }
                })?;
                let mut request_headers = Headers::new();
                request_headers.insert(headers::MESSAGE_INTENT.into(), intent.as_str().into());
                request_headers.insert(
                    headers::SUBSCRIPTION_MESSAGE_TYPE.into(),
                    message_type.to_string(),
                );
                request_headers.insert(headers::REPLY_TO_ADDRESS.into(), subscriber.to_string());
                let request = OutgoingMessage::new(MessageId::generate(), request_headers, "");
                self.transport.send(request, &publisher).await?;
            },
        }
        info!(%intent, message_type, subscriber, "subscription changed");
        Ok(())
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
            .dispatch(request, None, &self.cancellation)
            .await
    }
}
