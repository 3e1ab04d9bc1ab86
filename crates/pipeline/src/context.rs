//! Stage contexts.
//!
//! Incoming work flows physical → logical → invoke-handler; outgoing work
//! flows logical → physical. Each context owns its stage data, an extension
//! bag and the service provider of the invocation. Child contexts receive a
//! [`ContextBag::child`] of their parent's bag.

use std::sync::Arc;

use bytes::Bytes;

use conveyor_common::{
    ContextBag, Headers, IncomingMessage, LogicalMessage, MessageId, MessageIntent,
    RoutingOptions, RoutingStrategy,
};

use crate::services::ServiceProvider;

// ── Incoming ────────────────────────────────────────────────────────────────

/// A raw message as received from the transport.
pub struct IncomingPhysicalContext {
    pub message: IncomingMessage,
    pub extensions: ContextBag,
    pub services: ServiceProvider,
}

impl IncomingPhysicalContext {
    pub fn new(message: IncomingMessage, extensions: ContextBag, services: ServiceProvider) -> Self {
        Self {
            message,
            extensions,
            services,
        }
    }

    pub fn message_id(&self) -> &MessageId {
        &self.message.message_id
    }
}

/// A deserialized incoming message.
pub struct IncomingLogicalContext {
    message_id: MessageId,
    pub headers: Headers,
    message: LogicalMessage,
    message_replaced: bool,
    pub extensions: ContextBag,
    pub services: ServiceProvider,
}

impl IncomingLogicalContext {
    pub fn new(
        message_id: MessageId,
        headers: Headers,
        message: LogicalMessage,
        extensions: ContextBag,
        services: ServiceProvider,
    ) -> Self {
        Self {
            message_id,
            headers,
            message,
            message_replaced: false,
            extensions,
            services,
        }
    }

    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    pub fn message(&self) -> &LogicalMessage {
        &self.message
    }

    /// Replace the message instance, keeping its type metadata.
    pub fn update_message_instance(&mut self, instance: serde_json::Value) {
        self.message.instance = instance;
        self.message_replaced = true;
    }

    pub fn message_replaced(&self) -> bool {
        self.message_replaced
    }
}

/// One handler invocation for an incoming logical message.
pub struct InvokeHandlerContext {
    message_id: MessageId,
    pub headers: Headers,
    message: LogicalMessage,
    handler: String,
    stop_dispatching: bool,
    pub extensions: ContextBag,
    pub services: ServiceProvider,
}

impl InvokeHandlerContext {
    pub fn new(
        message_id: MessageId,
        headers: Headers,
        message: LogicalMessage,
        handler: impl Into<String>,
        extensions: ContextBag,
        services: ServiceProvider,
    ) -> Self {
        Self {
            message_id,
            headers,
            message,
            handler: handler.into(),
            stop_dispatching: false,
            extensions,
            services,
        }
    }

    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    pub fn message(&self) -> &LogicalMessage {
        &self.message
    }

    /// Name of the handler this context invokes.
    pub fn handler(&self) -> &str {
        &self.handler
    }

    /// Skip the remaining handlers for the current message.
    pub fn do_not_continue_dispatching(&mut self) {
        self.stop_dispatching = true;
    }

    pub fn dispatching_stopped(&self) -> bool {
        self.stop_dispatching
    }
}

// ── Outgoing ────────────────────────────────────────────────────────────────

/// An outgoing message before serialization.
pub struct OutgoingLogicalContext {
    message_id: MessageId,
    intent: MessageIntent,
    pub headers: Headers,
    message: LogicalMessage,
    message_replaced: bool,
    pub routing: RoutingOptions,
    pub routing_strategies: Vec<RoutingStrategy>,
    pub extensions: ContextBag,
    pub services: ServiceProvider,
}

impl OutgoingLogicalContext {
    pub fn new(
        message_id: MessageId,
        intent: MessageIntent,
        headers: Headers,
        message: LogicalMessage,
        routing: RoutingOptions,
        extensions: ContextBag,
        services: ServiceProvider,
    ) -> Self {
        Self {
            message_id,
            intent,
            headers,
            message,
            message_replaced: false,
            routing,
            routing_strategies: Vec::new(),
            extensions,
            services,
        }
    }

    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    pub fn intent(&self) -> MessageIntent {
        self.intent
    }

    pub fn message(&self) -> &LogicalMessage {
        &self.message
    }

    pub fn update_message_instance(&mut self, instance: serde_json::Value) {
        self.message.instance = instance;
        self.message_replaced = true;
    }

    pub fn message_replaced(&self) -> bool {
        self.message_replaced
    }

    /// The incoming message being processed when this one was created, if
    /// the operation happens inside a handler.
    pub fn incoming_message(&self) -> Option<Arc<IncomingMessage>> {
        self.extensions.get_arc::<IncomingMessage>()
    }
}

/// A serialized outgoing message with its resolved routing.
pub struct OutgoingPhysicalContext {
    message_id: MessageId,
    pub headers: Headers,
    pub body: Bytes,
    pub routing_strategies: Vec<RoutingStrategy>,
    pub extensions: ContextBag,
    pub services: ServiceProvider,
}

impl OutgoingPhysicalContext {
    pub fn new(
        message_id: MessageId,
        headers: Headers,
        body: Bytes,
        routing_strategies: Vec<RoutingStrategy>,
        extensions: ContextBag,
        services: ServiceProvider,
    ) -> Self {
        Self {
            message_id,
            headers,
            body,
            routing_strategies,
            extensions,
            services,
        }
    }

    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }
}
