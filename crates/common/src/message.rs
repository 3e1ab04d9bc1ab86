//! Physical and logical message types.

use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use {
    bytes::Bytes,
    serde::{Deserialize, Serialize},
};

use crate::{
    error::{Error, Result},
    headers,
    routing::RoutingStrategy,
};

/// Message headers. Ordered so that two runs over the same input produce
/// byte-identical header sets.
pub type Headers = BTreeMap<String, String>;

// ── MessageId ───────────────────────────────────────────────────────────────

/// Identity of one logical message delivery, stable across its retries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(Error::EmptyMessageId);
        }
        Ok(Self(id))
    }

    /// Generate a fresh random identity.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for MessageId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for MessageId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<MessageId> for String {
    fn from(id: MessageId) -> Self {
        id.0
    }
}

// ── Physical messages ───────────────────────────────────────────────────────

/// A message as handed over by the transport.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub message_id: MessageId,
    pub headers: Headers,
    pub body: Bytes,
}

impl IncomingMessage {
    pub fn new(message_id: MessageId, headers: Headers, body: impl Into<Bytes>) -> Self {
        Self {
            message_id,
            headers,
            body: body.into(),
        }
    }

    /// The reply-to address the sender asked replies to be routed to.
    pub fn reply_to_address(&self) -> Option<&str> {
        self.headers
            .get(headers::REPLY_TO_ADDRESS)
            .map(String::as_str)
            .filter(|address| !address.is_empty())
    }

    /// Number of delayed retries already performed, read from the headers.
    pub fn delayed_retries(&self) -> u32 {
        self.headers
            .get(headers::DELAYED_RETRIES)
            .and_then(|value| value.parse().ok())
            .unwrap_or(0)
    }

    /// Copy of this message suitable for handing back to the transport.
    #[must_use]
    pub fn to_outgoing(&self) -> OutgoingMessage {
        OutgoingMessage {
            message_id: self.message_id.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }
}

/// A fully serialized message ready for dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub message_id: MessageId,
    pub headers: Headers,
    pub body: Bytes,
}

impl OutgoingMessage {
    pub fn new(message_id: MessageId, headers: Headers, body: impl Into<Bytes>) -> Self {
        Self {
            message_id,
            headers,
            body: body.into(),
        }
    }
}

/// One physical dispatch: a message and where it goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOperation {
    pub message: OutgoingMessage,
    pub strategy: RoutingStrategy,
}

// ── Logical messages ────────────────────────────────────────────────────────

/// What the sender intends the message to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageIntent {
    Send,
    Publish,
    Reply,
    Subscribe,
    Unsubscribe,
}

impl MessageIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Send => "Send",
            Self::Publish => "Publish",
            Self::Reply => "Reply",
            Self::Subscribe => "Subscribe",
            Self::Unsubscribe => "Unsubscribe",
        }
    }
}

impl fmt::Display for MessageIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message classification used by the best-practice guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Command,
    Event,
    #[default]
    Message,
}

/// Static description of one message type.
///
/// `parent` names the type this one derives from; lookups that honour
/// inheritance (e.g. time-to-be-received) walk this chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMetadata {
    pub message_type: String,
    pub kind: MessageKind,
    pub parent: Option<String>,
    pub time_to_be_received: Option<Duration>,
}

impl MessageMetadata {
    pub fn new(message_type: impl Into<String>, kind: MessageKind) -> Self {
        Self {
            message_type: message_type.into(),
            kind,
            parent: None,
            time_to_be_received: None,
        }
    }

    pub fn command(message_type: impl Into<String>) -> Self {
        Self::new(message_type, MessageKind::Command)
    }

    pub fn event(message_type: impl Into<String>) -> Self {
        Self::new(message_type, MessageKind::Event)
    }

    pub fn message(message_type: impl Into<String>) -> Self {
        Self::new(message_type, MessageKind::Message)
    }

    #[must_use]
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    #[must_use]
    pub fn with_time_to_be_received(mut self, ttbr: Duration) -> Self {
        self.time_to_be_received = Some(ttbr);
        self
    }
}

/// A deserialized message instance together with its type metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct LogicalMessage {
    pub metadata: Arc<MessageMetadata>,
    pub instance: serde_json::Value,
}

impl LogicalMessage {
    pub fn new(metadata: Arc<MessageMetadata>, instance: serde_json::Value) -> Self {
        Self { metadata, instance }
    }

    pub fn message_type(&self) -> &str {
        &self.metadata.message_type
    }
}
