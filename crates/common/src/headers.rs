//! Well-known header names surfaced on the wire.

/// Stable identity of the message across retries.
pub const MESSAGE_ID: &str = "Conveyor.MessageId";
/// Correlates a reply with the message that caused it.
pub const CORRELATION_ID: &str = "Conveyor.CorrelationId";
/// Groups every message caused by the same originating message.
pub const CONVERSATION_ID: &str = "Conveyor.ConversationId";
/// Id of the incoming message that caused this one.
pub const RELATED_TO: &str = "Conveyor.RelatedTo";
/// Address a recipient should send replies to.
pub const REPLY_TO_ADDRESS: &str = "Conveyor.ReplyToAddress";
/// Send, publish, reply, subscribe or unsubscribe.
pub const MESSAGE_INTENT: &str = "Conveyor.MessageIntent";
/// Logical type name of the body.
pub const ENCLOSED_MESSAGE_TYPES: &str = "Conveyor.EnclosedMessageTypes";
pub const CONTENT_TYPE: &str = "Conveyor.ContentType";
/// Time, in milliseconds, after which the transport may discard the message.
pub const TIME_TO_BE_RECEIVED: &str = "Conveyor.TimeToBeReceived";
pub const TIME_SENT: &str = "Conveyor.TimeSent";
pub const ORIGINATING_ENDPOINT: &str = "Conveyor.OriginatingEndpoint";
/// W3C trace parent of the send that produced the message.
pub const TRACE_PARENT: &str = "traceparent";

// ── Subscriptions ───────────────────────────────────────────────────────────

/// Event type carried by a message-driven subscribe/unsubscribe request.
pub const SUBSCRIPTION_MESSAGE_TYPE: &str = "Conveyor.SubscriptionMessageType";

// ── Recoverability ──────────────────────────────────────────────────────────

/// Number of delayed retries already performed for this message.
pub const DELAYED_RETRIES: &str = "Conveyor.Retries";
pub const DELAYED_RETRIES_TIMESTAMP: &str = "Conveyor.Retries.Timestamp";
/// Queue the message was being processed from when it failed.
pub const FAILED_QUEUE: &str = "Conveyor.FailedQ";
pub const EXCEPTION_MESSAGE: &str = "Conveyor.ExceptionInfo.Message";
/// Full error chain, outermost first, joined with `: `.
pub const EXCEPTION_CHAIN: &str = "Conveyor.ExceptionInfo.Chain";
pub const TIME_OF_FAILURE: &str = "Conveyor.TimeOfFailure";
pub const PROCESSING_ATTEMPTS: &str = "Conveyor.ProcessingAttempts";
