use conveyor_common::MessageIntent;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(
        "cannot combine `route reply to any instance` and `route reply to this instance` on the same options"
    )]
    ConflictingReplyOptions,

    #[error(
        "cannot route to this instance since the endpoint has no instance discriminator configured"
    )]
    NoInstanceDiscriminator,

    #[error("a send-only endpoint has no receive address to use for `{option}`")]
    NoReceiveAddress { option: &'static str },

    #[error(
        "no destination could be determined for the reply message of type `{message_type}`: the incoming message carries no reply-to address and no explicit destination was set"
    )]
    NoReplyDestination { message_type: String },

    #[error("no destination specified for message `{message_type}`; add a route for it")]
    NoRoute { message_type: String },

    #[error("no publisher is configured for event `{message_type}`")]
    NoPublisher { message_type: String },

    #[error(
        "Send-only endpoints cannot subscribe to events. Remove the send-only setting to subscribe to `{message_type}`"
    )]
    SendOnlySubscribe { message_type: String },

    #[error(
        "Send-only endpoints cannot unsubscribe from events. Remove the send-only setting to unsubscribe from `{message_type}`"
    )]
    SendOnlyUnsubscribe { message_type: String },

    #[error("{intent} is not allowed for command `{message_type}`; commands are sent, not published")]
    CommandSubscription {
        intent: MessageIntent,
        message_type: String,
    },
}

impl Error {
    #[must_use]
    pub fn no_route(message_type: impl Into<String>) -> Self {
        Self::NoRoute {
            message_type: message_type.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
