use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("pipeline execution was cancelled")]
    Cancelled,

    #[error("step `{id}` is registered more than once")]
    DuplicateStep { id: String },

    #[error("cannot replace step `{id}` because it has not been registered")]
    ReplaceUnknownStep { id: String },

    #[error("step `{step}` is ordered {relation} `{reference}`, which has not been registered")]
    UnknownReference {
        step: String,
        relation: &'static str,
        reference: String,
    },

    #[error("pipeline ordering contains a cycle between steps: {}", steps.join(", "))]
    Cycle { steps: Vec<String> },

    #[error(
        "Messages with TimeToBeReceived found but the selected transport does not support this type of restriction. Remove TimeToBeReceived from: {}",
        message_types.join(", ")
    )]
    TimeToBeReceivedUnsupported { message_types: Vec<String> },

    #[error("message type `{message_type}` has an inheritance cycle through `{through}`")]
    MetadataCycle {
        message_type: String,
        through: String,
    },

    #[error("message type `{message_type}` is not registered")]
    UnknownMessageType { message_type: String },

    #[error("a custom conversation id must not be empty")]
    EmptyConversationId,

    #[error("Failed to execute the custom conversation ID strategy")]
    ConversationIdStrategy {
        #[source]
        source: anyhow::Error,
    },

    #[error(
        "Cannot set the conversation id header to '{requested}' as it cannot override the incoming header value ('{incoming}')"
    )]
    ConversationIdOverride { requested: String, incoming: String },

    #[error("Return a future or mark the method as async.")]
    MutatorReturnedNoFuture,

    #[error("failed to serialize `{message_type}`")]
    Serialize {
        message_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to deserialize `{message_type}`")]
    Deserialize {
        message_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Common(#[from] conveyor_common::Error),
}

impl Error {
    #[must_use]
    pub fn duplicate_step(id: impl Into<String>) -> Self {
        Self::DuplicateStep { id: id.into() }
    }

    #[must_use]
    pub fn unknown_reference(
        step: impl Into<String>,
        relation: &'static str,
        reference: impl Into<String>,
    ) -> Self {
        Self::UnknownReference {
            step: step.into(),
            relation,
            reference: reference.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
