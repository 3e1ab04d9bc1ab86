use conveyor_config::Diagnostic;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid endpoint configuration: {}", summarize(.diagnostics))]
    InvalidConfig { diagnostics: Vec<Diagnostic> },

    #[error("no transport configured; call `EndpointBuilder::transport` before building")]
    NoTransport,

    #[error("handler `{handler}` is registered for unknown message type `{message_type}`")]
    HandlerForUnknownType {
        handler: String,
        message_type: String,
    },

    #[error("the endpoint is already started")]
    AlreadyStarted,

    #[error("send-only endpoints cannot receive messages")]
    SendOnlyReceive,

    #[error(transparent)]
    Config(#[from] conveyor_config::Error),

    #[error(transparent)]
    Pipeline(#[from] conveyor_pipeline::Error),

    #[error(transparent)]
    Recoverability(#[from] conveyor_recoverability::Error),

    #[error(transparent)]
    Common(#[from] conveyor_common::Error),
}

fn summarize(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .iter()
        .map(|d| format!("{}: {}", d.path, d.message))
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, Error>;
