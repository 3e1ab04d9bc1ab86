//! Shared message model, context bag, settings, routing options and error
//! types used across all conveyor crates.

pub mod error;
pub mod extensions;
pub mod headers;
pub mod message;
pub mod routing;
pub mod settings;
pub mod trace;

pub use {
    error::{ConveyorError, Error, FromMessage, Result, Unrecoverable},
    extensions::{BagStrictness, ContextBag},
    message::{
        Headers, IncomingMessage, LogicalMessage, MessageId, MessageIntent, MessageKind,
        MessageMetadata, OutgoingMessage, TransportOperation,
    },
    routing::{
        PublishOptions, ReceiveAddresses, ReplyOptions, RoutingOptions, RoutingStrategy,
        SendOptions,
    },
    settings::SettingsHolder,
    trace::TraceContext,
};
