//! The endpoint host: wires the pipeline stages, routing and recoverability
//! around a [`Transport`] and runs the receive loop.
//!
//! ```rust,ignore
//! let broker = InMemoryBroker::new();
//! let mut endpoint = EndpointBuilder::new(config)
//!     .transport(Arc::new(InMemoryTransport::new(broker)))
//!     .message(MessageMetadata::command("PlaceOrder"))
//!     .handler(Arc::new(PlaceOrderHandler))
//!     .build()?;
//! endpoint.start()?;
//! endpoint.session().send_local("PlaceOrder", &order, SendOptions::new()).await?;
//! endpoint.stop().await;
//! ```

pub mod endpoint;
pub mod error;
pub mod handler;
pub mod memory;
pub mod outgoing;
mod receive;
pub mod session;
mod stages;
pub mod transport;

pub use {
    endpoint::{Endpoint, EndpointBuilder, keys},
    error::{Error, Result},
    handler::{MessageHandler, MessageHandlerContext},
    memory::{InMemoryBroker, InMemoryTransport},
    outgoing::OutgoingPipeline,
    session::MessageSession,
    stages::steps,
    transport::{ReceivedMessage, Transport, TransportCapabilities},
};
