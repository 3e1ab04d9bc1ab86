//! Routing options attached to outgoing operations and the strategies they
//! resolve to.
//!
//! Every option is write-once: setting the same option twice on one options
//! object fails with [`Error::OptionAlreadySet`]. Combinations of different
//! options are not validated here; conflicts are reported when the routing
//! behaviors resolve the final addresses.

use std::fmt;

use crate::{
    error::{Error, Result},
    message::{Headers, MessageId},
};

// ── Strategies & addresses ──────────────────────────────────────────────────

/// Where a physical message is dispatched to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RoutingStrategy {
    /// Exactly one destination queue.
    Unicast { destination: String },
    /// Every subscriber of the event type, resolved by the transport.
    Multicast { message_type: String },
}

impl RoutingStrategy {
    pub fn unicast(destination: impl Into<String>) -> Self {
        Self::Unicast {
            destination: destination.into(),
        }
    }

    pub fn multicast(message_type: impl Into<String>) -> Self {
        Self::Multicast {
            message_type: message_type.into(),
        }
    }
}

impl fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unicast { destination } => write!(f, "unicast:{destination}"),
            Self::Multicast { message_type } => write!(f, "multicast:{message_type}"),
        }
    }
}

/// The queues this endpoint receives from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveAddresses {
    main: String,
    instance: Option<String>,
}

impl ReceiveAddresses {
    /// Addresses of an endpoint without an instance discriminator.
    pub fn new(main: impl Into<String>) -> Self {
        Self {
            main: main.into(),
            instance: None,
        }
    }

    pub fn with_instance(main: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            main: main.into(),
            instance: Some(instance.into()),
        }
    }

    /// Derive the addresses from an endpoint name and optional discriminator.
    pub fn for_endpoint(endpoint: &str, discriminator: Option<&str>) -> Self {
        match discriminator.filter(|d| !d.is_empty()) {
            Some(discriminator) => {
                Self::with_instance(endpoint, Self::instance_address(endpoint, discriminator))
            },
            None => Self::new(endpoint),
        }
    }

    /// Instance-qualified queue name for `endpoint`.
    pub fn instance_address(endpoint: &str, discriminator: &str) -> String {
        format!("{endpoint}-{discriminator}")
    }

    /// The shared, logical queue of the endpoint.
    pub fn main_receive_address(&self) -> &str {
        &self.main
    }

    pub fn instance_receive_address(&self) -> Option<&str> {
        self.instance.as_deref()
    }
}

// ── RoutingOptions ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingOptions {
    destination: Option<String>,
    reply_to: Option<String>,
    route_to_this_endpoint: bool,
    route_to_this_instance: bool,
    specific_instance: Option<String>,
    reply_to_this_instance: bool,
    reply_to_any_instance: bool,
}

fn set_once(slot: &mut Option<String>, value: String, option: &'static str) -> Result<()> {
    if slot.is_some() {
        return Err(Error::OptionAlreadySet { option });
    }
    *slot = Some(value);
    Ok(())
}

fn raise_flag(flag: &mut bool, option: &'static str) -> Result<()> {
    if *flag {
        return Err(Error::OptionAlreadySet { option });
    }
    *flag = true;
    Ok(())
}

impl RoutingOptions {
    pub fn set_destination(&mut self, destination: impl Into<String>) -> Result<()> {
        set_once(&mut self.destination, destination.into(), "destination")
    }

    pub fn route_reply_to(&mut self, address: impl Into<String>) -> Result<()> {
        set_once(&mut self.reply_to, address.into(), "reply-to address")
    }

    pub fn route_to_this_endpoint(&mut self) -> Result<()> {
        raise_flag(&mut self.route_to_this_endpoint, "route to this endpoint")
    }

    pub fn route_to_this_instance(&mut self) -> Result<()> {
        raise_flag(&mut self.route_to_this_instance, "route to this instance")
    }

    pub fn route_to_specific_instance(&mut self, instance_id: impl Into<String>) -> Result<()> {
        set_once(
            &mut self.specific_instance,
            instance_id.into(),
            "route to specific instance",
        )
    }

    pub fn route_reply_to_this_instance(&mut self) -> Result<()> {
        raise_flag(
            &mut self.reply_to_this_instance,
            "route reply to this instance",
        )
    }

    pub fn route_reply_to_any_instance(&mut self) -> Result<()> {
        raise_flag(&mut self.reply_to_any_instance, "route reply to any instance")
    }

    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    pub fn reply_to_route(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    pub fn is_routing_to_this_endpoint(&self) -> bool {
        self.route_to_this_endpoint
    }

    pub fn is_routing_to_this_instance(&self) -> bool {
        self.route_to_this_instance
    }

    pub fn specific_instance(&self) -> Option<&str> {
        self.specific_instance.as_deref()
    }

    pub fn is_routing_reply_to_this_instance(&self) -> bool {
        self.reply_to_this_instance
    }

    pub fn is_routing_reply_to_any_instance(&self) -> bool {
        self.reply_to_any_instance
    }
}

// ── Per-operation options ───────────────────────────────────────────────────

/// Common surface of send, reply and publish options.
macro_rules! outgoing_options {
    ($name:ident) => {
        impl $name {
            /// New options with a freshly generated message id.
            pub fn new() -> Self {
                Self {
                    message_id: MessageId::generate(),
                    headers: Headers::new(),
                    routing: RoutingOptions::default(),
                }
            }

            pub fn set_message_id(&mut self, message_id: MessageId) {
                self.message_id = message_id;
            }

            /// The configured id, or the one generated at construction.
            pub fn message_id(&self) -> &MessageId {
                &self.message_id
            }

            pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
                self.headers.insert(key.into(), value.into());
            }

            pub fn headers(&self) -> &Headers {
                &self.headers
            }

            pub fn routing(&self) -> &RoutingOptions {
                &self.routing
            }

            pub fn into_parts(self) -> (MessageId, Headers, RoutingOptions) {
                (self.message_id, self.headers, self.routing)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}

/// Reply-to related setters shared by send and reply options.
macro_rules! reply_routing {
    ($name:ident) => {
        impl $name {
            pub fn set_destination(&mut self, destination: impl Into<String>) -> Result<()> {
                self.routing.set_destination(destination)
            }

            pub fn route_reply_to(&mut self, address: impl Into<String>) -> Result<()> {
                self.routing.route_reply_to(address)
            }

            pub fn route_reply_to_this_instance(&mut self) -> Result<()> {
                self.routing.route_reply_to_this_instance()
            }

            pub fn route_reply_to_any_instance(&mut self) -> Result<()> {
                self.routing.route_reply_to_any_instance()
            }
        }
    };
}

#[derive(Debug, Clone)]
pub struct SendOptions {
    message_id: MessageId,
    headers: Headers,
    routing: RoutingOptions,
}

outgoing_options!(SendOptions);
reply_routing!(SendOptions);

impl SendOptions {
    pub fn route_to_this_endpoint(&mut self) -> Result<()> {
        self.routing.route_to_this_endpoint()
    }

    pub fn route_to_this_instance(&mut self) -> Result<()> {
        self.routing.route_to_this_instance()
    }

    pub fn route_to_specific_instance(&mut self, instance_id: impl Into<String>) -> Result<()> {
        self.routing.route_to_specific_instance(instance_id)
    }
}

#[derive(Debug, Clone)]
pub struct ReplyOptions {
    message_id: MessageId,
    headers: Headers,
    routing: RoutingOptions,
}

outgoing_options!(ReplyOptions);
reply_routing!(ReplyOptions);

#[derive(Debug, Clone)]
pub struct PublishOptions {
    message_id: MessageId,
    headers: Headers,
    routing: RoutingOptions,
}

outgoing_options!(PublishOptions);
