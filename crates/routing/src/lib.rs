//! Routing resolution for outgoing messages.
//!
//! Behaviors in this crate run in the outgoing logical stage. They read the
//! [`RoutingOptions`](conveyor_common::RoutingOptions) of the operation and
//! the endpoint's receive addresses, write the reply-to header and attach the
//! routing strategies the transport dispatches on.

pub mod error;
pub mod publish;
pub mod reply_to;
pub mod subscriptions;
pub mod table;
pub mod unicast;

pub use {
    error::{Error, Result},
    publish::DetermineRouteForPublishBehavior,
    reply_to::ApplyReplyToAddressBehavior,
    subscriptions::{
        InMemorySubscriptionStore, SubscriptionGuard, SubscriptionMode, SubscriptionStore,
    },
    table::{RoutingTable, StaticRoutingTable},
    unicast::{DetermineRouteForReplyBehavior, DetermineRouteForSendBehavior},
};
