//! Statically configured routes and publishers.

use std::collections::HashMap;

use tracing::info;

/// Maps message types to the endpoint that owns them.
pub trait RoutingTable: Send + Sync {
    /// Destination for commands and messages of `message_type`.
    fn route(&self, message_type: &str) -> Option<String>;

    /// Publisher of the event `message_type`, used for message-driven
    /// subscriptions.
    fn publisher(&self, _message_type: &str) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticRoutingTable {
    routes: HashMap<String, String>,
    publishers: HashMap<String, String>,
}

impl StaticRoutingTable {
    pub fn new(routes: HashMap<String, String>, publishers: HashMap<String, String>) -> Self {
        info!(
            routes = routes.len(),
            publishers = publishers.len(),
            "routing table loaded"
        );
        Self { routes, publishers }
    }

    #[must_use]
    pub fn with_route(mut self, message_type: impl Into<String>, destination: impl Into<String>) -> Self {
        self.routes.insert(message_type.into(), destination.into());
        self
    }

    #[must_use]
    pub fn with_publisher(
        mut self,
        message_type: impl Into<String>,
        publisher: impl Into<String>,
    ) -> Self {
        self.publishers
            .insert(message_type.into(), publisher.into());
        self
    }
}

impl RoutingTable for StaticRoutingTable {
    fn route(&self, message_type: &str) -> Option<String> {
        self.routes.get(message_type).cloned()
    }

    fn publisher(&self, message_type: &str) -> Option<String> {
        self.publishers.get(message_type).cloned()
    }
}
