//! Message type metadata and the time-to-be-received index built from it.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use {
    async_trait::async_trait,
    tracing::{debug, info},
};

use conveyor_common::{MessageKind, MessageMetadata, headers};

use crate::{
    behavior::{Behavior, Next},
    context::OutgoingLogicalContext,
    error::{Error, Result},
};

// ── Registry ────────────────────────────────────────────────────────────────

/// Every message type the endpoint knows, keyed by type name.
#[derive(Debug, Clone, Default)]
pub struct MessageMetadataRegistry {
    types: HashMap<String, Arc<MessageMetadata>>,
}

impl MessageMetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `metadata`, replacing an earlier registration of the same
    /// type name.
    pub fn register(&mut self, metadata: MessageMetadata) -> Arc<MessageMetadata> {
        let metadata = Arc::new(metadata);
        debug!(message_type = %metadata.message_type, kind = ?metadata.kind, "message type registered");
        self.types
            .insert(metadata.message_type.clone(), Arc::clone(&metadata));
        metadata
    }

    pub fn get(&self, message_type: &str) -> Option<Arc<MessageMetadata>> {
        self.types.get(message_type).cloned()
    }

    pub fn require(&self, message_type: &str) -> Result<Arc<MessageMetadata>> {
        self.get(message_type)
            .ok_or_else(|| Error::UnknownMessageType {
                message_type: message_type.into(),
            })
    }

    pub fn kind_of(&self, message_type: &str) -> Option<MessageKind> {
        self.types.get(message_type).map(|m| m.kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<MessageMetadata>> {
        self.types.values()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

// ── Time to be received ─────────────────────────────────────────────────────

/// Precomputed `message type -> time to be received` index.
///
/// A type without its own declaration inherits the value of its nearest
/// ancestor that has one.
#[derive(Debug, Clone, Default)]
pub struct TimeToBeReceivedMappings {
    mappings: HashMap<String, Duration>,
}

impl TimeToBeReceivedMappings {
    /// Build the index from every registered type.
    ///
    /// Fails when any type resolves to a value and the transport cannot
    /// discard expired messages, or when a parent chain loops.
    pub fn build(registry: &MessageMetadataRegistry, supports_discard: bool) -> Result<Self> {
        let mut mappings = HashMap::new();
        for metadata in registry.iter() {
            if let Some(ttbr) = resolve_ttbr(registry, metadata)? {
                mappings.insert(metadata.message_type.clone(), ttbr);
            }
        }

        if !mappings.is_empty() && !supports_discard {
            let mut message_types: Vec<String> = mappings.into_keys().collect();
            message_types.sort();
            return Err(Error::TimeToBeReceivedUnsupported { message_types });
        }

        info!(types = mappings.len(), "time to be received mappings built");
        Ok(Self { mappings })
    }

    pub fn try_get(&self, message_type: &str) -> Option<Duration> {
        self.mappings.get(message_type).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

/// Walk from the most-derived type up the parent chain and take the first
/// declared value.
fn resolve_ttbr(
    registry: &MessageMetadataRegistry,
    metadata: &Arc<MessageMetadata>,
) -> Result<Option<Duration>> {
    let mut seen = HashSet::new();
    let mut current = Some(Arc::clone(metadata));
    while let Some(node) = current {
        if !seen.insert(node.message_type.clone()) {
            return Err(Error::MetadataCycle {
                message_type: metadata.message_type.clone(),
                through: node.message_type.clone(),
            });
        }
        if let Some(ttbr) = node.time_to_be_received {
            return Ok(Some(ttbr));
        }
        current = node.parent.as_deref().and_then(|parent| registry.get(parent));
    }
    Ok(None)
}

/// Writes the time-to-be-received header for types that declare one.
pub struct ApplyTimeToBeReceivedBehavior {
    mappings: Arc<TimeToBeReceivedMappings>,
}

impl ApplyTimeToBeReceivedBehavior {
    pub fn new(mappings: Arc<TimeToBeReceivedMappings>) -> Self {
        Self { mappings }
    }
}

#[async_trait]
impl Behavior<OutgoingLogicalContext> for ApplyTimeToBeReceivedBehavior {
    async fn invoke(
        &self,
        context: &mut OutgoingLogicalContext,
        next: Next<'_, OutgoingLogicalContext>,
    ) -> anyhow::Result<()> {
        if let Some(ttbr) = self.mappings.try_get(context.message().message_type()) {
            context.headers.insert(
                headers::TIME_TO_BE_RECEIVED.into(),
                ttbr.as_millis().to_string(),
            );
        }
        next.run(context).await
    }
}
