//! Entry point for every outgoing operation, inside or outside a handler.

use std::sync::{Arc, Mutex, PoisonError};

use {
    serde_json::Value,
    tokio_util::sync::CancellationToken,
    tracing::{Instrument, debug, info_span},
};

#[cfg(feature = "metrics")]
use conveyor_metrics::{counter, endpoint as endpoint_metrics, labels};
use {
    conveyor_common::{
        BagStrictness, ContextBag, Headers, LogicalMessage, MessageId, MessageIntent,
        RoutingOptions, TraceContext, TransportOperation, headers,
    },
    conveyor_pipeline::{
        MessageMetadataRegistry, OutgoingLogicalContext, Pipeline, ServiceProvider,
    },
};

use crate::transport::Transport;

/// Operations produced while a message is being handled.
///
/// Placed in the incoming bag by the receive loop; the dispatch connector
/// appends to it instead of calling the transport, and the loop flushes it
/// once the handlers succeeded.
#[derive(Default)]
pub(crate) struct PendingOperations(Mutex<Vec<TransportOperation>>);

impl PendingOperations {
    pub(crate) fn push(&self, operations: Vec<TransportOperation>) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(operations);
    }

    pub(crate) fn take(&self) -> Vec<TransportOperation> {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Hand `operations` to the transport, recording one count per strategy
/// kind.
pub(crate) async fn dispatch_operations(
    transport: &dyn Transport,
    operations: Vec<TransportOperation>,
) -> anyhow::Result<()> {
    if operations.is_empty() {
        return Ok(());
    }
    #[cfg(feature = "metrics")]
    for operation in &operations {
        let kind = match operation.strategy {
            conveyor_common::RoutingStrategy::Unicast { .. } => "unicast",
            conveyor_common::RoutingStrategy::Multicast { .. } => "multicast",
        };
        counter!(endpoint_metrics::OPERATIONS_DISPATCHED_TOTAL, labels::OPERATION => kind)
            .increment(1);
    }
    debug!(count = operations.len(), "dispatching operations");
    transport.dispatch(operations).await
}

/// One outgoing operation, before it enters the outgoing logical stage.
pub(crate) struct OutgoingRequest {
    pub intent: MessageIntent,
    pub message_type: String,
    pub instance: Value,
    pub message_id: MessageId,
    pub headers: Headers,
    pub routing: RoutingOptions,
}

/// The outgoing logical pipeline plus what is needed to start it.
pub struct OutgoingPipeline {
    logical: Pipeline<OutgoingLogicalContext>,
    registry: Arc<MessageMetadataRegistry>,
    services: ServiceProvider,
    strictness: BagStrictness,
}

impl OutgoingPipeline {
    pub(crate) fn new(
        logical: Pipeline<OutgoingLogicalContext>,
        registry: Arc<MessageMetadataRegistry>,
        services: ServiceProvider,
        strictness: BagStrictness,
    ) -> Self {
        Self {
            logical,
            registry,
            services,
            strictness,
        }
    }

    pub fn registry(&self) -> &MessageMetadataRegistry {
        &self.registry
    }

    /// Run `request` through the outgoing stages.
    ///
    /// `parent` is the bag of the incoming message being handled, if any; the
    /// operation's bag is a child of it so causation and batching see the
    /// incoming message.
    ///
    /// Each operation runs in a `send` span whose trace context is written
    /// to the `traceparent` header. Inside a handler it continues the trace
    /// of the receive attempt.
    pub(crate) async fn dispatch(
        &self,
        request: OutgoingRequest,
        parent: Option<&ContextBag>,
        cancellation: &CancellationToken,
    ) -> anyhow::Result<()> {
        let OutgoingRequest {
            intent,
            message_type,
            instance,
            message_id,
            headers: mut outgoing_headers,
            routing,
        } = request;
        let metadata = self.registry.require(&message_type)?;

        let causing = parent
            .and_then(|bag| bag.get::<TraceContext>())
            .cloned()
            .or_else(|| {
                outgoing_headers
                    .get(headers::TRACE_PARENT)
                    .map(String::as_str)
                    .and_then(TraceContext::parse)
            });
        let trace = causing.as_ref().map_or_else(TraceContext::root, TraceContext::child);
        outgoing_headers.insert(headers::TRACE_PARENT.into(), trace.to_header());
        let span = info_span!(
            "send",
            message_id = %message_id,
            message_type = %message_type,
            %intent,
            trace_id = trace.trace_id(),
            span_id = trace.span_id(),
            parent_span_id = causing.as_ref().map(TraceContext::span_id),
        );

        let extensions = parent.map_or_else(|| ContextBag::new(self.strictness), ContextBag::child);
        let mut context = OutgoingLogicalContext::new(
            message_id,
            intent,
            outgoing_headers,
            LogicalMessage::new(metadata, instance),
            routing,
            extensions,
            self.services.clone(),
        );
        async {
            let outcome = self.logical.execute(&mut context, cancellation).await?;
            debug!(
                message_id = %context.message_id(),
                %intent,
                message_type = %message_type,
                outcome = ?outcome,
                "outgoing message processed"
            );
            Ok::<_, anyhow::Error>(())
        }
        .instrument(span)
        .await
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        conveyor_common::{OutgoingMessage, RoutingStrategy},
    };

    fn operation(destination: &str) -> TransportOperation {
        TransportOperation {
            message: OutgoingMessage::new(MessageId::generate(), Headers::new(), "{}"),
            strategy: RoutingStrategy::unicast(destination),
        }
    }

    #[test]
    fn pending_operations_are_taken_once() {
        let pending = PendingOperations::default();
        pending.push(vec![operation("Billing")]);
        pending.push(vec![operation("Shipping"), operation("Audit")]);

        let taken = pending.take();
        assert_eq!(taken.len(), 3);
        assert_eq!(taken[1].strategy, RoutingStrategy::unicast("Shipping"));
        assert!(pending.take().is_empty());
    }
}
