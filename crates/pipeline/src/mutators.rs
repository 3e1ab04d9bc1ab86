//! User-supplied message mutators and the behaviors that run them.
//!
//! Mutators come from two places: instances registered explicitly on the
//! behavior, and implementations resolved from the invocation's
//! [`ServiceProvider`](crate::ServiceProvider). Explicit mutators run first.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use {async_trait::async_trait, futures::future::BoxFuture, serde_json::Value, tracing::debug};

use conveyor_common::{Headers, MessageIntent};

use crate::{
    behavior::{Behavior, Next},
    context::{IncomingLogicalContext, OutgoingLogicalContext},
    error::Error,
};

// ── Mutation contexts ───────────────────────────────────────────────────────

/// What an incoming mutator may inspect and change.
#[derive(Debug, Default)]
pub struct MutateIncomingMessageContext {
    message_type: String,
    message: Value,
    headers: Headers,
    message_changed: bool,
}

impl MutateIncomingMessageContext {
    pub fn new(message_type: impl Into<String>, message: Value, headers: Headers) -> Self {
        Self {
            message_type: message_type.into(),
            message,
            headers,
            message_changed: false,
        }
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn message(&self) -> &Value {
        &self.message
    }

    /// Replace the message. Only replaced messages are written back.
    pub fn update_message(&mut self, message: Value) {
        self.message = message;
        self.message_changed = true;
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn message_changed(&self) -> bool {
        self.message_changed
    }
}

/// What an outgoing mutator may inspect and change.
#[derive(Debug, Default)]
pub struct MutateOutgoingMessageContext {
    message_type: String,
    intent: Option<MessageIntent>,
    message: Value,
    headers: Headers,
    incoming_headers: Option<Headers>,
    message_changed: bool,
}

impl MutateOutgoingMessageContext {
    pub fn new(
        message_type: impl Into<String>,
        intent: MessageIntent,
        message: Value,
        headers: Headers,
        incoming_headers: Option<Headers>,
    ) -> Self {
        Self {
            message_type: message_type.into(),
            intent: Some(intent),
            message,
            headers,
            incoming_headers,
            message_changed: false,
        }
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn intent(&self) -> Option<MessageIntent> {
        self.intent
    }

    pub fn outgoing_message(&self) -> &Value {
        &self.message
    }

    pub fn update_message(&mut self, message: Value) {
        self.message = message;
        self.message_changed = true;
    }

    pub fn outgoing_headers(&self) -> &Headers {
        &self.headers
    }

    pub fn outgoing_headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Headers of the message being handled, when sending from a handler.
    pub fn incoming_headers(&self) -> Option<&Headers> {
        self.incoming_headers.as_ref()
    }

    pub fn message_changed(&self) -> bool {
        self.message_changed
    }
}

// ── Mutator traits ──────────────────────────────────────────────────────────

#[async_trait]
pub trait IncomingMessageMutator: Send + Sync {
    async fn mutate_incoming(&self, context: &mut MutateIncomingMessageContext)
    -> anyhow::Result<()>;
}

#[async_trait]
pub trait OutgoingMessageMutator: Send + Sync {
    async fn mutate_outgoing(&self, context: &mut MutateOutgoingMessageContext)
    -> anyhow::Result<()>;
}

// ── Callback mutators ───────────────────────────────────────────────────────

type IncomingCallback = dyn Fn(MutateIncomingMessageContext) -> Option<BoxFuture<'static, anyhow::Result<MutateIncomingMessageContext>>>
    + Send
    + Sync;

type OutgoingCallback = dyn Fn(MutateOutgoingMessageContext) -> Option<BoxFuture<'static, anyhow::Result<MutateOutgoingMessageContext>>>
    + Send
    + Sync;

/// Incoming mutator backed by a closure that hands back a future.
///
/// The closure takes ownership of the mutation context and returns the
/// future that completes with it. Returning `None` is a contract violation
/// and fails the message.
pub struct DeferredIncomingMutator {
    callback: Box<IncomingCallback>,
}

impl DeferredIncomingMutator {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(
                MutateIncomingMessageContext,
            ) -> Option<BoxFuture<'static, anyhow::Result<MutateIncomingMessageContext>>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            callback: Box::new(callback),
        }
    }
}

#[async_trait]
impl IncomingMessageMutator for DeferredIncomingMutator {
    async fn mutate_incoming(
        &self,
        context: &mut MutateIncomingMessageContext,
    ) -> anyhow::Result<()> {
        let owned = std::mem::take(context);
        let future = (self.callback)(owned).ok_or(Error::MutatorReturnedNoFuture)?;
        *context = future.await?;
        Ok(())
    }
}

/// Outgoing counterpart of [`DeferredIncomingMutator`].
pub struct DeferredOutgoingMutator {
    callback: Box<OutgoingCallback>,
}

impl DeferredOutgoingMutator {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(
                MutateOutgoingMessageContext,
            ) -> Option<BoxFuture<'static, anyhow::Result<MutateOutgoingMessageContext>>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            callback: Box::new(callback),
        }
    }
}

#[async_trait]
impl OutgoingMessageMutator for DeferredOutgoingMutator {
    async fn mutate_outgoing(
        &self,
        context: &mut MutateOutgoingMessageContext,
    ) -> anyhow::Result<()> {
        let owned = std::mem::take(context);
        let future = (self.callback)(owned).ok_or(Error::MutatorReturnedNoFuture)?;
        *context = future.await?;
        Ok(())
    }
}

// ── Behaviors ───────────────────────────────────────────────────────────────

/// Runs incoming mutators over the deserialized message.
///
/// When the first invocation finds no mutator at all, later invocations
/// skip resolution entirely.
pub struct MutateIncomingMessageBehavior {
    explicit: Vec<Arc<dyn IncomingMessageMutator>>,
    has_mutators: AtomicBool,
}

impl MutateIncomingMessageBehavior {
    pub fn new(explicit: Vec<Arc<dyn IncomingMessageMutator>>) -> Self {
        Self {
            explicit,
            has_mutators: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl Behavior<IncomingLogicalContext> for MutateIncomingMessageBehavior {
    async fn invoke(
        &self,
        context: &mut IncomingLogicalContext,
        next: Next<'_, IncomingLogicalContext>,
    ) -> anyhow::Result<()> {
        if !self.has_mutators.load(Ordering::Acquire) {
            return next.run(context).await;
        }

        let resolved = context.services.resolve_all::<dyn IncomingMessageMutator>();
        if self.explicit.is_empty() && resolved.is_empty() {
            self.has_mutators.store(false, Ordering::Release);
            debug!("no incoming message mutators registered");
            return next.run(context).await;
        }

        let message_type = context.message().message_type().to_string();
        let instance = context.message().instance.clone();
        // mutators work on a copy; a failing mutator leaves the context as it was
        let mut mutation =
            MutateIncomingMessageContext::new(message_type, instance, context.headers.clone());
        for mutator in self.explicit.iter().chain(resolved.iter()) {
            mutator.mutate_incoming(&mut mutation).await?;
        }

        let MutateIncomingMessageContext {
            message,
            headers,
            message_changed,
            ..
        } = mutation;
        context.headers = headers;
        if message_changed {
            context.update_message_instance(message);
        }

        next.run(context).await
    }
}

/// Runs outgoing mutators over the message before it is serialized.
pub struct MutateOutgoingMessageBehavior {
    explicit: Vec<Arc<dyn OutgoingMessageMutator>>,
    has_mutators: AtomicBool,
}

impl MutateOutgoingMessageBehavior {
    pub fn new(explicit: Vec<Arc<dyn OutgoingMessageMutator>>) -> Self {
        Self {
            explicit,
            has_mutators: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl Behavior<OutgoingLogicalContext> for MutateOutgoingMessageBehavior {
    async fn invoke(
        &self,
        context: &mut OutgoingLogicalContext,
        next: Next<'_, OutgoingLogicalContext>,
    ) -> anyhow::Result<()> {
        if !self.has_mutators.load(Ordering::Acquire) {
            return next.run(context).await;
        }

        let resolved = context.services.resolve_all::<dyn OutgoingMessageMutator>();
        if self.explicit.is_empty() && resolved.is_empty() {
            self.has_mutators.store(false, Ordering::Release);
            debug!("no outgoing message mutators registered");
            return next.run(context).await;
        }

        let incoming_headers = context.incoming_message().map(|m| m.headers.clone());
        let message_type = context.message().message_type().to_string();
        let instance = context.message().instance.clone();
        let mut mutation = MutateOutgoingMessageContext::new(
            message_type,
            context.intent(),
            instance,
            context.headers.clone(),
            incoming_headers,
        );
        for mutator in self.explicit.iter().chain(resolved.iter()) {
            mutator.mutate_outgoing(&mut mutation).await?;
        }

        let MutateOutgoingMessageContext {
            message,
            headers,
            message_changed,
            ..
        } = mutation;
        context.headers = headers;
        if message_changed {
            context.update_message_instance(message);
        }

        next.run(context).await
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            pipeline::{PipelineBuilder, RegisterStep},
            services::{ServiceProvider, ServiceRegistry},
        },
        conveyor_common::{ContextBag, LogicalMessage, MessageId, MessageMetadata},
        futures::FutureExt,
        serde_json::json,
        std::sync::atomic::AtomicUsize,
        tokio_util::sync::CancellationToken,
    };

    struct Stamp;

    #[async_trait]
    impl IncomingMessageMutator for Stamp {
        async fn mutate_incoming(
            &self,
            context: &mut MutateIncomingMessageContext,
        ) -> anyhow::Result<()> {
            context
                .headers_mut()
                .insert("stamped".into(), "yes".into());
            Ok(())
        }
    }

    struct Rewrite;

    #[async_trait]
    impl IncomingMessageMutator for Rewrite {
        async fn mutate_incoming(
            &self,
            context: &mut MutateIncomingMessageContext,
        ) -> anyhow::Result<()> {
            context.update_message(json!({"rewritten": true}));
            Ok(())
        }
    }

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl IncomingMessageMutator for Counting {
        async fn mutate_incoming(
            &self,
            _context: &mut MutateIncomingMessageContext,
        ) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn incoming(services: ServiceProvider) -> IncomingLogicalContext {
        IncomingLogicalContext::new(
            MessageId::generate(),
            Headers::new(),
            LogicalMessage::new(
                Arc::new(MessageMetadata::command("PlaceOrder")),
                json!({"id": 1}),
            ),
            ContextBag::default(),
            services,
        )
    }

    async fn run_incoming(
        behavior: MutateIncomingMessageBehavior,
        context: &mut IncomingLogicalContext,
    ) -> anyhow::Result<()> {
        let mut builder = PipelineBuilder::new("incoming-logical");
        builder.register(RegisterStep::new("mutate", behavior));
        builder
            .build()?
            .execute(context, &CancellationToken::new())
            .await
            .map(|_| ())
    }

    #[tokio::test]
    async fn header_only_mutation_keeps_message() {
        let mut context = incoming(ServiceProvider::empty());
        run_incoming(
            MutateIncomingMessageBehavior::new(vec![Arc::new(Stamp)]),
            &mut context,
        )
        .await
        .unwrap();

        assert_eq!(context.headers.get("stamped").map(String::as_str), Some("yes"));
        assert!(!context.message_replaced());
        assert_eq!(context.message().instance, json!({"id": 1}));
    }

    #[tokio::test]
    async fn replaced_message_is_written_back() {
        let mut registry = ServiceRegistry::new();
        registry.add::<dyn IncomingMessageMutator, _>(|| Arc::new(Rewrite));
        let mut context = incoming(registry.into_provider());

        run_incoming(MutateIncomingMessageBehavior::new(Vec::new()), &mut context)
            .await
            .unwrap();

        assert!(context.message_replaced());
        assert_eq!(context.message().instance, json!({"rewritten": true}));
    }

    #[tokio::test]
    async fn explicit_mutators_run_before_resolved_ones() {
        let calls = Arc::new(AtomicUsize::new(0));
        let resolved_calls = Arc::clone(&calls);
        let mut registry = ServiceRegistry::new();
        registry.add::<dyn IncomingMessageMutator, _>(move || {
            Arc::new(Counting(Arc::clone(&resolved_calls)))
        });
        let mut context = incoming(registry.into_provider());

        run_incoming(
            MutateIncomingMessageBehavior::new(vec![
                Arc::new(Counting(Arc::clone(&calls))),
                Arc::new(Rewrite),
            ]),
            &mut context,
        )
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(context.message_replaced());
    }

    #[tokio::test]
    async fn resolution_stops_after_finding_no_mutators() {
        let behavior = Arc::new(MutateIncomingMessageBehavior::new(Vec::new()));
        let mut builder = PipelineBuilder::new("incoming-logical");
        builder.register(RegisterStep::from_arc("mutate", Arc::<MutateIncomingMessageBehavior>::clone(&behavior)));
        let pipeline = builder.build().unwrap();

        let mut first = incoming(ServiceProvider::empty());
        pipeline
            .execute(&mut first, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!behavior.has_mutators.load(Ordering::SeqCst));

        // Mutators registered later are no longer resolved.
        let mut registry = ServiceRegistry::new();
        registry.add::<dyn IncomingMessageMutator, _>(|| Arc::new(Rewrite));
        let mut second = incoming(registry.into_provider());
        pipeline
            .execute(&mut second, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!second.message_replaced());
    }

    #[tokio::test]
    async fn deferred_mutator_without_future_fails_descriptively() {
        let mutator = DeferredIncomingMutator::new(|_context| None);
        let mut context = incoming(ServiceProvider::empty());

        let err = run_incoming(
            MutateIncomingMessageBehavior::new(vec![Arc::new(mutator)]),
            &mut context,
        )
        .await
        .unwrap_err();

        assert_eq!(err.to_string(), "Return a future or mark the method as async.");
    }

    #[tokio::test]
    async fn deferred_mutator_result_is_applied() {
        let mutator = DeferredIncomingMutator::new(|mut context| {
            Some(
                async move {
                    context.update_message(json!({"deferred": true}));
                    Ok::<_, anyhow::Error>(context)
                }
                .boxed(),
            )
        });
        let mut context = incoming(ServiceProvider::empty());

        run_incoming(
            MutateIncomingMessageBehavior::new(vec![Arc::new(mutator)]),
            &mut context,
        )
        .await
        .unwrap();

        assert_eq!(context.message().instance, json!({"deferred": true}));
        assert_eq!(context.message().message_type(), "PlaceOrder");
    }

    #[tokio::test]
    async fn outgoing_mutator_sees_incoming_headers() {
        let mut incoming_headers = Headers::new();
        incoming_headers.insert("tenant".into(), "acme".into());
        let mut bag = ContextBag::default();
        bag.set(conveyor_common::IncomingMessage::new(
            MessageId::generate(),
            incoming_headers,
            bytes::Bytes::new(),
        ))
        .unwrap();

        let mutator = DeferredOutgoingMutator::new(|mut context| {
            Some(
                async move {
                    let tenant = context
                        .incoming_headers()
                        .and_then(|h| h.get("tenant").cloned())
                        .unwrap_or_default();
                    context.outgoing_headers_mut().insert("tenant".into(), tenant);
                    Ok::<_, anyhow::Error>(context)
                }
                .boxed(),
            )
        });

        let mut context = OutgoingLogicalContext::new(
            MessageId::generate(),
            MessageIntent::Send,
            Headers::new(),
            LogicalMessage::new(
                Arc::new(MessageMetadata::command("ShipOrder")),
                json!({}),
            ),
            conveyor_common::RoutingOptions::default(),
            bag.child(),
            ServiceProvider::empty(),
        );

        let mut builder = PipelineBuilder::new("outgoing-logical");
        builder.register(RegisterStep::new(
            "mutate",
            MutateOutgoingMessageBehavior::new(vec![Arc::new(mutator)]),
        ));
        builder
            .build()
            .unwrap()
            .execute(&mut context, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(context.headers.get("tenant").map(String::as_str), Some("acme"));
        assert!(!context.message_replaced());
    }

    #[tokio::test]
    async fn failing_incoming_mutator_leaves_headers_intact() {
        let failing = DeferredIncomingMutator::new(|_context| {
            Some(
                async {
                    Err::<MutateIncomingMessageContext, _>(anyhow::anyhow!("tenant lookup failed"))
                }
                .boxed(),
            )
        });
        let mut context = incoming(ServiceProvider::empty());
        context.headers.insert("tenant".into(), "acme".into());

        let err = run_incoming(
            MutateIncomingMessageBehavior::new(vec![Arc::new(Stamp), Arc::new(failing)]),
            &mut context,
        )
        .await
        .unwrap_err();

        assert_eq!(err.to_string(), "tenant lookup failed");
        assert_eq!(context.headers.get("tenant").map(String::as_str), Some("acme"));
        assert!(!context.headers.contains_key("stamped"));
    }

    #[tokio::test]
    async fn failing_outgoing_mutator_leaves_headers_intact() {
        let failing = DeferredOutgoingMutator::new(|mut context| {
            Some(
                async move {
                    context.outgoing_headers_mut().clear();
                    Err::<MutateOutgoingMessageContext, _>(anyhow::anyhow!("signing key unavailable"))
                }
                .boxed(),
            )
        });
        let mut headers = Headers::new();
        headers.insert("tenant".into(), "acme".into());
        let mut context = OutgoingLogicalContext::new(
            MessageId::generate(),
            MessageIntent::Send,
            headers,
            LogicalMessage::new(
                Arc::new(MessageMetadata::command("ShipOrder")),
                json!({}),
            ),
            conveyor_common::RoutingOptions::default(),
            ContextBag::default(),
            ServiceProvider::empty(),
        );

        let mut builder = PipelineBuilder::new("outgoing-logical");
        builder.register(RegisterStep::new(
            "mutate",
            MutateOutgoingMessageBehavior::new(vec![Arc::new(failing)]),
        ));
        let err = builder
            .build()
            .unwrap()
            .execute(&mut context, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "signing key unavailable");
        assert_eq!(context.headers.len(), 1);
        assert_eq!(context.headers.get("tenant").map(String::as_str), Some("acme"));
    }
}
