//! Assembling an endpoint from configuration and running it.

use std::{sync::Arc, time::Duration};

use {
    tokio::{sync::Semaphore, task::JoinSet},
    tokio_util::sync::CancellationToken,
    tracing::{info, warn},
};

use {
    conveyor_common::{BagStrictness, MessageMetadata, ReceiveAddresses, SettingsHolder},
    conveyor_config::{ConveyorConfig, Severity, SubscriptionModeConfig, validate_config},
    conveyor_pipeline::{
        ApplyTimeToBeReceivedBehavior, AttachCausationHeadersBehavior, ConversationIdStrategy,
        IncomingLogicalContext, IncomingMessageMutator, IncomingPhysicalContext,
        InvokeHandlerContext, JsonSerializer, MessageMetadataRegistry, MessageSerializer,
        MutateIncomingMessageBehavior, MutateOutgoingMessageBehavior, OutgoingLogicalContext,
        OutgoingMessageMutator, OutgoingPhysicalContext, PipelineBuilder, RegisterStep,
        ServiceRegistry, TimeToBeReceivedMappings,
    },
    conveyor_recoverability::{
        ErrorContext, Recoverability, RecoverabilityAction, RecoverabilityConfig,
    },
    conveyor_routing::{
        ApplyReplyToAddressBehavior, DetermineRouteForPublishBehavior,
        DetermineRouteForReplyBehavior, DetermineRouteForSendBehavior, InMemorySubscriptionStore,
        RoutingTable, StaticRoutingTable, SubscriptionGuard, SubscriptionMode, SubscriptionStore,
    },
};

use crate::{
    error::{Error, Result},
    handler::{HandlerRegistry, MessageHandler},
    outgoing::OutgoingPipeline,
    receive::Receiver,
    session::MessageSession,
    stages::{
        DeserializeConnector, DispatchConnector, InvokeHandlerTerminator, LoadHandlersConnector,
        SerializeConnector, SubscriptionRequestBehavior, steps,
    },
    transport::Transport,
};

/// Keys under which the endpoint's settings are held.
///
/// The configuration file provides the defaults; values set through
/// [`EndpointBuilder::settings_mut`] take precedence.
pub mod keys {
    pub const ENDPOINT_NAME: &str = "Endpoint.Name";
    pub const INSTANCE_DISCRIMINATOR: &str = "Endpoint.InstanceDiscriminator";
    pub const SEND_ONLY: &str = "Endpoint.SendOnly";
    pub const PUBLIC_RETURN_ADDRESS: &str = "Endpoint.PublicReturnAddress";
    pub const CONCURRENCY: &str = "Endpoint.Concurrency";
    pub const IMMEDIATE_RETRIES: &str = "Recoverability.Immediate.MaxRetries";
    pub const DELAYED_RETRIES: &str = "Recoverability.Delayed.MaxRetries";
    pub const TIME_INCREASE: &str = "Recoverability.Delayed.TimeIncrease";
    pub const ERROR_QUEUE: &str = "Recoverability.Failed.ErrorQueue";
    pub const STRICT_EXTENSIONS: &str = "Pipeline.StrictExtensions";
}

type ConfigureRecoverability = Box<dyn FnOnce(&mut RecoverabilityConfig) + Send>;
type ConfigurePolicies = Box<dyn FnOnce(Recoverability) -> Recoverability + Send>;

// ── Builder ─────────────────────────────────────────────────────────────────

pub struct EndpointBuilder {
    config: ConveyorConfig,
    settings: SettingsHolder,
    transport: Option<Arc<dyn Transport>>,
    registry: MessageMetadataRegistry,
    handlers: HandlerRegistry,
    services: ServiceRegistry,
    serializer: Arc<dyn MessageSerializer>,
    routing_table: Option<Arc<dyn RoutingTable>>,
    subscription_store: Option<Arc<dyn SubscriptionStore>>,
    conversation_strategy: Option<ConversationIdStrategy>,
    incoming_mutators: Vec<Arc<dyn IncomingMessageMutator>>,
    outgoing_mutators: Vec<Arc<dyn OutgoingMessageMutator>>,
    incoming_physical: Vec<RegisterStep<IncomingPhysicalContext>>,
    incoming_logical: Vec<RegisterStep<IncomingLogicalContext>>,
    invoke_handler: Vec<RegisterStep<InvokeHandlerContext>>,
    outgoing_logical: Vec<RegisterStep<OutgoingLogicalContext>>,
    outgoing_physical: Vec<RegisterStep<OutgoingPhysicalContext>>,
    configure_recoverability: Vec<ConfigureRecoverability>,
    policies: Vec<ConfigurePolicies>,
}

impl EndpointBuilder {
    pub fn new(config: ConveyorConfig) -> Self {
        Self {
            config,
            settings: SettingsHolder::new(),
            transport: None,
            registry: MessageMetadataRegistry::new(),
            handlers: HandlerRegistry::default(),
            services: ServiceRegistry::new(),
            serializer: Arc::new(JsonSerializer),
            routing_table: None,
            subscription_store: None,
            conversation_strategy: None,
            incoming_mutators: Vec::new(),
            outgoing_mutators: Vec::new(),
            incoming_physical: Vec::new(),
            incoming_logical: Vec::new(),
            invoke_handler: Vec::new(),
            outgoing_logical: Vec::new(),
            outgoing_physical: Vec::new(),
            configure_recoverability: Vec::new(),
            policies: Vec::new(),
        }
    }

    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Register a message type. Every type sent, published or handled must
    /// be registered.
    #[must_use]
    pub fn message(mut self, metadata: MessageMetadata) -> Self {
        self.registry.register(metadata);
        self
    }

    #[must_use]
    pub fn handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handlers.add(handler);
        self
    }

    /// Services resolved per invocation: mutators and handlers registered
    /// here are picked up alongside the explicit ones.
    pub fn services_mut(&mut self) -> &mut ServiceRegistry {
        &mut self.services
    }

    /// Explicit settings shadow the values from the configuration.
    pub fn settings_mut(&mut self) -> &mut SettingsHolder {
        &mut self.settings
    }

    #[must_use]
    pub fn serializer(mut self, serializer: Arc<dyn MessageSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Replace the routing table built from `routing.routes` and
    /// `routing.publishers`.
    #[must_use]
    pub fn routing_table(mut self, table: Arc<dyn RoutingTable>) -> Self {
        self.routing_table = Some(table);
        self
    }

    /// Subscription storage for message-driven pub/sub. Defaults to an
    /// in-memory store.
    #[must_use]
    pub fn subscription_store(mut self, store: Arc<dyn SubscriptionStore>) -> Self {
        self.subscription_store = Some(store);
        self
    }

    #[must_use]
    pub fn conversation_id_strategy(mut self, strategy: ConversationIdStrategy) -> Self {
        self.conversation_strategy = Some(strategy);
        self
    }

    #[must_use]
    pub fn incoming_mutator(mut self, mutator: Arc<dyn IncomingMessageMutator>) -> Self {
        self.incoming_mutators.push(mutator);
        self
    }

    #[must_use]
    pub fn outgoing_mutator(mut self, mutator: Arc<dyn OutgoingMessageMutator>) -> Self {
        self.outgoing_mutators.push(mutator);
        self
    }

    #[must_use]
    pub fn incoming_physical_step(mut self, step: RegisterStep<IncomingPhysicalContext>) -> Self {
        self.incoming_physical.push(step);
        self
    }

    #[must_use]
    pub fn incoming_logical_step(mut self, step: RegisterStep<IncomingLogicalContext>) -> Self {
        self.incoming_logical.push(step);
        self
    }

    #[must_use]
    pub fn invoke_handler_step(mut self, step: RegisterStep<InvokeHandlerContext>) -> Self {
        self.invoke_handler.push(step);
        self
    }

    #[must_use]
    pub fn outgoing_logical_step(mut self, step: RegisterStep<OutgoingLogicalContext>) -> Self {
        self.outgoing_logical.push(step);
        self
    }

    #[must_use]
    pub fn outgoing_physical_step(mut self, step: RegisterStep<OutgoingPhysicalContext>) -> Self {
        self.outgoing_physical.push(step);
        self
    }

    /// Treat failures whose error chain contains an `E` as unrecoverable.
    #[must_use]
    pub fn unrecoverable_error<E>(mut self) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.configure_recoverability.push(Box::new(|config: &mut RecoverabilityConfig| {
            config.add_unrecoverable_error::<E>();
        }));
        self
    }

    #[must_use]
    pub fn unrecoverable_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&anyhow::Error) -> bool + Send + Sync + 'static,
    {
        self.configure_recoverability.push(Box::new(move |config: &mut RecoverabilityConfig| {
            config.add_unrecoverable_predicate(predicate);
        }));
        self
    }

    /// Replace the default recoverability policy.
    #[must_use]
    pub fn recoverability_policy<F>(mut self, policy: F) -> Self
    where
        F: Fn(&RecoverabilityConfig, &ErrorContext<'_>) -> RecoverabilityAction
            + Send
            + Sync
            + 'static,
    {
        self.policies
            .push(Box::new(move |engine: Recoverability| engine.custom_policy(policy)));
        self
    }

    /// Replace the default policy for the failures `matcher` selects.
    #[must_use]
    pub fn recoverability_policy_for<M, F>(mut self, matcher: M, policy: F) -> Self
    where
        M: Fn(&ErrorContext<'_>) -> bool + Send + Sync + 'static,
        F: Fn(&RecoverabilityConfig, &ErrorContext<'_>) -> RecoverabilityAction
            + Send
            + Sync
            + 'static,
    {
        self.policies
            .push(Box::new(move |engine: Recoverability| {
                engine.custom_policy_for(matcher, policy)
            }));
        self
    }

    /// Write the configuration as defaults under [`keys`].
    fn apply_config_defaults(&mut self) -> Result<()> {
        let endpoint = &self.config.endpoint;
        let recoverability = &self.config.recoverability;
        let settings = &mut self.settings;
        settings.set_default(keys::ENDPOINT_NAME, endpoint.name.clone())?;
        settings.set_default(
            keys::INSTANCE_DISCRIMINATOR,
            endpoint
                .instance_discriminator
                .clone()
                .filter(|d| !d.trim().is_empty()),
        )?;
        settings.set_default(keys::SEND_ONLY, endpoint.send_only)?;
        settings.set_default(
            keys::PUBLIC_RETURN_ADDRESS,
            endpoint.public_return_address.clone(),
        )?;
        settings.set_default(keys::CONCURRENCY, endpoint.concurrency)?;
        settings.set_default(keys::IMMEDIATE_RETRIES, recoverability.immediate_retries)?;
        settings.set_default(keys::DELAYED_RETRIES, recoverability.delayed_retries)?;
        settings.set_default(keys::TIME_INCREASE, recoverability.time_increase()?)?;
        settings.set_default(keys::ERROR_QUEUE, recoverability.error_queue.clone())?;
        settings.set_default(
            keys::STRICT_EXTENSIONS,
            self.config.pipeline.strict_extensions,
        )?;
        Ok(())
    }

    /// Validate the configuration, lock the settings and assemble every
    /// pipeline.
    pub fn build(mut self) -> Result<Endpoint> {
        let validation = validate_config(&self.config);
        for diagnostic in &validation.diagnostics {
            if diagnostic.severity == Severity::Warning {
                warn!(path = %diagnostic.path, "{}", diagnostic.message);
            }
        }
        if validation.has_errors() {
            return Err(Error::InvalidConfig {
                diagnostics: validation
                    .diagnostics
                    .into_iter()
                    .filter(|d| d.severity == Severity::Error)
                    .collect(),
            });
        }
        let transport = self.transport.clone().ok_or(Error::NoTransport)?;

        self.apply_config_defaults()?;
        self.settings.prevent_changes();
        let settings = &self.settings;
        let name: String = settings.get(keys::ENDPOINT_NAME)?;
        let discriminator: Option<String> = settings.get(keys::INSTANCE_DISCRIMINATOR)?;
        let send_only: bool = settings.get(keys::SEND_ONLY)?;
        let public_return_address: Option<String> = settings.get(keys::PUBLIC_RETURN_ADDRESS)?;
        let concurrency: usize = settings.get(keys::CONCURRENCY)?;
        let immediate_retries: u32 = settings.get(keys::IMMEDIATE_RETRIES)?;
        let delayed_retries: u32 = settings.get(keys::DELAYED_RETRIES)?;
        let time_increase: Duration = settings.get(keys::TIME_INCREASE)?;
        let error_queue: String = settings.get(keys::ERROR_QUEUE)?;
        let strictness = if settings.get::<bool>(keys::STRICT_EXTENSIONS)? {
            BagStrictness::Strict
        } else {
            BagStrictness::Overwrite
        };

        let capabilities = transport.capabilities();

        for handler in self.handlers.iter() {
            if self.registry.get(handler.message_type()).is_none() {
                return Err(Error::HandlerForUnknownType {
                    handler: handler.name().to_string(),
                    message_type: handler.message_type().to_string(),
                });
            }
        }
        let registry = Arc::new(std::mem::take(&mut self.registry));
        let ttbr = Arc::new(TimeToBeReceivedMappings::build(
            &registry,
            capabilities.discard_expired,
        )?);

        // Recoverability
        let mut recoverability_config = RecoverabilityConfig::new(error_queue)
            .with_immediate_retries(immediate_retries)
            .with_delayed_retries(delayed_retries, time_increase);
        for configure in self.configure_recoverability.drain(..) {
            configure(&mut recoverability_config);
        }
        recoverability_config.disable_delayed_retries_if_unsupported(capabilities.delayed_delivery);
        recoverability_config.validate()?;
        let recoverability = self
            .policies
            .drain(..)
            .fold(Recoverability::new(recoverability_config), |engine, apply| {
                apply(engine)
            });

        // Routing
        let mode = match self.config.routing.subscription_mode {
            SubscriptionModeConfig::Native if !capabilities.native_publish_subscribe => {
                warn!("transport has no native publish/subscribe, using message-driven subscriptions");
                SubscriptionMode::MessageDriven
            },
            SubscriptionModeConfig::Native => SubscriptionMode::Native,
            SubscriptionModeConfig::MessageDriven => SubscriptionMode::MessageDriven,
        };
        let store: Arc<dyn SubscriptionStore> = match self.subscription_store.take() {
            Some(store) => store,
            None => Arc::new(InMemorySubscriptionStore::new()),
        };
        let table: Arc<dyn RoutingTable> = match self.routing_table.take() {
            Some(table) => table,
            None => Arc::new(StaticRoutingTable::new(
                self.config.routing.routes.clone(),
                self.config.routing.publishers.clone(),
            )),
        };
        let addresses = (!send_only)
            .then(|| ReceiveAddresses::for_endpoint(&name, discriminator.as_deref()));
        let send_addresses = addresses
            .clone()
            .unwrap_or_else(|| ReceiveAddresses::new(name.clone()));

        let services = std::mem::take(&mut self.services).into_provider();

        // Outgoing physical → logical
        let mut outgoing_physical = PipelineBuilder::new("outgoing-physical");
        for step in self.outgoing_physical.drain(..) {
            outgoing_physical.register(step);
        }
        outgoing_physical.terminate_with(RegisterStep::new(
            steps::DISPATCH,
            DispatchConnector::new(Arc::clone(&transport)),
        ));
        let outgoing_physical = Arc::new(outgoing_physical.build()?);

        let mut outgoing_logical = PipelineBuilder::new("outgoing-logical");
        outgoing_logical
            .register(RegisterStep::new(
                steps::MUTATE_OUTGOING,
                MutateOutgoingMessageBehavior::new(std::mem::take(&mut self.outgoing_mutators)),
            ))
            .register(RegisterStep::new(
                steps::CAUSATION,
                AttachCausationHeadersBehavior::new(self.conversation_strategy.take()),
            ))
            .register(RegisterStep::new(
                steps::TIME_TO_BE_RECEIVED,
                ApplyTimeToBeReceivedBehavior::new(ttbr),
            ))
            .register(RegisterStep::new(
                steps::REPLY_TO,
                match &addresses {
                    Some(addresses) => {
                        ApplyReplyToAddressBehavior::new(addresses.clone(), public_return_address)
                    },
                    None => ApplyReplyToAddressBehavior::send_only(),
                },
            ))
            .register(RegisterStep::new(
                steps::ROUTE_SEND,
                DetermineRouteForSendBehavior::new(send_addresses, Arc::clone(&table)),
            ))
            .register(RegisterStep::new(
                steps::ROUTE_REPLY,
                DetermineRouteForReplyBehavior,
            ))
            .register(RegisterStep::new(
                steps::ROUTE_PUBLISH,
                match mode {
                    SubscriptionMode::Native => DetermineRouteForPublishBehavior::native(),
                    SubscriptionMode::MessageDriven => {
                        DetermineRouteForPublishBehavior::message_driven(Arc::clone(&store))
                    },
                },
            ));
        for step in self.outgoing_logical.drain(..) {
            outgoing_logical.register(step);
        }
        outgoing_logical.terminate_with(RegisterStep::new(
            steps::SERIALIZE,
            SerializeConnector::new(Arc::clone(&self.serializer), outgoing_physical, name.clone()),
        ));
        let outgoing = Arc::new(OutgoingPipeline::new(
            outgoing_logical.build()?,
            Arc::clone(&registry),
            services.clone(),
            strictness,
        ));

        // Incoming invoke-handler → logical → physical
        let mut invoke_handler = PipelineBuilder::new("invoke-handler");
        for step in self.invoke_handler.drain(..) {
            invoke_handler.register(step);
        }
        invoke_handler.terminate_with(RegisterStep::new(
            steps::INVOKE_HANDLER,
            InvokeHandlerTerminator::new(Arc::clone(&outgoing)),
        ));

        let mut incoming_logical = PipelineBuilder::new("incoming-logical");
        incoming_logical.register(RegisterStep::new(
            steps::MUTATE_INCOMING,
            MutateIncomingMessageBehavior::new(std::mem::take(&mut self.incoming_mutators)),
        ));
        for step in self.incoming_logical.drain(..) {
            incoming_logical.register(step);
        }
        incoming_logical.terminate_with(RegisterStep::new(
            steps::LOAD_HANDLERS,
            LoadHandlersConnector::new(
                Arc::new(std::mem::take(&mut self.handlers)),
                Arc::clone(&registry),
                Arc::new(invoke_handler.build()?),
            ),
        ));

        let mut incoming_physical = PipelineBuilder::new("incoming-physical");
        if mode == SubscriptionMode::MessageDriven && !send_only {
            incoming_physical.register(RegisterStep::new(
                steps::SUBSCRIPTION_REQUESTS,
                SubscriptionRequestBehavior::new(Arc::clone(&store)),
            ));
        }
        for step in self.incoming_physical.drain(..) {
            incoming_physical.register(step);
        }
        incoming_physical.terminate_with(RegisterStep::new(
            steps::DESERIALIZE,
            DeserializeConnector::new(
                Arc::clone(&registry),
                Arc::clone(&self.serializer),
                Arc::new(incoming_logical.build()?),
            ),
        ));
        let incoming = Arc::new(incoming_physical.build()?);

        let stop = CancellationToken::new();
        let abort = CancellationToken::new();
        let session = MessageSession::new(
            Arc::clone(&outgoing),
            Arc::clone(&transport),
            table,
            SubscriptionGuard::new(send_only, mode),
            addresses.clone(),
            abort.clone(),
        );
        let receiver = (!send_only).then(|| {
            Arc::new(Receiver {
                endpoint: name.clone(),
                transport: Arc::clone(&transport),
                pipeline: incoming,
                recoverability: Arc::new(recoverability),
                services,
                strictness,
                stop: stop.clone(),
                abort: abort.clone(),
            })
        });

        info!(
            endpoint = %name,
            send_only,
            concurrency,
            subscription_mode = ?mode,
            "endpoint built"
        );
        Ok(Endpoint {
            name,
            settings: self.settings,
            session,
            receiver,
            addresses,
            concurrency,
            stop,
            abort,
            loops: JoinSet::new(),
            started: false,
        })
    }
}

// ── Endpoint ────────────────────────────────────────────────────────────────

/// A built endpoint. Sending works right away; receiving starts with
/// [`Endpoint::start`].
pub struct Endpoint {
    name: String,
    settings: SettingsHolder,
    session: MessageSession,
    receiver: Option<Arc<Receiver>>,
    addresses: Option<ReceiveAddresses>,
    concurrency: usize,
    stop: CancellationToken,
    abort: CancellationToken,
    loops: JoinSet<()>,
    started: bool,
}

impl Endpoint {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Locked settings the endpoint was built with.
    pub fn settings(&self) -> &SettingsHolder {
        &self.settings
    }

    /// Queues the endpoint receives from; `None` for send-only endpoints.
    pub fn receive_addresses(&self) -> Option<&ReceiveAddresses> {
        self.addresses.as_ref()
    }

    pub fn session(&self) -> MessageSession {
        self.session.clone()
    }

    /// Start one receive loop per receive address, sharing `concurrency`
    /// processing slots.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(Error::AlreadyStarted);
        }
        let (Some(receiver), Some(addresses)) = (&self.receiver, &self.addresses) else {
            return Err(Error::SendOnlyReceive);
        };

        let permits = Arc::new(Semaphore::new(self.concurrency));
        let queues = std::iter::once(addresses.main_receive_address())
            .chain(addresses.instance_receive_address());
        for queue in queues {
            self.loops
                .spawn(Arc::clone(receiver).run(queue.to_string(), Arc::clone(&permits)));
        }
        self.started = true;
        info!(endpoint = %self.name, concurrency = self.concurrency, "endpoint started");
        Ok(())
    }

    /// Stop receiving and wait for in-flight messages to finish.
    pub async fn stop(self) {
        self.shutdown(None).await;
    }

    /// Like [`stop`](Self::stop), but abort messages still in flight after
    /// `grace`; they are returned to their queue.
    pub async fn stop_with_timeout(self, grace: Duration) {
        self.shutdown(Some(grace)).await;
    }

    async fn shutdown(mut self, grace: Option<Duration>) {
        self.stop.cancel();
        let drained = match grace {
            Some(grace) => tokio::time::timeout(grace, join_all(&mut self.loops))
                .await
                .is_ok(),
            None => {
                join_all(&mut self.loops).await;
                true
            },
        };
        if !drained {
            warn!(endpoint = %self.name, "grace period elapsed, aborting in-flight messages");
            self.abort.cancel();
            join_all(&mut self.loops).await;
        }
        self.abort.cancel();
        self.settings.clear();
        info!(endpoint = %self.name, "endpoint stopped");
    }
}

async fn join_all(loops: &mut JoinSet<()>) {
    while let Some(result) = loops.join_next().await {
        if let Err(error) = result {
            warn!(error = %error, "receive loop ended abnormally");
        }
    }
}
