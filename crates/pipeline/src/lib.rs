//! Behavior pipelines: ordered, cancellable chains of async steps over the
//! stage contexts of incoming and outgoing messages.
//!
//! A [`PipelineBuilder`] collects [`RegisterStep`]s with before/after
//! constraints and resolves them once into a [`Pipeline`]. Each step is a
//! [`Behavior`] that reaches the remainder of the chain through [`Next`].

pub mod behavior;
pub mod causation;
pub mod context;
pub mod error;
pub mod metadata;
pub mod mutators;
pub mod pipeline;
pub mod serialization;
pub mod services;

pub use {
    behavior::{Behavior, Next},
    causation::{AttachCausationHeadersBehavior, ConversationId, ConversationIdStrategy},
    context::{
        IncomingLogicalContext, IncomingPhysicalContext, InvokeHandlerContext,
        OutgoingLogicalContext, OutgoingPhysicalContext,
    },
    error::{Error, Result},
    metadata::{ApplyTimeToBeReceivedBehavior, MessageMetadataRegistry, TimeToBeReceivedMappings},
    mutators::{
        DeferredIncomingMutator, DeferredOutgoingMutator, IncomingMessageMutator,
        MutateIncomingMessageBehavior, MutateIncomingMessageContext, MutateOutgoingMessageBehavior,
        MutateOutgoingMessageContext, OutgoingMessageMutator,
    },
    pipeline::{Outcome, Pipeline, PipelineBuilder, RegisterStep},
    serialization::{JsonSerializer, MessageSerializer},
    services::{ServiceProvider, ServiceRegistry},
};
