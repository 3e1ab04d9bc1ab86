//! The behavior trait and the continuation handed to each behavior.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use {async_trait::async_trait, tokio_util::sync::CancellationToken};

use crate::error::Error;

// ── Behavior trait ──────────────────────────────────────────────────────────

/// One step of a pipeline over the context kind `C`.
///
/// A behavior reaches the rest of the chain by calling [`Next::run`]. Not
/// calling it short-circuits every later step. `Next` is consumed by `run`,
/// so the continuation can be invoked at most once.
#[async_trait]
pub trait Behavior<C: Send + 'static>: Send + Sync {
    async fn invoke(&self, context: &mut C, next: Next<'_, C>) -> anyhow::Result<()>;
}

// ── Continuation ────────────────────────────────────────────────────────────

/// Per-execution bookkeeping shared by every `Next` of one run.
pub(crate) struct ExecutionState {
    cancellation: CancellationToken,
    reached_end: AtomicBool,
    furthest: AtomicUsize,
}

impl ExecutionState {
    pub(crate) fn new(cancellation: CancellationToken) -> Self {
        Self {
            cancellation,
            reached_end: AtomicBool::new(false),
            furthest: AtomicUsize::new(0),
        }
    }

    pub(crate) fn reached_end(&self) -> bool {
        self.reached_end.load(Ordering::Acquire)
    }

    /// Index of the deepest step that was entered.
    pub(crate) fn furthest(&self) -> usize {
        self.furthest.load(Ordering::Acquire)
    }
}

/// The remainder of the chain after the current behavior.
pub struct Next<'a, C: Send + 'static> {
    chain: &'a [Arc<dyn Behavior<C>>],
    index: usize,
    state: &'a ExecutionState,
}

impl<'a, C: Send + 'static> Next<'a, C> {
    pub(crate) fn new(chain: &'a [Arc<dyn Behavior<C>>], state: &'a ExecutionState) -> Self {
        Self {
            chain,
            index: 0,
            state,
        }
    }

    /// Invoke the next behavior, or finish the chain if there is none.
    ///
    /// Returns [`Error::Cancelled`] without running anything once the
    /// execution's cancellation token has fired.
    pub async fn run(self, context: &mut C) -> anyhow::Result<()> {
        if self.state.cancellation.is_cancelled() {
            return Err(Error::Cancelled.into());
        }
        match self.chain.split_first() {
            Some((behavior, rest)) => {
                self.state.furthest.fetch_max(self.index, Ordering::AcqRel);
                let next = Next {
                    chain: rest,
                    index: self.index + 1,
                    state: self.state,
                };
                behavior.invoke(context, next).await
            },
            None => {
                self.state.reached_end.store(true, Ordering::Release);
                Ok(())
            },
        }
    }

    /// Cancellation token of the current execution, for behaviors that wait
    /// on I/O and need to observe shutdown themselves.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.state.cancellation
    }

    /// Number of behaviors still ahead in the chain.
    pub fn remaining(&self) -> usize {
        self.chain.len()
    }
}
