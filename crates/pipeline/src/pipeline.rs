//! Step registration, ordering and execution.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::Arc,
    time::Instant,
};

use {
    tokio_util::sync::CancellationToken,
    tracing::{Instrument, debug, debug_span, info},
};

#[cfg(feature = "metrics")]
use conveyor_metrics::{counter, histogram, labels, pipeline as pipeline_metrics};

use crate::{
    behavior::{Behavior, ExecutionState, Next},
    error::{Error, Result},
};

// ── Registration ────────────────────────────────────────────────────────────

/// A behavior together with its id and ordering constraints.
pub struct RegisterStep<C: Send + 'static> {
    id: String,
    behavior: Arc<dyn Behavior<C>>,
    before: Vec<String>,
    after: Vec<String>,
}

impl<C: Send + 'static> RegisterStep<C> {
    pub fn new(id: impl Into<String>, behavior: impl Behavior<C> + 'static) -> Self {
        Self::from_arc(id, Arc::new(behavior))
    }

    pub fn from_arc(id: impl Into<String>, behavior: Arc<dyn Behavior<C>>) -> Self {
        Self {
            id: id.into(),
            behavior,
            before: Vec::new(),
            after: Vec::new(),
        }
    }

    /// Run this step before the step `id`.
    #[must_use]
    pub fn insert_before(mut self, id: impl Into<String>) -> Self {
        self.before.push(id.into());
        self
    }

    /// Run this step after the step `id`.
    #[must_use]
    pub fn insert_after(mut self, id: impl Into<String>) -> Self {
        self.after.push(id.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Collects steps for one stage and resolves their order.
pub struct PipelineBuilder<C: Send + 'static> {
    stage: String,
    steps: Vec<RegisterStep<C>>,
    replacements: Vec<(String, Arc<dyn Behavior<C>>)>,
    terminal: Option<RegisterStep<C>>,
}

impl<C: Send + 'static> PipelineBuilder<C> {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            steps: Vec::new(),
            replacements: Vec::new(),
            terminal: None,
        }
    }

    pub fn register(&mut self, step: RegisterStep<C>) -> &mut Self {
        self.steps.push(step);
        self
    }

    /// Swap the behavior of an already registered step, keeping its id and
    /// ordering constraints.
    pub fn replace(
        &mut self,
        id: impl Into<String>,
        behavior: impl Behavior<C> + 'static,
    ) -> &mut Self {
        let behavior: Arc<dyn Behavior<C>> = Arc::new(behavior);
        self.replacements.push((id.into(), behavior));
        self
    }

    /// Pin `step` as the last step of the stage. Steps ordered after it form
    /// a cycle.
    pub fn terminate_with(&mut self, step: RegisterStep<C>) -> &mut Self {
        self.terminal = Some(step);
        self
    }

    /// Resolve the ordering constraints into a fixed chain.
    ///
    /// Steps without a constraint between them keep their registration
    /// order, so building the same registrations twice yields the same chain.
    pub fn build(self) -> Result<Pipeline<C>> {
        let Self {
            stage,
            mut steps,
            replacements,
            terminal,
        } = self;

        let has_terminal = terminal.is_some();
        steps.extend(terminal);

        let mut index_of: HashMap<String, usize> = HashMap::with_capacity(steps.len());
        for (index, step) in steps.iter().enumerate() {
            if index_of.insert(step.id.clone(), index).is_some() {
                return Err(Error::duplicate_step(&step.id));
            }
        }

        for (id, behavior) in replacements {
            let index = *index_of
                .get(&id)
                .ok_or_else(|| Error::ReplaceUnknownStep { id: id.clone() })?;
            steps[index].behavior = behavior;
            debug!(stage = %stage, step = %id, "step behavior replaced");
        }

        // edges[a] holds every step that must run after `a`.
        let count = steps.len();
        let mut edges: Vec<HashSet<usize>> = vec![HashSet::new(); count];
        for (index, step) in steps.iter().enumerate() {
            for reference in &step.before {
                let target = *index_of
                    .get(reference)
                    .ok_or_else(|| Error::unknown_reference(&step.id, "before", reference))?;
                edges[index].insert(target);
            }
            for reference in &step.after {
                let source = *index_of
                    .get(reference)
                    .ok_or_else(|| Error::unknown_reference(&step.id, "after", reference))?;
                edges[source].insert(index);
            }
        }
        if has_terminal {
            let terminal = count - 1;
            for successors in edges.iter_mut().take(terminal) {
                successors.insert(terminal);
            }
        }

        let order = topological_order(&edges).map_err(|stuck| Error::Cycle {
            steps: stuck.into_iter().map(|i| steps[i].id.clone()).collect(),
        })?;

        let mut slots: Vec<Option<RegisterStep<C>>> = steps.into_iter().map(Some).collect();
        let mut ids = Vec::with_capacity(count);
        let mut behaviors = Vec::with_capacity(count);
        for index in order {
            if let Some(step) = slots[index].take() {
                ids.push(step.id);
                behaviors.push(step.behavior);
            }
        }

        info!(stage = %stage, steps = ?ids, "pipeline built");
        Ok(Pipeline {
            stage,
            ids,
            behaviors,
            has_terminal,
        })
    }
}

/// Kahn's algorithm, always picking the lowest registration index among the
/// ready steps. On a cycle, returns the indices that could not be placed.
fn topological_order(edges: &[HashSet<usize>]) -> std::result::Result<Vec<usize>, Vec<usize>> {
    let mut in_degree = vec![0usize; edges.len()];
    for successors in edges {
        for &target in successors {
            in_degree[target] += 1;
        }
    }

    let mut ready: BTreeSet<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, degree)| **degree == 0)
        .map(|(index, _)| index)
        .collect();
    let mut order = Vec::with_capacity(edges.len());

    while let Some(index) = ready.pop_first() {
        order.push(index);
        for &target in &edges[index] {
            in_degree[target] -= 1;
            if in_degree[target] == 0 {
                ready.insert(target);
            }
        }
    }

    if order.len() == edges.len() {
        Ok(order)
    } else {
        let placed: HashSet<usize> = order.into_iter().collect();
        Err((0..edges.len()).filter(|i| !placed.contains(i)).collect())
    }
}

// ── Execution ───────────────────────────────────────────────────────────────

/// How an execution that did not fail ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Every step ran, or the terminal step was reached.
    Completed,
    /// `step` returned without calling its continuation.
    ShortCircuited { step: String },
}

/// An ordered, immutable chain of behaviors for one context kind.
pub struct Pipeline<C: Send + 'static> {
    stage: String,
    ids: Vec<String>,
    behaviors: Vec<Arc<dyn Behavior<C>>>,
    has_terminal: bool,
}

impl<C: Send + 'static> Pipeline<C> {
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Step ids in execution order.
    pub fn steps(&self) -> &[String] {
        &self.ids
    }

    /// Run the chain over `context`.
    ///
    /// Behavior errors are returned exactly as raised. Cancellation is
    /// checked before each step and surfaces as [`Error::Cancelled`].
    pub async fn execute(
        &self,
        context: &mut C,
        cancellation: &CancellationToken,
    ) -> anyhow::Result<Outcome> {
        let state = ExecutionState::new(cancellation.clone());
        let started = Instant::now();

        let result = Next::new(&self.behaviors, &state)
            .run(context)
            .instrument(debug_span!("stage", stage = %self.stage))
            .await;

        #[cfg(feature = "metrics")]
        {
            counter!(pipeline_metrics::EXECUTIONS_TOTAL, labels::STAGE => self.stage.clone())
                .increment(1);
            histogram!(pipeline_metrics::EXECUTION_DURATION_SECONDS, labels::STAGE => self.stage.clone())
                .record(started.elapsed().as_secs_f64());
        }

        if let Err(error) = result {
            #[cfg(feature = "metrics")]
            counter!(pipeline_metrics::FAILURES_TOTAL, labels::STAGE => self.stage.clone())
                .increment(1);
            debug!(stage = %self.stage, error = %error, "pipeline execution failed");
            return Err(error);
        }

        let furthest = state.furthest();
        let completed = state.reached_end()
            || (self.has_terminal && furthest + 1 == self.behaviors.len());
        let outcome = if completed {
            Outcome::Completed
        } else {
            let step = self.ids.get(furthest).cloned().unwrap_or_default();
            #[cfg(feature = "metrics")]
            counter!(
                pipeline_metrics::SHORT_CIRCUITS_TOTAL,
                labels::STAGE => self.stage.clone(),
                labels::STEP => step.clone()
            )
            .increment(1);
            Outcome::ShortCircuited { step }
        };

        debug!(
            stage = %self.stage,
            outcome = ?outcome,
            elapsed_us = elapsed_micros(started),
            "pipeline executed"
        );
        Ok(outcome)
    }
}

fn elapsed_micros(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX)
}

impl<C: Send + 'static> std::fmt::Debug for Pipeline<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stage", &self.stage)
            .field("steps", &self.ids)
            .finish()
    }
}
