//! Processing stages: the units of protocol work a chain is made of.

use std::{borrow::Cow, fmt, sync::Arc};

use crate::{context::ProcessingContext, event::ProcessingEvent};

/// Error produced by a failing stage. Passed through to the run's completion
/// handle untouched.
pub type StageError = anyhow::Error;

/// Shared reference to a stage. Stages are immutable and may be part of many
/// chains and runs at the same time.
pub type StageRef<C> = Arc<dyn ProcessingStage<C>>;

pub type StageResult<C> = Result<Option<StageRef<C>>, StageError>;

/// A single unit of protocol work.
///
/// The engine keeps no stage state between calls; everything a stage needs
/// to carry over to later stages goes into the context.
pub trait ProcessingStage<C: ProcessingContext>: Send + Sync {
    /// Name reported in diagnostics.
    fn name(&self) -> &str;

    /// Event fired once this stage finishes, if any.
    fn after(&self) -> Option<ProcessingEvent> {
        None
    }

    /// Runs the stage and returns the default next stage, or `None` to end the chain.
    fn execute(&self, context: &mut C) -> StageResult<C>;
}

impl<C: ProcessingContext> fmt::Debug for dyn ProcessingStage<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessingStage")
            .field("name", &self.name())
            .field("after", &self.after())
            .finish()
    }
}

/// Returns true if both references point to the same stage instance.
pub fn same_stage<C: ProcessingContext>(a: &StageRef<C>, b: &StageRef<C>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

type Work<C> = Box<dyn Fn(&mut C) -> Result<(), StageError> + Send + Sync>;

/// Stage with a fixed default continuation.
///
/// Runs its work and hands over to the configured next stage; listeners
/// registered for its event can still reroute the chain.
pub struct BaseStage<C: ProcessingContext> {
    name: Cow<'static, str>,
    after: Option<ProcessingEvent>,
    next: Option<StageRef<C>>,
    work: Work<C>,
}

impl<C: ProcessingContext> BaseStage<C> {
    pub fn new<F>(name: impl Into<Cow<'static, str>>, work: F) -> Self
    where
        F: Fn(&mut C) -> Result<(), StageError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            after: None,
            next: None,
            work: Box::new(work),
        }
    }

    pub fn with_event(mut self, event: ProcessingEvent) -> Self {
        self.after = Some(event);
        self
    }

    pub fn with_next(mut self, next: StageRef<C>) -> Self {
        self.next = Some(next);
        self
    }

    pub fn into_ref(self) -> StageRef<C> {
        Arc::new(self)
    }
}

impl<C: ProcessingContext> ProcessingStage<C> for BaseStage<C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn after(&self) -> Option<ProcessingEvent> {
        self.after
    }

    fn execute(&self, context: &mut C) -> StageResult<C> {
        (self.work)(context)?;
        Ok(self.next.clone())
    }
}

type Route<C> = Box<dyn Fn(&mut C) -> StageResult<C> + Send + Sync>;

/// Stage that decides its own continuation at runtime.
pub struct RoutingStage<C: ProcessingContext> {
    name: Cow<'static, str>,
    after: Option<ProcessingEvent>,
    route: Route<C>,
}

impl<C: ProcessingContext> RoutingStage<C> {
    pub fn new<F>(name: impl Into<Cow<'static, str>>, route: F) -> Self
    where
        F: Fn(&mut C) -> StageResult<C> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            after: None,
            route: Box::new(route),
        }
    }

    pub fn with_event(mut self, event: ProcessingEvent) -> Self {
        self.after = Some(event);
        self
    }

    pub fn into_ref(self) -> StageRef<C> {
        Arc::new(self)
    }
}

impl<C: ProcessingContext> ProcessingStage<C> for RoutingStage<C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn after(&self) -> Option<ProcessingEvent> {
        self.after
    }

    fn execute(&self, context: &mut C) -> StageResult<C> {
        (self.route)(context)
    }
}

/// Wraps a stage so that its failures end the run gracefully instead of
/// failing it.
///
/// The error is recorded on the context through
/// [`ProcessingContext::record_failure`]; the chain then terminates as if the
/// stage had returned no next stage, so the finalizer runs and the run
/// succeeds.
pub struct TerminateOnError<C: ProcessingContext> {
    inner: StageRef<C>,
}

impl<C: ProcessingContext> TerminateOnError<C> {
    pub fn new(inner: StageRef<C>) -> Self {
        Self { inner }
    }

    pub fn into_ref(self) -> StageRef<C> {
        Arc::new(self)
    }
}

impl<C: ProcessingContext> ProcessingStage<C> for TerminateOnError<C> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn after(&self) -> Option<ProcessingEvent> {
        self.inner.after()
    }

    fn execute(&self, context: &mut C) -> StageResult<C> {
        match self.inner.execute(context) {
            Ok(next) => Ok(next),
            Err(error) => {
                tracing::warn!(
                    stage = self.inner.name(),
                    torrent = %crate::context::DisplayTorrent(context.torrent_id()),
                    %error,
                    "stage failed, terminating chain"
                );
                context.record_failure(self.inner.name(), &error);
                Ok(None)
            }
        }
    }
}

/// Links [`BaseStage`]s front to back into a linear chain.
pub struct ChainBuilder<C: ProcessingContext> {
    stages: Vec<BaseStage<C>>,
}

impl<C: ProcessingContext> ChainBuilder<C> {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    pub fn then(mut self, stage: BaseStage<C>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Returns the head of the chain, or `None` if no stage was added.
    pub fn build(self) -> Option<StageRef<C>> {
        self.stages.into_iter().rev().fold(None, |next, stage| {
            let stage = match next {
                Some(next) => stage.with_next(next),
                None => stage,
            };
            Some(stage.into_ref())
        })
    }
}

impl<C: ProcessingContext> Default for ChainBuilder<C> {
    fn default() -> Self {
        Self::new()
    }
}
