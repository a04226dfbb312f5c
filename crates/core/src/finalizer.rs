use serde::{Deserialize, Serialize};

use crate::context::ProcessingContext;

/// Cleanup hook run exactly once when a chain run terminates, whether it
/// finished or a stage failed.
///
/// A single finalizer instance is shared by every run of a processor, so
/// implementations touching shared state must tolerate concurrent calls.
pub trait ContextFinalizer<C: ProcessingContext>: Send + Sync {
    fn finalize(&self, context: &mut C) -> anyhow::Result<()>;
}

impl<C, F> ContextFinalizer<C> for F
where
    C: ProcessingContext,
    F: Fn(&mut C) -> anyhow::Result<()> + Send + Sync,
{
    fn finalize(&self, context: &mut C) -> anyhow::Result<()> {
        self(context)
    }
}

/// What a failing finalizer does to the outcome of the run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum FinalizerFailurePolicy {
    /// Report the failure and keep the run's outcome.
    #[default]
    Log,
    /// Fail an otherwise successful run. A run already failed by a stage
    /// keeps the stage error.
    FailRun,
}
