//! Staged protocol-phase processing for peer-to-peer transfer clients.
//!
//! A connection or transfer advances through a chain of
//! [stages](stage::ProcessingStage) (handshake, metadata exchange, piece
//! negotiation, data transfer, ...). The [`ChainProcessor`] runs one chain per
//! submitted context on a worker pool, lets [listeners](listener::Listener)
//! reroute the chain whenever a stage fires an
//! [event](event::ProcessingEvent), and guarantees the context
//! [finalizer](finalizer::ContextFinalizer) runs exactly once per run.

/// Host and simulation configuration.
pub mod config;

/// Per-run context and identifiers.
pub mod context;

/// Observation hooks for chain runs.
pub mod diagnostics;

pub mod event;

/// Worker pools hosting chain runs.
pub mod executor;

pub mod finalizer;

/// Event listeners and their registry.
pub mod listener;

/// Chain execution engine.
pub mod processor;

/// Simulated peer sessions used by the binary and the integration tests.
pub mod simulation;

pub mod stage;

/// Tracing and logging infrastructure.
#[cfg_attr(test, allow(dead_code))]
mod tracing;

pub use context::{ProcessingContext, RunId, TorrentId};
pub use event::ProcessingEvent;
pub use finalizer::{ContextFinalizer, FinalizerFailurePolicy};
pub use listener::{Listener, ListenerSource};
pub use processor::{ChainProcessor, ProcessingError, ProcessingHandle};
pub use stage::{ProcessingStage, StageError, StageRef, StageResult};
