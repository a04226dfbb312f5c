//! Event listeners and the registry they are stored in.

use std::{borrow::Cow, collections::HashMap, fmt, sync::Arc};

use crate::{
    context::ProcessingContext,
    event::ProcessingEvent,
    stage::{StageRef, StageResult},
};

type RouteFn<C> = dyn Fn(&C, Option<&StageRef<C>>) -> StageResult<C> + Send + Sync;

/// Routing function notified when a stage fires an event.
///
/// Receives the context and the proposed next stage and returns the stage
/// the chain should actually continue with. Returning `None` ends the chain;
/// returning a stage when the proposal was `None` extends it.
pub struct Listener<C: ProcessingContext> {
    name: Cow<'static, str>,
    route: Arc<RouteFn<C>>,
}

impl<C: ProcessingContext> Listener<C> {
    pub fn new<F>(route: F) -> Self
    where
        F: Fn(&C, Option<&StageRef<C>>) -> StageResult<C> + Send + Sync + 'static,
    {
        Self::named("anonymous", route)
    }

    pub fn named<F>(name: impl Into<Cow<'static, str>>, route: F) -> Self
    where
        F: Fn(&C, Option<&StageRef<C>>) -> StageResult<C> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            route: Arc::new(route),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn apply(&self, context: &C, proposed: Option<&StageRef<C>>) -> StageResult<C> {
        (self.route)(context, proposed)
    }
}

impl<C: ProcessingContext> Clone for Listener<C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            route: self.route.clone(),
        }
    }
}

impl<C: ProcessingContext> fmt::Debug for Listener<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener").field("name", &self.name).finish()
    }
}

/// Accumulates event listeners for one type of processing context.
///
/// Listeners for the same event are kept in registration order; nothing is
/// deduplicated or prioritized. Registration needs exclusive access, so once
/// the source is shared with running chains (usually through an `Arc`) it is
/// effectively frozen.
pub struct ListenerSource<C: ProcessingContext> {
    listeners: HashMap<ProcessingEvent, Vec<Listener<C>>>,
}

impl<C: ProcessingContext> ListenerSource<C> {
    pub fn new() -> Self {
        Self {
            listeners: HashMap::new(),
        }
    }

    /// Appends `listener` to the listeners of `event`.
    pub fn add_listener(&mut self, event: ProcessingEvent, listener: Listener<C>) -> &mut Self {
        self.listeners.entry(event).or_default().push(listener);
        self
    }

    /// Listeners interested in `event`, in registration order.
    pub fn listeners(&self, event: ProcessingEvent) -> &[Listener<C>] {
        self.listeners
            .get(&event)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Total number of registered listeners across all events.
    pub fn len(&self) -> usize {
        self.listeners.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<C: ProcessingContext> Default for ListenerSource<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: ProcessingContext> fmt::Debug for ListenerSource<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.listeners.iter().map(|(k, v)| (k, v.len())))
            .finish()
    }
}
