//! Event records
//!
//! What the kernel stores for each pending occurrence, and the handle
//! callers keep to cancel or force it.

use crate::process::ContextId;
use crate::target::ProcessTarget;
use crate::tree::{EventId, Priority, Tick};
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

/// What happens when an occurrence fires.
#[derive(Clone)]
pub(crate) enum Work {
    /// Run a target in a fresh context.
    Run(Rc<dyn ProcessTarget>),
    /// Resume a parked context.
    Resume(ContextId),
}

impl Work {
    pub(crate) fn description(&self) -> String {
        match self {
            Work::Run(target) => target.description(),
            Work::Resume(_) => "Waiting".to_string(),
        }
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Work::Run(target) => write!(f, "Run({})", target.description()),
            Work::Resume(id) => write!(f, "Resume({})", id),
        }
    }
}

/// A timed occurrence stored in the event tree.
pub(crate) struct Event {
    pub work: Work,
    pub handle: Option<EventHandle>,
}

/// A predicate-gated occurrence waiting in the conditional list.
pub(crate) struct ConditionalEvent {
    pub id: u64,
    pub condition: Box<dyn Conditional>,
    pub work: Work,
    pub handle: Option<EventHandle>,
}

/// Where a handle's occurrence currently lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Occurrence {
    Timed(EventId),
    Conditional(u64),
}

/// A cancellable reference to at most one pending occurrence.
///
/// Clones share the same slot, so any clone observes scheduling, firing
/// and cancellation.
#[derive(Clone, Default)]
pub struct EventHandle(Rc<Cell<Option<Occurrence>>>);

impl EventHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while the referenced occurrence is pending.
    pub fn is_scheduled(&self) -> bool {
        self.0.get().is_some()
    }

    pub(crate) fn occurrence(&self) -> Option<Occurrence> {
        self.0.get()
    }

    pub(crate) fn attach(&self, occurrence: Occurrence) {
        self.0.set(Some(occurrence));
    }

    pub(crate) fn detach(&self) {
        self.0.set(None);
    }
}

impl fmt::Debug for EventHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EventHandle").field(&self.0.get()).finish()
    }
}

/// A predicate polled by the kernel before each time advance.
///
/// Evaluated with scheduling disabled; it must only inspect state.
pub trait Conditional {
    fn evaluate(&mut self) -> bool;
}

impl<F: FnMut() -> bool> Conditional for F {
    fn evaluate(&mut self) -> bool {
        self()
    }
}

/// Snapshot of one pending event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventData {
    pub ticks: Tick,
    pub priority: Priority,
    pub description: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::EventTree;

    #[test]
    fn test_handle_clones_share_state() {
        let mut tree: EventTree<u8> = EventTree::new();
        let id = tree.schedule(1, 0, 0, true);

        let handle = EventHandle::new();
        let clone = handle.clone();
        assert!(!clone.is_scheduled());
        handle.attach(Occurrence::Timed(id));
        assert!(clone.is_scheduled());
        assert_eq!(clone.occurrence(), Some(Occurrence::Timed(id)));
        clone.detach();
        assert!(!handle.is_scheduled());
    }

    #[test]
    fn test_closure_conditional() {
        let mut n = 0;
        let mut cond = move || {
            n += 1;
            n > 2
        };
        assert!(!Conditional::evaluate(&mut cond));
        assert!(!Conditional::evaluate(&mut cond));
        assert!(Conditional::evaluate(&mut cond));
    }
}
