//! Kernel errors
//!
//! Usage errors are returned at the call site that violated the contract.
//! Runtime failures (errors or panics escaping a target) are carried as
//! `anyhow::Error` and delivered to the time listener instead.

use crate::tree::{Priority, Tick};

/// A caller contract violation or an internal invariant breach.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum KernelError {
    /// Scheduling with a negative delay.
    #[error("negative duration wait is invalid, delay = {delay}")]
    NegativeDelay { delay: Tick },

    /// The handle already references a pending occurrence.
    #[error("tried to schedule using an event handle already in use")]
    HandleInUse,

    /// A scheduling primitive was called from inside an observer or condition callback.
    #[error("event control attempted from inside a user callback")]
    SchedulingDisabled,

    /// A context API was used from outside the context that owns it.
    #[error("context {id} is not the currently executing context")]
    NotCurrentContext { id: usize },

    /// A context tried to suspend while already parked on another occurrence.
    #[error("context {id} is already suspended")]
    AlreadySuspended { id: usize },

    /// Attempt to kill a context that is executing user code.
    #[error("cannot terminate active context {id}")]
    ContextActive { id: usize },

    /// The event tree lost track of a node it vacated itself.
    #[error("tried to remove an event node that could not be found ({tick}, {priority})")]
    NodeNotFound { tick: Tick, priority: Priority },

    /// An event id that no longer refers to a pending event.
    #[error("event is not pending")]
    StaleEvent,

    /// A target future returned `Pending` without a kernel suspension.
    #[error("context {id} suspended outside of the kernel")]
    ForeignSuspend { id: usize },

    /// A parked context was woken by something other than the kernel.
    #[error("context {id} was woken from outside the kernel")]
    ExternalWake { id: usize },

    /// Tick lengths must be positive and finite.
    #[error("invalid tick length {length}")]
    InvalidTickLength { length: f64 },

    /// The operation needs the dispatch loop to be stopped.
    #[error("scheduler is running")]
    SchedulerBusy,

    /// The scheduler owning a context has been dropped.
    #[error("scheduler has been dropped")]
    SchedulerGone,
}

/// Convenience alias for `Result<T, KernelError>`.
pub type KernelResult<T> = Result<T, KernelError>;

/// What a target body returns.
pub type TargetResult = anyhow::Result<()>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_negative_delay() {
        let e = KernelError::NegativeDelay { delay: -3 };
        assert!(e.to_string().contains("-3"));
    }

    #[test]
    fn test_converts_into_anyhow() {
        fn fails() -> TargetResult {
            Err(KernelError::HandleInUse)?;
            Ok(())
        }
        let err = fails().unwrap_err();
        assert_eq!(
            err.downcast_ref::<KernelError>(),
            Some(&KernelError::HandleInUse)
        );
    }
}
