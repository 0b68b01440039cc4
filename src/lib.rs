//! Discrete-Event Scheduling Kernel
//!
//! A deterministic simulation kernel with:
//! - A red-black event tree keyed by `(tick, priority)` with FIFO/LIFO ties
//! - Suspendable processes (`async` target bodies) with call/return semantics
//! - Cancellable handles and condition-gated events
//! - Offline stepping and wall-clock paced execution (spin_sleep)

pub mod context;
pub mod error;
pub mod event;
mod executor;
pub mod listener;
pub mod process;
pub mod scheduler;
pub mod target;
pub mod tree;

#[cfg(test)]
mod rng;


pub use context::{Ctx, InterruptFuture, StartFuture, WaitFuture};
pub use error::{KernelError, KernelResult, TargetResult};
pub use event::{Conditional, EventData, EventHandle};
pub use listener::{LogTimeListener, TimeListener, TraceListener};
pub use process::ContextId;
pub use scheduler::{RunState, Scheduler, SchedulerConfig};
pub use target::{target_fn, FnTarget, ProcessTarget, TargetFuture};
pub use tree::{Priority, Tick};
