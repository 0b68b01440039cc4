//! Observers
//!
//! Both listener kinds are invoked with scheduling disabled: any attempt to
//! schedule, wait, kill or interrupt from inside a callback fails with
//! [`KernelError::SchedulingDisabled`](crate::KernelError::SchedulingDisabled).

use crate::tree::{Priority, Tick};

/// Notified on clock movement, run-state changes and runtime failures.
pub trait TimeListener {
    fn tick_update(&self, tick: Tick);

    /// `running` is true when the dispatch loop starts, false when it stops.
    fn time_running(&self, running: bool);

    /// A target failed and the run was halted.
    fn handle_error(&self, error: &anyhow::Error);
}

/// Default time listener: routes everything to the `log` facade.
#[derive(Clone, Debug, Default)]
pub struct LogTimeListener {
    pub name: String,
}

impl LogTimeListener {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl TimeListener for LogTimeListener {
    fn tick_update(&self, tick: Tick) {
        log::trace!("[{}] tick {}", self.name, tick);
    }

    fn time_running(&self, running: bool) {
        if running {
            log::debug!("[{}] running", self.name);
        } else {
            log::debug!("[{}] stopped", self.name);
        }
    }

    fn handle_error(&self, error: &anyhow::Error) {
        log::error!("[{}] simulation halted: {:#}", self.name, error);
    }
}

/// Hooks around every kernel operation. All methods default to no-ops.
///
/// `key` arguments are `None` for conditional occurrences, which have no tick.
#[allow(unused_variables)]
pub trait TraceListener {
    /// An event is about to be dispatched.
    fn trace_event(&self, tick: Tick, priority: Priority, description: &str) {}

    /// The current context is parking until `tick`.
    fn trace_wait(&self, tick: Tick, priority: Priority, description: &str) {}

    /// A target was scheduled from inside a context.
    fn trace_schedule(&self, tick: Tick, priority: Priority, description: &str) {}

    /// A target was scheduled from outside any context.
    fn trace_schedule_external(&self, tick: Tick, priority: Priority, description: &str) {}

    fn trace_process_start(&self, description: &str) {}

    fn trace_process_end(&self) {}

    fn trace_kill(&self, key: Option<(Tick, Priority)>, description: &str) {}

    fn trace_interrupt(&self, key: Option<(Tick, Priority)>, description: &str) {}

    /// The current context is parking on a condition.
    fn trace_wait_until(&self) {}

    fn trace_schedule_until(&self, description: &str) {}

    fn trace_conditional_eval(&self, description: &str) {}

    fn trace_conditional_eval_ended(&self, fired: bool, description: &str) {}
}
