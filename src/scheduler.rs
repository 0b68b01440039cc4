//! Scheduler
//!
//! Owns the event tree, the conditional list, the clock and the context
//! pool, and runs the dispatch loop that drains them. All state sits behind
//! a single `Rc<RefCell<..>>`; the borrow is never held while user code
//! (target bodies, conditions, listeners) runs.

use crate::error::{KernelError, KernelResult};
use crate::event::{ConditionalEvent, Conditional, Event, EventData, EventHandle, Occurrence, Work};
use crate::executor::{self, Step};
use crate::listener::{LogTimeListener, TimeListener, TraceListener};
use crate::process::{ContextId, ContextPool};
use crate::target::{ProcessTarget, TargetFuture};
use crate::tree::{EventTree, Priority, Tick};
use spin_sleep::SpinSleeper;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Configuration for a scheduler.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub name: String,
    /// Seconds represented by one tick.
    pub tick_length: f64,
    /// Pace the clock against wall time.
    pub real_time: bool,
    /// Simulated seconds per wall-clock second when pacing.
    pub real_time_factor: f64,
    /// Upper bound on a single pacing sleep.
    pub max_pacing_sleep: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: "scheduler".to_string(),
            tick_length: 1e-6,
            real_time: false,
            real_time_factor: 1.0,
            max_pacing_sleep: Duration::from_millis(20),
        }
    }
}

/// Coarse state of the dispatch loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    /// Not running and nothing pending.
    Idle,
    /// The dispatch loop is executing.
    Running,
    /// Stopped with work still pending.
    Paused,
}

pub(crate) type Shared = Rc<RefCell<SchedulerInner>>;

/// One step of the dispatch loop, decided under the borrow and carried out
/// without it.
enum Action {
    Stop,
    Dispatch {
        tick: Tick,
        priority: Priority,
        event: Event,
    },
    Evaluate,
    Pace {
        tick: Tick,
        sleep: Duration,
    },
    Advance {
        tick: Tick,
    },
}

pub(crate) struct SchedulerInner {
    pub name: String,
    pub tree: EventTree<Event>,
    pub conditionals: Vec<ConditionalEvent>,
    next_conditional_id: u64,
    pub pool: ContextPool,
    /// The context whose body is being polled.
    pub current: Option<ContextId>,

    pub current_tick: Tick,
    /// Horizon up to which conditions have been evaluated.
    next_tick: Tick,
    target_tick: Tick,
    conditions_evaluated: bool,

    execute_events: bool,
    process_running: bool,
    pub disable_schedule: bool,
    one_event: bool,
    one_sim_time: bool,

    secs_per_tick: f64,
    ticks_per_second: f64,

    real_time: bool,
    real_time_factor: f64,
    rebase_real_time: bool,
    real_time_tick: Tick,
    real_time_start: Instant,
    max_pacing_sleep: Duration,
    sleeper: SpinSleeper,

    pub time_listener: Rc<dyn TimeListener>,
    pub trace_listener: Option<Rc<dyn TraceListener>>,

    /// Failure raised by the current run, not yet delivered.
    pub failure: Option<anyhow::Error>,
    last_failure: Option<anyhow::Error>,
    /// `(slot, generation)` of contexts woken from outside the kernel.
    pub stray_wakes: Arc<Mutex<Vec<(usize, u64)>>>,
}

/// An occurrence taken out of the queue without running it.
pub(crate) struct Removed {
    /// `None` for conditional occurrences.
    pub key: Option<(Tick, Priority)>,
    pub work: Work,
    /// The predicate of a conditional occurrence; user-owned, so it is
    /// dropped by the caller once the scheduler borrow has ended.
    pub condition: Option<Box<dyn Conditional>>,
}

/// User-owned values detached from a released context. Drop outside the
/// scheduler borrow.
#[derive(Default)]
#[must_use]
pub(crate) struct Leftovers {
    pub future: Option<TargetFuture>,
    pub condition: Option<Box<dyn Conditional>>,
}

impl SchedulerInner {
    fn new(config: &SchedulerConfig) -> Self {
        let mut inner = Self {
            name: config.name.clone(),
            tree: EventTree::new(),
            conditionals: Vec::new(),
            next_conditional_id: 0,
            pool: ContextPool::default(),
            current: None,
            current_tick: 0,
            next_tick: 0,
            target_tick: Tick::MAX,
            conditions_evaluated: false,
            execute_events: false,
            process_running: false,
            disable_schedule: false,
            one_event: false,
            one_sim_time: false,
            secs_per_tick: 1e-6,
            ticks_per_second: 1e6,
            real_time: config.real_time,
            real_time_factor: sanitize_factor(config.real_time_factor),
            rebase_real_time: true,
            real_time_tick: 0,
            real_time_start: Instant::now(),
            max_pacing_sleep: config.max_pacing_sleep,
            sleeper: SpinSleeper::default(),
            time_listener: Rc::new(LogTimeListener::new(config.name.clone())),
            trace_listener: None,
            failure: None,
            last_failure: None,
            stray_wakes: Arc::new(Mutex::new(Vec::new())),
        };
        if let Err(e) = inner.set_tick_length(config.tick_length) {
            log::warn!("[{}] {}, keeping 1e-6", config.name, e);
        }
        inner
    }

    fn set_tick_length(&mut self, length: f64) -> KernelResult<()> {
        if !(length.is_finite() && length > 0.0) {
            return Err(KernelError::InvalidTickLength { length });
        }
        self.secs_per_tick = length;
        self.ticks_per_second = (1e9 / length).round() / 1e9;
        Ok(())
    }

    pub fn seconds_to_ticks(&self, seconds: f64) -> Tick {
        (seconds * self.ticks_per_second).round() as Tick
    }

    pub fn ticks_to_seconds(&self, ticks: Tick) -> f64 {
        ticks as f64 * self.secs_per_tick
    }

    pub fn assert_can_schedule(&self) -> KernelResult<()> {
        if self.disable_schedule {
            return Err(KernelError::SchedulingDisabled);
        }
        Ok(())
    }

    /// Absolute tick for a delay from now, saturating on overflow.
    pub fn event_time(&self, delay: Tick) -> KernelResult<Tick> {
        if delay < 0 {
            return Err(KernelError::NegativeDelay { delay });
        }
        Ok(self.current_tick.saturating_add(delay))
    }

    /// A handle may reference at most one pending occurrence. Checked before
    /// an insert takes ownership of user values, so a rejected call hands
    /// them back to the caller to drop.
    pub fn check_handle(handle: Option<&EventHandle>) -> KernelResult<()> {
        if handle.is_some_and(EventHandle::is_scheduled) {
            return Err(KernelError::HandleInUse);
        }
        Ok(())
    }

    pub fn insert_timed(
        &mut self,
        tick: Tick,
        priority: Priority,
        fifo: bool,
        work: Work,
        handle: Option<&EventHandle>,
    ) -> Occurrence {
        let event = Event {
            work,
            handle: handle.cloned(),
        };
        let occurrence = Occurrence::Timed(self.tree.schedule(tick, priority, event, fifo));
        if let Some(handle) = handle {
            handle.attach(occurrence);
        }
        occurrence
    }

    pub fn insert_conditional(
        &mut self,
        condition: Box<dyn Conditional>,
        work: Work,
        handle: Option<&EventHandle>,
    ) -> Occurrence {
        let id = self.next_conditional_id;
        self.next_conditional_id += 1;
        self.conditionals.push(ConditionalEvent {
            id,
            condition,
            work,
            handle: handle.cloned(),
        });
        let occurrence = Occurrence::Conditional(id);
        if let Some(handle) = handle {
            handle.attach(occurrence);
        }
        occurrence
    }

    /// A parked context no longer has a pending occurrence once its resume
    /// work leaves the queue.
    fn forget_wait(&mut self, work: &Work) {
        if let Work::Resume(id) = work {
            self.pool.get_mut(*id).wait = None;
        }
    }

    /// Detach a pending occurrence without running it. `None` if it
    /// already fired.
    pub fn remove_occurrence(&mut self, occurrence: Occurrence) -> KernelResult<Option<Removed>> {
        match occurrence {
            Occurrence::Timed(id) => {
                if self.tree.payload(id).is_none() {
                    return Ok(None);
                }
                let key = self.tree.event_key(id);
                let event = self.tree.remove_event(id)?;
                if let Some(handle) = &event.handle {
                    handle.detach();
                }
                self.forget_wait(&event.work);
                Ok(Some(Removed {
                    key: Some(key),
                    work: event.work,
                    condition: None,
                }))
            }
            Occurrence::Conditional(id) => {
                let Some(pos) = self.conditionals.iter().position(|c| c.id == id) else {
                    return Ok(None);
                };
                let cond = self.conditionals.remove(pos);
                if let Some(handle) = &cond.handle {
                    handle.detach();
                }
                self.forget_wait(&cond.work);
                Ok(Some(Removed {
                    key: None,
                    work: cond.work,
                    condition: Some(cond.condition),
                }))
            }
        }
    }

    /// The parked context an occurrence would resume, if any.
    pub fn waiter(&self, occurrence: Occurrence) -> Option<ContextId> {
        let work = match occurrence {
            Occurrence::Timed(id) => self.tree.payload(id).map(|e| &e.work),
            Occurrence::Conditional(id) => self
                .conditionals
                .iter()
                .find(|c| c.id == id)
                .map(|c| &c.work),
        };
        match work {
            Some(Work::Resume(id)) => Some(*id),
            _ => None,
        }
    }

    pub fn pause(&mut self) {
        self.execute_events = false;
    }

    /// Return a context to the pool, withdrawing any wait it left behind.
    /// Its body and any withdrawn predicate are handed back so they can be
    /// dropped outside the borrow.
    pub fn release_context(&mut self, id: ContextId) -> Leftovers {
        let mut leftovers = Leftovers::default();
        if let Some(occurrence) = self.pool.get_mut(id).wait.take() {
            match self.remove_occurrence(occurrence) {
                Ok(Some(removed)) => leftovers.condition = removed.condition,
                Ok(None) => {}
                Err(e) => log::error!("[{}] withdrawing wait of {}: {}", self.name, id, e),
            }
        }
        leftovers.future = self.pool.release(id);
        leftovers
    }

    /// First context woken from outside the kernel while parked. Wakes of
    /// finished or reassigned contexts are stale and only logged.
    fn take_stray_wake(&mut self) -> Option<ContextId> {
        let wakes = std::mem::take(
            &mut *self
                .stray_wakes
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let mut faulted = None;
        for (index, generation) in wakes {
            match self.pool.parked(index, generation) {
                Some(id) => {
                    faulted.get_or_insert(id);
                }
                None => log::warn!(
                    "[{}] ignoring stale wake of ctx#{} (generation {})",
                    self.name,
                    index,
                    generation
                ),
            }
        }
        faulted
    }

    fn real_time_tick(&mut self) -> Tick {
        let now = Instant::now();
        if self.rebase_real_time {
            self.real_time_tick = self.current_tick;
            self.real_time_start = now;
            self.rebase_real_time = false;
        }
        let elapsed = now.duration_since(self.real_time_start).as_secs_f64() * self.real_time_factor;
        self.real_time_tick.saturating_add(self.seconds_to_ticks(elapsed))
    }

    fn next_action(&mut self) -> KernelResult<Action> {
        let evaluated = std::mem::take(&mut self.conditions_evaluated);
        loop {
            let first = self.tree.first_key();
            let (tick, priority) = match first {
                Some(key) if self.execute_events && self.current_tick <= self.target_tick => key,
                _ => {
                    self.execute_events = false;
                    self.one_event = false;
                    self.one_sim_time = false;
                    return Ok(Action::Stop);
                }
            };

            if tick == self.current_tick {
                let Some(head) = self.tree.first().and_then(|n| self.tree.head(n)) else {
                    return Err(KernelError::NodeNotFound { tick, priority });
                };
                let event = self.tree.remove_event(head)?;
                if let Some(handle) = &event.handle {
                    handle.detach();
                }
                self.forget_wait(&event.work);
                return Ok(Action::Dispatch {
                    tick,
                    priority,
                    event,
                });
            }

            // Advancing time: conditions get a look first.
            if tick > self.next_tick {
                if !self.conditionals.is_empty() && !evaluated {
                    return Ok(Action::Evaluate);
                }
                self.next_tick = self.tree.first_key().map_or(tick, |(t, _)| t);
                if self.next_tick == self.current_tick {
                    continue;
                }
            }

            if self.current_tick == self.target_tick {
                self.execute_events = false;
                continue;
            }

            if self.real_time {
                let real_tick = self.real_time_tick().max(self.current_tick);
                if real_tick < self.next_tick && real_tick < self.target_tick {
                    self.current_tick = real_tick;
                    let until = self.next_tick.min(self.target_tick) - real_tick;
                    let wall = self.ticks_to_seconds(until) / self.real_time_factor;
                    let sleep = Duration::try_from_secs_f64(wall)
                        .unwrap_or(self.max_pacing_sleep)
                        .min(self.max_pacing_sleep);
                    return Ok(Action::Pace {
                        tick: real_tick,
                        sleep,
                    });
                }
            }

            self.current_tick = self.target_tick.min(self.next_tick);
            if self.one_sim_time {
                self.execute_events = false;
                self.one_sim_time = false;
            }
            return Ok(Action::Advance {
                tick: self.current_tick,
            });
        }
    }
}

fn sanitize_factor(factor: f64) -> f64 {
    if factor.is_finite() && factor > 0.0 {
        factor
    } else {
        1.0
    }
}

/// Run `f` with scheduling disabled, restoring the previous setting after.
pub(crate) fn notify<R>(shared: &Shared, f: impl FnOnce() -> R) -> R {
    struct Restore<'a> {
        shared: &'a Shared,
        saved: bool,
    }
    impl Drop for Restore<'_> {
        fn drop(&mut self) {
            if let Ok(mut inner) = self.shared.try_borrow_mut() {
                inner.disable_schedule = self.saved;
            }
        }
    }

    let saved = std::mem::replace(&mut shared.borrow_mut().disable_schedule, true);
    let _restore = Restore { shared, saved };
    f()
}

/// Invoke the trace listener, if one is installed.
pub(crate) fn trace(shared: &Shared, f: impl FnOnce(&dyn TraceListener)) {
    let listener = shared.borrow().trace_listener.clone();
    if let Some(listener) = listener {
        notify(shared, || f(listener.as_ref()));
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Handle to a discrete-event scheduler. Clones refer to the same kernel.
#[derive(Clone)]
pub struct Scheduler {
    shared: Shared,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            shared: Rc::new(RefCell::new(SchedulerInner::new(&config))),
        }
    }

    pub(crate) fn from_shared(shared: Shared) -> Self {
        Self { shared }
    }

    pub fn name(&self) -> String {
        self.shared.borrow().name.clone()
    }

    /// Replace the time listener; `None` restores the logging default.
    pub fn set_time_listener(&self, listener: Option<Rc<dyn TimeListener>>) {
        let mut inner = self.shared.borrow_mut();
        let listener =
            listener.unwrap_or_else(|| Rc::new(LogTimeListener::new(inner.name.clone())));
        inner.time_listener = listener;
    }

    pub fn set_trace_listener(&self, listener: Option<Rc<dyn TraceListener>>) {
        self.shared.borrow_mut().trace_listener = listener;
    }

    // ---- clock and units ----

    pub fn current_tick(&self) -> Tick {
        self.shared.borrow().current_tick
    }

    pub fn seconds(&self) -> f64 {
        let inner = self.shared.borrow();
        inner.ticks_to_seconds(inner.current_tick)
    }

    /// Tick of the earliest pending event.
    pub fn next_event_tick(&self) -> Option<Tick> {
        self.shared.borrow().tree.first_key().map(|(tick, _)| tick)
    }

    pub fn has_pending_event(&self) -> bool {
        !self.shared.borrow().tree.is_empty()
    }

    pub fn ticks_to_seconds(&self, ticks: Tick) -> f64 {
        self.shared.borrow().ticks_to_seconds(ticks)
    }

    /// Nearest tick to a duration in seconds.
    pub fn seconds_to_ticks(&self, seconds: f64) -> Tick {
        self.shared.borrow().seconds_to_ticks(seconds)
    }

    pub fn tick_length(&self) -> f64 {
        self.shared.borrow().secs_per_tick
    }

    pub fn set_tick_length(&self, length: f64) -> KernelResult<()> {
        self.shared.borrow_mut().set_tick_length(length)
    }

    /// Turn wall-clock pacing on or off. A non-positive factor falls back to 1.0.
    pub fn set_execute_real_time(&self, enabled: bool, factor: f64) {
        let mut inner = self.shared.borrow_mut();
        let factor = sanitize_factor(factor);
        if enabled == inner.real_time && factor == inner.real_time_factor {
            return;
        }
        inner.real_time = enabled;
        inner.real_time_factor = factor;
        if enabled {
            inner.rebase_real_time = true;
        }
        log::debug!(
            "[{}] real time {} (factor {})",
            inner.name,
            if enabled { "on" } else { "off" },
            factor
        );
    }

    pub fn is_real_time(&self) -> bool {
        self.shared.borrow().real_time
    }

    // ---- introspection ----

    pub fn run_state(&self) -> RunState {
        let inner = self.shared.borrow();
        if inner.process_running {
            RunState::Running
        } else if inner.tree.is_empty() && inner.conditionals.is_empty() {
            RunState::Idle
        } else {
            RunState::Paused
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.borrow().process_running
    }

    /// True unless a listener or condition callback is executing.
    pub fn can_schedule(&self) -> bool {
        !self.shared.borrow().disable_schedule
    }

    /// Pending events in dispatch order.
    pub fn event_data_list(&self) -> Vec<EventData> {
        let inner = self.shared.borrow();
        inner
            .tree
            .iter()
            .into_iter()
            .map(|(ticks, priority, event)| EventData {
                ticks,
                priority,
                description: event.work.description(),
            })
            .collect()
    }

    /// Descriptions of pending conditional events, in registration order.
    pub fn conditional_data_list(&self) -> Vec<String> {
        let inner = self.shared.borrow();
        inner
            .conditionals
            .iter()
            .map(|c| c.work.description())
            .collect()
    }

    pub fn event_count(&self) -> usize {
        self.shared.borrow().tree.event_count()
    }

    /// Distinct `(tick, priority)` keys pending.
    pub fn node_count(&self) -> usize {
        self.shared.borrow().tree.node_count()
    }

    pub fn conditional_count(&self) -> usize {
        self.shared.borrow().conditionals.len()
    }

    /// Contexts ever created.
    pub fn pool_size(&self) -> usize {
        self.shared.borrow().pool.size()
    }

    /// Contexts parked in the pool ready for reuse.
    pub fn idle_contexts(&self) -> usize {
        self.shared.borrow().pool.idle_count()
    }

    /// Check the event tree's structural invariants; returns its node count.
    pub fn verify_queue(&self) -> Result<usize, String> {
        self.shared.borrow().tree.verify()
    }

    /// Take the failure that last halted the run.
    pub fn take_failure(&self) -> Option<anyhow::Error> {
        self.shared.borrow_mut().last_failure.take()
    }

    // ---- external scheduling ----

    /// Schedule a target from outside any context.
    pub fn schedule_external(
        &self,
        delay: Tick,
        priority: Priority,
        fifo: bool,
        target: Rc<dyn ProcessTarget>,
        handle: Option<&EventHandle>,
    ) -> KernelResult<()> {
        let description = target.description();
        let tick = {
            let mut inner = self.shared.borrow_mut();
            inner.assert_can_schedule()?;
            let tick = inner.event_time(delay)?;
            SchedulerInner::check_handle(handle)?;
            inner.insert_timed(tick, priority, fifo, Work::Run(target), handle);
            // An insert ahead of the evaluated horizon must not be skipped
            // by a pacing advance.
            if let Some((first, _)) = inner.tree.first_key() {
                if inner.next_tick > first {
                    inner.next_tick = first;
                }
            }
            tick
        };
        log::trace!("external schedule '{}' at {}", description, tick);
        trace(&self.shared, |l| {
            l.trace_schedule_external(tick, priority, &description)
        });
        Ok(())
    }

    /// [`schedule_external`](Self::schedule_external) followed by [`pause`](Self::pause).
    pub fn schedule_external_and_pause(
        &self,
        delay: Tick,
        priority: Priority,
        fifo: bool,
        target: Rc<dyn ProcessTarget>,
        handle: Option<&EventHandle>,
    ) -> KernelResult<()> {
        self.schedule_external(delay, priority, fifo, target, handle)?;
        self.pause();
        Ok(())
    }

    // ---- run control ----

    /// Run until the clock reaches `target_tick`. Events at the target tick
    /// execute before the loop pauses. A target already behind the clock
    /// runs without bound. No-op while already running, apart from moving
    /// the target.
    pub fn resume(&self, target_tick: Tick) {
        {
            let mut inner = self.shared.borrow_mut();
            inner.target_tick = if inner.current_tick <= target_tick {
                target_tick
            } else {
                Tick::MAX
            };
            inner.rebase_real_time = true;
            if inner.execute_events {
                return;
            }
            inner.execute_events = true;
        }
        self.execute();
    }

    pub fn resume_seconds(&self, seconds: f64) {
        let tick = self.seconds_to_ticks(seconds);
        self.resume(tick);
    }

    /// Stop at the loop's next safe point.
    pub fn pause(&self) {
        self.shared.borrow_mut().pause();
    }

    /// Execute a single event, then pause.
    pub fn step_event(&self, target_tick: Tick) {
        self.shared.borrow_mut().one_event = true;
        self.resume(target_tick);
    }

    /// Execute what remains at the current tick, advance to the next event
    /// time, then pause.
    pub fn step_time(&self, target_tick: Tick) {
        self.shared.borrow_mut().one_sim_time = true;
        self.resume(target_tick);
    }

    /// Kill every pending occurrence and reset the clock to zero.
    pub fn clear(&self) -> KernelResult<()> {
        let (killed, futures, conditions) = {
            let mut guard = self.shared.borrow_mut();
            let inner = &mut *guard;
            if inner.process_running {
                return Err(KernelError::SchedulerBusy);
            }
            inner.current_tick = 0;
            inner.next_tick = 0;
            inner.target_tick = Tick::MAX;
            inner.rebase_real_time = true;
            inner.one_event = false;
            inner.one_sim_time = false;

            let mut works: Vec<(Work, Option<EventHandle>)> = inner
                .tree
                .drain()
                .into_iter()
                .map(|(_, _, e)| (e.work, e.handle))
                .collect();
            let mut conditions = Vec::new();
            for c in inner.conditionals.drain(..) {
                conditions.push(c.condition);
                works.push((c.work, c.handle));
            }

            let mut killed = Vec::new();
            let mut futures = Vec::new();
            for (work, handle) in works {
                if let Some(handle) = handle {
                    handle.detach();
                }
                match work {
                    Work::Run(target) => killed.push(target),
                    Work::Resume(id) => {
                        inner.pool.get_mut(id).wait = None;
                        futures.extend(inner.pool.release(id));
                    }
                }
            }
            log::debug!(
                "[{}] cleared {} targets and {} parked contexts",
                inner.name,
                killed.len(),
                futures.len()
            );
            (killed, futures, conditions)
        };
        drop(futures);
        drop(conditions);
        for target in killed {
            target.kill();
        }
        Ok(())
    }

    // ---- dispatch loop ----

    fn time_listener(&self) -> Rc<dyn TimeListener> {
        self.shared.borrow().time_listener.clone()
    }

    fn execute(&self) {
        {
            let mut inner = self.shared.borrow_mut();
            if inner.process_running {
                return;
            }
            inner.process_running = true;
            inner.disable_schedule = false;
            log::debug!("[{}] dispatch loop started at {}", inner.name, inner.current_tick);
        }
        let listener = self.time_listener();
        notify(&self.shared, || listener.time_running(true));

        loop {
            let stray = self.shared.borrow_mut().take_stray_wake();
            if let Some(id) = stray {
                self.fail(KernelError::ExternalWake { id: id.index() }.into());
                continue;
            }

            let action = self.shared.borrow_mut().next_action();
            match action {
                Err(e) => self.fail(e.into()),
                Ok(Action::Stop) => break,
                Ok(Action::Dispatch {
                    tick,
                    priority,
                    event,
                }) => self.dispatch(tick, priority, event.work),
                Ok(Action::Evaluate) => self.evaluate_conditions(),
                Ok(Action::Pace { tick, sleep }) => {
                    let (listener, sleeper) = {
                        let inner = self.shared.borrow();
                        (inner.time_listener.clone(), inner.sleeper)
                    };
                    notify(&self.shared, || listener.tick_update(tick));
                    sleeper.sleep(sleep);
                }
                Ok(Action::Advance { tick }) => {
                    let (listener, seconds) = {
                        let inner = self.shared.borrow();
                        (inner.time_listener.clone(), inner.ticks_to_seconds(tick))
                    };
                    log::debug!("time: {} - [time advance]", seconds);
                    notify(&self.shared, || listener.tick_update(tick));
                }
            }
        }

        {
            let mut inner = self.shared.borrow_mut();
            inner.process_running = false;
            log::debug!("[{}] dispatch loop stopped at {}", inner.name, inner.current_tick);
        }
        let listener = self.time_listener();
        notify(&self.shared, || listener.time_running(false));
    }

    fn dispatch(&self, tick: Tick, priority: Priority, work: Work) {
        let description = work.description();
        log::trace!("dispatch ({}, {}) '{}'", tick, priority, description);
        trace(&self.shared, |l| l.trace_event(tick, priority, &description));

        let step = match work {
            Work::Run(target) => executor::start(&self.shared, target, None),
            Work::Resume(id) => executor::resume(&self.shared, id, None),
        };

        {
            let mut inner = self.shared.borrow_mut();
            if inner.one_event {
                inner.one_event = false;
                inner.execute_events = false;
            }
        }
        if step == Step::Failed {
            self.halt();
        }
    }

    fn evaluate_conditions(&self) {
        let mut pending = {
            let mut inner = self.shared.borrow_mut();
            inner.conditions_evaluated = true;
            std::mem::take(&mut inner.conditionals)
        };
        let trace_listener = self.shared.borrow().trace_listener.clone();

        let mut fired = Vec::new();
        let mut failure = None;
        notify(&self.shared, || {
            let mut i = 0;
            while i < pending.len() {
                let description = pending[i].work.description();
                if let Some(l) = &trace_listener {
                    l.trace_conditional_eval(&description);
                }
                let cond = &mut pending[i].condition;
                match panic::catch_unwind(AssertUnwindSafe(|| cond.evaluate())) {
                    Ok(result) => {
                        if let Some(l) = &trace_listener {
                            l.trace_conditional_eval_ended(result, &description);
                        }
                        if result {
                            fired.push(pending.remove(i));
                            continue;
                        }
                        i += 1;
                    }
                    Err(payload) => {
                        failure = Some(anyhow::anyhow!(
                            "condition for '{}' panicked: {}",
                            description,
                            panic_message(payload.as_ref())
                        ));
                        break;
                    }
                }
            }
        });

        let mut spent = Vec::with_capacity(fired.len());
        {
            let mut guard = self.shared.borrow_mut();
            let inner = &mut *guard;
            let tick = inner.current_tick;
            for cond in fired {
                spent.push(cond.condition);
                let event = Event {
                    work: cond.work,
                    handle: cond.handle,
                };
                let id = inner.tree.schedule(tick, 0, event, true);
                let occurrence = Occurrence::Timed(id);
                if let Some(event) = inner.tree.payload(id) {
                    if let Some(handle) = &event.handle {
                        handle.attach(occurrence);
                    }
                    if let Work::Resume(ctx) = event.work {
                        inner.pool.get_mut(ctx).wait = Some(occurrence);
                    }
                }
            }
            pending.append(&mut inner.conditionals);
            inner.conditionals = pending;
        }
        drop(spent);

        if let Some(e) = failure {
            self.fail(e);
        }
    }

    /// Record a failure raised outside any context and halt.
    fn fail(&self, error: anyhow::Error) {
        {
            let mut inner = self.shared.borrow_mut();
            if inner.failure.is_none() {
                inner.failure = Some(error);
            }
        }
        self.halt();
    }

    /// Stop dispatching and deliver the pending failure.
    fn halt(&self) {
        let (failure, listener) = {
            let mut inner = self.shared.borrow_mut();
            inner.execute_events = false;
            (inner.failure.take(), inner.time_listener.clone())
        };
        let Some(failure) = failure else {
            return;
        };
        log::error!("run halted: {:#}", failure);
        notify(&self.shared, || listener.handle_error(&failure));
        self.shared.borrow_mut().last_failure = Some(failure);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Ctx;
    use crate::target::target_fn;
    use std::cell::Cell;

    fn noop(name: &str) -> Rc<dyn ProcessTarget> {
        target_fn(name.to_string(), |_ctx| async { Ok(()) })
    }

    #[test]
    fn test_default_tick_conversion() {
        let sched = Scheduler::default();
        assert_eq!(sched.seconds_to_ticks(1.0), 1_000_000);
        assert_eq!(sched.seconds_to_ticks(2.5e-6), 3);
        assert!((sched.ticks_to_seconds(500_000) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_set_tick_length() {
        let sched = Scheduler::default();
        sched.set_tick_length(1e-3).unwrap();
        assert_eq!(sched.seconds_to_ticks(1.0), 1000);
        assert_eq!(
            sched.set_tick_length(0.0),
            Err(KernelError::InvalidTickLength { length: 0.0 })
        );
        assert_eq!(sched.tick_length(), 1e-3);
    }

    #[test]
    fn test_negative_delay_rejected() {
        let sched = Scheduler::default();
        let err = sched
            .schedule_external(-1, 0, true, noop("neg"), None)
            .unwrap_err();
        assert_eq!(err, KernelError::NegativeDelay { delay: -1 });
        assert!(!sched.has_pending_event());
    }

    #[test]
    fn test_delay_saturates() {
        let sched = Scheduler::default();
        sched.schedule_external(5, 0, true, noop("a"), None).unwrap();
        sched.resume(5);
        sched
            .schedule_external(Tick::MAX, 0, true, noop("far"), None)
            .unwrap();
        assert_eq!(sched.next_event_tick(), Some(Tick::MAX));
    }

    #[test]
    fn test_handle_in_use_rejected() {
        let sched = Scheduler::default();
        let handle = EventHandle::new();
        sched
            .schedule_external(3, 0, true, noop("a"), Some(&handle))
            .unwrap();
        assert!(handle.is_scheduled());
        let err = sched
            .schedule_external(4, 0, true, noop("b"), Some(&handle))
            .unwrap_err();
        assert_eq!(err, KernelError::HandleInUse);
        assert_eq!(sched.event_count(), 1);
    }

    #[test]
    fn test_handle_released_when_fired() {
        let sched = Scheduler::default();
        let handle = EventHandle::new();
        sched
            .schedule_external(3, 0, true, noop("a"), Some(&handle))
            .unwrap();
        sched.resume(10);
        assert!(!handle.is_scheduled());
        // The loop stops as soon as the queue drains.
        assert_eq!(sched.current_tick(), 3);
    }

    #[test]
    fn test_run_state_transitions() {
        let sched = Scheduler::default();
        assert_eq!(sched.run_state(), RunState::Idle);
        sched.schedule_external(5, 0, true, noop("a"), None).unwrap();
        sched.schedule_external(20, 0, true, noop("b"), None).unwrap();
        assert_eq!(sched.run_state(), RunState::Paused);

        let seen = Rc::new(Cell::new(None));
        let s = sched.clone();
        let observed = seen.clone();
        sched
            .schedule_external(
                1,
                0,
                true,
                target_fn("observer", move |_ctx| {
                    let s = s.clone();
                    let observed = observed.clone();
                    async move {
                        observed.set(Some(s.run_state()));
                        Ok(())
                    }
                }),
                None,
            )
            .unwrap();
        sched.resume(10);
        assert_eq!(seen.get(), Some(RunState::Running));
        assert_eq!(sched.current_tick(), 10);
        assert_eq!(sched.run_state(), RunState::Paused);
        sched.resume(100);
        assert_eq!(sched.run_state(), RunState::Idle);
    }

    #[test]
    fn test_event_data_list_in_dispatch_order() {
        let sched = Scheduler::default();
        sched.schedule_external(7, 1, true, noop("late"), None).unwrap();
        sched.schedule_external(2, 0, true, noop("early"), None).unwrap();
        sched.schedule_external(7, 0, true, noop("mid"), None).unwrap();
        let list = sched.event_data_list();
        let names: Vec<&str> = list.iter().map(|d| d.description.as_str()).collect();
        assert_eq!(names, vec!["early", "mid", "late"]);
        assert_eq!(list[2].ticks, 7);
        assert_eq!(list[2].priority, 1);
    }

    #[test]
    fn test_clear_kills_pending_targets() {
        struct Counted(Rc<Cell<u32>>);
        impl ProcessTarget for Counted {
            fn description(&self) -> String {
                "counted".into()
            }
            fn process(&self, _ctx: Ctx) -> TargetFuture {
                Box::pin(async { Ok(()) })
            }
            fn kill(&self) {
                self.0.set(self.0.get() + 1);
            }
        }

        let sched = Scheduler::default();
        let kills = Rc::new(Cell::new(0));
        let handle = EventHandle::new();
        sched
            .schedule_external(4, 0, true, Rc::new(Counted(kills.clone())), Some(&handle))
            .unwrap();
        sched
            .schedule_external(9, 0, true, Rc::new(Counted(kills.clone())), None)
            .unwrap();
        sched.resume(2);
        assert_eq!(sched.current_tick(), 2);

        sched.clear().unwrap();
        assert_eq!(kills.get(), 2);
        assert!(!handle.is_scheduled());
        assert_eq!(sched.current_tick(), 0);
        assert_eq!(sched.run_state(), RunState::Idle);
        assert_eq!(sched.verify_queue(), Ok(0));
    }

    #[test]
    fn test_unused_step_does_not_leak_into_resume() {
        let sched = Scheduler::default();
        let ran = Rc::new(Cell::new(0));
        sched.step_event(10);
        sched.step_time(10);
        for t in 1..=3 {
            let r = ran.clone();
            sched
                .schedule_external(
                    t,
                    0,
                    true,
                    target_fn("count", move |_ctx| {
                        let r = r.clone();
                        async move {
                            r.set(r.get() + 1);
                            Ok(())
                        }
                    }),
                    None,
                )
                .unwrap();
        }
        sched.resume(100);
        assert_eq!(ran.get(), 3);
        assert_eq!(sched.current_tick(), 3);
    }

    #[test]
    fn test_set_execute_real_time() {
        let sched = Scheduler::default();
        assert!(!sched.is_real_time());
        sched.set_execute_real_time(true, -2.0);
        assert!(sched.is_real_time());
        sched.set_execute_real_time(false, 1.0);
        assert!(!sched.is_real_time());
    }

    #[test]
    fn test_resume_behind_clock_runs_unbounded() {
        let sched = Scheduler::default();
        sched.schedule_external(10, 0, true, noop("a"), None).unwrap();
        sched.resume(10);
        sched.schedule_external(50, 0, true, noop("b"), None).unwrap();
        sched.resume(3);
        assert_eq!(sched.current_tick(), 60);
        assert!(!sched.has_pending_event());
    }
}
