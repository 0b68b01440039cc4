//! Execution context API
//!
//! A [`Ctx`] is handed to every target body. It is the only way to schedule
//! or suspend from inside the simulation; each call checks that its context
//! is the one currently executing and that scheduling is enabled.

use crate::error::{KernelError, KernelResult};
use crate::event::{Conditional, EventHandle, Work};
use crate::executor::{self, Step};
use crate::process::ContextId;
use crate::scheduler::{trace, Removed, Scheduler, SchedulerInner, Shared};
use crate::target::ProcessTarget;
use crate::tree::{Priority, Tick};
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

/// Handle to the execution context a target body runs in.
#[derive(Clone)]
pub struct Ctx {
    shared: Weak<RefCell<SchedulerInner>>,
    id: ContextId,
}

impl fmt::Debug for Ctx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ctx").field("id", &self.id).finish()
    }
}

impl Ctx {
    pub(crate) fn new(shared: Weak<RefCell<SchedulerInner>>, id: ContextId) -> Self {
        Self { shared, id }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    fn shared(&self) -> KernelResult<Shared> {
        self.shared.upgrade().ok_or(KernelError::SchedulerGone)
    }

    fn check(&self, inner: &SchedulerInner) -> KernelResult<()> {
        if inner.current != Some(self.id) {
            return Err(KernelError::NotCurrentContext {
                id: self.id.index(),
            });
        }
        inner.assert_can_schedule()
    }

    /// The scheduler this context belongs to.
    pub fn scheduler(&self) -> KernelResult<Scheduler> {
        self.shared().map(Scheduler::from_shared)
    }

    /// Current simulation tick.
    pub fn tick(&self) -> KernelResult<Tick> {
        Ok(self.shared()?.borrow().current_tick)
    }

    /// Current simulation time in seconds.
    pub fn seconds(&self) -> KernelResult<f64> {
        let shared = self.shared()?;
        let inner = shared.borrow();
        Ok(inner.ticks_to_seconds(inner.current_tick))
    }

    /// True if this context is executing and scheduling is enabled.
    pub fn can_schedule(&self) -> bool {
        let Ok(shared) = self.shared() else {
            return false;
        };
        let inner = shared.borrow();
        self.check(&inner).is_ok()
    }

    /// Insert `target` at `now + delay` without suspending.
    pub fn schedule_ticks(
        &self,
        delay: Tick,
        priority: Priority,
        fifo: bool,
        target: Rc<dyn ProcessTarget>,
        handle: Option<&EventHandle>,
    ) -> KernelResult<()> {
        let shared = self.shared()?;
        let description = target.description();
        let tick = {
            let mut inner = shared.borrow_mut();
            self.check(&inner)?;
            let tick = inner.event_time(delay)?;
            SchedulerInner::check_handle(handle)?;
            inner.insert_timed(tick, priority, fifo, Work::Run(target), handle);
            tick
        };
        trace(&shared, |l| l.trace_schedule(tick, priority, &description));
        Ok(())
    }

    pub fn schedule_seconds(
        &self,
        seconds: f64,
        priority: Priority,
        fifo: bool,
        target: Rc<dyn ProcessTarget>,
        handle: Option<&EventHandle>,
    ) -> KernelResult<()> {
        let delay = self.shared()?.borrow().seconds_to_ticks(seconds);
        self.schedule_ticks(delay, priority, fifo, target, handle)
    }

    /// Suspend until `now + delay`.
    pub fn wait_ticks(
        &self,
        delay: Tick,
        priority: Priority,
        fifo: bool,
        handle: Option<&EventHandle>,
    ) -> WaitFuture {
        WaitFuture::new(
            self.clone(),
            WaitRequest::Ticks {
                delay,
                priority,
                fifo,
            },
            handle,
        )
    }

    pub fn wait_seconds(
        &self,
        seconds: f64,
        priority: Priority,
        fifo: bool,
        handle: Option<&EventHandle>,
    ) -> WaitFuture {
        WaitFuture::new(
            self.clone(),
            WaitRequest::Seconds {
                seconds,
                priority,
                fifo,
            },
            handle,
        )
    }

    /// Suspend until `condition` evaluates true before a time advance.
    pub fn wait_until(
        &self,
        condition: impl Conditional + 'static,
        handle: Option<&EventHandle>,
    ) -> WaitFuture {
        WaitFuture::new(self.clone(), WaitRequest::Until(Box::new(condition)), handle)
    }

    /// Run `target` in a fresh context once `condition` holds. Does not suspend.
    pub fn schedule_until(
        &self,
        target: Rc<dyn ProcessTarget>,
        condition: impl Conditional + 'static,
        handle: Option<&EventHandle>,
    ) -> KernelResult<()> {
        let shared = self.shared()?;
        let description = target.description();
        {
            let mut inner = shared.borrow_mut();
            self.check(&inner)?;
            SchedulerInner::check_handle(handle)?;
            inner.insert_conditional(Box::new(condition), Work::Run(target), handle);
        }
        trace(&shared, |l| l.trace_schedule_until(&description));
        Ok(())
    }

    /// Run `target` in a new context, returning once it finishes or first
    /// suspends.
    pub fn start_process(&self, target: Rc<dyn ProcessTarget>) -> StartFuture {
        StartFuture {
            ctx: self.clone(),
            target: Some(target),
        }
    }

    /// Cancel the occurrence held by `handle` without running it. The
    /// target's kill hook runs instead; a waiting context is dropped.
    /// Does nothing if the handle holds no occurrence.
    pub fn kill_event(&self, handle: &EventHandle) -> KernelResult<()> {
        let shared = self.shared()?;
        let Some(Removed {
            key,
            work,
            condition,
        }) = self.take_occurrence(&shared, handle)?
        else {
            return Ok(());
        };
        drop(condition);
        let description = work.description();
        trace(&shared, |l| l.trace_kill(key, &description));

        match work {
            Work::Run(target) => target.kill(),
            Work::Resume(id) => {
                log::warn!("killing {} while it waits", id);
                let released = shared.borrow_mut().release_context(id);
                drop(released);
            }
        }
        Ok(())
    }

    /// Remove the occurrence held by `handle` and run it now, returning
    /// once it finishes or suspends. Does nothing if the handle holds no
    /// occurrence.
    pub fn interrupt_event(&self, handle: &EventHandle) -> InterruptFuture {
        InterruptFuture {
            ctx: self.clone(),
            handle: Some(handle.clone()),
        }
    }

    /// Stop the dispatch loop at its next safe point.
    pub fn pause(&self) -> KernelResult<()> {
        self.shared()?.borrow_mut().pause();
        Ok(())
    }

    fn take_occurrence(
        &self,
        shared: &Shared,
        handle: &EventHandle,
    ) -> KernelResult<Option<Removed>> {
        let mut inner = shared.borrow_mut();
        self.check(&inner)?;
        let Some(occurrence) = handle.occurrence() else {
            return Ok(None);
        };
        let waiting = inner
            .waiter(occurrence)
            .filter(|id| inner.pool.get(*id).active);
        if let Some(id) = waiting {
            return Err(KernelError::ContextActive { id: id.index() });
        }
        inner.remove_occurrence(occurrence)
    }
}

enum WaitRequest {
    Ticks {
        delay: Tick,
        priority: Priority,
        fifo: bool,
    },
    Seconds {
        seconds: f64,
        priority: Priority,
        fifo: bool,
    },
    Until(Box<dyn Conditional>),
}

/// Parks the context on first poll; completes when the kernel resumes it.
#[must_use = "waits do nothing unless awaited"]
pub struct WaitFuture {
    ctx: Ctx,
    request: Option<WaitRequest>,
    handle: Option<EventHandle>,
    registered: bool,
}

impl WaitFuture {
    fn new(ctx: Ctx, request: WaitRequest, handle: Option<&EventHandle>) -> Self {
        Self {
            ctx,
            request: Some(request),
            handle: handle.cloned(),
            registered: false,
        }
    }

    fn register(&mut self, request: WaitRequest) -> KernelResult<()> {
        let shared = self.ctx.shared()?;
        let id = self.ctx.id;
        let timed = {
            let mut inner = shared.borrow_mut();
            self.ctx.check(&inner)?;
            if inner.pool.get(id).wait.is_some() {
                return Err(KernelError::AlreadySuspended { id: id.index() });
            }
            let handle = self.handle.as_ref();
            SchedulerInner::check_handle(handle)?;
            let (occurrence, timed) = match request {
                WaitRequest::Ticks {
                    delay,
                    priority,
                    fifo,
                } => {
                    let tick = inner.event_time(delay)?;
                    let occ = inner.insert_timed(tick, priority, fifo, Work::Resume(id), handle);
                    (occ, Some((tick, priority)))
                }
                WaitRequest::Seconds {
                    seconds,
                    priority,
                    fifo,
                } => {
                    let tick = inner.event_time(inner.seconds_to_ticks(seconds))?;
                    let occ = inner.insert_timed(tick, priority, fifo, Work::Resume(id), handle);
                    (occ, Some((tick, priority)))
                }
                WaitRequest::Until(condition) => {
                    let occ = inner.insert_conditional(condition, Work::Resume(id), handle);
                    (occ, None)
                }
            };
            inner.pool.get_mut(id).wait = Some(occurrence);
            timed
        };
        match timed {
            Some((tick, priority)) => trace(&shared, |l| l.trace_wait(tick, priority, "Waiting")),
            None => trace(&shared, |l| l.trace_wait_until()),
        }
        Ok(())
    }
}

impl Future for WaitFuture {
    type Output = KernelResult<()>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        // Only the kernel polls a parked context, and only to resume it.
        if this.registered {
            return Poll::Ready(Ok(()));
        }
        let Some(request) = this.request.take() else {
            return Poll::Ready(Ok(()));
        };
        match this.register(request) {
            Ok(()) => {
                this.registered = true;
                Poll::Pending
            }
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

/// Runs a sub-target inline; see [`Ctx::start_process`].
#[must_use = "sub-processes do nothing unless awaited"]
pub struct StartFuture {
    ctx: Ctx,
    target: Option<Rc<dyn ProcessTarget>>,
}

impl Future for StartFuture {
    type Output = KernelResult<()>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        // A second poll only happens while this context is being torn down.
        let Some(target) = this.target.take() else {
            return Poll::Pending;
        };
        let shared = match this.ctx.shared() {
            Ok(shared) => shared,
            Err(e) => return Poll::Ready(Err(e)),
        };
        if let Err(e) = this.ctx.check(&shared.borrow()) {
            return Poll::Ready(Err(e));
        }
        let description = target.description();
        trace(&shared, |l| l.trace_process_start(&description));

        match executor::start(&shared, target, Some(this.ctx.id)) {
            Step::Failed => Poll::Pending,
            Step::Finished | Step::Suspended => Poll::Ready(Ok(())),
        }
    }
}

/// Forces a pending occurrence to run now; see [`Ctx::interrupt_event`].
#[must_use = "interrupts do nothing unless awaited"]
pub struct InterruptFuture {
    ctx: Ctx,
    handle: Option<EventHandle>,
}

impl Future for InterruptFuture {
    type Output = KernelResult<()>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(handle) = this.handle.take() else {
            return Poll::Pending;
        };
        let shared = match this.ctx.shared() {
            Ok(shared) => shared,
            Err(e) => return Poll::Ready(Err(e)),
        };
        let Removed {
            key,
            work,
            condition,
        } = match this.ctx.take_occurrence(&shared, &handle) {
            Ok(Some(found)) => found,
            Ok(None) => return Poll::Ready(Ok(())),
            Err(e) => return Poll::Ready(Err(e)),
        };
        drop(condition);
        let description = work.description();
        trace(&shared, |l| l.trace_interrupt(key, &description));

        let caller = Some(this.ctx.id);
        let step = match work {
            Work::Run(target) => executor::start(&shared, target, caller),
            Work::Resume(id) => executor::resume(&shared, id, caller),
        };
        match step {
            Step::Failed => Poll::Pending,
            Step::Finished | Step::Suspended => Poll::Ready(Ok(())),
        }
    }
}
