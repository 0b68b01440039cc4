//! Context driver
//!
//! The kernel is the only poller of target bodies. Waking a context means
//! polling its body once; the body parks by returning `Pending` after
//! registering a kernel suspension. Calls nest: a body that starts another
//! target polls the callee inline, with the callee's `next` link pointing
//! back at the caller.
//!
//! Bodies are polled with a guard waker. The kernel never wakes through it,
//! so a wake-up it receives came from outside. Waking a parked context is a
//! fault; a waker that outlived its body is stale and ignored.

use crate::context::Ctx;
use crate::error::KernelError;
use crate::process::ContextId;
use crate::scheduler::{panic_message, trace, Shared};
use crate::target::ProcessTarget;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll, Wake, Waker};

/// How a poll of a context ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Step {
    /// The body ran to completion.
    Finished,
    /// The body parked on a kernel suspension.
    Suspended,
    /// The body failed, or was torn down because a callee failed.
    Failed,
}

struct ContextWaker {
    id: usize,
    /// Allocation the waker was handed to; the slot may be reused since.
    generation: u64,
    stray: Arc<Mutex<Vec<(usize, u64)>>>,
}

impl Wake for ContextWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        log::debug!("ctx#{} woken from outside the kernel", self.id);
        self.stray
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((self.id, self.generation));
    }
}

/// Run `target` in a fresh context. `next` is the caller to return to.
pub(crate) fn start(shared: &Shared, target: Rc<dyn ProcessTarget>, next: Option<ContextId>) -> Step {
    let description = target.description();
    let id = shared.borrow_mut().pool.allocate(description.clone(), next);
    log::trace!("{} starts '{}'", id, description);

    let ctx = Ctx::new(Rc::downgrade(shared), id);
    match panic::catch_unwind(AssertUnwindSafe(|| target.process(ctx))) {
        Ok(future) => {
            shared.borrow_mut().pool.get_mut(id).future = Some(future);
            drive(shared, id)
        }
        Err(payload) => fail(
            shared,
            id,
            anyhow::anyhow!("building '{}' panicked: {}", description, panic_message(payload.as_ref())),
        ),
    }
}

/// Wake a parked context. `next` is the caller to return to.
pub(crate) fn resume(shared: &Shared, id: ContextId, next: Option<ContextId>) -> Step {
    shared.borrow_mut().pool.get_mut(id).next = next;
    drive(shared, id)
}

fn drive(shared: &Shared, id: ContextId) -> Step {
    let (future, previous, waker) = {
        let mut guard = shared.borrow_mut();
        let inner = &mut *guard;
        let slot = inner.pool.get_mut(id);
        let waker = Waker::from(Arc::new(ContextWaker {
            id: id.index(),
            generation: slot.generation,
            stray: inner.stray_wakes.clone(),
        }));
        let Some(future) = slot.future.take() else {
            log::error!("{} has no body to poll", id);
            let released = inner.release_context(id);
            drop(guard);
            drop(released);
            return Step::Finished;
        };
        slot.active = true;
        slot.wait = None;
        let previous = inner.current.replace(id);
        (future, previous, waker)
    };

    let mut future = future;
    let mut cx = Context::from_waker(&waker);
    let polled = panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)));

    let (killed, parked, description) = {
        let mut guard = shared.borrow_mut();
        let inner = &mut *guard;
        inner.current = previous;
        let slot = inner.pool.get_mut(id);
        slot.active = false;
        (slot.killed, slot.wait.is_some(), slot.description.clone())
    };

    if killed {
        log::trace!("{} unwinds after a callee failed", id);
        let released = shared.borrow_mut().release_context(id);
        drop(future);
        drop(released);
        return Step::Failed;
    }

    match polled {
        Ok(Poll::Ready(Ok(()))) => {
            log::trace!("{} finished '{}'", id, description);
            let released = shared.borrow_mut().release_context(id);
            drop(future);
            drop(released);
            trace(shared, |l| l.trace_process_end());
            Step::Finished
        }
        Ok(Poll::Ready(Err(e))) => {
            drop(future);
            fail(shared, id, e.context(format!("target '{}' failed", description)))
        }
        Ok(Poll::Pending) if parked => {
            let mut inner = shared.borrow_mut();
            let slot = inner.pool.get_mut(id);
            slot.future = Some(future);
            slot.next = None;
            Step::Suspended
        }
        Ok(Poll::Pending) => {
            drop(future);
            fail(shared, id, KernelError::ForeignSuspend { id: id.index() }.into())
        }
        Err(payload) => {
            drop(future);
            fail(
                shared,
                id,
                anyhow::anyhow!("target '{}' panicked: {}", description, panic_message(payload.as_ref())),
            )
        }
    }
}

/// Record the failure, mark every waiting caller killed and free the context.
fn fail(shared: &Shared, id: ContextId, error: anyhow::Error) -> Step {
    let released = {
        let mut inner = shared.borrow_mut();
        log::error!("{} failed: {:#}", id, error);
        if inner.failure.is_none() {
            inner.failure = Some(error);
        }
        let callers = inner.pool.kill_chain(id);
        if callers > 0 {
            log::debug!("{} tears down {} waiting contexts", id, callers);
        }
        inner.release_context(id)
    };
    drop(released);
    Step::Failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use crate::target::target_fn;
    use std::cell::Cell;

    #[test]
    fn test_stray_wake_is_reported() {
        let sched = Scheduler::default();
        let stash: Rc<Cell<Option<Waker>>> = Rc::new(Cell::new(None));
        let s = stash.clone();
        sched
            .schedule_external(
                0,
                0,
                true,
                target_fn("stasher", move |ctx| {
                    let s = s.clone();
                    async move {
                        std::future::poll_fn(|cx| {
                            s.set(Some(cx.waker().clone()));
                            Poll::Ready(())
                        })
                        .await;
                        ctx.wait_ticks(10, 0, true, None).await?;
                        Ok(())
                    }
                }),
                None,
            )
            .unwrap();
        sched.resume(5);
        assert_eq!(sched.current_tick(), 5);

        if let Some(waker) = stash.take() {
            waker.wake();
        }
        sched.resume(20);
        let failure = sched.take_failure().expect("stray wake reported");
        assert_eq!(
            failure.downcast_ref::<KernelError>(),
            Some(&KernelError::ExternalWake { id: 0 })
        );
    }

    /// Target that keeps a clone of its waker and finishes.
    fn stash_waker(stash: &Rc<Cell<Option<Waker>>>) -> Rc<dyn ProcessTarget> {
        let stash = stash.clone();
        target_fn("stash", move |_ctx| {
            let stash = stash.clone();
            async move {
                std::future::poll_fn(|cx| {
                    stash.set(Some(cx.waker().clone()));
                    Poll::Ready(())
                })
                .await;
                Ok(())
            }
        })
    }

    #[test]
    fn test_wake_after_finish_is_ignored() {
        let sched = Scheduler::default();
        let stash: Rc<Cell<Option<Waker>>> = Rc::new(Cell::new(None));
        sched
            .schedule_external(0, 0, true, stash_waker(&stash), None)
            .unwrap();
        sched.resume(5);
        assert_eq!(sched.idle_contexts(), sched.pool_size());

        if let Some(waker) = stash.take() {
            waker.wake();
        }
        let ran = Rc::new(Cell::new(false));
        let r = ran.clone();
        sched
            .schedule_external(
                1,
                0,
                true,
                target_fn("next", move |_ctx| {
                    let r = r.clone();
                    async move {
                        r.set(true);
                        Ok(())
                    }
                }),
                None,
            )
            .unwrap();
        sched.resume(10);

        assert!(ran.get(), "later run was halted by a stale waker");
        assert!(sched.take_failure().is_none());
    }

    #[test]
    fn test_wake_of_reused_slot_is_ignored() {
        let sched = Scheduler::default();
        let stash: Rc<Cell<Option<Waker>>> = Rc::new(Cell::new(None));
        let woke = Rc::new(Cell::new(-1));
        sched
            .schedule_external(0, 0, true, stash_waker(&stash), None)
            .unwrap();
        let w = woke.clone();
        sched
            .schedule_external(
                1,
                0,
                true,
                target_fn("sleeper", move |ctx| {
                    let w = w.clone();
                    async move {
                        ctx.wait_ticks(10, 0, true, None).await?;
                        w.set(ctx.tick()?);
                        Ok(())
                    }
                }),
                None,
            )
            .unwrap();
        sched.resume(5);
        // The sleeper parked in the slot the stasher released.
        assert_eq!(sched.pool_size(), 1);

        if let Some(waker) = stash.take() {
            waker.wake();
        }
        sched.resume(20);

        assert!(sched.take_failure().is_none());
        assert_eq!(woke.get(), 11);
    }

    #[test]
    fn test_foreign_pending_fails_the_run() {
        let sched = Scheduler::default();
        sched
            .schedule_external(
                0,
                0,
                true,
                target_fn("pending", |_ctx| async {
                    std::future::pending::<()>().await;
                    Ok(())
                }),
                None,
            )
            .unwrap();
        sched.resume(10);
        let failure = sched.take_failure().expect("foreign suspend reported");
        assert!(matches!(
            failure.downcast_ref::<KernelError>(),
            Some(KernelError::ForeignSuspend { .. })
        ));
        assert_eq!(sched.idle_contexts(), sched.pool_size());
    }

    #[test]
    fn test_panic_is_a_failure() {
        let sched = Scheduler::default();
        sched
            .schedule_external(
                2,
                0,
                true,
                target_fn("boom", |ctx| async move {
                    if ctx.tick()? >= 0 {
                        panic!("boom");
                    }
                    Ok(())
                }),
                None,
            )
            .unwrap();
        sched
            .schedule_external(3, 0, true, target_fn("after", |_ctx| async { Ok(()) }), None)
            .unwrap();
        sched.resume(10);
        let failure = sched.take_failure().expect("panic reported");
        assert!(format!("{:#}", failure).contains("boom"));
        // Dispatch stopped before the later event.
        assert_eq!(sched.current_tick(), 2);
        assert_eq!(sched.event_count(), 1);
    }
}
