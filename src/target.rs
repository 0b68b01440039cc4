//! Process targets
//!
//! A target is the unit of work attached to an event. Its body is an
//! `async` block that receives the context it runs in.

use crate::context::Ctx;
use crate::error::TargetResult;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

/// The future a target body produces.
pub type TargetFuture = Pin<Box<dyn Future<Output = TargetResult>>>;

/// An executable unit of work.
pub trait ProcessTarget {
    /// Human-readable label used by traces and event snapshots.
    fn description(&self) -> String;

    /// Build the body to run in `ctx`.
    fn process(&self, ctx: Ctx) -> TargetFuture;

    /// Called instead of `process` when the pending event is killed.
    fn kill(&self) {}
}

/// Adapter turning a closure into a [`ProcessTarget`].
pub struct FnTarget<F> {
    description: String,
    body: F,
}

impl<F, Fut> ProcessTarget for FnTarget<F>
where
    F: Fn(Ctx) -> Fut,
    Fut: Future<Output = TargetResult> + 'static,
{
    fn description(&self) -> String {
        self.description.clone()
    }

    fn process(&self, ctx: Ctx) -> TargetFuture {
        Box::pin((self.body)(ctx))
    }
}

/// Wrap a closure as a shareable target.
///
/// ```ignore
/// let t = target_fn("arrival", |ctx| async move {
///     ctx.wait_ticks(5, 0, true, None).await?;
///     Ok(())
/// });
/// ```
pub fn target_fn<F, Fut>(description: impl Into<String>, body: F) -> Rc<dyn ProcessTarget>
where
    F: Fn(Ctx) -> Fut + 'static,
    Fut: Future<Output = TargetResult> + 'static,
{
    Rc::new(FnTarget {
        description: description.into(),
        body,
    })
}
