//! Execution context pool
//!
//! An execution context is a slot holding the suspended body of one target.
//! Slots are handed out from an idle list and returned to it when the body
//! finishes or is torn down; the pool only grows.

use crate::event::Occurrence;
use crate::target::TargetFuture;
use std::fmt;

/// Identifies a slot in the context pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(usize);

impl ContextId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

#[derive(Default)]
pub(crate) struct ExecutionContext {
    /// Body of the assigned target; taken out while it is being polled.
    pub future: Option<TargetFuture>,
    pub description: String,
    /// The context to hand control back to when this one finishes or parks.
    pub next: Option<ContextId>,
    /// Assigned to a target and not yet finished.
    pub alive: bool,
    /// Its body is on the poll stack right now.
    pub active: bool,
    /// The pending occurrence that will resume this context, if parked.
    pub wait: Option<Occurrence>,
    /// A callee failed; unwind instead of continuing.
    pub killed: bool,
    /// Bumped on every allocation of this slot.
    pub generation: u64,
}

#[derive(Default)]
pub(crate) struct ContextPool {
    slots: Vec<ExecutionContext>,
    idle: Vec<ContextId>,
}

impl ContextPool {
    /// Take an idle slot (or grow the pool) and assign it.
    pub fn allocate(&mut self, description: String, next: Option<ContextId>) -> ContextId {
        let id = match self.idle.pop() {
            Some(id) => id,
            None => {
                self.slots.push(ExecutionContext::default());
                let id = ContextId(self.slots.len() - 1);
                log::trace!("context pool grew to {}", self.slots.len());
                id
            }
        };
        let slot = &mut self.slots[id.0];
        slot.generation += 1;
        slot.description = description;
        slot.next = next;
        slot.alive = true;
        slot.active = false;
        slot.wait = None;
        slot.killed = false;
        id
    }

    /// Return a slot to the idle list. The body, if any, is handed back so
    /// the caller can drop it outside any scheduler borrow.
    pub fn release(&mut self, id: ContextId) -> Option<TargetFuture> {
        let slot = &mut self.slots[id.0];
        if !slot.alive {
            return None;
        }
        let future = slot.future.take();
        slot.description.clear();
        slot.next = None;
        slot.alive = false;
        slot.active = false;
        slot.wait = None;
        slot.killed = false;
        self.idle.push(id);
        future
    }

    pub fn get(&self, id: ContextId) -> &ExecutionContext {
        &self.slots[id.0]
    }

    pub fn get_mut(&mut self, id: ContextId) -> &mut ExecutionContext {
        &mut self.slots[id.0]
    }

    /// The context in slot `index`, if it is still the `generation`
    /// allocation and parked on a kernel suspension.
    pub fn parked(&self, index: usize, generation: u64) -> Option<ContextId> {
        let slot = self.slots.get(index)?;
        (slot.alive && slot.wait.is_some() && slot.generation == generation)
            .then_some(ContextId(index))
    }

    /// Mark every context waiting on `id` as killed, unlinking the chain.
    pub fn kill_chain(&mut self, id: ContextId) -> usize {
        let mut count = 0;
        let mut next = self.slots[id.0].next.take();
        while let Some(n) = next {
            let slot = &mut self.slots[n.0];
            slot.killed = true;
            next = slot.next.take();
            count += 1;
        }
        count
    }

    /// Contexts ever created.
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Contexts ready for reuse.
    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_grows_lazily_and_reuses() {
        let mut pool = ContextPool::default();
        let a = pool.allocate("a".into(), None);
        let b = pool.allocate("b".into(), Some(a));
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.idle_count(), 0);

        pool.release(b);
        assert_eq!(pool.idle_count(), 1);
        let c = pool.allocate("c".into(), None);
        assert_eq!(c, b);
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.get(c).description, "c");
        assert_eq!(pool.get(c).next, None);
    }

    #[test]
    fn test_double_release_is_ignored() {
        let mut pool = ContextPool::default();
        let a = pool.allocate("a".into(), None);
        pool.release(a);
        pool.release(a);
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn test_kill_chain_marks_waiters() {
        let mut pool = ContextPool::default();
        let root = pool.allocate("root".into(), None);
        let mid = pool.allocate("mid".into(), Some(root));
        let leaf = pool.allocate("leaf".into(), Some(mid));

        assert_eq!(pool.kill_chain(leaf), 2);
        assert!(pool.get(mid).killed);
        assert!(pool.get(root).killed);
        assert!(!pool.get(leaf).killed);
        assert_eq!(pool.get(mid).next, None);
    }

    #[test]
    fn test_parked_checks_generation() {
        let mut pool = ContextPool::default();
        let a = pool.allocate("a".into(), None);
        let first = pool.get(a).generation;
        assert_eq!(pool.parked(a.index(), first), None);

        pool.get_mut(a).wait = Some(Occurrence::Conditional(7));
        assert_eq!(pool.parked(a.index(), first), Some(a));

        pool.release(a);
        let b = pool.allocate("b".into(), None);
        assert_eq!(b, a);
        pool.get_mut(b).wait = Some(Occurrence::Conditional(8));
        assert_eq!(pool.parked(b.index(), first), None);
        assert_eq!(pool.parked(b.index(), first + 1), Some(b));
        assert_eq!(pool.parked(99, 1), None);
    }
}
