//! Event priority queue
//!
//! A red-black tree keyed by `(tick, priority)`. Every node owns an
//! intrusive list of events sharing its key; appending to the tail gives
//! FIFO order and prepending gives LIFO order. A node is in the tree iff
//! its list is non-empty.
//!
//! Nodes and event records live in two arenas. Removed slots are chained on
//! free lists (nodes through `left`, events through `next`) and reused by
//! later insertions, so the hot insert/remove path does not allocate once
//! the working set is warm. There are no parent links: descent records the
//! ancestor chain in a scratch stack that the rebalancing code walks.

use crate::error::{KernelError, KernelResult};
use std::cell::Cell;
use std::cmp::Ordering;

/// Simulated time in discrete ticks.
pub type Tick = i64;

/// Lower values dispatch first among events sharing a tick.
pub type Priority = i32;

/// Index of a node in the tree arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

/// Index of an event record in the event arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EventId(usize);

/// Sentinel leaf; always black, never mutated structurally.
const NIL: NodeId = NodeId(0);

#[derive(Debug)]
struct EventNode {
    tick: Tick,
    priority: Priority,
    red: bool,
    left: NodeId,
    right: NodeId,
    head: Option<EventId>,
    tail: Option<EventId>,
}

impl EventNode {
    fn new(tick: Tick, priority: Priority) -> Self {
        Self {
            tick,
            priority,
            red: false,
            left: NIL,
            right: NIL,
            head: None,
            tail: None,
        }
    }

    fn cmp_key(&self, tick: Tick, priority: Priority) -> Ordering {
        self.tick
            .cmp(&tick)
            .then_with(|| self.priority.cmp(&priority))
    }
}

struct EventSlot<T> {
    node: NodeId,
    next: Option<EventId>,
    payload: Option<T>,
}

/// The kernel's priority queue of pending events.
pub struct EventTree<T> {
    nodes: Vec<EventNode>,
    events: Vec<EventSlot<T>>,
    root: NodeId,
    /// Cached leftmost node, `None` when invalidated.
    lowest: Cell<Option<NodeId>>,
    free_nodes: NodeId,
    free_events: Option<EventId>,
    scratch: Vec<NodeId>,
    node_count: usize,
    event_count: usize,
}

impl<T> Default for EventTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventTree<T> {
    pub fn new() -> Self {
        Self {
            nodes: vec![EventNode::new(0, 0)],
            events: Vec::new(),
            root: NIL,
            lowest: Cell::new(None),
            free_nodes: NIL,
            free_events: None,
            scratch: Vec::with_capacity(64),
            node_count: 0,
            event_count: 0,
        }
    }

    /// True when no event is pending.
    pub fn is_empty(&self) -> bool {
        self.root == NIL
    }

    /// Number of distinct `(tick, priority)` keys in the tree.
    pub fn node_count(&self) -> usize {
        self.node_count
    }

    /// Number of pending events across all nodes.
    pub fn event_count(&self) -> usize {
        self.event_count
    }

    /// Slots allocated so far (live plus recycled), excluding the sentinel.
    pub fn node_capacity(&self) -> usize {
        self.nodes.len() - 1
    }

    /// Event records allocated so far (live plus recycled).
    pub fn event_capacity(&self) -> usize {
        self.events.len()
    }

    fn node(&self, id: NodeId) -> &EventNode {
        &self.nodes[id.0]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut EventNode {
        &mut self.nodes[id.0]
    }

    fn is_red(&self, id: NodeId) -> bool {
        self.nodes[id.0].red
    }

    fn set_red(&mut self, id: NodeId, red: bool) {
        // The sentinel may be recolored black by the fix-up code, never red.
        debug_assert!(!(id == NIL && red));
        self.nodes[id.0].red = red;
    }

    fn left(&self, id: NodeId) -> NodeId {
        self.nodes[id.0].left
    }

    fn right(&self, id: NodeId) -> NodeId {
        self.nodes[id.0].right
    }

    /// The leftmost node: the next key to dispatch.
    pub fn first(&self) -> Option<NodeId> {
        if self.root == NIL {
            return None;
        }
        if let Some(lowest) = self.lowest.get() {
            return Some(lowest);
        }
        let mut current = self.root;
        while self.left(current) != NIL {
            current = self.left(current);
        }
        self.lowest.set(Some(current));
        Some(current)
    }

    /// Key of the leftmost node.
    pub fn first_key(&self) -> Option<(Tick, Priority)> {
        self.first().map(|n| self.key(n))
    }

    pub fn key(&self, node: NodeId) -> (Tick, Priority) {
        let n = self.node(node);
        (n.tick, n.priority)
    }

    /// First event in a node's list.
    pub fn head(&self, node: NodeId) -> Option<EventId> {
        self.node(node).head
    }

    /// Key of the node an event belongs to.
    pub fn event_key(&self, event: EventId) -> (Tick, Priority) {
        self.key(self.events[event.0].node)
    }

    /// Payload of a pending event, `None` once it has been removed.
    pub fn payload(&self, event: EventId) -> Option<&T> {
        self.events.get(event.0).and_then(|e| e.payload.as_ref())
    }

    /// Exact-key lookup.
    pub fn find(&self, tick: Tick, priority: Priority) -> Option<NodeId> {
        let mut current = self.root;
        while current != NIL {
            match self.node(current).cmp_key(tick, priority) {
                Ordering::Equal => return Some(current),
                Ordering::Greater => current = self.left(current),
                Ordering::Less => current = self.right(current),
            }
        }
        None
    }

    // ---- scratch stack (ancestor chain) ----

    fn scratch(&self, n: usize) -> NodeId {
        let len = self.scratch.len();
        if len >= n {
            self.scratch[len - n]
        } else {
            NIL
        }
    }

    fn drop_scratch(&mut self, n: usize) {
        let len = self.scratch.len().saturating_sub(n);
        self.scratch.truncate(len);
    }

    // ---- rotations ----

    /// Rotate `n` left; `parent` (or NIL for the root) gets re-linked.
    fn rotate_left(&mut self, n: NodeId, parent: NodeId) {
        let r = self.right(n);
        if parent != NIL {
            if self.left(parent) == n {
                self.node_mut(parent).left = r;
            } else {
                self.node_mut(parent).right = r;
            }
        }
        let mid = self.left(r);
        self.node_mut(r).left = n;
        self.node_mut(n).right = mid;
    }

    fn rotate_right(&mut self, n: NodeId, parent: NodeId) {
        let l = self.left(n);
        if parent != NIL {
            if self.left(parent) == n {
                self.node_mut(parent).left = l;
            } else {
                self.node_mut(parent).right = l;
            }
        }
        let mid = self.right(l);
        self.node_mut(l).right = n;
        self.node_mut(n).left = mid;
    }

    // ---- node allocation ----

    fn alloc_node(&mut self, tick: Tick, priority: Priority) -> NodeId {
        self.node_count += 1;
        if self.free_nodes == NIL {
            self.nodes.push(EventNode::new(tick, priority));
            return NodeId(self.nodes.len() - 1);
        }
        let id = self.free_nodes;
        self.free_nodes = self.left(id);
        *self.node_mut(id) = EventNode::new(tick, priority);
        id
    }

    fn recycle_node(&mut self, id: NodeId) {
        self.node_count -= 1;
        let free = self.free_nodes;
        let node = self.node_mut(id);
        node.head = None;
        node.tail = None;
        node.right = NIL;
        node.red = false;
        node.left = free;
        self.free_nodes = id;
    }

    /// Locate the node for `(tick, priority)`, inserting an empty one if absent.
    pub fn find_or_create(&mut self, tick: Tick, priority: Priority) -> NodeId {
        if self.root == NIL {
            let root = self.alloc_node(tick, priority);
            self.root = root;
            self.lowest.set(Some(root));
            return root;
        }
        self.scratch.clear();

        let mut n = self.root;
        let new_node = loop {
            let comp = self.node(n).cmp_key(tick, priority);
            if comp == Ordering::Equal {
                return n;
            }
            let next = if comp == Ordering::Greater {
                self.left(n)
            } else {
                self.right(n)
            };
            self.scratch.push(n);
            if next != NIL {
                n = next;
                continue;
            }

            let new_node = self.alloc_node(tick, priority);
            self.set_red(new_node, true);
            if comp == Ordering::Greater {
                self.node_mut(n).left = new_node;
            } else {
                self.node_mut(n).right = new_node;
            }
            break new_node;
        };

        self.insert_balance(new_node);
        let root = self.root;
        self.set_red(root, false);

        if let Some(lowest) = self.lowest.get() {
            if self.node(new_node).cmp_key(self.node(lowest).tick, self.node(lowest).priority)
                == Ordering::Less
            {
                self.lowest.set(Some(new_node));
            }
        }
        new_node
    }

    fn insert_balance(&mut self, mut n: NodeId) {
        loop {
            let mut parent = self.scratch(1);
            if parent == NIL || !self.is_red(parent) {
                return;
            }
            let gp = self.scratch(2);
            if gp == NIL {
                return;
            }
            let uncle = if self.left(gp) == parent {
                self.right(gp)
            } else {
                self.left(gp)
            };

            if self.is_red(uncle) {
                // Recolor and continue from the grandparent.
                self.set_red(parent, false);
                self.set_red(uncle, false);
                self.set_red(gp, true);
                self.drop_scratch(2);
                n = gp;
                continue;
            }

            // Inner child: rotate it to the outside first.
            if n == self.right(parent) && parent == self.left(gp) {
                self.rotate_left(parent, gp);
                parent = n;
                n = self.left(n);
            } else if n == self.left(parent) && parent == self.right(gp) {
                self.rotate_right(parent, gp);
                parent = n;
                n = self.right(n);
            }

            let ggp = self.scratch(3);
            self.set_red(gp, true);
            self.set_red(parent, false);
            if self.left(parent) == n {
                if gp == self.root {
                    self.root = self.left(gp);
                }
                self.rotate_right(gp, ggp);
            } else {
                if gp == self.root {
                    self.root = self.right(gp);
                }
                self.rotate_left(gp, ggp);
            }
            return;
        }
    }

    /// Delete the node with this key. Its event list must already be empty.
    ///
    /// Returns false if the key is not in the tree.
    pub fn remove(&mut self, tick: Tick, priority: Priority) -> bool {
        self.scratch.clear();
        self.lowest.set(None);

        let mut current = self.root;
        if current == NIL {
            return false;
        }
        loop {
            let comp = self.node(current).cmp_key(tick, priority);
            if comp == Ordering::Equal {
                break;
            }
            self.scratch.push(current);
            current = if comp == Ordering::Greater {
                self.left(current)
            } else {
                self.right(current)
            };
            if current == NIL {
                return false;
            }
        }

        debug_assert!(
            self.node(current).head.is_none(),
            "removing non-empty event node"
        );

        if self.left(current) != NIL && self.right(current) != NIL {
            current = self.swap_to_leaf(current);
        }

        let child = if self.left(current) != NIL {
            self.left(current)
        } else {
            self.right(current)
        };

        let parent = self.scratch(1);
        if parent != NIL {
            if self.left(parent) == current {
                self.node_mut(parent).left = child;
            } else {
                self.node_mut(parent).right = child;
            }
        }
        if current == self.root {
            self.root = child;
        }

        let removed_red = self.is_red(current);
        self.recycle_node(current);

        if removed_red {
            return true;
        }
        if self.is_red(child) {
            self.set_red(child, false);
            return true;
        }

        // A black node with a black child is gone: one path is short a black.
        self.delete_balance(child);
        let root = self.root;
        self.set_red(root, false);
        true
    }

    /// Move the in-order predecessor's key and events into `node`; return the
    /// predecessor, which now has at most one child.
    fn swap_to_leaf(&mut self, node: NodeId) -> NodeId {
        self.scratch.push(node);
        let mut curr = self.left(node);
        while self.right(curr) != NIL {
            self.scratch.push(curr);
            curr = self.right(curr);
        }

        let (tick, priority, head, tail) = {
            let src = self.node(curr);
            (src.tick, src.priority, src.head, src.tail)
        };
        {
            let dst = self.node_mut(node);
            dst.tick = tick;
            dst.priority = priority;
            dst.head = head;
            dst.tail = tail;
        }
        let mut next = head;
        while let Some(e) = next {
            self.events[e.0].node = node;
            next = self.events[e.0].next;
        }
        let src = self.node_mut(curr);
        src.head = None;
        src.tail = None;
        curr
    }

    fn delete_balance(&mut self, mut n: NodeId) {
        loop {
            // The scratch stack holds n's ancestors, not n itself.
            let parent = self.scratch(1);
            if parent == NIL {
                return;
            }
            let mut sib = if self.left(parent) == n {
                self.right(parent)
            } else {
                self.left(parent)
            };
            let mut gp = self.scratch(2);

            if self.is_red(sib) {
                self.set_red(sib, false);
                self.set_red(parent, true);
                if n == self.left(parent) {
                    self.rotate_left(parent, gp);
                } else {
                    self.rotate_right(parent, gp);
                }
                if self.root == parent {
                    self.root = sib;
                }

                // sib is now parent's parent.
                self.drop_scratch(1);
                self.scratch.push(sib);
                self.scratch.push(parent);
                gp = self.scratch(2);

                sib = if self.left(parent) == n {
                    self.right(parent)
                } else {
                    self.left(parent)
                };
            }

            let sib_left_red = self.is_red(self.left(sib));
            let sib_right_red = self.is_red(self.right(sib));

            if !self.is_red(parent) && !sib_left_red && !sib_right_red {
                self.set_red(sib, true);
                self.drop_scratch(1);
                n = parent;
                continue;
            }

            if self.is_red(parent) && !sib_left_red && !sib_right_red {
                self.set_red(parent, false);
                self.set_red(sib, true);
                return;
            }

            // Near red child only: rotate at the sibling to make it far.
            if self.left(parent) == n && !sib_right_red && sib_left_red {
                self.set_red(sib, true);
                let sl = self.left(sib);
                self.set_red(sl, false);
                self.rotate_right(sib, parent);
                sib = self.right(parent);
            } else if self.right(parent) == n && !sib_left_red && sib_right_red {
                self.set_red(sib, true);
                let sr = self.right(sib);
                self.set_red(sr, false);
                self.rotate_left(sib, parent);
                sib = self.left(parent);
            }

            let parent_red = self.is_red(parent);
            self.set_red(sib, parent_red);
            self.set_red(parent, false);
            if n == self.left(parent) {
                let sr = self.right(sib);
                self.set_red(sr, false);
                self.rotate_left(parent, gp);
            } else {
                let sl = self.left(sib);
                self.set_red(sl, false);
                self.rotate_right(parent, gp);
            }
            if self.root == parent {
                self.root = sib;
            }
            return;
        }
    }

    // ---- event lists ----

    fn alloc_event(&mut self, node: NodeId, payload: T) -> EventId {
        self.event_count += 1;
        match self.free_events {
            Some(id) => {
                let slot = &mut self.events[id.0];
                self.free_events = slot.next;
                slot.node = node;
                slot.next = None;
                slot.payload = Some(payload);
                id
            }
            None => {
                self.events.push(EventSlot {
                    node,
                    next: None,
                    payload: Some(payload),
                });
                EventId(self.events.len() - 1)
            }
        }
    }

    /// Append (`fifo`) or prepend (LIFO) an event to a node's list.
    pub fn push_event(&mut self, node: NodeId, payload: T, fifo: bool) -> EventId {
        let e = self.alloc_event(node, payload);
        let (head, tail) = (self.node(node).head, self.node(node).tail);
        match (head, tail) {
            (Some(head), Some(tail)) => {
                if fifo {
                    self.events[tail.0].next = Some(e);
                    self.node_mut(node).tail = Some(e);
                } else {
                    self.events[e.0].next = Some(head);
                    self.node_mut(node).head = Some(e);
                }
            }
            _ => {
                let n = self.node_mut(node);
                n.head = Some(e);
                n.tail = Some(e);
            }
        }
        e
    }

    /// Insert an event at `(tick, priority)`.
    pub fn schedule(&mut self, tick: Tick, priority: Priority, payload: T, fifo: bool) -> EventId {
        let node = self.find_or_create(tick, priority);
        self.push_event(node, payload, fifo)
    }

    fn unlink(&mut self, node: NodeId, e: EventId) {
        let next = self.events[e.0].next;
        if self.node(node).head == Some(e) {
            let n = self.node_mut(node);
            n.head = next;
            if next.is_none() {
                n.tail = None;
            }
            return;
        }
        let mut prev = self.node(node).head;
        while let Some(p) = prev {
            if self.events[p.0].next == Some(e) {
                self.events[p.0].next = next;
                if next.is_none() {
                    self.node_mut(node).tail = Some(p);
                }
                return;
            }
            prev = self.events[p.0].next;
        }
    }

    /// Detach an event from its node, deleting the node if it drained, and
    /// recycle the record. Returns the payload.
    pub fn remove_event(&mut self, e: EventId) -> KernelResult<T> {
        let (node, payload) = match self.events.get_mut(e.0) {
            Some(slot) if slot.payload.is_some() => (slot.node, slot.payload.take()),
            _ => return Err(KernelError::StaleEvent),
        };
        self.unlink(node, e);

        let slot = &mut self.events[e.0];
        slot.node = NIL;
        slot.next = self.free_events;
        self.free_events = Some(e);
        self.event_count -= 1;

        if self.node(node).head.is_none() {
            let (tick, priority) = self.key(node);
            if !self.remove(tick, priority) {
                return Err(KernelError::NodeNotFound { tick, priority });
            }
        }
        payload.ok_or(KernelError::StaleEvent)
    }

    /// All pending events in dispatch order.
    pub fn iter(&self) -> Vec<(Tick, Priority, &T)> {
        let mut out = Vec::with_capacity(self.event_count);
        let mut stack = Vec::new();
        let mut current = self.root;
        while current != NIL || !stack.is_empty() {
            while current != NIL {
                stack.push(current);
                current = self.left(current);
            }
            let Some(n) = stack.pop() else { break };
            let node = self.node(n);
            let mut e = node.head;
            while let Some(id) = e {
                let slot = &self.events[id.0];
                if let Some(p) = slot.payload.as_ref() {
                    out.push((node.tick, node.priority, p));
                }
                e = slot.next;
            }
            current = node.right;
        }
        out
    }

    /// Remove every event in dispatch order and reset the tree, dropping
    /// the free lists.
    pub fn drain(&mut self) -> Vec<(Tick, Priority, T)> {
        let order: Vec<(Tick, Priority, EventId)> = {
            let mut out = Vec::with_capacity(self.event_count);
            let mut stack = Vec::new();
            let mut current = self.root;
            while current != NIL || !stack.is_empty() {
                while current != NIL {
                    stack.push(current);
                    current = self.left(current);
                }
                let Some(n) = stack.pop() else { break };
                let node = self.node(n);
                let mut e = node.head;
                while let Some(id) = e {
                    out.push((node.tick, node.priority, id));
                    e = self.events[id.0].next;
                }
                current = node.right;
            }
            out
        };
        let drained = order
            .into_iter()
            .filter_map(|(tick, priority, id)| {
                self.events[id.0].payload.take().map(|p| (tick, priority, p))
            })
            .collect();
        self.reset();
        drained
    }

    /// Drop all nodes, events and free lists.
    pub fn reset(&mut self) {
        self.nodes.truncate(1);
        self.nodes[NIL.0] = EventNode::new(0, 0);
        self.events.clear();
        self.root = NIL;
        self.lowest.set(None);
        self.free_nodes = NIL;
        self.free_events = None;
        self.scratch.clear();
        self.node_count = 0;
        self.event_count = 0;
    }

    /// Check ordering, coloring, black-height and list ownership.
    /// Returns the number of nodes reachable from the root.
    pub fn verify(&self) -> Result<usize, String> {
        if self.is_red(NIL) {
            return Err("sentinel turned red".into());
        }
        if self.root == NIL {
            return Ok(0);
        }
        if self.is_red(self.root) {
            return Err("root is red".into());
        }
        let mut count = 0;
        self.verify_node(self.root, &mut count)?;
        if count != self.node_count {
            return Err(format!(
                "reachable nodes {} != tracked nodes {}",
                count, self.node_count
            ));
        }
        if let Some(lowest) = self.lowest.get() {
            let mut leftmost = self.root;
            while self.left(leftmost) != NIL {
                leftmost = self.left(leftmost);
            }
            if lowest != leftmost {
                return Err("stale minimum cache".into());
            }
        }
        Ok(count)
    }

    fn verify_node(&self, id: NodeId, count: &mut usize) -> Result<usize, String> {
        *count += 1;
        let n = self.node(id);
        if n.head.is_none() || n.tail.is_none() {
            return Err(format!("empty node ({}, {}) in tree", n.tick, n.priority));
        }
        let mut e = n.head;
        let mut last = None;
        while let Some(ev) = e {
            if self.events[ev.0].node != id {
                return Err(format!("event {:?} points at wrong node", ev));
            }
            last = Some(ev);
            e = self.events[ev.0].next;
        }
        if last != n.tail {
            return Err(format!("bad tail on node ({}, {})", n.tick, n.priority));
        }

        let mut left_blacks = 0;
        let mut right_blacks = 0;
        if n.left != NIL {
            let l = self.node(n.left);
            if n.cmp_key(l.tick, l.priority) != Ordering::Greater {
                return Err("order violated on left".into());
            }
            left_blacks = self.verify_node(n.left, count)?;
        }
        if n.right != NIL {
            let r = self.node(n.right);
            if n.cmp_key(r.tick, r.priority) != Ordering::Less {
                return Err("order violated on right".into());
            }
            right_blacks = self.verify_node(n.right, count)?;
        }
        if n.red && (self.is_red(n.left) || self.is_red(n.right)) {
            return Err(format!("red-red at ({}, {})", n.tick, n.priority));
        }
        if left_blacks != right_blacks {
            return Err(format!("black height mismatch at ({}, {})", n.tick, n.priority));
        }
        Ok(left_blacks + usize::from(!n.red))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::DetRng;
    use std::collections::BTreeMap;

    fn drain_order(tree: &mut EventTree<u32>) -> Vec<(Tick, Priority, u32)> {
        let mut out = Vec::new();
        while let Some(node) = tree.first() {
            let (tick, priority) = tree.key(node);
            let e = tree.head(node).unwrap();
            out.push((tick, priority, tree.remove_event(e).unwrap()));
            tree.verify().unwrap();
        }
        out
    }

    #[test]
    fn test_find_or_create_reuses_key() {
        let mut tree: EventTree<u32> = EventTree::new();
        let a = tree.find_or_create(5, 0);
        let b = tree.find_or_create(5, 0);
        assert_eq!(a, b);
        let c = tree.find_or_create(5, 1);
        assert_ne!(a, c);
        assert_eq!(tree.node_count(), 2);
        assert_eq!(tree.find(5, 0), Some(a));
        assert_eq!(tree.find(5, 1), Some(c));
        assert_eq!(tree.find(4, 0), None);
        assert!(tree.remove(5, 1));
        assert_eq!(tree.find(5, 1), None);
    }

    #[test]
    fn test_minimum_tracks_inserts() {
        let mut tree: EventTree<u32> = EventTree::new();
        tree.schedule(10, 0, 1, true);
        assert_eq!(tree.first_key(), Some((10, 0)));
        tree.schedule(3, 5, 2, true);
        assert_eq!(tree.first_key(), Some((3, 5)));
        tree.schedule(3, 1, 3, true);
        assert_eq!(tree.first_key(), Some((3, 1)));
        tree.schedule(20, 0, 4, true);
        assert_eq!(tree.first_key(), Some((3, 1)));
    }

    #[test]
    fn test_fifo_and_lifo_within_node() {
        let mut tree: EventTree<u32> = EventTree::new();
        tree.schedule(5, 0, 1, true);
        tree.schedule(5, 0, 2, true);
        tree.schedule(5, 0, 3, false);
        tree.schedule(5, 0, 4, true);
        let order: Vec<u32> = drain_order(&mut tree).into_iter().map(|(_, _, v)| v).collect();
        assert_eq!(order, vec![3, 1, 2, 4]);
    }

    #[test]
    fn test_remove_missing_key() {
        let mut tree: EventTree<u32> = EventTree::new();
        assert!(!tree.remove(1, 1));
        tree.schedule(2, 0, 0, true);
        assert!(!tree.remove(1, 1));
    }

    #[test]
    fn test_remove_middle_event_keeps_tail() {
        let mut tree: EventTree<u32> = EventTree::new();
        let node = tree.find_or_create(1, 0);
        tree.push_event(node, 1, true);
        let mid = tree.push_event(node, 2, true);
        let last = tree.push_event(node, 3, true);
        assert_eq!(tree.remove_event(last).unwrap(), 3);
        assert_eq!(tree.remove_event(mid).unwrap(), 2);
        tree.schedule(1, 0, 4, true);
        let order: Vec<u32> = drain_order(&mut tree).into_iter().map(|(_, _, v)| v).collect();
        assert_eq!(order, vec![1, 4]);
    }

    #[test]
    fn test_nodes_and_events_recycled() {
        let mut tree: EventTree<u32> = EventTree::new();
        for i in 0..32 {
            tree.schedule(i, 0, i as u32, true);
        }
        drain_order(&mut tree);
        assert!(tree.is_empty());
        let (nodes, events) = (tree.node_capacity(), tree.event_capacity());
        for i in 0..32 {
            tree.schedule(100 - i, 0, i as u32, true);
        }
        assert_eq!(tree.node_capacity(), nodes);
        assert_eq!(tree.event_capacity(), events);
        tree.verify().unwrap();
    }

    #[test]
    fn test_random_inserts_and_removals_stay_balanced() {
        let mut rng = DetRng::new("tree_balance");
        let mut tree: EventTree<u32> = EventTree::new();
        let mut live: Vec<EventId> = Vec::new();
        let mut keys: BTreeMap<(Tick, Priority), usize> = BTreeMap::new();

        for step in 0..4000u32 {
            if live.is_empty() || rng.below(3) != 0 {
                let tick = rng.below(200) as Tick;
                let priority = rng.below(4) as Priority;
                let id = tree.schedule(tick, priority, step, rng.below(2) == 0);
                live.push(id);
                *keys.entry((tick, priority)).or_default() += 1;
            } else {
                let idx = rng.below(live.len() as u64) as usize;
                let id = live.swap_remove(idx);
                let key = tree.event_key(id);
                tree.remove_event(id).unwrap();
                let count = keys.get_mut(&key).unwrap();
                *count -= 1;
                if *count == 0 {
                    keys.remove(&key);
                }
            }
            let nodes = tree.verify().unwrap();
            assert_eq!(nodes, keys.len());
            assert_eq!(tree.first_key(), keys.keys().next().copied());
        }
    }

    #[test]
    fn test_drain_in_dispatch_order() {
        let mut tree: EventTree<u32> = EventTree::new();
        tree.schedule(3, 0, 30, true);
        tree.schedule(1, 2, 12, true);
        tree.schedule(1, 0, 10, true);
        tree.schedule(1, 0, 11, true);
        let seen: Vec<u32> = tree.iter().into_iter().map(|(_, _, v)| *v).collect();
        assert_eq!(seen, vec![10, 11, 12, 30]);
        let drained: Vec<u32> = tree.drain().into_iter().map(|(_, _, v)| v).collect();
        assert_eq!(drained, vec![10, 11, 12, 30]);
        assert!(tree.is_empty());
        assert_eq!(tree.event_count(), 0);
    }
}
