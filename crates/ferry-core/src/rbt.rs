//! Ordered index: an arena red-black tree with a caller-supplied comparator.
//!
//! Nodes live in a slot vector and link to each other by index, so a
//! `NodeId` is just a slot number. Insertion rebalances top-down on the way
//! to the leaf; deletion rebalances bottom-up from the removed position.
//!
//! Deleting a node with two children moves its in-order predecessor's data
//! into its slot, so a `NodeId` is only meaningful until the next mutation.
//!
//! Every operation holds the tree's lock. Operations that can fail (lock
//! poisoned, node limit reached) return `None`; the tree stays valid.

use std::cmp::Ordering;
use std::sync::{Mutex, MutexGuard};

const LEFT: usize = 0;
const RIGHT: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

/// Outcome of `insert`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insertion {
    New(NodeId),
    /// An equal key was already present; the new data was dropped.
    Existing(NodeId),
}

impl Insertion {
    pub fn node(self) -> NodeId {
        match self {
            Insertion::New(n) | Insertion::Existing(n) => n,
        }
    }
}

/// Outcome of `search`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    Found(NodeId),
    /// Not present; this is the first node ordered after the key.
    Successor(NodeId),
    /// Not present and nothing orders after the key.
    End,
}

pub type Compare<T> = Box<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

struct Node<T> {
    data: T,
    parent: Option<usize>,
    child: [Option<usize>; 2],
    red: bool,
}

enum Slot<T> {
    Occupied(Node<T>),
    Vacant { next_free: Option<usize> },
}

struct Tree<T> {
    slots: Vec<Slot<T>>,
    root: Option<usize>,
    free: Option<usize>,
    len: usize,
    limit: Option<usize>,
}

pub struct OrderedIndex<T> {
    tree: Mutex<Tree<T>>,
    compare: Compare<T>,
}

impl<T> OrderedIndex<T> {
    pub fn new(compare: impl Fn(&T, &T) -> Ordering + Send + Sync + 'static) -> Self {
        Self::build(Box::new(compare), None)
    }

    /// An index that refuses to grow past `limit` nodes.
    pub fn with_limit(
        compare: impl Fn(&T, &T) -> Ordering + Send + Sync + 'static,
        limit: usize,
    ) -> Self {
        Self::build(Box::new(compare), Some(limit))
    }

    fn build(compare: Compare<T>, limit: Option<usize>) -> Self {
        Self {
            tree: Mutex::new(Tree {
                slots: Vec::new(),
                root: None,
                free: None,
                len: 0,
                limit,
            }),
            compare,
        }
    }

    fn lock(&self) -> Option<MutexGuard<'_, Tree<T>>> {
        self.tree.lock().ok()
    }

    pub fn len(&self) -> usize {
        self.lock().map(|t| t.len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every node.
    pub fn clear(&self) {
        if let Some(mut t) = self.lock() {
            t.slots.clear();
            t.root = None;
            t.free = None;
            t.len = 0;
        }
    }

    pub fn insert(&self, data: T) -> Option<Insertion> {
        let mut t = self.lock()?;
        t.insert(data, &*self.compare)
    }

    /// Remove the node equal to `key`, returning its data.
    pub fn delete(&self, key: &T) -> Option<T> {
        let mut t = self.lock()?;
        let z = t.find(key, &*self.compare)?;
        Some(t.remove(z))
    }

    pub fn search(&self, key: &T) -> Probe {
        let Some(t) = self.lock() else {
            return Probe::End;
        };
        let mut cursor = t.root;
        let mut successor = None;
        while let Some(n) = cursor {
            match (self.compare)(&t.node(n).data, key) {
                Ordering::Equal => return Probe::Found(NodeId(n)),
                Ordering::Less => cursor = t.node(n).child[RIGHT],
                Ordering::Greater => {
                    successor = Some(n);
                    cursor = t.node(n).child[LEFT];
                }
            }
        }
        match successor {
            Some(n) => Probe::Successor(NodeId(n)),
            None => Probe::End,
        }
    }

    pub fn first(&self) -> Option<NodeId> {
        let t = self.lock()?;
        let root = t.root?;
        Some(NodeId(t.extreme(root, LEFT)))
    }

    pub fn last(&self) -> Option<NodeId> {
        let t = self.lock()?;
        let root = t.root?;
        Some(NodeId(t.extreme(root, RIGHT)))
    }

    pub fn next(&self, from: NodeId) -> Option<NodeId> {
        let t = self.lock()?;
        t.occupied(from.0)?;
        t.traverse(from.0, RIGHT).map(NodeId)
    }

    pub fn prev(&self, from: NodeId) -> Option<NodeId> {
        let t = self.lock()?;
        t.occupied(from.0)?;
        t.traverse(from.0, LEFT).map(NodeId)
    }
}

impl<T: Clone> OrderedIndex<T> {
    pub fn data(&self, node: NodeId) -> Option<T> {
        let t = self.lock()?;
        t.occupied(node.0).map(|n| n.data.clone())
    }

    /// Every entry in order.
    pub fn to_vec(&self) -> Vec<T> {
        let mut out = Vec::new();
        let Some(t) = self.lock() else {
            return out;
        };
        let mut cursor = t.root.map(|r| t.extreme(r, LEFT));
        while let Some(n) = cursor {
            out.push(t.node(n).data.clone());
            cursor = t.traverse(n, RIGHT);
        }
        out
    }
}

impl<T> std::fmt::Debug for OrderedIndex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderedIndex").field("len", &self.len()).finish()
    }
}

// ── Tree internals ───────────────────────────────────────────────────────────

impl<T> Tree<T> {
    fn occupied(&self, i: usize) -> Option<&Node<T>> {
        match self.slots.get(i) {
            Some(Slot::Occupied(n)) => Some(n),
            _ => None,
        }
    }

    // Links inside the tree always point at occupied slots.
    fn node(&self, i: usize) -> &Node<T> {
        match &self.slots[i] {
            Slot::Occupied(n) => n,
            Slot::Vacant { .. } => unreachable!("link to vacant slot {i}"),
        }
    }

    fn node_mut(&mut self, i: usize) -> &mut Node<T> {
        match &mut self.slots[i] {
            Slot::Occupied(n) => n,
            Slot::Vacant { .. } => unreachable!("link to vacant slot {i}"),
        }
    }

    fn is_red(&self, i: Option<usize>) -> bool {
        i.map(|i| self.node(i).red).unwrap_or(false)
    }

    fn set_red(&mut self, i: Option<usize>, red: bool) {
        if let Some(i) = i {
            self.node_mut(i).red = red;
        }
    }

    fn side_of(&self, parent: usize, child: Option<usize>) -> usize {
        if self.node(parent).child[LEFT] == child {
            LEFT
        } else {
            RIGHT
        }
    }

    fn allocate(&mut self, data: T, parent: Option<usize>, red: bool) -> Option<usize> {
        if self.limit.is_some_and(|limit| self.len >= limit) {
            return None;
        }
        let node = Node {
            data,
            parent,
            child: [None, None],
            red,
        };
        let i = match self.free {
            Some(i) => {
                if let Slot::Vacant { next_free } = self.slots[i] {
                    self.free = next_free;
                }
                self.slots[i] = Slot::Occupied(node);
                i
            }
            None => {
                self.slots.push(Slot::Occupied(node));
                self.slots.len() - 1
            }
        };
        self.len += 1;
        Some(i)
    }

    fn release(&mut self, i: usize) -> T {
        let slot = std::mem::replace(
            &mut self.slots[i],
            Slot::Vacant {
                next_free: self.free,
            },
        );
        self.free = Some(i);
        self.len -= 1;
        match slot {
            Slot::Occupied(n) => n.data,
            Slot::Vacant { .. } => unreachable!("released vacant slot {i}"),
        }
    }

    /// Point whatever referenced `old` (its parent, or the root) at `new`.
    fn replace_child(&mut self, parent: Option<usize>, old: usize, new: Option<usize>) {
        match parent {
            None => self.root = new,
            Some(p) => {
                let side = self.side_of(p, Some(old));
                self.node_mut(p).child[side] = new;
            }
        }
        if let Some(n) = new {
            self.node_mut(n).parent = parent;
        }
    }

    /// Rotate the subtree at `root` toward `dir`: its child on the other
    /// side becomes the subtree root. Colors are the caller's business.
    fn rotate(&mut self, root: usize, dir: usize) -> usize {
        let other = 1 - dir;
        let Some(pivot) = self.node(root).child[other] else {
            return root;
        };
        let orphan = self.node(pivot).child[dir];
        let parent = self.node(root).parent;
        self.replace_child(parent, root, Some(pivot));
        self.node_mut(pivot).child[dir] = Some(root);
        self.node_mut(root).parent = Some(pivot);
        self.node_mut(root).child[other] = orphan;
        if let Some(o) = orphan {
            self.node_mut(o).parent = Some(root);
        }
        pivot
    }

    fn extreme(&self, mut i: usize, dir: usize) -> usize {
        while let Some(c) = self.node(i).child[dir] {
            i = c;
        }
        i
    }

    /// In-order neighbor of `i` in direction `dir`.
    fn traverse(&self, i: usize, dir: usize) -> Option<usize> {
        if let Some(c) = self.node(i).child[dir] {
            return Some(self.extreme(c, 1 - dir));
        }
        let mut child = i;
        let mut parent = self.node(i).parent;
        while let Some(p) = parent {
            if self.node(p).child[dir] != Some(child) {
                return Some(p);
            }
            child = p;
            parent = self.node(p).parent;
        }
        None
    }

    fn find(&self, key: &T, compare: &dyn Fn(&T, &T) -> Ordering) -> Option<usize> {
        let mut cursor = self.root;
        while let Some(n) = cursor {
            cursor = match compare(&self.node(n).data, key) {
                Ordering::Equal => return Some(n),
                Ordering::Less => self.node(n).child[RIGHT],
                Ordering::Greater => self.node(n).child[LEFT],
            };
        }
        None
    }

    fn insert(&mut self, data: T, compare: &dyn Fn(&T, &T) -> Ordering) -> Option<Insertion> {
        let Some(root) = self.root else {
            let i = self.allocate(data, None, false)?;
            self.root = Some(i);
            return Some(Insertion::New(NodeId(i)));
        };

        let mut pending = Some(data);
        let mut node = Some(root);
        let mut parent: Option<usize> = None;
        let mut dir = LEFT;
        let mut last = LEFT;
        let outcome = loop {
            let (q, created) = match node {
                Some(q) => {
                    let [l, r] = self.node(q).child;
                    if self.is_red(l) && self.is_red(r) {
                        self.node_mut(q).red = true;
                        self.set_red(l, false);
                        self.set_red(r, false);
                    }
                    (q, false)
                }
                None => {
                    let p = parent?;
                    let incoming = pending.take()?;
                    let Some(q) = self.allocate(incoming, Some(p), true) else {
                        break None;
                    };
                    self.node_mut(p).child[dir] = Some(q);
                    (q, true)
                }
            };

            // Two reds in a row: rotate at the grandparent.
            if let Some(p) = parent {
                if self.node(p).red && self.node(q).red {
                    if let Some(g) = self.node(p).parent {
                        let top = if self.node(p).child[last] == Some(q) {
                            self.rotate(g, 1 - last)
                        } else {
                            self.rotate(p, last);
                            self.rotate(g, 1 - last)
                        };
                        self.node_mut(top).red = false;
                        self.node_mut(g).red = true;
                    }
                }
            }

            if created {
                break Some(Insertion::New(NodeId(q)));
            }
            let Some(incoming) = pending.as_ref() else {
                break None;
            };
            let ord = compare(&self.node(q).data, incoming);
            if ord == Ordering::Equal {
                break Some(Insertion::Existing(NodeId(q)));
            }
            last = dir;
            dir = if ord == Ordering::Less { RIGHT } else { LEFT };
            parent = Some(q);
            node = self.node(q).child[dir];
        };

        if let Some(r) = self.root {
            self.node_mut(r).red = false;
        }
        outcome
    }

    fn remove(&mut self, z: usize) -> T {
        // Reduce to removing a node with at most one child.
        let children = self.node(z).child;
        let target = match children {
            [Some(l), Some(_)] => {
                let y = self.extreme(l, RIGHT);
                let (zn, yn) = if z < y {
                    let (a, b) = self.slots.split_at_mut(y);
                    (&mut a[z], &mut b[0])
                } else {
                    let (a, b) = self.slots.split_at_mut(z);
                    (&mut b[0], &mut a[y])
                };
                if let (Slot::Occupied(zn), Slot::Occupied(yn)) = (zn, yn) {
                    std::mem::swap(&mut zn.data, &mut yn.data);
                }
                y
            }
            _ => z,
        };

        let [l, r] = self.node(target).child;
        let child = l.or(r);
        let parent = self.node(target).parent;
        let was_red = self.node(target).red;
        self.replace_child(parent, target, child);
        let data = self.release(target);

        if !was_red {
            if self.is_red(child) {
                self.set_red(child, false);
            } else {
                self.delete_fixup(child, parent);
            }
        }
        data
    }

    fn delete_fixup(&mut self, mut x: Option<usize>, mut parent: Option<usize>) {
        while x != self.root && !self.is_red(x) {
            let Some(p) = parent else { break };
            let dir = self.side_of(p, x);
            let other = 1 - dir;
            let Some(mut w) = self.node(p).child[other] else {
                break;
            };
            if self.node(w).red {
                self.node_mut(w).red = false;
                self.node_mut(p).red = true;
                self.rotate(p, dir);
                match self.node(p).child[other] {
                    Some(s) => w = s,
                    None => break,
                }
            }
            let [wl, wr] = self.node(w).child;
            if !self.is_red(wl) && !self.is_red(wr) {
                self.node_mut(w).red = true;
                x = Some(p);
                parent = self.node(p).parent;
                continue;
            }
            if !self.is_red(self.node(w).child[other]) {
                let near = self.node(w).child[dir];
                self.set_red(near, false);
                self.node_mut(w).red = true;
                self.rotate(w, other);
                match self.node(p).child[other] {
                    Some(s) => w = s,
                    None => break,
                }
            }
            let parent_red = self.node(p).red;
            self.node_mut(w).red = parent_red;
            self.node_mut(p).red = false;
            let far = self.node(w).child[other];
            self.set_red(far, false);
            self.rotate(p, dir);
            x = self.root;
            parent = None;
        }
        self.set_red(x, false);
    }

    /// Black height of the tree, or a description of the broken invariant.
    #[cfg(test)]
    fn validate(&self, compare: &dyn Fn(&T, &T) -> Ordering) -> Result<usize, String> {
        fn walk<T>(
            t: &Tree<T>,
            i: Option<usize>,
            parent: Option<usize>,
            compare: &dyn Fn(&T, &T) -> Ordering,
        ) -> Result<usize, String> {
            let Some(i) = i else { return Ok(1) };
            let n = t.node(i);
            if n.parent != parent {
                return Err(format!("bad parent link at {i}"));
            }
            if n.red && (t.is_red(n.child[LEFT]) || t.is_red(n.child[RIGHT])) {
                return Err(format!("red node {i} has a red child"));
            }
            if let Some(l) = n.child[LEFT] {
                if compare(&t.node(l).data, &n.data) != Ordering::Less {
                    return Err(format!("left child out of order at {i}"));
                }
            }
            if let Some(r) = n.child[RIGHT] {
                if compare(&t.node(r).data, &n.data) != Ordering::Greater {
                    return Err(format!("right child out of order at {i}"));
                }
            }
            let lh = walk(t, n.child[LEFT], Some(i), compare)?;
            let rh = walk(t, n.child[RIGHT], Some(i), compare)?;
            if lh != rh {
                return Err(format!("black heights differ at {i}"));
            }
            Ok(lh + usize::from(!n.red))
        }
        if self.is_red(self.root) {
            return Err("red root".into());
        }
        walk(self, self.root, None, compare)
    }
}

#[cfg(test)]
impl<T> OrderedIndex<T> {
    fn validate(&self) -> Result<usize, String> {
        let t = self.lock().ok_or("poisoned")?;
        t.validate(&*self.compare)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> OrderedIndex<u32> {
        OrderedIndex::new(|a: &u32, b: &u32| a.cmp(b))
    }

    // Deterministic shuffle so failures reproduce.
    fn scrambled(n: u32) -> Vec<u32> {
        let mut out: Vec<u32> = (0..n).collect();
        let mut state: u64 = 0x2545_f491_4f6c_dd1d;
        for i in (1..out.len()).rev() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            out.swap(i, (state % (i as u64 + 1)) as usize);
        }
        out
    }

    #[test]
    fn insert_keeps_order_and_balance() {
        let idx = index();
        for k in scrambled(500) {
            assert!(matches!(idx.insert(k), Some(Insertion::New(_))));
        }
        idx.validate().unwrap();
        assert_eq!(idx.len(), 500);
        assert_eq!(idx.to_vec(), (0..500).collect::<Vec<_>>());
    }

    #[test]
    fn duplicate_insert_returns_existing_node() {
        let idx = index();
        let first = idx.insert(42).unwrap();
        for k in [7, 99, 3, 50] {
            idx.insert(k);
        }
        let again = idx.insert(42).unwrap();
        assert!(matches!(again, Insertion::Existing(_)));
        assert_eq!(idx.data(again.node()), Some(42));
        assert_eq!(idx.len(), 5);
        assert!(matches!(first, Insertion::New(_)));
    }

    #[test]
    fn search_reports_successor() {
        let idx = index();
        for k in [10, 20, 30] {
            idx.insert(k);
        }
        assert!(matches!(idx.search(&20), Probe::Found(n) if idx.data(n) == Some(20)));
        assert!(matches!(idx.search(&15), Probe::Successor(n) if idx.data(n) == Some(20)));
        assert!(matches!(idx.search(&0), Probe::Successor(n) if idx.data(n) == Some(10)));
        assert_eq!(idx.search(&31), Probe::End);
    }

    #[test]
    fn delete_in_scrambled_order_stays_valid() {
        let idx = index();
        for k in 0..300 {
            idx.insert(k);
        }
        for (removed, k) in scrambled(300).into_iter().enumerate() {
            assert_eq!(idx.delete(&k), Some(k));
            idx.validate().unwrap();
            assert_eq!(idx.len(), 300 - removed - 1);
        }
        assert!(idx.is_empty());
        assert_eq!(idx.first(), None);
        assert_eq!(idx.delete(&1), None);
    }

    #[test]
    fn traversal_both_ways() {
        let idx = index();
        for k in scrambled(64) {
            idx.insert(k);
        }
        let mut forward = Vec::new();
        let mut cursor = idx.first();
        while let Some(n) = cursor {
            forward.push(idx.data(n).unwrap());
            cursor = idx.next(n);
        }
        let mut backward = Vec::new();
        let mut cursor = idx.last();
        while let Some(n) = cursor {
            backward.push(idx.data(n).unwrap());
            cursor = idx.prev(n);
        }
        backward.reverse();
        assert_eq!(forward, (0..64).collect::<Vec<_>>());
        assert_eq!(forward, backward);
    }

    #[test]
    fn limit_refuses_growth_without_damage() {
        let idx = OrderedIndex::with_limit(|a: &u32, b: &u32| a.cmp(b), 3);
        for k in [5, 1, 9] {
            assert!(idx.insert(k).is_some());
        }
        assert_eq!(idx.insert(4), None);
        idx.validate().unwrap();
        assert!(matches!(idx.insert(9), Some(Insertion::Existing(_))));
        idx.delete(&1);
        assert!(idx.insert(4).is_some());
        assert_eq!(idx.to_vec(), vec![4, 5, 9]);
    }

    #[test]
    fn freed_slots_are_reused() {
        let idx = index();
        for k in 0..10 {
            idx.insert(k);
        }
        for k in 0..10 {
            idx.delete(&k);
        }
        for k in 10..20 {
            idx.insert(k);
        }
        let slots = idx.tree.lock().unwrap().slots.len();
        assert_eq!(slots, 10);
        idx.clear();
        assert!(idx.is_empty());
    }
}
