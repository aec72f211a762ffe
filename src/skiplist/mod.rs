//! # Skip List Module
//!
//! Randomized skip list keyed by row id, the ordered backbone of the
//! memtable. O(log n) insert/search/delete plus ordered range scans.
//!
//! ## Design Invariants
//!
//! - Max tower height is 16 with promotion probability 0.5.
//! - `insert` overwrites in place; a key appears at most once.
//! - Nodes live in an index-based arena (no pointer aliasing); freed slots
//!   are recycled through a free list.
//! - The whole structure is guarded by a single `RwLock`; readers proceed
//!   concurrently, writers are exclusive.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::sync::RwLock;

use rand::Rng;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

const MAX_LEVEL: usize = 16;
const PROMOTE_P: f64 = 0.5;

/// Sentinel arena index meaning "no successor".
const NIL: usize = usize::MAX;

// ------------------------------------------------------------------------------------------------
// Skip list core
// ------------------------------------------------------------------------------------------------

struct Node<V> {
    key: u64,
    value: Option<V>,
    /// Successor arena index per level; `forward.len()` is the tower height.
    forward: Vec<usize>,
}

struct SkipListInner<V> {
    arena: Vec<Node<V>>,
    free: Vec<usize>,
    /// Head towers, one slot per level.
    head: [usize; MAX_LEVEL],
    level: usize,
    len: usize,
}

/// Thread-safe randomized skip list mapping `u64` row ids to values.
pub struct SkipList<V> {
    inner: RwLock<SkipListInner<V>>,
}

impl<V: Clone> Default for SkipList<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone> SkipList<V> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(SkipListInner {
                arena: Vec::new(),
                free: Vec::new(),
                head: [NIL; MAX_LEVEL],
                level: 1,
                len: 0,
            }),
        }
    }

    fn random_level() -> usize {
        let mut rng = rand::rng();
        let mut level = 1;
        while level < MAX_LEVEL && rng.random::<f64>() < PROMOTE_P {
            level += 1;
        }
        level
    }

    /// Inserts or overwrites. Returns `true` when the key was new.
    pub fn insert(&self, key: u64, value: V) -> bool {
        let mut inner = self.inner.write().expect("skiplist lock poisoned");

        // Collect the predecessor at each level while descending.
        let mut update = [NIL; MAX_LEVEL];
        let mut current = NIL;
        for lvl in (0..inner.level).rev() {
            let mut next = match current {
                NIL => inner.head[lvl],
                idx => inner.arena[idx].forward[lvl],
            };
            while next != NIL && inner.arena[next].key < key {
                current = next;
                next = inner.arena[next].forward[lvl];
            }
            update[lvl] = current;
        }

        let candidate = match update[0] {
            NIL => inner.head[0],
            idx => inner.arena[idx].forward[0],
        };
        if candidate != NIL && inner.arena[candidate].key == key {
            inner.arena[candidate].value = Some(value);
            return false;
        }

        let height = Self::random_level();
        if height > inner.level {
            inner.level = height;
        }

        let node = Node {
            key,
            value: Some(value),
            forward: vec![NIL; height],
        };
        let new_idx = match inner.free.pop() {
            Some(slot) => {
                inner.arena[slot] = node;
                slot
            }
            None => {
                inner.arena.push(node);
                inner.arena.len() - 1
            }
        };

        for lvl in 0..height {
            let pred = update[lvl];
            let succ = match pred {
                NIL => inner.head[lvl],
                idx => inner.arena[idx].forward[lvl],
            };
            inner.arena[new_idx].forward[lvl] = succ;
            match pred {
                NIL => inner.head[lvl] = new_idx,
                idx => inner.arena[idx].forward[lvl] = new_idx,
            }
        }

        inner.len += 1;
        true
    }

    /// Exact lookup.
    pub fn search(&self, key: u64) -> Option<V> {
        let inner = self.inner.read().expect("skiplist lock poisoned");
        let mut current = NIL;
        for lvl in (0..inner.level).rev() {
            let mut next = match current {
                NIL => inner.head[lvl],
                idx => inner.arena[idx].forward[lvl],
            };
            while next != NIL && inner.arena[next].key < key {
                current = next;
                next = inner.arena[next].forward[lvl];
            }
        }
        let candidate = match current {
            NIL => inner.head[0],
            idx => inner.arena[idx].forward[0],
        };
        if candidate != NIL && inner.arena[candidate].key == key {
            inner.arena[candidate].value.clone()
        } else {
            None
        }
    }

    /// Removes the key. Returns `true` when it was present.
    pub fn delete(&self, key: u64) -> bool {
        let mut inner = self.inner.write().expect("skiplist lock poisoned");

        let mut update = [NIL; MAX_LEVEL];
        let mut current = NIL;
        for lvl in (0..inner.level).rev() {
            let mut next = match current {
                NIL => inner.head[lvl],
                idx => inner.arena[idx].forward[lvl],
            };
            while next != NIL && inner.arena[next].key < key {
                current = next;
                next = inner.arena[next].forward[lvl];
            }
            update[lvl] = current;
        }

        let target = match update[0] {
            NIL => inner.head[0],
            idx => inner.arena[idx].forward[0],
        };
        if target == NIL || inner.arena[target].key != key {
            return false;
        }

        let height = inner.arena[target].forward.len();
        for lvl in 0..height {
            let succ = inner.arena[target].forward[lvl];
            match update[lvl] {
                NIL => inner.head[lvl] = succ,
                idx => inner.arena[idx].forward[lvl] = succ,
            }
        }

        inner.arena[target].value = None;
        inner.arena[target].forward.clear();
        inner.free.push(target);
        inner.len -= 1;

        while inner.level > 1 && inner.head[inner.level - 1] == NIL {
            inner.level -= 1;
        }
        true
    }

    /// Ordered `(key, value)` pairs with `lo <= key <= hi`.
    pub fn range(&self, lo: u64, hi: u64) -> Vec<(u64, V)> {
        let inner = self.inner.read().expect("skiplist lock poisoned");
        let mut out = Vec::new();
        let mut idx = inner.head[0];
        while idx != NIL {
            let node = &inner.arena[idx];
            if node.key > hi {
                break;
            }
            if node.key >= lo
                && let Some(value) = &node.value
            {
                out.push((node.key, value.clone()));
            }
            idx = node.forward[0];
        }
        out
    }

    /// All entries in key order.
    pub fn items(&self) -> Vec<(u64, V)> {
        self.range(0, u64::MAX)
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("skiplist lock poisoned").len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write().expect("skiplist lock poisoned");
        inner.arena.clear();
        inner.free.clear();
        inner.head = [NIL; MAX_LEVEL];
        inner.level = 1;
        inner.len = 0;
    }
}
