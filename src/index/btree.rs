//! Order-100 B-tree keyed by column values, payload one row-id list per key.
//!
//! Equal keys coalesce into the same list. Deletion removes row ids from a
//! key's list and leaves an exhausted key in place as an empty entry; lookups
//! and traversals skip empty entries, so no rebalancing is needed.

use std::cmp::Ordering;

use crate::schema::Value;

/// Minimum degree; a node holds at most `2 * ORDER - 1` keys.
const ORDER: usize = 100;
const MAX_KEYS: usize = 2 * ORDER - 1;

#[derive(Debug)]
struct Node {
    keys: Vec<Value>,
    payloads: Vec<Vec<u64>>,
    children: Vec<Box<Node>>,
    is_leaf: bool,
}

impl Node {
    fn new(is_leaf: bool) -> Self {
        Self {
            keys: Vec::new(),
            payloads: Vec::new(),
            children: Vec::new(),
            is_leaf,
        }
    }

    fn is_full(&self) -> bool {
        self.keys.len() >= MAX_KEYS
    }
}

/// Ordered column index with point and range search.
#[derive(Debug)]
pub struct BTreeIndex {
    name: String,
    root: Box<Node>,
    live_keys: usize,
}

impl BTreeIndex {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            root: Box::new(Node::new(true)),
            live_keys: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a `(value, row_id)` pair; equal values share one list.
    pub fn insert(&mut self, key: Value, row_id: u64) {
        if self.root.is_full() {
            let mut new_root = Box::new(Node::new(false));
            std::mem::swap(&mut self.root, &mut new_root);
            // `new_root` now holds the old root as the only child.
            self.root.children.push(new_root);
            Self::split_child(&mut self.root, 0);
        }
        if Self::insert_non_full(&mut self.root, key, row_id) {
            self.live_keys += 1;
        }
    }

    /// Returns `true` when a brand-new key was created.
    fn insert_non_full(node: &mut Node, key: Value, row_id: u64) -> bool {
        match node.keys.binary_search_by(|probe| probe.cmp_total(&key)) {
            Ok(position) => {
                let payload = &mut node.payloads[position];
                let was_empty = payload.is_empty();
                if !payload.contains(&row_id) {
                    payload.push(row_id);
                }
                was_empty
            }
            Err(position) => {
                if node.is_leaf {
                    node.keys.insert(position, key);
                    node.payloads.insert(position, vec![row_id]);
                    true
                } else {
                    let mut position = position;
                    if node.children[position].is_full() {
                        Self::split_child(node, position);
                        match node.keys[position].cmp_total(&key) {
                            Ordering::Less => position += 1,
                            Ordering::Equal => {
                                let payload = &mut node.payloads[position];
                                let was_empty = payload.is_empty();
                                if !payload.contains(&row_id) {
                                    payload.push(row_id);
                                }
                                return was_empty;
                            }
                            Ordering::Greater => {}
                        }
                    }
                    Self::insert_non_full(&mut node.children[position], key, row_id)
                }
            }
        }
    }

    /// Splits the full child at `index`, hoisting its median into `parent`.
    fn split_child(parent: &mut Node, index: usize) {
        let child = &mut parent.children[index];
        let mut right = Box::new(Node::new(child.is_leaf));

        let mid = ORDER - 1;
        right.keys = child.keys.split_off(mid + 1);
        right.payloads = child.payloads.split_off(mid + 1);
        let median_key = child.keys.pop().expect("full node has a median");
        let median_payload = child.payloads.pop().expect("full node has a median");
        if !child.is_leaf {
            right.children = child.children.split_off(mid + 1);
        }

        parent.keys.insert(index, median_key);
        parent.payloads.insert(index, median_payload);
        parent.children.insert(index + 1, right);
    }

    /// Row ids for an exact key; empty when absent.
    pub fn search(&self, key: &Value) -> Vec<u64> {
        let mut node = &self.root;
        loop {
            match node.keys.binary_search_by(|probe| probe.cmp_total(key)) {
                Ok(position) => return node.payloads[position].clone(),
                Err(position) => {
                    if node.is_leaf {
                        return Vec::new();
                    }
                    node = &node.children[position];
                }
            }
        }
    }

    /// Row ids for keys in the given bounds, in key order.
    pub fn search_range(
        &self,
        lo: Option<&Value>,
        hi: Option<&Value>,
        include_lo: bool,
        include_hi: bool,
    ) -> Vec<u64> {
        let mut out = Vec::new();
        Self::collect_range(&self.root, lo, hi, include_lo, include_hi, &mut out);
        out
    }

    fn in_bounds(
        key: &Value,
        lo: Option<&Value>,
        hi: Option<&Value>,
        include_lo: bool,
        include_hi: bool,
    ) -> bool {
        if let Some(lo) = lo {
            match key.cmp_total(lo) {
                Ordering::Less => return false,
                Ordering::Equal if !include_lo => return false,
                _ => {}
            }
        }
        if let Some(hi) = hi {
            match key.cmp_total(hi) {
                Ordering::Greater => return false,
                Ordering::Equal if !include_hi => return false,
                _ => {}
            }
        }
        true
    }

    fn collect_range(
        node: &Node,
        lo: Option<&Value>,
        hi: Option<&Value>,
        include_lo: bool,
        include_hi: bool,
        out: &mut Vec<u64>,
    ) {
        for position in 0..node.keys.len() {
            if !node.is_leaf {
                Self::collect_range(&node.children[position], lo, hi, include_lo, include_hi, out);
            }
            let key = &node.keys[position];
            if Self::in_bounds(key, lo, hi, include_lo, include_hi) {
                out.extend_from_slice(&node.payloads[position]);
            }
        }
        if !node.is_leaf
            && let Some(last) = node.children.last()
        {
            Self::collect_range(last, lo, hi, include_lo, include_hi, out);
        }
    }

    /// Removes one row id for the key, or the whole key when `row_id` is
    /// `None`. Exhausted keys stay in place as empty entries.
    pub fn delete(&mut self, key: &Value, row_id: Option<u64>) {
        let mut node = &mut self.root;
        loop {
            match node.keys.binary_search_by(|probe| probe.cmp_total(key)) {
                Ok(position) => {
                    let payload = &mut node.payloads[position];
                    if payload.is_empty() {
                        return;
                    }
                    match row_id {
                        Some(row_id) => payload.retain(|id| *id != row_id),
                        None => payload.clear(),
                    }
                    if payload.is_empty() {
                        self.live_keys -= 1;
                    }
                    return;
                }
                Err(position) => {
                    if node.is_leaf {
                        return;
                    }
                    node = &mut node.children[position];
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.root = Box::new(Node::new(true));
        self.live_keys = 0;
    }

    /// Number of keys with at least one row id.
    pub fn len(&self) -> usize {
        self.live_keys
    }

    pub fn is_empty(&self) -> bool {
        self.live_keys == 0
    }

    /// Every live `(key, row_ids)` entry in key order.
    pub fn all_entries(&self) -> Vec<(Value, Vec<u64>)> {
        let mut out = Vec::new();
        Self::collect_entries(&self.root, &mut out);
        out
    }

    fn collect_entries(node: &Node, out: &mut Vec<(Value, Vec<u64>)>) {
        for position in 0..node.keys.len() {
            if !node.is_leaf {
                Self::collect_entries(&node.children[position], out);
            }
            if !node.payloads[position].is_empty() {
                out.push((node.keys[position].clone(), node.payloads[position].clone()));
            }
        }
        if !node.is_leaf
            && let Some(last) = node.children.last()
        {
            Self::collect_entries(last, out);
        }
    }
}
