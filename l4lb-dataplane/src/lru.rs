//! Fixed-capacity LRU map backed by an index-linked arena.
//!
//! All storage is reserved up front; once full, an insert recycles the
//! least recently used slot instead of allocating.

use ahash::{HashMap, HashMapExt};
use std::hash::Hash;

const NIL: u32 = u32::MAX;

struct Node<K, V> {
    key: K,
    value: V,
    prev: u32,
    next: u32,
}

pub struct LruCache<K, V> {
    index: HashMap<K, u32>,
    nodes: Vec<Node<K, V>>,
    /// Most recently used.
    head: u32,
    /// Least recently used.
    tail: u32,
    capacity: usize,
}

impl<K: Hash + Eq + Copy, V> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(NIL as usize);
        LruCache {
            index: HashMap::with_capacity(capacity),
            nodes: Vec::with_capacity(capacity),
            head: NIL,
            tail: NIL,
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Looks `key` up and marks it most recently used.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let idx = *self.index.get(key)?;
        self.touch(idx);
        Some(&mut self.nodes[idx as usize].value)
    }

    /// Looks `key` up without touching recency.
    pub fn peek(&self, key: &K) -> Option<&V> {
        let idx = *self.index.get(key)?;
        Some(&self.nodes[idx as usize].value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Inserts or overwrites, evicting the least recently used entry when
    /// full. Returns the evicted key.
    pub fn insert(&mut self, key: K, value: V) -> Option<K> {
        if self.capacity == 0 {
            return None;
        }
        if let Some(&idx) = self.index.get(&key) {
            self.nodes[idx as usize].value = value;
            self.touch(idx);
            return None;
        }

        if self.nodes.len() < self.capacity {
            let idx = self.nodes.len() as u32;
            self.nodes.push(Node {
                key,
                value,
                prev: NIL,
                next: NIL,
            });
            self.push_front(idx);
            self.index.insert(key, idx);
            return None;
        }

        let idx = self.tail;
        self.unlink(idx);
        let node = &mut self.nodes[idx as usize];
        let evicted = std::mem::replace(&mut node.key, key);
        node.value = value;
        self.index.remove(&evicted);
        self.index.insert(key, idx);
        self.push_front(idx);
        Some(evicted)
    }

    fn touch(&mut self, idx: u32) {
        if self.head != idx {
            self.unlink(idx);
            self.push_front(idx);
        }
    }

    fn unlink(&mut self, idx: u32) {
        let (prev, next) = {
            let node = &self.nodes[idx as usize];
            (node.prev, node.next)
        };
        if prev == NIL {
            self.head = next;
        } else {
            self.nodes[prev as usize].next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.nodes[next as usize].prev = prev;
        }
    }

    fn push_front(&mut self, idx: u32) {
        let old_head = self.head;
        {
            let node = &mut self.nodes[idx as usize];
            node.prev = NIL;
            node.next = old_head;
        }
        if old_head != NIL {
            self.nodes[old_head as usize].prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }
}
