//! Bounded slot arenas and id pools backing the stable handles.

use std::collections::BTreeSet;

/// Slot arena: removed entries leave a hole that is reused by the next
/// insert, so indices stay stable for the life of an entry.
#[derive(Debug, Clone)]
pub struct Arena<T> {
    slots: Vec<Option<T>>,
    free: BTreeSet<usize>,
    limit: usize,
}

impl<T> Arena<T> {
    pub fn new(limit: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: BTreeSet::new(),
            limit,
        }
    }

    /// Insert the value built from its index, or `None` at the limit.
    pub fn insert_with(&mut self, build: impl FnOnce(usize) -> T) -> Option<usize> {
        let idx = match self.free.pop_first() {
            Some(idx) => idx,
            None if self.slots.len() < self.limit => {
                self.slots.push(None);
                self.slots.len() - 1
            }
            None => return None,
        };
        self.slots[idx] = Some(build(idx));
        Some(idx)
    }

    pub fn get(&self, idx: usize) -> Option<&T> {
        self.slots.get(idx).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut T> {
        self.slots.get_mut(idx).and_then(Option::as_mut)
    }

    pub fn remove(&mut self, idx: usize) -> Option<T> {
        let value = self.slots.get_mut(idx)?.take()?;
        self.free.insert(idx);
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|v| (i, v)))
    }
}

/// Pool of small integer ids, lowest free id first.
#[derive(Debug, Clone)]
pub struct IdPool {
    free: BTreeSet<u32>,
    next: u32,
    limit: u32,
}

impl IdPool {
    pub fn new(limit: u32) -> Self {
        Self {
            free: BTreeSet::new(),
            next: 0,
            limit,
        }
    }

    pub fn alloc(&mut self) -> Option<u32> {
        if let Some(id) = self.free.pop_first() {
            return Some(id);
        }
        if self.next >= self.limit {
            return None;
        }
        self.next += 1;
        Some(self.next - 1)
    }

    pub fn release(&mut self, id: u32) {
        if id < self.next {
            self.free.insert(id);
        }
    }
}
