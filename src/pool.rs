// src/pool.rs
//! Free-slot bookkeeping for the decal atlas grid.

use crate::atlas::SlotIndex;

/// Fixed-capacity pool of atlas slot indices.
///
/// Free slots sit on a LIFO stack; no ordering guarantee is part of the
/// contract. The pool tracks membership so a double release can never
/// duplicate an index.
#[derive(Debug, Default)]
pub struct SlotPool {
    free: Vec<SlotIndex>,
    is_free: Vec<bool>,
}

impl SlotPool {
    pub fn new(capacity: usize) -> Self {
        let mut pool = Self::default();
        pool.resize(capacity);
        pool
    }

    /// Remove and return an arbitrary free slot.
    pub fn acquire_free(&mut self) -> Option<SlotIndex> {
        let index = self.free.pop()?;
        self.is_free[index] = false;
        Some(index)
    }

    /// Return a slot to the free set. Logs and ignores a slot that is out of
    /// range or already free.
    pub fn release(&mut self, index: SlotIndex) {
        match self.is_free.get(index).copied() {
            None => {
                log::error!("slot {index} released out of range (capacity {})", self.capacity());
            }
            Some(true) => {
                log::error!("slot {index} released twice");
            }
            Some(false) => {
                self.is_free[index] = true;
                self.free.push(index);
            }
        }
    }

    /// Rebuild the free set for a new capacity. Only valid inside a
    /// coordinated capacity change, after every lease has been revoked.
    pub fn resize(&mut self, new_capacity: usize) {
        self.free.clear();
        self.free.extend(0..new_capacity);
        self.is_free.clear();
        self.is_free.resize(new_capacity, true);
    }

    pub fn capacity(&self) -> usize {
        self.is_free.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}
