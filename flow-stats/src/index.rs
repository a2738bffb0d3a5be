// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Slots addressed by small reusable indices. Freed indices are handed out
//! again lowest first.

use std::collections::BTreeSet;

#[derive(Debug)]
pub struct IndexVector<T> {
    slots: Vec<Option<T>>,
    free: BTreeSet<usize>,
}

impl<T> Default for IndexVector<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: BTreeSet::new(),
        }
    }
}

impl<T> IndexVector<T> {
    /// Store `value` in a free slot and return its index
    pub fn allocate(&mut self, value: T) -> usize {
        self.allocate_with(|_| value)
    }

    /// Same as [`IndexVector::allocate`], for values that need their index
    pub fn allocate_with(&mut self, make: impl FnOnce(usize) -> T) -> usize {
        match self.free.pop_first() {
            Some(index) => {
                self.slots[index] = Some(make(index));
                index
            }
            None => {
                let index = self.slots.len();
                self.slots.push(Some(make(index)));
                index
            }
        }
    }

    /// Release the slot at `index`, returning what it held
    pub fn free(&mut self, index: usize) -> Option<T> {
        let value = self.slots.get_mut(index)?.take()?;
        if index + 1 == self.slots.len() {
            self.slots.pop();
            // trailing free slots are dropped rather than kept on the free list
            while let Some(None) = self.slots.last() {
                self.slots.pop();
                self.free.remove(&self.slots.len());
            }
        } else {
            self.free.insert(index);
        }
        Some(value)
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&T> {
        self.slots.get(index)?.as_ref()
    }
    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.slots.get_mut(index)?.as_mut()
    }
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|v| (i, v)))
    }
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_mut().map(|v| (i, v)))
    }
}
