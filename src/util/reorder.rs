//! Serial-keyed reorder window.
//!
//! Both ends of a tunnel race two HTTP requests, so items numbered by a
//! contiguous serial may arrive out of order. [`Reorder`] holds early items
//! until their predecessors show up and releases runs in serial order.

use std::collections::BTreeMap;

/// Why an item could not be placed in the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReorderError {
    /// The serial was already released or is already buffered.
    Duplicate { serial: u64, next: u64 },
    /// The serial is beyond the window.
    TooFarAhead { serial: u64, next: u64 },
}

#[derive(Debug)]
pub(crate) struct Reorder<T> {
    next: u64,
    window: u64,
    pending: BTreeMap<u64, T>,
}

impl<T> Reorder<T> {
    /// Creates a window expecting `first` and accepting serials up to
    /// `window - 1` ahead of the next expected one.
    pub(crate) fn new(first: u64, window: u64) -> Self {
        Self {
            next: first,
            window: window.max(1),
            pending: BTreeMap::new(),
        }
    }

    /// The serial that will be released next.
    pub(crate) fn next(&self) -> u64 {
        self.next
    }

    /// Number of early items waiting for a predecessor.
    pub(crate) fn backlog(&self) -> usize {
        self.pending.len()
    }

    /// Inserts an item and returns every item that is now in order.
    pub(crate) fn push(&mut self, serial: u64, item: T) -> Result<Vec<T>, ReorderError> {
        let next = self.next;
        if serial < next || self.pending.contains_key(&serial) {
            return Err(ReorderError::Duplicate { serial, next });
        }
        if serial - next >= self.window {
            return Err(ReorderError::TooFarAhead { serial, next });
        }
        self.pending.insert(serial, item);
        let mut ready = Vec::new();
        while let Some(item) = self.pending.remove(&self.next) {
            ready.push(item);
            self.next += 1;
        }
        Ok(ready)
    }

    /// Drops all buffered items.
    pub(crate) fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        std::mem::take(&mut self.pending).into_values()
    }
}
