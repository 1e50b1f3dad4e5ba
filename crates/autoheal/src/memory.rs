//! Expiring memory of recently executed actions.
//!
//! The dispatch engine remembers every action it runs for the throttling interval, and
//! refuses to run an equal action again while it is remembered. Cells are kept
//! oldest-first so purging only needs to look at the front.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct Cell<T> {
    item: T,
    stamp: Instant,
}

/// Set of items that are forgotten `duration` after they were last added.
#[derive(Debug)]
pub struct ExpiringMemory<T> {
    duration: Duration,
    cells: Mutex<VecDeque<Cell<T>>>,
}

impl<T: PartialEq> ExpiringMemory<T> {
    /// Create a memory that keeps items for `duration`. A zero duration disables it.
    #[must_use]
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            cells: Mutex::new(VecDeque::new()),
        }
    }

    /// Remember `item`, or refresh it if an equal item is already remembered.
    pub fn add(&self, item: T) {
        let now = Instant::now();
        let mut cells = self.lock();
        self.purge(&mut cells, now);

        if let Some(index) = cells.iter().position(|cell| cell.item == item) {
            if let Some(mut cell) = cells.remove(index) {
                cell.stamp = now;
                cells.push_back(cell);
            }
            return;
        }
        cells.push_back(Cell { item, stamp: now });
    }

    /// Check whether an item equal to `item` is remembered.
    pub fn has(&self, item: &T) -> bool {
        if self.duration.is_zero() {
            return false;
        }
        let mut cells = self.lock();
        self.purge(&mut cells, Instant::now());
        cells.iter().any(|cell| cell.item == *item)
    }

    /// Number of live items.
    pub fn len(&self) -> usize {
        let mut cells = self.lock();
        self.purge(&mut cells, Instant::now());
        cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget the expired items.
    pub fn clean(&self) {
        let mut cells = self.lock();
        self.purge(&mut cells, Instant::now());
    }

    fn purge(&self, cells: &mut VecDeque<Cell<T>>, now: Instant) {
        while let Some(front) = cells.front() {
            if now.duration_since(front.stamp) < self.duration {
                break;
            }
            cells.pop_front();
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Cell<T>>> {
        self.cells.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
