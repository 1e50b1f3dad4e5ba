//! FIFO work queue feeding the rules and alerts workers.
//!
//! Items that failed processing can be put back with [`WorkQueue::requeue`]; they
//! reappear after a per-item exponential backoff. Once the queue is shut down the
//! remaining items are still handed out, then [`WorkQueue::get`] returns `None`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1000);

/// An item taken from the queue, with the number of times it was requeued.
#[derive(Debug, Clone, PartialEq)]
pub struct Queued<T> {
    pub item: T,
    attempts: u32,
}

impl<T> Queued<T> {
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[derive(Debug)]
struct State<T> {
    items: VecDeque<Queued<T>>,
    shut_down: bool,
}

#[derive(Debug)]
struct Inner<T> {
    state: Mutex<State<T>>,
    notify: Notify,
}

/// Cloneable handle to a shared queue.
#[derive(Debug)]
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkQueue<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    items: VecDeque::new(),
                    shut_down: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Append an item. Returns `false`, dropping the item, if the queue is shut down.
    pub fn add(&self, item: T) -> bool {
        self.push(Queued { item, attempts: 0 })
    }

    /// Wait for the next item. Returns `None` once the queue is shut down and empty.
    pub async fn get(&self) -> Option<Queued<T>> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(queued) = state.items.pop_front() {
                    return Some(queued);
                }
                if state.shut_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Stop accepting items and wake up every waiting consumer.
    pub fn shut_down(&self) {
        self.lock().shut_down = true;
        self.inner.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.lock().shut_down
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, queued: Queued<T>) -> bool {
        {
            let mut state = self.lock();
            if state.shut_down {
                return false;
            }
            state.items.push_back(queued);
        }
        self.inner.notify.notify_one();
        true
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Send + 'static> WorkQueue<T> {
    /// Put back an item whose processing failed, after its backoff delay.
    pub fn requeue(&self, mut queued: Queued<T>) {
        if self.is_shut_down() {
            warn!(attempts = queued.attempts, "Queue is shut down, dropping requeued item");
            return;
        }

        let delay = backoff(queued.attempts);
        queued.attempts = queued.attempts.saturating_add(1);
        debug!(attempts = queued.attempts, delay_ms = delay.as_millis(), "Requeuing item");

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !queue.push(queued) {
                warn!("Queue was shut down while waiting to requeue, dropping item");
            }
        });
    }
}

/// Delay before the item with the given number of previous attempts comes back.
#[must_use]
pub fn backoff(attempts: u32) -> Duration {
    let factor = 1u32.checked_shl(attempts).unwrap_or(u32::MAX);
    BASE_DELAY.saturating_mul(factor).min(MAX_DELAY)
}
