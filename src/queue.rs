//! Strict-priority dispatch queue
//!
//! Four FIFO rings, one per [`Priority`] class, behind a single mutex. The
//! dispatch loop waits on [`next`](PriorityQueue::next), which pops the
//! highest-priority non-empty ring; entries within a class leave in arrival
//! order. `Notify`'s stored-permit semantics make the pop/wait handoff
//! race-free with a single consumer.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::request::{Priority, PRIORITY_LEVELS};

pub(crate) struct PriorityQueue<T> {
    rings: Mutex<[VecDeque<T>; PRIORITY_LEVELS]>,
    notify: Notify,
}

impl<T> PriorityQueue<T> {
    pub fn new() -> Self {
        Self {
            rings: Mutex::new(std::array::from_fn(|_| VecDeque::new())),
            notify: Notify::new(),
        }
    }

    /// Append an item to its priority class
    pub fn push(&self, item: T, priority: Priority) {
        self.rings.lock()[priority.index()].push_back(item);
        self.notify.notify_one();
    }

    /// Pop the next item in strict priority order, FIFO within a class
    pub fn pop(&self) -> Option<T> {
        let mut rings = self.rings.lock();
        rings.iter_mut().find_map(VecDeque::pop_front)
    }

    /// Total number of queued items across all classes
    pub fn len(&self) -> usize {
        self.rings.lock().iter().map(VecDeque::len).sum()
    }

    /// Whether every class is empty
    pub fn is_empty(&self) -> bool {
        self.rings.lock().iter().all(VecDeque::is_empty)
    }

    /// Wait until an item is available and pop it
    pub async fn next(&self) -> T {
        loop {
            if let Some(item) = self.pop() {
                return item;
            }
            self.notify.notified().await;
        }
    }
}
