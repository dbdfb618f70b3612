// src/dispatch/queue.rs

//! Priority queue of pending work items.
//!
//! [`PendingQueue`] is a plain, synchronous heap ordered by priority
//! (ascending, 1 is most urgent) and then by enqueue sequence (ascending,
//! strict FIFO within a tier). [`CommandQueue`] wraps it in a mutex and pairs
//! it with a counting semaphore holding one permit per queued item, which is
//! what wakes idle workers.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Mutex;

use tokio::sync::Semaphore;

use crate::dispatch::lock;

/// A queued payload together with its ordering key.
#[derive(Debug)]
pub struct QueueEntry<T> {
    pub priority: u8,
    pub sequence: u64,
    pub payload: T,
}

impl<T> PartialEq for QueueEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl<T> Eq for QueueEntry<T> {}

impl<T> PartialOrd for QueueEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for QueueEntry<T> {
    // BinaryHeap is a max-heap: the "greatest" entry is the lowest priority
    // number, then the lowest sequence.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Synchronous priority + FIFO queue.
#[derive(Debug)]
pub struct PendingQueue<T> {
    heap: BinaryHeap<QueueEntry<T>>,
}

impl<T> Default for PendingQueue<T> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
        }
    }
}

impl<T> PendingQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, priority: u8, sequence: u64, payload: T) {
        self.heap.push(QueueEntry {
            priority,
            sequence,
            payload,
        });
    }

    /// Remove the most urgent, oldest entry.
    pub fn pop(&mut self) -> Option<QueueEntry<T>> {
        self.heap.pop()
    }

    pub fn peek(&self) -> Option<&QueueEntry<T>> {
        self.heap.peek()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Remove every entry, in dispatch order.
    pub fn drain_ordered(&mut self) -> Vec<QueueEntry<T>> {
        let mut out = Vec::with_capacity(self.heap.len());
        while let Some(entry) = self.heap.pop() {
            out.push(entry);
        }
        out
    }
}

/// Shared queue used by the dispatcher and its workers.
#[derive(Debug)]
pub struct CommandQueue<T> {
    pending: Mutex<PendingQueue<T>>,
    permits: Semaphore,
}

impl<T> Default for CommandQueue<T> {
    fn default() -> Self {
        Self {
            pending: Mutex::new(PendingQueue::new()),
            permits: Semaphore::new(0),
        }
    }
}

impl<T> CommandQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an item and release exactly one scheduling permit.
    pub fn push(&self, priority: u8, sequence: u64, payload: T) {
        lock(&self.pending).push(priority, sequence, payload);
        self.permits.add_permits(1);
    }

    /// Wait for one scheduling permit.
    ///
    /// Returns `false` once the queue has been closed.
    pub async fn acquire(&self) -> bool {
        match self.permits.acquire().await {
            Ok(permit) => {
                // One permit is consumed per dequeued item; it is never
                // handed back.
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    pub fn pop(&self) -> Option<QueueEntry<T>> {
        lock(&self.pending).pop()
    }

    pub fn len(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.pending).is_empty()
    }

    /// Close the permit semaphore and hand back whatever is still queued.
    pub fn close(&self) -> Vec<QueueEntry<T>> {
        self.permits.close();
        lock(&self.pending).drain_ordered()
    }
}
