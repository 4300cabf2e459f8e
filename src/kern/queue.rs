//! Thread queues
//!
//! FIFO queues of thread ids, used for the per-priority run queues and for
//! the dead queue. Tail-insert, head-remove; membership is by id, so a move
//! between queues never allocates a node.

use alloc::collections::VecDeque;

use crate::types::ThreadId;

/// FIFO queue of threads.
#[derive(Debug, Default)]
pub struct ThreadQueue {
    threads: VecDeque<ThreadId>,
}

impl ThreadQueue {
    pub const fn new() -> Self {
        Self {
            threads: VecDeque::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    /// Insert at the tail.
    pub fn enqueue(&mut self, id: ThreadId) {
        self.threads.push_back(id);
    }

    /// Remove from the head.
    pub fn dequeue(&mut self) -> Option<ThreadId> {
        self.threads.pop_front()
    }

    /// Peek at the head without removing.
    pub fn peek(&self) -> Option<ThreadId> {
        self.threads.front().copied()
    }

    /// Remove a specific thread wherever it sits in the queue.
    pub fn remove(&mut self, id: ThreadId) -> bool {
        if let Some(pos) = self.threads.iter().position(|&t| t == id) {
            self.threads.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, id: ThreadId) -> bool {
        self.threads.iter().any(|&t| t == id)
    }
}
