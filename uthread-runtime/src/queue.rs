//! # Ordered Container
//!
//! FIFO queue used as the semaphore wait list and as the TPS registry store.
//!
//! Growth goes through `try_reserve`, so running out of memory surfaces as a
//! [`QueueError`] that callers report as resource exhaustion instead of
//! aborting the process.

use std::collections::vec_deque::{self, VecDeque};
use std::collections::TryReserveError;
use std::fmt;

use thiserror::Error;

use crate::error::ErrorKind;

/// Error raised when a queue cannot grow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// Storage for another entry could not be obtained.
    #[error("queue storage exhausted: {0}")]
    OutOfMemory(#[from] TryReserveError),
}

impl QueueError {
    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::ResourceExhaustion
    }
}

/// A first-in first-out queue.
pub struct Queue<T> {
    items: VecDeque<T>,
}

impl<T> Queue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }

    /// Create an empty queue with room for `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Result<Self, QueueError> {
        let mut items = VecDeque::new();
        items.try_reserve(capacity)?;
        Ok(Self { items })
    }

    /// Destroy the queue.
    ///
    /// Fails, handing the queue back, if it still holds entries.
    pub fn destroy(self) -> Result<(), Self> {
        if self.items.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }

    /// Append an entry at the back.
    pub fn enqueue(&mut self, item: T) -> Result<(), QueueError> {
        self.items.try_reserve(1)?;
        self.items.push_back(item);
        Ok(())
    }

    /// Remove and return the oldest entry.
    pub fn dequeue(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the queue holds no entries.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Remove and return the first entry matching `pred`.
    pub fn delete<F>(&mut self, pred: F) -> Option<T>
    where
        F: FnMut(&T) -> bool,
    {
        let index = self.items.iter().position(pred)?;
        self.items.remove(index)
    }

    /// Find the first entry matching `pred`.
    pub fn find<F>(&self, mut pred: F) -> Option<&T>
    where
        F: FnMut(&T) -> bool,
    {
        self.items.iter().find(|item| pred(item))
    }

    /// Find the first entry matching `pred`, mutably.
    pub fn find_mut<F>(&mut self, mut pred: F) -> Option<&mut T>
    where
        F: FnMut(&T) -> bool,
    {
        self.items.iter_mut().find(|item| pred(item))
    }

    /// Iterate over the entries, oldest first.
    pub fn iter(&self) -> vec_deque::Iter<'_, T> {
        self.items.iter()
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.items.iter()).finish()
    }
}

impl<'a, T> IntoIterator for &'a Queue<T> {
    type Item = &'a T;
    type IntoIter = vec_deque::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}
