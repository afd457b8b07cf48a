//! Unbounded FIFO shared between producers and a single consumer worker.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

pub struct CommandQueue<T> {
    inner: Mutex<VecDeque<T>>,
}

impl<T> Default for CommandQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CommandQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn enqueue(&self, item: T) {
        self.lock().push_back(item);
    }

    pub fn dequeue(&self) -> Option<T> {
        self.lock().pop_front()
    }

    /// Remove the first entry matching `pred`.
    pub fn remove_first(&self, pred: impl Fn(&T) -> bool) -> Option<T> {
        let mut q = self.lock();
        let pos = q.iter().position(pred)?;
        q.remove(pos)
    }

    /// Take everything out, oldest first.
    pub fn flush(&self) -> Vec<T> {
        self.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
