//! Inbox / Outbox queues between background I/O and the host tick.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

/// Unbounded FIFO usable from any number of producers and consumers
#[derive(Debug)]
pub struct MessageQueue<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T> MessageQueue<T> {
    pub fn new() -> Self {
        MessageQueue {
            items: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, item: T) {
        self.lock().push_back(item);
    }

    pub fn pop(&self) -> Option<T> {
        self.lock().pop_front()
    }

    /// Take everything queued right now; later pushes stay for the next drain
    pub fn drain(&self) -> Vec<T> {
        std::mem::take(&mut *self.lock()).into()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T> Default for MessageQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo() {
        let queue = MessageQueue::new();
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.drain(), vec![2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_is_a_snapshot() {
        let queue = MessageQueue::new();
        queue.push("a");
        let drained = queue.drain();
        queue.push("b");
        assert_eq!(drained, vec!["a"]);
        assert_eq!(queue.pop(), Some("b"));
    }

    #[test]
    fn test_many_producers() {
        let queue = Arc::new(MessageQueue::new());
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for i in 0..250 {
                        queue.push(p * 1000 + i);
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        let mut items = queue.drain();
        assert_eq!(items.len(), 1000);
        items.sort_unstable();
        items.dedup();
        assert_eq!(items.len(), 1000);
    }
}
