//! Bounded lock-free FIFO used between pipeline stages.
//!
//! Every queue in the pipeline has a single producer and a single
//! consumer; pushes never block (the producer goes idle instead) and pops
//! never block (the consumer goes idle instead).

use crossbeam_queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};

/// Bounded FIFO with occupancy and traffic counters.
pub struct Fifo<T> {
    queue: ArrayQueue<T>,
    pushed: AtomicU64,
    popped: AtomicU64,
}

impl<T> Fifo<T> {
    /// Creates a FIFO with the given capacity (at least 1 slot).
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            pushed: AtomicU64::new(0),
            popped: AtomicU64::new(0),
        }
    }

    /// Non-blocking push; gives the value back when full.
    pub fn push(&self, value: T) -> Result<(), T> {
        match self.queue.push(value) {
            Ok(()) => {
                self.pushed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(v) => Err(v),
        }
    }

    /// Non-blocking pop.
    pub fn pop(&self) -> Option<T> {
        let v = self.queue.pop();
        if v.is_some() {
            self.popped.fetch_add(1, Ordering::Relaxed);
        }
        v
    }

    pub fn is_full(&self) -> bool {
        self.queue.is_full()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn free_slots(&self) -> usize {
        self.queue.capacity() - self.queue.len()
    }

    /// Total values pushed since creation.
    pub fn total_in(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    /// Total values popped since creation.
    pub fn total_out(&self) -> u64 {
        self.popped.load(Ordering::Relaxed)
    }

    /// Drops everything currently queued.
    pub fn clear(&self) {
        while self.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let f = Fifo::new(4);
        for i in 0..4 {
            f.push(i).unwrap();
        }
        assert!(f.is_full());
        assert_eq!(f.push(99), Err(99));
        for i in 0..4 {
            assert_eq!(f.pop(), Some(i));
        }
        assert_eq!(f.pop(), None);
        assert_eq!(f.total_in(), 4);
        assert_eq!(f.total_out(), 4);
    }

    #[test]
    fn occupancy() {
        let f = Fifo::new(8);
        f.push(1u32).unwrap();
        f.push(2).unwrap();
        assert_eq!(f.len(), 2);
        assert_eq!(f.free_slots(), 6);
        f.clear();
        assert!(f.is_empty());
    }

    #[test]
    fn cross_thread_order() {
        use std::sync::Arc;
        let f = Arc::new(Fifo::new(16));
        let producer = {
            let f = f.clone();
            std::thread::spawn(move || {
                for i in 0..1000u32 {
                    loop {
                        if f.push(i).is_ok() {
                            break;
                        }
                        std::thread::yield_now();
                    }
                }
            })
        };
        let mut expected = 0u32;
        while expected < 1000 {
            if let Some(v) = f.pop() {
                assert_eq!(v, expected);
                expected += 1;
            } else {
                std::thread::yield_now();
            }
        }
        producer.join().unwrap();
    }
}
