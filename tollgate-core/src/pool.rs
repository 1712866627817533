//! Reusable-object pools.
//!
//! Both pools grow by doubling their capacity on demand, up to an optional
//! hard limit, and never shrink. Neither pool allocates items on the
//! caller's behalf: `pop` on an empty pool returns `None` immediately.

use crate::error::CoreError;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Capacity bookkeeping shared by [`Stack`] and [`Queue`].
#[derive(Debug, Clone, Copy)]
struct Growth {
    capacity: usize,
    limit: Option<usize>,
}

impl Growth {
    fn new(size: usize, limit: Option<usize>) -> Result<Self, CoreError> {
        if let Some(limit) = limit {
            if size > limit {
                return Err(CoreError::InvalidPoolBounds { size, limit });
            }
        }
        let capacity = match limit {
            Some(limit) => size.max(1).min(limit),
            None => size.max(1),
        };
        Ok(Self { capacity, limit })
    }

    /// Makes room for one more item when `len` items are held. Returns the
    /// new capacity, or `None` if the pool is at its hard limit.
    fn admit(&mut self, len: usize) -> Option<usize> {
        if len < self.capacity {
            return Some(self.capacity);
        }
        let max = self.limit.unwrap_or(usize::MAX);
        if self.capacity >= max {
            return None;
        }
        self.capacity = self.capacity.saturating_mul(2).min(max);
        Some(self.capacity)
    }
}

/// A last-in-first-out pool.
#[derive(Debug)]
pub struct Stack<T> {
    inner: Mutex<StackInner<T>>,
}

#[derive(Debug)]
struct StackInner<T> {
    items: Vec<T>,
    growth: Growth,
}

impl<T> Stack<T> {
    /// Creates a stack with initial capacity `size` that may grow up to
    /// `limit` items (`None` = unbounded).
    pub fn new(size: usize, limit: Option<usize>) -> Result<Self, CoreError> {
        let growth = Growth::new(size, limit)?;
        Ok(Self {
            inner: Mutex::new(StackInner {
                items: Vec::with_capacity(growth.capacity),
                growth,
            }),
        })
    }

    /// Creates an unbounded stack.
    pub fn unbounded(size: usize) -> Self {
        let growth = Growth {
            capacity: size.max(1),
            limit: None,
        };
        Self {
            inner: Mutex::new(StackInner {
                items: Vec::with_capacity(growth.capacity),
                growth,
            }),
        }
    }

    /// Returns an item to the pool, or hands it back in `Err` when the pool
    /// is at its hard limit.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut inner = self.inner.lock();
        let len = inner.items.len();
        match inner.growth.admit(len) {
            Some(capacity) => {
                if capacity > inner.items.capacity() {
                    let additional = capacity - len;
                    inner.items.reserve_exact(additional);
                }
                inner.items.push(item);
                Ok(())
            }
            None => Err(item),
        }
    }

    /// Takes the most recently pushed item.
    pub fn pop(&self) -> Option<T> {
        self.inner.lock().items.pop()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Current capacity (grows, never shrinks).
    pub fn capacity(&self) -> usize {
        self.inner.lock().growth.capacity
    }

    pub fn limit(&self) -> Option<usize> {
        self.inner.lock().growth.limit
    }

    /// Drops every pooled item. Capacity is retained.
    pub fn clear(&self) {
        self.inner.lock().items.clear();
    }
}

/// A first-in-first-out pool.
#[derive(Debug)]
pub struct Queue<T> {
    inner: Mutex<QueueInner<T>>,
}

#[derive(Debug)]
struct QueueInner<T> {
    items: VecDeque<T>,
    growth: Growth,
}

impl<T> Queue<T> {
    /// Creates a queue with initial capacity `size` that may grow up to
    /// `limit` items (`None` = unbounded).
    pub fn new(size: usize, limit: Option<usize>) -> Result<Self, CoreError> {
        let growth = Growth::new(size, limit)?;
        Ok(Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::with_capacity(growth.capacity),
                growth,
            }),
        })
    }

    /// Appends an item. Returns it back in `Err` when the pool is full.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut inner = self.inner.lock();
        let len = inner.items.len();
        match inner.growth.admit(len) {
            Some(capacity) => {
                if capacity > inner.items.capacity() {
                    let additional = capacity - len;
                    inner.items.reserve_exact(additional);
                }
                inner.items.push_back(item);
                Ok(())
            }
            None => Err(item),
        }
    }

    /// Takes the oldest item.
    pub fn pop(&self) -> Option<T> {
        self.inner.lock().items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().growth.capacity
    }

    pub fn limit(&self) -> Option<usize> {
        self.inner.lock().growth.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    #[test]
    fn test_stack_growth_and_order() {
        let stack = Stack::new(2, Some(4)).unwrap();
        assert!(stack.push("A").is_ok());
        assert!(stack.push("B").is_ok());
        assert_eq!(stack.capacity(), 2);
        assert!(stack.push("C").is_ok());
        assert_eq!(stack.capacity(), 4);

        assert_eq!(stack.pop(), Some("C"));
        assert_eq!(stack.pop(), Some("B"));
        assert_eq!(stack.pop(), Some("A"));
        assert_eq!(stack.pop(), None);
        assert_eq!(stack.capacity(), 4);
    }

    #[test]
    fn test_stack_push_past_limit_fails() {
        let stack = Stack::new(1, Some(2)).unwrap();
        assert!(stack.push(1).is_ok());
        assert!(stack.push(2).is_ok());
        assert_eq!(stack.push(3), Err(3));
        assert_eq!(stack.len(), 2);
        assert_eq!(stack.pop(), Some(2));
    }

    #[test]
    fn test_queue_order_and_limit() {
        let queue = Queue::new(2, Some(3)).unwrap();
        for i in 0..3 {
            assert!(queue.push(i).is_ok());
        }
        assert_eq!(queue.capacity(), 3);
        assert_eq!(queue.push(99), Err(99));
        assert_eq!(queue.pop(), Some(0));
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_unbounded_stack_grows() {
        let stack = Stack::unbounded(1);
        for i in 0..100 {
            assert!(stack.push(i).is_ok());
        }
        assert!(stack.capacity() >= 100);
        assert_eq!(stack.limit(), None);
        stack.clear();
        assert!(stack.is_empty());
        assert!(stack.capacity() >= 100);
    }

    #[test]
    fn test_invalid_bounds() {
        assert!(matches!(
            Stack::<u8>::new(8, Some(4)),
            Err(CoreError::InvalidPoolBounds { size: 8, limit: 4 })
        ));
        assert!(Queue::<u8>::new(8, Some(4)).is_err());
    }

    #[test]
    fn test_concurrent_pushes_respect_limit() {
        let stack = Arc::new(Stack::new(1, Some(16)).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let stack = Arc::clone(&stack);
                std::thread::spawn(move || (0..10).filter(|i| stack.push(t * 10 + i).is_ok()).count())
            })
            .collect();
        let accepted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(accepted, 16);
        assert_eq!(stack.len(), 16);

        let mut seen = std::collections::HashSet::new();
        while let Some(item) = stack.pop() {
            assert!(seen.insert(item));
        }
        assert_eq!(seen.len(), 16);
    }

    proptest! {
        #[test]
        fn test_stack_is_lifo(items in proptest::collection::vec(any::<u32>(), 0..64)) {
            let stack = Stack::new(1, Some(64)).unwrap();
            for item in &items {
                prop_assert!(stack.push(*item).is_ok());
            }
            let popped: Vec<_> = std::iter::from_fn(|| stack.pop()).collect();
            let mut expected = items.clone();
            expected.reverse();
            prop_assert_eq!(popped, expected);
        }

        #[test]
        fn test_queue_is_fifo(items in proptest::collection::vec(any::<u32>(), 0..64), limit in 1usize..32) {
            let queue = Queue::new(1, Some(limit)).unwrap();
            let accepted: Vec<_> = items.iter().copied().filter(|i| queue.push(*i).is_ok()).collect();
            prop_assert_eq!(accepted.len(), items.len().min(limit));
            prop_assert_eq!(&accepted[..], &items[..accepted.len()]);
            let popped: Vec<_> = std::iter::from_fn(|| queue.pop()).collect();
            prop_assert_eq!(popped, accepted);
        }
    }
}
