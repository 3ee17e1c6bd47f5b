use std::collections::VecDeque;

/// Bounded history, newest element first. Pushing into a full queue
/// evicts the oldest element.
#[derive(Debug, Clone)]
pub struct CircularQueue<T> {
    items: VecDeque<T>,
    limit: usize,
}

impl<T> CircularQueue<T> {
    pub fn with_capacity(limit: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(limit),
            limit: limit.max(1),
        }
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() == self.limit {
            self.items.pop_back();
        }

        self.items.push_front(item);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Newest first.
    pub fn iter(&self) -> impl Iterator<Item = &'_ T> {
        self.items.iter()
    }

    /// The `n` newest elements, oldest of them first.
    pub fn latest(&self, n: usize) -> impl Iterator<Item = &'_ T> {
        self.items.iter().take(n).rev()
    }
}
