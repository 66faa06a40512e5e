use std::collections::VecDeque;

/// Strict FIFO with an optional capacity. Not synchronized; see [`super::Buffers`].
#[derive(Debug)]
pub struct BoundedQueue<T> {
    items: VecDeque<T>,
    max_size: Option<usize>,
    pressured: bool,
}

impl<T> BoundedQueue<T> {
    pub fn new(max_size: Option<usize>) -> Self {
        Self {
            items: VecDeque::new(),
            max_size,
            pressured: false,
        }
    }

    pub fn max_size(&self) -> Option<usize> {
        self.max_size
    }

    /// Append unless full. A rejected item is handed back untouched and the
    /// queue contents are not altered.
    pub fn enqueue(&mut self, item: T) -> Result<usize, T> {
        if let Some(max) = self.max_size {
            if self.items.len() >= max {
                self.pressured = true;
                return Err(item);
            }
        }
        self.items.push_back(item);
        Ok(self.items.len())
    }

    /// Put an item back at the head, bypassing the capacity check. Only for
    /// items that were just dequeued and could not be delivered.
    pub fn push_front(&mut self, item: T) {
        self.items.push_front(item);
    }

    pub fn dequeue(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// True once after a pressured queue dropped back below its limit.
    pub fn take_relief(&mut self) -> bool {
        match self.max_size {
            Some(max) if self.pressured && self.items.len() < max => {
                self.pressured = false;
                true
            }
            _ => false,
        }
    }

    pub fn size(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drop everything; returns how many items were discarded.
    pub fn clear(&mut self) -> usize {
        let n = self.items.len();
        self.items.clear();
        self.pressured = false;
        n
    }
}

