//! FIFO byte buffer backing both directions of the virtual link.

use std::collections::VecDeque;

/// Byte queue with append-at-tail, consume-at-head semantics.
///
/// Insertion order is the only ordering guarantee: bytes are never
/// reordered or deduplicated.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ByteQueue {
    bytes: VecDeque<u8>,
}

impl ByteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with pre-queued bytes.
    pub fn with_bytes(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.iter().copied().collect(),
        }
    }

    /// Number of queued bytes.
    pub fn count(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Look at the head byte without consuming it. Returns None if empty.
    pub fn peek_front(&self) -> Option<u8> {
        self.bytes.front().copied()
    }

    /// Consume the head byte. Returns None if empty.
    pub fn pop_front(&mut self) -> Option<u8> {
        self.bytes.pop_front()
    }

    /// Consume up to `n` bytes from the head (fewer if the queue is shorter).
    pub fn take_front(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.bytes.len());
        self.bytes.drain(..n).collect()
    }

    pub fn append(&mut self, byte: u8) {
        self.bytes.push_back(byte);
    }

    pub fn append_all(&mut self, bytes: &[u8]) {
        self.bytes.extend(bytes.iter().copied());
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_peek_does_not_consume() {
        let mut queue = ByteQueue::with_bytes(b"AB");
        assert_eq!(queue.peek_front(), Some(b'A'));
        assert_eq!(queue.count(), 2);
        assert_eq!(queue.pop_front(), Some(b'A'));
        assert_eq!(queue.peek_front(), Some(b'B'));
    }

    #[test]
    fn test_empty_queue_sentinels() {
        let mut queue = ByteQueue::new();
        assert!(queue.is_empty());
        assert_eq!(queue.peek_front(), None);
        assert_eq!(queue.pop_front(), None);
        assert!(queue.take_front(4).is_empty());
    }

    #[test]
    fn test_take_front_is_bounded_by_length() {
        let mut queue = ByteQueue::with_bytes(&[1, 2, 3]);
        assert_eq!(queue.take_front(2), vec![1, 2]);
        assert_eq!(queue.take_front(10), vec![3]);
        assert!(queue.is_empty());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Append(u8),
        AppendAll(Vec<u8>),
        Pop,
        Take(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            any::<u8>().prop_map(Op::Append),
            prop::collection::vec(any::<u8>(), 0..8).prop_map(Op::AppendAll),
            Just(Op::Pop),
            (0usize..6).prop_map(Op::Take),
        ]
    }

    proptest! {
        #[test]
        fn prop_pop_order_matches_append_order(ops in prop::collection::vec(op_strategy(), 0..64)) {
            let mut queue = ByteQueue::new();
            let mut appended = Vec::new();
            let mut consumed = Vec::new();

            for op in ops {
                match op {
                    Op::Append(b) => {
                        queue.append(b);
                        appended.push(b);
                    }
                    Op::AppendAll(bytes) => {
                        queue.append_all(&bytes);
                        appended.extend_from_slice(&bytes);
                    }
                    Op::Pop => consumed.extend(queue.pop_front()),
                    Op::Take(n) => consumed.extend(queue.take_front(n)),
                }
            }
            consumed.extend(queue.take_front(usize::MAX));

            prop_assert_eq!(consumed, appended);
        }
    }
}
