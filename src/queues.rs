//! The three command channels a consumer uses to reach the IO thread:
//! a lock-free real-time mailbox, and mutex-guarded string/override queues.
//!
//! The real-time mailbox is modeled as a bitset word rather than relying on
//! byte-ordering tricks: the IO thread branches on the soft-reset bit first
//! and consumes the whole word in one exchange, per the priority-gate design.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

pub const RT_SOFT_RESET: u8 = 1 << 0;
pub const RT_FEED_HOLD: u8 = 1 << 1;
pub const RT_CYCLE_START: u8 = 1 << 2;
pub const RT_JOG_CANCEL: u8 = 1 << 3;

/// Lock-free mailbox for real-time command bits. Multiple producers OR bits
/// in; the IO thread exchanges the whole word to zero and dispatches.
#[derive(Default)]
pub struct RealtimeMailbox {
    bits: AtomicU8,
}

impl RealtimeMailbox {
    pub fn new() -> Self {
        RealtimeMailbox {
            bits: AtomicU8::new(0),
        }
    }

    pub fn post(&self, bit: u8) {
        self.bits.fetch_or(bit, Ordering::Release);
    }

    /// Atomically takes and clears the whole word.
    pub fn take(&self) -> u8 {
        self.bits.swap(0, Ordering::Acquire)
    }
}

/// Mutex-guarded FIFO of newline-terminated line commands.
#[derive(Default)]
pub struct StringQueue {
    lines: Mutex<VecDeque<String>>,
}

impl StringQueue {
    pub fn new() -> Self {
        StringQueue {
            lines: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, line: String) {
        self.lines.lock().unwrap().push_back(line);
    }

    /// Drains the entire queue in FIFO order.
    pub fn drain_all(&self) -> Vec<String> {
        let mut guard = self.lines.lock().unwrap();
        guard.drain(..).collect()
    }
}

/// Mutex-guarded FIFO of pre-expanded override byte sequences.
#[derive(Default)]
pub struct OverrideQueue {
    sequences: Mutex<VecDeque<Vec<u8>>>,
}

impl OverrideQueue {
    pub fn new() -> Self {
        OverrideQueue {
            sequences: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, sequence: Vec<u8>) {
        self.sequences.lock().unwrap().push_back(sequence);
    }

    pub fn drain_all(&self) -> Vec<Vec<u8>> {
        let mut guard = self.sequences.lock().unwrap();
        guard.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mailbox_collapses_repeated_posts_idempotently() {
        let mailbox = RealtimeMailbox::new();
        mailbox.post(RT_FEED_HOLD);
        mailbox.post(RT_FEED_HOLD);
        mailbox.post(RT_CYCLE_START);
        assert_eq!(mailbox.take(), RT_FEED_HOLD | RT_CYCLE_START);
        assert_eq!(mailbox.take(), 0);
    }

    #[test]
    fn string_queue_preserves_fifo_order() {
        let q = StringQueue::new();
        q.push("a".into());
        q.push("b".into());
        assert_eq!(q.drain_all(), vec!["a".to_string(), "b".to_string()]);
        assert!(q.drain_all().is_empty());
    }

    #[test]
    fn override_queue_preserves_fifo_order() {
        let q = OverrideQueue::new();
        q.push(vec![1, 2]);
        q.push(vec![3]);
        assert_eq!(q.drain_all(), vec![vec![1, 2], vec![3]]);
    }
}
