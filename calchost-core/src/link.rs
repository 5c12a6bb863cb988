//! Bridge between the host byte queues and the engine's link port.

use crate::engine::{Engine, StopReason};
use crate::queue::ByteQueue;

/// What one `LinkPortBridge::service` call moved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkActivity {
    /// Bytes handed to the engine, in order.
    pub sent: usize,
    /// Byte taken from the engine and appended to the output queue.
    pub received: Option<u8>,
}

/// Link state for one session.
///
/// While locked a byte is in flight and the engine has not yet asked for
/// another one, so no further send is attempted. Receiving ignores the lock.
#[derive(Debug, Default)]
pub struct LinkPortBridge {
    locked: bool,
}

impl LinkPortBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Engine signalled it wants another byte.
    pub fn release(&mut self) {
        self.locked = false;
    }

    /// Reset the engine link and drop any in-flight state.
    pub fn reset<E: Engine + ?Sized>(&mut self, engine: &mut E) {
        engine.link_reset();
        self.locked = false;
    }

    /// Forward queued input or poll for output, once per run iteration.
    pub fn service<E: Engine + ?Sized>(
        &mut self,
        engine: &mut E,
        input: &mut ByteQueue,
        output: &mut ByteQueue,
    ) -> LinkActivity {
        let mut activity = LinkActivity::default();

        if !self.locked && !input.is_empty() {
            activity.sent = self.forward(engine, input);
        } else if input.is_empty() {
            if let Some(byte) = engine.link_get_byte() {
                log::trace!("@< {:02x}", byte);
                output.append(byte);
                activity.received = Some(byte);
            }
        }

        activity
    }

    fn forward<E: Engine + ?Sized>(&mut self, engine: &mut E, input: &mut ByteQueue) -> usize {
        let mut sent = 0;
        let Some(byte) = input.peek_front() else {
            return sent;
        };

        engine.clear_stop_reason();
        if !engine.link_send_byte(byte) {
            return sent;
        }
        log::trace!("@> {:02x}", byte);
        input.pop_front();
        sent += 1;

        if !engine.stop_reason().contains(StopReason::LINK_WRITE_BYTE) {
            self.locked = true;
            return sent;
        }

        // The engine keeps asking for more: push as much as it takes now.
        while engine.stop_reason().contains(StopReason::LINK_WRITE_BYTE) {
            let Some(byte) = input.peek_front() else {
                break;
            };
            engine.clear_stop_reason();
            if !engine.link_send_byte(byte) {
                break;
            }
            log::trace!("@> {:02x}", byte);
            input.pop_front();
            sent += 1;
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{HeadlessEngine, StepUnit};

    #[test]
    fn test_busy_link_locks_after_one_byte() {
        let mut engine = HeadlessEngine::ti83();
        let mut link = LinkPortBridge::new();
        let mut input = ByteQueue::with_bytes(b"ABC");
        let mut output = ByteQueue::new();

        let activity = link.service(&mut engine, &mut input, &mut output);
        assert_eq!(activity.sent, 1);
        assert!(link.is_locked());
        assert_eq!(input.count(), 2);

        // Locked: nothing is sent, and input is pending so nothing received.
        engine.queue_device_output(&[0x99]);
        let activity = link.service(&mut engine, &mut input, &mut output);
        assert_eq!(activity, LinkActivity::default());

        engine.step(10, StepUnit::Cycles);
        link.release();
        let activity = link.service(&mut engine, &mut input, &mut output);
        assert_eq!(activity.sent, 1);
        assert_eq!(engine.received(), b"A");
    }

    #[test]
    fn test_eager_link_takes_whole_queue() {
        let mut engine = HeadlessEngine::ti83().with_link_capacity(usize::MAX);
        let mut link = LinkPortBridge::new();
        let mut input = ByteQueue::with_bytes(&[1, 2, 3, 4]);
        let mut output = ByteQueue::new();

        let activity = link.service(&mut engine, &mut input, &mut output);
        assert_eq!(activity.sent, 4);
        assert!(input.is_empty());
        assert!(!link.is_locked());
        assert_eq!(engine.pending_inbound(), 4);
    }

    #[test]
    fn test_rejected_byte_stays_queued() {
        let mut engine = HeadlessEngine::ti83();
        let mut link = LinkPortBridge::new();
        let mut output = ByteQueue::new();

        // Fill the single-byte link behind the bridge's back.
        engine.link_send_byte(0x00);

        let mut input = ByteQueue::with_bytes(b"Z");
        let activity = link.service(&mut engine, &mut input, &mut output);
        assert_eq!(activity.sent, 0);
        assert_eq!(input.peek_front(), Some(b'Z'));
        assert!(!link.is_locked());
    }

    #[test]
    fn test_receive_when_input_empty() {
        let mut engine = HeadlessEngine::ti83();
        engine.queue_device_output(&[0x10, 0x20]);
        let mut link = LinkPortBridge::new();
        let mut input = ByteQueue::new();
        let mut output = ByteQueue::new();

        let activity = link.service(&mut engine, &mut input, &mut output);
        assert_eq!(activity.received, Some(0x10));
        link.service(&mut engine, &mut input, &mut output);
        assert_eq!(output.take_front(8), vec![0x10, 0x20]);
    }

    #[test]
    fn test_reset_clears_lock_and_engine_link() {
        let mut engine = HeadlessEngine::ti83();
        let mut link = LinkPortBridge::new();
        let mut input = ByteQueue::with_bytes(b"Q");
        let mut output = ByteQueue::new();
        link.service(&mut engine, &mut input, &mut output);
        assert!(link.is_locked());

        link.reset(&mut engine);
        assert!(!link.is_locked());
        assert_eq!(engine.link_resets(), 1);
        assert_eq!(engine.pending_inbound(), 0);
    }
}
