//! Out-of-order queue (spec.md §4.5).
//!
//! While a `send()` is polling for a response, the peer may produce an
//! `EVENT_*` message first. Delivering it inline would let the event handler
//! recursively issue new requests and deadlock the polling sender, so events
//! are parked here and drained on the next [`OooQueue::drain`] call, in FIFO
//! order, before the RX ring is drained (grounded directly on
//! `virtio_msg_bus_ooo_enqueue`/`_process` in
//! `examples/original_source/hw/virtio/virtio-msg-bus.c`).

use crate::error::{Error, Result};
use crate::msg::Msg;

/// Bounded ring depth; exceeding it is a detectable error (spec.md §4.5/§8),
/// never silent truncation.
pub const OOO_CAPACITY: usize = 128;

#[derive(Default)]
pub struct OooQueue {
    pending: Vec<Msg>,
}

impl OooQueue {
    pub fn new() -> Self {
        OooQueue {
            pending: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Park an event. Errors if the ring is already at capacity rather than
    /// silently dropping or overwriting the oldest entry.
    pub fn push(&mut self, msg: Msg) -> Result<()> {
        if self.pending.len() >= OOO_CAPACITY {
            return Err(Error::RingOverflow);
        }
        self.pending.push(msg);
        Ok(())
    }

    /// Drain everything parked so far, in FIFO arrival order. Each event is
    /// delivered exactly once: the ring is empty again once this returns.
    pub fn drain(&mut self) -> Vec<Msg> {
        std::mem::take(&mut self.pending)
    }

    /// Discard everything parked without dispatching it (soft reset).
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::pack_event_used;

    #[test]
    fn fifo_order_preserved() {
        let mut q = OooQueue::new();
        for i in 0..5u32 {
            q.push(pack_event_used(0, i)).unwrap();
        }
        let drained = q.drain();
        let indices: Vec<u32> = drained
            .iter()
            .map(|m| match crate::codec::decode(m) {
                crate::codec::Payload::EventUsed { index } => index,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        assert!(q.is_empty());
    }

    #[test]
    fn overflow_is_an_error_not_corruption() {
        let mut q = OooQueue::new();
        for i in 0..OOO_CAPACITY {
            q.push(pack_event_used(0, i as u32)).unwrap();
        }
        assert!(matches!(
            q.push(pack_event_used(0, 999)),
            Err(Error::RingOverflow)
        ));
        assert_eq!(q.len(), OOO_CAPACITY);
    }
}
