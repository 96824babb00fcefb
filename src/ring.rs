//! Fixed-capacity message rings between BLE callback context and the main loop.
//!
//! The inbound ring is written only by the stack's write callbacks and read
//! only by the main loop; the outbound ring is written and read exclusively
//! from main-loop context. Both are non-blocking: enqueueing into a full ring
//! fails and the caller counts the drop.

use crate::config::{MAX_INBOUND_PAYLOAD, MAX_OUTBOUND_PAYLOAD};

/// Which characteristic an inbound write arrived on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InboundKind {
    Target,
    LocationsModify,
    Position,
}

/// Which characteristic an outbound notification goes to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotifyChannel {
    Target,
    Ready,
    LocationsList,
}

/// Raw bytes from one characteristic write, immutable once enqueued.
#[derive(Clone, Copy)]
pub struct InboundMessage {
    kind: InboundKind,
    len: u8,
    bytes: [u8; MAX_INBOUND_PAYLOAD],
}

impl InboundMessage {
    /// Frames a write payload. Empty or oversize payloads are rejected here,
    /// before they ever occupy a ring slot.
    pub fn new(kind: InboundKind, payload: &[u8]) -> Option<Self> {
        if payload.is_empty() || payload.len() > MAX_INBOUND_PAYLOAD {
            return None;
        }
        let mut bytes = [0u8; MAX_INBOUND_PAYLOAD];
        bytes[..payload.len()].copy_from_slice(payload);
        Some(Self {
            kind,
            len: payload.len() as u8,
            bytes,
        })
    }

    pub fn kind(&self) -> InboundKind {
        self.kind
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl core::fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InboundMessage")
            .field("kind", &self.kind)
            .field("len", &self.len)
            .finish()
    }
}

/// One pending notification: destination channel plus serialized payload.
#[derive(Clone, Copy)]
pub struct OutboundMessage {
    channel: NotifyChannel,
    len: u8,
    bytes: [u8; MAX_OUTBOUND_PAYLOAD],
}

impl OutboundMessage {
    pub fn new(channel: NotifyChannel, payload: &[u8]) -> Option<Self> {
        if payload.is_empty() || payload.len() > MAX_OUTBOUND_PAYLOAD {
            return None;
        }
        let mut bytes = [0u8; MAX_OUTBOUND_PAYLOAD];
        bytes[..payload.len()].copy_from_slice(payload);
        Some(Self {
            channel,
            len: payload.len() as u8,
            bytes,
        })
    }

    pub fn channel(&self) -> NotifyChannel {
        self.channel
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl core::fmt::Debug for OutboundMessage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OutboundMessage")
            .field("channel", &self.channel)
            .field("len", &self.len)
            .finish()
    }
}

/// Circular buffer with wrapping head/tail indices.
///
/// Empty iff `head == tail`; full iff `(head + 1) % N == tail`, which keeps
/// one slot unoccupied (N slots hold N-1 messages). All operations are O(1)
/// and never block or overwrite.
pub struct RingBuffer<T, const N: usize> {
    slots: [Option<T>; N],
    head: usize,
    tail: usize,
}

impl<T, const N: usize> RingBuffer<T, N> {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| None),
            head: 0,
            tail: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn is_full(&self) -> bool {
        (self.head + 1) % N == self.tail
    }

    pub fn len(&self) -> usize {
        (self.head + N - self.tail) % N
    }

    /// Returns false (leaving the buffer unchanged) when full.
    pub fn enqueue(&mut self, item: T) -> bool {
        if self.is_full() {
            return false;
        }
        self.slots[self.head] = Some(item);
        self.head = (self.head + 1) % N;
        true
    }

    pub fn dequeue(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let item = self.slots[self.tail].take();
        self.tail = (self.tail + 1) % N;
        item
    }
}

impl<T, const N: usize> Default for RingBuffer<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_preserved() {
        let mut ring: RingBuffer<u32, 8> = RingBuffer::new();
        for i in 0..5 {
            assert!(ring.enqueue(i));
        }
        for i in 0..5 {
            assert_eq!(ring.dequeue(), Some(i));
        }
        assert_eq!(ring.dequeue(), None);
    }

    #[test]
    fn fifo_order_across_wraparound() {
        let mut ring: RingBuffer<u32, 8> = RingBuffer::new();
        let mut next_in = 0u32;
        let mut next_out = 0u32;
        for _ in 0..30 {
            for _ in 0..3 {
                assert!(ring.enqueue(next_in));
                next_in += 1;
            }
            for _ in 0..3 {
                assert_eq!(ring.dequeue(), Some(next_out));
                next_out += 1;
            }
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn enqueue_into_full_ring_fails_and_leaves_contents() {
        let mut ring: RingBuffer<u32, 8> = RingBuffer::new();
        // 8 slots hold 7 entries; the 8th enqueue must fail.
        for i in 0..7 {
            assert!(ring.enqueue(i), "enqueue {} should succeed", i);
        }
        assert!(ring.is_full());
        assert!(!ring.enqueue(99));
        assert_eq!(ring.len(), 7);
        for i in 0..7 {
            assert_eq!(ring.dequeue(), Some(i));
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn empty_iff_head_equals_tail() {
        let mut ring: RingBuffer<u8, 4> = RingBuffer::new();
        assert!(ring.is_empty());
        assert_eq!(ring.len(), 0);
        ring.enqueue(1);
        assert!(!ring.is_empty());
        ring.dequeue();
        assert!(ring.is_empty());
    }

    #[test]
    fn inbound_message_rejects_bad_lengths() {
        assert!(InboundMessage::new(InboundKind::Target, &[]).is_none());
        let oversize = [0u8; MAX_INBOUND_PAYLOAD + 1];
        assert!(InboundMessage::new(InboundKind::Target, &oversize).is_none());
        let exact = [0u8; MAX_INBOUND_PAYLOAD];
        assert!(InboundMessage::new(InboundKind::Target, &exact).is_some());
    }

    #[test]
    fn inbound_message_round_trips_payload() {
        let msg = InboundMessage::new(InboundKind::Position, b"{\"lat\":1}").unwrap();
        assert_eq!(msg.kind(), InboundKind::Position);
        assert_eq!(msg.payload(), b"{\"lat\":1}");
    }

    #[test]
    fn outbound_message_rejects_oversize() {
        let oversize = [b'x'; MAX_OUTBOUND_PAYLOAD + 1];
        assert!(OutboundMessage::new(NotifyChannel::Ready, &oversize).is_none());
        let exact = [b'x'; MAX_OUTBOUND_PAYLOAD];
        let msg = OutboundMessage::new(NotifyChannel::Ready, &exact).unwrap();
        assert_eq!(msg.channel(), NotifyChannel::Ready);
        assert_eq!(msg.payload().len(), MAX_OUTBOUND_PAYLOAD);
    }
}
