//! C2: a bounded, lock-free single-producer/single-consumer ring buffer
//! of [`TelemetrySample`][crate::telemetry::TelemetrySample]s.
//!
//! Memory-ordering contract:
//! - producer: load own head relaxed, load tail acquire; publish head
//!   with release after writing the slot.
//! - consumer: load own tail relaxed, load head acquire; publish tail
//!   with release after reading the slot.
//!
//! Neither side blocks: a full buffer drops the push, an empty buffer
//! returns `Empty` to the caller, which is expected to back off with a
//! short sleep rather than spin.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Wraps a value in its own cache line to keep the producer's and
/// consumer's indices from false-sharing one cache line between cores.
#[repr(align(64))]
struct CachePadded<T>(T);

#[derive(Debug, PartialEq, Eq)]
pub enum PushError {
    Full,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PopError {
    Empty,
}

pub struct SpscRingBuffer<T> {
    buf: Box<[UnsafeCell<Option<T>>]>,
    mask: usize,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
}

// SAFETY: exactly one producer calls `push`, exactly one consumer calls
// `pop`/`len`/`is_empty`; the atomics establish the happens-before edges
// needed for the slot contents to be safely shared across that boundary.
unsafe impl<T: Send> Send for SpscRingBuffer<T> {}
unsafe impl<T: Send> Sync for SpscRingBuffer<T> {}

impl<T> SpscRingBuffer<T> {
    /// Capacity is rounded up to a power of two so index wrapping can use
    /// a bitmask instead of a modulo. One slot is always left
    /// empty to distinguish "full" from "empty" with bare indices, so the
    /// true usable capacity is `capacity() - 1`.
    pub fn new(requested_capacity: usize) -> Self {
        let capacity = requested_capacity.max(2).next_power_of_two();
        let buf = (0..capacity)
            .map(|_| UnsafeCell::new(None))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            buf,
            mask: capacity - 1,
            head: CachePadded(AtomicUsize::new(0)),
            tail: CachePadded(AtomicUsize::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Producer side. Never blocks: a full ring drops `value`.
    pub fn push(&self, value: T) -> Result<(), PushError> {
        let head = self.head.0.load(Ordering::Relaxed);
        let tail = self.tail.0.load(Ordering::Acquire);
        let next = (head + 1) & self.mask;
        if next == tail {
            return Err(PushError::Full);
        }
        // SAFETY: only the producer ever writes slot `head`, and the
        // consumer cannot observe it until the release store below.
        unsafe { *self.buf[head].get() = Some(value) };
        self.head.0.store(next, Ordering::Release);
        Ok(())
    }

    /// Consumer side. Never blocks: an empty ring returns `Empty`.
    pub fn pop(&self) -> Result<T, PopError> {
        let tail = self.tail.0.load(Ordering::Relaxed);
        let head = self.head.0.load(Ordering::Acquire);
        if tail == head {
            return Err(PopError::Empty);
        }
        // SAFETY: only the consumer ever reads/clears slot `tail`, and the
        // producer will not overwrite it again until `tail` advances past
        // it, which this function alone is responsible for doing.
        let value = unsafe { (*self.buf[tail].get()).take() }
            .expect("producer publishes before advancing head");
        let next = (tail + 1) & self.mask;
        self.tail.0.store(next, Ordering::Release);
        Ok(value)
    }

    /// Approximate occupancy; exact and monotone-correct in the SPSC
    /// regime this type is restricted to.
    pub fn len(&self) -> usize {
        let head = self.head.0.load(Ordering::Acquire);
        let tail = self.tail.0.load(Ordering::Acquire);
        (head.wrapping_sub(tail)) & self.mask
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn capacity_rounds_up_to_power_of_two() {
        let rb: SpscRingBuffer<u8> = SpscRingBuffer::new(10);
        assert_eq!(rb.capacity(), 16);
        let rb: SpscRingBuffer<u8> = SpscRingBuffer::new(16);
        assert_eq!(rb.capacity(), 16);
    }

    #[test]
    fn push_pop_roundtrip_preserves_order() {
        let rb: SpscRingBuffer<u32> = SpscRingBuffer::new(16);
        for i in 0..15 {
            rb.push(i).unwrap();
        }
        for i in 0..15 {
            assert_eq!(rb.pop().unwrap(), i);
        }
        assert_eq!(rb.pop(), Err(PopError::Empty));
    }

    #[test]
    fn full_buffer_drops_without_corrupting_existing_entries() {
        // capacity 16 means 15 usable slots (one held back to disambiguate
        // full from empty, and the ring-overflow scenario in
        // spec §8 scenario 6).
        let rb: SpscRingBuffer<u32> = SpscRingBuffer::new(16);
        let mut pushed = 0;
        let mut dropped = 0;
        for i in 0..32u32 {
            match rb.push(i) {
                Ok(()) => pushed += 1,
                Err(PushError::Full) => dropped += 1,
            }
        }
        assert_eq!(pushed, 15);
        assert_eq!(dropped, 17);
        for i in 0..15u32 {
            assert_eq!(rb.pop().unwrap(), i);
        }
        assert_eq!(rb.pop(), Err(PopError::Empty));
    }

    #[test]
    fn wraps_around_power_of_two_boundary() {
        let rb: SpscRingBuffer<u32> = SpscRingBuffer::new(4);
        for i in 0..3u32 {
            rb.push(i).unwrap();
        }
        assert_eq!(rb.pop().unwrap(), 0);
        assert_eq!(rb.pop().unwrap(), 1);
        rb.push(10).unwrap();
        rb.push(11).unwrap();
        assert_eq!(rb.pop().unwrap(), 2);
        assert_eq!(rb.pop().unwrap(), 10);
        assert_eq!(rb.pop().unwrap(), 11);
        assert_eq!(rb.pop(), Err(PopError::Empty));
    }

    #[test]
    fn len_tracks_occupancy() {
        let rb: SpscRingBuffer<u32> = SpscRingBuffer::new(8);
        assert!(rb.is_empty());
        rb.push(1).unwrap();
        rb.push(2).unwrap();
        assert_eq!(rb.len(), 2);
        rb.pop().unwrap();
        assert_eq!(rb.len(), 1);
    }
}
