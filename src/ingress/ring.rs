//! Single-Producer / Single-Consumer Byte Ring
//!
//! Stages bulk data between the transport's completion path (producer) and the
//! bulk worker (consumer) without a lock.
//!
//! ## Index Discipline
//!
//! `head` and `tail` are free-running counters. Only the producer stores `head`,
//! only the consumer stores `tail`, and the slot for counter `i` is
//! `i & (capacity - 1)`, which is why the capacity must be a power of two.
//!
//! ```text
//!            tail                     head
//!             │                        │
//!  ┌───┬───┬──▼┬───┬───┬───┬───┬───┬──▼┬───┐
//!  │   │   │ d │ d │ d │ d │ d │ d │   │   │   used = head - tail
//!  └───┴───┴───┴───┴───┴───┴───┴───┴───┴───┘   free = capacity - used
//! ```
//!
//! The producer publishes bytes with a `Release` store of `head`; the consumer
//! observes them with an `Acquire` load, and hands space back the same way
//! through `tail`. Writes are all-or-nothing: a write larger than the free space
//! is rejected and leaves the ring untouched.
//!
//! [`RingProducer`] and [`RingConsumer`] are separate owned halves, so the
//! single-producer / single-consumer contract is enforced by ownership.

use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Default ring capacity (64 KB)
pub const DEFAULT_RING_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    #[error("ring capacity must be a non-zero power of two, got {0}")]
    InvalidCapacity(usize),

    #[error("ring full: {requested} bytes requested, {available} free")]
    Full { requested: usize, available: usize },
}

#[derive(Debug)]
struct Shared {
    slots: Box<[AtomicU8]>,
    mask: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
}

impl Shared {
    #[inline]
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slots for `len` bytes starting at counter `index`: the run up to the end
    /// of the buffer, then the run from its start.
    fn runs(&self, index: usize, len: usize) -> impl Iterator<Item = &AtomicU8> {
        let start = index & self.mask;
        let first = len.min(self.capacity() - start);
        self.slots[start..start + first]
            .iter()
            .chain(&self.slots[..len - first])
    }

    fn used(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }
}

/// Creates a ring of `capacity` bytes and returns its two halves.
pub fn ring_buffer(capacity: usize) -> Result<(RingProducer, RingConsumer), RingError> {
    if !capacity.is_power_of_two() {
        return Err(RingError::InvalidCapacity(capacity));
    }

    let shared = Arc::new(Shared {
        slots: (0..capacity).map(|_| AtomicU8::new(0)).collect(),
        mask: capacity - 1,
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
    });

    Ok((
        RingProducer {
            shared: Arc::clone(&shared),
        },
        RingConsumer { shared },
    ))
}

/// Writing half of the ring.
#[derive(Debug)]
pub struct RingProducer {
    shared: Arc<Shared>,
}

impl RingProducer {
    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    /// Bytes that can currently be written.
    pub fn free(&self) -> usize {
        self.capacity() - self.shared.used()
    }

    /// Appends all of `data`, or nothing if it does not fit.
    pub fn write(&mut self, data: &[u8]) -> Result<(), RingError> {
        let head = self.shared.head.load(Ordering::Relaxed);
        let tail = self.shared.tail.load(Ordering::Acquire);
        let available = self.capacity() - head.wrapping_sub(tail);

        if data.len() > available {
            return Err(RingError::Full {
                requested: data.len(),
                available,
            });
        }

        for (slot, byte) in self.shared.runs(head, data.len()).zip(data) {
            slot.store(*byte, Ordering::Relaxed);
        }
        self.shared
            .head
            .store(head.wrapping_add(data.len()), Ordering::Release);
        Ok(())
    }
}

/// Reading half of the ring.
#[derive(Debug)]
pub struct RingConsumer {
    shared: Arc<Shared>,
}

impl RingConsumer {
    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    /// Bytes waiting to be read.
    pub fn len(&self) -> usize {
        self.shared.used()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads up to `max_len` bytes.
    pub fn read(&mut self, max_len: usize) -> Bytes {
        let tail = self.shared.tail.load(Ordering::Relaxed);
        let head = self.shared.head.load(Ordering::Acquire);
        let len = head.wrapping_sub(tail).min(max_len);
        self.take(tail, len)
    }

    /// Reads exactly `len` bytes, or nothing if fewer are available.
    pub fn read_exact(&mut self, len: usize) -> Option<Bytes> {
        let tail = self.shared.tail.load(Ordering::Relaxed);
        let head = self.shared.head.load(Ordering::Acquire);
        if head.wrapping_sub(tail) < len {
            return None;
        }
        Some(self.take(tail, len))
    }

    fn take(&mut self, tail: usize, len: usize) -> Bytes {
        let mut out = BytesMut::with_capacity(len);
        out.extend(
            self.shared
                .runs(tail, len)
                .map(|slot| slot.load(Ordering::Relaxed)),
        );
        self.shared
            .tail
            .store(tail.wrapping_add(len), Ordering::Release);
        out.freeze()
    }
}
