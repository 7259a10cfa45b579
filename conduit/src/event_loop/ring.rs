//! Bounded lock-free MPSC ring feeding a loop's cross-thread queue.
//!
//! Dmitry Vyukov's bounded queue, specialised for a single consumer:
//!
//! - Each slot has an atomic sequence number
//! - Producers CAS the head to reserve a position, write, then publish
//!   with `slot.seq = pos + 1`
//! - The consumer reads when `slot.seq == tail + 1` and releases the slot
//!   with `slot.seq = tail + capacity`
//!
//! Producers never block each other for longer than a CAS retry; the
//! consumer side assumes exactly one thread (the loop's owner).

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A slot with its sequence number.
#[repr(C)]
#[repr(align(64))] // One slot per cache line so producers don't false-share.
struct Slot<T> {
    /// - Initial: slot index
    /// - After producer write: position + 1
    /// - After consumer read: position + capacity
    seq: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    const fn new(seq: usize) -> Self {
        Self {
            seq: AtomicUsize::new(seq),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

#[repr(align(64))]
struct Cursor(AtomicUsize);

/// Bounded multi-producer single-consumer queue.
pub(crate) struct Ring<T> {
    head: Cursor,
    tail: Cursor,
    buffer: Box<[Slot<T>]>,
}

impl<T> Ring<T> {
    /// Creates a ring holding at most `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be > 0");
        Self {
            head: Cursor(AtomicUsize::new(0)),
            tail: Cursor(AtomicUsize::new(0)),
            buffer: (0..capacity).map(Slot::new).collect(),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Enqueues `item`, handing it back if the ring is full.
    ///
    /// Safe to call from any number of threads concurrently.
    pub(crate) fn push(&self, item: T) -> Result<(), T> {
        let cap = self.capacity();
        loop {
            let pos = self.head.0.load(Ordering::Relaxed);
            let slot = &self.buffer[pos % cap];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos) as isize;

            if diff == 0 {
                if self
                    .head
                    .0
                    .compare_exchange_weak(
                        pos,
                        pos.wrapping_add(1),
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    // SAFETY: the CAS gave us exclusive ownership of this
                    // position, and seq == pos means the consumer released it.
                    unsafe {
                        (*slot.value.get()).write(item);
                    }
                    slot.seq.store(pos.wrapping_add(1), Ordering::Release);
                    return Ok(());
                }
            } else if diff < 0 {
                return Err(item);
            }
            // diff > 0: another producer took this position; reload head.
        }
    }

    /// Dequeues the oldest item.
    ///
    /// # Safety
    ///
    /// Only one thread may ever call `pop` on a given ring.
    pub(crate) unsafe fn pop(&self) -> Option<T> {
        let cap = self.capacity();
        let tail = self.tail.0.load(Ordering::Relaxed);
        let slot = &self.buffer[tail % cap];

        if slot.seq.load(Ordering::Acquire) != tail.wrapping_add(1) {
            return None;
        }

        // SAFETY: the sequence check proves the producer finished writing.
        let item = unsafe { (*slot.value.get()).assume_init_read() };
        slot.seq.store(tail.wrapping_add(cap), Ordering::Release);
        self.tail.0.store(tail.wrapping_add(1), Ordering::Relaxed);
        Some(item)
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        // SAFETY: &mut self rules out any concurrent consumer.
        while unsafe { self.pop() }.is_some() {}
    }
}

// SAFETY: slot contents are handed between threads only through the
// sequence-number protocol above.
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}
