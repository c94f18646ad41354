// src/spsc.rs
//
// Bounded lock-free single-producer/single-consumer ring. Three of these
// form the engine <-> adapter contract: requests in, responses out, market
// events out. Capacity is a power of two; the producer and consumer indices
// live on separate cache lines so the two sides never false-share.

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub const CACHE_LINE_SIZE: usize = 64;

/// Producer-side failure: the ring has no free slot. Never blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull;

impl fmt::Display for QueueFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("spsc queue full")
    }
}

impl std::error::Error for QueueFull {}

#[repr(align(64))]
struct PaddedIndex(AtomicUsize);

struct Ring<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,
    /// Next slot the producer will write. Only stored by the producer.
    write: PaddedIndex,
    /// Next slot the consumer will read. Only stored by the consumer.
    read: PaddedIndex,
}

// The ring hands out at most one Producer and one Consumer; slot access is
// disjoint between them by the index protocol.
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    fn capacity(&self) -> usize {
        self.mask + 1
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        let read = self.read.0.load(Ordering::Relaxed);
        let write = self.write.0.load(Ordering::Relaxed);
        for seq in read..write {
            let slot = &self.slots[seq & self.mask];
            unsafe { (*slot.get()).assume_init_drop() };
        }
    }
}

/// Create a bounded SPSC ring of `capacity` slots (must be a power of two)
/// and split it into its producer and consumer halves.
pub fn channel<T>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    assert!(
        capacity.is_power_of_two() && capacity > 0,
        "spsc capacity must be a nonzero power of two, got {capacity}"
    );
    let slots = (0..capacity)
        .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
        .collect::<Vec<_>>()
        .into_boxed_slice();
    let ring = Arc::new(Ring {
        slots,
        mask: capacity - 1,
        write: PaddedIndex(AtomicUsize::new(0)),
        read: PaddedIndex(AtomicUsize::new(0)),
    });
    (
        Producer {
            ring: Arc::clone(&ring),
        },
        Consumer { ring },
    )
}

/// Exclusive write capability. Exactly one exists per ring.
pub struct Producer<T> {
    ring: Arc<Ring<T>>,
}

/// Exclusive slot handed out by [`Producer::reserve`]. Publishing consumes
/// the slot and advances the write index with release semantics.
pub struct WriteSlot<'a, T> {
    ring: &'a Ring<T>,
    seq: usize,
}

impl<T> WriteSlot<'_, T> {
    pub fn publish(self, value: T) {
        let slot = &self.ring.slots[self.seq & self.ring.mask];
        unsafe { (*slot.get()).write(value) };
        self.ring
            .write
            .0
            .store(self.seq.wrapping_add(1), Ordering::Release);
    }
}

impl<T> Producer<T> {
    /// Reserve the next free slot, or fail immediately with [`QueueFull`].
    pub fn reserve(&mut self) -> Result<WriteSlot<'_, T>, QueueFull> {
        let write = self.ring.write.0.load(Ordering::Relaxed);
        let read = self.ring.read.0.load(Ordering::Acquire);
        if write.wrapping_sub(read) == self.ring.capacity() {
            return Err(QueueFull);
        }
        Ok(WriteSlot {
            ring: &self.ring,
            seq: write,
        })
    }

    /// Reserve-and-publish in one call. Returns the value on a full ring so
    /// the caller can decide to drop or retry.
    pub fn push(&mut self, value: T) -> Result<(), T> {
        match self.reserve() {
            Ok(slot) => {
                slot.publish(value);
                Ok(())
            }
            Err(QueueFull) => Err(value),
        }
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

/// Exclusive read capability. Exactly one exists per ring.
pub struct Consumer<T> {
    ring: Arc<Ring<T>>,
}

impl<T> Consumer<T> {
    /// Borrow the next unread slot without consuming it.
    pub fn peek(&self) -> Option<&T> {
        let read = self.ring.read.0.load(Ordering::Relaxed);
        let write = self.ring.write.0.load(Ordering::Acquire);
        if read == write {
            return None;
        }
        let slot = &self.ring.slots[read & self.ring.mask];
        Some(unsafe { (*slot.get()).assume_init_ref() })
    }

    /// Drop the slot last returned by [`peek`](Self::peek) and advance the
    /// read index with release semantics. No-op when the ring is empty.
    pub fn consume(&mut self) {
        let read = self.ring.read.0.load(Ordering::Relaxed);
        let write = self.ring.write.0.load(Ordering::Acquire);
        if read == write {
            return;
        }
        let slot = &self.ring.slots[read & self.ring.mask];
        unsafe { (*slot.get()).assume_init_drop() };
        self.ring
            .read
            .0
            .store(read.wrapping_add(1), Ordering::Release);
    }

    /// Take the next value, if any.
    pub fn pop(&mut self) -> Option<T> {
        let read = self.ring.read.0.load(Ordering::Relaxed);
        let write = self.ring.write.0.load(Ordering::Acquire);
        if read == write {
            return None;
        }
        let slot = &self.ring.slots[read & self.ring.mask];
        let value = unsafe { (*slot.get()).assume_init_read() };
        self.ring
            .read
            .0
            .store(read.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    pub fn len(&self) -> usize {
        let read = self.ring.read.0.load(Ordering::Relaxed);
        let write = self.ring.write.0.load(Ordering::Acquire);
        write.wrapping_sub(read)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_drain_and_wrap() {
        let (mut tx, mut rx) = channel::<u64>(8);
        for round in 0..5u64 {
            for i in 0..8 {
                tx.push(round * 100 + i).unwrap();
            }
            assert_eq!(tx.push(999), Err(999));
            for i in 0..8 {
                assert_eq!(rx.pop(), Some(round * 100 + i));
            }
            assert_eq!(rx.pop(), None);
        }
    }

    #[test]
    fn reserve_then_publish() {
        let (mut tx, mut rx) = channel::<u32>(2);
        let slot = tx.reserve().unwrap();
        // Nothing is visible to the consumer until publish.
        assert!(rx.is_empty());
        slot.publish(42);
        assert_eq!(rx.peek(), Some(&42));
        rx.consume();
        assert!(rx.pop().is_none());
    }

    #[test]
    fn full_ring_reports_queue_full() {
        let (mut tx, _rx) = channel::<u8>(2);
        tx.push(1).unwrap();
        tx.push(2).unwrap();
        assert!(tx.reserve().is_err());
    }

    #[test]
    fn cross_thread_ordering() {
        const N: u64 = 100_000;
        let (mut tx, mut rx) = channel::<u64>(1024);
        let producer = std::thread::spawn(move || {
            let mut next = 0u64;
            while next < N {
                if tx.push(next).is_ok() {
                    next += 1;
                }
            }
        });
        let mut expect = 0u64;
        while expect < N {
            if let Some(v) = rx.pop() {
                assert_eq!(v, expect);
                expect += 1;
            }
        }
        producer.join().unwrap();
    }

    #[test]
    fn drops_unconsumed_values() {
        use std::sync::atomic::AtomicUsize;
        static DROPS: AtomicUsize = AtomicUsize::new(0);
        #[derive(Debug)]
        struct Counted;
        impl Drop for Counted {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }
        {
            let (mut tx, mut rx) = channel::<Counted>(4);
            tx.push(Counted).unwrap();
            tx.push(Counted).unwrap();
            tx.push(Counted).unwrap();
            drop(rx.pop());
            // Two values remain in the ring.
        }
        assert_eq!(DROPS.load(Ordering::SeqCst), 3);
    }
}
