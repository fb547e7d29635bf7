//! Bounded lock-free single-producer single-consumer ring buffer
//!
//! The fabric allocates one of these per direction per agent pair; the
//! metrics pipeline owns exactly one. Capacity must be a power of two so
//! slot indexing reduces to a mask. Publication uses release/acquire pairs:
//! a successful `try_dequeue` observes every write that preceded the paired
//! `try_enqueue`.
//!
//! The single-producer single-consumer contract is not checked at runtime;
//! the owning component must prevent a second producer or consumer from
//! ever touching the queue.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Result, SynapseError};

/// Cache-line padded sequence cell to prevent false sharing between the
/// producer and consumer indices. 128-byte alignment covers CPUs that
/// prefetch two cache lines at a time.
#[repr(align(128))]
struct PaddedSequence {
    value: AtomicU64,
    _padding: [u8; 128 - 8],
}

impl PaddedSequence {
    fn new(initial: u64) -> Self {
        Self {
            value: AtomicU64::new(initial),
            _padding: [0; 128 - 8],
        }
    }
}

/// Bounded SPSC queue of trivially copyable records
pub struct SpscRing<T: Copy> {
    mask: u64,
    capacity: usize,
    write: PaddedSequence,
    read: PaddedSequence,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// SAFETY: the queue is shared between exactly one producer thread and one
// consumer thread. The producer writes a slot only while `write - read < N`
// holds, so the consumer cannot be reading it; the consumer reads a slot only
// after the producer's release store of the advanced write index, which
// happens-after the slot write. Index cells are atomics. Violating the
// single-producer/single-consumer contract voids this argument, which is why
// the owning components never hand the same side to two threads.
unsafe impl<T: Copy + Send> Sync for SpscRing<T> {}
unsafe impl<T: Copy + Send> Send for SpscRing<T> {}

impl<T: Copy> SpscRing<T> {
    /// Create a ring with the given capacity (power of two, non-zero)
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(SynapseError::config("ring capacity must be a power of 2"));
        }

        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            mask: (capacity - 1) as u64,
            capacity,
            write: PaddedSequence::new(0),
            read: PaddedSequence::new(0),
            slots,
        })
    }

    /// Enqueue one record. Fails with `QueueFull` when `write - read == N`;
    /// never blocks, never retries.
    pub fn try_enqueue(&self, value: T) -> Result<()> {
        let write = self.write.value.load(Ordering::Relaxed);
        let read = self.read.value.load(Ordering::Acquire);

        if write.wrapping_sub(read) >= self.capacity as u64 {
            return Err(SynapseError::QueueFull);
        }

        let slot = &self.slots[(write & self.mask) as usize];
        // SAFETY: the occupancy check above guarantees the consumer has
        // retired this slot; only this producer writes it.
        unsafe {
            (*slot.get()).write(value);
        }

        self.write.value.store(write.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Dequeue one record, or `None` when the queue is empty
    pub fn try_dequeue(&self) -> Option<T> {
        let read = self.read.value.load(Ordering::Relaxed);
        let write = self.write.value.load(Ordering::Acquire);

        if read == write {
            return None;
        }

        let slot = &self.slots[(read & self.mask) as usize];
        // SAFETY: read < write, so the producer's release store published
        // this slot; only this consumer reads it.
        let value = unsafe { (*slot.get()).assume_init_read() };

        self.read.value.store(read.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    /// Best-effort number of occupied slots
    pub fn len(&self) -> usize {
        let write = self.write.value.load(Ordering::Acquire);
        let read = self.read.value.load(Ordering::Acquire);
        write.wrapping_sub(read) as usize
    }

    /// Best-effort emptiness snapshot
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Best-effort fullness snapshot
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_capacity_must_be_power_of_two() {
        assert!(SpscRing::<u64>::with_capacity(0).is_err());
        assert!(SpscRing::<u64>::with_capacity(1000).is_err());
        assert!(SpscRing::<u64>::with_capacity(1024).is_ok());
    }

    #[test]
    fn test_fifo_order() {
        let ring = SpscRing::with_capacity(8).unwrap();
        for i in 0..5u64 {
            ring.try_enqueue(i).unwrap();
        }
        for i in 0..5u64 {
            assert_eq!(ring.try_dequeue(), Some(i));
        }
        assert_eq!(ring.try_dequeue(), None);
    }

    #[test]
    fn test_saturation() {
        // Capacity 8; enqueue 1..=16 back to back, then drain.
        let ring = SpscRing::with_capacity(8).unwrap();
        for i in 1..=16u64 {
            let result = ring.try_enqueue(i);
            if i <= 8 {
                assert!(result.is_ok(), "enqueue {} should succeed", i);
            } else {
                assert!(
                    matches!(result, Err(SynapseError::QueueFull)),
                    "enqueue {} should fail",
                    i
                );
            }
        }
        for i in 1..=8u64 {
            assert_eq!(ring.try_dequeue(), Some(i));
        }
        assert_eq!(ring.try_dequeue(), None);
    }

    #[test]
    fn test_wraparound_reuses_slots() {
        let ring = SpscRing::with_capacity(4).unwrap();
        for round in 0..10u64 {
            for i in 0..4u64 {
                ring.try_enqueue(round * 4 + i).unwrap();
            }
            assert!(ring.is_full());
            for i in 0..4u64 {
                assert_eq!(ring.try_dequeue(), Some(round * 4 + i));
            }
            assert!(ring.is_empty());
        }
    }

    #[test]
    fn test_concurrent_producer_consumer() {
        const COUNT: u64 = 100_000;
        let ring = Arc::new(SpscRing::with_capacity(1024).unwrap());

        let producer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                let mut next = 0u64;
                while next < COUNT {
                    if ring.try_enqueue(next).is_ok() {
                        next += 1;
                    } else {
                        std::hint::spin_loop();
                    }
                }
            })
        };

        let consumer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                let mut expected = 0u64;
                while expected < COUNT {
                    if let Some(value) = ring.try_dequeue() {
                        assert_eq!(value, expected);
                        expected += 1;
                    } else {
                        std::hint::spin_loop();
                    }
                }
            })
        };

        producer.join().unwrap();
        consumer.join().unwrap();
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Interleaved enqueue/dequeue on a single thread must behave
            // exactly like a bounded FIFO.
            #[test]
            fn prop_matches_model(ops in proptest::collection::vec(any::<bool>(), 1..256)) {
                let ring = SpscRing::with_capacity(16).unwrap();
                let mut model = std::collections::VecDeque::new();
                let mut next = 0u64;

                for enqueue in ops {
                    if enqueue {
                        let ok = ring.try_enqueue(next).is_ok();
                        if model.len() < 16 {
                            prop_assert!(ok);
                            model.push_back(next);
                        } else {
                            prop_assert!(!ok);
                        }
                        next += 1;
                    } else {
                        prop_assert_eq!(ring.try_dequeue(), model.pop_front());
                    }
                }
                prop_assert_eq!(ring.len(), model.len());
            }
        }
    }
}
