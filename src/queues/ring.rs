//! Bounded, wait-free circular buffer for single-producer, single-consumer scenarios.
//!
//! `RingBuffer::new` allocates `capacity + 1` slots once and hands back a [`Producer`] and a
//! [`Consumer`]. The spare slot lets `read == write` mean empty and `write + 1 == read` mean full
//! without a shared counter. Each cursor is written by exactly one handle and sits on its own
//! cache line.
use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::atomic::{fence, AtomicUsize};
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::Arc;

use thiserror::Error;

use crate::padding::CachePadded;
use crate::trace::{debug, trace};
use crate::QueueError;

/// A push rejected because the ring had no free slot. Carries the value back to the caller.
#[derive(Error, Clone, Copy, PartialEq, Eq)]
#[error("RingBuffer full, cannot push until the consumer pops")]
pub struct Full<T>(pub T);

impl<T> Full<T> {
    /// Recovers the rejected value.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for Full<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Full(..)")
    }
}

/// Shared storage behind a [`Producer`]/[`Consumer`] pair.
pub struct RingBuffer<T> {
    /// Next slot the producer fills. Stored already reduced modulo `slots.len()`.
    write: CachePadded<AtomicUsize>,
    /// Next slot the consumer drains. Stored already reduced modulo `slots.len()`.
    read: CachePadded<AtomicUsize>,
    /// `capacity + 1` slots; only those in `[read, write)` hold initialized values.
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// The producer only touches the slot at `write`, the consumer only the slots in `[read, write)`,
// and the acquire/release cursor handoff orders those accesses.
unsafe impl<T: Send> Send for RingBuffer<T> {}
unsafe impl<T: Send> Sync for RingBuffer<T> {}

impl<T> RingBuffer<T> {
    /// Creates a ring holding at most `capacity` values and splits it into its two roles.
    ///
    /// Fails with [`QueueError::ZeroCapacity`] when `capacity` is 0.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(capacity: usize) -> Result<(Producer<T>, Consumer<T>), QueueError> {
        if capacity == 0 {
            return Err(QueueError::ZeroCapacity);
        }
        let slots = (0..=capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();
        let ring = Arc::new(Self {
            write: CachePadded::new(AtomicUsize::new(0)),
            read: CachePadded::new(AtomicUsize::new(0)),
            slots,
        });
        debug!(capacity, "ring buffer allocated");

        let producer = Producer {
            ring: Arc::clone(&ring),
        };
        let consumer = Consumer { ring };
        Ok((producer, consumer))
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    #[inline]
    fn advance(&self, cursor: usize) -> usize {
        (cursor + 1) % self.slots.len()
    }

    fn len(&self) -> usize {
        let write = self.write.load(Acquire);
        let read = self.read.load(Acquire);
        (write + self.slots.len() - read) % self.slots.len()
    }

    fn is_full(&self) -> bool {
        self.advance(self.write.load(Acquire)) == self.read.load(Acquire)
    }
}

impl<T> fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("write", &self.write.load(Relaxed))
            .field("read", &self.read.load(Relaxed))
            .finish()
    }
}

impl<T> Drop for RingBuffer<T> {
    fn drop(&mut self) {
        let write = *self.write.get_mut();
        let mut read = *self.read.get_mut();
        trace!(
            unread = (write + self.slots.len() - read) % self.slots.len(),
            "ring buffer dropped"
        );
        while read != write {
            unsafe { self.slots[read].get_mut().assume_init_drop() };
            read = (read + 1) % self.slots.len();
        }
    }
}

/// The writing half of a [`RingBuffer`]. There is exactly one per ring.
#[derive(Debug)]
pub struct Producer<T> {
    ring: Arc<RingBuffer<T>>,
}

impl<T> Producer<T> {
    /// Moves `value` into the next free slot.
    ///
    /// Returns the value inside [`Full`] if the consumer has not freed a slot yet; nothing is
    /// written in that case.
    pub fn push(&mut self, value: T) -> Result<(), Full<T>> {
        let ring = &*self.ring;
        let write = ring.write.load(Relaxed);
        let next_write = ring.advance(write);

        // The buffer is full if the next write position would be the same as the read position.
        if next_write == ring.read.load(Acquire) {
            return Err(Full(value));
        }

        // The consumer finished with this slot before it published the read cursor we just
        // acquired, and it cannot reach it again until we publish `next_write`.
        unsafe { (*ring.slots[write].get()).write(value) };

        // Make the new value available by updating the write cursor.
        ring.write.store(next_write, Release);
        Ok(())
    }

    /// Snapshot of whether the next push would fail. Stale as soon as it returns.
    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }

    /// Snapshot of how many values are waiting to be popped.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// True once the consumer has been dropped; pushed values would never be read.
    pub fn is_abandoned(&self) -> bool {
        abandoned(&self.ring)
    }
}

fn abandoned<T>(ring: &Arc<RingBuffer<T>>) -> bool {
    let alone = Arc::strong_count(ring) == 1;
    if alone {
        // Pairs with the release decrement of the dropped handle, so its last cursor store is
        // visible to the caller's next load.
        fence(Acquire);
    }
    alone
}

/// The reading half of a [`RingBuffer`]. There is exactly one per ring.
#[derive(Debug)]
pub struct Consumer<T> {
    ring: Arc<RingBuffer<T>>,
}

impl<T> Consumer<T> {
    /// Takes the oldest value out of the ring.
    ///
    /// Fails with [`QueueError::NoPendingItems`] when the ring is empty.
    pub fn pop(&mut self) -> Result<T, QueueError> {
        let ring = &*self.ring;
        let read = ring.read.load(Relaxed);

        // Acquire pairs with the producer's release so the slot write is visible.
        if read == ring.write.load(Acquire) {
            return Err(QueueError::NoPendingItems);
        }

        let value = unsafe { (*ring.slots[read].get()).assume_init_read() };

        // Hand the slot back to the producer.
        ring.read.store(ring.advance(read), Release);
        Ok(value)
    }

    /// Borrows the oldest value without removing it.
    pub fn front(&mut self) -> Result<&T, QueueError> {
        let ring = &*self.ring;
        let read = ring.read.load(Relaxed);
        if read == ring.write.load(Acquire) {
            return Err(QueueError::NoPendingItems);
        }
        // The borrow of `self` keeps `pop` from running while the reference lives.
        Ok(unsafe { (*ring.slots[read].get()).assume_init_ref() })
    }

    /// Snapshot of whether the producer would currently be refused.
    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.read.load(Relaxed) == self.ring.write.load(Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// True once the producer has been dropped; whatever is left is all there will be.
    pub fn is_abandoned(&self) -> bool {
        abandoned(&self.ring)
    }
}


#[cfg(test)]
mod ring_brutal_stress_tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct StressPayload {
        id: u64,
        data: Vec<u8>,
        checksum: u64,
    }

    impl StressPayload {
        fn new(id: u64, size: usize) -> Self {
            let data: Vec<u8> = (0..size)
                .map(|i| (id as u8).wrapping_add(i as u8))
                .collect();
            let checksum = data.iter().map(|&b| b as u64).sum::<u64>().wrapping_add(id);
            Self { id, data, checksum }
        }

        fn verify(&self) -> bool {
            let expected_checksum = self
                .data
                .iter()
                .map(|&b| b as u64)
                .sum::<u64>()
                .wrapping_add(self.id);
            self.checksum == expected_checksum
        }
    }

    /// A single free slot keeps the producer and consumer fighting over the same cursors. Every
    /// payload is moved, never cloned, so a lost or doubled slot shows up as a count mismatch.
    #[test]
    fn tiny_buffer_high_contention() {
        const NUM_MESSAGES: u64 = 10_000;

        let (mut prod, mut cons) = RingBuffer::<StressPayload>::new(1).unwrap();
        let barrier = Arc::new(Barrier::new(2));

        let prod_barrier = Arc::clone(&barrier);
        let producer = thread::spawn(move || {
            let mut writes_succeeded = 0;
            prod_barrier.wait();

            for i in 0..NUM_MESSAGES {
                let mut payload = StressPayload::new(i, 8 + (i % 128) as usize);
                loop {
                    match prod.push(payload) {
                        Ok(()) => {
                            writes_succeeded += 1;
                            break;
                        }
                        Err(Full(rejected)) => {
                            payload = rejected;
                            thread::sleep(Duration::from_nanos(1));
                        }
                    }
                }
            }
            writes_succeeded
        });

        let cons_barrier = Arc::clone(&barrier);
        let consumer = thread::spawn(move || {
            let mut received = HashSet::new();
            cons_barrier.wait();

            while received.len() < NUM_MESSAGES as usize {
                match cons.pop() {
                    Ok(payload) => {
                        assert!(payload.verify(), "Payload {} corrupted!", payload.id);
                        assert_eq!(payload.id, received.len() as u64, "out of order");
                        assert!(received.insert(payload), "Duplicate payload received!");
                    }
                    Err(QueueError::NoPendingItems) => {
                        thread::sleep(Duration::from_nanos(1));
                    }
                    Err(e) => panic!("Unexpected consumer error: {:?}", e),
                }
            }
            received.len() as u64
        });

        let writes = producer.join().expect("Producer panicked");
        let reads = consumer.join().expect("Consumer panicked");

        assert_eq!(writes, NUM_MESSAGES, "Producer failed to write all messages!");
        assert_eq!(reads, NUM_MESSAGES, "Consumer failed to receive all messages!");
    }

    /// Several independent rings hammered at once must not leak values into each other.
    #[test]
    fn multiple_isolated_buffers() {
        const NUM_BUFFERS: usize = 4;
        const MESSAGES_PER_BUFFER: u64 = 5_000;

        let mut handles = vec![];
        let total_writes = Arc::new(AtomicU64::new(0));
        let total_reads = Arc::new(AtomicU64::new(0));
        let barrier = Arc::new(Barrier::new(NUM_BUFFERS * 2));

        for buffer_id in 0..NUM_BUFFERS {
            let (mut prod, mut cons) = RingBuffer::<StressPayload>::new(2).unwrap();

            let prod_barrier = Arc::clone(&barrier);
            let prod_writes = Arc::clone(&total_writes);
            handles.push(thread::spawn(move || {
                prod_barrier.wait();
                for i in 0..MESSAGES_PER_BUFFER {
                    let msg_id = (buffer_id as u64 * MESSAGES_PER_BUFFER) + i;
                    let mut payload = StressPayload::new(msg_id, 32);
                    while let Err(Full(rejected)) = prod.push(payload) {
                        payload = rejected;
                        thread::sleep(Duration::from_nanos(1));
                    }
                    prod_writes.fetch_add(1, Ordering::Relaxed);
                }
            }));

            let cons_barrier = Arc::clone(&barrier);
            let cons_reads = Arc::clone(&total_reads);
            handles.push(thread::spawn(move || {
                let mut received_count = 0;
                cons_barrier.wait();
                while received_count < MESSAGES_PER_BUFFER {
                    if let Ok(payload) = cons.pop() {
                        assert!(payload.verify(), "Corrupted payload in buffer {}", buffer_id);
                        assert_eq!(
                            payload.id / MESSAGES_PER_BUFFER,
                            buffer_id as u64,
                            "Message received in wrong buffer!"
                        );
                        cons_reads.fetch_add(1, Ordering::Relaxed);
                        received_count += 1;
                    } else {
                        thread::sleep(Duration::from_nanos(1));
                    }
                }
            }));
        }

        for handle in handles {
            handle.join().expect("Thread panicked");
        }

        let expected_total = NUM_BUFFERS as u64 * MESSAGES_PER_BUFFER;
        assert_eq!(total_writes.load(Ordering::SeqCst), expected_total, "Lost writes across buffers!");
        assert_eq!(total_reads.load(Ordering::SeqCst), expected_total, "Lost reads across buffers!");
    }

    /// Pairs spinning aggressively on neighbouring rings, provoking ordering bugs and false sharing.
    #[test]
    fn cache_line_contention() {
        const NUM_ITERATIONS: u64 = 10_000;
        const NUM_PAIRS: usize = 4;

        let corruption_detected = Arc::new(AtomicBool::new(false));
        let barrier = Arc::new(Barrier::new(NUM_PAIRS * 2));
        let mut handles = vec![];

        for i in 0..NUM_PAIRS {
            let (mut prod, mut cons) = RingBuffer::<u64>::new(7).unwrap();

            let prod_barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                prod_barrier.wait();
                for j in 0..NUM_ITERATIONS {
                    let value = (i as u64) << 32 | j;
                    while prod.push(value).is_err() {
                        std::hint::spin_loop();
                    }
                }
            }));

            let cons_barrier = Arc::clone(&barrier);
            let cons_corruption_flag = Arc::clone(&corruption_detected);
            handles.push(thread::spawn(move || {
                cons_barrier.wait();
                for j in 0..NUM_ITERATIONS {
                    loop {
                        if let Ok(value) = cons.pop() {
                            if (value >> 32) as usize != i || value & 0xFFFF_FFFF != j {
                                cons_corruption_flag.store(true, Ordering::Relaxed);
                            }
                            break;
                        }
                        std::hint::spin_loop();
                    }
                }
            }));
        }

        for handle in handles {
            handle.join().expect("Thread panicked");
        }

        assert!(
            !corruption_detected.load(Ordering::Relaxed),
            "Data corruption detected, possibly due to cache line/memory ordering issues!"
        );
    }
}
