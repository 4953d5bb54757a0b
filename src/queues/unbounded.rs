//! Unbounded multi-producer, multi-consumer FIFO queue built on an append-only linked list.
//!
//! Producers claim their position with a single atomic exchange on `tail` and link the
//! predecessor afterwards. Consumers advance `head` by compare-and-swap. Nodes passed by `head`
//! are retired to `crossbeam-epoch` and freed once no pinned thread can still observe them.
use std::fmt;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};

use crossbeam_epoch::{self as epoch, Atomic, Owned};

use crate::padding::CachePadded;
use crate::trace::debug;
use crate::QueueError;

struct Node<T> {
    /// Uninitialized in the sentinel, and again once the value has been moved out by a pop.
    value: MaybeUninit<T>,
    /// Written exactly once, by the producer whose exchange made this node its predecessor.
    next: Atomic<Node<T>>,
}

impl<T> Node<T> {
    fn sentinel() -> Self {
        Self {
            value: MaybeUninit::uninit(),
            next: Atomic::null(),
        }
    }
}

/// Lock-free unbounded MPMC queue. Share it between threads with an `Arc`.
pub struct UnboundedQueue<T> {
    /// Node before the next value to pop (removal point).
    head: CachePadded<Atomic<Node<T>>>,
    /// Most recently published node (insertion point).
    tail: CachePadded<Atomic<Node<T>>>,
    _marker: PhantomData<T>,
}

// Values cross threads by move only; nodes are reached through epoch-protected pointers.
unsafe impl<T: Send> Send for UnboundedQueue<T> {}
unsafe impl<T: Send> Sync for UnboundedQueue<T> {}

impl<T> Default for UnboundedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> UnboundedQueue<T> {
    /// Creates an empty queue anchored on a fresh sentinel node.
    pub fn new() -> Self {
        let queue = Self {
            head: CachePadded::new(Atomic::null()),
            tail: CachePadded::new(Atomic::null()),
            _marker: PhantomData,
        };
        // Nobody else can see the queue yet.
        let guard = unsafe { epoch::unprotected() };
        let sentinel = Owned::new(Node::sentinel()).into_shared(guard);
        queue.head.store(sentinel, Relaxed);
        queue.tail.store(sentinel, Relaxed);
        debug!("unbounded queue created");
        queue
    }

    /// Appends `value` at the back of the queue.
    ///
    /// Never fails for capacity reasons. Allocation failure aborts the process.
    pub fn push(&self, value: T) {
        let guard = &epoch::pin();
        let node = Owned::new(Node {
            value: MaybeUninit::new(value),
            next: Atomic::null(),
        })
        .into_shared(guard);

        // Publish ourselves as the insertion point; the exchange hands us our predecessor.
        let prev = self.tail.swap(node, AcqRel, guard);

        // `head` cannot move past `prev` while its link is null, so `prev` is still allocated.
        // Until this store lands, pops report `LinkPending`.
        unsafe { prev.deref() }.next.store(node, Release);
    }

    /// Removes the value at the front of the queue.
    ///
    /// Fails with [`QueueError::NoPendingItems`] when `head` has caught up with `tail`, and with
    /// [`QueueError::LinkPending`] when a producer has published a node but not linked it yet.
    /// Both are transient; retry later.
    pub fn pop(&self) -> Result<T, QueueError> {
        let guard = &epoch::pin();
        loop {
            let head = self.head.load(Acquire, guard);
            if head == self.tail.load(Acquire, guard) {
                return Err(QueueError::NoPendingItems);
            }

            // Pinned, so even if another consumer already retired `head` it stays allocated.
            let next = unsafe { head.deref() }.next.load(Acquire, guard);
            if next.is_null() {
                return Err(QueueError::LinkPending);
            }

            if self
                .head
                .compare_exchange(head, next, AcqRel, Acquire, guard)
                .is_ok()
            {
                // Winning the exchange grants sole ownership of `next`'s value; `next` becomes
                // the new sentinel and its value slot is never read again.
                let value = unsafe { next.deref().value.assume_init_read() };
                unsafe { guard.defer_destroy(head) };
                return Ok(value);
            }
        }
    }

    /// Snapshot of whether a pop would currently find nothing. Stale as soon as it returns.
    pub fn is_empty(&self) -> bool {
        let guard = &epoch::pin();
        let head = self.head.load(Acquire, guard);
        head == self.tail.load(Acquire, guard)
            || unsafe { head.deref() }.next.load(Acquire, guard).is_null()
    }
}

impl<T> fmt::Debug for UnboundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnboundedQueue")
            .field("is_empty", &self.is_empty())
            .finish()
    }
}

impl<T> Drop for UnboundedQueue<T> {
    fn drop(&mut self) {
        // `&mut self`: every push has finished linking and no pop is in flight.
        unsafe {
            let guard = epoch::unprotected();
            let mut node = self.head.load(Relaxed, guard);
            let mut is_sentinel = true;
            while !node.is_null() {
                let mut owned = node.into_owned();
                node = owned.next.load(Relaxed, guard);
                if !is_sentinel {
                    owned.value.assume_init_drop();
                }
                is_sentinel = false;
                drop(owned);
            }
        }
    }
}
