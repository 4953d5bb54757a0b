//! Lock-free inter-thread FIFO queues.
//!
//! Two independent primitives live here:
//! - [`RingBuffer`]: a bounded, wait-free single-producer/single-consumer ring, split into a
//!   [`Producer`] and a [`Consumer`] handle at construction.
//! - [`UnboundedQueue`]: an unbounded, lock-free multi-producer/multi-consumer linked queue whose
//!   retired nodes are reclaimed through epochs.
//!
//! The [`harness`] module drives both queues from many threads and audits the consumed values
//! for loss, duplication and reordering.
use thiserror::Error;

pub mod harness;
pub mod padding;
pub mod queues;
pub mod trace;

pub use queues::ring::{Consumer, Full, Producer, RingBuffer};
pub use queues::unbounded::UnboundedQueue;

/// Error type for all queues
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("RingBuffer capacity must be greater than 0")]
    ZeroCapacity,
    #[error("Nothing to read, no pending items")]
    NoPendingItems,
    #[error("Successor link not yet written, a push is still publishing")]
    LinkPending,
    #[error("Invalid stress configuration: {key}={value}")]
    InvalidConfig { key: String, value: String },
}

impl QueueError {
    /// Whether the failure only reflects the queue's state at the moment of the call.
    ///
    /// Neither an empty read nor a pending link is permanent; callers should back off and retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::NoPendingItems | QueueError::LinkPending)
    }
}
