//! Lock-free FIFO queues for passing values between threads.
//!
//! - `ring` holds the bounded single-producer, single-consumer `RingBuffer`, whose operations are
//!   wait-free.
//! - `unbounded` holds the multi-producer, multi-consumer `UnboundedQueue`, a linked list with a
//!   sentinel whose pops resolve contention by compare-and-swap.
pub mod ring;
pub mod unbounded;
