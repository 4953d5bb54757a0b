//! Cache-line layout helpers shared by the queues.
//!
//! Hot atomics written by different threads are wrapped in [`CachePadded`], whose alignment is
//! picked per target architecture (128 bytes on x86_64 and aarch64, 64 on most others), so the
//! producer's cursor and the consumer's cursor never ping-pong the same line.
use std::mem::{align_of, size_of};
use std::sync::atomic::AtomicUsize;

pub use crossbeam_utils::CachePadded;

/// Width of a cache line (or prefetch pair) on the compilation target.
pub const CACHE_LINE_SIZE: usize = align_of::<CachePadded<u8>>();

// A padded cursor must fill its line exactly, otherwise a neighbour could share it.
const _: () = assert!(size_of::<CachePadded<AtomicUsize>>() == CACHE_LINE_SIZE);
const _: () = assert!(CACHE_LINE_SIZE >= size_of::<AtomicUsize>());
