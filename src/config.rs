//! Tuning constants for the allocator. None of these are
//! runtime-configurable; a single named constant replaces each magic number
//! the rest of the crate would otherwise repeat.

/// OS page size in bytes.
pub(crate) const PAGE: usize = 4096;

/// Smallest chunk the allocator will ever hand out or keep on a free-list.
pub(crate) const MIN_CHUNK: usize = 32;

/// Bytes occupied by every chunk's header (size word + successor/padding word).
pub(crate) const HEADER: usize = 16;

/// Every chunk size is rounded up to a multiple of this.
pub(crate) const ROUND: usize = 16;

/// Once a thread's cache holds at least this many bytes, it is hand off to
/// the collector on the next free.
pub(crate) const DRAIN_THRESHOLD: usize = PAGE;

/// Default number of pages requested when a thread's bump region is refilled.
pub(crate) const REFILL_PAGES: usize = 32;

/// Default refill size in bytes (`REFILL_PAGES * PAGE`).
pub(crate) const REFILL_SIZE: usize = REFILL_PAGES * PAGE;

const _: () = assert!(HEADER == 2 * core::mem::size_of::<usize>());
