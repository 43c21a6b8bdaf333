//! A single free-list guarded by a spinlock, holding chunks the collector
//! has coalesced and published for any starving thread to draw from.
//! Sorted by size descending at the moment of publication, so the head is
//! always the largest chunk currently available.

use std::cell::Cell;
use std::ptr::null_mut;

use crate::chunk::{next_of, size_of_chunk};
use crate::config::MIN_CHUNK;
use crate::reserve::ThreadReserve;
use crate::spinlock::SpinLock;

struct GlobalHeap {
    lock: SpinLock,
    head: Cell<*mut u8>,
}

unsafe impl Sync for GlobalHeap {}

static HEAP: GlobalHeap = GlobalHeap {
    lock: SpinLock::new(),
    head: Cell::new(null_mut()),
};

/// Pop the head chunk if it is big enough to serve `needed` bytes.
fn pop_if_fits(needed: usize) -> Option<*mut u8> {
    HEAP.lock.lock();
    let head = HEAP.head.get();
    let result = if !head.is_null() && unsafe { size_of_chunk(head) } >= needed {
        HEAP.head.set(unsafe { next_of(head) });
        Some(head)
    } else {
        None
    };
    HEAP.lock.unlock();
    result
}

/// Swap in a freshly-sorted free-list and return the list it replaced, so
/// the collector can fold it into its next coalescing pass. A whole-list
/// swap means allocators never observe a half-updated heap.
pub(crate) fn publish(new_head: *mut u8) -> *mut u8 {
    HEAP.lock.lock();
    let old = HEAP.head.get();
    HEAP.head.set(new_head);
    HEAP.lock.unlock();
    old
}

/// Pop the head chunk if it fits, splitting a remainder into the caller's
/// thread cache when the leftover is large enough to keep.
pub(crate) fn take(reserve: &ThreadReserve, needed: usize) -> Option<*mut u8> {
    let chunk = pop_if_fits(needed)?;
    let size = unsafe { size_of_chunk(chunk) };
    let remaining = size - needed;
    if remaining >= MIN_CHUNK {
        let remainder = unsafe { chunk.add(needed) };
        reserve.push_remainder(remainder, remaining);
        unsafe { crate::chunk::set_size(chunk, needed) };
    }
    Some(chunk)
}
