//! The front-end that routes every allocation and free through
//! cache → global heap → bump region → new mapping, in exactly that
//! order (see DESIGN.md's module ledger entry for `policy` on why global
//! heap is tried before the bump region).

use std::ptr::null_mut;

use crate::chunk::{chunk_of, needed_for, payload_of, size_of_chunk};
use crate::config::{DRAIN_THRESHOLD, HEADER};
use crate::{collector, global_heap, reserve};

/// Allocate `bytes` bytes. Returns null only for a zero-byte request or an
/// OS mapping failure.
pub(crate) fn allocate(bytes: usize) -> *mut u8 {
    if bytes == 0 {
        return null_mut();
    }
    collector::ensure_spawned();
    let needed = needed_for(bytes);

    reserve::with_reserve(|r| {
        if let Some(chunk) = r.pop_cache(needed) {
            return payload_of(chunk);
        }
        if let Some(chunk) = global_heap::take(r, needed) {
            return payload_of(chunk);
        }
        if !r.bump_fits(needed) {
            r.refill_bump(needed);
            if !r.bump_fits(needed) {
                return null_mut();
            }
        }
        payload_of(r.bump_alloc(needed))
    })
}

/// Free a payload pointer previously returned by `allocate`/`resize`. A null
/// pointer is a no-op.
///
/// # Safety
/// `payload` must either be null or a pointer this allocator handed out that
/// has not already been freed.
pub(crate) unsafe fn free(payload: *mut u8) {
    if payload.is_null() {
        return;
    }
    let chunk = chunk_of(payload);
    let size = size_of_chunk(chunk);

    reserve::with_reserve(|r| {
        r.push_cache(chunk, size);
        if r.cache_size() >= DRAIN_THRESHOLD {
            r.drain_to_queue();
            collector::wake();
        }
    });
}

/// Resize a previously allocated payload to `bytes` bytes. A null
/// `payload` behaves as `allocate`. Shrinks return the same pointer
/// unchanged; growth allocates fresh memory, copies the old contents, and
/// frees the old pointer.
///
/// # Safety
/// `payload` must either be null or a pointer this allocator handed out that
/// has not already been freed.
pub(crate) unsafe fn resize(payload: *mut u8, bytes: usize) -> *mut u8 {
    if payload.is_null() {
        return allocate(bytes);
    }
    let chunk = chunk_of(payload);
    let old_size = size_of_chunk(chunk);
    let needed = needed_for(bytes);
    if needed <= old_size {
        return payload;
    }

    let new_payload = allocate(bytes);
    if new_payload.is_null() {
        return null_mut();
    }
    // Preserved as-is (see DESIGN.md Open Question 3): this copies
    // `old_size - HEADER` bytes, which the allocator itself wrote and so
    // is always safe to read, but which may exceed the caller's
    // originally requested size.
    std::ptr::copy_nonoverlapping(payload, new_payload, old_size - HEADER);
    free(payload);
    new_payload
}
