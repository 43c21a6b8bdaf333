//! Chunk header format and address arithmetic.
//!
//! Every chunk — live or free — starts with a 16-byte header: a `size` word
//! followed by a second word. A live chunk leaves that second word unused;
//! a free chunk overlays a successor pointer there instead, the same 16
//! bytes doing double duty as `{ size, _padding }` or `{ size, next }`
//! depending on whether the chunk is currently live or free. There is no
//! separate free-list node type: the chunk *is* the node.

use crate::config::{HEADER, MIN_CHUNK, ROUND};
use core::ptr;

/// Round `n` up to the nearest multiple of `ROUND`.
#[inline]
pub(crate) fn round_up(n: usize, to: usize) -> usize {
    (n + to - 1) / to * to
}

/// The chunk size required to serve a `bytes`-byte request, header included.
#[inline]
pub(crate) fn needed_for(bytes: usize) -> usize {
    round_up(bytes + HEADER, ROUND)
}

/// Read a chunk's `size` field.
///
/// # Safety
/// `chunk` must point at a live chunk header.
#[inline]
pub(crate) unsafe fn size_of_chunk(chunk: *mut u8) -> usize {
    ptr::read(chunk as *const usize)
}

/// Write a chunk's `size` field.
///
/// # Safety
/// `chunk` must point at at least `HEADER` writable bytes.
#[inline]
pub(crate) unsafe fn set_size(chunk: *mut u8, size: usize) {
    debug_assert!(size % ROUND == 0 && size >= MIN_CHUNK);
    ptr::write(chunk as *mut usize, size);
}

/// Address of the successor slot inside a free chunk's header (the second
/// header word).
///
/// # Safety
/// `chunk` must point at at least `HEADER` writable bytes.
#[inline]
pub(crate) unsafe fn next_slot(chunk: *mut u8) -> *mut *mut u8 {
    chunk.add(core::mem::size_of::<usize>()) as *mut *mut u8
}

/// Read a free chunk's successor pointer.
///
/// # Safety
/// `chunk` must point at a free chunk header.
#[inline]
pub(crate) unsafe fn next_of(chunk: *mut u8) -> *mut u8 {
    ptr::read(next_slot(chunk))
}

/// Write a free chunk's successor pointer.
///
/// # Safety
/// `chunk` must point at at least `HEADER` writable bytes.
#[inline]
pub(crate) unsafe fn set_next(chunk: *mut u8, next: *mut u8) {
    ptr::write(next_slot(chunk), next);
}

/// The hypothetical neighboring chunk immediately after this one.
///
/// # Safety
/// `chunk` must point at a live chunk header with a valid `size`.
#[inline]
pub(crate) unsafe fn next_adjacent(chunk: *mut u8) -> *mut u8 {
    chunk.add(size_of_chunk(chunk))
}

/// Two chunks are coalescable iff `a`'s byte range ends exactly where `b` starts.
///
/// # Safety
/// `a` must point at a live chunk header with a valid `size`.
#[inline]
pub(crate) unsafe fn coalescable(a: *mut u8, b: *mut u8) -> bool {
    next_adjacent(a) == b
}

/// Caller-visible payload pointer for a chunk.
#[inline]
pub(crate) fn payload_of(chunk: *mut u8) -> *mut u8 {
    unsafe { chunk.add(HEADER) }
}

/// Chunk start for a caller-visible payload pointer.
#[inline]
pub(crate) fn chunk_of(payload: *mut u8) -> *mut u8 {
    unsafe { payload.sub(HEADER) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn needed_for_rounds_to_16() {
        // allocate(24) -> chunk size 48
        assert_eq!(needed_for(24), 48);
        // allocate(40) -> chunk size 64
        assert_eq!(needed_for(40), 64);
        // allocate(1) -> chunk size 48
        assert_eq!(needed_for(1), 48);
        assert_eq!(needed_for(2000), 2016);
    }

    #[test]
    fn large_request_uses_default_refill() {
        // allocate(100000): needed is less than the 131072-byte default refill
        assert_eq!(needed_for(100000), 100016);
        assert!(needed_for(100000) < crate::config::REFILL_SIZE);
    }

    #[test]
    fn header_roundtrip() {
        let mut buf = [0u8; 32];
        let chunk = buf.as_mut_ptr();
        unsafe {
            set_size(chunk, 32);
            assert_eq!(size_of_chunk(chunk), 32);
            set_next(chunk, chunk);
            assert_eq!(next_of(chunk), chunk);
            assert!(coalescable(chunk, next_adjacent(chunk)));
        }
    }

    #[test]
    fn payload_chunk_roundtrip() {
        let mut buf = [0u8; 64];
        let chunk = buf.as_mut_ptr();
        let payload = payload_of(chunk);
        assert_eq!(chunk_of(payload), chunk);
    }
}
