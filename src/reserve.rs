//! The per-thread cache (LIFO free-list), bump region, and handoff queue.
//! `cache`/`cache_end`/`cache_size`/`data`/`data_end` are mutated only by
//! the owning thread; `queue` is mutated by the owning thread (push) and
//! the collector (drain), guarded by `queue_lock`.

use std::cell::Cell;
use std::ptr::null_mut;

use crate::chunk::{next_of, next_slot, set_next, set_size, size_of_chunk};
use crate::config::MIN_CHUNK;
use crate::os;
use crate::registry;
use crate::spinlock::SpinLock;

pub(crate) struct ThreadReserve {
    cache: Cell<*mut u8>,
    cache_end: Cell<*mut *mut u8>,
    cache_size: Cell<usize>,
    queue_lock: SpinLock,
    queue: Cell<*mut u8>,
    data: Cell<*mut u8>,
    data_end: Cell<*mut u8>,
}

// Only the owning thread touches `cache`/`data`; the collector only ever
// reaches in through `drain_queue`, which is guarded by `queue_lock`.
unsafe impl Sync for ThreadReserve {}

impl ThreadReserve {
    pub(crate) fn new() -> Self {
        let r = Self {
            cache: Cell::new(null_mut()),
            cache_end: Cell::new(null_mut()),
            cache_size: Cell::new(0),
            queue_lock: SpinLock::new(),
            queue: Cell::new(null_mut()),
            data: Cell::new(null_mut()),
            data_end: Cell::new(null_mut()),
        };
        r.cache_end.set(r.cache.as_ptr());
        r
    }

    pub(crate) fn cache_size(&self) -> usize {
        self.cache_size.get()
    }

    /// Serve `needed` bytes from the cache head only — never scans further.
    /// The head is a best-effort "freshest" slot, not a best-fit search.
    pub(crate) fn pop_cache(&self, needed: usize) -> Option<*mut u8> {
        let head = self.cache.get();
        if head.is_null() {
            return None;
        }
        let head_size = unsafe { size_of_chunk(head) };
        if head_size < needed {
            return None;
        }
        let remaining = head_size - needed;
        if remaining < MIN_CHUNK {
            let next = unsafe { next_of(head) };
            self.cache.set(next);
            if next.is_null() {
                self.cache_end.set(self.cache.as_ptr());
            }
            self.cache_size.set(self.cache_size.get() - head_size);
            return Some(head);
        }

        let remainder = unsafe { head.add(needed) };
        unsafe { set_size(remainder, remaining) };
        let next = unsafe { next_of(head) };
        if next.is_null() {
            unsafe { set_next(remainder, null_mut()) };
            self.cache.set(remainder);
            self.cache_end.set(unsafe { next_slot(remainder) });
        } else {
            let next_size = unsafe { size_of_chunk(next) };
            if remaining < next_size {
                unsafe {
                    *self.cache_end.get() = remainder;
                    set_next(remainder, null_mut());
                }
                self.cache_end.set(unsafe { next_slot(remainder) });
                self.cache.set(next);
            } else {
                unsafe { set_next(remainder, next) };
                self.cache.set(remainder);
            }
        }
        self.cache_size.set(self.cache_size.get() - needed);
        unsafe { set_size(head, needed) };
        Some(head)
    }

    /// LIFO push of a freshly-freed chunk onto the cache.
    pub(crate) fn push_cache(&self, chunk: *mut u8, size: usize) {
        unsafe { set_size(chunk, size) };
        if self.cache.get().is_null() {
            self.cache_end.set(unsafe { next_slot(chunk) });
        }
        unsafe { set_next(chunk, self.cache.get()) };
        self.cache.set(chunk);
        self.cache_size.set(self.cache_size.get() + size);
    }

    /// Insert a chunk split off the global heap: head if it is at least as
    /// large as the current cache head, tail otherwise.
    pub(crate) fn push_remainder(&self, chunk: *mut u8, size: usize) {
        unsafe { set_size(chunk, size) };
        let head = self.cache.get();
        if head.is_null() {
            unsafe { set_next(chunk, null_mut()) };
            self.cache.set(chunk);
            self.cache_end.set(unsafe { next_slot(chunk) });
        } else {
            let head_size = unsafe { size_of_chunk(head) };
            if size >= head_size {
                unsafe { set_next(chunk, head) };
                self.cache.set(chunk);
            } else {
                unsafe {
                    *self.cache_end.get() = chunk;
                    set_next(chunk, null_mut());
                }
                self.cache_end.set(unsafe { next_slot(chunk) });
            }
        }
        self.cache_size.set(self.cache_size.get() + size);
    }

    /// Splice the whole cache onto the front of the handoff queue and reset
    /// the cache to empty.
    pub(crate) fn drain_to_queue(&self) {
        let cache = self.cache.get();
        if cache.is_null() {
            return;
        }
        self.queue_lock.lock();
        unsafe { *self.cache_end.get() = self.queue.get() };
        self.queue.set(cache);
        self.queue_lock.unlock();
        self.cache.set(null_mut());
        self.cache_end.set(self.cache.as_ptr());
        self.cache_size.set(0);
    }

    /// Detach the entire handoff queue for the collector.
    /// Called by the collector thread only.
    pub(crate) fn drain_queue(&self) -> *mut u8 {
        self.queue_lock.lock();
        let head = self.queue.get();
        self.queue.set(null_mut());
        self.queue_lock.unlock();
        head
    }

    /// Whether the bump region can serve `needed` bytes without overflow.
    pub(crate) fn bump_fits(&self, needed: usize) -> bool {
        let data = self.data.get() as usize;
        let end = self.data_end.get() as usize;
        data != 0 && data.checked_add(needed).map_or(false, |p| p <= end)
    }

    /// Carve `needed` bytes off the front of the bump region. Caller must
    /// have checked `bump_fits(needed)` first.
    pub(crate) fn bump_alloc(&self, needed: usize) -> *mut u8 {
        let chunk = self.data.get();
        unsafe { set_size(chunk, needed) };
        self.data.set(unsafe { chunk.add(needed) });
        chunk
    }

    /// Release the exhausted bump region's page-aligned suffix and map a
    /// fresh region of at least `needed` bytes. The sub-page prefix is
    /// intentionally forgotten, not returned to the OS.
    pub(crate) fn refill_bump(&self, needed: usize) {
        let data = self.data.get();
        if !data.is_null() {
            let last = crate::chunk::round_up(data as usize, crate::config::PAGE) as *mut u8;
            let end = self.data_end.get();
            if (last as usize) < (end as usize) {
                os::unmap(last, end as usize - last as usize);
            }
        }
        let block_size = crate::config::REFILL_SIZE.max(needed);
        let mapped = os::map(block_size);
        if mapped.is_null() {
            self.data.set(null_mut());
            self.data_end.set(null_mut());
        } else {
            self.data.set(mapped);
            self.data_end.set(unsafe { mapped.add(block_size) });
        }
    }
}

impl Drop for ThreadReserve {
    fn drop(&mut self) {
        // ThreadReserve is always `Box::leak`-ed (see DESIGN.md Open
        // Question 4); this only runs for reserves built directly in tests.
    }
}

struct ReserveHandle {
    reserve: &'static ThreadReserve,
}

impl Drop for ReserveHandle {
    fn drop(&mut self) {
        // Thread-exit hook: hand off the residual cache before this
        // thread's storage is reclaimed, or its chunks would be leaked.
        self.reserve.drain_to_queue();
        crate::collector::wake();
    }
}

std::thread_local! {
    static RESERVE: ReserveHandle = {
        let reserve: &'static ThreadReserve = Box::leak(Box::new(ThreadReserve::new()));
        registry::register(reserve);
        ReserveHandle { reserve }
    };
}

/// Access this thread's reserve, lazily constructing and registering it on
/// first use.
pub(crate) fn with_reserve<R>(f: impl FnOnce(&'static ThreadReserve) -> R) -> R {
    RESERVE.with(|h| f(h.reserve))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::payload_of;

    fn backing(bytes: usize) -> Box<[u8]> {
        vec![0u8; bytes].into_boxed_slice()
    }

    #[test]
    fn push_then_pop_reuses_same_chunk() {
        let r = ThreadReserve::new();
        let mut buf = backing(64);
        let chunk = buf.as_mut_ptr();
        r.push_cache(chunk, 48);
        assert_eq!(r.cache_size(), 48);
        let got = r.pop_cache(48).unwrap();
        assert_eq!(got, chunk);
        assert_eq!(r.cache_size(), 0);
    }

    #[test]
    fn lifo_order() {
        let r = ThreadReserve::new();
        let mut b1 = backing(48);
        let mut b2 = backing(48);
        let mut b3 = backing(48);
        r.push_cache(b1.as_mut_ptr(), 48);
        r.push_cache(b2.as_mut_ptr(), 48);
        r.push_cache(b3.as_mut_ptr(), 48);
        assert_eq!(r.pop_cache(48).unwrap(), b3.as_mut_ptr());
        assert_eq!(r.pop_cache(48).unwrap(), b2.as_mut_ptr());
        assert_eq!(r.pop_cache(48).unwrap(), b1.as_mut_ptr());
    }

    #[test]
    fn split_head_when_remainder_too_small_to_keep_separate() {
        // 64-byte chunk, request for a 48-byte payload leaves 16 < MIN_CHUNK: no split.
        let r = ThreadReserve::new();
        let mut buf = backing(64);
        let chunk = buf.as_mut_ptr();
        r.push_cache(chunk, 64);
        let got = r.pop_cache(48).unwrap();
        assert_eq!(got, chunk);
        assert_eq!(unsafe { size_of_chunk(got) }, 64);
        assert!(r.pop_cache(1).is_none() || r.cache_size() == 0);
    }

    #[test]
    fn split_leaves_min_chunk_remainder_in_cache() {
        // 64-byte chunk, request a 32-byte chunk: 32 remaining == MIN_CHUNK, splits.
        let r = ThreadReserve::new();
        let mut buf = backing(64);
        let chunk = buf.as_mut_ptr();
        r.push_cache(chunk, 64);
        let got = r.pop_cache(32).unwrap();
        assert_eq!(got, chunk);
        assert_eq!(r.cache_size(), 32);
        let remainder = r.pop_cache(32).unwrap();
        assert_eq!(unsafe { size_of_chunk(remainder) }, 32);
    }

    #[test]
    fn bump_region_serves_sequential_requests() {
        let r = ThreadReserve::new();
        let mut region = backing(256);
        r.data.set(region.as_mut_ptr());
        r.data_end.set(unsafe { region.as_mut_ptr().add(256) });
        assert!(r.bump_fits(48));
        let a = r.bump_alloc(48);
        let b = r.bump_alloc(48);
        assert_eq!(unsafe { b.offset_from(a) }, 48);
        assert!(!r.bump_fits(usize::MAX));
        let _ = payload_of(a);
    }
}
