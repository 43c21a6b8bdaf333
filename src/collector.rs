//! The single dedicated background worker that drains every thread's
//! handoff queue, coalesces adjacent chunks into an address-ordered
//! accumulator, sorts that accumulator by size descending, and publishes
//! it as the new global heap.

use std::ptr::null_mut;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

use log::{debug, trace, warn};

use crate::chunk::{coalescable, next_of, set_next, set_size, size_of_chunk};
use crate::{global_heap, registry};

static SPAWNED: AtomicBool = AtomicBool::new(false);
static AWAKENINGS: AtomicUsize = AtomicUsize::new(0);

// Mutex<()> + Condvar is the suspending wait the collector needs while
// idle; the predicate it waits on lives in `AWAKENINGS` (see DESIGN.md
// Open Question 5 for the lost-wakeup window this preserves).
static WAIT_LOCK: Mutex<()> = Mutex::new(());
static WAIT_CV: Condvar = Condvar::new();

/// Spawn the collector thread exactly once, on first allocation. A failure
/// to spawn is logged and leaves `SPAWNED` false so a later allocation may
/// retry; mutators fall through to serving allocations from their cache,
/// the global heap, and the bump region regardless, the same as any other
/// cycle in which the collector makes no progress.
pub(crate) fn ensure_spawned() {
    if SPAWNED
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
        .is_ok()
    {
        let spawned = std::thread::Builder::new()
            .name("parmalloc-collector".into())
            .spawn(collector_loop);
        if spawned.is_err() {
            warn!("failed to spawn collector thread");
            SPAWNED.store(false, Ordering::Release);
        }
    }
}

/// Signal the collector: a free just drained a thread's cache into its
/// queue and wants it merged into the global heap.
pub(crate) fn wake() {
    AWAKENINGS.fetch_add(1, Ordering::Release);
    WAIT_CV.notify_one();
}

fn collector_loop() {
    let mut deleted: *mut u8 = null_mut();
    loop {
        {
            let mut guard = WAIT_LOCK.lock().unwrap();
            while AWAKENINGS.load(Ordering::Acquire) == 0 {
                guard = WAIT_CV.wait(guard).unwrap();
            }
            AWAKENINGS.store(0, Ordering::Release);
        }
        trace!("collector woke up");

        registry::for_each(|reserve| {
            let to_insert = reserve.drain_queue();
            if !to_insert.is_null() {
                deleted = unsafe { coalesce_insert(deleted, to_insert) };
            }
        });

        let sorted = unsafe { sort_by_size_desc(deleted) };
        deleted = global_heap::publish(sorted);
        debug!("collector published a new global heap");
    }
}

/// Insert every chunk of `to_insert` into the address-ordered `deleted`
/// accumulator, coalescing on the fly.
///
/// # Safety
/// Every chunk reachable from `deleted` or `to_insert` must be a valid,
/// exclusively-owned free chunk.
unsafe fn coalesce_insert(mut deleted: *mut u8, to_insert_list: *mut u8) -> *mut u8 {
    let mut to_insert = to_insert_list;
    while !to_insert.is_null() {
        let next = next_of(to_insert);

        if deleted.is_null() {
            set_next(to_insert, null_mut());
            deleted = to_insert;
        } else if (to_insert as usize) < (deleted as usize) {
            if coalescable(to_insert, deleted) {
                set_size(to_insert, size_of_chunk(to_insert) + size_of_chunk(deleted));
                set_next(to_insert, next_of(deleted));
            } else {
                set_next(to_insert, deleted);
            }
            deleted = to_insert;
        } else {
            let mut prev = deleted;
            let mut head = next_of(deleted);
            loop {
                if head.is_null() {
                    if coalescable(prev, to_insert) {
                        set_size(prev, size_of_chunk(prev) + size_of_chunk(to_insert));
                    } else {
                        set_next(prev, to_insert);
                        set_next(to_insert, null_mut());
                    }
                    break;
                }
                if (to_insert as usize) < (head as usize) {
                    if coalescable(to_insert, head) {
                        let combined = size_of_chunk(to_insert) + size_of_chunk(head);
                        if coalescable(prev, to_insert) {
                            set_size(prev, size_of_chunk(prev) + combined);
                            set_next(prev, next_of(head));
                        } else {
                            set_size(to_insert, combined);
                            set_next(to_insert, next_of(head));
                            set_next(prev, to_insert);
                        }
                    } else if coalescable(prev, to_insert) {
                        set_size(prev, size_of_chunk(prev) + size_of_chunk(to_insert));
                    } else {
                        set_next(prev, to_insert);
                        set_next(to_insert, head);
                    }
                    break;
                }
                prev = head;
                head = next_of(head);
            }
        }

        to_insert = next;
    }
    deleted
}

/// Merge-sort the accumulator by size descending.
///
/// # Safety
/// Every chunk reachable from `head` must be a valid free chunk.
unsafe fn sort_by_size_desc(head: *mut u8) -> *mut u8 {
    if head.is_null() || next_of(head).is_null() {
        return head;
    }
    let mut slow = head;
    let mut fast = next_of(head);
    while !fast.is_null() {
        fast = next_of(fast);
        if fast.is_null() {
            break;
        }
        fast = next_of(fast);
        slow = next_of(slow);
    }
    let second_half = next_of(slow);
    set_next(slow, null_mut());

    let left = sort_by_size_desc(head);
    let right = sort_by_size_desc(second_half);
    merge_desc(left, right)
}

unsafe fn merge_desc(mut a: *mut u8, mut b: *mut u8) -> *mut u8 {
    let mut out: *mut u8 = null_mut();
    let mut tail: *mut *mut u8 = &mut out;
    loop {
        if b.is_null() {
            *tail = a;
            break;
        }
        if a.is_null() {
            *tail = b;
            break;
        }
        if size_of_chunk(a) >= size_of_chunk(b) {
            *tail = a;
            tail = crate::chunk::next_slot(a);
            a = next_of(a);
        } else {
            *tail = b;
            tail = crate::chunk::next_slot(b);
            b = next_of(b);
        }
    }
    out
}

/// Release a coalesced run of chunks back to the OS when it spans whole
/// pages. Never called from `collector_loop`: this allocator keeps mapped
/// pages forever once obtained and never releases them back to the OS.
/// Kept as a disabled alternate code path, the way a page source sometimes
/// keeps an unused `MADV_FREE` branch around.
#[allow(dead_code)]
unsafe fn return_to_os(mut head: *mut u8) {
    while !head.is_null() {
        let next = next_of(head);
        let size = size_of_chunk(head);
        let pages = size / crate::config::PAGE * crate::config::PAGE;
        if pages > 0 {
            crate::os::unmap(head, pages);
        }
        head = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backing(bytes: usize) -> Box<[u8]> {
        vec![0u8; bytes].into_boxed_slice()
    }

    unsafe fn make_chunk(buf: &mut [u8], size: usize) -> *mut u8 {
        let p = buf.as_mut_ptr();
        set_size(p, size);
        set_next(p, null_mut());
        p
    }

    #[test]
    fn coalesces_two_adjacent_chunks() {
        let mut region = backing(64);
        let base = region.as_mut_ptr();
        unsafe {
            let a = base;
            set_size(a, 32);
            let b = base.add(32);
            set_size(b, 32);
            set_next(b, null_mut());
            set_next(a, null_mut());

            // insert b first, then a (address order reversed on purpose)
            let deleted = coalesce_insert(null_mut(), b);
            let deleted = coalesce_insert(deleted, a);

            assert_eq!(deleted, a);
            assert_eq!(size_of_chunk(deleted), 64);
            assert!(next_of(deleted).is_null());
        }
    }

    #[test]
    fn leaves_non_adjacent_chunks_separate() {
        let mut r1 = backing(32);
        let mut r2 = backing(32);
        unsafe {
            let a = make_chunk(&mut r1, 32);
            let b = make_chunk(&mut r2, 32);
            let (lo, hi) = if a < b { (a, b) } else { (b, a) };
            let deleted = coalesce_insert(null_mut(), hi);
            let deleted = coalesce_insert(deleted, lo);
            assert_eq!(deleted, lo);
            assert_eq!(size_of_chunk(deleted), 32);
            assert_eq!(next_of(deleted), hi);
            assert_eq!(size_of_chunk(next_of(deleted)), 32);
        }
    }

    #[test]
    fn sorts_descending_by_size() {
        let mut r1 = backing(16 + 16);
        let mut r2 = backing(16 + 48);
        let mut r3 = backing(16 + 32);
        unsafe {
            let a = make_chunk(&mut r1, 32);
            let b = make_chunk(&mut r2, 64);
            let c = make_chunk(&mut r3, 48);
            set_next(a, b);
            set_next(b, c);
            set_next(c, null_mut());

            let sorted = sort_by_size_desc(a);
            assert_eq!(size_of_chunk(sorted), 64);
            let second = next_of(sorted);
            assert_eq!(size_of_chunk(second), 48);
            let third = next_of(second);
            assert_eq!(size_of_chunk(third), 32);
            assert!(next_of(third).is_null());
        }
    }
}
