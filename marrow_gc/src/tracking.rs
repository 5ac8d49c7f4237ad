//! Collector tracking list.
//!
//! Container objects carry a [`GcHead`] immediately before their address.
//! Tracked objects are threaded onto one intrusive, circular, doubly linked
//! list. Nothing here walks the object graph; the list only records which
//! objects a cycle collector would be allowed to visit, and the heads stay
//! with the block they were allocated in.
//!
//! ```text
//!   sentinel ⇄ head(a) ⇄ head(b) ⇄ ... ⇄ sentinel
//! ```

use crate::heap::GC_HEAD_SIZE;

use parking_lot::Mutex;
use std::ptr;
use std::sync::OnceLock;

/// Collector link words stored before a container object.
#[repr(C)]
#[derive(Debug)]
pub struct GcHead {
    /// Next head in the list, null when untracked.
    pub gc_next: *mut GcHead,
    /// Previous head in the list, null when untracked.
    pub gc_prev: *mut GcHead,
}

const _: () = assert!(size_of::<GcHead>() == GC_HEAD_SIZE);

/// Head belonging to the object at `addr`.
///
/// # Safety
///
/// The object's block must have been allocated with a collector head.
#[inline]
pub unsafe fn gc_head(addr: usize) -> *mut GcHead {
    (addr - GC_HEAD_SIZE) as *mut GcHead
}

struct TrackedList {
    sentinel: *mut GcHead,
    len: usize,
}

// Safety: the sentinel is leaked and only reached through the mutex.
unsafe impl Send for TrackedList {}

static TRACKED: OnceLock<Mutex<TrackedList>> = OnceLock::new();

fn tracked_list() -> &'static Mutex<TrackedList> {
    TRACKED.get_or_init(|| {
        let sentinel = Box::into_raw(Box::new(GcHead {
            gc_next: ptr::null_mut(),
            gc_prev: ptr::null_mut(),
        }));
        // Safety: freshly allocated and never freed.
        unsafe {
            (*sentinel).gc_next = sentinel;
            (*sentinel).gc_prev = sentinel;
        }
        Mutex::new(TrackedList { sentinel, len: 0 })
    })
}

/// Start tracking the object at `addr`.
///
/// Returns `false` if it was already tracked.
///
/// # Safety
///
/// The object's block must carry a collector head and stay allocated until
/// [`untrack`] is called.
pub unsafe fn track(addr: usize) -> bool {
    let mut list = tracked_list().lock();
    // Safety: caller guarantees the head exists.
    unsafe {
        let head = gc_head(addr);
        if !(*head).gc_next.is_null() {
            return false;
        }
        let sentinel = list.sentinel;
        let last = (*sentinel).gc_prev;
        (*head).gc_prev = last;
        (*head).gc_next = sentinel;
        (*last).gc_next = head;
        (*sentinel).gc_prev = head;
    }
    list.len += 1;
    true
}

/// Stop tracking the object at `addr`.
///
/// Returns `false` if it was not tracked.
///
/// # Safety
///
/// The object's block must carry a collector head.
pub unsafe fn untrack(addr: usize) -> bool {
    let mut list = tracked_list().lock();
    // Safety: caller guarantees the head exists; linked neighbours are live.
    unsafe {
        let head = gc_head(addr);
        let next = (*head).gc_next;
        if next.is_null() {
            return false;
        }
        let prev = (*head).gc_prev;
        (*prev).gc_next = next;
        (*next).gc_prev = prev;
        (*head).gc_next = ptr::null_mut();
        (*head).gc_prev = ptr::null_mut();
    }
    list.len -= 1;
    true
}

/// Check whether the object at `addr` is on the tracking list.
///
/// # Safety
///
/// The object's block must carry a collector head.
#[inline]
pub unsafe fn is_tracked(addr: usize) -> bool {
    let _list = tracked_list().lock();
    // Safety: caller guarantees the head exists.
    unsafe { !(*gc_head(addr)).gc_next.is_null() }
}

/// Number of tracked objects.
pub fn tracked_count() -> usize {
    tracked_list().lock().len
}

/// Visit the address of every tracked object.
pub fn for_each_tracked<F>(mut f: F)
where
    F: FnMut(usize),
{
    let list = tracked_list().lock();
    let sentinel = list.sentinel;
    // Safety: every linked head belongs to a live block.
    unsafe {
        let mut cursor = (*sentinel).gc_next;
        while cursor != sentinel {
            f(cursor as usize + GC_HEAD_SIZE);
            cursor = (*cursor).gc_next;
        }
    }
}
