//! Capability scopes.
//!
//! Writes that can corrupt the runtime (header fields, raw buffer pointers,
//! type reassignment, protocol slot pointers) are refused unless a
//! capability is active for the view performing them:
//!
//! ```text
//! is_active(view) = view's local flag || process-wide flag
//! ```
//!
//! Every scope is an RAII guard that restores the value it observed on
//! entry, so nested scopes unwind correctly:
//!
//! ```text
//! let outer = unsafe_global();     // false -> true
//! {
//!     let inner = unsafe_global(); // true  -> true
//! }                                // restores true
//! drop(outer);                     // restores false
//! ```
//!
//! # Threads
//!
//! The process-wide flag is shared by every thread: a scope entered on one
//! thread authorizes unsafe writes on all of them while it lasts. Code that
//! needs isolation uses per-view scopes only.

use crate::view::View;

use smallvec::SmallVec;
use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};

static GLOBAL_UNSAFE: AtomicBool = AtomicBool::new(false);

/// Whether the process-wide capability is active.
#[inline]
pub fn global_active() -> bool {
    GLOBAL_UNSAFE.load(Ordering::SeqCst)
}

/// Whether unsafe operations are authorized for `view`.
#[inline]
pub fn is_active(view: &View) -> bool {
    view.local_flag().get() || global_active()
}

// =============================================================================
// Global Scope
// =============================================================================

/// Guard for the process-wide capability.
#[must_use = "the capability ends when the guard drops"]
pub struct GlobalScope {
    prev: bool,
    // Restores must happen on the thread that entered.
    _not_send: PhantomData<*const ()>,
}

/// Enter the process-wide capability until the guard drops.
pub fn unsafe_global() -> GlobalScope {
    let prev = GLOBAL_UNSAFE.swap(true, Ordering::SeqCst);
    if !prev {
        tracing::debug!("entered global unsafe context");
    }
    GlobalScope {
        prev,
        _not_send: PhantomData,
    }
}

impl Drop for GlobalScope {
    fn drop(&mut self) {
        GLOBAL_UNSAFE.store(self.prev, Ordering::SeqCst);
    }
}

// =============================================================================
// Local Scopes
// =============================================================================

/// Guard for one view's local capability.
#[must_use = "the capability ends when the guard drops"]
pub struct LocalScope<'a> {
    flag: &'a Cell<bool>,
    prev: bool,
}

impl<'a> LocalScope<'a> {
    pub(crate) fn enter(flag: &'a Cell<bool>) -> Self {
        let prev = flag.replace(true);
        Self { flag, prev }
    }
}

impl Drop for LocalScope<'_> {
    fn drop(&mut self) {
        self.flag.set(self.prev);
    }
}

/// Guard for several views' local capabilities at once.
#[must_use = "the capability ends when the guard drops"]
pub struct ViewsScope<'a> {
    scopes: SmallVec<[LocalScope<'a>; 4]>,
}

/// Enter the local capability of every view in `views`.
pub fn unsafe_views<'a>(views: &[&'a View]) -> ViewsScope<'a> {
    ViewsScope {
        scopes: views.iter().map(|v| LocalScope::enter(v.local_flag())).collect(),
    }
}

impl Drop for ViewsScope<'_> {
    fn drop(&mut self) {
        // Unwind in reverse so a view listed twice ends up as it started.
        while let Some(scope) = self.scopes.pop() {
            drop(scope);
        }
    }
}
