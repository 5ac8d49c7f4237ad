//! Shared helpers for integration tests.

#![allow(dead_code)]

use parking_lot::{Mutex, MutexGuard};

static PROCESS_STATE: Mutex<()> = Mutex::new(());

/// Route tracing output to the test harness and serialize tests that
/// touch the global capability or the built-in types.
pub fn setup() -> MutexGuard<'static, ()> {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
    PROCESS_STATE.lock()
}
