//! Typed views over live marrow objects.
//!
//! This crate provides:
//! - Record layouts describing the in-memory shape of every object kind
//! - Views that read and write an object's fields in place
//! - Capability scopes gating writes that can corrupt the runtime
//! - Moves and swaps of object bodies between addresses
//! - Type patching with exact restore of the original attributes and slots
//!
//! ```text
//!   Obj ──view()──► AnyView ──► View ──► ObjectRecord ──► RecordLayout
//!                     │          │             │
//!                     │          │             └── heap block (size, prefix)
//!                     │          └── strong / weak reference, capability flag
//!                     └── IntView, StrView, TupleView, TypeView, ...
//! ```
//!
//! # Example
//!
//! ```
//! use marrow_inspect::{view, unsafe_global};
//! use marrow_runtime::types::float;
//!
//! let x = float::new(1.5).unwrap();
//! let v = view(&x).unwrap();
//! let f = v.as_float().unwrap();
//! assert_eq!(f.value().unwrap(), 1.5);
//!
//! // Header writes need a capability.
//! assert!(v.set_ref_count(7).is_err());
//! let _scope = unsafe_global();
//! let count = v.ref_count().unwrap();
//! v.set_ref_count(count).unwrap();
//! ```

#![deny(unsafe_op_in_unsafe_fn)]

pub mod capability;
pub mod catalog;
pub mod config;
pub mod error;
pub mod layout;
mod moves;
pub mod record;
pub mod slots;
pub mod type_record;
pub mod view;

// Re-export commonly used items
pub use capability::{GlobalScope, LocalScope, ViewsScope, is_active, unsafe_global, unsafe_views};
pub use catalog::{RecordFamily, RecordKind};
pub use config::{ConfigError, ViewConfig};
pub use error::{InspectError, LayoutError, Result};
pub use layout::{Access, FieldDecl, FieldDescriptor, FieldType, LayoutBuilder, Prim, RecordLayout};
pub use record::{Address, AttachedTable, FieldValue, ObjectRecord};
pub use slots::{PatchValue, implement};
pub use type_record::{MutableScope, SlotTable, TypeRecord};
pub use view::{
    AnyView, DictView, FloatView, InstanceView, IntView, ListView, StrView, TupleView, TypeView, View, view,
    view_with,
};

#[cfg(test)]
static TEST_LOCK: parking_lot::Mutex<()> = parking_lot::Mutex::new(());

/// Serializes tests that touch process-wide state: the global capability
/// and the built-in types.
#[cfg(test)]
pub(crate) fn test_lock() -> parking_lot::MutexGuard<'static, ()> {
    TEST_LOCK.lock()
}
