//! Reference-counted object model for marrow.
//!
//! This crate provides:
//! - The object header and owned references ([`Obj`])
//! - Type objects with protocol slot tables and dunder-to-slot mapping
//! - Built-in kinds: int, float, str, tuple, list, dict, function, None
//! - User classes with member slots and inline or managed dictionaries
//! - Generic operations that dispatch through the current slot pointers
//!
//! Objects live in the [`marrow_gc`] heap, which records block sizes and
//! prefixes so that object bodies can be inspected and rewritten in place.
//!
//! # Example
//!
//! ```
//! use marrow_runtime::ops;
//! use marrow_runtime::types::int;
//!
//! let a = int::new(40).unwrap();
//! let b = int::new(2).unwrap();
//! let c = ops::add(&a, &b).unwrap();
//! assert_eq!(int::value(&c).unwrap(), 42);
//! ```

#![deny(unsafe_op_in_unsafe_fn)]

pub mod error;
pub mod object;
pub mod ops;
pub mod types;

// Re-export commonly used items
pub use error::{RtResult, RuntimeError};
pub use object::attr::{call, call_method, del_attr, get_attr, set_attr, type_lookup};
pub use object::class::{ClassSpec, DictConvention, new_class};
pub use object::protocols::Protocol;
pub use object::registry::{TypeRegistry, global_registry};
pub use object::slots::{SlotDef, SlotFn, SlotSignature};
pub use object::type_obj::{TypeFlags, TypeObject};
pub use object::weakref::WeakRef;
pub use object::{Obj, ObjectHeader, VarHeader};
pub use types::{builtins, none};
