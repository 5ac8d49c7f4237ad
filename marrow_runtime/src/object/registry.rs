//! Type registry.
//!
//! Records every live type object together with the bookkeeping that does
//! not fit in the type's own fixed layout: direct subclasses (for cache
//! invalidation) and the named member slots of user classes.

use crate::object::type_obj::TypeObject;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// A named pointer-sized member stored inside instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// Attribute name.
    pub name: Box<str>,
    /// Byte offset from the object address.
    pub offset: usize,
}

/// Per-type bookkeeping.
#[derive(Debug, Default, Clone)]
pub struct TypeInfo {
    /// Addresses of direct subclasses.
    pub subclasses: SmallVec<[usize; 4]>,
    /// Member slots, including inherited ones.
    pub members: Vec<Member>,
}

/// Global type registry.
///
/// Holds bookkeeping for all live type objects, keyed by address.
/// Built-in types are registered at startup; user types are added when
/// created and removed when deallocated.
pub struct TypeRegistry {
    types: RwLock<FxHashMap<usize, TypeInfo>>,
    next_version: AtomicU64,
}

impl TypeRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            types: RwLock::new(FxHashMap::default()),
            next_version: AtomicU64::new(1),
        }
    }

    /// Hand out a fresh attribute-cache version tag.
    #[inline]
    pub fn next_version_tag(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a type and link it to its base.
    ///
    /// # Safety
    ///
    /// `tp` must be a live type object.
    pub unsafe fn register(&self, tp: *mut TypeObject, members: Vec<Member>) {
        let addr = tp as usize;
        // Safety: caller guarantees `tp` is live.
        let base = unsafe { (*tp).tp_base } as usize;
        let mut types = self.types.write();
        types.insert(
            addr,
            TypeInfo {
                subclasses: SmallVec::new(),
                members,
            },
        );
        if base != 0 {
            types.entry(base).or_default().subclasses.push(addr);
        }
    }

    /// Forget a type.
    pub fn unregister(&self, tp: *mut TypeObject, base: *mut TypeObject) {
        let mut types = self.types.write();
        types.remove(&(tp as usize));
        if let Some(info) = types.get_mut(&(base as usize)) {
            info.subclasses.retain(|a| *a != tp as usize);
        }
    }

    /// Check if a type is registered.
    #[inline]
    pub fn contains(&self, tp: *const TypeObject) -> bool {
        self.types.read().contains_key(&(tp as usize))
    }

    /// Member slots of a type.
    pub fn members(&self, tp: *const TypeObject) -> Vec<Member> {
        self.types
            .read()
            .get(&(tp as usize))
            .map(|info| info.members.clone())
            .unwrap_or_default()
    }

    /// Look up one member slot by name.
    pub fn member(&self, tp: *const TypeObject, name: &str) -> Option<Member> {
        self.types
            .read()
            .get(&(tp as usize))?
            .members
            .iter()
            .find(|m| &*m.name == name)
            .cloned()
    }

    /// A type followed by all of its transitive subclasses.
    pub fn with_subclasses(&self, tp: *mut TypeObject) -> Vec<*mut TypeObject> {
        let types = self.types.read();
        let mut out = vec![tp];
        let mut i = 0;
        while i < out.len() {
            if let Some(info) = types.get(&(out[i] as usize)) {
                out.extend(info.subclasses.iter().map(|&a| a as *mut TypeObject));
            }
            i += 1;
        }
        out
    }

    /// Get the number of registered types.
    pub fn len(&self) -> usize {
        self.types.read().len()
    }

    /// Check if registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Global Registry Access
// =============================================================================

static GLOBAL_REGISTRY: OnceLock<TypeRegistry> = OnceLock::new();

/// Get the global type registry.
pub fn global_registry() -> &'static TypeRegistry {
    GLOBAL_REGISTRY.get_or_init(TypeRegistry::new)
}
