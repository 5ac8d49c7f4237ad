//! Patching and the originals cache.
//!
//! Patching a type replaces an attribute or a protocol slot and remembers
//! what was there before, once per (type, name), so that it can be put
//! back exactly:
//!
//! ```text
//! originals (per thread)
//!   type addr -> TypeEntry
//!                  ty:        weak reference, pruned once the type dies
//!                  names:     name -> Original
//!                               own:      own-dict value | absent
//!                               resolved: value seen through the bases
//!                               slots:    raw slot words
//!                  allocated: protocol tables created while patching
//! ```
//!
//! Plain attribute patches go through the attribute protocol, which also
//! points the matching slots at their dispatch trampolines. Raw slot
//! patches write a function pointer directly and require a capability.

use crate::error::{InspectError, Result};
use crate::type_record::TypeRecord;

use marrow_runtime::object::attr::own_attr;
use marrow_runtime::object::slots::slot_defs_named;
use marrow_runtime::types::function::{self, NativeFn};
use marrow_runtime::{Obj, Protocol, SlotDef, SlotFn, WeakRef, del_attr, set_attr, type_lookup};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::cell::RefCell;

// =============================================================================
// Patch Values
// =============================================================================

/// What to install under a name.
#[derive(Debug, Clone)]
pub enum PatchValue {
    /// Any object, set through the attribute protocol.
    Object(Obj),
    /// A raw slot function.
    Slot(SlotFn),
}

impl From<Obj> for PatchValue {
    fn from(obj: Obj) -> Self {
        PatchValue::Object(obj)
    }
}

impl From<&Obj> for PatchValue {
    fn from(obj: &Obj) -> Self {
        PatchValue::Object(obj.clone())
    }
}

impl From<SlotFn> for PatchValue {
    fn from(f: SlotFn) -> Self {
        PatchValue::Slot(f)
    }
}

// =============================================================================
// Originals Cache
// =============================================================================

#[derive(Debug, Clone)]
struct Original {
    own: Option<Obj>,
    resolved: Option<Obj>,
    slots: SmallVec<[(&'static SlotDef, usize); 2]>,
}

#[derive(Debug)]
struct TypeEntry {
    ty: Option<WeakRef>,
    names: FxHashMap<Box<str>, Original>,
    allocated: SmallVec<[Protocol; 4]>,
}

impl TypeEntry {
    fn is_alive(&self) -> bool {
        self.ty.is_none_or(|w| w.is_alive())
    }
}

thread_local! {
    static ORIGINALS: RefCell<FxHashMap<usize, TypeEntry>> = RefCell::new(FxHashMap::default());
}

fn with_originals<R>(f: impl FnOnce(&mut FxHashMap<usize, TypeEntry>) -> R) -> R {
    ORIGINALS.with(|cell| {
        let mut map = cell.borrow_mut();
        map.retain(|_, entry| entry.is_alive());
        f(&mut map)
    })
}

fn key(ty: &TypeRecord) -> usize {
    ty.as_ptr() as usize
}

/// Remember what `name` is on `ty`, unless it is already remembered.
pub fn record_original(ty: &TypeRecord, name: &str) -> Result<()> {
    if with_originals(|map| map.get(&key(ty)).is_some_and(|e| e.names.contains_key(name))) {
        return Ok(());
    }
    let obj = ty.to_obj()?;
    // Safety: `obj` keeps the type alive.
    let t = unsafe { &*ty.as_ptr() };
    let original = Original {
        own: own_attr(t, name),
        resolved: type_lookup(t, name),
        slots: slot_defs_named(name)
            .map(|def| Ok((def, ty.read_slot_raw(def)?)))
            .collect::<Result<_>>()?,
    };
    let weak = WeakRef::new(&obj).ok();
    with_originals(|map| {
        map.entry(key(ty))
            .or_insert_with(|| TypeEntry {
                ty: weak,
                names: FxHashMap::default(),
                allocated: SmallVec::new(),
            })
            .names
            .insert(name.into(), original);
    });
    Ok(())
}

/// Whether `name` on `ty` has a remembered original.
pub fn is_patched(ty: &TypeRecord, name: &str) -> bool {
    with_originals(|map| map.get(&key(ty)).is_some_and(|e| e.names.contains_key(name)))
}

/// The value `name` resolved to before it was first patched.
///
/// `Ok(None)` if it resolved to nothing; `NotPatched` if it was never
/// patched.
pub fn orig(ty: &TypeRecord, name: &str) -> Result<Option<Obj>> {
    with_originals(|map| {
        map.get(&key(ty))
            .and_then(|e| e.names.get(name))
            .map(|o| o.resolved.clone())
    })
    .ok_or_else(|| not_patched(ty, name))
}

fn not_patched(ty: &TypeRecord, name: &str) -> InspectError {
    InspectError::NotPatched {
        type_name: ty.name().unwrap_or_default(),
        name: name.to_string(),
    }
}

fn note_allocated(ty: &TypeRecord, protocol: Protocol) {
    with_originals(|map| {
        if let Some(entry) = map.get_mut(&key(ty)) {
            if !entry.allocated.contains(&protocol) {
                entry.allocated.push(protocol);
            }
        }
    });
}

/// Free the tables this cache allocated for `ty` once they are empty.
fn release_unused_tables(ty: &TypeRecord) -> Result<()> {
    let allocated = with_originals(|map| map.get(&key(ty)).map(|e| e.allocated.clone()).unwrap_or_default());
    let mut freed = SmallVec::<[Protocol; 4]>::new();
    for protocol in allocated {
        // Safety: the table was allocated by `ensure_protocol_slots` while
        // patching this type.
        if unsafe { ty.release_protocol_table(protocol)? } {
            freed.push(protocol);
        }
    }
    with_originals(|map| {
        if let Some(entry) = map.get_mut(&key(ty)) {
            entry.allocated.retain(|p| !freed.contains(p));
            if entry.names.is_empty() && entry.allocated.is_empty() {
                map.remove(&key(ty));
            }
        }
    });
    Ok(())
}

// =============================================================================
// Set
// =============================================================================

/// Slot definitions a patch of `name` with `value` writes to.
fn target_slots(name: &str, value: &PatchValue) -> Result<SmallVec<[&'static SlotDef; 2]>> {
    let defs: SmallVec<[&'static SlotDef; 2]> = slot_defs_named(name).collect();
    let PatchValue::Slot(f) = value else {
        return Ok(defs.into_iter().take(1).collect());
    };
    let Some(first) = defs.first() else {
        return Err(InspectError::UnknownSlot(name.to_string()));
    };
    let matching: SmallVec<[&'static SlotDef; 2]> =
        defs.iter().copied().filter(|d| d.signature() == f.signature()).collect();
    if matching.is_empty() {
        return Err(InspectError::SlotSignature {
            slot: name.to_string(),
            expected: first.signature(),
            found: f.signature(),
        });
    }
    Ok(matching)
}

/// Patch `name` on `ty`.
///
/// `authorized` says whether a capability is active; raw slot patches are
/// refused without one. Nothing is changed if validation fails.
pub(crate) fn set(ty: &TypeRecord, name: &str, value: PatchValue, authorized: bool) -> Result<()> {
    if matches!(value, PatchValue::Slot(_)) && !authorized {
        return Err(InspectError::capability(format!("writing slot '{name}'")));
    }
    let targets = target_slots(name, &value)?;

    record_original(ty, name)?;
    for def in &targets {
        if def.protocol == Protocol::Main {
            continue;
        }
        let table = ty.ensure_protocol_slots(def.protocol)?;
        if table.created {
            note_allocated(ty, def.protocol);
        }
    }

    let _mutable = ty.mutable_scope()?;
    match &value {
        PatchValue::Object(obj) => set_attr(&ty.to_obj()?, name, obj)?,
        PatchValue::Slot(f) => {
            for def in &targets {
                // Safety: the signature was checked against the slot.
                unsafe { ty.write_slot(def, f.addr())? };
            }
            ty.modified()?;
        }
    }
    tracing::debug!(
        type_name = %ty.name()?,
        name,
        raw_slot = matches!(value, PatchValue::Slot(_)),
        "patched type"
    );
    Ok(())
}

/// Patch `name` with a native function on each of `types`.
pub fn implement(types: &[&Obj], name: &str, f: NativeFn) -> Result<()> {
    let func = function::native(name, f)?;
    for ty in types {
        set(&TypeRecord::of(ty)?, name, PatchValue::Object(func.clone()), false)?;
    }
    Ok(())
}

// =============================================================================
// Restore
// =============================================================================

fn restore_one(ty: &TypeRecord, name: &str, original: &Original) -> Result<()> {
    let _mutable = ty.mutable_scope()?;
    let obj = ty.to_obj()?;
    // Safety: `obj` keeps the type alive.
    let present = own_attr(unsafe { &*ty.as_ptr() }, name).is_some();
    match &original.own {
        Some(value) => set_attr(&obj, name, value)?,
        None if present => del_attr(&obj, name)?,
        None => {}
    }
    for (def, word) in &original.slots {
        // Safety: the word was read from this slot.
        unsafe { ty.write_slot(def, *word)? };
    }
    ty.modified()?;
    tracing::debug!(type_name = %ty.name()?, name, "restored type attribute");
    Ok(())
}

/// Run `apply` on the cached original of each of `names`, forgetting a
/// name only once `apply` succeeded for it. Stops at the first error; the
/// failing name and every name after it stay cached.
fn restore_cached<'a>(
    ty: &TypeRecord,
    names: impl IntoIterator<Item = &'a str>,
    mut apply: impl FnMut(&str, &Original) -> Result<()>,
) -> Result<usize> {
    let mut count = 0;
    for name in names {
        let original = with_originals(|map| map.get(&key(ty)).and_then(|e| e.names.get(name)).cloned())
            .ok_or_else(|| not_patched(ty, name))?;
        apply(name, &original)?;
        with_originals(|map| {
            if let Some(entry) = map.get_mut(&key(ty)) {
                entry.names.remove(name);
            }
        });
        count += 1;
    }
    Ok(count)
}

/// Put back what `name` was before it was first patched.
///
/// The original stays cached if restoring fails.
pub(crate) fn restore(ty: &TypeRecord, name: &str) -> Result<()> {
    restore_cached(ty, [name], |name, original| restore_one(ty, name, original))?;
    release_unused_tables(ty)
}

/// Restore every patched name on `ty`. Returns how many were restored.
pub(crate) fn restore_all(ty: &TypeRecord) -> Result<usize> {
    let names: Vec<Box<str>> =
        with_originals(|map| map.get(&key(ty)).map(|e| e.names.keys().cloned().collect()).unwrap_or_default());
    let count = restore_cached(ty, names.iter().map(|n| &**n), |name, original| {
        restore_one(ty, name, original)
    })?;
    release_unused_tables(ty)?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use marrow_runtime::types::{builtins, int};
    use marrow_runtime::{ClassSpec, RtResult, call, get_attr, new_class, ops};

    fn forty_two(_args: &[Obj]) -> RtResult<Obj> {
        int::new(42)
    }

    #[test]
    fn test_patch_and_restore_absent_name() {
        let cls = new_class(&ClassSpec::new("PatchAbsent")).unwrap();
        let ty = TypeRecord::of(&cls).unwrap();
        let f = function::native("__neg__", forty_two).unwrap();

        set(&ty, "__neg__", PatchValue::Object(f), false).unwrap();
        let inst = call(&cls, &[]).unwrap();
        assert_eq!(int::value(&ops::neg(&inst).unwrap()).unwrap(), 42);
        assert!(is_patched(&ty, "__neg__"));
        assert!(orig(&ty, "__neg__").unwrap().is_none());

        restore(&ty, "__neg__").unwrap();
        assert!(ops::neg(&inst).is_err());
        assert!(get_attr(&cls, "__neg__").is_err());
        assert!(matches!(restore(&ty, "__neg__"), Err(InspectError::NotPatched { .. })));
    }

    #[test]
    fn test_original_recorded_once() {
        let cls = new_class(&ClassSpec::new("PatchTwice").attr("marker", int::new(1).unwrap())).unwrap();
        let ty = TypeRecord::of(&cls).unwrap();
        set(&ty, "marker", int::new(2).unwrap().into(), false).unwrap();
        set(&ty, "marker", int::new(3).unwrap().into(), false).unwrap();
        assert_eq!(int::value(&orig(&ty, "marker").unwrap().unwrap()).unwrap(), 1);

        restore(&ty, "marker").unwrap();
        assert_eq!(int::value(&get_attr(&cls, "marker").unwrap()).unwrap(), 1);
    }

    #[test]
    fn test_raw_slot_requires_capability_and_signature() {
        let cls = new_class(&ClassSpec::new("PatchRaw")).unwrap();
        let ty = TypeRecord::of(&cls).unwrap();
        let unary = SlotFn::Unary(|_| int::new(0));

        assert!(matches!(set(&ty, "__neg__", unary.into(), false), Err(InspectError::Capability(_))));
        assert!(matches!(set(&ty, "marker", unary.into(), true), Err(InspectError::UnknownSlot(_))));
        assert!(matches!(
            set(&ty, "__add__", unary.into(), true),
            Err(InspectError::SlotSignature { .. })
        ));
        assert!(!is_patched(&ty, "__add__"));
    }

    #[test]
    fn test_restore_all_and_table_release() {
        let _guard = crate::test_lock();
        let ty = TypeRecord::from_ptr(builtins().function_type()).unwrap();
        assert!(ty.protocol_table(Protocol::Sequence).unwrap().is_none());

        let f = function::native("__contains__", forty_two).unwrap();
        set(&ty, "__contains__", PatchValue::Object(f.clone()), false).unwrap();
        assert!(ty.protocol_table(Protocol::Sequence).unwrap().is_some());
        assert!(ty.is_immutable().unwrap());

        assert_eq!(restore_all(&ty).unwrap(), 1);
        assert!(ty.protocol_table(Protocol::Sequence).unwrap().is_none());
        assert_eq!(restore_all(&ty).unwrap(), 0);
    }

    #[test]
    fn test_failed_restore_keeps_originals() {
        let cls = new_class(&ClassSpec::new("PatchKeep").attr("a", int::new(1).unwrap()).attr("b", int::new(2).unwrap()))
            .unwrap();
        let ty = TypeRecord::of(&cls).unwrap();
        set(&ty, "a", int::new(10).unwrap().into(), false).unwrap();
        set(&ty, "b", int::new(20).unwrap().into(), false).unwrap();

        let err = restore_cached(&ty, ["a", "b"], |name, original| {
            if name == "b" {
                return Err(InspectError::capability("restoring 'b'"));
            }
            restore_one(&ty, name, original)
        })
        .unwrap_err();
        assert!(matches!(err, InspectError::Capability(_)));
        assert!(!is_patched(&ty, "a"));
        assert!(is_patched(&ty, "b"));
        assert_eq!(int::value(&get_attr(&cls, "a").unwrap()).unwrap(), 1);
        assert_eq!(int::value(&get_attr(&cls, "b").unwrap()).unwrap(), 20);
        assert_eq!(int::value(&orig(&ty, "b").unwrap().unwrap()).unwrap(), 2);

        assert_eq!(restore_all(&ty).unwrap(), 1);
        assert_eq!(int::value(&get_attr(&cls, "b").unwrap()).unwrap(), 2);
    }

    #[test]
    fn test_implement_on_several_types() {
        let a = new_class(&ClassSpec::new("ImplA")).unwrap();
        let b = new_class(&ClassSpec::new("ImplB")).unwrap();
        implement(&[&a, &b], "__pos__", forty_two).unwrap();
        for cls in [&a, &b] {
            let inst = call(cls, &[]).unwrap();
            assert_eq!(int::value(&ops::pos(&inst).unwrap()).unwrap(), 42);
            restore(&TypeRecord::of(cls).unwrap(), "__pos__").unwrap();
        }
    }
}
