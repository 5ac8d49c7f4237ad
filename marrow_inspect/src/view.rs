//! Views.
//!
//! A [`View`] is the public face of an [`ObjectRecord`]: it adds lifetime
//! tracking (an optional strong reference and an optional weak reference),
//! capability checks on writes, and a terminal "dropped" state.
//!
//! # Lifetime Sources
//!
//! ```text
//! base():
//!   strong ref held?          -> clone it
//!   weak ref alive?           -> upgrade it
//!   capability active?        -> rebuild from the raw address (warns)
//!   otherwise                 -> WeakExpired / NoReference
//! ```
//!
//! # Write Classes
//!
//! | access   | outside a capability | inside a capability |
//! |----------|----------------------|---------------------|
//! | safe     | written              | written             |
//! | unsafe   | `Capability` error   | written             |
//! | readonly | `ReadOnlyField`      | `ReadOnlyField`     |
//!
//! Every check runs before the first byte is written.

use crate::capability::{self, LocalScope};
use crate::catalog::{RecordFamily, RecordKind};
use crate::config::ViewConfig;
use crate::error::{InspectError, Result};
use crate::layout::{Access, FieldDescriptor, FieldType};
use crate::moves;
use crate::record::{Address, AttachedTable, FieldValue, ObjectRecord};
use crate::slots::{self, PatchValue};
use crate::type_record::{MutableScope, SlotTable, TypeRecord};

use marrow_gc::heap;
use marrow_runtime::object::attr::{self, type_lookup};
use marrow_runtime::object::lifecycle::{instance_size, sync_tracking};
use marrow_runtime::object::{decref, incref, xdecref};
use marrow_runtime::types::int::{DIGIT_BITS, DIGIT_MASK};
use marrow_runtime::types::string::{HASH_NOT_COMPUTED, STATE_INTERNED_MASK};
use marrow_runtime::types::{dict, string};
use marrow_runtime::{Obj, ObjectHeader, Protocol, TypeFlags, TypeObject, WeakRef};
use std::cell::{Cell, Ref, RefCell};
use std::fmt;
use std::ops::Deref;

// =============================================================================
// View
// =============================================================================

/// Lifetime-aware overlay over one object.
pub struct View {
    record: RefCell<ObjectRecord>,
    strong: RefCell<Option<Obj>>,
    weak: Cell<Option<WeakRef>>,
    local: Cell<bool>,
    dropped: Cell<bool>,
    config: ViewConfig,
}

impl View {
    /// View with the default configuration.
    pub fn new(obj: &Obj) -> Result<Self> {
        Self::with_config(obj, ViewConfig::default())
    }

    /// View with an explicit configuration.
    pub fn with_config(obj: &Obj, config: ViewConfig) -> Result<Self> {
        config.validate()?;
        let record = ObjectRecord::of(obj)?;
        let weak = if config.weak_ref { WeakRef::new(obj).ok() } else { None };
        let strong = config.hold_ref.then(|| obj.clone());
        Ok(Self {
            record: RefCell::new(record),
            strong: RefCell::new(strong),
            weak: Cell::new(weak),
            local: Cell::new(false),
            dropped: Cell::new(false),
            config,
        })
    }

    #[inline]
    pub(crate) fn local_flag(&self) -> &Cell<bool> {
        &self.local
    }

    /// Enter this view's local capability until the guard drops.
    pub fn unsafe_scope(&self) -> LocalScope<'_> {
        LocalScope::enter(&self.local)
    }

    /// Whether unsafe operations are authorized for this view.
    #[inline]
    pub fn is_unsafe(&self) -> bool {
        capability::is_active(self)
    }

    pub fn config(&self) -> &ViewConfig {
        &self.config
    }

    #[inline]
    fn check(&self) -> Result<()> {
        if self.dropped.get() {
            Err(InspectError::Dropped)
        } else {
            Ok(())
        }
    }

    /// The record, unless the view has been dropped.
    pub fn record(&self) -> Result<Ref<'_, ObjectRecord>> {
        self.check()?;
        Ok(self.record.borrow())
    }

    /// Re-resolve the record after the body at this address changed kind.
    pub(crate) fn rebind(&self) -> Result<()> {
        self.check()?;
        self.record.borrow_mut().rebind()
    }

    /// Address of the viewed object.
    pub fn address(&self) -> Address {
        self.record.borrow().address()
    }

    pub fn kind(&self) -> Result<RecordKind> {
        Ok(self.record()?.kind())
    }

    /// Fail with a capability error unless authorized.
    pub(crate) fn require_unsafe(&self, what: impl FnOnce() -> String) -> Result<()> {
        if self.is_unsafe() {
            Ok(())
        } else {
            Err(InspectError::capability(what()))
        }
    }

    fn authorize(&self, field: &FieldDescriptor) -> Result<()> {
        match field.access {
            Access::Safe => Ok(()),
            Access::ReadOnly => Err(InspectError::ReadOnlyField(field.name.to_string())),
            Access::Unsafe => self.require_unsafe(|| format!("writing '{}'", field.name)),
        }
    }

    // =========================================================================
    // Fields
    // =========================================================================

    /// Read a field.
    pub fn read(&self, field: &str) -> Result<FieldValue> {
        self.record()?.read(field)
    }

    /// Read one element of an array field.
    pub fn read_item(&self, field: &str, index: usize) -> Result<FieldValue> {
        self.record()?.read_item(field, index)
    }

    /// Write a field, subject to its access class.
    pub fn write(&self, field: &str, value: impl Into<FieldValue>) -> Result<()> {
        let record = self.record()?;
        self.authorize(record.field(field)?)?;
        // Safety: authorized; the record validates the value first.
        unsafe { record.write_unchecked(field, &value.into()) }
    }

    /// Write one element of an array field, subject to its access class.
    pub fn write_item(&self, field: &str, index: usize, value: impl Into<FieldValue>) -> Result<()> {
        let record = self.record()?;
        self.authorize(record.field(field)?)?;
        // Safety: authorized; the record checks bounds and range first.
        unsafe { record.write_item_unchecked(field, index, &value.into()) }
    }

    // =========================================================================
    // Header
    // =========================================================================

    pub fn ref_count(&self) -> Result<isize> {
        self.record()?.header_reference_count()
    }

    /// Overwrite the header reference count. Requires a capability.
    pub fn set_ref_count(&self, count: isize) -> Result<()> {
        self.require_unsafe(|| "setting the reference count".into())?;
        // Safety: authorized.
        unsafe { self.record()?.set_reference_count(count) }
    }

    /// New strong reference to the object's type.
    pub fn type_object(&self) -> Result<Obj> {
        let tp = self.record()?.type_ptr()?;
        // Safety: a live object's type is live.
        Ok(unsafe { (*tp).to_obj() })
    }

    /// Reassign the object's type. Requires a capability.
    ///
    /// Heap types gain and lose the reference each instance holds on its
    /// type. The new type's instances must fit the object's block.
    pub fn set_type(&self, ty: &Obj) -> Result<()> {
        self.require_unsafe(|| "setting the type".into())?;
        let new_tp = ty.as_type_ptr().ok_or_else(|| InspectError::KindMismatch {
            expected: "type".into(),
            found: ty.type_name(),
        })?;
        {
            let record = self.record()?;
            let old_tp = record.type_ptr()?;
            // Safety: both types are live.
            let (old, new) = unsafe { (&*old_tp, &*new_tp) };
            let needed = instance_size(new, record.open_len()?);
            let available = record.size_allocated()?;
            if needed > available {
                return Err(InspectError::OutOfBounds { needed, available });
            }
            // Safety: authorized; references follow the type pointer.
            unsafe {
                if new.has(TypeFlags::HEAPTYPE) {
                    incref(new_tp.cast());
                }
                record.write_unchecked("ob_type", &FieldValue::Ptr(new_tp as usize))?;
                if old.has(TypeFlags::HEAPTYPE) {
                    decref(old_tp.cast());
                }
                sync_tracking(record.address().get() as *mut ObjectHeader);
            }
            tracing::debug!(addr = %record.address(), from = old.name(), to = new.name(), "reassigned type");
        }
        self.rebind()
    }

    /// Runtime length of a variable-size record.
    pub fn size(&self) -> Result<isize> {
        let record = self.record()?;
        let field = self.size_field(&record)?;
        Ok(record.read(&field.name)?.as_i64().unwrap_or(0) as isize)
    }

    /// Overwrite the runtime length. Requires a capability, and the
    /// resulting footprint must fit the block. Negative lengths are only
    /// accepted where the sign is part of the encoding (int).
    pub fn set_size(&self, size: isize) -> Result<()> {
        let record = self.record()?;
        let field = self.size_field(&record)?.clone();
        self.authorize(&field)?;
        let signed = matches!(
            record.layout().open_array().map(|f| &f.ty),
            Some(FieldType::OpenArray { abs: true, .. })
        );
        if size < 0 && !signed {
            return Err(InspectError::ValueRange {
                field: field.name.to_string(),
                value: size.to_string(),
            });
        }
        let needed = record.layout().size_with(size.unsigned_abs());
        let available = record.size_allocated()?;
        if record.layout().is_var() && needed > available {
            return Err(InspectError::OutOfBounds { needed, available });
        }
        // Safety: authorized; the new footprint fits.
        unsafe { record.write_unchecked(&field.name, &FieldValue::Int(size as i64))? };
        if record.layout().is_var() {
            heap().set_requested(record.address().get(), needed)?;
        }
        Ok(())
    }

    fn size_field<'r>(&self, record: &'r ObjectRecord) -> Result<&'r FieldDescriptor> {
        if record.kind().family() != RecordFamily::Var {
            return Err(InspectError::KindMismatch {
                expected: "variable-size record".into(),
                found: record.kind().to_string(),
            });
        }
        record.size_field().ok_or_else(|| InspectError::UnknownField {
            record: record.layout().name().to_string(),
            field: "ob_size".into(),
        })
    }

    // =========================================================================
    // Memory
    // =========================================================================

    /// True footprint in bytes.
    pub fn mem_size(&self) -> Result<usize> {
        self.record()?.size_in_memory()
    }

    /// Usable bytes of the block after allocator rounding.
    pub fn mem_allocated(&self) -> Result<usize> {
        self.record()?.size_allocated()
    }

    pub fn is_gc(&self) -> Result<bool> {
        self.record()?.is_gc()
    }

    pub fn gc_is_tracked(&self) -> Result<bool> {
        self.record()?.is_collector_tracked()
    }

    /// Copy of the object's bytes.
    pub fn bytes(&self) -> Result<Vec<u8>> {
        self.record()?.bytes()
    }

    pub fn attached_table(&self) -> Result<AttachedTable> {
        self.record()?.attached_table()
    }

    /// The instance dictionary, if the object has one.
    pub fn instance_dict(&self) -> Result<Option<Obj>> {
        Ok(attr::instance_dict(&self.base()?))
    }

    // =========================================================================
    // Lifetime
    // =========================================================================

    /// The live object behind the view.
    pub fn base(&self) -> Result<Obj> {
        self.check()?;
        if let Some(obj) = self.strong.borrow().as_ref() {
            return Ok(obj.clone());
        }
        let weak = self.weak.get();
        if let Some(obj) = weak.and_then(|w| w.upgrade()) {
            return Ok(obj);
        }
        if !self.is_unsafe() {
            return Err(if weak.is_some() {
                InspectError::WeakExpired
            } else {
                InspectError::NoReference
            });
        }

        let record = self.record.borrow();
        let count = record.header_reference_count()?;
        if self.config.warn_on_reconstruct && (count <= 0 || weak.is_some()) {
            tracing::warn!(
                addr = %record.address(),
                count,
                weak_expired = weak.is_some(),
                "reconstructing object from a raw address"
            );
        }
        // Safety: the record is live (checked by the count read above), so
        // the block holds an object; the caller accepted the risk of the
        // count being wrong by entering a capability scope.
        unsafe { record.address().reify() }.ok_or(InspectError::Dangling(record.address().get()))
    }

    /// Release the view's references. Every later access fails with
    /// [`InspectError::Dropped`].
    pub fn drop_ref(&self) {
        if self.dropped.replace(true) {
            return;
        }
        self.strong.borrow_mut().take();
        self.weak.set(None);
    }

    #[inline]
    pub fn is_dropped(&self) -> bool {
        self.dropped.get()
    }

    // =========================================================================
    // Moves
    // =========================================================================

    /// Transplant `src`'s body onto this view's object.
    ///
    /// `src` is dropped; this view stays usable and reads the new body.
    pub fn move_from(&self, src: &View) -> Result<AnyView> {
        moves::move_view(self, src)
    }

    /// [`move_from`](Self::move_from) with a temporary view over `src`.
    ///
    /// The temporary view holds `src` strongly whatever this view's
    /// configuration says.
    pub fn move_from_obj(&self, src: &Obj) -> Result<AnyView> {
        let config = ViewConfig {
            hold_ref: true,
            ..self.config.clone()
        };
        let src = View::with_config(src, config)?;
        self.move_from(&src)
    }

    /// Exchange bodies with `other`. Both views are dropped.
    pub fn swap(&self, other: &View) -> Result<(AnyView, AnyView)> {
        moves::swap_views(self, other)
    }
}

impl fmt::Debug for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("View")
            .field("record", &*self.record.borrow())
            .field("strong", &self.strong.borrow().is_some())
            .field("weak", &self.weak.get().is_some())
            .field("dropped", &self.dropped.get())
            .finish()
    }
}

/// Fresh reference to the object stored in a pointer field.
fn reify_ptr(value: &FieldValue) -> Option<Obj> {
    match value.as_ptr()? {
        0 => None,
        // Safety: pointer fields of live containers hold owned references.
        p => unsafe { Address::new(p).reify() },
    }
}

// =============================================================================
// Typed Views
// =============================================================================

macro_rules! typed_view {
    ($(#[$doc:meta])* $name:ident => $kind:path) => {
        $(#[$doc])*
        #[derive(Debug)]
        pub struct $name(View);

        impl $name {
            pub fn new(obj: &Obj) -> Result<Self> {
                Self::with_config(obj, ViewConfig::default())
            }

            pub fn with_config(obj: &Obj, config: ViewConfig) -> Result<Self> {
                Self::try_from(View::with_config(obj, config)?)
            }

            /// The untyped view.
            pub fn into_inner(self) -> View {
                self.0
            }
        }

        impl TryFrom<View> for $name {
            type Error = InspectError;

            fn try_from(view: View) -> Result<Self> {
                let kind = view.kind()?;
                if kind != $kind {
                    return Err(InspectError::KindMismatch {
                        expected: $kind.to_string(),
                        found: kind.to_string(),
                    });
                }
                Ok(Self(view))
            }
        }

        impl Deref for $name {
            type Target = View;

            #[inline]
            fn deref(&self) -> &View {
                &self.0
            }
        }
    };
}

typed_view! {
    /// View over an int.
    IntView => RecordKind::Int
}

typed_view! {
    /// View over a float.
    FloatView => RecordKind::Float
}

typed_view! {
    /// View over a str.
    StrView => RecordKind::Str
}

typed_view! {
    /// View over a tuple.
    TupleView => RecordKind::Tuple
}

typed_view! {
    /// View over a list.
    ListView => RecordKind::List
}

typed_view! {
    /// View over a dict.
    DictView => RecordKind::Dict
}

typed_view! {
    /// View over an instance of a user class.
    InstanceView => RecordKind::Instance
}

// =============================================================================
// Int
// =============================================================================

impl IntView {
    /// Magnitude digits, least significant first.
    pub fn digits(&self) -> Result<Vec<u32>> {
        match self.read("ob_digit")? {
            FieldValue::Array(items) => Ok(items.iter().filter_map(|d| d.as_u64()).map(|d| d as u32).collect()),
            _ => Ok(Vec::new()),
        }
    }

    /// Whether the value is negative.
    pub fn is_negative(&self) -> Result<bool> {
        Ok(self.size()? < 0)
    }

    /// The value, if it fits `i64`.
    pub fn value(&self) -> Result<i64> {
        let mut magnitude: i128 = 0;
        for (i, d) in self.digits()?.iter().enumerate() {
            let shift = i as u32 * DIGIT_BITS;
            if shift >= 96 {
                return Err(InspectError::ValueRange {
                    field: "ob_digit".into(),
                    value: format!("{} digits", i + 1),
                });
            }
            magnitude |= i128::from(*d) << shift;
        }
        let value = if self.is_negative()? { -magnitude } else { magnitude };
        i64::try_from(value).map_err(|_| InspectError::ValueRange {
            field: "ob_digit".into(),
            value: value.to_string(),
        })
    }

    /// Rewrite the value in place. Requires a capability; the new digits
    /// must fit the block.
    pub fn set_value(&self, value: i64) -> Result<()> {
        self.require_unsafe(|| "rewriting an int".into())?;
        let mut digits = Vec::new();
        let mut m = value.unsigned_abs();
        while m != 0 {
            digits.push((m & u64::from(DIGIT_MASK)) as u32);
            m >>= DIGIT_BITS;
        }

        let record = self.record()?;
        let needed = record.layout().size_with(digits.len());
        let available = record.size_allocated()?;
        if needed > available {
            return Err(InspectError::OutOfBounds { needed, available });
        }
        let size = if value < 0 { -(digits.len() as i64) } else { digits.len() as i64 };
        // Safety: authorized; the digits fit the block.
        unsafe {
            record.write_unchecked("ob_size", &FieldValue::Int(size))?;
            for (i, d) in digits.iter().enumerate() {
                record.write_item_unchecked("ob_digit", i, &FieldValue::UInt((*d).into()))?;
            }
        }
        heap().set_requested(record.address().get(), needed)?;
        Ok(())
    }
}

// =============================================================================
// Float
// =============================================================================

impl FloatView {
    pub fn value(&self) -> Result<f64> {
        self.read("ob_fval")?
            .as_f64()
            .ok_or_else(|| InspectError::UnknownField {
                record: "float".into(),
                field: "ob_fval".into(),
            })
    }

    /// Rewrite the value in place.
    pub fn set_value(&self, value: f64) -> Result<()> {
        self.write("ob_fval", value)
    }
}

// =============================================================================
// Str
// =============================================================================

impl StrView {
    pub fn len(&self) -> Result<usize> {
        Ok(self.size()?.max(0) as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// The text.
    pub fn text(&self) -> Result<String> {
        let bytes: Vec<u8> = match self.read("data")? {
            FieldValue::Array(items) => items.iter().filter_map(|b| b.as_u64()).map(|b| b as u8).collect(),
            _ => Vec::new(),
        };
        String::from_utf8(bytes).map_err(|e| InspectError::ValueRange {
            field: "data".into(),
            value: e.to_string(),
        })
    }

    /// Interned state bits.
    pub fn interned(&self) -> Result<u32> {
        Ok(self.read("interned")?.as_u64().unwrap_or(0) as u32 & STATE_INTERNED_MASK)
    }

    pub fn is_interned(&self) -> Result<bool> {
        Ok(self.interned()? != 0)
    }

    /// Cached hash, `None` until computed.
    pub fn cached_hash(&self) -> Result<Option<i64>> {
        Ok(match self.read("hash")?.as_i64() {
            Some(HASH_NOT_COMPUTED) | None => None,
            Some(h) => Some(h),
        })
    }

    /// Remove the string from the intern table.
    pub fn unintern(&self) -> Result<()> {
        Ok(string::unintern(&self.base()?)?)
    }

    /// Forget the cached hash.
    pub fn reset_hash(&self) -> Result<()> {
        Ok(string::reset_hash(&self.base()?)?)
    }
}

// =============================================================================
// Tuple
// =============================================================================

impl TupleView {
    pub fn len(&self) -> Result<usize> {
        Ok(self.size()?.max(0) as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn get(&self, index: usize) -> Result<Option<Obj>> {
        Ok(reify_ptr(&self.read_item("ob_item", index)?))
    }

    pub fn items(&self) -> Result<Vec<Obj>> {
        (0..self.len()?).filter_map(|i| self.get(i).transpose()).collect()
    }

    /// Replace an item. Requires a capability.
    pub fn set(&self, index: usize, item: &Obj) -> Result<()> {
        self.require_unsafe(|| "assigning a tuple item".into())?;
        let record = self.record()?;
        let old = record.read_item("ob_item", index)?.as_ptr().unwrap_or(0);
        // Safety: authorized; the slot owns its reference.
        unsafe {
            record.write_item_unchecked("ob_item", index, &FieldValue::Ptr(item.clone().into_raw() as usize))?;
            xdecref(old as *mut ObjectHeader);
        }
        Ok(())
    }

    /// Insert an item, growing into the block's slack. Requires a
    /// capability; fails with `OutOfBounds` when the block is full.
    pub fn insert(&self, index: usize, item: &Obj) -> Result<()> {
        self.require_unsafe(|| "inserting a tuple item".into())?;
        let record = self.record()?;
        let len = record.open_len()?;
        if index > len {
            return Err(InspectError::OutOfBounds {
                needed: index + 1,
                available: len + 1,
            });
        }
        let needed = record.layout().size_with(len + 1);
        let available = record.size_allocated()?;
        if needed > available {
            return Err(InspectError::OutOfBounds { needed, available });
        }
        // Safety: authorized; the grown body fits the block.
        unsafe {
            record.write_unchecked("ob_size", &FieldValue::Int(len as i64 + 1))?;
            for i in (index..len).rev() {
                let moved = record.read_item("ob_item", i)?;
                record.write_item_unchecked("ob_item", i + 1, &moved)?;
            }
            record.write_item_unchecked("ob_item", index, &FieldValue::Ptr(item.clone().into_raw() as usize))?;
        }
        heap().set_requested(record.address().get(), needed)?;
        Ok(())
    }

    /// Remove an item. Requires a capability.
    pub fn delete(&self, index: usize) -> Result<()> {
        self.require_unsafe(|| "deleting a tuple item".into())?;
        let record = self.record()?;
        let len = record.open_len()?;
        let old = record.read_item("ob_item", index)?.as_ptr().unwrap_or(0);
        // Safety: authorized; index < len was checked by the read.
        unsafe {
            for i in index + 1..len {
                let moved = record.read_item("ob_item", i)?;
                record.write_item_unchecked("ob_item", i - 1, &moved)?;
            }
            record.write_item_unchecked("ob_item", len - 1, &FieldValue::Ptr(0))?;
            record.write_unchecked("ob_size", &FieldValue::Int(len as i64 - 1))?;
        }
        heap().set_requested(record.address().get(), record.layout().size_with(len - 1))?;
        // Safety: the item's reference left the tuple.
        unsafe { xdecref(old as *mut ObjectHeader) };
        Ok(())
    }
}

// =============================================================================
// List
// =============================================================================

impl ListView {
    pub fn len(&self) -> Result<usize> {
        Ok(self.size()?.max(0) as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Capacity of the item buffer.
    pub fn allocated(&self) -> Result<usize> {
        Ok(self.read("allocated")?.as_i64().unwrap_or(0).max(0) as usize)
    }

    fn slot(&self, index: usize) -> Result<*mut *mut ObjectHeader> {
        let len = self.len()?;
        if index >= len {
            return Err(InspectError::OutOfBounds {
                needed: index + 1,
                available: len,
            });
        }
        let buffer = self.read("ob_item")?.as_ptr().unwrap_or(0) as *mut *mut ObjectHeader;
        // Safety: index < len <= allocated.
        Ok(unsafe { buffer.add(index) })
    }

    pub fn get(&self, index: usize) -> Result<Option<Obj>> {
        let slot = self.slot(index)?;
        // Safety: list slots hold owned references.
        Ok(unsafe { Obj::from_borrowed_ptr(*slot) })
    }

    /// Replace an item.
    pub fn set(&self, index: usize, item: &Obj) -> Result<()> {
        let slot = self.slot(index)?;
        // Safety: list slots hold owned references.
        unsafe {
            let old = std::mem::replace(&mut *slot, item.clone().into_raw());
            xdecref(old);
        }
        Ok(())
    }
}

// =============================================================================
// Dict
// =============================================================================

impl DictView {
    /// Number of entries.
    pub fn len(&self) -> Result<usize> {
        Ok(self.read("ma_used")?.as_u64().unwrap_or(0) as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn version(&self) -> Result<u64> {
        Ok(self.read("ma_version")?.as_u64().unwrap_or(0))
    }

    pub fn get(&self, key: &str) -> Result<Option<Obj>> {
        Ok(dict::get_item(&self.base()?, key))
    }

    /// Keys, sorted.
    pub fn keys(&self) -> Result<Vec<String>> {
        let mut keys = dict::keys(&self.base()?);
        keys.sort();
        Ok(keys)
    }
}

// =============================================================================
// Instance
// =============================================================================

impl InstanceView {
    /// Names of the member slots declared by the class.
    pub fn slot_names(&self) -> Result<Vec<String>> {
        let record = self.record()?;
        Ok(record
            .layout()
            .fields()
            .iter()
            .filter(|f| !matches!(f.name.as_ref(), "ob_refcnt" | "ob_type" | "__dict__"))
            .map(|f| f.name.to_string())
            .collect())
    }

    /// Current value of a member slot.
    pub fn get_slot(&self, name: &str) -> Result<Option<Obj>> {
        Ok(reify_ptr(&self.read(name)?))
    }

    /// Assign a member slot through the attribute protocol.
    pub fn set_slot(&self, name: &str, value: &Obj) -> Result<()> {
        self.record()?.field(name)?;
        Ok(attr::set_attr(&self.base()?, name, value)?)
    }
}

// =============================================================================
// Type
// =============================================================================

/// View over a type object.
#[derive(Debug)]
pub struct TypeView {
    view: View,
    ty: TypeRecord,
}

impl TypeView {
    pub fn new(obj: &Obj) -> Result<Self> {
        Self::with_config(obj, ViewConfig::default())
    }

    pub fn with_config(obj: &Obj, config: ViewConfig) -> Result<Self> {
        Self::try_from(View::with_config(obj, config)?)
    }

    /// View over the type at `tp`.
    pub fn from_ptr(tp: *mut TypeObject) -> Result<Self> {
        let ty = TypeRecord::from_ptr(tp)?;
        Self::new(&ty.to_obj()?)
    }

    pub fn into_inner(self) -> View {
        self.view
    }

    /// The type record.
    pub fn type_record(&self) -> Result<&TypeRecord> {
        if self.view.is_dropped() {
            return Err(InspectError::Dropped);
        }
        Ok(&self.ty)
    }

    pub fn name(&self) -> Result<String> {
        self.type_record()?.name()
    }

    pub fn basic_size(&self) -> Result<usize> {
        self.type_record()?.basic_size()
    }

    pub fn item_size(&self) -> Result<usize> {
        self.type_record()?.item_size()
    }

    pub fn flags(&self) -> Result<TypeFlags> {
        self.type_record()?.flags()
    }

    pub fn is_immutable(&self) -> Result<bool> {
        self.type_record()?.is_immutable()
    }

    /// Keep the type writable until the guard drops.
    pub fn as_mutable(&self) -> Result<MutableScope> {
        self.type_record()?.mutable_scope()
    }

    /// Attribute lookup through the type's bases.
    pub fn get_attr(&self, name: &str) -> Result<Option<Obj>> {
        let tp = self.type_record()?.as_ptr();
        // Safety: the view keeps the type alive.
        Ok(type_lookup(unsafe { &*tp }, name))
    }

    /// Allocate a protocol table if the type has none.
    pub fn ensure_protocol_slots(&self, protocol: Protocol) -> Result<SlotTable> {
        self.type_record()?.ensure_protocol_slots(protocol)
    }

    /// Patch an attribute or slot, remembering the original.
    ///
    /// Raw slot patches require a capability.
    pub fn patch(&self, name: &str, value: impl Into<PatchValue>) -> Result<()> {
        slots::set(self.type_record()?, name, value.into(), self.is_unsafe())
    }

    /// Undo a patch.
    pub fn restore(&self, name: &str) -> Result<()> {
        slots::restore(self.type_record()?, name)
    }

    /// Undo every patch on the type. Returns how many names were restored.
    pub fn restore_all(&self) -> Result<usize> {
        slots::restore_all(self.type_record()?)
    }

    /// Value `name` resolved to before it was first patched.
    pub fn orig(&self, name: &str) -> Result<Option<Obj>> {
        slots::orig(self.type_record()?, name)
    }

    /// Whether `name` is currently patched.
    pub fn is_patched(&self, name: &str) -> Result<bool> {
        Ok(slots::is_patched(self.type_record()?, name))
    }
}

impl TryFrom<View> for TypeView {
    type Error = InspectError;

    fn try_from(view: View) -> Result<Self> {
        let ty = TypeRecord::from_ptr(view.address().get() as *mut TypeObject)?;
        Ok(Self { view, ty })
    }
}

impl Deref for TypeView {
    type Target = View;

    #[inline]
    fn deref(&self) -> &View {
        &self.view
    }
}

// =============================================================================
// Any View
// =============================================================================

/// A view of whichever kind matches the object.
#[derive(Debug)]
pub enum AnyView {
    Int(IntView),
    Float(FloatView),
    Str(StrView),
    Tuple(TupleView),
    List(ListView),
    Dict(DictView),
    Type(TypeView),
    Instance(InstanceView),
    /// Plain objects, functions and `None`.
    Object(View),
}

impl AnyView {
    /// Wrap an untyped view in the variant for its kind.
    pub fn from_view(view: View) -> Result<Self> {
        Ok(match view.kind()? {
            RecordKind::Int => AnyView::Int(IntView(view)),
            RecordKind::Float => AnyView::Float(FloatView(view)),
            RecordKind::Str => AnyView::Str(StrView(view)),
            RecordKind::Tuple => AnyView::Tuple(TupleView(view)),
            RecordKind::List => AnyView::List(ListView(view)),
            RecordKind::Dict => AnyView::Dict(DictView(view)),
            RecordKind::Type => AnyView::Type(TypeView::try_from(view)?),
            RecordKind::Instance => AnyView::Instance(InstanceView(view)),
            RecordKind::Object | RecordKind::Function => AnyView::Object(view),
        })
    }

    /// The untyped view.
    pub fn view(&self) -> &View {
        match self {
            AnyView::Int(v) => v,
            AnyView::Float(v) => v,
            AnyView::Str(v) => v,
            AnyView::Tuple(v) => v,
            AnyView::List(v) => v,
            AnyView::Dict(v) => v,
            AnyView::Type(v) => v,
            AnyView::Instance(v) => v,
            AnyView::Object(v) => v,
        }
    }

    pub fn into_view(self) -> View {
        match self {
            AnyView::Int(v) => v.into_inner(),
            AnyView::Float(v) => v.into_inner(),
            AnyView::Str(v) => v.into_inner(),
            AnyView::Tuple(v) => v.into_inner(),
            AnyView::List(v) => v.into_inner(),
            AnyView::Dict(v) => v.into_inner(),
            AnyView::Type(v) => v.into_inner(),
            AnyView::Instance(v) => v.into_inner(),
            AnyView::Object(v) => v,
        }
    }

    pub fn as_int(&self) -> Option<&IntView> {
        match self {
            AnyView::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<&FloatView> {
        match self {
            AnyView::Float(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&StrView> {
        match self {
            AnyView::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&TupleView> {
        match self {
            AnyView::Tuple(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&ListView> {
        match self {
            AnyView::List(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&DictView> {
        match self {
            AnyView::Dict(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_type(&self) -> Option<&TypeView> {
        match self {
            AnyView::Type(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_instance(&self) -> Option<&InstanceView> {
        match self {
            AnyView::Instance(v) => Some(v),
            _ => None,
        }
    }
}

impl Deref for AnyView {
    type Target = View;

    #[inline]
    fn deref(&self) -> &View {
        self.view()
    }
}

/// View over `obj` with the default configuration.
pub fn view(obj: &Obj) -> Result<AnyView> {
    view_with(obj, ViewConfig::default())
}

/// View over `obj`.
pub fn view_with(obj: &Obj, config: ViewConfig) -> Result<AnyView> {
    AnyView::from_view(View::with_config(obj, config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::unsafe_global;
    use marrow_runtime::types::{builtins, float, int, list, none, string, tuple};
    use marrow_runtime::{ClassSpec, DictConvention, call, new_class};

    #[test]
    fn test_factory_picks_kind() {
        assert!(matches!(view(&int::new(1).unwrap()).unwrap(), AnyView::Int(_)));
        assert!(matches!(view(&float::new(1.0).unwrap()).unwrap(), AnyView::Float(_)));
        assert!(matches!(view(&string::new("s").unwrap()).unwrap(), AnyView::Str(_)));
        assert!(matches!(view(&tuple::new(&[]).unwrap()).unwrap(), AnyView::Tuple(_)));
        assert!(matches!(view(&list::new(&[]).unwrap()).unwrap(), AnyView::List(_)));
        assert!(matches!(view(&none()).unwrap(), AnyView::Object(_)));
        let float_type = unsafe { &*builtins().float_type() }.to_obj();
        assert!(matches!(view(&float_type).unwrap(), AnyView::Type(_)));
    }

    #[test]
    fn test_typed_view_rejects_other_kind() {
        let f = float::new(1.0).unwrap();
        assert!(matches!(IntView::new(&f), Err(InspectError::KindMismatch { .. })));
    }

    #[test]
    fn test_write_access_classes() {
        let _guard = crate::test_lock();
        let f = float::new(1.5).unwrap();
        let v = FloatView::new(&f).unwrap();

        v.set_value(2.5).unwrap();
        assert_eq!(float::value(&f).unwrap(), 2.5);

        let before = v.bytes().unwrap();
        let err = v.write("ob_type", FieldValue::Ptr(0)).unwrap_err();
        assert!(matches!(err, InspectError::Capability(_)));
        assert_eq!(v.bytes().unwrap(), before);

        let d = marrow_runtime::types::dict::new().unwrap();
        let dv = DictView::new(&d).unwrap();
        let _scope = dv.unsafe_scope();
        assert!(matches!(dv.write("ma_used", 3u64), Err(InspectError::ReadOnlyField(_))));
    }

    #[test]
    fn test_int_value_and_digits() {
        let n = int::new(-((1 << 31) + 3)).unwrap();
        let v = IntView::new(&n).unwrap();
        assert_eq!(v.value().unwrap(), -((1 << 31) + 3));
        assert_eq!(v.digits().unwrap(), vec![3, 2]);
        assert_eq!(v.size().unwrap(), -2);
        assert_eq!(v.mem_size().unwrap(), 32);
    }

    #[test]
    fn test_int_set_value_respects_block() {
        let _guard = crate::test_lock();
        let n = int::new(7).unwrap();
        let v = IntView::new(&n).unwrap();
        assert!(matches!(v.set_value(9), Err(InspectError::Capability(_))));

        let _scope = v.unsafe_scope();
        v.set_value(-9).unwrap();
        assert_eq!(int::value(&n).unwrap(), -9);
        // 28 bytes requested, 32 usable: two digits fit, four do not.
        v.set_value(1 << 40).unwrap();
        assert_eq!(int::value(&n).unwrap(), 1 << 40);
        assert!(matches!(v.set_value(i64::MIN), Err(InspectError::OutOfBounds { .. })));
        assert_eq!(v.mem_size().unwrap(), heap().requested_size(n.addr()).unwrap());
    }

    #[test]
    fn test_str_view() {
        let s = string::intern("view-str").unwrap();
        let v = StrView::new(&s).unwrap();
        assert_eq!(v.text().unwrap(), "view-str");
        assert_eq!(v.len().unwrap(), 8);
        assert!(v.is_interned().unwrap());
        assert_eq!(v.cached_hash().unwrap(), None);
        v.unintern().unwrap();
        assert!(!v.is_interned().unwrap());
    }

    #[test]
    fn test_tuple_insert_and_delete() {
        let _guard = crate::test_lock();
        let a = int::new(1).unwrap();
        let b = int::new(2).unwrap();
        let c = int::new(3).unwrap();
        // 40 bytes requested, 48 usable: one free item slot.
        let t = tuple::new(&[a.clone(), b.clone()]).unwrap();
        let v = TupleView::new(&t).unwrap();
        assert!(matches!(v.insert(0, &c), Err(InspectError::Capability(_))));

        let _scope = v.unsafe_scope();
        v.insert(1, &c).unwrap();
        assert_eq!(tuple::len(&t), 3);
        assert!(tuple::get(&t, 1).unwrap().is(&c));
        assert!(matches!(v.insert(0, &c), Err(InspectError::OutOfBounds { needed: 56, available: 48 })));

        let before = c.refcnt();
        v.delete(1).unwrap();
        assert_eq!(c.refcnt(), before - 1);
        assert_eq!(v.items().unwrap().len(), 2);
        assert!(v.get(1).unwrap().unwrap().is(&b));
        assert_eq!(v.mem_size().unwrap(), 40);
    }

    #[test]
    fn test_set_size_sign_handling() {
        let _guard = crate::test_lock();
        let t = tuple::new(&[int::new(1).unwrap()]).unwrap();
        let tv = TupleView::new(&t).unwrap();
        let n = int::new(5).unwrap();
        let nv = IntView::new(&n).unwrap();
        let _g = unsafe_global();

        let before = tv.bytes().unwrap();
        assert!(matches!(tv.set_size(-1), Err(InspectError::ValueRange { .. })));
        assert_eq!(tv.bytes().unwrap(), before);
        assert_eq!(tv.len().unwrap(), 1);
        assert_eq!(heap().requested_size(t.addr()), Some(tv.mem_size().unwrap()));

        nv.set_size(-1).unwrap();
        assert_eq!(int::value(&n).unwrap(), -5);
        assert_eq!(heap().requested_size(n.addr()), Some(28));
    }

    #[test]
    fn test_list_view() {
        let x = int::new(10).unwrap();
        let y = int::new(20).unwrap();
        let l = list::new(&[x.clone()]).unwrap();
        let v = ListView::new(&l).unwrap();
        assert_eq!(v.len().unwrap(), 1);
        assert!(v.allocated().unwrap() >= 1);
        assert!(v.get(0).unwrap().unwrap().is(&x));
        v.set(0, &y).unwrap();
        assert!(list::get(&l, 0).unwrap().is(&y));
        assert!(matches!(v.get(1), Err(InspectError::OutOfBounds { .. })));
    }

    #[test]
    fn test_instance_view_slots() {
        let cls = new_class(&ClassSpec::new("ViewSlots").slots(&["a", "b"]).dict(DictConvention::Inline)).unwrap();
        let obj = call(&cls, &[]).unwrap();
        let v = InstanceView::new(&obj).unwrap();
        assert_eq!(v.slot_names().unwrap(), vec!["a".to_string(), "b".to_string()]);
        assert!(v.get_slot("a").unwrap().is_none());
        let one = int::new(1).unwrap();
        v.set_slot("a", &one).unwrap();
        assert!(v.get_slot("a").unwrap().unwrap().is(&one));
        assert_eq!(v.attached_table().unwrap(), AttachedTable::Inline { offset: 32 });
        assert!(matches!(v.set_slot("nope", &one), Err(InspectError::UnknownField { .. })));
    }

    #[test]
    fn test_drop_ref() {
        let f = float::new(3.0).unwrap();
        let v = View::new(&f).unwrap();
        assert_eq!(f.refcnt(), 2);
        v.drop_ref();
        assert_eq!(f.refcnt(), 1);
        assert!(v.is_dropped());
        assert!(matches!(v.read("ob_fval"), Err(InspectError::Dropped)));
        assert!(matches!(v.base(), Err(InspectError::Dropped)));
        v.drop_ref();
    }

    #[test]
    fn test_base_without_reference() {
        let _guard = crate::test_lock();
        let f = float::new(3.0).unwrap();
        let v = View::with_config(&f, ViewConfig::detached()).unwrap();
        assert!(matches!(v.base(), Err(InspectError::NoReference)));
        let _g = unsafe_global();
        assert!(v.base().unwrap().is(&f));
    }

    #[test]
    fn test_set_type_adjusts_heap_type_refs() {
        let _guard = crate::test_lock();
        let a = new_class(&ClassSpec::new("TypeA")).unwrap();
        let b = new_class(&ClassSpec::new("TypeB")).unwrap();
        let obj = call(&a, &[]).unwrap();
        let v = View::new(&obj).unwrap();
        let (a_count, b_count) = (a.refcnt(), b.refcnt());
        assert!(matches!(v.set_type(&b), Err(InspectError::Capability(_))));

        let _scope = v.unsafe_scope();
        v.set_type(&b).unwrap();
        assert!(obj.type_obj().is(&b));
        assert_eq!(a.refcnt(), a_count - 1);
        assert_eq!(b.refcnt(), b_count + 1);
        assert!(v.type_object().unwrap().is(&b));
    }
}
