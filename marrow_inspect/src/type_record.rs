//! Type records.
//!
//! A [`TypeRecord`] is an [`ObjectRecord`] over a type object with typed
//! accessors for the parts the patch engine needs: sizes, flags, the
//! attribute table and the protocol tables.
//!
//! ```text
//!   TypeObject
//!   +----------------+
//!   | tp_as_number   | ---> NumberMethods   { nb_add, nb_subtract, ... }
//!   | tp_as_sequence | ---> SequenceMethods { sq_length, ... }
//!   | tp_as_mapping  | ---> null            (allocated on demand)
//!   | tp_as_async    | ---> null
//!   +----------------+
//! ```

use crate::catalog::RecordKind;
use crate::error::{InspectError, Result};
use crate::record::{Address, FieldValue, ObjectRecord};

use marrow_runtime::object::attr::type_modified;
use marrow_runtime::object::protocols::{alloc_protocol_table, free_protocol_table, table_is_empty};
use marrow_runtime::{Obj, Protocol, SlotDef, SlotFn, TypeFlags, TypeObject};
use std::ptr::NonNull;

/// Handle to a protocol table returned by
/// [`TypeRecord::ensure_protocol_slots`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotTable {
    /// Which table.
    pub protocol: Protocol,
    /// Table address; stable for as long as the table is installed.
    pub ptr: NonNull<u8>,
    /// Whether this call allocated the table.
    pub created: bool,
}

/// Typed overlay over a type object.
#[derive(Debug, Clone)]
pub struct TypeRecord {
    record: ObjectRecord,
}

impl TypeRecord {
    /// Record over a type object.
    pub fn of(tp: &Obj) -> Result<Self> {
        Self::from_record(ObjectRecord::of(tp)?)
    }

    /// Record over the type object at `tp`.
    pub fn from_ptr(tp: *mut TypeObject) -> Result<Self> {
        Self::from_record(ObjectRecord::at(Address::new(tp as usize))?)
    }

    fn from_record(record: ObjectRecord) -> Result<Self> {
        if record.kind() != RecordKind::Type {
            return Err(InspectError::KindMismatch {
                expected: "type".into(),
                found: record.kind().to_string(),
            });
        }
        Ok(Self { record })
    }

    /// The underlying object record.
    #[inline]
    pub fn record(&self) -> &ObjectRecord {
        &self.record
    }

    /// Address of the type object.
    #[inline]
    pub fn as_ptr(&self) -> *mut TypeObject {
        self.record.address().get() as *mut TypeObject
    }

    fn type_ref(&self) -> Result<&TypeObject> {
        if !self.record.is_live() {
            return Err(InspectError::Dangling(self.record.address().get()));
        }
        // Safety: the record is live and of kind type.
        Ok(unsafe { &*self.as_ptr() })
    }

    /// New strong reference to the type.
    pub fn to_obj(&self) -> Result<Obj> {
        Ok(self.type_ref()?.to_obj())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn name(&self) -> Result<String> {
        Ok(self.type_ref()?.name().to_string())
    }

    /// Size of an instance without trailing items.
    pub fn basic_size(&self) -> Result<usize> {
        Ok(self.type_ref()?.tp_basicsize as usize)
    }

    /// Size of each trailing item (0 for fixed-size kinds).
    pub fn item_size(&self) -> Result<usize> {
        Ok(self.type_ref()?.tp_itemsize as usize)
    }

    pub fn flags(&self) -> Result<TypeFlags> {
        Ok(self.type_ref()?.flags())
    }

    pub fn is_immutable(&self) -> Result<bool> {
        Ok(self.type_ref()?.has(TypeFlags::IMMUTABLE))
    }

    pub fn dict_offset(&self) -> Result<isize> {
        Ok(self.type_ref()?.tp_dictoffset)
    }

    pub fn version_tag(&self) -> Result<u64> {
        Ok(self.type_ref()?.tp_version_tag)
    }

    /// Base type, `None` for the root.
    pub fn base(&self) -> Result<Option<TypeRecord>> {
        let base = self.type_ref()?.tp_base;
        if base.is_null() {
            return Ok(None);
        }
        TypeRecord::from_ptr(base).map(Some)
    }

    /// Protocol table pointer, `None` while unallocated. For
    /// [`Protocol::Main`] this is the type object itself.
    pub fn protocol_table(&self, protocol: Protocol) -> Result<Option<NonNull<u8>>> {
        Ok(NonNull::new(self.type_ref()?.protocol_table(protocol)))
    }

    /// The type's own attribute dictionary.
    pub fn attribute_table(&self) -> Result<Option<Obj>> {
        // Safety: tp_dict is null or an owned dict reference.
        Ok(unsafe { Obj::from_borrowed_ptr(self.type_ref()?.tp_dict) })
    }

    /// Address of the instance allocator, 0 if the default is used.
    pub fn allocator(&self) -> Result<usize> {
        Ok(self.type_ref()?.tp_alloc.map_or(0, |f| f as usize))
    }

    /// Address of the instance deallocator, 0 if the default is used.
    pub fn deallocator(&self) -> Result<usize> {
        Ok(self.type_ref()?.tp_dealloc.map_or(0, |f| f as usize))
    }

    // =========================================================================
    // Protocol Tables
    // =========================================================================

    /// The protocol table, allocating a zeroed one if it is null.
    ///
    /// Idempotent: a second call returns the same pointer with `created`
    /// false.
    pub fn ensure_protocol_slots(&self, protocol: Protocol) -> Result<SlotTable> {
        if let Some(ptr) = self.protocol_table(protocol)? {
            return Ok(SlotTable {
                protocol,
                ptr,
                created: false,
            });
        }
        let table = alloc_protocol_table(protocol);
        let Some(ptr) = NonNull::new(table) else {
            return Err(InspectError::KindMismatch {
                expected: "separately allocated protocol table".into(),
                found: protocol.to_string(),
            });
        };
        // Safety: the field is a table pointer and the table is fresh.
        unsafe {
            self.record
                .write_unchecked(protocol.field_name(), &FieldValue::Ptr(table as usize))?;
        }
        tracing::debug!(
            type_name = self.type_ref()?.name(),
            %protocol,
            table = table as usize,
            "allocated protocol table"
        );
        Ok(SlotTable {
            protocol,
            ptr,
            created: true,
        })
    }

    /// Free a protocol table if every slot in it is null.
    ///
    /// Returns whether the table was freed.
    ///
    /// # Safety
    ///
    /// The table must have been allocated by
    /// [`ensure_protocol_slots`](Self::ensure_protocol_slots).
    pub unsafe fn release_protocol_table(&self, protocol: Protocol) -> Result<bool> {
        let Some(table) = self.protocol_table(protocol)? else {
            return Ok(false);
        };
        if protocol == Protocol::Main {
            return Ok(false);
        }
        // Safety: a live table of this protocol.
        if !unsafe { table_is_empty(protocol, table.as_ptr()) } {
            return Ok(false);
        }
        // Safety: the field is a table pointer; the caller vouches for
        // provenance of the table being freed.
        unsafe {
            self.record.write_unchecked(protocol.field_name(), &FieldValue::Ptr(0))?;
            free_protocol_table(protocol, table.as_ptr());
        }
        tracing::debug!(
            type_name = self.type_ref()?.name(),
            %protocol,
            "freed protocol table"
        );
        Ok(true)
    }

    /// Current value of a slot.
    pub fn read_slot(&self, def: &SlotDef) -> Result<Option<SlotFn>> {
        self.type_ref()?;
        // Safety: live type; slots hold zero or a function of the slot's
        // signature.
        Ok(unsafe { SlotFn::from_addr(def.signature(), def.read(self.as_ptr())) })
    }

    /// Raw slot value (0 when empty or the table is absent).
    pub fn read_slot_raw(&self, def: &SlotDef) -> Result<usize> {
        self.type_ref()?;
        // Safety: live type.
        Ok(unsafe { def.read(self.as_ptr()) })
    }

    /// Write a raw slot value. Returns `false` if the table is absent.
    ///
    /// # Safety
    ///
    /// `value` must be zero or a function of the slot's signature.
    pub unsafe fn write_slot(&self, def: &SlotDef, value: usize) -> Result<bool> {
        self.type_ref()?;
        // Safety: live type; caller guarantees the value.
        Ok(unsafe { def.write(self.as_ptr(), value) })
    }

    /// Invalidate cached lookups on the type and its subclasses.
    pub fn modified(&self) -> Result<()> {
        self.type_ref()?;
        // Safety: live type.
        unsafe { type_modified(self.as_ptr()) };
        Ok(())
    }

    /// Clear the immutability flag until the returned guard drops.
    pub fn mutable_scope(&self) -> Result<MutableScope> {
        MutableScope::enter(self.to_obj()?)
    }
}

// =============================================================================
// Mutable Scope
// =============================================================================

/// Guard that keeps a type writable and restores its immutability flag on
/// drop, including on early return through `?`.
#[must_use = "the type becomes immutable again when the guard drops"]
pub struct MutableScope {
    ty: Obj,
    was_immutable: bool,
}

impl MutableScope {
    fn enter(ty: Obj) -> Result<Self> {
        let tp = ty.as_type_ptr().ok_or_else(|| InspectError::KindMismatch {
            expected: "type".into(),
            found: ty.type_name(),
        })?;
        // Safety: `ty` keeps the type alive.
        let t = unsafe { &mut *tp };
        let was_immutable = t.has(TypeFlags::IMMUTABLE);
        t.set_flag(TypeFlags::IMMUTABLE, false);
        Ok(Self { ty, was_immutable })
    }

    /// The type being kept mutable.
    pub fn ty(&self) -> &Obj {
        &self.ty
    }
}

impl Drop for MutableScope {
    fn drop(&mut self) {
        if let Some(tp) = self.ty.as_type_ptr() {
            // Safety: `ty` keeps the type alive.
            unsafe { (*tp).set_flag(TypeFlags::IMMUTABLE, self.was_immutable) };
        }
    }
}
