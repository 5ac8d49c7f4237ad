//! Object records.
//!
//! An [`ObjectRecord`] is a typed overlay at an address: a layout plus a
//! location. It owns nothing and never frees anything. Several records may
//! overlay the same object at once.
//!
//! Heap-backed records remember the allocation serial of the block they
//! were created over. Every access first checks that the same block is
//! still live at that address, so a record over a freed (or recycled)
//! address fails with [`InspectError::Dangling`] instead of reading
//! whatever now lives there.

use crate::catalog::{RecordKind, resolve};
use crate::error::{InspectError, Result};
use crate::layout::{FieldDescriptor, FieldType, Prim, RecordLayout};

use marrow_gc::heap;
use marrow_runtime::object::lifecycle;
use marrow_runtime::object::type_obj::MANAGED_DICT_OFFSET;
use marrow_runtime::{Obj, ObjectHeader, TypeFlags, TypeObject};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

// =============================================================================
// Addresses
// =============================================================================

/// An object address, kept opaque until it is explicitly reified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(usize);

impl Address {
    /// Wrap a raw address.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Address of a live object.
    #[inline]
    pub fn of(obj: &Obj) -> Self {
        Self(obj.addr())
    }

    /// The raw address.
    #[inline]
    pub const fn get(self) -> usize {
        self.0
    }

    /// Whether a heap block currently starts at this address.
    #[inline]
    pub fn is_allocated(self) -> bool {
        heap().contains(self.0)
    }

    /// A new strong reference to the object at this address.
    ///
    /// Returns `None` if no block starts here.
    ///
    /// # Safety
    ///
    /// The block must hold a complete object with a valid type pointer.
    /// The reference is created even when the object's count says it is
    /// already dead.
    pub unsafe fn reify(self) -> Option<Obj> {
        if !self.is_allocated() {
            return None;
        }
        // Safety: caller guarantees the block holds an object.
        NonNull::new(self.0 as *mut ObjectHeader).map(|p| unsafe { Obj::from_borrowed(p) })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

// =============================================================================
// Field Values
// =============================================================================

/// A value read from or written to a field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int(i64),
    UInt(u64),
    Float(f64),
    Ptr(usize),
    Array(Vec<FieldValue>),
}

impl FieldValue {
    /// Integer value, if representable as `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            FieldValue::Int(v) => Some(v),
            FieldValue::UInt(v) => i64::try_from(v).ok(),
            FieldValue::Ptr(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    /// Unsigned value, if representable as `u64`.
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            FieldValue::Int(v) => u64::try_from(v).ok(),
            FieldValue::UInt(v) => Some(v),
            FieldValue::Ptr(v) => Some(v as u64),
            _ => None,
        }
    }

    /// Float value.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            FieldValue::Float(v) => Some(v),
            _ => None,
        }
    }

    /// Pointer value.
    pub fn as_ptr(&self) -> Option<usize> {
        match *self {
            FieldValue::Ptr(v) => Some(v),
            FieldValue::UInt(v) => usize::try_from(v).ok(),
            _ => None,
        }
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Int(v.into())
    }
}

impl From<isize> for FieldValue {
    fn from(v: isize) -> Self {
        FieldValue::Int(v as i64)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::UInt(v)
    }
}

impl From<u32> for FieldValue {
    fn from(v: u32) -> Self {
        FieldValue::UInt(v.into())
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<Address> for FieldValue {
    fn from(a: Address) -> Self {
        FieldValue::Ptr(a.get())
    }
}

// =============================================================================
// Raw Access
// =============================================================================

#[inline]
const fn mask(bits: u32) -> u64 {
    if bits >= 64 { u64::MAX } else { (1 << bits) - 1 }
}

/// Load a primitive.
///
/// # Safety
///
/// `p` must be readable for `prim.size()` bytes.
unsafe fn load(p: *const u8, prim: Prim) -> FieldValue {
    // Safety: caller guarantees readability; reads are unaligned so that
    // buffer-backed records need no particular alignment.
    unsafe {
        match prim {
            Prim::I8 => FieldValue::Int(p.cast::<i8>().read_unaligned().into()),
            Prim::U8 => FieldValue::UInt(p.read_unaligned().into()),
            Prim::I16 => FieldValue::Int(p.cast::<i16>().read_unaligned().into()),
            Prim::U16 => FieldValue::UInt(p.cast::<u16>().read_unaligned().into()),
            Prim::I32 => FieldValue::Int(p.cast::<i32>().read_unaligned().into()),
            Prim::U32 => FieldValue::UInt(p.cast::<u32>().read_unaligned().into()),
            Prim::I64 => FieldValue::Int(p.cast::<i64>().read_unaligned()),
            Prim::U64 => FieldValue::UInt(p.cast::<u64>().read_unaligned()),
            Prim::Isize => FieldValue::Int(p.cast::<isize>().read_unaligned() as i64),
            Prim::Usize => FieldValue::UInt(p.cast::<usize>().read_unaligned() as u64),
            Prim::F64 => FieldValue::Float(p.cast::<f64>().read_unaligned()),
            Prim::Ptr | Prim::ObjPtr | Prim::FnPtr => FieldValue::Ptr(p.cast::<usize>().read_unaligned()),
        }
    }
}

/// Load the raw bits of an integer or pointer.
///
/// # Safety
///
/// As [`load`].
unsafe fn load_bits(p: *const u8, prim: Prim) -> u64 {
    // Safety: forwarded.
    unsafe {
        match prim.size() {
            1 => p.read_unaligned().into(),
            2 => p.cast::<u16>().read_unaligned().into(),
            4 => p.cast::<u32>().read_unaligned().into(),
            _ => p.cast::<u64>().read_unaligned(),
        }
    }
}

/// Store the low `prim.size()` bytes of `bits`.
///
/// # Safety
///
/// `p` must be writable for `prim.size()` bytes.
unsafe fn store_bits(p: *mut u8, prim: Prim, bits: u64) {
    // Safety: caller guarantees writability.
    unsafe {
        match prim.size() {
            1 => p.write_unaligned(bits as u8),
            2 => p.cast::<u16>().write_unaligned(bits as u16),
            4 => p.cast::<u32>().write_unaligned(bits as u32),
            _ => p.cast::<u64>().write_unaligned(bits),
        }
    }
}

/// Encode `value` for a field of type `prim` (or a bit-field of `width`
/// bits), rejecting anything that would not round-trip.
fn encode(field: &str, prim: Prim, width: Option<u32>, value: &FieldValue) -> Result<u64> {
    let out_of_range = || InspectError::ValueRange {
        field: field.to_string(),
        value: format!("{value:?}"),
    };
    match (prim, value) {
        (Prim::F64, FieldValue::Float(f)) if width.is_none() => return Ok(f.to_bits()),
        (Prim::F64, _) | (_, FieldValue::Float(_)) | (_, FieldValue::Array(_)) => return Err(out_of_range()),
        _ => {}
    }

    let bits = width.unwrap_or_else(|| prim.bits());
    if prim.is_signed() && width.is_none() {
        let v = value.as_i64().ok_or_else(out_of_range)?;
        let (min, max) = if bits >= 64 {
            (i64::MIN, i64::MAX)
        } else {
            (-(1i64 << (bits - 1)), (1i64 << (bits - 1)) - 1)
        };
        if v < min || v > max {
            return Err(out_of_range());
        }
        Ok(v as u64 & mask(bits))
    } else {
        let v = value.as_u64().ok_or_else(out_of_range)?;
        if v > mask(bits) {
            return Err(out_of_range());
        }
        Ok(v)
    }
}

// =============================================================================
// Object Record
// =============================================================================

/// How an object's instance dictionary is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachedTable {
    /// The type has no instance dictionary.
    None,
    /// A pointer inside the body at `offset`.
    Inline { offset: usize },
    /// A pointer in the block prefix, before the object.
    Managed,
}

/// A typed overlay over one object's memory.
#[derive(Clone)]
pub struct ObjectRecord {
    addr: usize,
    kind: RecordKind,
    layout: Arc<RecordLayout>,
    backing: Backing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backing {
    /// A heap block with this allocation serial.
    Heap(u64),
    /// A caller-owned buffer of this many bytes.
    Buffer(usize),
}

impl ObjectRecord {
    /// Record over a live object.
    pub fn of(obj: &Obj) -> Result<Self> {
        Self::at(Address::of(obj))
    }

    /// Record over whatever object currently lives at `addr`.
    pub fn at(addr: Address) -> Result<Self> {
        let serial = heap()
            .serial(addr.get())
            .ok_or(InspectError::Dangling(addr.get()))?;
        // Safety: a live block always starts with an object header.
        let tp = unsafe { (*(addr.get() as *const ObjectHeader)).ob_type };
        // Safety: a live object's type is live.
        let (kind, layout) = unsafe { resolve(tp)? };
        Ok(Self {
            addr: addr.get(),
            kind,
            layout,
            backing: Backing::Heap(serial),
        })
    }

    /// Record over a byte buffer holding a copy of an object body.
    ///
    /// # Safety
    ///
    /// `buf` must stay valid for `len` bytes for as long as the record is
    /// used, and must hold at least the fixed part of `layout`.
    pub unsafe fn over_buffer(buf: *mut u8, len: usize, kind: RecordKind, layout: Arc<RecordLayout>) -> Self {
        Self {
            addr: buf as usize,
            kind,
            layout,
            backing: Backing::Buffer(len),
        }
    }

    /// Re-read the type pointer and switch to the matching layout.
    ///
    /// Used after the body at this address has been replaced.
    pub(crate) fn rebind(&mut self) -> Result<()> {
        let fresh = Self::at(self.address())?;
        *self = fresh;
        Ok(())
    }

    /// Address of the record.
    #[inline]
    pub fn address(&self) -> Address {
        Address(self.addr)
    }

    /// Kind the record is read as.
    #[inline]
    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    /// Layout the record is read through.
    #[inline]
    pub fn layout(&self) -> &Arc<RecordLayout> {
        &self.layout
    }

    /// Whether the memory under the record is still the block it was
    /// created over.
    pub fn is_live(&self) -> bool {
        match self.backing {
            Backing::Heap(serial) => heap().serial(self.addr) == Some(serial),
            Backing::Buffer(_) => true,
        }
    }

    #[inline]
    fn ensure_live(&self) -> Result<()> {
        if self.is_live() {
            Ok(())
        } else {
            Err(InspectError::Dangling(self.addr))
        }
    }

    #[inline]
    fn ptr(&self, offset: usize) -> *mut u8 {
        (self.addr + offset) as *mut u8
    }

    /// Field descriptor by name.
    pub fn field(&self, name: &str) -> Result<&FieldDescriptor> {
        self.layout.field(name).ok_or_else(|| InspectError::UnknownField {
            record: self.layout.name().to_string(),
            field: name.to_string(),
        })
    }

    // =========================================================================
    // Sizes
    // =========================================================================

    /// Number of trailing items (0 for layouts without an open array).
    pub fn open_len(&self) -> Result<usize> {
        self.ensure_live()?;
        let Some(open) = self.layout.open_array() else {
            return Ok(0);
        };
        let FieldType::OpenArray { len_from, abs, .. } = &open.ty else {
            return Ok(0);
        };
        let len = self.read(len_from)?.as_i64().unwrap_or(0);
        Ok(if *abs { len.unsigned_abs() as usize } else { len.max(0) as usize })
    }

    /// The field holding the record's runtime length: `ob_size` when the
    /// layout has one, otherwise the open array's count field.
    pub fn size_field(&self) -> Option<&FieldDescriptor> {
        self.layout.field("ob_size").or_else(|| match &self.layout.open_array()?.ty {
            FieldType::OpenArray { len_from, .. } => self.layout.field(len_from),
            _ => None,
        })
    }

    /// True footprint: fixed part, trailing items and extra bytes.
    pub fn size_in_memory(&self) -> Result<usize> {
        Ok(self.layout.size_with(self.open_len()?))
    }

    /// Bytes the object may occupy: the heap block's usable size after
    /// rounding, or the buffer length.
    pub fn size_allocated(&self) -> Result<usize> {
        match self.backing {
            Backing::Buffer(len) => Ok(len),
            Backing::Heap(_) => {
                self.ensure_live()?;
                heap().usable_size(self.addr).ok_or(InspectError::Dangling(self.addr))
            }
        }
    }

    /// Copy of the record's bytes, `size_in_memory` long.
    pub fn bytes(&self) -> Result<Vec<u8>> {
        let len = self.size_in_memory()?;
        // Safety: the record is live and covers `len` bytes.
        Ok(unsafe { std::slice::from_raw_parts(self.ptr(0), len) }.to_vec())
    }

    // =========================================================================
    // Header
    // =========================================================================

    /// Raw header reference count.
    pub fn header_reference_count(&self) -> Result<isize> {
        self.ensure_live()?;
        // Safety: live record; the header is always present.
        Ok(unsafe { (*self.ptr(0).cast::<ObjectHeader>()).ob_refcnt })
    }

    /// Overwrite the header reference count without any side effects.
    ///
    /// # Safety
    ///
    /// The count must keep matching the references that exist, or the
    /// object will be freed early or leak.
    pub unsafe fn set_reference_count(&self, count: isize) -> Result<()> {
        self.ensure_live()?;
        // Safety: live record; caller takes responsibility for accounting.
        unsafe { (*self.ptr(0).cast::<ObjectHeader>()).ob_refcnt = count };
        Ok(())
    }

    /// Type pointer from the header.
    pub fn type_ptr(&self) -> Result<*mut TypeObject> {
        self.ensure_live()?;
        // Safety: live record.
        Ok(unsafe { (*self.ptr(0).cast::<ObjectHeader>()).ob_type })
    }

    fn type_ref(&self) -> Result<&TypeObject> {
        let tp = self.type_ptr()?;
        // Safety: a live object's type is live.
        Ok(unsafe { &*tp })
    }

    // =========================================================================
    // Collector And Dictionary State
    // =========================================================================

    /// Whether the type participates in collector tracking.
    pub fn is_gc(&self) -> Result<bool> {
        Ok(self.type_ref()?.has(TypeFlags::HAVE_GC))
    }

    /// Whether the object is on the collector's tracking list right now.
    pub fn is_collector_tracked(&self) -> Result<bool> {
        if !self.is_gc()? || matches!(self.backing, Backing::Buffer(_)) {
            return Ok(false);
        }
        // Safety: live object.
        let obj = unsafe { Address(self.addr).reify() }.ok_or(InspectError::Dangling(self.addr))?;
        Ok(lifecycle::is_tracked(&obj))
    }

    /// How the object's instance dictionary is attached.
    pub fn attached_table(&self) -> Result<AttachedTable> {
        let t = self.type_ref()?;
        Ok(match t.tp_dictoffset {
            0 => AttachedTable::None,
            MANAGED_DICT_OFFSET => AttachedTable::Managed,
            off if off > 0 => AttachedTable::Inline { offset: off as usize },
            _ => AttachedTable::None,
        })
    }

    /// Whether the block has a prefix slot for a managed dictionary.
    pub fn has_dict_slot(&self) -> bool {
        match self.backing {
            Backing::Heap(_) => heap()
                .block(self.addr)
                .is_some_and(|b| b.prefix.dict_slot),
            Backing::Buffer(_) => false,
        }
    }

    // =========================================================================
    // Fields
    // =========================================================================

    /// Read a field. Open arrays are read in full.
    pub fn read(&self, name: &str) -> Result<FieldValue> {
        self.ensure_live()?;
        let f = self.field(name)?;
        // Safety: live record; the field lies within the layout.
        unsafe {
            let p = self.ptr(f.offset);
            Ok(match &f.ty {
                FieldType::Prim(prim) => load(p, *prim),
                FieldType::Array(prim, n) => {
                    FieldValue::Array((0..*n).map(|i| load(p.add(i * prim.size()), *prim)).collect())
                }
                FieldType::Bits { backing, width } => {
                    let word = load_bits(p, *backing);
                    FieldValue::UInt((word >> f.bit_offset.unwrap_or(0)) & mask(*width))
                }
                FieldType::OpenArray { elem, .. } => {
                    let n = self.open_len()?;
                    FieldValue::Array((0..n).map(|i| load(p.add(i * elem.size()), *elem)).collect())
                }
            })
        }
    }

    fn item_bounds(&self, f: &FieldDescriptor, index: usize) -> Result<Prim> {
        let (elem, len) = match &f.ty {
            FieldType::Array(prim, n) => (*prim, *n),
            FieldType::OpenArray { elem, .. } => (*elem, self.open_len()?),
            _ => {
                return Err(InspectError::KindMismatch {
                    expected: "array field".into(),
                    found: format!("scalar field '{}'", f.name),
                });
            }
        };
        if index >= len {
            return Err(InspectError::OutOfBounds {
                needed: index + 1,
                available: len,
            });
        }
        Ok(elem)
    }

    /// Read one element of an array field.
    pub fn read_item(&self, name: &str, index: usize) -> Result<FieldValue> {
        self.ensure_live()?;
        let f = self.field(name)?;
        let elem = self.item_bounds(f, index)?;
        // Safety: index is within the array.
        Ok(unsafe { load(self.ptr(f.offset + index * elem.size()), elem) })
    }

    /// Write a field, ignoring its access class.
    ///
    /// The value is validated in full before anything is written.
    ///
    /// # Safety
    ///
    /// Raw pointers and counts written this way bypass reference counting;
    /// the caller keeps the object consistent.
    pub unsafe fn write_unchecked(&self, name: &str, value: &FieldValue) -> Result<()> {
        self.ensure_live()?;
        let f = self.field(name)?;
        let p = self.ptr(f.offset);
        match &f.ty {
            FieldType::Prim(prim) => {
                let bits = encode(&f.name, *prim, None, value)?;
                // Safety: the field lies within the live record.
                unsafe { store_bits(p, *prim, bits) };
            }
            FieldType::Bits { backing, width } => {
                let bits = encode(&f.name, *backing, Some(*width), value)?;
                let shift = f.bit_offset.unwrap_or(0);
                let field_mask = mask(*width) << shift;
                // Safety: the backing word lies within the live record.
                unsafe {
                    let word = load_bits(p, *backing);
                    store_bits(p, *backing, (word & !field_mask) | (bits << shift));
                }
            }
            FieldType::Array(prim, n) => {
                let FieldValue::Array(items) = value else {
                    return Err(InspectError::ValueRange {
                        field: f.name.to_string(),
                        value: format!("{value:?}"),
                    });
                };
                if items.len() != *n {
                    return Err(InspectError::OutOfBounds {
                        needed: items.len(),
                        available: *n,
                    });
                }
                let encoded = items
                    .iter()
                    .map(|v| encode(&f.name, *prim, None, v))
                    .collect::<Result<Vec<_>>>()?;
                for (i, bits) in encoded.into_iter().enumerate() {
                    // Safety: index is within the array.
                    unsafe { store_bits(p.add(i * prim.size()), *prim, bits) };
                }
            }
            FieldType::OpenArray { .. } => {
                return Err(InspectError::KindMismatch {
                    expected: "scalar field".into(),
                    found: format!("open array '{}'; write items individually", f.name),
                });
            }
        }
        Ok(())
    }

    /// Write one element of an array field, ignoring its access class.
    ///
    /// # Safety
    ///
    /// As [`write_unchecked`](Self::write_unchecked).
    pub unsafe fn write_item_unchecked(&self, name: &str, index: usize, value: &FieldValue) -> Result<()> {
        self.ensure_live()?;
        let f = self.field(name)?;
        let elem = self.item_bounds(f, index)?;
        let bits = encode(&f.name, elem, None, value)?;
        // Safety: index is within the array.
        unsafe { store_bits(self.ptr(f.offset + index * elem.size()), elem, bits) };
        Ok(())
    }

    /// Follow an object pointer field to a record over its target.
    pub fn deref_field(&self, name: &str) -> Result<Option<ObjectRecord>> {
        let f = self.field(name)?;
        if f.ty != FieldType::Prim(Prim::ObjPtr) {
            return Err(InspectError::KindMismatch {
                expected: "object pointer".into(),
                found: format!("{:?}", f.ty),
            });
        }
        match self.read(name)?.as_ptr() {
            Some(0) | None => Ok(None),
            Some(p) => ObjectRecord::at(Address(p)).map(Some),
        }
    }
}

impl fmt::Debug for ObjectRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectRecord")
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("kind", &self.kind)
            .field("layout", &self.layout.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marrow_runtime::types::{builtins, dict, float, function, int, list, string, tuple};
    use marrow_runtime::{ClassSpec, DictConvention, RtResult, call, new_class, none};

    fn noop(_args: &[Obj]) -> RtResult<Obj> {
        Ok(none())
    }

    #[test]
    fn test_size_in_memory_matches_heap() {
        let objs = [
            int::new(0).unwrap(),
            int::new(1 << 40).unwrap(),
            int::new(-7).unwrap(),
            float::new(2.5).unwrap(),
            string::new("").unwrap(),
            string::new("hello world").unwrap(),
            tuple::new(&[]).unwrap(),
            tuple::new(&[int::new(1).unwrap(), int::new(2).unwrap()]).unwrap(),
            list::new(&[int::new(1).unwrap()]).unwrap(),
            dict::new().unwrap(),
            function::native("noop", noop).unwrap(),
            none(),
        ];
        let inline = new_class(&ClassSpec::new("SizedInline").slots(&["a"])).unwrap();
        let managed = new_class(&ClassSpec::new("SizedManaged").dict(DictConvention::Managed)).unwrap();
        let classes = [
            call(&inline, &[]).unwrap(),
            call(&managed, &[]).unwrap(),
            inline.clone(),
            managed.clone(),
        ];
        for obj in objs.iter().chain(&classes) {
            let rec = ObjectRecord::of(obj).unwrap();
            let info = heap().block(obj.addr()).unwrap();
            assert_eq!(rec.size_in_memory().unwrap(), info.requested, "{:?}", rec);
            assert_eq!(rec.size_allocated().unwrap(), info.usable, "{:?}", rec);
        }
    }

    #[test]
    fn test_read_header_and_fields() {
        let f = float::new(1.25).unwrap();
        let rec = ObjectRecord::of(&f).unwrap();
        assert_eq!(rec.kind(), RecordKind::Float);
        assert_eq!(rec.read("ob_refcnt").unwrap(), FieldValue::Int(1));
        assert_eq!(rec.read("ob_type").unwrap(), FieldValue::Ptr(builtins().float_type() as usize));
        assert_eq!(rec.read("ob_fval").unwrap(), FieldValue::Float(1.25));
        assert!(matches!(rec.read("nope"), Err(InspectError::UnknownField { .. })));
    }

    #[test]
    fn test_int_digits_use_absolute_size() {
        let n = int::new(-((1 << 30) + 5)).unwrap();
        let rec = ObjectRecord::of(&n).unwrap();
        assert_eq!(rec.read("ob_size").unwrap(), FieldValue::Int(-2));
        assert_eq!(rec.open_len().unwrap(), 2);
        assert_eq!(rec.read_item("ob_digit", 0).unwrap(), FieldValue::UInt(5));
        assert_eq!(rec.read_item("ob_digit", 1).unwrap(), FieldValue::UInt(1));
        assert!(matches!(
            rec.read_item("ob_digit", 2),
            Err(InspectError::OutOfBounds { needed: 3, available: 2 })
        ));
    }

    #[test]
    fn test_str_state_bits_read() {
        let s = string::intern("record-interned").unwrap();
        let rec = ObjectRecord::of(&s).unwrap();
        assert_eq!(rec.read("interned").unwrap(), FieldValue::UInt(1));
        assert_eq!(rec.read("ascii").unwrap(), FieldValue::UInt(1));
        assert_eq!(rec.read("ready").unwrap(), FieldValue::UInt(1));
        assert_eq!(rec.read("length").unwrap(), FieldValue::Int(15));
        assert_eq!(rec.read_item("data", 0).unwrap(), FieldValue::UInt(u64::from(b'r')));
        assert_eq!(rec.size_field().unwrap().name.as_ref(), "length");
    }

    #[test]
    fn test_bitfield_write_keeps_neighbours() {
        let s = string::new("bits").unwrap();
        let rec = ObjectRecord::of(&s).unwrap();
        unsafe { rec.write_unchecked("kind", &FieldValue::UInt(4)).unwrap() };
        assert_eq!(rec.read("kind").unwrap(), FieldValue::UInt(4));
        assert_eq!(rec.read("compact").unwrap(), FieldValue::UInt(1));
        assert_eq!(rec.read("ascii").unwrap(), FieldValue::UInt(1));
        unsafe { rec.write_unchecked("kind", &FieldValue::UInt(1)).unwrap() };
    }

    #[test]
    fn test_write_validates_range_first() {
        let s = string::new("range").unwrap();
        let rec = ObjectRecord::of(&s).unwrap();
        let before = rec.bytes().unwrap();
        let err = unsafe { rec.write_unchecked("interned", &FieldValue::UInt(4)) }.unwrap_err();
        assert!(matches!(err, InspectError::ValueRange { .. }));
        let err = unsafe { rec.write_unchecked("hash", &FieldValue::Float(1.0)) }.unwrap_err();
        assert!(matches!(err, InspectError::ValueRange { .. }));
        assert_eq!(rec.bytes().unwrap(), before);
    }

    #[test]
    fn test_deref_field() {
        let item = float::new(9.5).unwrap();
        let t = tuple::new(&[item.clone()]).unwrap();
        let rec = ObjectRecord::of(&t).unwrap();
        assert_eq!(rec.read_item("ob_item", 0).unwrap(), FieldValue::Ptr(item.addr()));

        let ty = rec.deref_field("ob_type").unwrap().unwrap();
        assert_eq!(ty.kind(), RecordKind::Type);
        assert_eq!(ty.read("tp_basicsize").unwrap(), FieldValue::Int(24));
        assert!(matches!(rec.deref_field("ob_size"), Err(InspectError::KindMismatch { .. })));
    }

    #[test]
    fn test_dangling_record() {
        let f = float::new(4.0).unwrap();
        let rec = ObjectRecord::of(&f).unwrap();
        drop(f);
        assert!(!rec.is_live());
        assert!(matches!(rec.read("ob_fval"), Err(InspectError::Dangling(_))));
    }

    #[test]
    fn test_over_buffer() {
        let f = float::new(6.5).unwrap();
        let rec = ObjectRecord::of(&f).unwrap();
        let mut buf = rec.bytes().unwrap();
        let copy = unsafe { ObjectRecord::over_buffer(buf.as_mut_ptr(), buf.len(), rec.kind(), Arc::clone(rec.layout())) };
        assert_eq!(copy.read("ob_fval").unwrap(), FieldValue::Float(6.5));
        assert_eq!(copy.size_allocated().unwrap(), 24);
        assert!(!copy.is_collector_tracked().unwrap());
    }

    #[test]
    fn test_collector_state() {
        let t = tuple::new(&[]).unwrap();
        let rec = ObjectRecord::of(&t).unwrap();
        assert!(rec.is_gc().unwrap());
        assert!(rec.is_collector_tracked().unwrap());
        assert_eq!(rec.attached_table().unwrap(), AttachedTable::None);

        let n = int::new(3).unwrap();
        let rec = ObjectRecord::of(&n).unwrap();
        assert!(!rec.is_gc().unwrap());
        assert!(!rec.is_collector_tracked().unwrap());
    }
}
