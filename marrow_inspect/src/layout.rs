//! Record layouts.
//!
//! A [`RecordLayout`] is computed once from an ordered list of field
//! declarations and never changes afterwards. Offsets follow C struct
//! rules:
//!
//! ```text
//!   declaration               placement
//!   ─────────────────────     ─────────────────────────────────────────
//!   scalar / pointer / array  next offset aligned to the element type
//!   bit-field                 packed into the current backing word while
//!                             the width lasts and the backing type matches
//!   open array (last only)    zero fixed bytes; length read at runtime
//!                             from a sibling count field
//! ```
//!
//! Derived layouts start after the base's padded size and inherit all of
//! its fields. A field may pin an explicit offset, which must be aligned
//! and may not move backwards into fields already placed.

use crate::error::LayoutError;

use rustc_hash::FxHashMap;
use std::fmt;

// =============================================================================
// Field Types
// =============================================================================

/// Primitive storage types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Prim {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    Isize,
    Usize,
    F64,
    /// Opaque data pointer.
    Ptr,
    /// Pointer to another object.
    ObjPtr,
    /// Function pointer.
    FnPtr,
}

impl Prim {
    /// Size in bytes.
    #[inline]
    pub const fn size(self) -> usize {
        match self {
            Prim::I8 | Prim::U8 => 1,
            Prim::I16 | Prim::U16 => 2,
            Prim::I32 | Prim::U32 => 4,
            Prim::I64 | Prim::U64 | Prim::F64 => 8,
            Prim::Isize | Prim::Usize | Prim::Ptr | Prim::ObjPtr | Prim::FnPtr => size_of::<usize>(),
        }
    }

    /// Natural alignment.
    #[inline]
    pub const fn align(self) -> usize {
        self.size()
    }

    /// Whether values are signed integers.
    #[inline]
    pub const fn is_signed(self) -> bool {
        matches!(self, Prim::I8 | Prim::I16 | Prim::I32 | Prim::I64 | Prim::Isize)
    }

    /// Whether the type is an integer (and may back bit-fields).
    #[inline]
    pub const fn is_integer(self) -> bool {
        !matches!(self, Prim::F64 | Prim::Ptr | Prim::ObjPtr | Prim::FnPtr)
    }

    /// Whether the type is any kind of pointer.
    #[inline]
    pub const fn is_pointer(self) -> bool {
        matches!(self, Prim::Ptr | Prim::ObjPtr | Prim::FnPtr)
    }

    /// Width in bits.
    #[inline]
    pub const fn bits(self) -> u32 {
        (self.size() * 8) as u32
    }
}

/// Semantic type of a declared field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    /// A single primitive.
    Prim(Prim),
    /// A fixed number of primitives.
    Array(Prim, usize),
    /// `width` bits of a `backing` integer.
    Bits { backing: Prim, width: u32 },
    /// Trailing elements whose count is read from `len_from`; `abs` takes
    /// the absolute value for sign-in-size encodings.
    OpenArray {
        elem: Prim,
        len_from: Box<str>,
        abs: bool,
    },
}

impl FieldType {
    /// Open array of `elem` sized by the field `len_from`.
    pub fn open(elem: Prim, len_from: &str) -> Self {
        FieldType::OpenArray {
            elem,
            len_from: len_from.into(),
            abs: false,
        }
    }

    /// Bytes the field contributes to the fixed part of the record.
    #[inline]
    pub fn fixed_size(&self) -> usize {
        match self {
            FieldType::Prim(p) => p.size(),
            FieldType::Array(p, n) => p.size() * n,
            FieldType::Bits { backing, .. } => backing.size(),
            FieldType::OpenArray { .. } => 0,
        }
    }

    /// Alignment requirement.
    #[inline]
    pub fn align(&self) -> usize {
        match self {
            FieldType::Prim(p) | FieldType::Array(p, _) => p.align(),
            FieldType::Bits { backing, .. } => backing.align(),
            FieldType::OpenArray { elem, .. } => elem.align(),
        }
    }

    /// Element type of arrays, the type itself otherwise.
    #[inline]
    pub fn elem(&self) -> Prim {
        match self {
            FieldType::Prim(p) | FieldType::Array(p, _) => *p,
            FieldType::Bits { backing, .. } => *backing,
            FieldType::OpenArray { elem, .. } => *elem,
        }
    }

    /// Whether this is the trailing open array.
    #[inline]
    pub fn is_open(&self) -> bool {
        matches!(self, FieldType::OpenArray { .. })
    }
}

impl From<Prim> for FieldType {
    fn from(p: Prim) -> Self {
        FieldType::Prim(p)
    }
}

/// Who may write a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum Access {
    /// Writable without a capability.
    #[default]
    Safe,
    /// Writable only inside a capability scope.
    Unsafe,
    /// Never writable through a record.
    ReadOnly,
}

// =============================================================================
// Declarations
// =============================================================================

/// A field as declared, before placement.
#[derive(Debug, Clone)]
pub struct FieldDecl {
    name: Box<str>,
    ty: FieldType,
    offset: Option<usize>,
    access: Access,
}

impl FieldDecl {
    /// A safe field placed at the next aligned offset.
    pub fn new(name: impl Into<Box<str>>, ty: impl Into<FieldType>) -> Self {
        Self {
            name: name.into(),
            ty: ty.into(),
            offset: None,
            access: Access::Safe,
        }
    }

    /// Pin the field at an explicit byte offset.
    pub fn at(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Set the access class.
    pub fn access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }

    /// Shorthand for [`Access::Unsafe`].
    pub fn guarded(self) -> Self {
        self.access(Access::Unsafe)
    }

    /// Shorthand for [`Access::ReadOnly`].
    pub fn read_only(self) -> Self {
        self.access(Access::ReadOnly)
    }
}

/// A placed field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// Field name.
    pub name: Box<str>,
    /// Semantic type.
    pub ty: FieldType,
    /// Byte offset from the start of the record.
    pub offset: usize,
    /// First bit within the backing word, for bit-fields.
    pub bit_offset: Option<u32>,
    /// Who may write it.
    pub access: Access,
}

impl FieldDescriptor {
    /// Bytes occupied in the fixed part of the record.
    #[inline]
    pub fn size(&self) -> usize {
        self.ty.fixed_size()
    }

    /// First byte past the field's fixed part.
    #[inline]
    pub fn end(&self) -> usize {
        self.offset + self.size()
    }
}

// =============================================================================
// Layout
// =============================================================================

/// A finalized record layout.
#[derive(Clone, PartialEq, Eq)]
pub struct RecordLayout {
    name: Box<str>,
    fields: Vec<FieldDescriptor>,
    index: FxHashMap<Box<str>, usize>,
    size: usize,
    align: usize,
    extra_bytes: usize,
    open: Option<usize>,
}

impl RecordLayout {
    /// Layout name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fields in declaration order, base fields first.
    #[inline]
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// Field by name.
    #[inline]
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.index.get(name).map(|&i| &self.fields[i])
    }

    /// Padded size of the fixed part.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Record alignment.
    #[inline]
    pub fn align(&self) -> usize {
        self.align
    }

    /// Bytes that always follow the trailing items (e.g. a terminator).
    #[inline]
    pub fn extra_bytes(&self) -> usize {
        self.extra_bytes
    }

    /// The trailing open array, if any.
    #[inline]
    pub fn open_array(&self) -> Option<&FieldDescriptor> {
        self.open.map(|i| &self.fields[i])
    }

    /// Whether records of this layout have a runtime length.
    #[inline]
    pub fn is_var(&self) -> bool {
        self.open.is_some()
    }

    /// Total footprint for a record with `len` trailing items.
    #[inline]
    pub fn size_with(&self, len: usize) -> usize {
        let elem = self.open_array().map_or(0, |f| f.ty.elem().size());
        self.size + elem * len + self.extra_bytes
    }
}

impl fmt::Debug for RecordLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("RecordLayout");
        s.field("name", &self.name).field("size", &self.size);
        for field in &self.fields {
            s.field(&field.name, &field.offset);
        }
        s.finish()
    }
}

#[inline]
const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

// =============================================================================
// Builder
// =============================================================================

struct BitCursor {
    backing: Prim,
    offset: usize,
    used: u32,
}

/// Computes a [`RecordLayout`] from declarations.
///
/// # Example
///
/// ```
/// use marrow_inspect::layout::{LayoutBuilder, Prim};
///
/// let layout = LayoutBuilder::new("pair")
///     .field("tag", Prim::U8)
///     .field("value", Prim::I64)
///     .finish()
///     .unwrap();
/// assert_eq!(layout.field("value").unwrap().offset, 8);
/// assert_eq!(layout.size(), 16);
/// ```
pub struct LayoutBuilder {
    name: Box<str>,
    base: Option<RecordLayout>,
    decls: Vec<FieldDecl>,
    align: usize,
    extra_bytes: usize,
}

impl LayoutBuilder {
    /// A layout with no base.
    pub fn new(name: impl Into<Box<str>>) -> Self {
        Self {
            name: name.into(),
            base: None,
            decls: Vec::new(),
            align: 1,
            extra_bytes: 0,
        }
    }

    /// A layout extending `base`.
    pub fn derive(name: impl Into<Box<str>>, base: &RecordLayout) -> Self {
        Self {
            base: Some(base.clone()),
            ..Self::new(name)
        }
    }

    /// Declare a safe field.
    pub fn field(self, name: impl Into<Box<str>>, ty: impl Into<FieldType>) -> Self {
        self.push(FieldDecl::new(name, ty))
    }

    /// Declare a field.
    pub fn push(mut self, decl: FieldDecl) -> Self {
        self.decls.push(decl);
        self
    }

    /// Minimum record alignment.
    pub fn align(mut self, align: usize) -> Self {
        self.align = align;
        self
    }

    /// Bytes that always follow the trailing items.
    pub fn extra_bytes(mut self, n: usize) -> Self {
        self.extra_bytes = n;
        self
    }

    /// Place every field.
    pub fn finish(self) -> Result<RecordLayout, LayoutError> {
        let Self {
            name,
            base,
            decls,
            align,
            extra_bytes,
        } = self;
        if !align.is_power_of_two() {
            return Err(LayoutError::BadAlignment(align));
        }

        let (mut fields, mut cursor, mut max_align, mut open) = match base {
            Some(base) => {
                let size = base.size;
                (base.fields, size, base.align.max(align), base.open)
            }
            None => (Vec::new(), 0, align, None),
        };
        let mut index: FxHashMap<Box<str>, usize> = fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), i))
            .collect();
        let mut bits: Option<BitCursor> = None;

        for decl in decls {
            let err_field = || decl.name.to_string();
            if index.contains_key(&decl.name) {
                return Err(LayoutError::DuplicateField {
                    layout: name.to_string(),
                    field: err_field(),
                });
            }
            if open.is_some() {
                return Err(if decl.ty.is_open() {
                    LayoutError::DuplicateOpenArray {
                        layout: name.to_string(),
                        field: err_field(),
                    }
                } else {
                    LayoutError::OpenArrayNotLast {
                        layout: name.to_string(),
                        field: err_field(),
                    }
                });
            }

            let ty_align = decl.ty.align();
            max_align = max_align.max(ty_align);

            let (offset, bit_offset) = match &decl.ty {
                FieldType::Bits { backing, width } => {
                    if !backing.is_integer() || *width == 0 || *width > backing.bits() {
                        return Err(LayoutError::InvalidBitWidth {
                            field: err_field(),
                            bits: *width,
                        });
                    }
                    let packed = match bits.as_mut() {
                        Some(c) if decl.offset.is_none() && c.backing == *backing && c.used + width <= backing.bits() => {
                            let placed = (c.offset, Some(c.used));
                            c.used += width;
                            Some(placed)
                        }
                        _ => None,
                    };
                    match packed {
                        Some(placed) => placed,
                        None => {
                            let offset = place(&decl, cursor, ty_align)?;
                            bits = Some(BitCursor {
                                backing: *backing,
                                offset,
                                used: *width,
                            });
                            cursor = offset + backing.size();
                            (offset, Some(0))
                        }
                    }
                }
                ty => {
                    bits = None;
                    let offset = place(&decl, cursor, ty_align)?;
                    cursor = offset + ty.fixed_size();
                    (offset, None)
                }
            };

            if decl.ty.is_open() {
                open = Some(fields.len());
            }
            index.insert(decl.name.clone(), fields.len());
            fields.push(FieldDescriptor {
                name: decl.name,
                ty: decl.ty,
                offset,
                bit_offset,
                access: decl.access,
            });
        }

        if let Some(i) = open {
            if let FieldType::OpenArray { len_from, .. } = &fields[i].ty {
                if !index.contains_key(len_from) {
                    return Err(LayoutError::UnknownLengthSource {
                        field: fields[i].name.to_string(),
                        source_field: len_from.to_string(),
                    });
                }
            }
        }

        Ok(RecordLayout {
            name,
            fields,
            index,
            size: align_up(cursor, max_align),
            align: max_align,
            extra_bytes,
            open,
        })
    }
}

/// Offset for a non-packed field: its pin, or the next aligned offset.
fn place(decl: &FieldDecl, cursor: usize, align: usize) -> Result<usize, LayoutError> {
    match decl.offset {
        None => Ok(align_up(cursor, align)),
        Some(off) if off % align != 0 => Err(LayoutError::Misaligned {
            field: decl.name.to_string(),
            offset: off,
            align,
        }),
        Some(off) if off < cursor => Err(LayoutError::OffsetBackwards {
            field: decl.name.to_string(),
            offset: off,
            cursor,
        }),
        Some(off) => Ok(off),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> RecordLayout {
        LayoutBuilder::new("header")
            .field("refcnt", Prim::Isize)
            .field("ty", Prim::ObjPtr)
            .finish()
            .unwrap()
    }

    #[test]
    fn test_natural_alignment() {
        let layout = LayoutBuilder::new("mixed")
            .field("a", Prim::U8)
            .field("b", Prim::U32)
            .field("c", Prim::U16)
            .field("d", Prim::F64)
            .field("e", Prim::U8)
            .finish()
            .unwrap();
        let offsets: Vec<_> = layout.fields().iter().map(|f| f.offset).collect();
        assert_eq!(offsets, vec![0, 4, 8, 16, 24]);
        assert_eq!(layout.size(), 32);
        assert_eq!(layout.align(), 8);
    }

    #[test]
    fn test_offsets_monotonic_and_aligned() {
        let layout = LayoutBuilder::derive("derived", &header())
            .field("flag", Prim::U8)
            .field("words", FieldType::Array(Prim::U16, 3))
            .field("ratio", Prim::F64)
            .push(FieldDecl::new("state", FieldType::Bits { backing: Prim::U32, width: 3 }))
            .field("items", FieldType::open(Prim::U32, "flag"))
            .finish()
            .unwrap();
        let mut last = 0;
        for f in layout.fields() {
            assert!(f.offset >= last, "{} moved backwards", f.name);
            assert_eq!(f.offset % f.ty.align(), 0, "{} misaligned", f.name);
            last = f.offset;
        }
    }

    #[test]
    fn test_derive_appends_after_base() {
        let base = LayoutBuilder::new("base").field("x", Prim::U8).finish().unwrap();
        assert_eq!(base.size(), 1);
        let derived = LayoutBuilder::derive("derived", &base)
            .field("y", Prim::U8)
            .field("z", Prim::U64)
            .finish()
            .unwrap();
        assert_eq!(derived.field("x").unwrap().offset, 0);
        assert_eq!(derived.field("y").unwrap().offset, 1);
        assert_eq!(derived.field("z").unwrap().offset, 8);
        assert_eq!(derived.fields().len(), 3);
    }

    #[test]
    fn test_bitfields_pack() {
        let bits = |w| FieldType::Bits {
            backing: Prim::U32,
            width: w,
        };
        let layout = LayoutBuilder::new("state")
            .field("interned", bits(2))
            .field("kind", bits(3))
            .field("compact", bits(1))
            .field("big", bits(30))
            .field("after", Prim::U8)
            .finish()
            .unwrap();
        let f = |n| layout.field(n).unwrap();
        assert_eq!((f("interned").offset, f("interned").bit_offset), (0, Some(0)));
        assert_eq!((f("kind").offset, f("kind").bit_offset), (0, Some(2)));
        assert_eq!((f("compact").offset, f("compact").bit_offset), (0, Some(5)));
        assert_eq!((f("big").offset, f("big").bit_offset), (4, Some(0)));
        assert_eq!(f("after").offset, 8);
    }

    #[test]
    fn test_bitfield_backing_change_starts_new_word() {
        let layout = LayoutBuilder::new("mixed_bits")
            .field("a", FieldType::Bits { backing: Prim::U8, width: 4 })
            .field("b", FieldType::Bits { backing: Prim::U16, width: 4 })
            .finish()
            .unwrap();
        assert_eq!(layout.field("a").unwrap().offset, 0);
        assert_eq!(layout.field("b").unwrap().offset, 2);
    }

    #[test]
    fn test_explicit_offset() {
        let layout = LayoutBuilder::derive("str", &header())
            .field("length", Prim::Isize)
            .push(FieldDecl::new("data", FieldType::open(Prim::U8, "length")).at(40))
            .extra_bytes(1)
            .finish()
            .unwrap();
        assert_eq!(layout.field("data").unwrap().offset, 40);
        assert_eq!(layout.size(), 40);
        assert_eq!(layout.size_with(3), 40 + 3 + 1);
    }

    #[test]
    fn test_open_array_contributes_nothing() {
        let layout = LayoutBuilder::derive("tuple", &header())
            .field("size", Prim::Isize)
            .field("items", FieldType::open(Prim::ObjPtr, "size"))
            .finish()
            .unwrap();
        assert_eq!(layout.size(), 24);
        assert!(layout.is_var());
        assert_eq!(layout.size_with(2), 40);
    }

    #[test]
    fn test_errors() {
        let err = LayoutBuilder::derive("dup", &header())
            .field("refcnt", Prim::U8)
            .finish()
            .unwrap_err();
        assert!(matches!(err, LayoutError::DuplicateField { .. }));

        let err = LayoutBuilder::new("two_open")
            .field("n", Prim::Usize)
            .field("a", FieldType::open(Prim::U8, "n"))
            .field("b", FieldType::open(Prim::U8, "n"))
            .finish()
            .unwrap_err();
        assert!(matches!(err, LayoutError::DuplicateOpenArray { .. }));

        let err = LayoutBuilder::new("not_last")
            .field("n", Prim::Usize)
            .field("a", FieldType::open(Prim::U8, "n"))
            .field("b", Prim::U8)
            .finish()
            .unwrap_err();
        assert!(matches!(err, LayoutError::OpenArrayNotLast { .. }));

        let err = LayoutBuilder::new("bad_len")
            .field("a", FieldType::open(Prim::U8, "missing"))
            .finish()
            .unwrap_err();
        assert!(matches!(err, LayoutError::UnknownLengthSource { .. }));

        let err = LayoutBuilder::new("bad_align").align(12).finish().unwrap_err();
        assert_eq!(err, LayoutError::BadAlignment(12));

        let err = LayoutBuilder::new("misaligned")
            .push(FieldDecl::new("x", Prim::U64).at(4))
            .finish()
            .unwrap_err();
        assert!(matches!(err, LayoutError::Misaligned { offset: 4, align: 8, .. }));

        let err = LayoutBuilder::new("backwards")
            .field("a", Prim::U64)
            .push(FieldDecl::new("b", Prim::U32).at(4))
            .finish()
            .unwrap_err();
        assert!(matches!(err, LayoutError::OffsetBackwards { .. }));

        let err = LayoutBuilder::new("wide")
            .field("a", FieldType::Bits { backing: Prim::U8, width: 9 })
            .finish()
            .unwrap_err();
        assert!(matches!(err, LayoutError::InvalidBitWidth { bits: 9, .. }));
    }

    #[test]
    fn test_requested_alignment_pads_size() {
        let layout = LayoutBuilder::new("padded")
            .field("a", Prim::U8)
            .align(16)
            .finish()
            .unwrap();
        assert_eq!(layout.size(), 16);
    }
}
