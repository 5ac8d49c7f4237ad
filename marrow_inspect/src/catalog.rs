//! Record layouts of the runtime's object kinds.
//!
//! Built-in kinds have one static layout each, built on first use.
//! Instances of user classes get a layout per class, derived from the
//! class's member slots and dictionary offset and cached for the life of
//! the class.
//!
//! | kind     | family   | layout                                        |
//! |----------|----------|-----------------------------------------------|
//! | object   | fixed    | `ob_refcnt`, `ob_type`                        |
//! | int      | var      | + `ob_size`, `ob_digit[abs(ob_size)]`         |
//! | float    | fixed    | + `ob_fval`                                   |
//! | str      | var      | + `length`, `hash`, state bits, `data[length]`|
//! | tuple    | var      | + `ob_size`, `ob_item[ob_size]`               |
//! | list     | var      | + `ob_size`, `ob_item`, `allocated`           |
//! | dict     | fixed    | + `ma_used`, `ma_version`, `ma_table`         |
//! | function | fixed    | + `func_name`, `func_kind`, ... `func_addr`   |
//! | type     | type     | + every `tp_*` field                          |
//! | instance | fixed    | + member slots, inline `__dict__`             |

use crate::error::Result;
use crate::layout::{FieldDecl, FieldType, LayoutBuilder, Prim, RecordLayout};

use marrow_gc::heap;
use marrow_runtime::global_registry;
use marrow_runtime::types::string::DATA_OFFSET;
use marrow_runtime::{TypeFlags, TypeObject};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

// =============================================================================
// Record Kinds
// =============================================================================

/// Which layout an object is read through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Object,
    Int,
    Float,
    Str,
    Tuple,
    List,
    Dict,
    Function,
    Type,
    Instance,
}

/// Coarse grouping of record kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordFamily {
    /// Fixed-size records.
    Fixed,
    /// Records with a runtime length in `ob_size`.
    Var,
    /// Type objects.
    TypeMeta,
}

impl RecordKind {
    /// Kind of the instances of `tp`.
    pub fn of_type(tp: &TypeObject) -> Self {
        let flags = tp.flags();
        if flags.contains(TypeFlags::TYPE_SUBCLASS) {
            RecordKind::Type
        } else if flags.contains(TypeFlags::INT_SUBCLASS) {
            RecordKind::Int
        } else if flags.contains(TypeFlags::FLOAT_SUBCLASS) {
            RecordKind::Float
        } else if flags.contains(TypeFlags::STR_SUBCLASS) {
            RecordKind::Str
        } else if flags.contains(TypeFlags::TUPLE_SUBCLASS) {
            RecordKind::Tuple
        } else if flags.contains(TypeFlags::LIST_SUBCLASS) {
            RecordKind::List
        } else if flags.contains(TypeFlags::DICT_SUBCLASS) {
            RecordKind::Dict
        } else if flags.contains(TypeFlags::FUNCTION_SUBCLASS) {
            RecordKind::Function
        } else if flags.contains(TypeFlags::HEAPTYPE) {
            RecordKind::Instance
        } else {
            RecordKind::Object
        }
    }

    /// Family of this kind.
    #[inline]
    pub fn family(self) -> RecordFamily {
        match self {
            RecordKind::Int | RecordKind::Str | RecordKind::Tuple | RecordKind::List => RecordFamily::Var,
            RecordKind::Type => RecordFamily::TypeMeta,
            _ => RecordFamily::Fixed,
        }
    }

    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::Object => "object",
            RecordKind::Int => "int",
            RecordKind::Float => "float",
            RecordKind::Str => "str",
            RecordKind::Tuple => "tuple",
            RecordKind::List => "list",
            RecordKind::Dict => "dict",
            RecordKind::Function => "function",
            RecordKind::Type => "type",
            RecordKind::Instance => "instance",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Static Layouts
// =============================================================================

struct Catalog {
    object: Arc<RecordLayout>,
    int: Arc<RecordLayout>,
    float: Arc<RecordLayout>,
    str_: Arc<RecordLayout>,
    tuple: Arc<RecordLayout>,
    list: Arc<RecordLayout>,
    dict: Arc<RecordLayout>,
    function: Arc<RecordLayout>,
    type_: Arc<RecordLayout>,
}

static CATALOG: OnceLock<Catalog> = OnceLock::new();

fn catalog() -> &'static Catalog {
    // The declarations below are fixed; a failure here is a programming error.
    CATALOG.get_or_init(|| Catalog::build().expect("built-in record layouts are well formed"))
}

fn bits(width: u32) -> FieldType {
    FieldType::Bits {
        backing: Prim::U32,
        width,
    }
}

fn fn_ptr(name: &str) -> FieldDecl {
    FieldDecl::new(name, Prim::FnPtr).guarded()
}

impl Catalog {
    fn build() -> std::result::Result<Self, crate::error::LayoutError> {
        let object = LayoutBuilder::new("object")
            .push(FieldDecl::new("ob_refcnt", Prim::Isize).guarded())
            .push(FieldDecl::new("ob_type", Prim::ObjPtr).guarded())
            .finish()?;
        let var = LayoutBuilder::derive("var_object", &object)
            .push(FieldDecl::new("ob_size", Prim::Isize).guarded())
            .finish()?;

        let int = LayoutBuilder::derive("int", &var)
            .field(
                "ob_digit",
                FieldType::OpenArray {
                    elem: Prim::U32,
                    len_from: "ob_size".into(),
                    abs: true,
                },
            )
            .finish()?;

        let float = LayoutBuilder::derive("float", &object)
            .field("ob_fval", Prim::F64)
            .finish()?;

        let str_ = LayoutBuilder::derive("str", &object)
            .push(FieldDecl::new("length", Prim::Isize).guarded())
            .field("hash", Prim::I64)
            .push(FieldDecl::new("interned", bits(2)).guarded())
            .push(FieldDecl::new("kind", bits(3)).guarded())
            .push(FieldDecl::new("compact", bits(1)).guarded())
            .push(FieldDecl::new("ascii", bits(1)).guarded())
            .push(FieldDecl::new("ready", bits(1)).read_only())
            .push(FieldDecl::new("data", FieldType::open(Prim::U8, "length")).at(DATA_OFFSET))
            .extra_bytes(1)
            .finish()?;

        let tuple = LayoutBuilder::derive("tuple", &var)
            .push(FieldDecl::new("ob_item", FieldType::open(Prim::ObjPtr, "ob_size")).guarded())
            .finish()?;

        let list = LayoutBuilder::derive("list", &var)
            .push(FieldDecl::new("ob_item", Prim::Ptr).guarded())
            .push(FieldDecl::new("allocated", Prim::Isize).guarded())
            .finish()?;

        let dict = LayoutBuilder::derive("dict", &object)
            .push(FieldDecl::new("ma_used", Prim::Isize).read_only())
            .push(FieldDecl::new("ma_version", Prim::U64).read_only())
            .push(FieldDecl::new("ma_table", Prim::Ptr).guarded())
            .finish()?;

        let function = LayoutBuilder::derive("function", &object)
            .push(FieldDecl::new("func_name", Prim::ObjPtr).guarded())
            .push(FieldDecl::new("func_kind", Prim::U32).read_only())
            .push(FieldDecl::new("func_slot", Prim::U32).read_only())
            .push(fn_ptr("func_addr"))
            .finish()?;

        let type_ = LayoutBuilder::derive("type", &var)
            .push(FieldDecl::new("tp_name", Prim::Ptr).guarded())
            .push(FieldDecl::new("tp_basicsize", Prim::Isize).guarded())
            .push(FieldDecl::new("tp_itemsize", Prim::Isize).guarded())
            .push(FieldDecl::new("tp_flags", Prim::U64).guarded())
            .push(FieldDecl::new("tp_version_tag", Prim::U64).read_only())
            .push(fn_ptr("tp_dealloc"))
            .push(fn_ptr("tp_traverse"))
            .push(fn_ptr("tp_clear"))
            .push(fn_ptr("tp_adopt"))
            .push(fn_ptr("tp_repr"))
            .push(fn_ptr("tp_hash"))
            .push(fn_ptr("tp_call"))
            .push(FieldDecl::new("tp_as_number", Prim::Ptr).guarded())
            .push(FieldDecl::new("tp_as_sequence", Prim::Ptr).guarded())
            .push(FieldDecl::new("tp_as_mapping", Prim::Ptr).guarded())
            .push(FieldDecl::new("tp_as_async", Prim::Ptr).guarded())
            .push(FieldDecl::new("tp_base", Prim::ObjPtr).guarded())
            .push(FieldDecl::new("tp_dict", Prim::ObjPtr).guarded())
            .push(FieldDecl::new("tp_dictoffset", Prim::Isize).guarded())
            .push(fn_ptr("tp_alloc"))
            .push(fn_ptr("tp_free"))
            .finish()?;

        Ok(Self {
            object: Arc::new(object),
            int: Arc::new(int),
            float: Arc::new(float),
            str_: Arc::new(str_),
            tuple: Arc::new(tuple),
            list: Arc::new(list),
            dict: Arc::new(dict),
            function: Arc::new(function),
            type_: Arc::new(type_),
        })
    }
}

/// The static layout of a built-in kind; `None` for [`RecordKind::Instance`],
/// whose layout depends on the class.
pub fn static_layout(kind: RecordKind) -> Option<Arc<RecordLayout>> {
    let c = catalog();
    let layout = match kind {
        RecordKind::Object => &c.object,
        RecordKind::Int => &c.int,
        RecordKind::Float => &c.float,
        RecordKind::Str => &c.str_,
        RecordKind::Tuple => &c.tuple,
        RecordKind::List => &c.list,
        RecordKind::Dict => &c.dict,
        RecordKind::Function => &c.function,
        RecordKind::Type => &c.type_,
        RecordKind::Instance => return None,
    };
    Some(Arc::clone(layout))
}

// =============================================================================
// Instance Layouts
// =============================================================================

static INSTANCE_LAYOUTS: OnceLock<Mutex<FxHashMap<(usize, u64), Arc<RecordLayout>>>> = OnceLock::new();

fn instance_layouts() -> &'static Mutex<FxHashMap<(usize, u64), Arc<RecordLayout>>> {
    INSTANCE_LAYOUTS.get_or_init(|| Mutex::new(FxHashMap::default()))
}

/// Drop layouts whose class block was freed or reused.
///
/// Classes outside the heap are keyed with serial 0 and stay.
fn prune_instance_layouts(map: &mut FxHashMap<(usize, u64), Arc<RecordLayout>>) {
    let before = map.len();
    map.retain(|&(addr, serial), _| match heap().serial(addr) {
        Some(current) => current == serial,
        None => serial == 0,
    });
    if map.len() < before {
        tracing::debug!(pruned = before - map.len(), "pruned instance layouts");
    }
}

fn build_instance_layout(tp: *mut TypeObject) -> Result<RecordLayout> {
    // Safety: caller passes a live type.
    let t = unsafe { &*tp };
    let mut members = global_registry().members(tp);
    members.sort_by_key(|m| m.offset);

    let object = &catalog().object;
    let mut builder = LayoutBuilder::derive(t.name(), object);
    for member in members {
        builder = builder.push(FieldDecl::new(member.name, Prim::ObjPtr).at(member.offset).guarded());
    }
    if t.tp_dictoffset > 0 {
        builder = builder.push(
            FieldDecl::new("__dict__", Prim::ObjPtr)
                .at(t.tp_dictoffset as usize)
                .guarded(),
        );
    }
    Ok(builder.finish()?)
}

/// Kind and layout for instances of `tp`.
///
/// # Safety
///
/// `tp` must be a live type object.
pub unsafe fn resolve(tp: *mut TypeObject) -> Result<(RecordKind, Arc<RecordLayout>)> {
    // Safety: caller guarantees `tp` is live.
    let kind = RecordKind::of_type(unsafe { &*tp });
    if let Some(layout) = static_layout(kind) {
        return Ok((kind, layout));
    }

    let serial = heap().serial(tp as usize).unwrap_or(0);
    let key = (tp as usize, serial);
    if let Some(layout) = instance_layouts().lock().get(&key) {
        return Ok((kind, Arc::clone(layout)));
    }
    let layout = Arc::new(build_instance_layout(tp)?);
    tracing::debug!(
        class = layout.name(),
        size = layout.size(),
        fields = layout.fields().len(),
        "built instance layout"
    );
    let mut layouts = instance_layouts().lock();
    prune_instance_layouts(&mut layouts);
    layouts.insert(key, Arc::clone(&layout));
    Ok((kind, layout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use marrow_runtime::object::class::DictConvention;
    use marrow_runtime::types::dict::DictObject;
    use marrow_runtime::types::float::FloatObject;
    use marrow_runtime::types::function::FunctionObject;
    use marrow_runtime::types::list::ListObject;
    use marrow_runtime::types::string::StrObject;
    use marrow_runtime::{ClassSpec, builtins, new_class};
    use std::mem::offset_of;

    fn offset(kind: RecordKind, field: &str) -> usize {
        static_layout(kind).unwrap().field(field).unwrap().offset
    }

    #[test]
    fn test_builtin_sizes_match_runtime() {
        let b = builtins();
        let cases = [
            (b.object_type(), RecordKind::Object),
            (b.int_type(), RecordKind::Int),
            (b.float_type(), RecordKind::Float),
            (b.str_type(), RecordKind::Str),
            (b.tuple_type(), RecordKind::Tuple),
            (b.list_type(), RecordKind::List),
            (b.dict_type(), RecordKind::Dict),
            (b.function_type(), RecordKind::Function),
            (b.type_type(), RecordKind::Type),
        ];
        for (tp, kind) in cases {
            let t = unsafe { &*tp };
            assert_eq!(RecordKind::of_type(t), kind);
            let layout = static_layout(kind).unwrap();
            assert_eq!(layout.size(), t.tp_basicsize as usize, "{kind}");
        }
    }

    #[test]
    fn test_field_offsets_match_runtime() {
        assert_eq!(offset(RecordKind::Float, "ob_fval"), offset_of!(FloatObject, ob_fval));
        assert_eq!(offset(RecordKind::Str, "hash"), offset_of!(StrObject, hash));
        assert_eq!(offset(RecordKind::Str, "interned"), offset_of!(StrObject, state));
        assert_eq!(offset(RecordKind::Str, "data"), DATA_OFFSET);
        assert_eq!(offset(RecordKind::List, "allocated"), offset_of!(ListObject, allocated));
        assert_eq!(offset(RecordKind::Dict, "ma_table"), offset_of!(DictObject, ma_table));
        assert_eq!(offset(RecordKind::Function, "func_addr"), offset_of!(FunctionObject, func_addr));
        assert_eq!(offset(RecordKind::Type, "tp_version_tag"), offset_of!(TypeObject, tp_version_tag));
        assert_eq!(offset(RecordKind::Type, "tp_as_async"), offset_of!(TypeObject, tp_as_async));
        assert_eq!(offset(RecordKind::Type, "tp_free"), offset_of!(TypeObject, tp_free));
    }

    #[test]
    fn test_str_state_bits() {
        let layout = static_layout(RecordKind::Str).unwrap();
        let bit = |n: &str| layout.field(n).unwrap().bit_offset;
        assert_eq!(bit("interned"), Some(0));
        assert_eq!(bit("kind"), Some(2));
        assert_eq!(bit("compact"), Some(5));
        assert_eq!(bit("ascii"), Some(6));
        assert_eq!(bit("ready"), Some(7));
    }

    #[test]
    fn test_families() {
        assert_eq!(RecordKind::Tuple.family(), RecordFamily::Var);
        assert_eq!(RecordKind::Float.family(), RecordFamily::Fixed);
        assert_eq!(RecordKind::Type.family(), RecordFamily::TypeMeta);
        assert_eq!(RecordKind::Instance.family(), RecordFamily::Fixed);
    }

    #[test]
    fn test_instance_layout_follows_class() {
        let cls = new_class(&ClassSpec::new("CatalogPoint").slots(&["x", "y"])).unwrap();
        let tp = cls.as_type_ptr().unwrap();
        let (kind, layout) = unsafe { resolve(tp).unwrap() };
        assert_eq!(kind, RecordKind::Instance);
        assert_eq!(layout.name(), "CatalogPoint");
        assert_eq!(layout.field("x").unwrap().offset, 16);
        assert_eq!(layout.field("y").unwrap().offset, 24);
        assert_eq!(layout.field("__dict__").unwrap().offset, 32);
        assert_eq!(layout.size(), unsafe { (*tp).tp_basicsize } as usize);

        let (_, again) = unsafe { resolve(tp).unwrap() };
        assert!(Arc::ptr_eq(&layout, &again));
    }

    #[test]
    fn test_managed_instance_has_no_inline_dict() {
        let cls = new_class(&ClassSpec::new("CatalogManaged").dict(DictConvention::Managed)).unwrap();
        let (_, layout) = unsafe { resolve(cls.as_type_ptr().unwrap()).unwrap() };
        assert!(layout.field("__dict__").is_none());
        assert_eq!(layout.size(), 16);
    }

    #[test]
    fn test_prune_drops_stale_classes() {
        let cls = new_class(&ClassSpec::new("CatalogPruned")).unwrap();
        let (_, layout) = unsafe { resolve(cls.as_type_ptr().unwrap()).unwrap() };
        let serial = heap().serial(cls.addr()).unwrap();
        let object_type = builtins().object_type() as usize;
        let object_serial = heap().serial(object_type).unwrap_or(0);

        let mut map = FxHashMap::default();
        map.insert((cls.addr(), serial), Arc::clone(&layout));
        map.insert((cls.addr(), serial + 1), Arc::clone(&layout));
        map.insert((object_type, object_serial), Arc::clone(&layout));
        map.insert((0x10, 1), layout);

        prune_instance_layouts(&mut map);
        assert_eq!(map.len(), 2);
        assert!(map.contains_key(&(cls.addr(), serial)));
        assert!(map.contains_key(&(object_type, object_serial)));
    }
}
