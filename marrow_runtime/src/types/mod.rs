//! Built-in types.
//!
//! The built-in type objects are created once, on first use, and are
//! immortal. Bootstrap runs in three phases:
//!
//! 1. allocate every type body and fill in sizes, flags and slots
//! 2. register the types and give each an attribute dictionary
//! 3. expose every non-null slot in the type's dictionary as a slot
//!    wrapper under its dunder name
//!
//! Helpers used during bootstrap take the [`Builtins`] table explicitly;
//! everything else reaches it through [`builtins`].

pub mod dict;
pub mod float;
pub mod function;
pub mod int;
pub mod list;
pub mod none;
pub mod string;
pub mod tuple;

use crate::object::class::{type_call, type_clear, type_dealloc, type_repr, type_traverse};
use crate::object::lifecycle::generic_alloc;
use crate::object::registry::global_registry;
use crate::object::slots::SLOT_DEFS;
use crate::object::type_obj::{TypeFlags, TypeObject};
use crate::object::{IMMORTAL_REFCNT, Obj, ObjectHeader, VarHeader, make_immortal};

use marrow_gc::{BlockPrefix, heap, tracking};
use std::ffi::CStr;
use std::ptr::NonNull;
use std::sync::OnceLock;

/// Addresses of the built-in type objects and singletons.
#[derive(Debug)]
pub struct Builtins {
    object: usize,
    type_: usize,
    int: usize,
    float: usize,
    str_: usize,
    tuple: usize,
    list: usize,
    dict: usize,
    function: usize,
    none_type: usize,
    none: usize,
}

macro_rules! type_accessors {
    ($($method:ident => $field:ident),* $(,)?) => {
        impl Builtins {
            $(
                #[doc = concat!("The `", stringify!($field), "` type.")]
                #[inline]
                pub fn $method(&self) -> *mut TypeObject {
                    self.$field as *mut TypeObject
                }
            )*
        }
    };
}

type_accessors! {
    object_type => object,
    type_type => type_,
    int_type => int,
    float_type => float,
    str_type => str_,
    tuple_type => tuple,
    list_type => list,
    dict_type => dict,
    function_type => function,
    none_type => none_type,
}

impl Builtins {
    /// The `None` singleton.
    #[inline]
    pub fn none_ptr(&self) -> *mut ObjectHeader {
        self.none as *mut ObjectHeader
    }

    /// All built-in types.
    pub fn all_types(&self) -> [*mut TypeObject; 10] {
        [
            self.object_type(),
            self.type_type(),
            self.int_type(),
            self.float_type(),
            self.str_type(),
            self.tuple_type(),
            self.list_type(),
            self.dict_type(),
            self.function_type(),
            self.none_type(),
        ]
    }
}

static BUILTINS: OnceLock<Builtins> = OnceLock::new();

/// The built-in type table, bootstrapping it on first use.
pub fn builtins() -> &'static Builtins {
    BUILTINS.get_or_init(bootstrap)
}

/// The `None` singleton.
pub fn none() -> Obj {
    // Safety: `None` is immortal.
    unsafe { Obj::from_borrowed(NonNull::new_unchecked(builtins().none_ptr())) }
}

// =============================================================================
// Bootstrap
// =============================================================================

struct KindSpec {
    name: &'static CStr,
    basicsize: usize,
    itemsize: usize,
    flags: TypeFlags,
    init: fn(&mut TypeObject),
}

fn alloc_static(size: usize, prefix: BlockPrefix) -> usize {
    // Bootstrap allocations are a startup invariant.
    heap()
        .allocate(size, prefix)
        .expect("bootstrap allocation")
        .as_ptr() as usize
}

fn fill_type(tp: *mut TypeObject, b: &Builtins, base: *mut TypeObject, spec: &KindSpec) {
    // Safety: `tp` is a zeroed, exclusively owned type body.
    let t = unsafe { &mut *tp };
    t.ob_base = VarHeader {
        ob_base: ObjectHeader {
            ob_refcnt: IMMORTAL_REFCNT,
            ob_type: b.type_type(),
        },
        ob_size: 0,
    };
    t.tp_name = spec.name.as_ptr();
    t.tp_basicsize = spec.basicsize as isize;
    t.tp_itemsize = spec.itemsize as isize;
    t.tp_flags = (spec.flags | TypeFlags::READY | TypeFlags::IMMUTABLE).bits();
    t.tp_version_tag = global_registry().next_version_tag();
    t.tp_base = base;
    t.tp_alloc = Some(generic_alloc);
    (spec.init)(t);
}

fn init_object(t: &mut TypeObject) {
    t.tp_repr = Some(none::object_repr);
    t.tp_hash = Some(none::object_hash);
}

fn init_type_type(t: &mut TypeObject) {
    t.tp_dealloc = Some(type_dealloc);
    t.tp_traverse = Some(type_traverse);
    t.tp_clear = Some(type_clear);
    t.tp_repr = Some(type_repr);
    t.tp_hash = Some(none::object_hash);
    t.tp_call = Some(type_call);
}

fn bootstrap() -> Builtins {
    let type_size = size_of::<TypeObject>();
    let b = Builtins {
        object: alloc_static(type_size, BlockPrefix::GC),
        type_: alloc_static(type_size, BlockPrefix::GC),
        int: alloc_static(type_size, BlockPrefix::GC),
        float: alloc_static(type_size, BlockPrefix::GC),
        str_: alloc_static(type_size, BlockPrefix::GC),
        tuple: alloc_static(type_size, BlockPrefix::GC),
        list: alloc_static(type_size, BlockPrefix::GC),
        dict: alloc_static(type_size, BlockPrefix::GC),
        function: alloc_static(type_size, BlockPrefix::GC),
        none_type: alloc_static(type_size, BlockPrefix::GC),
        none: alloc_static(size_of::<ObjectHeader>(), BlockPrefix::NONE),
    };

    let kinds: [(*mut TypeObject, KindSpec); 10] = [
        (b.object_type(), KindSpec {
            name: c"object",
            basicsize: size_of::<ObjectHeader>(),
            itemsize: 0,
            flags: TypeFlags::BASETYPE,
            init: init_object,
        }),
        (b.type_type(), KindSpec {
            name: c"type",
            basicsize: size_of::<TypeObject>(),
            itemsize: 0,
            flags: TypeFlags::TYPE_SUBCLASS | TypeFlags::HAVE_GC | TypeFlags::WEAKREFABLE,
            init: init_type_type,
        }),
        (b.int_type(), KindSpec {
            name: c"int",
            basicsize: size_of::<int::IntObject>(),
            itemsize: size_of::<u32>(),
            flags: TypeFlags::INT_SUBCLASS,
            init: int::init_type,
        }),
        (b.float_type(), KindSpec {
            name: c"float",
            basicsize: size_of::<float::FloatObject>(),
            itemsize: 0,
            flags: TypeFlags::FLOAT_SUBCLASS,
            init: float::init_type,
        }),
        (b.str_type(), KindSpec {
            name: c"str",
            basicsize: size_of::<string::StrObject>(),
            itemsize: 1,
            flags: TypeFlags::STR_SUBCLASS,
            init: string::init_type,
        }),
        (b.tuple_type(), KindSpec {
            name: c"tuple",
            basicsize: size_of::<tuple::TupleObject>(),
            itemsize: size_of::<usize>(),
            flags: TypeFlags::TUPLE_SUBCLASS | TypeFlags::HAVE_GC,
            init: tuple::init_type,
        }),
        (b.list_type(), KindSpec {
            name: c"list",
            basicsize: size_of::<list::ListObject>(),
            itemsize: 0,
            flags: TypeFlags::LIST_SUBCLASS | TypeFlags::HAVE_GC,
            init: list::init_type,
        }),
        (b.dict_type(), KindSpec {
            name: c"dict",
            basicsize: size_of::<dict::DictObject>(),
            itemsize: 0,
            flags: TypeFlags::DICT_SUBCLASS | TypeFlags::HAVE_GC,
            init: dict::init_type,
        }),
        (b.function_type(), KindSpec {
            name: c"function",
            basicsize: size_of::<function::FunctionObject>(),
            itemsize: 0,
            flags: TypeFlags::FUNCTION_SUBCLASS | TypeFlags::HAVE_GC | TypeFlags::WEAKREFABLE,
            init: function::init_type,
        }),
        (b.none_type(), KindSpec {
            name: c"NoneType",
            basicsize: size_of::<ObjectHeader>(),
            itemsize: 0,
            flags: TypeFlags::empty(),
            init: none::init_type,
        }),
    ];

    for (tp, spec) in &kinds {
        let base = if *tp == b.object_type() {
            std::ptr::null_mut()
        } else {
            b.object_type()
        };
        fill_type(*tp, &b, base, spec);
    }

    // Safety: every type body is now complete.
    unsafe {
        for tp in b.all_types() {
            global_registry().register(tp, Vec::new());
            tracking::track(tp as usize);
        }

        let none = b.none_ptr();
        (*none).ob_refcnt = IMMORTAL_REFCNT;
        (*none).ob_type = b.none_type();

        for tp in b.all_types() {
            let d = dict::new_in(&b).expect("bootstrap allocation");
            make_immortal(d.as_ptr());
            (*tp).tp_dict = d.into_raw();
        }

        for tp in b.all_types() {
            let d = Obj::from_borrowed(NonNull::new_unchecked((*tp).tp_dict));
            for def in SLOT_DEFS {
                let addr = def.read(tp);
                if addr == 0 || dict::get_item(&d, def.name).is_some() {
                    continue;
                }
                let wrapper = function::slot_wrapper_in(&b, def, addr).expect("bootstrap allocation");
                dict::set_item(&d, def.name, &wrapper).expect("bootstrap dict insert");
            }
        }
    }

    tracing::debug!(types = b.all_types().len(), "bootstrapped builtin types");
    b
}
