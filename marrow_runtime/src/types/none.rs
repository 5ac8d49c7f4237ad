//! `None` and the behaviour every object inherits from `object`.

use crate::error::RtResult;
use crate::object::Obj;
use crate::object::protocols::NumberMethods;
use crate::object::type_obj::TypeObject;
use crate::types::string;

/// `object.__repr__`
pub(crate) fn object_repr(obj: &Obj) -> RtResult<Obj> {
    string::new(&format!("<{} object at {:#x}>", obj.type_name(), obj.addr()))
}

/// `object.__hash__`: identity based.
pub(crate) fn object_hash(obj: &Obj) -> RtResult<i64> {
    Ok((obj.addr() >> 4) as i64)
}

fn none_repr(_: &Obj) -> RtResult<Obj> {
    string::new("None")
}

fn none_bool(_: &Obj) -> RtResult<bool> {
    Ok(false)
}

/// Install `NoneType`'s hooks and slots.
pub(crate) fn init_type(t: &mut TypeObject) {
    t.tp_repr = Some(none_repr);
    t.tp_hash = Some(object_hash);
    t.tp_as_number = Box::into_raw(Box::new(NumberMethods {
        nb_bool: Some(none_bool),
        ..NumberMethods::default()
    }));
}
