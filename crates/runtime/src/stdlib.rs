//! Standard host functions.
//!
//! The language core ships no standard library; these are the host
//! functions the CLI (and the test suite) registers through
//! [`Koji::static_function`]: `print`, `len`, and the metatable pair that
//! backs method-call fallback.

use koji_core::error::VmError;
use koji_core::object::{object_retain, object_unref};
use koji_core::string::value_as_str;
use koji_core::table::value_as_table;
use koji_core::value::Value;

use crate::api::{Koji, KojiError};
use crate::vm::HostCall;

/// Registers the standard functions on `koji`.
pub fn install(koji: &mut Koji) -> Result<(), KojiError> {
    koji.static_function("print", std_print, 0, i32::MAX)?;
    koji.static_function("len", std_len, 1, 1)?;
    koji.static_function("set_metatable", std_set_metatable, 2, 2)?;
    koji.static_function("get_metatable", std_get_metatable, 1, 1)?;
    Ok(())
}

/// `print(...)`: writes the arguments, space-separated, newline-terminated.
fn std_print(call: &mut HostCall) -> Result<(), VmError> {
    for i in 0..call.nargs() {
        if i > 0 {
            let _ = call.write_str(" ");
        }
        let arg = call.arg(i);
        let _ = call.write_value(arg);
    }
    let _ = call.write_str("\n");
    Ok(())
}

/// `len(x)`: string length in bytes, or table entry count.
fn std_len(call: &mut HostCall) -> Result<(), VmError> {
    let arg = call.arg(0);
    if let Some(s) = value_as_str(arg, call.cls_string) {
        call.set_ret(Value::number(unsafe { (*s).len } as f64));
        return Ok(());
    }
    if let Some(t) = value_as_table(arg, call.cls_table) {
        call.set_ret(Value::number(unsafe { (*t).table.size } as f64));
        return Ok(());
    }
    Err(VmError::new(
        "len argument must be of type string or table.",
    ))
}

/// `set_metatable(t, mt)`: installs `mt` as the metatable of `t`.
fn std_set_metatable(call: &mut HostCall) -> Result<(), VmError> {
    let table = value_as_table(call.arg(0), call.cls_table)
        .ok_or_else(|| VmError::new("set_metatable() argument 1 must be of type table."))?;
    let metatable = value_as_table(call.arg(1), call.cls_table)
        .ok_or_else(|| VmError::new("set_metatable() argument 2 must be of type table."))?;
    unsafe {
        object_retain(metatable.cast());
        let old = (*table).metatable;
        (*table).metatable = metatable;
        if !old.is_null() {
            object_unref(call.heap, old.cast());
        }
    }
    Ok(())
}

/// `get_metatable(t)`: the metatable of `t`, or nil.
fn std_get_metatable(call: &mut HostCall) -> Result<(), VmError> {
    let table = value_as_table(call.arg(0), call.cls_table)
        .ok_or_else(|| VmError::new("get_metatable() argument 1 must be of type table."))?;
    let metatable = unsafe { (*table).metatable };
    if metatable.is_null() {
        return Ok(());
    }
    unsafe {
        object_retain(metatable.cast());
        call.set_ret(Value::object(metatable.cast()));
    }
    Ok(())
}
