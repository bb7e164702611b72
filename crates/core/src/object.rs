//! Object headers and reference-count discipline.
//!
//! Every heap object begins with an [`Object`] header: a reference count and
//! a pointer to the object's class. The header is followed contiguously by
//! type-specific data (see `string`, `table`, `closure`, `class`).
//!
//! Lifetime is reference counting only, no tracing collector. The rules:
//!
//! - writing a value into a slot retains the new value *before* releasing
//!   the old one (so `a = a` is safe);
//! - when a count reaches zero the class destructor frees the object, and
//!   the release then cascades into the object's class, possibly freeing a
//!   chain of classes ending at the class-class.

use crate::alloc::Heap;
use crate::class::Class;
use crate::value::Value;

/// Header shared by all heap objects.
#[repr(C)]
pub struct Object {
    /// Number of live references to this object.
    pub refs: i32,
    /// The class this object is an instance of.
    pub class: *mut Class,
}

/// Increments the reference count of `obj`.
///
/// # Safety
///
/// `obj` must point to a live object.
pub unsafe fn object_retain(obj: *mut Object) {
    unsafe {
        debug_assert!((*obj).refs > 0);
        (*obj).refs += 1;
    }
}

/// Decrements the reference count of `obj`, destroying it when the count
/// reaches zero and cascading the release into its class.
///
/// The cascade terminates at the class-class, whose `class` field points to
/// itself: once an object's class *is* the object just freed, there is
/// nothing left to release.
///
/// # Safety
///
/// `obj` must point to a live object with a positive reference count.
pub unsafe fn object_unref(heap: &Heap, mut obj: *mut Object) {
    unsafe {
        loop {
            debug_assert!((*obj).refs > 0);
            (*obj).refs -= 1;
            if (*obj).refs > 0 {
                return;
            }
            let class = (*obj).class;
            ((*class).dtor)(heap, obj);
            if class.cast::<Object>() == obj {
                return;
            }
            obj = class.cast::<Object>();
        }
    }
}

/// Releases whatever object `val` references, if any.
pub fn value_destroy(heap: &Heap, val: Value) {
    if val.is_object() {
        unsafe { object_unref(heap, val.as_object()) };
    }
}

/// Writes `src` into `*slot` with correct reference counting: the incoming
/// value is retained before the outgoing one is released.
pub fn value_set(heap: &Heap, slot: &mut Value, src: Value) {
    let old = *slot;
    *slot = src;
    if src.is_object() {
        unsafe { object_retain(src.as_object()) };
    }
    value_destroy(heap, old);
}

/// Releases whatever `*slot` references and stores nil.
pub fn value_set_nil(heap: &Heap, slot: &mut Value) {
    value_destroy(heap, *slot);
    *slot = Value::nil();
}
