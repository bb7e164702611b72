//! The string type: immutable byte sequences with inline storage.
//!
//! A string is one contiguous allocation: the object header, the length,
//! then `len + 1` bytes (the last one always zero). Strings support
//! concatenation (`+`), repetition (`* n`), lexicographic comparison,
//! content hashing and byte indexing; they are immutable, so the SET
//! operator stays invalid.

use std::alloc::Layout;

use crate::alloc::Heap;
use crate::class::{
    class_new, class_op_default_compare, class_op_invalid, Class, ClassOp, OpResult,
};
use crate::error::VmError;
use crate::hash::murmur2;
use crate::object::Object;
use crate::value::Value;

/// String object header; `len + 1` bytes follow the struct in the same
/// allocation.
#[repr(C)]
pub struct Str {
    pub object: Object,
    pub len: i32,
}

impl Str {
    /// Layout of a string block holding `len` content bytes.
    fn layout(len: i32) -> Layout {
        Layout::new::<Str>()
            .extend(Layout::array::<u8>(len as usize + 1).expect("string size overflow"))
            .expect("string layout overflow")
            .0
            .pad_to_align()
    }

    /// Pointer to the first content byte.
    ///
    /// # Safety
    ///
    /// `this` must point to a live string object.
    pub unsafe fn bytes_ptr(this: *mut Str) -> *mut u8 {
        unsafe { this.cast::<u8>().add(std::mem::size_of::<Str>()) }
    }

    /// The content bytes (without the trailing zero).
    ///
    /// # Safety
    ///
    /// `this` must point to a live string object.
    pub unsafe fn bytes<'a>(this: *mut Str) -> &'a [u8] {
        unsafe { std::slice::from_raw_parts(Str::bytes_ptr(this), (*this).len as usize) }
    }
}

/// Allocates an uninitialized string of `len` content bytes, retaining the
/// string class. The trailing zero is written; content is the caller's job.
/// Returns null when the heap is exhausted.
pub fn string_new(heap: &Heap, cls_string: *mut Class, len: i32) -> *mut Str {
    let str_ptr = heap.alloc(Str::layout(len)).cast::<Str>();
    if str_ptr.is_null() {
        return str_ptr;
    }
    unsafe {
        (*str_ptr).object = Object {
            refs: 1,
            class: cls_string,
        };
        (*str_ptr).len = len;
        *Str::bytes_ptr(str_ptr).add(len as usize) = 0;
        (*cls_string).object.refs += 1;
    }
    str_ptr
}

/// Allocates a string initialized from `content`.
pub fn string_from_bytes(heap: &Heap, cls_string: *mut Class, content: &[u8]) -> *mut Str {
    let str_ptr = string_new(heap, cls_string, content.len() as i32);
    if !str_ptr.is_null() {
        unsafe {
            std::ptr::copy_nonoverlapping(
                content.as_ptr(),
                Str::bytes_ptr(str_ptr),
                content.len(),
            );
        }
    }
    str_ptr
}

/// Allocates a string value from `content`, or errors on heap exhaustion.
pub fn value_new_string(
    heap: &Heap,
    cls_string: *mut Class,
    content: &[u8],
) -> Result<Value, VmError> {
    let str_ptr = string_from_bytes(heap, cls_string, content);
    if str_ptr.is_null() {
        return Err(VmError::out_of_memory());
    }
    Ok(unsafe { Value::object(str_ptr.cast()) })
}

/// Returns the string object referenced by `val` if it is one.
pub fn value_as_str(val: Value, cls_string: *mut Class) -> Option<*mut Str> {
    if !val.is_object() {
        return None;
    }
    let obj = val.as_object();
    if unsafe { (*obj).class } == cls_string {
        Some(obj.cast())
    } else {
        None
    }
}

fn string_dtor(heap: &Heap, obj: *mut Object) {
    let str_ptr = obj.cast::<Str>();
    unsafe {
        debug_assert!((*(*obj).class).object.refs > 1);
        heap.dealloc(str_ptr.cast(), Str::layout((*str_ptr).len));
    }
}

fn string_op_add(
    heap: &Heap,
    obj: *mut Object,
    op: ClassOp,
    arg1: Value,
    arg2: Value,
) -> Result<OpResult, VmError> {
    let lhs = obj.cast::<Str>();
    let cls = unsafe { (*obj).class };
    match value_as_str(arg1, cls) {
        Some(rhs) => unsafe {
            let total = (*lhs).len + (*rhs).len;
            let out = string_new(heap, cls, total);
            if out.is_null() {
                return Err(VmError::out_of_memory());
            }
            std::ptr::copy_nonoverlapping(
                Str::bytes_ptr(lhs),
                Str::bytes_ptr(out),
                (*lhs).len as usize,
            );
            std::ptr::copy_nonoverlapping(
                Str::bytes_ptr(rhs),
                Str::bytes_ptr(out).add((*lhs).len as usize),
                (*rhs).len as usize,
            );
            Ok(OpResult::Value(Value::object(out.cast())))
        },
        None => class_op_invalid(heap, obj, op, arg1, arg2),
    }
}

fn string_op_mul(
    heap: &Heap,
    obj: *mut Object,
    op: ClassOp,
    arg1: Value,
    arg2: Value,
) -> Result<OpResult, VmError> {
    if !arg1.is_number() {
        return class_op_invalid(heap, obj, op, arg1, arg2);
    }
    let count = arg1.as_number() as i64;
    if count < 0 {
        return Err(VmError::new(
            "cannot multiply a string by a negative number.",
        ));
    }
    let lhs = obj.cast::<Str>();
    unsafe {
        let len = (*lhs).len;
        let cls = (*obj).class;
        let out = string_new(heap, cls, len * count as i32);
        if out.is_null() {
            return Err(VmError::out_of_memory());
        }
        let mut offset = 0usize;
        for _ in 0..count {
            std::ptr::copy_nonoverlapping(
                Str::bytes_ptr(lhs),
                Str::bytes_ptr(out).add(offset),
                len as usize,
            );
            offset += len as usize;
        }
        Ok(OpResult::Value(Value::object(out.cast())))
    }
}

fn string_op_compare(
    heap: &Heap,
    obj: *mut Object,
    op: ClassOp,
    arg1: Value,
    arg2: Value,
) -> Result<OpResult, VmError> {
    let lhs = obj.cast::<Str>();
    let cls = unsafe { (*obj).class };
    match value_as_str(arg1, cls) {
        Some(rhs) => unsafe {
            let (a, b) = (Str::bytes(lhs), Str::bytes(rhs));
            let ord = if a.len() != b.len() {
                if a.len() < b.len() {
                    -1
                } else {
                    1
                }
            } else {
                match a.cmp(b) {
                    std::cmp::Ordering::Less => -1,
                    std::cmp::Ordering::Equal => 0,
                    std::cmp::Ordering::Greater => 1,
                }
            };
            Ok(OpResult::Compare(ord))
        },
        None => class_op_default_compare(heap, obj, op, arg1, arg2),
    }
}

fn string_op_hash(
    _heap: &Heap,
    obj: *mut Object,
    _op: ClassOp,
    _arg1: Value,
    _arg2: Value,
) -> Result<OpResult, VmError> {
    let content = unsafe { Str::bytes(obj.cast()) };
    Ok(OpResult::Hash(murmur2(content, 0)))
}

fn string_op_get(
    heap: &Heap,
    obj: *mut Object,
    op: ClassOp,
    arg1: Value,
    arg2: Value,
) -> Result<OpResult, VmError> {
    if !arg1.is_number() {
        return class_op_invalid(heap, obj, op, arg1, arg2);
    }
    let index = arg1.as_number() as i64;
    let content = unsafe { Str::bytes(obj.cast()) };
    if index < 0 || index as usize >= content.len() {
        return Err(VmError::new(format!(
            "string index {} out of range (length {}).",
            index,
            content.len()
        )));
    }
    Ok(OpResult::Value(Value::number(content[index as usize] as f64)))
}

/// Allocates the string class.
pub fn string_class_new(heap: &Heap, class_class: *mut Class) -> *mut Class {
    let cls = class_new(heap, class_class, "string");
    if cls.is_null() {
        return cls;
    }
    unsafe {
        (*cls).dtor = string_dtor;
        (*cls).operators[ClassOp::Add as usize] = string_op_add;
        (*cls).operators[ClassOp::Mul as usize] = string_op_mul;
        (*cls).operators[ClassOp::Compare as usize] = string_op_compare;
        (*cls).operators[ClassOp::Hash as usize] = string_op_hash;
        (*cls).operators[ClassOp::Get as usize] = string_op_get;
    }
    cls
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::{class_class_new, class_dispatch};
    use crate::object::object_unref;

    fn classes(heap: &Heap) -> (*mut Class, *mut Class) {
        let class_class = class_class_new(heap);
        let cls_string = string_class_new(heap, class_class);
        (class_class, cls_string)
    }

    fn release_classes(heap: &Heap, class_class: *mut Class, cls_string: *mut Class) {
        unsafe {
            object_unref(heap, cls_string.cast());
            object_unref(heap, class_class.cast());
        }
    }

    #[test]
    fn concatenation_produces_a_new_string() {
        let heap = Heap::new();
        let (class_class, cls_string) = classes(&heap);
        let a = string_from_bytes(&heap, cls_string, b"ab");
        let b = string_from_bytes(&heap, cls_string, b"cd");
        unsafe {
            let out = class_dispatch(
                &heap,
                a.cast(),
                ClassOp::Add,
                Value::object(b.cast()),
                Value::nil(),
            )
            .unwrap()
            .into_value();
            let out_str = out.as_object().cast::<Str>();
            assert_eq!(Str::bytes(out_str), b"abcd");
            object_unref(&heap, out.as_object());
            object_unref(&heap, a.cast());
            object_unref(&heap, b.cast());
        }
        release_classes(&heap, class_class, cls_string);
        assert_eq!(heap.live_allocations(), 0);
    }

    #[test]
    fn repetition_and_negative_count() {
        let heap = Heap::new();
        let (class_class, cls_string) = classes(&heap);
        let s = string_from_bytes(&heap, cls_string, b"ab");
        unsafe {
            let out = class_dispatch(
                &heap,
                s.cast(),
                ClassOp::Mul,
                Value::number(3.0),
                Value::nil(),
            )
            .unwrap()
            .into_value();
            assert_eq!(Str::bytes(out.as_object().cast()), b"ababab");
            object_unref(&heap, out.as_object());

            let err = class_dispatch(
                &heap,
                s.cast(),
                ClassOp::Mul,
                Value::number(-1.0),
                Value::nil(),
            )
            .unwrap_err();
            assert!(err.message().contains("negative"));
            object_unref(&heap, s.cast());
        }
        release_classes(&heap, class_class, cls_string);
        assert_eq!(heap.live_allocations(), 0);
    }

    #[test]
    fn comparison_is_length_then_content() {
        let heap = Heap::new();
        let (class_class, cls_string) = classes(&heap);
        let short = string_from_bytes(&heap, cls_string, b"ab");
        let long = string_from_bytes(&heap, cls_string, b"abc");
        let other = string_from_bytes(&heap, cls_string, b"ac");
        unsafe {
            let cmp = |l: *mut Str, r: *mut Str| {
                class_dispatch(
                    &heap,
                    l.cast(),
                    ClassOp::Compare,
                    Value::object(r.cast()),
                    Value::nil(),
                )
                .unwrap()
                .into_compare()
            };
            assert!(cmp(short, long) < 0);
            assert!(cmp(long, short) > 0);
            assert!(cmp(short, other) < 0);
            assert_eq!(cmp(short, short), 0);
            object_unref(&heap, short.cast());
            object_unref(&heap, long.cast());
            object_unref(&heap, other.cast());
        }
        release_classes(&heap, class_class, cls_string);
    }

    #[test]
    fn byte_indexing_and_immutability() {
        let heap = Heap::new();
        let (class_class, cls_string) = classes(&heap);
        let s = string_from_bytes(&heap, cls_string, b"koji");
        unsafe {
            let byte = class_dispatch(
                &heap,
                s.cast(),
                ClassOp::Get,
                Value::number(1.0),
                Value::nil(),
            )
            .unwrap()
            .into_value();
            assert_eq!(byte.as_number(), b'o' as f64);

            assert!(class_dispatch(
                &heap,
                s.cast(),
                ClassOp::Set,
                Value::number(0.0),
                Value::number(65.0),
            )
            .is_err());

            assert!(class_dispatch(
                &heap,
                s.cast(),
                ClassOp::Get,
                Value::number(9.0),
                Value::nil(),
            )
            .is_err());
            object_unref(&heap, s.cast());
        }
        release_classes(&heap, class_class, cls_string);
    }
}
