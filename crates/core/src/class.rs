//! The class system: per-type operator dispatch.
//!
//! Every polymorphic operation in the VM (arithmetic, comparison, hashing,
//! indexed get/set) ends in a call through the operand's class operator
//! table. A class is itself a heap object whose class is the "class" class,
//! a fixpoint: the class-class's `class` field points to itself.
//!
//! Classes start out with the invalid-operator stub in every slot except
//! COMPARE and HASH, which get defaults (order by type then address; hash
//! the address). Concrete types override the slots they support.

use std::alloc::Layout;
use std::ptr;

use crate::alloc::Heap;
use crate::error::VmError;
use crate::hash::mix64;
use crate::object::Object;
use crate::value::Value;

/// Identifies one entry of a class operator table.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ClassOp {
    Unm,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Compare,
    Hash,
    Get,
    Set,
}

/// Number of operator slots in a class.
pub const CLASS_OP_COUNT: usize = 10;

impl ClassOp {
    /// Operator name used in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            ClassOp::Unm => "unary minus",
            ClassOp::Add => "add",
            ClassOp::Sub => "sub",
            ClassOp::Mul => "mul",
            ClassOp::Div => "div",
            ClassOp::Mod => "mod",
            ClassOp::Compare => "compare",
            ClassOp::Hash => "hash",
            ClassOp::Get => "get",
            ClassOp::Set => "set",
        }
    }
}

/// Result of a class operator invocation.
///
/// Arithmetic and get/set produce a value, COMPARE a signed ordinal, HASH a
/// 64-bit hash.
#[derive(Debug)]
pub enum OpResult {
    Value(Value),
    Compare(i32),
    Hash(u64),
}

impl OpResult {
    /// The value payload. Panics if the operator produced something else,
    /// which would be a class-implementation bug.
    pub fn into_value(self) -> Value {
        match self {
            OpResult::Value(v) => v,
            _ => unreachable!("class operator produced a non-value result"),
        }
    }

    /// The comparison ordinal payload.
    pub fn into_compare(self) -> i32 {
        match self {
            OpResult::Compare(c) => c,
            _ => unreachable!("class operator produced a non-compare result"),
        }
    }

    /// The hash payload.
    pub fn into_hash(self) -> u64 {
        match self {
            OpResult::Hash(h) => h,
            _ => unreachable!("class operator produced a non-hash result"),
        }
    }
}

/// A class operator: `obj` is the (left) operand the operator is invoked
/// on, `arg1`/`arg2` the remaining operands (nil when unused).
pub type Operator =
    fn(&Heap, *mut Object, ClassOp, Value, Value) -> Result<OpResult, VmError>;

/// A class destructor: releases the resources held by `obj` and frees the
/// object block itself. The release cascade into the class happens in
/// `object_unref`, not here.
pub type Dtor = fn(&Heap, *mut Object);

/// A class: destructor plus operator table, itself a heap object.
#[repr(C)]
pub struct Class {
    pub object: Object,
    pub name: String,
    pub dtor: Dtor,
    pub operators: [Operator; CLASS_OP_COUNT],
}

/// The invalid-operator stub: bound to every slot a class does not support.
pub fn class_op_invalid(
    _heap: &Heap,
    obj: *mut Object,
    op: ClassOp,
    _arg1: Value,
    _arg2: Value,
) -> Result<OpResult, VmError> {
    let name = unsafe { (*(*obj).class).name.as_str() };
    Err(VmError::new(format!(
        "cannot apply operator '{}' to a {} value.",
        op.name(),
        name
    )))
}

/// Default COMPARE: primitives order before objects; objects of the same
/// class order by object address; otherwise by class address.
pub fn class_op_default_compare(
    _heap: &Heap,
    obj: *mut Object,
    _op: ClassOp,
    arg1: Value,
    _arg2: Value,
) -> Result<OpResult, VmError> {
    let ord = if !arg1.is_object() {
        1
    } else {
        let rhs = arg1.as_object();
        unsafe {
            if (*obj).class == (*rhs).class {
                ptr_order(obj.cast(), rhs.cast())
            } else {
                ptr_order((*obj).class.cast(), (*rhs).class.cast())
            }
        }
    };
    Ok(OpResult::Compare(ord))
}

fn ptr_order(a: *const u8, b: *const u8) -> i32 {
    match (a as usize).cmp(&(b as usize)) {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    }
}

/// Default HASH: a bit-mix over the object address.
pub fn class_op_default_hash(
    _heap: &Heap,
    obj: *mut Object,
    _op: ClassOp,
    _arg1: Value,
    _arg2: Value,
) -> Result<OpResult, VmError> {
    Ok(OpResult::Hash(mix64(obj as u64)))
}

/// Destructor for class objects themselves: drops the owned name and frees
/// the class block.
fn class_dtor(heap: &Heap, obj: *mut Object) {
    let class = obj.cast::<Class>();
    unsafe {
        ptr::drop_in_place(&mut (*class).name);
        heap.dealloc(class.cast(), Layout::new::<Class>());
    }
}

/// Allocates a class with the default operator table.
///
/// `class_class` is retained: the new class is an instance of it. Returns
/// null when the heap is exhausted.
pub fn class_new(heap: &Heap, class_class: *mut Class, name: &str) -> *mut Class {
    let class = heap.alloc(Layout::new::<Class>()).cast::<Class>();
    if class.is_null() {
        return class;
    }
    let mut operators: [Operator; CLASS_OP_COUNT] = [class_op_invalid; CLASS_OP_COUNT];
    operators[ClassOp::Compare as usize] = class_op_default_compare;
    operators[ClassOp::Hash as usize] = class_op_default_hash;
    unsafe {
        ptr::write(
            class,
            Class {
                object: Object {
                    refs: 1,
                    class: class_class,
                },
                name: name.to_string(),
                dtor: class_dtor,
                operators,
            },
        );
        (*class_class).object.refs += 1;
    }
    class
}

/// Allocates the "class" class, the fixpoint of the class graph.
///
/// Its `class` field points to itself; the self edge is not counted, so the
/// final external release is the one that frees it.
pub fn class_class_new(heap: &Heap) -> *mut Class {
    let class = heap.alloc(Layout::new::<Class>()).cast::<Class>();
    if class.is_null() {
        return class;
    }
    let mut operators: [Operator; CLASS_OP_COUNT] = [class_op_invalid; CLASS_OP_COUNT];
    operators[ClassOp::Compare as usize] = class_op_default_compare;
    operators[ClassOp::Hash as usize] = class_op_default_hash;
    unsafe {
        ptr::write(
            class,
            Class {
                object: Object {
                    refs: 1,
                    class,
                },
                name: "class".to_string(),
                dtor: class_dtor,
                operators,
            },
        );
    }
    class
}

/// Hashes a value: objects dispatch through their class HASH operator,
/// primitives mix their raw bits.
pub fn value_hash(heap: &Heap, val: Value) -> Result<u64, VmError> {
    if val.is_object() {
        let obj = val.as_object();
        let op = unsafe { (*(*obj).class).operators[ClassOp::Hash as usize] };
        Ok(op(heap, obj, ClassOp::Hash, Value::nil(), Value::nil())?.into_hash())
    } else {
        Ok(mix64(val.bits()))
    }
}

/// Dispatches `op` through the class of `obj`.
pub fn class_dispatch(
    heap: &Heap,
    obj: *mut Object,
    op: ClassOp,
    arg1: Value,
    arg2: Value,
) -> Result<OpResult, VmError> {
    let operator = unsafe { (*(*obj).class).operators[op as usize] };
    operator(heap, obj, op, arg1, arg2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::object_unref;

    #[test]
    fn class_class_frees_on_final_release() {
        let heap = Heap::new();
        let class_class = class_class_new(&heap);
        assert_eq!(heap.live_allocations(), 1);
        unsafe { object_unref(&heap, class_class.cast()) };
        assert_eq!(heap.live_allocations(), 0);
    }

    #[test]
    fn releasing_a_class_cascades_into_the_class_class() {
        let heap = Heap::new();
        let class_class = class_class_new(&heap);
        let strings = class_new(&heap, class_class, "string");
        unsafe {
            assert_eq!((*class_class).object.refs, 2);
            // Dropping the only handle to `strings` frees it and takes the
            // class-class reference with it.
            object_unref(&heap, strings.cast());
            assert_eq!((*class_class).object.refs, 1);
            object_unref(&heap, class_class.cast());
        }
        assert_eq!(heap.live_allocations(), 0);
    }

    #[test]
    fn default_compare_orders_primitives_before_objects() {
        let heap = Heap::new();
        let class_class = class_class_new(&heap);
        let ord = class_op_default_compare(
            &heap,
            class_class.cast(),
            ClassOp::Compare,
            Value::number(1.0),
            Value::nil(),
        )
        .unwrap()
        .into_compare();
        assert_eq!(ord, 1);
        unsafe { object_unref(&heap, class_class.cast()) };
    }

    #[test]
    fn invalid_operator_reports_the_class_name() {
        let heap = Heap::new();
        let class_class = class_class_new(&heap);
        let err = class_op_invalid(
            &heap,
            class_class.cast(),
            ClassOp::Add,
            Value::nil(),
            Value::nil(),
        )
        .unwrap_err();
        assert!(err.message().contains("add"));
        assert!(err.message().contains("class"));
        unsafe { object_unref(&heap, class_class.cast()) };
    }
}
