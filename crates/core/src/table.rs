//! The table type: an open-addressed, linear-probe hash map.
//!
//! A slot is empty iff its key is nil; inserting a nil key is a fault.
//! Probing walks `h mod cap, h+1 mod cap, ...` until it finds an empty slot
//! or one whose key equals the probe key. The pair array doubles once the
//! occupancy crosses 80% of capacity.
//!
//! Key equality: nil equals nil, otherwise bit-pattern equality, except that
//! two objects of the same class compare through the class COMPARE operator
//! (which gives strings content equality).
//!
//! Table objects additionally carry an optional metatable reference, used
//! by the VM's method-call fallback and the `set_metatable` /
//! `get_metatable` host functions.

use std::alloc::Layout;

use crate::alloc::Heap;
use crate::class::{class_dispatch, class_new, Class, ClassOp, OpResult};
use crate::error::VmError;
use crate::object::{object_unref, value_destroy, value_set, Object};
use crate::value::Value;

/// Initial pair-array capacity of a fresh table.
pub const TABLE_DEFAULT_CAPACITY: i32 = 16;

/// One key/value slot.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Pair {
    pub key: Value,
    pub value: Value,
}

/// The map proper: occupancy, capacity and the pair array.
#[repr(C)]
pub struct Table {
    pub size: i32,
    pub capacity: i32,
    pub pairs: *mut Pair,
}

/// A table object: header, map, optional metatable.
#[repr(C)]
pub struct ObjTable {
    pub object: Object,
    pub table: Table,
    pub metatable: *mut ObjTable,
}

fn pairs_layout(capacity: i32) -> Layout {
    Layout::array::<Pair>(capacity as usize).expect("table layout overflow")
}

fn alloc_pairs(heap: &Heap, capacity: i32) -> Result<*mut Pair, VmError> {
    let pairs = heap.alloc(pairs_layout(capacity)).cast::<Pair>();
    if pairs.is_null() {
        return Err(VmError::out_of_memory());
    }
    for i in 0..capacity as usize {
        unsafe {
            (*pairs.add(i)).key = Value::nil();
            (*pairs.add(i)).value = Value::nil();
        }
    }
    Ok(pairs)
}

/// Key equality for probing.
fn key_equal(heap: &Heap, a: Value, b: Value) -> Result<bool, VmError> {
    if a.bits() == b.bits() {
        return Ok(true);
    }
    if a.is_object() && b.is_object() {
        let (ao, bo) = (a.as_object(), b.as_object());
        if unsafe { (*ao).class == (*bo).class } {
            let ord = class_dispatch(heap, ao, ClassOp::Compare, b, Value::nil())?
                .into_compare();
            return Ok(ord == 0);
        }
    }
    Ok(false)
}

/// Index of the slot for `key`: either the slot holding it or the first
/// empty slot of its probe chain.
fn table_find(
    heap: &Heap,
    pairs: *mut Pair,
    capacity: i32,
    key: Value,
) -> Result<usize, VmError> {
    let hash = crate::class::value_hash(heap, key)?;
    let mut index = (hash % capacity as u64) as usize;
    loop {
        let slot = unsafe { &*pairs.add(index) };
        if slot.key.is_nil() || key_equal(heap, slot.key, key)? {
            return Ok(index);
        }
        index = (index + 1) % capacity as usize;
    }
}

impl Table {
    /// Initializes an empty table with the given capacity.
    pub fn init(&mut self, heap: &Heap, capacity: i32) -> Result<(), VmError> {
        self.size = 0;
        self.capacity = capacity;
        self.pairs = alloc_pairs(heap, capacity)?;
        Ok(())
    }

    /// Destroys every key and value and releases the pair array.
    pub fn deinit(&mut self, heap: &Heap) {
        for i in 0..self.capacity as usize {
            unsafe {
                value_destroy(heap, (*self.pairs.add(i)).key);
                value_destroy(heap, (*self.pairs.add(i)).value);
            }
        }
        unsafe { heap.dealloc(self.pairs.cast(), pairs_layout(self.capacity)) };
        self.pairs = std::ptr::null_mut();
        self.capacity = 0;
        self.size = 0;
    }

    /// Maps `key` to `val`, inserting or overwriting, growing if occupancy
    /// crosses the 80% load trigger.
    pub fn set(&mut self, heap: &Heap, key: Value, val: Value) -> Result<(), VmError> {
        if key.is_nil() {
            return Err(VmError::new("table key cannot be nil."));
        }
        let index = table_find(heap, self.pairs, self.capacity, key)?;
        let slot = unsafe { &mut *self.pairs.add(index) };
        if slot.key.is_nil() {
            self.size += 1;
        }
        value_set(heap, &mut slot.key, key);
        value_set(heap, &mut slot.value, val);

        if self.size > self.capacity * 80 / 100 {
            let new_capacity = self.capacity * 2;
            let new_pairs = alloc_pairs(heap, new_capacity)?;
            for i in 0..self.capacity as usize {
                let pair = unsafe { *self.pairs.add(i) };
                if !pair.key.is_nil() {
                    let at = table_find(heap, new_pairs, new_capacity, pair.key)?;
                    unsafe { *new_pairs.add(at) = pair };
                }
            }
            unsafe { heap.dealloc(self.pairs.cast(), pairs_layout(self.capacity)) };
            self.pairs = new_pairs;
            self.capacity = new_capacity;
        }
        Ok(())
    }

    /// The value mapped to `key`, or nil.
    pub fn get(&self, heap: &Heap, key: Value) -> Result<Value, VmError> {
        let index = table_find(heap, self.pairs, self.capacity, key)?;
        Ok(unsafe { (*self.pairs.add(index)).value })
    }
}

/// Allocates an empty table object. Returns null on heap exhaustion.
pub fn table_new(heap: &Heap, cls_table: *mut Class) -> *mut ObjTable {
    let tbl = heap.alloc(Layout::new::<ObjTable>()).cast::<ObjTable>();
    if tbl.is_null() {
        return tbl;
    }
    unsafe {
        (*tbl).object = Object {
            refs: 1,
            class: cls_table,
        };
        (*tbl).metatable = std::ptr::null_mut();
        match (*tbl).table.init(heap, TABLE_DEFAULT_CAPACITY) {
            Ok(()) => {}
            Err(_) => {
                heap.dealloc(tbl.cast(), Layout::new::<ObjTable>());
                return std::ptr::null_mut();
            }
        }
        (*cls_table).object.refs += 1;
    }
    tbl
}

/// Allocates a table value, or errors on heap exhaustion.
pub fn value_new_table(heap: &Heap, cls_table: *mut Class) -> Result<Value, VmError> {
    let tbl = table_new(heap, cls_table);
    if tbl.is_null() {
        return Err(VmError::out_of_memory());
    }
    Ok(unsafe { Value::object(tbl.cast()) })
}

/// Returns the table object referenced by `val` if it is one.
pub fn value_as_table(val: Value, cls_table: *mut Class) -> Option<*mut ObjTable> {
    if !val.is_object() {
        return None;
    }
    let obj = val.as_object();
    if unsafe { (*obj).class } == cls_table {
        Some(obj.cast())
    } else {
        None
    }
}

fn table_dtor(heap: &Heap, obj: *mut Object) {
    let tbl = obj.cast::<ObjTable>();
    unsafe {
        (*tbl).table.deinit(heap);
        if !(*tbl).metatable.is_null() {
            object_unref(heap, (*tbl).metatable.cast());
        }
        heap.dealloc(tbl.cast(), Layout::new::<ObjTable>());
    }
}

fn table_op_get(
    heap: &Heap,
    obj: *mut Object,
    _op: ClassOp,
    arg1: Value,
    _arg2: Value,
) -> Result<OpResult, VmError> {
    let tbl = obj.cast::<ObjTable>();
    let val = unsafe { (*tbl).table.get(heap, arg1)? };
    // Value operator results are owned by the caller.
    if val.is_object() {
        unsafe { crate::object::object_retain(val.as_object()) };
    }
    Ok(OpResult::Value(val))
}

fn table_op_set(
    heap: &Heap,
    obj: *mut Object,
    _op: ClassOp,
    arg1: Value,
    arg2: Value,
) -> Result<OpResult, VmError> {
    let tbl = obj.cast::<ObjTable>();
    unsafe { (*tbl).table.set(heap, arg1, arg2)? };
    Ok(OpResult::Value(Value::nil()))
}

/// Allocates the table class.
pub fn table_class_new(heap: &Heap, class_class: *mut Class) -> *mut Class {
    let cls = class_new(heap, class_class, "table");
    if cls.is_null() {
        return cls;
    }
    unsafe {
        (*cls).dtor = table_dtor;
        (*cls).operators[ClassOp::Get as usize] = table_op_get;
        (*cls).operators[ClassOp::Set as usize] = table_op_set;
    }
    cls
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::class_class_new;
    use crate::string::{string_class_new, string_from_bytes};

    struct Fixture {
        heap: Heap,
        class_class: *mut Class,
        cls_string: *mut Class,
        cls_table: *mut Class,
    }

    impl Fixture {
        fn new() -> Fixture {
            let heap = Heap::new();
            let class_class = class_class_new(&heap);
            let cls_string = string_class_new(&heap, class_class);
            let cls_table = table_class_new(&heap, class_class);
            Fixture {
                heap,
                class_class,
                cls_string,
                cls_table,
            }
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            unsafe {
                object_unref(&self.heap, self.cls_string.cast());
                object_unref(&self.heap, self.cls_table.cast());
                object_unref(&self.heap, self.class_class.cast());
            }
            assert_eq!(self.heap.live_allocations(), 0);
        }
    }

    #[test]
    fn set_then_get_round_trips() {
        let fx = Fixture::new();
        let tbl = table_new(&fx.heap, fx.cls_table);
        unsafe {
            let t = &mut (*tbl).table;
            t.set(&fx.heap, Value::number(1.0), Value::number(10.0)).unwrap();
            assert_eq!(
                t.get(&fx.heap, Value::number(1.0)).unwrap().as_number(),
                10.0
            );
            assert!(t.get(&fx.heap, Value::number(2.0)).unwrap().is_nil());
            object_unref(&fx.heap, tbl.cast());
        }
    }

    #[test]
    fn overwrite_keeps_size() {
        let fx = Fixture::new();
        let tbl = table_new(&fx.heap, fx.cls_table);
        unsafe {
            let t = &mut (*tbl).table;
            t.set(&fx.heap, Value::number(1.0), Value::number(1.0)).unwrap();
            t.set(&fx.heap, Value::number(1.0), Value::number(2.0)).unwrap();
            assert_eq!(t.size, 1);
            assert_eq!(
                t.get(&fx.heap, Value::number(1.0)).unwrap().as_number(),
                2.0
            );
            object_unref(&fx.heap, tbl.cast());
        }
    }

    #[test]
    fn string_keys_compare_by_content() {
        let fx = Fixture::new();
        let tbl = table_new(&fx.heap, fx.cls_table);
        let k1 = string_from_bytes(&fx.heap, fx.cls_string, b"key");
        let k2 = string_from_bytes(&fx.heap, fx.cls_string, b"key");
        unsafe {
            let t = &mut (*tbl).table;
            t.set(&fx.heap, Value::object(k1.cast()), Value::number(7.0))
                .unwrap();
            assert_eq!(
                t.get(&fx.heap, Value::object(k2.cast()))
                    .unwrap()
                    .as_number(),
                7.0
            );
            assert_eq!(t.size, 1);
            object_unref(&fx.heap, k1.cast());
            object_unref(&fx.heap, k2.cast());
            object_unref(&fx.heap, tbl.cast());
        }
    }

    #[test]
    fn growth_preserves_entries() {
        let fx = Fixture::new();
        let tbl = table_new(&fx.heap, fx.cls_table);
        unsafe {
            let t = &mut (*tbl).table;
            for i in 0..100 {
                t.set(&fx.heap, Value::number(i as f64), Value::number(i as f64 * 2.0))
                    .unwrap();
            }
            assert!(t.capacity >= 100);
            for i in 0..100 {
                assert_eq!(
                    t.get(&fx.heap, Value::number(i as f64)).unwrap().as_number(),
                    i as f64 * 2.0
                );
            }
            assert_eq!(t.size, 100);
            object_unref(&fx.heap, tbl.cast());
        }
    }

    #[test]
    fn nil_key_is_rejected() {
        let fx = Fixture::new();
        let tbl = table_new(&fx.heap, fx.cls_table);
        unsafe {
            let err = (*tbl)
                .table
                .set(&fx.heap, Value::nil(), Value::number(1.0))
                .unwrap_err();
            assert!(err.message().contains("nil"));
            object_unref(&fx.heap, tbl.cast());
        }
    }
}
