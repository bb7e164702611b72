//! Prototypes: the compiled form of a function.
//!
//! A prototype owns its constant pool, instruction vector, and nested
//! prototypes. Prototypes are jointly owned by their parent prototype and by
//! any VM frame or closure currently referencing them, so they carry their
//! own reference count (they are not class-dispatched objects).

use std::cell::Cell;

use crate::alloc::Heap;
use crate::bytecode::{Instr, Opcode};
use crate::object::value_destroy;
use crate::string::Str;
use crate::value::Value;

/// A compiled function: constants, instructions, nested prototypes,
/// argument and register counts.
pub struct Prototype {
    pub refs: Cell<i32>,
    pub name: String,
    pub nargs: i32,
    /// Register high-water mark: 1 + the largest A operand ever written.
    pub nlocals: i32,
    pub consts: Vec<Value>,
    pub instrs: Vec<Instr>,
    pub protos: Vec<*mut Prototype>,
}

/// Allocates a fresh prototype with one reference.
pub fn prototype_new(name: &str) -> *mut Prototype {
    Box::into_raw(Box::new(Prototype {
        refs: Cell::new(1),
        name: name.to_string(),
        nargs: 0,
        nlocals: 0,
        consts: Vec::new(),
        instrs: Vec::new(),
        protos: Vec::new(),
    }))
}

/// Adds a reference to `proto`.
///
/// # Safety
///
/// `proto` must point to a live prototype.
pub unsafe fn prototype_retain(proto: *mut Prototype) {
    unsafe {
        let refs = &(*proto).refs;
        debug_assert!(refs.get() > 0);
        refs.set(refs.get() + 1);
    }
}

/// Drops a reference to `proto`, freeing it (with its constants and
/// children) when the count reaches zero.
///
/// # Safety
///
/// `proto` must point to a live prototype; its string constants must have
/// been allocated on `heap`.
pub unsafe fn prototype_release(proto: *mut Prototype, heap: &Heap) {
    unsafe {
        let refs = &(*proto).refs;
        debug_assert!(refs.get() > 0);
        refs.set(refs.get() - 1);
        if refs.get() > 0 {
            return;
        }
        tracing::trace!(name = %(*proto).name, "releasing prototype");
        let boxed = Box::from_raw(proto);
        for &child in &boxed.protos {
            prototype_release(child, heap);
        }
        for &constant in &boxed.consts {
            value_destroy(heap, constant);
        }
        drop(boxed);
    }
}

impl Prototype {
    /// Renders the bytecode disassembly of this prototype and its children.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        self.dump_into(&mut out, 0);
        out
    }

    fn dump_into(&self, out: &mut String, level: usize) {
        use std::fmt::Write;

        let margin = "   ".repeat(level);
        let _ = writeln!(out, "{margin}prototype \"{}\"", self.name);
        let _ = writeln!(
            out,
            "{margin}#instructions {}, #constants {}, #locals {}, #prototypes {}",
            self.instrs.len(),
            self.consts.len(),
            self.nlocals,
            self.protos.len()
        );

        for (i, instr) in self.instrs.iter().enumerate() {
            let _ = write!(out, "{margin}{}) {:?}", i + 1, instr);

            // Annotate constant operands with their value.
            let const_loc = match instr.op() {
                Opcode::Mov | Opcode::Neg | Opcode::Unm | Opcode::GetGlob
                | Opcode::SetGlob | Opcode::Throw => instr.bx().min(0),
                Opcode::LoadNil | Opcode::LoadBool | Opcode::Test | Opcode::Ret
                | Opcode::Debug | Opcode::Closure | Opcode::Jump | Opcode::NewTable
                | Opcode::This => 0,
                _ => {
                    if instr.b() < 0 {
                        instr.b()
                    } else if instr.c() < 0 {
                        instr.c()
                    } else {
                        0
                    }
                }
            };
            if const_loc < 0 {
                let constant = self.consts[(-const_loc - 1) as usize];
                if constant.is_number() {
                    let _ = write!(out, "   ; {}", constant.as_number());
                } else if constant.is_object() {
                    let bytes = unsafe { Str::bytes(constant.as_object().cast()) };
                    let _ = write!(out, "   ; \"{}\"", String::from_utf8_lossy(bytes));
                }
            }
            if instr.op() == Opcode::Jump {
                let _ = write!(out, "   ; to {}", i as i32 + 2 + instr.jump_offset());
            }
            let _ = writeln!(out);
        }

        for (i, &child) in self.protos.iter().enumerate() {
            let _ = writeln!(out, "{margin}child prototype {i}:");
            unsafe { (*child).dump_into(out, level + 1) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_frees_children() {
        let heap = Heap::new();
        let parent = prototype_new("main");
        let child = prototype_new("inner");
        unsafe {
            (*parent).protos.push(child);
            prototype_retain(parent);
            prototype_release(parent, &heap);
            assert_eq!((*parent).refs.get(), 1);
            prototype_release(parent, &heap);
        }
        // Both prototypes are plain boxes; nothing left on the object heap.
        assert_eq!(heap.live_allocations(), 0);
    }

    #[test]
    fn dump_lists_instructions() {
        let heap = Heap::new();
        let proto = prototype_new("main");
        unsafe {
            (*proto).consts.push(Value::number(7.0));
            (*proto).instrs.push(Instr::abx(Opcode::Mov, 0, -1));
            (*proto).instrs.push(Instr::abx(Opcode::Ret, 0, 0));
            (*proto).nlocals = 1;
            let text = (*proto).dump();
            assert!(text.contains("mov 0, -1"));
            assert!(text.contains("; 7"));
            prototype_release(proto, &heap);
        }
    }
}
