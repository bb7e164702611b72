//! The virtual machine.
//!
//! State: a frame stack, a value stack, the globals table, the builtin
//! classes, a validity flag and the program-output sink. Execution is one
//! big dispatch match; arithmetic and comparisons take a numeric fast path
//! and fall back to class-operator dispatch when the left operand is an
//! object.
//!
//! Reference-count discipline on the stack:
//!
//! - copying a value between registers retains it before the old register
//!   content is released ([`value_set`]);
//! - class operators that produce a value transfer ownership of it, so
//!   their results are written with [`Vm::set_reg_owned`] (no extra
//!   retain);
//! - a runtime fault propagates as `Err`, marks the state invalid, and
//!   leaves the message as a string value on the stack.
//!
//! Branch protocol (shared by `test`, `testset`, `eq`, `lt`, `lte`): the
//! instruction after the test is always a `jump`; a passing test executes
//! it, a failing test skips it.

use std::io::Write;

use koji_core::alloc::Heap;
use koji_core::bytecode::Opcode;
use koji_core::class::{class_class_new, class_dispatch, Class, ClassOp};
use koji_core::closure::{closure_class_new, value_as_closure, value_new_closure};
use koji_core::error::VmError;
use koji_core::object::{
    object_retain, object_unref, value_destroy, value_set, value_set_nil,
};
use koji_core::proto::{prototype_release, prototype_retain, Prototype};
use koji_core::string::{string_class_new, value_as_str, value_new_string, Str};
use koji_core::table::{table_class_new, table_new, value_as_table, ObjTable};
use koji_core::value::Value;

/// One activation record.
struct Frame {
    proto: *mut Prototype,
    pc: i32,
    stack_base: usize,
    /// The receiver installed by `mcall`; nil for plain calls.
    this: Value,
}

/// A host static function.
pub type HostFn = fn(&mut HostCall) -> Result<(), VmError>;

/// Registry entry for a host static function.
pub struct StaticFn {
    pub name: String,
    pub func: HostFn,
    pub min_args: i32,
    pub max_args: i32,
}

/// The view a host static function gets of its invocation: the argument
/// window, the heap, the builtin classes it may need, the output sink, and
/// a single return-value slot.
pub struct HostCall<'a> {
    pub heap: &'a Heap,
    pub cls_string: *mut Class,
    pub cls_table: *mut Class,
    args: &'a mut [Value],
    out: &'a mut dyn Write,
    ret: Option<Value>,
}

impl HostCall<'_> {
    pub fn nargs(&self) -> usize {
        self.args.len()
    }

    /// The `i`-th argument. Arguments are owned by the stack; retain before
    /// storing one anywhere.
    pub fn arg(&self, i: usize) -> Value {
        self.args[i]
    }

    /// Sets the return value, transferring ownership to the VM.
    pub fn set_ret(&mut self, val: Value) {
        debug_assert!(self.ret.is_none());
        self.ret = Some(val);
    }

    /// Writes a value to the program-output sink in display form.
    pub fn write_value(&mut self, val: Value) -> std::io::Result<()> {
        write_value(&mut *self.out, val, self.cls_string)
    }

    pub fn write_str(&mut self, s: &str) -> std::io::Result<()> {
        self.out.write_all(s.as_bytes())
    }
}

/// Renders a value for `debug`/`print`: numbers drop the decimal point when
/// integral, strings print their content, other objects their class name.
fn write_value(out: &mut dyn Write, val: Value, cls_string: *mut Class) -> std::io::Result<()> {
    if val.is_nil() {
        write!(out, "nil")
    } else if val.is_boolean() {
        write!(out, "{}", val.as_boolean())
    } else if val.is_number() {
        let n = val.as_number();
        if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
            write!(out, "{}", n as i64)
        } else {
            write!(out, "{n}")
        }
    } else if let Some(s) = value_as_str(val, cls_string) {
        out.write_all(unsafe { Str::bytes(s) })
    } else {
        let name = unsafe { (*(*val.as_object()).class).name.as_str() };
        write!(out, "<{name}>")
    }
}

/// The virtual machine state.
pub struct Vm {
    pub heap: Heap,
    valid: bool,
    frames: Vec<Frame>,
    stack: Vec<Value>,
    pub class_class: *mut Class,
    pub cls_string: *mut Class,
    pub cls_table: *mut Class,
    pub cls_closure: *mut Class,
    globals: *mut ObjTable,
    pub statics: Vec<StaticFn>,
    out: Box<dyn Write>,
}

/// Initial capacity of the frame and value stacks.
const STACK_INITIAL_CAPACITY: usize = 16;

impl Vm {
    /// Creates a VM with its builtin classes and globals table, or `None`
    /// when the heap cannot serve the initial allocations.
    pub fn new(heap: Heap) -> Option<Vm> {
        let class_class = class_class_new(&heap);
        if class_class.is_null() {
            return None;
        }
        let cls_string = string_class_new(&heap, class_class);
        let cls_table = table_class_new(&heap, class_class);
        let cls_closure = closure_class_new(&heap, class_class);
        if cls_string.is_null() || cls_table.is_null() || cls_closure.is_null() {
            return None;
        }
        let globals = table_new(&heap, cls_table);
        if globals.is_null() {
            return None;
        }
        Some(Vm {
            heap,
            valid: true,
            frames: Vec::with_capacity(STACK_INITIAL_CAPACITY),
            stack: Vec::with_capacity(STACK_INITIAL_CAPACITY),
            class_class,
            cls_string,
            cls_table,
            cls_closure,
            globals,
            statics: Vec::new(),
            out: Box::new(std::io::stdout()),
        })
    }

    pub fn set_output(&mut self, out: Box<dyn Write>) {
        self.out = out;
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    // ------------------------------------------------------------------
    // value stack (embedding surface)
    // ------------------------------------------------------------------

    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    /// Pushes `val`, transferring ownership to the stack.
    pub fn push(&mut self, val: Value) {
        self.stack.push(val);
    }

    /// The value at `offset` from the top (`-1` is the top).
    pub fn top(&self, offset: i32) -> Option<Value> {
        let index = self.stack.len() as i32 + offset;
        if index < 0 || index >= self.stack.len() as i32 {
            return None;
        }
        Some(self.stack[index as usize])
    }

    /// Pops and releases `n` values.
    pub fn pop(&mut self, n: usize) {
        for _ in 0..n {
            if let Some(val) = self.stack.pop() {
                value_destroy(&self.heap, val);
            }
        }
    }

    /// Pushes a freshly allocated string value.
    pub fn push_string(&mut self, content: &[u8]) -> Result<(), VmError> {
        let val = value_new_string(&self.heap, self.cls_string, content)?;
        self.push(val);
        Ok(())
    }

    /// Maps `name` to the top of the stack in the globals table, popping it.
    pub fn set_global(&mut self, name: &str) -> Result<(), VmError> {
        let key = value_new_string(&self.heap, self.cls_string, name.as_bytes())?;
        let val = match self.top(-1) {
            Some(v) => v,
            None => return Err(VmError::new("value stack is empty.")),
        };
        unsafe { (*self.globals).table.set(&self.heap, key, val)? };
        self.pop(1);
        value_destroy(&self.heap, key);
        Ok(())
    }

    // ------------------------------------------------------------------
    // frames
    // ------------------------------------------------------------------

    /// Pushes an activation frame for `proto` based at `stack_base`,
    /// retaining the prototype and reserving its registers (set to nil).
    pub fn push_frame(&mut self, proto: *mut Prototype, stack_base: usize, this: Value) {
        unsafe { prototype_retain(proto) };
        if this.is_object() {
            unsafe { object_retain(this.as_object()) };
        }
        let top = stack_base + unsafe { (*proto).nlocals } as usize;
        while self.stack.len() < top {
            self.stack.push(Value::nil());
        }
        let name: &str = unsafe { &(*proto).name };
        tracing::trace!(name, stack_base, "push frame");
        self.frames.push(Frame {
            proto,
            pc: 0,
            stack_base,
            this,
        });
    }

    /// The prototype of the innermost frame, if any.
    pub fn loaded_proto(&self) -> Option<*mut Prototype> {
        self.frames.last().map(|f| f.proto)
    }

    // ------------------------------------------------------------------
    // execution
    // ------------------------------------------------------------------

    /// Runs until the outermost frame returns. On a fault the state is
    /// marked invalid and the message is pushed as a string value.
    pub fn resume(&mut self) -> Result<(), VmError> {
        if !self.valid {
            return Err(VmError::new("cannot resume an invalid state."));
        }
        match self.run() {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::trace!(message = err.message(), "runtime fault");
                self.valid = false;
                // Best effort: the diagnostic lands on the value stack.
                if let Ok(val) =
                    value_new_string(&self.heap, self.cls_string, err.message().as_bytes())
                {
                    self.push(val);
                }
                Err(err)
            }
        }
    }

    fn reg(&self, base: usize, loc: i32) -> usize {
        debug_assert!(loc >= 0);
        base + loc as usize
    }

    /// The value at a biased location: a register when non-negative, a
    /// constant otherwise.
    fn value_at(&self, proto: *mut Prototype, base: usize, loc: i32) -> Value {
        if loc >= 0 {
            self.stack[base + loc as usize]
        } else {
            unsafe { (&(*proto).consts)[(-loc - 1) as usize] }
        }
    }

    /// Writes a borrowed value into a register (retains it).
    fn set_reg(&mut self, index: usize, val: Value) {
        value_set(&self.heap, &mut self.stack[index], val);
    }

    /// Writes an owned value into a register (no retain).
    fn set_reg_owned(&mut self, index: usize, val: Value) {
        let old = self.stack[index];
        self.stack[index] = val;
        value_destroy(&self.heap, old);
    }

    fn frame_fields(&self) -> (*mut Prototype, usize, i32) {
        let frame = self.frames.last().expect("dispatch requires a frame");
        (frame.proto, frame.stack_base, frame.pc)
    }

    fn run(&mut self) -> Result<(), VmError> {
        'new_frame: loop {
            if self.frames.is_empty() {
                return Ok(());
            }

            loop {
                let (proto, base, pc) = self.frame_fields();
                let instr = unsafe { (&(*proto).instrs)[pc as usize] };
                self.frames.last_mut().expect("frame").pc = pc + 1;
                let pc = pc + 1; // index of the instruction after this one

                match instr.op() {
                    Opcode::LoadNil => {
                        for r in instr.a()..=instr.bx() {
                            let index = self.reg(base, r);
                            value_set_nil(&self.heap, &mut self.stack[index]);
                        }
                    }

                    Opcode::LoadBool => {
                        let index = self.reg(base, instr.a());
                        self.set_reg_owned(index, Value::boolean(instr.b() != 0));
                        self.frames.last_mut().expect("frame").pc = pc + instr.c();
                    }

                    Opcode::Mov => {
                        let val = self.value_at(proto, base, instr.bx());
                        let index = self.reg(base, instr.a());
                        self.set_reg(index, val);
                    }

                    Opcode::Neg => {
                        let val = self.value_at(proto, base, instr.bx());
                        let index = self.reg(base, instr.a());
                        self.set_reg_owned(index, Value::boolean(!val.to_boolean()));
                    }

                    Opcode::Unm => {
                        let arg = self.value_at(proto, base, instr.bx());
                        let index = self.reg(base, instr.a());
                        if arg.is_number() {
                            self.set_reg_owned(index, Value::number(-arg.as_number()));
                        } else if arg.is_object() {
                            let result = class_dispatch(
                                &self.heap,
                                arg.as_object(),
                                ClassOp::Unm,
                                arg,
                                Value::nil(),
                            )?
                            .into_value();
                            self.set_reg_owned(index, result);
                        } else {
                            return Err(VmError::new(format!(
                                "cannot apply unary minus to a {} value.",
                                arg.type_name()
                            )));
                        }
                    }

                    op @ (Opcode::Add
                    | Opcode::Sub
                    | Opcode::Mul
                    | Opcode::Div
                    | Opcode::Mod) => {
                        let lhs = self.value_at(proto, base, instr.b());
                        let rhs = self.value_at(proto, base, instr.c());
                        let index = self.reg(base, instr.a());
                        if lhs.is_number() && rhs.is_number() {
                            let (a, b) = (lhs.as_number(), rhs.as_number());
                            let result = match op {
                                Opcode::Add => a + b,
                                Opcode::Sub => a - b,
                                Opcode::Mul => a * b,
                                Opcode::Div => a / b,
                                Opcode::Mod => {
                                    if b as i64 == 0 {
                                        return Err(VmError::new("modulo by zero."));
                                    }
                                    ((a as i64) % (b as i64)) as f64
                                }
                                _ => unreachable!(),
                            };
                            self.set_reg_owned(index, Value::number(result));
                        } else if lhs.is_object() {
                            let class_op = match op {
                                Opcode::Add => ClassOp::Add,
                                Opcode::Sub => ClassOp::Sub,
                                Opcode::Mul => ClassOp::Mul,
                                Opcode::Div => ClassOp::Div,
                                Opcode::Mod => ClassOp::Mod,
                                _ => unreachable!(),
                            };
                            let result = class_dispatch(
                                &self.heap,
                                lhs.as_object(),
                                class_op,
                                rhs,
                                Value::nil(),
                            )?
                            .into_value();
                            self.set_reg_owned(index, result);
                        } else {
                            return Err(VmError::new(format!(
                                "cannot apply binary operator '{}' between a {} and a {}.",
                                instr.op().mnemonic(),
                                lhs.type_name(),
                                rhs.type_name()
                            )));
                        }
                    }

                    Opcode::TestSet => {
                        let arg = self.value_at(proto, base, instr.b());
                        let mut new_pc = pc + 1;
                        if arg.to_boolean() == (instr.c() != 0) {
                            let index = self.reg(base, instr.a());
                            self.set_reg(index, arg);
                            let jump = unsafe { (&(*proto).instrs)[pc as usize] };
                            new_pc += jump.jump_offset();
                        }
                        self.frames.last_mut().expect("frame").pc = new_pc;
                    }

                    Opcode::Test => {
                        let val = self.stack[self.reg(base, instr.a())];
                        let mut new_pc = pc + 1;
                        if val.to_boolean() == (instr.bx() != 0) {
                            let jump = unsafe { (&(*proto).instrs)[pc as usize] };
                            new_pc += jump.jump_offset();
                        }
                        self.frames.last_mut().expect("frame").pc = new_pc;
                    }

                    Opcode::Jump => {
                        self.frames.last_mut().expect("frame").pc = pc + instr.jump_offset();
                    }

                    op @ (Opcode::Eq | Opcode::Lt | Opcode::Lte) => {
                        let lhs = self.stack[self.reg(base, instr.a())];
                        let rhs = self.value_at(proto, base, instr.b());
                        let holds = if lhs.is_number() && rhs.is_number() {
                            let (a, b) = (lhs.as_number(), rhs.as_number());
                            match op {
                                Opcode::Eq => a == b,
                                Opcode::Lt => a < b,
                                Opcode::Lte => a <= b,
                                _ => unreachable!(),
                            }
                        } else if lhs.is_object() {
                            let ord = class_dispatch(
                                &self.heap,
                                lhs.as_object(),
                                ClassOp::Compare,
                                rhs,
                                Value::nil(),
                            )?
                            .into_compare();
                            match op {
                                Opcode::Eq => ord == 0,
                                Opcode::Lt => ord < 0,
                                Opcode::Lte => ord <= 0,
                                _ => unreachable!(),
                            }
                        } else {
                            match op {
                                Opcode::Eq => lhs.bits() == rhs.bits(),
                                Opcode::Lt => lhs.bits() < rhs.bits(),
                                Opcode::Lte => lhs.bits() <= rhs.bits(),
                                _ => unreachable!(),
                            }
                        };
                        let mut new_pc = pc + 1;
                        if holds == (instr.c() != 0) {
                            let jump = unsafe { (&(*proto).instrs)[pc as usize] };
                            new_pc += jump.jump_offset();
                        }
                        self.frames.last_mut().expect("frame").pc = new_pc;
                    }

                    Opcode::Closure => {
                        let child = unsafe { (&(*proto).protos)[instr.bx() as usize] };
                        let val = value_new_closure(&self.heap, self.cls_closure, child)?;
                        let index = self.reg(base, instr.a());
                        self.set_reg_owned(index, val);
                    }

                    Opcode::GetGlob => {
                        let key = self.value_at(proto, base, instr.bx());
                        let val = unsafe { (*self.globals).table.get(&self.heap, key)? };
                        let index = self.reg(base, instr.a());
                        self.set_reg(index, val);
                    }

                    Opcode::SetGlob => {
                        let key = self.value_at(proto, base, instr.bx());
                        let val = self.stack[self.reg(base, instr.a())];
                        unsafe { (*self.globals).table.set(&self.heap, key, val)? };
                    }

                    Opcode::NewTable => {
                        let val = {
                            let tbl = table_new(&self.heap, self.cls_table);
                            if tbl.is_null() {
                                return Err(VmError::out_of_memory());
                            }
                            unsafe { Value::object(tbl.cast()) }
                        };
                        let index = self.reg(base, instr.a());
                        self.set_reg_owned(index, val);
                    }

                    Opcode::Get => {
                        let obj = self.value_at(proto, base, instr.b());
                        let key = self.value_at(proto, base, instr.c());
                        if !obj.is_object() {
                            return Err(VmError::new(format!(
                                "primitive type {} does not support the get operator.",
                                obj.type_name()
                            )));
                        }
                        let result = class_dispatch(
                            &self.heap,
                            obj.as_object(),
                            ClassOp::Get,
                            key,
                            Value::nil(),
                        )?
                        .into_value();
                        let index = self.reg(base, instr.a());
                        self.set_reg_owned(index, result);
                    }

                    Opcode::Set => {
                        let obj = self.stack[self.reg(base, instr.a())];
                        let key = self.value_at(proto, base, instr.b());
                        let val = self.value_at(proto, base, instr.c());
                        if !obj.is_object() {
                            return Err(VmError::new(format!(
                                "primitive type {} does not support the set operator.",
                                obj.type_name()
                            )));
                        }
                        class_dispatch(&self.heap, obj.as_object(), ClassOp::Set, key, val)?;
                    }

                    Opcode::This => {
                        let this = self.frames.last().expect("frame").this;
                        let index = self.reg(base, instr.a());
                        self.set_reg(index, this);
                    }

                    Opcode::Call => {
                        let callee = self.value_at(proto, base, instr.b());
                        self.enter_call(callee, base + instr.a() as usize, instr.c(), Value::nil())?;
                        continue 'new_frame;
                    }

                    Opcode::Mcall => {
                        let a = instr.a();
                        debug_assert!(a >= 1);
                        let receiver = self.stack[self.reg(base, a - 1)];
                        if !receiver.is_object() {
                            return Err(VmError::new(format!(
                                "cannot call a method on a {} value.",
                                receiver.type_name()
                            )));
                        }
                        let key = self.value_at(proto, base, instr.b());
                        let mut method = class_dispatch(
                            &self.heap,
                            receiver.as_object(),
                            ClassOp::Get,
                            key,
                            Value::nil(),
                        )?
                        .into_value();
                        // Fall back to the metatable for tables.
                        if method.is_nil() {
                            if let Some(tbl) = value_as_table(receiver, self.cls_table) {
                                let metatable = unsafe { (*tbl).metatable };
                                if !metatable.is_null() {
                                    method = unsafe {
                                        (*metatable).table.get(&self.heap, key)?
                                    };
                                    if method.is_object() {
                                        unsafe { object_retain(method.as_object()) };
                                    }
                                }
                            }
                        }
                        let entered = self.enter_call(
                            method,
                            base + a as usize,
                            instr.c(),
                            receiver,
                        );
                        value_destroy(&self.heap, method);
                        entered?;
                        continue 'new_frame;
                    }

                    Opcode::Scall => {
                        let fn_index = self.value_at(proto, base, instr.b());
                        debug_assert!(fn_index.is_number());
                        let static_fn = &self.statics[fn_index.as_number() as usize];
                        let func = static_fn.func;
                        let first = base + instr.a() as usize;
                        let nargs = instr.c() as usize;
                        let heap = self.heap.clone();
                        let ret = {
                            let (cls_string, cls_table) = (self.cls_string, self.cls_table);
                            let mut call = HostCall {
                                heap: &heap,
                                cls_string,
                                cls_table,
                                args: &mut self.stack[first..first + nargs],
                                out: &mut *self.out,
                                ret: None,
                            };
                            func(&mut call)?;
                            call.ret
                        };
                        self.set_reg_owned(first, ret.unwrap_or(Value::nil()));
                    }

                    Opcode::Ret => {
                        let a = instr.a();
                        let count = instr.bx();
                        let nlocals = unsafe { (*proto).nlocals };

                        // Move the results down to the frame base.
                        for i in 0..count {
                            let src = self.reg(base, a + i);
                            let dst = self.reg(base, i);
                            if src != dst {
                                let old = self.stack[dst];
                                self.stack[dst] = self.stack[src];
                                self.stack[src] = Value::nil();
                                value_destroy(&self.heap, old);
                            }
                        }
                        // Nil out the rest of the callee registers.
                        for i in count..nlocals {
                            let index = self.reg(base, i);
                            value_set_nil(&self.heap, &mut self.stack[index]);
                        }

                        let frame = self.frames.pop().expect("frame");
                        value_destroy(&self.heap, frame.this);
                        unsafe { prototype_release(frame.proto, &self.heap) };
                        tracing::trace!(stack_base = frame.stack_base, "pop frame");

                        let new_len = match self.frames.last() {
                            Some(caller) => {
                                caller.stack_base
                                    + unsafe { (*caller.proto).nlocals } as usize
                            }
                            None => base + count as usize,
                        };
                        while self.stack.len() > new_len {
                            let val = self.stack.pop().expect("stack checked non-empty");
                            value_destroy(&self.heap, val);
                        }
                        continue 'new_frame;
                    }

                    Opcode::Throw => {
                        let arg = self.value_at(proto, base, instr.bx());
                        return match value_as_str(arg, self.cls_string) {
                            Some(s) => {
                                let message =
                                    String::from_utf8_lossy(unsafe { Str::bytes(s) })
                                        .into_owned();
                                Err(VmError::new(message))
                            }
                            None => Err(VmError::new("throw argument must be a string.")),
                        };
                    }

                    Opcode::Debug => {
                        let first = instr.a();
                        let count = instr.bx();
                        for i in 0..count {
                            let val = self.stack[self.reg(base, first + i)];
                            if i > 0 {
                                let _ = write!(self.out, " ");
                            }
                            let _ = write_value(&mut *self.out, val, self.cls_string);
                        }
                        let _ = writeln!(self.out);
                    }
                }
            }
        }
    }

    /// Validates `callee` and pushes its frame; the arguments are already
    /// in place at the new frame's base.
    fn enter_call(
        &mut self,
        callee: Value,
        stack_base: usize,
        nargs: i32,
        this: Value,
    ) -> Result<(), VmError> {
        let closure = match value_as_closure(callee, self.cls_closure) {
            Some(c) => c,
            None => {
                return Err(VmError::new(format!(
                    "cannot call a {} value.",
                    callee.type_name()
                )))
            }
        };
        let proto = unsafe { (*closure).proto };
        let expected = unsafe { (*proto).nargs };
        if expected != nargs {
            return Err(VmError::new(format!(
                "function takes {expected} arguments ({nargs} provided)."
            )));
        }
        self.push_frame(proto, stack_base, this);
        Ok(())
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        // Stack values, then frames, then globals, then the classes; the
        // final release of the class-class frees it.
        for val in std::mem::take(&mut self.stack) {
            value_destroy(&self.heap, val);
        }
        for frame in std::mem::take(&mut self.frames) {
            value_destroy(&self.heap, frame.this);
            unsafe { prototype_release(frame.proto, &self.heap) };
        }
        unsafe {
            object_unref(&self.heap, self.globals.cast());
            object_unref(&self.heap, self.cls_string.cast());
            object_unref(&self.heap, self.cls_table.cast());
            object_unref(&self.heap, self.cls_closure.cast());
            object_unref(&self.heap, self.class_class.cast());
        }
    }
}
