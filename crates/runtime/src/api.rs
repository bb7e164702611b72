//! The embedding API: a [`Koji`] state wraps the VM and the compiler behind
//! the load/run/push/pop surface a host application uses.
//!
//! Error contract: every failure returns a [`KojiError`] carrying the
//! diagnostic, and the same diagnostic is left as a string value on top of
//! the value stack (retrievable with [`Koji::str_at`] at offset `-1`).

use std::io::Write;
use std::path::Path;

use koji_compiler::compiler::{self, CompileInfo, StaticFnResolver, StaticFnSig};
use koji_compiler::source::{FileSource, SourceReader, StrSource};
use koji_core::alloc::{Allocator, Heap};
use koji_core::closure::value_as_closure;
use koji_core::error::VmError;
use koji_core::proto::prototype_release;
use koji_core::string::{value_as_str, Str};
use koji_core::table::value_as_table;
use koji_core::value::Value;

use crate::vm::{HostFn, StaticFn, Vm};

/// Result codes of the embedding surface.
#[derive(Debug)]
pub enum KojiError {
    /// A generic failure (e.g. redefining a static function).
    Fail(String),
    /// The allocator was exhausted.
    OutOfMemory,
    /// Compilation failed; the message is the first reported issue.
    Compile(String),
    /// Execution failed; the state is invalid until discarded.
    Runtime(String),
}

impl KojiError {
    pub fn message(&self) -> &str {
        match self {
            KojiError::Fail(m) | KojiError::Compile(m) | KojiError::Runtime(m) => m,
            KojiError::OutOfMemory => "out of memory",
        }
    }
}

impl std::fmt::Display for KojiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for KojiError {}

/// Value types visible through the API.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum KojiType {
    Nil,
    Bool,
    Number,
    String,
    Table,
    Closure,
}

/// An embeddable scripting state: compiler, VM, globals, host functions.
pub struct Koji {
    vm: Vm,
}

struct RegistryResolver<'a>(&'a [StaticFn]);

impl StaticFnResolver for RegistryResolver<'_> {
    fn lookup(&self, name: &str) -> Option<StaticFnSig> {
        self.0.iter().position(|f| f.name == name).map(|index| {
            let f = &self.0[index];
            StaticFnSig {
                index: index as i32,
                min_args: f.min_args,
                max_args: f.max_args,
            }
        })
    }
}

impl Koji {
    /// A state over the system allocator.
    pub fn new() -> Koji {
        Koji {
            vm: Vm::new(Heap::new()).expect("system allocator failed creating a state"),
        }
    }

    /// A state over a caller-provided allocator.
    pub fn with_allocator(allocator: Box<dyn Allocator>) -> Result<Koji, KojiError> {
        match Vm::new(Heap::with_allocator(allocator)) {
            Some(vm) => Ok(Koji { vm }),
            None => Err(KojiError::OutOfMemory),
        }
    }

    /// The object heap (exposed so embedders and tests can watch live
    /// allocation counts).
    pub fn heap(&self) -> &Heap {
        &self.vm.heap
    }

    /// Redirects `debug`/`print` output.
    pub fn set_output(&mut self, out: Box<dyn Write>) {
        self.vm.set_output(out);
    }

    /// Registers a host function callable from scripts by identifier.
    /// Registration must happen before the calling code is loaded; the
    /// binding is resolved at compile time.
    pub fn static_function(
        &mut self,
        name: &str,
        func: HostFn,
        min_args: i32,
        max_args: i32,
    ) -> Result<(), KojiError> {
        if self.vm.statics.iter().any(|f| f.name == name) {
            return Err(KojiError::Fail(format!(
                "static function '{name}' is already defined."
            )));
        }
        self.vm.statics.push(StaticFn {
            name: name.to_string(),
            func,
            min_args,
            max_args,
        });
        Ok(())
    }

    /// Compiles `reader` and pushes a frame for the resulting program; a
    /// following [`Koji::run`] executes it.
    pub fn load(
        &mut self,
        source_name: &str,
        reader: Box<dyn SourceReader + '_>,
    ) -> Result<(), KojiError> {
        let mut first_issue: Option<String> = None;
        let result = {
            let mut reporter = |_: &koji_compiler::SourceLoc, message: &str| {
                if first_issue.is_none() {
                    first_issue = Some(message.to_string());
                }
            };
            compiler::compile(CompileInfo {
                source_name,
                reader,
                reporter: &mut reporter,
                heap: self.vm.heap.clone(),
                cls_string: self.vm.cls_string,
                statics: &RegistryResolver(&self.vm.statics),
            })
        };

        match result {
            Ok(proto) => {
                let base = self.vm.stack_len();
                self.vm.push_frame(proto, base, Value::nil());
                // The frame now owns the prototype.
                unsafe { prototype_release(proto, &self.vm.heap) };
                Ok(())
            }
            Err(err) => {
                let message = first_issue.unwrap_or(err.message);
                let _ = self.vm.push_string(message.as_bytes());
                Err(KojiError::Compile(message))
            }
        }
    }

    /// Loads from an in-memory string.
    pub fn load_str(&mut self, source: &str) -> Result<(), KojiError> {
        self.load("<string>", Box::new(StrSource::new(source)))
    }

    /// Loads from a file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), KojiError> {
        let source = match FileSource::open(path) {
            Ok(source) => source,
            Err(err) => {
                let message = format!("cannot open file '{}': {err}.", path.display());
                let _ = self.vm.push_string(message.as_bytes());
                return Err(KojiError::Compile(message));
            }
        };
        let name = path.display().to_string();
        self.load(&name, Box::new(source))
    }

    /// Runs the loaded program to completion.
    pub fn run(&mut self) -> Result<(), KojiError> {
        self.vm.resume().map_err(KojiError::from)
    }

    /// Disassembly of the loaded program, if one is loaded.
    pub fn disassemble_loaded(&self) -> Option<String> {
        self.vm.loaded_proto().map(|p| unsafe { (*p).dump() })
    }

    // ------------------------------------------------------------------
    // value stack
    // ------------------------------------------------------------------

    /// Number of values on the value stack.
    pub fn stack_len(&self) -> usize {
        self.vm.stack_len()
    }

    pub fn push_nil(&mut self) {
        self.vm.push(Value::nil());
    }

    pub fn push_bool(&mut self, b: bool) {
        self.vm.push(Value::boolean(b));
    }

    pub fn push_number(&mut self, n: f64) {
        self.vm.push(Value::number(n));
    }

    pub fn push_str(&mut self, s: &str) -> Result<(), KojiError> {
        self.vm.push_string(s.as_bytes()).map_err(KojiError::from)
    }

    pub fn pop(&mut self, n: usize) {
        self.vm.pop(n);
    }

    /// Type of the value at `offset` from the top (`-1` is the top).
    pub fn value_type(&self, offset: i32) -> Option<KojiType> {
        let val = self.vm.top(offset)?;
        Some(if val.is_nil() {
            KojiType::Nil
        } else if val.is_boolean() {
            KojiType::Bool
        } else if val.is_number() {
            KojiType::Number
        } else if value_as_str(val, self.vm.cls_string).is_some() {
            KojiType::String
        } else if value_as_table(val, self.vm.cls_table).is_some() {
            KojiType::Table
        } else if value_as_closure(val, self.vm.cls_closure).is_some() {
            KojiType::Closure
        } else {
            return None;
        })
    }

    /// Numeric view of the value at `offset`: numbers themselves, booleans
    /// as 0/1.
    pub fn to_number(&self, offset: i32) -> Option<f64> {
        let val = self.vm.top(offset)?;
        if val.is_number() {
            Some(val.as_number())
        } else if val.is_boolean() {
            Some(val.as_boolean() as i32 as f64)
        } else {
            None
        }
    }

    /// The string content at `offset`, if the value is a string.
    pub fn str_at(&self, offset: i32) -> Option<&str> {
        let val = self.vm.top(offset)?;
        let s = value_as_str(val, self.vm.cls_string)?;
        std::str::from_utf8(unsafe { Str::bytes(s) }).ok()
    }

    /// The string length at `offset`, if the value is a string.
    pub fn str_len(&self, offset: i32) -> Option<usize> {
        let val = self.vm.top(offset)?;
        let s = value_as_str(val, self.vm.cls_string)?;
        Some(unsafe { (*s).len } as usize)
    }

    /// Pops the top of the stack into `globals[name]`.
    pub fn set_global(&mut self, name: &str) -> Result<(), KojiError> {
        self.vm.set_global(name).map_err(KojiError::from)
    }
}

impl Default for Koji {
    fn default() -> Koji {
        Koji::new()
    }
}

impl From<VmError> for KojiError {
    fn from(err: VmError) -> KojiError {
        if err.is_out_of_memory() {
            KojiError::OutOfMemory
        } else {
            KojiError::Runtime(err.message().to_string())
        }
    }
}
