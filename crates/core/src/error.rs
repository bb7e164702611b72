//! Runtime fault type.
//!
//! Every fallible runtime operation returns `Result<_, VmError>`; the fault
//! propagates with `?` out of the dispatch loop until the resume entry point
//! turns it into a public error code with the message pushed on the value
//! stack.

/// A runtime fault: an operator misuse, a bad call, an explicit `throw`, or
/// allocator exhaustion.
#[derive(Debug)]
pub struct VmError {
    message: String,
    out_of_memory: bool,
}

impl VmError {
    pub fn new(message: impl Into<String>) -> VmError {
        VmError {
            message: message.into(),
            out_of_memory: false,
        }
    }

    pub fn out_of_memory() -> VmError {
        VmError {
            message: "out of memory".to_string(),
            out_of_memory: true,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_out_of_memory(&self) -> bool {
        self.out_of_memory
    }
}

impl std::fmt::Display for VmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for VmError {}
