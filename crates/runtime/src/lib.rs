//! koji-runtime: the virtual machine and the embedding surface.
//!
//! - `vm`: frame/value stacks, the dispatch loop, reference-count
//!   discipline, the host-function call seam
//! - `api`: the [`Koji`] state (open/load/run/push/pop/top)
//! - `stdlib`: the host functions the CLI registers (`print`, `len`,
//!   `set_metatable`, `get_metatable`)

pub mod api;
pub mod stdlib;
pub mod vm;

pub use api::{Koji, KojiError, KojiType};
pub use vm::{HostCall, HostFn, StaticFn, Vm};
