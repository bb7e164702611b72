//! koji-compiler: source text to register bytecode, in one pass.
//!
//! The pipeline is lexer → recursive-descent parser → bytecode, with no AST
//! in between: the parser emits instructions directly into the prototype
//! under construction, folding constants and patching short-circuit jumps
//! as it goes.
//!
//! - `source`: the pull-style byte reader protocol
//! - `error`: source locations, issue reporting, the fatal compile error
//! - `lexer`: the token scanner
//! - `compiler`: the single-pass parser/emitter and its entry point,
//!   [`compiler::compile`]

pub mod compiler;
pub mod error;
pub mod lexer;
pub mod source;

pub use compiler::{compile, CompileInfo, NoStaticFns, StaticFnResolver, StaticFnSig};
pub use error::{CompileError, IssueHandler, Reporter, SourceLoc};
pub use lexer::{Lexer, Token};
pub use source::{FileSource, SourceReader, StrSource, SOURCE_EOF};
