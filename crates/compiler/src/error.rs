//! Source locations and issue reporting.
//!
//! Issues are delivered to a caller-provided reporter callback as they are
//! found; a fatal issue additionally aborts the compilation by propagating a
//! [`CompileError`] up through every parse function, unwinding the partial
//! compilation in one hop.

use std::rc::Rc;

/// A position in a named source stream.
#[derive(Clone, Debug)]
pub struct SourceLoc {
    pub source_name: Rc<str>,
    pub line: i32,
    pub column: i32,
}

impl std::fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "at '{}' ({}:{})", self.source_name, self.line, self.column)
    }
}

/// Callback receiving each reported issue.
pub type Reporter<'a> = &'a mut dyn FnMut(&SourceLoc, &str);

/// Routes issues to the reporter and mints the fatal error value.
pub struct IssueHandler<'a> {
    reporter: Reporter<'a>,
}

impl<'a> IssueHandler<'a> {
    pub fn new(reporter: Reporter<'a>) -> IssueHandler<'a> {
        IssueHandler { reporter }
    }

    /// Reports an issue without aborting.
    pub fn report(&mut self, loc: &SourceLoc, message: &str) {
        let full = format!("{loc}: {message}");
        (self.reporter)(loc, &full);
    }

    /// Reports a fatal issue and returns the error that aborts compilation.
    pub fn error(&mut self, loc: &SourceLoc, message: impl AsRef<str>) -> CompileError {
        let full = format!("{loc}: {}", message.as_ref());
        (self.reporter)(loc, &full);
        CompileError { message: full }
    }
}

/// A fatal compilation error; the message has already been reported.
#[derive(Debug)]
pub struct CompileError {
    pub message: String,
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CompileError {}
