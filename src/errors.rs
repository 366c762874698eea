// File: src/errors.rs
//
// Structured error reporting for the two error tiers: compile errors and
// runtime errors. Compile errors are surfaced through the parser driver's
// own error path (see `parser.rs`), so this module's `CompileError` is
// mostly a marker that at least one was reported. `RuntimeError` carries
// the stack trace the VM prints on abort.

use colored::Colorize;
use std::fmt;

/// Emitted once `compile()` finishes with at least one parser error. The
/// parser driver has already printed each individual message to stderr by
/// the time this is constructed; it exists so callers can branch on
/// "compile failed" without re-parsing output.
#[derive(Debug, Clone)]
pub struct CompileError;

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "compilation failed")
    }
}

impl std::error::Error for CompileError {}

/// One entry of a runtime stack trace: the frame's function name (`script`
/// for the top-level frame) and the source line active when the error hit.
#[derive(Debug, Clone)]
pub struct TraceFrame {
    pub name: String,
    pub line: usize,
}

/// A runtime error with the call-stack snapshot needed to print a trace,
/// innermost frame first.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub message: String,
    pub frames: Vec<TraceFrame>,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>) -> Self {
        RuntimeError { message: message.into(), frames: Vec::new() }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.message.red().bold())?;
        for frame in &self.frames {
            writeln!(f, "[line {}] in {}", frame.line, frame.name)?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}
