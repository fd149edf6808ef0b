// Error rendering for the CLI layer. `Vm`/`compiler` never format anything
// themselves (they return `CompileError`/`RuntimeError` data); this module
// turns those into the colored, located diagnostics a user reads.

use colored::Colorize;
use std::fmt;

use crate::compiler::CompileError;
use crate::vm::{InterpretError, RuntimeError};

#[derive(Debug, Clone, PartialEq)]
pub enum ErrorKind {
    Compile,
    Runtime,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorKind::Compile => write!(f, "Compile Error"),
            ErrorKind::Runtime => write!(f, "Runtime Error"),
        }
    }
}

/// One reportable fault, already resolved to a source line and message.
#[derive(Debug, Clone)]
pub struct LoxError {
    pub kind: ErrorKind,
    pub message: String,
    pub line: usize,
    /// Innermost-first call trace, present only for runtime errors.
    pub trace: Vec<String>,
}

impl LoxError {
    pub fn from_compile_errors(errors: Vec<CompileError>) -> Vec<LoxError> {
        errors
            .into_iter()
            .map(|e| LoxError { kind: ErrorKind::Compile, message: e.message, line: e.line, trace: Vec::new() })
            .collect()
    }

    pub fn from_runtime_error(error: RuntimeError) -> LoxError {
        let line = error
            .trace
            .first()
            .and_then(|frame| frame.split(']').next())
            .and_then(|prefix| prefix.trim_start_matches("[line ").parse().ok())
            .unwrap_or(0);
        LoxError { kind: ErrorKind::Runtime, message: error.message, line, trace: error.trace }
    }

    pub fn from_interpret_error(error: InterpretError) -> Vec<LoxError> {
        match error {
            InterpretError::Compile(errors) => Self::from_compile_errors(errors),
            InterpretError::Runtime(e) => vec![Self::from_runtime_error(e)],
        }
    }
}

impl fmt::Display for LoxError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "{}: {}", format!("{}", self.kind).red().bold(), self.message.bold())?;
        writeln!(f, "{}", format!("  --> line {}", self.line).bright_blue())?;
        for frame in &self.trace {
            writeln!(f, "   {} {}", "=".bright_cyan(), frame.bright_cyan())?;
        }
        Ok(())
    }
}

impl std::error::Error for LoxError {}
