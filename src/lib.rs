// Library interface for the interpreter. Exposes the compiler/VM pipeline so
// integration tests (and embedders) can drive it without going through the
// CLI.

pub mod builtins;
pub mod bytecode;
pub mod compiler;
pub mod errors;
pub mod lexer;
pub mod object;
pub mod repl;
pub mod table;
pub mod value;
pub mod vm;

use errors::LoxError;
use vm::Vm;

/// Runs a complete program against a fresh `Vm` and reports any faults as
/// already-formatted `LoxError`s, in source order.
pub fn run_source(source: &str) -> Result<(), Vec<LoxError>> {
    let mut vm = Vm::new();
    vm.interpret(source).map_err(LoxError::from_interpret_error)
}
