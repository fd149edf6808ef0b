// Entry point: dispatches to either `run <path>` or the interactive REPL,
// matching CLox's `main()` (argc == 1 -> repl, argc == 2 -> runFile, else
// usage error) with `clap` doing the argument parsing instead of hand-rolled
// argv inspection.

mod builtins;
mod bytecode;
mod compiler;
mod errors;
mod lexer;
mod object;
mod repl;
mod table;
mod value;
mod vm;

use clap::{Parser as ClapParser, Subcommand};
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use errors::LoxError;
use vm::{InterpretError, Vm};

#[derive(ClapParser)]
#[command(name = "lox", about = "A bytecode-compiled scripting language", version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script file
    Run {
        /// Path to the source file
        file: PathBuf,
    },
    /// Launch the interactive REPL
    Repl,
}

const EXIT_OK: u8 = 0;
const EXIT_COMPILE_ERROR: u8 = 65;
const EXIT_RUNTIME_ERROR: u8 = 70;
const EXIT_USAGE_ERROR: u8 = 64;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let command = match cli.command {
        Some(command) => command,
        None => Commands::Repl,
    };

    match command {
        Commands::Run { file } => run_file(&file),
        Commands::Repl => run_repl(),
    }
}

fn run_file(path: &PathBuf) -> ExitCode {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Error: could not read file '{}': {err}", path.display());
            return ExitCode::from(EXIT_USAGE_ERROR);
        }
    };

    let mut vm = Vm::new();
    match vm.interpret(&source) {
        Ok(()) => ExitCode::from(EXIT_OK),
        Err(err) => {
            let is_compile = matches!(err, InterpretError::Compile(_));
            for diagnostic in LoxError::from_interpret_error(err) {
                eprintln!("{diagnostic}");
            }
            ExitCode::from(if is_compile { EXIT_COMPILE_ERROR } else { EXIT_RUNTIME_ERROR })
        }
    }
}

fn run_repl() -> ExitCode {
    match repl::Repl::new() {
        Ok(mut repl) => match repl.run() {
            Ok(()) => ExitCode::from(EXIT_OK),
            Err(err) => {
                eprintln!("REPL error: {err}");
                ExitCode::from(EXIT_RUNTIME_ERROR)
            }
        },
        Err(err) => {
            eprintln!("Failed to start REPL: {err}");
            ExitCode::from(EXIT_RUNTIME_ERROR)
        }
    }
}
