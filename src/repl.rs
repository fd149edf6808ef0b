// Interactive REPL for the language. Keeps one `Vm` alive across lines so
// globals, functions, and classes defined in earlier input are still visible
// later — mirrors CLox's `repl()` in `main.c`: read a line, treat it as a
// complete program, run it, repeat. No multi-line buffering: each line is
// compiled and executed on its own, exactly as typed.

use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::errors::LoxError;
use crate::vm::Vm;

pub struct Repl {
    vm: Vm,
    editor: DefaultEditor,
}

impl Repl {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let editor = DefaultEditor::new()?;
        Ok(Repl { vm: Vm::new(), editor })
    }

    fn show_banner(&self) {
        println!("{}", "╔══════════════════════════════════════════════════════╗".bright_cyan());
        println!("{}", "║               lox REPL - interactive shell           ║".bright_cyan());
        println!("{}", "╚══════════════════════════════════════════════════════╝".bright_cyan());
        println!();
        println!("  {} Use {}{}{}{}",
            "Welcome!".bright_green(),
            ":".bright_blue(),
            "help".bright_yellow(),
            " for commands or ".bright_blue(),
            ":quit".bright_yellow()
        );
        println!("  {} Each line is run as a complete program", "Tip:".bright_magenta());
        println!();
    }

    pub fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.show_banner();

        loop {
            let prompt = "> ".bright_green().to_string();

            match self.editor.readline(&prompt) {
                Ok(line) => {
                    let _ = self.editor.add_history_entry(line.as_str());

                    if line.trim().starts_with(':') {
                        if self.handle_command(line.trim()) {
                            continue;
                        } else {
                            break;
                        }
                    }

                    self.eval_input(&line);
                }
                Err(ReadlineError::Interrupted) => {
                    println!("{}", "^C (Ctrl+C to interrupt, :quit to exit)".bright_yellow());
                }
                Err(ReadlineError::Eof) => {
                    println!("{}", "\nGoodbye!".bright_cyan());
                    break;
                }
                Err(err) => {
                    eprintln!("{} {}", "Error:".bright_red(), err);
                    break;
                }
            }
        }

        Ok(())
    }

    /// Returns true to keep looping, false to quit.
    fn handle_command(&mut self, cmd: &str) -> bool {
        match cmd {
            ":help" | ":h" => {
                self.show_help();
                true
            }
            ":quit" | ":q" | ":exit" => {
                println!("{}", "Goodbye!".bright_cyan());
                false
            }
            ":clear" | ":c" => {
                print!("\x1B[2J\x1B[1;1H");
                self.show_banner();
                true
            }
            ":reset" | ":r" => {
                self.vm = Vm::new();
                println!("{}", "Environment reset".bright_green());
                true
            }
            _ => {
                println!(
                    "{} Unknown command: {}. Type {}{}{}",
                    "Error:".bright_red(),
                    cmd.bright_yellow(),
                    ":".bright_blue(),
                    "help".bright_yellow(),
                    " for available commands.".bright_blue()
                );
                true
            }
        }
    }

    fn show_help(&self) {
        println!();
        println!("{}", "REPL Commands:".bright_cyan().bold());
        println!();
        println!("  {}{}  Display this help message", ":help".bright_yellow(), " or :h   ".dimmed());
        println!("  {}{}  Exit the REPL", ":quit".bright_yellow(), " or :q   ".dimmed());
        println!("  {}{}  Clear the screen", ":clear".bright_yellow(), " or :c  ".dimmed());
        println!("  {}{}  Reset environment", ":reset".bright_yellow(), " or :r ".dimmed());
        println!();
        println!("  Each line you enter is compiled and run as its own complete");
        println!("  program, sharing globals/functions/classes with earlier lines.");
        println!();
    }

    fn eval_input(&mut self, line: &str) {
        if line.trim().is_empty() {
            return;
        }

        if let Err(err) = self.vm.interpret(line) {
            for err in LoxError::from_interpret_error(err) {
                self.print_error(&err);
            }
        }
    }

    fn print_error(&self, err: &LoxError) {
        print!("{}", err);
    }
}

impl Default for Repl {
    fn default() -> Self {
        Self::new().expect("failed to create REPL")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::Vm;

    #[test]
    fn each_line_runs_as_its_own_complete_program() {
        let mut vm = Vm::new();
        assert!(vm.interpret("var a = 1;").is_ok());
        assert!(vm.interpret("print a;").is_ok());
    }

    #[test]
    fn a_line_with_an_unclosed_brace_is_a_compile_error_not_a_continuation() {
        let mut vm = Vm::new();
        assert!(vm.interpret("fun f() {").is_err());
    }
}
