// File: src/repl.rs
//
// Interactive REPL. One `Vm` persists for the session so globals, classes,
// and closures defined on one line stay visible to the next. Compile and
// runtime errors are printed but never end the session; only EOF (Ctrl-D)
// or `:quit` does.

use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::vm::{InterpretError, Vm};

pub fn run() -> rustyline::Result<()> {
    println!("{}", "rulox".bold());
    println!("Type an expression or statement, :quit to exit.");

    let mut editor = DefaultEditor::new()?;
    let mut vm = Vm::new();

    loop {
        match editor.readline("> ") {
            Ok(line) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if trimmed == ":quit" {
                    break;
                }
                let _ = editor.add_history_entry(trimmed);

                match vm.interpret(trimmed) {
                    Ok(()) => {}
                    Err(InterpretError::Compile(_)) => {}
                    Err(InterpretError::Runtime(err)) => eprint!("{}", err),
                }
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(err) => return Err(err),
        }
    }

    Ok(())
}
