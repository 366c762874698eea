// File: src/main.rs
//
// CLI entry point: `rulox [path]` runs a script file, `rulox` with no
// arguments drops into the REPL. Exit codes are mapped by hand (64 usage,
// 65 compile error, 70 runtime error, 74 file-read failure) rather than
// letting clap exit(2) on its own parse errors.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use colored::Colorize;

use rulox::vm::{InterpretError, Vm};

#[derive(Parser)]
#[command(name = "rulox", about = "A bytecode compiler and VM for a small scripting language")]
struct Cli {
    /// Path to a script file. Omit to start the REPL.
    path: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            use clap::error::ErrorKind;
            match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                    print!("{}", err);
                    return ExitCode::SUCCESS;
                }
                _ => {
                    eprintln!("Usage: rulox [path]");
                    return ExitCode::from(64);
                }
            }
        }
    };

    match cli.path {
        Some(path) => run_file(&path),
        None => run_repl(),
    }
}

fn run_file(path: &PathBuf) -> ExitCode {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("{} {}: {}", "Could not read file".red().bold(), path.display(), err);
            return ExitCode::from(74);
        }
    };

    let mut vm = Vm::new();
    match vm.interpret(&source) {
        Ok(()) => ExitCode::SUCCESS,
        Err(InterpretError::Compile(_)) => ExitCode::from(65),
        Err(InterpretError::Runtime(err)) => {
            eprint!("{}", err);
            ExitCode::from(70)
        }
    }
}

fn run_repl() -> ExitCode {
    match rulox::repl::run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {}", "REPL error:".red().bold(), err);
            ExitCode::from(74)
        }
    }
}
