//! Bytecode interpreter CLI.
//!
//! Loads a compiled program and executes it until it halts.
//!
//! # Usage
//! ```text
//! picolin_vm [program.bin]
//! ```
//!
//! # Arguments
//! - `program.bin`: Bytecode file to execute (defaults to `program.bin`)
//!
//! # Exit status
//! Nonzero only when the program cannot be loaded. Runtime faults stop
//! execution and are reported, but the process still exits cleanly.

use picolin_vm::utils::log::SHOW_TIMESTAMP;
use picolin_vm::virtual_machine::host::StdHost;
use picolin_vm::virtual_machine::program::Program;
use picolin_vm::virtual_machine::vm::VM;
use picolin_vm::{error, info};
use std::env;
use std::process;
use std::sync::atomic::Ordering;

const DEFAULT_PROGRAM: &str = "program.bin";

fn main() {
    let args: Vec<String> = env::args().collect();

    let mut program_path: Option<&str> = None;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_usage(&args[0]);
                process::exit(0);
            }
            other if program_path.is_none() && !other.starts_with('-') => {
                program_path = Some(other);
                i += 1;
            }
            other => {
                error!("Unexpected argument: {}", other);
                print_usage(&args[0]);
                process::exit(1);
            }
        }
    }
    let program_path = program_path.unwrap_or(DEFAULT_PROGRAM);

    // Diagnostics interleave with program output, so keep them short.
    SHOW_TIMESTAMP.store(false, Ordering::Relaxed);

    let program = match Program::from_file(program_path) {
        Ok(program) => program,
        Err(e) => {
            error!("{e}");
            process::exit(1);
        }
    };

    let mut vm = VM::new(program);
    if let Err(e) = vm.run(&mut StdHost) {
        error!("{e}");
    }
}

const USAGE: &str = "\
Bytecode Interpreter

USAGE:
    {program} [program.bin]

ARGS:
    [program.bin]    Bytecode file to execute (defaults to program.bin)

OPTIONS:
    -h, --help       Print this help message

EXAMPLES:
    # Run the default program file
    {program}

    # Run a specific program
    {program} demos/dot.bin
";

fn print_usage(program: &str) {
    info!("{}", USAGE.replace("{program}", program));
}
