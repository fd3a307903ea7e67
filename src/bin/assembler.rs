//! Assembly to bytecode compiler CLI.
//!
//! Reads assembly source files and compiles them to executable bytecode.
//!
//! # Usage
//! ```text
//! assembler <input.pasm> [OPTIONS]
//! ```
//!
//! # Arguments
//! - `input.pasm`: Assembly source file to compile
//!
//! # Options
//! - `-o, --output <file>`: Output file path (defaults to `<input>.bin`)
//! - `-r, --run`: Execute the program right after compiling it
//!
//! # Examples
//! ```text
//! assembler program.pasm
//! assembler program.pasm -o output.bin
//! assembler program.pasm -r
//! ```

use picolin_vm::utils::log::SHOW_TIMESTAMP;
use picolin_vm::virtual_machine::assembler::assemble_file;
use picolin_vm::virtual_machine::host::StdHost;
use picolin_vm::virtual_machine::vm::VM;
use picolin_vm::{error, info};
use std::env;
use std::fs;
use std::path::Path;
use std::process;
use std::sync::atomic::Ordering;

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        print_usage(&args[0]);
        process::exit(if args.len() < 2 { 1 } else { 0 });
    }

    let input_path = &args[1];
    let mut output_path: Option<String> = None;
    let mut run = false;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            k @ ("--output" | "-o") => {
                i += 1;
                if i >= args.len() {
                    error!("{k} requires an argument");
                    process::exit(1);
                }
                output_path = Some(args[i].clone());
                i += 1;
            }
            "--run" | "-r" => {
                run = true;
                i += 1;
            }
            other => {
                error!("Unexpected argument: {}\n", other);
                print_usage(&args[0]);
                process::exit(1);
            }
        }
    }

    if !Path::new(input_path).exists() {
        error!("Input file does not exist: {}", input_path);
        process::exit(1);
    }

    let output_path = output_path.unwrap_or_else(|| {
        Path::new(input_path)
            .with_extension("bin")
            .to_string_lossy()
            .into_owned()
    });

    if let Some(parent) = Path::new(&output_path).parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        error!("Output directory does not exist: {}", parent.display());
        process::exit(1);
    }

    let program = match assemble_file(input_path) {
        Ok(p) => p,
        Err(e) => {
            error!("Assembly failed: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = fs::write(&output_path, &program.bytecode) {
        error!("Failed to write output file: {}", e);
        process::exit(1);
    }

    info!(
        "Compiled {} -> {} ({} bytes)",
        input_path,
        output_path,
        program.len()
    );

    if run {
        // Diagnostics interleave with program output, so keep them short.
        SHOW_TIMESTAMP.store(false, Ordering::Relaxed);

        let mut vm = VM::new(program);
        if let Err(e) = vm.run(&mut StdHost) {
            error!("{e}");
            process::exit(1);
        }
    }
}

const USAGE: &str = "\
Assembly Compiler

USAGE:
    {program} <input.pasm> [OPTIONS]

ARGS:
    <input.pasm>    Assembly source file to compile

OPTIONS:
    -o, --output <file>    Output file path (defaults to <input>.bin)
    -r, --run              Execute the program right after compiling it
    -h, --help             Print this help message

EXAMPLES:
    # Compile to default output name
    {program} program.pasm

    # Compile with explicit output
    {program} program.pasm -o output.bin

    # Compile and run in one step
    {program} program.pasm -r
";

fn print_usage(program: &str) {
    info!("{}", USAGE.replace("{program}", program));
}
