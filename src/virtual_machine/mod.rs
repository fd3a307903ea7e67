//! Stack-based bytecode virtual machine.
//!
//! The VM executes bytecode produced by the assembler. Every value is an
//! IEEE-754 double; instructions operate on an operand stack, a table of
//! global variables, and a vector arena that can be snapshotted to disk.
//!
//! # Architecture
//!
//! - **Operand stack**: up to [`vm::STACK_SIZE`] values; overflow and
//!   underflow are diagnosed without aborting execution
//! - **Globals**: [`vm::GLOBAL_SIZE`] indexed slots holding one value each
//! - **Vectors**: bump-allocated out of a fixed arena and addressed through a
//!   descriptor table; DOT computes dot products over them
//! - **Instruction format**: 1-byte opcodes with little-endian immediates
//! - **Persistence**: SAVE_FILE and LOAD_FILE move the whole vector state to
//!   and from a fixed-size snapshot
//!
//! # Modules
//!
//! - [`assembler`]: Assembly parsing, diagnostics, and bytecode generation
//! - [`errors`]: Assembly and execution error types
//! - [`host`]: Process-environment seam (console, randomness, snapshot I/O)
//! - [`isa`]: Instruction set definition and opcode mappings
//! - [`program`]: Loaded bytecode with its size cap
//! - [`snapshot`]: On-disk memory image format
//! - [`vm`]: Core virtual machine implementation

pub mod assembler;
pub mod errors;
pub mod host;
pub mod isa;
#[cfg(test)]
mod isa_static_check;
pub mod program;
pub mod snapshot;
pub mod vm;
