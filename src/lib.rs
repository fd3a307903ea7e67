//! Picolin virtual machine library.
//!
//! Provides a stack-based bytecode interpreter for the Picolin language, an
//! assembler producing its bytecode, and the binary snapshot format used to
//! persist vector memory between runs.

pub mod types;
pub mod utils;
pub mod virtual_machine;
