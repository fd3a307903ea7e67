//! Instruction Set Architecture (ISA) definitions.
//!
//! Defines the VM's instruction set. The [`for_each_instruction!`](crate::for_each_instruction) macro holds
//! the canonical instruction definitions and invokes a callback macro for code
//! generation. This enables multiple modules to generate instruction-related
//! code without duplicating definitions.
//!
//! This module generates:
//! - The [`Instruction`] enum with opcode mappings
//! - `TryFrom<u8>` for decoding opcodes
//!
//! See [`assembler`](super::assembler) for assembly-related code generation
//! (`AsmInstr`, parsing, bytecode encoding).
//!
//! # Bytecode Format
//!
//! Instructions use variable-length encoding:
//! - Opcode: 1 byte
//! - Immediate f64: 8 bytes (little-endian IEEE-754)
//! - Immediate i32: 4 bytes (little-endian; variable index, vector size, or
//!   jump offset)
//!
//! Jump offsets are relative to the position immediately after the operand,
//! i.e. the start of the next instruction.

use crate::virtual_machine::errors::VMError;

/// Invokes a callback macro with the complete instruction definition list.
///
/// This macro enables code generation for instructions in multiple modules
/// without duplicating the instruction definitions.
#[macro_export]
macro_rules! for_each_instruction {
    ($callback:ident) => {
        $callback! {
            // =========================
            // Stack and arithmetic
            // =========================
            /// PUSH value ; pushes an f64 literal onto the stack
            Push = 0x00, "PUSH" => [value: ImmF64],
            /// ADD ; pops b, pops a, pushes a + b
            Add = 0x01, "ADD" => [],
            /// SUB ; pops b, pops a, pushes a - b
            Sub = 0x02, "SUB" => [],
            /// MUL ; pops b, pops a, pushes a * b
            Mul = 0x03, "MUL" => [],
            /// DIV ; pops b, pops a, pushes a / b (faults on b == 0)
            Div = 0x04, "DIV" => [],
            /// PRINT ; pops the top of stack and writes it to program output
            Print = 0x05, "PRINT" => [],
            // =========================
            // Global variables
            // =========================
            /// STORE index ; pops the top of stack into global slot index
            Store = 0x06, "STORE" => [index: ImmI32],
            /// LOAD index ; pushes the value of global slot index
            Load = 0x07, "LOAD" => [index: ImmI32],
            // =========================
            // Vectors
            // =========================
            /// VECTOR n ; pops n values into a fresh vector, pushes its reference
            Vector = 0x08, "VECTOR" => [size: ImmI32],
            /// DOT ; pops two vector references, pushes their dot product
            Dot = 0x09, "DOT" => [],
            /// RELU ; pops x, pushes x if positive, else 0
            Relu = 0x0A, "RELU" => [],
            // =========================
            // Comparisons
            // =========================
            /// GT ; pops b, pops a, pushes 1.0 if a > b else 0.0
            Gt = 0x0B, "GT" => [],
            /// LT ; pops b, pops a, pushes 1.0 if a < b else 0.0
            Lt = 0x0C, "LT" => [],
            /// EQ ; pops b, pops a, pushes 1.0 if a and b are within 1e-9
            Eq = 0x0D, "EQ" => [],
            // =========================
            // Control flow
            // =========================
            /// JUMP_IF_FALSE offset ; pops condition, jumps if it is 0.0
            JumpIfFalse = 0x0E, "JUMP_IF_FALSE" => [offset: ImmI32],
            /// JUMP offset ; unconditional relative jump
            Jump = 0x0F, "JUMP" => [offset: ImmI32],
            // =========================
            // External world
            // =========================
            /// RAND ; pushes a uniform random value in [0, 1)
            Rand = 0x10, "RAND" => [],
            /// INPUT ; prompts for and pushes one value from standard input
            Input = 0x11, "INPUT" => [],
            /// SAVE_FILE ; writes the memory snapshot to disk
            SaveFile = 0x12, "SAVE_FILE" => [],
            /// LOAD_FILE ; restores the memory snapshot from disk
            LoadFile = 0x13, "LOAD_FILE" => [],
            /// HALT ; stops execution
            Halt = 0x14, "HALT" => [],
        }
    };
}

#[macro_export]
macro_rules! define_instructions {
    (
        $(
            $(#[$doc:meta])*
            $name:ident = $opcode:expr, $mnemonic:literal => [
                $( $field:ident : $kind:ident ),* $(,)?
            ]
        ),* $(,)?
    ) => {
        // =========================
        // VM instruction enum
        // =========================
        #[derive(Copy, Clone, Debug, Eq, PartialEq)]
        pub enum Instruction {
            $(
                $(#[$doc])*
                $name = $opcode,
            )*
        }

        impl TryFrom<u8> for Instruction {
            type Error = VMError;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                match value {
                    $( $opcode => Ok(Instruction::$name), )*
                    _ => Err(VMError::InvalidInstruction {
                        opcode: value,
                        offset: 0,
                    }),
                }
            }
        }

        impl Instruction {
            /// Returns the assembly mnemonic for this instruction.
            pub const fn mnemonic(&self) -> &'static str {
                match self {
                    $( Instruction::$name => $mnemonic, )*
                }
            }
        }
    };

    // ---------- types ----------
    (@ty ImmF64) => { f64 };
    (@ty ImmI32) => { i32 };

    // ---------- encoding ----------
    (@emit $out:ident, ImmF64, $v:ident) => {
        $out.extend_from_slice(&$v.to_le_bytes());
    };

    (@emit $out:ident, ImmI32, $v:ident) => {
        $out.extend_from_slice(&$v.to_le_bytes());
    };
}

for_each_instruction!(define_instructions);
