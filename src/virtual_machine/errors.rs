use picolin_derive::Error;

use crate::types::encoding::DecodeError;

/// Errors that can occur during loading, execution, or assembly.
#[derive(Debug, Error)]
pub enum VMError {
    // =========================
    // Execution faults
    // =========================
    /// Unknown opcode encountered in bytecode.
    #[error("unknown opcode {opcode} at offset {offset}")]
    InvalidInstruction { opcode: u8, offset: usize },
    /// Bytecode ended in the middle of an operand.
    #[error("unexpected end of bytecode at offset {ip}: needed {requested} bytes, {available} available")]
    UnexpectedEndOfBytecode {
        ip: usize,
        requested: usize,
        available: usize,
    },
    /// Instruction pointer arithmetic overflowed.
    #[error("invalid instruction pointer at offset {ip}")]
    InvalidIP { ip: usize },
    /// Division with a zero divisor.
    #[error("division by zero")]
    DivisionByZero,
    /// Global variable index outside the slot table.
    #[error("invalid variable index {index}")]
    InvalidVariableIndex { index: i32 },
    /// VECTOR operand was zero, negative, or larger than the arena.
    #[error("invalid vector size {size}")]
    InvalidVectorSize { size: i32 },
    /// Vector arena has too few free slots for the requested allocation.
    #[error("out of vector memory: requested {requested} slots, {available} free")]
    OutOfMemory { requested: i32, available: usize },
    /// Vector descriptor table is full.
    #[error("too many vectors")]
    VectorTableFull,
    /// Fewer stacked values than the vector being built needs.
    #[error("not enough values on stack for vector: needed {needed}, have {available}")]
    StackExhausted { needed: i32, available: usize },
    /// Value used as a vector reference does not name a live vector.
    #[error("invalid vector reference {reference}")]
    InvalidVectorRef { reference: i32 },
    /// DOT applied to vectors of different sizes.
    #[error("vectors must have the same size for dot product (got {left} and {right})")]
    VectorSizeMismatch { left: i32, right: i32 },

    // =========================
    // Recoverable execution conditions
    // =========================
    /// PRINT on an empty stack.
    #[error("nothing to print")]
    NothingToPrint,
    /// INPUT could not read or parse a value.
    #[error("failed to read input")]
    InputFailed,
    /// SAVE_FILE could not persist the snapshot.
    #[error("cannot write memory snapshot: {reason}")]
    SnapshotWriteFailed { reason: String },
    /// LOAD_FILE could not read back a usable snapshot.
    #[error("cannot read memory snapshot: {reason}")]
    SnapshotReadFailed { reason: String },

    // =========================
    // Loader
    // =========================
    /// Bytecode file exceeds the loader's size cap.
    #[error("program too large ({size} bytes, max {max})")]
    ProgramTooLarge { size: usize, max: usize },
    /// Bytecode file contained no bytes.
    #[error("failed to read program: file is empty")]
    EmptyProgram,
    /// File I/O error while loading or assembling.
    #[error("io error on {path}: {source}")]
    IoError { path: String, source: String },
    /// Failed to decode a binary image.
    #[error("decoding error: {reason}")]
    DecodeError { reason: String },

    // =========================
    // Assembler
    // =========================
    /// Unrecognized instruction mnemonic during assembly.
    #[error("invalid instruction name: {name}")]
    InvalidInstructionName { name: String },
    /// Wrong number of operands for an instruction.
    #[error("{instruction} expects {expected} operand(s), got {actual}")]
    ArityMismatch {
        instruction: &'static str,
        expected: usize,
        actual: usize,
    },
    /// Operand token is neither a valid number nor a known label.
    #[error("invalid operand '{token}'")]
    InvalidOperand { token: String },
    /// Label defined more than once.
    #[error("duplicate label: {label}")]
    DuplicateLabel { label: String },
    /// Reference to undefined label.
    #[error("undefined label: {label}")]
    UndefinedLabel { label: String },
    /// Assembly error with source position context.
    #[error("line {line}, column {offset}: {source}")]
    AssemblyError {
        line: usize,
        offset: usize,
        source: String,
    },
}

impl VMError {
    /// True when the fault must unwind the execution loop.
    ///
    /// Recoverable conditions are reported and execution continues with a
    /// substitute effect already applied by the handler.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            VMError::NothingToPrint
                | VMError::InputFailed
                | VMError::SnapshotWriteFailed { .. }
                | VMError::SnapshotReadFailed { .. }
        )
    }
}

impl From<DecodeError> for VMError {
    fn from(err: DecodeError) -> Self {
        VMError::DecodeError {
            reason: err.to_string(),
        }
    }
}
