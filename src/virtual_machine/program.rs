//! Bytecode program loading.
//!
//! A [`Program`] owns the raw instruction stream the VM executes. The byte
//! stream is headerless: no magic, no version, no length field. Byte 0 is the
//! first opcode, so validation is limited to what the engine relies on: the
//! stream fits the size cap, and a file loaded from disk is not empty.

use std::fs;
use std::path::Path;

use crate::virtual_machine::errors::VMError;

/// Largest bytecode stream the loader accepts, in bytes.
pub const MAX_PROGRAM_SIZE: usize = 4096;

/// A loaded bytecode program.
#[derive(Debug, Clone)]
pub struct Program {
    /// Raw instruction stream.
    pub bytecode: Vec<u8>,
}

impl Program {
    /// Wraps an in-memory instruction stream, enforcing the size cap.
    pub fn new(bytecode: Vec<u8>) -> Result<Self, VMError> {
        if bytecode.len() > MAX_PROGRAM_SIZE {
            return Err(VMError::ProgramTooLarge {
                size: bytecode.len(),
                max: MAX_PROGRAM_SIZE,
            });
        }

        Ok(Self { bytecode })
    }

    /// Reads a bytecode file from disk.
    ///
    /// Rejects files that cannot be read, exceed the size cap, or contain no
    /// bytes at all.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, VMError> {
        let path = path.as_ref();
        let bytecode = fs::read(path).map_err(|e| VMError::IoError {
            path: path.display().to_string(),
            source: e.to_string(),
        })?;

        if bytecode.len() > MAX_PROGRAM_SIZE {
            return Err(VMError::ProgramTooLarge {
                size: bytecode.len(),
                max: MAX_PROGRAM_SIZE,
            });
        }

        if bytecode.is_empty() {
            return Err(VMError::EmptyProgram);
        }

        Ok(Self { bytecode })
    }

    /// Program length in bytes.
    pub fn len(&self) -> usize {
        self.bytecode.len()
    }

    /// True when the program holds no instructions.
    pub fn is_empty(&self) -> bool {
        self.bytecode.is_empty()
    }
}
