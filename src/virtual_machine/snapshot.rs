//! Memory snapshot persistence.
//!
//! [`MemoryImage`] is the on-disk form of the vector subsystem: the two
//! allocation cursors, the arena, and the descriptor table, laid out as one
//! contiguous little-endian block. The field order of the struct *is* the
//! file format, so the codec derive produces the layout directly:
//!
//! 1. `next_memory_address` - i32
//! 2. `next_vector_index` - i32
//! 3. `memory` - `MEMORY_SIZE` f64 values
//! 4. `vectors` - `MAX_VECTORS` `{size: i32, address: i32}` records
//!
//! Decoding validates the invariants the engine relies on (cursors in range,
//! live descriptors inside the allocated arena) so a corrupt or foreign file
//! is rejected whole instead of poisoning the VM.

use picolin_derive::BinaryCodec;

use crate::types::encoding::{Decode, Encode};
use crate::virtual_machine::errors::VMError;

/// Vector arena capacity, in f64 slots.
pub const MEMORY_SIZE: usize = 1024;

/// Vector descriptor table capacity.
pub const MAX_VECTORS: usize = 128;

/// Fixed filename targeted by SAVE_FILE and LOAD_FILE.
pub const SNAPSHOT_FILE: &str = "memory.dump";

/// Exact encoded size of a snapshot: two i32 cursors, the arena, and the
/// descriptor table.
pub const SNAPSHOT_SIZE: usize = 8 + MEMORY_SIZE * 8 + MAX_VECTORS * 8;

/// Descriptor locating one vector inside the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinaryCodec)]
pub struct VectorSlot {
    /// Element count.
    pub size: i32,
    /// Arena offset of the first element.
    pub address: i32,
}

impl VectorSlot {
    /// An unallocated table entry.
    pub const EMPTY: VectorSlot = VectorSlot {
        size: 0,
        address: 0,
    };
}

/// Persisted image of the vector subsystem.
#[derive(Debug, Clone, PartialEq, BinaryCodec)]
pub struct MemoryImage {
    /// First free arena slot.
    pub next_memory_address: i32,
    /// First free descriptor table entry.
    pub next_vector_index: i32,
    /// Arena contents, allocated and free slots alike.
    pub memory: [f64; MEMORY_SIZE],
    /// Descriptor table, live entries first.
    pub vectors: [VectorSlot; MAX_VECTORS],
}

impl MemoryImage {
    /// Creates a zeroed image: empty arena, no vectors.
    pub fn new() -> Self {
        Self {
            next_memory_address: 0,
            next_vector_index: 0,
            memory: [0.0; MEMORY_SIZE],
            vectors: [VectorSlot::EMPTY; MAX_VECTORS],
        }
    }

    /// Serializes the image to its on-disk byte layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        Encode::to_bytes(self)
    }

    /// Deserializes an image, requiring the exact snapshot length and
    /// enforcing the cursor and descriptor bounds the engine relies on.
    pub fn from_bytes(mut input: &[u8]) -> Result<Self, VMError> {
        let image = MemoryImage::decode(&mut input)?;
        if !input.is_empty() {
            return Err(VMError::DecodeError {
                reason: "trailing bytes".to_string(),
            });
        }

        image.validate()?;
        Ok(image)
    }

    fn validate(&self) -> Result<(), VMError> {
        if self.next_memory_address < 0 || self.next_memory_address as usize > MEMORY_SIZE {
            return Err(VMError::DecodeError {
                reason: format!("memory cursor {} out of range", self.next_memory_address),
            });
        }

        if self.next_vector_index < 0 || self.next_vector_index as usize > MAX_VECTORS {
            return Err(VMError::DecodeError {
                reason: format!("vector cursor {} out of range", self.next_vector_index),
            });
        }

        for (index, slot) in self.vectors[..self.next_vector_index as usize]
            .iter()
            .enumerate()
        {
            let end = slot.address as i64 + slot.size as i64;
            if slot.size <= 0 || slot.address < 0 || end > self.next_memory_address as i64 {
                return Err(VMError::DecodeError {
                    reason: format!("descriptor {} out of range", index),
                });
            }
        }

        Ok(())
    }
}

impl Default for MemoryImage {
    fn default() -> Self {
        Self::new()
    }
}
