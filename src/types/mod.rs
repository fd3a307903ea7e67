//! Core type infrastructure for the VM.
//!
//! This module provides the serialization layer used by the memory snapshot:
//! - `encoding`: little-endian `Encode`/`Decode` traits and primitive impls

pub mod encoding;
