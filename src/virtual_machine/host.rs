//! External-world interface for VM execution.
//!
//! The engine reaches the console, entropy, and snapshot storage only through
//! the [`Host`] trait, so execution stays testable without touching the
//! process environment. [`StdHost`] binds the trait to the real process:
//! stdout and stdin for program I/O, the operating system RNG for RAND, and
//! `memory.dump` on disk for snapshots.

use std::fs;
use std::io::{self, Read, Write};

use rand_core::{OsRng, RngCore};

use crate::virtual_machine::snapshot::SNAPSHOT_FILE;

/// External-world operations the engine depends on.
pub trait Host {
    /// Writes one line of program output.
    fn emit(&mut self, line: &str);
    /// Prompts for and reads one floating-point value, `None` on failure.
    fn read_value(&mut self) -> Option<f64>;
    /// Returns a uniform random value in [0, 1).
    fn random(&mut self) -> f64;
    /// Persists the snapshot bytes.
    fn write_snapshot(&mut self, bytes: &[u8]) -> io::Result<()>;
    /// Reads the snapshot bytes back.
    fn read_snapshot(&mut self) -> io::Result<Vec<u8>>;
}

/// Host backed by the process environment.
pub struct StdHost;

impl Host for StdHost {
    fn emit(&mut self, line: &str) {
        println!("{line}");
    }

    fn read_value(&mut self) -> Option<f64> {
        print!("? ");
        let _ = io::stdout().flush();

        next_token(io::stdin().lock())?.parse().ok()
    }

    fn random(&mut self) -> f64 {
        // 53 bits of entropy mapped onto [0, 1).
        (OsRng.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    fn write_snapshot(&mut self, bytes: &[u8]) -> io::Result<()> {
        fs::write(SNAPSHOT_FILE, bytes)
    }

    fn read_snapshot(&mut self) -> io::Result<Vec<u8>> {
        fs::read(SNAPSHOT_FILE)
    }
}

/// Reads the next whitespace-delimited token, skipping leading whitespace.
///
/// Entering `3.5 4.5` satisfies two consecutive reads; the leftover bytes
/// stay buffered in the locked reader for the next call.
fn next_token<R: Read>(input: R) -> Option<String> {
    let mut token = String::new();
    for byte in input.bytes() {
        let c = byte.ok()? as char;
        if c.is_ascii_whitespace() {
            if token.is_empty() {
                continue;
            }
            break;
        }
        token.push(c);
    }
    if token.is_empty() { None } else { Some(token) }
}
