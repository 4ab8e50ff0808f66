//! Repeating byte pattern used to check that transferred data arrived intact.

use crate::error::{Error, Result};
use crate::memory::MemoryProvider;
use tracing::{info, warn};

pub const SEED: usize = 10;
const REPORTED_MISMATCHES: usize = 10;

pub fn fill(buf: &mut [u8]) {
    for (i, b) in buf.iter_mut().enumerate() {
        *b = (i % SEED) as u8;
    }
}

pub fn validate(buf: &[u8]) -> Result<()> {
    validate_from(buf, 0)
}

/// Check `buf` as the slice of the pattern starting at stream byte `start`.
pub fn validate_from(buf: &[u8], start: u64) -> Result<()> {
    let phase = (start % SEED as u64) as usize;
    let mut mismatches = 0;
    let mut first = None;
    for (i, &b) in buf.iter().enumerate() {
        let expected = ((phase + i) % SEED) as u8;
        if b != expected {
            if mismatches < REPORTED_MISMATCHES {
                warn!(offset = i, expected, got = b, "Memory invalid");
            }
            first.get_or_insert(i);
            mismatches += 1;
        }
    }
    match first {
        None => {
            info!(bytes = buf.len(), "Validation passed");
            Ok(())
        }
        Some(first) => Err(Error::Validation { mismatches, first }),
    }
}

/// Write the pattern over the whole of `region`.
pub fn fill_region<M: MemoryProvider>(memory: &M, region: &mut M::Region) -> Result<()> {
    use crate::memory::Region;

    let mut buf = vec![0u8; region.len()];
    fill(&mut buf);
    memory.upload(region, 0, &buf)
}

/// Check the first `len` bytes of `region`, which hold the stream from byte
/// `start` onwards.
pub fn validate_region<M: MemoryProvider>(
    memory: &M,
    region: &M::Region,
    len: usize,
    start: u64,
) -> Result<()> {
    let mut buf = vec![0u8; len];
    memory.download(&mut buf, region, 0)?;
    validate_from(&buf, start)
}
