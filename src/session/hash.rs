//! Fragment hashing for resume negotiation
// (c) 2025 Ross Younger

use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context as _, Result};
use blake2::{Blake2b512, Digest};

/// Read granularity for hashing
const HASH_BUFLEN: usize = 8192;

/// Hashes the first `length` bytes of the file at `path`, returning the
/// digest as 128 lowercase hex characters.
///
/// This is BLAKE2b-512 exactly; both ends must agree on the algorithm for
/// resume to negotiate. A file shorter than `length` hashes as far as it
/// goes — the digest covers the bytes on disk at the time of the call.
pub fn file_prefix_hash(path: &Path, length: u64) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("error opening file {}", path.display()))?;
    let mut hasher = Blake2b512::new();
    let mut buf = [0u8; HASH_BUFLEN];
    let mut remaining = length;
    while remaining > 0 {
        #[allow(clippy::cast_possible_truncation)]
        let want = remaining.min(HASH_BUFLEN as u64) as usize;
        let n = file
            .read(&mut buf[..want])
            .with_context(|| format!("error reading file {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        remaining -= n as u64;
    }
    Ok(hex::encode(hasher.finalize()))
}
