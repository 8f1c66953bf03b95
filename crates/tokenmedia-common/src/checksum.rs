//! Content checksums used to deduplicate artifact uploads

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::io::Read;

/// Object metadata key under which artifact checksums are stored
pub const CHECKSUM_METADATA_KEY: &str = "sha256";

/// Compute the hex SHA-256 of an in-memory body
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compute the hex SHA-256 of any readable source
pub fn sha256_reader<R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Compare two checksums, ignoring case
pub fn checksums_match(expected: &str, actual: &str) -> bool {
    expected.eq_ignore_ascii_case(actual)
}
