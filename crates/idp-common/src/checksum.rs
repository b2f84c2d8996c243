//! Checksum utilities for staged payloads and stable record keys

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Compute the SHA-256 checksum of a file, hex-encoded
pub fn file_sha256(path: impl AsRef<Path>) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    reader_sha256(&mut file)
}

/// Compute the SHA-256 checksum of any readable source, hex-encoded
pub fn reader_sha256<R: Read>(reader: &mut R) -> Result<String> {
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

/// Compute the SHA-256 digest of an in-memory byte slice, hex-encoded
pub fn bytes_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_reader_sha256() {
        let data = b"hello world";
        let mut cursor = Cursor::new(data);
        let checksum = reader_sha256(&mut cursor).unwrap();
        assert_eq!(
            checksum,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_bytes_sha256_matches_reader() {
        let data = b"indicator data";
        let mut cursor = Cursor::new(data);
        assert_eq!(bytes_sha256(data), reader_sha256(&mut cursor).unwrap());
    }

    #[test]
    fn test_file_sha256() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.csv");
        std::fs::write(&path, b"hello world").unwrap();
        assert_eq!(
            file_sha256(&path).unwrap(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}
