use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use thiserror::Error;

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum DigestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// BLAKE3 digest of a file's bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentDigest(pub [u8; 32]);

impl ContentDigest {
    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Computes content digests for exact duplicate detection
pub struct DigestEngine;

impl DigestEngine {
    pub fn new() -> Self {
        Self
    }

    /// Stream the file through BLAKE3 in fixed-size chunks
    pub fn digest_file(&self, file_path: &Path) -> Result<ContentDigest, DigestError> {
        let file = File::open(file_path)?;
        self.digest_reader(BufReader::new(file))
    }

    pub fn digest_reader<R: Read>(&self, mut reader: R) -> Result<ContentDigest, DigestError> {
        let mut hasher = blake3::Hasher::new();
        let mut buffer = vec![0u8; CHUNK_SIZE];

        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        Ok(ContentDigest(*hasher.finalize().as_bytes()))
    }

    /// Verify if two files have the same content digest
    pub fn identical_content(&self, file1: &Path, file2: &Path) -> Result<bool, DigestError> {
        Ok(self.digest_file(file1)? == self.digest_file(file2)?)
    }
}

impl Default for DigestEngine {
    fn default() -> Self {
        Self::new()
    }
}
