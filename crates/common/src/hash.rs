//! Content hash computation utilities.
//!
//! The remote store reports MD5 content hashes on object attributes, so end
//! to end validation recomputes MD5 over the reassembled local file.

use std::io::Read;
use std::path::Path;

/// Compute the MD5 hash of a byte slice.
///
/// # Arguments
/// * `data` - Bytes to hash
///
/// # Returns
/// 32-character lowercase hex string.
pub fn hash_bytes(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// Compute the MD5 hash of a file.
///
/// Reads the file in chunks to avoid loading the entire file into memory.
///
/// # Arguments
/// * `path` - Path to the file to hash
///
/// # Returns
/// 32-character lowercase hex string.
///
/// # Errors
/// Returns error if file cannot be read.
pub fn hash_file(path: &Path) -> Result<String, std::io::Error> {
    let mut file: std::fs::File = std::fs::File::open(path)?;
    let mut hasher: Md5Hasher = Md5Hasher::new();
    let mut buffer: Vec<u8> = vec![0u8; 64 * 1024]; // 64KB buffer

    loop {
        let bytes_read: usize = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finish_hex())
}

/// Streaming hasher for incremental MD5 hashing.
///
/// Use this when you need to hash data incrementally, such as while
/// reassembling a file from blocks.
pub struct Md5Hasher {
    inner: md5::Context,
}

impl Md5Hasher {
    /// Create a new streaming hasher.
    pub fn new() -> Self {
        Self {
            inner: md5::Context::new(),
        }
    }

    /// Update the hasher with additional data.
    ///
    /// # Arguments
    /// * `data` - Bytes to add to the hash computation
    pub fn update(&mut self, data: &[u8]) {
        self.inner.consume(data);
    }

    /// Finalize and return the hash as a 32-char hex string.
    pub fn finish_hex(self) -> String {
        format!("{:x}", self.inner.compute())
    }
}

impl Default for Md5Hasher {
    fn default() -> Self {
        Self::new()
    }
}
