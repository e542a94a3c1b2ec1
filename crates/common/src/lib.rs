//! Shared types and utilities for blobgate.
//!
//! This crate provides common functionality used across all blobgate crates:
//! - Path normalization utilities
//! - Content hash computation (MD5, matching the remote store's hashes)
//! - Shared constants and error types

pub mod constants;
pub mod error;
pub mod hash;
pub mod path_utils;

// Re-export commonly used items at crate root
pub use constants::*;
pub use error::PathError;
pub use hash::{hash_bytes, hash_file, Md5Hasher};
pub use path_utils::{from_posix_path, lexical_normalize, to_absolute, to_posix_path};
