//! Naming rules and etag helpers shared by the bundled stores

use crate::error::{StoreError, StoreResult};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Validate S3 bucket name according to AWS rules
///
/// Rules:
/// - 3-63 characters
/// - Lowercase letters, numbers, dots, hyphens
/// - Must start and end with letter or number
/// - No consecutive dots
pub fn validate_bucket_name(name: &str) -> StoreResult<()> {
    if name.len() < 3 || name.len() > 63 {
        return Err(StoreError::InvalidRequest(format!(
            "Bucket name must be 3-63 characters, got {}",
            name.len()
        )));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-')
    {
        return Err(StoreError::InvalidRequest(
            "Bucket name must contain only lowercase letters, numbers, dots, and hyphens"
                .to_string(),
        ));
    }

    let starts_ok = name.starts_with(|c: char| c.is_ascii_alphanumeric());
    let ends_ok = name.ends_with(|c: char| c.is_ascii_alphanumeric());
    if !(starts_ok && ends_ok) {
        return Err(StoreError::InvalidRequest(
            "Bucket name must start and end with letter or number".to_string(),
        ));
    }

    if name.contains("..") {
        return Err(StoreError::InvalidRequest(
            "Bucket name cannot contain consecutive dots".to_string(),
        ));
    }

    Ok(())
}

/// Validate object key
///
/// Keys are UTF-8 strings up to 1024 bytes. Since the local store maps keys
/// onto paths, `.` and `..` segments, empty segments and a leading `/` are
/// rejected as well.
pub fn validate_key(key: &str) -> StoreResult<()> {
    if key.is_empty() {
        return Err(StoreError::InvalidRequest("Key cannot be empty".to_string()));
    }

    if key.len() > 1024 {
        return Err(StoreError::InvalidRequest(format!(
            "Key too long: {} bytes (max 1024)",
            key.len()
        )));
    }

    if key.contains('\0') || key.contains('\\') {
        return Err(StoreError::InvalidRequest(format!(
            "Key contains a forbidden character: {:?}",
            key
        )));
    }

    if key
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(StoreError::InvalidRequest(format!(
            "Key has an empty or relative path segment: {}",
            key
        )));
    }

    Ok(())
}

/// Convert bucket and key to a path under `root`
///
/// Example: "/data", "mybucket", "dir/file.txt" → "/data/mybucket/dir/file.txt"
pub fn key_to_path(root: &Path, bucket: &str, key: &str) -> PathBuf {
    let mut path = root.join(bucket);
    path.extend(key.split('/'));
    path
}

/// Compute the etag of a part or object: hex-encoded SHA-256 of its content
pub fn compute_etag(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
