//! Part planning for multipart uploads
//!
//! A payload of `total_size` bytes is cut into `ceil(total_size / part_size)`
//! contiguous parts numbered from 1. Every part is `part_size` bytes long
//! except the last, which holds the remainder.

use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Byte range of one part of the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartDescriptor {
    /// 1-based, contiguous
    pub part_number: u32,
    pub offset: u64,
    pub length: u64,
}

impl PartDescriptor {
    /// Byte range of this part within the payload
    pub fn range(&self) -> Range<u64> {
        self.offset..self.offset + self.length
    }
}

/// Successful upload of a single part
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartResult {
    pub part_number: u32,
    /// Integrity token returned by the store
    pub etag: String,
    /// Number of `upload_part` calls it took, including the successful one
    pub attempts: u32,
    pub bytes: u64,
}

/// Part reference passed to the store when completing an upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

impl From<&PartResult> for CompletedPart {
    fn from(result: &PartResult) -> Self {
        CompletedPart {
            part_number: result.part_number,
            etag: result.etag.clone(),
        }
    }
}

/// Number of parts needed for `total_size` bytes
///
/// Returns 0 when either argument is 0.
pub fn part_count(total_size: u64, part_size: u64) -> u64 {
    if part_size == 0 {
        return 0;
    }
    total_size.div_ceil(part_size)
}

/// Split `total_size` bytes into parts of `part_size` bytes
///
/// Returns `None` if the part numbers would not fit in a `u32`.
pub fn plan_parts(total_size: u64, part_size: u64) -> Option<Vec<PartDescriptor>> {
    let count = u32::try_from(part_count(total_size, part_size)).ok()?;
    let parts = (0..count)
        .map(|idx| {
            let offset = u64::from(idx) * part_size;
            PartDescriptor {
                part_number: idx + 1,
                offset,
                length: part_size.min(total_size - offset),
            }
        })
        .collect();
    Some(parts)
}
