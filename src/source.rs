//! Random-access payload sources
//!
//! Parts are fetched concurrently, so a source must hand out arbitrary byte
//! ranges on demand. Sequential-only streams cannot implement [`PartSource`].

use async_trait::async_trait;
use bytes::Bytes;
use std::io::{self, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Payload that can serve concurrent, non-overlapping range reads
#[async_trait]
pub trait PartSource: Send + Sync {
    /// Read exactly `range`
    ///
    /// Returns `UnexpectedEof` if the source ends before `range.end`.
    async fn read_range(&self, range: Range<u64>) -> io::Result<Bytes>;
}

#[async_trait]
impl PartSource for Bytes {
    async fn read_range(&self, range: Range<u64>) -> io::Result<Bytes> {
        let len = self.len() as u64;
        if range.end > len || range.start > range.end {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("range {:?} exceeds payload of {} bytes", range, len),
            ));
        }
        Ok(self.slice(range.start as usize..range.end as usize))
    }
}

/// File on disk, re-opened for every range read
///
/// Each read gets its own handle, so workers never contend on a shared
/// cursor.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    len: u64,
}

impl FileSource {
    /// Open `path` and record its current length
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let len = tokio::fs::metadata(&path).await?.len();
        Ok(FileSource { path, len })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Length observed when the source was opened
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[async_trait]
impl PartSource for FileSource {
    async fn read_range(&self, range: Range<u64>) -> io::Result<Bytes> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(range.start)).await?;

        let mut buf = vec![0u8; (range.end - range.start) as usize];
        // read_exact reports a truncated file as UnexpectedEof
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_bytes_source() {
        let source = Bytes::from_static(b"0123456789");
        assert_eq!(source.read_range(2..5).await.unwrap(), Bytes::from_static(b"234"));
        assert_eq!(source.read_range(0..10).await.unwrap().len(), 10);

        let err = source.read_range(8..12).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_file_source_ranges() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hello multipart world").unwrap();
        file.flush().unwrap();

        let source = FileSource::open(file.path()).await.unwrap();
        assert_eq!(source.len(), 21);

        let (a, b) = tokio::join!(source.read_range(0..5), source.read_range(6..15));
        assert_eq!(a.unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(b.unwrap(), Bytes::from_static(b"multipart"));
    }

    #[tokio::test]
    async fn test_file_source_truncated() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"short").unwrap();
        file.flush().unwrap();

        let source = FileSource::open(file.path()).await.unwrap();
        let err = source.read_range(0..100).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
