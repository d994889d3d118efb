use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use md5::Md5;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::types::Digests;
use crate::{DEFAULT_CHUNK_SIZE, IO_BUFFER_SIZE, TransferError};

// ---------------------------------------------------------------------------
// Content sources
// ---------------------------------------------------------------------------

/// A readable, seekable byte stream.
pub trait ReadSeek: Read + Seek + Send {}
impl<T: Read + Seek + Send> ReadSeek for T {}

/// Handle to upload content.
///
/// A source may be opened several times (hashing, then each upload attempt);
/// every `open` returns a stream positioned at offset 0.
pub trait ContentSource: Send + Sync {
    /// Display name, usually the file name.
    fn name(&self) -> &str;

    /// Total size in bytes.
    fn size(&self) -> std::io::Result<u64>;

    /// Opens a fresh stream over the content.
    fn open(&self) -> std::io::Result<Box<dyn ReadSeek>>;

    /// Local path backing this source, if any. Used to re-create the source
    /// after a restart.
    fn local_path(&self) -> Option<&Path> {
        None
    }
}

/// A content source backed by a local file.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    name: String,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        Self { path, name }
    }
}

impl ContentSource for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> std::io::Result<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    fn open(&self) -> std::io::Result<Box<dyn ReadSeek>> {
        Ok(Box::new(std::fs::File::open(&self.path)?))
    }

    fn local_path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

// ---------------------------------------------------------------------------
// Digest helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Computes MD5 and SHA-256 of a source in a single pass.
///
/// Blocking: call from `spawn_blocking`. `cancel` is polled once per
/// [`IO_BUFFER_SIZE`] read.
pub fn digest_source(
    source: &dyn ContentSource,
    cancel: &CancellationToken,
) -> Result<Digests, TransferError> {
    let mut reader = source.open()?;
    digest_reader(&mut reader, cancel)
}

/// Computes MD5 and SHA-256 of a file on disk.
pub fn digest_file(path: &Path) -> Result<Digests, TransferError> {
    let mut file = std::fs::File::open(path)?;
    digest_reader(&mut file, &CancellationToken::new())
}

fn digest_reader<R: Read + ?Sized>(
    reader: &mut R,
    cancel: &CancellationToken,
) -> Result<Digests, TransferError> {
    let mut md5 = Md5::new();
    let mut sha = Sha256::new();
    let mut buf = vec![0u8; IO_BUFFER_SIZE];
    loop {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        md5.update(&buf[..n]);
        sha.update(&buf[..n]);
    }
    Ok(Digests {
        md5: hex::encode(md5.finalize()),
        sha256: hex::encode(sha.finalize()),
    })
}

/// Verifies a file against a hex digest.
///
/// The algorithm is picked from the digest length: 32 hex chars is MD5,
/// 64 is SHA-256. Any other length is rejected as an invalid digest.
pub fn verify_digest(path: &Path, expected: &str) -> Result<(), TransferError> {
    let expected = expected.trim().to_ascii_lowercase();
    if expected.is_empty() {
        return Err(TransferError::EmptyDigest);
    }
    let digests = digest_file(path)?;
    let actual = match expected.len() {
        32 => digests.md5,
        64 => digests.sha256,
        _ => {
            return Err(TransferError::ChecksumMismatch {
                expected,
                actual: String::from("<unsupported digest length>"),
            });
        }
    };
    if actual != expected {
        return Err(TransferError::ChecksumMismatch { expected, actual });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// ChunkReader
// ---------------------------------------------------------------------------

/// A chunk of source data.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Byte offset within the source.
    pub offset: u64,
    /// Raw chunk data.
    pub data: Vec<u8>,
}

/// Reads a content source in fixed-size chunks.
pub struct ChunkReader {
    stream: Box<dyn ReadSeek>,
    chunk_size: usize,
    offset: u64,
    size: u64,
}

impl ChunkReader {
    /// Opens `source` for chunked reading.
    ///
    /// If `chunk_size` is 0, [`DEFAULT_CHUNK_SIZE`] is used.
    pub fn new(source: &dyn ContentSource, chunk_size: usize) -> Result<Self, TransferError> {
        let stream = source.open()?;
        let size = source.size()?;
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        Ok(Self {
            stream,
            chunk_size,
            offset: 0,
            size,
        })
    }

    /// Seeks to the given byte offset (for resume).
    pub fn seek_to(&mut self, offset: u64) -> Result<(), TransferError> {
        self.stream.seek(SeekFrom::Start(offset))?;
        self.offset = offset;
        Ok(())
    }

    /// Reads the next chunk. Returns `None` at EOF.
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>, TransferError> {
        let remaining = self.remaining();
        if remaining == 0 {
            return Ok(None);
        }

        let read_size = remaining.min(self.chunk_size as u64) as usize;
        let mut buf = vec![0u8; read_size];
        let mut filled = 0;
        while filled < read_size {
            let n = self.stream.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(None);
        }
        buf.truncate(filled);

        let chunk = Chunk {
            offset: self.offset,
            data: buf,
        };
        self.offset += filled as u64;
        Ok(Some(chunk))
    }

    /// Current byte offset.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Total source size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bytes remaining to read.
    pub fn remaining(&self) -> u64 {
        self.size.saturating_sub(self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn create_test_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(data).unwrap();
        path
    }

    #[test]
    fn checksum_bytes_deterministic() {
        let c1 = checksum_bytes(b"hello world");
        let c2 = checksum_bytes(b"hello world");
        assert_eq!(c1, c2);
        assert_eq!(c1.len(), 64);
    }

    #[test]
    fn digest_source_known_vectors() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "abc.txt", b"abc");
        let d = digest_source(&FileSource::new(&path), &CancellationToken::new()).unwrap();
        assert_eq!(d.md5, "900150983cd24fb0d6963f7d28e17f72");
        assert_eq!(
            d.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn digest_spans_multiple_buffers() {
        let dir = TempDir::new().unwrap();
        let data = vec![0x5Au8; IO_BUFFER_SIZE * 3 + 17];
        let path = create_test_file(dir.path(), "big.bin", &data);
        let d = digest_file(&path).unwrap();
        assert_eq!(d.sha256, checksum_bytes(&data));
    }

    #[test]
    fn digest_honors_cancellation() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "x.bin", b"data");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = digest_source(&FileSource::new(&path), &cancel).unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));
    }

    #[test]
    fn verify_digest_picks_algorithm_by_length() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "abc.txt", b"abc");
        verify_digest(&path, "900150983cd24fb0d6963f7d28e17f72").unwrap();
        verify_digest(
            &path,
            "BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD",
        )
        .unwrap();
        assert!(matches!(
            verify_digest(&path, "00000000000000000000000000000000"),
            Err(TransferError::ChecksumMismatch { .. })
        ));
        assert!(matches!(
            verify_digest(&path, ""),
            Err(TransferError::EmptyDigest)
        ));
    }

    #[test]
    fn chunk_reader_reads_all() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "test.bin", b"AABBCCDDEE");

        let mut reader = ChunkReader::new(&FileSource::new(&path), 4).unwrap();
        assert_eq!(reader.size(), 10);

        let c1 = reader.next_chunk().unwrap().unwrap();
        assert_eq!(c1.offset, 0);
        assert_eq!(&c1.data, b"AABB");
        let c2 = reader.next_chunk().unwrap().unwrap();
        assert_eq!(c2.offset, 4);
        assert_eq!(&c2.data, b"CCDD");
        let c3 = reader.next_chunk().unwrap().unwrap();
        assert_eq!(c3.offset, 8);
        assert_eq!(&c3.data, b"EE");
        assert!(reader.next_chunk().unwrap().is_none());
    }

    #[test]
    fn chunk_reader_seek_and_resume() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "test.bin", b"0123456789");

        let mut reader = ChunkReader::new(&FileSource::new(&path), 4).unwrap();
        reader.seek_to(6).unwrap();
        assert_eq!(reader.remaining(), 4);

        let c = reader.next_chunk().unwrap().unwrap();
        assert_eq!(c.offset, 6);
        assert_eq!(&c.data, b"6789");
        assert!(reader.next_chunk().unwrap().is_none());
    }

    #[test]
    fn file_source_name_is_file_name() {
        let src = FileSource::new("/some/dir/photo.jpg");
        assert_eq!(src.name(), "photo.jpg");
        assert_eq!(src.local_path(), Some(Path::new("/some/dir/photo.jpg")));
    }
}
