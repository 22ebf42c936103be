//! Streaming SHA-256 fingerprints.
//!
//! Every integrity decision in the pipeline (copy verification, dedup
//! grouping, verify-after-the-fact) runs through these helpers. Files are
//! streamed in fixed-size chunks; nothing is buffered whole.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use sha2::{Digest, Sha256};

/// Chunk size for streaming reads.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Hash a file, returning `(sha256_hex, size_bytes)`.
pub fn fingerprint_file(path: &Path) -> io::Result<(String, u64)> {
    let mut file = File::open(path)?;
    fingerprint_reader(&mut file)
}

/// Hash everything a reader yields, returning `(sha256_hex, size_bytes)`.
pub fn fingerprint_reader<R: Read>(reader: &mut R) -> io::Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }

    Ok((format!("{:x}", hasher.finalize()), total))
}

/// Hash a byte slice.
pub fn fingerprint_bytes(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Writer adapter that hashes bytes as they pass through, so a copy and its
/// source fingerprint come from a single read of the source.
pub struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Consume the writer, returning `(sha256_hex, bytes_written)`.
    pub fn finish(self) -> (String, u64) {
        (format!("{:x}", self.hasher.finalize()), self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // sha256("hello")
    const HELLO_SHA: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn fingerprints_known_content() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("hello.txt");
        std::fs::write(&path, b"hello").unwrap();

        let (sha, size) = fingerprint_file(&path).unwrap();
        assert_eq!(sha, HELLO_SHA);
        assert_eq!(size, 5);
    }

    #[test]
    fn empty_file_fingerprint() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("empty");
        std::fs::write(&path, b"").unwrap();

        let (sha, size) = fingerprint_file(&path).unwrap();
        assert_eq!(
            sha,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(size, 0);
    }

    #[test]
    fn hashing_writer_matches_direct_hash() {
        let mut sink = Vec::new();
        let mut writer = HashingWriter::new(&mut sink);
        writer.write_all(b"hel").unwrap();
        writer.write_all(b"lo").unwrap();
        let (sha, written) = writer.finish();

        assert_eq!(sha, HELLO_SHA);
        assert_eq!(written, 5);
        assert_eq!(sink, b"hello");
    }

    #[test]
    fn large_content_spans_chunks() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("big");
        let data = vec![7u8; CHUNK_SIZE * 3 + 17];
        std::fs::write(&path, &data).unwrap();

        let (sha, size) = fingerprint_file(&path).unwrap();
        assert_eq!(size, data.len() as u64);
        assert_eq!(sha, fingerprint_bytes(&data));
    }
}
