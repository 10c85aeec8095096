//! pull-based byte sources shared by the store, overlay and transport

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use xz2::read::XzDecoder;

use crate::error::{Error, IoResultExt, Result};

const COPY_BUFSZ: usize = 64 * 1024;

/// a pull-based byte source
///
/// each stream owns its underlying resource exclusively and releases it on
/// drop; wrappers own and release their inner stream.
pub trait ByteStream {
    /// read up to `buf.len()` bytes, returning the count (0 only at end)
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// true once the stream has no more bytes
    fn ended(&self) -> bool;

    /// total byte count when known, 0 when unknown
    fn size_hint(&self) -> u64;

    /// drain the stream into a vector
    fn read_all(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.size_hint() as usize);
        let mut buf = [0u8; COPY_BUFSZ];
        while !self.ended() {
            let n = self.read(&mut buf)?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        Ok(out)
    }

    /// drain the stream into a writer, returning bytes copied
    fn copy_to(&mut self, writer: &mut dyn Write) -> Result<u64> {
        let mut buf = [0u8; COPY_BUFSZ];
        let mut total = 0u64;
        while !self.ended() {
            let n = self.read(&mut buf)?;
            if n == 0 {
                break;
            }
            writer
                .write_all(&buf[..n])
                .with_path(PathBuf::from("<writer>"))?;
            total += n as u64;
        }
        Ok(total)
    }

    /// drain the stream into a new file; the partial file is removed on error
    fn copy_to_file(&mut self, path: &Path) -> Result<u64> {
        let mut file = File::create(path).with_path(path)?;
        match self.copy_to(&mut file) {
            Ok(n) => Ok(n),
            Err(e) => {
                drop(file);
                let _ = fs::remove_file(path);
                Err(e)
            }
        }
    }
}

/// stream over a slice of an open file descriptor
pub struct FdStream {
    file: File,
    left: u64,
    length: u64,
}

impl FdStream {
    /// seek to `offset` and serve at most `length` bytes
    pub fn new(mut file: File, offset: u64, length: u64) -> Result<Self> {
        file.seek(SeekFrom::Start(offset))
            .with_path(PathBuf::from("<fd>"))?;
        Ok(Self {
            file,
            left: length,
            length,
        })
    }
}

impl ByteStream for FdStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.left == 0 {
            return Ok(0);
        }
        let want = buf.len().min(self.left as usize);
        let n = self
            .file
            .read(&mut buf[..want])
            .with_path(PathBuf::from("<fd>"))?;
        self.left -= n as u64;
        Ok(n)
    }

    fn ended(&self) -> bool {
        self.left == 0
    }

    fn size_hint(&self) -> u64 {
        self.length
    }
}

/// stream over a whole file on disk
pub struct DiskStream {
    inner: FdStream,
}

impl DiskStream {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::PathNotFound(path.display().to_string())
            } else {
                Error::Io {
                    path: path.to_path_buf(),
                    source: e,
                }
            }
        })?;
        let length = file.metadata().with_path(path)?.len();
        Ok(Self {
            inner: FdStream::new(file, 0, length)?,
        })
    }
}

impl ByteStream for DiskStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.inner.read(buf)
    }

    fn ended(&self) -> bool {
        self.inner.ended()
    }

    fn size_hint(&self) -> u64 {
        self.inner.size_hint()
    }
}

/// stream over an in-memory buffer
pub struct MemStream {
    data: Vec<u8>,
    pos: usize,
}

impl MemStream {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }
}

impl ByteStream for MemStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = buf.len().min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn ended(&self) -> bool {
        self.pos == self.data.len()
    }

    fn size_hint(&self) -> u64 {
        self.data.len() as u64
    }
}

/// adapter so std decoders can pull from a boxed stream.
/// the inner stream's error is parked and re-surfaced by LzmaStream.
struct InnerRead {
    inner: Box<dyn ByteStream>,
    pending: Option<Error>,
}

impl Read for InnerRead {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.inner.read(buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                let kind = std::io::ErrorKind::Other;
                self.pending = Some(e);
                Err(std::io::Error::new(kind, "inner stream error"))
            }
        }
    }
}

/// LZMA-decoding wrapper around another stream
pub struct LzmaStream {
    decoder: XzDecoder<InnerRead>,
    size_hint: u64,
    done: bool,
}

impl LzmaStream {
    pub fn new(inner: Box<dyn ByteStream>, size_hint: u64) -> Self {
        Self {
            decoder: XzDecoder::new(InnerRead {
                inner,
                pending: None,
            }),
            size_hint,
            done: false,
        }
    }
}

impl ByteStream for LzmaStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.done {
            return Ok(0);
        }
        match self.decoder.read(buf) {
            Ok(0) => {
                self.done = true;
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) => {
                // a wrapper adopts the inner stream's error when present
                if let Some(inner) = self.decoder.get_mut().pending.take() {
                    return Err(inner);
                }
                Err(Error::Io {
                    path: PathBuf::from("<lzma>"),
                    source: e,
                })
            }
        }
    }

    fn ended(&self) -> bool {
        self.done
    }

    fn size_hint(&self) -> u64 {
        self.size_hint
    }
}

/// compress a payload with LZMA (xz container)
pub fn lzma_compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = xz2::read::XzEncoder::new(data, 6);
    let mut out = Vec::new();
    encoder
        .read_to_end(&mut out)
        .with_path(PathBuf::from("<lzma>"))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_mem_stream_read_all() {
        let mut s = MemStream::new(b"hello, world".to_vec());
        assert_eq!(s.size_hint(), 12);
        assert!(!s.ended());
        assert_eq!(s.read_all().unwrap(), b"hello, world");
        assert!(s.ended());
    }

    #[test]
    fn test_disk_stream() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data");
        fs::write(&path, b"stream content").unwrap();

        let mut s = DiskStream::open(&path).unwrap();
        assert_eq!(s.size_hint(), 14);
        assert_eq!(s.read_all().unwrap(), b"stream content");
    }

    #[test]
    fn test_disk_stream_missing() {
        let dir = tempdir().unwrap();
        let result = DiskStream::open(&dir.path().join("nope"));
        assert!(matches!(result, Err(Error::PathNotFound(_))));
    }

    #[test]
    fn test_fd_stream_window() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data");
        fs::write(&path, b"0123456789").unwrap();

        let file = File::open(&path).unwrap();
        let mut s = FdStream::new(file, 2, 5).unwrap();
        assert_eq!(s.read_all().unwrap(), b"23456");
        assert!(s.ended());
    }

    #[test]
    fn test_copy_to_file() {
        let dir = tempdir().unwrap();
        let dst = dir.path().join("out");

        let mut s = MemStream::new(b"copied bytes".to_vec());
        let n = s.copy_to_file(&dst).unwrap();

        assert_eq!(n, 12);
        assert_eq!(fs::read(&dst).unwrap(), b"copied bytes");
    }

    #[test]
    fn test_lzma_roundtrip() {
        let payload = b"compressible compressible compressible".repeat(64);
        let compressed = lzma_compress(&payload).unwrap();
        assert!(compressed.len() < payload.len());

        let inner = Box::new(MemStream::new(compressed));
        let mut s = LzmaStream::new(inner, payload.len() as u64);
        assert_eq!(s.size_hint(), payload.len() as u64);
        assert_eq!(s.read_all().unwrap(), payload);
        assert!(s.ended());
    }

    #[test]
    fn test_lzma_garbage_errors() {
        let inner = Box::new(MemStream::new(b"definitely not xz data".to_vec()));
        let mut s = LzmaStream::new(inner, 0);
        assert!(s.read_all().is_err());
    }
}
