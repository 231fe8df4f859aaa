//! Seekable byte streams over memory buffers or files.
//!
//! [`ByteStream`] is the uniform I/O primitive the packager is built on: one
//! type that is either a growable in-memory buffer or an open file, with a
//! single read/write position and a modified flag. [`ReduceStream`] layers
//! the framed compression state machine on top.

mod reduce;

pub use reduce::{ReduceMode, ReduceState, ReduceStream};

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Stack buffer size for stream-to-stream copies.
pub const COPY_CHUNK: usize = 8192;

/// How to open a file-backed stream.
///
/// `Read`, `ReadWrite` and `ReadAppend` require the file to already exist;
/// the other modes create it if needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read only.
    Read,
    /// Write only, truncating any existing contents.
    Write,
    /// Read and write, preserving existing contents.
    ReadWrite,
    /// Read and write, truncating any existing contents.
    ReadWriteTruncate,
    /// Append only.
    Append,
    /// Read anywhere, writes go to the end.
    ReadAppend,
}

impl OpenMode {
    fn as_str(self) -> &'static str {
        match self {
            OpenMode::Read => "read",
            OpenMode::Write => "write",
            OpenMode::ReadWrite => "read/write",
            OpenMode::ReadWriteTruncate => "read/write (truncate)",
            OpenMode::Append => "append",
            OpenMode::ReadAppend => "read/append",
        }
    }

    fn options(self) -> OpenOptions {
        let mut opts = OpenOptions::new();
        match self {
            OpenMode::Read => {
                opts.read(true);
            }
            OpenMode::Write => {
                opts.write(true).create(true).truncate(true);
            }
            OpenMode::ReadWrite => {
                opts.read(true).write(true);
            }
            OpenMode::ReadWriteTruncate => {
                opts.read(true).write(true).create(true).truncate(true);
            }
            OpenMode::Append => {
                opts.append(true).create(true);
            }
            OpenMode::ReadAppend => {
                opts.read(true).append(true).create(true);
            }
        }
        opts
    }
}

enum Backing {
    /// Growable cursor over an owned buffer.
    Memory { data: Vec<u8>, pos: usize },
    /// Open file; the OS tracks the position.
    File { file: File, path: PathBuf },
}

/// A seekable stream owning either a memory buffer or an open file.
///
/// A default-constructed stream is an empty memory buffer. Opening a file
/// while a non-empty buffer is held flushes the buffer into the file first;
/// a stream never holds both backings.
///
/// Memory mode behaves like a growable cursor: writing past the end
/// zero-fills the gap, `SeekFrom::End(0)` reports the current size, and a
/// seek that would land before the start clamps to 0.
pub struct ByteStream {
    backing: Backing,
    modified: bool,
}

impl Default for ByteStream {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteStream {
    /// Create an empty memory-mode stream.
    #[must_use]
    pub fn new() -> Self {
        ByteStream {
            backing: Backing::Memory {
                data: Vec::new(),
                pos: 0,
            },
            modified: false,
        }
    }

    /// Create a memory-mode stream over an existing buffer, positioned at 0.
    #[must_use]
    pub fn from_vec(data: Vec<u8>) -> Self {
        ByteStream {
            backing: Backing::Memory { data, pos: 0 },
            modified: false,
        }
    }

    /// Open a file-backed stream.
    ///
    /// # Errors
    /// Returns [`Error::Open`] if the file cannot be opened with the
    /// requested mode (including the mode requiring a pre-existing file).
    pub fn open_path<P: AsRef<Path>>(path: P, mode: OpenMode) -> Result<Self> {
        let mut stream = Self::new();
        stream.open(path, mode)?;
        Ok(stream)
    }

    /// Switch this stream to a file backing.
    ///
    /// Any held memory buffer is written to the newly opened file before
    /// being freed, so at most one backing store exists at a time.
    ///
    /// # Errors
    /// Returns [`Error::Open`] if the open fails; the stream is left
    /// unchanged in that case.
    pub fn open<P: AsRef<Path>>(&mut self, path: P, mode: OpenMode) -> Result<()> {
        let path = path.as_ref();
        let mut file = mode.options().open(path).map_err(|_| Error::Open {
            path: path.to_path_buf(),
            mode: mode.as_str(),
        })?;

        if let Backing::Memory { data, .. } = &self.backing {
            if !data.is_empty() && mode != OpenMode::Read {
                file.write_all(data)?;
            }
        }

        self.backing = Backing::File {
            file,
            path: path.to_path_buf(),
        };
        Ok(())
    }

    /// Close the stream and reset it to the default (empty memory) state.
    pub fn close(&mut self) {
        self.backing = Backing::Memory {
            data: Vec::new(),
            pos: 0,
        };
        self.modified = false;
    }

    /// True if this stream is file-backed.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self.backing, Backing::File { .. })
    }

    /// True if this stream holds a memory buffer.
    #[must_use]
    pub fn is_memory(&self) -> bool {
        matches!(self.backing, Backing::Memory { .. })
    }

    /// True if the stream has been written to since the last
    /// [`reset_modified`](Self::reset_modified).
    #[must_use]
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Clear the modified flag.
    pub fn reset_modified(&mut self) {
        self.modified = false;
    }

    /// Path of the backing file, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::File { path, .. } => Some(path),
            Backing::Memory { .. } => None,
        }
    }

    /// Current size of the stream in bytes.
    ///
    /// # Errors
    /// Returns [`Error::Io`] if file metadata cannot be read.
    pub fn len(&self) -> Result<u64> {
        match &self.backing {
            Backing::Memory { data, .. } => Ok(data.len() as u64),
            Backing::File { file, .. } => Ok(file.metadata()?.len()),
        }
    }

    /// True if the stream holds no bytes.
    ///
    /// # Errors
    /// Returns [`Error::Io`] if file metadata cannot be read.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Current read/write position.
    ///
    /// # Errors
    /// Returns [`Error::Io`] if the file position cannot be queried.
    pub fn position(&mut self) -> Result<u64> {
        match &mut self.backing {
            Backing::Memory { pos, .. } => Ok(*pos as u64),
            Backing::File { file, .. } => Ok(file.stream_position()?),
        }
    }

    /// Borrow the memory buffer.
    #[must_use]
    pub fn data(&self) -> Option<&[u8]> {
        match &self.backing {
            Backing::Memory { data, .. } => Some(data),
            Backing::File { .. } => None,
        }
    }

    /// Grow the memory buffer's capacity to at least `n` bytes.
    ///
    /// # Errors
    /// Returns [`Error::NotMemoryMode`] on a file-backed stream.
    pub fn reserve(&mut self, n: usize) -> Result<()> {
        match &mut self.backing {
            Backing::Memory { data, .. } => {
                if n > data.capacity() {
                    data.reserve(n - data.len());
                }
                Ok(())
            }
            Backing::File { .. } => Err(Error::NotMemoryMode),
        }
    }

    /// Truncate the stream to `n` bytes and clamp the position.
    ///
    /// # Errors
    /// Returns [`Error::Io`] if the file cannot be truncated.
    pub fn truncate(&mut self, n: u64) -> Result<()> {
        match &mut self.backing {
            Backing::Memory { data, pos } => {
                data.truncate(n as usize);
                *pos = (*pos).min(data.len());
                Ok(())
            }
            Backing::File { file, .. } => {
                file.set_len(n)?;
                let here = file.stream_position()?;
                if here > n {
                    file.seek(SeekFrom::Start(n))?;
                }
                Ok(())
            }
        }
    }

    /// Move the memory buffer out, resetting the stream to its default
    /// state.
    ///
    /// # Errors
    /// Returns [`Error::NotMemoryMode`] on a file-backed stream.
    pub fn take_buffer(&mut self) -> Result<Vec<u8>> {
        match &mut self.backing {
            Backing::Memory { data, pos } => {
                let out = std::mem::take(data);
                *pos = 0;
                self.modified = false;
                Ok(out)
            }
            Backing::File { .. } => Err(Error::NotMemoryMode),
        }
    }

    /// Write `buf`, growing the memory buffer in `align`-sized steps.
    ///
    /// Rounding the growth up amortizes reallocation when many small writes
    /// land on the same stream. File-backed streams ignore `align`.
    ///
    /// # Errors
    /// Returns [`Error::Io`] on a file write failure.
    pub fn write_aligned(&mut self, buf: &[u8], align: usize) -> Result<()> {
        match &mut self.backing {
            Backing::Memory { data, pos } => {
                let end = *pos + buf.len();
                if end > data.len() {
                    if end > data.capacity() {
                        let align = align.max(1);
                        let want = end.div_ceil(align) * align;
                        data.reserve(want - data.len());
                    }
                    data.resize(end, 0);
                }
                data[*pos..end].copy_from_slice(buf);
                *pos = end;
            }
            Backing::File { file, .. } => {
                file.write_all(buf)?;
            }
        }
        if !buf.is_empty() {
            self.modified = true;
        }
        Ok(())
    }

    /// Pump up to `max` bytes from `src` into this stream.
    ///
    /// # Errors
    /// Returns [`Error::Io`] if either side fails.
    pub fn write_from<R: Read + ?Sized>(&mut self, src: &mut R, max: u64) -> Result<u64> {
        Ok(copy_limited(src, self, max)?)
    }

    /// Read the rest of the stream from the current position.
    ///
    /// # Errors
    /// Returns [`Error::Io`] on a read failure.
    pub fn read_remaining(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        Read::read_to_end(self, &mut out)?;
        Ok(out)
    }

    /// Flush buffered writes to the OS (no-op in memory mode).
    ///
    /// # Errors
    /// Returns [`Error::Io`] on a flush failure.
    pub fn flush(&mut self) -> Result<()> {
        if let Backing::File { file, .. } = &mut self.backing {
            file.flush()?;
        }
        Ok(())
    }
}

impl Read for ByteStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.backing {
            Backing::Memory { data, pos } => {
                let avail = data.len().saturating_sub(*pos);
                let n = avail.min(buf.len());
                buf[..n].copy_from_slice(&data[*pos..*pos + n]);
                *pos += n;
                Ok(n)
            }
            Backing::File { file, .. } => file.read(buf),
        }
    }
}

impl Write for ByteStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_aligned(buf, 1)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Backing::File { file, .. } = &mut self.backing {
            file.flush()?;
        }
        Ok(())
    }
}

impl Seek for ByteStream {
    fn seek(&mut self, whence: SeekFrom) -> io::Result<u64> {
        match &mut self.backing {
            Backing::Memory { data, pos } => {
                let base = match whence {
                    SeekFrom::Start(off) => off as i64,
                    SeekFrom::Current(delta) => *pos as i64 + delta,
                    SeekFrom::End(delta) => data.len() as i64 + delta,
                };
                // A target before the start clamps to 0.
                *pos = base.max(0) as usize;
                Ok(*pos as u64)
            }
            Backing::File { file, .. } => file.seek(whence),
        }
    }
}

impl std::fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.backing {
            Backing::Memory { data, pos } => f
                .debug_struct("ByteStream")
                .field("mode", &"memory")
                .field("len", &data.len())
                .field("pos", pos)
                .field("modified", &self.modified)
                .finish(),
            Backing::File { path, .. } => f
                .debug_struct("ByteStream")
                .field("mode", &"file")
                .field("path", path)
                .field("modified", &self.modified)
                .finish(),
        }
    }
}

/// Copy up to `max` bytes from `src` to `dst` through a fixed stack buffer.
///
/// Stops early when the source is exhausted. Returns the number of bytes
/// copied.
///
/// # Errors
/// Returns the underlying I/O error from either side.
pub fn copy_limited<R, W>(src: &mut R, dst: &mut W, max: u64) -> io::Result<u64>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut buf = [0u8; COPY_CHUNK];
    let mut copied: u64 = 0;
    while copied < max {
        let want = ((max - copied) as usize).min(COPY_CHUNK);
        let n = src.read(&mut buf[..want])?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n])?;
        copied += n as u64;
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_write_and_read_back() {
        let mut s = ByteStream::new();
        s.write_aligned(b"hello world", 1).unwrap();
        assert_eq!(s.len().unwrap(), 11);
        assert!(s.is_modified());

        s.seek(SeekFrom::Start(6)).unwrap();
        let mut buf = [0u8; 5];
        s.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"world");
    }

    #[test]
    fn memory_seek_end_reports_size() {
        let mut s = ByteStream::from_vec(vec![1, 2, 3, 4]);
        assert_eq!(s.seek(SeekFrom::End(0)).unwrap(), 4);
    }

    #[test]
    fn memory_seek_before_start_clamps() {
        let mut s = ByteStream::from_vec(vec![0; 8]);
        s.seek(SeekFrom::Start(4)).unwrap();
        assert_eq!(s.seek(SeekFrom::Current(-100)).unwrap(), 0);
    }

    #[test]
    fn memory_write_past_end_zero_fills() {
        let mut s = ByteStream::new();
        s.seek(SeekFrom::Start(4)).unwrap();
        s.write_aligned(b"x", 1).unwrap();
        assert_eq!(s.data().unwrap(), &[0, 0, 0, 0, b'x']);
    }

    #[test]
    fn aligned_growth_rounds_capacity() {
        let mut s = ByteStream::new();
        s.write_aligned(b"abc", 256).unwrap();
        assert!(s.data().unwrap().len() == 3);
        match &s.backing {
            Backing::Memory { data, .. } => assert!(data.capacity() >= 256),
            Backing::File { .. } => unreachable!(),
        }
    }

    #[test]
    fn take_buffer_resets_stream() {
        let mut s = ByteStream::new();
        s.write_aligned(b"payload", 1).unwrap();
        let buf = s.take_buffer().unwrap();
        assert_eq!(buf, b"payload");
        assert_eq!(s.len().unwrap(), 0);
        assert!(!s.is_modified());
    }

    #[test]
    fn file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.bin");

        let mut s = ByteStream::open_path(&path, OpenMode::ReadWriteTruncate).unwrap();
        assert!(s.is_open());
        s.write_aligned(b"0123456789", 1).unwrap();
        s.seek(SeekFrom::Start(2)).unwrap();
        let mut buf = [0u8; 3];
        s.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"234");
        assert_eq!(s.len().unwrap(), 10);
    }

    #[test]
    fn open_missing_file_for_read_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = ByteStream::open_path(dir.path().join("nope"), OpenMode::Read).unwrap_err();
        assert!(matches!(err, Error::Open { .. }));
    }

    #[test]
    fn open_flushes_memory_buffer_into_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spill.bin");

        let mut s = ByteStream::new();
        s.write_aligned(b"buffered", 1).unwrap();
        s.open(&path, OpenMode::ReadWriteTruncate).unwrap();
        assert!(s.is_open());
        assert!(s.data().is_none());

        s.seek(SeekFrom::Start(0)).unwrap();
        let mut out = Vec::new();
        Read::read_to_end(&mut s, &mut out).unwrap();
        assert_eq!(out, b"buffered");
    }

    #[test]
    fn copy_limited_respects_max() {
        let mut src = ByteStream::from_vec((0..100u8).collect());
        let mut dst = ByteStream::new();
        let n = copy_limited(&mut src, &mut dst, 10).unwrap();
        assert_eq!(n, 10);
        assert_eq!(dst.data().unwrap(), &(0..10u8).collect::<Vec<_>>()[..]);
    }

    #[test]
    fn copy_limited_stops_at_source_end() {
        let mut src = ByteStream::from_vec(vec![7; 20]);
        let mut dst = ByteStream::new();
        let n = copy_limited(&mut src, &mut dst, 1000).unwrap();
        assert_eq!(n, 20);
    }
}
