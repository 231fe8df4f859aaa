//! Framed compression layered over [`ByteStream`].
//!
//! A [`ReduceStream`] is idle until [`begin`](ReduceStream::begin) switches
//! it into a compressing or decompressing segment; [`end`](ReduceStream::end)
//! closes the frame and returns the stream to raw passthrough. Frames are
//! LZ4 frame format with linked 256 KiB blocks and a content checksum, so
//! members store codec output verbatim.

use std::io::{self, Read, Write};
use std::path::Path;

use lz4_flex::frame::{BlockMode, BlockSize, FrameDecoder, FrameEncoder, FrameInfo};

use super::{copy_limited, ByteStream, OpenMode};
use crate::error::{Error, Result};

/// Which kind of segment [`ReduceStream::begin`] starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceMode {
    /// Compress caller data into the underlying stream.
    Compress,
    /// Decompress frame bytes read from the underlying stream.
    Decompress,
}

/// Observable state of a [`ReduceStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceState {
    /// Raw passthrough; reads and raw writes go straight to the stream.
    Idle,
    /// Inside a compression segment.
    Compressing,
    /// Inside a decompression segment.
    Decompressing,
}

impl ReduceState {
    fn as_str(self) -> &'static str {
        match self {
            ReduceState::Idle => "idle",
            ReduceState::Compressing => "compressing",
            ReduceState::Decompressing => "decompressing",
        }
    }
}

enum State {
    Idle(ByteStream),
    Compressing(Box<FrameEncoder<ByteStream>>),
    Decompressing(Box<FrameDecoder<ByteStream>>),
    /// Transient marker while swapping states; also the terminal state if a
    /// frame finish loses the inner stream.
    Poisoned,
}

fn frame_info() -> FrameInfo {
    FrameInfo::new()
        .block_size(BlockSize::Max256KB)
        .block_mode(BlockMode::Linked)
        .content_checksum(true)
}

/// A byte stream that can run framed compression or decompression on its
/// contents.
///
/// While a segment is active the inner stream is owned by the codec; `end`
/// recovers it. After a decompression segment the inner position may sit
/// past the frame end because the decoder reads ahead; seek before reusing
/// the raw stream.
pub struct ReduceStream {
    state: State,
}

impl Default for ReduceStream {
    fn default() -> Self {
        Self::new()
    }
}

impl ReduceStream {
    /// Create an idle reduce stream over an empty memory buffer.
    #[must_use]
    pub fn new() -> Self {
        ReduceStream {
            state: State::Idle(ByteStream::new()),
        }
    }

    /// Wrap an existing byte stream.
    #[must_use]
    pub fn with_stream(stream: ByteStream) -> Self {
        ReduceStream {
            state: State::Idle(stream),
        }
    }

    /// Open a file as the underlying stream. Idle only.
    ///
    /// # Errors
    /// Returns [`Error::ReduceState`] if a segment is active, or the open
    /// error from [`ByteStream::open`].
    pub fn open<P: AsRef<Path>>(&mut self, path: P, mode: OpenMode) -> Result<()> {
        self.stream()?.open(path, mode)
    }

    /// Current state of the segment machine.
    #[must_use]
    pub fn state(&self) -> ReduceState {
        match self.state {
            State::Idle(_) | State::Poisoned => ReduceState::Idle,
            State::Compressing(_) => ReduceState::Compressing,
            State::Decompressing(_) => ReduceState::Decompressing,
        }
    }

    fn state_err(&self, needs: &'static str) -> Error {
        let state = match self.state {
            State::Idle(_) => "idle",
            State::Compressing(_) => "compressing",
            State::Decompressing(_) => "decompressing",
            State::Poisoned => "poisoned",
        };
        Error::ReduceState { state, needs }
    }

    /// Start a compression or decompression segment.
    ///
    /// # Errors
    /// Returns [`Error::ReduceState`] unless the stream is idle.
    pub fn begin(&mut self, mode: ReduceMode) -> Result<()> {
        if !matches!(self.state, State::Idle(_)) {
            return Err(self.state_err(ReduceState::Idle.as_str()));
        }
        let State::Idle(stream) = std::mem::replace(&mut self.state, State::Poisoned) else {
            unreachable!()
        };
        self.state = match mode {
            ReduceMode::Compress => {
                State::Compressing(Box::new(FrameEncoder::with_frame_info(frame_info(), stream)))
            }
            ReduceMode::Decompress => State::Decompressing(Box::new(FrameDecoder::new(stream))),
        };
        Ok(())
    }

    /// Finish the active segment and return to idle.
    ///
    /// Compressing: emits the frame end mark and content checksum.
    /// Decompressing: drops the decode state.
    ///
    /// # Errors
    /// Returns [`Error::ReduceState`] if no segment is active, or
    /// [`Error::Lz4Frame`] if the frame cannot be finished.
    pub fn end(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, State::Poisoned) {
            State::Compressing(enc) => {
                let stream = enc.finish()?;
                self.state = State::Idle(stream);
                Ok(())
            }
            State::Decompressing(dec) => {
                self.state = State::Idle(dec.into_inner());
                Ok(())
            }
            State::Idle(stream) => {
                self.state = State::Idle(stream);
                Err(self.state_err("compressing or decompressing"))
            }
            State::Poisoned => Err(self.state_err("compressing or decompressing")),
        }
    }

    /// Close the stream, forcing `end` if a segment is active.
    ///
    /// # Errors
    /// Returns any error from finishing the frame.
    pub fn close(&mut self) -> Result<()> {
        if !matches!(self.state, State::Idle(_)) {
            self.end()?;
        }
        self.stream()?.close();
        Ok(())
    }

    /// Compress `buf` into the underlying stream.
    ///
    /// # Errors
    /// Returns [`Error::ReduceState`] unless compressing, or [`Error::Io`]
    /// from the sink.
    pub fn write(&mut self, buf: &[u8]) -> Result<()> {
        match &mut self.state {
            State::Compressing(enc) => {
                enc.write_all(buf)?;
                Ok(())
            }
            _ => Err(self.state_err(ReduceState::Compressing.as_str())),
        }
    }

    /// Read decompressed bytes from the active frame.
    ///
    /// Returns 0 at the end of the frame or when the source is exhausted.
    /// A decode failure recovers the underlying stream, returns the stream
    /// to idle, and surfaces the error.
    ///
    /// # Errors
    /// Returns [`Error::ReduceState`] unless decompressing, or the decode
    /// error.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match &mut self.state {
            State::Decompressing(dec) => match dec.read(buf) {
                Ok(n) => Ok(n),
                Err(e) => {
                    if let State::Decompressing(dec) =
                        std::mem::replace(&mut self.state, State::Poisoned)
                    {
                        self.state = State::Idle(dec.into_inner());
                    }
                    Err(e.into())
                }
            },
            _ => Err(self.state_err(ReduceState::Decompressing.as_str())),
        }
    }

    /// Append raw bytes, bypassing the codec. Idle only.
    ///
    /// Raw writes never land inside a frame, so a later
    /// `begin(Decompress)` at a recorded offset still parses correctly.
    ///
    /// # Errors
    /// Returns [`Error::ReduceState`] if a segment is active.
    pub fn write_uncompressed(&mut self, buf: &[u8]) -> Result<()> {
        self.stream_for("idle (raw write)")?.write_aligned(buf, 1)
    }

    /// Compress everything `src` yields, up to `max` bytes.
    ///
    /// # Errors
    /// Returns [`Error::ReduceState`] unless compressing, or the I/O error
    /// from either side.
    pub fn write_from<R: Read + ?Sized>(&mut self, src: &mut R, max: u64) -> Result<u64> {
        match &mut self.state {
            State::Compressing(enc) => Ok(copy_limited(src, enc.as_mut(), max)?),
            _ => Err(self.state_err(ReduceState::Compressing.as_str())),
        }
    }

    /// Borrow the underlying stream. Idle only.
    ///
    /// # Errors
    /// Returns [`Error::ReduceState`] if a segment is active.
    pub fn stream(&mut self) -> Result<&mut ByteStream> {
        self.stream_for(ReduceState::Idle.as_str())
    }

    fn stream_for(&mut self, needs: &'static str) -> Result<&mut ByteStream> {
        if !matches!(self.state, State::Idle(_)) {
            return Err(self.state_err(needs));
        }
        match &mut self.state {
            State::Idle(stream) => Ok(stream),
            _ => unreachable!(),
        }
    }

    /// Replace the underlying stream, returning the old one. Idle only.
    ///
    /// Codec state never carries across streams: segments always start
    /// fresh on `begin`.
    ///
    /// # Errors
    /// Returns [`Error::ReduceState`] if a segment is active.
    pub fn set_stream(&mut self, stream: ByteStream) -> Result<ByteStream> {
        let slot = self.stream()?;
        Ok(std::mem::replace(slot, stream))
    }

    /// Move the underlying stream out, leaving an empty one. Idle only.
    ///
    /// # Errors
    /// Returns [`Error::ReduceState`] if a segment is active.
    pub fn take_stream(&mut self) -> Result<ByteStream> {
        self.set_stream(ByteStream::new())
    }
}

impl Read for ReduceStream {
    /// Reads decompressed bytes; only valid while decompressing.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        ReduceStream::read(self, buf).map_err(|e| match e {
            Error::Io(io) => io,
            other => io::Error::new(io::ErrorKind::Other, other),
        })
    }
}

impl std::fmt::Debug for ReduceStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReduceStream")
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom};

    fn compress_into_memory(payload: &[u8]) -> ReduceStream {
        let mut rs = ReduceStream::new();
        rs.begin(ReduceMode::Compress).unwrap();
        rs.write(payload).unwrap();
        rs.end().unwrap();
        rs
    }

    #[test]
    fn compress_then_decompress_roundtrip() {
        let payload = b"the quick brown fox jumps over the lazy dog".repeat(64);
        let mut rs = compress_into_memory(&payload);

        rs.stream().unwrap().seek(SeekFrom::Start(0)).unwrap();
        rs.begin(ReduceMode::Decompress).unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 333];
        loop {
            let n = rs.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        rs.end().unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn multi_block_payload_roundtrip() {
        // Larger than one 256 KiB frame block.
        let payload: Vec<u8> = (0..700_000u32).map(|i| (i % 251) as u8).collect();
        let mut rs = compress_into_memory(&payload);

        rs.stream().unwrap().seek(SeekFrom::Start(0)).unwrap();
        rs.begin(ReduceMode::Decompress).unwrap();
        let mut out = Vec::new();
        io::copy(&mut rs, &mut out).unwrap();
        rs.end().unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn write_requires_compressing() {
        let mut rs = ReduceStream::new();
        assert!(matches!(
            rs.write(b"x"),
            Err(Error::ReduceState { .. })
        ));
    }

    #[test]
    fn read_requires_decompressing() {
        let mut rs = ReduceStream::new();
        let mut buf = [0u8; 4];
        assert!(matches!(
            ReduceStream::read(&mut rs, &mut buf),
            Err(Error::ReduceState { .. })
        ));
    }

    #[test]
    fn begin_twice_is_rejected() {
        let mut rs = ReduceStream::new();
        rs.begin(ReduceMode::Compress).unwrap();
        assert!(rs.begin(ReduceMode::Compress).is_err());
        rs.end().unwrap();
    }

    #[test]
    fn write_uncompressed_only_while_idle() {
        let mut rs = ReduceStream::new();
        rs.write_uncompressed(b"raw").unwrap();
        rs.begin(ReduceMode::Compress).unwrap();
        assert!(rs.write_uncompressed(b"raw").is_err());
        rs.end().unwrap();
    }

    #[test]
    fn raw_write_then_frame_preserves_boundary() {
        // A frame written after raw bytes decodes when the reader seeks to
        // the recorded frame start, and raw appends after `end` land at the
        // post-frame position.
        let mut rs = ReduceStream::new();
        rs.write_uncompressed(b"HDR!").unwrap();
        let frame_start = rs.stream().unwrap().position().unwrap();

        rs.begin(ReduceMode::Compress).unwrap();
        rs.write(b"framed payload").unwrap();
        rs.end().unwrap();

        let frame_end = rs.stream().unwrap().position().unwrap();
        assert!(frame_end > frame_start);
        rs.write_uncompressed(b"TAIL").unwrap();
        assert_eq!(
            rs.stream().unwrap().position().unwrap(),
            frame_end + 4,
            "raw append continues from the post-frame position"
        );

        rs.stream()
            .unwrap()
            .seek(SeekFrom::Start(frame_start))
            .unwrap();
        rs.begin(ReduceMode::Decompress).unwrap();
        let mut out = Vec::new();
        io::copy(&mut rs, &mut out).unwrap();
        rs.end().unwrap();
        assert_eq!(out, b"framed payload");
    }

    #[test]
    fn garbage_frame_reports_error_and_recovers() {
        let mut rs = ReduceStream::with_stream(ByteStream::from_vec(vec![0xAA; 64]));
        rs.begin(ReduceMode::Decompress).unwrap();
        let mut buf = [0u8; 16];
        assert!(ReduceStream::read(&mut rs, &mut buf).is_err());
        // The inner stream was recovered; the machine is idle again.
        assert_eq!(rs.state(), ReduceState::Idle);
        assert!(rs.stream().is_ok());
    }

    #[test]
    fn scratch_stream_swap() {
        let mut rs = compress_into_memory(b"first frame");
        let old = rs.set_stream(ByteStream::new()).unwrap();
        assert!(old.len().unwrap() > 0);

        rs.begin(ReduceMode::Compress).unwrap();
        rs.write(b"second frame").unwrap();
        rs.end().unwrap();

        rs.stream().unwrap().seek(SeekFrom::Start(0)).unwrap();
        rs.begin(ReduceMode::Decompress).unwrap();
        let mut out = Vec::new();
        io::copy(&mut rs, &mut out).unwrap();
        assert_eq!(out, b"second frame");
    }
}
