//! Error types for `spak`

use std::path::PathBuf;

use lz4_flex::frame::Error as Lz4FrameError;
use thiserror::Error;

use crate::xml::XmlError;

/// The error type for `spak` operations.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
    // ==================== IO Errors ====================
    /// IO error from file operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A file could not be opened with the requested mode.
    #[error("cannot open {path} for {mode}")]
    Open {
        /// The path that failed to open.
        path: PathBuf,
        /// Human-readable open mode ("read", "append", ...).
        mode: &'static str,
    },

    // ==================== Stream Errors ====================
    /// The operation requires a memory-backed stream.
    #[error("stream is not in memory mode")]
    NotMemoryMode,

    /// The operation requires an open stream.
    #[error("stream is not open")]
    NotOpen,

    /// A reduce-stream operation was issued in the wrong state.
    #[error("reduce stream is {state}, operation needs {needs}")]
    ReduceState {
        /// Current state name.
        state: &'static str,
        /// Required state name.
        needs: &'static str,
    },

    /// LZ4 frame error.
    #[error("LZ4 frame error: {0}")]
    Lz4Frame(#[from] Lz4FrameError),

    // ==================== Pack Archive Errors ====================
    /// The file is not a valid SPK member (missing magic).
    #[error("invalid pack magic: expected SPK")]
    InvalidMagic,

    /// The member header carries an unsupported version.
    #[error("unsupported pack version: {major}.{minor} (supported: 2.0)")]
    UnsupportedVersion {
        /// Major version found in the header.
        major: u8,
        /// Minor version found in the header.
        minor: u8,
    },

    /// The index table at the end of a member could not be decoded.
    #[error("malformed index table: {0}")]
    MalformedItab(String),

    /// A single entry's compressed payload cannot fit in an empty member.
    #[error("entry too large for pack member: {path} ({size} bytes compressed, cap {cap})")]
    EntryTooLarge {
        /// Entry path.
        path: String,
        /// Compressed payload size plus its index footprint.
        size: u64,
        /// Configured per-member cap.
        cap: u64,
    },

    /// The family already uses every member id (0..=255).
    #[error("pack member limit reached (256 members)")]
    TooManyMembers,

    /// The requested file is not known to the pack family.
    #[error("file not found in pack: {0}")]
    FileNotFound(String),

    /// The packager has been closed.
    #[error("pack family is closed")]
    FamilyClosed,

    // ==================== Index Document Errors ====================
    /// Structured index document error.
    #[error("index document error: {0}")]
    IndexDoc(#[from] XmlError),

    // ==================== File System Errors ====================
    /// Invalid file path.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Directory traversal error.
    #[error("directory walk error: {0}")]
    WalkDir(String),
}

impl From<walkdir::Error> for Error {
    fn from(err: walkdir::Error) -> Self {
        Error::WalkDir(err.to_string())
    }
}

/// A specialized Result type for `spak` operations.
pub type Result<T> = std::result::Result<T, Error>;
