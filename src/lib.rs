//! spak - SPK asset pack families
//!
//! This crate bundles source files into one or more compressed archive
//! members sharing a basename (a *pack family*) and serves individual files
//! back without keeping whole archives resident. Members split
//! automatically when a configured size cap would be exceeded; payloads are
//! LZ4 frames appended by a parallel compress-ahead pipeline.
//!
//! ```no_run
//! use spak::pack::Packager;
//!
//! let pak = Packager::open("assets/world.spk")?;
//! let data = pak.read_file("models/tree.bin")?;
//! # let _ = data;
//! # Ok::<(), spak::Error>(())
//! ```

pub mod error;
pub mod jobs;
pub mod pack;
pub mod stream;
pub mod xml;

// Re-exports for convenience
pub use error::{Error, Result};

/// Prelude module for common imports
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::pack::{EntryInfo, PackEntry, PackOptions, Packager};
    pub use crate::stream::{ByteStream, OpenMode, ReduceMode, ReduceStream};
}

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
