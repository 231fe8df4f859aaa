//! Pack family operations: the packager, entries, and the member format.

mod entry;
pub mod format;
mod packager;

pub use entry::{EntryInfo, PackEntry, PackWaitable};
pub use packager::{PackOptions, Packager, WriteProgress};
