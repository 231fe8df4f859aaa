//! Per-file records and their completion handles.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::Result;
use crate::jobs::Complete;
use crate::stream::{ByteStream, OpenMode, ReduceStream};

const NO_WORKER: usize = usize::MAX;

/// Completion handle for a fetch or write job, carrying the entry's byte
/// stream once the job finishes.
pub struct PackWaitable {
    done: Mutex<bool>,
    cond: Condvar,
    stream: Mutex<Option<ByteStream>>,
    /// Loaned scratch stream parked here by a write job until the
    /// coordinator appends it and returns it to the free queue.
    scratch: Mutex<Option<ReduceStream>>,
    worker: AtomicUsize,
}

impl PackWaitable {
    /// A pending handle; a scheduled job will complete it.
    #[must_use]
    pub(crate) fn pending() -> Arc<Self> {
        Arc::new(PackWaitable {
            done: Mutex::new(false),
            cond: Condvar::new(),
            stream: Mutex::new(None),
            scratch: Mutex::new(None),
            worker: AtomicUsize::new(NO_WORKER),
        })
    }

    /// An already-complete handle carrying `stream`.
    #[must_use]
    pub(crate) fn ready(stream: Option<ByteStream>) -> Arc<Self> {
        let wt = Self::pending();
        *wt.stream.lock() = stream;
        *wt.done.lock() = true;
        wt
    }

    /// True once the associated job has finished (or none was needed).
    #[must_use]
    pub fn is_complete(&self) -> bool {
        *self.done.lock()
    }

    /// Block until the handle completes.
    pub fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cond.wait(&mut done);
        }
    }

    /// Block until the handle completes or `timeout` elapses; returns true
    /// if it completed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut done = self.done.lock();
        while !*done {
            if self.cond.wait_until(&mut done, deadline).timed_out() {
                return *done;
            }
        }
        true
    }

    /// Worker that processed the job, once one has been assigned.
    #[must_use]
    pub fn worker_id(&self) -> Option<usize> {
        match self.worker.load(Ordering::Acquire) {
            NO_WORKER => None,
            id => Some(id),
        }
    }

    pub(crate) fn set_worker_id(&self, id: usize) {
        self.worker.store(id, Ordering::Release);
    }

    pub(crate) fn attach_stream(&self, stream: ByteStream) {
        *self.stream.lock() = Some(stream);
    }

    pub(crate) fn has_stream(&self) -> bool {
        self.stream.lock().is_some()
    }

    /// Wait for completion, then move the byte stream out.
    #[must_use]
    pub fn take_stream(&self) -> Option<ByteStream> {
        self.wait();
        self.stream.lock().take()
    }

    /// Wait for completion, then run `f` on the attached byte stream.
    pub fn with_stream<R>(&self, f: impl FnOnce(&mut ByteStream) -> R) -> Option<R> {
        self.wait();
        self.stream.lock().as_mut().map(f)
    }

    pub(crate) fn take_stream_raw(&self) -> Option<ByteStream> {
        self.stream.lock().take()
    }

    pub(crate) fn attach_scratch(&self, scratch: ReduceStream) {
        *self.scratch.lock() = Some(scratch);
    }

    pub(crate) fn take_scratch(&self) -> Option<ReduceStream> {
        self.scratch.lock().take()
    }
}

impl Complete for PackWaitable {
    fn complete(&self) {
        *self.done.lock() = true;
        self.cond.notify_all();
    }
}

#[derive(Clone, Copy, Default)]
pub(crate) struct EntryMeta {
    pub member_id: u8,
    pub off: u32,
    pub compressed: u32,
    pub original: u32,
    /// Recorded in some member's itab.
    pub indexed: bool,
}

pub(crate) struct EntryState {
    pub meta: EntryMeta,
    pub active: bool,
    pub submitted: bool,
    pub waitable: Arc<PackWaitable>,
}

/// The in-memory record for one file known to the packager.
///
/// Entries are owned by their [`Packager`](crate::pack::Packager) and handed
/// out as `Arc`s; submission goes through the packager
/// ([`Packager::submit`](crate::pack::Packager::submit)), keyed by path.
pub struct PackEntry {
    path: String,
    pub(crate) state: Mutex<EntryState>,
}

impl PackEntry {
    pub(crate) fn new(path: String) -> Arc<Self> {
        Arc::new(PackEntry {
            path,
            state: Mutex::new(EntryState {
                meta: EntryMeta::default(),
                active: false,
                submitted: false,
                waitable: PackWaitable::ready(None),
            }),
        })
    }

    /// The entry's path: its key within the family, and the filesystem path
    /// a write job reads from when no stream was attached.
    #[must_use]
    pub fn filepath(&self) -> &str {
        &self.path
    }

    /// Compressed payload size of the last written/indexed revision.
    #[must_use]
    pub fn compressed_size(&self) -> u32 {
        self.state.lock().meta.compressed
    }

    /// Uncompressed size of the last written/indexed revision.
    #[must_use]
    pub fn original_size(&self) -> u32 {
        self.state.lock().meta.original
    }

    /// Member the entry is stored in (0 if never written).
    #[must_use]
    pub fn member_id(&self) -> u8 {
        self.state.lock().meta.member_id
    }

    /// Payload offset within the member file.
    #[must_use]
    pub fn offset(&self) -> u32 {
        self.state.lock().meta.off
    }

    /// True if the entry is recorded in some member's index.
    #[must_use]
    pub fn is_indexed(&self) -> bool {
        self.state.lock().meta.indexed
    }

    /// True while a live byte stream is associated with the entry.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// True while the entry is queued for the next write.
    #[must_use]
    pub fn is_submitted(&self) -> bool {
        self.state.lock().submitted
    }

    /// The entry's current completion handle.
    #[must_use]
    pub fn waitable(&self) -> Arc<PackWaitable> {
        Arc::clone(&self.state.lock().waitable)
    }

    /// Open the waitable's byte stream against the entry's filepath.
    ///
    /// Convenience for attaching a source file to an entry before
    /// submitting it; waits for any in-flight fetch first.
    ///
    /// # Errors
    /// Returns [`Error::Open`](crate::Error::Open) if the file cannot be
    /// opened.
    pub fn open(&self, mode: OpenMode) -> Result<()> {
        let waitable = self.waitable();
        waitable.wait();
        let stream = ByteStream::open_path(&self.path, mode)?;
        waitable.attach_stream(stream);
        Ok(())
    }

    /// Drop the entry's byte stream if it is active and unmodified.
    ///
    /// Returns true if the entry went inactive; an active stream with
    /// unwritten changes is left untouched. Index metadata survives.
    pub fn release(&self) -> bool {
        let waitable = {
            let state = self.state.lock();
            if !state.active {
                return true;
            }
            Arc::clone(&state.waitable)
        };
        // Wait outside the entry lock; a fetch may still be attaching.
        waitable.wait();
        let mut state = self.state.lock();
        let modified = waitable
            .with_stream(|s| s.is_modified())
            .unwrap_or(false);
        if modified {
            return false;
        }
        drop(waitable.take_stream_raw());
        state.active = false;
        true
    }
}

impl std::fmt::Debug for PackEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PackEntry")
            .field("path", &self.path)
            .field("member_id", &state.meta.member_id)
            .field("off", &state.meta.off)
            .field("compressed", &state.meta.compressed)
            .field("original", &state.meta.original)
            .field("indexed", &state.meta.indexed)
            .field("active", &state.active)
            .field("submitted", &state.submitted)
            .finish()
    }
}

/// Lightweight descriptor returned by
/// [`Packager::list`](crate::pack::Packager::list).
#[derive(Debug, Clone)]
pub struct EntryInfo {
    /// Entry path.
    pub path: String,
    /// Member storing the entry.
    pub member_id: u8,
    /// Payload offset within the member.
    pub off: u32,
    /// Compressed size.
    pub compressed_size: u32,
    /// Uncompressed size.
    pub original_size: u32,
}

impl From<&PackEntry> for EntryInfo {
    fn from(entry: &PackEntry) -> Self {
        let state = entry.state.lock();
        EntryInfo {
            path: entry.filepath().to_owned(),
            member_id: state.meta.member_id,
            off: state.meta.off,
            compressed_size: state.meta.compressed,
            original_size: state.meta.original,
        }
    }
}
