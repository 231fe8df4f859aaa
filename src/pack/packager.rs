//! The packager: opens a pack family, serves entries, and drives the
//! parallel write pipeline.
//!
//! Writing is a compress-ahead pipeline: worker jobs compress submitted
//! entries into reusable scratch reduce streams while the calling thread
//! consumes finished buffers strictly in submission order, appending them to
//! the growing member and sealing/splitting members as the size cap demands.
//! Fetches decompress on workers too, gated by a per-member lock bit so one
//! member's reduce stream is never shared between jobs.

use std::collections::{HashMap, VecDeque};
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use byteorder::{LittleEndian, WriteBytesExt};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::entry::{EntryInfo, PackEntry, PackWaitable};
use super::format::{
    self, ItabRecord, MemberHeader, DEFAULT_PACK_CAP, HEADER_SIZE, ITAB_OFFSET_FIELD,
    ITAB_RECORD_BASE, MAX_MEMBER_ID,
};
use crate::error::{Error, Result};
use crate::jobs::{Complete, Job, JobWorker, LockBits, WorkerPool};
use crate::stream::{copy_limited, ByteStream, OpenMode, ReduceMode, ReduceState, ReduceStream};

/// How long the coordinator waits on a write job before logging a warning.
const WRITE_WAIT: Duration = Duration::from_secs(15);

/// Progress callback for [`Packager::write_with_progress`]: invoked once
/// per compressed entry with its submission index, before the append.
pub type WriteProgress<'a> = &'a dyn Fn(usize, &PackEntry);

/// Configuration for [`Packager::open_with`].
#[derive(Debug, Clone)]
pub struct PackOptions {
    /// Per-member size cap in bytes (header + payloads + index records).
    pub cap: u64,
    /// Worker thread count; 0 selects the detected logical-processor count.
    pub workers: usize,
}

impl Default for PackOptions {
    fn default() -> Self {
        PackOptions {
            cap: DEFAULT_PACK_CAP,
            workers: 0,
        }
    }
}

impl PackOptions {
    /// Override the per-member size cap.
    #[must_use]
    pub fn with_cap(mut self, cap: u64) -> Self {
        self.cap = cap;
        self
    }

    /// Override the worker thread count.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }
}

struct Inner {
    dir: PathBuf,
    base: String,
    ext: String,
    entries: HashMap<String, Arc<PackEntry>>,
    submissions: Vec<Arc<PackEntry>>,
    /// Shared per-member reduce streams for fetch jobs, opened lazily.
    members: HashMap<u8, Arc<Mutex<ReduceStream>>>,
    open: bool,
}

impl Inner {
    fn member_path(&self, mid: u8) -> PathBuf {
        if mid == 0 {
            self.dir.join(format!("{}{}", self.base, self.ext))
        } else {
            self.dir.join(format!("{}_{}{}", self.base, mid, self.ext))
        }
    }
}

/// Free queue of reusable scratch reduce streams loaned to write jobs.
struct ScratchPool {
    free: Mutex<Vec<ReduceStream>>,
    cond: Condvar,
}

impl ScratchPool {
    fn new(count: usize) -> Arc<Self> {
        Arc::new(ScratchPool {
            free: Mutex::new((0..count).map(|_| ReduceStream::new()).collect()),
            cond: Condvar::new(),
        })
    }

    fn acquire(&self) -> ReduceStream {
        let mut free = self.free.lock();
        loop {
            if let Some(scratch) = free.pop() {
                return scratch;
            }
            self.cond.wait(&mut free);
        }
    }

    fn release(&self, scratch: ReduceStream) {
        self.free.lock().push(scratch);
        self.cond.notify_one();
    }
}

/// Manages a pack family: a set of archive members sharing a basename.
///
/// ```no_run
/// use spak::pack::Packager;
///
/// let pak = Packager::open("assets/world.spk")?;
/// pak.open_file("models/tree.bin")?;
/// pak.submit("models/tree.bin")?;
/// pak.write()?;
/// # Ok::<(), spak::Error>(())
/// ```
pub struct Packager {
    inner: Mutex<Inner>,
    pool: WorkerPool,
    scratch: Arc<ScratchPool>,
    pending_fetches: Arc<AtomicUsize>,
    cap: u64,
}

impl Packager {
    /// Open a family with default options.
    ///
    /// # Errors
    /// See [`open_with`](Self::open_with).
    pub fn open<P: AsRef<Path>>(family: P) -> Result<Self> {
        Self::open_with(family, PackOptions::default())
    }

    /// Open (or create) the pack family rooted at `family`.
    ///
    /// `family` names member 0 (`dir/base.ext`; the extension defaults to
    /// `.spk`). Existing members are probed sequentially and their indices
    /// loaded; a malformed member is skipped with a warning and treated as
    /// absent, without invalidating entries from other members.
    ///
    /// # Errors
    /// Returns [`Error::InvalidPath`] if `family` has no basename, or
    /// [`Error::Io`] from reading member files.
    pub fn open_with<P: AsRef<Path>>(family: P, options: PackOptions) -> Result<Self> {
        let family = family.as_ref();
        let base = family
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::InvalidPath(family.display().to_string()))?
            .to_owned();
        let ext = match family.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!(".{ext}"),
            None => ".spk".to_owned(),
        };
        let dir = match family.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let pool = WorkerPool::new(options.workers);
        pool.start();
        pool.slow(true);

        let mut inner = Inner {
            dir,
            base,
            ext,
            entries: HashMap::new(),
            submissions: Vec::new(),
            members: HashMap::new(),
            open: true,
        };

        // Discover members by sequential probe, bounded by the id byte.
        for mid in 0..=u16::from(MAX_MEMBER_ID) {
            let mid = mid as u8;
            let path = inner.member_path(mid);
            if !path.exists() {
                break;
            }
            match Self::load_member(&mut inner, &path, mid) {
                Ok(count) => {
                    info!(member = mid, files = count, path = %path.display(), "loaded pack member");
                }
                Err(e) => {
                    warn!(member = mid, path = %path.display(), error = %e, "skipping unreadable pack member");
                }
            }
        }

        let workers = pool.worker_count();
        Ok(Packager {
            inner: Mutex::new(inner),
            pool,
            scratch: ScratchPool::new(workers),
            pending_fetches: Arc::new(AtomicUsize::new(0)),
            cap: options.cap.min(u64::from(u32::MAX)),
        })
    }

    fn load_member(inner: &mut Inner, path: &Path, mid: u8) -> Result<usize> {
        let mut stream = ByteStream::open_path(path, OpenMode::Read)?;
        let header = MemberHeader::read(&mut stream)?;
        if header.member_id != mid {
            return Err(Error::MalformedItab(format!(
                "member id {} does not match file position {mid}",
                header.member_id
            )));
        }
        if header.itab_offset == 0 {
            // Unsealed member (crash mid-write); recoverable as empty.
            debug!(member = mid, "member has no index; treating as empty");
            return Ok(0);
        }
        let size = stream.len()?;
        if u64::from(header.itab_offset) > size {
            return Err(Error::MalformedItab(format!(
                "index offset {} past end of file ({size})",
                header.itab_offset
            )));
        }
        stream.seek(SeekFrom::Start(u64::from(header.itab_offset)))?;
        let bytes = stream.read_remaining()?;
        let records = format::decode_itab(&bytes)?;

        for record in &records {
            if u64::from(record.off) + u64::from(record.compressed) > u64::from(header.itab_offset)
            {
                return Err(Error::MalformedItab(format!(
                    "record `{}` overruns the index",
                    record.path
                )));
            }
        }

        let count = records.len();
        for record in records {
            let entry = inner
                .entries
                .entry(record.path.clone())
                .or_insert_with(|| PackEntry::new(record.path.clone()));
            let mut state = entry.state.lock();
            // A later member wins: the pipeline writes newest data last.
            state.meta.member_id = mid;
            state.meta.off = record.off;
            state.meta.compressed = record.compressed;
            state.meta.original = record.original;
            state.meta.indexed = true;
        }
        Ok(count)
    }

    /// Number of worker threads backing this packager.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.pool.worker_count()
    }

    /// Configured per-member size cap.
    #[must_use]
    pub fn cap(&self) -> u64 {
        self.cap
    }

    /// Fetch jobs scheduled but not yet finished.
    #[must_use]
    pub fn pending_fetches(&self) -> usize {
        self.pending_fetches.load(Ordering::Acquire)
    }

    /// Look up an entry by path.
    #[must_use]
    pub fn entry(&self, path: &str) -> Option<Arc<PackEntry>> {
        self.inner.lock().entries.get(path).cloned()
    }

    /// True if the family knows `path`.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.inner.lock().entries.contains_key(path)
    }

    /// Snapshot of the entry table.
    #[must_use]
    pub fn entries(&self) -> Vec<Arc<PackEntry>> {
        self.inner.lock().entries.values().cloned().collect()
    }

    /// Descriptors for every indexed entry, ordered by (member, offset).
    #[must_use]
    pub fn list(&self) -> Vec<EntryInfo> {
        let inner = self.inner.lock();
        let mut out: Vec<EntryInfo> = inner
            .entries
            .values()
            .filter(|e| e.is_indexed())
            .map(|e| EntryInfo::from(&**e))
            .collect();
        out.sort_by(|a, b| (a.member_id, a.off).cmp(&(b.member_id, b.off)));
        out
    }

    /// Open one entry, activating it.
    ///
    /// An entry indexed in a member gets a fetch job that decompresses its
    /// payload into a fresh byte stream attached to the waitable; an
    /// unknown entry gets an empty stream and a completed waitable. An
    /// already-active entry is returned as-is.
    ///
    /// # Errors
    /// Returns [`Error::FamilyClosed`] after [`close`](Self::close), or the
    /// open error for the member file a fetch needs.
    pub fn open_file(&self, path: &str) -> Result<Arc<PackEntry>> {
        if path.is_empty() || path.len() > usize::from(u16::MAX) {
            return Err(Error::InvalidPath(path.to_owned()));
        }
        let mut inner = self.inner.lock();
        if !inner.open {
            return Err(Error::FamilyClosed);
        }
        let entry = inner
            .entries
            .entry(path.to_owned())
            .or_insert_with(|| PackEntry::new(path.to_owned()))
            .clone();

        let activation = {
            let mut state = entry.state.lock();
            if state.active {
                None
            } else {
                state.active = true;
                let waitable = PackWaitable::pending();
                state.waitable = Arc::clone(&waitable);
                Some((state.meta.indexed, waitable))
            }
        };
        let Some((fetch, waitable)) = activation else {
            // Already active: hand back the live entry.
            return Ok(entry);
        };

        if fetch {
            let member_id = entry.member_id();
            let member = Self::member_stream(&mut inner, member_id)?;
            drop(inner);
            self.pending_fetches.fetch_add(1, Ordering::AcqRel);
            debug!(path, member = member_id, "scheduling fetch job");
            self.pool.submit(FetchJob {
                entry: Arc::clone(&entry),
                member,
                member_id,
                waitable,
                pending: Arc::clone(&self.pending_fetches),
            });
        } else {
            waitable.attach_stream(ByteStream::new());
            waitable.complete();
        }
        Ok(entry)
    }

    /// Open many entries at once.
    ///
    /// # Errors
    /// Fails on the first path that cannot be opened.
    pub fn open_files<I, S>(&self, paths: I) -> Result<Vec<Arc<PackEntry>>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        paths
            .into_iter()
            .map(|p| self.open_file(p.as_ref()))
            .collect()
    }

    /// Walk `root` and open + attach + submit every regular file beneath
    /// it, keyed by its slash-normalized relative path.
    ///
    /// # Errors
    /// Returns walk or open errors; already-processed files stay opened.
    pub fn open_dir<P: AsRef<Path>>(&self, root: P) -> Result<Vec<Arc<PackEntry>>> {
        let root = root.as_ref();
        let mut out = Vec::new();
        for walked in WalkDir::new(root) {
            let walked = walked?;
            if !walked.file_type().is_file() {
                continue;
            }
            if walked.file_name() == ".DS_Store" {
                continue;
            }
            let rel = walked
                .path()
                .strip_prefix(root)
                .map_err(|_| Error::InvalidPath(walked.path().display().to_string()))?;
            let key = rel.to_string_lossy().replace('\\', "/");

            let entry = self.open_file(&key)?;
            let source = ByteStream::open_path(walked.path(), OpenMode::Read)?;
            let waitable = entry.waitable();
            waitable.wait();
            waitable.attach_stream(source);
            self.submit(&key)?;
            out.push(entry);
        }
        info!(root = %root.display(), files = out.len(), "opened directory into pack family");
        Ok(out)
    }

    /// Queue an entry for the next [`write`](Self::write). Idempotent per
    /// batch.
    ///
    /// # Errors
    /// Returns [`Error::FileNotFound`] if `path` has not been opened.
    pub fn submit(&self, path: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .get(path)
            .cloned()
            .ok_or_else(|| Error::FileNotFound(path.to_owned()))?;
        let already = {
            let mut state = entry.state.lock();
            std::mem::replace(&mut state.submitted, true)
        };
        if !already {
            inner.submissions.push(entry);
        }
        Ok(())
    }

    /// Queue an entry handle for the next write.
    ///
    /// # Errors
    /// Returns [`Error::FileNotFound`] if the entry's path is unknown.
    pub fn submit_entry(&self, entry: &PackEntry) -> Result<()> {
        self.submit(entry.filepath())
    }

    /// Write every submitted entry to the family.
    ///
    /// # Errors
    /// See [`write_with_progress`](Self::write_with_progress).
    pub fn write(&self) -> Result<()> {
        self.write_with_progress(&|_, _| {})
    }

    /// Write every submitted entry, reporting progress.
    ///
    /// Submissions are compressed ahead on the worker pool and appended
    /// strictly in submission order, splitting into `_n` members whenever
    /// the next entry would push the current member past the cap.
    ///
    /// # Errors
    /// Returns [`Error::EntryTooLarge`] if a single entry cannot fit in an
    /// empty member (the open member is left unsealed and is recovered as
    /// empty on the next open), [`Error::TooManyMembers`] past member 255,
    /// or [`Error::Io`] from the member file.
    pub fn write_with_progress(&self, progress: WriteProgress) -> Result<()> {
        // Drain in-flight fetches: members are about to be rewritten.
        self.pool.wait_idle(None);
        self.pool.slow(false);
        let result = self.run_pipeline(progress);
        self.pool.slow(true);
        result
    }

    fn run_pipeline(&self, progress: WriteProgress) -> Result<()> {
        let submissions = {
            let mut inner = self.inner.lock();
            if !inner.open {
                return Err(Error::FamilyClosed);
            }
            // Old member readers hold stale data once rewriting starts.
            inner.members.clear();
            std::mem::take(&mut inner.submissions)
        };
        if submissions.is_empty() {
            return Ok(());
        }
        info!(files = submissions.len(), "writing pack family");

        let total = submissions.len();
        let mut next = 0usize;
        let mut inflight: VecDeque<(usize, Arc<PackEntry>)> = VecDeque::new();
        while next < total.min(self.pool.worker_count()) {
            self.schedule_write_job(&submissions[next]);
            inflight.push_back((next, Arc::clone(&submissions[next])));
            next += 1;
        }

        let mut mid: u16 = 0;
        let mut member = self.open_member(0)?;
        let mut cur_off: u64 = HEADER_SIZE;
        let mut itab: Vec<ItabRecord> = Vec::new();
        let mut itab_bytes: u64 = 0;
        let mut abort: Option<Error> = None;

        while let Some((index, entry)) = inflight.pop_front() {
            let waitable = entry.waitable();
            if !waitable.wait_timeout(WRITE_WAIT) {
                warn!(
                    path = entry.filepath(),
                    "write job still running after {}s", WRITE_WAIT.as_secs()
                );
                waitable.wait();
            }

            let Some(mut scratch) = waitable.take_scratch() else {
                // Compression failed; the entry stays active and submitted.
                warn!(path = entry.filepath(), "entry skipped: no compressed payload");
                if next < total {
                    self.schedule_write_job(&submissions[next]);
                    inflight.push_back((next, Arc::clone(&submissions[next])));
                    next += 1;
                }
                continue;
            };

            progress(index, &entry);

            let csize = scratch.stream()?.len()?;
            let record_len = ITAB_RECORD_BASE + entry.filepath().len() as u64;

            if cur_off + csize + itab_bytes + record_len > self.cap {
                if itab.is_empty() {
                    self.scratch.release(scratch);
                    abort = Some(Error::EntryTooLarge {
                        path: entry.filepath().to_owned(),
                        size: csize + record_len,
                        cap: self.cap,
                    });
                    break;
                }
                self.seal_member(&mut member, mid as u8, cur_off, &itab)?;
                mid += 1;
                if mid > u16::from(MAX_MEMBER_ID) {
                    self.scratch.release(scratch);
                    abort = Some(Error::TooManyMembers);
                    break;
                }
                member = self.open_member(mid as u8)?;
                cur_off = HEADER_SIZE;
                itab.clear();
                itab_bytes = 0;
                if cur_off + csize + record_len > self.cap {
                    self.scratch.release(scratch);
                    abort = Some(Error::EntryTooLarge {
                        path: entry.filepath().to_owned(),
                        size: csize + record_len,
                        cap: self.cap,
                    });
                    break;
                }
            }

            member.seek(SeekFrom::Start(cur_off))?;
            {
                let source = scratch.stream()?;
                source.seek(SeekFrom::Start(0))?;
                copy_limited(source, &mut member, csize)?;
            }
            self.scratch.release(scratch);

            {
                let mut state = entry.state.lock();
                state.meta.member_id = mid as u8;
                state.meta.off = cur_off as u32;
                state.meta.indexed = true;
                state.active = false;
                state.submitted = false;
            }
            itab.push(ItabRecord {
                path: entry.filepath().to_owned(),
                off: cur_off as u32,
                compressed: csize as u32,
                original: entry.original_size(),
            });
            itab_bytes += record_len;
            cur_off += csize;
            debug!(
                path = entry.filepath(),
                member = mid,
                off = cur_off - csize,
                compressed = csize,
                "appended entry"
            );

            if next < total {
                self.schedule_write_job(&submissions[next]);
                inflight.push_back((next, Arc::clone(&submissions[next])));
                next += 1;
            }
        }

        if let Some(err) = abort {
            // Recover loaned scratch streams before surfacing the error;
            // the open member stays unsealed (index offset 0).
            for (_, entry) in inflight {
                let waitable = entry.waitable();
                waitable.wait();
                if let Some(scratch) = waitable.take_scratch() {
                    self.scratch.release(scratch);
                }
            }
            warn!(error = %err, "write pipeline aborted");
            return Err(err);
        }

        self.seal_member(&mut member, mid as u8, cur_off, &itab)?;
        info!(members = mid + 1, files = total, "pack family written");
        Ok(())
    }

    fn schedule_write_job(&self, entry: &Arc<PackEntry>) {
        let (waitable, source) = {
            let mut state = entry.state.lock();
            let waitable = PackWaitable::pending();
            let old = std::mem::replace(&mut state.waitable, Arc::clone(&waitable));
            state.active = true;
            drop(state);
            // Carry an attached source stream over from the previous
            // activation, if any.
            (waitable, old.take_stream_raw())
        };
        self.pool.submit(WriteJob {
            entry: Arc::clone(entry),
            waitable,
            source,
            scratch_pool: Arc::clone(&self.scratch),
        });
    }

    fn open_member(&self, mid: u8) -> Result<ByteStream> {
        let path = self.inner.lock().member_path(mid);
        info!(member = mid, path = %path.display(), "opening pack member for write");
        let mut member = ByteStream::open_path(&path, OpenMode::ReadWriteTruncate)?;
        MemberHeader {
            member_id: mid,
            itab_offset: 0,
        }
        .write(&mut member)?;
        Ok(member)
    }

    fn seal_member(
        &self,
        member: &mut ByteStream,
        mid: u8,
        itab_off: u64,
        itab: &[ItabRecord],
    ) -> Result<()> {
        let bytes = format::encode_itab(itab);
        member.seek(SeekFrom::Start(itab_off))?;
        member.write_aligned(&bytes, 1)?;
        member.seek(SeekFrom::Start(ITAB_OFFSET_FIELD))?;
        member.write_u32::<LittleEndian>(itab_off as u32)?;
        member.flush()?;
        info!(
            member = mid,
            files = itab.len(),
            bytes = itab_off + bytes.len() as u64,
            "sealed pack member"
        );
        Ok(())
    }

    fn member_stream(inner: &mut Inner, mid: u8) -> Result<Arc<Mutex<ReduceStream>>> {
        if let Some(member) = inner.members.get(&mid) {
            return Ok(Arc::clone(member));
        }
        let path = inner.member_path(mid);
        let stream = ByteStream::open_path(&path, OpenMode::Read)?;
        let member = Arc::new(Mutex::new(ReduceStream::with_stream(stream)));
        inner.members.insert(mid, Arc::clone(&member));
        Ok(member)
    }

    /// Fetch one file's contents: open, wait, copy out, release.
    ///
    /// # Errors
    /// Returns [`Error::FileNotFound`] for unknown paths, or the fetch/read
    /// error.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        if !self.contains(path) {
            return Err(Error::FileNotFound(path.to_owned()));
        }
        let entry = self.open_file(path)?;
        let waitable = entry.waitable();
        let data = waitable
            .with_stream(|stream| -> Result<Vec<u8>> {
                stream.seek(SeekFrom::Start(0))?;
                let data = stream.read_remaining()?;
                stream.seek(SeekFrom::Start(0))?;
                Ok(data)
            })
            .ok_or_else(|| Error::FileNotFound(path.to_owned()))??;
        entry.release();
        Ok(data)
    }

    /// Extract every indexed entry into `dest`, creating directories as
    /// needed. Returns the number of files written.
    ///
    /// # Errors
    /// Returns the first fetch or filesystem error.
    pub fn extract_all<P: AsRef<Path>>(&self, dest: P) -> Result<usize> {
        let dest = dest.as_ref();
        std::fs::create_dir_all(dest)?;
        let mut paths: Vec<String> = {
            let inner = self.inner.lock();
            inner
                .entries
                .values()
                .filter(|e| e.is_indexed())
                .map(|e| e.filepath().to_owned())
                .collect()
        };
        paths.sort();

        let mut written = 0usize;
        for path in paths {
            let rel = Path::new(&path);
            if rel.is_absolute()
                || rel
                    .components()
                    .any(|c| matches!(c, std::path::Component::ParentDir))
            {
                warn!(path, "skipping entry with unsafe path");
                continue;
            }
            let data = self.read_file(&path)?;
            let out = dest.join(rel);
            if let Some(parent) = out.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&out, &data)?;
            written += 1;
        }
        info!(files = written, dest = %dest.display(), "extracted pack family");
        Ok(written)
    }

    /// Stop the pool and drop every entry and member stream.
    ///
    /// Waits for in-flight jobs first. Idempotent; also runs on drop.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock();
            if !inner.open {
                return;
            }
            inner.open = false;
        }
        self.pool.wait_idle(None);
        self.pool.stop();
        let mut inner = self.inner.lock();
        inner.members.clear();
        inner.submissions.clear();
        inner.entries.clear();
        debug!("pack family closed");
    }
}

impl Drop for Packager {
    fn drop(&mut self) {
        self.close();
    }
}

// ── Jobs ─────────────────────────────────────────────────────────────────

/// Decompresses an indexed entry out of its member into a fresh byte
/// stream. Gated by the member's lock bit so one member's reduce stream is
/// used by a single job at a time.
struct FetchJob {
    entry: Arc<PackEntry>,
    member: Arc<Mutex<ReduceStream>>,
    member_id: u8,
    waitable: Arc<PackWaitable>,
    pending: Arc<AtomicUsize>,
}

impl FetchJob {
    /// Member ids map onto the 64 lock bits; sharing a bit between distant
    /// ids only costs parallelism, never correctness.
    fn lock_bit(&self) -> u32 {
        u32::from(self.member_id) & 63
    }

    fn fetch(&self, worker: &JobWorker) -> Result<()> {
        let (off, original) = {
            let state = self.entry.state.lock();
            (state.meta.off, state.meta.original)
        };
        let mut member = self.member.lock();
        member.stream()?.seek(SeekFrom::Start(u64::from(off)))?;
        member.begin(ReduceMode::Decompress)?;

        let mut out = ByteStream::new();
        out.reserve(original as usize)?;
        let copied = copy_limited(&mut *member, &mut out, u64::from(original));
        // A decode failure already recovered the stream to idle.
        if member.state() != ReduceState::Idle {
            member.end()?;
        }
        let copied = copied?;

        if copied < u64::from(original) {
            warn!(
                path = self.entry.filepath(),
                expected = original,
                got = copied,
                "short read while fetching entry"
            );
        }
        out.seek(SeekFrom::Start(0))?;
        out.reset_modified();
        self.waitable.set_worker_id(worker.id());
        self.waitable.attach_stream(out);
        Ok(())
    }
}

impl Job for FetchJob {
    type Waitable = PackWaitable;

    fn make_waitable(&self) -> Arc<PackWaitable> {
        Arc::clone(&self.waitable)
    }

    fn check(&mut self, bits: &LockBits) -> bool {
        bits.try_set(self.lock_bit())
    }

    fn run(&mut self, _waitable: &PackWaitable, worker: &JobWorker) {
        let result = self.fetch(worker);
        worker.lock_bits().clear(self.lock_bit());
        self.pending.fetch_sub(1, Ordering::AcqRel);
        if let Err(e) = result {
            warn!(path = self.entry.filepath(), error = %e, "fetch failed");
        }
    }
}

/// Compresses one submitted entry into a loaned scratch reduce stream and
/// parks the scratch on the entry's waitable for the coordinator.
struct WriteJob {
    entry: Arc<PackEntry>,
    waitable: Arc<PackWaitable>,
    source: Option<ByteStream>,
    scratch_pool: Arc<ScratchPool>,
}

impl WriteJob {
    fn compress(&mut self, scratch: &mut ReduceStream) -> Result<()> {
        let mut source = match self.source.take() {
            Some(stream) => stream,
            // No stream was attached; read the entry's file directly.
            None => ByteStream::open_path(self.entry.filepath(), OpenMode::Read)?,
        };
        let size = source.len()?;
        source.seek(SeekFrom::Start(0))?;

        {
            let stream = scratch.stream()?;
            stream.truncate(0)?;
            stream.seek(SeekFrom::Start(0))?;
            stream.reserve(size as usize)?;
        }
        scratch.begin(ReduceMode::Compress)?;
        scratch.write_from(&mut source, size)?;
        scratch.end()?;

        let compressed = scratch.stream()?.len()?;
        let mut state = self.entry.state.lock();
        state.meta.original = size as u32;
        state.meta.compressed = compressed as u32;
        Ok(())
    }
}

impl Job for WriteJob {
    type Waitable = PackWaitable;

    fn make_waitable(&self) -> Arc<PackWaitable> {
        Arc::clone(&self.waitable)
    }

    fn run(&mut self, waitable: &PackWaitable, worker: &JobWorker) {
        let mut scratch = self.scratch_pool.acquire();
        match self.compress(&mut scratch) {
            Ok(()) => {
                waitable.set_worker_id(worker.id());
                waitable.attach_scratch(scratch);
            }
            Err(e) => {
                warn!(path = self.entry.filepath(), error = %e, "compression failed");
                // Best-effort reset before returning the scratch stream.
                if scratch.state() != ReduceState::Idle {
                    let _ = scratch.end();
                }
                if let Ok(stream) = scratch.stream() {
                    let _ = stream.truncate(0);
                }
                self.scratch_pool.release(scratch);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn family_naming_and_probe() {
        let dir = tempfile::tempdir().unwrap();
        let family = dir.path().join("world.spk");
        let pak = Packager::open(&family).unwrap();
        assert_eq!(pak.list().len(), 0);
        {
            let inner = pak.inner.lock();
            assert_eq!(inner.member_path(0), dir.path().join("world.spk"));
            assert_eq!(inner.member_path(3), dir.path().join("world_3.spk"));
        }
    }

    #[test]
    fn unknown_entry_gets_empty_active_stream() {
        let dir = tempfile::tempdir().unwrap();
        let pak = Packager::open(dir.path().join("fam.spk")).unwrap();
        let entry = pak.open_file("new.txt").unwrap();
        assert!(entry.is_active());
        assert!(!entry.is_indexed());

        let waitable = entry.waitable();
        assert!(waitable.is_complete());
        let len = waitable.with_stream(|s| s.len().unwrap()).unwrap();
        assert_eq!(len, 0);
    }

    #[test]
    fn submit_requires_open_entry() {
        let dir = tempfile::tempdir().unwrap();
        let pak = Packager::open(dir.path().join("fam.spk")).unwrap();
        assert!(matches!(
            pak.submit("ghost"),
            Err(Error::FileNotFound(_))
        ));
    }

    #[test]
    fn write_then_fetch_single_entry() {
        let dir = tempfile::tempdir().unwrap();
        let family = dir.path().join("fam.spk");
        let payload = b"pipeline smoke payload".repeat(10);

        let pak = Packager::open_with(&family, PackOptions::default().with_workers(2)).unwrap();
        let entry = pak.open_file("smoke.bin").unwrap();
        entry
            .waitable()
            .with_stream(|s| s.write_aligned(&payload, 1))
            .unwrap()
            .unwrap();
        pak.submit("smoke.bin").unwrap();
        pak.write().unwrap();

        assert!(!entry.is_active());
        assert!(entry.is_indexed());
        assert_eq!(entry.original_size() as usize, payload.len());

        let back = pak.read_file("smoke.bin").unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn member_file_layout_after_write() {
        let dir = tempfile::tempdir().unwrap();
        let family = dir.path().join("fam.spk");

        let pak = Packager::open(&family).unwrap();
        let entry = pak.open_file("x").unwrap();
        entry
            .waitable()
            .with_stream(|s| s.write_aligned(b"hello", 1))
            .unwrap()
            .unwrap();
        pak.submit("x").unwrap();
        pak.write().unwrap();
        drop(pak);

        let mut file = std::fs::File::open(&family).unwrap();
        let mut raw = Vec::new();
        file.read_to_end(&mut raw).unwrap();
        assert_eq!(&raw[..4], &format::MAGIC);
        let itab_off = u32::from_le_bytes(raw[8..12].try_into().unwrap()) as usize;
        assert!(itab_off >= HEADER_SIZE as usize && itab_off < raw.len());
        let records = format::decode_itab(&raw[itab_off..]).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path, "x");
        assert_eq!(records[0].original, 5);
    }
}
