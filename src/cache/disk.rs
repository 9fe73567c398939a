//! Bounded, journaled, content-addressed disk cache.
//!
//! Entries are raw byte blobs keyed by source-content identity. Every
//! index mutation is appended to a plain-text journal before it is
//! applied, and the journal is replayed at startup to rebuild the index:
//! an entry is only visible after its `CLEAN` record, so a crash between
//! a write and its commit leaves the key absent rather than exposing a
//! partial blob. An unreadable journal discards the whole cache and
//! starts empty; that is a degraded state, never a caller-visible error.
//!
//! Writers go through the editor protocol: at most one editor per key,
//! temp file while writing, atomic rename on commit. Readers hold
//! refcounted snapshots; committing a newer generation retires the old
//! blob instead of invalidating snapshots that are still open.

use std::collections::{BTreeMap, HashMap};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace, warn};

use crate::error::{CacheError, CacheResult};

/// Default disk budget in bytes (250 MiB).
///
/// A fixed fallback, not derived from available storage; override it
/// through the engine builder when the host has tighter limits.
pub const DEFAULT_MAX_SIZE: u64 = 250 * 1024 * 1024;

const JOURNAL_FILE: &str = "journal";
const MAGIC: &str = "pictor-disk-cache-1";
const TMP_EXT: &str = "tmp";

/// Journal record tags.
const OP_DIRTY: &str = "DIRTY";
const OP_CLEAN: &str = "CLEAN";
const OP_REMOVE: &str = "REMOVE";

/// Bounded disk cache with crash-safe journal semantics.
///
/// Cheap to clone; clones share one index.
#[derive(Debug, Clone)]
pub struct DiskCache {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    dir: PathBuf,
    max_bytes: u64,
    state: Mutex<IndexState>,
    key_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

#[derive(Debug, Default)]
struct IndexState {
    entries: HashMap<String, DiskEntry>,
    /// Access sequence -> encoded key, oldest first. Drives LRU eviction.
    order: BTreeMap<u64, String>,
    /// Displaced generations still held open by snapshots.
    retired: HashMap<(String, u64), Retired>,
    total_bytes: u64,
    next_seq: u64,
    op_count: u64,
    journal: Option<std::fs::File>,
}

#[derive(Debug, Clone)]
struct DiskEntry {
    size: u64,
    generation: u64,
    access: u64,
    readers: usize,
    editing: bool,
    /// False while a first edit is in flight and nothing was committed.
    present: bool,
}

#[derive(Debug)]
struct Retired {
    readers: usize,
    path: PathBuf,
}

impl DiskCache {
    /// Opens (or creates) a cache in `dir` with the given byte budget.
    ///
    /// Replays the journal, drops entries whose writes were never
    /// committed, deletes orphaned temp and stale blob files, and trims
    /// to budget. A corrupt journal discards the entire cache.
    ///
    /// # Errors
    /// Returns an error only if the directory itself cannot be created
    /// or read.
    pub async fn open(dir: PathBuf, max_bytes: u64) -> CacheResult<Self> {
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| CacheError::io(format!("create cache dir: {e}")))?;

        let mut state = match load_index(&dir) {
            Ok(state) => state,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "disk cache journal unreadable, discarding cache");
                wipe_dir(&dir).await?;
                IndexState::default()
            }
        };

        remove_strays(&dir, &state.entries).await;

        if state.op_count > compaction_threshold(state.entries.len()) {
            rewrite_journal(&dir, &mut state);
        } else if state.journal.is_none() {
            state.journal = open_journal(&dir, state.op_count == 0);
        }

        debug!(
            dir = %dir.display(),
            entries = state.entries.len(),
            bytes = state.total_bytes,
            "opened disk cache"
        );

        let cache = Self {
            shared: Arc::new(Shared {
                dir,
                max_bytes,
                state: Mutex::new(state),
                key_locks: Mutex::new(HashMap::new()),
            }),
        };
        cache.trim_to_size(max_bytes).await;
        Ok(cache)
    }

    /// Opens a cache in the platform default location.
    ///
    /// # Errors
    /// See [`DiskCache::open`].
    pub async fn open_default(max_bytes: u64) -> CacheResult<Self> {
        Self::open(default_dir(), max_bytes).await
    }

    /// The configured byte budget.
    #[must_use]
    pub fn max_size(&self) -> u64 {
        self.shared.max_bytes
    }

    /// Total bytes of committed entries.
    #[must_use]
    pub fn current_size(&self) -> u64 {
        self.shared.state.lock().total_bytes
    }

    /// Number of committed entries.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.shared.state.lock().entries.values().filter(|e| e.present).count()
    }

    /// Returns true if no committed entries exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entry_count() == 0
    }

    /// Returns true if a committed entry exists for the key.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        let ekey = encode_key(key);
        self.shared
            .state
            .lock()
            .entries
            .get(&ekey)
            .is_some_and(|e| e.present)
    }

    /// The per-key async lock serializing compound read-then-write
    /// sequences (e.g. a fetcher's check-snapshot-else-download).
    ///
    /// Different keys proceed independently.
    #[must_use]
    pub fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let ekey = encode_key(key);
        self.shared
            .key_locks
            .lock()
            .entry(ekey)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Opens a read-only handle to a committed entry.
    ///
    /// The snapshot keeps its blob alive until dropped: eviction skips
    /// open entries, and a commit of a newer generation retires the old
    /// blob instead of deleting it under the reader.
    #[must_use]
    pub fn open_snapshot(&self, key: &str) -> Option<Snapshot> {
        let ekey = encode_key(key);
        let mut state = self.shared.state.lock();
        let seq = state.bump_seq();
        let entry = state.entries.get_mut(&ekey)?;
        if !entry.present {
            trace!(key = %ekey, "disk cache miss");
            return None;
        }
        entry.readers += 1;
        let generation = entry.generation;
        let len = entry.size;
        let old_access = entry.access;
        entry.access = seq;
        state.order.remove(&old_access);
        state.order.insert(seq, ekey.clone());
        trace!(key = %ekey, generation, "disk cache hit");
        let path = blob_path(&self.shared.dir, &ekey, generation);
        Some(Snapshot {
            shared: self.shared.clone(),
            ekey,
            generation,
            path,
            len,
        })
    }

    /// Starts an edit for the key.
    ///
    /// Returns `None` while another editor for the same key is open
    /// (at most one writer per key). Editing is permitted while readers
    /// hold snapshots; they keep seeing the prior generation.
    #[must_use]
    pub fn edit(&self, key: &str) -> Option<Editor> {
        let ekey = encode_key(key);
        let mut state = self.shared.state.lock();
        let seq = state.bump_seq();
        let entry = state.entries.entry(ekey.clone()).or_insert(DiskEntry {
            size: 0,
            generation: 0,
            access: seq,
            readers: 0,
            editing: false,
            present: false,
        });
        if entry.editing {
            trace!(key = %ekey, "edit already in progress");
            return None;
        }
        entry.editing = true;
        if !entry.present {
            // Placeholder rows for first-time edits still need an order
            // slot so abort can clean them up uniformly.
            state.order.entry(seq).or_insert_with(|| ekey.clone());
        }
        state.append_record(&format!("{OP_DIRTY} {ekey}"));
        debug!(key = %ekey, "disk cache edit started");
        Some(Editor {
            shared: self.shared.clone(),
            ekey: ekey.clone(),
            tmp_path: self.shared.dir.join(format!("{ekey}.{TMP_EXT}")),
            file: None,
            finished: false,
        })
    }

    /// Removes a committed entry.
    ///
    /// Open snapshots of the entry stay readable; the blob is deleted
    /// when the last one closes. Returns true if an entry was removed.
    pub async fn remove(&self, key: &str) -> bool {
        let ekey = encode_key(key);
        let doomed = {
            let mut state = self.shared.state.lock();
            let Some(entry) = state.entries.get(&ekey) else {
                return false;
            };
            if !entry.present || entry.editing {
                return false;
            }
            let entry = entry.clone();
            state.append_record(&format!("{OP_REMOVE} {ekey}"));
            state.order.remove(&entry.access);
            state.total_bytes -= entry.size;
            state.entries.remove(&ekey);
            let path = blob_path(&self.shared.dir, &ekey, entry.generation);
            if entry.readers > 0 {
                state.retired.insert(
                    (ekey.clone(), entry.generation),
                    Retired {
                        readers: entry.readers,
                        path,
                    },
                );
                None
            } else {
                Some(path)
            }
        };
        if let Some(path) = doomed {
            let _ = fs::remove_file(&path).await;
        }
        debug!(key = %ekey, "removed disk cache entry");
        true
    }

    /// Evicts least-recently-used entries until the committed total is
    /// at most `max_bytes`, skipping keys open for read or write.
    pub async fn trim_to_size(&self, max_bytes: u64) {
        let doomed = {
            let mut state = self.shared.state.lock();
            if state.total_bytes <= max_bytes {
                return;
            }
            let victims: Vec<(u64, String)> = state
                .order
                .iter()
                .map(|(seq, ekey)| (*seq, ekey.clone()))
                .collect();
            let mut paths = Vec::new();
            for (seq, ekey) in victims {
                if state.total_bytes <= max_bytes {
                    break;
                }
                let Some(entry) = state.entries.get(&ekey) else {
                    state.order.remove(&seq);
                    continue;
                };
                if entry.readers > 0 || entry.editing || !entry.present {
                    continue;
                }
                let entry = entry.clone();
                state.append_record(&format!("{OP_REMOVE} {ekey}"));
                state.order.remove(&seq);
                state.total_bytes -= entry.size;
                state.entries.remove(&ekey);
                paths.push(blob_path(&self.shared.dir, &ekey, entry.generation));
                trace!(key = %ekey, size = entry.size, "evicted disk cache entry");
            }
            debug!(
                evicted = paths.len(),
                bytes = state.total_bytes,
                "disk cache trimmed"
            );
            paths
        };
        for path in doomed {
            let _ = fs::remove_file(&path).await;
        }
    }

    /// Removes every committed entry.
    pub async fn clear(&self) {
        let doomed = {
            let mut state = self.shared.state.lock();
            let mut paths = Vec::new();
            let keys: Vec<String> = state.entries.keys().cloned().collect();
            for ekey in keys {
                let Some(entry) = state.entries.get(&ekey).cloned() else {
                    continue;
                };
                if entry.present {
                    state.append_record(&format!("{OP_REMOVE} {ekey}"));
                    let path = blob_path(&self.shared.dir, &ekey, entry.generation);
                    if entry.readers > 0 {
                        state.retired.insert(
                            (ekey.clone(), entry.generation),
                            Retired {
                                readers: entry.readers,
                                path,
                            },
                        );
                    } else {
                        paths.push(path);
                    }
                }
                if entry.editing {
                    // Keep the placeholder; the open editor finishes on
                    // its own terms.
                    if let Some(e) = state.entries.get_mut(&ekey) {
                        e.present = false;
                        e.size = 0;
                        e.readers = 0;
                    }
                } else {
                    state.order.remove(&entry.access);
                    state.entries.remove(&ekey);
                }
            }
            state.total_bytes = 0;
            paths
        };
        for path in doomed {
            let _ = fs::remove_file(&path).await;
        }
        debug!("cleared disk cache");
    }
}

impl IndexState {
    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Appends one journal record before the in-memory mutation it
    /// describes takes effect. Failures degrade to best-effort
    /// persistence with a warning.
    fn append_record(&mut self, line: &str) {
        self.op_count += 1;
        if let Some(journal) = self.journal.as_mut() {
            let result = writeln!(journal, "{line}").and_then(|()| journal.flush());
            if let Err(e) = result {
                warn!(error = %e, "journal append failed, persistence degraded");
                self.journal = None;
            }
        }
    }
}

/// Refcounted read-only handle to one committed generation of an entry.
#[derive(Debug)]
pub struct Snapshot {
    shared: Arc<Shared>,
    ekey: String,
    generation: u64,
    path: PathBuf,
    len: u64,
}

impl Snapshot {
    /// Size of the blob in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns true if the blob is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reads the full blob.
    ///
    /// # Errors
    /// [`CacheError::Io`] if the blob cannot be read.
    pub async fn read(&self) -> CacheResult<Bytes> {
        let data = fs::read(&self.path)
            .await
            .map_err(|e| CacheError::io(format!("read blob {}: {e}", self.path.display())))?;
        Ok(Bytes::from(data))
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        if let Some(entry) = state.entries.get_mut(&self.ekey)
            && entry.generation == self.generation
            && entry.readers > 0
        {
            entry.readers -= 1;
            return;
        }
        // The generation this snapshot pinned was replaced or removed.
        let retired_key = (self.ekey.clone(), self.generation);
        if let Some(retired) = state.retired.get_mut(&retired_key) {
            retired.readers -= 1;
            if retired.readers == 0 {
                let path = retired.path.clone();
                state.retired.remove(&retired_key);
                drop(state);
                let _ = std::fs::remove_file(path);
            }
        }
    }
}

/// Exclusive write handle for one key.
///
/// Writes accumulate in a temp file; [`Editor::commit`] atomically
/// publishes them, [`Editor::abort`] (or dropping the editor) discards
/// them and leaves any prior committed value untouched.
#[derive(Debug)]
pub struct Editor {
    shared: Arc<Shared>,
    ekey: String,
    tmp_path: PathBuf,
    file: Option<fs::File>,
    finished: bool,
}

impl Editor {
    /// The byte sink for this edit, created lazily.
    ///
    /// # Errors
    /// [`CacheError::Io`] if the temp file cannot be created.
    pub async fn new_sink(&mut self) -> CacheResult<&mut fs::File> {
        if self.file.is_none() {
            let file = fs::File::create(&self.tmp_path)
                .await
                .map_err(|e| CacheError::io(format!("create temp file: {e}")))?;
            self.file = Some(file);
        }
        Ok(self.file.as_mut().unwrap())
    }

    /// Appends bytes to the pending blob.
    ///
    /// # Errors
    /// [`CacheError::Io`] on write failure.
    pub async fn write_all(&mut self, data: &[u8]) -> CacheResult<()> {
        let sink = self.new_sink().await?;
        sink.write_all(data)
            .await
            .map_err(|e| CacheError::io(format!("write temp file: {e}")))?;
        Ok(())
    }

    /// Atomically publishes the write, replacing any prior entry and
    /// updating the size index, then trims the cache to budget.
    ///
    /// Snapshots opened against the prior generation stay readable.
    ///
    /// # Errors
    /// [`CacheError::Io`] if the blob cannot be flushed or renamed; the
    /// edit is aborted and the prior entry (if any) survives.
    pub async fn commit(mut self) -> CacheResult<()> {
        // An edit with no writes commits an empty blob.
        self.new_sink().await?;
        let mut file = self.file.take().unwrap();
        if let Err(e) = file.flush().await {
            self.abort_inner();
            return Err(CacheError::io(format!("flush temp file: {e}")));
        }
        if let Err(e) = file.sync_all().await {
            self.abort_inner();
            return Err(CacheError::io(format!("sync temp file: {e}")));
        }
        drop(file);

        let size = match fs::metadata(&self.tmp_path).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                self.abort_inner();
                return Err(CacheError::io(format!("stat temp file: {e}")));
            }
        };

        let generation = self.shared.state.lock().bump_seq();
        let blob = blob_path(&self.shared.dir, &self.ekey, generation);
        if let Err(e) = fs::rename(&self.tmp_path, &blob).await {
            self.abort_inner();
            return Err(CacheError::io(format!("publish blob: {e}")));
        }

        let doomed = {
            let mut state = self.shared.state.lock();
            let seq = state.bump_seq();
            state.append_record(&format!("{OP_CLEAN} {} {size} {generation}", self.ekey));
            // The entry outlives its editor: clear/remove/trim all keep
            // rows that are mid-edit.
            let entry = state.entries.entry(self.ekey.clone()).or_insert(DiskEntry {
                size: 0,
                generation: 0,
                access: 0,
                readers: 0,
                editing: true,
                present: false,
            });
            let prior = entry.clone();
            entry.size = size;
            entry.generation = generation;
            entry.editing = false;
            entry.present = true;
            entry.readers = 0;
            let old_access = entry.access;
            entry.access = seq;
            state.order.remove(&old_access);
            state.order.insert(seq, self.ekey.clone());
            state.total_bytes += size;
            let mut doomed = None;
            if prior.present {
                state.total_bytes -= prior.size;
                let old_path = blob_path(&self.shared.dir, &self.ekey, prior.generation);
                if prior.readers > 0 {
                    state.retired.insert(
                        (self.ekey.clone(), prior.generation),
                        Retired {
                            readers: prior.readers,
                            path: old_path,
                        },
                    );
                } else {
                    doomed = Some(old_path);
                }
            }
            doomed
        };
        if let Some(path) = doomed {
            let _ = fs::remove_file(&path).await;
        }

        self.finished = true;
        debug!(key = %self.ekey, size, generation, "disk cache entry committed");
        let max = self.shared.max_bytes;
        DiskCache {
            shared: self.shared.clone(),
        }
        .trim_to_size(max)
        .await;
        Ok(())
    }

    /// Discards partial writes. A prior committed entry, if any, is left
    /// untouched.
    pub async fn abort(mut self) {
        self.file.take();
        let _ = fs::remove_file(&self.tmp_path).await;
        self.abort_inner();
    }

    /// Releases the edit lock and terminates the journal's DIRTY record
    /// so replay does not treat the key as crashed.
    fn abort_inner(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let mut state = self.shared.state.lock();
        let Some(entry) = state.entries.get_mut(&self.ekey) else {
            return;
        };
        entry.editing = false;
        if entry.present {
            let line = format!("{OP_CLEAN} {} {} {}", self.ekey, entry.size, entry.generation);
            state.append_record(&line);
        } else {
            let access = entry.access;
            state.entries.remove(&self.ekey);
            state.order.remove(&access);
            let line = format!("{OP_REMOVE} {}", self.ekey);
            state.append_record(&line);
        }
        debug!(key = %self.ekey, "disk cache edit aborted");
    }
}

impl Drop for Editor {
    fn drop(&mut self) {
        if !self.finished {
            self.file.take();
            let _ = std::fs::remove_file(&self.tmp_path);
            self.abort_inner();
        }
    }
}

/// Encodes a raw cache key into a filesystem-safe identifier.
///
/// Full sha256, hex encoded. Collisions are assumed impossible for the
/// hash space; no secondary probing is attempted.
fn encode_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

fn blob_path(dir: &Path, ekey: &str, generation: u64) -> PathBuf {
    dir.join(format!("{ekey}.{generation}"))
}

/// Platform default cache directory, temp-dir fallback.
fn default_dir() -> PathBuf {
    directories::ProjectDirs::from("dev", "tecknian", "pictor").map_or_else(
        || std::env::temp_dir().join("pictor").join("disk-cache"),
        |dirs| dirs.cache_dir().join("disk-cache"),
    )
}

fn compaction_threshold(entries: usize) -> u64 {
    entries as u64 * 2 + 1024
}

/// Replays the journal into an index. Any parse failure is reported as
/// corruption; the caller responds by discarding the cache.
fn load_index(dir: &Path) -> Result<IndexState, CacheError> {
    let path = dir.join(JOURNAL_FILE);
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let mut state = IndexState::default();
            state.journal = open_journal(dir, true);
            return Ok(state);
        }
        Err(e) => return Err(CacheError::Corrupt(format!("read journal: {e}"))),
    };

    let mut lines = text.lines();
    if lines.next() != Some(MAGIC) {
        return Err(CacheError::Corrupt("bad journal header".into()));
    }

    let mut state = IndexState::default();
    let mut dirty: HashMap<String, ()> = HashMap::new();
    for line in lines {
        if line.is_empty() {
            // A torn final append. Everything before it already replayed.
            continue;
        }
        state.op_count += 1;
        let mut parts = line.split(' ');
        match (parts.next(), parts.next()) {
            (Some(OP_DIRTY), Some(ekey)) => {
                dirty.insert(ekey.to_string(), ());
            }
            (Some(OP_CLEAN), Some(ekey)) => {
                let size = parts
                    .next()
                    .and_then(|s| s.parse::<u64>().ok())
                    .ok_or_else(|| CacheError::Corrupt(format!("bad record: {line}")))?;
                let generation = parts
                    .next()
                    .and_then(|s| s.parse::<u64>().ok())
                    .ok_or_else(|| CacheError::Corrupt(format!("bad record: {line}")))?;
                dirty.remove(ekey);
                let seq = state.bump_seq();
                if let Some(prior) = state.entries.get(ekey) {
                    state.total_bytes -= prior.size;
                    state.order.remove(&prior.access);
                }
                state.order.insert(seq, ekey.to_string());
                state.total_bytes += size;
                state.next_seq = state.next_seq.max(generation + 1);
                state.entries.insert(
                    ekey.to_string(),
                    DiskEntry {
                        size,
                        generation,
                        access: seq,
                        readers: 0,
                        editing: false,
                        present: true,
                    },
                );
            }
            (Some(OP_REMOVE), Some(ekey)) => {
                dirty.remove(ekey);
                if let Some(prior) = state.entries.remove(ekey) {
                    state.total_bytes -= prior.size;
                    state.order.remove(&prior.access);
                }
            }
            _ => return Err(CacheError::Corrupt(format!("bad record: {line}"))),
        }
    }

    // Writes not terminated by a commit record: treat the key as absent.
    for (ekey, ()) in dirty {
        if let Some(entry) = state.entries.remove(&ekey) {
            state.total_bytes -= entry.size;
            state.order.remove(&entry.access);
        }
    }

    state.journal = open_journal(dir, false);
    Ok(state)
}

/// Deletes temp files and blob files the index does not reference.
async fn remove_strays(dir: &Path, entries: &HashMap<String, DiskEntry>) {
    let Ok(mut listing) = fs::read_dir(dir).await else {
        return;
    };
    while let Ok(Some(item)) = listing.next_entry().await {
        let path = item.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name == JOURNAL_FILE {
            continue;
        }
        let keep = name.rsplit_once('.').is_some_and(|(stem, suffix)| {
            suffix != TMP_EXT
                && suffix
                    .parse::<u64>()
                    .is_ok_and(|generation| {
                        entries
                            .get(stem)
                            .is_some_and(|e| e.present && e.generation == generation)
                    })
        });
        if !keep {
            trace!(path = %path.display(), "removing stray cache file");
            let _ = fs::remove_file(&path).await;
        }
    }
}

async fn wipe_dir(dir: &Path) -> CacheResult<()> {
    fs::remove_dir_all(dir)
        .await
        .map_err(|e| CacheError::io(format!("discard cache dir: {e}")))?;
    fs::create_dir_all(dir)
        .await
        .map_err(|e| CacheError::io(format!("recreate cache dir: {e}")))?;
    Ok(())
}

fn open_journal(dir: &Path, fresh: bool) -> Option<std::fs::File> {
    use std::fs::OpenOptions;
    let path = dir.join(JOURNAL_FILE);
    let mut options = OpenOptions::new();
    options.append(true).create(true);
    let mut file = match options.open(&path) {
        Ok(file) => file,
        Err(e) => {
            warn!(error = %e, "cannot open journal, persistence degraded");
            return None;
        }
    };
    if fresh && writeln!(file, "{MAGIC}").is_err() {
        return None;
    }
    Some(file)
}

/// Rewrites the journal from the live index, dropping redundant records.
fn rewrite_journal(dir: &Path, state: &mut IndexState) {
    let tmp = dir.join(format!("{JOURNAL_FILE}.{TMP_EXT}"));
    let result = (|| -> std::io::Result<()> {
        let mut file = std::fs::File::create(&tmp)?;
        writeln!(file, "{MAGIC}")?;
        let mut ops = 0;
        for ekey in state.order.values() {
            if let Some(entry) = state.entries.get(ekey).filter(|e| e.present) {
                writeln!(file, "{OP_CLEAN} {ekey} {} {}", entry.size, entry.generation)?;
                ops += 1;
            }
        }
        for (ekey, entry) in &state.entries {
            if entry.editing {
                writeln!(file, "{OP_DIRTY} {ekey}")?;
                ops += 1;
            }
        }
        file.sync_all()?;
        std::fs::rename(&tmp, dir.join(JOURNAL_FILE))?;
        state.op_count = ops;
        Ok(())
    })();
    match result {
        Ok(()) => {
            state.journal = open_journal(dir, false);
            debug!(ops = state.op_count, "journal compacted");
        }
        Err(e) => {
            warn!(error = %e, "journal compaction failed");
            let _ = std::fs::remove_file(&tmp);
            state.journal = open_journal(dir, false);
        }
    }
}
