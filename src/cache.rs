//! # Shared Layer Cache
//!
//! Process-wide identity-keyed tables that hand the same reference-counted
//! file to every opener of a layer. Entries start at one reference, lookups
//! increment, and the last [`close`](BlockFile::close) destroys the
//! underlying file and removes the entry.
//!
//! Opens of the same key are single-flighted: concurrent openers of a layer
//! that is not yet cached serialize on a per-key gate, so exactly one
//! expensive open (and at most one download task) happens per identity.

use crate::error::Result;
use crate::file::{BlockFile, BlockFs, Stat};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::io::SeekFrom;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// Identity-keyed table of shared, reference-counted files.
pub struct FileCache {
    name: &'static str,
    entries: Mutex<HashMap<String, Arc<RefFile>>>,
    /// Per-key open gates; an entry persists for the life of the cache
    /// entry so repeated opens of the same key stay serialized.
    gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl FileCache {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            entries: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the shared file for `key`, bumping its reference count.
    pub fn lookup(&self, key: &str) -> Option<Arc<RefFile>> {
        let entries = self.entries.lock();
        entries.get(key).map(|rf| {
            rf.refs.fetch_add(1, Ordering::AcqRel);
            info!(cache = self.name, key, "return shared file");
            rf.clone()
        })
    }

    /// Registers `file` under `key` with one reference.
    pub fn insert(self: &Arc<Self>, key: &str, file: Arc<dyn BlockFile>) -> Arc<RefFile> {
        let rf = Arc::new(RefFile {
            inner: file,
            key: key.to_string(),
            refs: AtomicUsize::new(1),
            cache: Arc::downgrade(self),
        });
        self.entries.lock().insert(key.to_string(), rf.clone());
        info!(cache = self.name, key, "registered shared file");
        rf
    }

    /// Returns the shared file for `key`, invoking `open` to produce it on
    /// a miss. Concurrent callers for the same key serialize; whoever opens
    /// first populates the entry and the rest pick it up with a bumped
    /// reference count.
    pub async fn open_shared<F, Fut>(self: &Arc<Self>, key: &str, open: F) -> Result<Arc<RefFile>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn BlockFile>>>,
    {
        if let Some(hit) = self.lookup(key) {
            return Ok(hit);
        }
        let gate = {
            let mut gates = self.gates.lock();
            gates
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _claim = gate.lock().await;
        if let Some(hit) = self.lookup(key) {
            return Ok(hit);
        }
        let file = open().await?;
        Ok(self.insert(key, file))
    }

    /// Number of live entries; observability and tests.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Reference-counted forwarding wrapper handed out by [`FileCache`].
///
/// Every consumer closes its handle; the close that takes the count to zero
/// closes the underlying file and drops the cache entry.
pub struct RefFile {
    inner: Arc<dyn BlockFile>,
    key: String,
    refs: AtomicUsize,
    cache: Weak<FileCache>,
}

impl RefFile {
    /// Identity key this file is cached under.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current reference count.
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }
}

#[async_trait]
impl BlockFile for RefFile {
    async fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.inner.pread(buf, offset).await
    }

    async fn pwrite(&self, buf: &[u8], offset: u64) -> Result<usize> {
        self.inner.pwrite(buf, offset).await
    }

    async fn preadv(&self, bufs: &mut [&mut [u8]], offset: u64) -> Result<usize> {
        self.inner.preadv(bufs, offset).await
    }

    async fn pwritev(&self, bufs: &[&[u8]], offset: u64) -> Result<usize> {
        self.inner.pwritev(bufs, offset).await
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.inner.read(buf).await
    }

    async fn readv(&self, bufs: &mut [&mut [u8]]) -> Result<usize> {
        self.inner.readv(bufs).await
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        self.inner.write(buf).await
    }

    async fn writev(&self, bufs: &[&[u8]]) -> Result<usize> {
        self.inner.writev(bufs).await
    }

    async fn lseek(&self, pos: SeekFrom) -> Result<u64> {
        self.inner.lseek(pos).await
    }

    async fn fstat(&self) -> Result<Stat> {
        self.inner.fstat().await
    }

    async fn ftruncate(&self, len: u64) -> Result<()> {
        self.inner.ftruncate(len).await
    }

    async fn fsync(&self) -> Result<()> {
        self.inner.fsync().await
    }

    async fn fdatasync(&self) -> Result<()> {
        self.inner.fdatasync().await
    }

    async fn sync_file_range(&self, offset: u64, nbytes: u64) -> Result<()> {
        self.inner.sync_file_range(offset, nbytes).await
    }

    async fn fchmod(&self, mode: u32) -> Result<()> {
        self.inner.fchmod(mode).await
    }

    async fn fchown(&self, uid: u32, gid: u32) -> Result<()> {
        self.inner.fchown(uid, gid).await
    }

    async fn fallocate(&self, offset: u64, len: u64) -> Result<()> {
        self.inner.fallocate(offset, len).await
    }

    async fn close(&self) -> Result<()> {
        let last = if let Some(cache) = self.cache.upgrade() {
            let mut entries = cache.entries.lock();
            if self.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
                entries.remove(&self.key);
                drop(entries);
                cache.gates.lock().remove(&self.key);
                debug!(cache = cache.name, key = %self.key, "cache entry released");
                true
            } else {
                false
            }
        } else {
            self.refs.fetch_sub(1, Ordering::AcqRel) == 1
        };
        if last {
            self.inner.close().await
        } else {
            Ok(())
        }
    }

    fn filesystem(&self) -> Option<Arc<dyn BlockFs>> {
        self.inner.filesystem()
    }
}
