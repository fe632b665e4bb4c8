//! Shared fixtures for integration tests: an in-memory blob store standing
//! in for the remote registry, instrumented file wrappers, and a trivial
//! stacker standing in for the external LSMT implementation.

#![allow(dead_code)]

use async_trait::async_trait;
use lazylayer::{
    BlockFile, BlockFs, Error, GlobalConfig, GlobalFs, ImageService, LocalFs, LowerStacker,
    OpenOptions, Result, Stat,
};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Canonical digest string of `data`.
pub fn digest_of(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Deterministic test payload.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Per-path open/close counters shared by every handle of a blob.
#[derive(Default)]
pub struct BlobStats {
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
}

/// In-memory read-only blob store addressed by URL or path.
pub struct MemBlobFs {
    blobs: Mutex<HashMap<String, Arc<Vec<u8>>>>,
    denied: Mutex<HashSet<String>>,
    stats: Mutex<HashMap<String, Arc<BlobStats>>>,
}

impl MemBlobFs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            blobs: Mutex::new(HashMap::new()),
            denied: Mutex::new(HashSet::new()),
            stats: Mutex::new(HashMap::new()),
        })
    }

    pub fn put(&self, path: &str, data: Vec<u8>) {
        self.blobs.lock().insert(path.to_string(), Arc::new(data));
    }

    /// Subsequent opens of `path` fail with a permission error.
    pub fn deny(&self, path: &str) {
        self.denied.lock().insert(path.to_string());
    }

    pub fn stats(&self, path: &str) -> Arc<BlobStats> {
        self.stats
            .lock()
            .entry(path.to_string())
            .or_default()
            .clone()
    }

    pub fn all_stats(&self) -> Vec<(String, Arc<BlobStats>)> {
        self.stats
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[async_trait]
impl BlockFs for MemBlobFs {
    async fn open(&self, path: &str, _opts: OpenOptions) -> Result<Arc<dyn BlockFile>> {
        if self.denied.lock().contains(path) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("denied: {path}"),
            )));
        }
        let data = self
            .blobs
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no blob at {path}"),
                ))
            })?;
        let stats = self.stats(path);
        stats.opens.fetch_add(1, Ordering::AcqRel);
        Ok(Arc::new(MemBlobFile { data, stats }))
    }

    async fn access(&self, path: &str) -> bool {
        self.blobs.lock().contains_key(path)
    }

    async fn rename(&self, _src: &str, _dst: &str) -> Result<()> {
        Err(Error::NotSupported("rename".to_string()))
    }
}

/// Read-only handle on a blob in a [`MemBlobFs`].
pub struct MemBlobFile {
    data: Arc<Vec<u8>>,
    stats: Arc<BlobStats>,
}

#[async_trait]
impl BlockFile for MemBlobFile {
    async fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let off = offset as usize;
        if off >= self.data.len() {
            return Ok(0);
        }
        let n = (self.data.len() - off).min(buf.len());
        buf[..n].copy_from_slice(&self.data[off..off + n]);
        Ok(n)
    }

    async fn fstat(&self) -> Result<Stat> {
        Ok(Stat {
            size: self.data.len() as u64,
        })
    }

    async fn close(&self) -> Result<()> {
        self.stats.closes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

/// Forwarding wrapper that counts full-copy attempts (reads at offset 0)
/// and closes.
pub struct CountingFile {
    inner: Arc<dyn BlockFile>,
    pub reads_from_start: AtomicUsize,
    pub closes: AtomicUsize,
}

impl CountingFile {
    pub fn new(inner: Arc<dyn BlockFile>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            reads_from_start: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl BlockFile for CountingFile {
    async fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if offset == 0 {
            self.reads_from_start.fetch_add(1, Ordering::AcqRel);
        }
        self.inner.pread(buf, offset).await
    }

    async fn fstat(&self) -> Result<Stat> {
        self.inner.fstat().await
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::AcqRel);
        self.inner.close().await
    }
}

/// Forwarding wrapper whose first `failures` reads error out.
pub struct FlakyFile {
    inner: Arc<dyn BlockFile>,
    failures_left: AtomicUsize,
}

impl FlakyFile {
    pub fn new(inner: Arc<dyn BlockFile>, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failures_left: AtomicUsize::new(failures),
        })
    }
}

#[async_trait]
impl BlockFile for FlakyFile {
    async fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let left = self.failures_left.load(Ordering::Acquire);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::Release);
            return Err(Error::Io(std::io::Error::other("injected read failure")));
        }
        self.inner.pread(buf, offset).await
    }

    async fn fstat(&self) -> Result<Stat> {
        self.inner.fstat().await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

/// Stand-in for the external LSMT stacker: the stacked view reads from the
/// bottom layer and closing it closes every layer.
pub struct TestStacker;

#[async_trait]
impl LowerStacker for TestStacker {
    async fn stack_lowers(&self, lowers: Vec<Arc<dyn BlockFile>>) -> Result<Arc<dyn BlockFile>> {
        if lowers.is_empty() {
            return Err(Error::StackFailed("no layers to stack".to_string()));
        }
        Ok(Arc::new(StackedFile { lowers }))
    }
}

pub struct StackedFile {
    pub lowers: Vec<Arc<dyn BlockFile>>,
}

#[async_trait]
impl BlockFile for StackedFile {
    async fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.lowers[0].pread(buf, offset).await
    }

    async fn fstat(&self) -> Result<Stat> {
        self.lowers[0].fstat().await
    }

    async fn close(&self) -> Result<()> {
        for lower in &self.lowers {
            lower.close().await?;
        }
        Ok(())
    }
}

/// Service over the host filesystem with `remote` standing in for both the
/// read and download sides of the registry.
pub fn service_with_remote(remote: Arc<MemBlobFs>) -> Arc<ImageService> {
    Arc::new(ImageService::new(
        GlobalConfig::default(),
        GlobalFs {
            remote_fs: remote.clone(),
            src_fs: remote,
            local_fs: Arc::new(LocalFs::new()),
        },
        Arc::new(TestStacker),
    ))
}
