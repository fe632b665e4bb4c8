//! # Switch File
//!
//! Adapter that serves reads from a remote layer blob immediately and, once
//! the background download has materialized and verified the local commit
//! file, atomically switches its backing to local disk without disrupting
//! in-flight reads.
//!
//! ## Phase Machine
//!
//! ```text
//!  Remote ──(download ok)──> ReadyToSwap ──(next read)──> Swapping ──(inflight=0)──> Local
//!    │                                                        │
//!    └── close ──────────────────────────────────────────>    └── close
//! ```
//!
//! The phase only moves forward. The reader that observes `ReadyToSwap` and
//! wins the CAS becomes the swap owner: it drains in-flight reads, opens the
//! commit file through the decode stack, and replaces the backing before any
//! other read proceeds. If the commit file cannot be opened the phase falls
//! back to `Remote` and reads continue unaccelerated.
//!
//! ## Audit
//!
//! Once the backing is local, `pread` latency above
//! [`AUDIT_THRESHOLD`](crate::constants::AUDIT_THRESHOLD) is reported; a
//! local commit file that stalls for tens of milliseconds points at a sick
//! disk.

use crate::config::DownloadConfig;
use crate::constants::{AUDIT_THRESHOLD, DEFAULT_DELAY_EXTRA, DRAIN_POLL_INTERVAL};
use crate::download::{download_blob, DownloadOptions};
use crate::error::{Error, Result};
use crate::file::{BlockFile, BlockFs, LayerCodec, Stat};
use crate::tar::tar_shim;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::io::SeekFrom;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Backing-store phase of a [`SwitchFile`]. Observed values only move
/// forward in the order `Remote < ReadyToSwap < Swapping < Local`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Phase {
    /// Serving reads from the remote blob.
    Remote = 0,
    /// The commit file is verified on disk; the next read swaps.
    ReadyToSwap = 1,
    /// A swap owner is draining in-flight reads.
    Swapping = 2,
    /// Serving reads from the local commit file.
    Local = 3,
}

impl Phase {
    fn from_u8(v: u8) -> Phase {
        match v {
            0 => Phase::Remote,
            1 => Phase::ReadyToSwap,
            2 => Phase::Swapping,
            _ => Phase::Local,
        }
    }
}

/// Opens a backing through the decode stack: raw file, tar-framing shim,
/// then the codec. Local backings skip checksum verification (the whole
/// file was verified at download time); remote backings enforce it.
pub(crate) async fn open_decoded(
    file: Arc<dyn BlockFile>,
    codec: &Arc<dyn LayerCodec>,
    verify_checksum: bool,
) -> Result<Arc<dyn BlockFile>> {
    let file = tar_shim(file).await?;
    codec.open_ro(file, verify_checksum)
}

/// Lazy-materializing layer file: forwards to a remote or local backing and
/// performs an atomic, reader-safe switchover once the commit file lands.
///
/// Callers must [`close`](BlockFile::close) the file when done; close tears
/// down the background download before releasing the backings.
pub struct SwitchFile {
    backing: RwLock<Arc<dyn BlockFile>>,
    old_backing: Mutex<Option<Arc<dyn BlockFile>>>,
    phase: AtomicU8,
    inflight_reads: AtomicUsize,
    /// Audit switch; set once the backing is a local commit file.
    local: AtomicBool,
    running: AtomicBool,
    commit_path: String,
    download_task: Mutex<Option<JoinHandle<()>>>,
    local_fs: Arc<dyn BlockFs>,
    codec: Arc<dyn LayerCodec>,
}

impl SwitchFile {
    /// Wraps `file` in the decode stack and a switch adapter. With
    /// `local = true` the backing is a commit file already on disk: the
    /// phase starts at `Local` and only the audit applies.
    pub async fn new(
        file: Arc<dyn BlockFile>,
        local: bool,
        commit_path: &str,
        local_fs: Arc<dyn BlockFs>,
        codec: Arc<dyn LayerCodec>,
    ) -> Result<Arc<Self>> {
        let backing = open_decoded(file, &codec, !local).await?;
        let phase = if local { Phase::Local } else { Phase::Remote };
        Ok(Arc::new(Self {
            backing: RwLock::new(backing),
            old_backing: Mutex::new(None),
            phase: AtomicU8::new(phase as u8),
            inflight_reads: AtomicUsize::new(0),
            local: AtomicBool::new(local),
            running: AtomicBool::new(true),
            commit_path: commit_path.to_string(),
            download_task: Mutex::new(None),
            local_fs,
            codec,
        }))
    }

    /// Remote-backed switch file with a background download targeting
    /// `commit_path`. `source` is a second handle on the blob, owned by the
    /// downloader. The start delay is `conf.delay` plus uniform jitter over
    /// `conf.delay_extra` seconds (negative selects the default range) so
    /// that many layers starting together spread out.
    pub async fn with_download(
        file: Arc<dyn BlockFile>,
        source: Arc<dyn BlockFile>,
        digest: &str,
        commit_path: &str,
        conf: &DownloadConfig,
        local_fs: Arc<dyn BlockFs>,
        codec: Arc<dyn LayerCodec>,
    ) -> Result<Arc<Self>> {
        let this = Self::new(file, false, commit_path, local_fs, codec).await?;
        let extra = if conf.delay_extra < 0 {
            DEFAULT_DELAY_EXTRA
        } else {
            conf.delay_extra
        };
        let jitter = if extra > 0 {
            rand::rng().random_range(0..extra as u64)
        } else {
            0
        };
        let opts = DownloadOptions {
            delay_sec: conf.delay + jitter,
            max_mbps: conf.max_mbps,
            try_cnt: conf.try_cnt,
        };
        this.start_download(source, digest.to_string(), opts);
        Ok(this)
    }

    fn start_download(self: &Arc<Self>, source: Arc<dyn BlockFile>, digest: String, opts: DownloadOptions) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let ok = download_blob(
                &this.local_fs,
                source,
                &digest,
                &this.commit_path,
                &opts,
                &this.running,
            )
            .await;
            if ok && this.phase_cas(Phase::Remote, Phase::ReadyToSwap) {
                debug!(path = %this.commit_path, "commit file verified, swap armed");
            }
        });
        *self.download_task.lock() = Some(handle);
    }

    /// Current backing-store phase.
    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn phase_store(&self, p: Phase) {
        self.phase.store(p as u8, Ordering::Release);
    }

    fn phase_cas(&self, from: Phase, to: Phase) -> bool {
        self.phase
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Pins the current backing for one forwarded operation, participating
    /// in the switchover protocol: normal phases pin and go, `ReadyToSwap`
    /// elects this caller (or another) as swap owner, `Swapping` backs off
    /// until the owner finishes.
    async fn enter(&self) -> Result<IoGuard<'_>> {
        loop {
            if !self.running.load(Ordering::Acquire) {
                return Err(Error::Cancelled);
            }
            match self.phase() {
                Phase::Remote | Phase::Local => {
                    self.inflight_reads.fetch_add(1, Ordering::AcqRel);
                    // A swap owner may have started draining between the
                    // phase load and the increment; stand down so the drain
                    // observes a clean count.
                    if self.phase() == Phase::Swapping {
                        self.inflight_reads.fetch_sub(1, Ordering::AcqRel);
                        sleep(DRAIN_POLL_INTERVAL).await;
                        continue;
                    }
                    let file = self.backing.read().clone();
                    return Ok(IoGuard { owner: self, file });
                }
                Phase::ReadyToSwap => {
                    if self.phase_cas(Phase::ReadyToSwap, Phase::Swapping) {
                        self.perform_swap().await;
                    } else {
                        while self.phase() == Phase::Swapping {
                            sleep(DRAIN_POLL_INTERVAL).await;
                        }
                    }
                }
                Phase::Swapping => sleep(DRAIN_POLL_INTERVAL).await,
            }
        }
    }

    /// Runs as the swap owner: waits for in-flight reads to drain, opens
    /// the commit file through the decode stack, and replaces the backing.
    /// On open failure the phase falls back to `Remote`.
    async fn perform_swap(&self) {
        while self.inflight_reads.load(Ordering::Acquire) > 0 {
            sleep(DRAIN_POLL_INTERVAL).await;
        }
        let opened = async {
            let raw = self
                .local_fs
                .open(&self.commit_path, crate::file::OpenOptions::read_only())
                .await?;
            open_decoded(raw, &self.codec, false).await
        }
        .await;
        match opened {
            Ok(file) => {
                let old = {
                    let mut backing = self.backing.write();
                    std::mem::replace(&mut *backing, file)
                };
                *self.old_backing.lock() = Some(old);
                self.local.store(true, Ordering::Release);
                self.phase_store(Phase::Local);
                info!(path = %self.commit_path, "switched to local commit file");
            }
            Err(e) => {
                error!(
                    path = %self.commit_path,
                    error = %e,
                    "failed to open commit file, staying remote"
                );
                self.phase_store(Phase::Remote);
            }
        }
    }
}

/// Pinned backing; decrements the in-flight count when dropped.
struct IoGuard<'a> {
    owner: &'a SwitchFile,
    file: Arc<dyn BlockFile>,
}

impl Drop for IoGuard<'_> {
    fn drop(&mut self) {
        self.owner.inflight_reads.fetch_sub(1, Ordering::AcqRel);
    }
}

#[async_trait]
impl BlockFile for SwitchFile {
    async fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let guard = self.enter().await?;
        let started = Instant::now();
        let res = guard.file.pread(buf, offset).await;
        if self.local.load(Ordering::Relaxed) {
            let elapsed = started.elapsed();
            if elapsed > AUDIT_THRESHOLD {
                warn!(
                    path = %self.commit_path,
                    offset,
                    count = buf.len(),
                    latency_us = elapsed.as_micros() as u64,
                    "slow local pread"
                );
            }
        }
        res
    }

    async fn pwrite(&self, buf: &[u8], offset: u64) -> Result<usize> {
        let guard = self.enter().await?;
        guard.file.pwrite(buf, offset).await
    }

    async fn preadv(&self, bufs: &mut [&mut [u8]], offset: u64) -> Result<usize> {
        let guard = self.enter().await?;
        guard.file.preadv(bufs, offset).await
    }

    async fn pwritev(&self, bufs: &[&[u8]], offset: u64) -> Result<usize> {
        let guard = self.enter().await?;
        guard.file.pwritev(bufs, offset).await
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let guard = self.enter().await?;
        guard.file.read(buf).await
    }

    async fn readv(&self, bufs: &mut [&mut [u8]]) -> Result<usize> {
        let guard = self.enter().await?;
        guard.file.readv(bufs).await
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        let guard = self.enter().await?;
        guard.file.write(buf).await
    }

    async fn writev(&self, bufs: &[&[u8]]) -> Result<usize> {
        let guard = self.enter().await?;
        guard.file.writev(bufs).await
    }

    async fn lseek(&self, pos: SeekFrom) -> Result<u64> {
        let guard = self.enter().await?;
        guard.file.lseek(pos).await
    }

    async fn fstat(&self) -> Result<Stat> {
        let guard = self.enter().await?;
        guard.file.fstat().await
    }

    async fn ftruncate(&self, len: u64) -> Result<()> {
        let guard = self.enter().await?;
        guard.file.ftruncate(len).await
    }

    async fn fsync(&self) -> Result<()> {
        let guard = self.enter().await?;
        guard.file.fsync().await
    }

    async fn fdatasync(&self) -> Result<()> {
        let guard = self.enter().await?;
        guard.file.fdatasync().await
    }

    async fn sync_file_range(&self, offset: u64, nbytes: u64) -> Result<()> {
        let guard = self.enter().await?;
        guard.file.sync_file_range(offset, nbytes).await
    }

    async fn fchmod(&self, mode: u32) -> Result<()> {
        let guard = self.enter().await?;
        guard.file.fchmod(mode).await
    }

    async fn fchown(&self, uid: u32, gid: u32) -> Result<()> {
        let guard = self.enter().await?;
        guard.file.fchown(uid, gid).await
    }

    async fn fallocate(&self, offset: u64, len: u64) -> Result<()> {
        let guard = self.enter().await?;
        guard.file.fallocate(offset, len).await
    }

    /// Shuts down: no operation may start once close begins. The download
    /// task is signalled before it is joined, then both backings are
    /// released.
    async fn close(&self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        let task = self.download_task.lock().take();
        if let Some(handle) = task {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!(path = %self.commit_path, error = %e, "download task ended abnormally");
                }
            }
        }
        let backing = self.backing.read().clone();
        let res = backing.close().await;
        let old = self.old_backing.lock().take();
        if let Some(old) = old {
            let _ = old.close().await;
        }
        res
    }

    fn filesystem(&self) -> Option<Arc<dyn BlockFs>> {
        self.backing.read().filesystem()
    }
}

impl Drop for SwitchFile {
    fn drop(&mut self) {
        // Backstop for callers that never closed; close() is the contract.
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.download_task.get_mut().take() {
            handle.abort();
        }
    }
}
