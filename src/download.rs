//! # Background Download Coordinator
//!
//! Materializes a remote layer into its local commit file: copy to a
//! `.download` temp file, verify the content digest, atomically rename into
//! place. A process-wide single-flight gate admits one active download at a
//! time so disk and network pressure stay bounded and the throughput cap is
//! meaningful against total provisioned bandwidth.
//!
//! ## Cancellation
//!
//! The owning switch file clears `running` on teardown. The flag is checked
//! before the start delay expires, before every copied block, and before the
//! final rename; a cleared flag ends the download without touching the
//! commit path.

use crate::constants::{COPY_BLOCK_SIZE, COPY_RETRY_LIMIT, DOWNLOAD_SUFFIX, GATE_POLL_INTERVAL};
use crate::copy::copy_file;
use crate::digest::sha256_file;
use crate::error::Error;
use crate::file::{BlockFile, BlockFs, OpenOptions};
use crate::throttle::ThrottledFile;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Process-wide flag: exactly one downloader holds it at any instant.
static DOWNLOADING: AtomicBool = AtomicBool::new(false);

/// True while some download holds the process-wide gate.
pub fn download_active() -> bool {
    DOWNLOADING.load(Ordering::Acquire)
}

/// RAII claim on the process-wide download gate.
struct DownloadGate;

impl DownloadGate {
    /// Polls at 1-second granularity until the gate is free, then claims
    /// it. Returns `None` when `running` clears first.
    async fn acquire(running: &AtomicBool) -> Option<Self> {
        loop {
            if !running.load(Ordering::Acquire) {
                return None;
            }
            if DOWNLOADING
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(Self);
            }
            sleep(GATE_POLL_INTERVAL).await;
        }
    }
}

impl Drop for DownloadGate {
    fn drop(&mut self) {
        DOWNLOADING.store(false, Ordering::Release);
    }
}

/// Tuning for one blob download, resolved from [`crate::config::DownloadConfig`]
/// at the construction site (jitter already applied).
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Start delay in seconds.
    pub delay_sec: u64,
    /// Throughput cap in MiB/s; 0 disables throttling.
    pub max_mbps: i64,
    /// Attempts before giving up.
    pub try_cnt: i64,
}

/// True when the layer's commit file already exists at `path`.
pub async fn check_downloaded(fs: &Arc<dyn BlockFs>, path: &str) -> bool {
    fs.access(path).await
}

/// Sleeps `secs` in gate-interval steps, bailing out early when `running`
/// clears. Returns false on cancellation.
async fn cancellable_sleep(secs: u64, running: &AtomicBool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
    loop {
        if !running.load(Ordering::Acquire) {
            return false;
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return true;
        }
        sleep((deadline - now).min(GATE_POLL_INTERVAL)).await;
    }
}

async fn verify_and_commit(
    fs: &Arc<dyn BlockFs>,
    digest: &str,
    tmp_path: &str,
    dst_path: &str,
    running: &AtomicBool,
) -> Result<(), Error> {
    let got = sha256_file(Path::new(tmp_path)).await;
    if got != digest {
        return Err(Error::IntegrityMismatch {
            path: tmp_path.into(),
            expect: digest.to_string(),
            got,
        });
    }
    if !running.load(Ordering::Acquire) {
        return Err(Error::Cancelled);
    }
    fs.rename(tmp_path, dst_path).await?;
    info!(from = tmp_path, to = dst_path, "download done, commit file in place");
    Ok(())
}

/// Downloads `source` into `dst_path`, returning true iff the commit file
/// was written, verified against `digest`, and renamed into place.
///
/// Integrity and I/O failures retry up to `opts.try_cnt` attempts; a rename
/// failure or a cleared `running` flag ends the download immediately.
pub async fn download_blob(
    local_fs: &Arc<dyn BlockFs>,
    source: Arc<dyn BlockFile>,
    digest: &str,
    dst_path: &str,
    opts: &DownloadOptions,
    running: &AtomicBool,
) -> bool {
    if !cancellable_sleep(opts.delay_sec, running).await {
        return false;
    }
    let Some(_gate) = DownloadGate::acquire(running).await else {
        return false;
    };

    let tmp_path = format!("{dst_path}{DOWNLOAD_SUFFIX}");
    let src: Arc<dyn BlockFile> = if opts.max_mbps > 0 {
        Arc::new(ThrottledFile::new(source, opts.max_mbps as u64))
    } else {
        source
    };

    let dst = match local_fs
        .open(&tmp_path, OpenOptions::read_write_create())
        .await
    {
        Ok(f) => f,
        Err(e) => {
            error!(path = %tmp_path, error = %e, "failed to open download destination");
            return false;
        }
    };

    let mut tries = opts.try_cnt;
    while tries > 0 {
        tries -= 1;
        if !running.load(Ordering::Acquire) {
            return false;
        }
        if let Err(e) = copy_file(&src, &dst, COPY_BLOCK_SIZE, COPY_RETRY_LIMIT, running).await {
            if matches!(e, Error::Cancelled) {
                return false;
            }
            warn!(path = dst_path, error = %e, "retrying download");
            continue;
        }
        match verify_and_commit(local_fs, digest, &tmp_path, dst_path, running).await {
            Ok(()) => return true,
            Err(e @ Error::IntegrityMismatch { .. }) => {
                error!(path = dst_path, error = %e, "checksum verification failed");
                warn!(path = dst_path, "retrying download");
                continue;
            }
            Err(Error::Cancelled) => return false,
            Err(e) => {
                // the rename is the sole handoff; a failure there is permanent
                error!(path = dst_path, error = %e, "failed to commit download");
                return false;
            }
        }
    }
    false
}
