//! # Download Throughput Limiter
//!
//! Read shim that caps the bytes pulled from a source file per accounting
//! window. The copy engine reads through this wrapper in 1 MiB blocks; the
//! window is one second, so the cap is meaningful against total provisioned
//! bandwidth while the process-wide download gate keeps it the only active
//! downloader.

use crate::constants::{THROTTLE_BLOCK_SIZE, THROTTLE_WINDOW};
use crate::error::Result;
use crate::file::{BlockFile, BlockFs, Stat};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

struct Window {
    start: Instant,
    used: u64,
}

/// Read-throughput-limited view of a file.
pub struct ThrottledFile {
    inner: Arc<dyn BlockFile>,
    bytes_per_window: u64,
    window: Mutex<Window>,
}

impl ThrottledFile {
    /// Caps reads through this wrapper at `max_mbps` MiB per second.
    pub fn new(inner: Arc<dyn BlockFile>, max_mbps: u64) -> Self {
        Self {
            inner,
            bytes_per_window: max_mbps * 1024 * 1024,
            window: Mutex::new(Window {
                start: Instant::now(),
                used: 0,
            }),
        }
    }

    /// Blocks (cooperatively) until `len` bytes of budget are available in
    /// the current window, then consumes them.
    async fn acquire(&self, len: u64) {
        loop {
            let wait = {
                let mut w = self.window.lock();
                let elapsed = w.start.elapsed();
                if elapsed >= THROTTLE_WINDOW {
                    w.start = Instant::now();
                    w.used = 0;
                }
                if w.used < self.bytes_per_window {
                    // A request may straddle the cap; letting it through keeps
                    // block-sized reads intact and still bounds the window.
                    w.used += len;
                    return;
                }
                THROTTLE_WINDOW.saturating_sub(elapsed)
            };
            tokio::time::sleep(wait.max(std::time::Duration::from_millis(1))).await;
        }
    }
}

#[async_trait]
impl BlockFile for ThrottledFile {
    async fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            let chunk = (buf.len() - done).min(THROTTLE_BLOCK_SIZE);
            self.acquire(chunk as u64).await;
            let n = self
                .inner
                .pread(&mut buf[done..done + chunk], offset + done as u64)
                .await?;
            done += n;
            if n < chunk {
                break;
            }
        }
        Ok(done)
    }

    async fn fstat(&self) -> Result<Stat> {
        self.inner.fstat().await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    fn filesystem(&self) -> Option<Arc<dyn BlockFs>> {
        self.inner.filesystem()
    }
}
