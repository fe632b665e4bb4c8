//! # Alignment Read Adapter
//!
//! Wraps a direct-I/O file so callers can issue arbitrary `pread` ranges.
//! Each request is widened to [`ALIGNMENT`] boundaries, read into an aligned
//! scratch buffer, and the requested span copied out.

use crate::constants::ALIGNMENT;
use crate::copy::AlignedBuf;
use crate::error::Result;
use crate::file::{BlockFile, BlockFs, Stat};
use async_trait::async_trait;
use std::sync::Arc;

/// Read adapter over a file opened with direct I/O.
pub struct AlignedFile {
    inner: Arc<dyn BlockFile>,
}

impl AlignedFile {
    pub fn new(inner: Arc<dyn BlockFile>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl BlockFile for AlignedFile {
    async fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let align = ALIGNMENT as u64;
        let begin = offset / align * align;
        let end = (offset + buf.len() as u64).div_ceil(align) * align;
        let span = (end - begin) as usize;

        let mut scratch = AlignedBuf::new(span)?;
        let n = self.inner.pread(scratch.as_mut_slice(), begin).await?;

        let head = (offset - begin) as usize;
        if n <= head {
            return Ok(0);
        }
        let avail = n - head;
        let copied = avail.min(buf.len());
        buf[..copied].copy_from_slice(&scratch.as_slice()[head..head + copied]);
        Ok(copied)
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
