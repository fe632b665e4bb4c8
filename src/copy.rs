//! # Aligned-Copy Engine
//!
//! Copies a source file to a destination in fixed-size blocks from a
//! 4 KiB-aligned buffer, with bounded per-block retry and cooperative
//! cancellation. Writes are quantized to the block size so the destination
//! may be opened with direct I/O; the final truncate removes the pad.

use crate::constants::ALIGNMENT;
use crate::error::{Error, Result};
use crate::file::BlockFile;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Heap buffer aligned to [`ALIGNMENT`], usable with direct I/O.
pub(crate) struct AlignedBuf {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

impl AlignedBuf {
    pub(crate) fn new(len: usize) -> Result<Self> {
        let layout = Layout::from_size_align(len, ALIGNMENT).map_err(|e| Error::Config {
            reason: format!("invalid buffer geometry ({len} bytes): {e}"),
        })?;
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                format!("failed to allocate {len} byte aligned buffer"),
            ))
        })?;
        Ok(Self { ptr, len, layout })
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

// The buffer is plain owned memory.
unsafe impl Send for AlignedBuf {}
unsafe impl Sync for AlignedBuf {}

/// Copies `src` to `dst` from offset 0 until a short read signals EOF.
/// Returns the number of bytes copied.
///
/// Each block is read with up to `retry_limit` attempts; writes always cover
/// the full block so direct-I/O destinations stay legal, and a write shorter
/// than the read retries under the same budget. `running` is checked before
/// every block; a cleared flag aborts with [`Error::Cancelled`].
pub async fn copy_file(
    src: &Arc<dyn BlockFile>,
    dst: &Arc<dyn BlockFile>,
    block_size: usize,
    retry_limit: u32,
    running: &AtomicBool,
) -> Result<u64> {
    if block_size == 0 {
        return Err(Error::Config {
            reason: "copy block size must not be 0".to_string(),
        });
    }
    let mut buf = AlignedBuf::new(block_size)?;
    let mut offset: u64 = 0;
    let mut count = block_size;

    while count == block_size {
        if !running.load(Ordering::Acquire) {
            info!("file destroyed while copying in the background");
            return Err(Error::Cancelled);
        }

        let mut attempts = retry_limit;
        let rlen = loop {
            if attempts == 0 {
                return Err(Error::Io(std::io::Error::other(format!(
                    "failed to read {block_size} bytes at offset {offset}"
                ))));
            }
            attempts -= 1;
            match src.pread(buf.as_mut_slice(), offset).await {
                Ok(n) => break n,
                Err(e) => debug!(offset, error = %e, "copy read failed, retrying"),
            }
        };

        let mut attempts = retry_limit;
        loop {
            if attempts == 0 {
                return Err(Error::Io(std::io::Error::other(format!(
                    "failed to write {block_size} bytes at offset {offset}"
                ))));
            }
            attempts -= 1;
            // Write the whole block to stay aligned on direct-I/O
            // destinations; written >= read is success.
            match dst.pwrite(buf.as_slice(), offset).await {
                Ok(wlen) if wlen >= rlen => break,
                Ok(wlen) => debug!(offset, wlen, rlen, "short copy write, retrying"),
                Err(e) => debug!(offset, error = %e, "copy write failed, retrying"),
            }
        }

        count = rlen;
        offset += rlen as u64;
    }

    // The last block was padded to block_size; cut the file to its true length.
    dst.ftruncate(offset).await?;
    Ok(offset)
}
