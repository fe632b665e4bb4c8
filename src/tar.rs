//! # Tar-Framing Shim
//!
//! Some layer blobs arrive wrapped in a single-entry tar archive. This shim
//! probes the 512-byte header and, when the ustar magic is present, exposes
//! the entry payload as the file; anything else passes through untouched.
//! Full tar handling lives outside this crate.

use crate::error::Result;
use crate::file::{BlockFile, BlockFs, Stat};
use async_trait::async_trait;
use std::sync::Arc;

const HEADER_SIZE: u64 = 512;
const MAGIC_OFFSET: usize = 257;
const MAGIC: &[u8] = b"ustar";
const SIZE_FIELD: std::ops::Range<usize> = 124..136;

/// Probes `file` for a tar header. Returns a payload view when the magic
/// matches, the unmodified file otherwise.
pub async fn tar_shim(file: Arc<dyn BlockFile>) -> Result<Arc<dyn BlockFile>> {
    let mut header = [0u8; HEADER_SIZE as usize];
    let n = file.pread(&mut header, 0).await?;
    if n < HEADER_SIZE as usize || &header[MAGIC_OFFSET..MAGIC_OFFSET + MAGIC.len()] != MAGIC {
        return Ok(file);
    }
    let payload_size = parse_octal(&header[SIZE_FIELD]);
    Ok(Arc::new(TarPayloadFile { inner: file, payload_size }))
}

fn parse_octal(field: &[u8]) -> u64 {
    let mut value = 0u64;
    for &b in field {
        match b {
            b'0'..=b'7' => value = value * 8 + (b - b'0') as u64,
            _ => break,
        }
    }
    value
}

/// Read view of the first entry's payload inside a tar archive.
struct TarPayloadFile {
    inner: Arc<dyn BlockFile>,
    payload_size: u64,
}

#[async_trait]
impl BlockFile for TarPayloadFile {
    async fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if offset >= self.payload_size {
            return Ok(0);
        }
        let span = ((self.payload_size - offset) as usize).min(buf.len());
        self.inner.pread(&mut buf[..span], HEADER_SIZE + offset).await
    }

    async fn fstat(&self) -> Result<Stat> {
        Ok(Stat {
            size: self.payload_size,
        })
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    fn filesystem(&self) -> Option<Arc<dyn BlockFs>> {
        self.inner.filesystem()
    }
}
