//! # Block File Abstraction
//!
//! The trait surface the layer adapter consumes and produces. Every layer in
//! the per-layer stack (raw local, remote, aligned, throttled, switch,
//! reference-counted) implements [`BlockFile`]; directories of files are
//! reached through [`BlockFs`].
//!
//! ## Capability Model
//!
//! [`BlockFile`] carries the full positional and cursor I/O capability set.
//! Positional reads are the hot path and every implementation provides them;
//! cursor operations (`read`/`write`/`lseek`) and metadata mutators default
//! to [`Error::NotSupported`] so that read-only adapters stay small. Vectored
//! operations default to a loop over their scalar counterparts.
//!
//! ## External Collaborators
//!
//! Decompression codecs, the LSMT lower-stacker, and the prefetcher are
//! external to this crate. They are consumed through the narrow traits at the
//! bottom of this module ([`LayerCodec`], [`LowerStacker`], [`Prefetcher`])
//! and injected into the service at construction time.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::io::SeekFrom;
use std::sync::Arc;

/// Metadata returned by [`BlockFile::fstat`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stat {
    /// File size in bytes.
    pub size: u64,
}

/// Options for [`BlockFs::open`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenOptions {
    /// Open for writing as well as reading.
    pub write: bool,
    /// Create the file if it does not exist (implies `write`).
    pub create: bool,
    /// Bypass the page cache. Offsets and lengths handed to the file must
    /// then respect [`crate::constants::ALIGNMENT`].
    pub direct: bool,
}

impl OpenOptions {
    /// Read-only open.
    pub fn read_only() -> Self {
        Self::default()
    }

    /// Read-write open, creating the file if missing.
    pub fn read_write_create() -> Self {
        Self {
            write: true,
            create: true,
            direct: false,
        }
    }

    /// Adds the direct-I/O flag.
    pub fn with_direct(mut self) -> Self {
        self.direct = true;
        self
    }
}

/// A block-addressable file.
///
/// Implementations must be safe to share across tasks: all operations take
/// `&self` and positional I/O carries its own offset. Reads against the same
/// file may run concurrently.
#[async_trait]
pub trait BlockFile: Send + Sync {
    /// Reads up to `buf.len()` bytes at `offset`. Returns the number of
    /// bytes read; fewer than requested signals end of file.
    async fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Writes `buf` at `offset`, returning the number of bytes written.
    async fn pwrite(&self, _buf: &[u8], _offset: u64) -> Result<usize> {
        Err(Error::NotSupported("pwrite".to_string()))
    }

    /// Vectored positional read. Stops early at end of file.
    async fn preadv(&self, bufs: &mut [&mut [u8]], offset: u64) -> Result<usize> {
        let mut off = offset;
        let mut total = 0;
        for buf in bufs.iter_mut() {
            let want = buf.len();
            let n = self.pread(buf, off).await?;
            total += n;
            off += n as u64;
            if n < want {
                break;
            }
        }
        Ok(total)
    }

    /// Vectored positional write.
    async fn pwritev(&self, bufs: &[&[u8]], offset: u64) -> Result<usize> {
        let mut off = offset;
        let mut total = 0;
        for buf in bufs.iter() {
            let n = self.pwrite(buf, off).await?;
            total += n;
            off += n as u64;
            if n < buf.len() {
                break;
            }
        }
        Ok(total)
    }

    /// Cursor read at the current seek position.
    async fn read(&self, _buf: &mut [u8]) -> Result<usize> {
        Err(Error::NotSupported("read".to_string()))
    }

    /// Vectored cursor read.
    async fn readv(&self, _bufs: &mut [&mut [u8]]) -> Result<usize> {
        Err(Error::NotSupported("readv".to_string()))
    }

    /// Cursor write at the current seek position.
    async fn write(&self, _buf: &[u8]) -> Result<usize> {
        Err(Error::NotSupported("write".to_string()))
    }

    /// Vectored cursor write.
    async fn writev(&self, _bufs: &[&[u8]]) -> Result<usize> {
        Err(Error::NotSupported("writev".to_string()))
    }

    /// Moves the cursor, returning the new position.
    async fn lseek(&self, _pos: SeekFrom) -> Result<u64> {
        Err(Error::NotSupported("lseek".to_string()))
    }

    /// Returns file metadata.
    async fn fstat(&self) -> Result<Stat>;

    /// Truncates or extends the file to `len` bytes.
    async fn ftruncate(&self, _len: u64) -> Result<()> {
        Err(Error::NotSupported("ftruncate".to_string()))
    }

    /// Flushes data and metadata to stable storage.
    async fn fsync(&self) -> Result<()> {
        Ok(())
    }

    /// Flushes data to stable storage.
    async fn fdatasync(&self) -> Result<()> {
        self.fsync().await
    }

    /// Flushes a byte range to stable storage.
    async fn sync_file_range(&self, _offset: u64, _nbytes: u64) -> Result<()> {
        self.fdatasync().await
    }

    /// Changes the file mode.
    async fn fchmod(&self, _mode: u32) -> Result<()> {
        Err(Error::NotSupported("fchmod".to_string()))
    }

    /// Changes the file owner.
    async fn fchown(&self, _uid: u32, _gid: u32) -> Result<()> {
        Err(Error::NotSupported("fchown".to_string()))
    }

    /// Preallocates space. Advisory; the default is a no-op.
    async fn fallocate(&self, _offset: u64, _len: u64) -> Result<()> {
        Ok(())
    }

    /// Releases the file. Adapters that own background work tear it down
    /// here; no operation may start after `close` begins.
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// The filesystem this file was opened from, when it has one.
    fn filesystem(&self) -> Option<Arc<dyn BlockFs>> {
        None
    }
}

/// A directory tree of block files, local or remote.
#[async_trait]
pub trait BlockFs: Send + Sync {
    /// Opens `path` (a filesystem path, or a URL for remote filesystems).
    async fn open(&self, path: &str, opts: OpenOptions) -> Result<Arc<dyn BlockFile>>;

    /// Existence probe.
    async fn access(&self, path: &str) -> bool;

    /// Atomically renames `src` to `dst`.
    async fn rename(&self, src: &str, dst: &str) -> Result<()>;
}

// =============================================================================
// External Collaborator Interfaces
// =============================================================================

/// Decompression codec, applied as the outermost element of the per-layer
/// decode stack.
///
/// `verify_checksum` enforces the codec's embedded block checksums; local
/// backings bypass them (the whole-file digest was verified at download
/// time), remote backings enforce them.
pub trait LayerCodec: Send + Sync {
    fn open_ro(&self, file: Arc<dyn BlockFile>, verify_checksum: bool)
        -> Result<Arc<dyn BlockFile>>;
}

/// Identity codec for layers stored without compression.
pub struct RawCodec;

impl LayerCodec for RawCodec {
    fn open_ro(
        &self,
        file: Arc<dyn BlockFile>,
        _verify_checksum: bool,
    ) -> Result<Arc<dyn BlockFile>> {
        Ok(file)
    }
}

/// Combines an ordered list of read-only layer files into a single logical
/// volume. LSMT internals live outside this crate.
#[async_trait]
pub trait LowerStacker: Send + Sync {
    async fn stack_lowers(&self, lowers: Vec<Arc<dyn BlockFile>>) -> Result<Arc<dyn BlockFile>>;
}

/// Operating mode detected from a trace file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchMode {
    /// The trace file is being written: record accesses.
    Record,
    /// The trace file carries recorded hints: replay them.
    Replay,
    /// No usable trace.
    Disabled,
}

/// Block-access prefetcher driven by a recorded trace.
pub trait Prefetcher: Send + Sync {
    /// The mode this prefetcher was opened in.
    fn mode(&self) -> PrefetchMode;

    /// Wraps a layer file so its reads feed (record) or are fed by (replay)
    /// the trace.
    fn wrap(&self, file: Arc<dyn BlockFile>, layer_index: usize) -> Arc<dyn BlockFile>;

    /// Kicks off replay of the recorded hints. No-op in record mode.
    fn replay(&self);
}

/// Factory for prefetchers; lets the embedding service supply its own
/// implementation without this crate knowing the trace format.
pub trait PrefetcherFactory: Send + Sync {
    /// Inspects `trace_path` and reports how a prefetcher opened on it
    /// would operate.
    fn detect_mode(&self, trace_path: &str) -> PrefetchMode;

    /// Opens a prefetcher on `trace_path`.
    fn open(&self, trace_path: &str) -> Result<Arc<dyn Prefetcher>>;
}
