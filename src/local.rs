//! # Local Filesystem Backing
//!
//! [`BlockFile`]/[`BlockFs`] implementations over the host filesystem.
//! Positional I/O maps straight onto `pread(2)`/`pwrite(2)` via `FileExt`;
//! the operations are short disk syscalls issued inline from the async
//! methods.

use crate::error::{Error, Result};
use crate::file::{BlockFile, BlockFs, OpenOptions, Stat};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fs::File;
use std::io::SeekFrom;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// A file on the host filesystem.
pub struct LocalFile {
    file: File,
    path: String,
    cursor: Mutex<u64>,
}

impl LocalFile {
    fn new(file: File, path: &str) -> Self {
        Self {
            file,
            path: path.to_string(),
            cursor: Mutex::new(0),
        }
    }

    /// Path this file was opened from.
    pub fn path(&self) -> &str {
        &self.path
    }
}

#[async_trait]
impl BlockFile for LocalFile {
    async fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        Ok(self.file.read_at(buf, offset)?)
    }

    async fn pwrite(&self, buf: &[u8], offset: u64) -> Result<usize> {
        Ok(self.file.write_at(buf, offset)?)
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut cursor = self.cursor.lock();
        let n = self.file.read_at(buf, *cursor)?;
        *cursor += n as u64;
        Ok(n)
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut cursor = self.cursor.lock();
        let n = self.file.write_at(buf, *cursor)?;
        *cursor += n as u64;
        Ok(n)
    }

    async fn lseek(&self, pos: SeekFrom) -> Result<u64> {
        let mut cursor = self.cursor.lock();
        let next = match pos {
            SeekFrom::Start(off) => off as i64,
            SeekFrom::Current(delta) => *cursor as i64 + delta,
            SeekFrom::End(delta) => self.file.metadata()?.len() as i64 + delta,
        };
        if next < 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start of file",
            )));
        }
        *cursor = next as u64;
        Ok(*cursor)
    }

    async fn fstat(&self) -> Result<Stat> {
        let meta = self.file.metadata()?;
        Ok(Stat { size: meta.len() })
    }

    async fn ftruncate(&self, len: u64) -> Result<()> {
        Ok(self.file.set_len(len)?)
    }

    async fn fsync(&self) -> Result<()> {
        Ok(self.file.sync_all()?)
    }

    async fn fdatasync(&self) -> Result<()> {
        Ok(self.file.sync_data()?)
    }

    async fn fchmod(&self, mode: u32) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        Ok(self
            .file
            .set_permissions(std::fs::Permissions::from_mode(mode))?)
    }

    fn filesystem(&self) -> Option<Arc<dyn BlockFs>> {
        Some(Arc::new(LocalFs::new()))
    }
}

/// The host filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFs;

impl LocalFs {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BlockFs for LocalFs {
    async fn open(&self, path: &str, opts: OpenOptions) -> Result<Arc<dyn BlockFile>> {
        let mut oo = std::fs::OpenOptions::new();
        oo.read(true)
            .write(opts.write || opts.create)
            .create(opts.create);
        #[cfg(target_os = "linux")]
        if opts.direct {
            use std::os::unix::fs::OpenOptionsExt;
            tracing::debug!(path, "opening with O_DIRECT");
            oo.custom_flags(libc::O_DIRECT);
        }
        let file = oo.open(path)?;
        Ok(Arc::new(LocalFile::new(file, path)))
    }

    async fn access(&self, path: &str) -> bool {
        Path::new(path).exists()
    }

    async fn rename(&self, src: &str, dst: &str) -> Result<()> {
        Ok(std::fs::rename(src, dst)?)
    }
}
