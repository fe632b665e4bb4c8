//! # Layer Opener
//!
//! Builds the per-layer file stack and selects the backing at open time:
//!
//! - a `file` path opens the local file directly (alignment adapter under
//!   direct-mode engines) behind an audit-only switch file;
//! - a `(dir, digest)` identity first probes the shared cache, then the
//!   commit file on disk, and only then the remote blob, optionally arming
//!   a background download.
//!
//! Remote layers are shared process-wide: every opener of the same
//! directory receives the same reference-counted file, and at most one
//! download task exists per layer.

use crate::align::AlignedFile;
use crate::config::{ImageConfig, LayerConfig};
use crate::constants::COMMIT_FILE_NAME;
use crate::download::check_downloaded;
use crate::error::{Error, Result};
use crate::file::{BlockFile, OpenOptions, Prefetcher};
use crate::image::ImageStatus;
use crate::service::ImageService;
use crate::switch::SwitchFile;
use std::sync::Arc;
use tracing::debug;

/// Everything a worker needs to open one layer. Cheap to clone; the
/// parallel loader hands one to each worker task.
#[derive(Clone)]
pub(crate) struct OpenContext {
    pub service: Arc<ImageService>,
    pub conf: ImageConfig,
    pub status: Arc<ImageStatus>,
    pub prefetcher: Option<Arc<dyn Prefetcher>>,
    /// Trace recording is in progress: background downloads stay off so
    /// the recorded access pattern reflects remote reads.
    pub record_no_download: bool,
}

impl OpenContext {
    /// Opens a local layer file behind an audit-only switch file. Direct
    /// engines add the alignment adapter.
    pub(crate) async fn open_ro_file(&self, path: &str) -> Result<Arc<dyn BlockFile>> {
        let engine = self.service.global_conf.engine();
        let mut opts = OpenOptions::read_only();
        if engine.is_direct() {
            opts = opts.with_direct();
        }
        debug!(path, ?engine, "open ro file");

        let file = match self.service.fs.local_fs.open(path, opts).await {
            Ok(f) => f,
            Err(e) => {
                self.status
                    .set_failed(format!("failed to open local file {path}"));
                return Err(e);
            }
        };
        let file: Arc<dyn BlockFile> = if engine.is_direct() {
            Arc::new(AlignedFile::new(file))
        } else {
            file
        };

        match SwitchFile::new(
            file,
            true,
            path,
            self.service.fs.local_fs.clone(),
            self.service.codec.clone(),
        )
        .await
        {
            Ok(switch) => {
                let switch: Arc<dyn BlockFile> = switch;
                Ok(switch)
            }
            Err(e) => {
                self.status
                    .set_failed(format!("failed to open switch file {path}"));
                Err(e)
            }
        }
    }

    /// Opens a remote layer through the shared cache. On a miss, prefers
    /// the commit file when it is already on disk, otherwise opens the
    /// remote blob and, when downloads are enabled, arms the background
    /// download targeting the commit file.
    pub(crate) async fn open_ro_remote_share(
        &self,
        dir: &str,
        digest: &str,
        size: u64,
    ) -> Result<Arc<dyn BlockFile>> {
        let cache = self.service.opened_files.clone();
        let shared = cache
            .open_shared(dir, || async {
                let commit_path = format!("{dir}/{COMMIT_FILE_NAME}");
                if check_downloaded(&self.service.fs.local_fs, &commit_path).await {
                    return self.open_ro_file(&commit_path).await;
                }
                self.open_remote_blob(digest, size, &commit_path).await
            })
            .await?;
        let shared: Arc<dyn BlockFile> = shared;
        Ok(shared)
    }

    async fn open_remote_blob(
        &self,
        digest: &str,
        size: u64,
        commit_path: &str,
    ) -> Result<Arc<dyn BlockFile>> {
        if self.conf.repo_blob_url.is_empty() {
            self.status.set_failed("empty repoBlobUrl");
            return Err(Error::Config {
                reason: "empty repoBlobUrl for remote layer".to_string(),
            });
        }
        let mut url = self.conf.repo_blob_url.clone();
        if !url.ends_with('/') {
            url.push('/');
        }
        url.push_str(digest);
        debug!(url, size, "open remote blob");

        let remote = match self.service.fs.remote_fs.open(&url, OpenOptions::read_only()).await {
            Ok(f) => f,
            Err(e) => {
                if e.is_auth() {
                    self.status.set_auth_failed();
                } else {
                    self.status
                        .set_failed(format!("failed to open remote file {url}"));
                }
                return Err(e);
            }
        };

        let switch = if self.conf.download.enable && !self.record_no_download {
            let source = match self.service.fs.src_fs.open(&url, OpenOptions::read_only()).await {
                Ok(f) => f,
                Err(e) => {
                    self.status
                        .set_failed(format!("failed to open download source {url}"));
                    return Err(e);
                }
            };
            SwitchFile::with_download(
                remote,
                source,
                digest,
                commit_path,
                &self.conf.download,
                self.service.fs.local_fs.clone(),
                self.service.codec.clone(),
            )
            .await
        } else {
            SwitchFile::new(
                remote,
                false,
                commit_path,
                self.service.fs.local_fs.clone(),
                self.service.codec.clone(),
            )
            .await
        };

        match switch {
            Ok(file) => {
                let file: Arc<dyn BlockFile> = file;
                Ok(file)
            }
            Err(e) => {
                self.status
                    .set_failed(format!("failed to open switch file {url}"));
                Err(e)
            }
        }
    }

    /// Opens a remote layer and threads it through the prefetcher when one
    /// is active.
    pub(crate) async fn open_ro_remote(
        &self,
        dir: &str,
        digest: &str,
        size: u64,
        index: usize,
    ) -> Result<Arc<dyn BlockFile>> {
        let file = self.open_ro_remote_share(dir, digest, size).await?;
        Ok(match &self.prefetcher {
            Some(p) => p.wrap(file, index),
            None => file,
        })
    }

    /// Opens lower layer `index`: a local `file` path takes precedence over
    /// the remote `(dir, digest, size)` identity.
    pub(crate) async fn open_lower_layer(
        &self,
        layer: &LayerConfig,
        index: usize,
    ) -> Result<Arc<dyn BlockFile>> {
        let file = if !layer.file.is_empty() {
            self.open_ro_file(&layer.file).await?
        } else {
            self.open_ro_remote(&layer.dir, &layer.digest, layer.size, index)
                .await?
        };
        debug!(index, "layer opened");
        Ok(file)
    }
}
