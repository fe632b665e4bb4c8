//! # Image Service
//!
//! Process-wide state shared by every image: the global configuration, the
//! filesystems layers are opened through, the injected external
//! collaborators (codec, LSMT stacker, prefetcher factory), and the two
//! sharing caches.
//!
//! Construct one service per process, wrap it in an `Arc`, and open images
//! through [`ImageService::open_image`].

use crate::cache::FileCache;
use crate::config::{GlobalConfig, ImageConfig};
use crate::error::Result;
use crate::file::{BlockFs, LayerCodec, LowerStacker, PrefetcherFactory, RawCodec};
use crate::image::ImageFile;
use std::sync::Arc;

/// The filesystems the layer opener reaches blobs through.
pub struct GlobalFs {
    /// Serves random reads against remote blobs.
    pub remote_fs: Arc<dyn BlockFs>,
    /// Second channel to the same blobs, used by the background downloader
    /// so bulk copies do not share connections with foreground reads.
    pub src_fs: Arc<dyn BlockFs>,
    /// The host filesystem commit files live on.
    pub local_fs: Arc<dyn BlockFs>,
}

/// Process-wide image service.
pub struct ImageService {
    pub global_conf: GlobalConfig,
    pub fs: GlobalFs,
    pub codec: Arc<dyn LayerCodec>,
    pub stacker: Arc<dyn LowerStacker>,
    pub prefetcher_factory: Option<Arc<dyn PrefetcherFactory>>,
    /// Shared per-layer files, keyed by path or directory.
    pub(crate) opened_files: Arc<FileCache>,
    /// Shared stacked lowers, keyed by the composite layer key.
    pub(crate) opened_lowers: Arc<FileCache>,
}

impl ImageService {
    /// Creates a service with the identity codec and no prefetcher.
    pub fn new(global_conf: GlobalConfig, fs: GlobalFs, stacker: Arc<dyn LowerStacker>) -> Self {
        Self {
            global_conf,
            fs,
            codec: Arc::new(RawCodec),
            stacker,
            prefetcher_factory: None,
            opened_files: FileCache::new("layers"),
            opened_lowers: FileCache::new("lowers"),
        }
    }

    /// Replaces the layer codec.
    pub fn with_codec(mut self, codec: Arc<dyn LayerCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Installs a prefetcher factory.
    pub fn with_prefetcher_factory(mut self, factory: Arc<dyn PrefetcherFactory>) -> Self {
        self.prefetcher_factory = Some(factory);
        self
    }

    /// The shared per-layer file table.
    pub fn layer_cache(&self) -> &Arc<FileCache> {
        &self.opened_files
    }

    /// The shared stacked-lowers table.
    pub fn lowers_cache(&self) -> &Arc<FileCache> {
        &self.opened_lowers
    }

    /// Opens the image described by `conf`: validates it, opens every lower
    /// layer, and stacks them into a single logical volume. Use
    /// [`ImageFile::new`] + [`ImageFile::init`] directly to inspect the
    /// boot status of a failed open.
    pub async fn open_image(self: &Arc<Self>, conf: ImageConfig) -> Result<ImageFile> {
        let image = ImageFile::new(Arc::clone(self), conf)?;
        image.init().await?;
        Ok(image)
    }
}
