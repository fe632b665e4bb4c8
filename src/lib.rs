//! # lazylayer
//!
//! **Lazy-Materializing Container Image Layer Files**
//!
//! This crate exposes container image layers as block-addressable read
//! files. Each layer starts out backed by a remote blob store and, over
//! time, is materialized to local disk by a rate-limited background
//! download with integrity verification. The switchover from remote to
//! local happens atomically, without disrupting in-flight reads.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                           lazylayer                                 │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │                  Parallel Layer Loader                      │    │
//! │  │   open_image → min(32, N) workers → LSMT stacker            │    │
//! │  └───────────────────────────┬─────────────────────────────────┘    │
//! │                              │                                      │
//! │  ┌───────────────────────────┼───────────────────────────────┐      │
//! │  │                   Layer Opener                            │      │
//! │  │  shared cache │ commit-file probe │ remote open + download│      │
//! │  └───────────────────────────┬───────────────────────────────┘      │
//! │                              │                                      │
//! │  ┌───────────────────────────┼───────────────────────────────┐      │
//! │  │                   Switch File                             │      │
//! │  │  Remote → ReadyToSwap → Swapping → Local                  │      │
//! │  │  reader-safe swap │ pread audit │ decode stack            │      │
//! │  └───────────────────────────┬───────────────────────────────┘      │
//! │                              │                                      │
//! │  ┌──────────────┐  ┌─────────┴─────┐  ┌──────────────┐              │
//! │  │  Download    │  │  Aligned-Copy │  │    Digest    │              │
//! │  │  Coordinator │  │    Engine     │  │    Hasher    │              │
//! │  │ single-flight│  │ 4K alignment  │  │  sha256:hex  │              │
//! │  └──────────────┘  └───────────────┘  └──────────────┘              │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Layer Lifecycle
//!
//! ```text
//!   ┌────────┐  download ok   ┌─────────────┐  next read  ┌──────────┐
//!   │ Remote │ ─────────────► │ ReadyToSwap │ ──────────► │ Swapping │
//!   └────────┘                └─────────────┘             └────┬─────┘
//!        ▲                                                     │ inflight = 0
//!        │ commit-file open failed                             ▼
//!        └───────────────────────────────────────────────┌─────────┐
//!                                                        │  Local  │
//!                                                        └─────────┘
//! ```
//!
//! A layer that never finishes downloading simply stays `Remote`: reads
//! keep working against the blob store, just without local acceleration.
//!
//! # Key Properties
//!
//! - **Swap safety**: the backing is replaced only when no read is in
//!   flight; no read started before the swap observes the new backing and
//!   none started after observes the old one.
//! - **At-most-one download**: a process-wide single-flight gate serializes
//!   active downloads, so the per-download throughput cap is meaningful
//!   against total provisioned bandwidth.
//! - **Integrity**: a commit file only appears under its final name after
//!   its SHA-256 digest verified; the rename is the sole handoff.
//! - **Sharing**: identity-keyed caches return the same reference-counted
//!   file to every opener of a layer (and of a whole lower stack), with
//!   deterministic release on the last close.
//!
//! # External Collaborators
//!
//! The decompression codec, the LSMT lower-stacker, and the prefetcher are
//! consumed through narrow traits ([`LayerCodec`], [`LowerStacker`],
//! [`Prefetcher`]) and injected into the [`ImageService`].
//!
//! # Example
//!
//! ```rust,ignore
//! use lazylayer::{GlobalConfig, GlobalFs, ImageConfig, ImageService, LocalFs};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> lazylayer::Result<()> {
//!     let local_fs = Arc::new(LocalFs::new());
//!     let service = Arc::new(ImageService::new(
//!         GlobalConfig::default(),
//!         GlobalFs {
//!             remote_fs: my_registry_fs.clone(),
//!             src_fs: my_registry_fs,
//!             local_fs,
//!         },
//!         my_lsmt_stacker,
//!     ));
//!
//!     let conf = ImageConfig::from_file("/etc/myimage/config.json".as_ref())?;
//!     let image = service.open_image(conf).await?;
//!     let volume = image.file().expect("open_image returned a booted image");
//!
//!     let mut buf = vec![0u8; 4096];
//!     volume.pread(&mut buf, 0).await?;
//!     image.close().await?;
//!     Ok(())
//! }
//! ```

// =============================================================================
// Internal Modules
// =============================================================================

mod align;
mod cache;
mod config;
mod constants;
mod copy;
mod digest;
mod download;
mod error;
mod file;
mod image;
mod layer;
mod local;
mod service;
mod switch;
mod tar;
mod throttle;

// =============================================================================
// Public API
// =============================================================================

// Errors
pub use crate::error::{Error, Result};

// Configuration
pub use crate::config::{DownloadConfig, GlobalConfig, ImageConfig, IoEngine, LayerConfig};

// File abstraction and external collaborator interfaces
pub use crate::file::{
    BlockFile, BlockFs, LayerCodec, LowerStacker, OpenOptions, PrefetchMode, Prefetcher,
    PrefetcherFactory, RawCodec, Stat,
};

// Local filesystem backing
pub use crate::local::{LocalFile, LocalFs};

// Adapters
pub use crate::align::AlignedFile;
pub use crate::switch::{Phase, SwitchFile};
pub use crate::tar::tar_shim;
pub use crate::throttle::ThrottledFile;

// Digest hashing and copying
pub use crate::copy::copy_file;
pub use crate::digest::{is_valid_digest, sha256_file};

// Background downloads
pub use crate::download::{check_downloaded, download_active, download_blob, DownloadOptions};

// Sharing cache
pub use crate::cache::{FileCache, RefFile};

// Image service
pub use crate::image::{ImageFile, ImageStatus};
pub use crate::service::{GlobalFs, ImageService};

// On-disk names and tuning constants consumers may need
pub use crate::constants::{
    ALIGNMENT, AUDIT_THRESHOLD, COMMIT_FILE_NAME, DOWNLOAD_SUFFIX, PARALLEL_OPEN_WORKERS,
    TRACE_FILE_NAME,
};
