//! # Image File and Parallel Layer Loader
//!
//! Opens every lower layer of an image across a bounded worker fan-out,
//! stacks them into a single logical volume, and shares the result
//! process-wide under the composite layer key.
//!
//! ## Failure Model
//!
//! The first error during an image boot wins: it is recorded in the image
//! status (with a distinguished flag for authentication rejections) and all
//! successfully opened layers are closed before the boot fails. Reads after
//! a successful boot never fail because of a failed download.

use crate::config::ImageConfig;
use crate::constants::{PARALLEL_OPEN_WORKERS, TRACE_FILE_NAME};
use crate::error::{Error, Result};
use crate::file::{BlockFile, PrefetchMode};
use crate::layer::OpenContext;
use crate::service::ImageService;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Boot status of one image. The first recorded failure wins; later
/// failures during the same boot do not overwrite it.
#[derive(Default)]
pub struct ImageStatus {
    inner: Mutex<StatusInner>,
}

#[derive(Default)]
struct StatusInner {
    failed: bool,
    auth_failed: bool,
    reason: String,
}

impl ImageStatus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Records a generic boot failure with a human-readable reason.
    pub fn set_failed(&self, reason: impl Into<String>) {
        let mut inner = self.inner.lock();
        if !inner.failed {
            inner.failed = true;
            inner.reason = reason.into();
        }
    }

    /// Records an authentication rejection.
    pub fn set_auth_failed(&self) {
        let mut inner = self.inner.lock();
        if !inner.failed {
            inner.failed = true;
            inner.auth_failed = true;
            inner.reason = "authentication failed".to_string();
        }
    }

    pub fn is_failed(&self) -> bool {
        self.inner.lock().failed
    }

    pub fn is_auth_failed(&self) -> bool {
        self.inner.lock().auth_failed
    }

    /// The recorded failure reason; empty when the boot succeeded.
    pub fn reason(&self) -> String {
        self.inner.lock().reason.clone()
    }
}

/// An image and its boot state: constructed first, booted with
/// [`ImageFile::init`], so the status survives a failed boot and the
/// caller can distinguish an authentication rejection from a generic
/// failure.
pub struct ImageFile {
    ctx: OpenContext,
    lowers: Vec<crate::config::LayerConfig>,
    file: Mutex<Option<Arc<dyn BlockFile>>>,
}

impl ImageFile {
    /// Validates `conf`, resolves the acceleration-layer / trace-recording
    /// policy, and prepares the image for [`init`](ImageFile::init).
    pub fn new(service: Arc<ImageService>, conf: ImageConfig) -> Result<ImageFile> {
        conf.validate()?;
        let status = ImageStatus::new();
        let mut lowers = conf.lowers.clone();
        let mut prefetcher = None;
        let mut record_no_download = false;

        if conf.acceleration_layer && !lowers.is_empty() {
            // The acceleration layer is a pseudo-layer carrying a prefetch
            // trace, not block data; drop it from the stack.
            if let Some(accel) = lowers.pop() {
                info!(dir = %accel.dir, "acceleration layer found, excluded from stack");
                let trace_path = format!("{}/{}", accel.dir, TRACE_FILE_NAME);
                if let Some(factory) = &service.prefetcher_factory {
                    if factory.detect_mode(&trace_path) == PrefetchMode::Replay {
                        prefetcher = Some(factory.open(&trace_path)?);
                    }
                }
            }
        } else if !conf.record_trace_path.is_empty() {
            if let Some(factory) = &service.prefetcher_factory {
                if factory.detect_mode(&conf.record_trace_path) != PrefetchMode::Record {
                    return Err(Error::Config {
                        reason: "incorrect trace mode for recording".to_string(),
                    });
                }
                prefetcher = Some(factory.open(&conf.record_trace_path)?);
            }
            record_no_download = true;
        }

        let ctx = OpenContext {
            service,
            conf,
            status,
            prefetcher,
            record_no_download,
        };
        Ok(ImageFile {
            ctx,
            lowers,
            file: Mutex::new(None),
        })
    }

    /// Boots the image: opens every lower layer and stacks them. On
    /// failure the first error is recorded in [`status`](ImageFile::status)
    /// and no volume is produced.
    pub async fn init(&self) -> Result<()> {
        let file = open_lowers(&self.ctx, &self.lowers).await?;
        *self.file.lock() = Some(file);
        Ok(())
    }

    /// The stacked volume; `None` until a successful [`init`](ImageFile::init).
    pub fn file(&self) -> Option<Arc<dyn BlockFile>> {
        self.file.lock().clone()
    }

    /// Boot status of this image.
    pub fn status(&self) -> &Arc<ImageStatus> {
        &self.ctx.status
    }

    /// Releases the image's reference on the stacked volume.
    pub async fn close(&self) -> Result<()> {
        let file = self.file.lock().take();
        match file {
            Some(file) => file.close().await,
            None => Ok(()),
        }
    }
}

/// Builds the composite identity key over the ordered lowers. A layer with
/// neither `file` nor `dir` is a configuration error naming its index.
fn composite_key(ctx: &OpenContext, lowers: &[crate::config::LayerConfig]) -> Result<String> {
    let mut key = String::new();
    for (index, layer) in lowers.iter().enumerate() {
        let part = if !layer.file.is_empty() {
            &layer.file
        } else if !layer.dir.is_empty() {
            &layer.dir
        } else {
            ctx.status
                .set_failed(format!("config error for layer {index}"));
            return Err(Error::Config {
                reason: format!("layer {index} has neither file nor dir"),
            });
        };
        key.push_str(part);
        key.push(';');
    }
    Ok(key)
}

/// Opens all lower layers across `min(32, N)` workers and stacks them.
/// The stacked file is shared under the composite key; a second image with
/// the same ordered lowers receives the same wrapper.
pub(crate) async fn open_lowers(
    ctx: &OpenContext,
    lowers: &[crate::config::LayerConfig],
) -> Result<Arc<dyn BlockFile>> {
    if lowers.is_empty() {
        return Err(Error::Config {
            reason: "image has no lower layers".to_string(),
        });
    }
    let key = composite_key(ctx, lowers)?;

    let cache = ctx.service.opened_lowers.clone();
    let shared = cache
        .open_shared(&key, || open_and_stack(ctx, lowers))
        .await?;
    let shared: Arc<dyn BlockFile> = shared;
    Ok(shared)
}

async fn open_and_stack(
    ctx: &OpenContext,
    lowers: &[crate::config::LayerConfig],
) -> Result<Arc<dyn BlockFile>> {
    let n = lowers.len();
    let workers = PARALLEL_OPEN_WORKERS.min(n);
    let lowers: Arc<Vec<crate::config::LayerConfig>> = Arc::new(lowers.to_vec());
    let slots: Arc<Vec<Mutex<Option<Arc<dyn BlockFile>>>>> =
        Arc::new((0..n).map(|_| Mutex::new(None)).collect());
    let next_index = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicBool::new(false));
    let first_error: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));

    debug!(workers, layers = n, "opening lower layers");
    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let ctx = ctx.clone();
        let lowers = Arc::clone(&lowers);
        let slots = Arc::clone(&slots);
        let next_index = Arc::clone(&next_index);
        let failed = Arc::clone(&failed);
        let first_error = Arc::clone(&first_error);
        handles.push(tokio::spawn(async move {
            loop {
                let index = next_index.fetch_add(1, Ordering::AcqRel);
                // Stop on exhaustion or once another worker has failed.
                if index >= lowers.len() || failed.load(Ordering::Acquire) {
                    break;
                }
                match ctx.open_lower_layer(&lowers[index], index).await {
                    Ok(file) => {
                        *slots[index].lock() = Some(file);
                    }
                    Err(e) => {
                        error!(index, error = %e, "failed to open lower layer");
                        ctx.status
                            .set_failed(format!("failed to open layer {index}"));
                        let mut slot = first_error.lock();
                        if slot.is_none() {
                            *slot = Some(Error::LayerOpenFailed {
                                index,
                                reason: e.to_string(),
                            });
                        }
                        failed.store(true, Ordering::Release);
                        break;
                    }
                }
            }
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }

    let mut files: Vec<Arc<dyn BlockFile>> = Vec::with_capacity(n);
    let mut complete = !failed.load(Ordering::Acquire);
    for slot in slots.iter() {
        match slot.lock().take() {
            Some(file) => files.push(file),
            None => complete = false,
        }
    }
    if !complete {
        for file in files {
            let _ = file.close().await;
        }
        ctx.status.set_failed("failed to create layered device");
        let recorded = first_error.lock().take();
        return Err(recorded.unwrap_or_else(|| {
            Error::StackFailed("failed to open lower layers".to_string())
        }));
    }

    let stacked = match ctx.service.stacker.stack_lowers(files.clone()).await {
        Ok(stacked) => stacked,
        Err(e) => {
            error!(error = %e, "failed to stack lower layers");
            for file in files {
                let _ = file.close().await;
            }
            ctx.status.set_failed("failed to create layered device");
            return Err(e);
        }
    };
    info!(layers = n, "stacked lower layers");

    if let Some(prefetcher) = &ctx.prefetcher {
        prefetcher.replay();
    }
    Ok(stacked)
}
