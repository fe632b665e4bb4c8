//! Constants for the layer adapter.
//!
//! All file names, block sizes, intervals, and limits are defined here to
//! ensure consistency and prevent magic numbers throughout the codebase.

use std::time::Duration;

// =============================================================================
// On-Disk Layout
// =============================================================================

/// File name of a materialized layer inside its directory.
/// Presence of this file is authoritative: if it exists, the layer is local.
pub const COMMIT_FILE_NAME: &str = "overlaybd.commit";

/// Suffix appended to the commit path while a download is in flight.
/// The final rename from `<commit>.download` to `<commit>` is the handoff.
pub const DOWNLOAD_SUFFIX: &str = ".download";

/// File name of the prefetch trace inside an acceleration layer directory.
pub const TRACE_FILE_NAME: &str = "trace";

// =============================================================================
// I/O Geometry
// =============================================================================

/// Buffer alignment for direct I/O (bytes).
pub const ALIGNMENT: usize = 4096;

/// Block size used when hashing a local file (64 KiB).
pub const HASH_BLOCK_SIZE: usize = 64 * 1024;

/// Block size used when copying a layer to disk (1 MiB).
pub const COPY_BLOCK_SIZE: usize = 1024 * 1024;

/// Per-block read/write retry budget inside a single copy attempt.
pub const COPY_RETRY_LIMIT: u32 = 1;

/// Block size of the download throughput limiter (1 MiB).
pub const THROTTLE_BLOCK_SIZE: usize = 1024 * 1024;

/// Accounting window of the download throughput limiter.
pub const THROTTLE_WINDOW: Duration = Duration::from_secs(1);

// =============================================================================
// Scheduling Intervals
// =============================================================================

/// Poll interval while waiting for the process-wide download gate.
pub const GATE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Poll interval while draining in-flight reads during a backing switch.
pub const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Local `pread` calls slower than this are reported.
pub const AUDIT_THRESHOLD: Duration = Duration::from_millis(10);

// =============================================================================
// Limits and Defaults
// =============================================================================

/// Maximum number of concurrent workers opening lower layers.
pub const PARALLEL_OPEN_WORKERS: usize = 32;

/// Default jitter range (seconds) when `download.delayExtra` is negative.
pub const DEFAULT_DELAY_EXTRA: i64 = 30;

/// Length of the hex portion of a layer digest.
pub const DIGEST_HEX_LEN: usize = 64;

/// Digest string prefix. The full format is this prefix followed by
/// [`DIGEST_HEX_LEN`] lowercase hexadecimal characters.
pub const DIGEST_PREFIX: &str = "sha256:";
