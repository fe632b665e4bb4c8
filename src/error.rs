//! Error types for the layer adapter.

use std::path::PathBuf;

/// Result type alias for layer adapter operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the layer adapter.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Missing or invalid configuration.
    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    /// Digest string does not match the canonical format.
    #[error("invalid digest '{digest}': expected sha256: followed by 64 lowercase hex chars")]
    InvalidDigest { digest: String },

    // =========================================================================
    // Layer Errors
    // =========================================================================
    /// Failed to open a layer.
    #[error("failed to open layer {index}: {reason}")]
    LayerOpenFailed { index: usize, reason: String },

    /// Remote open was rejected with a permission error.
    #[error("authentication failed for remote blob '{url}'")]
    AuthFailed { url: String },

    /// Downloaded bytes do not hash to the expected digest.
    #[error("digest mismatch for {path}: expected {expect}, got {got}")]
    IntegrityMismatch {
        path: PathBuf,
        expect: String,
        got: String,
    },

    /// Stacking the lower layers into a single volume failed.
    #[error("failed to stack lower layers: {0}")]
    StackFailed(String),

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation aborted because the owning file is shutting down.
    #[error("operation cancelled")]
    Cancelled,

    /// Capability not provided by this file implementation.
    #[error("operation not supported: {0}")]
    NotSupported(String),
}

impl Error {
    /// True when the error is a remote permission rejection.
    ///
    /// The layer opener uses this to distinguish the image-level
    /// auth-failed status from a generic open failure.
    pub fn is_auth(&self) -> bool {
        match self {
            Error::AuthFailed { .. } => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::PermissionDenied,
            _ => false,
        }
    }
}
