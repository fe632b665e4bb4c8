//! # Configuration Surface
//!
//! Serde-parsed configuration for the layer adapter. Field names follow the
//! camelCase wire format of the embedding daemon's JSON config
//! (`repoBlobUrl`, `ioEngine`, `download.maxMBps`, ...).
//!
//! ## Validation
//!
//! Parsing is lenient (every field has a default); [`ImageConfig::validate`]
//! enforces the boot-time rules:
//!
//! - `download.tryCnt <= 0` and `download.maxMBps < 0` are configuration
//!   errors, whether or not downloads are enabled.
//! - `accelerationLayer` and `recordTracePath` are mutually exclusive.
//! - Remote layers (no `file` path) must carry a canonical digest.
//!
//! `download.delayExtra < 0` is not an error: it selects the default jitter
//! range at the point the download task is constructed.

use crate::digest::is_valid_digest;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

/// I/O engine used for local commit files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoEngine {
    /// Synchronous positional I/O.
    Psync,
    /// Linux AIO; requires direct I/O and the alignment adapter.
    Libaio,
    /// POSIX AIO.
    PosixAio,
}

impl IoEngine {
    /// Maps the configured integer onto an engine. Out-of-range values
    /// degrade to psync with a warning.
    pub fn from_config(value: i64) -> Self {
        match value {
            0 => IoEngine::Psync,
            1 => IoEngine::Libaio,
            2 => IoEngine::PosixAio,
            _ => {
                warn!(io_engine = value, "invalid ioEngine, set to psync");
                IoEngine::Psync
            }
        }
    }

    /// True when the engine bypasses the page cache and needs the
    /// alignment adapter on top of raw files.
    pub fn is_direct(self) -> bool {
        matches!(self, IoEngine::Libaio)
    }
}

/// Process-wide configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalConfig {
    /// I/O engine selector: 0 = psync, 1 = libaio, 2 = posixaio.
    pub io_engine: i64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self { io_engine: 0 }
    }
}

impl GlobalConfig {
    /// The resolved I/O engine (with out-of-range fallback).
    pub fn engine(&self) -> IoEngine {
        IoEngine::from_config(self.io_engine)
    }
}

/// Background download tuning for remote layers.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DownloadConfig {
    /// Whether remote layers are materialized in the background.
    pub enable: bool,
    /// Base start delay in seconds.
    pub delay: u64,
    /// Jitter range in seconds added to the base delay; negative selects
    /// the built-in default range.
    pub delay_extra: i64,
    /// Download throughput cap in MiB/s; 0 disables throttling.
    #[serde(rename = "maxMBps")]
    pub max_mbps: i64,
    /// Attempts per layer before giving up.
    pub try_cnt: i64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            enable: false,
            delay: 0,
            delay_extra: -1,
            max_mbps: 0,
            try_cnt: 1,
        }
    }
}

impl DownloadConfig {
    fn validate(&self) -> Result<()> {
        if self.try_cnt <= 0 {
            return Err(Error::Config {
                reason: format!("download.tryCnt must be positive, got {}", self.try_cnt),
            });
        }
        if self.max_mbps < 0 {
            return Err(Error::Config {
                reason: format!("download.maxMBps must not be negative, got {}", self.max_mbps),
            });
        }
        Ok(())
    }
}

/// One lower layer. Either `file` names a pre-materialized local path, or
/// `(dir, digest, size)` identifies a remote blob and the directory its
/// commit file will live in.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LayerConfig {
    /// Local path of an already-materialized layer; empty for remote layers.
    pub file: String,
    /// Directory holding (or destined to hold) the layer's commit file.
    pub dir: String,
    /// Canonical content digest of the layer blob.
    pub digest: String,
    /// Blob size in bytes.
    pub size: u64,
}

/// Per-image configuration: the ordered lower layers plus download policy.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageConfig {
    /// Base URL for remote layer blobs; empty is a hard failure for
    /// remote layers.
    pub repo_blob_url: String,
    /// Lower layers, bottom to top.
    pub lowers: Vec<LayerConfig>,
    /// Whether the last lower is a prefetch-trace acceleration layer.
    pub acceleration_layer: bool,
    /// Path of a trace file to record into; empty disables recording.
    pub record_trace_path: String,
    /// Background download policy.
    pub download: DownloadConfig,
}

impl ImageConfig {
    /// Parses an image config from JSON.
    pub fn from_json(data: &str) -> Result<Self> {
        let conf: ImageConfig = serde_json::from_str(data).map_err(|e| Error::Config {
            reason: format!("failed to parse image config: {e}"),
        })?;
        conf.validate()?;
        Ok(conf)
    }

    /// Parses an image config from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| Error::Config {
            reason: format!("failed to read image config {}: {e}", path.display()),
        })?;
        Self::from_json(&data)
    }

    /// Boot-time validation. First error wins; see the module docs for the
    /// rules enforced here.
    pub fn validate(&self) -> Result<()> {
        self.download.validate()?;
        if self.acceleration_layer && !self.record_trace_path.is_empty() {
            return Err(Error::Config {
                reason: "cannot record trace while acceleration layer exists".to_string(),
            });
        }
        for (index, layer) in self.lowers.iter().enumerate() {
            if layer.file.is_empty() && !is_valid_digest(&layer.digest) {
                return Err(Error::InvalidDigest {
                    digest: format!("layer {index}: '{}'", layer.digest),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_DIGEST: &str =
        "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_parse_camel_case_fields() {
        let conf = ImageConfig::from_json(&format!(
            r#"{{
                "repoBlobUrl": "https://registry.example.com/v2/app/blobs",
                "lowers": [{{"dir": "/var/lib/layers/0", "digest": "{SAMPLE_DIGEST}", "size": 4096}}],
                "download": {{"enable": true, "delay": 2, "delayExtra": 5, "maxMBps": 100, "tryCnt": 3}}
            }}"#
        ))
        .unwrap();

        assert_eq!(conf.repo_blob_url, "https://registry.example.com/v2/app/blobs");
        assert_eq!(conf.lowers.len(), 1);
        assert_eq!(conf.download.max_mbps, 100);
        assert_eq!(conf.download.try_cnt, 3);
    }

    #[test]
    fn test_defaults() {
        let conf = ImageConfig::from_json("{}").unwrap();
        assert!(!conf.download.enable);
        assert_eq!(conf.download.delay_extra, -1);
        assert_eq!(conf.download.try_cnt, 1);
    }

    #[test]
    fn test_try_cnt_must_be_positive() {
        let result = ImageConfig::from_json(
            r#"{"download": {"enable": true, "tryCnt": 0}}"#,
        );
        assert!(result.is_err(), "tryCnt = 0 should be rejected");
    }

    #[test]
    fn test_negative_max_mbps_rejected() {
        let result = ImageConfig::from_json(
            r#"{"download": {"enable": true, "tryCnt": 1, "maxMBps": -5}}"#,
        );
        assert!(result.is_err(), "negative maxMBps should be rejected");
    }

    #[test]
    fn test_numeric_rules_apply_even_when_downloads_are_off() {
        let result = ImageConfig::from_json(
            r#"{"download": {"enable": false, "tryCnt": 0, "maxMBps": -5}}"#,
        );
        assert!(result.is_err(), "numeric rules hold regardless of enable");
    }

    #[test]
    fn test_acceleration_layer_excludes_trace_recording() {
        let result = ImageConfig::from_json(
            r#"{"accelerationLayer": true, "recordTracePath": "/tmp/trace"}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_remote_layer_requires_valid_digest() {
        let result = ImageConfig::from_json(
            r#"{"lowers": [{"dir": "/var/lib/layers/0", "digest": "sha256:short", "size": 1}]}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_io_engine_fallback() {
        assert_eq!(IoEngine::from_config(0), IoEngine::Psync);
        assert_eq!(IoEngine::from_config(1), IoEngine::Libaio);
        assert_eq!(IoEngine::from_config(2), IoEngine::PosixAio);
        assert_eq!(IoEngine::from_config(7), IoEngine::Psync);
        assert_eq!(IoEngine::from_config(-1), IoEngine::Psync);
    }
}
