//! # Layer Digest Hashing
//!
//! Streams a local file into a SHA-256 state and emits the canonical
//! `sha256:<64 lowercase hex>` digest string. Hashing is CPU- and disk-bound,
//! so it runs on a blocking thread; the awaiting task suspends until the
//! result lands.

use crate::constants::{DIGEST_HEX_LEN, DIGEST_PREFIX, HASH_BLOCK_SIZE};
use crate::copy::AlignedBuf;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::warn;

/// True when `s` is exactly `sha256:` followed by 64 lowercase hex chars.
pub fn is_valid_digest(s: &str) -> bool {
    s.len() == DIGEST_PREFIX.len() + DIGEST_HEX_LEN
        && s.starts_with(DIGEST_PREFIX)
        && s.as_bytes()[DIGEST_PREFIX.len()..]
            .iter()
            .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Hashes the file at `path` and returns its canonical digest string.
///
/// Any open, stat, or read failure logs a warning and returns the empty
/// string; callers treat empty as a digest mismatch.
pub async fn sha256_file(path: &Path) -> String {
    let path: PathBuf = path.to_path_buf();
    let result = tokio::task::spawn_blocking(move || match hash_file_sync(&path) {
        Ok(digest) => digest,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to hash file");
            String::new()
        }
    })
    .await;

    match result {
        Ok(digest) => digest,
        Err(e) => {
            warn!(error = %e, "hash worker failed");
            String::new()
        }
    }
}

fn hash_file_sync(path: &Path) -> std::io::Result<String> {
    use std::os::unix::fs::FileExt;

    // Direct I/O where supported; the buffer below is aligned for it.
    let file = open_unbuffered(path).or_else(|_| File::open(path))?;
    let size = file.metadata()?.len();

    let mut ctx = Sha256::new();
    let mut buf = AlignedBuf::new(HASH_BLOCK_SIZE)
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    let mut offset: u64 = 0;
    while offset < size {
        let n = file.read_at(buf.as_mut_slice(), offset)?;
        if n == 0 {
            break;
        }
        ctx.update(&buf.as_slice()[..n]);
        offset += n as u64;
    }

    Ok(format!("{DIGEST_PREFIX}{}", hex::encode(ctx.finalize())))
}

#[cfg(target_os = "linux")]
fn open_unbuffered(path: &Path) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_DIRECT)
        .open(path)
}

#[cfg(not(target_os = "linux"))]
fn open_unbuffered(path: &Path) -> std::io::Result<File> {
    File::open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_digest_format_validation() {
        assert!(is_valid_digest(
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        ));
        assert!(!is_valid_digest("sha256:short"));
        assert!(!is_valid_digest(
            "sha512:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        ));
        // uppercase hex is not canonical
        assert!(!is_valid_digest(
            "sha256:E3B0C44298FC1C149AFBF4C8996FB92427AE41E4649B934CA495991B7852B855"
        ));
        assert!(!is_valid_digest(""));
    }

    #[tokio::test]
    async fn test_sha256_file_known_value() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("blob");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"hello world").unwrap();
        drop(f);

        let digest = sha256_file(&path).await;
        assert_eq!(
            digest,
            "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn test_sha256_file_deterministic() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("blob");
        let data: Vec<u8> = (0..HASH_BLOCK_SIZE * 3 + 17).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let first = sha256_file(&path).await;
        let second = sha256_file(&path).await;
        assert!(is_valid_digest(&first));
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_sha256_missing_file_yields_empty() {
        let digest = sha256_file(Path::new("/nonexistent/blob")).await;
        assert!(digest.is_empty());
    }
}
