//! Tests for the shared layer cache: reference counting, deterministic
//! release, and single-flighted opens.

mod common;

use common::{pattern, CountingFile, MemBlobFs};
use lazylayer::{BlockFile, BlockFs, Error, FileCache, OpenOptions};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

async fn blob_file(data: Vec<u8>) -> Arc<dyn BlockFile> {
    let fs = MemBlobFs::new();
    fs.put("blob", data);
    fs.open("blob", OpenOptions::read_only()).await.unwrap()
}

// =============================================================================
// Reference Counting
// =============================================================================

#[tokio::test]
async fn test_lookup_returns_same_wrapper_with_bumped_count() {
    let cache = FileCache::new("test");
    let inner = CountingFile::new(blob_file(pattern(64)).await);

    let first = cache.insert("/layers/a", inner.clone());
    assert_eq!(first.ref_count(), 1);

    let second = cache.lookup("/layers/a").unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.ref_count(), 2);

    assert!(cache.lookup("/layers/missing").is_none());
}

#[tokio::test]
async fn test_last_close_destroys_entry_and_inner() {
    let cache = FileCache::new("test");
    let inner = CountingFile::new(blob_file(pattern(64)).await);

    let first = cache.insert("/layers/a", inner.clone());
    let second = cache.lookup("/layers/a").unwrap();
    assert_eq!(cache.len(), 1);

    // first close drops to one reference; nothing is destroyed
    second.close().await.unwrap();
    assert_eq!(first.ref_count(), 1);
    assert_eq!(cache.len(), 1);
    assert_eq!(inner.closes.load(Ordering::Acquire), 0);

    // reads still flow through the surviving handle
    let mut buf = [0u8; 16];
    first.pread(&mut buf, 0).await.unwrap();

    // last close destroys the underlying file and removes the entry
    first.close().await.unwrap();
    assert_eq!(cache.len(), 0);
    assert_eq!(inner.closes.load(Ordering::Acquire), 1);
}

// =============================================================================
// Single-Flighted Opens
// =============================================================================

#[tokio::test]
async fn test_open_shared_runs_factory_once_for_concurrent_openers() {
    let cache = FileCache::new("test");
    let opens = Arc::new(AtomicUsize::new(0));

    let open_one = || {
        let cache = cache.clone();
        let opens = opens.clone();
        async move {
            cache
                .open_shared("/layers/a", || async {
                    opens.fetch_add(1, Ordering::AcqRel);
                    // widen the race window
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    Ok(blob_file(pattern(64)).await)
                })
                .await
        }
    };

    let (a, b) = tokio::join!(open_one(), open_one());
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(opens.load(Ordering::Acquire), 1, "one expensive open per key");
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.ref_count(), 2);
}

#[tokio::test]
async fn test_open_shared_failure_is_not_cached() {
    let cache = FileCache::new("test");

    let result = cache
        .open_shared("/layers/a", || async {
            Err(Error::Config {
                reason: "injected".to_string(),
            })
        })
        .await;
    assert!(result.is_err());
    assert_eq!(cache.len(), 0);

    // a later open runs the factory again and succeeds
    let file = cache
        .open_shared("/layers/a", || async { Ok(blob_file(pattern(64)).await) })
        .await
        .unwrap();
    assert_eq!(file.ref_count(), 1);
    assert_eq!(cache.len(), 1);
}
