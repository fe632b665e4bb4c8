//! Tests for the switch file: remote-only reads, the download-and-swap
//! lifecycle, corrupt downloads, pre-materialized layers, reader safety
//! during the switchover, and teardown.

mod common;

use common::{digest_of, pattern, CountingFile, MemBlobFs};
use lazylayer::{
    BlockFile, BlockFs, DownloadConfig, Error, LocalFs, OpenOptions, Phase, RawCodec, SwitchFile,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn local_fs() -> Arc<dyn lazylayer::BlockFs> {
    Arc::new(LocalFs::new())
}

fn codec() -> Arc<dyn lazylayer::LayerCodec> {
    Arc::new(RawCodec)
}

fn download_conf(try_cnt: i64) -> DownloadConfig {
    DownloadConfig {
        enable: true,
        delay: 0,
        delay_extra: 0,
        max_mbps: 0,
        try_cnt,
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// =============================================================================
// Remote-Only and Pre-Materialized Backings
// =============================================================================

#[tokio::test]
async fn test_remote_only_read_stays_remote() {
    let dir = TempDir::new().unwrap();
    let data = pattern(4096);
    let remote = MemBlobFs::new();
    remote.put("blob", data.clone());
    let rfile = remote.open("blob", OpenOptions::read_only()).await.unwrap();

    let commit = dir.path().join("overlaybd.commit");
    let sw = SwitchFile::new(rfile, false, commit.to_str().unwrap(), local_fs(), codec())
        .await
        .unwrap();

    let mut buf = vec![0u8; 4096];
    let n = sw.pread(&mut buf, 0).await.unwrap();
    assert_eq!(n, 4096);
    assert_eq!(buf, data);
    assert_eq!(sw.phase(), Phase::Remote);
    assert!(!commit.exists());

    sw.close().await.unwrap();
}

#[tokio::test]
async fn test_pre_materialized_layer_is_local_from_construction() {
    let dir = TempDir::new().unwrap();
    let data = pattern(8192);
    let commit = dir.path().join("overlaybd.commit");
    std::fs::write(&commit, &data).unwrap();

    let fs = local_fs();
    let file = fs
        .open(commit.to_str().unwrap(), OpenOptions::read_only())
        .await
        .unwrap();
    let sw = SwitchFile::new(file, true, commit.to_str().unwrap(), fs.clone(), codec())
        .await
        .unwrap();

    assert_eq!(sw.phase(), Phase::Local);
    let mut buf = vec![0u8; 8192];
    sw.pread(&mut buf, 0).await.unwrap();
    assert_eq!(buf, data);

    sw.close().await.unwrap();
}

// =============================================================================
// Download and Swap
// =============================================================================

#[tokio::test]
async fn test_download_completes_and_next_read_swaps() {
    let dir = TempDir::new().unwrap();
    let layer_dir = dir.path().join("layer0");
    std::fs::create_dir_all(&layer_dir).unwrap();
    // several copy blocks plus a partial one
    let data = pattern(2 * 1024 * 1024 + 12345);
    let digest = digest_of(&data);
    let remote = MemBlobFs::new();
    remote.put("blob", data.clone());

    let rfile = remote.open("blob", OpenOptions::read_only()).await.unwrap();
    let source = remote.open("blob", OpenOptions::read_only()).await.unwrap();
    let commit = layer_dir.join("overlaybd.commit");

    let sw = SwitchFile::with_download(
        rfile,
        source,
        &digest,
        commit.to_str().unwrap(),
        &download_conf(3),
        local_fs(),
        codec(),
    )
    .await
    .unwrap();

    // reads served from the remote while the download runs
    let mut buf = vec![0u8; 4096];
    sw.pread(&mut buf, 0).await.unwrap();
    assert_eq!(&buf[..], &data[..4096]);

    wait_for("swap armed", || sw.phase() == Phase::ReadyToSwap).await;
    assert_eq!(std::fs::read(&commit).unwrap(), data);

    // the next read performs the switchover
    let n = sw.pread(&mut buf, 1024 * 1024).await.unwrap();
    assert_eq!(n, 4096);
    assert_eq!(&buf[..], &data[1024 * 1024..1024 * 1024 + 4096]);
    assert_eq!(sw.phase(), Phase::Local);

    sw.close().await.unwrap();
}

#[tokio::test]
async fn test_corrupt_download_exhausts_tries_and_stays_remote() {
    let dir = TempDir::new().unwrap();
    let layer_dir = dir.path().join("layer0");
    std::fs::create_dir_all(&layer_dir).unwrap();
    let served = pattern(8192);
    // the layer is configured with a digest the served bytes never match
    let configured_digest = digest_of(b"what the registry was supposed to have");
    let remote = MemBlobFs::new();
    remote.put("blob", served.clone());

    let rfile = remote.open("blob", OpenOptions::read_only()).await.unwrap();
    let source = CountingFile::new(remote.open("blob", OpenOptions::read_only()).await.unwrap());
    let commit = layer_dir.join("overlaybd.commit");

    let sw = SwitchFile::with_download(
        rfile,
        source.clone(),
        &configured_digest,
        commit.to_str().unwrap(),
        &download_conf(3),
        local_fs(),
        codec(),
    )
    .await
    .unwrap();

    // every attempt is one full copy (one read from offset 0)
    wait_for("downloader to give up", || {
        source.reads_from_start.load(std::sync::atomic::Ordering::Acquire) >= 3
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(
        source.reads_from_start.load(std::sync::atomic::Ordering::Acquire),
        3,
        "exactly tryCnt copies are attempted"
    );
    assert!(!commit.exists(), "corrupt bytes must never be committed");
    assert_eq!(sw.phase(), Phase::Remote);

    // reads keep working against the remote
    let mut buf = vec![0u8; 4096];
    sw.pread(&mut buf, 0).await.unwrap();
    assert_eq!(&buf[..], &served[..4096]);

    sw.close().await.unwrap();
}

// =============================================================================
// Reader Safety Across the Switchover
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reads_survive_the_swap() {
    let dir = TempDir::new().unwrap();
    let layer_dir = dir.path().join("layer0");
    std::fs::create_dir_all(&layer_dir).unwrap();
    let data = Arc::new(pattern(512 * 1024));
    let digest = digest_of(&data);
    let remote = MemBlobFs::new();
    remote.put("blob", data.as_ref().clone());

    let rfile = remote.open("blob", OpenOptions::read_only()).await.unwrap();
    let source = remote.open("blob", OpenOptions::read_only()).await.unwrap();
    let commit = layer_dir.join("overlaybd.commit");

    let sw = SwitchFile::with_download(
        rfile,
        source,
        &digest,
        commit.to_str().unwrap(),
        &download_conf(3),
        local_fs(),
        codec(),
    )
    .await
    .unwrap();

    // hammer reads from several tasks while the download lands and the
    // backing switches underneath them
    let mut readers = Vec::new();
    for t in 0..8u64 {
        let sw = sw.clone();
        let data = data.clone();
        readers.push(tokio::spawn(async move {
            let deadline = Instant::now() + Duration::from_secs(5);
            let mut offset = (t * 4096) % (data.len() as u64 - 4096);
            while Instant::now() < deadline {
                let mut buf = vec![0u8; 4096];
                let n = sw.pread(&mut buf, offset).await.unwrap();
                assert_eq!(&buf[..n], &data[offset as usize..offset as usize + n]);
                offset = (offset + 8192) % (data.len() as u64 - 4096);
                if sw.phase() == Phase::Local {
                    break;
                }
                tokio::task::yield_now().await;
            }
        }));
    }
    for reader in readers {
        reader.await.unwrap();
    }

    wait_for("swap armed", || sw.phase() >= Phase::ReadyToSwap).await;
    let mut buf = vec![0u8; 4096];
    sw.pread(&mut buf, 0).await.unwrap();
    assert_eq!(sw.phase(), Phase::Local);
    assert_eq!(&buf[..], &data[..4096]);

    sw.close().await.unwrap();
}

// =============================================================================
// Teardown
// =============================================================================

#[tokio::test]
async fn test_close_cancels_pending_download() {
    let dir = TempDir::new().unwrap();
    let layer_dir = dir.path().join("layer0");
    std::fs::create_dir_all(&layer_dir).unwrap();
    let data = pattern(4096);
    let digest = digest_of(&data);
    let remote = MemBlobFs::new();
    remote.put("blob", data);

    let rfile = remote.open("blob", OpenOptions::read_only()).await.unwrap();
    let source = remote.open("blob", OpenOptions::read_only()).await.unwrap();
    let commit = layer_dir.join("overlaybd.commit");

    let conf = DownloadConfig {
        enable: true,
        delay: 3600, // would start an hour from now
        delay_extra: 0,
        max_mbps: 0,
        try_cnt: 3,
    };
    let sw = SwitchFile::with_download(
        rfile,
        source,
        &digest,
        commit.to_str().unwrap(),
        &conf,
        local_fs(),
        codec(),
    )
    .await
    .unwrap();

    let started = Instant::now();
    sw.close().await.unwrap();
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "close must not wait out the download delay"
    );
    assert!(!commit.exists());
    assert!(!layer_dir.join("overlaybd.commit.download").exists());

    // no operation may start after close
    let mut buf = vec![0u8; 16];
    assert!(matches!(
        sw.pread(&mut buf, 0).await,
        Err(Error::Cancelled)
    ));
}
