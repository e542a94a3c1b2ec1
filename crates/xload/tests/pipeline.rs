//! End-to-end pipeline tests over a local-filesystem remote store.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use blobgate_remote::{LocalFsStore, RemoteStore};
use blobgate_xload::{StatsSnapshot, Xload, XloadConfig};

/// Build the scenario tree: 10 files (sizes 0..90 step 9) in the root plus
/// two subdirectories with 5 files each.
fn seed_remote(root: &Path) -> Vec<(String, Vec<u8>)> {
    let mut expected: Vec<(String, Vec<u8>)> = Vec::new();

    for i in 0..10 {
        let size: usize = i * 9;
        let content: Vec<u8> = (0..size).map(|b| (b % 256) as u8).collect();
        let name: String = format!("file{i:02}.bin");
        std::fs::write(root.join(&name), &content).unwrap();
        expected.push((name, content));
    }

    for sub in ["alpha", "beta"] {
        std::fs::create_dir(root.join(sub)).unwrap();
        for i in 0..5 {
            let content: Vec<u8> = format!("{sub}-{i}-payload").into_bytes();
            let name: String = format!("{sub}/part{i}.dat");
            std::fs::write(root.join(&name), &content).unwrap();
            expected.push((name, content));
        }
    }

    expected.sort();
    expected
}

fn base_config(staging: &Path, mount: &Path) -> XloadConfig {
    XloadConfig {
        read_only: true,
        path: Some(staging.to_path_buf()),
        mount_path: Some(mount.to_path_buf()),
        validate_md5: true,
        workers: Some(4),
        // 256 KB blocks keep the buffer pool small while still splitting
        // the megabyte-sized fixtures across several blocks.
        block_size_mb: Some(0.25),
        ..Default::default()
    }
}

/// Wait until `predicate` holds, failing the test after `secs` seconds.
async fn wait_until(secs: u64, mut predicate: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
    while !predicate() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in {secs}s"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn test_full_preload_round_trip() {
    let remote: TempDir = TempDir::new().unwrap();
    let work: TempDir = TempDir::new().unwrap();
    let staging: PathBuf = work.path().join("staging");
    let expected: Vec<(String, Vec<u8>)> = seed_remote(remote.path());

    // Page size 3 keeps the remote listing genuinely paginated.
    let store: Arc<dyn RemoteStore> =
        Arc::new(LocalFsStore::new(remote.path()).with_page_size(3));
    let config: XloadConfig = base_config(&staging, work.path());

    let mut xload: Xload = Xload::new(&config, store).unwrap();
    xload.start().await.unwrap();

    let staged = staging.clone();
    let want = expected.clone();
    wait_until(30, move || {
        want.iter().all(|(path, content)| {
            std::fs::read(staged.join(path)).map(|got| &got == content).unwrap_or(false)
        })
    })
    .await;

    let snapshot: StatsSnapshot = xload.stop().await;
    assert_eq!(snapshot.total_files, 20);
    assert_eq!(snapshot.success + snapshot.failed, snapshot.total_files);
    assert_eq!(snapshot.failed, 0);
    let total_bytes: u64 = expected.iter().map(|(_, c)| c.len() as u64).sum();
    assert_eq!(snapshot.bytes_downloaded, total_bytes);

    // Stop wipes the staging directory.
    assert_eq!(std::fs::read_dir(&staging).unwrap().count(), 0);
}

#[tokio::test]
async fn test_open_file_downloads_on_miss_and_releases() {
    let remote: TempDir = TempDir::new().unwrap();
    let work: TempDir = TempDir::new().unwrap();
    let staging: PathBuf = work.path().join("staging");
    std::fs::write(remote.path().join("wanted.bin"), b"on demand content").unwrap();
    std::fs::write(remote.path().join("other.bin"), b"should stay remote").unwrap();

    // Hint-driven mode with an absent hint file: no walk runs, so only
    // foreground opens cause downloads.
    let mut config: XloadConfig = base_config(&staging, work.path());
    config.prefetch_hint_file = Some(work.path().join("hints.txt"));

    let store: Arc<dyn RemoteStore> = Arc::new(LocalFsStore::new(remote.path()));
    let mut xload: Xload = Xload::new(&config, store).unwrap();
    xload.start().await.unwrap();

    let handle = xload.open_file("wanted.bin", 0, 0o644).await.unwrap();
    assert_eq!(handle.path(), "wanted.bin");
    assert_eq!(
        std::fs::read(staging.join("wanted.bin")).unwrap(),
        b"on demand content"
    );
    assert!(!staging.join("other.bin").exists());

    // A second open serves the staged copy.
    let again = xload.open_file("wanted.bin", 0, 0).await.unwrap();
    xload.release_file(again).await.unwrap();
    xload.release_file(handle).await.unwrap();

    // Write access is refused on a read-only gateway.
    let denied = xload.open_file("wanted.bin", 0x2, 0).await;
    assert!(denied.is_err());

    xload.stop().await;
}

#[tokio::test]
async fn test_open_file_surfaces_download_failure() {
    let remote: TempDir = TempDir::new().unwrap();
    let work: TempDir = TempDir::new().unwrap();

    let mut config: XloadConfig = base_config(&work.path().join("staging"), work.path());
    config.prefetch_hint_file = Some(work.path().join("hints.txt"));

    let store: Arc<dyn RemoteStore> = Arc::new(LocalFsStore::new(remote.path()));
    let mut xload: Xload = Xload::new(&config, store).unwrap();
    xload.start().await.unwrap();

    let missing = xload.open_file("does-not-exist.bin", 0, 0).await;
    assert!(missing.is_err(), "open of a missing remote file must fail");

    xload.stop().await;
}

#[tokio::test]
async fn test_hint_file_drives_priority_download() {
    let remote: TempDir = TempDir::new().unwrap();
    let work: TempDir = TempDir::new().unwrap();
    let staging: PathBuf = work.path().join("staging");
    std::fs::write(remote.path().join("hinted.bin"), b"hinted payload").unwrap();
    std::fs::write(remote.path().join("ignored.bin"), b"never asked for").unwrap();

    let hint_file: PathBuf = work.path().join("hints.txt");
    let mut config: XloadConfig = base_config(&staging, work.path());
    config.prefetch_hint_file = Some(hint_file.clone());
    config.prefetch_hint_poll_sec = Some(1);

    let store: Arc<dyn RemoteStore> = Arc::new(LocalFsStore::new(remote.path()));
    let mut xload: Xload = Xload::new(&config, store).unwrap();
    xload.start().await.unwrap();

    std::fs::write(&hint_file, "hinted.bin\n").unwrap();

    let staged = staging.clone();
    wait_until(10, move || staged.join("hinted.bin").is_file()).await;
    assert_eq!(
        std::fs::read(staging.join("hinted.bin")).unwrap(),
        b"hinted payload"
    );
    assert!(
        !staging.join("ignored.bin").exists(),
        "hint mode must not download unrequested files"
    );

    xload.stop().await;
}

#[tokio::test]
async fn test_invalidation_drops_idle_files_but_not_open_ones() {
    let remote: TempDir = TempDir::new().unwrap();
    let work: TempDir = TempDir::new().unwrap();
    let staging: PathBuf = work.path().join("staging");
    std::fs::create_dir(remote.path().join("dir")).unwrap();
    std::fs::write(remote.path().join("dir/idle.bin"), b"idle").unwrap();
    std::fs::write(remote.path().join("dir/open.bin"), b"open").unwrap();

    let mut config: XloadConfig = base_config(&staging, work.path());
    config.prefetch_hint_file = Some(work.path().join("hints.txt"));

    let store: Arc<dyn RemoteStore> = Arc::new(LocalFsStore::new(remote.path()));
    let mut xload: Xload = Xload::new(&config, store).unwrap();
    xload.start().await.unwrap();

    let idle = xload.open_file("dir/idle.bin", 0, 0).await.unwrap();
    xload.release_file(idle).await.unwrap();
    let held = xload.open_file("dir/open.bin", 0, 0).await.unwrap();

    xload.invalidate_directory("dir").await.unwrap();

    assert!(!staging.join("dir/idle.bin").exists());
    assert!(
        staging.join("dir/open.bin").exists(),
        "an open file survives invalidation"
    );

    xload.release_file(held).await.unwrap();
    xload.invalidate_path("dir/open.bin").await.unwrap();
    assert!(!staging.join("dir/open.bin").exists());

    xload.stop().await;
}

#[tokio::test]
async fn test_eviction_caps_staging_usage() {
    let remote: TempDir = TempDir::new().unwrap();
    let work: TempDir = TempDir::new().unwrap();
    let staging: PathBuf = work.path().join("staging");
    // Two 1 MB files against a 1 MB cap: the least recently used one goes.
    std::fs::write(remote.path().join("first.bin"), vec![1u8; 1024 * 1024]).unwrap();
    std::fs::write(remote.path().join("second.bin"), vec![2u8; 1024 * 1024]).unwrap();

    let mut config: XloadConfig = base_config(&staging, work.path());
    config.prefetch_hint_file = Some(work.path().join("hints.txt"));
    config.cache_limit_mb = Some(1);

    let store: Arc<dyn RemoteStore> = Arc::new(LocalFsStore::new(remote.path()));
    let mut xload: Xload = Xload::new(&config, store).unwrap();
    xload.start().await.unwrap();

    let first = xload.open_file("first.bin", 0, 0).await.unwrap();
    xload.release_file(first).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = xload.open_file("second.bin", 0, 0).await.unwrap();
    xload.release_file(second).await.unwrap();

    // The eviction tick fires every few seconds; wait for it to bring usage
    // back under the cap by dropping the older file.
    let staged = staging.clone();
    wait_until(30, move || !staged.join("first.bin").exists()).await;
    assert!(staging.join("second.bin").exists());

    xload.stop().await;
}
