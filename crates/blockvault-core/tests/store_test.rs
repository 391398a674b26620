//! Store and blob lifecycle scenarios, run against the fake disk utility.

use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use blockvault_core::testing::FakeDiskUtil;
use blockvault_core::{
    BlockBlob, Blobstore, Error, InUse, OpenFlags, RevocationPolicy, SnapshotPolicy, StoreConfig,
    StoreFormat,
};
use tempfile::TempDir;

const NO_WAIT: Option<Duration> = Some(Duration::ZERO);

fn open_store(
    dir: &TempDir,
    limit: u64,
    revocation: RevocationPolicy,
) -> (Arc<Blobstore>, Arc<FakeDiskUtil>) {
    let disk = Arc::new(FakeDiskUtil::default());
    let store = Blobstore::open(
        dir.path(),
        StoreConfig {
            limit_blocks: Some(limit),
            revocation: Some(revocation),
            ..Default::default()
        },
        disk.clone(),
    )
    .unwrap();
    (Arc::new(store), disk)
}

fn create_blob(store: &Arc<Blobstore>, id: &str, size: u64) -> BlockBlob {
    BlockBlob::open(store, Some(id), size, OpenFlags::CREATE, None, NO_WAIT).unwrap()
}

#[test]
fn store_parameters_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let disk = Arc::new(FakeDiskUtil::default());
    let store = Blobstore::open(
        dir.path(),
        StoreConfig {
            limit_blocks: Some(500),
            format: Some(StoreFormat::Directory),
            revocation: Some(RevocationPolicy::Lru),
            snapshot: Some(SnapshotPolicy::Dm),
            ..Default::default()
        },
        disk.clone(),
    )
    .unwrap();
    assert_eq!(store.id().len(), 16);
    assert_eq!(store.limit_blocks(), 500);
    drop(store);

    // Reopening with everything unspecified picks up the stored values.
    let reopened = Blobstore::open(dir.path(), StoreConfig::default(), disk.clone()).unwrap();
    assert_eq!(reopened.limit_blocks(), 500);
    assert_eq!(reopened.format(), StoreFormat::Directory);
    assert_eq!(reopened.revocation(), RevocationPolicy::Lru);
    assert_eq!(reopened.snapshot(), SnapshotPolicy::Dm);

    // Any disagreeing parameter is refused.
    for config in [
        StoreConfig {
            limit_blocks: Some(501),
            ..Default::default()
        },
        StoreConfig {
            format: Some(StoreFormat::Files),
            ..Default::default()
        },
        StoreConfig {
            revocation: Some(RevocationPolicy::None),
            ..Default::default()
        },
        StoreConfig {
            snapshot: Some(SnapshotPolicy::None),
            ..Default::default()
        },
    ] {
        let err = Blobstore::open(dir.path(), config, disk.clone()).unwrap_err();
        assert!(matches!(err, Error::Inval(_)));
    }
}

#[test]
fn blob_open_validates_arguments() {
    let dir = TempDir::new().unwrap();
    let (store, _disk) = open_store(&dir, 100, RevocationPolicy::None);

    let err =
        BlockBlob::open(&store, None, 10, OpenFlags::empty(), None, NO_WAIT).unwrap_err();
    assert!(matches!(err, Error::Inval(_)));

    let err = BlockBlob::open(&store, Some("b"), 0, OpenFlags::CREATE, None, NO_WAIT).unwrap_err();
    assert!(matches!(err, Error::Inval(_)));

    let err =
        BlockBlob::open(&store, Some("b"), 101, OpenFlags::CREATE, None, NO_WAIT).unwrap_err();
    assert!(matches!(err, Error::Nospc(_)));

    let err = BlockBlob::open(
        &store,
        Some("b"),
        10,
        OpenFlags::CREATE | OpenFlags::RDONLY,
        None,
        NO_WAIT,
    )
    .unwrap_err();
    assert!(matches!(err, Error::Inval(_)));
}

#[test]
fn create_allocates_sparsely_and_locks() {
    let dir = TempDir::new().unwrap();
    let (store, disk) = open_store(&dir, 100, RevocationPolicy::None);

    let blob = create_blob(&store, "vm-disk", 10);
    assert_eq!(blob.size_blocks(), 10);
    assert_eq!(fs::metadata(blob.blocks_path()).unwrap().len(), 10 * 512);
    assert_eq!(disk.attached_loops(), 1);
    assert!(blob
        .device_path()
        .to_string_lossy()
        .starts_with("/dev/fake-loop"));

    // A second open of the same blob does not get the writer lock.
    let err =
        BlockBlob::open(&store, Some("vm-disk"), 0, OpenFlags::empty(), None, NO_WAIT).unwrap_err();
    assert!(matches!(err, Error::Again(_)));

    blob.close().unwrap();
    assert_eq!(disk.attached_loops(), 0);

    // CREATE|EXCL refuses the existing blob.
    let err = BlockBlob::open(
        &store,
        Some("vm-disk"),
        10,
        OpenFlags::CREATE | OpenFlags::EXCL,
        None,
        NO_WAIT,
    )
    .unwrap_err();
    assert!(matches!(err, Error::Exist(_)));
}

#[test]
fn signature_and_size_are_verified_on_reopen() {
    let dir = TempDir::new().unwrap();
    let (store, _disk) = open_store(&dir, 100, RevocationPolicy::None);

    let blob = BlockBlob::open(
        &store,
        Some("signed"),
        10,
        OpenFlags::CREATE,
        Some("abc"),
        NO_WAIT,
    )
    .unwrap();
    blob.close().unwrap();

    let blob = BlockBlob::open(
        &store,
        Some("signed"),
        10,
        OpenFlags::empty(),
        Some("abc"),
        NO_WAIT,
    )
    .unwrap();
    blob.close().unwrap();

    let err = BlockBlob::open(
        &store,
        Some("signed"),
        10,
        OpenFlags::empty(),
        Some("xyz"),
        NO_WAIT,
    )
    .unwrap_err();
    assert!(matches!(err, Error::Signature));

    let err = BlockBlob::open(
        &store,
        Some("signed"),
        11,
        OpenFlags::empty(),
        None,
        NO_WAIT,
    )
    .unwrap_err();
    assert!(matches!(err, Error::Inval(_)));

    // Size 0 means "whatever is there".
    let blob =
        BlockBlob::open(&store, Some("signed"), 0, OpenFlags::empty(), None, NO_WAIT).unwrap();
    assert_eq!(blob.size_blocks(), 10);
    blob.close().unwrap();
}

#[test]
fn full_store_fails_without_revocation() {
    let dir = TempDir::new().unwrap();
    let (store, _disk) = open_store(&dir, 30, RevocationPolicy::None);

    for id in ["b1", "b2", "b3"] {
        create_blob(&store, id, 10).close().unwrap();
    }
    let err = BlockBlob::open(&store, Some("b4"), 1, OpenFlags::CREATE, None, NO_WAIT).unwrap_err();
    assert!(matches!(err, Error::Nospc(_)));
    assert!(!blockvault_core::sidecar::sidecar_path(
        &store,
        blockvault_core::sidecar::Suffix::Blocks,
        "b4"
    )
    .exists());
}

#[test]
fn full_store_purges_least_recently_modified_under_lru() {
    let dir = TempDir::new().unwrap();
    let (store, _disk) = open_store(&dir, 30, RevocationPolicy::Lru);

    for id in ["b1", "b2", "b3"] {
        create_blob(&store, id, 10).close().unwrap();
        // Keep modification times strictly ordered.
        thread::sleep(Duration::from_millis(20));
    }

    let blob = create_blob(&store, "b4", 10);
    blob.close().unwrap();

    let blobs = store.scan().unwrap();
    let ids: Vec<&str> = blobs.iter().map(|b| b.id.as_str()).collect();
    assert!(!ids.contains(&"b1"), "oldest blob should have been purged");
    assert!(ids.contains(&"b2"));
    assert!(ids.contains(&"b3"));
    assert!(ids.contains(&"b4"));
    let total: u64 = blobs.iter().map(|b| b.size_blocks).sum();
    assert!(total <= 30);
}

#[test]
fn open_blobs_are_not_purged() {
    let dir = TempDir::new().unwrap();
    let (store, _disk) = open_store(&dir, 30, RevocationPolicy::Lru);

    let held = create_blob(&store, "held", 20);
    let err =
        BlockBlob::open(&store, Some("big"), 20, OpenFlags::CREATE, None, NO_WAIT).unwrap_err();
    assert!(matches!(err, Error::Nospc(_)));
    held.close().unwrap();

    // Once released the same create succeeds by purging.
    create_blob(&store, "big", 20).close().unwrap();
}

#[test]
fn scan_reports_blob_state() {
    let dir = TempDir::new().unwrap();
    let (store, _disk) = open_store(&dir, 100, RevocationPolicy::None);

    let open_blob = create_blob(&store, "open", 10);
    create_blob(&store, "FOO/closed", 10).close().unwrap();

    let blobs = store.scan().unwrap();
    assert_eq!(blobs.len(), 2);
    let by_id = |id: &str| blobs.iter().find(|b| b.id == id).unwrap();
    assert!(by_id("open").in_use.contains(InUse::OPENED));
    assert!(by_id("FOO/closed").in_use.is_empty());
    assert_eq!(by_id("open").size_blocks, 10);

    open_blob.close().unwrap();
}

#[test]
fn lifecycle_leaves_no_sidecars() {
    let dir = TempDir::new().unwrap();
    let (store, disk) = open_store(&dir, 100, RevocationPolicy::None);

    create_blob(&store, "FOO/BAR/bb", 10).close().unwrap();
    let blob =
        BlockBlob::open(&store, Some("FOO/BAR/bb"), 0, OpenFlags::empty(), None, NO_WAIT).unwrap();
    blob.close().unwrap();

    let mut blob =
        BlockBlob::open(&store, Some("FOO/BAR/bb"), 0, OpenFlags::empty(), None, NO_WAIT).unwrap();
    blob.delete(NO_WAIT).unwrap();

    let entries: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(entries, vec![std::ffi::OsString::from(".blobstore")]);
    assert_eq!(disk.attached_loops(), 0);
}

#[test]
fn directory_format_stores_work_end_to_end() {
    let dir = TempDir::new().unwrap();
    let disk = Arc::new(FakeDiskUtil::default());
    let store = Arc::new(
        Blobstore::open(
            dir.path(),
            StoreConfig {
                limit_blocks: Some(100),
                format: Some(StoreFormat::Directory),
                ..Default::default()
            },
            disk,
        )
        .unwrap(),
    );

    let mut blob = create_blob(&store, "nested/blob", 10);
    assert!(dir.path().join("nested/blob/blocks").exists());
    assert!(dir.path().join("nested/blob/loopback").exists());

    blob.delete(NO_WAIT).unwrap();
    assert!(!dir.path().join("nested").exists());
}
