//! # blockvault-core
//!
//! A local block-blob store: fixed-size binary blobs on a host filesystem,
//! each exposed as a block device and optionally composed from slices of
//! other blobs through linear mappings and copy-on-write snapshots. Built to
//! back virtual-machine disk images, where many machines share a common base
//! image cheaply via device-mapper.
//!
//! The store is a directory holding a `.blobstore` metadata file and, per
//! blob, a sparse backing file plus metadata sidecars. Every file access is
//! arbitrated by path-keyed locks that work across threads and processes
//! (see `blockvault-lock`); a store-wide lock serializes structural
//! mutations so that block accounting stays consistent.
//!
//! External block-device plumbing (loopback, device-mapper, range copies)
//! sits behind the [`DiskUtil`] trait: [`SystemDiskUtil`] drives the real
//! tools, while [`testing::FakeDiskUtil`] lets everything above it run in
//! tests without a kernel.

pub mod blob;
pub mod clone;
pub mod diskutil;
pub mod dm;
pub mod error;
pub mod sidecar;
pub mod store;
pub mod testing;

pub use blob::{check_in_use, BlockBlob, InUse};
pub use blockvault_lock::OpenFlags;
pub use clone::{BlockMapEntry, MapRelation, MapSource, MAX_BLOCKMAP_SIZE, MIN_BLOCKS_SNAPSHOT};
pub use diskutil::{DiskUtil, SystemDiskUtil};
pub use dm::DmRetryPolicy;
pub use error::{Error, Result};
pub use store::{
    BlobInfo, Blobstore, RevocationPolicy, SnapshotPolicy, StoreConfig, StoreFormat, StoreGuard,
};
