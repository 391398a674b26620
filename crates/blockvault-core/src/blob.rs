//! Blob lifecycle: open/create, close, delete.
//!
//! A blob is opened writer-exclusive for the lifetime of the handle. On
//! create the backing file is extended sparsely to its full size and charged
//! against the store's block budget; on open the recorded size and signature
//! are verified. Every open blob has a loopback device bound to its backing
//! file, and `device_path` points either at that device or at the main
//! device-mapper device once the blob has been composed from a block map.

use std::fmt;
use std::fs;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use blockvault_lock::{self as lock, LockHandle, OpenFlags};
use serde::{Serialize, Serializer};
use tracing::{debug, warn};

use crate::dm;
use crate::error::{Error, Result};
use crate::sidecar::{self, Suffix};
use crate::store::{gen_id, Blobstore, StoreConfig};

const BLOB_ID_LEN: usize = 24;

bitflags! {
    /// Why a blob cannot currently be purged or deleted.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InUse: u32 {
        /// Somebody holds the writer lock on the backing file.
        const OPENED = 1;
        /// Another blob maps or snapshots this one (`refs` is non-empty).
        const MAPPED = 1 << 1;
        /// This blob maps or snapshots others (`deps` is non-empty).
        const BACKED = 1 << 2;
    }
}

impl fmt::Display for InUse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(InUse::OPENED) {
            names.push("opened");
        }
        if self.contains(InUse::MAPPED) {
            names.push("mapped");
        }
        if self.contains(InUse::BACKED) {
            names.push("backed");
        }
        write!(f, "{}", names.join(","))
    }
}

impl Serialize for InUse {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// An open blob. The writer lock on the backing file is held until the
/// handle is closed, deleted, or dropped.
pub struct BlockBlob {
    pub(crate) store: Arc<Blobstore>,
    pub(crate) id: String,
    pub(crate) size_blocks: u64,
    pub(crate) blocks_path: PathBuf,
    pub(crate) device_path: PathBuf,
    pub(crate) dm_name: Option<String>,
    pub(crate) lock: Option<LockHandle>,
}

impl fmt::Debug for BlockBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockBlob")
            .field("id", &self.id)
            .field("size_blocks", &self.size_blocks)
            .field("device_path", &self.device_path)
            .finish()
    }
}

/// Computes the in-use mask for blob `id`: a failed non-blocking writer
/// acquisition on the backing file means `OPENED`, a non-empty `refs` means
/// `MAPPED`, a non-empty `deps` means `BACKED`.
pub fn check_in_use(store: &Blobstore, id: &str, timeout: Option<Duration>) -> InUse {
    let mut in_use = InUse::empty();

    let blocks_path = sidecar::sidecar_path(store, Suffix::Blocks, id);
    match lock::acquire(&blocks_path, OpenFlags::RDWR, timeout, 0o600) {
        Ok(handle) => {
            let _ = lock::release(handle);
        }
        Err(_) => in_use |= InUse::OPENED,
    }

    if !sidecar::read_lines(store, Suffix::Refs, id)
        .unwrap_or_default()
        .is_empty()
    {
        in_use |= InUse::MAPPED;
    }
    if !sidecar::read_lines(store, Suffix::Deps, id)
        .unwrap_or_default()
        .is_empty()
    {
        in_use |= InUse::BACKED;
    }
    in_use
}

/// Reads `dm` and `loopback` to determine where the blob's data is
/// reachable: the last device-mapper device if there is one, else the
/// loopback device. Also returns the main device-mapper name, if any.
pub(crate) fn resolve_device(store: &Blobstore, id: &str) -> (Option<PathBuf>, Option<String>) {
    let dm_devs = sidecar::read_lines(store, Suffix::Dm, id).unwrap_or_default();
    if let Some(main) = dm_devs.last() {
        return (Some(dm::device_path(main)), Some(main.clone()));
    }
    match sidecar::read_string(store, Suffix::Loopback, id) {
        Ok(dev) if !dev.is_empty() => (Some(PathBuf::from(dev)), None),
        _ => (None, None),
    }
}

/// Detaches the blob's loopback device, if one is recorded, and unlinks the
/// `loopback` sidecar.
pub(crate) fn loop_remove(store: &Blobstore, id: &str) -> Result<()> {
    let dev = match sidecar::read_string(store, Suffix::Loopback, id) {
        Ok(dev) if !dev.is_empty() => dev,
        _ => return Ok(()),
    };
    store.disk.loop_detach(Path::new(&dev)).map_err(|e| {
        Error::unknown(format!("failed to remove loopback device {}: {}", dev, e))
    })?;
    let _ = fs::remove_file(sidecar::sidecar_path(store, Suffix::Loopback, id));
    Ok(())
}

impl BlockBlob {
    /// Opens or creates a blob.
    ///
    /// With `CREATE` the backing file is allocated sparsely at `size_blocks`
    /// once the allocator confirms the budget, and `sig` (if given) is
    /// recorded. Without it, `size_blocks` other than 0 must match the
    /// existing size and `sig` (if given) must match the recorded signature.
    /// `id` may be `None` only with `CREATE`, in which case a random one is
    /// assigned. On success the caller holds the blob writer-exclusive.
    pub fn open(
        store: &Arc<Blobstore>,
        id: Option<&str>,
        size_blocks: u64,
        flags: OpenFlags,
        sig: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<BlockBlob> {
        if flags.intersects(!(OpenFlags::CREATE | OpenFlags::EXCL)) {
            return Err(Error::inval("only CREATE and EXCL flags are allowed"));
        }
        if id.is_none() && !flags.contains(OpenFlags::CREATE) {
            return Err(Error::inval("an id is required unless creating"));
        }
        if size_blocks == 0 && flags.contains(OpenFlags::CREATE) {
            return Err(Error::inval("size_blocks may be 0 only without CREATE"));
        }
        if flags.contains(OpenFlags::CREATE) && size_blocks > store.limit_blocks() {
            return Err(Error::Nospc(format!(
                "{} blocks requested, the store holds {}",
                size_blocks,
                store.limit_blocks()
            )));
        }

        let id = match id {
            Some(id) => id.to_string(),
            None => gen_id(BLOB_ID_LEN),
        };
        let blocks_path = sidecar::sidecar_path(store, Suffix::Blocks, &id);
        debug!(id = %id, size_blocks, ?flags, "opening blob");

        let _guard = store.lock(timeout)?;

        let created_dirs = sidecar::ensure_blob_dirs(store, &id)?;
        let blob_lock = match lock::acquire(&blocks_path, flags | OpenFlags::RDWR, timeout, 0o600)
        {
            Ok(handle) => handle,
            Err(e) => {
                if created_dirs {
                    sidecar::delete_files(store, &id);
                }
                return Err(e.into());
            }
        };

        let mut created_blob = false;
        let body = (|| -> Result<(u64, PathBuf, Option<String>)> {
            let meta = blob_lock.file().metadata()?;
            let mut size_blocks = size_blocks;

            if meta.len() == 0 {
                created_blob = true;
                if size_blocks == 0 {
                    // Leftover of a crashed create, opened without CREATE.
                    return Err(Error::inval("existing blob has an empty backing file"));
                }
                store.ensure_capacity(size_blocks)?;

                // Allocate the full size as a hole with a single byte at
                // the end.
                let mut file = blob_lock.file();
                file.seek(SeekFrom::Start(size_blocks * 512 - 1))?;
                file.write_all(&[0])?;
                if let Some(sig) = sig {
                    sidecar::write_string(store, Suffix::Sig, &id, sig)?;
                }
            } else {
                let actual_blocks = meta.len() / 512;
                if size_blocks == 0 {
                    size_blocks = actual_blocks;
                } else if size_blocks != actual_blocks {
                    return Err(Error::inval("size of the existing blob does not match"));
                }
                if let Some(sig) = sig {
                    let recorded = sidecar::read_string(store, Suffix::Sig, &id)
                        .map_err(|_| Error::Signature)?;
                    if recorded != sig {
                        return Err(Error::Signature);
                    }
                }
            }

            // Bind a loopback device unless a live one is already recorded.
            let recorded = sidecar::read_string(store, Suffix::Loopback, &id)
                .ok()
                .filter(|dev| !dev.is_empty());
            let loop_dev = match recorded {
                Some(dev) => match store.disk.is_block_device(Path::new(&dev)) {
                    Ok(true) => PathBuf::from(dev),
                    Ok(false) => {
                        return Err(Error::unknown(
                            "recorded loopback path is not a block device",
                        ))
                    }
                    Err(_) => {
                        return Err(Error::unknown(
                            "recorded loopback device does not exist",
                        ))
                    }
                },
                None => {
                    let dev = store.disk.loop_attach(&blocks_path).map_err(|e| {
                        Error::unknown(format!(
                            "failed to obtain a loopback device for the blob: {}",
                            e
                        ))
                    })?;
                    sidecar::write_string(
                        store,
                        Suffix::Loopback,
                        &id,
                        &dev.display().to_string(),
                    )?;
                    dev
                }
            };

            let (device_path, dm_name) = resolve_device(store, &id);
            Ok((size_blocks, device_path.unwrap_or(loop_dev), dm_name))
        })();

        match body {
            Ok((size_blocks, device_path, dm_name)) => Ok(BlockBlob {
                store: store.clone(),
                id,
                size_blocks,
                blocks_path,
                device_path,
                dm_name,
                lock: Some(blob_lock),
            }),
            Err(e) => {
                if let Err(release_err) = lock::release(blob_lock) {
                    warn!(id = %id, error = %release_err, "failed to release the blob lock");
                }
                if created_dirs || created_blob {
                    sidecar::delete_files(store, &id);
                }
                Err(e)
            }
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn size_blocks(&self) -> u64 {
        self.size_blocks
    }

    /// Block device exposing the blob's data.
    pub fn device_path(&self) -> &Path {
        &self.device_path
    }

    /// The sparse backing file.
    pub fn blocks_path(&self) -> &Path {
        &self.blocks_path
    }

    pub fn store(&self) -> &Arc<Blobstore> {
        &self.store
    }

    /// Main device-mapper device, once the blob has been composed.
    pub fn dm_name(&self) -> Option<&str> {
        self.dm_name.as_deref()
    }

    /// Suspends and resumes the main device-mapper device so the kernel
    /// picks the mapping back up after writes through a snapshot. No-op for
    /// blobs without a device stack.
    pub fn refresh_mappings(&self) -> Result<()> {
        let Some(name) = &self.dm_name else {
            return Ok(());
        };
        self.store
            .disk
            .dm_suspend_resume(name)
            .map_err(|e| Error::unknown(format!("failed to suspend/resume {}: {}", name, e)))
    }

    /// Releases the blob. The loopback device is detached unless other
    /// blobs still map this one or this blob still maps others.
    pub fn close(mut self) -> Result<()> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> Result<()> {
        let Some(blob_lock) = self.lock.take() else {
            return Ok(());
        };
        let in_use = check_in_use(&self.store, &self.id, Some(Duration::ZERO));
        let mut ret = Ok(());
        if !in_use.intersects(InUse::MAPPED | InUse::BACKED) {
            ret = loop_remove(&self.store, &self.id);
        }
        if let Err(e) = lock::release(blob_lock) {
            if ret.is_ok() {
                ret = Err(e.into());
            }
        }
        ret
    }

    /// Deletes the blob: tears down its device-mapper devices, removes this
    /// blob from its dependencies' `refs`, detaches the loopback, and
    /// unlinks every sidecar. Fails with [`Error::Again`] while any other
    /// blob still maps this one; the handle stays open and usable in that
    /// case. After a successful delete the handle is inert.
    pub fn delete(&mut self, timeout: Option<Duration>) -> Result<()> {
        let store = self.store.clone();
        let _guard = store.lock(timeout)?;

        let in_use = check_in_use(&store, &self.id, timeout);
        if in_use.intersects(!(InUse::OPENED | InUse::BACKED)) {
            return Err(Error::Again("the blob is mapped by another blob".into()));
        }

        let dm_devs = sidecar::read_lines(&store, Suffix::Dm, &self.id)?;
        dm::delete_devices(&*store.disk, &dm_devs, &store.dm_retry)?;

        let deps = sidecar::read_lines(&store, Suffix::Deps, &self.id)?;

        // Point of no return: from here on the handle is consumed and the
        // first disk-utility error is reported after best effort completes.
        let mut ret = Ok(());
        let my_ref = format!("{} {}", store.path().display(), self.id);
        for entry in &deps {
            let Some((dep_store_path, dep_id)) = entry.rsplit_once(' ') else {
                warn!(entry = %entry, "malformed dependency entry");
                continue;
            };
            if dep_store_path.is_empty() || dep_id.is_empty() {
                continue;
            }

            let same_store = Path::new(dep_store_path) == store.path();
            let dep_store = if same_store {
                store.clone()
            } else {
                match Blobstore::open(
                    dep_store_path,
                    StoreConfig::default(),
                    store.disk.clone(),
                ) {
                    Ok(opened) => Arc::new(opened),
                    Err(e) => {
                        warn!(store = dep_store_path, error = %e, "failed to open dependency store");
                        continue;
                    }
                }
            };

            // The peer's sidecars are rewritten under the peer store's own
            // lock; a same-store peer is already covered by the lock held
            // above.
            let _peer_guard = if same_store {
                None
            } else {
                match dep_store.lock(timeout) {
                    Ok(guard) => Some(guard),
                    Err(e) => {
                        warn!(store = dep_store_path, error = %e, "failed to lock dependency store");
                        continue;
                    }
                }
            };

            if let Err(e) = sidecar::update_entry(&dep_store, Suffix::Refs, dep_id, &my_ref, true)
            {
                warn!(blob = dep_id, error = %e, "failed to remove reference from dependency");
            }
            let dep_in_use = check_in_use(&dep_store, dep_id, Some(Duration::ZERO));
            if !dep_in_use.intersects(InUse::OPENED | InUse::MAPPED) {
                if let Err(e) = loop_remove(&dep_store, dep_id) {
                    if ret.is_ok() {
                        ret = Err(e);
                    }
                }
            }
        }

        if let Err(e) = loop_remove(&store, &self.id) {
            if ret.is_ok() {
                ret = Err(e);
            }
        }
        if let Some(blob_lock) = self.lock.take() {
            if let Err(e) = lock::release(blob_lock) {
                if ret.is_ok() {
                    ret = Err(e.into());
                }
            }
        }
        if sidecar::delete_files(&store, &self.id) < 1 && ret.is_ok() {
            ret = Err(Error::unknown("no blob files were deleted"));
        }
        ret
    }
}

impl Drop for BlockBlob {
    fn drop(&mut self) {
        if self.lock.is_some() {
            if let Err(e) = self.close_inner() {
                warn!(id = %self.id, error = %e, "failed to close blob on drop");
            }
        }
    }
}
