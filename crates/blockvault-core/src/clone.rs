//! Composing a blob from slices of other blobs, devices, and zero fill.
//!
//! A block map is an ordered list of extents. COPY extents are materialized
//! with a block-range copy; MAP and SNAPSHOT extents become device-mapper
//! tables stacked over the sources. Sources that are mapped or snapshotted
//! (not copied) enter the bidirectional dependency graph so they cannot be
//! deleted while the clone exists.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::blob::BlockBlob;
use crate::dm;
use crate::error::{Error, Result};
use crate::sidecar::{self, Suffix};
use crate::store::{SnapshotPolicy, METADATA_TIMEOUT};

/// Most entries a single block map may carry.
pub const MAX_BLOCKMAP_SIZE: usize = 1024;

/// Device-mapper refuses snapshots over smaller extents.
pub const MIN_BLOCKS_SNAPSHOT: u64 = 32;

/// How an extent relates to its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapRelation {
    /// Copy the source blocks into the destination now.
    Copy,
    /// Map destination blocks onto the source for reads and writes.
    Map,
    /// Copy-on-write view of the source, diverged blocks landing in the
    /// destination's backing file.
    Snapshot,
}

/// Where an extent's blocks come from.
pub enum MapSource<'a> {
    /// An arbitrary block device.
    Device(&'a Path),
    /// Another open blob.
    Blob(&'a BlockBlob),
    /// Zero fill.
    Zero,
}

/// One extent of a block map.
pub struct BlockMapEntry<'a> {
    pub relation: MapRelation,
    pub source: MapSource<'a>,
    pub first_block_src: u64,
    pub first_block_dst: u64,
    pub len_blocks: u64,
}

impl BlockBlob {
    /// Builds this blob's contents from `map`, per-extent. If any extent
    /// maps or snapshots, a device-mapper stack is created and
    /// `device_path` moves to the main device; the devices are recorded in
    /// the `dm` sidecar, main device last, and the dependency graph is
    /// updated for every mapped or snapshotted blob source. Dependency
    /// bookkeeping runs under the destination store's lock, plus a mapped
    /// source's own store lock when it lives in a different store.
    ///
    /// On any failure the devices created so far are torn down and the blob
    /// is left as it was.
    pub fn clone_map(&mut self, map: &[BlockMapEntry<'_>]) -> Result<()> {
        if map.is_empty() || map.len() > MAX_BLOCKMAP_SIZE {
            return Err(Error::inval("invalid block map size"));
        }

        // Validate everything up front; no side effects besides
        // materializing the zero device when a non-COPY extent needs it.
        let mut zero_dev: Option<PathBuf> = None;
        for entry in map {
            if entry.relation != MapRelation::Copy
                && self.store.snapshot() != SnapshotPolicy::Dm
            {
                return Err(Error::inval(
                    "relation type is incompatible with the snapshot policy",
                ));
            }
            if entry.first_block_dst + entry.len_blocks > self.size_blocks {
                return Err(Error::inval(
                    "the destination blob is too small for the map",
                ));
            }
            if entry.relation == MapRelation::Snapshot
                && entry.len_blocks < MIN_BLOCKS_SNAPSHOT
            {
                return Err(Error::inval("the snapshot extent is too small"));
            }

            match &entry.source {
                MapSource::Device(path) => match self.store.disk.is_block_device(path) {
                    Ok(true) => {}
                    Ok(false) => {
                        return Err(Error::inval("a source path is not a block device"))
                    }
                    Err(e) => return Err(Error::Noent(format!("{}: {}", path.display(), e))),
                },
                MapSource::Blob(src) => {
                    if src.lock.is_none() {
                        return Err(Error::inval("a source blob is not open"));
                    }
                    let backing = std::fs::metadata(&src.blocks_path)
                        .map_err(|e| Error::Noent(e.to_string()))?;
                    if backing.len() / 512 < src.size_blocks {
                        return Err(Error::inval(
                            "a source blob's backing file is too small",
                        ));
                    }
                    match self.store.disk.is_block_device(&src.device_path) {
                        Ok(true) => {}
                        _ => {
                            return Err(Error::inval(
                                "a source blob is missing its block device",
                            ))
                        }
                    }
                    if entry.first_block_src + entry.len_blocks > src.size_blocks {
                        return Err(Error::inval("a source blob is too small for the map"));
                    }
                }
                MapSource::Zero => {
                    if entry.relation != MapRelation::Copy && zero_dev.is_none() {
                        zero_dev = Some(dm::ensure_zero_device(&*self.store.disk)?);
                    }
                }
            }
        }

        let dm_base = format!("euca-{}", self.id).replace('/', "-");
        let mut names: Vec<String> = Vec::new();
        let mut tables: Vec<String> = Vec::new();
        let mut main_table = String::new();
        let mut mapped_or_snapshotted = 0;

        for (i, entry) in map.iter().enumerate() {
            let src_dev: PathBuf = match &entry.source {
                MapSource::Device(path) => path.to_path_buf(),
                MapSource::Blob(src) => src.device_path.clone(),
                MapSource::Zero => zero_dev.clone().unwrap_or_default(),
            };

            match entry.relation {
                MapRelation::Copy => {
                    if !matches!(entry.source, MapSource::Zero) {
                        self.store
                            .disk
                            .dd_range(
                                &src_dev,
                                &self.device_path,
                                512,
                                entry.len_blocks,
                                entry.first_block_dst,
                                entry.first_block_src,
                            )
                            .map_err(|e| {
                                Error::inval(format!("failed to copy a section: {}", e))
                            })?;
                    }
                    main_table.push_str(&format!(
                        "{} {} linear {} {}\n",
                        entry.first_block_dst,
                        entry.len_blocks,
                        self.device_path.display(),
                        entry.first_block_dst
                    ));
                }
                MapRelation::Map | MapRelation::Snapshot => {
                    let (mapped_dev, mapped_off) = if entry.relation == MapRelation::Snapshot {
                        // Device-mapper wants a chunk size dividing the
                        // extent; take the largest power of two up to 16.
                        let mut granularity = 16;
                        while entry.len_blocks % granularity != 0 {
                            granularity /= 2;
                        }

                        let back_name = format!("{}-p{}-back", dm_base, i);
                        names.push(back_name.clone());
                        tables.push(format!(
                            "0 {} linear {} {}\n",
                            entry.len_blocks,
                            self.device_path.display(),
                            entry.first_block_dst
                        ));

                        // Snapshots start at offset 0, so an offset source
                        // first gets its own linear device.
                        let snap_src = if entry.first_block_src > 0
                            && !matches!(entry.source, MapSource::Zero)
                        {
                            let real_name = format!("{}-p{}-real", dm_base, i);
                            names.push(real_name.clone());
                            tables.push(format!(
                                "0 {} linear {} {}\n",
                                entry.len_blocks,
                                src_dev.display(),
                                entry.first_block_src
                            ));
                            dm::device_path(&real_name)
                        } else {
                            src_dev.clone()
                        };

                        let snap_name = format!("{}-p{}-snap", dm_base, i);
                        names.push(snap_name.clone());
                        tables.push(format!(
                            "0 {} snapshot {} {} p {}\n",
                            entry.len_blocks,
                            snap_src.display(),
                            dm::device_path(&back_name).display(),
                            granularity
                        ));

                        (dm::device_path(&snap_name), 0)
                    } else {
                        (src_dev, entry.first_block_src)
                    };

                    main_table.push_str(&format!(
                        "{} {} linear {} {}\n",
                        entry.first_block_dst,
                        entry.len_blocks,
                        mapped_dev.display(),
                        mapped_off
                    ));
                    mapped_or_snapshotted += 1;
                }
            }
        }

        if mapped_or_snapshotted == 0 {
            return Ok(());
        }

        names.push(dm_base.clone());
        tables.push(main_table);
        debug!(blob = %self.id, devices = names.len(), "creating clone device stack");
        dm::create_devices(&*self.store.disk, &names, &tables, &self.store.dm_retry)?;

        let teardown = |e: Error| -> Error {
            let _ = dm::delete_devices(&*self.store.disk, &names, &self.store.dm_retry);
            let _ = sidecar::write_string(&self.store, Suffix::Dm, &self.id, "");
            e
        };

        if let Err(e) = sidecar::write_lines(&self.store, Suffix::Dm, &self.id, &names) {
            return Err(teardown(e));
        }

        // Record the dependency graph on both sides: the sources gain a
        // reference to us, we gain a dependency on them. COPY sources are
        // not dependencies. Each sidecar is rewritten under the store-wide
        // lock of the store that owns it.
        let graph_guard = match self.store.lock(None) {
            Ok(guard) => guard,
            Err(e) => return Err(teardown(e)),
        };
        let my_ref = format!("{} {}", self.store.path().display(), self.id);
        for entry in map {
            let MapSource::Blob(src) = &entry.source else {
                continue;
            };
            if entry.relation == MapRelation::Copy {
                continue;
            }
            let src_guard = if src.store.path() == self.store.path() {
                None
            } else {
                match src.store.lock(Some(METADATA_TIMEOUT)) {
                    Ok(guard) => Some(guard),
                    Err(e) => return Err(teardown(e)),
                }
            };
            if let Err(e) =
                sidecar::update_entry(&src.store, Suffix::Refs, &src.id, &my_ref, false)
            {
                return Err(teardown(e));
            }
            drop(src_guard);
            let dep_ref = format!("{} {}", src.store.path().display(), src.id);
            if let Err(e) =
                sidecar::update_entry(&self.store, Suffix::Deps, &self.id, &dep_ref, false)
            {
                return Err(teardown(e));
            }
        }
        drop(graph_guard);

        self.dm_name = Some(dm_base.clone());
        self.device_path = dm::device_path(&dm_base);
        Ok(())
    }
}
