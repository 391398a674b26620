//! The blobstore: a directory with a `.blobstore` metadata file and any
//! number of blobs, each a sparse backing file plus sidecars.
//!
//! Opening a store creates it if the metadata file does not exist yet;
//! the parameters written at creation (`limit`, `format`, `snapshot`) are
//! immutable afterwards, and reopening with disagreeing values fails.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use blockvault_lock::{self as lock, LockHandle, OpenFlags};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::blob::{self, InUse};
use crate::diskutil::DiskUtil;
use crate::dm::DmRetryPolicy;
use crate::error::{Error, Result};
use crate::sidecar::{self, Suffix};

pub(crate) const METADATA_FILE: &str = ".blobstore";
pub(crate) const METADATA_TIMEOUT: Duration = Duration::from_millis(999);
const METADATA_MIN_SIZE: usize = 30;

/// How sidecars are laid out on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreFormat {
    /// `ROOT/ID.<suffix>`
    Files,
    /// `ROOT/ID/<suffix>`
    Directory,
}

/// What happens when a create needs more blocks than are free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RevocationPolicy {
    /// Fail with out-of-space.
    None,
    /// Purge least-recently-modified blobs that are not in use.
    Lru,
}

/// Whether clones may use device-mapper snapshots and linear maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotPolicy {
    /// Only COPY relations are allowed.
    None,
    /// Device-mapper composition is available.
    Dm,
}

impl StoreFormat {
    fn code(self) -> i64 {
        match self {
            StoreFormat::Files => 0,
            StoreFormat::Directory => 1,
        }
    }

    fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(StoreFormat::Files),
            1 => Some(StoreFormat::Directory),
            _ => None,
        }
    }
}

impl RevocationPolicy {
    fn code(self) -> i64 {
        match self {
            RevocationPolicy::None => 0,
            RevocationPolicy::Lru => 1,
        }
    }

    fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(RevocationPolicy::None),
            1 => Some(RevocationPolicy::Lru),
            _ => None,
        }
    }
}

impl SnapshotPolicy {
    fn code(self) -> i64 {
        match self {
            SnapshotPolicy::None => 0,
            SnapshotPolicy::Dm => 1,
        }
    }

    fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(SnapshotPolicy::None),
            1 => Some(SnapshotPolicy::Dm),
            _ => None,
        }
    }
}

/// Parameters for [`Blobstore::open`]. A `None` means "accept whatever the
/// store already uses" (and, on creation, the default).
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    pub limit_blocks: Option<u64>,
    pub format: Option<StoreFormat>,
    pub revocation: Option<RevocationPolicy>,
    pub snapshot: Option<SnapshotPolicy>,
    pub dm_retry: DmRetryPolicy,
}

/// An open blobstore.
pub struct Blobstore {
    path: PathBuf,
    id: String,
    limit_blocks: u64,
    format: StoreFormat,
    revocation: RevocationPolicy,
    snapshot: SnapshotPolicy,
    pub(crate) dm_retry: DmRetryPolicy,
    pub(crate) disk: Arc<dyn DiskUtil>,
}

impl std::fmt::Debug for Blobstore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blobstore")
            .field("path", &self.path)
            .field("id", &self.id)
            .field("limit_blocks", &self.limit_blocks)
            .field("format", &self.format)
            .field("revocation", &self.revocation)
            .field("snapshot", &self.snapshot)
            .finish()
    }
}

/// Holds the store-wide writer lock; released on drop. Structural mutations
/// (create, delete, scan-and-purge) happen under this guard.
pub struct StoreGuard {
    handle: Option<LockHandle>,
}

impl Drop for StoreGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = lock::release(handle) {
                warn!(error = %e, "failed to release the store lock");
            }
        }
    }
}

/// One blob as seen by the scanner.
#[derive(Debug, Clone, Serialize)]
pub struct BlobInfo {
    pub id: String,
    pub size_blocks: u64,
    pub blocks_path: PathBuf,
    pub device_path: Option<PathBuf>,
    pub last_accessed: SystemTime,
    pub last_modified: SystemTime,
    pub in_use: InUse,
}

impl Blobstore {
    /// Opens the store rooted at `path`, creating its metadata file if this
    /// is the first open. Any `Some` value in `config` that disagrees with
    /// the stored parameters fails with [`Error::Inval`].
    pub fn open(
        path: impl AsRef<Path>,
        config: StoreConfig,
        disk: Arc<dyn DiskUtil>,
    ) -> Result<Blobstore> {
        let path = fs::canonicalize(path.as_ref())?;
        let meta_path = path.join(METADATA_FILE);

        // Race for creation; losing to an existing file or to a concurrent
        // creator is fine, anything else is not.
        match lock::acquire(
            &meta_path,
            OpenFlags::CREATE | OpenFlags::EXCL | OpenFlags::RDWR,
            Some(Duration::ZERO),
            0o600,
        ) {
            Ok(handle) => {
                let id = gen_id(16);
                let limit = config.limit_blocks.unwrap_or(0);
                let revocation = config.revocation.unwrap_or(RevocationPolicy::None);
                let snapshot = config.snapshot.unwrap_or(SnapshotPolicy::Dm);
                let format = config.format.unwrap_or(StoreFormat::Files);
                info!(path = %path.display(), id = %id, limit, "creating blobstore");
                let text = format_metadata(&id, limit, revocation, snapshot, format);
                let result = handle.file().write_all(text.as_bytes());
                lock::release(handle)?;
                result?;
            }
            Err(lock::LockError::Timeout) => {}
            Err(lock::LockError::Io(e)) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }

        // Reopen shared and read the authoritative parameters back.
        let handle = lock::acquire(
            &meta_path,
            OpenFlags::RDONLY,
            Some(METADATA_TIMEOUT),
            0o600,
        )?;
        let mut text = String::new();
        let read = handle.file().read_to_string(&mut text).map_err(Error::from);
        lock::release(handle)?;
        read?;
        let (id, limit_blocks, revocation, snapshot, format) = parse_metadata(&text)?;

        if let Some(want) = config.limit_blocks {
            if want != 0 && want != limit_blocks {
                return Err(Error::inval(
                    "limit_blocks does not match the existing blobstore",
                ));
            }
        }
        if let Some(want) = config.snapshot {
            if want != snapshot {
                return Err(Error::inval(
                    "snapshot policy does not match the existing blobstore",
                ));
            }
        }
        if let Some(want) = config.format {
            if want != format {
                return Err(Error::inval("format does not match the existing blobstore"));
            }
        }
        if let Some(want) = config.revocation {
            if want != revocation {
                return Err(Error::inval(
                    "revocation policy does not match the existing blobstore",
                ));
            }
        }

        Ok(Blobstore {
            path,
            id,
            limit_blocks,
            format,
            revocation,
            snapshot,
            dm_retry: config.dm_retry,
            disk,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn limit_blocks(&self) -> u64 {
        self.limit_blocks
    }

    pub fn format(&self) -> StoreFormat {
        self.format
    }

    pub fn revocation(&self) -> RevocationPolicy {
        self.revocation
    }

    pub fn snapshot(&self) -> SnapshotPolicy {
        self.snapshot
    }

    pub(crate) fn meta_path(&self) -> PathBuf {
        self.path.join(METADATA_FILE)
    }

    /// Takes the store-wide writer lock.
    pub fn lock(&self, timeout: Option<Duration>) -> Result<StoreGuard> {
        let handle = lock::acquire(&self.meta_path(), OpenFlags::RDWR, timeout, 0o600)?;
        Ok(StoreGuard {
            handle: Some(handle),
        })
    }

    /// Walks the store tree and returns every blob with its current size,
    /// timestamps, and in-use status. The in-use check is non-blocking, so
    /// a blob open anywhere (including in this process) reports `OPENED`.
    ///
    /// Callers that act on the result should hold the store lock across the
    /// scan and the action.
    pub fn scan(&self) -> Result<Vec<BlobInfo>> {
        let mut found = Vec::new();
        let root = self.path.clone();
        self.walk(&root, &mut found)?;
        Ok(found)
    }

    fn walk(&self, dir: &Path, found: &mut Vec<BlobInfo>) -> Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            // Access errors inside the tree are not the scanner's problem.
            Err(_) => return Ok(()),
        };
        for entry in entries.flatten() {
            if entry.file_name() == METADATA_FILE {
                continue;
            }
            let entry_path = entry.path();
            let meta = match fs::metadata(&entry_path) {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            if meta.is_dir() {
                self.walk(&entry_path, found)?;
                continue;
            }
            let Some((Suffix::Blocks, id)) = sidecar::classify(self, &entry_path) else {
                continue;
            };
            let (device_path, _) = blob::resolve_device(self, &id);
            let in_use = blob::check_in_use(self, &id, Some(Duration::ZERO));
            found.push(BlobInfo {
                size_blocks: meta.len() / 512,
                blocks_path: entry_path,
                device_path,
                last_accessed: meta.accessed().unwrap_or(SystemTime::UNIX_EPOCH),
                last_modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                in_use,
                id,
            });
        }
        Ok(())
    }

    /// Verifies that `requested` blocks fit under the store limit, purging
    /// under the LRU policy if they do not. Must be called with the store
    /// lock held.
    pub(crate) fn ensure_capacity(&self, requested: u64) -> Result<()> {
        let blobs = self.scan()?;

        let mut blocks_inuse: u64 = 0;
        let mut blocks_allocated: u64 = 0;
        for blob in &blobs {
            if blob.in_use.intersects(InUse::OPENED | InUse::MAPPED) {
                blocks_inuse += blob.size_blocks;
            } else {
                blocks_allocated += blob.size_blocks;
            }
        }

        let blocks_free = self.limit_blocks as i64 - (blocks_allocated + blocks_inuse) as i64;
        if blocks_free >= requested as i64 {
            return Ok(());
        }
        if self.revocation != RevocationPolicy::Lru
            || blocks_free + (blocks_allocated as i64) < requested as i64
        {
            return Err(Error::Nospc(format!(
                "{} blocks requested, {} free",
                requested, blocks_free
            )));
        }
        let needed = (requested as i64 - blocks_free) as u64;
        let purged = self.purge_lru(blobs, needed);
        if purged < needed {
            return Err(Error::Nospc(
                "could not purge enough from the store".into(),
            ));
        }
        Ok(())
    }

    /// Deletes least-recently-modified blobs that are not open and not
    /// mapped until at least `needed` blocks are reclaimed or candidates
    /// run out. Returns the number of blocks reclaimed.
    fn purge_lru(&self, mut blobs: Vec<BlobInfo>, needed: u64) -> u64 {
        blobs.sort_by_key(|blob| blob.last_modified);

        let mut purged = 0;
        for blob in &blobs {
            if !blob.in_use.intersects(InUse::OPENED | InUse::MAPPED)
                && sidecar::delete_files(self, &blob.id) > 0
            {
                purged += blob.size_blocks;
                info!(
                    store = %self.id,
                    blob = %blob.id,
                    size_blocks = blob.size_blocks,
                    total_purged = purged,
                    "purged blob"
                );
            }
            if purged >= needed {
                break;
            }
        }
        purged
    }
}

pub(crate) fn gen_id(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| char::from_digit(rng.gen_range(0..16), 16).expect("hex digit"))
        .collect()
}

fn format_metadata(
    id: &str,
    limit: u64,
    revocation: RevocationPolicy,
    snapshot: SnapshotPolicy,
    format: StoreFormat,
) -> String {
    format!(
        "id: {}\nlimit: {}\nrevocation: {}\nsnapshot: {}\nformat: {}\n",
        id,
        limit,
        revocation.code(),
        snapshot.code(),
        format.code()
    )
}

fn parse_metadata(
    text: &str,
) -> Result<(String, u64, RevocationPolicy, SnapshotPolicy, StoreFormat)> {
    if text.len() < METADATA_MIN_SIZE {
        return Err(Error::Noent("store metadata is too small".into()));
    }
    let id = get_val(text, "id")
        .ok_or_else(|| Error::Noent("store metadata is missing 'id'".into()))?;
    let limit = get_int(text, "limit")?;
    let limit = u64::try_from(limit)
        .map_err(|_| Error::Noent("store metadata has a negative 'limit'".into()))?;
    let revocation = RevocationPolicy::from_code(get_int(text, "revocation")?)
        .ok_or_else(|| Error::Noent("store metadata has a bad 'revocation'".into()))?;
    let snapshot = SnapshotPolicy::from_code(get_int(text, "snapshot")?)
        .ok_or_else(|| Error::Noent("store metadata has a bad 'snapshot'".into()))?;
    let format = StoreFormat::from_code(get_int(text, "format")?)
        .ok_or_else(|| Error::Noent("store metadata has a bad 'format'".into()))?;
    debug!(id = %id, limit, "parsed store metadata");
    Ok((id, limit, revocation, snapshot, format))
}

fn get_val(text: &str, key: &str) -> Option<String> {
    let prefix = format!("{}: ", key);
    let start = text.find(&prefix)? + prefix.len();
    let rest = &text[start..];
    let end = rest.find('\n').unwrap_or(rest.len());
    Some(rest[..end].to_string())
}

fn get_int(text: &str, key: &str) -> Result<i64> {
    let val = get_val(text, key)
        .ok_or_else(|| Error::Noent(format!("store metadata is missing '{}'", key)))?;
    val.parse::<i64>()
        .map_err(|_| Error::Noent(format!("store metadata has an unparseable '{}'", key)))
}
