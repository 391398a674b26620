//! Device-mapper bookkeeping: ordered creation with rollback, deduplicated
//! removal with retry, and the shared zero device.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::diskutil::DiskUtil;
use crate::error::{Error, Result};

pub(crate) const DM_DIR: &str = "/dev/mapper";

/// Name of the shared zero-fill device.
pub const ZERO_DEVICE: &str = "euca-zero";

// 1 PiB of 512-byte blocks, so any mapping fits inside it.
const ZERO_TABLE: &str = "0 2199023255552 zero";

/// Retry behavior for `dmsetup remove`, which transiently fails while the
/// kernel still considers a device busy.
#[derive(Debug, Clone)]
pub struct DmRetryPolicy {
    pub retries: u32,
    pub backoff: Duration,
}

impl Default for DmRetryPolicy {
    fn default() -> Self {
        Self {
            retries: 1,
            backoff: Duration::from_millis(100),
        }
    }
}

/// `/dev/mapper/<name>`.
pub(crate) fn device_path(name: &str) -> PathBuf {
    Path::new(DM_DIR).join(name)
}

/// Creates `names[i]` from `tables[i]` in order. On any failure the devices
/// created so far (including the failed one, which may half-exist) are
/// removed before the error is returned.
pub(crate) fn create_devices(
    disk: &dyn DiskUtil,
    names: &[String],
    tables: &[String],
    retry: &DmRetryPolicy,
) -> Result<()> {
    for (i, (name, table)) in names.iter().zip(tables).enumerate() {
        debug!(name = %name, table = %table, "creating device mapper device");
        if let Err(e) = disk.dm_create(name, table) {
            let _ = delete_devices(disk, &names[..=i], retry);
            return Err(Error::unknown(format!(
                "failed to set up device mapper device {name}: {e}"
            )));
        }
    }
    Ok(())
}

/// Removes the named devices in reverse creation order. A name that recurs
/// later in the list is skipped at its earlier position, so each device is
/// removed exactly once, after everything stacked on top of it. Failed
/// removals are retried per `retry`; the first definitive failure is
/// reported after the rest have been attempted.
pub(crate) fn delete_devices(
    disk: &dyn DiskUtil,
    names: &[String],
    retry: &DmRetryPolicy,
) -> Result<()> {
    let mut removable = Vec::with_capacity(names.len());
    for i in (0..names.len()).rev() {
        if !names[i + 1..].contains(&names[i]) {
            removable.push(names[i].as_str());
        }
    }

    let mut ret = Ok(());
    for name in removable {
        let mut attempts_left = retry.retries;
        loop {
            match disk.dm_remove(name) {
                Ok(()) => break,
                Err(e) if attempts_left > 0 => {
                    debug!(name, error = %e, "retrying device mapper removal");
                    attempts_left -= 1;
                    thread::sleep(retry.backoff);
                }
                Err(e) => {
                    warn!(name, error = %e, "failed to remove device mapper device");
                    if ret.is_ok() {
                        ret = Err(Error::unknown(format!(
                            "failed to remove device mapper device {name}: {e}"
                        )));
                    }
                    break;
                }
            }
        }
    }
    ret
}

/// Returns the path of the zero device, creating it on first use. The
/// device is re-checked once after creation.
pub(crate) fn ensure_zero_device(disk: &dyn DiskUtil) -> Result<PathBuf> {
    let path = device_path(ZERO_DEVICE);
    let mut created = false;
    loop {
        match disk.is_block_device(&path) {
            Ok(true) => return Ok(path),
            Ok(false) => {
                return Err(Error::unknown(format!(
                    "{} exists but is not a block device",
                    path.display()
                )))
            }
            Err(_) if !created => {
                let _ = disk.dm_create(ZERO_DEVICE, ZERO_TABLE);
                created = true;
            }
            Err(e) => {
                return Err(Error::unknown(format!(
                    "failed to create the zero block device: {e}"
                )))
            }
        }
    }
}
