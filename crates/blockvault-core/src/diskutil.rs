//! The disk-utility layer: loopback attachment, device-mapper control, and
//! block-range copies.
//!
//! The core consumes these operations through the [`DiskUtil`] trait so the
//! rest of the crate can run against an in-memory fake in tests. The shipped
//! implementation shells out to `losetup`, `dmsetup`, and `dd`.

use std::io::{self, Write};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::debug;

/// External block-device plumbing the store relies on. All operations are
/// synchronous.
pub trait DiskUtil: Send + Sync {
    /// Binds a free loop device to `path` and returns the device path.
    fn loop_attach(&self, path: &Path) -> io::Result<PathBuf>;

    /// Releases a loop binding.
    fn loop_detach(&self, dev: &Path) -> io::Result<()>;

    /// Creates device-mapper device `name` from the given table text.
    fn dm_create(&self, name: &str, table: &str) -> io::Result<()>;

    /// Removes device-mapper device `name`.
    fn dm_remove(&self, name: &str) -> io::Result<()>;

    /// Suspends and immediately resumes `name`, refreshing its mapping.
    fn dm_suspend_resume(&self, name: &str) -> io::Result<()>;

    /// Copies `count` blocks of `block_size` bytes from `src` (starting at
    /// block `src_off`) into `dst` (starting at block `dst_off`).
    fn dd_range(
        &self,
        src: &Path,
        dst: &Path,
        block_size: u64,
        count: u64,
        dst_off: u64,
        src_off: u64,
    ) -> io::Result<()>;

    /// Whether `path` exists and names a block device.
    fn is_block_device(&self, path: &Path) -> io::Result<bool>;
}

/// [`DiskUtil`] backed by the system tools, resolved from `PATH`.
#[derive(Debug, Default, Clone)]
pub struct SystemDiskUtil;

impl SystemDiskUtil {
    fn run(mut cmd: Command) -> io::Result<std::process::Output> {
        debug!(command = ?cmd, "invoking disk utility");
        let output = cmd.output()?;
        if !output.status.success() {
            return Err(io::Error::other(format!(
                "{:?} exited with {}: {}",
                cmd.get_program(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output)
    }
}

impl DiskUtil for SystemDiskUtil {
    fn loop_attach(&self, path: &Path) -> io::Result<PathBuf> {
        let mut cmd = Command::new("losetup");
        cmd.arg("--show").arg("-f").arg(path);
        let output = Self::run(cmd)?;
        let dev = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if dev.is_empty() {
            return Err(io::Error::other("losetup reported no device"));
        }
        Ok(PathBuf::from(dev))
    }

    fn loop_detach(&self, dev: &Path) -> io::Result<()> {
        let mut cmd = Command::new("losetup");
        cmd.arg("-d").arg(dev);
        Self::run(cmd).map(|_| ())
    }

    fn dm_create(&self, name: &str, table: &str) -> io::Result<()> {
        debug!(name, table, "dmsetup create");
        let mut child = Command::new("dmsetup")
            .arg("create")
            .arg(name)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        child
            .stdin
            .take()
            .expect("stdin was piped")
            .write_all(table.as_bytes())?;
        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(io::Error::other(format!(
                "dmsetup create {} exited with {}: {}",
                name,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    fn dm_remove(&self, name: &str) -> io::Result<()> {
        let mut cmd = Command::new("dmsetup");
        cmd.arg("remove").arg(name);
        Self::run(cmd).map(|_| ())
    }

    fn dm_suspend_resume(&self, name: &str) -> io::Result<()> {
        let mut suspend = Command::new("dmsetup");
        suspend.arg("suspend").arg(name);
        Self::run(suspend)?;
        let mut resume = Command::new("dmsetup");
        resume.arg("resume").arg(name);
        Self::run(resume).map(|_| ())
    }

    fn dd_range(
        &self,
        src: &Path,
        dst: &Path,
        block_size: u64,
        count: u64,
        dst_off: u64,
        src_off: u64,
    ) -> io::Result<()> {
        let mut cmd = Command::new("dd");
        cmd.arg(format!("if={}", src.display()))
            .arg(format!("of={}", dst.display()))
            .arg(format!("bs={}", block_size))
            .arg(format!("count={}", count))
            .arg(format!("seek={}", dst_off))
            .arg(format!("skip={}", src_off))
            .arg("conv=notrunc");
        Self::run(cmd).map(|_| ())
    }

    fn is_block_device(&self, path: &Path) -> io::Result<bool> {
        let meta = std::fs::metadata(path)?;
        Ok(meta.file_type().is_block_device())
    }
}
