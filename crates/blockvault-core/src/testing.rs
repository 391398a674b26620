//! Test support: an in-memory [`DiskUtil`] that stands in for the kernel.
//!
//! Loop attachments get synthetic `/dev/fake-loopN` names bound to their
//! backing files, device-mapper creations are recorded in order, and
//! `dd_range` performs real byte copies against the backing files so COPY
//! extents can be verified. A failure can be injected into `dm_create` to
//! exercise rollback paths.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::diskutil::DiskUtil;

#[derive(Debug, Clone)]
pub struct DdCall {
    pub src: PathBuf,
    pub dst: PathBuf,
    pub count: u64,
    pub dst_off: u64,
    pub src_off: u64,
}

#[derive(Default)]
struct FakeState {
    next_loop: usize,
    loops: HashMap<PathBuf, PathBuf>,
    created: Vec<(String, String)>,
    active: HashMap<String, String>,
    removed: Vec<String>,
    dd_calls: Vec<DdCall>,
    allowed_creates: Option<usize>,
}

#[derive(Default)]
pub struct FakeDiskUtil {
    state: Mutex<FakeState>,
}

impl FakeDiskUtil {
    /// Lets `n` `dm_create` calls succeed, then fails every later one.
    pub fn fail_dm_create_after(&self, n: usize) {
        self.state.lock().unwrap().allowed_creates = Some(n);
    }

    /// Every `(name, table)` ever created, in creation order.
    pub fn created_dm(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().created.clone()
    }

    /// Names of devices currently existing (created and not removed).
    pub fn active_dm(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().unwrap().active.keys().cloned().collect();
        names.sort();
        names
    }

    /// Table of an active device.
    pub fn dm_table(&self, name: &str) -> Option<String> {
        self.state.lock().unwrap().active.get(name).cloned()
    }

    /// Names passed to `dm_remove` that succeeded, in order.
    pub fn removed_dm(&self) -> Vec<String> {
        self.state.lock().unwrap().removed.clone()
    }

    /// Recorded block-range copies.
    pub fn dd_calls(&self) -> Vec<DdCall> {
        self.state.lock().unwrap().dd_calls.clone()
    }

    /// Number of currently attached loop devices.
    pub fn attached_loops(&self) -> usize {
        self.state.lock().unwrap().loops.len()
    }

    /// Resolves a path to the file actually holding its bytes: loop
    /// devices resolve to their backing files, plain files to themselves.
    fn resolve(state: &FakeState, path: &Path) -> io::Result<PathBuf> {
        if let Some(backing) = state.loops.get(path) {
            return Ok(backing.clone());
        }
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} is not a fake device or file", path.display()),
        ))
    }
}

impl DiskUtil for FakeDiskUtil {
    fn loop_attach(&self, path: &Path) -> io::Result<PathBuf> {
        let mut state = self.state.lock().unwrap();
        let dev = PathBuf::from(format!("/dev/fake-loop{}", state.next_loop));
        state.next_loop += 1;
        state.loops.insert(dev.clone(), path.to_path_buf());
        Ok(dev)
    }

    fn loop_detach(&self, dev: &Path) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .loops
            .remove(dev)
            .map(|_| ())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such loop device"))
    }

    fn dm_create(&self, name: &str, table: &str) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(allowed) = state.allowed_creates {
            if state.created.len() >= allowed {
                return Err(io::Error::other("injected dm_create failure"));
            }
        }
        if state.active.contains_key(name) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("device {} already exists", name),
            ));
        }
        state.created.push((name.to_string(), table.to_string()));
        state.active.insert(name.to_string(), table.to_string());
        Ok(())
    }

    fn dm_remove(&self, name: &str) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.active.remove(name).is_none() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no device {}", name),
            ));
        }
        state.removed.push(name.to_string());
        Ok(())
    }

    fn dm_suspend_resume(&self, name: &str) -> io::Result<()> {
        let state = self.state.lock().unwrap();
        if state.active.contains_key(name) {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no device {}", name),
            ))
        }
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
        let (src_file, dst_file) = {
            let mut state = self.state.lock().unwrap();
            state.dd_calls.push(DdCall {
                src: src.to_path_buf(),
                dst: dst.to_path_buf(),
                count,
                dst_off,
                src_off,
            });
            (Self::resolve(&state, src)?, Self::resolve(&state, dst)?)
        };

        let mut from = OpenOptions::new().read(true).open(src_file)?;
        from.seek(SeekFrom::Start(src_off * block_size))?;
        let mut buf = vec![0u8; (count * block_size) as usize];
        from.read_exact(&mut buf)?;

        let mut to = OpenOptions::new().write(true).open(dst_file)?;
        to.seek(SeekFrom::Start(dst_off * block_size))?;
        to.write_all(&buf)?;
        Ok(())
    }

    fn is_block_device(&self, path: &Path) -> io::Result<bool> {
        let state = self.state.lock().unwrap();
        if state.loops.contains_key(path) {
            return Ok(true);
        }
        if let Some(name) = path
            .strip_prefix(crate::dm::DM_DIR)
            .ok()
            .and_then(|n| n.to_str())
        {
            if state.active.contains_key(name) {
                return Ok(true);
            }
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no device {}", path.display()),
            ));
        }
        if path.exists() {
            return Ok(false);
        }
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} does not exist", path.display()),
        ))
    }
}
