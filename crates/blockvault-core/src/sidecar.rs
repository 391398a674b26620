//! Sidecar files: the typed metadata attached to every blob id.
//!
//! Depending on the store format a sidecar lives at `ROOT/ID.<suffix>`
//! (files format) or `ROOT/ID/<suffix>` (directory format). The blob id may
//! contain `/`, which nests the blob under subdirectories; parents are
//! created lazily with mode `0700`.

use std::fs::{self, DirBuilder};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{Error, Result};
use crate::store::{Blobstore, StoreFormat};

/// Recognized sidecar kinds. Any other file name in the store tree is
/// ignored by the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suffix {
    /// The sparse backing file; its presence defines the blob.
    Blocks,
    /// Device-mapper devices created for this blob, main device last.
    Dm,
    /// Blobs this blob depends on.
    Deps,
    /// Loopback device currently bound to the backing file.
    Loopback,
    /// Caller-supplied signature.
    Sig,
    /// Blobs that depend on this one.
    Refs,
}

impl Suffix {
    pub const ALL: [Suffix; 6] = [
        Suffix::Blocks,
        Suffix::Dm,
        Suffix::Deps,
        Suffix::Loopback,
        Suffix::Sig,
        Suffix::Refs,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Suffix::Blocks => "blocks",
            Suffix::Dm => "dm",
            Suffix::Deps => "deps",
            Suffix::Loopback => "loopback",
            Suffix::Sig => "sig",
            Suffix::Refs => "refs",
        }
    }
}

/// Absolute path of the `suffix` sidecar for blob `id`.
pub fn sidecar_path(store: &Blobstore, suffix: Suffix, id: &str) -> PathBuf {
    match store.format() {
        StoreFormat::Files => store.path().join(format!("{}.{}", id, suffix.as_str())),
        StoreFormat::Directory => store.path().join(id).join(suffix.as_str()),
    }
}

/// Creates the directories blob `id`'s sidecars will live in, mode `0700`.
/// Returns whether anything was created.
pub(crate) fn ensure_blob_dirs(store: &Blobstore, id: &str) -> Result<bool> {
    let base = store.path().join(id);
    let target = match store.format() {
        StoreFormat::Files => match base.parent() {
            Some(parent) => parent.to_path_buf(),
            None => return Ok(false),
        },
        StoreFormat::Directory => base,
    };
    if target.exists() {
        return Ok(false);
    }
    info!(path = %target.display(), "creating blob directories");
    DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(&target)?;
    Ok(true)
}

/// Truncate-and-write `s` into the sidecar. An empty string unlinks the
/// file instead.
pub fn write_string(store: &Blobstore, suffix: Suffix, id: &str, s: &str) -> Result<()> {
    let path = sidecar_path(store, suffix, id);
    if s.is_empty() {
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    } else {
        fs::write(&path, s)?;
        Ok(())
    }
}

/// Reads the whole sidecar. An absent file is an error here; use
/// [`read_lines`] for the list-valued sidecars where absence means empty.
pub fn read_string(store: &Blobstore, suffix: Suffix, id: &str) -> Result<String> {
    let path = sidecar_path(store, suffix, id);
    fs::read_to_string(&path).map_err(Error::from)
}

/// Writes `lines`, one entry per line. An empty list produces an empty file.
pub fn write_lines(store: &Blobstore, suffix: Suffix, id: &str, lines: &[String]) -> Result<()> {
    let path = sidecar_path(store, suffix, id);
    let mut contents = String::new();
    for line in lines {
        contents.push_str(line);
        contents.push('\n');
    }
    fs::write(&path, contents)?;
    Ok(())
}

/// Reads the sidecar as a list of lines. An absent file yields an empty
/// list, not an error.
pub fn read_lines(store: &Blobstore, suffix: Suffix, id: &str) -> Result<Vec<String>> {
    let path = sidecar_path(store, suffix, id);
    match fs::read_to_string(&path) {
        Ok(contents) => Ok(contents.lines().map(str::to_string).collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Adds `entry` to (or removes it from) the sidecar list, rewriting the
/// file. Idempotent when the desired state already holds.
pub fn update_entry(
    store: &Blobstore,
    suffix: Suffix,
    id: &str,
    entry: &str,
    removing: bool,
) -> Result<()> {
    let mut lines = read_lines(store, suffix, id)?;
    let found = lines.iter().position(|line| line == entry);
    match (found, removing) {
        (None, false) => lines.push(entry.to_string()),
        (Some(i), true) => {
            lines.remove(i);
        }
        _ => return Ok(()),
    }
    write_lines(store, suffix, id, &lines)
}

/// If `path` names a sidecar inside the store, returns its suffix and the
/// blob id it belongs to. Longest recognized suffix wins.
pub fn classify(store: &Blobstore, path: &Path) -> Option<(Suffix, String)> {
    let rel = path.strip_prefix(store.path()).ok()?;
    let rel = rel.to_str()?;
    let sep = match store.format() {
        StoreFormat::Files => '.',
        StoreFormat::Directory => '/',
    };

    let mut suffixes = Suffix::ALL;
    suffixes.sort_by_key(|s| std::cmp::Reverse(s.as_str().len()));
    for suffix in suffixes {
        let tail = format!("{}{}", sep, suffix.as_str());
        if rel.len() > tail.len() && rel.ends_with(&tail) {
            let id = &rel[..rel.len() - tail.len()];
            return Some((suffix, id.to_string()));
        }
    }
    None
}

/// Unlinks every sidecar of blob `id` and removes now-empty parent
/// directories up to (but never including) the store root. Returns the
/// number of files and directories removed; zero means there was nothing.
pub fn delete_files(store: &Blobstore, id: &str) -> usize {
    let mut count = 0;
    for suffix in Suffix::ALL {
        if fs::remove_file(sidecar_path(store, suffix, id)).is_ok() {
            count += 1;
        }
    }

    let mut dir = match store.format() {
        StoreFormat::Directory => Some(store.path().join(id)),
        StoreFormat::Files => store.path().join(id).parent().map(Path::to_path_buf),
    };
    while let Some(d) = dir {
        if d == store.path() || fs::remove_dir(&d).is_err() {
            break;
        }
        count += 1;
        dir = d.parent().map(Path::to_path_buf);
    }

    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{StoreConfig, StoreFormat};
    use crate::testing::FakeDiskUtil;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn store_with(format: StoreFormat) -> (TempDir, Blobstore) {
        let dir = TempDir::new().unwrap();
        let store = Blobstore::open(
            dir.path(),
            StoreConfig {
                limit_blocks: Some(1000),
                format: Some(format),
                ..Default::default()
            },
            Arc::new(FakeDiskUtil::default()),
        )
        .unwrap();
        (dir, store)
    }

    fn lines(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn lines_round_trip() {
        let (_dir, store) = store_with(StoreFormat::Files);
        let entries = lines(&["/stores/a blob-1", "/stores/b blob-2"]);
        write_lines(&store, Suffix::Refs, "bb", &entries).unwrap();
        assert_eq!(read_lines(&store, Suffix::Refs, "bb").unwrap(), entries);
    }

    #[test]
    fn absent_list_reads_empty() {
        let (_dir, store) = store_with(StoreFormat::Files);
        assert!(read_lines(&store, Suffix::Deps, "nothing").unwrap().is_empty());
    }

    #[test]
    fn absent_string_is_an_error() {
        let (_dir, store) = store_with(StoreFormat::Files);
        assert!(matches!(
            read_string(&store, Suffix::Sig, "nothing"),
            Err(Error::Noent(_))
        ));
    }

    #[test]
    fn empty_string_unlinks() {
        let (_dir, store) = store_with(StoreFormat::Files);
        write_string(&store, Suffix::Sig, "bb", "hello").unwrap();
        assert!(sidecar_path(&store, Suffix::Sig, "bb").exists());
        write_string(&store, Suffix::Sig, "bb", "").unwrap();
        assert!(!sidecar_path(&store, Suffix::Sig, "bb").exists());
        // Unlinking again stays fine.
        write_string(&store, Suffix::Sig, "bb", "").unwrap();
    }

    #[test]
    fn update_entry_is_idempotent() {
        let (_dir, store) = store_with(StoreFormat::Files);
        update_entry(&store, Suffix::Refs, "bb", "/s one", false).unwrap();
        update_entry(&store, Suffix::Refs, "bb", "/s one", false).unwrap();
        update_entry(&store, Suffix::Refs, "bb", "/s two", false).unwrap();
        assert_eq!(
            read_lines(&store, Suffix::Refs, "bb").unwrap(),
            lines(&["/s one", "/s two"])
        );

        update_entry(&store, Suffix::Refs, "bb", "/s one", true).unwrap();
        update_entry(&store, Suffix::Refs, "bb", "/s one", true).unwrap();
        assert_eq!(
            read_lines(&store, Suffix::Refs, "bb").unwrap(),
            lines(&["/s two"])
        );
    }

    #[test]
    fn classify_round_trips_in_both_formats() {
        for format in [StoreFormat::Files, StoreFormat::Directory] {
            let (_dir, store) = store_with(format);
            for suffix in Suffix::ALL {
                for id in ["bb-01", "FOO/bb-02", "FOO/BAR/bb-03"] {
                    let path = sidecar_path(&store, suffix, id);
                    assert_eq!(
                        classify(&store, &path),
                        Some((suffix, id.to_string())),
                        "{:?} {:?}",
                        format,
                        path
                    );
                }
            }
        }
    }

    #[test]
    fn classify_ignores_unrelated_files() {
        let (_dir, store) = store_with(StoreFormat::Files);
        assert_eq!(classify(&store, &store.path().join(".blobstore")), None);
        assert_eq!(classify(&store, &store.path().join("notes.txt")), None);
        // A bare suffix with no id is not a sidecar.
        assert_eq!(classify(&store, &store.path().join(".blocks")), None);
    }

    #[test]
    fn delete_files_removes_empty_parents() {
        let (_dir, store) = store_with(StoreFormat::Directory);
        ensure_blob_dirs(&store, "A/B/bb").unwrap();
        write_string(&store, Suffix::Sig, "A/B/bb", "sig").unwrap();
        fs::write(sidecar_path(&store, Suffix::Blocks, "A/B/bb"), b"\0").unwrap();

        let removed = delete_files(&store, "A/B/bb");
        assert!(removed >= 4, "expected files plus directories, got {removed}");
        assert!(!store.path().join("A").exists());
        assert!(store.path().join(".blobstore").exists());
    }
}
