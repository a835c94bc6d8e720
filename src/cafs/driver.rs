use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::cafs::{ChildHashNode, BLOCK_SIZE, RW_SESSION_NAME};
use crate::errors::{NodeError, NodeResult};
use crate::hash::{hash_bytes, H32};

/// Capability interface of the filesystem helper. The production helper is
/// an out-of-process server reached over Unix IPC; this seam lets the node
/// run against the in-process [`DirDriver`] in tests and when the config
/// sets `hpfs.external = false`.
pub trait HpfsDriver: Send + Sync {
    fn open_session(&self, name: &str, writable: bool, hmap_enabled: bool) -> NodeResult<()>;
    /// `commit` publishes a writable session's content back to the seed
    /// tree before the session directory is discarded.
    fn close_session(&self, name: &str, commit: bool) -> NodeResult<()>;
    fn query_hash(&self, session: &str, vpath: &str) -> NodeResult<H32>;
    fn file_block_hashes(&self, session: &str, vpath: &str) -> NodeResult<Vec<H32>>;
    fn dir_children_hashes(&self, session: &str, vpath: &str) -> NodeResult<Vec<ChildHashNode>>;
    fn physical_path(&self, session: &str, vpath: &str) -> PathBuf;
    fn session_exists(&self, name: &str) -> bool;
}

#[derive(Clone)]
struct SessionMeta {
    writable: bool,
}

/// In-process driver: the seed tree under `<fs_dir>/seed` is the canonical
/// content; sessions are materialized copies under the mount directory.
pub struct DirDriver {
    seed_dir: PathBuf,
    mount_dir: PathBuf,
    sessions: Mutex<HashMap<String, SessionMeta>>,
}

impl DirDriver {
    pub fn new(fs_dir: &Path, mount_dir: &Path) -> NodeResult<Self> {
        let seed_dir = fs_dir.join("seed");
        fs::create_dir_all(&seed_dir)?;
        fs::create_dir_all(mount_dir)?;
        Ok(Self {
            seed_dir,
            mount_dir: mount_dir.to_path_buf(),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn seed_dir(&self) -> &Path {
        &self.seed_dir
    }

    fn session_root(&self, name: &str) -> PathBuf {
        self.mount_dir.join(name)
    }

    fn resolve(&self, session: &str, vpath: &str) -> PathBuf {
        let root = if session.is_empty() {
            self.seed_dir.clone()
        } else {
            self.session_root(session)
        };
        root.join(vpath.trim_start_matches('/'))
    }

    fn require_session(&self, name: &str) -> NodeResult<()> {
        if name.is_empty() || self.sessions.lock().contains_key(name) {
            Ok(())
        } else {
            Err(NodeError::SessionNotFound(name.to_string()))
        }
    }

    fn hash_path(&self, path: &Path) -> NodeResult<H32> {
        let meta = fs::metadata(path)?;
        if meta.is_file() {
            Ok(hash_file(path)?)
        } else {
            let mut entries = read_child_entries(path)?;
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut hasher = blake3::Hasher::new();
            for (name, is_file, child_path) in entries {
                let child_hash = self.hash_path(&child_path)?;
                hasher.update(name.as_bytes());
                hasher.update(&[is_file as u8]);
                hasher.update(child_hash.as_bytes());
            }
            Ok(H32(*hasher.finalize().as_bytes()))
        }
    }
}

impl HpfsDriver for DirDriver {
    fn open_session(&self, name: &str, writable: bool, _hmap_enabled: bool) -> NodeResult<()> {
        if name.is_empty() || (writable != (name == RW_SESSION_NAME)) {
            return Err(NodeError::SessionNotFound(name.to_string()));
        }
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(name) {
            return Err(NodeError::ConfigInvalid(format!(
                "session {name} already exists"
            )));
        }
        let root = self.session_root(name);
        if root.exists() {
            fs::remove_dir_all(&root)?;
        }
        copy_dir_recursive(&self.seed_dir, &root)?;
        sessions.insert(name.to_string(), SessionMeta { writable });
        Ok(())
    }

    fn close_session(&self, name: &str, commit: bool) -> NodeResult<()> {
        let meta = self
            .sessions
            .lock()
            .remove(name)
            .ok_or_else(|| NodeError::SessionNotFound(name.to_string()))?;
        let root = self.session_root(name);
        if commit && meta.writable {
            let staging = self.seed_dir.with_extension("staging");
            if staging.exists() {
                fs::remove_dir_all(&staging)?;
            }
            copy_dir_recursive(&root, &staging)?;
            fs::remove_dir_all(&self.seed_dir)?;
            fs::rename(&staging, &self.seed_dir)?;
        }
        if root.exists() {
            fs::remove_dir_all(&root)?;
        }
        Ok(())
    }

    fn query_hash(&self, session: &str, vpath: &str) -> NodeResult<H32> {
        self.require_session(session)?;
        self.hash_path(&self.resolve(session, vpath))
    }

    fn file_block_hashes(&self, session: &str, vpath: &str) -> NodeResult<Vec<H32>> {
        self.require_session(session)?;
        let data = fs::read(self.resolve(session, vpath))?;
        Ok(block_hashes(&data))
    }

    fn dir_children_hashes(&self, session: &str, vpath: &str) -> NodeResult<Vec<ChildHashNode>> {
        self.require_session(session)?;
        let dir = self.resolve(session, vpath);
        let mut entries = read_child_entries(&dir)?;
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let mut out = Vec::with_capacity(entries.len());
        for (name, is_file, child_path) in entries {
            out.push(ChildHashNode {
                hash: self.hash_path(&child_path)?,
                name,
                is_file,
            });
        }
        Ok(out)
    }

    fn physical_path(&self, session: &str, vpath: &str) -> PathBuf {
        self.resolve(session, vpath)
    }

    fn session_exists(&self, name: &str) -> bool {
        self.sessions.lock().contains_key(name)
    }
}

fn read_child_entries(dir: &Path) -> NodeResult<Vec<(String, bool, PathBuf)>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry
            .file_name()
            .into_string()
            .map_err(|_| NodeError::Io(io::Error::new(io::ErrorKind::InvalidData, "non-utf8 name")))?;
        let is_file = entry.file_type()?.is_file();
        out.push((name, is_file, entry.path()));
    }
    Ok(out)
}

fn hash_file(path: &Path) -> NodeResult<H32> {
    let data = fs::read(path)?;
    let blocks = block_hashes(&data);
    let mut hasher = blake3::Hasher::new();
    for block in &blocks {
        hasher.update(block.as_bytes());
    }
    Ok(H32(*hasher.finalize().as_bytes()))
}

/// Per-block hashes over fixed 4 MiB blocks, in block order.
pub fn block_hashes(data: &[u8]) -> Vec<H32> {
    if data.is_empty() {
        return Vec::new();
    }
    data.chunks(BLOCK_SIZE).map(hash_bytes).collect()
}

/// Recomputes a whole-file hash from its block hashes.
pub fn file_hash_from_blocks(blocks: &[H32]) -> H32 {
    let mut hasher = blake3::Hasher::new();
    for block in blocks {
        hasher.update(block.as_bytes());
    }
    H32(*hasher.finalize().as_bytes())
}

pub fn copy_dir_recursive(src: &Path, dst: &Path) -> NodeResult<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, DirDriver) {
        let dir = tempdir().expect("tempdir");
        let driver = DirDriver::new(&dir.path().join("fs"), &dir.path().join("mnt")).expect("driver");
        fs::create_dir_all(driver.seed_dir().join("state")).expect("seed state");
        fs::write(driver.seed_dir().join("state/data.txt"), b"round zero").expect("seed file");
        fs::write(driver.seed_dir().join("patch.cfg"), b"{}").expect("seed patch");
        (dir, driver)
    }

    #[test]
    fn writes_are_visible_only_after_commit() {
        let (_dir, driver) = setup();
        let before = driver.query_hash("", "/state").expect("seed hash");

        driver.open_session(RW_SESSION_NAME, true, false).expect("open rw");
        fs::write(
            driver.physical_path(RW_SESSION_NAME, "/state/data.txt"),
            b"round one",
        )
        .expect("write");
        assert_eq!(driver.query_hash("", "/state").expect("seed hash"), before);

        driver.close_session(RW_SESSION_NAME, true).expect("commit");
        assert_ne!(driver.query_hash("", "/state").expect("seed hash"), before);
    }

    #[test]
    fn ro_session_snapshots_the_seed() {
        let (_dir, driver) = setup();
        driver.open_session("ro_check", false, true).expect("open ro");
        let snapshot = driver.query_hash("ro_check", "/state").expect("ro hash");

        driver.open_session(RW_SESSION_NAME, true, false).expect("open rw");
        fs::write(
            driver.physical_path(RW_SESSION_NAME, "/state/data.txt"),
            b"mutated",
        )
        .expect("write");
        driver.close_session(RW_SESSION_NAME, true).expect("commit");

        assert_eq!(driver.query_hash("ro_check", "/state").expect("ro hash"), snapshot);
        driver.close_session("ro_check", false).expect("close ro");
        assert!(matches!(
            driver.query_hash("ro_check", "/state"),
            Err(NodeError::SessionNotFound(_))
        ));
    }

    #[test]
    fn dir_children_are_sorted_by_name() {
        let (_dir, driver) = setup();
        fs::write(driver.seed_dir().join("state/aaa"), b"a").expect("write");
        fs::write(driver.seed_dir().join("state/zzz"), b"z").expect("write");
        let children = driver.dir_children_hashes("", "/state").expect("children");
        let names: Vec<_> = children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["aaa", "data.txt", "zzz"]);
    }

    #[test]
    fn block_hashes_recompose_to_file_hash() {
        let (_dir, driver) = setup();
        let blocks = driver.file_block_hashes("", "/state/data.txt").expect("blocks");
        assert_eq!(blocks, block_hashes(b"round zero"));
        assert_eq!(
            file_hash_from_blocks(&blocks),
            driver.query_hash("", "/state/data.txt").expect("hash")
        );
    }

    #[test]
    fn rejects_second_rw_session() {
        let (_dir, driver) = setup();
        driver.open_session(RW_SESSION_NAME, true, false).expect("open rw");
        assert!(driver.open_session(RW_SESSION_NAME, true, false).is_err());
    }
}
