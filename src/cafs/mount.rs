use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cafs::driver::{copy_dir_recursive, DirDriver, HpfsDriver};
use crate::cafs::{combine_root, ChildHashNode, PATCH_FILE_PATH, RW_SESSION_NAME, STATE_DIR_PATH};
use crate::errors::{NodeError, NodeResult};
use crate::hash::{H32, H32_EMPTY};

const LOG_FILE_NAME: &str = "hpfs.log";
const INDEX_FILE_NAME: &str = "hpfs.idx";
/// seq_no (8) + offset (8) + frame len (8) + root hash (32).
const INDEX_ENTRY_LEN: usize = 56;

/// What the mount's root hash is computed over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MountKind {
    /// Root is the combination of the patch overlay and the state tree.
    Contract,
    /// Root is the hash of the whole seed tree.
    Ledger,
}

/// One write captured for the hpfs log. Replaying the `writes` of every
/// record in order reproduces the filesystem at the recorded root.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum LogWrite {
    Put { vpath: String, data: Vec<u8> },
    Remove { vpath: String },
}

/// Covers the writes of one ledger round.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub seq_no: u64,
    pub root_hash: H32,
    pub writes: Vec<LogWrite>,
}

#[derive(Clone, Copy, Debug)]
struct IndexEntry {
    seq_no: u64,
    offset: u64,
    len: u64,
    root_hash: H32,
}

/// A content-addressed filesystem mount: one reference-counted RW session,
/// any number of named RO snapshots, hash queries, and the append-only
/// write log full-history nodes replay from.
pub struct CafsMount {
    pub mount_id: u32,
    kind: MountKind,
    is_full_history: bool,
    driver: Arc<dyn HpfsDriver>,
    parent_hashes: RwLock<HashMap<String, H32>>,
    rw_consumers: Mutex<u32>,
    round_writes: Mutex<Vec<LogWrite>>,
    log_file: PathBuf,
    index_file: PathBuf,
    log_guard: Mutex<()>,
}

impl CafsMount {
    pub fn init(
        mount_id: u32,
        kind: MountKind,
        fs_dir: &Path,
        mount_dir: &Path,
        is_full_history: bool,
    ) -> NodeResult<Self> {
        let driver = Arc::new(DirDriver::new(fs_dir, mount_dir)?);
        Ok(Self {
            mount_id,
            kind,
            is_full_history,
            driver,
            parent_hashes: RwLock::new(HashMap::new()),
            rw_consumers: Mutex::new(0),
            round_writes: Mutex::new(Vec::new()),
            log_file: fs_dir.join(LOG_FILE_NAME),
            index_file: fs_dir.join(INDEX_FILE_NAME),
            log_guard: Mutex::new(()),
        })
    }

    pub fn is_full_history(&self) -> bool {
        self.is_full_history
    }

    pub fn acquire_rw_session(&self) -> NodeResult<()> {
        let mut consumers = self.rw_consumers.lock();
        if *consumers == 0 {
            self.driver.open_session(RW_SESSION_NAME, true, false)?;
        }
        *consumers += 1;
        Ok(())
    }

    pub fn release_rw_session(&self) -> NodeResult<()> {
        let mut consumers = self.rw_consumers.lock();
        if *consumers == 0 {
            return Err(NodeError::SessionNotFound(RW_SESSION_NAME.into()));
        }
        *consumers -= 1;
        if *consumers == 0 {
            if self.is_full_history {
                let writes = self.diff_rw_against_seed()?;
                self.round_writes.lock().extend(writes);
            }
            self.driver.close_session(RW_SESSION_NAME, true)?;
        }
        Ok(())
    }

    /// Drops an RW hold without publishing its writes. Used when a round
    /// fails to converge and its filesystem effects must be thrown away.
    pub fn discard_rw_session(&self) -> NodeResult<()> {
        let mut consumers = self.rw_consumers.lock();
        if *consumers == 0 {
            return Err(NodeError::SessionNotFound(RW_SESSION_NAME.into()));
        }
        *consumers -= 1;
        if *consumers == 0 {
            self.driver.close_session(RW_SESSION_NAME, false)?;
        }
        Ok(())
    }

    pub fn start_ro_session(&self, name: &str, hmap_enabled: bool) -> NodeResult<()> {
        self.driver.open_session(name, false, hmap_enabled)
    }

    pub fn stop_ro_session(&self, name: &str) -> NodeResult<()> {
        self.driver.close_session(name, false)
    }

    pub fn get_hash(&self, session: &str, vpath: &str) -> NodeResult<H32> {
        self.driver.query_hash(session, vpath)
    }

    pub fn get_file_block_hashes(&self, session: &str, vpath: &str) -> NodeResult<Vec<H32>> {
        self.driver.file_block_hashes(session, vpath)
    }

    pub fn get_dir_children_hashes(
        &self,
        session: &str,
        vpath: &str,
    ) -> NodeResult<Vec<ChildHashNode>> {
        self.driver.dir_children_hashes(session, vpath)
    }

    pub fn physical_path(&self, session: &str, vpath: &str) -> PathBuf {
        self.driver.physical_path(session, vpath)
    }

    pub fn get_parent_hash(&self, parent_vpath: &str) -> H32 {
        self.parent_hashes
            .read()
            .get(parent_vpath)
            .copied()
            .unwrap_or(H32_EMPTY)
    }

    pub fn set_parent_hash(&self, parent_vpath: &str, new_hash: H32) {
        self.parent_hashes
            .write()
            .insert(parent_vpath.to_string(), new_hash);
    }

    /// Hash of the committed (seed) content at `vpath`. Sessions see their
    /// own snapshots; this reads what the next session will be created from.
    pub fn get_committed_hash(&self, vpath: &str) -> NodeResult<H32> {
        self.driver.query_hash("", vpath)
    }

    /// Root hash of the committed content, per the mount kind.
    pub fn root_hash(&self) -> NodeResult<H32> {
        match self.kind {
            MountKind::Contract => {
                let patch = self.driver.query_hash("", PATCH_FILE_PATH)?;
                let state = self.driver.query_hash("", STATE_DIR_PATH)?;
                Ok(combine_root(&patch, &state))
            }
            MountKind::Ledger => self.driver.query_hash("", "/"),
        }
    }

    /// Appends the round's captured writes to the hpfs log and records
    /// `(seq_no, root_hash)` in the index. No-op on non-full-history mounts.
    pub fn update_hpfs_log_index(&self, seq_no: u64) -> NodeResult<()> {
        if !self.is_full_history {
            self.round_writes.lock().clear();
            return Ok(());
        }
        let record = LogRecord {
            seq_no,
            root_hash: self.root_hash()?,
            writes: std::mem::take(&mut *self.round_writes.lock()),
        };
        let frame = encode_log_frame(&record)?;
        let _guard = self.log_guard.lock();
        self.append_frame(seq_no, &frame, record.root_hash)
    }

    pub fn get_last_seq_no_from_index(&self) -> NodeResult<u64> {
        let _guard = self.log_guard.lock();
        Ok(self.read_index()?.last().map(|e| e.seq_no).unwrap_or(0))
    }

    pub fn get_hash_from_index_by_seq_no(&self, seq_no: u64) -> NodeResult<H32> {
        if seq_no == 0 {
            return Ok(H32_EMPTY);
        }
        let _guard = self.log_guard.lock();
        self.read_index()?
            .iter()
            .find(|e| e.seq_no == seq_no)
            .map(|e| e.root_hash)
            .ok_or_else(|| NodeError::RangeEmpty(format!("no index entry for seq {seq_no}")))
    }

    /// Removes every log record with `seq_no` greater than the given one.
    pub fn truncate_log_file(&self, seq_no: u64) -> NodeResult<()> {
        let _guard = self.log_guard.lock();
        let entries = self.read_index()?;
        let kept: Vec<&IndexEntry> = entries.iter().filter(|e| e.seq_no <= seq_no).collect();
        if kept.len() == entries.len() {
            return Ok(());
        }
        let log_len = kept.iter().map(|e| e.offset + e.len).max().unwrap_or(0);
        let log = OpenOptions::new().write(true).create(true).open(&self.log_file)?;
        log.set_len(log_len)?;
        let mut index_bytes = Vec::with_capacity(kept.len() * INDEX_ENTRY_LEN);
        for entry in &kept {
            index_bytes.extend_from_slice(&encode_index_entry(entry));
        }
        fs::write(&self.index_file, index_bytes)?;
        debug!(mount_id = self.mount_id, seq_no, "truncated hpfs log");
        Ok(())
    }

    /// Raw log frames for records with `min_seq_no < seq <= max_seq_no`.
    pub fn read_hpfs_logs(&self, min_seq_no: u64, max_seq_no: u64) -> NodeResult<Vec<u8>> {
        let _guard = self.log_guard.lock();
        let entries = self.read_index()?;
        let wanted: Vec<&IndexEntry> = entries
            .iter()
            .filter(|e| e.seq_no > min_seq_no && e.seq_no <= max_seq_no)
            .collect();
        if wanted.is_empty() {
            return Err(NodeError::RangeEmpty(format!(
                "no log records in ({min_seq_no}, {max_seq_no}]"
            )));
        }
        let mut log = OpenOptions::new().read(true).open(&self.log_file)?;
        let mut out = Vec::new();
        for entry in wanted {
            log.seek(SeekFrom::Start(entry.offset))?;
            let mut frame = vec![0u8; entry.len as usize];
            log.read_exact(&mut frame)?;
            out.extend_from_slice(&frame);
        }
        Ok(out)
    }

    /// Imports log frames received from a peer: applies each record's
    /// writes through the RW session and appends the frame to the local
    /// log and index.
    pub fn append_hpfs_log_records(&self, buf: &[u8]) -> NodeResult<()> {
        let mut cursor = 0usize;
        while cursor < buf.len() {
            let (record, frame) = decode_log_frame(&buf[cursor..])?;
            cursor += frame.len();
            let last = self.get_last_seq_no_from_index()?;
            if record.seq_no != last + 1 {
                return Err(NodeError::MessageMalformed(format!(
                    "log record seq {} does not extend index tip {last}",
                    record.seq_no
                )));
            }
            self.acquire_rw_session()?;
            let apply = self.apply_writes(&record.writes);
            let release = self.release_rw_session();
            apply?;
            release?;
            // Imported records carry their own write set; drop the diff the
            // release captured so the record is not logged twice.
            self.round_writes.lock().clear();
            let _guard = self.log_guard.lock();
            self.append_frame(record.seq_no, &frame, record.root_hash)?;
        }
        Ok(())
    }

    fn apply_writes(&self, writes: &[LogWrite]) -> NodeResult<()> {
        for write in writes {
            match write {
                LogWrite::Put { vpath, data } => {
                    let path = self.physical_path(RW_SESSION_NAME, vpath);
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(path, data)?;
                }
                LogWrite::Remove { vpath } => {
                    let path = self.physical_path(RW_SESSION_NAME, vpath);
                    if path.is_dir() {
                        fs::remove_dir_all(path)?;
                    } else if path.exists() {
                        fs::remove_file(path)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn append_frame(&self, seq_no: u64, frame: &[u8], root_hash: H32) -> NodeResult<()> {
        let mut log = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.log_file)?;
        let offset = log.metadata()?.len();
        log.write_all(frame)?;
        let entry = IndexEntry {
            seq_no,
            offset,
            len: frame.len() as u64,
            root_hash,
        };
        let mut index = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.index_file)?;
        index.write_all(&encode_index_entry(&entry))?;
        Ok(())
    }

    fn read_index(&self) -> NodeResult<Vec<IndexEntry>> {
        if !self.index_file.exists() {
            return Ok(Vec::new());
        }
        let bytes = fs::read(&self.index_file)?;
        let mut entries = Vec::with_capacity(bytes.len() / INDEX_ENTRY_LEN);
        for chunk in bytes.chunks_exact(INDEX_ENTRY_LEN) {
            entries.push(decode_index_entry(chunk)?);
        }
        Ok(entries)
    }

    /// Diffs the RW session against the seed tree to capture the round's
    /// writes before the session commits.
    fn diff_rw_against_seed(&self) -> NodeResult<Vec<LogWrite>> {
        let rw_root = self.physical_path(RW_SESSION_NAME, "/");
        let seed_root = self.physical_path("", "/");
        let rw_files = collect_files(&rw_root)?;
        let seed_files = collect_files(&seed_root)?;
        let mut writes = Vec::new();
        for (vpath, path) in &rw_files {
            let changed = match seed_files.get(vpath) {
                Some(seed_path) => fs::read(path)? != fs::read(seed_path)?,
                None => true,
            };
            if changed {
                writes.push(LogWrite::Put {
                    vpath: vpath.clone(),
                    data: fs::read(path)?,
                });
            }
        }
        for vpath in seed_files.keys() {
            if !rw_files.contains_key(vpath) {
                writes.push(LogWrite::Remove {
                    vpath: vpath.clone(),
                });
            }
        }
        Ok(writes)
    }
}

fn collect_files(root: &Path) -> NodeResult<BTreeMap<String, PathBuf>> {
    let mut out = BTreeMap::new();
    let mut stack = vec![(root.to_path_buf(), String::new())];
    while let Some((dir, prefix)) = stack.pop() {
        if !dir.exists() {
            continue;
        }
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let vpath = format!("{prefix}/{name}");
            if entry.file_type()?.is_dir() {
                stack.push((entry.path(), vpath));
            } else {
                out.insert(vpath, entry.path());
            }
        }
    }
    Ok(out)
}

fn encode_log_frame(record: &LogRecord) -> NodeResult<Vec<u8>> {
    let body = bincode::serialize(record)?;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

fn decode_log_frame(buf: &[u8]) -> NodeResult<(LogRecord, &[u8])> {
    if buf.len() < 4 {
        return Err(NodeError::MessageMalformed("truncated log frame".into()));
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if buf.len() < 4 + len {
        return Err(NodeError::MessageMalformed("truncated log frame".into()));
    }
    let frame = &buf[..4 + len];
    let record: LogRecord = bincode::deserialize(&frame[4..])?;
    Ok((record, frame))
}

fn encode_index_entry(entry: &IndexEntry) -> [u8; INDEX_ENTRY_LEN] {
    let mut out = [0u8; INDEX_ENTRY_LEN];
    out[0..8].copy_from_slice(&entry.seq_no.to_le_bytes());
    out[8..16].copy_from_slice(&entry.offset.to_le_bytes());
    out[16..24].copy_from_slice(&entry.len.to_le_bytes());
    out[24..56].copy_from_slice(entry.root_hash.as_bytes());
    out
}

fn decode_index_entry(chunk: &[u8]) -> NodeResult<IndexEntry> {
    let seq_no = u64::from_le_bytes(chunk[0..8].try_into().expect("entry width"));
    let offset = u64::from_le_bytes(chunk[8..16].try_into().expect("entry width"));
    let len = u64::from_le_bytes(chunk[16..24].try_into().expect("entry width"));
    let root_hash = H32::from_slice(&chunk[24..56])
        .ok_or_else(|| NodeError::MessageMalformed("corrupt index entry".into()))?;
    Ok(IndexEntry {
        seq_no,
        offset,
        len,
        root_hash,
    })
}

/// Seeds one mount directory tree from another (used by `new` to lay out
/// the initial state).
pub fn seed_from(source: &Path, fs_dir: &Path) -> NodeResult<()> {
    copy_dir_recursive(source, &fs_dir.join("seed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn contract_mount(full_history: bool) -> (tempfile::TempDir, CafsMount) {
        let dir = tempdir().expect("tempdir");
        let fs_dir = dir.path().join("contract_fs");
        fs::create_dir_all(fs_dir.join("seed/state")).expect("seed");
        fs::write(fs_dir.join("seed/state/data"), b"genesis").expect("seed file");
        fs::write(fs_dir.join("seed/patch.cfg"), b"{}").expect("seed patch");
        let mount = CafsMount::init(
            1,
            MountKind::Contract,
            &fs_dir,
            &fs_dir.join("mnt"),
            full_history,
        )
        .expect("mount");
        (dir, mount)
    }

    fn write_round(mount: &CafsMount, seq_no: u64, content: &[u8]) {
        mount.acquire_rw_session().expect("acquire");
        let path = mount.physical_path(RW_SESSION_NAME, "/state/data");
        fs::write(path, content).expect("write");
        mount.release_rw_session().expect("release");
        mount.update_hpfs_log_index(seq_no).expect("index");
    }

    #[test]
    fn rw_session_is_reference_counted() {
        let (_dir, mount) = contract_mount(false);
        mount.acquire_rw_session().expect("first acquire");
        mount.acquire_rw_session().expect("second acquire");
        let before = mount.get_committed_hash(STATE_DIR_PATH).expect("hash");
        fs::write(
            mount.physical_path(RW_SESSION_NAME, "/state/data"),
            b"written",
        )
        .expect("write");
        mount.release_rw_session().expect("first release");
        // Still held by the second consumer, so the seed is unchanged.
        assert_eq!(mount.get_committed_hash(STATE_DIR_PATH).expect("hash"), before);
        mount.release_rw_session().expect("final release");
        assert_ne!(mount.get_committed_hash(STATE_DIR_PATH).expect("hash"), before);
        assert!(mount.release_rw_session().is_err());
    }

    #[test]
    fn log_index_tracks_round_roots() {
        let (_dir, mount) = contract_mount(true);
        write_round(&mount, 1, b"round one");
        let root_one = mount.root_hash().expect("root");
        write_round(&mount, 2, b"round two");
        let root_two = mount.root_hash().expect("root");

        assert_eq!(mount.get_last_seq_no_from_index().expect("last"), 2);
        assert_eq!(mount.get_hash_from_index_by_seq_no(1).expect("hash"), root_one);
        assert_eq!(mount.get_hash_from_index_by_seq_no(2).expect("hash"), root_two);
    }

    #[test]
    fn truncate_drops_records_after_seq() {
        let (_dir, mount) = contract_mount(true);
        write_round(&mount, 1, b"round one");
        write_round(&mount, 2, b"round two");
        write_round(&mount, 3, b"round three");
        mount.truncate_log_file(1).expect("truncate");
        assert_eq!(mount.get_last_seq_no_from_index().expect("last"), 1);
        assert!(mount.get_hash_from_index_by_seq_no(2).is_err());
        // The log file itself shrank back to the first frame.
        assert!(mount.read_hpfs_logs(1, 10).is_err());
        mount.read_hpfs_logs(0, 1).expect("first frame still readable");
    }

    #[test]
    fn replaying_logs_reproduces_state() {
        let (_src_dir, source) = contract_mount(true);
        write_round(&source, 1, b"round one");
        write_round(&source, 2, b"round two");
        let frames = source.read_hpfs_logs(0, 2).expect("read logs");
        let target_root = source.root_hash().expect("root");

        let (_dst_dir, replica) = contract_mount(true);
        replica.append_hpfs_log_records(&frames).expect("append");
        assert_eq!(replica.get_last_seq_no_from_index().expect("last"), 2);
        assert_eq!(replica.root_hash().expect("root"), target_root);
        assert_eq!(
            replica.get_hash_from_index_by_seq_no(2).expect("hash"),
            target_root
        );
    }

    #[test]
    fn append_rejects_gap_in_sequence() {
        let (_src_dir, source) = contract_mount(true);
        write_round(&source, 1, b"round one");
        write_round(&source, 2, b"round two");
        let frames = source.read_hpfs_logs(1, 2).expect("read logs");

        let (_dst_dir, replica) = contract_mount(true);
        assert!(matches!(
            replica.append_hpfs_log_records(&frames),
            Err(NodeError::MessageMalformed(_))
        ));
    }

    #[test]
    fn parent_hash_cache_round_trips() {
        let (_dir, mount) = contract_mount(false);
        assert_eq!(mount.get_parent_hash(STATE_DIR_PATH), H32_EMPTY);
        let state = mount.get_committed_hash(STATE_DIR_PATH).expect("hash");
        mount.set_parent_hash(STATE_DIR_PATH, state);
        assert_eq!(mount.get_parent_hash(STATE_DIR_PATH), state);
    }
}
