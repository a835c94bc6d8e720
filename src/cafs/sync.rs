use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::cafs::driver::{block_hashes, file_hash_from_blocks};
use crate::cafs::mount::CafsMount;
use crate::cafs::{ChildHashNode, BLOCK_SIZE, RW_SESSION_NAME};
use crate::errors::{NodeError, NodeResult};
use crate::hash::{hash_bytes, H32};
use crate::p2p::messages::{
    HpfsRequest, HpfsRequestHint, HpfsResponse, HpfsResponseContent, PeerMessage,
};
use crate::p2p::server::PeerNetwork;
use crate::p2p::CollectedMsgs;
use crate::util::{now_ms, sleep_ms};

/// Re-submissions tolerated before a sync attempt is abandoned.
pub const ABANDON_THRESHOLD: u32 = 10;
const SYNC_IDLE_WAIT_MS: u64 = 20;

/// One outstanding request towards the contested target.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum RequestKey {
    DirEntries(String),
    FileHashMap(String),
    Block(String, u32),
}

#[derive(Clone, Debug)]
struct PendingRequest {
    request: HpfsRequest,
    requested_on: u64,
}

struct SyncProgress {
    target_vpath: String,
    target_hash: H32,
    pending: HashMap<RequestKey, PendingRequest>,
    request_submissions: u32,
}

/// Hash-diff block synchronizer: walks the contested subtree against a
/// serving peer, fetching only differing directory entries, file hash maps
/// and 4 MiB blocks, and installs them through the RW session.
pub struct CafsSync {
    mount: Arc<CafsMount>,
    network: PeerNetwork,
    collected: Arc<CollectedMsgs>,
    shutdown: Arc<AtomicBool>,
    roundtime: Arc<AtomicU32>,
    progress: Mutex<Option<SyncProgress>>,
    /// Completed `(vpath, hash)` targets for the consumer to pick up.
    achieved: Mutex<Vec<(String, H32)>>,
    abandoned: AtomicBool,
}

impl CafsSync {
    pub fn new(
        mount: Arc<CafsMount>,
        network: PeerNetwork,
        collected: Arc<CollectedMsgs>,
        shutdown: Arc<AtomicBool>,
        roundtime: Arc<AtomicU32>,
    ) -> Arc<Self> {
        Arc::new(Self {
            mount,
            network,
            collected,
            shutdown,
            roundtime,
            progress: Mutex::new(None),
            achieved: Mutex::new(Vec::new()),
            abandoned: AtomicBool::new(false),
        })
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let worker = self.clone();
        std::thread::spawn(move || worker.run())
    }

    pub fn is_syncing(&self) -> bool {
        self.progress.lock().is_some()
    }

    /// Targets for which sync completed since the last call.
    pub fn take_achieved(&self) -> Vec<(String, H32)> {
        std::mem::take(&mut *self.achieved.lock())
    }

    /// Whether a sync was abandoned since the last call.
    pub fn take_abandoned(&self) -> bool {
        self.abandoned.swap(false, Ordering::Relaxed)
    }

    /// Starts (or retargets) a sync towards `target_hash` at `vpath`.
    pub fn set_sync_target(&self, vpath: &str, is_file: bool, target_hash: H32) {
        let mut progress = self.progress.lock();
        if let Some(active) = progress.as_ref() {
            if active.target_vpath == vpath && active.target_hash == target_hash {
                return;
            }
        }
        info!(vpath, %target_hash, "starting contract state sync");
        let mut state = SyncProgress {
            target_vpath: vpath.to_string(),
            target_hash,
            pending: HashMap::new(),
            request_submissions: 0,
        };
        self.enqueue_target(&mut state, vpath, is_file, target_hash);
        *progress = Some(state);
    }

    fn run(&self) {
        info!("contract sync worker started");
        while !self.shutdown.load(Ordering::Relaxed) {
            let mut processed = false;
            if self.serve_requests() {
                processed = true;
            }
            if self.is_syncing() {
                if self.process_responses() {
                    processed = true;
                    self.check_target_achieved();
                }
                self.submit_requests();
            } else {
                // Stale responses from a cleared sync are discarded.
                self.collected.drain_hpfs_responses();
            }
            if !processed {
                sleep_ms(SYNC_IDLE_WAIT_MS);
            }
        }
        info!("contract sync worker stopped");
    }

    fn resubmit_timeout(&self) -> u64 {
        (self.roundtime.load(Ordering::Relaxed) as u64 * 7) / 10
    }

    fn enqueue_target(&self, state: &mut SyncProgress, vpath: &str, is_file: bool, hash: H32) {
        let (key, request) = if is_file {
            (
                RequestKey::FileHashMap(vpath.to_string()),
                HpfsRequest {
                    mount_id: self.mount.mount_id,
                    parent_path: vpath.to_string(),
                    is_file: true,
                    block_id: -1,
                    expected_hash: hash,
                    hint: HpfsRequestHint::FileHashMap(
                        self.mount
                            .get_file_block_hashes("", vpath)
                            .unwrap_or_default(),
                    ),
                },
            )
        } else {
            (
                RequestKey::DirEntries(vpath.to_string()),
                HpfsRequest {
                    mount_id: self.mount.mount_id,
                    parent_path: vpath.to_string(),
                    is_file: false,
                    block_id: -1,
                    expected_hash: hash,
                    hint: HpfsRequestHint::FsEntries(
                        self.mount
                            .get_dir_children_hashes("", vpath)
                            .unwrap_or_default(),
                    ),
                },
            )
        };
        state.pending.insert(
            key,
            PendingRequest {
                request,
                requested_on: 0,
            },
        );
    }

    /// Sends initial and overdue requests; abandons the sync when the
    /// submission budget runs out.
    fn submit_requests(&self) {
        let timeout = self.resubmit_timeout();
        let now = now_ms();
        let mut progress = self.progress.lock();
        let Some(state) = progress.as_mut() else {
            return;
        };
        let mut overdue: Vec<RequestKey> = state
            .pending
            .iter()
            .filter(|(_, pending)| {
                pending.requested_on == 0 || now.saturating_sub(pending.requested_on) > timeout
            })
            .map(|(key, _)| key.clone())
            .collect();
        if overdue.is_empty() {
            return;
        }
        if state.request_submissions >= ABANDON_THRESHOLD {
            warn!(
                target = %state.target_vpath,
                "resubmission threshold exceeded, abandoning sync"
            );
            *progress = None;
            self.abandoned.store(true, Ordering::Relaxed);
            return;
        }
        state.request_submissions += 1;
        overdue.sort_by_key(|key| match key {
            RequestKey::DirEntries(path) => (0, path.clone(), 0),
            RequestKey::FileHashMap(path) => (1, path.clone(), 0),
            RequestKey::Block(path, id) => (2, path.clone(), *id),
        });
        for key in overdue {
            if let Some(pending) = state.pending.get_mut(&key) {
                pending.requested_on = now;
                if let Some(peer) = self.network.send_to_random_peer(
                    &PeerMessage::HpfsRequest(pending.request.clone()),
                    false,
                ) {
                    debug!(?key, peer, "submitted hpfs sync request");
                }
            }
        }
    }

    fn process_responses(&self) -> bool {
        let responses = self.collected.drain_hpfs_responses();
        if responses.is_empty() {
            return false;
        }
        for response in responses {
            if response.mount_id != self.mount.mount_id {
                continue;
            }
            if let Err(err) = self.apply_response(response) {
                warn!(%err, "discarding hpfs sync response");
            }
        }
        true
    }

    fn apply_response(&self, response: HpfsResponse) -> NodeResult<()> {
        let mut progress = self.progress.lock();
        let Some(state) = progress.as_mut() else {
            return Ok(());
        };
        match response.content {
            HpfsResponseContent::FsEntries(remote_entries) => {
                state
                    .pending
                    .remove(&RequestKey::DirEntries(response.path.clone()));
                self.reconcile_dir(state, &response.path, &remote_entries)?;
            }
            HpfsResponseContent::FileHashMap {
                hash_map,
                file_length,
                ..
            } => {
                state
                    .pending
                    .remove(&RequestKey::FileHashMap(response.path.clone()));
                self.reconcile_file(state, &response.path, &hash_map, file_length)?;
            }
            HpfsResponseContent::Block { block_id, data } => {
                if hash_bytes(&data) != response.expected_hash {
                    return Err(NodeError::MessageMalformed(format!(
                        "block {} of {} failed hash verification",
                        block_id, response.path
                    )));
                }
                state
                    .pending
                    .remove(&RequestKey::Block(response.path.clone(), block_id));
                self.write_block(&response.path, block_id, &data)?;
            }
        }
        Ok(())
    }

    /// Applies a remote directory listing: local extras are removed,
    /// differing children become new requests.
    fn reconcile_dir(
        &self,
        state: &mut SyncProgress,
        vpath: &str,
        remote_entries: &[ChildHashNode],
    ) -> NodeResult<()> {
        let local_entries = self.mount.get_dir_children_hashes("", vpath).unwrap_or_default();
        let local: HashMap<&str, &ChildHashNode> = local_entries
            .iter()
            .map(|entry| (entry.name.as_str(), entry))
            .collect();
        let remote_names: HashMap<&str, &ChildHashNode> = remote_entries
            .iter()
            .map(|entry| (entry.name.as_str(), entry))
            .collect();

        self.mount.acquire_rw_session()?;
        let removal = (|| -> NodeResult<()> {
            for entry in &local_entries {
                if !remote_names.contains_key(entry.name.as_str()) {
                    let path = self
                        .mount
                        .physical_path(RW_SESSION_NAME, &child_vpath(vpath, &entry.name));
                    if path.is_dir() {
                        fs::remove_dir_all(path)?;
                    } else if path.exists() {
                        fs::remove_file(path)?;
                    }
                }
            }
            Ok(())
        })();
        let released = self.mount.release_rw_session();
        removal?;
        released?;

        for entry in remote_entries {
            let matches_local = local
                .get(entry.name.as_str())
                .map(|local_entry| local_entry.hash == entry.hash && local_entry.is_file == entry.is_file)
                .unwrap_or(false);
            if !matches_local {
                self.enqueue_target(
                    state,
                    &child_vpath(vpath, &entry.name),
                    entry.is_file,
                    entry.hash,
                );
            }
        }
        Ok(())
    }

    /// Applies a remote block hash map: sizes the local file and requests
    /// only the differing blocks.
    fn reconcile_file(
        &self,
        state: &mut SyncProgress,
        vpath: &str,
        remote_blocks: &[H32],
        file_length: u64,
    ) -> NodeResult<()> {
        let local_blocks = self.mount.get_file_block_hashes("", vpath).unwrap_or_default();

        self.mount.acquire_rw_session()?;
        let sized = (|| -> NodeResult<()> {
            let path = self.mount.physical_path(RW_SESSION_NAME, vpath);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().write(true).create(true).open(path)?;
            file.set_len(file_length)?;
            Ok(())
        })();
        let released = self.mount.release_rw_session();
        sized?;
        released?;

        for (block_id, remote_hash) in remote_blocks.iter().enumerate() {
            if local_blocks.get(block_id) != Some(remote_hash) {
                state.pending.insert(
                    RequestKey::Block(vpath.to_string(), block_id as u32),
                    PendingRequest {
                        request: HpfsRequest {
                            mount_id: self.mount.mount_id,
                            parent_path: vpath.to_string(),
                            is_file: true,
                            block_id: block_id as i32,
                            expected_hash: *remote_hash,
                            hint: HpfsRequestHint::None,
                        },
                        requested_on: 0,
                    },
                );
            }
        }
        Ok(())
    }

    fn write_block(&self, vpath: &str, block_id: u32, data: &[u8]) -> NodeResult<()> {
        self.mount.acquire_rw_session()?;
        let written = (|| -> NodeResult<()> {
            let path = self.mount.physical_path(RW_SESSION_NAME, vpath);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().write(true).create(true).open(path)?;
            file.write_all_at(data, block_id as u64 * BLOCK_SIZE as u64)?;
            Ok(())
        })();
        let released = self.mount.release_rw_session();
        written?;
        released
    }

    /// When nothing is outstanding, decides between done, another root
    /// walk, or letting the submission budget expire.
    fn check_target_achieved(&self) {
        let mut progress = self.progress.lock();
        let Some(state) = progress.as_mut() else {
            return;
        };
        if !state.pending.is_empty() {
            return;
        }
        let local = self.mount.get_committed_hash(&state.target_vpath);
        match local {
            Ok(hash) if hash == state.target_hash => {
                info!(vpath = %state.target_vpath, %hash, "sync target achieved");
                self.achieved
                    .lock()
                    .push((state.target_vpath.clone(), hash));
                *progress = None;
            }
            _ => {
                // Not converged yet: walk the target again from the root.
                let vpath = state.target_vpath.clone();
                let hash = state.target_hash;
                self.enqueue_target(state, &vpath, false, hash);
            }
        }
    }

    /// Serves hpfs requests from other peers out of the committed tree.
    fn serve_requests(&self) -> bool {
        let requests = self.collected.drain_hpfs_requests();
        if requests.is_empty() {
            return false;
        }
        for (session_id, request) in requests {
            if request.mount_id != self.mount.mount_id {
                continue;
            }
            match self.build_response(&request) {
                Ok(response) => {
                    self.network
                        .send_to_session(session_id, &PeerMessage::HpfsResponse(response));
                }
                Err(err) => debug!(%err, path = %request.parent_path, "cannot serve hpfs request"),
            }
        }
        true
    }

    fn build_response(&self, request: &HpfsRequest) -> NodeResult<HpfsResponse> {
        let content = if !request.is_file {
            HpfsResponseContent::FsEntries(
                self.mount.get_dir_children_hashes("", &request.parent_path)?,
            )
        } else if request.block_id < 0 {
            let hash_map = self.mount.get_file_block_hashes("", &request.parent_path)?;
            let file_length = fs::metadata(self.mount.physical_path("", &request.parent_path))?.len();
            HpfsResponseContent::FileHashMap {
                hash_map,
                file_length,
                responded_block_ids: Vec::new(),
            }
        } else {
            let path = self.mount.physical_path("", &request.parent_path);
            let file = fs::File::open(path)?;
            let offset = request.block_id as u64 * BLOCK_SIZE as u64;
            let len = fs::metadata(self.mount.physical_path("", &request.parent_path))?.len();
            if offset >= len {
                return Err(NodeError::RangeEmpty(format!(
                    "block {} beyond end of {}",
                    request.block_id, request.parent_path
                )));
            }
            let size = BLOCK_SIZE.min((len - offset) as usize);
            let mut data = vec![0u8; size];
            file.read_exact_at(&mut data, offset)?;
            let block_hash = hash_bytes(&data);
            return Ok(HpfsResponse {
                mount_id: self.mount.mount_id,
                path: request.parent_path.clone(),
                expected_hash: block_hash,
                content: HpfsResponseContent::Block {
                    block_id: request.block_id as u32,
                    data,
                },
            });
        };
        let expected_hash = self.mount.get_committed_hash(&request.parent_path)?;
        Ok(HpfsResponse {
            mount_id: self.mount.mount_id,
            path: request.parent_path.clone(),
            expected_hash,
            content,
        })
    }
}

fn child_vpath(parent: &str, name: &str) -> String {
    if parent == "/" || parent.is_empty() {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Sanity helper shared with tests: recompute a file hash from raw bytes
/// the way the mount does.
pub fn recompute_file_hash(data: &[u8]) -> H32 {
    file_hash_from_blocks(&block_hashes(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_vpath_joins_cleanly() {
        assert_eq!(child_vpath("/", "state"), "/state");
        assert_eq!(child_vpath("/state", "data"), "/state/data");
    }

    #[test]
    fn recomputed_hash_matches_block_fold() {
        let data = vec![3u8; BLOCK_SIZE + 10];
        let blocks = block_hashes(&data);
        assert_eq!(blocks.len(), 2);
        assert_eq!(recompute_file_hash(&data), file_hash_from_blocks(&blocks));
    }
}
