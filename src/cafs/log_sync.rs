use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::cafs::mount::CafsMount;
use crate::cafs::{combine_root, PATCH_FILE_PATH, STATE_DIR_PATH};
use crate::errors::NodeResult;
use crate::hash::{SequenceHash, H32};
use crate::ledger::store::LedgerStore;
use crate::ledger::LedgerRecord;
use crate::p2p::messages::{HpfsLogRequest, HpfsLogResponse, PeerMessage};
use crate::p2p::server::PeerNetwork;
use crate::p2p::CollectedMsgs;
use crate::util::{now_ms, sleep_ms};

pub const ABANDON_THRESHOLD: u32 = 10;
const SYNCER_IDLE_WAIT_MS: u64 = 20;
const VERIFY_SESSION_NAME: &str = "ro_hpfs_log_sync";

#[derive(Default)]
struct LogSyncCtx {
    target_log_seq_no: u64,
    target_root_hash: H32,
    min_log_record: SequenceHash,
    target_requested_on: u64,
    request_submissions: u32,
    is_syncing: bool,
}

impl LogSyncCtx {
    fn clear_target(&mut self) {
        self.target_log_seq_no = 0;
        self.target_root_hash = H32::default();
        self.min_log_record = SequenceHash::default();
        self.target_requested_on = 0;
        self.request_submissions = 0;
        self.is_syncing = false;
    }
}

enum MinRecordOutcome {
    MinSet,
    InSync,
}

/// Full-history catch-up: imports the missing suffix of the hpfs log from a
/// peer instead of block-diffing live state, preserving replayability. The
/// hard part is the joining point: the most recent `(seq_no, root_hash)` at
/// which the local log index and the synced ledger agree.
pub struct HpfsLogSync {
    mount: Arc<CafsMount>,
    ledger: Arc<LedgerStore>,
    network: PeerNetwork,
    collected: Arc<CollectedMsgs>,
    shutdown: Arc<AtomicBool>,
    roundtime: Arc<AtomicU32>,
    ctx: Mutex<LogSyncCtx>,
    genesis_seq_hash: SequenceHash,
    achieved: AtomicBool,
    abandoned: AtomicBool,
}

impl HpfsLogSync {
    pub fn new(
        mount: Arc<CafsMount>,
        ledger: Arc<LedgerStore>,
        network: PeerNetwork,
        collected: Arc<CollectedMsgs>,
        shutdown: Arc<AtomicBool>,
        roundtime: Arc<AtomicU32>,
    ) -> Arc<Self> {
        let genesis = LedgerRecord::genesis();
        let genesis_seq_hash = SequenceHash::new(
            genesis.seq_no,
            combine_root(&genesis.config_hash, &genesis.state_hash),
        );
        Arc::new(Self {
            mount,
            ledger,
            network,
            collected,
            shutdown,
            roundtime,
            ctx: Mutex::new(LogSyncCtx::default()),
            genesis_seq_hash,
            achieved: AtomicBool::new(false),
            abandoned: AtomicBool::new(false),
        })
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let worker = self.clone();
        std::thread::spawn(move || worker.run())
    }

    pub fn is_syncing(&self) -> bool {
        self.ctx.lock().is_syncing
    }

    pub fn take_achieved(&self) -> bool {
        self.achieved.swap(false, Ordering::Relaxed)
    }

    pub fn take_abandoned(&self) -> bool {
        self.abandoned.swap(false, Ordering::Relaxed)
    }

    pub fn set_sync_target(&self, target: u64, target_root_hash: H32) {
        {
            let mut ctx = self.ctx.lock();
            if self.shutdown.load(Ordering::Relaxed)
                || (ctx.is_syncing && ctx.target_log_seq_no == target)
            {
                return;
            }
            ctx.target_log_seq_no = target;
            ctx.target_root_hash = target_root_hash;
            match self.get_verified_min_record(&mut ctx) {
                Ok(MinRecordOutcome::MinSet) => {}
                Ok(MinRecordOutcome::InSync) => {
                    ctx.clear_target();
                    self.achieved.store(true, Ordering::Relaxed);
                    return;
                }
                Err(err) => {
                    error!(%err, "finding minimum log record failed");
                    ctx.clear_target();
                    return;
                }
            }
            info!(
                target = ctx.target_log_seq_no,
                min = ctx.min_log_record.seq_no,
                "hpfs log sync: starting sync"
            );
            ctx.target_requested_on = 0;
            ctx.request_submissions = 0;
            ctx.is_syncing = true;
        }
    }

    fn run(&self) {
        info!("hpfs log sync: worker started");
        while !self.shutdown.load(Ordering::Relaxed) {
            let mut processed = false;

            {
                let mut ctx = self.ctx.lock();
                if ctx.target_log_seq_no > 0 {
                    self.send_sync_request(&mut ctx);
                }
                if ctx.target_log_seq_no > 0 && self.check_responses(&mut ctx) {
                    processed = true;
                }
                if ctx.is_syncing && processed {
                    if let Ok(MinRecordOutcome::InSync) = self.get_verified_min_record(&mut ctx) {
                        info!(target = ctx.target_log_seq_no, "hpfs log sync: target archived");
                        ctx.clear_target();
                        self.achieved.store(true, Ordering::Relaxed);
                    }
                }
            }

            if self.serve_requests() {
                processed = true;
            }

            if !processed {
                sleep_ms(SYNCER_IDLE_WAIT_MS);
            }
        }
        info!("hpfs log sync: worker stopped");
    }

    /// Submits or re-submits the outstanding log request, abandoning the
    /// sync after the resubmission budget runs out.
    fn send_sync_request(&self, ctx: &mut LogSyncCtx) {
        let resubmit_timeout = (self.roundtime.load(Ordering::Relaxed) as u64 * 7) / 10;
        let time_now = now_ms();
        let due = ctx.target_requested_on == 0
            || time_now.saturating_sub(ctx.target_requested_on) > resubmit_timeout;
        if !due {
            return;
        }
        if ctx.request_submissions >= ABANDON_THRESHOLD {
            warn!("hpfs log sync: resubmission threshold exceeded, abandoning sync");
            ctx.clear_target();
            self.abandoned.store(true, Ordering::Relaxed);
            return;
        }
        let request = PeerMessage::HpfsLogRequest(HpfsLogRequest {
            target_seq_no: ctx.target_log_seq_no,
            min_record_id: ctx.min_log_record,
        });
        if let Some(peer) = self.network.send_to_random_peer(&request, true) {
            debug!(
                peer,
                min = ctx.min_log_record.seq_no,
                target = ctx.target_log_seq_no,
                "hpfs log sync: requesting records"
            );
        }
        ctx.target_requested_on = time_now;
        ctx.request_submissions += 1;
    }

    fn check_responses(&self, ctx: &mut LogSyncCtx) -> bool {
        let responses = self.collected.drain_hpfs_log_responses();
        if responses.is_empty() {
            return false;
        }
        for response in responses {
            if let Err(err) = self.handle_response(ctx, response) {
                debug!(%err, "hpfs log sync: dropping response");
            }
        }
        true
    }

    fn handle_response(&self, ctx: &mut LogSyncCtx, response: HpfsLogResponse) -> NodeResult<()> {
        if response.min_record_id != ctx.min_log_record {
            debug!("invalid joining point in received hpfs log response");
            return Ok(());
        }
        self.mount.append_hpfs_log_records(&response.log_record_bytes)
    }

    /// Serves hpfs log requests from peers, only when the requested joining
    /// point matches this node's own index.
    fn serve_requests(&self) -> bool {
        let requests = self.collected.drain_hpfs_log_requests();
        if requests.is_empty() {
            return false;
        }
        for (session_id, request) in requests {
            if !self.check_record_availability(&request) {
                continue;
            }
            let bytes = match self
                .mount
                .read_hpfs_logs(request.min_record_id.seq_no, request.target_seq_no)
            {
                Ok(bytes) => bytes,
                Err(err) => {
                    debug!(%err, "hpfs log sync: cannot serve request");
                    continue;
                }
            };
            self.network.send_to_session(
                session_id,
                &PeerMessage::HpfsLogResponse(HpfsLogResponse {
                    min_record_id: request.min_record_id,
                    log_record_bytes: bytes,
                }),
            );
        }
        true
    }

    fn check_record_availability(&self, request: &HpfsLogRequest) -> bool {
        if request.min_record_id == self.genesis_seq_hash {
            return true;
        }
        match self
            .mount
            .get_hash_from_index_by_seq_no(request.min_record_id.seq_no)
        {
            Ok(hash) if hash == request.min_record_id.hash => true,
            Ok(_) => {
                debug!(
                    min = %request.min_record_id,
                    "requested root hash does not match ours"
                );
                false
            }
            Err(_) => false,
        }
    }

    /// Establishes the verified minimum record to request from, or reports
    /// that the target is already reached.
    fn get_verified_min_record(&self, ctx: &mut LogSyncCtx) -> NodeResult<MinRecordOutcome> {
        let index_tip_seq = self.mount.get_last_seq_no_from_index()?;
        let last_from_index = SequenceHash::new(
            index_tip_seq,
            self.mount.get_hash_from_index_by_seq_no(index_tip_seq)?,
        );

        let ledger_tip = self.ledger.get_last_ledger()?;
        if last_from_index.seq_no == 0 || ledger_tip.seq_no == 0 {
            ctx.min_log_record = self.genesis_seq_hash;
            return Ok(MinRecordOutcome::MinSet);
        }

        let last_from_ledger = SequenceHash::new(
            ledger_tip.seq_no,
            combine_root(&ledger_tip.config_hash, &ledger_tip.state_hash),
        );

        if last_from_index == last_from_ledger {
            // Tips agree; check whether the live filesystem already hashes
            // to the target root.
            self.mount.start_ro_session(VERIFY_SESSION_NAME, true)?;
            let verified = (|| -> NodeResult<(H32, H32)> {
                let state = self.mount.get_hash(VERIFY_SESSION_NAME, STATE_DIR_PATH)?;
                let patch = self.mount.get_hash(VERIFY_SESSION_NAME, PATCH_FILE_PATH)?;
                Ok((state, patch))
            })();
            self.mount.stop_ro_session(VERIFY_SESSION_NAME)?;
            let (state_hash, patch_hash) = verified?;

            if combine_root(&patch_hash, &state_hash) == ctx.target_root_hash {
                self.mount.set_parent_hash(STATE_DIR_PATH, state_hash);
                self.mount.set_parent_hash(PATCH_FILE_PATH, patch_hash);
                return Ok(MinRecordOutcome::InSync);
            }
            // Stray records may follow the last index update.
            self.mount.truncate_log_file(last_from_ledger.seq_no)?;
            ctx.min_log_record = last_from_ledger;
            return Ok(MinRecordOutcome::MinSet);
        }

        if last_from_index.seq_no == last_from_ledger.seq_no {
            // Same height but different roots: fork.
            self.set_joining_point_for_fork(ctx, last_from_index.seq_no - 1)?;
        } else if last_from_ledger.seq_no > last_from_index.seq_no {
            let ledger_root = self.root_hash_from_ledger(last_from_index.seq_no)?;
            if ledger_root == last_from_index.hash {
                ctx.min_log_record = last_from_index;
            } else {
                self.set_joining_point_for_fork(ctx, last_from_index.seq_no - 1)?;
            }
        } else {
            // Index ahead of the ledger: walk back from the ledger tip.
            self.set_joining_point_for_fork(ctx, last_from_ledger.seq_no - 1)?;
        }
        Ok(MinRecordOutcome::MinSet)
    }

    fn root_hash_from_ledger(&self, seq_no: u64) -> NodeResult<H32> {
        let record = self
            .ledger
            .get_ledger_by_seq_no(seq_no)?
            .ok_or_else(|| {
                crate::errors::NodeError::RangeEmpty(format!("no ledger record at seq {seq_no}"))
            })?;
        Ok(combine_root(&record.config_hash, &record.state_hash))
    }

    /// Walks back one seq at a time until the ledger's recomputed root and
    /// the log index agree, then truncates the log past that point.
    fn set_joining_point_for_fork(&self, ctx: &mut LogSyncCtx, starting_point: u64) -> NodeResult<()> {
        if starting_point == 0 {
            self.mount.truncate_log_file(0)?;
            ctx.min_log_record = self.genesis_seq_hash;
            return Ok(());
        }

        let mut current_seq_no = starting_point;
        loop {
            let ledger_root = self.root_hash_from_ledger(current_seq_no)?;
            let index_root = self.mount.get_hash_from_index_by_seq_no(current_seq_no)?;
            if ledger_root == index_root {
                self.mount.truncate_log_file(current_seq_no)?;
                ctx.min_log_record = SequenceHash::new(current_seq_no, ledger_root);
                return Ok(());
            }
            if current_seq_no <= 1 {
                break;
            }
            current_seq_no -= 1;
        }

        // No agreement all the way down: restart from scratch.
        self.mount.truncate_log_file(0)?;
        ctx.min_log_record = self.genesis_seq_hash;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cafs::mount::MountKind;
    use crate::cafs::RW_SESSION_NAME;
    use crate::config::HpConfig;
    use crate::crypto::{generate_keypair, pubkey_bytes};
    use crate::hash::hash_bytes;
    use crate::ledger::store::RoundRawData;
    use crate::unl::UnlRegistry;
    use std::fs;
    use tempfile::tempdir;

    fn full_history_mount(dir: &std::path::Path) -> Arc<CafsMount> {
        let fs_dir = dir.join("contract_fs");
        fs::create_dir_all(fs_dir.join("seed/state")).expect("seed");
        fs::write(fs_dir.join("seed/state/data"), b"genesis").expect("seed file");
        fs::write(fs_dir.join("seed/patch.cfg"), b"{}").expect("seed patch");
        Arc::new(
            CafsMount::init(1, MountKind::Contract, &fs_dir, &fs_dir.join("mnt"), true)
                .expect("mount"),
        )
    }

    fn ledger_store(dir: &std::path::Path) -> Arc<LedgerStore> {
        Arc::new(
            LedgerStore::open(dir.join("primary"), None, true, 0, 0, "1.2.0".into())
                .expect("ledger store"),
        )
    }

    fn idle_network(port: u16) -> (PeerNetwork, Arc<CollectedMsgs>, Arc<AtomicBool>) {
        let keypair = generate_keypair();
        let mut cfg = HpConfig::default_with_keys(
            hex::encode(pubkey_bytes(&keypair.public)),
            hex::encode(keypair.secret.to_bytes()),
        );
        cfg.mesh.port = port;
        cfg.mesh.listen = false;
        cfg.mesh.peer_discovery.enabled = false;
        let shutdown = Arc::new(AtomicBool::new(false));
        let collected = Arc::new(CollectedMsgs::default());
        let unl = Arc::new(UnlRegistry::new(
            cfg.contract.unl_bin().expect("unl"),
            80,
        ));
        let keypair = cfg.node_keypair().expect("keypair");
        let network = PeerNetwork::start(&cfg, keypair, unl, collected.clone(), shutdown.clone())
            .expect("network");
        (network, collected, shutdown)
    }

    fn syncer(
        mount: Arc<CafsMount>,
        ledger: Arc<LedgerStore>,
        port: u16,
    ) -> (Arc<HpfsLogSync>, Arc<AtomicBool>) {
        let (network, collected, shutdown) = idle_network(port);
        let sync = HpfsLogSync::new(
            mount,
            ledger,
            network,
            collected,
            shutdown.clone(),
            Arc::new(AtomicU32::new(1_000)),
        );
        (sync, shutdown)
    }

    /// Runs one round through the mount and ledger so index and ledger
    /// advance in lockstep (or out of lockstep, when `ledger_root_salt` is
    /// used to force a fork).
    fn commit_round(
        mount: &CafsMount,
        ledger: &LedgerStore,
        seq_no: u64,
        ledger_root_salt: Option<&[u8]>,
    ) {
        mount.acquire_rw_session().expect("acquire");
        fs::write(
            mount.physical_path(RW_SESSION_NAME, "/state/data"),
            format!("round {seq_no}"),
        )
        .expect("write");
        mount.release_rw_session().expect("release");
        mount.update_hpfs_log_index(seq_no).expect("index");

        let prev = ledger.get_last_ledger().expect("last");
        let state_hash = match ledger_root_salt {
            Some(salt) => hash_bytes(salt),
            None => mount.get_committed_hash(STATE_DIR_PATH).expect("state hash"),
        };
        let config_hash = mount.get_committed_hash(PATCH_FILE_PATH).expect("patch hash");
        let mut record = LedgerRecord {
            seq_no,
            timestamp: seq_no * 1_000,
            prev_ledger_hash: prev.ledger_hash,
            state_hash,
            config_hash,
            ..LedgerRecord::default()
        };
        record.seal();
        ledger.append_round(&record, &RoundRawData::default()).expect("append");
    }

    #[test]
    fn empty_node_requests_from_genesis() {
        let dir = tempdir().expect("tempdir");
        let mount = full_history_mount(dir.path());
        let ledger = ledger_store(dir.path());
        let (sync, _shutdown) = syncer(mount, ledger, 36031);

        sync.set_sync_target(20, hash_bytes(b"target"));
        let ctx = sync.ctx.lock();
        assert!(ctx.is_syncing);
        assert_eq!(ctx.min_log_record, sync.genesis_seq_hash);
    }

    #[test]
    fn matching_tips_in_target_report_in_sync() {
        let dir = tempdir().expect("tempdir");
        let mount = full_history_mount(dir.path());
        let ledger = ledger_store(dir.path());
        for seq in 1..=3 {
            commit_round(&mount, &ledger, seq, None);
        }
        let target_root = mount.root_hash().expect("root");
        let (sync, _shutdown) = syncer(mount, ledger, 36032);

        sync.set_sync_target(3, target_root);
        assert!(sync.take_achieved());
        assert!(!sync.is_syncing());
    }

    #[test]
    fn fork_walk_finds_joining_point_and_truncates() {
        let dir = tempdir().expect("tempdir");
        let mount = full_history_mount(dir.path());
        let ledger = ledger_store(dir.path());
        // Rounds 1..=2 agree; rounds 3..=4 fork (the ledger recorded state
        // hashes that never match the log index).
        for seq in 1..=2 {
            commit_round(&mount, &ledger, seq, None);
        }
        for seq in 3..=4u64 {
            commit_round(&mount, &ledger, seq, Some(format!("fork {seq}").as_bytes()));
        }
        let joining_root = mount.get_hash_from_index_by_seq_no(2).expect("hash");
        let (sync, _shutdown) = syncer(mount.clone(), ledger, 36033);

        sync.set_sync_target(20, hash_bytes(b"remote target"));
        {
            let ctx = sync.ctx.lock();
            assert!(ctx.is_syncing);
            assert_eq!(ctx.min_log_record, SequenceHash::new(2, joining_root));
        }
        assert_eq!(mount.get_last_seq_no_from_index().expect("last"), 2);
    }

    #[test]
    fn total_fork_falls_back_to_genesis() {
        let dir = tempdir().expect("tempdir");
        let mount = full_history_mount(dir.path());
        let ledger = ledger_store(dir.path());
        for seq in 1..=3u64 {
            commit_round(&mount, &ledger, seq, Some(format!("fork {seq}").as_bytes()));
        }
        let (sync, _shutdown) = syncer(mount.clone(), ledger, 36034);

        sync.set_sync_target(20, hash_bytes(b"remote target"));
        {
            let ctx = sync.ctx.lock();
            assert_eq!(ctx.min_log_record, sync.genesis_seq_hash);
        }
        assert_eq!(mount.get_last_seq_no_from_index().expect("last"), 0);
    }

    #[test]
    fn abandons_after_resubmission_threshold() {
        let dir = tempdir().expect("tempdir");
        let mount = full_history_mount(dir.path());
        let ledger = ledger_store(dir.path());
        let (sync, _shutdown) = syncer(mount, ledger, 36035);

        sync.set_sync_target(20, hash_bytes(b"target"));
        {
            let mut ctx = sync.ctx.lock();
            for _ in 0..ABANDON_THRESHOLD {
                ctx.target_requested_on = 0;
                sync.send_sync_request(&mut ctx);
            }
            assert!(ctx.is_syncing);
            ctx.target_requested_on = 0;
            sync.send_sync_request(&mut ctx);
            assert!(!ctx.is_syncing);
        }
        assert!(sync.take_abandoned());
    }
}
