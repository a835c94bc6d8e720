use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use ed25519_dalek::Keypair;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::cafs::log_sync::HpfsLogSync;
use crate::cafs::mount::CafsMount;
use crate::cafs::sync::CafsSync;
use crate::cafs::{
    INPUT_DIR_PATH, NPL_IN_FILE_PATH, NPL_OUT_FILE_PATH, OUTPUT_DIR_PATH, PATCH_FILE_PATH,
    RW_SESSION_NAME, STATE_DIR_PATH,
};
use crate::config::{ContractCtx, HpConfig, PatchConfig, Role};
use crate::contract;
use crate::crypto;
use crate::errors::{NodeError, NodeResult};
use crate::hash::{hash_bytes, xor_reduce, H32, SequenceHash};
use crate::ledger::store::{LedgerStore, RawInput, RawOutput, RoundRawData};
use crate::ledger::{shard_no, LedgerRecord, PRIMARY_DIR, PRIMARY_SHARD_SIZE, RAW_DIR, RAW_SHARD_SIZE};
use crate::p2p::messages::{
    NonUnlProposal, NplMessage, PeerMessage, Proposal, SubmittedUserInput, UserInputGroup,
};
use crate::p2p::server::PeerNetwork;
use crate::p2p::CollectedMsgs;
use crate::unl::UnlRegistry;
use crate::usr::{input_nonce, UserServer};
use crate::util::{now_ms, sleep_ms};

/// Stages per round; the last one executes the contract.
pub const STAGE_COUNT: u8 = 4;
const STAGE_POLL_MS: u64 = 10;
const SYNC_YIELD_MS: u64 = 20;
/// Stages in a row the majority must contradict our roots before the
/// engine yields to the synchronizer.
const DIVERGENCE_STREAK_LIMIT: u32 = 2;

/// Serialized form of peer NPL messages handed to the contract.
#[derive(serde::Serialize, serde::Deserialize)]
struct NplEntry {
    pubkey: Vec<u8>,
    data: Vec<u8>,
}

/// Where the converged majority says the cluster is, when it is not where
/// we are.
struct DivergenceTarget {
    state_hash: H32,
    patch_hash: H32,
    primary_shard: SequenceHash,
}

struct RoundOutputs {
    /// Per-user output buffers collected from the contract.
    per_user: BTreeMap<Vec<u8>, Vec<Vec<u8>>>,
    output_hash: H32,
    output_sig: Vec<u8>,
}

/// An input waiting for consensus, keyed by its fingerprint. Inputs stay
/// pending until they commit or fall outside the ledger offset window.
struct PendingInput {
    pubkey: Vec<u8>,
    input: SubmittedUserInput,
    added_round: u64,
}

/// Multi-stage consensus engine: drives the round clock, exchanges stage
/// proposals, executes the contract on the final stage and commits the
/// round to the ledger.
pub struct ConsensusEngine {
    ctx: ContractCtx,
    config: Mutex<HpConfig>,
    keypair: Keypair,
    pubkey: Vec<u8>,
    startup_role: Role,
    role: Mutex<Role>,
    contract_fs: Arc<CafsMount>,
    ledger_fs: Arc<CafsMount>,
    ledger: Arc<LedgerStore>,
    unl: Arc<UnlRegistry>,
    network: PeerNetwork,
    collected: Arc<CollectedMsgs>,
    users: UserServer,
    contract_sync: Arc<CafsSync>,
    log_sync: Option<Arc<HpfsLogSync>>,
    effective_roundtime: Arc<AtomicU32>,
    shutdown: Arc<AtomicBool>,
    applied_patch_hash: Mutex<H32>,
    pending_inputs: Mutex<HashMap<Vec<u8>, PendingInput>>,
}

#[allow(clippy::too_many_arguments)]
impl ConsensusEngine {
    pub fn new(
        ctx: ContractCtx,
        config: HpConfig,
        keypair: Keypair,
        contract_fs: Arc<CafsMount>,
        ledger_fs: Arc<CafsMount>,
        ledger: Arc<LedgerStore>,
        unl: Arc<UnlRegistry>,
        network: PeerNetwork,
        collected: Arc<CollectedMsgs>,
        users: UserServer,
        contract_sync: Arc<CafsSync>,
        log_sync: Option<Arc<HpfsLogSync>>,
        effective_roundtime: Arc<AtomicU32>,
        shutdown: Arc<AtomicBool>,
    ) -> NodeResult<Self> {
        let pubkey = config.node_pubkey_bin()?;
        let startup_role = config.node.role;
        let patch_hash = contract_fs
            .get_committed_hash(PATCH_FILE_PATH)
            .unwrap_or_default();
        Ok(Self {
            ctx,
            role: Mutex::new(startup_role),
            startup_role,
            config: Mutex::new(config),
            keypair,
            pubkey,
            contract_fs,
            ledger_fs,
            ledger,
            unl,
            network,
            collected,
            users,
            contract_sync,
            log_sync,
            effective_roundtime,
            shutdown,
            applied_patch_hash: Mutex::new(patch_hash),
            pending_inputs: Mutex::new(HashMap::new()),
        })
    }

    pub fn role(&self) -> Role {
        *self.role.lock()
    }

    /// Runs the round machine until shutdown. One worker thread owns this.
    pub fn run(&self) {
        info!(role = ?self.role(), "consensus engine started");
        let mut divergence_streak = 0u32;
        while !self.shutdown.load(Ordering::Relaxed) {
            self.service_sync_outcomes();
            if self.sync_in_progress() {
                // ABORT_SYNC: no proposals until the target is archived.
                sleep_ms(SYNC_YIELD_MS);
                continue;
            }
            match self.run_round(&mut divergence_streak) {
                Ok(true) => {
                    // A committed round proves we are caught up again.
                    self.change_role(Role::Validator);
                }
                Ok(false) => {}
                Err(NodeError::Shutdown) => break,
                Err(err) => {
                    // Failures discard the round attempt, never the process.
                    error!(%err, "consensus round failed");
                }
            }
        }
        info!("consensus engine stopped");
    }

    fn sync_in_progress(&self) -> bool {
        self.contract_sync.is_syncing()
            || self
                .log_sync
                .as_ref()
                .map(|sync| sync.is_syncing())
                .unwrap_or(false)
    }

    /// Applies results reported by the synchronizers: refreshed hashes,
    /// patch updates and demotion on abandoned syncs.
    fn service_sync_outcomes(&self) {
        for (vpath, hash) in self.contract_sync.take_achieved() {
            self.contract_fs.set_parent_hash(&vpath, hash);
            if vpath == PATCH_FILE_PATH {
                if let Err(err) = self.apply_patch_config() {
                    error!(%err, "applying patch file changes after sync failed");
                }
            }
        }
        let mut abandoned = self.contract_sync.take_abandoned();
        if let Some(log_sync) = &self.log_sync {
            if log_sync.take_achieved() {
                self.refresh_parent_hashes();
                if let Err(err) = self.apply_patch_config() {
                    error!(%err, "applying patch file changes after log sync failed");
                }
            }
            abandoned |= log_sync.take_abandoned();
        }
        if abandoned {
            warn!("sync abandoned, demoting to observer until the next commit");
            self.change_role(Role::Observer);
        }
    }

    fn refresh_parent_hashes(&self) {
        for vpath in [STATE_DIR_PATH, PATCH_FILE_PATH] {
            if let Ok(hash) = self.contract_fs.get_committed_hash(vpath) {
                self.contract_fs.set_parent_hash(vpath, hash);
            }
        }
    }

    /// An observer started as such is never promoted; a demoted validator
    /// may recover.
    fn change_role(&self, role: Role) {
        if self.startup_role == Role::Observer {
            return;
        }
        let mut current = self.role.lock();
        if *current != role {
            info!(?role, "switching node role");
            *current = role;
        }
    }

    /// One full round: stages 1..=N, execution, commit. Returns whether a
    /// ledger record was committed.
    fn run_round(&self, divergence_streak: &mut u32) -> NodeResult<bool> {
        let roundtime = self.effective_roundtime.load(Ordering::Relaxed);
        let (threshold, stage_slice) = {
            let config = self.config.lock();
            (
                config.contract.consensus.threshold,
                config.contract.consensus.stage_slice,
            )
        };
        let slice_ms = (roundtime as u64 * stage_slice as u64 / 100).max(1);
        let lcl = self.ledger.get_last_ledger()?;
        let round_no = lcl.seq_no + 1;
        let max_input_offset = self.config.lock().contract.max_input_ledger_offset as u64;

        // Pull freshly submitted and relayed inputs into the pending pool
        // and share the local ones with the cluster.
        let local_inputs = self.users.take_inputs();
        if !local_inputs.is_empty() {
            self.broadcast_nonunl_proposal(&local_inputs);
        }
        let input_pool: HashMap<Vec<u8>, (Vec<u8>, SubmittedUserInput)> = {
            let mut pending = self.pending_inputs.lock();
            for (pubkey, input) in local_inputs {
                let fingerprint = hash_bytes(&input.input_container);
                pending
                    .entry(fingerprint.as_bytes().to_vec())
                    .or_insert(PendingInput {
                        pubkey,
                        input,
                        added_round: round_no,
                    });
            }
            for group in self.collected.drain_nonunl_proposals() {
                for user_group in group.user_inputs {
                    for input in user_group.inputs {
                        if crypto::verify(&input.input_container, &input.sig, &user_group.pubkey)
                            .is_err()
                        {
                            debug!("dropping relayed input with bad signature");
                            continue;
                        }
                        let fingerprint = hash_bytes(&input.input_container);
                        pending
                            .entry(fingerprint.as_bytes().to_vec())
                            .or_insert(PendingInput {
                                pubkey: user_group.pubkey.clone(),
                                input,
                                added_round: round_no,
                            });
                    }
                }
            }
            pending.retain(|_, entry| entry.added_round + max_input_offset >= round_no);
            pending
                .iter()
                .map(|(fingerprint, entry)| {
                    (
                        fingerprint.clone(),
                        (entry.pubkey.clone(), entry.input.clone()),
                    )
                })
                .collect()
        };

        let mut candidate_users: Vec<Vec<u8>> = input_pool
            .values()
            .map(|(pubkey, _)| pubkey.clone())
            .collect();
        candidate_users.sort();
        candidate_users.dedup();
        let mut candidate_inputs: Vec<Vec<u8>> = input_pool.keys().cloned().collect();
        candidate_inputs.sort();

        // Rounds are aligned to wall-clock multiples of the roundtime so
        // every node's stage windows coincide.
        let roundtime_ms = roundtime as u64;
        let round_start = now_ms().div_ceil(roundtime_ms) * roundtime_ms;
        while now_ms() < round_start {
            if self.shutdown.load(Ordering::Relaxed) {
                return Err(NodeError::Shutdown);
            }
            sleep_ms(STAGE_POLL_MS);
        }

        let mut group_nonce = H32::default();
        let mut outputs: Option<RoundOutputs> = None;
        let mut rw_held = false;

        let round_result = (|| -> NodeResult<bool> {
            for stage in 1..=STAGE_COUNT {
                if self.shutdown.load(Ordering::Relaxed) {
                    return Err(NodeError::Shutdown);
                }

                if stage == STAGE_COUNT {
                    // Execution window: inputs in, contract run, outputs out.
                    self.contract_fs.acquire_rw_session()?;
                    rw_held = true;
                    outputs = Some(self.execute_contract_round(
                        &lcl,
                        &candidate_inputs,
                        &input_pool,
                    )?);
                }

                let mut proposal = self.build_proposal(
                    stage,
                    round_start,
                    roundtime,
                    group_nonce,
                    &candidate_users,
                    &candidate_inputs,
                    outputs.as_ref(),
                )?;
                let mut accepted: Vec<Proposal> = Vec::new();
                if self.role() == Role::Validator {
                    proposal.sign(&self.keypair);
                    self.network
                        .broadcast(&PeerMessage::Proposal(proposal.clone()));
                    accepted.push(proposal);
                }

                self.collect_stage_proposals(
                    &mut accepted,
                    stage,
                    roundtime,
                    round_start,
                    round_start + stage as u64 * slice_ms,
                )?;
                self.unl.update_stats(&accepted, round_no);

                if accepted.is_empty() {
                    debug!(stage, "no proposals accepted for stage");
                    return Ok(false);
                }

                // Convergence: threshold vote on set elements, plurality on
                // scalar hashes.
                candidate_users = converge_sets(
                    accepted.iter().map(|p| p.users.as_slice()),
                    accepted.len(),
                    threshold,
                );
                candidate_inputs = converge_sets(
                    accepted.iter().map(|p| p.input_ordered_hashes.as_slice()),
                    accepted.len(),
                    threshold,
                );
                group_nonce = xor_reduce(accepted.iter().map(|p| &p.node_nonce).collect::<Vec<_>>());

                if self.detect_divergence(&accepted, threshold, divergence_streak)? {
                    return Ok(false);
                }

                if stage == STAGE_COUNT {
                    return self.commit_round(
                        &lcl,
                        round_start,
                        &accepted,
                        threshold,
                        &candidate_users,
                        &candidate_inputs,
                        &input_pool,
                        group_nonce,
                        outputs.take().expect("final stage populated outputs"),
                        &mut rw_held,
                    );
                }
            }
            Ok(false)
        })();

        if rw_held {
            // The round did not commit; throw the execution effects away.
            if let Err(err) = self.contract_fs.discard_rw_session() {
                warn!(%err, "discarding rw session failed");
            }
        }
        round_result
    }

    fn broadcast_nonunl_proposal(&self, inputs: &[(Vec<u8>, SubmittedUserInput)]) {
        let mut groups: BTreeMap<Vec<u8>, Vec<SubmittedUserInput>> = BTreeMap::new();
        for (pubkey, input) in inputs {
            groups.entry(pubkey.clone()).or_default().push(input.clone());
        }
        let message = PeerMessage::NonUnlProposal(NonUnlProposal {
            user_inputs: groups
                .into_iter()
                .map(|(pubkey, inputs)| UserInputGroup { pubkey, inputs })
                .collect(),
        });
        self.network.broadcast(&message);
    }

    fn build_proposal(
        &self,
        stage: u8,
        round_start: u64,
        roundtime: u32,
        group_nonce: H32,
        users: &[Vec<u8>],
        input_hashes: &[Vec<u8>],
        outputs: Option<&RoundOutputs>,
    ) -> NodeResult<Proposal> {
        let node_nonce = H32(
            crypto::random_bytes(32)
                .try_into()
                .expect("32 random bytes"),
        );
        let (output_hash, output_sig) = match outputs {
            Some(outputs) => (outputs.output_hash, outputs.output_sig.clone()),
            None => (H32::default(), Vec::new()),
        };
        Ok(Proposal {
            pubkey: self.pubkey.clone(),
            sig: Vec::new(),
            stage,
            time: round_start,
            time_config: roundtime,
            node_nonce,
            group_nonce,
            users: users.to_vec(),
            input_ordered_hashes: input_hashes.to_vec(),
            output_hash,
            output_sig,
            state_hash: self.contract_fs.get_parent_hash(STATE_DIR_PATH),
            patch_hash: self.contract_fs.get_parent_hash(PATCH_FILE_PATH),
            last_primary_shard_id: self.shard_id(PRIMARY_DIR, PRIMARY_SHARD_SIZE)?,
            last_raw_shard_id: self.shard_id(RAW_DIR, RAW_SHARD_SIZE)?,
        })
    }

    /// Current ledger-fs shard tip: shard number plus the CAFS hash of its
    /// directory.
    fn shard_id(&self, dir: &str, shard_size: u64) -> NodeResult<SequenceHash> {
        let lcl = self.ledger.get_last_ledger()?;
        if lcl.seq_no == 0 {
            return Ok(SequenceHash::default());
        }
        let shard = shard_no(lcl.seq_no, shard_size);
        let vpath = format!("{dir}/{shard}");
        let hash = self.ledger_fs.get_committed_hash(&vpath).unwrap_or_default();
        Ok(SequenceHash::new(shard, hash))
    }

    /// Drains peer proposals until the stage deadline, accepting only those
    /// that pass the round/stage/time/duplication gates. Signature and UNL
    /// checks already happened on the session workers.
    fn collect_stage_proposals(
        &self,
        accepted: &mut Vec<Proposal>,
        stage: u8,
        roundtime: u32,
        round_start: u64,
        deadline: u64,
    ) -> NodeResult<()> {
        let mut seen_authors: HashSet<Vec<u8>> = accepted
            .iter()
            .map(|proposal| proposal.pubkey.clone())
            .collect();
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return Err(NodeError::Shutdown);
            }
            for proposal in self.collected.drain_proposals() {
                if proposal.time != round_start {
                    debug!("dropping proposal for another round");
                    continue;
                }
                if proposal.stage > stage {
                    // A slightly ahead peer; hold the proposal for its stage.
                    self.collected.proposals.lock().push(proposal);
                    continue;
                }
                if proposal.stage < stage {
                    debug!(
                        got = proposal.stage,
                        expected = stage,
                        "dropping late proposal for a past stage"
                    );
                    continue;
                }
                if proposal.time_config != roundtime {
                    debug!(
                        declared = proposal.time_config,
                        ours = roundtime,
                        "dropping proposal with mismatched time config"
                    );
                    continue;
                }
                if !seen_authors.insert(proposal.pubkey.clone()) {
                    debug!("dropping duplicate proposal for stage");
                    continue;
                }
                accepted.push(proposal);
            }
            let now = now_ms();
            if now >= deadline {
                return Ok(());
            }
            sleep_ms(STAGE_POLL_MS.min(deadline - now));
        }
    }

    /// Tracks whether the peer majority keeps contradicting our roots; on
    /// the second consecutive stage, hands over to the synchronizer.
    fn detect_divergence(
        &self,
        accepted: &[Proposal],
        threshold: u32,
        streak: &mut u32,
    ) -> NodeResult<bool> {
        let ours_state = self.contract_fs.get_parent_hash(STATE_DIR_PATH);
        let ours_patch = self.contract_fs.get_parent_hash(PATCH_FILE_PATH);
        let foreign: Vec<&Proposal> = accepted
            .iter()
            .filter(|proposal| proposal.pubkey != self.pubkey)
            .collect();
        if foreign.is_empty() {
            *streak = 0;
            return Ok(false);
        }
        let winner_state = plurality(foreign.iter().map(|p| p.state_hash));
        let winner_patch = plurality(foreign.iter().map(|p| p.patch_hash));
        let Some((state_hash, state_votes)) = winner_state else {
            *streak = 0;
            return Ok(false);
        };
        let required = ((foreign.len() as u64 * threshold as u64).div_ceil(100)).max(1) as usize;
        let diverged = (state_hash != ours_state
            || winner_patch.map(|(hash, _)| hash != ours_patch).unwrap_or(false))
            && state_votes >= required;
        if !diverged {
            *streak = 0;
            return Ok(false);
        }
        *streak += 1;
        if *streak < DIVERGENCE_STREAK_LIMIT {
            return Ok(false);
        }
        *streak = 0;

        let patch_hash = winner_patch.map(|(hash, _)| hash).unwrap_or(ours_patch);
        let primary_shard = plurality(foreign.iter().map(|p| p.last_primary_shard_id))
            .map(|(id, _)| id)
            .unwrap_or_default();
        let target = DivergenceTarget {
            state_hash,
            patch_hash,
            primary_shard,
        };
        warn!(
            state = %target.state_hash,
            "peer majority disagrees with local state, entering sync"
        );
        self.trigger_sync(&target);
        Ok(true)
    }

    fn trigger_sync(&self, target: &DivergenceTarget) {
        match &self.log_sync {
            Some(log_sync) => {
                // Full-history nodes must replay, never block-diff.
                let target_seq = (target.primary_shard.seq_no + 1) * PRIMARY_SHARD_SIZE;
                let root = crate::cafs::combine_root(&target.patch_hash, &target.state_hash);
                log_sync.set_sync_target(target_seq, root);
            }
            None => {
                let ours_patch = self.contract_fs.get_parent_hash(PATCH_FILE_PATH);
                if target.patch_hash != ours_patch {
                    self.contract_sync
                        .set_sync_target(PATCH_FILE_PATH, true, target.patch_hash);
                } else {
                    self.contract_sync
                        .set_sync_target(STATE_DIR_PATH, false, target.state_hash);
                }
            }
        }
    }

    /// Final-stage execution: inputs into the filesystem, contract run,
    /// outputs and NPL traffic collected. The RW session is held by the
    /// caller until commit or discard.
    fn execute_contract_round(
        &self,
        lcl: &LedgerRecord,
        candidate_inputs: &[Vec<u8>],
        input_pool: &HashMap<Vec<u8>, (Vec<u8>, SubmittedUserInput)>,
    ) -> NodeResult<RoundOutputs> {
        let contract_cfg = self.config.lock().contract.clone();

        // Materialize the round's accepted inputs for the contract.
        let input_root = self
            .contract_fs
            .physical_path(RW_SESSION_NAME, INPUT_DIR_PATH);
        let mut per_user_counter: HashMap<Vec<u8>, u32> = HashMap::new();
        for fingerprint in candidate_inputs {
            let Some((pubkey, input)) = input_pool.get(fingerprint) else {
                debug!("accepted input without payload, skipping");
                continue;
            };
            let counter = per_user_counter.entry(pubkey.clone()).or_insert(0);
            let user_dir = input_root.join(hex::encode(pubkey));
            fs::create_dir_all(&user_dir)?;
            fs::write(user_dir.join(format!("{counter}.inp")), &input.input_container)?;
            *counter += 1;
        }

        // Deliver peer NPL messages for this round.
        let npl_entries: Vec<NplEntry> = self
            .collected
            .drain_npl_messages()
            .into_iter()
            .filter(|msg| msg.lcl_id.seq_no == lcl.seq_no)
            .map(|msg| NplEntry {
                pubkey: msg.pubkey,
                data: msg.data,
            })
            .collect();
        let npl_in = self
            .contract_fs
            .physical_path(RW_SESSION_NAME, NPL_IN_FILE_PATH);
        if let Some(parent) = npl_in.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&npl_in, bincode::serialize(&npl_entries)?)?;

        if contract_cfg.execute {
            let request = contract::ExecutionRequest {
                rw_root: self
                    .contract_fs
                    .physical_path(RW_SESSION_NAME, STATE_DIR_PATH),
                contract_log_dir: self.ctx.contract_log_dir.clone(),
                lcl_id: lcl.id(),
            };
            if let Err(err) = contract::execute(&contract_cfg, &request) {
                warn!(%err, "contract execution failed, committing without outputs");
            }
        }

        // Collect per-user outputs written by the contract.
        let mut per_user: BTreeMap<Vec<u8>, Vec<Vec<u8>>> = BTreeMap::new();
        let output_root = self
            .contract_fs
            .physical_path(RW_SESSION_NAME, OUTPUT_DIR_PATH);
        if output_root.exists() {
            for entry in fs::read_dir(&output_root)? {
                let entry = entry?;
                let Ok(pubkey) = hex::decode(entry.file_name().to_string_lossy().as_ref()) else {
                    continue;
                };
                let mut files: Vec<_> = fs::read_dir(entry.path())?
                    .collect::<Result<Vec<_>, _>>()?
                    .into_iter()
                    .map(|file| file.path())
                    .collect();
                files.sort();
                let mut buffers = Vec::with_capacity(files.len());
                for file in files {
                    buffers.push(fs::read(file)?);
                }
                per_user.insert(pubkey, buffers);
            }
        }

        // Relay contract chatter to the other nodes in the same round.
        let npl_out = self
            .contract_fs
            .physical_path(RW_SESSION_NAME, NPL_OUT_FILE_PATH);
        if npl_out.exists() {
            let data = fs::read(&npl_out)?;
            if !data.is_empty() {
                let mut message = NplMessage {
                    pubkey: self.pubkey.clone(),
                    lcl_id: lcl.id(),
                    data,
                    sig: Vec::new(),
                };
                message.sign(&self.keypair);
                self.network.broadcast(&PeerMessage::Npl(message));
            }
        }

        // The exchange subtrees never become part of the persisted state.
        for vpath in [INPUT_DIR_PATH, OUTPUT_DIR_PATH] {
            let path = self.contract_fs.physical_path(RW_SESSION_NAME, vpath);
            if path.exists() {
                fs::remove_dir_all(path)?;
            }
        }
        let npl_dir = npl_in.parent().map(|p| p.to_path_buf());
        if let Some(npl_dir) = npl_dir {
            if npl_dir.exists() {
                fs::remove_dir_all(npl_dir)?;
            }
        }

        let output_hash = xor_reduce(
            per_user
                .iter()
                .map(|(pubkey, buffers)| {
                    let mut hasher = blake3::Hasher::new();
                    hasher.update(pubkey);
                    for buffer in buffers {
                        hasher.update(buffer);
                    }
                    H32(*hasher.finalize().as_bytes())
                })
                .collect::<Vec<_>>()
                .iter(),
        );
        let output_sig = crypto::sign(output_hash.as_bytes(), &self.keypair);
        Ok(RoundOutputs {
            per_user,
            output_hash,
            output_sig,
        })
    }

    /// Commit: quorum check on the outputs, ledger record assembly, shard
    /// persistence, RW release, log index update and output streaming.
    #[allow(clippy::too_many_arguments)]
    fn commit_round(
        &self,
        lcl: &LedgerRecord,
        round_start: u64,
        accepted: &[Proposal],
        threshold: u32,
        users: &[Vec<u8>],
        input_hashes: &[Vec<u8>],
        input_pool: &HashMap<Vec<u8>, (Vec<u8>, SubmittedUserInput)>,
        group_nonce: H32,
        outputs: RoundOutputs,
        rw_held: &mut bool,
    ) -> NodeResult<bool> {
        let output_votes = accepted
            .iter()
            .filter(|proposal| proposal.output_hash == outputs.output_hash)
            .count();
        let required = ((accepted.len() as u64 * threshold as u64).div_ceil(100)).max(1) as usize;
        if output_votes < required {
            debug!(
                output_votes,
                required, "output hash below quorum threshold, discarding round"
            );
            return Ok(false);
        }

        let state_hash = self.contract_fs.get_hash(RW_SESSION_NAME, STATE_DIR_PATH)?;
        let config_hash = self.contract_fs.get_hash(RW_SESSION_NAME, PATCH_FILE_PATH)?;

        // Digest of the agreed round data; deliberately excludes anything
        // node-specific (signatures, nonces) so every validator seals the
        // same record.
        let mut data_hasher = blake3::Hasher::new();
        for user in users {
            data_hasher.update(user);
        }
        for input in input_hashes {
            data_hasher.update(input);
        }
        data_hasher.update(state_hash.as_bytes());
        data_hasher.update(config_hash.as_bytes());
        data_hasher.update(outputs.output_hash.as_bytes());
        let data_hash = H32(*data_hasher.finalize().as_bytes());

        let mut record = LedgerRecord {
            seq_no: lcl.seq_no + 1,
            timestamp: round_start,
            prev_ledger_hash: lcl.ledger_hash,
            data_hash,
            state_hash,
            config_hash,
            nonce: group_nonce,
            user_hash: xor_reduce(
                users
                    .iter()
                    .map(|pubkey| hash_bytes(pubkey))
                    .collect::<Vec<_>>()
                    .iter(),
            ),
            input_hash: xor_reduce(
                input_hashes
                    .iter()
                    .filter_map(|hash| H32::from_slice(hash))
                    .collect::<Vec<_>>()
                    .iter(),
            ),
            output_hash: outputs.output_hash,
            ..LedgerRecord::default()
        };
        record.seal();

        let raw = RoundRawData {
            users: users.to_vec(),
            inputs: input_hashes
                .iter()
                .filter_map(|fingerprint| {
                    let (pubkey, input) = input_pool.get(fingerprint)?;
                    Some(RawInput {
                        pubkey: pubkey.clone(),
                        hash: H32::from_slice(fingerprint)?,
                        nonce: input_nonce(),
                        payload: input.input_container.clone(),
                    })
                })
                .collect(),
            outputs: outputs
                .per_user
                .iter()
                .map(|(pubkey, buffers)| RawOutput {
                    pubkey: pubkey.clone(),
                    hash: hash_bytes(&buffers.concat()),
                    outputs: buffers.clone(),
                })
                .collect(),
        };

        self.ledger.append_round(&record, &raw)?;
        {
            let mut pending = self.pending_inputs.lock();
            for fingerprint in input_hashes {
                pending.remove(fingerprint);
            }
        }
        self.contract_fs.release_rw_session()?;
        *rw_held = false;
        self.contract_fs.update_hpfs_log_index(record.seq_no)?;

        self.contract_fs.set_parent_hash(STATE_DIR_PATH, state_hash);
        self.contract_fs.set_parent_hash(PATCH_FILE_PATH, config_hash);

        let outputs_by_user: HashMap<Vec<u8>, Vec<Vec<u8>>> =
            outputs.per_user.clone().into_iter().collect();
        self.users.send_outputs(record.seq_no, &outputs_by_user);

        info!(
            seq_no = record.seq_no,
            ledger_hash = %record.ledger_hash,
            "round committed"
        );

        // A changed patch overlay reconfigures the node at the boundary.
        let mut applied = self.applied_patch_hash.lock();
        if *applied != config_hash {
            *applied = config_hash;
            drop(applied);
            if let Err(err) = self.apply_patch_config() {
                error!(%err, "applying patch file changes failed");
            }
        }
        Ok(true)
    }

    /// Re-reads the patch overlay from the committed tree, rebuilds the
    /// runtime contract section, updates the UNL and roundtime, and keeps
    /// the persisted config consistent with the patch.
    pub fn apply_patch_config(&self) -> NodeResult<()> {
        let patch_path = self.contract_fs.physical_path("", PATCH_FILE_PATH);
        if !patch_path.exists() {
            return Ok(());
        }
        let content = fs::read_to_string(&patch_path)?;
        let patch: PatchConfig = serde_json::from_str(&content)
            .map_err(|err| NodeError::ConfigInvalid(format!("invalid patch config: {err}")))?;

        let mut config = self.config.lock();
        patch.apply_to(&mut config.contract);
        self.unl.update_from_patch(config.contract.unl_bin()?);

        let lcl = self.ledger.get_last_ledger()?;
        let majority = self
            .unl
            .get_majority_time_config(config.contract.consensus.roundtime, lcl.seq_no + 1);
        self.effective_roundtime.store(majority, Ordering::Relaxed);
        self.network.update_time_config(majority);

        config.save(&self.ctx.config_file)?;
        info!("contract config updated from patch file");
        Ok(())
    }
}

/// Keeps elements present in at least `threshold` percent of the accepted
/// proposals' set-valued fields.
fn converge_sets<'a, I>(sets: I, accepted_count: usize, threshold: u32) -> Vec<Vec<u8>>
where
    I: Iterator<Item = &'a [Vec<u8>]>,
{
    let mut counts: BTreeMap<&[u8], usize> = BTreeMap::new();
    for set in sets {
        for element in set {
            *counts.entry(element.as_slice()).or_default() += 1;
        }
    }
    let required = ((accepted_count as u64 * threshold as u64).div_ceil(100)).max(1) as usize;
    counts
        .into_iter()
        .filter(|(_, count)| *count >= required)
        .map(|(element, _)| element.to_vec())
        .collect()
}

/// Highest-count value; ties break to the lowest value.
fn plurality<T, I>(values: I) -> Option<(T, usize)>
where
    T: Ord + Copy,
    I: Iterator<Item = T>,
{
    let mut counts: BTreeMap<T, usize> = BTreeMap::new();
    for value in values {
        *counts.entry(value).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::H32_EMPTY;

    fn bytes(tag: u8) -> Vec<u8> {
        vec![tag; 32]
    }

    #[test]
    fn converge_keeps_threshold_supported_elements() {
        let sets: Vec<Vec<Vec<u8>>> = vec![
            vec![bytes(1), bytes(2)],
            vec![bytes(1), bytes(3)],
            vec![bytes(1), bytes(2)],
            vec![bytes(1)],
            vec![bytes(1), bytes(2)],
        ];
        // threshold 80% of 5 proposals = 4 supporters required.
        let converged = converge_sets(sets.iter().map(|s| s.as_slice()), sets.len(), 80);
        assert_eq!(converged, vec![bytes(1)]);
        // At 60% (3 supporters) the second element survives too.
        let converged = converge_sets(sets.iter().map(|s| s.as_slice()), sets.len(), 60);
        assert_eq!(converged, vec![bytes(1), bytes(2)]);
    }

    #[test]
    fn converged_sets_are_sorted_ascending() {
        let sets: Vec<Vec<Vec<u8>>> = vec![vec![bytes(9), bytes(1), bytes(5)]];
        let converged = converge_sets(sets.iter().map(|s| s.as_slice()), 1, 100);
        assert_eq!(converged, vec![bytes(1), bytes(5), bytes(9)]);
    }

    #[test]
    fn plurality_breaks_ties_towards_lowest() {
        let values = vec![
            hash_bytes(b"bb"),
            hash_bytes(b"aa"),
            hash_bytes(b"bb"),
            hash_bytes(b"aa"),
        ];
        let (winner, votes) = plurality(values.iter().copied()).expect("winner");
        assert_eq!(votes, 2);
        assert_eq!(winner, hash_bytes(b"aa").min(hash_bytes(b"bb")));
    }

    #[test]
    fn plurality_prefers_higher_count_over_lower_value() {
        let low = H32_EMPTY;
        let high = hash_bytes(b"zz");
        let values = vec![high, high, low];
        let (winner, votes) = plurality(values.iter().copied()).expect("winner");
        assert_eq!(winner, high);
        assert_eq!(votes, 2);
    }

    #[test]
    fn group_nonce_is_xor_of_node_nonces() {
        let mut proposals = Vec::new();
        for tag in 1..=3u8 {
            proposals.push(Proposal {
                node_nonce: hash_bytes(&[tag]),
                ..Proposal::default()
            });
        }
        let combined = xor_reduce(proposals.iter().map(|p| &p.node_nonce).collect::<Vec<_>>());
        let mut expected = hash_bytes(&[1u8]);
        expected ^= hash_bytes(&[2u8]);
        expected ^= hash_bytes(&[3u8]);
        assert_eq!(combined, expected);
    }
}
