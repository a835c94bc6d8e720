#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tempfile::TempDir;

use crucible::cafs::log_sync::HpfsLogSync;
use crucible::cafs::mount::{CafsMount, MountKind};
use crucible::cafs::sync::CafsSync;
use crucible::cafs::{PATCH_FILE_PATH, RW_SESSION_NAME, STATE_DIR_PATH};
use crucible::config::{ContractCtx, HistoryMode, HpConfig, PatchConfig};
use crucible::consensus::ConsensusEngine;
use crucible::crypto::{self, generate_keypair, pubkey_bytes};
use crucible::hash::H32;
use crucible::ledger::store::{LedgerStore, RoundRawData};
use crucible::ledger::LedgerRecord;
use crucible::p2p::messages::{InputProtocol, SubmittedUserInput};
use crucible::p2p::server::PeerNetwork;
use crucible::p2p::CollectedMsgs;
use crucible::unl::UnlRegistry;
use crucible::usr::UserServer;
use crucible::util::{now_ms, sleep_ms};

pub struct TestNode {
    pub base: PathBuf,
    pub ctx: ContractCtx,
    pub config: HpConfig,
    pub contract_fs: Arc<CafsMount>,
    pub ledger_fs: Arc<CafsMount>,
    pub ledger: Arc<LedgerStore>,
    pub unl: Arc<UnlRegistry>,
    pub network: PeerNetwork,
    pub users: UserServer,
    pub collected: Arc<CollectedMsgs>,
    pub engine: Arc<ConsensusEngine>,
    pub contract_sync: Arc<CafsSync>,
    pub log_sync: Option<Arc<HpfsLogSync>>,
    pub shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
    _dir: TempDir,
}

pub fn fresh_keys() -> (String, String) {
    let keypair = generate_keypair();
    (
        hex::encode(pubkey_bytes(&keypair.public)),
        hex::encode(keypair.secret.to_bytes()),
    )
}

/// Builds a fully wired node (without TLS listeners) the way `node::init`
/// does, inside a scratch directory.
pub fn build_node(
    mesh_port: u16,
    keys: (String, String),
    configure: impl FnOnce(&mut HpConfig, &Path),
) -> TestNode {
    let dir = TempDir::new().expect("tempdir");
    let base = dir.path().join("contract");
    let ctx = ContractCtx::new(&base);
    fs::create_dir_all(&ctx.config_dir).expect("cfg dir");
    fs::create_dir_all(&ctx.contract_log_dir).expect("log dir");
    fs::create_dir_all(ctx.contract_fs_dir.join("seed/state")).expect("contract seed");
    fs::create_dir_all(ctx.ledger_fs_dir.join("seed/primary")).expect("ledger seed");
    fs::create_dir_all(ctx.ledger_fs_dir.join("seed/raw")).expect("ledger seed");

    let mut config = HpConfig::default_with_keys(keys.0, keys.1);
    config.contract.id = "integration-test".to_string();
    config.contract.execute = false;
    config.mesh.port = mesh_port;
    config.mesh.peer_discovery.enabled = false;
    config.user.listen = false;
    configure(&mut config, &base);
    config.save(&ctx.config_file).expect("save config");

    let patch = PatchConfig::from_contract(&config.contract);
    fs::write(
        ctx.contract_fs_dir.join("seed/patch.cfg"),
        serde_json::to_string_pretty(&patch).expect("encode patch"),
    )
    .expect("seed patch");

    let is_full_history = config.node.history == HistoryMode::Full;
    let contract_fs = Arc::new(
        CafsMount::init(
            1,
            MountKind::Contract,
            &ctx.contract_fs_dir,
            &ctx.contract_fs_dir.join("mnt"),
            is_full_history,
        )
        .expect("contract mount"),
    );
    let ledger_fs = Arc::new(
        CafsMount::init(
            2,
            MountKind::Ledger,
            &ctx.ledger_fs_dir,
            &ctx.ledger_fs_dir.join("mnt"),
            false,
        )
        .expect("ledger mount"),
    );

    let raw_enabled = is_full_history || config.node.history_config.max_raw_shards > 0;
    let ledger = Arc::new(
        LedgerStore::open(
            ledger_fs.physical_path("", crucible::ledger::PRIMARY_DIR),
            raw_enabled.then(|| ledger_fs.physical_path("", crucible::ledger::RAW_DIR)),
            false,
            0,
            0,
            config.hp_version.clone(),
        )
        .expect("ledger store"),
    );

    let unl = Arc::new(UnlRegistry::new(
        config.contract.unl_bin().expect("unl"),
        config.contract.consensus.threshold,
    ));
    let shutdown = Arc::new(AtomicBool::new(false));
    let collected = Arc::new(CollectedMsgs::default());
    let effective_roundtime = Arc::new(AtomicU32::new(config.contract.consensus.roundtime));

    let network = PeerNetwork::start(
        &config,
        config.node_keypair().expect("keypair"),
        unl.clone(),
        collected.clone(),
        shutdown.clone(),
    )
    .expect("network");

    let users = UserServer::start(
        config.user.port,
        false,
        config.user.max_bytes_per_msg,
        config.user.concurrent_read_requests,
        &ctx.tls_key_file,
        &ctx.tls_cert_file,
        ledger.clone(),
        shutdown.clone(),
    )
    .expect("user server");

    let contract_sync = CafsSync::new(
        contract_fs.clone(),
        network.clone(),
        collected.clone(),
        shutdown.clone(),
        effective_roundtime.clone(),
    );
    let mut handles = vec![contract_sync.spawn()];

    let log_sync = if is_full_history {
        let sync = HpfsLogSync::new(
            contract_fs.clone(),
            ledger.clone(),
            network.clone(),
            collected.clone(),
            shutdown.clone(),
            effective_roundtime.clone(),
        );
        handles.push(sync.spawn());
        Some(sync)
    } else {
        None
    };

    for vpath in [STATE_DIR_PATH, PATCH_FILE_PATH] {
        contract_fs.set_parent_hash(
            vpath,
            contract_fs.get_committed_hash(vpath).expect("seed hash"),
        );
    }

    let engine = Arc::new(
        ConsensusEngine::new(
            ctx.clone(),
            config.clone(),
            config.node_keypair().expect("keypair"),
            contract_fs.clone(),
            ledger_fs.clone(),
            ledger.clone(),
            unl.clone(),
            network.clone(),
            collected.clone(),
            users.clone(),
            contract_sync.clone(),
            log_sync.clone(),
            effective_roundtime,
            shutdown.clone(),
        )
        .expect("engine"),
    );

    TestNode {
        base,
        ctx,
        config,
        contract_fs,
        ledger_fs,
        ledger,
        unl,
        network,
        users,
        collected,
        engine,
        contract_sync,
        log_sync,
        shutdown,
        handles,
        _dir: dir,
    }
}

impl TestNode {
    pub fn start_engine(&mut self) {
        let engine = self.engine.clone();
        self.handles.push(std::thread::spawn(move || engine.run()));
    }

    pub fn pubkey_bin(&self) -> Vec<u8> {
        self.config.node_pubkey_bin().expect("pubkey")
    }

    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

pub fn wait_until(timeout_ms: u64, cond: impl Fn() -> bool) -> bool {
    let deadline = now_ms() + timeout_ms;
    while now_ms() < deadline {
        if cond() {
            return true;
        }
        sleep_ms(25);
    }
    false
}

/// A user input signed by its submitter.
pub fn signed_input(container: &[u8]) -> (Vec<u8>, SubmittedUserInput) {
    let keypair = generate_keypair();
    let sig = crypto::sign(container, &keypair);
    (
        pubkey_bytes(&keypair.public),
        SubmittedUserInput {
            input_container: container.to_vec(),
            sig,
            protocol: InputProtocol::Bson,
        },
    )
}

/// Commits one synthetic round through a full-history mount and its ledger
/// store, keeping the log index and ledger roots in lockstep.
pub fn commit_fs_round(mount: &CafsMount, ledger: &LedgerStore, seq_no: u64, content: &str) {
    mount.acquire_rw_session().expect("acquire");
    fs::write(
        mount.physical_path(RW_SESSION_NAME, "/state/data"),
        content,
    )
    .expect("write state");
    mount.release_rw_session().expect("release");
    mount.update_hpfs_log_index(seq_no).expect("update index");

    let prev = ledger.get_last_ledger().expect("last");
    let mut record = LedgerRecord {
        seq_no,
        timestamp: seq_no * 1_000,
        prev_ledger_hash: prev.ledger_hash,
        state_hash: mount.get_committed_hash(STATE_DIR_PATH).expect("state"),
        config_hash: mount.get_committed_hash(PATCH_FILE_PATH).expect("patch"),
        ..LedgerRecord::default()
    };
    record.seal();
    ledger
        .append_round(&record, &RoundRawData::default())
        .expect("append");
}

/// Appends an index entry without a matching ledger record, as a crashed
/// or forked node would leave behind.
pub fn fake_index_round(mount: &CafsMount, seq_no: u64, salt: &str) {
    mount.acquire_rw_session().expect("acquire");
    fs::write(mount.physical_path(RW_SESSION_NAME, "/state/data"), salt).expect("write state");
    mount.release_rw_session().expect("release");
    mount.update_hpfs_log_index(seq_no).expect("update index");
}

pub fn empty_hash() -> H32 {
    H32::default()
}
