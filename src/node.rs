use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{info, warn};

use crate::cafs::log_sync::HpfsLogSync;
use crate::cafs::mount::{CafsMount, MountKind};
use crate::cafs::sync::CafsSync;
use crate::cafs::{PATCH_FILE_PATH, STATE_DIR_PATH};
use crate::config::{ConfigLock, ContractCtx, HistoryMode, HpConfig, PatchConfig};
use crate::consensus::ConsensusEngine;
use crate::errors::{NodeError, NodeResult};
use crate::ledger::store::LedgerStore;
use crate::p2p::server::PeerNetwork;
use crate::p2p::CollectedMsgs;
use crate::unl::UnlRegistry;
use crate::usr::UserServer;
use crate::util::sleep_ms;

static SIGINT_RECEIVED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigint(_: libc::c_int) {
    SIGINT_RECEIVED.store(true, Ordering::Relaxed);
}

/// A fully wired node. Construction follows the startup order config →
/// mounts → ledger → unl → listeners → sync workers → engine; teardown
/// reverses it and persists the known-peer delta.
pub struct Node {
    ctx: ContractCtx,
    engine: Arc<ConsensusEngine>,
    network: PeerNetwork,
    shutdown: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
    _config_lock: ConfigLock,
}

impl Node {
    pub fn init(base_dir: &Path) -> NodeResult<Self> {
        let ctx = ContractCtx::new(base_dir);
        ctx.validate_layout()?;
        let config_lock = ConfigLock::acquire(&ctx.config_file)?;
        let config = HpConfig::load(&ctx.config_file)?;
        config.validate()?;
        let keypair = config.node_keypair()?;
        let is_full_history = config.node.history == HistoryMode::Full;

        seed_contract_fs(&ctx, &config)?;

        let contract_fs = Arc::new(CafsMount::init(
            1,
            MountKind::Contract,
            &ctx.contract_fs_dir,
            &ctx.contract_fs_dir.join("mnt"),
            is_full_history,
        )?);
        let ledger_fs = Arc::new(CafsMount::init(
            2,
            MountKind::Ledger,
            &ctx.ledger_fs_dir,
            &ctx.ledger_fs_dir.join("mnt"),
            false,
        )?);

        let raw_enabled = is_full_history || config.node.history_config.max_raw_shards > 0;
        let (max_primary, max_raw) = if is_full_history {
            (0, 0)
        } else {
            (
                config.node.history_config.max_primary_shards,
                config.node.history_config.max_raw_shards,
            )
        };
        let ledger = Arc::new(LedgerStore::open(
            ledger_fs.physical_path("", crate::ledger::PRIMARY_DIR),
            raw_enabled.then(|| ledger_fs.physical_path("", crate::ledger::RAW_DIR)),
            false,
            max_primary,
            max_raw,
            config.hp_version.clone(),
        )?);

        let unl = Arc::new(UnlRegistry::new(
            config.contract.unl_bin()?,
            config.contract.consensus.threshold,
        ));
        if !unl.exists(&config.node_pubkey_bin()?) {
            warn!("node key is not part of its own unl");
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let collected = Arc::new(CollectedMsgs::default());
        let effective_roundtime = Arc::new(AtomicU32::new(config.contract.consensus.roundtime));

        let network = PeerNetwork::start(
            &config,
            config.node_keypair()?,
            unl.clone(),
            collected.clone(),
            shutdown.clone(),
        )?;

        let users = UserServer::start(
            config.user.port,
            config.user.listen,
            config.user.max_bytes_per_msg,
            config.user.concurrent_read_requests,
            &ctx.tls_key_file,
            &ctx.tls_cert_file,
            ledger.clone(),
            shutdown.clone(),
        )?;

        let contract_sync = CafsSync::new(
            contract_fs.clone(),
            network.clone(),
            collected.clone(),
            shutdown.clone(),
            effective_roundtime.clone(),
        );
        let mut workers = vec![contract_sync.spawn()];

        let log_sync = if is_full_history {
            let sync = HpfsLogSync::new(
                contract_fs.clone(),
                ledger.clone(),
                network.clone(),
                collected.clone(),
                shutdown.clone(),
                effective_roundtime.clone(),
            );
            workers.push(sync.spawn());
            Some(sync)
        } else {
            None
        };

        for vpath in [STATE_DIR_PATH, PATCH_FILE_PATH] {
            contract_fs.set_parent_hash(vpath, contract_fs.get_committed_hash(vpath)?);
        }

        let engine = Arc::new(ConsensusEngine::new(
            ctx.clone(),
            config,
            keypair,
            contract_fs,
            ledger_fs,
            ledger,
            unl,
            network.clone(),
            collected,
            users,
            contract_sync,
            log_sync,
            effective_roundtime,
            shutdown.clone(),
        )?);

        Ok(Self {
            ctx,
            engine,
            network,
            shutdown,
            workers,
            _config_lock: config_lock,
        })
    }

    /// Blocks until SIGINT, then performs cooperative teardown.
    pub fn run(mut self) -> NodeResult<()> {
        unsafe {
            libc::signal(libc::SIGINT, handle_sigint as libc::sighandler_t);
            libc::signal(libc::SIGTERM, handle_sigint as libc::sighandler_t);
        }

        let engine = self.engine.clone();
        let engine_worker = std::thread::spawn(move || engine.run());

        while !SIGINT_RECEIVED.load(Ordering::Relaxed) {
            sleep_ms(100);
        }
        info!("shutdown signal received");
        self.shutdown.store(true, Ordering::Relaxed);

        if engine_worker.join().is_err() {
            warn!("consensus worker exited abnormally");
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("sync worker exited abnormally");
            }
        }

        // Only the learned peer list may flow back into the config file.
        if let Err(err) = crate::config::persist_known_peers(
            &self.ctx.config_file,
            &self.network.known_peers_snapshot(),
        ) {
            warn!(%err, "persisting known peers failed");
        }
        info!("node stopped");
        Ok(())
    }
}

/// Makes sure the contract seed tree carries the state directory and the
/// patch overlay before the first mount.
fn seed_contract_fs(ctx: &ContractCtx, config: &HpConfig) -> NodeResult<()> {
    let seed = ctx.contract_fs_dir.join("seed");
    fs::create_dir_all(seed.join("state"))?;
    let patch_file = seed.join("patch.cfg");
    if !patch_file.exists() {
        let patch = PatchConfig::from_contract(&config.contract);
        let encoded = serde_json::to_string_pretty(&patch)
            .map_err(|err| NodeError::ConfigInvalid(format!("unable to encode patch: {err}")))?;
        fs::write(patch_file, encoded)?;
    }
    let ledger_seed = ctx.ledger_fs_dir.join("seed");
    fs::create_dir_all(ledger_seed.join("primary"))?;
    fs::create_dir_all(ledger_seed.join("raw"))?;
    Ok(())
}

/// Creates a fresh contract directory: layout, signing keys, default
/// config, seed patch file and a best-effort self-signed TLS certificate.
pub fn create_contract(base_dir: &Path) -> NodeResult<()> {
    if base_dir.exists() {
        return Err(NodeError::ConfigInvalid(format!(
            "contract dir {} already exists",
            base_dir.display()
        )));
    }
    let ctx = ContractCtx::new(base_dir);
    fs::create_dir_all(&ctx.config_dir)?;
    fs::create_dir_all(&ctx.contract_log_dir)?;
    fs::create_dir_all(ctx.contract_fs_dir.join("seed/state"))?;
    fs::create_dir_all(ctx.contract_fs_dir.join("mnt"))?;
    fs::create_dir_all(ctx.ledger_fs_dir.join("seed/primary"))?;
    fs::create_dir_all(ctx.ledger_fs_dir.join("seed/raw"))?;
    fs::create_dir_all(ctx.ledger_fs_dir.join("mnt"))?;

    let keypair = crate::crypto::generate_keypair();
    let public_hex = hex::encode(crate::crypto::pubkey_bytes(&keypair.public));
    let private_hex = hex::encode(keypair.secret.to_bytes());
    let config = HpConfig::default_with_keys(public_hex.clone(), private_hex);
    config.save(&ctx.config_file)?;
    seed_contract_fs(&ctx, &config)?;

    // Best-effort TLS material; the node refuses to start without it, but
    // the operator can also provide certificates by hand.
    let openssl = std::process::Command::new("openssl")
        .args([
            "req", "-newkey", "rsa:2048", "-new", "-nodes", "-x509", "-days", "365",
        ])
        .arg("-keyout")
        .arg(&ctx.tls_key_file)
        .arg("-out")
        .arg(&ctx.tls_cert_file)
        .arg("-subj")
        .arg(format!("/C=CR/ST=CR/L=CR/O=CR/CN={public_hex}.crucible.contract"))
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status();
    match openssl {
        Ok(status) if status.success() => {}
        _ => eprintln!(
            "warning: tls certificate generation failed; place tlskey.pem and tlscert.pem under {}",
            ctx.config_dir.display()
        ),
    }

    println!("contract directory created at {}", ctx.contract_dir.display());
    Ok(())
}

/// Generates a new signing keypair and swaps the node's identity inside
/// its own UNL entry.
pub fn rekey(base_dir: &Path) -> NodeResult<()> {
    let ctx = ContractCtx::new(base_dir);
    let _lock = ConfigLock::acquire(&ctx.config_file)?;
    let mut config = HpConfig::load(&ctx.config_file)?;

    let old_public = config.node.public_key.clone();
    let keypair = crate::crypto::generate_keypair();
    config.node.public_key = hex::encode(crate::crypto::pubkey_bytes(&keypair.public));
    config.node.private_key = hex::encode(keypair.secret.to_bytes());

    if !config.contract.unl.remove(&old_public) {
        return Err(NodeError::ConfigInvalid(
            "current public key is not part of the unl".into(),
        ));
    }
    config.contract.unl.insert(config.node.public_key.clone());
    config.save(&ctx.config_file)?;
    println!("new signing keys generated at {}", ctx.config_file.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_contract_lays_out_the_directory() {
        let dir = tempdir().expect("tempdir");
        let base = dir.path().join("contract");
        create_contract(&base).expect("create");
        let ctx = ContractCtx::new(&base);
        assert!(ctx.config_file.exists());
        assert!(ctx.contract_fs_dir.join("seed/state").is_dir());
        assert!(ctx.contract_fs_dir.join("seed/patch.cfg").exists());
        assert!(ctx.ledger_fs_dir.join("seed/primary").is_dir());

        let config = HpConfig::load(&ctx.config_file).expect("load");
        config.validate().expect("valid");
        assert!(config.contract.unl.contains(&config.node.public_key));

        assert!(create_contract(&base).is_err());
    }

    #[test]
    fn rekey_replaces_self_in_unl() {
        let dir = tempdir().expect("tempdir");
        let base = dir.path().join("contract");
        create_contract(&base).expect("create");
        let ctx = ContractCtx::new(&base);
        let before = HpConfig::load(&ctx.config_file).expect("load");

        rekey(&base).expect("rekey");
        let after = HpConfig::load(&ctx.config_file).expect("load");
        assert_ne!(before.node.public_key, after.node.public_key);
        assert!(after.contract.unl.contains(&after.node.public_key));
        assert!(!after.contract.unl.contains(&before.node.public_key));
        assert_eq!(after.contract.unl.len(), before.contract.unl.len());
        after.validate().expect("valid after rekey");
    }
}
