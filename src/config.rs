use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::crypto;
use crate::errors::{NodeError, NodeResult};

/// Version stamped into every config file this build writes.
pub const CFG_VERSION: &str = "1.2.0";
/// Oldest config version this build still accepts.
pub const MIN_CFG_VERSION: &str = "1.0.0";

pub const MAX_ROUND_TIME: u32 = 3_600_000;
pub const MAX_STAGE_SLICE: u32 = 33;
pub const MAX_THRESHOLD: u32 = 100;
pub const CONCURRENT_READ_REQUEST_MAX: u64 = 64;

pub const CONFIG_FILE_NAME: &str = "hp.cfg";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Observer,
    Validator,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryMode {
    Full,
    Custom,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    Public,
    Private,
}

/// Peer address as it appears in `mesh.known_peers` ("host:port").
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<PeerAddr> for String {
    fn from(addr: PeerAddr) -> Self {
        addr.to_string()
    }
}

impl FromStr for PeerAddr {
    type Err = NodeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (host, port) = value
            .rsplit_once(':')
            .ok_or_else(|| NodeError::ConfigInvalid(format!("invalid peer address: {value}")))?;
        if host.is_empty() {
            return Err(NodeError::ConfigInvalid(format!(
                "invalid peer address: {value}"
            )));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| NodeError::ConfigInvalid(format!("invalid peer port: {value}")))?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl TryFrom<String> for PeerAddr {
    type Error = NodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeSection {
    pub public_key: String,
    pub private_key: String,
    pub role: Role,
    pub history: HistoryMode,
    pub history_config: HistoryConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryConfig {
    pub max_primary_shards: u64,
    pub max_raw_shards: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContractLogConfig {
    pub enable: bool,
    pub max_mbytes_per_file: u64,
    pub max_file_count: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConsensusConfig {
    pub mode: AccessMode,
    pub roundtime: u32,
    pub stage_slice: u32,
    pub threshold: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NplConfig {
    pub mode: AccessMode,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoundLimits {
    pub user_input_bytes: u64,
    pub user_output_bytes: u64,
    pub npl_output_bytes: u64,
    pub proc_cpu_seconds: u64,
    pub proc_mem_bytes: u64,
    pub proc_ofd_count: u64,
    pub exec_timeout: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContractSection {
    pub id: String,
    pub execute: bool,
    pub run_as: String,
    pub log: ContractLogConfig,
    pub version: String,
    pub unl: BTreeSet<String>,
    pub bin_path: String,
    pub bin_args: String,
    pub environment: BTreeMap<String, String>,
    pub max_input_ledger_offset: u16,
    pub consensus: ConsensusConfig,
    pub npl: NplConfig,
    pub round_limits: RoundLimits,
}

impl ContractSection {
    /// Binary UNL keys decoded from the configured hex list.
    pub fn unl_bin(&self) -> NodeResult<BTreeSet<Vec<u8>>> {
        let mut out = BTreeSet::new();
        for key in &self.unl {
            let bin = hex::decode(key)
                .map_err(|err| NodeError::ConfigInvalid(format!("invalid unl entry: {err}")))?;
            if bin.len() != crypto::PUBKEY_LEN {
                return Err(NodeError::ConfigInvalid("invalid unl entry length".into()));
            }
            out.insert(bin);
        }
        Ok(out)
    }

    /// `run_as` parsed as `uid:gid`, empty meaning "stay as the launching user".
    pub fn run_as_ids(&self) -> NodeResult<Option<(u32, u32)>> {
        if self.run_as.is_empty() {
            return Ok(None);
        }
        let (uid, gid) = self.run_as.split_once(':').ok_or_else(|| {
            NodeError::ConfigInvalid("invalid run_as format (\"uid:gid\" expected)".into())
        })?;
        let uid = uid.parse::<u32>().map_err(|_| {
            NodeError::ConfigInvalid("invalid run_as format (\"uid:gid\" expected)".into())
        })?;
        let gid = gid.parse::<u32>().map_err(|_| {
            NodeError::ConfigInvalid("invalid run_as format (\"uid:gid\" expected)".into())
        })?;
        Ok(Some((uid, gid)))
    }

    /// Argv for the contract process: bin_path followed by split bin_args.
    pub fn exec_args(&self) -> Vec<String> {
        let mut args = vec![self.bin_path.clone()];
        args.extend(
            self.bin_args
                .split_whitespace()
                .map(|arg| arg.to_string()),
        );
        args
    }
}

/// The patch file is the mutable subset of the contract section that lives
/// inside the contract filesystem and is itself subject to consensus.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PatchConfig {
    pub version: String,
    pub unl: BTreeSet<String>,
    pub bin_path: String,
    pub bin_args: String,
    pub environment: BTreeMap<String, String>,
    pub max_input_ledger_offset: u16,
    pub consensus: ConsensusConfig,
    pub npl: NplConfig,
    pub round_limits: RoundLimits,
}

impl PatchConfig {
    pub fn from_contract(contract: &ContractSection) -> Self {
        Self {
            version: contract.version.clone(),
            unl: contract.unl.clone(),
            bin_path: contract.bin_path.clone(),
            bin_args: contract.bin_args.clone(),
            environment: contract.environment.clone(),
            max_input_ledger_offset: contract.max_input_ledger_offset,
            consensus: contract.consensus.clone(),
            npl: contract.npl.clone(),
            round_limits: contract.round_limits.clone(),
        }
    }

    pub fn apply_to(&self, contract: &mut ContractSection) {
        contract.version = self.version.clone();
        contract.unl = self.unl.clone();
        contract.bin_path = self.bin_path.clone();
        contract.bin_args = self.bin_args.clone();
        contract.environment = self.environment.clone();
        contract.max_input_ledger_offset = self.max_input_ledger_offset;
        contract.consensus = self.consensus.clone();
        contract.npl = self.npl.clone();
        contract.round_limits = self.round_limits.clone();
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerDiscoveryConfig {
    pub enabled: bool,
    pub interval: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MeshSection {
    pub port: u16,
    pub listen: bool,
    pub idle_timeout: u32,
    pub known_peers: BTreeSet<PeerAddr>,
    pub msg_forwarding: bool,
    pub max_connections: u16,
    pub max_known_connections: u16,
    pub max_in_connections_per_host: u16,
    pub max_bytes_per_msg: u64,
    pub max_bytes_per_min: u64,
    pub max_bad_msgs_per_min: u64,
    pub max_bad_msgsigs_per_min: u64,
    pub max_dup_msgs_per_min: u64,
    pub peer_discovery: PeerDiscoveryConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserSection {
    pub port: u16,
    pub listen: bool,
    pub idle_timeout: u32,
    pub max_bytes_per_msg: u64,
    pub max_bytes_per_min: u64,
    pub max_bad_msgs_per_min: u64,
    pub max_connections: u64,
    pub max_in_connections_per_host: u64,
    pub concurrent_read_requests: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HpfsSection {
    pub external: bool,
    pub log: HpfsLogSection,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HpfsLogSection {
    pub log_level: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogSection {
    pub log_level: String,
    pub max_mbytes_per_file: u64,
    pub max_file_count: u64,
    pub loggers: BTreeSet<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HpConfig {
    pub hp_version: String,
    pub node: NodeSection,
    pub contract: ContractSection,
    pub mesh: MeshSection,
    pub user: UserSection,
    pub hpfs: HpfsSection,
    pub log: LogSection,
}

impl HpConfig {
    /// Default settings written by `new`, with the freshly generated node
    /// key as the only UNL member.
    pub fn default_with_keys(public_key_hex: String, private_key_hex: String) -> Self {
        let mut unl = BTreeSet::new();
        unl.insert(public_key_hex.clone());
        Self {
            hp_version: CFG_VERSION.to_string(),
            node: NodeSection {
                public_key: public_key_hex,
                private_key: private_key_hex,
                role: Role::Validator,
                history: HistoryMode::Custom,
                history_config: HistoryConfig {
                    max_primary_shards: 1,
                    max_raw_shards: 0,
                },
            },
            contract: ContractSection {
                id: crypto::generate_contract_id(),
                execute: true,
                run_as: String::new(),
                log: ContractLogConfig {
                    enable: false,
                    max_mbytes_per_file: 5,
                    max_file_count: 10,
                },
                version: "1.0".to_string(),
                unl,
                bin_path: "<your contract binary here>".to_string(),
                bin_args: String::new(),
                environment: BTreeMap::new(),
                max_input_ledger_offset: 10,
                consensus: ConsensusConfig {
                    mode: AccessMode::Private,
                    roundtime: 1_000,
                    stage_slice: 25,
                    threshold: 80,
                },
                npl: NplConfig {
                    mode: AccessMode::Private,
                },
                round_limits: RoundLimits {
                    user_input_bytes: 0,
                    user_output_bytes: 0,
                    npl_output_bytes: 0,
                    proc_cpu_seconds: 0,
                    proc_mem_bytes: 0,
                    proc_ofd_count: 0,
                    exec_timeout: 0,
                },
            },
            mesh: MeshSection {
                port: 22_860,
                listen: true,
                idle_timeout: 120_000,
                known_peers: BTreeSet::new(),
                msg_forwarding: true,
                max_connections: 0,
                max_known_connections: 0,
                max_in_connections_per_host: 0,
                max_bytes_per_msg: 0,
                max_bytes_per_min: 0,
                max_bad_msgs_per_min: 0,
                max_bad_msgsigs_per_min: 0,
                max_dup_msgs_per_min: 0,
                peer_discovery: PeerDiscoveryConfig {
                    enabled: true,
                    interval: 30_000,
                },
            },
            user: UserSection {
                port: 8_080,
                listen: true,
                idle_timeout: 0,
                max_bytes_per_msg: 0,
                max_bytes_per_min: 0,
                max_bad_msgs_per_min: 0,
                max_connections: 0,
                max_in_connections_per_host: 0,
                concurrent_read_requests: 4,
            },
            hpfs: HpfsSection {
                external: false,
                log: HpfsLogSection {
                    log_level: "wrn".to_string(),
                },
            },
            log: LogSection {
                log_level: "inf".to_string(),
                max_mbytes_per_file: 5,
                max_file_count: 10,
                loggers: ["console".to_string(), "file".to_string()]
                    .into_iter()
                    .collect(),
            },
        }
    }

    pub fn load(path: &Path) -> NodeResult<Self> {
        let content = fs::read_to_string(path)?;
        let cfg: HpConfig = serde_json::from_str(&content)
            .map_err(|err| NodeError::ConfigInvalid(format!("unable to parse config: {err}")))?;
        if version_compare(&cfg.hp_version, MIN_CFG_VERSION)? < 0 {
            return Err(NodeError::ConfigInvalid(format!(
                "config version too old, minimum {MIN_CFG_VERSION} required, {} found",
                cfg.hp_version
            )));
        }
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> NodeResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let encoded = serde_json::to_string_pretty(self)
            .map_err(|err| NodeError::ConfigInvalid(format!("unable to encode config: {err}")))?;
        fs::write(path, encoded)?;
        Ok(())
    }

    pub fn validate(&self) -> NodeResult<()> {
        if self.node.public_key.is_empty() || self.node.private_key.is_empty() {
            return Err(NodeError::ConfigInvalid(
                "signing keys missing, run 'rekey' to generate new keys".into(),
            ));
        }
        let consensus = &self.contract.consensus;
        if consensus.roundtime < 1 || consensus.roundtime > MAX_ROUND_TIME {
            return Err(NodeError::ConfigInvalid(format!(
                "roundtime must be between 1 and {MAX_ROUND_TIME} ms inclusive"
            )));
        }
        if consensus.stage_slice < 1 || consensus.stage_slice > MAX_STAGE_SLICE {
            return Err(NodeError::ConfigInvalid(format!(
                "stage_slice must be between 1 and {MAX_STAGE_SLICE} percent inclusive"
            )));
        }
        if consensus.threshold < 1 || consensus.threshold > MAX_THRESHOLD {
            return Err(NodeError::ConfigInvalid(format!(
                "threshold must be between 1 and {MAX_THRESHOLD} percent inclusive"
            )));
        }
        if self.contract.unl.is_empty() {
            return Err(NodeError::ConfigInvalid("unl cannot be empty".into()));
        }
        if self.contract.id.is_empty() {
            return Err(NodeError::ConfigInvalid("contract id not specified".into()));
        }
        if self.node.history == HistoryMode::Custom
            && self.node.history_config.max_primary_shards == 0
        {
            return Err(NodeError::ConfigInvalid(
                "max_primary_shards cannot be zero in history=custom mode".into(),
            ));
        }
        if self.mesh.port == 0 {
            return Err(NodeError::ConfigInvalid("invalid mesh port".into()));
        }
        if self.user.port == 0 {
            return Err(NodeError::ConfigInvalid("invalid user port".into()));
        }
        if self.mesh.max_connections > 0
            && (self.mesh.max_known_connections == 0
                || self.mesh.max_known_connections > self.mesh.max_connections)
        {
            return Err(NodeError::ConfigInvalid(
                "mesh max_known_connections must not exceed mesh max_connections".into(),
            ));
        }
        if self.user.concurrent_read_requests > CONCURRENT_READ_REQUEST_MAX {
            return Err(NodeError::ConfigInvalid(format!(
                "user concurrent_read_requests cannot exceed {CONCURRENT_READ_REQUEST_MAX}"
            )));
        }
        for level in [&self.log.log_level, &self.hpfs.log.log_level] {
            if !matches!(level.as_str(), "dbg" | "inf" | "wrn" | "err") {
                return Err(NodeError::ConfigInvalid(
                    "invalid log level, valid values: dbg|inf|wrn|err".into(),
                ));
            }
        }
        if self.log.loggers.is_empty() {
            return Err(NodeError::ConfigInvalid("loggers cannot be empty".into()));
        }
        for logger in &self.log.loggers {
            if !matches!(logger.as_str(), "console" | "file") {
                return Err(NodeError::ConfigInvalid(
                    "invalid logger, valid values: console|file".into(),
                ));
            }
        }
        let _ = self.contract.run_as_ids()?;

        // Sign and verify a probe message so a mismatched keypair is caught
        // before the node joins consensus.
        let keypair = self.node_keypair()?;
        let pubkey = self.node_pubkey_bin()?;
        let sig = crypto::sign(b"crucible", &keypair);
        crypto::verify(b"crucible", &sig, &pubkey)
            .map_err(|_| NodeError::ConfigInvalid("signing key pair mismatch".into()))?;
        Ok(())
    }

    pub fn node_pubkey_bin(&self) -> NodeResult<Vec<u8>> {
        let bin = hex::decode(&self.node.public_key)
            .map_err(|err| NodeError::ConfigInvalid(format!("invalid public key hex: {err}")))?;
        if bin.len() != crypto::PUBKEY_LEN {
            return Err(NodeError::ConfigInvalid("invalid public key length".into()));
        }
        Ok(bin)
    }

    pub fn node_keypair(&self) -> NodeResult<ed25519_dalek::Keypair> {
        let private = hex::decode(&self.node.private_key)
            .map_err(|err| NodeError::ConfigInvalid(format!("invalid private key hex: {err}")))?;
        crypto::keypair_from_bin(&private, &self.node_pubkey_bin()?)
    }

    pub fn tracing_filter(&self) -> &'static str {
        match self.log.log_level.as_str() {
            "dbg" => "debug",
            "wrn" => "warn",
            "err" => "error",
            _ => "info",
        }
    }
}

/// Compares two dotted version strings. Returns -1, 0 or 1.
pub fn version_compare(left: &str, right: &str) -> NodeResult<i32> {
    let parse = |value: &str| -> NodeResult<Vec<u64>> {
        value
            .split('.')
            .map(|part| {
                part.parse::<u64>()
                    .map_err(|_| NodeError::ConfigInvalid(format!("malformed version: {value}")))
            })
            .collect()
    };
    let left = parse(left)?;
    let right = parse(right)?;
    for i in 0..left.len().max(right.len()) {
        let l = left.get(i).copied().unwrap_or(0);
        let r = right.get(i).copied().unwrap_or(0);
        if l != r {
            return Ok(if l < r { -1 } else { 1 });
        }
    }
    Ok(0)
}

/// Filesystem layout of a contract directory. Populated once from the CLI
/// base-dir argument and passed by reference everywhere.
#[derive(Clone, Debug)]
pub struct ContractCtx {
    pub contract_dir: PathBuf,
    pub config_dir: PathBuf,
    pub config_file: PathBuf,
    pub tls_key_file: PathBuf,
    pub tls_cert_file: PathBuf,
    pub contract_fs_dir: PathBuf,
    pub ledger_fs_dir: PathBuf,
    pub log_dir: PathBuf,
    pub contract_log_dir: PathBuf,
}

impl ContractCtx {
    pub fn new(base_dir: &Path) -> Self {
        let contract_dir = base_dir.to_path_buf();
        let config_dir = contract_dir.join("cfg");
        Self {
            config_file: config_dir.join(CONFIG_FILE_NAME),
            tls_key_file: config_dir.join("tlskey.pem"),
            tls_cert_file: config_dir.join("tlscert.pem"),
            contract_fs_dir: contract_dir.join("contract_fs"),
            ledger_fs_dir: contract_dir.join("ledger_fs"),
            log_dir: contract_dir.join("log"),
            contract_log_dir: contract_dir.join("log").join("contract"),
            config_dir,
            contract_dir,
        }
    }

    pub fn validate_layout(&self) -> NodeResult<()> {
        for path in [
            &self.contract_dir,
            &self.config_file,
            &self.contract_fs_dir,
            &self.ledger_fs_dir,
        ] {
            if !path.exists() {
                return Err(NodeError::ConfigInvalid(format!(
                    "{} does not exist",
                    path.display()
                )));
            }
        }
        for path in [&self.tls_key_file, &self.tls_cert_file] {
            if !path.exists() {
                return Err(NodeError::ConfigInvalid(format!(
                    "{} does not exist, provide self-signed certificates under {}",
                    path.display(),
                    self.config_dir.display()
                )));
            }
        }
        Ok(())
    }
}

/// Exclusive advisory lock on the config file, held for the process
/// lifetime. A second instance on the same contract directory fails fast.
pub struct ConfigLock {
    file: File,
}

impl ConfigLock {
    pub fn acquire(config_file: &Path) -> NodeResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(config_file)?;
        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if ret != 0 {
            return Err(NodeError::ConfigLocked(format!(
                "another instance is already running against {}",
                config_file.display()
            )));
        }
        Ok(Self { file })
    }
}

impl Drop for ConfigLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

/// Writes the in-memory `known_peers` delta back into the persisted config.
/// Everything else is read-only after startup or mediated through the patch
/// file, so this re-reads the file and only touches the peer list.
pub fn persist_known_peers(config_file: &Path, known_peers: &BTreeSet<PeerAddr>) -> NodeResult<()> {
    let mut on_disk = HpConfig::load(config_file)?;
    if known_peers.is_empty() || on_disk.mesh.known_peers == *known_peers {
        return Ok(());
    }
    on_disk.mesh.known_peers = known_peers.clone();
    on_disk.save(config_file)
}
