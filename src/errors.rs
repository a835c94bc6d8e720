use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("configuration error: {0}")]
    ConfigInvalid(String),
    #[error("config file locked by another instance: {0}")]
    ConfigLocked(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("signature verification failed: {0}")]
    SignatureInvalid(String),
    #[error("peer not in unl: {0}")]
    UnlViolation(String),
    #[error("peer challenge failed: {0}")]
    ChallengeFailed(String),
    #[error("malformed message: {0}")]
    MessageMalformed(String),
    #[error("message too old")]
    MessageTooOld,
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("requested range is empty: {0}")]
    RangeEmpty(String),
    #[error("filesystem helper unavailable: {0}")]
    CafsHelperGone(String),
    #[error("ledger integrity violation: {0}")]
    LedgerIntegrityViolation(String),
    #[error("sync abandoned after {0} request submissions")]
    SyncAbandoned(u32),
    #[error("contract execution failed: {0}")]
    ContractExecFailed(String),
    #[error("shutting down")]
    Shutdown,
}

pub type NodeResult<T> = Result<T, NodeError>;
