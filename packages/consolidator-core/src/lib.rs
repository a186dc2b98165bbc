pub mod config;
pub mod types;
pub mod registry;
pub mod chain_operator;
pub mod attestation;
pub mod store;
pub mod orchestrator;

pub use config::Config;
pub use registry::{ChainMetadata, ChainRegistry};
pub use types::{
    GroupStatus, NewSignatureGroup, SignatureGroup, TransactionType, TransferLog,
    TransferLogPatch, TransferStatus,
};
pub use orchestrator::Orchestrator;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Contract call error: {0}")]
    ContractCall(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Attestation service error: {0}")]
    AttestationTransient(String),

    #[error("Signature group expired: {0}")]
    Expired(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Signature group not found: {0}")]
    GroupNotFound(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),
}

impl Error {
    /// 可在下一轮轮询中自动恢复的错误
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::RateLimited(_) | Error::AttestationTransient(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub(crate) fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
