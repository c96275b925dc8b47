use thiserror::Error;
use web3::types::Address;

use crate::chain::ChainError;
use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Chain endpoint unreachable: {0}")]
    Connectivity(String),
    #[error("Block search failed: {0}")]
    BlockSearch(String),
    #[error("Could not resolve emode for user {user:?}: {source}")]
    ModeResolution {
        user: Address,
        #[source]
        source: ChainError,
    },
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}
