pub mod balance_normalizer;
pub mod block_locator;
pub mod chain;
pub mod config;
pub mod emode_resolver;
pub mod error;
pub mod position_collector;
pub mod reserve_configuration;
pub mod reserve_directory;
pub mod snapshot;
pub mod tables;
pub mod treasury_aggregator;
pub mod types;
pub mod utils;

pub use chain::{ChainClient, ChainError, MockChainClient, Web3ChainClient};
pub use config::{CollectionStrategy, Config, Deployment};
pub use error::SnapshotError;
pub use snapshot::{Snapshot, SnapshotRunner};
pub use types::{
    EMode, FailedUser, NormalizedBalance, RawUserPosition, Reserve, ReserveCatalog, Result,
    TreasuryEntry, UserEMode,
};
