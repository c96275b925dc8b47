//! Read-only access to lending-protocol contract state at a fixed block.

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use web3::types::{Address, U256};

pub mod mock;
pub mod web3_client;

pub use mock::MockChainClient;
pub use web3_client::Web3ChainClient;

/// Raw `getReserveData` fields the snapshot keeps.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReserveRecord {
    /// Packed configuration word, see [`crate::reserve_configuration`].
    pub configuration: U256,
    pub liquidity_index: U256,
    pub liquidity_rate: U256,
    pub variable_borrow_index: U256,
    pub variable_borrow_rate: U256,
    pub last_update_timestamp: u64,
    pub a_token_address: Address,
    pub variable_debt_token_address: Address,
    pub interest_rate_strategy_address: Address,
    pub accrued_to_treasury: U256,
}

/// One entry of the UI data provider's `getUserReservesData`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserReserveBalance {
    pub underlying_asset: Address,
    pub scaled_a_token_balance: U256,
    pub usage_as_collateral_enabled: bool,
    pub scaled_variable_debt: U256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RiskModeConfig {
    pub ltv: u16,
    pub liquidation_threshold: u16,
    pub liquidation_bonus: u16,
}

/// Contract reads used by the snapshot stages.
///
/// Every call is a stateless read at `block`, so implementations are shared
/// across concurrent workers.
#[async_trait]
pub trait ChainClient: Send + Sync + fmt::Debug {
    async fn latest_block(&self) -> Result<u64, ChainError>;

    async fn block_timestamp(&self, block: u64) -> Result<u64, ChainError>;

    async fn list_reserves(&self, block: u64) -> Result<Vec<Address>, ChainError>;

    async fn get_reserve_record(
        &self,
        reserve: Address,
        block: u64,
    ) -> Result<ReserveRecord, ChainError>;

    /// All reserves of `user` in one call, through the UI data provider.
    ///
    /// `addresses_provider` identifies the market.
    async fn get_user_reserve_balances(
        &self,
        addresses_provider: Address,
        user: Address,
        block: u64,
    ) -> Result<Vec<UserReserveBalance>, ChainError>;

    async fn get_user_risk_mode(&self, user: Address, block: u64) -> Result<u8, ChainError>;

    async fn get_risk_mode_config(
        &self,
        mode_id: u8,
        block: u64,
    ) -> Result<RiskModeConfig, ChainError>;

    async fn get_risk_mode_label(&self, mode_id: u8, block: u64) -> Result<String, ChainError>;

    async fn token_balance_of(
        &self,
        token: Address,
        holder: Address,
        block: u64,
    ) -> Result<U256, ChainError>;

    async fn token_scaled_balance_of(
        &self,
        token: Address,
        user: Address,
        block: u64,
    ) -> Result<U256, ChainError>;

    async fn token_scaled_total_supply(&self, token: Address, block: u64)
        -> Result<U256, ChainError>;

    async fn token_symbol(&self, token: Address, block: u64) -> Result<String, ChainError>;

    async fn token_name(&self, token: Address, block: u64) -> Result<String, ChainError>;

    /// Prices in oracle base-currency units, in the order of `assets`.
    async fn get_asset_prices(
        &self,
        oracle: Address,
        assets: &[Address],
        block: u64,
    ) -> Result<Vec<U256>, ChainError>;

    async fn get_base_currency_unit(&self, oracle: Address, block: u64)
        -> Result<U256, ChainError>;

    async fn get_price_oracle_address(&self, block: u64) -> Result<Address, ChainError>;
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("RPC transport error: {0}")]
    Transport(String),
    #[error("ABI error: {0}")]
    Abi(#[from] ethabi::Error),
    #[error("Unexpected call output: {0}")]
    Decode(String),
    #[error("RPC call timed out")]
    Timeout,
    #[error("Block {0} not found")]
    MissingBlock(u64),
    #[error("{0}")]
    Other(String),
}

impl From<web3::Error> for ChainError {
    fn from(err: web3::Error) -> Self {
        ChainError::Transport(err.to_string())
    }
}
