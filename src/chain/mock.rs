//! In-memory chain client for tests and dry runs.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use web3::types::{Address, U256};

use super::{ChainClient, ChainError, ReserveRecord, RiskModeConfig, UserReserveBalance};

/// Chain state served from maps. Balances that were never set read as zero,
/// the way an ERC-20 reports accounts it has never seen.
#[derive(Debug, Default)]
pub struct MockChainClient {
    block_timestamps: Vec<u64>,
    reserves: Vec<Address>,
    records: HashMap<Address, ReserveRecord>,
    balances: HashMap<(Address, Address), U256>,
    scaled_balances: HashMap<(Address, Address), U256>,
    scaled_total_supplies: HashMap<Address, U256>,
    symbols: HashMap<Address, String>,
    names: HashMap<Address, String>,
    oracle: Address,
    prices: HashMap<Address, U256>,
    base_currency_unit: U256,
    user_reserves: HashMap<Address, Vec<UserReserveBalance>>,
    user_modes: HashMap<Address, u8>,
    modes: HashMap<u8, (RiskModeConfig, String)>,
    failing_users: HashSet<Address>,
    slow_users: HashMap<Address, Duration>,
    panicking_users: HashSet<Address>,
    price_count: Option<usize>,
    balance_queries: Mutex<Vec<(Address, Address)>>,
}

impl MockChainClient {
    pub fn new() -> Self {
        Self {
            oracle: Address::from_low_u64_be(0x0AC1E),
            base_currency_unit: U256::exp10(8),
            ..Default::default()
        }
    }

    /// Timestamps indexed by block number, starting at block 0.
    pub fn with_block_timestamps(mut self, timestamps: Vec<u64>) -> Self {
        self.block_timestamps = timestamps;
        self
    }

    /// Registers a reserve with its record and a price in base-currency units.
    pub fn with_reserve(mut self, underlying: Address, record: ReserveRecord, price: U256) -> Self {
        self.reserves.push(underlying);
        self.records.insert(underlying, record);
        self.prices.insert(underlying, price);
        self
    }

    pub fn with_symbol(mut self, token: Address, symbol: &str) -> Self {
        self.symbols.insert(token, symbol.to_string());
        self
    }

    pub fn with_name(mut self, token: Address, name: &str) -> Self {
        self.names.insert(token, name.to_string());
        self
    }

    pub fn with_base_currency_unit(mut self, unit: U256) -> Self {
        self.base_currency_unit = unit;
        self
    }

    pub fn with_balance(mut self, token: Address, holder: Address, amount: U256) -> Self {
        self.balances.insert((token, holder), amount);
        self
    }

    pub fn with_scaled_balance(mut self, token: Address, user: Address, amount: U256) -> Self {
        self.scaled_balances.insert((token, user), amount);
        self
    }

    pub fn with_scaled_total_supply(mut self, token: Address, amount: U256) -> Self {
        self.scaled_total_supplies.insert(token, amount);
        self
    }

    pub fn with_user_reserves(mut self, user: Address, reserves: Vec<UserReserveBalance>) -> Self {
        self.user_reserves.insert(user, reserves);
        self
    }

    pub fn with_user_mode(mut self, user: Address, mode_id: u8) -> Self {
        self.user_modes.insert(user, mode_id);
        self
    }

    pub fn with_mode(mut self, mode_id: u8, config: RiskModeConfig, label: &str) -> Self {
        self.modes.insert(mode_id, (config, label.to_string()));
        self
    }

    /// Every per-user read for `user` fails.
    pub fn with_failing_user(mut self, user: Address) -> Self {
        self.failing_users.insert(user);
        self
    }

    /// Every per-user read for `user` sleeps for `delay` first.
    pub fn with_slow_user(mut self, user: Address, delay: Duration) -> Self {
        self.slow_users.insert(user, delay);
        self
    }

    /// Every per-user read for `user` panics.
    pub fn with_panicking_user(mut self, user: Address) -> Self {
        self.panicking_users.insert(user);
        self
    }

    /// The oracle answers with only the first `count` prices.
    pub fn with_price_count(mut self, count: usize) -> Self {
        self.price_count = Some(count);
        self
    }

    /// `(token, holder)` pairs passed to `token_balance_of`, in call order.
    pub fn balance_queries(&self) -> Vec<(Address, Address)> {
        self.balance_queries
            .lock()
            .map(|queries| queries.clone())
            .unwrap_or_default()
    }

    async fn check_user(&self, user: Address) -> Result<(), ChainError> {
        if self.panicking_users.contains(&user) {
            panic!("mock read panicked for {:?}", user);
        }
        if let Some(delay) = self.slow_users.get(&user) {
            tokio::time::sleep(*delay).await;
        }
        if self.failing_users.contains(&user) {
            return Err(ChainError::Transport(format!(
                "execution reverted for {:?}",
                user
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn latest_block(&self) -> Result<u64, ChainError> {
        match self.block_timestamps.len() {
            0 => Err(ChainError::Other("no blocks configured".to_string())),
            len => Ok(len as u64 - 1),
        }
    }

    async fn block_timestamp(&self, block: u64) -> Result<u64, ChainError> {
        usize::try_from(block)
            .ok()
            .and_then(|idx| self.block_timestamps.get(idx))
            .copied()
            .ok_or(ChainError::MissingBlock(block))
    }

    async fn list_reserves(&self, _block: u64) -> Result<Vec<Address>, ChainError> {
        Ok(self.reserves.clone())
    }

    async fn get_reserve_record(
        &self,
        reserve: Address,
        _block: u64,
    ) -> Result<ReserveRecord, ChainError> {
        self.records
            .get(&reserve)
            .cloned()
            .ok_or_else(|| ChainError::Other(format!("unknown reserve {:?}", reserve)))
    }

    async fn get_user_reserve_balances(
        &self,
        _addresses_provider: Address,
        user: Address,
        _block: u64,
    ) -> Result<Vec<UserReserveBalance>, ChainError> {
        self.check_user(user).await?;
        Ok(self.user_reserves.get(&user).cloned().unwrap_or_default())
    }

    async fn get_user_risk_mode(&self, user: Address, _block: u64) -> Result<u8, ChainError> {
        self.check_user(user).await?;
        Ok(self.user_modes.get(&user).copied().unwrap_or(0))
    }

    async fn get_risk_mode_config(
        &self,
        mode_id: u8,
        _block: u64,
    ) -> Result<RiskModeConfig, ChainError> {
        self.modes
            .get(&mode_id)
            .map(|(config, _)| *config)
            .ok_or_else(|| ChainError::Other(format!("unknown emode {}", mode_id)))
    }

    async fn get_risk_mode_label(&self, mode_id: u8, _block: u64) -> Result<String, ChainError> {
        self.modes
            .get(&mode_id)
            .map(|(_, label)| label.clone())
            .ok_or_else(|| ChainError::Other(format!("unknown emode {}", mode_id)))
    }

    async fn token_balance_of(
        &self,
        token: Address,
        holder: Address,
        _block: u64,
    ) -> Result<U256, ChainError> {
        if let Ok(mut queries) = self.balance_queries.lock() {
            queries.push((token, holder));
        }
        Ok(self
            .balances
            .get(&(token, holder))
            .copied()
            .unwrap_or_default())
    }

    async fn token_scaled_balance_of(
        &self,
        token: Address,
        user: Address,
        _block: u64,
    ) -> Result<U256, ChainError> {
        self.check_user(user).await?;
        Ok(self
            .scaled_balances
            .get(&(token, user))
            .copied()
            .unwrap_or_default())
    }

    async fn token_scaled_total_supply(
        &self,
        token: Address,
        _block: u64,
    ) -> Result<U256, ChainError> {
        Ok(self
            .scaled_total_supplies
            .get(&token)
            .copied()
            .unwrap_or_default())
    }

    async fn token_symbol(&self, token: Address, _block: u64) -> Result<String, ChainError> {
        self.symbols
            .get(&token)
            .cloned()
            .ok_or_else(|| ChainError::Decode("symbol: expected string".to_string()))
    }

    async fn token_name(&self, token: Address, _block: u64) -> Result<String, ChainError> {
        self.names
            .get(&token)
            .cloned()
            .ok_or_else(|| ChainError::Decode("name: expected string".to_string()))
    }

    async fn get_asset_prices(
        &self,
        oracle: Address,
        assets: &[Address],
        _block: u64,
    ) -> Result<Vec<U256>, ChainError> {
        if oracle != self.oracle {
            return Err(ChainError::Other(format!("unknown oracle {:?}", oracle)));
        }
        Ok(assets
            .iter()
            .take(self.price_count.unwrap_or(assets.len()))
            .map(|asset| self.prices.get(asset).copied().unwrap_or_default())
            .collect())
    }

    async fn get_base_currency_unit(
        &self,
        _oracle: Address,
        _block: u64,
    ) -> Result<U256, ChainError> {
        Ok(self.base_currency_unit)
    }

    async fn get_price_oracle_address(&self, _block: u64) -> Result<Address, ChainError> {
        Ok(self.oracle)
    }
}
