use std::collections::HashMap;

use web3::types::{Address, U256};

use crate::error::SnapshotError;
use crate::reserve_configuration::ReserveConfiguration;

pub type Result<T> = std::result::Result<T, SnapshotError>;

/// One lending reserve as seen at its catalog's block.
#[derive(Debug, Clone, PartialEq)]
pub struct Reserve {
    pub underlying_asset: Address,
    pub symbol: Option<String>,
    pub name: Option<String>,
    pub configuration: ReserveConfiguration,
    /// Ray (1e27).
    pub liquidity_index: U256,
    /// Ray (1e27).
    pub variable_borrow_index: U256,
    pub liquidity_rate: U256,
    pub variable_borrow_rate: U256,
    pub last_update_timestamp: u64,
    pub a_token_address: Address,
    pub variable_debt_token_address: Address,
    pub interest_rate_strategy_address: Address,
    pub accrued_to_treasury: U256,
    pub price_usd: f64,
    pub available_liquidity: U256,
    pub total_scaled_variable_debt: U256,
}

impl Reserve {
    pub fn decimals(&self) -> u8 {
        self.configuration.decimals
    }
}

/// Reserves of a single block, at most one per underlying asset.
#[derive(Debug, Clone, Default)]
pub struct ReserveCatalog {
    pub block: u64,
    reserves: Vec<Reserve>,
    by_address: HashMap<Address, usize>,
}

impl ReserveCatalog {
    /// Builds the catalog, keeping the first reserve seen for each address.
    pub fn new(block: u64, reserves: Vec<Reserve>) -> Self {
        let mut kept = Vec::with_capacity(reserves.len());
        let mut by_address = HashMap::with_capacity(reserves.len());
        for reserve in reserves {
            if by_address.contains_key(&reserve.underlying_asset) {
                log::warn!(
                    "[ReserveCatalog::new] Duplicate reserve {:?} at block {}, keeping first",
                    reserve.underlying_asset,
                    block
                );
                continue;
            }
            by_address.insert(reserve.underlying_asset, kept.len());
            kept.push(reserve);
        }

        Self {
            block,
            reserves: kept,
            by_address,
        }
    }

    pub fn get(&self, underlying_asset: &Address) -> Option<&Reserve> {
        self.by_address
            .get(underlying_asset)
            .map(|idx| &self.reserves[*idx])
    }

    pub fn reserves(&self) -> &[Reserve] {
        &self.reserves
    }

    pub fn len(&self) -> usize {
        self.reserves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reserves.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawUserPosition {
    pub user_address: Address,
    pub reserve_address: Address,
    pub scaled_collateral_balance: U256,
    pub scaled_debt_balance: U256,
    /// Only reported by the aggregated data provider.
    pub used_as_collateral: Option<bool>,
    pub snapshot_block: u64,
}

/// Reserve fields carried onto each balance row.
#[derive(Debug, Clone, PartialEq)]
pub struct ReserveFields {
    pub symbol: Option<String>,
    pub name: Option<String>,
    pub decimals: u8,
    pub ltv: u16,
    pub liquidation_threshold: u16,
    pub liquidation_bonus: u16,
    pub liquidity_index: f64,
    pub variable_borrow_index: f64,
    pub price_usd: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedBalance {
    pub position: RawUserPosition,
    /// `None` when the reserve is missing from the catalog.
    pub reserve: Option<ReserveFields>,
    pub current_collateral_balance: Option<f64>,
    pub current_debt_balance: Option<f64>,
    pub current_collateral_usd: Option<f64>,
    pub current_debt_usd: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EMode {
    pub id: u8,
    pub label: String,
    pub ltv: u16,
    pub liquidation_threshold: u16,
    pub liquidation_bonus: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserEMode {
    pub user_address: Address,
    pub snapshot_block: u64,
    pub emode_id: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TreasuryEntry {
    pub reserve_address: Address,
    pub symbol: Option<String>,
    /// Token whose `balanceOf(treasury)` was read.
    pub queried_token: Address,
    pub treasury_balance_raw: U256,
    pub treasury_balance_usd: f64,
    pub snapshot_block: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedUser {
    pub user_address: Address,
    pub reason: String,
}
