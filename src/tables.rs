//! Users list input and partitioned CSV output tables.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use csv::Writer;
use log::{info, warn};
use serde::Serialize;
use web3::types::{Address, U256};

use crate::types::{
    EMode, FailedUser, NormalizedBalance, ReserveCatalog, Result, TreasuryEntry, UserEMode,
};

const USER_ADDRESS_COLUMN: &str = "active_user_address";

/// Reads user addresses from a CSV file. Uses the `active_user_address`
/// column when present, otherwise the first column; a headerless
/// single-column file works too. Unparseable rows are skipped.
pub fn read_users(path: impl AsRef<Path>) -> Result<Vec<Address>> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;

    let headers = reader.headers()?.clone();
    let column = headers
        .iter()
        .position(|h| h.trim() == USER_ADDRESS_COLUMN)
        .unwrap_or(0);

    let mut users = Vec::new();
    // a headerless file has its first address in the header row
    if let Some(first) = headers.get(column) {
        if let Ok(user) = first.trim().parse::<Address>() {
            users.push(user);
        }
    }

    let mut skipped = 0usize;
    for record in reader.records() {
        let record = record?;
        match record.get(column).map(|raw| raw.trim().parse::<Address>()) {
            Some(Ok(user)) => users.push(user),
            _ => skipped += 1,
        }
    }

    if skipped > 0 {
        warn!(
            "[tables::read_users] Skipped {} rows without a valid address in {}",
            skipped,
            path.display()
        );
    }
    info!(
        "[tables::read_users] Read {} users from {}",
        users.len(),
        path.display()
    );
    Ok(users)
}

#[derive(Debug, Serialize)]
struct BalanceRow {
    user_address: String,
    underlying_asset: String,
    snapshot_block: u64,
    scaled_a_token_balance: String,
    scaled_variable_debt: String,
    usage_as_collateral_enabled_on_user: Option<bool>,
    symbol: Option<String>,
    name: Option<String>,
    decimals: Option<u8>,
    base_ltv_as_collateral: Option<u16>,
    reserve_liquidation_threshold: Option<u16>,
    reserve_liquidation_bonus: Option<u16>,
    liquidity_index: Option<f64>,
    variable_borrow_index: Option<f64>,
    underlying_token_price_usd: Option<f64>,
    current_a_token_balance: Option<f64>,
    current_variable_debt: Option<f64>,
    current_a_token_balance_usd: Option<f64>,
    current_variable_debt_usd: Option<f64>,
}

#[derive(Debug, Serialize)]
struct ReserveRow {
    underlying_asset: String,
    symbol: Option<String>,
    name: Option<String>,
    decimals: u8,
    base_ltv_as_collateral: u16,
    reserve_liquidation_threshold: u16,
    reserve_liquidation_bonus: u16,
    reserve_factor: u16,
    is_active: bool,
    is_frozen: bool,
    borrowing_enabled: bool,
    liquidity_index: String,
    variable_borrow_index: String,
    liquidity_rate: String,
    variable_borrow_rate: String,
    last_update_timestamp: u64,
    a_token_address: String,
    variable_debt_token_address: String,
    interest_rate_strategy_address: String,
    accrued_to_treasury: String,
    available_liquidity: String,
    total_scaled_variable_debt: String,
    underlying_token_price_usd: f64,
    snapshot_block: u64,
}

#[derive(Debug, Serialize)]
struct TreasuryRow {
    underlying_asset: String,
    symbol: Option<String>,
    queried_token: String,
    treasury_balance: String,
    treasury_balance_usd: f64,
    snapshot_block: u64,
}

#[derive(Debug, Serialize)]
struct UserEModeRow {
    active_user_address: String,
    snapshot_block: u64,
    emode: u8,
}

#[derive(Debug, Serialize)]
struct EModeRow {
    id: u8,
    label: String,
    loan_to_value: u16,
    liquidation_threshold: u16,
    liquidation_bonus: u16,
}

#[derive(Debug, Serialize)]
struct FailedUserRow {
    user_address: String,
    reason: String,
}

fn hex(address: &Address) -> String {
    format!("{:?}", address)
}

fn dec(value: &U256) -> String {
    value.to_string()
}

/// Writes snapshot tables under
/// `<root>/<table>/snapshot_date=<date>/snapshot_block=<block>/<table>.csv`.
pub struct SnapshotWriter {
    root: PathBuf,
    snapshot_date: NaiveDate,
    snapshot_block: u64,
}

impl SnapshotWriter {
    pub fn new(root: impl Into<PathBuf>, snapshot_date: NaiveDate, snapshot_block: u64) -> Self {
        Self {
            root: root.into(),
            snapshot_date,
            snapshot_block,
        }
    }

    pub fn table_path(&self, table: &str) -> PathBuf {
        self.root
            .join(table)
            .join(format!("snapshot_date={}", self.snapshot_date.format("%Y-%m-%d")))
            .join(format!("snapshot_block={}", self.snapshot_block))
            .join(format!("{}.csv", table))
    }

    fn write_rows<T: Serialize>(
        &self,
        table: &str,
        rows: impl IntoIterator<Item = T>,
    ) -> Result<PathBuf> {
        let path = self.table_path(table);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let mut writer = Writer::from_path(&path)?;
        let mut count = 0usize;
        for row in rows {
            writer.serialize(row)?;
            count += 1;
        }
        writer.flush()?;

        info!(
            "[SnapshotWriter::write_rows] Wrote {} rows to {}",
            count,
            path.display()
        );
        Ok(path)
    }

    pub fn write_balances(&self, balances: &[NormalizedBalance]) -> Result<PathBuf> {
        self.write_rows(
            "users_balances",
            balances.iter().map(|b| {
                let reserve = b.reserve.as_ref();
                BalanceRow {
                    user_address: hex(&b.position.user_address),
                    underlying_asset: hex(&b.position.reserve_address),
                    snapshot_block: b.position.snapshot_block,
                    scaled_a_token_balance: dec(&b.position.scaled_collateral_balance),
                    scaled_variable_debt: dec(&b.position.scaled_debt_balance),
                    usage_as_collateral_enabled_on_user: b.position.used_as_collateral,
                    symbol: reserve.and_then(|r| r.symbol.clone()),
                    name: reserve.and_then(|r| r.name.clone()),
                    decimals: reserve.map(|r| r.decimals),
                    base_ltv_as_collateral: reserve.map(|r| r.ltv),
                    reserve_liquidation_threshold: reserve.map(|r| r.liquidation_threshold),
                    reserve_liquidation_bonus: reserve.map(|r| r.liquidation_bonus),
                    liquidity_index: reserve.map(|r| r.liquidity_index),
                    variable_borrow_index: reserve.map(|r| r.variable_borrow_index),
                    underlying_token_price_usd: reserve.map(|r| r.price_usd),
                    current_a_token_balance: b.current_collateral_balance,
                    current_variable_debt: b.current_debt_balance,
                    current_a_token_balance_usd: b.current_collateral_usd,
                    current_variable_debt_usd: b.current_debt_usd,
                }
            }),
        )
    }

    pub fn write_reserves(&self, catalog: &ReserveCatalog) -> Result<PathBuf> {
        self.write_rows(
            "reserves_data",
            catalog.reserves().iter().map(|r| ReserveRow {
                underlying_asset: hex(&r.underlying_asset),
                symbol: r.symbol.clone(),
                name: r.name.clone(),
                decimals: r.configuration.decimals,
                base_ltv_as_collateral: r.configuration.ltv,
                reserve_liquidation_threshold: r.configuration.liquidation_threshold,
                reserve_liquidation_bonus: r.configuration.liquidation_bonus,
                reserve_factor: r.configuration.reserve_factor,
                is_active: r.configuration.is_active,
                is_frozen: r.configuration.is_frozen,
                borrowing_enabled: r.configuration.borrowing_enabled,
                liquidity_index: dec(&r.liquidity_index),
                variable_borrow_index: dec(&r.variable_borrow_index),
                liquidity_rate: dec(&r.liquidity_rate),
                variable_borrow_rate: dec(&r.variable_borrow_rate),
                last_update_timestamp: r.last_update_timestamp,
                a_token_address: hex(&r.a_token_address),
                variable_debt_token_address: hex(&r.variable_debt_token_address),
                interest_rate_strategy_address: hex(&r.interest_rate_strategy_address),
                accrued_to_treasury: dec(&r.accrued_to_treasury),
                available_liquidity: dec(&r.available_liquidity),
                total_scaled_variable_debt: dec(&r.total_scaled_variable_debt),
                underlying_token_price_usd: r.price_usd,
                snapshot_block: catalog.block,
            }),
        )
    }

    pub fn write_treasury(&self, entries: &[TreasuryEntry]) -> Result<PathBuf> {
        self.write_rows(
            "reserves_treasury",
            entries.iter().map(|e| TreasuryRow {
                underlying_asset: hex(&e.reserve_address),
                symbol: e.symbol.clone(),
                queried_token: hex(&e.queried_token),
                treasury_balance: dec(&e.treasury_balance_raw),
                treasury_balance_usd: e.treasury_balance_usd,
                snapshot_block: e.snapshot_block,
            }),
        )
    }

    pub fn write_user_emodes(&self, modes: &[UserEMode]) -> Result<PathBuf> {
        self.write_rows(
            "users_emodes",
            modes.iter().map(|m| UserEModeRow {
                active_user_address: hex(&m.user_address),
                snapshot_block: m.snapshot_block,
                emode: m.emode_id,
            }),
        )
    }

    pub fn write_emodes(&self, categories: &[EMode]) -> Result<PathBuf> {
        self.write_rows(
            "emodes_configuration",
            categories.iter().map(|c| EModeRow {
                id: c.id,
                label: c.label.clone(),
                loan_to_value: c.ltv,
                liquidation_threshold: c.liquidation_threshold,
                liquidation_bonus: c.liquidation_bonus,
            }),
        )
    }

    pub fn write_failed_users(&self, failed: &[FailedUser]) -> Result<PathBuf> {
        self.write_rows(
            "failed_users",
            failed.iter().map(|f| FailedUserRow {
                user_address: hex(&f.user_address),
                reason: f.reason.clone(),
            }),
        )
    }
}
