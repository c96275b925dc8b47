use std::collections::HashSet;
use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use log::{debug, info, warn};
use web3::types::Address;

use crate::chain::{ChainClient, ChainError};
use crate::reserve_configuration::ReserveConfiguration;
use crate::types::{Reserve, ReserveCatalog, Result};
use crate::utils::u256_to_f64;

/// Builds the reserve catalog of the pool at a block.
pub struct ReserveDirectory {
    client: Arc<dyn ChainClient>,
    concurrency: usize,
}

impl ReserveDirectory {
    pub fn new(client: Arc<dyn ChainClient>, concurrency: usize) -> Self {
        Self {
            client,
            concurrency: concurrency.max(1),
        }
    }

    pub async fn build_catalog(&self, block_number: u64) -> Result<ReserveCatalog> {
        // 1) Reserve list, first occurrence wins
        let listed = self.client.list_reserves(block_number).await?;
        let mut seen = HashSet::with_capacity(listed.len());
        let all_reserves: Vec<Address> = listed
            .into_iter()
            .filter(|asset| seen.insert(*asset))
            .collect();

        info!(
            "[ReserveDirectory::build_catalog] Found {} reserves at block {}",
            all_reserves.len(),
            block_number
        );

        // 2) Record, configuration and liquidity for each reserve
        let mut reserves: Vec<Reserve> = stream::iter(all_reserves.iter().copied())
            .map(|asset| self.fetch_reserve(asset, block_number))
            .buffered(self.concurrency)
            .try_collect()
            .await?;

        // 3) Oracle prices for the whole list in one call
        let prices = self.fetch_prices_usd(&all_reserves, block_number).await?;
        for (reserve, price_usd) in reserves.iter_mut().zip(prices) {
            reserve.price_usd = price_usd;
        }

        Ok(ReserveCatalog::new(block_number, reserves))
    }

    async fn fetch_reserve(&self, asset: Address, block_number: u64) -> Result<Reserve> {
        let record = self.client.get_reserve_record(asset, block_number).await?;
        let configuration = ReserveConfiguration::decode(record.configuration);

        let (available_liquidity, total_scaled_variable_debt) = futures::try_join!(
            self.client
                .token_balance_of(asset, record.a_token_address, block_number),
            self.client
                .token_scaled_total_supply(record.variable_debt_token_address, block_number),
        )?;

        let symbol = optional_metadata(
            self.client.token_symbol(asset, block_number).await,
            asset,
            "symbol",
        );
        let name = optional_metadata(
            self.client.token_name(asset, block_number).await,
            asset,
            "name",
        );

        debug!(
            "[ReserveDirectory::fetch_reserve] block={} asset={:?} symbol={:?} decimals={} active={} frozen={}",
            block_number,
            asset,
            symbol,
            configuration.decimals,
            configuration.is_active,
            configuration.is_frozen
        );

        Ok(Reserve {
            underlying_asset: asset,
            symbol,
            name,
            configuration,
            liquidity_index: record.liquidity_index,
            variable_borrow_index: record.variable_borrow_index,
            liquidity_rate: record.liquidity_rate,
            variable_borrow_rate: record.variable_borrow_rate,
            last_update_timestamp: record.last_update_timestamp,
            a_token_address: record.a_token_address,
            variable_debt_token_address: record.variable_debt_token_address,
            interest_rate_strategy_address: record.interest_rate_strategy_address,
            accrued_to_treasury: record.accrued_to_treasury,
            price_usd: 0.0,
            available_liquidity,
            total_scaled_variable_debt,
        })
    }

    /// Oracle prices divided by the oracle's base currency unit.
    async fn fetch_prices_usd(&self, assets: &[Address], block_number: u64) -> Result<Vec<f64>> {
        let oracle = self.client.get_price_oracle_address(block_number).await?;
        let raw_prices = self
            .client
            .get_asset_prices(oracle, assets, block_number)
            .await?;
        let unit = self
            .client
            .get_base_currency_unit(oracle, block_number)
            .await?;

        if unit.is_zero() {
            return Err(ChainError::Decode("oracle base currency unit is zero".to_string()).into());
        }
        if raw_prices.len() != assets.len() {
            return Err(ChainError::Decode(format!(
                "oracle returned {} prices for {} assets",
                raw_prices.len(),
                assets.len()
            ))
            .into());
        }

        let unit = u256_to_f64(unit);
        Ok(raw_prices
            .into_iter()
            .map(|raw| u256_to_f64(raw) / unit)
            .collect())
    }
}

/// Some tokens (e.g. bytes32 symbols) do not decode as strings; the catalog
/// keeps them without metadata.
fn optional_metadata(
    fetched: std::result::Result<String, ChainError>,
    asset: Address,
    field: &str,
) -> Option<String> {
    match fetched {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(
                "[ReserveDirectory::fetch_reserve] No {} for {:?}: {}",
                field, asset, e
            );
            None
        }
    }
}
