use std::sync::Arc;

use log::{debug, info};
use web3::types::Address;

use crate::chain::ChainClient;
use crate::types::{Reserve, ReserveCatalog, Result, TreasuryEntry};
use crate::utils::to_token_amount;

/// Reads the protocol treasury's holdings for every reserve.
pub struct TreasuryAggregator {
    client: Arc<dyn ChainClient>,
    treasury_collector: Address,
    native_stable_asset: Option<Address>,
}

impl TreasuryAggregator {
    pub fn new(
        client: Arc<dyn ChainClient>,
        treasury_collector: Address,
        native_stable_asset: Option<Address>,
    ) -> Self {
        Self {
            client,
            treasury_collector,
            native_stable_asset,
        }
    }

    /// The native stable asset has no interest-bearing wrapper, so the
    /// treasury holds the underlying token itself.
    fn treasury_token(&self, reserve: &Reserve) -> Address {
        if self.native_stable_asset == Some(reserve.underlying_asset) {
            reserve.underlying_asset
        } else {
            reserve.a_token_address
        }
    }

    pub async fn collect(&self, catalog: &ReserveCatalog, block_number: u64) -> Result<Vec<TreasuryEntry>> {
        let mut entries = Vec::with_capacity(catalog.len());

        for reserve in catalog.reserves() {
            let token = self.treasury_token(reserve);
            let balance = self
                .client
                .token_balance_of(token, self.treasury_collector, block_number)
                .await?;
            let balance_usd = to_token_amount(balance, reserve.decimals()) * reserve.price_usd;

            debug!(
                "[TreasuryAggregator::collect] reserve={:?} token={:?} balance={} usd={:.2}",
                reserve.underlying_asset, token, balance, balance_usd
            );

            entries.push(TreasuryEntry {
                reserve_address: reserve.underlying_asset,
                symbol: reserve.symbol.clone(),
                queried_token: token,
                treasury_balance_raw: balance,
                treasury_balance_usd: balance_usd,
                snapshot_block: block_number,
            });
        }

        info!(
            "[TreasuryAggregator::collect] Treasury holds {:.2} USD across {} reserves at block {}",
            entries.iter().map(|e| e.treasury_balance_usd).sum::<f64>(),
            entries.len(),
            block_number
        );
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChainClient;
    use crate::reserve_configuration::ReserveConfiguration;
    use web3::types::U256;

    fn addr(n: u64) -> Address {
        Address::from_low_u64_be(n)
    }

    fn reserve(underlying: Address, a_token: Address, decimals: u8, price_usd: f64) -> Reserve {
        Reserve {
            underlying_asset: underlying,
            symbol: None,
            name: None,
            configuration: ReserveConfiguration {
                decimals,
                ..Default::default()
            },
            liquidity_index: U256::exp10(27),
            variable_borrow_index: U256::exp10(27),
            liquidity_rate: U256::zero(),
            variable_borrow_rate: U256::zero(),
            last_update_timestamp: 0,
            a_token_address: a_token,
            variable_debt_token_address: Address::zero(),
            interest_rate_strategy_address: Address::zero(),
            accrued_to_treasury: U256::zero(),
            price_usd,
            available_liquidity: U256::zero(),
            total_scaled_variable_debt: U256::zero(),
        }
    }

    #[tokio::test]
    async fn test_native_stable_reads_underlying_others_read_a_token() {
        let treasury = addr(0x7e);
        let gho = addr(0x100);
        let gho_a_token = addr(0x101);
        let usdc = addr(0x200);
        let usdc_a_token = addr(0x201);

        let client = Arc::new(
            MockChainClient::new()
                .with_balance(gho, treasury, U256::from(3u64) * U256::exp10(18))
                .with_balance(gho_a_token, treasury, U256::from(999u64))
                .with_balance(usdc_a_token, treasury, U256::from(2_500_000u64))
                .with_balance(usdc, treasury, U256::from(1u64)),
        );
        let catalog = ReserveCatalog::new(
            9,
            vec![
                reserve(gho, gho_a_token, 18, 1.0),
                reserve(usdc, usdc_a_token, 6, 2.0),
            ],
        );

        let aggregator = TreasuryAggregator::new(client.clone(), treasury, Some(gho));
        let entries = aggregator.collect(&catalog, 9).await.unwrap();

        assert_eq!(
            client.balance_queries(),
            vec![(gho, treasury), (usdc_a_token, treasury)]
        );

        assert_eq!(entries[0].queried_token, gho);
        assert_eq!(entries[0].treasury_balance_raw, U256::from(3u64) * U256::exp10(18));
        assert_eq!(entries[0].treasury_balance_usd, 3.0);

        assert_eq!(entries[1].queried_token, usdc_a_token);
        assert_eq!(entries[1].treasury_balance_raw, U256::from(2_500_000u64));
        assert_eq!(entries[1].treasury_balance_usd, 5.0);
        assert_eq!(entries[1].snapshot_block, 9);
    }

    #[tokio::test]
    async fn test_without_native_stable_every_reserve_uses_a_token() {
        let treasury = addr(0x7e);
        let client = Arc::new(MockChainClient::new());
        let catalog = ReserveCatalog::new(9, vec![reserve(addr(0x100), addr(0x101), 18, 1.0)]);

        let entries = TreasuryAggregator::new(client.clone(), treasury, None)
            .collect(&catalog, 9)
            .await
            .unwrap();

        assert_eq!(client.balance_queries(), vec![(addr(0x101), treasury)]);
        assert_eq!(entries[0].treasury_balance_usd, 0.0);
    }
}
