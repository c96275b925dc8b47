use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{NaiveDate, TimeZone, Utc};
use log::info;
use web3::types::Address;

use crate::balance_normalizer::normalize;
use crate::block_locator::BlockLocator;
use crate::chain::ChainClient;
use crate::config::{CollectionStrategy, Config};
use crate::emode_resolver::{distinct_ids, EModeResolver};
use crate::error::SnapshotError;
use crate::position_collector::PositionCollector;
use crate::reserve_directory::ReserveDirectory;
use crate::tables::SnapshotWriter;
use crate::treasury_aggregator::TreasuryAggregator;
use crate::types::{
    EMode, FailedUser, NormalizedBalance, ReserveCatalog, Result, TreasuryEntry, UserEMode,
};

/// Every table of one run, all taken at `block`.
#[derive(Debug)]
pub struct Snapshot {
    pub block: u64,
    pub catalog: ReserveCatalog,
    pub balances: Vec<NormalizedBalance>,
    pub failed_users: Vec<FailedUser>,
    pub user_emodes: Vec<UserEMode>,
    pub emodes: Vec<EMode>,
    pub treasury: Vec<TreasuryEntry>,
}

impl Snapshot {
    pub fn write(&self, writer: &SnapshotWriter) -> Result<Vec<PathBuf>> {
        Ok(vec![
            writer.write_balances(&self.balances)?,
            writer.write_reserves(&self.catalog)?,
            writer.write_treasury(&self.treasury)?,
            writer.write_user_emodes(&self.user_emodes)?,
            writer.write_emodes(&self.emodes)?,
            writer.write_failed_users(&self.failed_users)?,
        ])
    }
}

/// Last second of `date` in UTC as a unix timestamp.
pub fn end_of_day_timestamp(date: NaiveDate) -> Result<u64> {
    let end = date
        .and_hms_opt(23, 59, 59)
        .ok_or_else(|| SnapshotError::BlockSearch(format!("invalid snapshot date {}", date)))?;
    let timestamp = Utc.from_utc_datetime(&end).timestamp();
    u64::try_from(timestamp)
        .map_err(|_| SnapshotError::BlockSearch(format!("snapshot date {} predates 1970", date)))
}

/// Runs the stages in order against one chain client.
pub struct SnapshotRunner {
    client: Arc<dyn ChainClient>,
    config: Config,
}

impl SnapshotRunner {
    pub fn new(client: Arc<dyn ChainClient>, config: Config) -> Self {
        Self { client, config }
    }

    /// `SNAPSHOT_BLOCK` when set, otherwise the last block of the snapshot date.
    pub async fn resolve_block(&self) -> Result<u64> {
        if let Some(block) = self.config.snapshot_block {
            info!("[SnapshotRunner::resolve_block] Using configured block {}", block);
            return Ok(block);
        }

        let target = end_of_day_timestamp(self.config.snapshot_date)?;
        let head = self.client.latest_block().await?;
        info!(
            "[SnapshotRunner::resolve_block] Locating block for {} (timestamp {}) from head {}",
            self.config.snapshot_date, target, head
        );

        BlockLocator::new(Arc::clone(&self.client), self.config.max_step_backs)
            .locate(target, head, self.config.block_search_step)
            .await
    }

    pub async fn run(&self, users: &[Address], block: u64) -> Result<Snapshot> {
        let mut seen = HashSet::with_capacity(users.len());
        let users: Vec<Address> = users
            .iter()
            .copied()
            .filter(|user| seen.insert(*user))
            .collect();
        let workers = self.config.workers;
        let deployment = &self.config.deployment;

        info!("[SnapshotRunner::run] STEP 1: Building reserve catalog at block {}", block);
        let catalog = ReserveDirectory::new(Arc::clone(&self.client), workers)
            .build_catalog(block)
            .await?;

        info!("[SnapshotRunner::run] STEP 2: Collecting positions of {} users", users.len());
        let mut collector =
            PositionCollector::new(Arc::clone(&self.client), workers, self.config.user_timeout);
        if self.config.collection_strategy == CollectionStrategy::Aggregated {
            collector = collector.aggregated(deployment.addresses_provider);
        }
        let (positions, failed_users) = collector.collect(&users, &catalog, block).await.into_parts();

        info!("[SnapshotRunner::run] STEP 3: Normalizing {} positions", positions.len());
        let balances = normalize(&positions, &catalog, self.config.dust_threshold_usd);

        info!("[SnapshotRunner::run] STEP 4: Resolving emodes");
        let resolver = EModeResolver::new(Arc::clone(&self.client), workers);
        let user_emodes = resolver.resolve_users(&users, block).await?;
        let emode_ids = distinct_ids(&user_emodes, self.config.include_zero_emode);
        let emodes = resolver.resolve_categories(&emode_ids, block).await?;

        info!("[SnapshotRunner::run] STEP 5: Collecting treasury balances");
        let treasury = TreasuryAggregator::new(
            Arc::clone(&self.client),
            deployment.treasury_collector,
            deployment.native_stable_asset,
        )
        .collect(&catalog, block)
        .await?;

        Ok(Snapshot {
            block,
            catalog,
            balances,
            failed_users,
            user_emodes,
            emodes,
            treasury,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_of_day_timestamp() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        // 2024-01-01T23:59:59Z
        assert_eq!(end_of_day_timestamp(date).unwrap(), 1_704_153_599);
    }

    #[test]
    fn test_end_of_day_before_epoch_fails() {
        let date = NaiveDate::from_ymd_opt(1969, 12, 30).unwrap();
        assert!(matches!(
            end_of_day_timestamp(date),
            Err(SnapshotError::BlockSearch(_))
        ));
    }
}
