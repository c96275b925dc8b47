use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use web3::types::Address;

use crate::chain::{ChainClient, ChainError};
use crate::config::CollectionStrategy;
use crate::types::{FailedUser, RawUserPosition, ReserveCatalog};

/// Result of one user's sweep, sent from worker to coordinator.
#[derive(Debug)]
pub enum UserFetchOutcome {
    Success {
        user: Address,
        positions: Vec<RawUserPosition>,
    },
    Failure {
        user: Address,
        reason: String,
    },
}

/// Positions keyed by user plus the users whose sweep failed. A user is in
/// exactly one of the two.
#[derive(Debug, Default)]
pub struct CollectionReport {
    pub positions_by_user: HashMap<Address, Vec<RawUserPosition>>,
    pub failed_users: Vec<FailedUser>,
    reported: HashSet<Address>,
}

impl CollectionReport {
    fn with_capacity(users: usize) -> Self {
        Self {
            positions_by_user: HashMap::with_capacity(users),
            failed_users: Vec::new(),
            reported: HashSet::with_capacity(users),
        }
    }

    fn record(&mut self, outcome: UserFetchOutcome) {
        let user = match &outcome {
            UserFetchOutcome::Success { user, .. } | UserFetchOutcome::Failure { user, .. } => *user,
        };
        if !self.reported.insert(user) {
            warn!("[CollectionReport::record] Ignoring second outcome for {:?}", user);
            return;
        }

        match outcome {
            UserFetchOutcome::Success { user, positions } => {
                self.positions_by_user.insert(user, positions);
            }
            UserFetchOutcome::Failure { user, reason } => {
                self.failed_users.push(FailedUser {
                    user_address: user,
                    reason,
                });
            }
        }
    }

    fn has_outcome(&self, user: &Address) -> bool {
        self.reported.contains(user)
    }

    pub fn successful_users(&self) -> usize {
        self.positions_by_user.len()
    }

    pub fn position_count(&self) -> usize {
        self.positions_by_user.values().map(Vec::len).sum()
    }

    /// Flattens the per-user lists into one table.
    pub fn into_parts(self) -> (Vec<RawUserPosition>, Vec<FailedUser>) {
        let mut positions = Vec::with_capacity(self.position_count());
        for user_positions in self.positions_by_user.into_values() {
            positions.extend(user_positions);
        }
        (positions, self.failed_users)
    }
}

#[derive(Debug, Clone, Copy)]
struct ReserveTokens {
    underlying_asset: Address,
    a_token: Address,
    variable_debt_token: Address,
}

/// What a worker reads for one user.
#[derive(Debug)]
enum Sweep {
    PerToken(Vec<ReserveTokens>),
    Aggregated { addresses_provider: Address },
}

impl Sweep {
    async fn run(
        &self,
        client: &dyn ChainClient,
        user: Address,
        block_number: u64,
    ) -> Result<Vec<RawUserPosition>, ChainError> {
        match self {
            Sweep::PerToken(reserves) => {
                let mut positions = Vec::new();
                for reserve in reserves {
                    let (scaled_collateral, scaled_debt) = futures::try_join!(
                        client.token_scaled_balance_of(reserve.a_token, user, block_number),
                        client.token_scaled_balance_of(
                            reserve.variable_debt_token,
                            user,
                            block_number
                        ),
                    )?;

                    if !scaled_collateral.is_zero() || !scaled_debt.is_zero() {
                        positions.push(RawUserPosition {
                            user_address: user,
                            reserve_address: reserve.underlying_asset,
                            scaled_collateral_balance: scaled_collateral,
                            scaled_debt_balance: scaled_debt,
                            used_as_collateral: None,
                            snapshot_block: block_number,
                        });
                    }
                }
                Ok(positions)
            }
            Sweep::Aggregated { addresses_provider } => {
                let balances = client
                    .get_user_reserve_balances(*addresses_provider, user, block_number)
                    .await?;

                Ok(balances
                    .into_iter()
                    .filter(|b| !b.scaled_a_token_balance.is_zero() || !b.scaled_variable_debt.is_zero())
                    .map(|b| RawUserPosition {
                        user_address: user,
                        reserve_address: b.underlying_asset,
                        scaled_collateral_balance: b.scaled_a_token_balance,
                        scaled_debt_balance: b.scaled_variable_debt,
                        used_as_collateral: Some(b.usage_as_collateral_enabled),
                        snapshot_block: block_number,
                    })
                    .collect())
            }
        }
    }
}

/// Fetches scaled balances for many users on a bounded pool of tasks.
pub struct PositionCollector {
    client: Arc<dyn ChainClient>,
    workers: usize,
    user_timeout: Duration,
    strategy: CollectionStrategy,
    addresses_provider: Address,
}

impl PositionCollector {
    pub fn new(client: Arc<dyn ChainClient>, workers: usize, user_timeout: Duration) -> Self {
        Self {
            client,
            workers: workers.max(1),
            user_timeout,
            strategy: CollectionStrategy::PerToken,
            addresses_provider: Address::zero(),
        }
    }

    /// Switches to one UI data provider call per user for the given market.
    pub fn aggregated(mut self, addresses_provider: Address) -> Self {
        self.strategy = CollectionStrategy::Aggregated;
        self.addresses_provider = addresses_provider;
        self
    }

    /// Sweeps every user over the catalog at `block_number`.
    ///
    /// A failure anywhere in one user's sweep marks only that user as failed.
    /// Dropping the returned future aborts workers still in flight.
    pub async fn collect(
        &self,
        users: &[Address],
        catalog: &ReserveCatalog,
        block_number: u64,
    ) -> CollectionReport {
        let mut seen = HashSet::with_capacity(users.len());
        let users: Vec<Address> = users
            .iter()
            .copied()
            .filter(|user| seen.insert(*user))
            .collect();

        info!(
            "[PositionCollector::collect] Sweeping {} users over {} reserves at block {} with {} workers ({:?})",
            users.len(),
            catalog.len(),
            block_number,
            self.workers,
            self.strategy
        );

        let sweep = Arc::new(match self.strategy {
            CollectionStrategy::PerToken => Sweep::PerToken(
                catalog
                    .reserves()
                    .iter()
                    .map(|r| ReserveTokens {
                        underlying_asset: r.underlying_asset,
                        a_token: r.a_token_address,
                        variable_debt_token: r.variable_debt_token_address,
                    })
                    .collect(),
            ),
            CollectionStrategy::Aggregated => Sweep::Aggregated {
                addresses_provider: self.addresses_provider,
            },
        });

        let permits = Arc::new(Semaphore::new(self.workers));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut workers = JoinSet::new();

        for user in users.iter().copied() {
            let client = Arc::clone(&self.client);
            let sweep = Arc::clone(&sweep);
            let permits = Arc::clone(&permits);
            let tx = tx.clone();
            let user_timeout = self.user_timeout;

            workers.spawn(async move {
                let _permit = match permits.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };

                let outcome = match tokio::time::timeout(
                    user_timeout,
                    sweep.run(client.as_ref(), user, block_number),
                )
                .await
                {
                    Ok(Ok(positions)) => {
                        debug!(
                            "[PositionCollector::collect] {:?}: {} positions",
                            user,
                            positions.len()
                        );
                        UserFetchOutcome::Success { user, positions }
                    }
                    Ok(Err(e)) => {
                        warn!("[PositionCollector::collect] Found an error for user {:?}: {}", user, e);
                        UserFetchOutcome::Failure {
                            user,
                            reason: e.to_string(),
                        }
                    }
                    Err(_) => {
                        warn!(
                            "[PositionCollector::collect] Sweep for user {:?} timed out",
                            user
                        );
                        UserFetchOutcome::Failure {
                            user,
                            reason: format!("sweep timed out after {:?}", user_timeout),
                        }
                    }
                };

                // receiver only goes away if the whole collection was dropped
                let _ = tx.send(outcome);
            });
        }
        drop(tx);

        let mut report = CollectionReport::with_capacity(users.len());
        while let Some(outcome) = rx.recv().await {
            report.record(outcome);
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!("[PositionCollector::collect] Worker ended abnormally: {}", e);
            }
        }

        // users whose worker panicked before reporting
        for user in users {
            if !report.has_outcome(&user) {
                report.record(UserFetchOutcome::Failure {
                    user,
                    reason: "worker aborted before reporting".to_string(),
                });
            }
        }

        info!(
            "[PositionCollector::collect] {} users succeeded ({} positions), {} failed",
            report.successful_users(),
            report.position_count(),
            report.failed_users.len()
        );

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{MockChainClient, UserReserveBalance};
    use crate::reserve_configuration::ReserveConfiguration;
    use crate::types::Reserve;
    use web3::types::U256;

    fn addr(n: u64) -> Address {
        Address::from_low_u64_be(n)
    }

    fn reserve(underlying: Address, a_token: Address, v_token: Address) -> Reserve {
        Reserve {
            underlying_asset: underlying,
            symbol: None,
            name: None,
            configuration: ReserveConfiguration {
                decimals: 18,
                ..Default::default()
            },
            liquidity_index: U256::exp10(27),
            variable_borrow_index: U256::exp10(27),
            liquidity_rate: U256::zero(),
            variable_borrow_rate: U256::zero(),
            last_update_timestamp: 0,
            a_token_address: a_token,
            variable_debt_token_address: v_token,
            interest_rate_strategy_address: Address::zero(),
            accrued_to_treasury: U256::zero(),
            price_usd: 1.0,
            available_liquidity: U256::zero(),
            total_scaled_variable_debt: U256::zero(),
        }
    }

    fn two_reserve_catalog() -> ReserveCatalog {
        ReserveCatalog::new(
            10,
            vec![
                reserve(addr(0x100), addr(0x101), addr(0x102)),
                reserve(addr(0x200), addr(0x201), addr(0x202)),
            ],
        )
    }

    #[tokio::test]
    async fn test_one_failing_user_is_isolated() {
        let users: Vec<Address> = (1..=8).map(addr).collect();
        let failing = users[3];

        let mut client = MockChainClient::new().with_failing_user(failing);
        for user in &users {
            client = client.with_scaled_balance(addr(0x101), *user, U256::exp10(18));
        }

        let collector = PositionCollector::new(Arc::new(client), 3, Duration::from_secs(5));
        let report = collector
            .collect(&users, &two_reserve_catalog(), 10)
            .await;

        assert_eq!(report.successful_users(), users.len() - 1);
        assert_eq!(report.failed_users.len(), 1);
        assert_eq!(report.failed_users[0].user_address, failing);
        assert!(!report.positions_by_user.contains_key(&failing));
        for user in users.iter().filter(|u| **u != failing) {
            assert_eq!(report.positions_by_user[user].len(), 1);
        }
    }

    #[tokio::test]
    async fn test_keeps_only_nonzero_reserves() {
        let user = addr(1);
        let client = MockChainClient::new()
            .with_scaled_balance(addr(0x202), user, U256::from(7u64))
            .with_scaled_balance(addr(0x101), user, U256::zero());

        let report = PositionCollector::new(Arc::new(client), 2, Duration::from_secs(5))
            .collect(&[user], &two_reserve_catalog(), 10)
            .await;

        let positions = &report.positions_by_user[&user];
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].reserve_address, addr(0x200));
        assert_eq!(positions[0].scaled_collateral_balance, U256::zero());
        assert_eq!(positions[0].scaled_debt_balance, U256::from(7u64));
        assert_eq!(positions[0].used_as_collateral, None);
        assert_eq!(positions[0].snapshot_block, 10);
    }

    #[tokio::test]
    async fn test_user_without_positions_is_a_success() {
        let user = addr(1);
        let report = PositionCollector::new(
            Arc::new(MockChainClient::new()),
            1,
            Duration::from_secs(5),
        )
        .collect(&[user], &two_reserve_catalog(), 10)
        .await;

        assert_eq!(report.successful_users(), 1);
        assert!(report.positions_by_user[&user].is_empty());
        assert!(report.failed_users.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_users_swept_once() {
        let user = addr(1);
        let client = MockChainClient::new().with_scaled_balance(addr(0x101), user, U256::one());

        let report = PositionCollector::new(Arc::new(client), 4, Duration::from_secs(5))
            .collect(&[user, user, user], &two_reserve_catalog(), 10)
            .await;

        assert_eq!(report.successful_users(), 1);
        let (positions, failed) = report.into_parts();
        assert_eq!(positions.len(), 1);
        assert!(failed.is_empty());
    }

    #[tokio::test]
    async fn test_aggregated_strategy_filters_and_keeps_collateral_flag() {
        let user = addr(1);
        let other = addr(2);
        let client = MockChainClient::new()
            .with_user_reserves(
                user,
                vec![
                    UserReserveBalance {
                        underlying_asset: addr(0x100),
                        scaled_a_token_balance: U256::from(5u64),
                        usage_as_collateral_enabled: true,
                        scaled_variable_debt: U256::zero(),
                    },
                    UserReserveBalance {
                        underlying_asset: addr(0x200),
                        scaled_a_token_balance: U256::zero(),
                        usage_as_collateral_enabled: false,
                        scaled_variable_debt: U256::zero(),
                    },
                ],
            )
            .with_failing_user(other);

        let report = PositionCollector::new(Arc::new(client), 2, Duration::from_secs(5))
            .aggregated(addr(0xfeed))
            .collect(&[user, other], &two_reserve_catalog(), 10)
            .await;

        let positions = &report.positions_by_user[&user];
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].reserve_address, addr(0x100));
        assert_eq!(positions[0].used_as_collateral, Some(true));
        assert_eq!(report.failed_users.len(), 1);
        assert_eq!(report.failed_users[0].user_address, other);
    }

    fn assert_disjoint(report: &CollectionReport) {
        for failed in &report.failed_users {
            assert!(!report.positions_by_user.contains_key(&failed.user_address));
        }
    }

    #[tokio::test]
    async fn test_every_user_failing_is_reported_once() {
        let users: Vec<Address> = (1..=2_000).map(addr).collect();
        let client = users
            .iter()
            .fold(MockChainClient::new(), |client, user| client.with_failing_user(*user));

        let report = PositionCollector::new(Arc::new(client), 16, Duration::from_secs(5))
            .aggregated(addr(0xfeed))
            .collect(&users, &two_reserve_catalog(), 10)
            .await;

        assert_eq!(report.successful_users(), 0);
        assert_eq!(report.failed_users.len(), users.len());
        let distinct: HashSet<Address> = report.failed_users.iter().map(|f| f.user_address).collect();
        assert_eq!(distinct.len(), users.len());
    }

    #[tokio::test]
    async fn test_slow_user_times_out_alone() {
        let users: Vec<Address> = (1..=4).map(addr).collect();
        let slow = users[1];
        let mut client = MockChainClient::new().with_slow_user(slow, Duration::from_secs(30));
        for user in &users {
            client = client.with_scaled_balance(addr(0x101), *user, U256::one());
        }

        let report = PositionCollector::new(Arc::new(client), 2, Duration::from_millis(200))
            .collect(&users, &two_reserve_catalog(), 10)
            .await;

        assert_eq!(report.successful_users(), 3);
        assert_eq!(report.failed_users.len(), 1);
        assert_eq!(report.failed_users[0].user_address, slow);
        assert!(report.failed_users[0].reason.contains("timed out"));
        assert_disjoint(&report);
    }

    #[tokio::test]
    async fn test_panicking_worker_is_recorded_as_failed() {
        let users: Vec<Address> = (1..=4).map(addr).collect();
        let broken = users[2];
        let mut client = MockChainClient::new().with_panicking_user(broken);
        for user in &users {
            client = client.with_scaled_balance(addr(0x201), *user, U256::one());
        }

        let report = PositionCollector::new(Arc::new(client), 2, Duration::from_secs(5))
            .collect(&users, &two_reserve_catalog(), 10)
            .await;

        assert_eq!(report.successful_users(), 3);
        assert_eq!(report.failed_users.len(), 1);
        assert_eq!(report.failed_users[0].user_address, broken);
        assert_eq!(report.failed_users[0].reason, "worker aborted before reporting");
        assert_disjoint(&report);
        for user in users.iter().filter(|u| **u != broken) {
            assert_eq!(report.positions_by_user[user].len(), 1);
        }
    }
}
