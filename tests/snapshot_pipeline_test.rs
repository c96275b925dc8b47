use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use aave_positions_snapshot::chain::{MockChainClient, ReserveRecord, RiskModeConfig};
use aave_positions_snapshot::config::Config;
use aave_positions_snapshot::reserve_configuration::ReserveConfiguration;
use aave_positions_snapshot::snapshot::SnapshotRunner;
use aave_positions_snapshot::tables::SnapshotWriter;
use chrono::NaiveDate;
use tempfile::TempDir;
use web3::types::{Address, U256};

fn addr(n: u64) -> Address {
    Address::from_low_u64_be(n)
}

const WETH: u64 = 0x100;
const WETH_A_TOKEN: u64 = 0x101;
const WETH_DEBT_TOKEN: u64 = 0x102;
const GHO: u64 = 0x200;
const GHO_A_TOKEN: u64 = 0x201;
const GHO_DEBT_TOKEN: u64 = 0x202;
const TREASURY: u64 = 0x7e;

fn test_config(extra: &[(&str, &str)]) -> Config {
    let mut env = HashMap::new();
    env.insert("PROVIDER_URL".to_string(), "http://example.invalid".to_string());
    env.insert("USERS_FILE".to_string(), "unused.csv".to_string());
    env.insert("NETWORK".to_string(), "testnet".to_string());
    env.insert("POOL_ADDRESS".to_string(), format!("{:?}", addr(0x1)));
    env.insert("ADDRESSES_PROVIDER_ADDRESS".to_string(), format!("{:?}", addr(0x2)));
    env.insert("UI_POOL_DATA_PROVIDER_ADDRESS".to_string(), format!("{:?}", addr(0x3)));
    env.insert("TREASURY_COLLECTOR_ADDRESS".to_string(), format!("{:?}", addr(TREASURY)));
    env.insert("NATIVE_STABLE_ASSET".to_string(), format!("{:?}", addr(GHO)));
    env.insert("WORKERS".to_string(), "4".to_string());
    for (key, value) in extra {
        env.insert(key.to_string(), value.to_string());
    }
    Config::from_env_map(env).unwrap()
}

fn reserve_record(decimals: u8, liquidity_index: U256, a_token: u64, debt_token: u64) -> ReserveRecord {
    ReserveRecord {
        configuration: ReserveConfiguration {
            ltv: 8050,
            liquidation_threshold: 8300,
            liquidation_bonus: 10500,
            decimals,
            is_active: true,
            is_frozen: false,
            borrowing_enabled: true,
            reserve_factor: 1500,
        }
        .encode(),
        liquidity_index,
        liquidity_rate: U256::exp10(25),
        variable_borrow_index: U256::exp10(27),
        variable_borrow_rate: U256::exp10(25),
        last_update_timestamp: 1_700_000_000,
        a_token_address: addr(a_token),
        variable_debt_token_address: addr(debt_token),
        interest_rate_strategy_address: addr(0x5),
        accrued_to_treasury: U256::zero(),
    }
}

/// One priced WETH reserve ($2000, liquidity index 1.05) and a GHO reserve.
fn market() -> MockChainClient {
    MockChainClient::new()
        .with_reserve(
            addr(WETH),
            reserve_record(18, U256::from(105u64) * U256::exp10(25), WETH_A_TOKEN, WETH_DEBT_TOKEN),
            U256::from(2000u64) * U256::exp10(8),
        )
        .with_reserve(
            addr(GHO),
            reserve_record(18, U256::exp10(27), GHO_A_TOKEN, GHO_DEBT_TOKEN),
            U256::exp10(8),
        )
        .with_symbol(addr(WETH), "WETH")
        .with_symbol(addr(GHO), "GHO")
        .with_mode(0, RiskModeConfig::default(), "")
        .with_mode(
            1,
            RiskModeConfig {
                ltv: 9300,
                liquidation_threshold: 9500,
                liquidation_bonus: 10100,
            },
            "ETH correlated",
        )
}

#[tokio::test]
async fn test_end_to_end_collateral_position() {
    let user = addr(0xaa);
    let client = market()
        .with_scaled_balance(addr(WETH_A_TOKEN), user, U256::from(2u64) * U256::exp10(18))
        .with_user_mode(user, 1);

    let runner = SnapshotRunner::new(Arc::new(client), test_config(&[]));
    let snapshot = runner.run(&[user], 42).await.unwrap();

    assert_eq!(snapshot.block, 42);
    assert_eq!(snapshot.catalog.len(), 2);
    assert!(snapshot.failed_users.is_empty());
    assert_eq!(snapshot.balances.len(), 1);

    let row = &snapshot.balances[0];
    assert_eq!(row.position.user_address, user);
    assert_eq!(row.position.reserve_address, addr(WETH));
    assert!((row.current_collateral_balance.unwrap() - 2.1).abs() < 1e-12);
    assert!((row.current_collateral_usd.unwrap() - 4200.0).abs() < 1e-9);
    assert_eq!(row.current_debt_balance, Some(0.0));
    assert_eq!(row.current_debt_usd, Some(0.0));

    assert_eq!(snapshot.user_emodes.len(), 1);
    assert_eq!(snapshot.user_emodes[0].emode_id, 1);
    assert_eq!(snapshot.emodes.len(), 1);
    assert_eq!(snapshot.emodes[0].label, "ETH correlated");
}

#[tokio::test]
async fn test_mode_lookup_failure_aborts_run() {
    let good = addr(0xaa);
    let bad = addr(0xbb);
    let client = market()
        .with_scaled_balance(addr(WETH_A_TOKEN), good, U256::exp10(18))
        .with_failing_user(bad);

    // the sweep tolerates the broken user, the mode join does not
    let runner = SnapshotRunner::new(Arc::new(client), test_config(&[]));
    let err = runner.run(&[good, bad], 42).await.unwrap_err();
    assert!(matches!(
        err,
        aave_positions_snapshot::SnapshotError::ModeResolution { user, .. } if user == bad
    ));
}

#[tokio::test]
async fn test_treasury_reads_native_stable_on_underlying() {
    let treasury = addr(TREASURY);
    let client = Arc::new(
        market()
            .with_balance(addr(GHO), treasury, U256::from(10u64) * U256::exp10(18))
            .with_balance(addr(WETH_A_TOKEN), treasury, U256::exp10(18)),
    );

    let runner = SnapshotRunner::new(client.clone(), test_config(&[]));
    let snapshot = runner.run(&[], 42).await.unwrap();

    let gho = snapshot
        .treasury
        .iter()
        .find(|e| e.reserve_address == addr(GHO))
        .unwrap();
    assert_eq!(gho.queried_token, addr(GHO));
    assert_eq!(gho.treasury_balance_usd, 10.0);

    let weth = snapshot
        .treasury
        .iter()
        .find(|e| e.reserve_address == addr(WETH))
        .unwrap();
    assert_eq!(weth.queried_token, addr(WETH_A_TOKEN));
    assert_eq!(weth.treasury_balance_usd, 2000.0);

    let queried: Vec<Address> = client
        .balance_queries()
        .into_iter()
        .filter(|(_, holder)| *holder == treasury)
        .map(|(token, _)| token)
        .collect();
    assert!(queried.contains(&addr(GHO)));
    assert!(!queried.contains(&addr(GHO_A_TOKEN)));
}

#[tokio::test]
async fn test_aggregated_strategy_end_to_end() {
    use aave_positions_snapshot::chain::UserReserveBalance;

    let user = addr(0xaa);
    let client = market().with_user_reserves(
        user,
        vec![UserReserveBalance {
            underlying_asset: addr(WETH),
            scaled_a_token_balance: U256::from(2u64) * U256::exp10(18),
            usage_as_collateral_enabled: true,
            scaled_variable_debt: U256::zero(),
        }],
    );

    let config = test_config(&[("COLLECTION_STRATEGY", "aggregated"), ("INCLUDE_ZERO_EMODE", "false")]);
    let snapshot = SnapshotRunner::new(Arc::new(client), config)
        .run(&[user], 42)
        .await
        .unwrap();

    assert_eq!(snapshot.balances.len(), 1);
    assert_eq!(snapshot.balances[0].position.used_as_collateral, Some(true));
    // user sits in mode 0, which is filtered from the category table
    assert_eq!(snapshot.user_emodes[0].emode_id, 0);
    assert!(snapshot.emodes.is_empty());
}

#[tokio::test]
async fn test_resolve_block_locates_end_of_day() {
    // 2024-01-01T23:59:59Z = 1_704_153_599; blocks every 12s from 1_704_100_000
    let timestamps: Vec<u64> = (0..10_000u64).map(|b| 1_704_100_000 + 12 * b).collect();
    let expected = (1_704_153_599u64 - 1_704_100_000) / 12;

    let runner = SnapshotRunner::new(
        Arc::new(MockChainClient::new().with_block_timestamps(timestamps)),
        test_config(&[("SNAPSHOT_DATE", "2024-01-01"), ("BLOCK_SEARCH_STEP", "1000")]),
    );
    assert_eq!(runner.resolve_block().await.unwrap(), expected);

    let pinned = SnapshotRunner::new(
        Arc::new(MockChainClient::new()),
        test_config(&[("SNAPSHOT_BLOCK", "123")]),
    );
    assert_eq!(pinned.resolve_block().await.unwrap(), 123);
}

#[tokio::test]
async fn test_snapshot_tables_written() {
    let user = addr(0xaa);
    let client = market()
        .with_scaled_balance(addr(WETH_A_TOKEN), user, U256::exp10(18))
        .with_user_mode(user, 1);

    let snapshot = SnapshotRunner::new(Arc::new(client), test_config(&[]))
        .run(&[user], 42)
        .await
        .unwrap();

    let dir = TempDir::new().unwrap();
    let writer = SnapshotWriter::new(dir.path(), NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(), 42);
    let written = snapshot.write(&writer).unwrap();

    assert_eq!(written.len(), 6);
    for path in &written {
        assert!(path.exists(), "{} missing", path.display());
    }

    let reserves = fs::read_to_string(writer.table_path("reserves_data")).unwrap();
    assert_eq!(reserves.lines().count(), 3);
    assert!(reserves.contains("WETH"));
    assert!(reserves.lines().next().unwrap().ends_with(",snapshot_block"));
    for row in reserves.lines().skip(1) {
        assert!(row.ends_with(",42"), "row not stamped with the catalog block: {}", row);
    }
}
