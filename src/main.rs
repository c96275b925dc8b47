use std::sync::Arc;

use log::info;

use aave_positions_snapshot::chain::{ChainClient, Web3ChainClient};
use aave_positions_snapshot::config::Config;
use aave_positions_snapshot::snapshot::SnapshotRunner;
use aave_positions_snapshot::tables::{read_users, SnapshotWriter};
use aave_positions_snapshot::types::Result;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    info!("[main] Starting up...");

    let config = Config::from_env()?;

    // fails before any stage if the endpoint is unreachable
    let client: Arc<dyn ChainClient> = Arc::new(Web3ChainClient::connect(&config).await?);

    let runner = SnapshotRunner::new(client, config.clone());
    let block = runner.resolve_block().await?;

    info!("[main] Extracting users list from {}", config.users_file);
    let users = read_users(&config.users_file)?;

    let snapshot = runner.run(&users, block).await?;

    let writer = SnapshotWriter::new(&config.output_dir, config.snapshot_date, block);
    let written = snapshot.write(&writer)?;

    info!(
        "[main] Snapshot of {} at block {}: {} balances, {} failed users, {} reserves, {} tables written under {}",
        config.snapshot_date,
        block,
        snapshot.balances.len(),
        snapshot.failed_users.len(),
        snapshot.catalog.len(),
        written.len(),
        config.output_dir
    );
    Ok(())
}
