use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveDate;
use thiserror::Error;
use web3::types::Address;

/// Contract addresses of one market deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub network: String,
    pub pool: Address,
    pub addresses_provider: Address,
    pub ui_pool_data_provider: Address,
    pub treasury_collector: Address,
    /// Reserve without a separate interest-bearing token; its treasury
    /// balance is read on the underlying asset.
    pub native_stable_asset: Option<Address>,
}

const ETHEREUM_POOL: &str = "0x87870Bca3F3fD6335C3F4ce8392D69350B4fA4E2";
const ETHEREUM_ADDRESSES_PROVIDER: &str = "0x2f39d218133AFaB8F2B819B1066c7E434Ad94E9e";
const ETHEREUM_UI_POOL_DATA_PROVIDER: &str = "0x3F78BBD206e4D3c504Eb854232EdA7e47E9Fd8FC";
const ETHEREUM_TREASURY_COLLECTOR: &str = "0x464C71f6c2F760DdA6093dCB91C24c39e5d6e18c";
const ETHEREUM_GHO: &str = "0x40D16FC0246aD3160Ccc09B8D0D3A2cD28aE6C2f";

impl Deployment {
    /// Built-in addresses for a known network.
    pub fn for_network(network: &str) -> Result<Option<Self>, ConfigError> {
        match network {
            "ethereum" | "mainnet" => Ok(Some(Deployment {
                network: "ethereum".to_string(),
                pool: parse_address("POOL_ADDRESS", ETHEREUM_POOL)?,
                addresses_provider: parse_address(
                    "ADDRESSES_PROVIDER_ADDRESS",
                    ETHEREUM_ADDRESSES_PROVIDER,
                )?,
                ui_pool_data_provider: parse_address(
                    "UI_POOL_DATA_PROVIDER_ADDRESS",
                    ETHEREUM_UI_POOL_DATA_PROVIDER,
                )?,
                treasury_collector: parse_address(
                    "TREASURY_COLLECTOR_ADDRESS",
                    ETHEREUM_TREASURY_COLLECTOR,
                )?,
                native_stable_asset: Some(parse_address("NATIVE_STABLE_ASSET", ETHEREUM_GHO)?),
            })),
            _ => Ok(None),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionStrategy {
    /// `scaledBalanceOf` on every aToken and variable debt token.
    PerToken,
    /// One `getUserReservesData` call per user on the UI data provider.
    Aggregated,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub provider_url: String,
    pub users_file: String,
    pub output_dir: String,
    pub snapshot_date: NaiveDate,
    pub snapshot_block: Option<u64>,
    pub deployment: Deployment,
    pub workers: usize,
    pub block_search_step: u64,
    pub max_step_backs: u32,
    pub call_timeout: Duration,
    pub call_retry_max_elapsed: Duration,
    pub user_timeout: Duration,
    pub collection_strategy: CollectionStrategy,
    pub dust_threshold_usd: f64,
    pub include_zero_emode: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_map(std::env::vars().collect())
    }

    pub fn from_env_map(env_map: HashMap<String, String>) -> Result<Self, ConfigError> {
        let provider_url = required(&env_map, "PROVIDER_URL")?;
        url::Url::parse(&provider_url).map_err(|e| {
            ConfigError::InvalidValue("PROVIDER_URL".to_string(), e.to_string())
        })?;

        let users_file = required(&env_map, "USERS_FILE")?;

        let output_dir = env_map
            .get("OUTPUT_DIR")
            .cloned()
            .unwrap_or_else(|| "./snapshots".to_string());

        let snapshot_date = match env_map.get("SNAPSHOT_DATE") {
            Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
                ConfigError::InvalidValue(
                    "SNAPSHOT_DATE".to_string(),
                    "must be formatted as YYYY-MM-DD".to_string(),
                )
            })?,
            None => chrono::Utc::now().date_naive() - chrono::Duration::days(1),
        };

        let snapshot_block = match env_map.get("SNAPSHOT_BLOCK") {
            Some(raw) => Some(raw.parse::<u64>().map_err(|_| {
                ConfigError::InvalidValue(
                    "SNAPSHOT_BLOCK".to_string(),
                    "must be a valid u64".to_string(),
                )
            })?),
            None => None,
        };

        let deployment = deployment_from_map(&env_map)?;

        let workers = parse_or(&env_map, "WORKERS", 16usize)?;
        if workers == 0 {
            return Err(ConfigError::InvalidValue(
                "WORKERS".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let block_search_step = parse_or(&env_map, "BLOCK_SEARCH_STEP", 7200u64)?;
        if block_search_step == 0 {
            return Err(ConfigError::InvalidValue(
                "BLOCK_SEARCH_STEP".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let max_step_backs = parse_or(&env_map, "MAX_STEP_BACKS", 1000u32)?;
        let call_timeout = Duration::from_secs(parse_or(&env_map, "CALL_TIMEOUT_SECS", 30u64)?);
        let call_retry_max_elapsed =
            Duration::from_secs(parse_or(&env_map, "CALL_RETRY_MAX_ELAPSED_SECS", 60u64)?);
        let user_timeout = Duration::from_secs(parse_or(&env_map, "USER_TIMEOUT_SECS", 300u64)?);

        let collection_strategy = match env_map
            .get("COLLECTION_STRATEGY")
            .map(|s| s.as_str())
            .unwrap_or("per_token")
        {
            "per_token" => CollectionStrategy::PerToken,
            "aggregated" => CollectionStrategy::Aggregated,
            other => {
                return Err(ConfigError::InvalidValue(
                    "COLLECTION_STRATEGY".to_string(),
                    format!("must be per_token or aggregated, got {}", other),
                ))
            }
        };

        let dust_threshold_usd = parse_or(&env_map, "DUST_THRESHOLD_USD", 0.05f64)?;
        if !dust_threshold_usd.is_finite() || dust_threshold_usd < 0.0 {
            return Err(ConfigError::InvalidValue(
                "DUST_THRESHOLD_USD".to_string(),
                "must be a finite, non-negative number".to_string(),
            ));
        }

        let include_zero_emode = parse_or(&env_map, "INCLUDE_ZERO_EMODE", true)?;

        Ok(Config {
            provider_url,
            users_file,
            output_dir,
            snapshot_date,
            snapshot_block,
            deployment,
            workers,
            block_search_step,
            max_step_backs,
            call_timeout,
            call_retry_max_elapsed,
            user_timeout,
            collection_strategy,
            dust_threshold_usd,
            include_zero_emode,
        })
    }
}

/// Network preset with per-address overrides; unknown networks need every address.
fn deployment_from_map(env_map: &HashMap<String, String>) -> Result<Deployment, ConfigError> {
    let network = env_map
        .get("NETWORK")
        .cloned()
        .unwrap_or_else(|| "ethereum".to_string());

    let preset = Deployment::for_network(&network)?;

    let pick = |key: &str, fallback: Option<Address>| -> Result<Address, ConfigError> {
        match (env_map.get(key), fallback) {
            (Some(raw), _) => parse_address(key, raw),
            (None, Some(addr)) => Ok(addr),
            (None, None) => Err(ConfigError::MissingEnv(key.to_string())),
        }
    };

    let native_stable_asset = match env_map.get("NATIVE_STABLE_ASSET").map(|s| s.trim()) {
        Some("") | Some("none") => None,
        Some(raw) => Some(parse_address("NATIVE_STABLE_ASSET", raw)?),
        None => preset.as_ref().and_then(|d| d.native_stable_asset),
    };

    Ok(Deployment {
        pool: pick("POOL_ADDRESS", preset.as_ref().map(|d| d.pool))?,
        addresses_provider: pick(
            "ADDRESSES_PROVIDER_ADDRESS",
            preset.as_ref().map(|d| d.addresses_provider),
        )?,
        ui_pool_data_provider: pick(
            "UI_POOL_DATA_PROVIDER_ADDRESS",
            preset.as_ref().map(|d| d.ui_pool_data_provider),
        )?,
        treasury_collector: pick(
            "TREASURY_COLLECTOR_ADDRESS",
            preset.as_ref().map(|d| d.treasury_collector),
        )?,
        native_stable_asset,
        network: preset.map(|d| d.network).unwrap_or(network),
    })
}

fn required(env_map: &HashMap<String, String>, key: &str) -> Result<String, ConfigError> {
    env_map
        .get(key)
        .cloned()
        .ok_or_else(|| ConfigError::MissingEnv(key.to_string()))
}

fn parse_or<T: FromStr>(
    env_map: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match env_map.get(key) {
        Some(raw) => raw.trim().parse::<T>().map_err(|_| {
            ConfigError::InvalidValue(key.to_string(), format!("cannot parse {:?}", raw))
        }),
        None => Ok(default),
    }
}

fn parse_address(key: &str, raw: &str) -> Result<Address, ConfigError> {
    raw.trim()
        .parse::<Address>()
        .map_err(|_| ConfigError::InvalidValue(key.to_string(), format!("not an address: {}", raw)))
}
