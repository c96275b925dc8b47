use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use ethabi::Token;
use log::{debug, info};
use web3::transports::Http;
use web3::types::{Address, BlockId, BlockNumber, Bytes, CallRequest, U256, U64};
use web3::Web3;

use super::{ChainClient, ChainError, ReserveRecord, RiskModeConfig, UserReserveBalance};
use crate::config::{Config, Deployment};
use crate::error::SnapshotError;

const POOL_ABI: &str = include_str!("abi/pool.json");
const ERC20_ABI: &str = include_str!("abi/erc20.json");
const ORACLE_ABI: &str = include_str!("abi/oracle.json");
const ADDRESSES_PROVIDER_ABI: &str = include_str!("abi/addresses_provider.json");
const UI_POOL_DATA_PROVIDER_ABI: &str = include_str!("abi/ui_pool_data_provider.json");

/// JSON-RPC chain client doing manual `eth_call`s pinned to a block.
pub struct Web3ChainClient {
    web3: Web3<Http>,
    deployment: Deployment,
    pool_abi: ethabi::Contract,
    erc20_abi: ethabi::Contract,
    oracle_abi: ethabi::Contract,
    addresses_provider_abi: ethabi::Contract,
    ui_pool_data_provider_abi: ethabi::Contract,
    call_timeout: Duration,
    retry_max_elapsed: Duration,
}

impl fmt::Debug for Web3ChainClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Web3ChainClient")
            .field("deployment", &self.deployment)
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

impl Web3ChainClient {
    pub fn new(config: &Config) -> Result<Self, ChainError> {
        let transport = Http::new(&config.provider_url)?;

        Ok(Self {
            web3: Web3::new(transport),
            deployment: config.deployment.clone(),
            pool_abi: ethabi::Contract::load(POOL_ABI.as_bytes())?,
            erc20_abi: ethabi::Contract::load(ERC20_ABI.as_bytes())?,
            oracle_abi: ethabi::Contract::load(ORACLE_ABI.as_bytes())?,
            addresses_provider_abi: ethabi::Contract::load(ADDRESSES_PROVIDER_ABI.as_bytes())?,
            ui_pool_data_provider_abi: ethabi::Contract::load(
                UI_POOL_DATA_PROVIDER_ABI.as_bytes(),
            )?,
            call_timeout: config.call_timeout,
            retry_max_elapsed: config.call_retry_max_elapsed,
        })
    }

    /// Builds the client and checks the endpoint answers before any stage runs.
    pub async fn connect(config: &Config) -> Result<Self, SnapshotError> {
        let client =
            Self::new(config).map_err(|e| SnapshotError::Connectivity(e.to_string()))?;
        let head = client
            .latest_block()
            .await
            .map_err(|e| SnapshotError::Connectivity(e.to_string()))?;

        info!(
            "[Web3ChainClient::connect] Connected to {} network, head block {}",
            client.deployment.network, head
        );
        Ok(client)
    }

    async fn rpc<T, F, Fut>(&self, request: F) -> Result<T, ChainError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = web3::Result<T>>,
    {
        with_retry(retry_policy(self.retry_max_elapsed), self.call_timeout, request).await
    }

    async fn call(
        &self,
        abi: &ethabi::Contract,
        to: Address,
        name: &str,
        params: &[Token],
        block: u64,
    ) -> Result<Vec<Token>, ChainError> {
        let function = abi.function(name)?;
        let encoded_data = function.encode_input(params)?;

        debug!(
            "[Web3ChainClient::call] {} on {:?} at block {}",
            name, to, block
        );

        let raw_bytes = self
            .rpc(|| {
                let call_req = CallRequest {
                    from: None,
                    to: Some(to),
                    gas: None,
                    gas_price: None,
                    value: None,
                    data: Some(Bytes(encoded_data.clone())),
                    transaction_type: None,
                    access_list: None,
                    max_fee_per_gas: None,
                    max_priority_fee_per_gas: None,
                };
                self.web3.eth().call(call_req, Some(block_id(block)))
            })
            .await?;

        Ok(function.decode_output(&raw_bytes.0)?)
    }

    async fn call_uint(
        &self,
        abi: &ethabi::Contract,
        to: Address,
        name: &str,
        params: &[Token],
        block: u64,
    ) -> Result<U256, ChainError> {
        let tokens = self.call(abi, to, name, params, block).await?;
        uint(first(tokens, name)?, name)
    }

    async fn call_string(
        &self,
        abi: &ethabi::Contract,
        to: Address,
        name: &str,
        params: &[Token],
        block: u64,
    ) -> Result<String, ChainError> {
        let tokens = self.call(abi, to, name, params, block).await?;
        first(tokens, name)?
            .into_string()
            .ok_or_else(|| ChainError::Decode(format!("{}: expected string", name)))
    }
}

#[async_trait]
impl ChainClient for Web3ChainClient {
    async fn latest_block(&self) -> Result<u64, ChainError> {
        let number: U64 = self.rpc(|| self.web3.eth().block_number()).await?;
        Ok(number.as_u64())
    }

    async fn block_timestamp(&self, block: u64) -> Result<u64, ChainError> {
        let header = self
            .rpc(|| self.web3.eth().block(block_id(block)))
            .await?
            .ok_or(ChainError::MissingBlock(block))?;
        Ok(header.timestamp.low_u64())
    }

    async fn list_reserves(&self, block: u64) -> Result<Vec<Address>, ChainError> {
        let tokens = self
            .call(
                &self.pool_abi,
                self.deployment.pool,
                "getReservesList",
                &[],
                block,
            )
            .await?;

        array(first(tokens, "getReservesList")?, "getReservesList")?
            .into_iter()
            .map(|token| address(token, "getReservesList"))
            .collect()
    }

    async fn get_reserve_record(
        &self,
        reserve: Address,
        block: u64,
    ) -> Result<ReserveRecord, ChainError> {
        let tokens = self
            .call(
                &self.pool_abi,
                self.deployment.pool,
                "getReserveData",
                &[Token::Address(reserve)],
                block,
            )
            .await?;

        let fields = tuple(first(tokens, "getReserveData")?, "getReserveData")?;
        if fields.len() < 13 {
            return Err(ChainError::Decode(format!(
                "getReserveData: expected at least 13 fields, got {}",
                fields.len()
            )));
        }
        let mut fields = fields.into_iter();
        let mut next = || {
            fields
                .next()
                .ok_or_else(|| ChainError::Decode("getReserveData: truncated".to_string()))
        };

        let configuration = first(tuple(next()?, "configuration")?, "configuration")?;
        let configuration = uint(configuration, "configuration")?;
        let liquidity_index = uint(next()?, "liquidityIndex")?;
        let liquidity_rate = uint(next()?, "currentLiquidityRate")?;
        let variable_borrow_index = uint(next()?, "variableBorrowIndex")?;
        let variable_borrow_rate = uint(next()?, "currentVariableBorrowRate")?;
        let _stable_borrow_rate = next()?;
        let last_update_timestamp = uint(next()?, "lastUpdateTimestamp")?.low_u64();
        let _id = next()?;
        let a_token_address = address(next()?, "aTokenAddress")?;
        let _stable_debt_token_address = next()?;
        let variable_debt_token_address = address(next()?, "variableDebtTokenAddress")?;
        let interest_rate_strategy_address = address(next()?, "interestRateStrategyAddress")?;
        let accrued_to_treasury = uint(next()?, "accruedToTreasury")?;

        Ok(ReserveRecord {
            configuration,
            liquidity_index,
            liquidity_rate,
            variable_borrow_index,
            variable_borrow_rate,
            last_update_timestamp,
            a_token_address,
            variable_debt_token_address,
            interest_rate_strategy_address,
            accrued_to_treasury,
        })
    }

    async fn get_user_reserve_balances(
        &self,
        addresses_provider: Address,
        user: Address,
        block: u64,
    ) -> Result<Vec<UserReserveBalance>, ChainError> {
        let tokens = self
            .call(
                &self.ui_pool_data_provider_abi,
                self.deployment.ui_pool_data_provider,
                "getUserReservesData",
                &[Token::Address(addresses_provider), Token::Address(user)],
                block,
            )
            .await?;

        let entries = array(first(tokens, "getUserReservesData")?, "getUserReservesData")?;
        let mut balances = Vec::with_capacity(entries.len());
        for entry in entries {
            match tuple(entry, "UserReserveData")?.as_slice() {
                [Token::Address(asset), Token::Uint(scaled_a), Token::Bool(collateral), Token::Uint(scaled_debt), ..] => {
                    balances.push(UserReserveBalance {
                        underlying_asset: *asset,
                        scaled_a_token_balance: *scaled_a,
                        usage_as_collateral_enabled: *collateral,
                        scaled_variable_debt: *scaled_debt,
                    })
                }
                other => {
                    return Err(ChainError::Decode(format!(
                        "UserReserveData: unexpected fields {:?}",
                        other
                    )))
                }
            }
        }
        Ok(balances)
    }

    async fn get_user_risk_mode(&self, user: Address, block: u64) -> Result<u8, ChainError> {
        let mode = self
            .call_uint(
                &self.pool_abi,
                self.deployment.pool,
                "getUserEMode",
                &[Token::Address(user)],
                block,
            )
            .await?;

        if mode > U256::from(u8::MAX) {
            return Err(ChainError::Decode(format!(
                "getUserEMode: id {} does not fit in uint8",
                mode
            )));
        }
        Ok(mode.low_u32() as u8)
    }

    async fn get_risk_mode_config(
        &self,
        mode_id: u8,
        block: u64,
    ) -> Result<RiskModeConfig, ChainError> {
        let name = "getEModeCategoryCollateralConfig";
        let tokens = self
            .call(
                &self.pool_abi,
                self.deployment.pool,
                name,
                &[Token::Uint(U256::from(mode_id))],
                block,
            )
            .await?;

        match tuple(first(tokens, name)?, name)?.as_slice() {
            [Token::Uint(ltv), Token::Uint(threshold), Token::Uint(bonus)] => Ok(RiskModeConfig {
                ltv: ltv.low_u32() as u16,
                liquidation_threshold: threshold.low_u32() as u16,
                liquidation_bonus: bonus.low_u32() as u16,
            }),
            other => Err(ChainError::Decode(format!(
                "{}: unexpected fields {:?}",
                name, other
            ))),
        }
    }

    async fn get_risk_mode_label(&self, mode_id: u8, block: u64) -> Result<String, ChainError> {
        self.call_string(
            &self.pool_abi,
            self.deployment.pool,
            "getEModeCategoryLabel",
            &[Token::Uint(U256::from(mode_id))],
            block,
        )
        .await
    }

    async fn token_balance_of(
        &self,
        token: Address,
        holder: Address,
        block: u64,
    ) -> Result<U256, ChainError> {
        self.call_uint(
            &self.erc20_abi,
            token,
            "balanceOf",
            &[Token::Address(holder)],
            block,
        )
        .await
    }

    async fn token_scaled_balance_of(
        &self,
        token: Address,
        user: Address,
        block: u64,
    ) -> Result<U256, ChainError> {
        self.call_uint(
            &self.erc20_abi,
            token,
            "scaledBalanceOf",
            &[Token::Address(user)],
            block,
        )
        .await
    }

    async fn token_scaled_total_supply(
        &self,
        token: Address,
        block: u64,
    ) -> Result<U256, ChainError> {
        self.call_uint(&self.erc20_abi, token, "scaledTotalSupply", &[], block)
            .await
    }

    async fn token_symbol(&self, token: Address, block: u64) -> Result<String, ChainError> {
        self.call_string(&self.erc20_abi, token, "symbol", &[], block)
            .await
    }

    async fn token_name(&self, token: Address, block: u64) -> Result<String, ChainError> {
        self.call_string(&self.erc20_abi, token, "name", &[], block)
            .await
    }

    async fn get_asset_prices(
        &self,
        oracle: Address,
        assets: &[Address],
        block: u64,
    ) -> Result<Vec<U256>, ChainError> {
        let assets = Token::Array(assets.iter().copied().map(Token::Address).collect());
        let tokens = self
            .call(&self.oracle_abi, oracle, "getAssetsPrices", &[assets], block)
            .await?;

        array(first(tokens, "getAssetsPrices")?, "getAssetsPrices")?
            .into_iter()
            .map(|token| uint(token, "getAssetsPrices"))
            .collect()
    }

    async fn get_base_currency_unit(
        &self,
        oracle: Address,
        block: u64,
    ) -> Result<U256, ChainError> {
        self.call_uint(&self.oracle_abi, oracle, "BASE_CURRENCY_UNIT", &[], block)
            .await
    }

    async fn get_price_oracle_address(&self, block: u64) -> Result<Address, ChainError> {
        let tokens = self
            .call(
                &self.addresses_provider_abi,
                self.deployment.addresses_provider,
                "getPriceOracle",
                &[],
                block,
            )
            .await?;
        address(first(tokens, "getPriceOracle")?, "getPriceOracle")
    }
}

fn retry_policy(max_elapsed: Duration) -> ExponentialBackoff {
    ExponentialBackoff {
        max_elapsed_time: Some(max_elapsed),
        ..Default::default()
    }
}

/// Runs one RPC request with a per-attempt timeout, retrying transient
/// failures until `policy` gives up.
async fn with_retry<T, F, Fut>(
    policy: ExponentialBackoff,
    call_timeout: Duration,
    request: F,
) -> Result<T, ChainError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = web3::Result<T>>,
{
    retry(policy, || async {
        match tokio::time::timeout(call_timeout, request()).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(classify(err)),
            Err(_) => Err(backoff::Error::transient(ChainError::Timeout)),
        }
    })
    .await
}

fn block_id(block: u64) -> BlockId {
    BlockId::Number(BlockNumber::Number(U64::from(block)))
}

/// Reverts and malformed responses are permanent; everything else may be retried.
fn classify(err: web3::Error) -> backoff::Error<ChainError> {
    match err {
        web3::Error::Rpc(_) | web3::Error::Decoder(_) | web3::Error::InvalidResponse(_) => {
            backoff::Error::permanent(ChainError::from(err))
        }
        other => backoff::Error::transient(ChainError::from(other)),
    }
}

fn first(tokens: Vec<Token>, what: &str) -> Result<Token, ChainError> {
    tokens
        .into_iter()
        .next()
        .ok_or_else(|| ChainError::Decode(format!("{}: no output tokens", what)))
}

fn uint(token: Token, what: &str) -> Result<U256, ChainError> {
    token
        .into_uint()
        .ok_or_else(|| ChainError::Decode(format!("{}: expected uint", what)))
}

fn address(token: Token, what: &str) -> Result<Address, ChainError> {
    token
        .into_address()
        .ok_or_else(|| ChainError::Decode(format!("{}: expected address", what)))
}

fn array(token: Token, what: &str) -> Result<Vec<Token>, ChainError> {
    token
        .into_array()
        .ok_or_else(|| ChainError::Decode(format!("{}: expected array", what)))
}

fn tuple(token: Token, what: &str) -> Result<Vec<Token>, ChainError> {
    token
        .into_tuple()
        .ok_or_else(|| ChainError::Decode(format!("{}: expected tuple", what)))
}
