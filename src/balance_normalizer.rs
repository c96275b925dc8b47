use log::{info, warn};

use crate::types::{NormalizedBalance, RawUserPosition, Reserve, ReserveCatalog, ReserveFields};
use crate::utils::{ray_to_f64, scaled_to_current};

pub const DUST_THRESHOLD_USD: f64 = 0.05;

/// A row is dust when neither side is worth more than `threshold_usd`.
pub fn is_dust(collateral_usd: f64, debt_usd: f64, threshold_usd: f64) -> bool {
    collateral_usd <= threshold_usd && debt_usd <= threshold_usd
}

/// Left-joins raw positions to the catalog and converts scaled balances into
/// current token amounts and USD.
///
/// Positions whose reserve is not in the catalog are kept with empty derived
/// fields; matched positions worth at most `dust_threshold_usd` on both sides
/// are dropped.
pub fn normalize(
    raw: &[RawUserPosition],
    catalog: &ReserveCatalog,
    dust_threshold_usd: f64,
) -> Vec<NormalizedBalance> {
    let mut balances = Vec::with_capacity(raw.len());
    let mut unmatched = 0usize;
    let mut dust = 0usize;

    for position in raw {
        match catalog.get(&position.reserve_address) {
            Some(reserve) => {
                let balance = priced_balance(position, reserve);
                let collateral_usd = balance.current_collateral_usd.unwrap_or_default();
                let debt_usd = balance.current_debt_usd.unwrap_or_default();
                if is_dust(collateral_usd, debt_usd, dust_threshold_usd) {
                    dust += 1;
                    continue;
                }
                balances.push(balance);
            }
            None => {
                unmatched += 1;
                balances.push(NormalizedBalance {
                    position: position.clone(),
                    reserve: None,
                    current_collateral_balance: None,
                    current_debt_balance: None,
                    current_collateral_usd: None,
                    current_debt_usd: None,
                });
            }
        }
    }

    if unmatched > 0 {
        warn!(
            "[BalanceNormalizer::normalize] {} positions reference reserves missing from the catalog at block {}",
            unmatched, catalog.block
        );
    }
    info!(
        "[BalanceNormalizer::normalize] Kept {} of {} positions ({} below {} USD)",
        balances.len(),
        raw.len(),
        dust,
        dust_threshold_usd
    );

    balances
}

fn priced_balance(position: &RawUserPosition, reserve: &Reserve) -> NormalizedBalance {
    let decimals = reserve.decimals();

    let collateral = scaled_to_current(
        position.scaled_collateral_balance,
        decimals,
        reserve.liquidity_index,
    );
    let debt = scaled_to_current(
        position.scaled_debt_balance,
        decimals,
        reserve.variable_borrow_index,
    );

    NormalizedBalance {
        position: position.clone(),
        reserve: Some(ReserveFields {
            symbol: reserve.symbol.clone(),
            name: reserve.name.clone(),
            decimals,
            ltv: reserve.configuration.ltv,
            liquidation_threshold: reserve.configuration.liquidation_threshold,
            liquidation_bonus: reserve.configuration.liquidation_bonus,
            liquidity_index: ray_to_f64(reserve.liquidity_index),
            variable_borrow_index: ray_to_f64(reserve.variable_borrow_index),
            price_usd: reserve.price_usd,
        }),
        current_collateral_balance: Some(collateral),
        current_debt_balance: Some(debt),
        current_collateral_usd: Some(collateral * reserve.price_usd),
        current_debt_usd: Some(debt * reserve.price_usd),
    }
}
