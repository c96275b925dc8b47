//! Packed reserve configuration word.
//!
//! | field                 | bits  |
//! |-----------------------|-------|
//! | base LTV              | 0-15  |
//! | liquidation threshold | 16-31 |
//! | liquidation bonus     | 32-47 |
//! | decimals              | 48-55 |
//! | active                | 56    |
//! | frozen                | 57    |
//! | borrowing enabled     | 58    |
//! | reserve factor        | 64-79 |

use web3::types::U256;

const LTV_START: usize = 0;
const LIQUIDATION_THRESHOLD_START: usize = 16;
const LIQUIDATION_BONUS_START: usize = 32;
const DECIMALS_START: usize = 48;
const IS_ACTIVE_BIT: usize = 56;
const IS_FROZEN_BIT: usize = 57;
const BORROWING_ENABLED_BIT: usize = 58;
const RESERVE_FACTOR_START: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReserveConfiguration {
    pub ltv: u16,
    pub liquidation_threshold: u16,
    pub liquidation_bonus: u16,
    pub decimals: u8,
    pub is_active: bool,
    pub is_frozen: bool,
    pub borrowing_enabled: bool,
    pub reserve_factor: u16,
}

impl ReserveConfiguration {
    /// Extracts the fields by shift and mask; bits outside the layout are ignored.
    pub fn decode(word: U256) -> Self {
        Self {
            ltv: field(word, LTV_START, 16) as u16,
            liquidation_threshold: field(word, LIQUIDATION_THRESHOLD_START, 16) as u16,
            liquidation_bonus: field(word, LIQUIDATION_BONUS_START, 16) as u16,
            decimals: field(word, DECIMALS_START, 8) as u8,
            is_active: word.bit(IS_ACTIVE_BIT),
            is_frozen: word.bit(IS_FROZEN_BIT),
            borrowing_enabled: word.bit(BORROWING_ENABLED_BIT),
            reserve_factor: field(word, RESERVE_FACTOR_START, 16) as u16,
        }
    }

    pub fn encode(&self) -> U256 {
        let flag = |set: bool, bit: usize| {
            if set {
                U256::one() << bit
            } else {
                U256::zero()
            }
        };

        (U256::from(self.ltv) << LTV_START)
            | (U256::from(self.liquidation_threshold) << LIQUIDATION_THRESHOLD_START)
            | (U256::from(self.liquidation_bonus) << LIQUIDATION_BONUS_START)
            | (U256::from(self.decimals) << DECIMALS_START)
            | flag(self.is_active, IS_ACTIVE_BIT)
            | flag(self.is_frozen, IS_FROZEN_BIT)
            | flag(self.borrowing_enabled, BORROWING_ENABLED_BIT)
            | (U256::from(self.reserve_factor) << RESERVE_FACTOR_START)
    }
}

fn field(word: U256, start: usize, width: usize) -> u64 {
    let mask = (U256::one() << width) - U256::one();
    ((word >> start) & mask).low_u64()
}
