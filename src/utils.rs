use web3::types::U256;

pub const RAY: f64 = 1e27;

/// Nearest `f64` to `value`.
pub fn u256_to_f64(value: U256) -> f64 {
    if value.bits() <= 128 {
        value.as_u128() as f64
    } else {
        // decimal parsing rounds correctly; U256 always renders as plain digits
        value.to_string().parse::<f64>().unwrap_or(f64::INFINITY)
    }
}

/// Ray-denominated index as a plain multiplier (1e27 -> 1.0).
pub fn ray_to_f64(ray_value: U256) -> f64 {
    u256_to_f64(ray_value) / RAY
}

/// Token units to a human-readable amount using `10^decimals`.
pub fn to_token_amount(raw: U256, decimals: u8) -> f64 {
    u256_to_f64(raw) / 10f64.powi(i32::from(decimals))
}

/// Interest-accrued amount of a scaled balance.
pub fn scaled_to_current(scaled: U256, decimals: u8, index: U256) -> f64 {
    to_token_amount(scaled, decimals) * ray_to_f64(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pow10(exp: usize) -> U256 {
        U256::exp10(exp)
    }

    #[test]
    fn test_u256_to_f64_small_and_large() {
        assert_eq!(u256_to_f64(U256::zero()), 0.0);
        assert_eq!(u256_to_f64(pow10(18)), 1e18);
        assert_eq!(u256_to_f64(pow10(27)), 1e27);
        assert_eq!(u256_to_f64(pow10(60)), 1e60);
        assert!(u256_to_f64(U256::MAX).is_finite());
    }

    #[test]
    fn test_scaled_to_current_unit_index_is_exact() {
        let amount = scaled_to_current(pow10(18), 18, pow10(27));
        assert_eq!(amount, 1.0);
    }

    #[test]
    fn test_scaled_to_current_applies_index() {
        let index = U256::from(105u64) * pow10(25);
        let amount = scaled_to_current(U256::from(2u64) * pow10(18), 18, index);
        assert!((amount - 2.1).abs() < 1e-12);
    }

    #[test]
    fn test_to_token_amount_uses_power_of_ten() {
        // 6-decimal token: 2_500_000 units is 2.5 tokens, not 2_500_000 / 6
        assert_eq!(to_token_amount(U256::from(2_500_000u64), 6), 2.5);
        assert_eq!(to_token_amount(U256::from(42u64), 0), 42.0);
    }
}
