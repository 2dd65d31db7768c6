use alloy_primitives::U256;

use super::constants::WEI_PER_ETH;

/// Lossy conversion used for display math. Values above 2^53 lose precision,
/// which is acceptable for prices shown to 8 decimals.
pub fn u256_to_f64(value: U256) -> f64 {
    if let Ok(small) = u128::try_from(value) {
        return small as f64;
    }
    value.to_string().parse::<f64>().unwrap_or(f64::MAX)
}

pub fn wei_to_eth(value: U256) -> f64 {
    u256_to_f64(value) / WEI_PER_ETH
}

/// `numerator / denominator` as a float, zero when the denominator is zero.
pub fn ratio(numerator: U256, denominator: U256) -> f64 {
    if denominator.is_zero() {
        return 0.0;
    }
    u256_to_f64(numerator) / u256_to_f64(denominator)
}
