use alloy_primitives::{Address, address};

/// EOS token sale contract on Ethereum mainnet.
pub const EOS_SALE: Address = address!("0xd0a6e6c54dbc68db5db3a091b171a77407ff7ccf");

/// Tokens issued per sale window, in base units (2,000,000 EOS with 18 decimals).
pub const DAILY_CAP_WEI: u128 = 2_000_000 * WEI_PER_ETH_U128;

pub const WEI_PER_ETH_U128: u128 = 1_000_000_000_000_000_000;
pub const WEI_PER_ETH: f64 = 1e18;
pub const WEI_PER_GWEI: f64 = 1e9;

/// The only market pair this monitor follows.
pub const TRADING_PAIR: &str = "EOSETH";

/// The reference snapshot is taken 23 hours back so the index is usually warm
/// before the previous sale window closes.
pub const REFERENCE_LOOKBACK_SECS: u64 = 23 * 3600;
