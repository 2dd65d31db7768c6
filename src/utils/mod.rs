pub mod config_loader;
pub mod constants;
pub mod units;

pub use config_loader::*;
pub use constants::*;
pub use units::{ratio, u256_to_f64, wei_to_eth};
