use crate::data_sync::market::MarketVenue;
use crate::utils::config_loader::load_from_file;
use crate::utils::constants::{DAILY_CAP_WEI, EOS_SALE};
use alloy_primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Runtime configuration for the monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// WebSocket RPC URL for newHeads / pending transaction subscriptions
    pub rpc_wss_url: String,
    /// HTTP RPC URL for block, transaction and contract reads
    pub rpc_http_url: String,
    /// Crowdsale contract receiving contributions
    pub sale_address: Address,
    /// Tokens issued per sale window (base units, decimal string)
    pub daily_cap_wei: String,
    /// Market venues polled for price and depth, first one with a price wins
    pub providers: Vec<MarketVenue>,
    pub market_poll_interval_secs: u64,
    pub reference_interval_secs: u64,
    /// Number of head blocks sampled for the average block time
    pub avg_block_sample_size: u64,
    pub http_timeout_secs: u64,
    pub ws_connection_timeout_secs: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_secs: u64,
    /// Buffer size for the block and pending transaction channels
    pub channel_buffer_size: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            rpc_wss_url: "ws://127.0.0.1:8546".to_string(),
            rpc_http_url: "http://127.0.0.1:8545".to_string(),
            sale_address: EOS_SALE,
            daily_cap_wei: DAILY_CAP_WEI.to_string(),
            providers: vec![MarketVenue::Binance],
            market_poll_interval_secs: 10,
            reference_interval_secs: 60,
            avg_block_sample_size: 100,
            http_timeout_secs: 10,
            ws_connection_timeout_secs: 30,
            max_reconnect_attempts: 5,
            reconnect_delay_secs: 2,
            channel_buffer_size: 100,
        }
    }
}

impl MonitorConfig {
    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> eyre::Result<Self> {
        let mut config = Self::default();

        if let Ok(rpc_wss_url) = std::env::var("RPC_WSS_URL") {
            config.rpc_wss_url = rpc_wss_url;
        }

        if let Ok(rpc_http_url) = std::env::var("RPC_HTTP_URL") {
            config.rpc_http_url = rpc_http_url;
        }

        if let Ok(sale_address) = std::env::var("SALE_ADDRESS") {
            config.sale_address = sale_address.parse()
                .map_err(|e| eyre::eyre!("Invalid SALE_ADDRESS: {}", e))?;
        }

        if let Ok(daily_cap) = std::env::var("DAILY_CAP_WEI") {
            config.daily_cap_wei = daily_cap;
        }

        if let Ok(providers) = std::env::var("MARKET_PROVIDERS") {
            config.providers = providers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(MarketVenue::from_str)
                .collect::<Result<_, _>>()
                .map_err(|e| eyre::eyre!("Invalid MARKET_PROVIDERS: {}", e))?;
        }

        if let Ok(interval) = std::env::var("MARKET_POLL_INTERVAL_SECS") {
            config.market_poll_interval_secs = interval.parse()
                .map_err(|e| eyre::eyre!("Invalid MARKET_POLL_INTERVAL_SECS: {}", e))?;
        }

        if let Ok(interval) = std::env::var("REFERENCE_INTERVAL_SECS") {
            config.reference_interval_secs = interval.parse()
                .map_err(|e| eyre::eyre!("Invalid REFERENCE_INTERVAL_SECS: {}", e))?;
        }

        if let Ok(timeout_str) = std::env::var("HTTP_TIMEOUT_SECS") {
            config.http_timeout_secs = timeout_str.parse()
                .map_err(|e| eyre::eyre!("Invalid HTTP_TIMEOUT_SECS: {}", e))?;
        }

        if let Ok(max_attempts_str) = std::env::var("MAX_RECONNECT_ATTEMPTS") {
            config.max_reconnect_attempts = max_attempts_str.parse()
                .map_err(|e| eyre::eyre!("Invalid MAX_RECONNECT_ATTEMPTS: {}", e))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load a TOML configuration file. Missing keys fall back to defaults.
    pub async fn from_file(path: impl AsRef<Path>) -> eyre::Result<Self> {
        let config: Self = load_from_file(path).await?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> eyre::Result<()> {
        let _url = Url::parse(&self.rpc_wss_url)
            .map_err(|e| eyre::eyre!("Invalid rpc_wss_url: {}", e))?;
        let _url = Url::parse(&self.rpc_http_url)
            .map_err(|e| eyre::eyre!("Invalid rpc_http_url: {}", e))?;

        if self.daily_cap()?.is_zero() {
            return Err(eyre::eyre!("daily_cap_wei must be non-zero"));
        }
        if self.providers.is_empty() {
            return Err(eyre::eyre!("at least one market provider is required"));
        }
        if self.avg_block_sample_size < 2 {
            return Err(eyre::eyre!("avg_block_sample_size must be at least 2"));
        }
        if self.market_poll_interval_secs == 0 || self.reference_interval_secs == 0 {
            return Err(eyre::eyre!("poll intervals must be at least one second"));
        }
        Ok(())
    }

    pub fn daily_cap(&self) -> eyre::Result<U256> {
        U256::from_str_radix(&self.daily_cap_wei, 10)
            .map_err(|e| eyre::eyre!("Invalid daily_cap_wei: {}", e))
    }

    pub fn market_poll_interval(&self) -> Duration {
        Duration::from_secs(self.market_poll_interval_secs)
    }

    pub fn reference_interval(&self) -> Duration {
        Duration::from_secs(self.reference_interval_secs)
    }

    pub fn ws_connection_timeout(&self) -> Duration {
        Duration::from_secs(self.ws_connection_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}
