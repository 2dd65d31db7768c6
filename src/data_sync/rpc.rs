use crate::error::{MonitorError, MonitorResult};
use alloy_primitives::{Address, B256, Bytes, U64, U256};
use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Block at which a read is evaluated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockRef {
    Latest,
    Number(u64),
}

impl BlockRef {
    pub fn is_latest(&self) -> bool {
        matches!(self, Self::Latest)
    }

    /// JSON-RPC block parameter
    pub fn to_param(&self) -> String {
        match self {
            Self::Latest => "latest".to_string(),
            Self::Number(num) => format!("0x{:x}", num),
        }
    }
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => write!(f, "latest"),
            Self::Number(num) => write!(f, "#{}", num),
        }
    }
}

impl From<u64> for BlockRef {
    fn from(number: u64) -> Self {
        Self::Number(number)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTransaction {
    pub hash: B256,
    pub to: Option<Address>,
    pub value: U256,
    /// Legacy or effective gas price in wei
    pub gas_price: Option<u128>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockTransactions {
    Hashes(Vec<B256>),
    Full(Vec<ChainTransaction>),
}

impl BlockTransactions {
    pub fn hashes(&self) -> Vec<B256> {
        match self {
            Self::Hashes(hashes) => hashes.clone(),
            Self::Full(txs) => txs.iter().map(|tx| tx.hash).collect(),
        }
    }

    /// Gas prices of the block's transactions, empty when only hashes were fetched
    pub fn gas_prices(&self) -> Vec<u128> {
        match self {
            Self::Hashes(_) => Vec::new(),
            Self::Full(txs) => txs.iter().filter_map(|tx| tx.gas_price).collect(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Hashes(hashes) => hashes.len(),
            Self::Full(txs) => txs.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainBlock {
    pub number: u64,
    /// Unix seconds
    pub timestamp: u64,
    pub transactions: BlockTransactions,
}

/// Read access to an Ethereum-compatible node.
///
/// Implementations report every network or decoding failure as
/// [`MonitorError::TransientFetch`]; retry decisions belong to the caller.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn block_number(&self) -> MonitorResult<u64>;

    async fn block(&self, number: u64, full_transactions: bool) -> MonitorResult<ChainBlock>;

    /// `None` when the node no longer knows the transaction (dropped or replaced)
    async fn transaction(&self, hash: B256) -> MonitorResult<Option<ChainTransaction>>;

    async fn call(&self, to: Address, data: Bytes, block: BlockRef) -> MonitorResult<Bytes>;
}

#[derive(Debug, Deserialize)]
struct RpcBlock {
    number: U64,
    timestamp: U64,
    #[serde(default)]
    transactions: Vec<RpcBlockTransaction>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RpcBlockTransaction {
    Hash(B256),
    Full(RpcTransaction),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcTransaction {
    hash: B256,
    to: Option<Address>,
    value: U256,
    #[serde(default)]
    gas_price: Option<U256>,
}

impl From<RpcTransaction> for ChainTransaction {
    fn from(tx: RpcTransaction) -> Self {
        Self {
            hash: tx.hash,
            to: tx.to,
            value: tx.value,
            gas_price: tx.gas_price.map(|price| u128::try_from(price).unwrap_or(u128::MAX)),
        }
    }
}

impl RpcBlock {
    fn into_block(self, full_transactions: bool) -> ChainBlock {
        let transactions = if full_transactions {
            BlockTransactions::Full(
                self.transactions
                    .into_iter()
                    .filter_map(|tx| match tx {
                        RpcBlockTransaction::Full(tx) => Some(tx.into()),
                        RpcBlockTransaction::Hash(_) => None,
                    })
                    .collect(),
            )
        } else {
            BlockTransactions::Hashes(
                self.transactions
                    .into_iter()
                    .map(|tx| match tx {
                        RpcBlockTransaction::Hash(hash) => hash,
                        RpcBlockTransaction::Full(tx) => tx.hash,
                    })
                    .collect(),
            )
        };

        ChainBlock {
            number: self.number.to(),
            timestamp: self.timestamp.to(),
            transactions,
        }
    }
}

/// JSON-RPC over HTTP chain client
#[derive(Debug)]
pub struct RpcChainClient {
    http_client: reqwest::Client,
    rpc_url: String,
    next_id: AtomicU64,
}

impl RpcChainClient {
    pub fn new(rpc_url: String, timeout: Duration) -> MonitorResult<Self> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http_client,
            rpc_url,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }

    /// Issue a request; `Ok(None)` when the node answers with a null result
    async fn request<T: DeserializeOwned>(&self, method: &str, params: Value) -> MonitorResult<Option<T>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request_body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id
        });

        debug!("rpc {} id={}", method, id);

        let response = self.http_client
            .post(&self.rpc_url)
            .header("Content-Type", "application/json")
            .json(&request_body)
            .send()
            .await?;

        let response_json: Value = response.json().await?;
        decode_response(response_json)
    }
}

fn decode_response<T: DeserializeOwned>(mut response_json: Value) -> MonitorResult<Option<T>> {
    if let Some(error) = response_json.get("error") {
        return Err(MonitorError::TransientFetch(format!("RPC error: {}", error)));
    }

    match response_json.get_mut("result").map(Value::take) {
        None => Err(MonitorError::TransientFetch("Missing result in RPC response".to_string())),
        Some(Value::Null) => Ok(None),
        Some(result) => Ok(Some(serde_json::from_value(result)?)),
    }
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn block_number(&self) -> MonitorResult<u64> {
        let number: Option<U64> = self.request("eth_blockNumber", serde_json::json!([])).await?;
        number
            .map(|n| n.to())
            .ok_or_else(|| MonitorError::TransientFetch("eth_blockNumber returned null".to_string()))
    }

    async fn block(&self, number: u64, full_transactions: bool) -> MonitorResult<ChainBlock> {
        let block: Option<RpcBlock> = self
            .request(
                "eth_getBlockByNumber",
                serde_json::json!([BlockRef::Number(number).to_param(), full_transactions]),
            )
            .await?;

        block
            .map(|b| b.into_block(full_transactions))
            .ok_or(MonitorError::BlockNotFound(number))
    }

    async fn transaction(&self, hash: B256) -> MonitorResult<Option<ChainTransaction>> {
        let tx: Option<RpcTransaction> = self
            .request("eth_getTransactionByHash", serde_json::json!([hash]))
            .await?;
        Ok(tx.map(Into::into))
    }

    async fn call(&self, to: Address, data: Bytes, block: BlockRef) -> MonitorResult<Bytes> {
        let result: Option<Bytes> = self
            .request(
                "eth_call",
                serde_json::json!([{ "to": to, "data": data }, block.to_param()]),
            )
            .await?;
        result.ok_or_else(|| MonitorError::TransientFetch("eth_call returned null".to_string()))
    }
}
