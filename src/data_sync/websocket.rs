use alloy_primitives::B256;
use eyre::{Result, eyre};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

/// Block header information from newHeads subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockHeader {
    #[serde(rename = "number")]
    pub number: String,
    #[serde(rename = "hash")]
    pub hash: String,
    #[serde(rename = "parentHash")]
    pub parent_hash: String,
    #[serde(rename = "timestamp")]
    pub timestamp: String,
}

impl BlockHeader {
    /// Parse block number from hex string
    pub fn block_number(&self) -> Result<u64> {
        let num_str = self.number.trim_start_matches("0x");
        u64::from_str_radix(num_str, 16)
            .map_err(|e| eyre!("Invalid block number format: {}", e))
    }

    /// Parse timestamp from hex string
    pub fn timestamp_secs(&self) -> Result<u64> {
        let ts_str = self.timestamp.trim_start_matches("0x");
        u64::from_str_radix(ts_str, 16)
            .map_err(|e| eyre!("Invalid timestamp format: {}", e))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Feed {
    NewHeads,
    PendingTransactions,
}

impl Feed {
    const ALL: [Feed; 2] = [Feed::NewHeads, Feed::PendingTransactions];

    fn request_id(self) -> u64 {
        match self {
            Feed::NewHeads => 1,
            Feed::PendingTransactions => 2,
        }
    }

    fn param(self) -> &'static str {
        match self {
            Feed::NewHeads => "newHeads",
            Feed::PendingTransactions => "newPendingTransactions",
        }
    }

    fn from_request_id(id: u64) -> Option<Feed> {
        Feed::ALL.into_iter().find(|feed| feed.request_id() == id)
    }
}

/// Receivers handed to the consumer of both feeds
pub struct Subscriptions {
    pub blocks: mpsc::Receiver<BlockHeader>,
    pub pending: mpsc::Receiver<B256>,
    pub shutdown: mpsc::Sender<()>,
}

struct FeedSenders {
    blocks: mpsc::Sender<BlockHeader>,
    pending: mpsc::Sender<B256>,
}

/// Keeps one websocket open carrying the `newHeads` and
/// `newPendingTransactions` subscriptions and fans them out into two channels
pub struct SubscriptionManager {
    rpc_url: String,
    connection_timeout: Duration,
    max_reconnect_attempts: u32,
    reconnect_delay: Duration,
    channel_buffer_size: usize,
}

impl SubscriptionManager {
    pub fn new(
        rpc_url: String,
        connection_timeout: Duration,
        max_reconnect_attempts: u32,
        reconnect_delay: Duration,
        channel_buffer_size: usize,
    ) -> Self {
        Self {
            rpc_url,
            connection_timeout,
            max_reconnect_attempts,
            reconnect_delay,
            channel_buffer_size,
        }
    }

    /// Spawn the connection task and return the feed receivers
    pub fn subscribe(&self) -> Subscriptions {
        let (block_tx, block_rx) = mpsc::channel(self.channel_buffer_size);
        let (pending_tx, pending_rx) = mpsc::channel(self.channel_buffer_size);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);

        let rpc_url = self.rpc_url.clone();
        let connection_timeout = self.connection_timeout;
        let max_reconnect_attempts = self.max_reconnect_attempts;
        let reconnect_delay = self.reconnect_delay;
        let senders = FeedSenders { blocks: block_tx, pending: pending_tx };

        tokio::spawn(async move {
            let mut reconnect_count = 0;

            loop {
                match Self::connect_and_subscribe(&rpc_url, connection_timeout, &senders, &mut shutdown_rx).await {
                    Ok(()) => {
                        info!("WebSocket subscription ended normally");
                        break;
                    }
                    Err(e) => {
                        error!("WebSocket connection error: {}", e);
                        reconnect_count += 1;

                        if reconnect_count >= max_reconnect_attempts {
                            error!("Max reconnection attempts reached, giving up");
                            break;
                        }

                        warn!("Attempting reconnection #{} in {:?}", reconnect_count, reconnect_delay);
                        sleep(reconnect_delay).await;
                    }
                }
            }
        });

        Subscriptions { blocks: block_rx, pending: pending_rx, shutdown: shutdown_tx }
    }

    async fn connect_and_subscribe(
        rpc_url: &str,
        connection_timeout: Duration,
        senders: &FeedSenders,
        shutdown_rx: &mut mpsc::Receiver<()>,
    ) -> Result<()> {
        let url = Url::parse(rpc_url)?;
        info!("Connecting to WebSocket: {}", url);

        let (ws_stream, _) = timeout(connection_timeout, connect_async(url.as_str())).await
            .map_err(|_| eyre!("WebSocket connection timeout"))?
            .map_err(|e| eyre!("WebSocket connection failed: {}", e))?;

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        for feed in Feed::ALL {
            let subscribe_request = serde_json::json!({
                "jsonrpc": "2.0",
                "id": feed.request_id(),
                "method": "eth_subscribe",
                "params": [feed.param()]
            });
            ws_sender.send(Message::Text(subscribe_request.to_string().into())).await?;
            info!("Sent {} subscription request", feed.param());
        }

        // subscription id -> feed, filled as confirmations arrive
        let mut subscriptions: HashMap<String, Feed> = HashMap::new();

        loop {
            tokio::select! {
                ws_msg = ws_receiver.next() => {
                    match ws_msg {
                        Some(Ok(Message::Text(text))) => {
                            let message: Value = match serde_json::from_str(text.as_str()) {
                                Ok(message) => message,
                                Err(e) => {
                                    warn!("Failed to parse WebSocket message: {}", e);
                                    continue;
                                }
                            };
                            if let Some(feed) = Self::handle_confirmation(&message, &mut subscriptions)? {
                                info!("Subscribed to {}", feed.param());
                                continue;
                            }
                            if let Err(e) = Self::handle_notification(&message, &subscriptions, senders) {
                                warn!("Failed to handle WebSocket message: {}", e);
                            }
                        }
                        Some(Ok(Message::Close(_))) => {
                            info!("WebSocket closed by server");
                            return Err(eyre!("WebSocket closed by server"));
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                return Err(eyre!("Failed to send pong: {}", e));
                            }
                        }
                        Some(Ok(_)) => {
                            // Ignore other message types
                        }
                        Some(Err(e)) => {
                            return Err(eyre!("WebSocket error: {}", e));
                        }
                        None => {
                            return Err(eyre!("WebSocket stream ended"));
                        }
                    }
                }

                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Responses to our `eth_subscribe` requests. Returns the confirmed feed,
    /// `None` when the message is not a subscription response.
    fn handle_confirmation(message: &Value, subscriptions: &mut HashMap<String, Feed>) -> Result<Option<Feed>> {
        let Some(feed) = message.get("id").and_then(Value::as_u64).and_then(Feed::from_request_id) else {
            return Ok(None);
        };

        if let Some(error) = message.get("error") {
            return Err(eyre!("Subscription error for {}: {}", feed.param(), error));
        }

        let subscription_id = message
            .get("result")
            .and_then(Value::as_str)
            .ok_or_else(|| eyre!("Invalid subscription ID format"))?;
        subscriptions.insert(subscription_id.to_string(), feed);
        Ok(Some(feed))
    }

    fn handle_notification(message: &Value, subscriptions: &HashMap<String, Feed>, senders: &FeedSenders) -> Result<()> {
        let Some(params) = message.get("params") else {
            return Ok(());
        };
        let Some(result) = params.get("result") else {
            return Ok(());
        };
        let feed = params
            .get("subscription")
            .and_then(Value::as_str)
            .and_then(|id| subscriptions.get(id))
            .ok_or_else(|| eyre!("Notification for unknown subscription"))?;

        match feed {
            Feed::NewHeads => {
                let block_header: BlockHeader = serde_json::from_value(result.clone())?;
                debug!("Received new block: {}", block_header.number);
                Self::forward(&senders.blocks, block_header, "Block header")
            }
            Feed::PendingTransactions => {
                let hash: B256 = serde_json::from_value(result.clone())?;
                Self::forward(&senders.pending, hash, "Pending transaction")
            }
        }
    }

    /// Non-blocking send; a full channel drops the item rather than stalling the socket
    fn forward<T>(tx: &mpsc::Sender<T>, item: T, what: &str) -> Result<()> {
        match tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("{} channel is full, dropping item", what);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(eyre!("{} channel is closed", what)),
        }
    }
}
