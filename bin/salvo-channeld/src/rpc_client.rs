//! RPC clients towards the wallet and the broadcast server.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use armada_channel::broadcast::BroadcastTransport;
use armada_channel::sender::TransactionSender;
use armada_channel::SendError;
use armada_primitives::{b64, Id256};
use jsonrpsee::core::RpcResult;
use jsonrpsee::http_client::HttpClient;
use jsonrpsee::proc_macros::rpc;
use tokio::runtime::Handle;
use tracing::{debug, warn};

/// Wallet-side RPC: raw move submission and mempool queries.
#[rpc(client)]
pub trait WalletApi {
    /// Submits a raw move for a name, returning the txid.
    #[method(name = "sendmove")]
    async fn send_move(&self, name: String, value: String) -> RpcResult<String>;

    /// Whether a transaction is still in the mempool.
    #[method(name = "ispending")]
    async fn is_pending(&self, txid: String) -> RpcResult<bool>;
}

/// Broadcast-server RPC: per-channel message fan-out.
#[rpc(client)]
pub trait BroadcastApi {
    /// Sends a base64 message to all other participants of a channel.
    #[method(name = "send")]
    async fn send(&self, channel: String, message: String) -> RpcResult<()>;

    /// Long-polls for pending base64 messages of a channel.
    #[method(name = "receive")]
    async fn receive(&self, channel: String) -> RpcResult<Vec<String>>;
}

/// [`TransactionSender`] over the wallet RPC.
///
/// The sender is invoked from blocking contexts (the manager pipeline
/// runs on blocking-pool or plain threads), so the async client calls
/// are driven to completion on the runtime handle.
pub struct RpcTransactionSender {
    handle: Handle,
    client: HttpClient,
}

impl RpcTransactionSender {
    pub fn new(handle: Handle, client: HttpClient) -> Self {
        Self { handle, client }
    }
}

impl TransactionSender for RpcTransactionSender {
    fn send_raw_move(&self, name: &str, value: &str) -> Result<Id256, SendError> {
        let call = self.client.send_move(name.to_owned(), value.to_owned());
        let txid_hex = self
            .handle
            .block_on(call)
            .map_err(|e| SendError(e.to_string()))?;
        Id256::from_hex(&txid_hex).map_err(|e| SendError(e.to_string()))
    }

    fn is_pending(&self, txid: &Id256) -> bool {
        let call = self.client.is_pending(txid.to_hex());
        match self.handle.block_on(call) {
            Ok(pending) => pending,
            Err(err) => {
                warn!(%err, "ispending query failed, assuming still pending");
                true
            }
        }
    }
}

/// [`BroadcastTransport`] over the broadcast RPC.
pub struct RpcBroadcastTransport {
    handle: Handle,
    client: HttpClient,
    channel_hex: String,

    /// Messages fetched in a batch but not yet handed out.
    buffered: Mutex<VecDeque<Vec<u8>>>,
}

impl RpcBroadcastTransport {
    pub fn new(handle: Handle, client: HttpClient, channel_hex: String) -> Self {
        Self {
            handle,
            client,
            channel_hex,
            buffered: Mutex::new(VecDeque::new()),
        }
    }
}

impl BroadcastTransport for RpcBroadcastTransport {
    fn send(&self, msg: Vec<u8>) {
        let client = self.client.clone();
        let channel = self.channel_hex.clone();
        let encoded = b64::encode(&msg);
        // Fire and forget; the transport is best-effort.
        self.handle.spawn(async move {
            if let Err(err) = client.send(channel, encoded).await {
                warn!(%err, "broadcast send failed");
            }
        });
    }

    fn try_receive(&self, timeout: Duration) -> Option<Vec<u8>> {
        {
            let mut buffered = self.buffered.lock().expect("broadcast buffer lock");
            if let Some(msg) = buffered.pop_front() {
                return Some(msg);
            }
        }

        let call = self.client.receive(self.channel_hex.clone());
        let batch = self
            .handle
            .block_on(async { tokio::time::timeout(timeout, call).await });
        let messages = match batch {
            Ok(Ok(messages)) => messages,
            Ok(Err(err)) => {
                debug!(%err, "broadcast receive failed");
                return None;
            }
            Err(_elapsed) => return None,
        };

        let mut decoded: VecDeque<Vec<u8>> = messages
            .iter()
            .filter_map(|m| {
                let bytes = b64::decode(m);
                if bytes.is_none() {
                    warn!("dropping undecodable broadcast message");
                }
                bytes
            })
            .collect();
        let first = decoded.pop_front();
        if !decoded.is_empty() {
            self.buffered
                .lock()
                .expect("broadcast buffer lock")
                .append(&mut decoded);
        }
        first
    }
}
