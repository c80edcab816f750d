//! Long-polling feeder from the channel GSP into the manager.

use std::sync::Arc;
use std::time::Duration;

use armada_primitives::{b64, Id256};
use armada_proto::{message_from_base64, ChannelMetadata, StateProof};
use jsonrpsee::core::RpcResult;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::proc_macros::rpc;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::daemon::ShutdownGuard;
use crate::errors::SendError;
use crate::manager::SyncChannelManager;
use crate::rules::{BoardRules, OpenChannel};

/// The GSP's wait-for-change long-poll returns after about 5 seconds
/// even without a change; our client timeout must exceed it.
pub const GSP_RPC_TIMEOUT: Duration = Duration::from_secs(6);

/// Backoff after an RPC error before polling again.
const ERROR_RETRY_DELAY: Duration = Duration::from_secs(1);

/// RPC surface of the channel GSP.  The feeder consumes the client
/// side; GSP front-ends can serve the server side.
#[rpc(server, client)]
pub trait ChannelGspApi {
    /// Long-polls for a block different from the known one, returning
    /// the new best block hash.
    #[method(name = "waitforchange")]
    async fn wait_for_change(&self, known_block: String) -> RpcResult<String>;

    /// Returns the GSP's view of one channel.
    #[method(name = "getchannel")]
    async fn get_channel(&self, channel_id: String) -> RpcResult<Value>;
}

/// Builds the HTTP client for a GSP endpoint with the right timeout.
pub fn gsp_http_client(url: &str) -> Result<HttpClient, SendError> {
    HttpClientBuilder::default()
        .request_timeout(GSP_RPC_TIMEOUT)
        .build(url)
        .map_err(|e| SendError(e.to_string()))
}

/// A decoded `getchannel` response.
#[derive(Debug)]
pub enum GspUpdate {
    /// The GSP has a current block but no data for the channel.
    NonExistent { block: Id256, height: u64 },

    /// The channel exists on-chain.
    Channel {
        block: Id256,
        height: u64,
        meta: ChannelMetadata,
        reinit_state: Vec<u8>,
        proof: StateProof,
        dispute_height: u64,
    },
}

impl GspUpdate {
    pub fn block(&self) -> &Id256 {
        match self {
            GspUpdate::NonExistent { block, .. } => block,
            GspUpdate::Channel { block, .. } => block,
        }
    }
}

/// Decodes a `getchannel` response.  Returns `None` when the GSP is
/// not up-to-date, has no state yet, or the response is malformed; all
/// of those just mean "skip this update".
pub fn parse_gsp_response(data: &Value) -> Option<GspUpdate> {
    if data["state"] != "up-to-date" {
        warn!(state = %data["state"], "channel GSP is not up-to-date, not updating");
        return None;
    }

    // The block hash can be missing on the very first update or if the
    // state got detached between waitforchange and getchannel.
    let Some(block_hex) = data["blockhash"].as_str() else {
        warn!("GSP has no current state yet");
        return None;
    };
    let Ok(block) = Id256::from_hex(block_hex) else {
        warn!(block_hex, "GSP returned an invalid block hash");
        return None;
    };
    let Some(height) = data["height"].as_u64() else {
        warn!("GSP returned no valid height");
        return None;
    };

    let channel = &data["channel"];
    if channel.is_null() {
        return Some(GspUpdate::NonExistent { block, height });
    }

    let Some(meta) = channel["meta"]["proto"]
        .as_str()
        .and_then(message_from_base64::<ChannelMetadata>)
    else {
        warn!("could not decode channel metadata from GSP");
        return None;
    };
    let Some(proof) = channel["state"]["proof"]
        .as_str()
        .and_then(message_from_base64::<StateProof>)
    else {
        warn!("could not decode state proof from GSP");
        return None;
    };
    let Some(reinit_state) = channel["reinit"]["base64"].as_str().and_then(b64::decode) else {
        warn!("could not decode reinit state from GSP");
        return None;
    };
    let dispute_height = channel["disputeheight"].as_u64().unwrap_or(0);

    Some(GspUpdate::Channel {
        block,
        height,
        meta,
        reinit_state,
        proof,
        dispute_height,
    })
}

/// Background task that drives on-chain updates into the channel
/// manager.
pub struct ChainToChannelFeeder<R: BoardRules, C: OpenChannel<R>> {
    rpc: HttpClient,
    manager: Arc<SyncChannelManager<R, C>>,
    channel_id_hex: String,
    last_block: Option<Id256>,
}

impl<R, C> ChainToChannelFeeder<R, C>
where
    R: BoardRules,
    C: OpenChannel<R> + 'static,
{
    pub fn new(rpc: HttpClient, manager: Arc<SyncChannelManager<R, C>>) -> Self {
        let channel_id_hex = manager.read(|m| m.channel_id().to_hex());
        Self {
            rpc,
            manager,
            channel_id_hex,
            last_block: None,
        }
    }

    /// Fetches the channel state once and applies it to the manager.
    async fn update_once(&mut self) {
        let data = match self.rpc.get_channel(self.channel_id_hex.clone()).await {
            Ok(data) => data,
            Err(err) => {
                warn!(%err, "getchannel failed");
                return;
            }
        };

        let Some(update) = parse_gsp_response(&data) else {
            return;
        };
        self.last_block = Some(*update.block());

        // The manager update runs on the blocking pool: it takes the
        // instance lock, and the pipeline behind it may perform
        // synchronous sends.
        let manager = self.manager.clone();
        let channel = self.channel_id_hex.clone();
        let applied = tokio::task::spawn_blocking(move || match update {
            GspUpdate::NonExistent { block, height } => {
                info!(%channel, "channel is not known on-chain");
                manager.process_on_chain_non_existent(block, height);
            }
            GspUpdate::Channel {
                block,
                height,
                meta,
                reinit_state,
                proof,
                dispute_height,
            } => {
                info!(%block, height, "new on-chain state for the channel");
                manager.process_on_chain(block, height, meta, reinit_state, proof, dispute_height);
            }
        })
        .await;
        if applied.is_err() {
            warn!("manager update task failed");
        }
        debug!(channel = %self.channel_id_hex, "updated channel from on-chain state");
    }

    /// Runs the feeder until shutdown is requested.  RPC timeouts and
    /// transient errors just continue the loop; the bounded request
    /// timeout also bounds shutdown latency.
    pub async fn run(mut self, mut shutdown: ShutdownGuard) {
        info!("starting chain-to-channel feeder loop");
        self.update_once().await;

        loop {
            if shutdown.should_shutdown() {
                break;
            }

            let known = self
                .last_block
                .as_ref()
                .map(|b| b.to_hex())
                .unwrap_or_default();

            let new_block = tokio::select! {
                _ = shutdown.wait() => break,
                res = self.rpc.wait_for_change(known.clone()) => res,
            };

            match new_block {
                Ok(new_hex) => {
                    if new_hex.is_empty() {
                        debug!("GSP does not have any state yet");
                        continue;
                    }
                    if new_hex == known {
                        debug!("already at the newest block");
                        continue;
                    }
                    // Advance the poll cursor even if the follow-up
                    // fetch fails, so a catching-up GSP is not polled
                    // in a tight loop.
                    if let Ok(block) = Id256::from_hex(&new_hex) {
                        self.last_block = Some(block);
                    }
                    self.update_once().await;
                }
                Err(err) => {
                    // Timeouts are the normal idle case of a long poll.
                    debug!(%err, "waitforchange returned an error");
                    tokio::select! {
                        _ = shutdown.wait() => break,
                        _ = tokio::time::sleep(ERROR_RETRY_DELAY) => {}
                    }
                }
            }
        }

        info!("chain-to-channel feeder loop finished");
    }
}

#[cfg(test)]
mod tests {
    use armada_primitives::hash::sha256;
    use armada_proto::message_to_base64;
    use serde_json::json;

    use super::*;

    fn block_hex() -> String {
        sha256(b"block").to_hex()
    }

    #[test]
    fn rejects_catching_up_gsp() {
        let data = json!({"state": "catching-up", "blockhash": block_hex(), "height": 5});
        assert!(parse_gsp_response(&data).is_none());
    }

    #[test]
    fn rejects_missing_block_hash() {
        let data = json!({"state": "up-to-date"});
        assert!(parse_gsp_response(&data).is_none());
    }

    #[test]
    fn absent_channel_decodes_as_nonexistent() {
        let data = json!({
            "state": "up-to-date",
            "blockhash": block_hex(),
            "height": 7,
            "channel": null,
        });
        match parse_gsp_response(&data) {
            Some(GspUpdate::NonExistent { block, height }) => {
                assert_eq!(block.to_hex(), block_hex());
                assert_eq!(height, 7);
            }
            other => panic!("unexpected parse result: {other:?}"),
        }
    }

    #[test]
    fn full_channel_payload_decodes() {
        let meta = ChannelMetadata {
            participants: Vec::new(),
            reinit: b"r1".to_vec(),
            proto_version: 1,
        };
        let proof = StateProof::for_state(b"state".to_vec());
        let data = json!({
            "state": "up-to-date",
            "blockhash": block_hex(),
            "height": 9,
            "channel": {
                "id": "00",
                "meta": {"proto": message_to_base64(&meta)},
                "state": {"proof": message_to_base64(&proof)},
                "reinit": {"base64": b64::encode(b"reinit state")},
                "disputeheight": 42,
            },
        });
        match parse_gsp_response(&data) {
            Some(GspUpdate::Channel {
                height,
                meta: got_meta,
                reinit_state,
                proof: got_proof,
                dispute_height,
                ..
            }) => {
                assert_eq!(height, 9);
                assert_eq!(got_meta, meta);
                assert_eq!(reinit_state, b"reinit state");
                assert_eq!(got_proof, proof);
                assert_eq!(dispute_height, 42);
            }
            other => panic!("unexpected parse result: {other:?}"),
        }
    }

    #[test]
    fn garbage_proto_fields_are_skipped() {
        let data = json!({
            "state": "up-to-date",
            "blockhash": block_hex(),
            "height": 9,
            "channel": {
                "meta": {"proto": "!!!"},
                "state": {"proof": "!!!"},
                "reinit": {"base64": "!!!"},
            },
        });
        assert!(parse_gsp_response(&data).is_none());
    }
}
