//! Off-chain exchange of state proofs between participants.
//!
//! The transport is any best-effort pub/sub carrier; delivery may be
//! duplicated, reordered or dropped.  That is fine: the rolling state
//! only ever accepts strictly fresher proofs, so replays and stale
//! messages are no-ops.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use armada_proto::{BroadcastEnvelope, ChannelMetadata, StateProof};
use tracing::{debug, info, warn};

use crate::manager::SyncChannelManager;
use crate::rules::{BoardRules, OpenChannel};

/// Messages larger than this are discarded before decoding.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// How long one receive poll blocks before re-checking the stop flag.
const RECEIVE_POLL: Duration = Duration::from_millis(500);

/// A best-effort broadcast carrier connecting the channel participants.
pub trait BroadcastTransport: Send + Sync {
    /// Fire-and-forget send to all participants.
    fn send(&self, msg: Vec<u8>);

    /// Blocks up to `timeout` for the next inbound message.
    fn try_receive(&self, timeout: Duration) -> Option<Vec<u8>>;
}

/// Outbound half of the broadcast shim, owned by the channel manager.
pub struct OffChainBroadcast {
    transport: Arc<dyn BroadcastTransport>,
    participants: BTreeSet<String>,
}

impl OffChainBroadcast {
    pub fn new(transport: Arc<dyn BroadcastTransport>) -> Self {
        Self {
            transport,
            participants: BTreeSet::new(),
        }
    }

    /// Updates the tracked participant list from the channel metadata
    /// (or clears it when the channel has disappeared on-chain).
    pub fn set_participants(&mut self, meta: Option<&ChannelMetadata>) {
        let new: BTreeSet<String> = meta
            .map(|m| m.participants.iter().map(|p| p.name.clone()).collect())
            .unwrap_or_default();
        if new != self.participants {
            info!(?new, "updating list of participants in broadcast channel");
        }
        self.participants = new;
    }

    /// Names of the current channel participants.
    pub fn participants(&self) -> &BTreeSet<String> {
        &self.participants
    }

    /// Broadcasts a new state proof for the given reinitialisation.
    pub fn send_new_state(&self, reinit: &[u8], proof: &StateProof) {
        debug!("broadcasting new state");
        let envelope = BroadcastEnvelope {
            reinit: reinit.to_vec(),
            proof: proof.clone(),
        };
        self.transport.send(armada_proto::encode_message(&envelope));
    }
}

/// Decodes an inbound broadcast message, applying the size limit.
pub fn decode_incoming(msg: &[u8]) -> Option<BroadcastEnvelope> {
    if msg.len() > MAX_MESSAGE_SIZE {
        warn!(size = msg.len(), "discarding too large off-chain message");
        return None;
    }
    let decoded = armada_proto::decode_message(msg);
    if decoded.is_none() {
        warn!("failed to decode broadcast envelope from received data");
    }
    decoded
}

/// Background receiver pumping inbound broadcast messages into the
/// channel manager.
pub struct ReceivingBroadcast {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ReceivingBroadcast {
    /// Spawns the receive loop.
    pub fn start<R, C>(
        transport: Arc<dyn BroadcastTransport>,
        manager: Arc<SyncChannelManager<R, C>>,
    ) -> Self
    where
        R: BoardRules,
        C: OpenChannel<R> + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        let handle = std::thread::spawn(move || {
            info!("starting off-chain receive loop");
            while !stop_flag.load(Ordering::Relaxed) {
                let Some(msg) = transport.try_receive(RECEIVE_POLL) else {
                    continue;
                };
                let Some(envelope) = decode_incoming(&msg) else {
                    continue;
                };
                manager.process_off_chain(&envelope.reinit, envelope.proof);
            }
            info!("off-chain receive loop finished");
        });

        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Stops the receive loop and joins the thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("broadcast receive thread panicked");
            }
        }
    }
}

impl Drop for ReceivingBroadcast {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Transport capturing sent messages, for in-module tests.
    #[derive(Default)]
    struct CapturingTransport {
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl BroadcastTransport for CapturingTransport {
        fn send(&self, msg: Vec<u8>) {
            self.sent.lock().unwrap().push(msg);
        }

        fn try_receive(&self, _timeout: Duration) -> Option<Vec<u8>> {
            None
        }
    }

    #[test]
    fn sent_state_decodes_back_to_the_envelope() {
        let transport = Arc::new(CapturingTransport::default());
        let shim = OffChainBroadcast::new(transport.clone());
        shim.send_new_state(b"r1", &StateProof::for_state(b"state".to_vec()));

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let envelope = decode_incoming(&sent[0]).unwrap();
        assert_eq!(envelope.reinit, b"r1");
        assert_eq!(envelope.proof.end_state(), b"state");
    }

    #[test]
    fn oversized_messages_are_dropped() {
        assert!(decode_incoming(&vec![0u8; MAX_MESSAGE_SIZE + 1]).is_none());
    }

    #[test]
    fn garbage_is_dropped() {
        assert!(decode_incoming(b"\x01\x02\x03").is_none());
    }

    #[test]
    fn participants_follow_metadata() {
        let mut shim = OffChainBroadcast::new(Arc::new(CapturingTransport::default()));
        assert!(shim.participants().is_empty());

        let meta = ChannelMetadata {
            participants: vec![
                armada_proto::ChannelParticipant {
                    name: "alice".to_owned(),
                    address: "a".to_owned(),
                },
                armada_proto::ChannelParticipant {
                    name: "bob".to_owned(),
                    address: "b".to_owned(),
                },
            ],
            reinit: b"r".to_vec(),
            proto_version: 1,
        };
        shim.set_participants(Some(&meta));
        assert_eq!(shim.participants().len(), 2);

        shim.set_participants(None);
        assert!(shim.participants().is_empty());
    }
}
