//! The daemon's own RPC surface, used by game frontends.

use std::sync::{Arc, Mutex};

use armada_channel::SyncChannelManager;
use armada_salvo::{Coord, Grid, SalvoChannel, SalvoRules};
use jsonrpsee::core::{async_trait, RpcResult};
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::types::ErrorObjectOwned;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{info, warn};

pub type Manager = SyncChannelManager<SalvoRules, SalvoChannel>;

#[rpc(server)]
pub trait SalvoChannelApi {
    /// Current channel state as JSON.
    #[method(name = "getcurrentstate")]
    async fn get_current_state(&self) -> RpcResult<Value>;

    /// Long-polls for a state version different from the known one.
    #[method(name = "waitforchange")]
    async fn wait_for_change(&self, known_version: u64) -> RpcResult<Value>;

    /// Sets the player's fleet position (text form).  Returns whether
    /// the position was accepted.
    #[method(name = "setposition")]
    async fn set_position(&self, position: String) -> RpcResult<bool>;

    /// Validates a fleet position without storing it.
    #[method(name = "validateposition")]
    async fn validate_position(&self, position: String) -> RpcResult<bool>;

    /// Shoots at the given cell.
    #[method(name = "shoot")]
    async fn shoot(&self, row: i8, column: i8) -> RpcResult<()>;

    /// Reveals the position, e.g. to concede on a hopeless board.
    #[method(name = "revealposition")]
    async fn reveal_position(&self) -> RpcResult<()>;

    /// Files a dispute with the current state; returns the txid.
    #[method(name = "filedispute")]
    async fn file_dispute(&self) -> RpcResult<Option<String>>;

    /// Puts the current state on chain as a resolution; returns the
    /// txid.
    #[method(name = "putcurrentstateonchain")]
    async fn put_current_state_on_chain(&self) -> RpcResult<Option<String>>;

    /// Stops the daemon.
    #[method(name = "stop")]
    async fn stop(&self) -> RpcResult<()>;
}

pub struct SalvoChannelRpc {
    manager: Arc<Manager>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl SalvoChannelRpc {
    pub fn new(manager: Arc<Manager>, stop_tx: oneshot::Sender<()>) -> Self {
        Self {
            manager,
            stop_tx: Mutex::new(Some(stop_tx)),
        }
    }

    /// Runs a blocking manager operation on the blocking pool.
    async fn blocking<T: Send + 'static>(
        &self,
        f: impl FnOnce(Arc<Manager>) -> T + Send + 'static,
    ) -> RpcResult<T> {
        let manager = self.manager.clone();
        tokio::task::spawn_blocking(move || f(manager))
            .await
            .map_err(|e| ErrorObjectOwned::owned(-32603, e.to_string(), None::<()>))
    }
}

fn parse_and_validate_position(text: &str) -> Option<Grid> {
    let grid = Grid::from_text(text)?;
    armada_salvo::grid::verify_position_of_ships(grid).then_some(grid)
}

#[async_trait]
impl SalvoChannelApiServer for SalvoChannelRpc {
    async fn get_current_state(&self) -> RpcResult<Value> {
        self.blocking(|m| m.to_json()).await
    }

    async fn wait_for_change(&self, known_version: u64) -> RpcResult<Value> {
        self.blocking(move |m| m.wait_for_change(known_version))
            .await
    }

    async fn set_position(&self, position: String) -> RpcResult<bool> {
        info!("RPC method called: setposition");
        let Some(grid) = parse_and_validate_position(&position) else {
            warn!("invalid position string given");
            return Ok(false);
        };

        self.blocking(move |m| {
            let stored = m.access(|cm| cm.game_mut().set_position(grid));
            if stored {
                // The position may unblock commitment or answer
                // automoves.
                m.trigger_auto_moves();
            }
            stored
        })
        .await
    }

    async fn validate_position(&self, position: String) -> RpcResult<bool> {
        Ok(parse_and_validate_position(&position).is_some())
    }

    async fn shoot(&self, row: i8, column: i8) -> RpcResult<()> {
        info!(row, column, "RPC method called: shoot");
        let target = Coord::new(row, column);
        if !target.is_on_board() {
            warn!("invalid coordinate given as shot target");
            return Ok(());
        }

        self.blocking(move |m| m.process_local_move(SalvoChannel::shot_move(target)))
            .await
    }

    async fn reveal_position(&self) -> RpcResult<()> {
        info!("RPC method called: revealposition");
        self.blocking(|m| {
            m.access(|cm| {
                let Some(mv) = cm.game().position_reveal_move() else {
                    warn!("no position set that could be revealed");
                    return;
                };
                cm.process_local_move(mv);
            })
        })
        .await
    }

    async fn file_dispute(&self) -> RpcResult<Option<String>> {
        info!("RPC method called: filedispute");
        self.blocking(|m| m.file_dispute().map(|txid| txid.to_hex()))
            .await
    }

    async fn put_current_state_on_chain(&self) -> RpcResult<Option<String>> {
        info!("RPC method called: putcurrentstateonchain");
        self.blocking(|m| m.put_state_on_chain().map(|txid| txid.to_hex()))
            .await
    }

    async fn stop(&self) -> RpcResult<()> {
        info!("RPC method called: stop");
        if let Some(tx) = self.stop_tx.lock().expect("stop sender lock").take() {
            let _ = tx.send(());
        }
        Ok(())
    }
}
