//! Channel daemon for the salvo example game.
//!
//! Manages a single game channel for one player: it follows the GSP's
//! on-chain view, exchanges state proofs with the opponent over the
//! broadcast server, plays the commit-reveal protocol automatically
//! where possible, and exposes an RPC surface for the frontend.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use armada_channel::broadcast::OffChainBroadcast;
use armada_channel::daemon::ChannelDaemon;
use armada_channel::manager::{ChannelManager, SyncChannelManager};
use armada_channel::sender::MoveSender;
use armada_crypto::{EcdsaSigner, EcdsaVerifier, SignatureSigner};
use armada_primitives::Id256;
use armada_salvo::{SalvoChannel, SalvoRules};
use jsonrpsee::http_client::HttpClientBuilder;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::args::Args;
use crate::rpc_client::{RpcBroadcastTransport, RpcTransactionSender};
use crate::rpc_server::{SalvoChannelApiServer, SalvoChannelRpc};

mod args;
mod rpc_client;
mod rpc_server;

/// Timeout for wallet and broadcast RPC calls.
const CLIENT_RPC_TIMEOUT: Duration = Duration::from_secs(10);

fn main() -> anyhow::Result<()> {
    let args: Args = argh::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("salvo-rt")
        .build()
        .context("init: build runtime")?;

    runtime.block_on(main_task(args))
}

async fn main_task(args: Args) -> anyhow::Result<()> {
    let channel_id =
        Id256::from_hex(&args.channel_id).context("init: parse channel id")?;
    let key_bytes = hex::decode(&args.signing_key).context("init: decode signing key")?;
    let signer = EcdsaSigner::from_secret_bytes(&key_bytes)
        .ok_or_else(|| anyhow!("init: invalid signing key"))?;
    info!(address = %signer.address(), channel = %channel_id, "starting channel daemon");

    let handle = tokio::runtime::Handle::current();

    // Manager with its move sender and broadcast wired up.
    let mut manager = ChannelManager::new(
        Arc::new(SalvoRules),
        SalvoChannel::new(args.player_name.clone()),
        Arc::new(EcdsaVerifier::new()),
        Box::new(signer),
        args.game_id.clone(),
        channel_id,
        args.player_name.clone(),
    );

    let wallet_client = HttpClientBuilder::default()
        .request_timeout(CLIENT_RPC_TIMEOUT)
        .build(&args.wallet_rpc_url)
        .context("init: wallet RPC client")?;
    let tx_sender = Arc::new(RpcTransactionSender::new(handle.clone(), wallet_client));
    manager.set_move_sender(MoveSender::new(
        tx_sender,
        args.game_id.clone(),
        args.player_name.clone(),
    ));

    let broadcast_client = HttpClientBuilder::default()
        .request_timeout(CLIENT_RPC_TIMEOUT)
        .build(&args.broadcast_rpc_url)
        .context("init: broadcast RPC client")?;
    let transport = Arc::new(RpcBroadcastTransport::new(
        handle.clone(),
        broadcast_client,
        channel_id.to_hex(),
    ));
    manager.set_off_chain_broadcast(OffChainBroadcast::new(transport.clone()));

    let manager = Arc::new(SyncChannelManager::new(manager));

    // Background work: GSP feeder and broadcast receiver.
    let mut daemon = ChannelDaemon::new(manager.clone());
    daemon
        .start_feeder(&handle, &args.gsp_rpc_url)
        .map_err(|e| anyhow!("init: GSP feeder: {e}"))?;
    daemon.start_broadcast(transport);

    // Frontend RPC server.
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel();
    let rpc = SalvoChannelRpc::new(manager.clone(), stop_tx);
    let server = jsonrpsee::server::Server::builder()
        .build(format!("{}:{}", args.rpc_host, args.rpc_port))
        .await
        .context("init: build RPC server")?;
    let server_handle = server.start(rpc.into_rpc());
    info!(host = %args.rpc_host, port = args.rpc_port, "started RPC server");

    tokio::select! {
        _ = stop_rx => info!("stop requested via RPC"),
        _ = tokio::signal::ctrl_c() => info!("interrupt received"),
    }

    daemon.stop().await;
    if server_handle.stop().is_err() {
        warn!("RPC server already stopped");
    }
    server_handle.stopped().await;

    info!("channel daemon exited");
    Ok(())
}
