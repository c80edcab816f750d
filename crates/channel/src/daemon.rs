//! Lifecycle wiring of a channel daemon.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use crate::broadcast::{BroadcastTransport, ReceivingBroadcast};
use crate::errors::SendError;
use crate::feeder::{gsp_http_client, ChainToChannelFeeder};
use crate::manager::SyncChannelManager;
use crate::rules::{BoardRules, OpenChannel};

/// Shutdown trigger shared by the daemon's background tasks.
#[derive(Clone)]
pub struct ShutdownSignal(watch::Sender<bool>);

impl ShutdownSignal {
    pub fn new() -> Self {
        Self(watch::channel(false).0)
    }

    pub fn guard(&self) -> ShutdownGuard {
        ShutdownGuard(self.0.subscribe())
    }

    pub fn trigger(&self) {
        let _ = self.0.send(true);
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of a [`ShutdownSignal`], polled or awaited by tasks.
pub struct ShutdownGuard(watch::Receiver<bool>);

impl ShutdownGuard {
    pub fn should_shutdown(&self) -> bool {
        *self.0.borrow()
    }

    /// Completes once shutdown has been requested.
    pub async fn wait(&mut self) {
        let _ = self.0.wait_for(|v| *v).await;
    }
}

/// Composes a channel manager with its feeder and broadcast receiver
/// and manages their lifecycle.
///
/// Components must be started in order: the manager is constructed
/// with its move sender and broadcast already set, then
/// [`ChannelDaemon::start_feeder`] and
/// [`ChannelDaemon::start_broadcast`] bring up the background work.
/// [`ChannelDaemon::stop`] is final; a stopped daemon cannot be
/// restarted (stopping the manager is one-way).
pub struct ChannelDaemon<R: BoardRules, C: OpenChannel<R>> {
    manager: Arc<SyncChannelManager<R, C>>,
    shutdown: ShutdownSignal,
    feeder_task: Option<tokio::task::JoinHandle<()>>,
    broadcast: Option<ReceivingBroadcast>,
}

impl<R, C> ChannelDaemon<R, C>
where
    R: BoardRules,
    C: OpenChannel<R> + 'static,
{
    pub fn new(manager: Arc<SyncChannelManager<R, C>>) -> Self {
        Self {
            manager,
            shutdown: ShutdownSignal::new(),
            feeder_task: None,
            broadcast: None,
        }
    }

    pub fn manager(&self) -> &Arc<SyncChannelManager<R, C>> {
        &self.manager
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Connects to the GSP and spawns the feeder task on the given
    /// runtime.
    pub fn start_feeder(
        &mut self,
        handle: &tokio::runtime::Handle,
        gsp_url: &str,
    ) -> Result<(), SendError> {
        debug_assert!(self.feeder_task.is_none(), "feeder is already running");
        let rpc = gsp_http_client(gsp_url)?;
        let feeder = ChainToChannelFeeder::new(rpc, self.manager.clone());
        let guard = self.shutdown.guard();
        self.feeder_task = Some(handle.spawn(feeder.run(guard)));
        Ok(())
    }

    /// Spawns the broadcast receive thread on the given transport.
    pub fn start_broadcast(&mut self, transport: Arc<dyn BroadcastTransport>) {
        debug_assert!(self.broadcast.is_none(), "broadcast is already running");
        self.broadcast = Some(ReceivingBroadcast::start(transport, self.manager.clone()));
    }

    /// Stops the manager and all background work.  Waiters on
    /// `wait_for_change` return promptly.
    pub async fn stop(&mut self) {
        info!("stopping channel daemon");
        self.manager.stop_updates();
        self.shutdown.trigger();

        if let Some(task) = self.feeder_task.take() {
            let _ = task.await;
        }
        if let Some(broadcast) = self.broadcast.take() {
            // Joining the receive thread blocks at most one poll
            // interval.
            tokio::task::spawn_blocking(move || broadcast.stop())
                .await
                .ok();
        }
        info!("channel daemon stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_signal_wakes_guards() {
        let signal = ShutdownSignal::new();
        let mut guard = signal.guard();
        assert!(!guard.should_shutdown());

        signal.trigger();
        guard.wait().await;
        assert!(guard.should_shutdown());
    }
}
