//! Relay launcher running relay servers as tasks of the current runtime.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::lock;
use crate::tunnel::{
    LaunchFuture, RelayError, RelayLauncher, RelayServer, RelaySpec, Termination, TunnelError,
};

const FIRST_FAKE_PROCESS_ID: u32 = 40_000;

#[derive(Debug)]
struct RunningRelay {
    listen: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<Result<(), RelayError>>,
}

/// [`RelayLauncher`] that spawns each relay as a tokio task and hands out
/// fake process ids.
#[derive(Debug, Default)]
pub struct InProcessRelayLauncher {
    relays: Mutex<BTreeMap<u32, RunningRelay>>,
    launched: AtomicU32,
}

impl InProcessRelayLauncher {
    /// Creates a launcher with no relays.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fake process ids of relays that are still serving.
    #[must_use]
    pub fn running(&self) -> Vec<u32> {
        lock(&self.relays)
            .iter()
            .filter(|(_, relay)| !relay.handle.is_finished())
            .map(|(process_id, _)| *process_id)
            .collect()
    }

    /// Address relay `process_id` is listening on.
    #[must_use]
    pub fn listen_addr(&self, process_id: u32) -> Option<SocketAddr> {
        lock(&self.relays).get(&process_id).map(|relay| relay.listen)
    }

    /// Waits for relay `process_id` to finish on its own and returns how it
    /// ended.
    pub async fn join(&self, process_id: u32) -> Option<Result<(), RelayError>> {
        let removed = lock(&self.relays).remove(&process_id);
        let relay = removed?;
        match relay.handle.await {
            Ok(result) => Some(result),
            Err(err) => {
                debug!(process_id, error = %err, "relay task failed");
                None
            }
        }
    }

    async fn start(&self, spec: RelaySpec) -> Result<u32, TunnelError> {
        let server = RelayServer::new(
            SocketAddr::new(spec.bind, spec.listen_port),
            spec.target,
            spec.policy,
        );
        let shutdown = server.shutdown_token();
        let (ready_tx, ready_rx) = oneshot::channel();
        let mut ready_tx = Some(ready_tx);
        let handle = tokio::spawn(server.run(move |addr| {
            if let Some(tx) = ready_tx.take()
                && tx.send(addr).is_err()
            {
                debug!(%addr, "launcher stopped waiting for readiness");
            }
        }));

        let Ok(listen) = ready_rx.await else {
            let message = match handle.await {
                Ok(Err(err)) => err.to_string(),
                Ok(Ok(())) => String::from("relay stopped before listening"),
                Err(err) => err.to_string(),
            };
            return Err(TunnelError::Launch {
                port: spec.listen_port,
                message,
            });
        };

        let process_id =
            FIRST_FAKE_PROCESS_ID.saturating_add(self.launched.fetch_add(1, Ordering::SeqCst));
        lock(&self.relays).insert(
            process_id,
            RunningRelay {
                listen,
                shutdown,
                handle,
            },
        );
        Ok(process_id)
    }

    async fn stop(&self, process_id: u32) -> Result<Termination, TunnelError> {
        let removed = lock(&self.relays).remove(&process_id);
        let Some(relay) = removed else {
            return Ok(Termination::AlreadyStopped);
        };
        relay.shutdown.cancel();
        match relay.handle.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(process_id, error = %err, "relay ended with an error"),
            Err(err) => return Err(TunnelError::Join(err.to_string())),
        }
        Ok(Termination::Stopped)
    }
}

impl RelayLauncher for InProcessRelayLauncher {
    fn launch(&self, spec: RelaySpec) -> LaunchFuture<'_, u32> {
        Box::pin(self.start(spec))
    }

    fn terminate(&self, process_id: u32) -> LaunchFuture<'_, Termination> {
        Box::pin(self.stop(process_id))
    }

    fn is_running(&self, process_id: u32) -> LaunchFuture<'_, bool> {
        let alive = lock(&self.relays)
            .get(&process_id)
            .is_some_and(|relay| !relay.handle.is_finished());
        Box::pin(async move { Ok(alive) })
    }
}
