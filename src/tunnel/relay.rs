//! Supervised relay listener.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::connection;
use super::{RelayError, RestartPolicy};

/// Default upper bound on connecting to the guest for an accepted client.
pub const DEFAULT_GUEST_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Accept loop forwarding every client to a fixed guest address.
///
/// Any error escaping the accept loop (bind failure, accept failure or an
/// unreachable guest) crashes the listener; it is restarted after an
/// exponentially growing delay until [`RestartPolicy::max_restarts`]
/// consecutive crashes have occurred. A crash-free attempt that relayed at
/// least one connection resets the count. Accepted connections are tracked
/// and cancelled when the server shuts down.
#[derive(Debug)]
pub struct RelayServer {
    listen: SocketAddr,
    target: SocketAddr,
    policy: RestartPolicy,
    connect_timeout: Duration,
    shutdown: CancellationToken,
}

impl RelayServer {
    /// Creates a relay from `listen` to `target`. A zero listen port is
    /// resolved on the first bind and reused by every restart.
    #[must_use]
    pub fn new(listen: SocketAddr, target: SocketAddr, policy: RestartPolicy) -> Self {
        Self {
            listen,
            target,
            policy,
            connect_timeout: DEFAULT_GUEST_CONNECT_TIMEOUT,
            shutdown: CancellationToken::new(),
        }
    }

    /// Overrides the guest connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Token that stops the server and its connections when cancelled.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs until shutdown or until the restart ceiling is reached.
    ///
    /// `on_ready` is invoked with the bound address every time a listener
    /// starts accepting.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::RestartsExhausted`] carrying the final crash.
    pub async fn run<F>(self, mut on_ready: F) -> Result<(), RelayError>
    where
        F: FnMut(SocketAddr) + Send,
    {
        let connections = TaskTracker::new();
        let mut listen = self.listen;
        let mut attempts: u32 = 0;
        let mut backoff = self.policy.initial_backoff;

        let result = loop {
            let mut relayed: u64 = 0;
            let crash = match self
                .serve(&mut listen, &mut on_ready, &connections, &mut relayed)
                .await
            {
                Ok(()) => break Ok(()),
                Err(err) => err,
            };
            if relayed > 0 {
                attempts = 0;
                backoff = self.policy.initial_backoff;
            }
            if attempts >= self.policy.max_restarts {
                error!(%listen, attempts, error = %crash, "relay restarts exhausted");
                break Err(RelayError::RestartsExhausted {
                    attempts,
                    last: Box::new(crash),
                });
            }
            attempts += 1;
            warn!(
                %listen,
                attempt = attempts,
                max_restarts = self.policy.max_restarts,
                backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                error = %crash,
                "relay listener crashed; restarting"
            );
            tokio::select! {
                () = self.shutdown.cancelled() => break Ok(()),
                () = sleep(backoff) => {}
            }
            backoff = self.policy.next_backoff(backoff);
        };

        connections.close();
        self.shutdown.cancel();
        connections.wait().await;
        debug!(%listen, "relay stopped");
        result
    }

    async fn serve<F>(
        &self,
        listen: &mut SocketAddr,
        on_ready: &mut F,
        connections: &TaskTracker,
        relayed: &mut u64,
    ) -> Result<(), RelayError>
    where
        F: FnMut(SocketAddr) + Send,
    {
        let addr = *listen;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| RelayError::Bind { addr, source })?;
        let local = listener
            .local_addr()
            .map_err(|source| RelayError::Bind { addr, source })?;
        *listen = local;
        info!(listen = %local, target = %self.target, "relay listening");
        on_ready(local);

        loop {
            let (client, peer) = tokio::select! {
                () = self.shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted.map_err(RelayError::Accept)?,
            };
            debug!(%peer, "accepted relay client");
            let guest = match timeout(self.connect_timeout, TcpStream::connect(self.target)).await
            {
                Ok(Ok(guest)) => guest,
                Ok(Err(source)) => {
                    return Err(RelayError::GuestConnect {
                        target: self.target,
                        source,
                    });
                }
                Err(_) => {
                    return Err(RelayError::GuestConnect {
                        target: self.target,
                        source: io::Error::new(io::ErrorKind::TimedOut, "guest connect timed out"),
                    });
                }
            };
            *relayed += 1;
            connections.spawn(connection::pump(
                client,
                guest,
                self.shutdown.child_token(),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_policy(max_restarts: u32) -> RestartPolicy {
        RestartPolicy {
            max_restarts,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn gives_up_after_restart_ceiling() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").expect("bind blocker");
        let listen = occupied.local_addr().expect("blocker addr");
        let target: SocketAddr = "127.0.0.1:9".parse().expect("target addr");

        let server = RelayServer::new(listen, target, quick_policy(2));
        let err = server
            .run(|_| {})
            .await
            .expect_err("port stays occupied");
        let RelayError::RestartsExhausted { attempts, last } = err else {
            panic!("expected RestartsExhausted, got {err:?}");
        };
        assert_eq!(attempts, 2);
        assert!(matches!(*last, RelayError::Bind { .. }));
    }

    #[tokio::test]
    async fn shutdown_stops_a_listening_relay() {
        let target: SocketAddr = "127.0.0.1:9".parse().expect("target addr");
        let server = RelayServer::new(
            "127.0.0.1:0".parse().expect("listen addr"),
            target,
            quick_policy(2),
        );
        let token = server.shutdown_token();
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
        let mut ready_tx = Some(ready_tx);
        let handle = tokio::spawn(server.run(move |addr| {
            if let Some(tx) = ready_tx.take() {
                tx.send(addr).ok();
            }
        }));

        ready_rx.await.expect("relay reports readiness");
        token.cancel();
        let result = handle.await.expect("relay task joins");
        assert!(result.is_ok(), "shutdown is not an error: {result:?}");
    }
}
