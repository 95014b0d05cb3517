//! Relay servers exposing guest SSH ports on externally reachable ports.
//!
//! [`TunnelSupervisor`] owns the per-deployment lifecycle: it reserves a
//! port, records a tunnel, launches a relay through a [`RelayLauncher`] and
//! tears everything down again. Each relay is a [`RelayServer`]: a
//! supervised accept loop that restarts with exponential backoff and hands
//! every accepted client to a [`connection::pump`].

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::command::CommandError;
use crate::hypervisor::HypervisorError;
use crate::store::StoreError;

pub mod connection;
mod launcher;
mod ports;
mod relay;
mod supervisor;

pub use launcher::{
    DEFAULT_KILL_BIN, DEFAULT_READY_TIMEOUT, LaunchFuture, ProcessRelayLauncher, READY_PREFIX,
    RelayLauncher, RelaySpec, Termination, ready_line,
};
pub use ports::PortAllocator;
pub use relay::{DEFAULT_GUEST_CONNECT_TIMEOUT, RelayServer};
pub use supervisor::{TunnelInfo, TunnelSupervisor};

/// Default first port tried for relays.
pub const DEFAULT_RELAY_BASE_PORT: u16 = 2000;

/// Default guest SSH port.
pub const DEFAULT_GUEST_SSH_PORT: u16 = 22;

/// Restart behaviour of a relay listener.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RestartPolicy {
    /// Consecutive crashes tolerated before the relay gives up.
    pub max_restarts: u32,
    /// Delay before the first restart.
    pub initial_backoff: Duration,
    /// Upper bound on the delay between restarts.
    pub max_backoff: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RestartPolicy {
    /// Delay following `current`, doubled and capped at `max_backoff`.
    #[must_use]
    pub fn next_backoff(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_backoff)
    }
}

/// Errors raised inside a relay server.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Raised when the listener cannot bind its port.
    #[error("failed to bind relay listener on {addr}: {source}")]
    Bind {
        /// Address being bound.
        addr: SocketAddr,
        /// Underlying socket error.
        source: std::io::Error,
    },
    /// Raised when accepting a client fails.
    #[error("relay accept failed: {0}")]
    Accept(#[source] std::io::Error),
    /// Raised when the guest cannot be reached for an accepted client.
    #[error("failed to reach guest {target}: {source}")]
    GuestConnect {
        /// Guest address.
        target: SocketAddr,
        /// Underlying socket error.
        source: std::io::Error,
    },
    /// Raised when the listener kept crashing past the restart ceiling.
    #[error("relay gave up after {attempts} restarts: {last}")]
    RestartsExhausted {
        /// Restarts attempted.
        attempts: u32,
        /// Error that ended the final attempt.
        last: Box<RelayError>,
    },
}

/// Errors raised by the tunnel supervisor and relay launchers.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Raised when the store cannot be read or written.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Raised when a host's address cannot be looked up.
    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),
    /// Raised when the kill command cannot be executed.
    #[error(transparent)]
    Command(#[from] CommandError),
    /// Raised when no free port remains at or above the base port.
    #[error("no free relay port at or above {base}")]
    PortsExhausted {
        /// First port tried.
        base: u16,
    },
    /// Raised when a relay cannot be started.
    #[error("failed to launch relay on port {port}: {message}")]
    Launch {
        /// Port the relay should have listened on.
        port: u16,
        /// Failure description.
        message: String,
    },
    /// Raised when a relay does not report readiness in time.
    #[error("relay on port {port} did not report readiness within {timeout:?}")]
    ReadyTimeout {
        /// Port the relay should have listened on.
        port: u16,
        /// Readiness deadline.
        timeout: Duration,
    },
    /// Raised when a relay process cannot be terminated.
    #[error("failed to terminate relay process {process_id}: {message}")]
    Terminate {
        /// Relay process id.
        process_id: u32,
        /// Failure description.
        message: String,
    },
    /// Raised when a relay's liveness cannot be determined.
    #[error("failed to check relay process {process_id}: {message}")]
    Liveness {
        /// Relay process id.
        process_id: u32,
        /// Failure description.
        message: String,
    },
    /// Raised when a background task panicked or was cancelled.
    #[error("tunnel task failed: {0}")]
    Join(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(100, 200)]
    #[case(3000, 5000)]
    #[case(5000, 5000)]
    fn backoff_doubles_up_to_the_cap(#[case] current_ms: u64, #[case] expected_ms: u64) {
        let policy = RestartPolicy::default();
        assert_eq!(
            policy.next_backoff(Duration::from_millis(current_ms)),
            Duration::from_millis(expected_ms)
        );
    }
}
