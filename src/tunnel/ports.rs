//! Relay port reservation.

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, SocketAddr, TcpListener as StdListener};
use std::sync::{Mutex, PoisonError};

use tokio::net::TcpStream;
use tracing::debug;

use super::TunnelError;

/// Hands out relay ports at or above a base port.
///
/// A candidate is claimed under a lock before it is checked, so concurrent
/// reservations never return the same port. A claimed port is kept only if
/// nothing answers on it locally and it can be bound on every interface.
///
/// The check cannot stop another process from binding the port before the
/// relay does; such a relay fails to start and its port is released.
#[derive(Debug)]
pub struct PortAllocator {
    base: u16,
    reserved: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    /// Creates an allocator probing upward from `base`.
    #[must_use]
    pub const fn new(base: u16) -> Self {
        Self {
            base,
            reserved: Mutex::new(BTreeSet::new()),
        }
    }

    /// First port tried.
    #[must_use]
    pub const fn base(&self) -> u16 {
        self.base
    }

    /// Reserves the lowest usable port that is neither reserved by this
    /// allocator nor listed in `taken`.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::PortsExhausted`] when every port up to 65535
    /// is unavailable.
    pub async fn reserve(&self, taken: &BTreeSet<u16>) -> Result<u16, TunnelError> {
        let mut candidate = self.base;
        loop {
            let Some(port) = self.claim_from(candidate, taken) else {
                return Err(TunnelError::PortsExhausted { base: self.base });
            };
            if port_is_free(port).await {
                debug!(port, "reserved relay port");
                return Ok(port);
            }
            self.release(port);
            let Some(next) = port.checked_add(1) else {
                return Err(TunnelError::PortsExhausted { base: self.base });
            };
            candidate = next;
        }
    }

    /// Returns `port` to the pool.
    pub fn release(&self, port: u16) {
        self.lock().remove(&port);
    }

    /// Ports currently held by this allocator.
    #[must_use]
    pub fn reserved(&self) -> BTreeSet<u16> {
        self.lock().clone()
    }

    fn claim_from(&self, start: u16, taken: &BTreeSet<u16>) -> Option<u16> {
        let mut reserved = self.lock();
        let port = (start..=u16::MAX)
            .find(|port| !reserved.contains(port) && !taken.contains(port))?;
        reserved.insert(port);
        Some(port)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<u16>> {
        self.reserved.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn port_is_free(port: u16) -> bool {
    if TcpStream::connect(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
        .await
        .is_ok()
    {
        debug!(port, "relay port answers locally");
        return false;
    }
    StdListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).is_ok()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn skips_ports_listed_as_taken() {
        let spare = StdListener::bind("0.0.0.0:0").expect("spare bind");
        let base = spare.local_addr().expect("spare addr").port();
        drop(spare);

        let allocator = PortAllocator::new(base);
        let taken = BTreeSet::from([base]);
        let port = allocator.reserve(&taken).await.expect("reserve");
        assert!(port > base);
        assert!(allocator.reserved().contains(&port));
    }

    #[tokio::test]
    async fn skips_ports_with_a_listener() {
        let busy = StdListener::bind("0.0.0.0:0").expect("busy bind");
        let base = busy.local_addr().expect("busy addr").port();

        let allocator = PortAllocator::new(base);
        let port = allocator.reserve(&BTreeSet::new()).await.expect("reserve");
        assert_ne!(port, base);
        assert!(!allocator.reserved().contains(&base));
    }

    #[tokio::test]
    async fn concurrent_reservations_are_distinct() {
        let allocator = Arc::new(PortAllocator::new(24_000));
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let shared = Arc::clone(&allocator);
            tasks.spawn(async move { shared.reserve(&BTreeSet::new()).await });
        }
        let mut ports = BTreeSet::new();
        while let Some(joined) = tasks.join_next().await {
            let port = joined.expect("task joins").expect("reserve");
            assert!(ports.insert(port), "port {port} handed out twice");
        }
        assert_eq!(ports.len(), 8);
    }

    #[tokio::test]
    async fn released_ports_can_be_reused() {
        let allocator = PortAllocator::new(24_500);
        let first = allocator.reserve(&BTreeSet::new()).await.expect("first");
        allocator.release(first);
        let second = allocator.reserve(&BTreeSet::new()).await.expect("second");
        assert_eq!(first, second);
    }
}
