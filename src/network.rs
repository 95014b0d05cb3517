//! Host-only network entity: creation and destruction command sequences.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::hypervisor::{Hypervisor, HypervisorError, LeaseRange};

/// Interface name prefix the hypervisor uses for host-only networks.
pub const NETWORK_NAME_PREFIX: &str = "vboxnet";

/// Maximum number of host-only interfaces the hypervisor supports.
pub const MAX_NETWORKS: u32 = 128;

/// Netmask applied to every host-only network.
pub const NETWORK_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

/// Predicts the name the hypervisor will issue for the next host-only
/// network: the lowest unused numeric suffix, searched up to one past the
/// largest suffix in use.
///
/// # Errors
///
/// Returns [`HypervisorError::NamesExhausted`] when the candidate would
/// exceed [`MAX_NETWORKS`].
///
/// # Examples
///
/// ```
/// # use virtlab::network::next_network_name;
/// let existing = vec![String::from("vboxnet0"), String::from("vboxnet2")];
/// assert_eq!(next_network_name(&existing).unwrap(), "vboxnet1");
/// ```
pub fn next_network_name(existing: &[String]) -> Result<String, HypervisorError> {
    let mut suffixes: Vec<u32> = existing
        .iter()
        .filter_map(|name| name.strip_prefix(NETWORK_NAME_PREFIX)?.parse().ok())
        .collect();
    suffixes.sort_unstable();
    let largest = suffixes.last().copied().unwrap_or(0);
    (0..=largest.saturating_add(1))
        .find(|candidate| suffixes.binary_search(candidate).is_err())
        .filter(|candidate| *candidate < MAX_NETWORKS)
        .map(|candidate| format!("{NETWORK_NAME_PREFIX}{candidate}"))
        .ok_or(HypervisorError::NamesExhausted {
            limit: MAX_NETWORKS,
        })
}

/// In-process lock serialising network name listing and creation.
///
/// Every component creating networks against the same hypervisor should
/// share one lock.
#[derive(Clone, Debug, Default)]
pub struct NetworkNameLock {
    inner: Arc<Mutex<()>>,
}

impl NetworkNameLock {
    /// Creates a fresh lock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Declared properties of a network.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NetworkSpec {
    /// Label used by host declarations.
    pub label: String,
    /// Host-side address.
    pub address: Ipv4Addr,
    /// Lowest address handed out by the lease service.
    pub dhcp_lower: Ipv4Addr,
    /// Highest address handed out by the lease service.
    pub dhcp_upper: Ipv4Addr,
}

impl NetworkSpec {
    fn lease_range(&self) -> LeaseRange {
        LeaseRange {
            address: self.address,
            netmask: NETWORK_NETMASK,
            lower: self.dhcp_lower,
            upper: self.dhcp_upper,
        }
    }
}

/// A host-only network that exists at the hypervisor.
#[derive(Debug)]
pub struct Network<'a, H: Hypervisor + ?Sized> {
    hypervisor: &'a H,
    name: String,
}

impl<'a, H: Hypervisor + ?Sized> Network<'a, H> {
    /// Binds to an existing network called `name`.
    #[must_use]
    pub const fn existing(hypervisor: &'a H, name: String) -> Self {
        Self { hypervisor, name }
    }

    /// Creates a network, assigns its address and enables its lease
    /// service.
    ///
    /// The name lock is held while the existing names are listed and the
    /// interface is created. When a later step fails the interface is
    /// removed again before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError`] when any command fails or when the
    /// hypervisor issues a name that was already in use.
    pub fn create(
        hypervisor: &'a H,
        names: &NetworkNameLock,
        spec: &NetworkSpec,
    ) -> Result<Self, HypervisorError> {
        let name = {
            let _guard = names
                .inner
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let existing = hypervisor.network_names()?;
            let issued = hypervisor.create_network()?;
            if existing.contains(&issued) {
                return Err(HypervisorError::AlreadyExists {
                    kind: "network",
                    name: issued,
                });
            }
            issued
        };

        let network = Self { hypervisor, name };
        if let Err(err) = network.configure(spec) {
            warn!(network = %network.name, error = %err, "network configuration failed; removing interface");
            network.cleanup_partial();
            return Err(err);
        }
        info!(network = %network.name, label = %spec.label, address = %spec.address, "created network");
        Ok(network)
    }

    fn configure(&self, spec: &NetworkSpec) -> Result<(), HypervisorError> {
        self.hypervisor.set_network_address(&self.name, spec.address)?;
        self.hypervisor
            .add_lease_service(&self.name, &spec.lease_range())
    }

    fn cleanup_partial(&self) {
        if let Err(err) = self.hypervisor.remove_lease_service(&self.name) {
            debug!(network = %self.name, error = %err, "no lease service to remove");
        }
        if let Err(err) = self.hypervisor.remove_network(&self.name) {
            warn!(network = %self.name, error = %err, "failed to remove partially created network");
        }
    }

    /// Hypervisor-issued interface name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Consumes the handle, returning the interface name.
    #[must_use]
    pub fn into_name(self) -> String {
        self.name
    }

    /// Removes the lease service, its lease files and the interface.
    ///
    /// Every step is attempted; the first failure is returned.
    ///
    /// # Errors
    ///
    /// Returns the first [`HypervisorError`] raised by the three steps.
    pub fn destroy(self) -> Result<(), HypervisorError> {
        let steps = [
            self.hypervisor.remove_lease_service(&self.name),
            self.hypervisor.remove_lease_files(&self.name),
            self.hypervisor.remove_network(&self.name),
        ];
        let mut first_error = None;
        for result in steps {
            if let Err(err) = result {
                warn!(network = %self.name, error = %err, "network teardown step failed");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => {
                info!(network = %self.name, "destroyed network");
                Ok(())
            }
        }
    }
}
