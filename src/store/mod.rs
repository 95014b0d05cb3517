//! Persistence for deployment, network, host and tunnel records.
//!
//! The [`Store`] trait is the single source of truth the builder,
//! orchestrator and tunnel supervisor consult. Every mutation is applied
//! atomically per record and unique constraints are enforced on insert and
//! update; [`Store::commit`] makes pending changes durable. Cascading
//! deletes are the caller's responsibility.

use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod file;
mod memory;
mod tables;

pub use file::JsonFileStore;
pub use memory::MemoryStore;

/// Identifier assigned to a persisted record.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct RecordId(u64);

impl RecordId {
    /// Wraps a raw identifier.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw identifier.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A named group of hosts and networks.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct DeploymentRecord {
    /// Record identifier.
    pub id: RecordId,
    /// Unique deployment name.
    pub name: String,
}

/// A private network as persisted. `assigned_name` and `address` are
/// cleared once the network has been destroyed.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct NetworkRecord {
    /// Record identifier.
    pub id: RecordId,
    /// Label used by topology host declarations.
    pub label: String,
    /// Hypervisor-issued interface name.
    pub assigned_name: Option<String>,
    /// Host-side address of the network.
    pub address: Option<Ipv4Addr>,
    /// Lowest address handed out by the lease service.
    pub dhcp_lower: Ipv4Addr,
    /// Highest address handed out by the lease service.
    pub dhcp_upper: Ipv4Addr,
    /// Owning deployment.
    pub deployment_id: RecordId,
}

/// Fields of a network record before insertion.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NewNetwork {
    /// Label used by topology host declarations.
    pub label: String,
    /// Hypervisor-issued interface name.
    pub assigned_name: String,
    /// Host-side address of the network.
    pub address: Ipv4Addr,
    /// Lowest address handed out by the lease service.
    pub dhcp_lower: Ipv4Addr,
    /// Highest address handed out by the lease service.
    pub dhcp_upper: Ipv4Addr,
    /// Owning deployment.
    pub deployment_id: RecordId,
}

/// A virtual host as persisted.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct HostRecord {
    /// Record identifier.
    pub id: RecordId,
    /// Unique machine name.
    pub vmname: String,
    /// Image the machine was imported from.
    pub image: String,
    /// Guest login user.
    pub username: String,
    /// Guest login password.
    pub password: String,
    /// Owning deployment.
    pub deployment_id: RecordId,
    /// Port of the relay currently exposing the guest's SSH port.
    pub relay_port: Option<u16>,
}

/// Fields of a host record before insertion.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NewHost {
    /// Unique machine name.
    pub vmname: String,
    /// Image the machine was imported from.
    pub image: String,
    /// Guest login user.
    pub username: String,
    /// Guest login password.
    pub password: String,
    /// Owning deployment.
    pub deployment_id: RecordId,
}

/// One relay server process.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TunnelRecord {
    /// Record identifier.
    pub id: RecordId,
    /// Relay process id, written once the relay is listening.
    pub process_id: Option<u32>,
    /// Owning deployment.
    pub deployment_id: RecordId,
    /// Host the relay forwards to.
    pub host_id: RecordId,
    /// Externally reachable port.
    pub listen_port: u16,
}

/// Fields of a tunnel record before insertion.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NewTunnel {
    /// Owning deployment.
    pub deployment_id: RecordId,
    /// Host the relay forwards to.
    pub host_id: RecordId,
    /// Externally reachable port.
    pub listen_port: u16,
}

/// Errors raised by store implementations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum StoreError {
    /// Raised when a unique constraint would be violated.
    #[error("{table}.{column} already contains {value}")]
    Conflict {
        /// Table holding the constraint.
        table: &'static str,
        /// Constrained column.
        column: &'static str,
        /// Conflicting value.
        value: String,
    },
    /// Raised when updating or deleting a record that does not exist.
    #[error("{table} record {id} not found")]
    NotFound {
        /// Table being modified.
        table: &'static str,
        /// Missing record identifier.
        id: RecordId,
    },
    /// Raised when the backing file cannot be read or written.
    #[error("failed to access store {path}: {message}")]
    Io {
        /// Backing file path.
        path: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the backing file cannot be decoded or encoded.
    #[error("store {path} is corrupt: {message}")]
    Corrupt {
        /// Backing file path.
        path: String,
        /// Decoder error message.
        message: String,
    },
    /// Raised when the store lock was poisoned by a panicking writer.
    #[error("store lock poisoned")]
    Poisoned,
}

/// Repository over all persisted records.
pub trait Store: Send + Sync {
    /// Creates a deployment called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] when the name is taken.
    fn create_deployment(&self, name: &str) -> Result<DeploymentRecord, StoreError>;

    /// Looks a deployment up by name.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be read.
    fn deployment_by_name(&self, name: &str) -> Result<Option<DeploymentRecord>, StoreError>;

    /// Every deployment, ordered by identifier.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be read.
    fn deployments(&self) -> Result<Vec<DeploymentRecord>, StoreError>;

    /// Deletes the deployment `id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when no such record exists.
    fn delete_deployment(&self, id: RecordId) -> Result<(), StoreError>;

    /// Inserts a network.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] when the name or address is taken.
    fn insert_network(&self, network: NewNetwork) -> Result<NetworkRecord, StoreError>;

    /// Replaces the stored copy of `network`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the record is missing or a constraint
    /// would be violated.
    fn update_network(&self, network: &NetworkRecord) -> Result<(), StoreError>;

    /// Looks a live network up by its address.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be read.
    fn network_by_address(&self, address: Ipv4Addr) -> Result<Option<NetworkRecord>, StoreError>;

    /// Networks of a deployment, ordered by identifier.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be read.
    fn networks(&self, deployment_id: RecordId) -> Result<Vec<NetworkRecord>, StoreError>;

    /// Deletes the network `id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when no such record exists.
    fn delete_network(&self, id: RecordId) -> Result<(), StoreError>;

    /// Inserts a host.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] when the machine name is taken.
    fn insert_host(&self, host: NewHost) -> Result<HostRecord, StoreError>;

    /// Replaces the stored copy of `host`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the record is missing or a constraint
    /// would be violated.
    fn update_host(&self, host: &HostRecord) -> Result<(), StoreError>;

    /// Looks a host up by machine name.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be read.
    fn host_by_vmname(&self, vmname: &str) -> Result<Option<HostRecord>, StoreError>;

    /// Hosts of a deployment, ordered by identifier.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be read.
    fn hosts(&self, deployment_id: RecordId) -> Result<Vec<HostRecord>, StoreError>;

    /// Every host, ordered by identifier.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be read.
    fn all_hosts(&self) -> Result<Vec<HostRecord>, StoreError>;

    /// Deletes the host `id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when no such record exists.
    fn delete_host(&self, id: RecordId) -> Result<(), StoreError>;

    /// Inserts a tunnel.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be written.
    fn insert_tunnel(&self, tunnel: NewTunnel) -> Result<TunnelRecord, StoreError>;

    /// Replaces the stored copy of `tunnel`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the record is missing.
    fn update_tunnel(&self, tunnel: &TunnelRecord) -> Result<(), StoreError>;

    /// Tunnels of a deployment, ordered by identifier.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be read.
    fn tunnels(&self, deployment_id: RecordId) -> Result<Vec<TunnelRecord>, StoreError>;

    /// Every tunnel, ordered by identifier.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be read.
    fn all_tunnels(&self) -> Result<Vec<TunnelRecord>, StoreError>;

    /// Deletes the tunnel `id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when no such record exists.
    fn delete_tunnel(&self, id: RecordId) -> Result<(), StoreError>;

    /// Makes every change since the previous commit durable.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the changes cannot be written.
    fn commit(&self) -> Result<(), StoreError>;
}
