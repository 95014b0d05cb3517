//! In-memory [`Store`] used by tests and by embedders that manage
//! persistence themselves.

use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::tables::Tables;
use super::{
    DeploymentRecord, HostRecord, NetworkRecord, NewHost, NewNetwork, NewTunnel, RecordId, Store,
    StoreError, TunnelRecord,
};

/// Store keeping every table in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    commits: AtomicUsize,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times [`Store::commit`] has been called.
    #[must_use]
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    fn read<T>(&self, query: impl FnOnce(&Tables) -> T) -> Result<T, StoreError> {
        let tables = self.tables.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(query(&tables))
    }

    fn write<T>(
        &self,
        mutation: impl FnOnce(&mut Tables) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut tables = self.tables.lock().map_err(|_| StoreError::Poisoned)?;
        mutation(&mut tables)
    }
}

impl Store for MemoryStore {
    fn create_deployment(&self, name: &str) -> Result<DeploymentRecord, StoreError> {
        self.write(|tables| tables.create_deployment(name))
    }

    fn deployment_by_name(&self, name: &str) -> Result<Option<DeploymentRecord>, StoreError> {
        self.read(|tables| tables.deployment_by_name(name))
    }

    fn deployments(&self) -> Result<Vec<DeploymentRecord>, StoreError> {
        self.read(Tables::deployments)
    }

    fn delete_deployment(&self, id: RecordId) -> Result<(), StoreError> {
        self.write(|tables| tables.delete_deployment(id))
    }

    fn insert_network(&self, network: NewNetwork) -> Result<NetworkRecord, StoreError> {
        self.write(|tables| tables.insert_network(network))
    }

    fn update_network(&self, network: &NetworkRecord) -> Result<(), StoreError> {
        self.write(|tables| tables.update_network(network))
    }

    fn network_by_address(&self, address: Ipv4Addr) -> Result<Option<NetworkRecord>, StoreError> {
        self.read(|tables| tables.network_by_address(address))
    }

    fn networks(&self, deployment_id: RecordId) -> Result<Vec<NetworkRecord>, StoreError> {
        self.read(|tables| tables.networks(deployment_id))
    }

    fn delete_network(&self, id: RecordId) -> Result<(), StoreError> {
        self.write(|tables| tables.delete_network(id))
    }

    fn insert_host(&self, host: NewHost) -> Result<HostRecord, StoreError> {
        self.write(|tables| tables.insert_host(host))
    }

    fn update_host(&self, host: &HostRecord) -> Result<(), StoreError> {
        self.write(|tables| tables.update_host(host))
    }

    fn host_by_vmname(&self, vmname: &str) -> Result<Option<HostRecord>, StoreError> {
        self.read(|tables| tables.host_by_vmname(vmname))
    }

    fn hosts(&self, deployment_id: RecordId) -> Result<Vec<HostRecord>, StoreError> {
        self.read(|tables| tables.hosts(deployment_id))
    }

    fn all_hosts(&self) -> Result<Vec<HostRecord>, StoreError> {
        self.read(Tables::all_hosts)
    }

    fn delete_host(&self, id: RecordId) -> Result<(), StoreError> {
        self.write(|tables| tables.delete_host(id))
    }

    fn insert_tunnel(&self, tunnel: NewTunnel) -> Result<TunnelRecord, StoreError> {
        self.write(|tables| Ok(tables.insert_tunnel(tunnel)))
    }

    fn update_tunnel(&self, tunnel: &TunnelRecord) -> Result<(), StoreError> {
        self.write(|tables| tables.update_tunnel(tunnel))
    }

    fn tunnels(&self, deployment_id: RecordId) -> Result<Vec<TunnelRecord>, StoreError> {
        self.read(|tables| tables.tunnels(deployment_id))
    }

    fn all_tunnels(&self) -> Result<Vec<TunnelRecord>, StoreError> {
        self.read(Tables::all_tunnels)
    }

    fn delete_tunnel(&self, id: RecordId) -> Result<(), StoreError> {
        self.write(|tables| tables.delete_tunnel(id))
    }

    fn commit(&self) -> Result<(), StoreError> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
