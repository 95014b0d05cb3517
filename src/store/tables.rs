//! Record tables and constraint checks shared by the store implementations.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use super::{
    DeploymentRecord, HostRecord, NetworkRecord, NewHost, NewNetwork, NewTunnel, RecordId,
    StoreError, TunnelRecord,
};

/// Full snapshot of every table. Rows are kept in identifier order.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub(super) struct Tables {
    next_id: u64,
    deployments: Vec<DeploymentRecord>,
    networks: Vec<NetworkRecord>,
    hosts: Vec<HostRecord>,
    tunnels: Vec<TunnelRecord>,
}

fn conflict(table: &'static str, column: &'static str, value: impl ToString) -> StoreError {
    StoreError::Conflict {
        table,
        column,
        value: value.to_string(),
    }
}

/// One committed-or-pending mutation, replayable onto another snapshot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(super) enum Change {
    CreateDeployment(DeploymentRecord),
    DeleteDeployment(RecordId),
    InsertNetwork(NetworkRecord),
    UpdateNetwork(NetworkRecord),
    DeleteNetwork(RecordId),
    InsertHost(HostRecord),
    UpdateHost(HostRecord),
    DeleteHost(RecordId),
    InsertTunnel(TunnelRecord),
    UpdateTunnel(TunnelRecord),
    DeleteTunnel(RecordId),
}

fn place<T>(rows: &mut Vec<T>, row: T, row_id: impl Fn(&T) -> RecordId) {
    let id = row_id(&row);
    let at = rows.partition_point(|existing| row_id(existing) < id);
    rows.insert(at, row);
}

/// A row someone else already deleted is as good as deleted.
fn ignore_missing(result: Result<(), StoreError>) -> Result<(), StoreError> {
    match result {
        Err(StoreError::NotFound { .. }) => Ok(()),
        other => other,
    }
}

fn remove_row<T>(
    rows: &mut Vec<T>,
    table: &'static str,
    id: RecordId,
    row_id: impl Fn(&T) -> RecordId,
) -> Result<(), StoreError> {
    let before = rows.len();
    rows.retain(|row| row_id(row) != id);
    if rows.len() == before {
        return Err(StoreError::NotFound { table, id });
    }
    Ok(())
}

fn replace_row<T: Clone>(
    rows: &mut [T],
    table: &'static str,
    updated: &T,
    row_id: impl Fn(&T) -> RecordId,
) -> Result<(), StoreError> {
    let id = row_id(updated);
    let slot = rows
        .iter_mut()
        .find(|row| row_id(row) == id)
        .ok_or(StoreError::NotFound { table, id })?;
    *slot = updated.clone();
    Ok(())
}

impl Tables {
    fn allocate_id(&mut self) -> RecordId {
        self.next_id += 1;
        RecordId::new(self.next_id)
    }

    /// Highest identifier handed out so far.
    pub(super) const fn next_id(&self) -> u64 {
        self.next_id
    }

    pub(super) const fn set_next_id(&mut self, next_id: u64) {
        self.next_id = next_id;
    }

    /// Sets aside `count` identifiers and returns the value the counter had
    /// before; ids `start + 1 ..= start + count` then belong to the caller.
    pub(super) const fn reserve_ids(&mut self, count: u64) -> u64 {
        let start = self.next_id;
        self.next_id += count;
        start
    }

    /// Replays `change` onto this snapshot, re-checking every constraint.
    pub(super) fn apply(&mut self, change: &Change) -> Result<(), StoreError> {
        match change {
            Change::CreateDeployment(record) => self.put_deployment(record.clone()),
            Change::DeleteDeployment(id) => ignore_missing(self.delete_deployment(*id)),
            Change::InsertNetwork(record) => self.put_network(record.clone()),
            Change::UpdateNetwork(record) => self.update_network(record),
            Change::DeleteNetwork(id) => ignore_missing(self.delete_network(*id)),
            Change::InsertHost(record) => self.put_host(record.clone()),
            Change::UpdateHost(record) => self.update_host(record),
            Change::DeleteHost(id) => ignore_missing(self.delete_host(*id)),
            Change::InsertTunnel(record) => {
                place(&mut self.tunnels, record.clone(), |row| row.id);
                Ok(())
            }
            Change::UpdateTunnel(record) => self.update_tunnel(record),
            Change::DeleteTunnel(id) => ignore_missing(self.delete_tunnel(*id)),
        }
    }

    fn put_deployment(&mut self, record: DeploymentRecord) -> Result<(), StoreError> {
        if self.deployments.iter().any(|row| row.name == record.name) {
            return Err(conflict("deployments", "name", record.name));
        }
        place(&mut self.deployments, record, |row| row.id);
        Ok(())
    }

    pub(super) fn create_deployment(
        &mut self,
        name: &str,
    ) -> Result<DeploymentRecord, StoreError> {
        if self.deployments.iter().any(|row| row.name == name) {
            return Err(conflict("deployments", "name", name));
        }
        let record = DeploymentRecord {
            id: self.allocate_id(),
            name: name.to_owned(),
        };
        self.put_deployment(record.clone())?;
        Ok(record)
    }

    pub(super) fn deployment_by_name(&self, name: &str) -> Option<DeploymentRecord> {
        self.deployments.iter().find(|row| row.name == name).cloned()
    }

    pub(super) fn deployments(&self) -> Vec<DeploymentRecord> {
        self.deployments.clone()
    }

    pub(super) fn delete_deployment(&mut self, id: RecordId) -> Result<(), StoreError> {
        remove_row(&mut self.deployments, "deployments", id, |row| row.id)
    }

    fn check_network(
        &self,
        id: Option<RecordId>,
        name: Option<&str>,
        address: Option<Ipv4Addr>,
    ) -> Result<(), StoreError> {
        for row in self.networks.iter().filter(|row| Some(row.id) != id) {
            if let Some(taken) = name
                && row.assigned_name.as_deref() == Some(taken)
            {
                return Err(conflict("networks", "assigned_name", taken));
            }
            if let Some(taken) = address
                && row.address == Some(taken)
            {
                return Err(conflict("networks", "address", taken));
            }
        }
        Ok(())
    }

    pub(super) fn insert_network(
        &mut self,
        network: NewNetwork,
    ) -> Result<NetworkRecord, StoreError> {
        self.check_network(None, Some(&network.assigned_name), Some(network.address))?;
        let record = NetworkRecord {
            id: self.allocate_id(),
            label: network.label,
            assigned_name: Some(network.assigned_name),
            address: Some(network.address),
            dhcp_lower: network.dhcp_lower,
            dhcp_upper: network.dhcp_upper,
            deployment_id: network.deployment_id,
        };
        self.put_network(record.clone())?;
        Ok(record)
    }

    fn put_network(&mut self, record: NetworkRecord) -> Result<(), StoreError> {
        self.check_network(None, record.assigned_name.as_deref(), record.address)?;
        place(&mut self.networks, record, |row| row.id);
        Ok(())
    }

    pub(super) fn update_network(&mut self, network: &NetworkRecord) -> Result<(), StoreError> {
        self.check_network(
            Some(network.id),
            network.assigned_name.as_deref(),
            network.address,
        )?;
        replace_row(&mut self.networks, "networks", network, |row| row.id)
    }

    pub(super) fn network_by_address(&self, address: Ipv4Addr) -> Option<NetworkRecord> {
        self.networks
            .iter()
            .find(|row| row.address == Some(address))
            .cloned()
    }

    pub(super) fn networks(&self, deployment_id: RecordId) -> Vec<NetworkRecord> {
        self.networks
            .iter()
            .filter(|row| row.deployment_id == deployment_id)
            .cloned()
            .collect()
    }

    pub(super) fn delete_network(&mut self, id: RecordId) -> Result<(), StoreError> {
        remove_row(&mut self.networks, "networks", id, |row| row.id)
    }

    fn check_host(
        &self,
        id: Option<RecordId>,
        vmname: &str,
        relay_port: Option<u16>,
    ) -> Result<(), StoreError> {
        for row in self.hosts.iter().filter(|row| Some(row.id) != id) {
            if row.vmname == vmname {
                return Err(conflict("hosts", "vmname", vmname));
            }
            if let Some(port) = relay_port
                && row.relay_port == Some(port)
            {
                return Err(conflict("hosts", "relay_port", port));
            }
        }
        Ok(())
    }

    pub(super) fn insert_host(&mut self, host: NewHost) -> Result<HostRecord, StoreError> {
        self.check_host(None, &host.vmname, None)?;
        let record = HostRecord {
            id: self.allocate_id(),
            vmname: host.vmname,
            image: host.image,
            username: host.username,
            password: host.password,
            deployment_id: host.deployment_id,
            relay_port: None,
        };
        self.put_host(record.clone())?;
        Ok(record)
    }

    fn put_host(&mut self, record: HostRecord) -> Result<(), StoreError> {
        self.check_host(None, &record.vmname, record.relay_port)?;
        place(&mut self.hosts, record, |row| row.id);
        Ok(())
    }

    pub(super) fn update_host(&mut self, host: &HostRecord) -> Result<(), StoreError> {
        self.check_host(Some(host.id), &host.vmname, host.relay_port)?;
        replace_row(&mut self.hosts, "hosts", host, |row| row.id)
    }

    pub(super) fn host_by_vmname(&self, vmname: &str) -> Option<HostRecord> {
        self.hosts.iter().find(|row| row.vmname == vmname).cloned()
    }

    pub(super) fn hosts(&self, deployment_id: RecordId) -> Vec<HostRecord> {
        self.hosts
            .iter()
            .filter(|row| row.deployment_id == deployment_id)
            .cloned()
            .collect()
    }

    pub(super) fn all_hosts(&self) -> Vec<HostRecord> {
        self.hosts.clone()
    }

    pub(super) fn delete_host(&mut self, id: RecordId) -> Result<(), StoreError> {
        remove_row(&mut self.hosts, "hosts", id, |row| row.id)
    }

    pub(super) fn insert_tunnel(&mut self, tunnel: NewTunnel) -> TunnelRecord {
        let record = TunnelRecord {
            id: self.allocate_id(),
            process_id: None,
            deployment_id: tunnel.deployment_id,
            host_id: tunnel.host_id,
            listen_port: tunnel.listen_port,
        };
        place(&mut self.tunnels, record.clone(), |row| row.id);
        record
    }

    pub(super) fn update_tunnel(&mut self, tunnel: &TunnelRecord) -> Result<(), StoreError> {
        replace_row(&mut self.tunnels, "tunnels", tunnel, |row| row.id)
    }

    pub(super) fn tunnels(&self, deployment_id: RecordId) -> Vec<TunnelRecord> {
        self.tunnels
            .iter()
            .filter(|row| row.deployment_id == deployment_id)
            .cloned()
            .collect()
    }

    pub(super) fn all_tunnels(&self) -> Vec<TunnelRecord> {
        self.tunnels.clone()
    }

    pub(super) fn delete_tunnel(&mut self, id: RecordId) -> Result<(), StoreError> {
        remove_row(&mut self.tunnels, "tunnels", id, |row| row.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    #[fixture]
    fn tables() -> Tables {
        Tables::default()
    }

    fn new_network(deployment_id: RecordId, name: &str, address: [u8; 4]) -> NewNetwork {
        NewNetwork {
            label: String::from("lan"),
            assigned_name: name.to_owned(),
            address: Ipv4Addr::from(address),
            dhcp_lower: Ipv4Addr::new(10, 0, 0, 100),
            dhcp_upper: Ipv4Addr::new(10, 0, 0, 200),
            deployment_id,
        }
    }

    fn new_host(deployment_id: RecordId, vmname: &str) -> NewHost {
        NewHost {
            vmname: vmname.to_owned(),
            image: String::from("ubuntu.ova"),
            username: String::from("user"),
            password: String::from("pass"),
            deployment_id,
        }
    }

    #[rstest]
    fn deployment_names_are_unique(mut tables: Tables) {
        tables.create_deployment("lab").expect("first insert");
        let err = tables.create_deployment("lab").expect_err("duplicate name");
        assert!(matches!(err, StoreError::Conflict { column: "name", .. }));
    }

    #[rstest]
    fn network_address_and_name_are_unique(mut tables: Tables) {
        let lab = tables.create_deployment("lab").expect("deployment").id;
        tables
            .insert_network(new_network(lab, "vboxnet0", [10, 0, 0, 1]))
            .expect("first network");
        let same_address = tables
            .insert_network(new_network(lab, "vboxnet1", [10, 0, 0, 1]))
            .expect_err("duplicate address");
        assert!(matches!(same_address, StoreError::Conflict { column: "address", .. }));
        let same_name = tables
            .insert_network(new_network(lab, "vboxnet0", [10, 0, 1, 1]))
            .expect_err("duplicate name");
        assert!(matches!(same_name, StoreError::Conflict { column: "assigned_name", .. }));
    }

    #[rstest]
    fn tombstoned_network_frees_its_address(mut tables: Tables) {
        let lab = tables.create_deployment("lab").expect("deployment").id;
        let mut network = tables
            .insert_network(new_network(lab, "vboxnet0", [10, 0, 0, 1]))
            .expect("network");
        network.assigned_name = None;
        network.address = None;
        tables.update_network(&network).expect("tombstone");
        assert_eq!(tables.network_by_address(Ipv4Addr::new(10, 0, 0, 1)), None);
        tables
            .insert_network(new_network(lab, "vboxnet0", [10, 0, 0, 1]))
            .expect("address reusable after tombstone");
    }

    #[rstest]
    fn relay_ports_are_unique_across_hosts(mut tables: Tables) {
        let lab = tables.create_deployment("lab").expect("deployment").id;
        let mut first = tables.insert_host(new_host(lab, "web-1")).expect("web-1");
        let mut second = tables.insert_host(new_host(lab, "web-2")).expect("web-2");
        first.relay_port = Some(2000);
        tables.update_host(&first).expect("first port");
        second.relay_port = Some(2000);
        let err = tables.update_host(&second).expect_err("port already recorded");
        assert!(matches!(err, StoreError::Conflict { column: "relay_port", .. }));
        second.relay_port = Some(2001);
        tables.update_host(&second).expect("distinct port");
    }

    #[rstest]
    fn delete_reports_missing_rows(mut tables: Tables) {
        let err = tables
            .delete_host(RecordId::new(42))
            .expect_err("nothing to delete");
        assert_eq!(
            err,
            StoreError::NotFound {
                table: "hosts",
                id: RecordId::new(42)
            }
        );
    }

    #[rstest]
    fn replayed_rows_keep_identifier_order(mut tables: Tables) {
        let start = tables.reserve_ids(10);
        let late = tables.create_deployment("late").expect("late");
        assert_eq!(late.id, RecordId::new(start + 11));

        let early = DeploymentRecord {
            id: RecordId::new(start + 3),
            name: String::from("early"),
        };
        tables
            .apply(&Change::CreateDeployment(early.clone()))
            .expect("replay");
        assert_eq!(tables.deployments(), vec![early, late]);
    }

    #[rstest]
    fn replay_rechecks_constraints_but_tolerates_deleted_rows(mut tables: Tables) {
        let lab = tables.create_deployment("lab").expect("lab");
        let clash = DeploymentRecord {
            id: RecordId::new(99),
            name: String::from("lab"),
        };
        let err = tables
            .apply(&Change::CreateDeployment(clash))
            .expect_err("name taken");
        assert!(matches!(err, StoreError::Conflict { column: "name", .. }));

        tables
            .apply(&Change::DeleteDeployment(lab.id))
            .expect("first delete");
        tables
            .apply(&Change::DeleteDeployment(lab.id))
            .expect("already gone");
        assert!(tables.deployments().is_empty());
    }

    #[rstest]
    fn queries_filter_by_deployment(mut tables: Tables) {
        let lab = tables.create_deployment("lab").expect("lab").id;
        let other = tables.create_deployment("other").expect("other").id;
        tables.insert_host(new_host(lab, "web-1")).expect("web-1");
        tables.insert_host(new_host(other, "db-1")).expect("db-1");
        let names: Vec<String> = tables.hosts(lab).into_iter().map(|host| host.vmname).collect();
        assert_eq!(names, vec![String::from("web-1")]);
        assert_eq!(tables.all_hosts().len(), 2);
    }
}
