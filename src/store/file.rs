//! JSON snapshot [`Store`] backing the command-line tool.
//!
//! Several `virtlab` processes may share one store file. Each handle keeps a
//! working copy plus a journal of the changes made since its last commit.
//! [`Store::commit`] takes an exclusive lock on a sibling `.lock` file,
//! re-reads the snapshot, replays the journal onto it and writes the result
//! back through a temporary file. Record identifiers come from blocks
//! reserved in the shared file, so handles never hand out the same id.

use std::io;
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs::OpenOptions;
use fd_lock::RwLock;
use tracing::debug;

use super::tables::{Change, Tables};
use super::{
    DeploymentRecord, HostRecord, NetworkRecord, NewHost, NewNetwork, NewTunnel, RecordId, Store,
    StoreError, TunnelRecord,
};
use crate::paths::{open_parent, read_optional, write_file};

/// Identifiers reserved from the shared file at a time.
const ID_BLOCK: u64 = 64;

/// Store persisting every table as one JSON document.
///
/// Changes accumulate in memory and reach the file on [`Store::commit`];
/// uncommitted changes are lost when the process exits. While a handle has
/// no uncommitted changes its queries see what other processes committed.
#[derive(Debug)]
pub struct JsonFileStore {
    path: Utf8PathBuf,
    session: Mutex<Session>,
}

#[derive(Debug, Default)]
struct Session {
    working: Tables,
    pending: Vec<Change>,
    /// Last identifier of the block this handle may allocate from.
    id_limit: u64,
}

impl Session {
    /// Swaps in `latest` while keeping this handle's identifier counter.
    fn rebase(&mut self, latest: Tables) {
        let next_id = self.working.next_id();
        self.working = latest;
        self.working.set_next_id(next_id);
    }
}

impl JsonFileStore {
    /// Opens the store at `path`, starting empty when the file is absent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] when the file cannot be read, or
    /// [`StoreError::Corrupt`] when it does not hold a valid snapshot.
    pub fn open(path: impl Into<Utf8PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let mut session = Session::default();
        session.rebase(load(&path)?);
        debug!(%path, "opened store");
        Ok(Self {
            path,
            session: Mutex::new(session),
        })
    }

    /// Location of the backing file.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn io_error(&self, err: &io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.to_string(),
            message: err.to_string(),
        }
    }

    /// Locks the session, first catching up with the file when nothing is
    /// pending.
    fn session(&self) -> Result<MutexGuard<'_, Session>, StoreError> {
        let mut session = self.session.lock().map_err(|_| StoreError::Poisoned)?;
        if session.pending.is_empty() {
            session.rebase(load(&self.path)?);
        }
        Ok(session)
    }

    /// Runs `update` against the current file contents while holding the
    /// exclusive file lock, then writes the result back.
    fn transact(
        &self,
        update: impl FnOnce(&mut Tables) -> Result<(), StoreError>,
    ) -> Result<Tables, StoreError> {
        let (dir, file_name) = open_parent(&self.path).map_err(|err| self.io_error(&err))?;
        let lock_file = dir
            .open_with(
                format!("{file_name}.lock"),
                OpenOptions::new().create(true).write(true),
            )
            .map_err(|err| self.io_error(&err))?;
        let mut lock = RwLock::new(lock_file);
        let _held = lock.write().map_err(|err| self.io_error(&err))?;

        let mut tables = load(&self.path)?;
        update(&mut tables)?;
        let rendered = serde_json::to_string_pretty(&tables).map_err(|err| StoreError::Corrupt {
            path: self.path.to_string(),
            message: err.to_string(),
        })?;
        write_file(&self.path, &rendered).map_err(|err| self.io_error(&err))?;
        Ok(tables)
    }

    /// Makes sure the session can allocate at least one more identifier.
    fn ensure_ids(&self, session: &mut Session) -> Result<(), StoreError> {
        if session.working.next_id() < session.id_limit {
            return Ok(());
        }
        let mut start = 0;
        self.transact(|tables| {
            start = tables.reserve_ids(ID_BLOCK);
            Ok(())
        })?;
        session.working.set_next_id(start);
        session.id_limit = start + ID_BLOCK;
        debug!(path = %self.path, start, "reserved record identifiers");
        Ok(())
    }

    fn query<T>(&self, query: impl FnOnce(&Tables) -> T) -> Result<T, StoreError> {
        let session = self.session()?;
        Ok(query(&session.working))
    }

    fn change<T>(
        &self,
        mutation: impl FnOnce(&mut Tables) -> Result<T, StoreError>,
        journal: impl FnOnce(&T) -> Change,
    ) -> Result<T, StoreError> {
        let mut session = self.session()?;
        let value = mutation(&mut session.working)?;
        session.pending.push(journal(&value));
        Ok(value)
    }

    fn insert<T>(
        &self,
        mutation: impl FnOnce(&mut Tables) -> Result<T, StoreError>,
        journal: impl FnOnce(&T) -> Change,
    ) -> Result<T, StoreError> {
        let mut session = self.session()?;
        self.ensure_ids(&mut session)?;
        let value = mutation(&mut session.working)?;
        session.pending.push(journal(&value));
        Ok(value)
    }
}

fn load(path: &Utf8Path) -> Result<Tables, StoreError> {
    let contents = read_optional(path).map_err(|err| StoreError::Io {
        path: path.to_string(),
        message: err.to_string(),
    })?;
    match contents {
        Some(text) if !text.trim().is_empty() => {
            serde_json::from_str(&text).map_err(|err| StoreError::Corrupt {
                path: path.to_string(),
                message: err.to_string(),
            })
        }
        _ => Ok(Tables::default()),
    }
}

impl Store for JsonFileStore {
    fn create_deployment(&self, name: &str) -> Result<DeploymentRecord, StoreError> {
        self.insert(
            |tables| tables.create_deployment(name),
            |record| Change::CreateDeployment(record.clone()),
        )
    }

    fn deployment_by_name(&self, name: &str) -> Result<Option<DeploymentRecord>, StoreError> {
        self.query(|tables| tables.deployment_by_name(name))
    }

    fn deployments(&self) -> Result<Vec<DeploymentRecord>, StoreError> {
        self.query(Tables::deployments)
    }

    fn delete_deployment(&self, id: RecordId) -> Result<(), StoreError> {
        self.change(
            |tables| tables.delete_deployment(id),
            |&()| Change::DeleteDeployment(id),
        )
    }

    fn insert_network(&self, network: NewNetwork) -> Result<NetworkRecord, StoreError> {
        self.insert(
            |tables| tables.insert_network(network),
            |record| Change::InsertNetwork(record.clone()),
        )
    }

    fn update_network(&self, network: &NetworkRecord) -> Result<(), StoreError> {
        self.change(
            |tables| tables.update_network(network),
            |&()| Change::UpdateNetwork(network.clone()),
        )
    }

    fn network_by_address(&self, address: Ipv4Addr) -> Result<Option<NetworkRecord>, StoreError> {
        self.query(|tables| tables.network_by_address(address))
    }

    fn networks(&self, deployment_id: RecordId) -> Result<Vec<NetworkRecord>, StoreError> {
        self.query(|tables| tables.networks(deployment_id))
    }

    fn delete_network(&self, id: RecordId) -> Result<(), StoreError> {
        self.change(
            |tables| tables.delete_network(id),
            |&()| Change::DeleteNetwork(id),
        )
    }

    fn insert_host(&self, host: NewHost) -> Result<HostRecord, StoreError> {
        self.insert(
            |tables| tables.insert_host(host),
            |record| Change::InsertHost(record.clone()),
        )
    }

    fn update_host(&self, host: &HostRecord) -> Result<(), StoreError> {
        self.change(
            |tables| tables.update_host(host),
            |&()| Change::UpdateHost(host.clone()),
        )
    }

    fn host_by_vmname(&self, vmname: &str) -> Result<Option<HostRecord>, StoreError> {
        self.query(|tables| tables.host_by_vmname(vmname))
    }

    fn hosts(&self, deployment_id: RecordId) -> Result<Vec<HostRecord>, StoreError> {
        self.query(|tables| tables.hosts(deployment_id))
    }

    fn all_hosts(&self) -> Result<Vec<HostRecord>, StoreError> {
        self.query(Tables::all_hosts)
    }

    fn delete_host(&self, id: RecordId) -> Result<(), StoreError> {
        self.change(|tables| tables.delete_host(id), |&()| Change::DeleteHost(id))
    }

    fn insert_tunnel(&self, tunnel: NewTunnel) -> Result<TunnelRecord, StoreError> {
        self.insert(
            |tables| Ok(tables.insert_tunnel(tunnel)),
            |record| Change::InsertTunnel(record.clone()),
        )
    }

    fn update_tunnel(&self, tunnel: &TunnelRecord) -> Result<(), StoreError> {
        self.change(
            |tables| tables.update_tunnel(tunnel),
            |&()| Change::UpdateTunnel(tunnel.clone()),
        )
    }

    fn tunnels(&self, deployment_id: RecordId) -> Result<Vec<TunnelRecord>, StoreError> {
        self.query(|tables| tables.tunnels(deployment_id))
    }

    fn all_tunnels(&self) -> Result<Vec<TunnelRecord>, StoreError> {
        self.query(Tables::all_tunnels)
    }

    fn delete_tunnel(&self, id: RecordId) -> Result<(), StoreError> {
        self.change(
            |tables| tables.delete_tunnel(id),
            |&()| Change::DeleteTunnel(id),
        )
    }

    /// Replays this handle's pending changes onto the latest file contents.
    ///
    /// A change that no longer fits (for example a name another process
    /// committed first) fails the commit with [`StoreError::Conflict`]; the
    /// file is left untouched and the changes stay pending.
    fn commit(&self) -> Result<(), StoreError> {
        let mut session = self.session.lock().map_err(|_| StoreError::Poisoned)?;
        if session.pending.is_empty() {
            return Ok(());
        }
        let pending = &session.pending;
        let latest = self.transact(|tables| {
            pending.iter().try_for_each(|change| tables.apply(change))
        })?;
        let written = session.pending.len();
        session.pending.clear();
        session.rebase(latest);
        debug!(path = %self.path, changes = written, "committed store");
        Ok(())
    }
}
