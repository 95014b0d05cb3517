//! Lifecycle operations over persisted deployments.
//!
//! Every operation is keyed by deployment name and re-reads the deployment's
//! hosts and networks from the store before acting. Per-entity hypervisor
//! work runs on the blocking pool, at most `max_parallelism` at a time, and
//! failures are collected until the whole batch has finished.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::host::{DEFAULT_SETTLE_DELAY, Host, HostProperties, RestartTiming};
use crate::hypervisor::{Hypervisor, HypervisorError};
use crate::known_hosts::KnownHosts;
use crate::network::Network;
use crate::store::{DeploymentRecord, HostRecord, NetworkRecord, RecordId, Store, StoreError};

/// Default upper bound on waiting for started hosts to obtain addresses.
pub const DEFAULT_IP_POLL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default interval between address polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Result of an operation addressed to a deployment by name.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Outcome<T> {
    /// The deployment exists and the operation ran.
    Completed(T),
    /// No deployment has that name; nothing was done.
    NoSuchDeployment,
}

impl<T> Outcome<T> {
    /// Value of a completed operation.
    #[must_use]
    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            Self::NoSuchDeployment => None,
        }
    }
}

/// Addresses observed while polling a deployment's hosts.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct PollReport {
    /// First address observed per host.
    pub resolved: BTreeMap<String, Ipv4Addr>,
    /// Hosts still without an address at the deadline.
    pub unresolved: Vec<String>,
}

impl PollReport {
    /// Returns `true` when some host never obtained an address.
    #[must_use]
    pub fn timed_out(&self) -> bool {
        !self.unresolved.is_empty()
    }
}

/// Counts of resources removed by [`Orchestrator::destroy`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DestroyReport {
    /// Machines deleted.
    pub hosts_destroyed: usize,
    /// Networks removed.
    pub networks_destroyed: usize,
}

/// A host joined with its deployment and live hypervisor status.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct HostDetails {
    /// Owning deployment name.
    pub deployment: String,
    /// Machine name.
    pub vmname: String,
    /// Port of the relay exposing the host, if any.
    pub relay_port: Option<u16>,
    /// Live status, when it could be read.
    pub properties: Option<HostProperties>,
    /// Why the status could not be read.
    pub error: Option<String>,
}

/// A network joined with its deployment and hypervisor presence.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct NetworkDetails {
    /// Owning deployment name.
    pub deployment: String,
    /// Declared label.
    pub label: String,
    /// Hypervisor-issued interface name.
    pub assigned_name: Option<String>,
    /// Host-side address.
    pub address: Option<Ipv4Addr>,
    /// First leased address.
    pub dhcp_lower: Ipv4Addr,
    /// Last leased address.
    pub dhcp_upper: Ipv4Addr,
    /// Whether the hypervisor still lists the interface.
    pub present: bool,
}

/// One entity that failed within a batch.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EntityFailure {
    /// Machine or network name.
    pub entity: String,
    /// Failure description.
    pub message: String,
}

impl fmt::Display for EntityFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.entity, self.message)
    }
}

fn render_failures(failures: &[EntityFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors raised by orchestrator operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Raised after a batch in which at least one entity failed.
    #[error("{operation} failed in deployment {deployment}: {}", render_failures(.failures))]
    Batch {
        /// Operation that ran.
        operation: &'static str,
        /// Deployment name.
        deployment: String,
        /// Every failed entity.
        failures: Vec<EntityFailure>,
    },
    /// Raised when the store cannot be read or written.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Raised when a worker task panicked.
    #[error("orchestrator task failed: {0}")]
    Join(String),
}

#[derive(Debug, Error)]
enum EntityError {
    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Starts, stops, restarts, polls, describes and destroys deployments.
#[derive(Debug)]
pub struct Orchestrator<H, S> {
    hypervisor: Arc<H>,
    store: Arc<S>,
    ip_poll_timeout: Duration,
    poll_interval: Duration,
    settle_delay: Duration,
    max_parallelism: Option<usize>,
    known_hosts: Option<KnownHosts>,
}

impl<H, S> Orchestrator<H, S>
where
    H: Hypervisor + 'static,
    S: Store + 'static,
{
    /// Creates an orchestrator with default timing and no parallelism cap.
    #[must_use]
    pub const fn new(hypervisor: Arc<H>, store: Arc<S>) -> Self {
        Self {
            hypervisor,
            store,
            ip_poll_timeout: DEFAULT_IP_POLL_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            settle_delay: DEFAULT_SETTLE_DELAY,
            max_parallelism: None,
            known_hosts: None,
        }
    }

    /// Upper bound on address polling and on waiting for power-off.
    #[must_use]
    pub const fn with_ip_poll_timeout(mut self, timeout: Duration) -> Self {
        self.ip_poll_timeout = timeout;
        self
    }

    /// Interval between address and power state checks.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Pause between power-off and start during a restart.
    #[must_use]
    pub const fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Caps the number of concurrent per-entity operations.
    #[must_use]
    pub const fn with_max_parallelism(mut self, cap: Option<usize>) -> Self {
        self.max_parallelism = cap;
        self
    }

    /// Scrubs destroyed hosts' addresses from `known_hosts`.
    #[must_use]
    pub fn with_known_hosts(mut self, known_hosts: KnownHosts) -> Self {
        self.known_hosts = Some(known_hosts);
        self
    }

    /// Starts every host of `name`, then polls for their addresses.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Batch`] when any host fails to start;
    /// polling is skipped in that case.
    pub async fn start(&self, name: &str) -> Result<Outcome<PollReport>, OrchestratorError> {
        let Some(deployment) = self.find(name)? else {
            return Ok(Outcome::NoSuchDeployment);
        };
        let vmnames = self.vmnames(&deployment)?;
        self.run_batch("start", name, labelled(&vmnames), |hypervisor, vmname: String| {
            Host::new(hypervisor, &vmname).start()?;
            Ok(())
        })
        .await?;
        Ok(Outcome::Completed(self.poll_hosts(vmnames).await))
    }

    /// Polls the hosts of `name` until each has an address or the timeout
    /// elapses. A timeout is reported in the [`PollReport`], never as an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Store`] when the hosts cannot be read.
    pub async fn poll_ips(&self, name: &str) -> Result<Outcome<PollReport>, OrchestratorError> {
        let Some(deployment) = self.find(name)? else {
            return Ok(Outcome::NoSuchDeployment);
        };
        let vmnames = self.vmnames(&deployment)?;
        Ok(Outcome::Completed(self.poll_hosts(vmnames).await))
    }

    /// Powers off every host of `name`.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Batch`] when any host fails to stop.
    pub async fn stop(&self, name: &str) -> Result<Outcome<()>, OrchestratorError> {
        let Some(deployment) = self.find(name)? else {
            return Ok(Outcome::NoSuchDeployment);
        };
        let vmnames = self.vmnames(&deployment)?;
        self.stop_hosts(name, &vmnames).await?;
        Ok(Outcome::Completed(()))
    }

    /// Power-cycles every host of `name`.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Batch`] when any host fails to power
    /// off or start again.
    pub async fn restart(&self, name: &str) -> Result<Outcome<()>, OrchestratorError> {
        let Some(deployment) = self.find(name)? else {
            return Ok(Outcome::NoSuchDeployment);
        };
        let vmnames = self.vmnames(&deployment)?;
        let timing = RestartTiming {
            power_off_timeout: self.ip_poll_timeout,
            poll_interval: self.poll_interval,
            settle_delay: self.settle_delay,
        };
        self.run_batch("restart", name, labelled(&vmnames), move |hypervisor, vmname: String| {
            Host::new(hypervisor, &vmname).restart(timing)?;
            Ok(())
        })
        .await?;
        Ok(Outcome::Completed(()))
    }

    /// Stops and deletes every host of `name`, then removes its networks and
    /// finally the deployment itself.
    ///
    /// Records of resources already removed are committed even when a later
    /// entity fails, so a repeated destroy only retries what is left.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Batch`] for the first phase with a
    /// failing entity; later phases do not run.
    pub async fn destroy(&self, name: &str) -> Result<Outcome<DestroyReport>, OrchestratorError> {
        let Some(deployment) = self.find(name)? else {
            return Ok(Outcome::NoSuchDeployment);
        };
        let hosts = self.store.hosts(deployment.id)?;
        let vmnames: Vec<String> = hosts.iter().map(|host| host.vmname.clone()).collect();
        self.stop_hosts(name, &vmnames).await?;

        let hosts_destroyed = hosts.len();
        let destroyed_hosts = self.destroy_hosts(name, hosts).await;
        self.store.commit()?;
        destroyed_hosts?;

        let networks = self.store.networks(deployment.id)?;
        let networks_destroyed = networks
            .iter()
            .filter(|network| network.assigned_name.is_some())
            .count();
        let destroyed_networks = self.destroy_networks(name, networks).await;
        self.store.commit()?;
        destroyed_networks?;

        self.store.delete_deployment(deployment.id)?;
        self.store.commit()?;
        info!(deployment = name, hosts_destroyed, networks_destroyed, "destroyed deployment");
        Ok(Outcome::Completed(DestroyReport {
            hosts_destroyed,
            networks_destroyed,
        }))
    }

    /// Every host of every deployment with its live status.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Store`] when the store cannot be read.
    pub async fn host_details(&self) -> Result<Vec<HostDetails>, OrchestratorError> {
        let names = self.deployment_names()?;
        let hosts = self.store.all_hosts()?;
        let hypervisor = Arc::clone(&self.hypervisor);
        tokio::task::spawn_blocking(move || {
            hosts
                .into_iter()
                .map(|host| describe_host(hypervisor.as_ref(), &names, host))
                .collect()
        })
        .await
        .map_err(|err| OrchestratorError::Join(err.to_string()))
    }

    /// Every network record with its deployment and whether the hypervisor
    /// still lists it.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Store`] when the store cannot be read.
    pub async fn network_details(&self) -> Result<Vec<NetworkDetails>, OrchestratorError> {
        let names = self.deployment_names()?;
        let mut networks = Vec::new();
        for id in names.keys() {
            networks.extend(self.store.networks(*id)?);
        }
        let hypervisor = Arc::clone(&self.hypervisor);
        let listed = tokio::task::spawn_blocking(move || hypervisor.network_names())
            .await
            .map_err(|err| OrchestratorError::Join(err.to_string()))?;
        let present: BTreeSet<String> = match listed {
            Ok(listed) => listed.into_iter().collect(),
            Err(err) => {
                warn!(error = %err, "cannot list hypervisor networks");
                BTreeSet::new()
            }
        };
        Ok(networks
            .into_iter()
            .map(|network| NetworkDetails {
                deployment: names
                    .get(&network.deployment_id)
                    .cloned()
                    .unwrap_or_default(),
                present: network
                    .assigned_name
                    .as_ref()
                    .is_some_and(|assigned| present.contains(assigned)),
                label: network.label,
                assigned_name: network.assigned_name,
                address: network.address,
                dhcp_lower: network.dhcp_lower,
                dhcp_upper: network.dhcp_upper,
            })
            .collect())
    }

    fn find(&self, name: &str) -> Result<Option<DeploymentRecord>, OrchestratorError> {
        let found = self.store.deployment_by_name(name)?;
        if found.is_none() {
            info!(deployment = name, "no such deployment");
        }
        Ok(found)
    }

    fn vmnames(&self, deployment: &DeploymentRecord) -> Result<Vec<String>, OrchestratorError> {
        Ok(self
            .store
            .hosts(deployment.id)?
            .into_iter()
            .map(|host| host.vmname)
            .collect())
    }

    fn deployment_names(&self) -> Result<BTreeMap<RecordId, String>, OrchestratorError> {
        Ok(self
            .store
            .deployments()?
            .into_iter()
            .map(|deployment| (deployment.id, deployment.name))
            .collect())
    }

    async fn stop_hosts(&self, name: &str, vmnames: &[String]) -> Result<(), OrchestratorError> {
        self.run_batch("stop", name, labelled(vmnames), |hypervisor, vmname: String| {
            Host::new(hypervisor, &vmname).stop()?;
            Ok(())
        })
        .await
    }

    async fn destroy_hosts(
        &self,
        name: &str,
        hosts: Vec<HostRecord>,
    ) -> Result<(), OrchestratorError> {
        let store = Arc::clone(&self.store);
        let known_hosts = self.known_hosts.clone();
        let entities = hosts
            .into_iter()
            .map(|host| (host.vmname.clone(), host))
            .collect();
        self.run_batch("destroy hosts", name, entities, move |hypervisor, host: HostRecord| {
            let last_address = Host::new(hypervisor, &host.vmname).destroy()?;
            store.delete_host(host.id)?;
            if let (Some(known), Some(address)) = (&known_hosts, last_address) {
                match known.remove(address) {
                    Ok(removed) => debug!(vmname = %host.vmname, %address, removed, "scrubbed known hosts"),
                    Err(err) => warn!(
                        vmname = %host.vmname,
                        path = %known.path(),
                        error = %err,
                        "failed to scrub known hosts"
                    ),
                }
            }
            Ok(())
        })
        .await
    }

    async fn destroy_networks(
        &self,
        name: &str,
        networks: Vec<NetworkRecord>,
    ) -> Result<(), OrchestratorError> {
        let store = Arc::clone(&self.store);
        let entities = networks
            .into_iter()
            .map(|network| (network.label.clone(), network))
            .collect();
        self.run_batch(
            "destroy networks",
            name,
            entities,
            move |hypervisor, mut network: NetworkRecord| {
                if let Some(assigned) = network.assigned_name.take() {
                    Network::existing(hypervisor, assigned).destroy()?;
                    network.address = None;
                    store.update_network(&network)?;
                }
                store.delete_network(network.id)?;
                Ok(())
            },
        )
        .await
    }

    async fn poll_hosts(&self, vmnames: Vec<String>) -> PollReport {
        let mut pending: BTreeSet<String> = vmnames.into_iter().collect();
        let mut resolved = BTreeMap::new();
        let deadline = Instant::now() + self.ip_poll_timeout;
        loop {
            for (vmname, address) in self.lookup_addresses(&pending).await {
                info!(%vmname, %address, "host address observed");
                pending.remove(&vmname);
                resolved.insert(vmname, address);
            }
            if pending.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    unresolved = ?pending,
                    timeout_secs = self.ip_poll_timeout.as_secs(),
                    "hosts still have no address"
                );
                break;
            }
            sleep(self.poll_interval).await;
        }
        PollReport {
            resolved,
            unresolved: pending.into_iter().collect(),
        }
    }

    async fn lookup_addresses(&self, pending: &BTreeSet<String>) -> Vec<(String, Ipv4Addr)> {
        let hypervisor = Arc::clone(&self.hypervisor);
        let vmnames: Vec<String> = pending.iter().cloned().collect();
        let lookup = tokio::task::spawn_blocking(move || {
            vmnames
                .into_iter()
                .filter_map(|vmname| {
                    match Host::new(hypervisor.as_ref(), &vmname).address() {
                        Ok(address) => address.map(|found| (vmname, found)),
                        Err(err) => {
                            debug!(%vmname, error = %err, "address not readable yet");
                            None
                        }
                    }
                })
                .collect()
        })
        .await;
        lookup.unwrap_or_else(|err| {
            warn!(error = %err, "address lookup task failed");
            Vec::new()
        })
    }

    async fn run_batch<T, F>(
        &self,
        operation: &'static str,
        deployment: &str,
        entities: Vec<(String, T)>,
        action: F,
    ) -> Result<(), OrchestratorError>
    where
        T: Send + 'static,
        F: Fn(&H, T) -> Result<(), EntityError> + Send + Sync + 'static,
    {
        if entities.is_empty() {
            return Ok(());
        }
        let width = self
            .max_parallelism
            .map_or(entities.len(), |cap| cap.min(entities.len()))
            .max(1);
        debug!(operation, deployment, entities = entities.len(), width, "running batch");
        let permits = Arc::new(Semaphore::new(width));
        let action = Arc::new(action);
        let mut tasks = JoinSet::new();
        for (entity, item) in entities {
            let permit = Arc::clone(&permits)
                .acquire_owned()
                .await
                .map_err(|err| OrchestratorError::Join(err.to_string()))?;
            let hypervisor = Arc::clone(&self.hypervisor);
            let work = Arc::clone(&action);
            tasks.spawn_blocking(move || {
                let result = work(hypervisor.as_ref(), item);
                drop(permit);
                (entity, result)
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((entity, Err(err))) => {
                    warn!(operation, deployment, %entity, error = %err, "entity operation failed");
                    failures.push(EntityFailure {
                        entity,
                        message: err.to_string(),
                    });
                }
                Err(err) => failures.push(EntityFailure {
                    entity: String::from("worker"),
                    message: err.to_string(),
                }),
            }
        }
        if failures.is_empty() {
            return Ok(());
        }
        failures.sort_by(|left, right| left.entity.cmp(&right.entity));
        Err(OrchestratorError::Batch {
            operation,
            deployment: deployment.to_owned(),
            failures,
        })
    }
}

fn labelled(vmnames: &[String]) -> Vec<(String, String)> {
    vmnames
        .iter()
        .map(|vmname| (vmname.clone(), vmname.clone()))
        .collect()
}

fn describe_host<H: Hypervisor + ?Sized>(
    hypervisor: &H,
    names: &BTreeMap<RecordId, String>,
    host: HostRecord,
) -> HostDetails {
    let (properties, error) = match Host::new(hypervisor, &host.vmname).properties() {
        Ok(properties) => (Some(properties), None),
        Err(err) => (None, Some(err.to_string())),
    };
    HostDetails {
        deployment: names.get(&host.deployment_id).cloned().unwrap_or_default(),
        vmname: host.vmname,
        relay_port: host.relay_port,
        properties,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::{AdapterMode, AdapterSlot};
    use crate::store::{MemoryStore, NewHost, NewNetwork};
    use crate::test_support::{FakeHypervisor, FakeOp};
    use rstest::{fixture, rstest};

    struct Lab {
        hypervisor: FakeHypervisor,
        store: Arc<MemoryStore>,
    }

    impl Lab {
        fn orchestrator(&self) -> Orchestrator<FakeHypervisor, MemoryStore> {
            Orchestrator::new(Arc::new(self.hypervisor.clone()), Arc::clone(&self.store))
                .with_ip_poll_timeout(Duration::from_millis(50))
                .with_poll_interval(Duration::from_millis(10))
                .with_settle_delay(Duration::ZERO)
        }
    }

    #[fixture]
    fn lab() -> Lab {
        let hypervisor = FakeHypervisor::new();
        let store = Arc::new(MemoryStore::new());
        let deployment = store.create_deployment("lab").expect("deployment");
        let network = hypervisor.create_network().expect("network");
        hypervisor
            .add_lease_service(
                &network,
                &crate::hypervisor::LeaseRange {
                    address: Ipv4Addr::new(192, 168, 56, 1),
                    netmask: Ipv4Addr::new(255, 255, 255, 0),
                    lower: Ipv4Addr::new(192, 168, 56, 100),
                    upper: Ipv4Addr::new(192, 168, 56, 200),
                },
            )
            .expect("lease service");
        store
            .insert_network(NewNetwork {
                label: String::from("lan"),
                assigned_name: network.clone(),
                address: Ipv4Addr::new(192, 168, 56, 1),
                dhcp_lower: Ipv4Addr::new(192, 168, 56, 100),
                dhcp_upper: Ipv4Addr::new(192, 168, 56, 200),
                deployment_id: deployment.id,
            })
            .expect("network record");
        for vmname in ["web-1", "web-2"] {
            hypervisor.register_machine(vmname);
            hypervisor
                .configure_adapter(
                    vmname,
                    AdapterSlot::new(1).expect("slot"),
                    &AdapterMode::HostOnly {
                        network: network.clone(),
                    },
                )
                .expect("adapter");
            store
                .insert_host(NewHost {
                    vmname: vmname.to_owned(),
                    image: String::from("base"),
                    username: String::from("user"),
                    password: String::from("secret"),
                    deployment_id: deployment.id,
                })
                .expect("host record");
        }
        Lab { hypervisor, store }
    }

    #[rstest]
    #[tokio::test]
    async fn unknown_deployment_is_not_an_error(lab: Lab) {
        let orchestrator = lab.orchestrator();
        let before = lab.hypervisor.calls().len();
        assert_eq!(
            orchestrator.start("missing").await.expect("start"),
            Outcome::NoSuchDeployment
        );
        assert_eq!(
            orchestrator.destroy("missing").await.expect("destroy"),
            Outcome::NoSuchDeployment
        );
        assert_eq!(lab.hypervisor.calls().len(), before);
    }

    #[rstest]
    #[tokio::test]
    async fn stop_collects_every_failure(lab: Lab) {
        lab.hypervisor.fail(FakeOp::PowerOff, "");
        let err = lab
            .orchestrator()
            .stop("lab")
            .await
            .expect_err("power-off fails");
        let OrchestratorError::Batch {
            operation,
            failures,
            ..
        } = err
        else {
            panic!("expected Batch, got {err:?}");
        };
        assert_eq!(operation, "stop");
        let entities: Vec<&str> = failures.iter().map(|failure| failure.entity.as_str()).collect();
        assert_eq!(entities, ["web-1", "web-2"]);
    }

    #[rstest]
    #[tokio::test]
    async fn restart_power_cycles_every_host(lab: Lab) {
        lab.hypervisor.start_machine("web-1").expect("boot");
        let outcome = lab.orchestrator().restart("lab").await.expect("restart");
        assert_eq!(outcome, Outcome::Completed(()));
        for vmname in ["web-1", "web-2"] {
            let machine = lab.hypervisor.machine(vmname).expect("machine");
            assert_eq!(machine.state, crate::hypervisor::PowerState::Running);
        }
    }

    #[rstest]
    #[tokio::test]
    async fn details_join_deployment_and_live_state(lab: Lab) {
        lab.hypervisor
            .grant_lease("web-1", 1, Ipv4Addr::new(192, 168, 56, 101));
        let orchestrator = lab.orchestrator();

        let hosts = orchestrator.host_details().await.expect("host details");
        assert_eq!(hosts.len(), 2);
        let web = hosts
            .iter()
            .find(|host| host.vmname == "web-1")
            .expect("web-1 listed");
        assert_eq!(web.deployment, "lab");
        assert_eq!(
            web.properties.as_ref().and_then(HostProperties::address),
            Some(Ipv4Addr::new(192, 168, 56, 101))
        );

        let networks = orchestrator.network_details().await.expect("network details");
        assert_eq!(networks.len(), 1);
        let lan = networks.first().expect("lan listed");
        assert_eq!(lan.deployment, "lab");
        assert!(lan.present);
    }

    #[rstest]
    #[tokio::test]
    async fn parallelism_cap_still_runs_every_host(lab: Lab) {
        let orchestrator = lab.orchestrator().with_max_parallelism(Some(1));
        orchestrator.stop("lab").await.expect("stop");
        let power_offs = lab
            .hypervisor
            .calls()
            .into_iter()
            .filter(|call| call.starts_with("poweroff"))
            .count();
        assert_eq!(power_offs, 2);
    }
}
