//! Builds a deployment from a [`Topology`], all or nothing.
//!
//! Networks are created first, then hosts are imported and wired to them.
//! Records are written only once every hypervisor resource exists. When any
//! step fails, everything created by the attempt is torn down again (hosts
//! before networks), the deployment's records are deleted and the failure is
//! returned together with a [`CleanupReport`].

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::host::{Host, HostSpec, InternetAccess};
use crate::hypervisor::{AdapterSlot, Hypervisor, HypervisorError, MAX_ADAPTERS};
use crate::network::{Network, NetworkNameLock, NetworkSpec};
use crate::store::{DeploymentRecord, NewHost, NewNetwork, Store, StoreError};

pub mod topology;

pub use topology::{
    DeploymentDecl, HostDecl, InternetDecl, InternetMode, NetworkDecl, Topology, TopologyError,
    TopologyFormat,
};

/// Adapter slot used for internet access when the topology names none.
pub const DEFAULT_INTERNET_ADAPTER: u8 = 1;

/// Problems with a topology detected before the hypervisor is touched.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ValidationError {
    /// Raised when a required field is absent or blank.
    #[error("{entity} is missing required field `{field}`")]
    MissingField {
        /// Entity being validated.
        entity: String,
        /// Missing field.
        field: &'static str,
    },
    /// Raised when a field does not hold an IPv4 address.
    #[error("{entity} field `{field}` is not an IPv4 address: {value}")]
    InvalidAddress {
        /// Entity being validated.
        entity: String,
        /// Offending field.
        field: &'static str,
        /// Value supplied.
        value: String,
    },
    /// Raised when the lease range is inverted.
    #[error("network {label} has dhcp_lower {lower} above dhcp_upper {upper}")]
    InvalidRange {
        /// Network label.
        label: String,
        /// Lower bound supplied.
        lower: Ipv4Addr,
        /// Upper bound supplied.
        upper: Ipv4Addr,
    },
    /// Raised when the deployment name is taken.
    #[error("deployment {name} already exists")]
    DuplicateDeployment {
        /// Deployment name.
        name: String,
    },
    /// Raised when two networks share a label.
    #[error("network label {label} is declared twice")]
    DuplicateLabel {
        /// Repeated label.
        label: String,
    },
    /// Raised when a network address is repeated or already in use.
    #[error("network address {address} is already in use")]
    DuplicateAddress {
        /// Repeated address.
        address: Ipv4Addr,
    },
    /// Raised when a machine name is repeated or already in use.
    #[error("host {vmname} already exists")]
    DuplicateVmname {
        /// Repeated name.
        vmname: String,
    },
    /// Raised when a host references an undeclared network.
    #[error("host {vmname} references unknown network {label}")]
    UnknownNetwork {
        /// Host declaring the reference.
        vmname: String,
        /// Unknown label.
        label: String,
    },
    /// Raised when a host needs more adapters than the hypervisor offers.
    #[error("host {vmname} needs {requested} adapters but at most {max} are available", max = MAX_ADAPTERS)]
    TooManyAdapters {
        /// Host being validated.
        vmname: String,
        /// Adapters required.
        requested: usize,
    },
    /// Raised when the internet adapter index lies outside `1..=8`.
    #[error("host {vmname} declares internet adapter {adapter} outside 1..={max}", max = MAX_ADAPTERS)]
    InvalidAdapter {
        /// Host being validated.
        vmname: String,
        /// Index supplied.
        adapter: u8,
    },
    /// Raised when bridged access has no interface to bridge.
    #[error("host {vmname} requests bridged internet access without a bridge interface")]
    MissingBridgeInterface {
        /// Host being validated.
        vmname: String,
    },
}

/// A resource that could not be removed during rollback.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CleanupFailure {
    /// Resource description, for example `host web-1`.
    pub resource: String,
    /// Failure description.
    pub message: String,
}

/// What rollback removed and what it could not.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CleanupReport {
    /// Machines deleted.
    pub hosts_destroyed: usize,
    /// Networks removed.
    pub networks_destroyed: usize,
    /// Store rows deleted, including the deployment.
    pub records_deleted: usize,
    /// Resources left behind.
    pub failures: Vec<CleanupFailure>,
}

impl CleanupReport {
    /// Returns `true` when rollback removed everything.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn record<E: std::fmt::Display>(&mut self, resource: String, err: &E) {
        warn!(%resource, error = %err, "rollback step failed");
        self.failures.push(CleanupFailure {
            resource,
            message: err.to_string(),
        });
    }
}

/// Errors raised by [`Builder::build`].
#[derive(Debug, Error)]
pub enum BuildError {
    /// Raised when the topology is invalid.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Raised when a hypervisor command fails.
    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),
    /// Raised when the store fails.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Raised after a failed build has been rolled back.
    #[error("build of deployment {deployment} rolled back: {source}")]
    RolledBack {
        /// Deployment name.
        deployment: String,
        /// Failure that triggered the rollback.
        source: Box<BuildError>,
        /// Outcome of the rollback.
        cleanup: CleanupReport,
    },
}

impl BuildError {
    /// Failure behind a rollback, or the error itself.
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        match self {
            Self::RolledBack { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// A network created by a build.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BuiltNetwork {
    /// Declared label.
    pub label: String,
    /// Hypervisor-issued name.
    pub assigned_name: String,
}

/// What a successful build created.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BuildSummary {
    /// Deployment name.
    pub deployment: String,
    /// Networks in declaration order.
    pub networks: Vec<BuiltNetwork>,
    /// Machine names in declaration order.
    pub hosts: Vec<String>,
}

#[derive(Debug)]
struct HostPlan {
    spec: HostSpec,
    username: String,
    password: String,
    networks: Vec<(AdapterSlot, String)>,
    internet: Option<(AdapterSlot, InternetAccess)>,
}

#[derive(Debug, Default)]
struct Progress {
    hosts: Vec<String>,
    networks: Vec<String>,
}

/// Creates deployments against a hypervisor and records them in a store.
#[derive(Debug)]
pub struct Builder<H, S> {
    hypervisor: Arc<H>,
    store: Arc<S>,
    names: NetworkNameLock,
    default_bridge: Option<String>,
}

impl<H: Hypervisor, S: Store> Builder<H, S> {
    /// Creates a builder with its own network name lock.
    #[must_use]
    pub fn new(hypervisor: Arc<H>, store: Arc<S>) -> Self {
        Self {
            hypervisor,
            store,
            names: NetworkNameLock::new(),
            default_bridge: None,
        }
    }

    /// Shares `names` with other components creating networks.
    #[must_use]
    pub fn with_name_lock(mut self, names: NetworkNameLock) -> Self {
        self.names = names;
        self
    }

    /// Interface used by bridged hosts that do not name one.
    #[must_use]
    pub fn with_default_bridge(mut self, interface: Option<String>) -> Self {
        self.default_bridge = interface;
        self
    }

    /// Builds `topology`, leaving no state behind on failure.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Validation`] or [`BuildError::Store`] when the
    /// deployment cannot be created at all, and [`BuildError::RolledBack`]
    /// for any later failure.
    pub fn build(&self, topology: &Topology) -> Result<BuildSummary, BuildError> {
        let name = required(topology.deployment.name.as_deref(), "deployment", "name")?;
        if self.store.deployment_by_name(&name)?.is_some() {
            return Err(ValidationError::DuplicateDeployment { name }.into());
        }
        let deployment = self.store.create_deployment(&name)?;
        self.store.commit()?;
        info!(deployment = %name, "building deployment");

        let mut progress = Progress::default();
        match self.populate(&deployment, topology, &mut progress) {
            Ok(summary) => {
                info!(
                    deployment = %name,
                    networks = summary.networks.len(),
                    hosts = summary.hosts.len(),
                    "deployment built"
                );
                Ok(summary)
            }
            Err(err) => {
                warn!(deployment = %name, error = %err, "build failed; rolling back");
                let cleanup = self.rollback(&deployment, &progress);
                Err(BuildError::RolledBack {
                    deployment: name,
                    source: Box::new(err),
                    cleanup,
                })
            }
        }
    }

    fn populate(
        &self,
        deployment: &DeploymentRecord,
        topology: &Topology,
        progress: &mut Progress,
    ) -> Result<BuildSummary, BuildError> {
        let hypervisor = self.hypervisor.as_ref();

        let mut networks: Vec<(NetworkSpec, String)> = Vec::with_capacity(topology.networks.len());
        let mut by_label: BTreeMap<String, String> = BTreeMap::new();
        let mut addresses = BTreeSet::new();
        for decl in &topology.networks {
            let spec = validate_network(decl)?;
            if by_label.contains_key(&spec.label) {
                return Err(ValidationError::DuplicateLabel { label: spec.label }.into());
            }
            if !addresses.insert(spec.address)
                || self.store.network_by_address(spec.address)?.is_some()
            {
                return Err(ValidationError::DuplicateAddress {
                    address: spec.address,
                }
                .into());
            }
            let assigned = Network::create(hypervisor, &self.names, &spec)?.into_name();
            progress.networks.push(assigned.clone());
            by_label.insert(spec.label.clone(), assigned.clone());
            networks.push((spec, assigned));
        }

        let mut hosts = Vec::with_capacity(topology.hosts.len());
        let mut vmnames = BTreeSet::new();
        for decl in &topology.hosts {
            let plan = self.plan_host(decl, &by_label)?;
            if !vmnames.insert(plan.spec.vmname.clone())
                || self.store.host_by_vmname(&plan.spec.vmname)?.is_some()
            {
                return Err(ValidationError::DuplicateVmname {
                    vmname: plan.spec.vmname,
                }
                .into());
            }
            let host = Host::create(hypervisor, &plan.spec)?;
            progress.hosts.push(plan.spec.vmname.clone());
            for (slot, network) in &plan.networks {
                host.assign_network(*slot, network)?;
            }
            if let Some((slot, access)) = &plan.internet {
                host.assign_internet(*slot, access)?;
            }
            hosts.push(plan);
        }

        for (spec, assigned) in &networks {
            self.store.insert_network(NewNetwork {
                label: spec.label.clone(),
                assigned_name: assigned.clone(),
                address: spec.address,
                dhcp_lower: spec.dhcp_lower,
                dhcp_upper: spec.dhcp_upper,
                deployment_id: deployment.id,
            })?;
        }
        for plan in &hosts {
            self.store.insert_host(NewHost {
                vmname: plan.spec.vmname.clone(),
                image: plan.spec.image.clone(),
                username: plan.username.clone(),
                password: plan.password.clone(),
                deployment_id: deployment.id,
            })?;
        }
        self.store.commit()?;

        Ok(BuildSummary {
            deployment: deployment.name.clone(),
            networks: networks
                .into_iter()
                .map(|(spec, assigned_name)| BuiltNetwork {
                    label: spec.label,
                    assigned_name,
                })
                .collect(),
            hosts: hosts.into_iter().map(|plan| plan.spec.vmname).collect(),
        })
    }

    fn plan_host(
        &self,
        decl: &HostDecl,
        by_label: &BTreeMap<String, String>,
    ) -> Result<HostPlan, ValidationError> {
        let vmname = required(decl.vmname.as_deref(), "host", "vmname")?;
        let entity = format!("host {vmname}");
        let image = required(decl.image.as_deref(), &entity, "image")?;
        let username = required(decl.username.as_deref(), &entity, "username")?;
        let password = required(decl.password.as_deref(), &entity, "password")?;

        let internet_slot = match &decl.internet {
            None => None,
            Some(internet) => {
                let adapter = internet.adapter.unwrap_or(DEFAULT_INTERNET_ADAPTER);
                let Some(slot) = AdapterSlot::new(adapter) else {
                    return Err(ValidationError::InvalidAdapter { vmname, adapter });
                };
                Some(slot)
            }
        };

        let requested = decl.networks.len() + usize::from(internet_slot.is_some());
        let slots: Vec<AdapterSlot> = (1..=MAX_ADAPTERS)
            .filter_map(AdapterSlot::new)
            .filter(|slot| Some(*slot) != internet_slot)
            .take(decl.networks.len())
            .collect();
        if slots.len() < decl.networks.len() {
            return Err(ValidationError::TooManyAdapters { vmname, requested });
        }
        let mut free = slots.into_iter();

        let mut networks = Vec::with_capacity(decl.networks.len());
        for label in &decl.networks {
            let Some(assigned) = by_label.get(label) else {
                return Err(ValidationError::UnknownNetwork {
                    vmname,
                    label: label.clone(),
                });
            };
            if let Some(slot) = free.next() {
                networks.push((slot, assigned.clone()));
            }
        }

        let internet = match &decl.internet {
            None => None,
            Some(internet) => {
                let access = match internet.mode {
                    InternetMode::Nat => InternetAccess::Nat,
                    InternetMode::Bridged => {
                        let interface = internet
                            .bridge_interface
                            .as_deref()
                            .or(self.default_bridge.as_deref())
                            .map(str::trim)
                            .filter(|name| !name.is_empty());
                        let Some(interface) = interface else {
                            return Err(ValidationError::MissingBridgeInterface { vmname });
                        };
                        InternetAccess::Bridged {
                            interface: interface.to_owned(),
                        }
                    }
                };
                internet_slot.map(|slot| (slot, access))
            }
        };

        Ok(HostPlan {
            spec: HostSpec { vmname, image },
            username,
            password,
            networks,
            internet,
        })
    }

    fn rollback(&self, deployment: &DeploymentRecord, progress: &Progress) -> CleanupReport {
        let hypervisor = self.hypervisor.as_ref();
        let mut report = CleanupReport::default();

        for vmname in progress.hosts.iter().rev() {
            match Host::new(hypervisor, vmname).destroy() {
                Ok(_) => report.hosts_destroyed += 1,
                Err(err) => report.record(format!("host {vmname}"), &err),
            }
        }
        for name in progress.networks.iter().rev() {
            match Network::existing(hypervisor, name.clone()).destroy() {
                Ok(()) => report.networks_destroyed += 1,
                Err(err) => report.record(format!("network {name}"), &err),
            }
        }

        self.delete_records(deployment, &mut report);
        match self.store.delete_deployment(deployment.id) {
            Ok(()) => report.records_deleted += 1,
            Err(err) => report.record(format!("deployment {}", deployment.name), &err),
        }
        if let Err(err) = self.store.commit() {
            report.record(String::from("store commit"), &err);
        }
        info!(
            deployment = %deployment.name,
            hosts = report.hosts_destroyed,
            networks = report.networks_destroyed,
            records = report.records_deleted,
            clean = report.is_clean(),
            "rollback finished"
        );
        report
    }

    fn delete_records(&self, deployment: &DeploymentRecord, report: &mut CleanupReport) {
        match self.store.hosts(deployment.id) {
            Ok(hosts) => {
                for host in hosts {
                    match self.store.delete_host(host.id) {
                        Ok(()) => report.records_deleted += 1,
                        Err(err) => report.record(format!("host record {}", host.vmname), &err),
                    }
                }
            }
            Err(err) => report.record(String::from("host records"), &err),
        }
        match self.store.networks(deployment.id) {
            Ok(networks) => {
                for network in networks {
                    match self.store.delete_network(network.id) {
                        Ok(()) => report.records_deleted += 1,
                        Err(err) => report.record(format!("network record {}", network.label), &err),
                    }
                }
            }
            Err(err) => report.record(String::from("network records"), &err),
        }
    }
}

fn required(
    value: Option<&str>,
    entity: &str,
    field: &'static str,
) -> Result<String, ValidationError> {
    value
        .map(str::trim)
        .filter(|trimmed| !trimmed.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| ValidationError::MissingField {
            entity: entity.to_owned(),
            field,
        })
}

fn address(
    value: Option<&str>,
    entity: &str,
    field: &'static str,
) -> Result<Ipv4Addr, ValidationError> {
    let raw = required(value, entity, field)?;
    raw.parse().map_err(|_| ValidationError::InvalidAddress {
        entity: entity.to_owned(),
        field,
        value: raw,
    })
}

fn validate_network(decl: &NetworkDecl) -> Result<NetworkSpec, ValidationError> {
    let label = required(decl.label.as_deref(), "network", "label")?;
    let entity = format!("network {label}");
    let network_address = address(decl.address.as_deref(), &entity, "address")?;
    let dhcp_lower = address(decl.dhcp_lower.as_deref(), &entity, "dhcp_lower")?;
    let dhcp_upper = address(decl.dhcp_upper.as_deref(), &entity, "dhcp_upper")?;
    if dhcp_lower > dhcp_upper {
        return Err(ValidationError::InvalidRange {
            label,
            lower: dhcp_lower,
            upper: dhcp_upper,
        });
    }
    Ok(NetworkSpec {
        label,
        address: network_address,
        dhcp_lower,
        dhcp_upper,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::test_support::{FakeHypervisor, FakeOp};
    use rstest::{fixture, rstest};

    fn network(label: &str, octet: u8) -> NetworkDecl {
        NetworkDecl {
            label: Some(label.to_owned()),
            address: Some(format!("192.168.{octet}.1")),
            dhcp_lower: Some(format!("192.168.{octet}.100")),
            dhcp_upper: Some(format!("192.168.{octet}.200")),
        }
    }

    fn host(vmname: &str, networks: &[&str]) -> HostDecl {
        HostDecl {
            vmname: Some(vmname.to_owned()),
            image: Some(format!("{vmname}-image")),
            username: Some(String::from("user")),
            password: Some(String::from("secret")),
            networks: networks.iter().map(|label| (*label).to_owned()).collect(),
            internet: None,
        }
    }

    fn topology(networks: Vec<NetworkDecl>, hosts: Vec<HostDecl>) -> Topology {
        Topology {
            deployment: DeploymentDecl {
                name: Some(String::from("lab")),
            },
            networks,
            hosts,
        }
    }

    struct Harness {
        hypervisor: FakeHypervisor,
        store: Arc<MemoryStore>,
        builder: Builder<FakeHypervisor, MemoryStore>,
    }

    #[fixture]
    fn harness() -> Harness {
        let hypervisor = FakeHypervisor::new();
        let store = Arc::new(MemoryStore::new());
        let builder = Builder::new(Arc::new(hypervisor.clone()), Arc::clone(&store));
        Harness {
            hypervisor,
            store,
            builder,
        }
    }

    fn root_validation(err: &BuildError) -> Option<&ValidationError> {
        match err.root_cause() {
            BuildError::Validation(validation) => Some(validation),
            _ => None,
        }
    }

    #[rstest]
    #[case::default_slot(None, 1, [2, 3])]
    #[case::declared_between_networks(Some(2), 2, [1, 3])]
    #[case::declared_after_networks(Some(5), 5, [1, 2])]
    fn networks_are_numbered_around_the_internet_adapter(
        harness: Harness,
        #[case] adapter: Option<u8>,
        #[case] internet_slot: u8,
        #[case] network_slots: [u8; 2],
    ) {
        use crate::hypervisor::AdapterMode;

        let mut web = host("web-1", &["lan", "dmz"]);
        web.internet = Some(InternetDecl {
            mode: InternetMode::Nat,
            bridge_interface: None,
            adapter,
        });
        harness
            .builder
            .build(&topology(
                vec![network("lan", 56), network("dmz", 57)],
                vec![web],
            ))
            .expect("build succeeds");

        let machine = harness.hypervisor.machine("web-1").expect("machine");
        assert_eq!(machine.adapters.len(), 3);
        assert_eq!(machine.adapters.get(&internet_slot), Some(&AdapterMode::Nat));
        let [lan_slot, dmz_slot] = network_slots;
        assert_eq!(
            machine.adapters.get(&lan_slot),
            Some(&AdapterMode::HostOnly {
                network: String::from("vboxnet0")
            })
        );
        assert_eq!(
            machine.adapters.get(&dmz_slot),
            Some(&AdapterMode::HostOnly {
                network: String::from("vboxnet1")
            })
        );
    }

    #[rstest]
    #[case::zero(0)]
    #[case::past_the_last_slot(9)]
    fn internet_adapter_outside_the_slot_range_is_rejected(harness: Harness, #[case] adapter: u8) {
        let mut web = host("web-1", &["lan"]);
        web.internet = Some(InternetDecl {
            mode: InternetMode::Nat,
            bridge_interface: None,
            adapter: Some(adapter),
        });
        let err = harness
            .builder
            .build(&topology(vec![network("lan", 56)], vec![web]))
            .expect_err("adapter index refused");
        assert_eq!(
            root_validation(&err),
            Some(&ValidationError::InvalidAdapter {
                vmname: String::from("web-1"),
                adapter,
            })
        );
        assert!(harness.hypervisor.machine("web-1").is_none());
    }

    #[rstest]
    fn internet_adapter_counts_towards_the_slot_limit(harness: Harness) {
        let mut web = host("web-1", &["lan"; 8]);
        web.internet = Some(InternetDecl {
            mode: InternetMode::Nat,
            bridge_interface: None,
            adapter: Some(8),
        });
        let err = harness
            .builder
            .build(&topology(vec![network("lan", 56)], vec![web]))
            .expect_err("nine adapters requested");
        assert_eq!(
            root_validation(&err),
            Some(&ValidationError::TooManyAdapters {
                vmname: String::from("web-1"),
                requested: 9,
            })
        );
    }

    #[rstest]
    fn bridged_mode_falls_back_to_default_interface(harness: Harness) {
        let builder = harness.builder.with_default_bridge(Some(String::from("eth0")));
        let mut web = host("web-1", &[]);
        web.internet = Some(InternetDecl {
            mode: InternetMode::Bridged,
            bridge_interface: None,
            adapter: None,
        });
        builder
            .build(&topology(Vec::new(), vec![web]))
            .expect("build succeeds");
        assert!(
            harness
                .hypervisor
                .calls()
                .contains(&String::from("adapter web-1 1 bridged:eth0"))
        );
    }

    #[rstest]
    fn missing_field_rolls_back_networks(harness: Harness) {
        let mut web = host("web-1", &["lan"]);
        web.password = None;
        let err = harness
            .builder
            .build(&topology(vec![network("lan", 56)], vec![web]))
            .expect_err("password missing");

        assert_eq!(
            root_validation(&err),
            Some(&ValidationError::MissingField {
                entity: String::from("host web-1"),
                field: "password",
            })
        );
        let BuildError::RolledBack { cleanup, .. } = &err else {
            panic!("expected rollback, got {err:?}");
        };
        assert_eq!(cleanup.networks_destroyed, 1);
        assert!(cleanup.is_clean());
        assert!(harness.hypervisor.network_names_snapshot().is_empty());
        assert!(harness.store.deployments().expect("deployments").is_empty());
    }

    #[rstest]
    #[case::unknown_network(
        vec![host("web-1", &["dmz"])],
        ValidationError::UnknownNetwork { vmname: String::from("web-1"), label: String::from("dmz") }
    )]
    #[case::too_many_adapters(
        vec![host("web-1", &["lan"; 9])],
        ValidationError::TooManyAdapters { vmname: String::from("web-1"), requested: 9 }
    )]
    fn host_validation_precedes_import(
        harness: Harness,
        #[case] hosts: Vec<HostDecl>,
        #[case] expected: ValidationError,
    ) {
        let err = harness
            .builder
            .build(&topology(vec![network("lan", 56)], hosts))
            .expect_err("validation fails");
        assert_eq!(root_validation(&err), Some(&expected));
        assert!(
            !harness
                .hypervisor
                .calls()
                .iter()
                .any(|call| call.starts_with("import"))
        );
    }

    #[rstest]
    fn bridged_without_interface_is_rejected(harness: Harness) {
        let mut web = host("web-1", &[]);
        web.internet = Some(InternetDecl {
            mode: InternetMode::Bridged,
            bridge_interface: None,
            adapter: None,
        });
        let err = harness
            .builder
            .build(&topology(Vec::new(), vec![web]))
            .expect_err("no bridge interface");
        assert_eq!(
            root_validation(&err),
            Some(&ValidationError::MissingBridgeInterface {
                vmname: String::from("web-1"),
            })
        );
    }

    #[rstest]
    fn duplicate_address_in_topology_is_rejected(harness: Harness) {
        let err = harness
            .builder
            .build(&topology(
                vec![network("lan", 56), network("dmz", 56)],
                Vec::new(),
            ))
            .expect_err("address repeated");
        assert!(matches!(
            root_validation(&err),
            Some(ValidationError::DuplicateAddress { .. })
        ));
        assert!(harness.hypervisor.network_names_snapshot().is_empty());
    }

    #[rstest]
    fn existing_deployment_name_is_rejected_without_rollback(harness: Harness) {
        harness.store.create_deployment("lab").expect("seed");
        let err = harness
            .builder
            .build(&topology(Vec::new(), Vec::new()))
            .expect_err("name taken");
        assert!(matches!(
            err,
            BuildError::Validation(ValidationError::DuplicateDeployment { .. })
        ));
        assert_eq!(harness.store.deployments().expect("deployments").len(), 1);
    }

    #[rstest]
    fn adapter_failure_destroys_the_imported_host(harness: Harness) {
        harness.hypervisor.fail(FakeOp::ConfigureAdapter, "web-1");
        let err = harness
            .builder
            .build(&topology(vec![network("lan", 56)], vec![host("web-1", &["lan"])]))
            .expect_err("adapter fails");
        let BuildError::RolledBack { cleanup, .. } = &err else {
            panic!("expected rollback, got {err:?}");
        };
        assert_eq!(cleanup.hosts_destroyed, 1);
        assert_eq!(cleanup.networks_destroyed, 1);
        assert!(harness.hypervisor.machine_names_snapshot().is_empty());
    }

    #[rstest]
    fn preexisting_machine_survives_rollback(harness: Harness) {
        harness.hypervisor.register_machine("web-1");
        let err = harness
            .builder
            .build(&topology(Vec::new(), vec![host("web-1", &[])]))
            .expect_err("machine exists");
        assert!(matches!(
            err.root_cause(),
            BuildError::Hypervisor(HypervisorError::AlreadyExists { .. })
        ));
        assert_eq!(harness.hypervisor.machine_names_snapshot(), ["web-1"]);
    }
}
