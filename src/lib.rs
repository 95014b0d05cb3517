//! Core library for the virtlab deployment tool.
//!
//! A deployment is a named group of VirtualBox machines wired onto private
//! host-only networks. The [`Builder`] turns a declarative [`Topology`] into
//! machines and networks, rolling back everything it created when a step
//! fails. The [`Orchestrator`] drives the lifecycle of built deployments and
//! the [`TunnelSupervisor`] exposes each guest's SSH port through a relay
//! process listening on the host.

pub mod builder;
pub mod command;
pub mod config;
pub mod host;
pub mod hypervisor;
pub mod known_hosts;
pub mod network;
pub mod orchestrator;
pub mod paths;
pub mod store;
pub mod test_support;
pub mod tunnel;

pub use builder::{BuildError, BuildSummary, Builder, Topology, TopologyError, ValidationError};
pub use command::{CommandError, CommandOutput, CommandRunner, ProcessCommandRunner};
pub use config::{ConfigError, VirtlabConfig};
pub use hypervisor::{Hypervisor, HypervisorError, VirtualBox};
pub use known_hosts::KnownHosts;
pub use orchestrator::{Orchestrator, OrchestratorError, Outcome, PollReport};
pub use store::{JsonFileStore, MemoryStore, Store, StoreError};
pub use tunnel::{
    ProcessRelayLauncher, RelayError, RelayLauncher, RelayServer, RestartPolicy, TunnelError,
    TunnelInfo, TunnelSupervisor,
};
