//! Narrow control interface over the local hypervisor.
//!
//! The [`Hypervisor`] trait covers exactly the imperative commands the
//! entities need: import, adapter wiring, power control and deletion for
//! machines, and creation, addressing, lease service and removal for
//! host-only networks. [`VirtualBox`] implements it by shelling out to
//! `VBoxManage` through a [`CommandRunner`](crate::command::CommandRunner).

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

use serde::Serialize;
use thiserror::Error;

use crate::command::CommandError;

mod parse;
mod vbox;

pub use parse::normalise_mac;
pub use vbox::{DEFAULT_VBOXMANAGE_BIN, VirtualBox, default_vbox_config_dir};

/// Largest adapter index a machine supports.
pub const MAX_ADAPTERS: u8 = 8;

/// One of the eight network adapter slots of a machine (1-based).
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct AdapterSlot(u8);

impl AdapterSlot {
    /// Returns the slot for `index` when it lies within `1..=8`.
    #[must_use]
    pub const fn new(index: u8) -> Option<Self> {
        if index >= 1 && index <= MAX_ADAPTERS {
            Some(Self(index))
        } else {
            None
        }
    }

    /// The 1-based adapter index.
    #[must_use]
    pub const fn index(self) -> u8 {
        self.0
    }
}

impl fmt::Display for AdapterSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How an adapter is attached.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AdapterMode {
    /// Attached to an isolated host-only network.
    HostOnly {
        /// Hypervisor-issued network name (for example `vboxnet0`).
        network: String,
    },
    /// Internet access through the hypervisor's NAT engine.
    Nat,
    /// Internet access bridged onto a physical interface of the machine.
    Bridged {
        /// Physical interface to bridge (for example `eth0`).
        interface: String,
    },
}

/// Power state reported by the hypervisor.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    /// The machine is running.
    Running,
    /// The machine is powered off.
    PoweredOff,
    /// The machine state is saved to disk.
    Saved,
    /// The machine is paused.
    Paused,
    /// The machine terminated abnormally.
    Aborted,
    /// Any state not modelled above, verbatim.
    Other(String),
}

impl PowerState {
    /// Maps the raw `VMState` value to a [`PowerState`].
    #[must_use]
    pub fn from_raw(raw: &str) -> Self {
        match raw {
            "running" => Self::Running,
            "poweroff" => Self::PoweredOff,
            "saved" => Self::Saved,
            "paused" => Self::Paused,
            "aborted" => Self::Aborted,
            other => Self::Other(other.to_owned()),
        }
    }

    /// Whether the machine no longer consumes CPU.
    #[must_use]
    pub const fn is_off(&self) -> bool {
        matches!(self, Self::PoweredOff | Self::Aborted | Self::Saved)
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Running => "running",
            Self::PoweredOff => "poweroff",
            Self::Saved => "saved",
            Self::Paused => "paused",
            Self::Aborted => "aborted",
            Self::Other(raw) => raw.as_str(),
        };
        f.write_str(text)
    }
}

/// Adapter details parsed from the machine status.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NicInfo {
    /// Network the adapter is attached to (host-only name, NAT network or
    /// bridged interface).
    pub network: String,
    /// Hardware address in lower-case colon form.
    pub mac: Option<String>,
}

/// Machine status parsed from the hypervisor's machine-readable output.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MachineInfo {
    /// Current power state.
    pub state: PowerState,
    /// Guest operating system type.
    pub os_type: Option<String>,
    /// Virtual CPU count.
    pub cpus: Option<u32>,
    /// Memory in MiB.
    pub memory_mb: Option<u64>,
    /// Attached adapters keyed by slot index.
    pub nics: BTreeMap<u8, NicInfo>,
}

/// Address range served by a network's lease service.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LeaseRange {
    /// Address of the host side of the network.
    pub address: Ipv4Addr,
    /// Netmask applied to the network.
    pub netmask: Ipv4Addr,
    /// Lowest assignable address.
    pub lower: Ipv4Addr,
    /// Highest assignable address.
    pub upper: Ipv4Addr,
}

/// Errors raised by hypervisor commands.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum HypervisorError {
    /// Raised when the control binary returns a non-zero exit status.
    #[error("{program} {action} exited with status {status_text}: {stderr}")]
    CommandFailure {
        /// Program that failed (typically `VBoxManage`).
        program: String,
        /// Operation being attempted, for example `startvm web-1`.
        action: String,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the command.
        stderr: String,
    },
    /// Raised when command output cannot be interpreted.
    #[error("failed to parse {what}: {message}")]
    Parse {
        /// Output being parsed.
        what: String,
        /// Parser error message.
        message: String,
    },
    /// Raised when a resource the command expected is missing afterwards.
    #[error("{kind} {name} not present after {action}")]
    Missing {
        /// Resource kind (`machine` or `network`).
        kind: &'static str,
        /// Resource name.
        name: String,
        /// Operation that should have produced it.
        action: String,
    },
    /// Raised when a resource name is already registered.
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Resource kind (`machine`, `template` or `network`).
        kind: &'static str,
        /// Resource name.
        name: String,
    },
    /// Raised when no further host-only network names are available.
    #[error("no free network name below {limit}")]
    NamesExhausted {
        /// Maximum number of host-only networks.
        limit: u32,
    },
    /// Raised when hypervisor-owned files cannot be accessed.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when command execution fails.
    #[error(transparent)]
    Runner(#[from] CommandError),
}

/// Imperative control surface over the hypervisor.
///
/// Implementations must be shareable across the orchestrator's worker
/// threads.
pub trait Hypervisor: Send + Sync {
    /// Names of every machine the hypervisor knows about.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError`] when the listing command fails.
    fn machine_names(&self) -> Result<Vec<String>, HypervisorError>;

    /// Imports `image` as a new machine called `vmname`.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError`] when the import fails.
    fn import_machine(&self, image: &str, vmname: &str) -> Result<(), HypervisorError>;

    /// Attaches adapter `slot` of `vmname` according to `mode`.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError`] when the machine cannot be modified.
    fn configure_adapter(
        &self,
        vmname: &str,
        slot: AdapterSlot,
        mode: &AdapterMode,
    ) -> Result<(), HypervisorError>;

    /// Starts `vmname` without a display.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError`] when the machine does not start.
    fn start_machine(&self, vmname: &str) -> Result<(), HypervisorError>;

    /// Powers `vmname` off. Powering off a machine that is not running
    /// succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError`] when the command fails for another reason.
    fn power_off(&self, vmname: &str) -> Result<(), HypervisorError>;

    /// Unregisters `vmname` and deletes its files.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError`] when the machine cannot be removed.
    fn delete_machine(&self, vmname: &str) -> Result<(), HypervisorError>;

    /// Reads the machine-readable status of `vmname`.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError`] when the status cannot be read or parsed.
    fn machine_info(&self, vmname: &str) -> Result<MachineInfo, HypervisorError>;

    /// Names of every existing host-only network.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError`] when the listing command fails.
    fn network_names(&self) -> Result<Vec<String>, HypervisorError>;

    /// Creates a host-only network and returns the name the hypervisor
    /// issued for it.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError`] when creation fails.
    fn create_network(&self) -> Result<String, HypervisorError>;

    /// Assigns the host-side address of `network`.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError`] when the address cannot be set.
    fn set_network_address(&self, network: &str, address: Ipv4Addr)
    -> Result<(), HypervisorError>;

    /// Creates and enables the lease service of `network`.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError`] when the service cannot be created.
    fn add_lease_service(&self, network: &str, range: &LeaseRange) -> Result<(), HypervisorError>;

    /// Removes the lease service of `network`.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError`] when the service cannot be removed.
    fn remove_lease_service(&self, network: &str) -> Result<(), HypervisorError>;

    /// Deletes the lease database and log files of `network`.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError::Io`] when a file cannot be removed.
    fn remove_lease_files(&self, network: &str) -> Result<(), HypervisorError>;

    /// Removes the `network` interface.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError`] when the interface cannot be removed.
    fn remove_network(&self, network: &str) -> Result<(), HypervisorError>;

    /// Active leases of `network`, keyed by lower-case colon MAC address.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError`] when the lease database cannot be read.
    fn leases(&self, network: &str) -> Result<BTreeMap<String, Ipv4Addr>, HypervisorError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, None)]
    #[case(1, Some(1))]
    #[case(8, Some(8))]
    #[case(9, None)]
    fn adapter_slot_accepts_one_through_eight(#[case] index: u8, #[case] expected: Option<u8>) {
        assert_eq!(AdapterSlot::new(index).map(AdapterSlot::index), expected);
    }

    #[rstest]
    #[case("running", PowerState::Running, false)]
    #[case("poweroff", PowerState::PoweredOff, true)]
    #[case("aborted", PowerState::Aborted, true)]
    #[case("stopping", PowerState::Other(String::from("stopping")), false)]
    fn power_state_maps_raw_values(
        #[case] raw: &str,
        #[case] expected: PowerState,
        #[case] off: bool,
    ) {
        let state = PowerState::from_raw(raw);
        assert_eq!(state, expected);
        assert_eq!(state.is_off(), off);
        assert_eq!(state.to_string(), raw);
    }
}
