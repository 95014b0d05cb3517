//! Virtual host entity: import, adapter wiring, power control, address
//! lookup and destruction.

use std::net::Ipv4Addr;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::hypervisor::{AdapterMode, AdapterSlot, Hypervisor, HypervisorError, PowerState};

/// Default settle delay between power-off and start during a restart.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(3);

/// Declared properties of a host.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HostSpec {
    /// Unique machine name.
    pub vmname: String,
    /// Image to import.
    pub image: String,
}

/// Internet-facing adapter attachment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InternetAccess {
    /// Outbound access through the hypervisor's NAT engine.
    Nat,
    /// Bridged onto a physical interface.
    Bridged {
        /// Physical interface to bridge.
        interface: String,
    },
}

impl InternetAccess {
    fn adapter_mode(&self) -> AdapterMode {
        match self {
            Self::Nat => AdapterMode::Nat,
            Self::Bridged { interface } => AdapterMode::Bridged {
                interface: interface.clone(),
            },
        }
    }
}

/// One adapter of a host joined with its lease.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct NicDetails {
    /// Adapter slot index.
    pub slot: u8,
    /// Network, NAT network or bridged interface name.
    pub network: String,
    /// Hardware address.
    pub mac: Option<String>,
    /// Address leased to the adapter, when observed.
    pub address: Option<Ipv4Addr>,
}

/// Live status of a host.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct HostProperties {
    /// Power state.
    pub state: PowerState,
    /// Guest operating system type.
    pub os_type: Option<String>,
    /// Virtual CPU count.
    pub cpus: Option<u32>,
    /// Memory in MiB.
    pub memory_mb: Option<u64>,
    /// Adapters in slot order.
    pub nics: Vec<NicDetails>,
}

impl HostProperties {
    /// First address leased to any adapter, in slot order.
    #[must_use]
    pub fn address(&self) -> Option<Ipv4Addr> {
        self.nics.iter().find_map(|nic| nic.address)
    }
}

/// Timing used by [`Host::restart`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RestartTiming {
    /// Upper bound on waiting for the machine to power off.
    pub power_off_timeout: Duration,
    /// Interval between power state checks.
    pub poll_interval: Duration,
    /// Pause after power-off before starting again.
    pub settle_delay: Duration,
}

/// Handle on a machine known to the hypervisor.
#[derive(Debug)]
pub struct Host<'a, H: Hypervisor + ?Sized> {
    hypervisor: &'a H,
    vmname: &'a str,
}

impl<'a, H: Hypervisor + ?Sized> Host<'a, H> {
    /// Binds to the existing machine `vmname`.
    #[must_use]
    pub const fn new(hypervisor: &'a H, vmname: &'a str) -> Self {
        Self { hypervisor, vmname }
    }

    /// Imports `spec.image` as `spec.vmname` and checks the machine is
    /// registered afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError::AlreadyExists`] when either the machine
    /// name or the image name is already registered, and
    /// [`HypervisorError::Missing`] when the import left no machine behind.
    pub fn create(hypervisor: &'a H, spec: &'a HostSpec) -> Result<Self, HypervisorError> {
        let known = hypervisor.machine_names()?;
        if known.contains(&spec.image) {
            return Err(HypervisorError::AlreadyExists {
                kind: "template",
                name: spec.image.clone(),
            });
        }
        if known.contains(&spec.vmname) {
            return Err(HypervisorError::AlreadyExists {
                kind: "machine",
                name: spec.vmname.clone(),
            });
        }

        hypervisor.import_machine(&spec.image, &spec.vmname)?;
        if !hypervisor.machine_names()?.contains(&spec.vmname) {
            return Err(HypervisorError::Missing {
                kind: "machine",
                name: spec.vmname.clone(),
                action: format!("import of {}", spec.image),
            });
        }
        info!(vmname = %spec.vmname, image = %spec.image, "imported machine");
        Ok(Self::new(hypervisor, &spec.vmname))
    }

    /// Machine name.
    #[must_use]
    pub const fn vmname(&self) -> &str {
        self.vmname
    }

    /// Attaches adapter `slot` to the host-only network `network`.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError`] when the adapter cannot be modified.
    pub fn assign_network(&self, slot: AdapterSlot, network: &str) -> Result<(), HypervisorError> {
        self.hypervisor.configure_adapter(
            self.vmname,
            slot,
            &AdapterMode::HostOnly {
                network: network.to_owned(),
            },
        )?;
        debug!(vmname = self.vmname, %slot, network, "attached host-only adapter");
        Ok(())
    }

    /// Attaches adapter `slot` for internet access.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError`] when the adapter cannot be modified.
    pub fn assign_internet(
        &self,
        slot: AdapterSlot,
        access: &InternetAccess,
    ) -> Result<(), HypervisorError> {
        self.hypervisor
            .configure_adapter(self.vmname, slot, &access.adapter_mode())?;
        debug!(vmname = self.vmname, %slot, ?access, "attached internet adapter");
        Ok(())
    }

    /// Starts the machine headless.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError`] when the machine does not start.
    pub fn start(&self) -> Result<(), HypervisorError> {
        self.hypervisor.start_machine(self.vmname)?;
        info!(vmname = self.vmname, "started machine");
        Ok(())
    }

    /// Powers the machine off.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError`] when the power-off command fails.
    pub fn stop(&self) -> Result<(), HypervisorError> {
        self.hypervisor.power_off(self.vmname)?;
        info!(vmname = self.vmname, "stopped machine");
        Ok(())
    }

    /// Powers off, waits for the `poweroff` state, settles, then starts.
    ///
    /// If the machine has not reported `poweroff` when the timeout elapses
    /// a warning is logged and the start is attempted anyway.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError`] when power-off or start fails.
    pub fn restart(&self, timing: RestartTiming) -> Result<(), HypervisorError> {
        self.hypervisor.power_off(self.vmname)?;
        let deadline = Instant::now() + timing.power_off_timeout;
        loop {
            match self.hypervisor.machine_info(self.vmname) {
                Ok(info) if info.state == PowerState::PoweredOff => break,
                Ok(info) => debug!(vmname = self.vmname, state = %info.state, "waiting for power off"),
                Err(err) => debug!(vmname = self.vmname, error = %err, "power state unavailable"),
            }
            if Instant::now() >= deadline {
                warn!(
                    vmname = self.vmname,
                    timeout_secs = timing.power_off_timeout.as_secs(),
                    "machine did not report poweroff in time"
                );
                break;
            }
            thread::sleep(timing.poll_interval);
        }
        thread::sleep(timing.settle_delay);
        self.start()
    }

    /// Reads the live status and joins each adapter with the leases of its
    /// network.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError`] when the status or a lease database cannot
    /// be read.
    pub fn properties(&self) -> Result<HostProperties, HypervisorError> {
        let info = self.hypervisor.machine_info(self.vmname)?;
        let mut nics = Vec::with_capacity(info.nics.len());
        for (slot, nic) in info.nics {
            let address = match nic.mac.as_deref() {
                Some(mac) => self.hypervisor.leases(&nic.network)?.get(mac).copied(),
                None => None,
            };
            nics.push(NicDetails {
                slot,
                network: nic.network,
                mac: nic.mac,
                address,
            });
        }
        Ok(HostProperties {
            state: info.state,
            os_type: info.os_type,
            cpus: info.cpus,
            memory_mb: info.memory_mb,
            nics,
        })
    }

    /// First leased address of the machine, if any.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError`] when the status cannot be read.
    pub fn address(&self) -> Result<Option<Ipv4Addr>, HypervisorError> {
        Ok(self.properties()?.address())
    }

    /// Unregisters and deletes the machine, returning the last address it
    /// held so callers can scrub stale host keys.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError`] when the machine cannot be removed.
    pub fn destroy(self) -> Result<Option<Ipv4Addr>, HypervisorError> {
        let last_address = self.address().unwrap_or_else(|err| {
            debug!(vmname = self.vmname, error = %err, "no address before destroy");
            None
        });
        self.hypervisor.delete_machine(self.vmname)?;
        info!(vmname = self.vmname, "destroyed machine");
        Ok(last_address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeHypervisor, FakeOp};
    use rstest::{fixture, rstest};

    #[fixture]
    fn spec() -> HostSpec {
        HostSpec {
            vmname: String::from("web-1"),
            image: String::from("ubuntu.ova"),
        }
    }

    fn slot(index: u8) -> AdapterSlot {
        AdapterSlot::new(index).expect("valid slot")
    }

    #[rstest]
    fn create_imports_and_verifies(spec: HostSpec) {
        let fake = FakeHypervisor::new();
        let host = Host::create(&fake, &spec).expect("import should succeed");
        assert_eq!(host.vmname(), "web-1");
        assert!(fake.machine("web-1").is_some());
    }

    #[rstest]
    #[case("web-1", "machine")]
    #[case("ubuntu.ova", "template")]
    fn create_rejects_registered_names(
        spec: HostSpec,
        #[case] registered: &str,
        #[case] expected_kind: &str,
    ) {
        let fake = FakeHypervisor::new();
        fake.register_machine(registered);
        let err = Host::create(&fake, &spec).expect_err("name already registered");
        let HypervisorError::AlreadyExists { kind, .. } = err else {
            panic!("expected AlreadyExists, got {err:?}");
        };
        assert_eq!(kind, expected_kind);
        assert!(!fake.calls().iter().any(|call| call.starts_with("import")));
    }

    #[rstest]
    fn create_detects_silent_import_failure(spec: HostSpec) {
        let fake = FakeHypervisor::new();
        fake.drop_imports();
        let err = Host::create(&fake, &spec).expect_err("machine missing after import");
        assert!(matches!(err, HypervisorError::Missing { .. }));
    }

    #[rstest]
    fn address_uses_first_leased_adapter(spec: HostSpec) {
        let fake = FakeHypervisor::new();
        fake.add_network("vboxnet0");
        fake.add_network("vboxnet1");
        let host = Host::create(&fake, &spec).expect("import");
        host.assign_network(slot(1), "vboxnet0").expect("adapter 1");
        host.assign_network(slot(2), "vboxnet1").expect("adapter 2");
        assert_eq!(host.address().expect("status"), None);

        fake.grant_lease("web-1", 2, Ipv4Addr::new(10, 0, 1, 50));
        assert_eq!(
            host.address().expect("status"),
            Some(Ipv4Addr::new(10, 0, 1, 50))
        );
        fake.grant_lease("web-1", 1, Ipv4Addr::new(10, 0, 0, 50));
        assert_eq!(
            host.address().expect("status"),
            Some(Ipv4Addr::new(10, 0, 0, 50))
        );
    }

    #[rstest]
    fn restart_powers_off_then_starts(spec: HostSpec) {
        let fake = FakeHypervisor::new();
        let host = Host::create(&fake, &spec).expect("import");
        host.start().expect("start");
        host.restart(RestartTiming {
            power_off_timeout: Duration::from_millis(50),
            poll_interval: Duration::from_millis(1),
            settle_delay: Duration::ZERO,
        })
        .expect("restart");
        let calls = fake.calls();
        let tail: Vec<&str> = calls.iter().rev().take(3).rev().map(String::as_str).collect();
        assert_eq!(tail, vec!["poweroff web-1", "info web-1", "start web-1"]);
        let machine = fake.machine("web-1").expect("machine");
        assert_eq!(machine.state, PowerState::Running);
    }

    #[rstest]
    fn destroy_returns_last_address(spec: HostSpec) {
        let fake = FakeHypervisor::new();
        fake.add_network("vboxnet0");
        let host = Host::create(&fake, &spec).expect("import");
        host.assign_network(slot(1), "vboxnet0").expect("adapter");
        fake.grant_lease("web-1", 1, Ipv4Addr::new(10, 0, 0, 50));

        let last = host.destroy().expect("destroy");
        assert_eq!(last, Some(Ipv4Addr::new(10, 0, 0, 50)));
        assert!(fake.machine("web-1").is_none());
    }

    #[rstest]
    fn destroy_surfaces_delete_failure(spec: HostSpec) {
        let fake = FakeHypervisor::new();
        let host = Host::create(&fake, &spec).expect("import");
        fake.fail(FakeOp::DeleteMachine, "web-1");
        let err = host.destroy().expect_err("delete fails");
        assert!(matches!(err, HypervisorError::CommandFailure { .. }));
    }
}
