//! Test doubles shared across unit and integration tests.
//!
//! [`ScriptedRunner`] replays canned command outputs, [`FakeHypervisor`]
//! models machines, networks and leases in memory, and
//! [`InProcessRelayLauncher`] runs relay servers as tasks instead of child
//! processes.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use crate::command::{CommandError, CommandOutput, CommandRunner, render_command};
use crate::hypervisor::{
    AdapterMode, AdapterSlot, Hypervisor, HypervisorError, LeaseRange, MachineInfo, NicInfo,
    PowerState,
};
use crate::network::next_network_name;

mod relay_launcher;

pub use relay_launcher::InProcessRelayLauncher;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        render_command(&self.program, &self.args)
    }
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Clones share the same queue and invocation log.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<Result<CommandOutput, CommandError>>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.invocations).clone()
    }

    /// Returns every invocation rendered as a command line.
    #[must_use]
    pub fn rendered_invocations(&self) -> Vec<String> {
        lock(&self.invocations)
            .iter()
            .map(CommandInvocation::command_string)
            .collect()
    }

    /// Pushes an explicit command output response.
    pub fn push_output(&self, output: CommandOutput) {
        lock(&self.responses).push_back(Ok(output));
    }

    /// Pushes a successful exit status with the given stdout.
    pub fn push_success(&self, stdout: impl Into<String>) {
        self.push_output(CommandOutput {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        });
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32, stderr: impl Into<String>) {
        self.push_output(CommandOutput {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        });
    }

    /// Pushes a failure to spawn the program at all.
    pub fn push_spawn_error(&self, message: impl Into<String>) {
        lock(&self.responses).push_back(Err(CommandError::Spawn {
            program: String::from("scripted"),
            message: message.into(),
        }));
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        lock(&self.invocations).push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        lock(&self.responses)
            .pop_front()
            .unwrap_or_else(|| {
                Err(CommandError::Spawn {
                    program: program.to_owned(),
                    message: String::from("no scripted response available"),
                })
            })
    }
}

/// Operations of [`FakeHypervisor`] that can be made to fail.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum FakeOp {
    /// [`Hypervisor::import_machine`].
    ImportMachine,
    /// [`Hypervisor::configure_adapter`].
    ConfigureAdapter,
    /// [`Hypervisor::start_machine`].
    StartMachine,
    /// [`Hypervisor::power_off`].
    PowerOff,
    /// [`Hypervisor::delete_machine`].
    DeleteMachine,
    /// [`Hypervisor::machine_info`].
    MachineInfo,
    /// [`Hypervisor::create_network`].
    CreateNetwork,
    /// [`Hypervisor::set_network_address`].
    SetNetworkAddress,
    /// [`Hypervisor::add_lease_service`].
    AddLeaseService,
    /// [`Hypervisor::remove_lease_service`].
    RemoveLeaseService,
    /// [`Hypervisor::remove_network`].
    RemoveNetwork,
}

/// Machine modelled by [`FakeHypervisor`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FakeMachine {
    /// Image the machine was imported from.
    pub image: String,
    /// Current power state.
    pub state: PowerState,
    /// Attached adapters keyed by slot index.
    pub adapters: BTreeMap<u8, AdapterMode>,
    serial: u8,
}

impl FakeMachine {
    fn mac(&self, slot: u8) -> String {
        format!("08:00:27:00:{:02x}:{slot:02x}", self.serial)
    }
}

/// Network modelled by [`FakeHypervisor`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FakeNetwork {
    /// Host-side address, once assigned.
    pub address: Option<Ipv4Addr>,
    /// Lease service range, once enabled.
    pub lease_range: Option<LeaseRange>,
}

#[derive(Debug, Default)]
struct FakeState {
    machines: BTreeMap<String, FakeMachine>,
    networks: BTreeMap<String, FakeNetwork>,
    leases: BTreeMap<String, BTreeMap<String, Ipv4Addr>>,
    failures: BTreeSet<(FakeOp, String)>,
    calls: Vec<String>,
    next_serial: u8,
    drop_imports: bool,
    issued_networks: Vec<String>,
}

impl FakeState {
    fn record(&mut self, op: Option<FakeOp>, call: String, subject: &str) -> Result<(), HypervisorError> {
        self.calls.push(call.clone());
        let Some(op) = op else {
            return Ok(());
        };
        let scripted = self.failures.contains(&(op, subject.to_owned()))
            || self.failures.contains(&(op, String::new()));
        if scripted {
            return Err(failure(call, "scripted failure"));
        }
        Ok(())
    }

    fn machine_mut(&mut self, vmname: &str, call: &str) -> Result<&mut FakeMachine, HypervisorError> {
        self.machines
            .get_mut(vmname)
            .ok_or_else(|| failure(call.to_owned(), "no such machine"))
    }

    fn network_mut(&mut self, name: &str, call: &str) -> Result<&mut FakeNetwork, HypervisorError> {
        self.networks
            .get_mut(name)
            .ok_or_else(|| failure(call.to_owned(), "no such network"))
    }
}

fn failure(action: String, stderr: &str) -> HypervisorError {
    HypervisorError::CommandFailure {
        program: String::from("fake"),
        action,
        status_text: String::from("1"),
        stderr: stderr.to_owned(),
    }
}

fn describe(mode: &AdapterMode) -> String {
    match mode {
        AdapterMode::HostOnly { network } => format!("hostonly:{network}"),
        AdapterMode::Nat => String::from("nat"),
        AdapterMode::Bridged { interface } => format!("bridged:{interface}"),
    }
}

/// In-memory hypervisor recording every lifecycle call.
///
/// Clones share state, so a test can keep one handle for assertions while
/// the code under test owns another. Deleting a running machine fails, as
/// it does with the real hypervisor.
#[derive(Clone, Debug, Default)]
pub struct FakeHypervisor {
    state: Arc<Mutex<FakeState>>,
}

impl FakeHypervisor {
    /// Creates an empty hypervisor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        lock(&self.state)
    }

    /// Makes every later `op` on `target` fail. An empty target matches
    /// every subject.
    pub fn fail(&self, op: FakeOp, target: &str) {
        self.state().failures.insert((op, target.to_owned()));
    }

    /// Removes every scripted failure.
    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    /// Makes imports report success without registering a machine.
    pub fn drop_imports(&self) {
        self.state().drop_imports = true;
    }

    /// Registers a machine that existed before the test.
    pub fn register_machine(&self, vmname: &str) {
        let mut state = self.state();
        state.next_serial = state.next_serial.wrapping_add(1);
        let serial = state.next_serial;
        state.machines.insert(
            vmname.to_owned(),
            FakeMachine {
                image: String::from("preexisting"),
                state: PowerState::PoweredOff,
                adapters: BTreeMap::new(),
                serial,
            },
        );
    }

    /// Makes the next network creations issue `names` in order instead of
    /// the lowest unused name. The name is issued even when it already
    /// exists.
    pub fn issue_network_names(&self, names: &[&str]) {
        self.state()
            .issued_networks
            .extend(names.iter().map(|name| (*name).to_owned()));
    }

    /// Registers a host-only network that existed before the test.
    pub fn add_network(&self, name: &str) {
        self.state()
            .networks
            .insert(name.to_owned(), FakeNetwork::default());
    }

    /// Leases `address` to adapter `slot` of `vmname` on the host-only
    /// network the adapter is attached to.
    ///
    /// # Panics
    ///
    /// Panics when the machine or a host-only adapter in `slot` is missing.
    pub fn grant_lease(&self, vmname: &str, slot: u8, address: Ipv4Addr) {
        let mut state = self.state();
        let machine = state
            .machines
            .get(vmname)
            .unwrap_or_else(|| panic!("no machine {vmname}"));
        let Some(AdapterMode::HostOnly { network }) = machine.adapters.get(&slot) else {
            panic!("{vmname} has no host-only adapter in slot {slot}");
        };
        let network = network.clone();
        let mac = machine.mac(slot);
        state.leases.entry(network).or_default().insert(mac, address);
    }

    /// Snapshot of machine `vmname`.
    #[must_use]
    pub fn machine(&self, vmname: &str) -> Option<FakeMachine> {
        self.state().machines.get(vmname).cloned()
    }

    /// Snapshot of network `name`.
    #[must_use]
    pub fn network(&self, name: &str) -> Option<FakeNetwork> {
        self.state().networks.get(name).cloned()
    }

    /// Names of every registered machine.
    #[must_use]
    pub fn machine_names_snapshot(&self) -> Vec<String> {
        self.state().machines.keys().cloned().collect()
    }

    /// Names of every registered network.
    #[must_use]
    pub fn network_names_snapshot(&self) -> Vec<String> {
        self.state().networks.keys().cloned().collect()
    }

    /// Every call made so far, for example `start web-1`.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }
}

impl Hypervisor for FakeHypervisor {
    fn machine_names(&self) -> Result<Vec<String>, HypervisorError> {
        let mut state = self.state();
        state.record(None, String::from("list-vms"), "")?;
        Ok(state.machines.keys().cloned().collect())
    }

    fn import_machine(&self, image: &str, vmname: &str) -> Result<(), HypervisorError> {
        let mut state = self.state();
        let call = format!("import {vmname}");
        state.record(Some(FakeOp::ImportMachine), call.clone(), vmname)?;
        if state.machines.contains_key(vmname) {
            return Err(failure(call, "machine already registered"));
        }
        if state.drop_imports {
            return Ok(());
        }
        state.next_serial = state.next_serial.wrapping_add(1);
        let serial = state.next_serial;
        state.machines.insert(
            vmname.to_owned(),
            FakeMachine {
                image: image.to_owned(),
                state: PowerState::PoweredOff,
                adapters: BTreeMap::new(),
                serial,
            },
        );
        Ok(())
    }

    fn configure_adapter(
        &self,
        vmname: &str,
        slot: AdapterSlot,
        mode: &AdapterMode,
    ) -> Result<(), HypervisorError> {
        let mut state = self.state();
        let call = format!("adapter {vmname} {slot} {}", describe(mode));
        state.record(Some(FakeOp::ConfigureAdapter), call.clone(), vmname)?;
        state
            .machine_mut(vmname, &call)?
            .adapters
            .insert(slot.index(), mode.clone());
        Ok(())
    }

    fn start_machine(&self, vmname: &str) -> Result<(), HypervisorError> {
        let mut state = self.state();
        let call = format!("start {vmname}");
        state.record(Some(FakeOp::StartMachine), call.clone(), vmname)?;
        state.machine_mut(vmname, &call)?.state = PowerState::Running;
        Ok(())
    }

    fn power_off(&self, vmname: &str) -> Result<(), HypervisorError> {
        let mut state = self.state();
        let call = format!("poweroff {vmname}");
        state.record(Some(FakeOp::PowerOff), call.clone(), vmname)?;
        state.machine_mut(vmname, &call)?.state = PowerState::PoweredOff;
        Ok(())
    }

    fn delete_machine(&self, vmname: &str) -> Result<(), HypervisorError> {
        let mut state = self.state();
        let call = format!("delete {vmname}");
        state.record(Some(FakeOp::DeleteMachine), call.clone(), vmname)?;
        if state.machine_mut(vmname, &call)?.state == PowerState::Running {
            return Err(failure(call, "machine is locked by a running session"));
        }
        state.machines.remove(vmname);
        Ok(())
    }

    fn machine_info(&self, vmname: &str) -> Result<MachineInfo, HypervisorError> {
        let mut state = self.state();
        let call = format!("info {vmname}");
        state.record(Some(FakeOp::MachineInfo), call.clone(), vmname)?;
        let machine = state.machine_mut(vmname, &call)?;
        let nics = machine
            .adapters
            .iter()
            .map(|(slot, mode)| {
                let network = match mode {
                    AdapterMode::HostOnly { network } => network.clone(),
                    AdapterMode::Nat => String::from("nat"),
                    AdapterMode::Bridged { interface } => interface.clone(),
                };
                (
                    *slot,
                    NicInfo {
                        network,
                        mac: Some(machine.mac(*slot)),
                    },
                )
            })
            .collect();
        Ok(MachineInfo {
            state: machine.state.clone(),
            os_type: Some(String::from("Ubuntu_64")),
            cpus: Some(1),
            memory_mb: Some(1024),
            nics,
        })
    }

    fn network_names(&self) -> Result<Vec<String>, HypervisorError> {
        let mut state = self.state();
        state.record(None, String::from("list-networks"), "")?;
        Ok(state.networks.keys().cloned().collect())
    }

    fn create_network(&self) -> Result<String, HypervisorError> {
        let mut state = self.state();
        let name = if state.issued_networks.is_empty() {
            let existing: Vec<String> = state.networks.keys().cloned().collect();
            next_network_name(&existing)?
        } else {
            state.issued_networks.remove(0)
        };
        state.record(
            Some(FakeOp::CreateNetwork),
            format!("create-network {name}"),
            &name,
        )?;
        state.networks.insert(name.clone(), FakeNetwork::default());
        Ok(name)
    }

    fn set_network_address(
        &self,
        network: &str,
        address: Ipv4Addr,
    ) -> Result<(), HypervisorError> {
        let mut state = self.state();
        let call = format!("network-address {network}");
        state.record(Some(FakeOp::SetNetworkAddress), call.clone(), network)?;
        state.network_mut(network, &call)?.address = Some(address);
        Ok(())
    }

    fn add_lease_service(&self, network: &str, range: &LeaseRange) -> Result<(), HypervisorError> {
        let mut state = self.state();
        let call = format!("add-lease-service {network}");
        state.record(Some(FakeOp::AddLeaseService), call.clone(), network)?;
        state.network_mut(network, &call)?.lease_range = Some(*range);
        Ok(())
    }

    fn remove_lease_service(&self, network: &str) -> Result<(), HypervisorError> {
        let mut state = self.state();
        let call = format!("remove-lease-service {network}");
        state.record(Some(FakeOp::RemoveLeaseService), call.clone(), network)?;
        let entry = state.network_mut(network, &call)?;
        if entry.lease_range.take().is_none() {
            return Err(failure(call, "no lease service configured"));
        }
        Ok(())
    }

    fn remove_lease_files(&self, network: &str) -> Result<(), HypervisorError> {
        let mut state = self.state();
        state.record(None, format!("remove-lease-files {network}"), network)?;
        state.leases.remove(network);
        Ok(())
    }

    fn remove_network(&self, network: &str) -> Result<(), HypervisorError> {
        let mut state = self.state();
        let call = format!("remove-network {network}");
        state.record(Some(FakeOp::RemoveNetwork), call.clone(), network)?;
        if state.networks.remove(network).is_none() {
            return Err(failure(call, "no such network"));
        }
        state.leases.remove(network);
        Ok(())
    }

    fn leases(&self, network: &str) -> Result<BTreeMap<String, Ipv4Addr>, HypervisorError> {
        Ok(self
            .state()
            .leases
            .get(network)
            .cloned()
            .unwrap_or_default())
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
