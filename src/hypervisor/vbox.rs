//! `VBoxManage`-backed implementation of [`Hypervisor`].

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io;
use std::net::Ipv4Addr;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use tracing::debug;

use super::parse::{
    parse_created_network, parse_leases, parse_machine_info, parse_network_names, parse_vm_names,
};
use super::{AdapterMode, AdapterSlot, Hypervisor, HypervisorError, LeaseRange, MachineInfo};
use crate::command::{CommandOutput, CommandRunner, ProcessCommandRunner, render_command};
use crate::paths::read_optional;

/// Default name of the `VirtualBox` control binary.
pub const DEFAULT_VBOXMANAGE_BIN: &str = "VBoxManage";

/// Stderr fragment `VBoxManage` emits when powering off a stopped machine.
const NOT_RUNNING: &str = "is not currently running";

/// Returns the platform's `VirtualBox` configuration directory, which holds
/// the lease databases of host-only networks.
#[must_use]
pub fn default_vbox_config_dir() -> Option<Utf8PathBuf> {
    let home = std::env::var("HOME").ok()?;
    let relative = if cfg!(target_os = "macos") {
        "Library/VirtualBox"
    } else {
        ".config/VirtualBox"
    };
    Some(Utf8PathBuf::from(home).join(relative))
}

fn lease_file_prefix(network: &str) -> String {
    format!("HostInterfaceNetworking-{network}-Dhcpd.")
}

/// Drives `VirtualBox` through `VBoxManage`.
#[derive(Clone, Debug)]
pub struct VirtualBox<R: CommandRunner> {
    program: String,
    config_dir: Utf8PathBuf,
    runner: R,
}

impl VirtualBox<ProcessCommandRunner> {
    /// Convenience constructor that wires the real process runner.
    #[must_use]
    pub fn with_process_runner(program: impl Into<String>, config_dir: Utf8PathBuf) -> Self {
        Self::new(program, config_dir, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> VirtualBox<R> {
    /// Creates a client invoking `program` and reading lease files from
    /// `config_dir`.
    #[must_use]
    pub fn new(program: impl Into<String>, config_dir: Utf8PathBuf, runner: R) -> Self {
        Self {
            program: program.into(),
            config_dir,
            runner,
        }
    }

    /// Directory holding the lease databases.
    #[must_use]
    pub fn config_dir(&self) -> &Utf8Path {
        &self.config_dir
    }

    fn invoke(&self, args: &[&str]) -> Result<CommandOutput, HypervisorError> {
        let os_args: Vec<OsString> = args.iter().map(OsString::from).collect();
        debug!(command = %render_command(&self.program, &os_args), "invoking hypervisor");
        Ok(self.runner.run(&self.program, &os_args)?)
    }

    fn failure(&self, args: &[&str], output: CommandOutput) -> HypervisorError {
        HypervisorError::CommandFailure {
            program: self.program.clone(),
            action: args.join(" "),
            status_text: output.status_text(),
            stderr: output.stderr.trim().to_owned(),
        }
    }

    fn run_checked(&self, args: &[&str]) -> Result<String, HypervisorError> {
        let output = self.invoke(args)?;
        if output.is_success() {
            Ok(output.stdout)
        } else {
            Err(self.failure(args, output))
        }
    }

    fn io_error(&self, path: &Utf8Path, err: &io::Error) -> HypervisorError {
        debug!(config_dir = %self.config_dir, %path, error = %err, "lease file access failed");
        HypervisorError::Io {
            path: path.to_string(),
            message: err.to_string(),
        }
    }
}

impl<R: CommandRunner> Hypervisor for VirtualBox<R> {
    fn machine_names(&self) -> Result<Vec<String>, HypervisorError> {
        let stdout = self.run_checked(&["list", "vms"])?;
        Ok(parse_vm_names(&stdout))
    }

    fn import_machine(&self, image: &str, vmname: &str) -> Result<(), HypervisorError> {
        self.run_checked(&["import", image, "--vsys", "0", "--vmname", vmname])?;
        Ok(())
    }

    fn configure_adapter(
        &self,
        vmname: &str,
        slot: AdapterSlot,
        mode: &AdapterMode,
    ) -> Result<(), HypervisorError> {
        let nic_flag = format!("--nic{slot}");
        match mode {
            AdapterMode::HostOnly { network } => {
                let adapter_flag = format!("--hostonlyadapter{slot}");
                self.run_checked(&[
                    "modifyvm",
                    vmname,
                    nic_flag.as_str(),
                    "hostonly",
                    adapter_flag.as_str(),
                    network.as_str(),
                ])?;
            }
            AdapterMode::Nat => {
                self.run_checked(&["modifyvm", vmname, nic_flag.as_str(), "nat"])?;
            }
            AdapterMode::Bridged { interface } => {
                let adapter_flag = format!("--bridgeadapter{slot}");
                self.run_checked(&[
                    "modifyvm",
                    vmname,
                    nic_flag.as_str(),
                    "bridged",
                    adapter_flag.as_str(),
                    interface.as_str(),
                ])?;
            }
        }
        Ok(())
    }

    fn start_machine(&self, vmname: &str) -> Result<(), HypervisorError> {
        self.run_checked(&["startvm", vmname, "--type", "headless"])?;
        Ok(())
    }

    fn power_off(&self, vmname: &str) -> Result<(), HypervisorError> {
        let args = ["controlvm", vmname, "poweroff"];
        let output = self.invoke(&args)?;
        if output.is_success() {
            return Ok(());
        }
        if output.stderr.contains(NOT_RUNNING) {
            debug!(vmname, "machine already powered off");
            return Ok(());
        }
        Err(self.failure(&args, output))
    }

    fn delete_machine(&self, vmname: &str) -> Result<(), HypervisorError> {
        self.run_checked(&["unregistervm", vmname, "--delete"])?;
        Ok(())
    }

    fn machine_info(&self, vmname: &str) -> Result<MachineInfo, HypervisorError> {
        let stdout = self.run_checked(&["showvminfo", vmname, "--machinereadable"])?;
        parse_machine_info(vmname, &stdout)
    }

    fn network_names(&self) -> Result<Vec<String>, HypervisorError> {
        let stdout = self.run_checked(&["list", "hostonlyifs"])?;
        Ok(parse_network_names(&stdout))
    }

    fn create_network(&self) -> Result<String, HypervisorError> {
        let stdout = self.run_checked(&["hostonlyif", "create"])?;
        parse_created_network(&stdout)
    }

    fn set_network_address(
        &self,
        network: &str,
        address: Ipv4Addr,
    ) -> Result<(), HypervisorError> {
        let ip = address.to_string();
        self.run_checked(&["hostonlyif", "ipconfig", network, "--ip", ip.as_str()])?;
        Ok(())
    }

    fn add_lease_service(&self, network: &str, range: &LeaseRange) -> Result<(), HypervisorError> {
        let ip = range.address.to_string();
        let netmask = range.netmask.to_string();
        let lower = range.lower.to_string();
        let upper = range.upper.to_string();
        self.run_checked(&[
            "dhcpserver",
            "add",
            "--ifname",
            network,
            "--ip",
            ip.as_str(),
            "--netmask",
            netmask.as_str(),
            "--lowerip",
            lower.as_str(),
            "--upperip",
            upper.as_str(),
        ])?;
        self.run_checked(&["dhcpserver", "modify", "--ifname", network, "--enable"])?;
        Ok(())
    }

    fn remove_lease_service(&self, network: &str) -> Result<(), HypervisorError> {
        self.run_checked(&["dhcpserver", "remove", "--ifname", network])?;
        Ok(())
    }

    fn remove_lease_files(&self, network: &str) -> Result<(), HypervisorError> {
        let dir = match Dir::open_ambient_dir(&self.config_dir, ambient_authority()) {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(self.io_error(&self.config_dir, &err)),
        };
        let prefix = lease_file_prefix(network);
        let entries = dir
            .entries()
            .map_err(|err| self.io_error(&self.config_dir, &err))?;
        for entry in entries {
            let entry = entry.map_err(|err| self.io_error(&self.config_dir, &err))?;
            let name = entry
                .file_name()
                .map_err(|err| self.io_error(&self.config_dir, &err))?;
            if !name.starts_with(&prefix) {
                continue;
            }
            debug!(network, file = %name, "removing lease file");
            dir.remove_file(&name)
                .map_err(|err| self.io_error(&self.config_dir.join(&name), &err))?;
        }
        Ok(())
    }

    fn remove_network(&self, network: &str) -> Result<(), HypervisorError> {
        self.run_checked(&["hostonlyif", "remove", network])?;
        Ok(())
    }

    fn leases(&self, network: &str) -> Result<BTreeMap<String, Ipv4Addr>, HypervisorError> {
        let path = self
            .config_dir
            .join(format!("{}leases", lease_file_prefix(network)));
        match read_optional(&path) {
            Ok(Some(xml)) => parse_leases(network, &xml),
            Ok(None) => Ok(BTreeMap::new()),
            Err(err) => Err(self.io_error(&path, &err)),
        }
    }
}
