//! Per-deployment relay lifecycle.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::{
    DEFAULT_GUEST_SSH_PORT, DEFAULT_RELAY_BASE_PORT, PortAllocator, RelayLauncher, RelaySpec,
    RestartPolicy, Termination, TunnelError,
};
use crate::host::Host;
use crate::hypervisor::Hypervisor;
use crate::orchestrator::Outcome;
use crate::store::{HostRecord, NewTunnel, RecordId, Store, TunnelRecord};

/// A relay started for one host.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct TunnelInfo {
    /// Host the relay forwards to.
    pub vmname: String,
    /// Externally reachable port.
    pub listen_port: u16,
    /// Guest SSH endpoint.
    pub target: SocketAddr,
    /// Relay process id.
    pub process_id: u32,
}

/// Starts and stops the relays exposing a deployment's hosts.
#[derive(Debug)]
pub struct TunnelSupervisor<H, S, L> {
    hypervisor: Arc<H>,
    store: Arc<S>,
    launcher: Arc<L>,
    ports: PortAllocator,
    bind: IpAddr,
    guest_ssh_port: u16,
    policy: RestartPolicy,
}

impl<H, S, L> TunnelSupervisor<H, S, L>
where
    H: Hypervisor + 'static,
    S: Store,
    L: RelayLauncher,
{
    /// Creates a supervisor with default ports, listening on every
    /// interface.
    #[must_use]
    pub fn new(hypervisor: Arc<H>, store: Arc<S>, launcher: Arc<L>) -> Self {
        Self {
            hypervisor,
            store,
            launcher,
            ports: PortAllocator::new(DEFAULT_RELAY_BASE_PORT),
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            guest_ssh_port: DEFAULT_GUEST_SSH_PORT,
            policy: RestartPolicy::default(),
        }
    }

    /// Tries relay ports upward from `base`.
    #[must_use]
    pub fn with_base_port(mut self, base: u16) -> Self {
        self.ports = PortAllocator::new(base);
        self
    }

    /// Interface relays listen on.
    #[must_use]
    pub const fn with_bind(mut self, bind: IpAddr) -> Self {
        self.bind = bind;
        self
    }

    /// Guest port relays forward to.
    #[must_use]
    pub const fn with_guest_ssh_port(mut self, port: u16) -> Self {
        self.guest_ssh_port = port;
        self
    }

    /// Restart behaviour handed to every relay.
    #[must_use]
    pub const fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Port reservations held by this supervisor.
    #[must_use]
    pub const fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    /// Starts a relay for every addressed host of `name` that has none.
    ///
    /// Recorded relays whose process has exited, for instance after using
    /// up their restarts, are cleared and replaced.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError`] when the store fails, no port is free or a
    /// relay cannot be launched or checked. Relays started before the
    /// failure keep running and stay recorded.
    pub async fn start_tunnel(&self, name: &str) -> Result<Outcome<Vec<TunnelInfo>>, TunnelError> {
        let Some(deployment) = self.store.deployment_by_name(name)? else {
            info!(deployment = name, "no such deployment");
            return Ok(Outcome::NoSuchDeployment);
        };
        let active = self.live_tunnels(deployment.id).await?;

        let mut started = Vec::new();
        for host in self.store.hosts(deployment.id)? {
            if active.contains(&host.id) {
                debug!(vmname = %host.vmname, "relay already running");
                continue;
            }
            let Some(address) = self.lookup_address(&host.vmname).await else {
                warn!(vmname = %host.vmname, "host has no address; skipping relay");
                continue;
            };
            started.push(self.open(host, address).await?);
        }
        Ok(Outcome::Completed(started))
    }

    /// Stops every relay of `name`, returning how many were stopped.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError`] when a relay cannot be signalled or the
    /// store fails.
    pub async fn stop_tunnel(&self, name: &str) -> Result<Outcome<usize>, TunnelError> {
        let Some(deployment) = self.store.deployment_by_name(name)? else {
            info!(deployment = name, "no such deployment");
            return Ok(Outcome::NoSuchDeployment);
        };
        let tunnels = self.store.tunnels(deployment.id)?;
        Ok(Outcome::Completed(self.close_all(tunnels).await?))
    }

    /// Stops every recorded relay of every deployment.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError`] when a relay cannot be signalled or the
    /// store fails.
    pub async fn stop_all(&self) -> Result<usize, TunnelError> {
        let tunnels = self.store.all_tunnels()?;
        self.close_all(tunnels).await
    }

    /// Hosts of `deployment_id` with a running relay. Records of relays that
    /// are gone are dropped along the way.
    async fn live_tunnels(
        &self,
        deployment_id: RecordId,
    ) -> Result<BTreeSet<RecordId>, TunnelError> {
        let mut active = BTreeSet::new();
        let mut dropped = 0_usize;
        for tunnel in self.store.tunnels(deployment_id)? {
            let alive = match tunnel.process_id {
                Some(process_id) => self.launcher.is_running(process_id).await?,
                None => false,
            };
            if alive {
                active.insert(tunnel.host_id);
                continue;
            }
            warn!(
                process_id = ?tunnel.process_id,
                port = tunnel.listen_port,
                "relay is no longer running; replacing it"
            );
            self.discard(&tunnel)?;
            dropped += 1;
        }
        if dropped > 0 {
            self.store.commit()?;
        }
        Ok(active)
    }

    async fn lookup_address(&self, vmname: &str) -> Option<Ipv4Addr> {
        let hypervisor = Arc::clone(&self.hypervisor);
        let owned = vmname.to_owned();
        let lookup =
            tokio::task::spawn_blocking(move || Host::new(hypervisor.as_ref(), &owned).address())
                .await;
        match lookup {
            Ok(Ok(address)) => address,
            Ok(Err(err)) => {
                warn!(vmname, error = %err, "address lookup failed");
                None
            }
            Err(err) => {
                warn!(vmname, error = %err, "address lookup task failed");
                None
            }
        }
    }

    async fn open(&self, host: HostRecord, address: Ipv4Addr) -> Result<TunnelInfo, TunnelError> {
        let taken: BTreeSet<u16> = self
            .store
            .all_hosts()?
            .iter()
            .filter_map(|record| record.relay_port)
            .collect();
        let port = self.ports.reserve(&taken).await?;
        let opened = self.launch_for(host, address, port).await;
        if opened.is_err() {
            self.ports.release(port);
        }
        opened
    }

    async fn launch_for(
        &self,
        mut host: HostRecord,
        address: Ipv4Addr,
        port: u16,
    ) -> Result<TunnelInfo, TunnelError> {
        let mut tunnel = self.store.insert_tunnel(NewTunnel {
            deployment_id: host.deployment_id,
            host_id: host.id,
            listen_port: port,
        })?;
        let target = SocketAddr::from((address, self.guest_ssh_port));
        let spec = RelaySpec {
            bind: self.bind,
            listen_port: port,
            target,
            policy: self.policy,
        };
        let process_id = match self.launcher.launch(spec).await {
            Ok(process_id) => process_id,
            Err(err) => {
                self.forget(&tunnel);
                return Err(err);
            }
        };

        tunnel.process_id = Some(process_id);
        host.relay_port = Some(port);
        let recorded = self
            .store
            .update_tunnel(&tunnel)
            .and_then(|()| self.store.update_host(&host))
            .and_then(|()| self.store.commit());
        if let Err(err) = recorded {
            if let Err(kill) = self.launcher.terminate(process_id).await {
                warn!(process_id, error = %kill, "failed to stop unrecorded relay");
            }
            self.forget(&tunnel);
            return Err(err.into());
        }

        info!(vmname = %host.vmname, port, %target, process_id, "tunnel started");
        Ok(TunnelInfo {
            vmname: host.vmname,
            listen_port: port,
            target,
            process_id,
        })
    }

    fn forget(&self, tunnel: &TunnelRecord) {
        if let Err(err) = self.store.delete_tunnel(tunnel.id) {
            warn!(tunnel = %tunnel.id, error = %err, "failed to delete tunnel record");
        }
    }

    async fn close_all(&self, tunnels: Vec<TunnelRecord>) -> Result<usize, TunnelError> {
        let mut stopped = 0;
        for tunnel in tunnels {
            self.close(&tunnel).await?;
            stopped += 1;
        }
        if stopped > 0 {
            self.store.commit()?;
        }
        Ok(stopped)
    }

    async fn close(&self, tunnel: &TunnelRecord) -> Result<(), TunnelError> {
        if let Some(process_id) = tunnel.process_id {
            match self.launcher.terminate(process_id).await? {
                Termination::Stopped => info!(process_id, port = tunnel.listen_port, "tunnel stopped"),
                Termination::AlreadyStopped => {
                    debug!(process_id, port = tunnel.listen_port, "relay already gone");
                }
            }
        }
        self.discard(tunnel)
    }

    /// Deletes a tunnel record, clears its port from the host and releases
    /// the reservation.
    fn discard(&self, tunnel: &TunnelRecord) -> Result<(), TunnelError> {
        self.store.delete_tunnel(tunnel.id)?;
        let host = self
            .store
            .hosts(tunnel.deployment_id)?
            .into_iter()
            .find(|host| host.id == tunnel.host_id);
        if let Some(mut host) = host
            && host.relay_port == Some(tunnel.listen_port)
        {
            host.relay_port = None;
            self.store.update_host(&host)?;
        }
        self.ports.release(tunnel.listen_port);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Mutex, PoisonError};

    use super::*;
    use crate::hypervisor::{AdapterMode, AdapterSlot};
    use crate::store::{MemoryStore, NewHost};
    use crate::test_support::{FakeHypervisor, InProcessRelayLauncher};
    use crate::tunnel::LaunchFuture;

    #[derive(Debug, Default)]
    struct RecordingLauncher {
        launched: Mutex<Vec<RelaySpec>>,
        terminated: Mutex<Vec<u32>>,
        fail_launch: bool,
    }

    impl RelayLauncher for RecordingLauncher {
        fn launch(&self, spec: RelaySpec) -> LaunchFuture<'_, u32> {
            Box::pin(async move {
                if self.fail_launch {
                    return Err(TunnelError::Launch {
                        port: spec.listen_port,
                        message: String::from("scripted"),
                    });
                }
                let mut launched = self.launched.lock().unwrap_or_else(PoisonError::into_inner);
                launched.push(spec);
                Ok(9000 + u32::try_from(launched.len()).unwrap_or(0))
            })
        }

        fn terminate(&self, process_id: u32) -> LaunchFuture<'_, Termination> {
            Box::pin(async move {
                self.terminated
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(process_id);
                Ok(Termination::Stopped)
            })
        }

        fn is_running(&self, process_id: u32) -> LaunchFuture<'_, bool> {
            Box::pin(async move {
                let launched = self.launched.lock().unwrap_or_else(PoisonError::into_inner).len();
                let terminated = self.terminated.lock().unwrap_or_else(PoisonError::into_inner);
                let issued = process_id > 9000
                    && u32::try_from(launched).is_ok_and(|count| process_id <= 9000 + count);
                Ok(issued && !terminated.contains(&process_id))
            })
        }
    }

    fn seeded() -> (FakeHypervisor, Arc<MemoryStore>) {
        let hypervisor = FakeHypervisor::new();
        hypervisor.add_network("vboxnet0");
        let store = Arc::new(MemoryStore::new());
        let deployment = store.create_deployment("lab").expect("deployment");
        for (vmname, lease) in [("web-1", Some(101)), ("db-1", None)] {
            hypervisor.register_machine(vmname);
            let slot = AdapterSlot::new(1).expect("slot");
            hypervisor
                .configure_adapter(
                    vmname,
                    slot,
                    &AdapterMode::HostOnly {
                        network: String::from("vboxnet0"),
                    },
                )
                .expect("adapter");
            if let Some(octet) = lease {
                hypervisor.grant_lease(vmname, 1, Ipv4Addr::new(192, 168, 56, octet));
            }
            store
                .insert_host(NewHost {
                    vmname: vmname.to_owned(),
                    image: String::from("base"),
                    username: String::from("user"),
                    password: String::from("secret"),
                    deployment_id: deployment.id,
                })
                .expect("host");
        }
        (hypervisor, store)
    }

    fn free_base() -> u16 {
        let spare = std::net::TcpListener::bind("0.0.0.0:0").expect("spare bind");
        spare.local_addr().expect("spare addr").port()
    }

    #[tokio::test]
    async fn starts_relays_for_addressed_hosts_only() {
        let (hypervisor, store) = seeded();
        let launcher = Arc::new(RecordingLauncher::default());
        let supervisor = TunnelSupervisor::new(
            Arc::new(hypervisor),
            Arc::clone(&store),
            Arc::clone(&launcher),
        )
        .with_base_port(free_base());

        let Outcome::Completed(started) = supervisor.start_tunnel("lab").await.expect("start") else {
            panic!("deployment exists");
        };
        assert_eq!(started.len(), 1);
        let info = started.first().expect("one tunnel");
        assert_eq!(info.vmname, "web-1");
        assert_eq!(
            info.target,
            SocketAddr::from((Ipv4Addr::new(192, 168, 56, 101), 22))
        );

        let web = store.host_by_vmname("web-1").expect("lookup").expect("web-1");
        assert_eq!(web.relay_port, Some(info.listen_port));
        let tunnels = store.all_tunnels().expect("tunnels");
        assert_eq!(tunnels.len(), 1);
        assert_eq!(
            tunnels.first().and_then(|tunnel| tunnel.process_id),
            Some(info.process_id)
        );
        assert_eq!(store.commit_count(), 1);

        let again = supervisor.start_tunnel("lab").await.expect("restart");
        assert_eq!(again, Outcome::Completed(Vec::new()));
    }

    #[tokio::test]
    async fn failed_launch_leaves_no_record() {
        let (hypervisor, store) = seeded();
        let launcher = Arc::new(RecordingLauncher {
            fail_launch: true,
            ..RecordingLauncher::default()
        });
        let supervisor =
            TunnelSupervisor::new(Arc::new(hypervisor), Arc::clone(&store), launcher)
                .with_base_port(free_base());

        let err = supervisor
            .start_tunnel("lab")
            .await
            .expect_err("launch fails");
        assert!(matches!(err, TunnelError::Launch { .. }));
        assert!(store.all_tunnels().expect("tunnels").is_empty());
        assert!(supervisor.ports().reserved().is_empty());
    }

    #[tokio::test]
    async fn stop_terminates_and_clears_records() {
        let (hypervisor, store) = seeded();
        let launcher = Arc::new(RecordingLauncher::default());
        let supervisor = TunnelSupervisor::new(
            Arc::new(hypervisor),
            Arc::clone(&store),
            Arc::clone(&launcher),
        )
        .with_base_port(free_base());
        supervisor.start_tunnel("lab").await.expect("start");

        let stopped = supervisor.stop_tunnel("lab").await.expect("stop");
        assert_eq!(stopped, Outcome::Completed(1));
        assert_eq!(
            launcher
                .terminated
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            vec![9001]
        );
        assert!(store.all_tunnels().expect("tunnels").is_empty());
        let web = store.host_by_vmname("web-1").expect("lookup").expect("web-1");
        assert_eq!(web.relay_port, None);
        assert!(supervisor.ports().reserved().is_empty());
    }

    #[tokio::test]
    async fn stop_all_clears_relays_that_already_exited() {
        let (hypervisor, store) = seeded();
        let deployment = store
            .deployment_by_name("lab")
            .expect("lookup")
            .expect("lab");
        let mut web = store.host_by_vmname("web-1").expect("lookup").expect("web-1");
        let mut stale = store
            .insert_tunnel(NewTunnel {
                deployment_id: deployment.id,
                host_id: web.id,
                listen_port: 2001,
            })
            .expect("tunnel");
        stale.process_id = Some(31_337);
        store.update_tunnel(&stale).expect("pid");
        web.relay_port = Some(2001);
        store.update_host(&web).expect("relay port");

        let supervisor = TunnelSupervisor::new(
            Arc::new(hypervisor),
            Arc::clone(&store),
            Arc::new(InProcessRelayLauncher::new()),
        );
        assert_eq!(supervisor.stop_all().await.expect("stop all"), 1);
        assert!(store.all_tunnels().expect("tunnels").is_empty());
        let cleared = store.host_by_vmname("web-1").expect("lookup").expect("web-1");
        assert_eq!(cleared.relay_port, None);
    }

    #[tokio::test]
    async fn exited_relay_is_replaced_on_next_start() {
        let (hypervisor, store) = seeded();
        let deployment = store
            .deployment_by_name("lab")
            .expect("lookup")
            .expect("lab");
        let mut web = store.host_by_vmname("web-1").expect("lookup").expect("web-1");
        let mut exited = store
            .insert_tunnel(NewTunnel {
                deployment_id: deployment.id,
                host_id: web.id,
                listen_port: 2001,
            })
            .expect("tunnel");
        exited.process_id = Some(999_999);
        store.update_tunnel(&exited).expect("pid");
        web.relay_port = Some(2001);
        store.update_host(&web).expect("relay port");

        let launcher = Arc::new(RecordingLauncher::default());
        let supervisor = TunnelSupervisor::new(
            Arc::new(hypervisor),
            Arc::clone(&store),
            Arc::clone(&launcher),
        )
        .with_base_port(free_base());

        let started = supervisor
            .start_tunnel("lab")
            .await
            .expect("start")
            .completed()
            .expect("lab exists");
        let [replacement] = started.as_slice() else {
            panic!("expected one replacement relay, got {started:?}");
        };
        assert_eq!(replacement.vmname, "web-1");
        assert_eq!(replacement.process_id, 9001);
        assert!(
            launcher
                .terminated
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_empty(),
            "an exited relay is not signalled"
        );
        let tunnels = store.all_tunnels().expect("tunnels");
        assert_eq!(tunnels.len(), 1);
        assert!(tunnels.iter().all(|tunnel| tunnel.id != exited.id));
        let web = store.host_by_vmname("web-1").expect("lookup").expect("web-1");
        assert_eq!(web.relay_port, Some(replacement.listen_port));
    }

    #[tokio::test]
    async fn unknown_deployment_is_reported() {
        let (hypervisor, store) = seeded();
        let supervisor = TunnelSupervisor::new(
            Arc::new(hypervisor),
            store,
            Arc::new(RecordingLauncher::default()),
        );
        assert_eq!(
            supervisor.start_tunnel("missing").await.expect("lookup"),
            Outcome::NoSuchDeployment
        );
        assert_eq!(
            supervisor.stop_tunnel("missing").await.expect("lookup"),
            Outcome::NoSuchDeployment
        );
    }
}
