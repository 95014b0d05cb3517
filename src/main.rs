//! Binary entry point for the virtlab CLI.

use std::io::{self, Write};
use std::net::{IpAddr, SocketAddr};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use tokio::{signal, task};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use virtlab::builder::{BuildError, BuildSummary, Builder, Topology, TopologyError};
use virtlab::config::{ConfigError, VirtlabConfig};
use virtlab::orchestrator::{
    HostDetails, NetworkDetails, Orchestrator, OrchestratorError, Outcome, PollReport,
};
use virtlab::paths::resolve_under;
use virtlab::store::{JsonFileStore, StoreError};
use virtlab::tunnel::{
    ProcessRelayLauncher, RelayError, RelayServer, RestartPolicy, TunnelError, TunnelInfo,
    TunnelSupervisor, ready_line,
};
use virtlab::{KnownHosts, ProcessCommandRunner, VirtualBox};

mod cli;

use cli::{Cli, Command, RelayCommand, TunnelAction};

type Vbox = VirtualBox<ProcessCommandRunner>;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error(transparent)]
    Build(Box<BuildError>),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid argument {flag}: {value}")]
    InvalidArgument { flag: &'static str, value: String },
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
    #[error("background task failed: {0}")]
    Join(String),
}

impl From<BuildError> for CliError {
    fn from(value: BuildError) -> Self {
        Self::Build(Box::new(value))
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli.command).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn dispatch(command: Command) -> Result<(), CliError> {
    if let Command::Relay(args) = &command {
        return run_relay(args).await;
    }

    let app = App::load()?;
    match command {
        Command::Build(args) => app.build(&args.template).await,
        Command::Start(args) => {
            let outcome = app.orchestrator().start(&args.deployment).await?;
            report(&args.deployment, outcome, |report| write_poll_report(&report))
        }
        Command::Stop(args) => {
            let outcome = app.orchestrator().stop(&args.deployment).await?;
            report(&args.deployment, outcome, |()| {
                announce(&format!("stopped deployment {}", args.deployment))
            })
        }
        Command::Restart(args) => {
            let outcome = app.orchestrator().restart(&args.deployment).await?;
            report(&args.deployment, outcome, |()| {
                announce(&format!("restarted deployment {}", args.deployment))
            })
        }
        Command::Destroy(args) => app.destroy(&args.deployment).await,
        Command::Hosts => {
            let details = app.orchestrator().host_details().await?;
            write_stdout(&render_hosts(&details))
        }
        Command::Networks => {
            let details = app.orchestrator().network_details().await?;
            write_stdout(&render_networks(&details))
        }
        Command::Tunnel(tunnel) => match tunnel.action {
            TunnelAction::Start(args) => app.hold_tunnels(&args.deployment).await,
            TunnelAction::Stop(args) => {
                let outcome = app.supervisor()?.stop_tunnel(&args.deployment).await?;
                report(&args.deployment, outcome, |stopped| {
                    announce(&format!("stopped {stopped} relay(s)"))
                })
            }
        },
        Command::Relay(args) => run_relay(&args).await,
    }
}

struct App {
    config: VirtlabConfig,
    hypervisor: Arc<Vbox>,
    store: Arc<JsonFileStore>,
}

impl App {
    fn load() -> Result<Self, CliError> {
        let config = VirtlabConfig::load_without_cli_args()?;
        config.validate()?;
        let config_dir = config.vbox_config_dir().ok_or_else(|| {
            ConfigError::MissingField(String::from(
                "VirtualBox config directory: set VIRTLAB_VBOX_CONFIG_DIR or add \
                 vbox_config_dir to virtlab.toml",
            ))
        })?;
        let hypervisor = Arc::new(VirtualBox::with_process_runner(
            config.vboxmanage_bin.clone(),
            config_dir,
        ));
        let store = Arc::new(JsonFileStore::open(config.store_path())?);
        Ok(Self {
            config,
            hypervisor,
            store,
        })
    }

    fn orchestrator(&self) -> Orchestrator<Vbox, JsonFileStore> {
        Orchestrator::new(Arc::clone(&self.hypervisor), Arc::clone(&self.store))
            .with_ip_poll_timeout(self.config.ip_poll_timeout())
            .with_poll_interval(self.config.ip_poll_interval())
            .with_max_parallelism(self.config.max_parallelism)
            .with_known_hosts(KnownHosts::new(self.config.known_hosts_path()))
    }

    fn supervisor(
        &self,
    ) -> Result<TunnelSupervisor<Vbox, JsonFileStore, ProcessRelayLauncher>, CliError> {
        let launcher = ProcessRelayLauncher::for_current_exe(self.config.kill_bin.clone())?;
        Ok(TunnelSupervisor::new(
            Arc::clone(&self.hypervisor),
            Arc::clone(&self.store),
            Arc::new(launcher),
        )
        .with_base_port(self.config.relay_base_port)
        .with_bind(self.config.relay_bind()?)
        .with_guest_ssh_port(self.config.guest_ssh_port)
        .with_restart_policy(self.config.restart_policy()))
    }

    async fn build(&self, template: &str) -> Result<(), CliError> {
        let path = resolve_under(&self.config.template_dir(), template);
        let builder = Builder::new(Arc::clone(&self.hypervisor), Arc::clone(&self.store))
            .with_default_bridge(self.config.bridge_interface.clone());
        let summary = task::spawn_blocking(move || -> Result<BuildSummary, CliError> {
            let topology = Topology::load(&path)?;
            Ok(builder.build(&topology)?)
        })
        .await
        .map_err(|err| CliError::Join(err.to_string()))??;
        write_stdout(&render_summary(&summary))
    }

    async fn destroy(&self, deployment: &str) -> Result<(), CliError> {
        if let Outcome::Completed(stopped) = self.supervisor()?.stop_tunnel(deployment).await?
            && stopped > 0
        {
            info!(deployment, stopped, "stopped relays before destroy");
        }
        let outcome = self.orchestrator().destroy(deployment).await?;
        report(deployment, outcome, |destroyed| {
            announce(&format!(
                "destroyed deployment {deployment}: {} host(s), {} network(s)",
                destroyed.hosts_destroyed, destroyed.networks_destroyed
            ))
        })
    }

    async fn hold_tunnels(&self, deployment: &str) -> Result<(), CliError> {
        let supervisor = self.supervisor()?;
        let Outcome::Completed(started) = supervisor.start_tunnel(deployment).await? else {
            return no_such_deployment(deployment);
        };
        write_stdout(&render_tunnels(&started))?;
        if started.is_empty() {
            return announce("no relays started");
        }

        info!(deployment, "relays running; press Ctrl-C to stop");
        let waited = signal::ctrl_c().await;
        let stopped = supervisor.stop_tunnel(deployment).await?;
        if let Outcome::Completed(count) = stopped {
            info!(deployment, stopped = count, "relays stopped");
        }
        waited.map_err(CliError::from)
    }
}

async fn run_relay(args: &RelayCommand) -> Result<(), CliError> {
    let bind = parse_ip("--bind", &args.bind)?;
    let target_host = parse_ip("--target-host", &args.target_host)?;
    let policy = RestartPolicy {
        max_restarts: args.max_restarts,
        initial_backoff: Duration::from_millis(args.initial_backoff_ms),
        max_backoff: Duration::from_millis(args.max_backoff_ms),
    };
    let server = RelayServer::new(
        SocketAddr::new(bind, args.listen_port),
        SocketAddr::new(target_host, args.target_port),
        policy,
    );

    let shutdown = server.shutdown_token();
    let interrupt = tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            shutdown.cancel();
        }
    });

    let mut announced = false;
    let result = server
        .run(move |addr| {
            if announced {
                return;
            }
            announced = true;
            if let Err(err) = write_stdout(&format!("{}\n", ready_line(addr))) {
                warn!(error = %err, "failed to report readiness");
            }
        })
        .await;
    interrupt.abort();
    result.map_err(CliError::from)
}

fn parse_ip(flag: &'static str, value: &str) -> Result<IpAddr, CliError> {
    value.parse().map_err(|_| CliError::InvalidArgument {
        flag,
        value: value.to_owned(),
    })
}

fn report<T>(
    deployment: &str,
    outcome: Outcome<T>,
    on_completed: impl FnOnce(T) -> Result<(), CliError>,
) -> Result<(), CliError> {
    match outcome {
        Outcome::Completed(value) => on_completed(value),
        Outcome::NoSuchDeployment => no_such_deployment(deployment),
    }
}

fn no_such_deployment(deployment: &str) -> Result<(), CliError> {
    announce(&format!("no deployment named {deployment}"))
}

fn announce(message: &str) -> Result<(), CliError> {
    write_stdout(&format!("{message}\n"))
}

fn write_stdout(text: &str) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    stdout.write_all(text.as_bytes())?;
    stdout.flush()?;
    Ok(())
}

fn write_poll_report(report: &PollReport) -> Result<(), CliError> {
    write_stdout(&render_poll_report(report))
}

fn render_poll_report(report: &PollReport) -> String {
    let rows: Vec<Vec<String>> = report
        .resolved
        .iter()
        .map(|(vmname, address)| vec![vmname.clone(), address.to_string()])
        .chain(
            report
                .unresolved
                .iter()
                .map(|vmname| vec![vmname.clone(), String::from("-")]),
        )
        .collect();
    render_table(&["VMNAME", "ADDRESS"], &rows)
}

fn render_summary(summary: &BuildSummary) -> String {
    let mut out = format!(
        "built deployment {}: {} network(s), {} host(s)\n",
        summary.deployment,
        summary.networks.len(),
        summary.hosts.len()
    );
    let rows: Vec<Vec<String>> = summary
        .networks
        .iter()
        .map(|network| vec![network.label.clone(), network.assigned_name.clone()])
        .collect();
    if !rows.is_empty() {
        out.push_str(&render_table(&["LABEL", "NETWORK"], &rows));
    }
    out
}

fn render_hosts(details: &[HostDetails]) -> String {
    let rows: Vec<Vec<String>> = details
        .iter()
        .map(|host| {
            let (state, address) = host.properties.as_ref().map_or_else(
                || (String::from("unknown"), String::from("-")),
                |properties| {
                    (
                        properties.state.to_string(),
                        optional(properties.address()),
                    )
                },
            );
            vec![
                host.deployment.clone(),
                host.vmname.clone(),
                state,
                address,
                optional(host.relay_port),
            ]
        })
        .collect();
    render_table(
        &["DEPLOYMENT", "VMNAME", "STATE", "ADDRESS", "RELAY"],
        &rows,
    )
}

fn render_networks(details: &[NetworkDetails]) -> String {
    let rows: Vec<Vec<String>> = details
        .iter()
        .map(|network| {
            vec![
                network.deployment.clone(),
                network.label.clone(),
                network
                    .assigned_name
                    .clone()
                    .unwrap_or_else(|| String::from("-")),
                optional(network.address),
                format!("{}-{}", network.dhcp_lower, network.dhcp_upper),
                String::from(if network.present { "yes" } else { "no" }),
            ]
        })
        .collect();
    render_table(
        &["DEPLOYMENT", "LABEL", "NETWORK", "ADDRESS", "DHCP", "PRESENT"],
        &rows,
    )
}

fn render_tunnels(tunnels: &[TunnelInfo]) -> String {
    let rows: Vec<Vec<String>> = tunnels
        .iter()
        .map(|tunnel| {
            vec![
                tunnel.vmname.clone(),
                tunnel.listen_port.to_string(),
                tunnel.target.to_string(),
                tunnel.process_id.to_string(),
            ]
        })
        .collect();
    render_table(&["VMNAME", "PORT", "TARGET", "PID"], &rows)
}

fn optional<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| String::from("-"), |inner| inner.to_string())
}

/// Left-aligns every column to its widest cell, two spaces apart.
fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|header| header.len()).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let header_row: Vec<String> = headers.iter().map(|header| (*header).to_owned()).collect();
    let mut out = String::new();
    for row in std::iter::once(&header_row).chain(rows) {
        let line = row
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!("{cell:<width$}"))
            .collect::<Vec<_>>()
            .join("  ");
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::net::Ipv4Addr;

    use super::*;
    use rstest::rstest;

    #[test]
    fn tables_align_columns() {
        let rendered = render_table(
            &["VMNAME", "ADDRESS"],
            &[
                vec![String::from("web-1"), String::from("192.168.56.101")],
                vec![String::from("database"), String::from("-")],
            ],
        );
        assert_eq!(
            rendered,
            "VMNAME    ADDRESS\nweb-1     192.168.56.101\ndatabase  -\n"
        );
    }

    #[test]
    fn poll_report_lists_unresolved_hosts() {
        let report = PollReport {
            resolved: BTreeMap::from([(String::from("web-1"), Ipv4Addr::new(10, 0, 0, 5))]),
            unresolved: vec![String::from("web-2")],
        };
        assert_eq!(
            render_poll_report(&report),
            "VMNAME  ADDRESS\nweb-1   10.0.0.5\nweb-2   -\n"
        );
    }

    #[rstest]
    #[case("--bind", "0.0.0.0", true)]
    #[case("--target-host", "192.168.56.101", true)]
    #[case("--target-host", "web-1", false)]
    fn relay_addresses_must_be_ip_literals(
        #[case] flag: &'static str,
        #[case] value: &str,
        #[case] valid: bool,
    ) {
        assert_eq!(parse_ip(flag, value).is_ok(), valid);
    }

    #[test]
    fn write_error_writes_cli_error() {
        let mut buf = Vec::new();
        let err = CliError::InvalidArgument {
            flag: "--bind",
            value: String::from("nowhere"),
        };
        write_error(&mut buf, &err);
        let rendered = String::from_utf8(buf).expect("utf8");
        assert_eq!(rendered, "invalid argument --bind: nowhere\n");
    }
}
