//! Launching and terminating relay processes.

use std::ffi::OsString;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, info};

use super::{RestartPolicy, TunnelError};
use crate::command::{CommandOutput, CommandRunner, ProcessCommandRunner, render_command};

/// Prefix of the line a relay prints on stdout once it accepts clients.
pub const READY_PREFIX: &str = "relay listening on";

/// Default time allowed for a relay to report readiness.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default program used to signal relay processes.
pub const DEFAULT_KILL_BIN: &str = "kill";

/// Boxed future returned by [`RelayLauncher`] operations.
pub type LaunchFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TunnelError>> + Send + 'a>>;

/// Parameters of one relay.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RelaySpec {
    /// Interface the relay listens on.
    pub bind: IpAddr,
    /// Port the relay listens on.
    pub listen_port: u16,
    /// Guest endpoint every client is forwarded to.
    pub target: SocketAddr,
    /// Restart behaviour of the relay listener.
    pub policy: RestartPolicy,
}

/// Outcome of terminating a relay.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Termination {
    /// The relay was running and has been signalled.
    Stopped,
    /// No relay with that process id was running.
    AlreadyStopped,
}

/// Starts and stops relays on behalf of the tunnel supervisor.
pub trait RelayLauncher: Send + Sync {
    /// Starts a relay and resolves to its process id once it accepts
    /// clients.
    fn launch(&self, spec: RelaySpec) -> LaunchFuture<'_, u32>;

    /// Stops the relay identified by `process_id`.
    fn terminate(&self, process_id: u32) -> LaunchFuture<'_, Termination>;

    /// Whether the relay identified by `process_id` is still running.
    fn is_running(&self, process_id: u32) -> LaunchFuture<'_, bool>;
}

/// Line a relay prints once it listens on `addr`.
#[must_use]
pub fn ready_line(addr: SocketAddr) -> String {
    format!("{READY_PREFIX} {addr}")
}

/// Runs each relay as a separate `relay` subcommand of a program, by
/// default the running executable, and stops it with `kill`.
#[derive(Debug)]
pub struct ProcessRelayLauncher<R: CommandRunner = ProcessCommandRunner> {
    program: PathBuf,
    kill_bin: String,
    ready_timeout: Duration,
    runner: Arc<R>,
}

impl ProcessRelayLauncher<ProcessCommandRunner> {
    /// Launcher re-executing the current binary.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Launch`] when the executable path is unknown.
    pub fn for_current_exe(kill_bin: impl Into<String>) -> Result<Self, TunnelError> {
        let program = std::env::current_exe().map_err(|err| TunnelError::Launch {
            port: 0,
            message: format!("cannot locate current executable: {err}"),
        })?;
        Ok(Self::new(program, kill_bin, ProcessCommandRunner))
    }
}

impl<R: CommandRunner> ProcessRelayLauncher<R> {
    /// Creates a launcher running `program relay ...` and signalling with
    /// `kill_bin` through `runner`.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, kill_bin: impl Into<String>, runner: R) -> Self {
        Self {
            program: program.into(),
            kill_bin: kill_bin.into(),
            ready_timeout: DEFAULT_READY_TIMEOUT,
            runner: Arc::new(runner),
        }
    }

    /// Overrides the readiness deadline.
    #[must_use]
    pub const fn with_ready_timeout(mut self, ready_timeout: Duration) -> Self {
        self.ready_timeout = ready_timeout;
        self
    }

    async fn spawn_relay(&self, spec: RelaySpec) -> Result<u32, TunnelError> {
        let port = spec.listen_port;
        let launch_error = |message: String| TunnelError::Launch { port, message };

        let mut child = Command::new(&self.program)
            .args(relay_args(&spec))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|err| launch_error(format!("{}: {err}", self.program.display())))?;
        let Some(process_id) = child.id() else {
            return Err(launch_error(String::from("relay exited immediately")));
        };
        let Some(stdout) = child.stdout.take() else {
            abandon(&mut child);
            return Err(launch_error(String::from("relay stdout unavailable")));
        };

        let mut lines = BufReader::new(stdout).lines();
        let line = match timeout(self.ready_timeout, lines.next_line()).await {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => {
                abandon(&mut child);
                return Err(launch_error(String::from(
                    "relay exited before reporting readiness",
                )));
            }
            Ok(Err(err)) => {
                abandon(&mut child);
                return Err(launch_error(format!("reading relay output: {err}")));
            }
            Err(_) => {
                abandon(&mut child);
                return Err(TunnelError::ReadyTimeout {
                    port,
                    timeout: self.ready_timeout,
                });
            }
        };
        if !line.starts_with(READY_PREFIX) {
            abandon(&mut child);
            return Err(launch_error(format!("unexpected relay output: {line}")));
        }
        info!(process_id, port, target = %spec.target, "relay started");
        Ok(process_id)
    }
}

impl<R: CommandRunner + 'static> ProcessRelayLauncher<R> {
    /// Sends `signal` to `process_id` through the kill program.
    async fn signal(&self, signal: &str, process_id: u32) -> Result<CommandOutput, TunnelError> {
        let runner = Arc::clone(&self.runner);
        let program = self.kill_bin.clone();
        let args = vec![OsString::from(signal), OsString::from(process_id.to_string())];
        debug!(command = %render_command(&program, &args), "signalling relay");
        let output = tokio::task::spawn_blocking(move || runner.run(&program, &args))
            .await
            .map_err(|err| TunnelError::Join(err.to_string()))??;
        Ok(output)
    }
}

impl<R: CommandRunner + 'static> RelayLauncher for ProcessRelayLauncher<R> {
    fn launch(&self, spec: RelaySpec) -> LaunchFuture<'_, u32> {
        Box::pin(self.spawn_relay(spec))
    }

    fn terminate(&self, process_id: u32) -> LaunchFuture<'_, Termination> {
        Box::pin(async move {
            let output = self.signal("-TERM", process_id).await?;
            if output.is_success() {
                return Ok(Termination::Stopped);
            }
            if output.stderr.contains("No such process") {
                return Ok(Termination::AlreadyStopped);
            }
            Err(TunnelError::Terminate {
                process_id,
                message: format!(
                    "exit status {}: {}",
                    output.status_text(),
                    output.stderr.trim()
                ),
            })
        })
    }

    fn is_running(&self, process_id: u32) -> LaunchFuture<'_, bool> {
        Box::pin(async move {
            let output = self.signal("-0", process_id).await?;
            if output.is_success() || output.stderr.contains("Operation not permitted") {
                return Ok(true);
            }
            if output.stderr.contains("No such process") {
                return Ok(false);
            }
            Err(TunnelError::Liveness {
                process_id,
                message: format!(
                    "exit status {}: {}",
                    output.status_text(),
                    output.stderr.trim()
                ),
            })
        })
    }
}

fn relay_args(spec: &RelaySpec) -> Vec<OsString> {
    let policy = spec.policy;
    [
        String::from("relay"),
        String::from("--bind"),
        spec.bind.to_string(),
        String::from("--listen-port"),
        spec.listen_port.to_string(),
        String::from("--target-host"),
        spec.target.ip().to_string(),
        String::from("--target-port"),
        spec.target.port().to_string(),
        String::from("--max-restarts"),
        policy.max_restarts.to_string(),
        String::from("--initial-backoff-ms"),
        millis(policy.initial_backoff).to_string(),
        String::from("--max-backoff-ms"),
        millis(policy.max_backoff).to_string(),
    ]
    .into_iter()
    .map(OsString::from)
    .collect()
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn abandon(child: &mut Child) {
    if let Err(err) = child.start_kill() {
        debug!(error = %err, "failed to kill relay that never became ready");
    }
}
