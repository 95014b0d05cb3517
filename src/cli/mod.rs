//! Command-line interface definitions for the `virtlab` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser, Subcommand};

/// Top-level CLI for the `virtlab` binary.
#[derive(Debug, Parser)]
#[command(
    name = "virtlab",
    about = "Build, run and expose private VirtualBox lab deployments",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Subcommands of the `virtlab` binary.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Create a deployment from a topology file.
    #[command(name = "build", about = "Create a deployment from a topology file")]
    Build(BuildCommand),
    /// Start every host of a deployment and wait for addresses.
    #[command(name = "start", about = "Start every host of a deployment")]
    Start(DeploymentArg),
    /// Power off every host of a deployment.
    #[command(name = "stop", about = "Power off every host of a deployment")]
    Stop(DeploymentArg),
    /// Power-cycle every host of a deployment.
    #[command(name = "restart", about = "Power-cycle every host of a deployment")]
    Restart(DeploymentArg),
    /// Stop tunnels, then delete every host and network of a deployment.
    #[command(name = "destroy", about = "Delete a deployment and its resources")]
    Destroy(DeploymentArg),
    /// List hosts of every deployment with their live status.
    #[command(name = "hosts", about = "List hosts with their live status")]
    Hosts,
    /// List networks of every deployment.
    #[command(name = "networks", about = "List networks of every deployment")]
    Networks,
    /// Manage the relays exposing guest SSH ports.
    #[command(name = "tunnel", about = "Manage relays exposing guest SSH ports")]
    Tunnel(TunnelCommand),
    /// Run a single relay in the foreground.
    #[command(name = "relay", hide = true)]
    Relay(RelayCommand),
}

/// Arguments for `virtlab build`.
#[derive(Debug, Args)]
pub(crate) struct BuildCommand {
    /// Topology file; relative names resolve under the template directory.
    #[arg(value_name = "TEMPLATE")]
    pub(crate) template: String,
}

/// Deployment targeted by a lifecycle subcommand.
#[derive(Debug, Args)]
pub(crate) struct DeploymentArg {
    /// Deployment name.
    #[arg(value_name = "DEPLOYMENT")]
    pub(crate) deployment: String,
}

/// Arguments for `virtlab tunnel`.
#[derive(Debug, Args)]
pub(crate) struct TunnelCommand {
    /// Tunnel action.
    #[command(subcommand)]
    pub(crate) action: TunnelAction,
}

/// Actions of `virtlab tunnel`.
#[derive(Debug, Subcommand)]
pub(crate) enum TunnelAction {
    /// Start relays for a deployment and hold until interrupted.
    #[command(name = "start", about = "Start relays and hold until Ctrl-C")]
    Start(DeploymentArg),
    /// Stop the relays of a deployment.
    #[command(name = "stop", about = "Stop the relays of a deployment")]
    Stop(DeploymentArg),
}

/// Arguments for the internal `virtlab relay` subcommand.
#[derive(Debug, Args)]
pub(crate) struct RelayCommand {
    /// Interface to listen on.
    #[arg(long, default_value = "0.0.0.0")]
    pub(crate) bind: String,
    /// Port to listen on.
    #[arg(long)]
    pub(crate) listen_port: u16,
    /// Guest address to forward to.
    #[arg(long)]
    pub(crate) target_host: String,
    /// Guest port to forward to.
    #[arg(long, default_value_t = 22)]
    pub(crate) target_port: u16,
    /// Consecutive listener failures tolerated before exiting.
    #[arg(long, default_value_t = 10)]
    pub(crate) max_restarts: u32,
    /// Delay before the first restart, in milliseconds.
    #[arg(long, default_value_t = 100)]
    pub(crate) initial_backoff_ms: u64,
    /// Upper bound on the delay between restarts, in milliseconds.
    #[arg(long, default_value_t = 5000)]
    pub(crate) max_backoff_ms: u64,
}
