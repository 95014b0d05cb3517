//! Configuration loading via `ortho-config`.

use std::net::IpAddr;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::hypervisor::{DEFAULT_VBOXMANAGE_BIN, default_vbox_config_dir};
use crate::paths::expand_tilde;
use crate::tunnel::{DEFAULT_GUEST_SSH_PORT, DEFAULT_KILL_BIN, DEFAULT_RELAY_BASE_PORT, RestartPolicy};

/// Default location of the JSON state file.
pub const DEFAULT_STORE_PATH: &str = "~/.virtlab/state.json";

/// Default directory topology names are resolved against.
pub const DEFAULT_TEMPLATE_DIR: &str = "~/.virtlab/templates";

/// Default SSH known hosts file scrubbed when hosts are destroyed.
pub const DEFAULT_KNOWN_HOSTS_FILE: &str = "~/.ssh/known_hosts";

/// Default interface relays listen on.
pub const DEFAULT_RELAY_BIND_ADDRESS: &str = "0.0.0.0";

/// Settings merged from defaults, `virtlab.toml` and `VIRTLAB_*`
/// environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "VIRTLAB",
    discovery(
        app_name = "virtlab",
        env_var = "VIRTLAB_CONFIG_PATH",
        config_file_name = "virtlab.toml",
        dotfile_name = ".virtlab.toml",
        project_file_name = "virtlab.toml"
    )
)]
pub struct VirtlabConfig {
    /// Path to the `VBoxManage` executable.
    #[ortho_config(default = DEFAULT_VBOXMANAGE_BIN.to_owned())]
    pub vboxmanage_bin: String,
    /// VirtualBox configuration directory holding lease files. Defaults to
    /// the platform location under `$HOME`.
    pub vbox_config_dir: Option<String>,
    /// JSON state file. Supports `~/`.
    #[ortho_config(default = DEFAULT_STORE_PATH.to_owned())]
    pub store_path: String,
    /// Directory relative topology names are resolved against.
    #[ortho_config(default = DEFAULT_TEMPLATE_DIR.to_owned())]
    pub template_dir: String,
    /// First port tried for relays.
    #[ortho_config(default = DEFAULT_RELAY_BASE_PORT)]
    pub relay_base_port: u16,
    /// Interface relays listen on.
    #[ortho_config(default = DEFAULT_RELAY_BIND_ADDRESS.to_owned())]
    pub relay_bind_address: String,
    /// Guest port relays forward to.
    #[ortho_config(default = DEFAULT_GUEST_SSH_PORT)]
    pub guest_ssh_port: u16,
    /// Seconds to wait for started hosts to obtain an address.
    #[ortho_config(default = 30)]
    pub ip_poll_timeout_secs: u64,
    /// Seconds between address polls.
    #[ortho_config(default = 1)]
    pub ip_poll_interval_secs: u64,
    /// Upper bound on concurrent per-host operations.
    pub max_parallelism: Option<usize>,
    /// Consecutive relay crashes tolerated before a relay exits.
    #[ortho_config(default = 10)]
    pub relay_max_restarts: u32,
    /// Delay before the first relay restart, in milliseconds.
    #[ortho_config(default = 100)]
    pub relay_initial_backoff_ms: u64,
    /// Upper bound on the delay between relay restarts, in milliseconds.
    #[ortho_config(default = 5000)]
    pub relay_max_backoff_ms: u64,
    /// SSH known hosts file scrubbed when hosts are destroyed.
    #[ortho_config(default = DEFAULT_KNOWN_HOSTS_FILE.to_owned())]
    pub known_hosts_file: String,
    /// Interface bridged hosts use when their topology names none.
    pub bridge_interface: Option<String>,
    /// Program used to signal relay processes.
    #[ortho_config(default = DEFAULT_KILL_BIN.to_owned())]
    pub kill_bin: String,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn guidance(&self) -> String {
        format!(
            "set {} or add {} to virtlab.toml",
            self.env_var, self.toml_key
        )
    }
}

impl VirtlabConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: {}",
                metadata.description,
                metadata.guidance()
            )));
        }
        Ok(())
    }

    fn require_optional(value: Option<&str>, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        value.map_or(Ok(()), |present| Self::require_field(present, metadata))
    }

    fn require_positive(value: u64, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value == 0 {
            return Err(ConfigError::Invalid(format!(
                "{} must be greater than zero: {}",
                metadata.description,
                metadata.guidance()
            )));
        }
        Ok(())
    }

    /// Loads configuration using the `ortho-config` derive. Values merge
    /// defaults, configuration files, environment variables, and CLI flags in
    /// that order of precedence.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the loader fails to merge sources.
    pub fn load_from_sources() -> Result<Self, ConfigError> {
        Self::load().map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("virtlab")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and configuration key that fix the problem.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] for blank values and
    /// [`ConfigError::Invalid`] for out-of-range ones.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(
            &self.vboxmanage_bin,
            &FieldMetadata::new("VBoxManage path", "VIRTLAB_VBOXMANAGE_BIN", "vboxmanage_bin"),
        )?;
        Self::require_optional(
            self.vbox_config_dir.as_deref(),
            &FieldMetadata::new(
                "VirtualBox config directory",
                "VIRTLAB_VBOX_CONFIG_DIR",
                "vbox_config_dir",
            ),
        )?;
        Self::require_field(
            &self.store_path,
            &FieldMetadata::new("state file path", "VIRTLAB_STORE_PATH", "store_path"),
        )?;
        Self::require_field(
            &self.template_dir,
            &FieldMetadata::new("template directory", "VIRTLAB_TEMPLATE_DIR", "template_dir"),
        )?;
        Self::require_field(
            &self.known_hosts_file,
            &FieldMetadata::new(
                "known hosts file",
                "VIRTLAB_KNOWN_HOSTS_FILE",
                "known_hosts_file",
            ),
        )?;
        Self::require_optional(
            self.bridge_interface.as_deref(),
            &FieldMetadata::new(
                "bridge interface",
                "VIRTLAB_BRIDGE_INTERFACE",
                "bridge_interface",
            ),
        )?;
        Self::require_field(
            &self.kill_bin,
            &FieldMetadata::new("kill path", "VIRTLAB_KILL_BIN", "kill_bin"),
        )?;
        self.relay_bind()?;
        Self::require_positive(
            u64::from(self.relay_base_port),
            &FieldMetadata::new("relay base port", "VIRTLAB_RELAY_BASE_PORT", "relay_base_port"),
        )?;
        Self::require_positive(
            u64::from(self.guest_ssh_port),
            &FieldMetadata::new("guest SSH port", "VIRTLAB_GUEST_SSH_PORT", "guest_ssh_port"),
        )?;
        Self::require_positive(
            self.ip_poll_interval_secs,
            &FieldMetadata::new(
                "address poll interval",
                "VIRTLAB_IP_POLL_INTERVAL_SECS",
                "ip_poll_interval_secs",
            ),
        )?;
        Self::require_positive(
            self.relay_initial_backoff_ms,
            &FieldMetadata::new(
                "initial relay backoff",
                "VIRTLAB_RELAY_INITIAL_BACKOFF_MS",
                "relay_initial_backoff_ms",
            ),
        )?;
        if let Some(cap) = self.max_parallelism {
            Self::require_positive(
                u64::try_from(cap).unwrap_or(u64::MAX),
                &FieldMetadata::new(
                    "parallelism cap",
                    "VIRTLAB_MAX_PARALLELISM",
                    "max_parallelism",
                ),
            )?;
        }
        if self.relay_max_backoff_ms < self.relay_initial_backoff_ms {
            return Err(ConfigError::Invalid(format!(
                "maximum relay backoff ({} ms) is below the initial backoff ({} ms): {}",
                self.relay_max_backoff_ms,
                self.relay_initial_backoff_ms,
                FieldMetadata::new(
                    "maximum relay backoff",
                    "VIRTLAB_RELAY_MAX_BACKOFF_MS",
                    "relay_max_backoff_ms",
                )
                .guidance()
            )));
        }
        Ok(())
    }

    /// State file with `~/` expanded.
    #[must_use]
    pub fn store_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(expand_tilde(&self.store_path))
    }

    /// Template directory with `~/` expanded.
    #[must_use]
    pub fn template_dir(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(expand_tilde(&self.template_dir))
    }

    /// Known hosts file with `~/` expanded.
    #[must_use]
    pub fn known_hosts_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(expand_tilde(&self.known_hosts_file))
    }

    /// Configured VirtualBox directory, or the platform default when `HOME`
    /// is known.
    #[must_use]
    pub fn vbox_config_dir(&self) -> Option<Utf8PathBuf> {
        self.vbox_config_dir
            .as_deref()
            .map(|dir| Utf8PathBuf::from(expand_tilde(dir)))
            .or_else(default_vbox_config_dir)
    }

    /// Address poll deadline.
    #[must_use]
    pub const fn ip_poll_timeout(&self) -> Duration {
        Duration::from_secs(self.ip_poll_timeout_secs)
    }

    /// Interval between address polls.
    #[must_use]
    pub const fn ip_poll_interval(&self) -> Duration {
        Duration::from_secs(self.ip_poll_interval_secs)
    }

    /// Restart policy handed to relays.
    #[must_use]
    pub const fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            max_restarts: self.relay_max_restarts,
            initial_backoff: Duration::from_millis(self.relay_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.relay_max_backoff_ms),
        }
    }

    /// Interface relays listen on.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the value is not an IP address.
    pub fn relay_bind(&self) -> Result<IpAddr, ConfigError> {
        self.relay_bind_address.trim().parse().map_err(|_| {
            ConfigError::Invalid(format!(
                "relay bind address {:?} is not an IP address: {}",
                self.relay_bind_address,
                FieldMetadata::new(
                    "relay bind address",
                    "VIRTLAB_RELAY_BIND_ADDRESS",
                    "relay_bind_address",
                )
                .guidance()
            ))
        })
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a configuration value is out of range or malformed.
    #[error("invalid configuration value: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
