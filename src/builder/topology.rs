//! Declarative deployment descriptions.
//!
//! Every field is optional at the parsing stage so that missing values are
//! reported by the builder's validation, naming the entity they belong to.

use camino::{Utf8Path, Utf8PathBuf};
use ortho_config::toml;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::paths::read_optional;

/// A deployment to build.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Topology {
    /// Deployment identity.
    pub deployment: DeploymentDecl,
    /// Private networks in declaration order.
    pub networks: Vec<NetworkDecl>,
    /// Hosts in declaration order.
    pub hosts: Vec<HostDecl>,
}

/// Deployment section of a topology.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeploymentDecl {
    /// Unique deployment name.
    pub name: Option<String>,
}

/// A private host-only network.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkDecl {
    /// Label referenced by hosts.
    pub label: Option<String>,
    /// Host-side IPv4 address.
    pub address: Option<String>,
    /// First address handed out by the lease service.
    pub dhcp_lower: Option<String>,
    /// Last address handed out by the lease service.
    pub dhcp_upper: Option<String>,
}

/// A virtual machine.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostDecl {
    /// Unique machine name.
    pub vmname: Option<String>,
    /// Image to import.
    pub image: Option<String>,
    /// Guest login user.
    pub username: Option<String>,
    /// Guest login password.
    pub password: Option<String>,
    /// Labels of the networks to attach, one adapter each, in order.
    pub networks: Vec<String>,
    /// Internet-facing adapter. The private networks take the remaining
    /// slots in ascending order.
    pub internet: Option<InternetDecl>,
}

/// Internet access declaration.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct InternetDecl {
    /// How the adapter reaches the internet.
    pub mode: InternetMode,
    /// Physical interface for bridged mode; falls back to the configured
    /// default.
    #[serde(default)]
    pub bridge_interface: Option<String>,
    /// Adapter slot (1 to 8) for the internet interface; slot 1 when
    /// absent.
    #[serde(default)]
    pub adapter: Option<u8>,
}

/// Internet adapter mode.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InternetMode {
    /// Hypervisor NAT.
    Nat,
    /// Bridged onto a physical interface.
    Bridged,
}

/// Errors raised while reading a topology file.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum TopologyError {
    /// Raised when the file does not exist.
    #[error("topology {path} not found")]
    NotFound {
        /// Path looked up.
        path: Utf8PathBuf,
    },
    /// Raised when the file cannot be read.
    #[error("failed to read topology {path}: {message}")]
    Io {
        /// Path being read.
        path: Utf8PathBuf,
        /// Error description.
        message: String,
    },
    /// Raised when the contents are not a valid topology.
    #[error("failed to parse topology {path}: {message}")]
    Parse {
        /// Path being parsed.
        path: Utf8PathBuf,
        /// Parser message.
        message: String,
    },
    /// Raised for extensions other than `.toml` and `.json`.
    #[error("unsupported topology format for {path}; use .toml or .json")]
    UnsupportedFormat {
        /// Offending path.
        path: Utf8PathBuf,
    },
}

/// Serialisation format of a topology file.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TopologyFormat {
    /// TOML document.
    Toml,
    /// JSON document.
    Json,
}

impl TopologyFormat {
    /// Picks the format from the file extension. Files without an extension
    /// are read as TOML.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::UnsupportedFormat`] for other extensions.
    pub fn from_path(path: &Utf8Path) -> Result<Self, TopologyError> {
        match path.extension() {
            None | Some("toml") => Ok(Self::Toml),
            Some("json") => Ok(Self::Json),
            Some(_) => Err(TopologyError::UnsupportedFormat {
                path: path.to_path_buf(),
            }),
        }
    }
}

impl Topology {
    /// Reads and parses the topology at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError`] when the file is missing, unreadable, of an
    /// unknown format or malformed.
    pub fn load(path: &Utf8Path) -> Result<Self, TopologyError> {
        let format = TopologyFormat::from_path(path)?;
        let contents = read_optional(path)
            .map_err(|err| TopologyError::Io {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?
            .ok_or_else(|| TopologyError::NotFound {
                path: path.to_path_buf(),
            })?;
        Self::parse(path, &contents, format)
    }

    /// Parses `contents`; `path` only labels errors.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::Parse`] when the document is malformed.
    pub fn parse(
        path: &Utf8Path,
        contents: &str,
        format: TopologyFormat,
    ) -> Result<Self, TopologyError> {
        let parse_error = |message: String| TopologyError::Parse {
            path: path.to_path_buf(),
            message,
        };
        match format {
            TopologyFormat::Toml => {
                toml::from_str(contents).map_err(|err| parse_error(err.to_string()))
            }
            TopologyFormat::Json => {
                serde_json::from_str(contents).map_err(|err| parse_error(err.to_string()))
            }
        }
    }
}
