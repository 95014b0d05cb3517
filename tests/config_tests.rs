//! Tests for configuration defaults, loading and validation.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use rstest::*;
use virtlab::config::{ConfigError, VirtlabConfig};
use virtlab::test_support::EnvGuard;
use virtlab::tunnel::RestartPolicy;

#[fixture]
fn valid_config() -> VirtlabConfig {
    VirtlabConfig {
        vboxmanage_bin: String::from("VBoxManage"),
        vbox_config_dir: Some(String::from("/srv/vbox")),
        store_path: String::from("/srv/virtlab/state.json"),
        template_dir: String::from("/srv/virtlab/templates"),
        relay_base_port: 2000,
        relay_bind_address: String::from("0.0.0.0"),
        guest_ssh_port: 22,
        ip_poll_timeout_secs: 30,
        ip_poll_interval_secs: 1,
        max_parallelism: None,
        relay_max_restarts: 10,
        relay_initial_backoff_ms: 100,
        relay_max_backoff_ms: 5000,
        known_hosts_file: String::from("/home/lab/.ssh/known_hosts"),
        bridge_interface: None,
        kill_bin: String::from("kill"),
    }
}

#[rstest]
fn valid_config_passes_validation(valid_config: VirtlabConfig) {
    valid_config
        .validate()
        .unwrap_or_else(|err| panic!("config should validate: {err}"));
}

/// Each broken field is reported with the environment variable and the
/// `virtlab.toml` key that fix it.
#[rstest]
#[case::blank_vboxmanage(|cfg: &mut VirtlabConfig| cfg.vboxmanage_bin.clear(), "VIRTLAB_VBOXMANAGE_BIN", "vboxmanage_bin")]
#[case::blank_store(|cfg: &mut VirtlabConfig| cfg.store_path.clear(), "VIRTLAB_STORE_PATH", "store_path")]
#[case::blank_templates(|cfg: &mut VirtlabConfig| cfg.template_dir = String::from("  "), "VIRTLAB_TEMPLATE_DIR", "template_dir")]
#[case::blank_known_hosts(|cfg: &mut VirtlabConfig| cfg.known_hosts_file.clear(), "VIRTLAB_KNOWN_HOSTS_FILE", "known_hosts_file")]
#[case::blank_bridge(|cfg: &mut VirtlabConfig| cfg.bridge_interface = Some(String::new()), "VIRTLAB_BRIDGE_INTERFACE", "bridge_interface")]
#[case::zero_base_port(|cfg: &mut VirtlabConfig| cfg.relay_base_port = 0, "VIRTLAB_RELAY_BASE_PORT", "relay_base_port")]
#[case::zero_interval(|cfg: &mut VirtlabConfig| cfg.ip_poll_interval_secs = 0, "VIRTLAB_IP_POLL_INTERVAL_SECS", "ip_poll_interval_secs")]
#[case::zero_parallelism(|cfg: &mut VirtlabConfig| cfg.max_parallelism = Some(0), "VIRTLAB_MAX_PARALLELISM", "max_parallelism")]
#[case::bad_bind(|cfg: &mut VirtlabConfig| cfg.relay_bind_address = String::from("everywhere"), "VIRTLAB_RELAY_BIND_ADDRESS", "relay_bind_address")]
#[case::inverted_backoff(|cfg: &mut VirtlabConfig| cfg.relay_max_backoff_ms = 10, "VIRTLAB_RELAY_MAX_BACKOFF_MS", "relay_max_backoff_ms")]
fn validation_errors_are_actionable(
    valid_config: VirtlabConfig,
    #[case] mutate: fn(&mut VirtlabConfig),
    #[case] env_var: &str,
    #[case] toml_key: &str,
) {
    let mut cfg = valid_config;
    mutate(&mut cfg);

    let error = cfg.validate().expect_err("validation should fail");
    let message = error.to_string();
    assert!(
        message.contains(env_var),
        "error should mention env var {env_var}: {message}"
    );
    assert!(
        message.contains("virtlab.toml"),
        "error should mention config file: {message}"
    );
    assert!(
        message.contains(toml_key),
        "error should mention TOML key {toml_key}: {message}"
    );
}

#[rstest]
fn blank_fields_are_missing_rather_than_invalid(valid_config: VirtlabConfig) {
    let cfg = VirtlabConfig {
        store_path: String::new(),
        ..valid_config
    };
    let error = cfg.validate().expect_err("store path is required");
    assert!(
        matches!(error, ConfigError::MissingField(_)),
        "unexpected error: {error}"
    );
}

#[rstest]
fn accessors_expose_typed_values(valid_config: VirtlabConfig) {
    let cfg = VirtlabConfig {
        relay_bind_address: String::from("127.0.0.1"),
        ip_poll_timeout_secs: 12,
        relay_max_restarts: 4,
        relay_initial_backoff_ms: 50,
        relay_max_backoff_ms: 800,
        ..valid_config
    };

    assert_eq!(cfg.ip_poll_timeout(), Duration::from_secs(12));
    assert_eq!(cfg.ip_poll_interval(), Duration::from_secs(1));
    assert_eq!(
        cfg.relay_bind().expect("bind address parses"),
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    );
    assert_eq!(
        cfg.restart_policy(),
        RestartPolicy {
            max_restarts: 4,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(800),
        }
    );
    assert_eq!(cfg.store_path().as_str(), "/srv/virtlab/state.json");
    assert_eq!(
        cfg.vbox_config_dir().map(|dir| dir.into_string()),
        Some(String::from("/srv/vbox"))
    );
}

#[tokio::test]
async fn tilde_paths_expand_against_home() {
    let _guard = EnvGuard::set_vars(&[("HOME", "/home/lab")]).await;
    let cfg = VirtlabConfig {
        store_path: String::from("~/.virtlab/state.json"),
        vbox_config_dir: Some(String::from("~/vbox")),
        ..valid_config()
    };

    assert_eq!(cfg.store_path().as_str(), "/home/lab/.virtlab/state.json");
    assert_eq!(
        cfg.vbox_config_dir().map(|dir| dir.into_string()),
        Some(String::from("/home/lab/vbox"))
    );
}

#[tokio::test]
async fn environment_overrides_merge_with_defaults() {
    let _guard = EnvGuard::set_vars(&[("VIRTLAB_RELAY_BASE_PORT", "2200")]).await;

    let cfg = VirtlabConfig::load_without_cli_args().expect("config loads");

    assert_eq!(cfg.relay_base_port, 2200);
    assert_eq!(cfg.vboxmanage_bin, "VBoxManage");
    assert_eq!(cfg.guest_ssh_port, 22);
    assert_eq!(cfg.ip_poll_timeout_secs, 30);
    assert_eq!(cfg.relay_bind_address, "0.0.0.0");
    assert_eq!(cfg.restart_policy(), RestartPolicy::default());
    assert_eq!(cfg.max_parallelism, None);
}

#[tokio::test]
async fn configuration_file_overrides_defaults() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config_path = temp.path().join("virtlab.toml");
    std::fs::write(
        &config_path,
        "guest_ssh_port = 2222\nmax_parallelism = 3\nbridge_interface = \"en0\"\n",
    )
    .expect("write config");
    let config_path_str = config_path.to_str().expect("utf8 temp path");
    let _guard = EnvGuard::set_vars(&[("VIRTLAB_CONFIG_PATH", config_path_str)]).await;

    let cfg = VirtlabConfig::load_without_cli_args().expect("config loads");

    assert_eq!(cfg.guest_ssh_port, 2222);
    assert_eq!(cfg.max_parallelism, Some(3));
    assert_eq!(cfg.bridge_interface.as_deref(), Some("en0"));
}
