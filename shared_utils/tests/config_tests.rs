use shared_utils::config::{Config, ConfigError};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::NamedTempFile;

#[test]
fn test_load_full_config() {
    let mut file = NamedTempFile::new().unwrap();

    let config_str = r#"
        log_level = "debug"
        socket_path = "/run/tether/service.sock"

        [client]
        state_file = "/var/lib/tether/session.json"

        [network]
        enabled = false
        probe_address = "9.9.9.9:53"
        poll_interval_ms = 500
        probe_timeout_ms = 250

        [service]
        connect_delay_ms = 10
        statistics_interval_ms = 100

        [logging]
        log_to_file = true
        log_dir = "/var/log/tether"
        json_format = true
    "#;

    file.write_all(config_str.as_bytes()).unwrap();

    let config = Config::load(file.path()).unwrap();

    assert_eq!(config.log_level, "debug");
    assert_eq!(config.socket_path, PathBuf::from("/run/tether/service.sock"));
    assert_eq!(
        config.client.state_file,
        PathBuf::from("/var/lib/tether/session.json")
    );
    assert!(!config.network.enabled);
    assert_eq!(
        config.network.probe_socket_addr().unwrap(),
        "9.9.9.9:53".parse().unwrap()
    );
    assert_eq!(config.network.poll_interval(), Duration::from_millis(500));
    assert_eq!(config.network.probe_timeout(), Duration::from_millis(250));
    assert_eq!(config.service.connect_delay(), Duration::from_millis(10));
    assert_eq!(
        config.service.statistics_interval(),
        Duration::from_millis(100)
    );
    assert!(config.logging.log_to_file);
    assert_eq!(config.logging.log_dir, "/var/log/tether");
    assert!(config.logging.json_format);
}

#[test]
fn test_missing_sections_use_defaults() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(b"log_level = \"warn\"\n").unwrap();

    let config = Config::load(file.path()).unwrap();
    let defaults = Config::default();

    assert_eq!(config.log_level, "warn");
    assert_eq!(config.socket_path, defaults.socket_path);
    assert_eq!(config.network.probe_address, defaults.network.probe_address);
    assert_eq!(
        config.service.connect_delay_ms,
        defaults.service.connect_delay_ms
    );
}

#[test]
fn test_invalid_values_are_rejected() {
    let mut file = NamedTempFile::new().unwrap();

    let config_str = r#"
        [network]
        probe_address = "nowhere"
    "#;

    file.write_all(config_str.as_bytes()).unwrap();

    let result = Config::load(file.path());
    assert!(matches!(
        result,
        Err(ConfigError::InvalidValue { ref key, .. }) if key == "network.probe_address"
    ));
}

#[test]
fn test_malformed_toml() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(b"log_level = [unterminated").unwrap();

    let result = Config::load(file.path());
    assert!(matches!(result, Err(ConfigError::TomlError(_))));
}

#[test]
fn test_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");

    assert!(matches!(
        Config::load(&path),
        Err(ConfigError::FileNotFound(_))
    ));

    let config = Config::load_or_default(&path).unwrap();
    assert_eq!(config.log_level, Config::default().log_level);
}

#[test]
fn test_environment_overrides_file_values() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(b"[service]\nconnect_delay_ms = 42\n").unwrap();

    let mut config = Config::load(file.path()).unwrap();
    assert_eq!(config.service.connect_delay_ms, 42);

    config.apply_overrides(|key| match key {
        "TETHER_SERVICE_CONNECT_DELAY_MS" => Some("7".to_string()),
        _ => None,
    });
    assert_eq!(config.service.connect_delay_ms, 7);
}
