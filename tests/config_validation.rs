//! Integration tests for configuration validation

#![allow(clippy::expect_used, clippy::unwrap_used)]

use filewire::config::{
    ClientConfig, LoggingConfig, NetworkConfig, ServerConfig, TransferConfig, TransportConfig,
};
use serial_test::serial;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

#[test]
fn test_default_config_validates() {
    let config = NetworkConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
}

#[test]
fn test_invalid_server_address() {
    let mut config = NetworkConfig::default();
    config.server.address = "invalid_address".to_string();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Invalid server address")));
}

#[test]
fn test_empty_server_address() {
    let mut config = NetworkConfig::default();
    config.server.address = String::new();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Server address cannot be empty")));
}

#[test]
fn test_zero_backpressure_limit() {
    let mut config = NetworkConfig::default();
    config.server.backpressure_limit = 0;
    config.client.backpressure_limit = 0;

    let errors = config.validate();
    let count = errors
        .iter()
        .filter(|e| e.contains("Backpressure limit must be greater than 0"))
        .count();
    assert_eq!(count, 2);
}

#[test]
fn test_excessive_backpressure_limit() {
    let mut config = NetworkConfig::default();
    config.server.backpressure_limit = 2_000_000;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Backpressure limit too large")));
}

#[test]
fn test_short_heartbeat_interval() {
    let mut config = NetworkConfig::default();
    config.server.heartbeat_interval = Duration::from_millis(50);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Server heartbeat interval too short")));
}

#[test]
fn test_idle_timeout_must_exceed_heartbeat() {
    let mut config = NetworkConfig::default();
    config.client.heartbeat_interval = Duration::from_secs(10);
    config.client.idle_timeout = Duration::from_secs(10);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Client idle timeout must be longer than the heartbeat interval")));
}

#[test]
fn test_shutdown_timeout_bounds() {
    let mut config = NetworkConfig::default();
    config.server.shutdown_timeout = Duration::from_millis(200);
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Shutdown timeout too short")));

    config.server.shutdown_timeout = Duration::from_secs(120);
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Shutdown timeout too long")));
}

#[test]
fn test_zero_max_connections() {
    let mut config = NetworkConfig::default();
    config.server.max_connections = 0;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Max connections must be greater than 0")));
}

#[test]
fn test_short_connection_timeout() {
    let mut config = NetworkConfig::default();
    config.client.connection_timeout = Duration::from_millis(50);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Connection timeout too short")));
}

#[test]
fn test_connect_attempts_bounds() {
    let mut config = NetworkConfig::default();
    config.client.connect_attempts = 0;
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Connect attempts must be greater than 0")));

    config.client.connect_attempts = 50;
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Connect attempts too high")));
}

#[test]
fn test_transfer_settings() {
    let mut config = NetworkConfig::default();
    config.transfer.download_dir = PathBuf::new();
    config.transfer.queue_depth = 0;
    config.transfer.response_timeout = Duration::from_millis(5);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Download directory cannot be empty")));
    assert!(errors
        .iter()
        .any(|e| e.contains("Transfer queue depth must be greater than 0")));
    assert!(errors.iter().any(|e| e.contains("Response timeout too short")));
}

#[test]
fn test_frame_size_must_hold_a_segment() {
    let mut config = NetworkConfig::default();
    config.transport.max_frame_size = 4096;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Max frame size too small")));
}

#[test]
fn test_empty_app_name() {
    let mut config = NetworkConfig::default();
    config.logging.app_name = String::new();

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Application name cannot be empty")));
}

#[test]
fn test_log_to_file_without_path() {
    let mut config = NetworkConfig::default();
    config.logging.log_to_file = true;
    config.logging.log_file_path = None;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("log_file_path must be specified")));
}

#[test]
fn test_no_logging_outputs() {
    let mut config = NetworkConfig::default();
    config.logging.log_to_console = false;
    config.logging.log_to_file = false;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("At least one logging output")));
}

#[test]
fn test_validate_strict_with_invalid_config() {
    let mut config = NetworkConfig::default();
    config.server.address = String::new();

    let error = config.validate_strict().unwrap_err();
    assert!(error
        .to_string()
        .contains("Configuration validation failed"));
}

#[test]
fn test_multiple_validation_errors() {
    let mut config = NetworkConfig::default();

    config.server.address = String::new();
    config.server.backpressure_limit = 0;
    config.client.connect_attempts = 0;
    config.transport.max_frame_size = 0;
    config.logging.app_name = String::new();

    let errors = config.validate();
    assert!(
        errors.len() >= 5,
        "Expected at least 5 errors, got {}: {:?}",
        errors.len(),
        errors
    );
}

#[test]
fn test_valid_production_config() {
    let config = NetworkConfig {
        server: ServerConfig {
            address: "0.0.0.0:9000".to_string(),
            backpressure_limit: 128,
            idle_timeout: Duration::from_secs(90),
            heartbeat_interval: Duration::from_secs(15),
            send_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(10),
            max_connections: 1024,
        },
        client: ClientConfig {
            connection_timeout: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(90),
            heartbeat_interval: Duration::from_secs(15),
            connect_attempts: 5,
            retry_delay: Duration::from_secs(2),
            backpressure_limit: 64,
        },
        transfer: TransferConfig {
            download_dir: PathBuf::from("/srv/incoming"),
            queue_depth: 32,
            response_timeout: Duration::from_secs(60),
        },
        transport: TransportConfig {
            max_frame_size: 16 * 1024 * 1024,
            tcp_nodelay: true,
        },
        logging: LoggingConfig {
            app_name: "filewire-gateway".to_string(),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: true,
        },
    };

    let errors = config.validate();
    assert!(errors.is_empty(), "Production config should be valid, got: {errors:?}");
}

#[test]
fn test_config_file_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("filewire.toml");

    let original = NetworkConfig::default_with_overrides(|c| {
        c.server.address = "0.0.0.0:7100".into();
        c.client.connect_attempts = 7;
        c.transfer.download_dir = PathBuf::from("inbox");
        c.logging.log_level = Level::DEBUG;
    });
    original.save_to_file(&path).unwrap();

    let loaded = NetworkConfig::from_file(&path).unwrap();
    assert_eq!(loaded.server.address, "0.0.0.0:7100");
    assert_eq!(loaded.client.connect_attempts, 7);
    assert_eq!(loaded.transfer.download_dir, PathBuf::from("inbox"));
    assert_eq!(loaded.logging.log_level, Level::DEBUG);
    assert_eq!(loaded.client.retry_delay, original.client.retry_delay);
}

#[test]
fn test_partial_toml_keeps_defaults() {
    let config = NetworkConfig::from_toml(
        r#"
        [transfer]
        download_dir = "received"
        queue_depth = 8
        response_timeout = 2500
        "#,
    )
    .unwrap();

    assert_eq!(config.transfer.download_dir, PathBuf::from("received"));
    assert_eq!(config.transfer.queue_depth, 8);
    assert_eq!(config.transfer.response_timeout, Duration::from_millis(2500));
    assert_eq!(config.server.address, ServerConfig::default().address);
}

#[test]
fn test_malformed_toml_is_a_config_error() {
    let result = NetworkConfig::from_toml("[server\naddress = ");
    assert!(matches!(
        result,
        Err(filewire::ProtocolError::ConfigError(_))
    ));
}

#[test]
fn test_example_config_parses() {
    let example = NetworkConfig::example_config();
    let parsed = NetworkConfig::from_toml(&example).unwrap();
    assert!(parsed.validate().is_empty());
}

#[test]
#[serial]
fn test_env_overrides() {
    std::env::set_var("FILEWIRE_SERVER_ADDRESS", "127.0.0.1:7200");
    std::env::set_var("FILEWIRE_DOWNLOAD_DIR", "/tmp/filewire-env");
    std::env::set_var("FILEWIRE_CONNECT_ATTEMPTS", "4");
    std::env::set_var("FILEWIRE_HEARTBEAT_INTERVAL_MS", "2000");

    let config = NetworkConfig::from_env().unwrap();

    std::env::remove_var("FILEWIRE_SERVER_ADDRESS");
    std::env::remove_var("FILEWIRE_DOWNLOAD_DIR");
    std::env::remove_var("FILEWIRE_CONNECT_ATTEMPTS");
    std::env::remove_var("FILEWIRE_HEARTBEAT_INTERVAL_MS");

    assert_eq!(config.server.address, "127.0.0.1:7200");
    assert_eq!(config.transfer.download_dir, PathBuf::from("/tmp/filewire-env"));
    assert_eq!(config.client.connect_attempts, 4);
    assert_eq!(config.server.heartbeat_interval, Duration::from_secs(2));
    assert_eq!(config.client.heartbeat_interval, Duration::from_secs(2));
}

#[test]
#[serial]
fn test_env_rejects_bad_log_level() {
    std::env::set_var("FILEWIRE_LOG_LEVEL", "chatty");
    let result = NetworkConfig::from_env();
    std::env::remove_var("FILEWIRE_LOG_LEVEL");

    assert!(result.is_err());
}
