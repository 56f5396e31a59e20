use std::time::Duration;

use serde_json::to_string_pretty;

use piece_socks::config::*;

#[test]
fn server_config() {
    let server_json = include_str!("json/server.json");
    let server_config: Config = serde_json::from_str(server_json).unwrap();
    assert_eq!(server_json, to_string_pretty(&server_config).unwrap());
    server_config.validate().unwrap();
    assert_eq!(server_config.connect_timeout(), Duration::from_secs(5));
    assert_eq!(server_config.log_level().unwrap(), slog::Level::Debug);
}

#[test]
fn missing_fields_take_defaults() {
    let config: Config = serde_json::from_str("{}").unwrap();
    assert_eq!(config, Config::default());
    assert_eq!(config.listen_port, 1080);
    assert_eq!(config.connect_timeout(), Duration::from_secs(10));
    assert_eq!(config.log_level().unwrap(), slog::Level::Info);
    config.validate().unwrap();

    let config: Config = serde_json::from_str(r#"{"listen_port": 9050}"#).unwrap();
    assert_eq!(config.listen_port, 9050);
    assert_eq!(config.listen_addr, "0.0.0.0");
}

#[test]
fn invalid_values_are_rejected() {
    let zero_timeout = Config {
        connect_timeout: 0,
        ..Config::default()
    };
    assert!(zero_timeout.validate().is_err());

    let tiny_buffer = Config {
        max_pending_bytes: MIN_PENDING_BYTES - 1,
        ..Config::default()
    };
    assert!(tiny_buffer.validate().is_err());

    let bad_level = Config {
        log_level: "loud".to_string(),
        ..Config::default()
    };
    assert!(bad_level.validate().is_err());
}

#[test]
fn load_reports_the_path() {
    let err = Config::load("/nonexistent/piece-socks.json").unwrap_err();
    assert!(err.to_string().contains("/nonexistent/piece-socks.json"));
}
