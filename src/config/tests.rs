use super::*;
use serial_test::serial;
use std::io::Write;

const SAMPLE: &str = r#"
app_name: shop
connections:
  events:
    driver: natsjs
    prefix: orders
    setting:
      url: nats://broker:4222
      username: svc
      password: secret
  local:
    driver: nats
"#;

#[test]
fn test_config_default() {
    let config = Config::default();
    assert!(config.app_name.is_none());
    assert!(config.connections.is_empty());
}

#[test]
fn test_from_yaml() {
    let config = Config::from_yaml(SAMPLE).unwrap();
    assert_eq!(config.app_name.as_deref(), Some("shop"));

    let events = config.connection("events").unwrap();
    assert_eq!(events.driver, "natsjs");
    assert_eq!(events.prefix, "orders");

    let settings = JetStreamSettings::from_instance(events, config.app_name.as_deref()).unwrap();
    assert_eq!(settings.stream, "ORDERSE");
    assert_eq!(settings.connection.url, "nats://broker:4222");
    assert_eq!(settings.connection.username.as_deref(), Some("svc"));

    let local = config.connection("local").unwrap();
    assert!(local.setting.is_empty());
}

#[test]
fn test_from_yaml_rejects_malformed() {
    let result = Config::from_yaml("connections: [1, 2");
    assert!(matches!(result, Err(ConfigError::Load(_))));
}

#[test]
#[serial]
fn test_load_from_path() {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    file.write_all(SAMPLE.as_bytes()).unwrap();

    let config = Config::load(file.path().to_str()).unwrap();

    assert_eq!(config.app_name.as_deref(), Some("shop"));
    assert_eq!(config.connection("events").unwrap().driver, "natsjs");
}

#[test]
#[serial]
fn test_load_missing_required_file_fails() {
    let result = Config::load(Some("/nonexistent/eventwire-test.yaml"));
    assert!(matches!(result, Err(ConfigError::Load(_))));
}

#[test]
#[serial]
fn test_env_overrides_file() {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    file.write_all(SAMPLE.as_bytes()).unwrap();

    std::env::set_var("EVENTWIRE__APP_NAME", "billing");
    let config = Config::load(file.path().to_str());
    std::env::remove_var("EVENTWIRE__APP_NAME");

    assert_eq!(config.unwrap().app_name.as_deref(), Some("billing"));
}
