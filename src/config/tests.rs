use super::settings::Settings;
use super::{BackendKind, load_config_from};
use serial_test::serial;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.backend, BackendKind::Rabbitmq);
    assert_eq!(settings.broker.prefetch, 10);
    assert_eq!(settings.broker.max_reconnect_attempts, 5);
    assert_eq!(settings.broker.reconnect_delay_ms, 5000);
    assert_eq!(settings.log.level, "info");
}

#[test]
fn test_default_topology_has_four_streams() {
    let topology = Settings::default().topology;
    assert_eq!(topology.exchanges.len(), 4);
    assert_eq!(topology.queues.len(), 4);

    let reviews = &topology.queues["reviews"];
    assert_eq!(reviews.name, "review_events");
    assert_eq!(reviews.bindings.len(), 1);
    assert_eq!(reviews.bindings[0].routing_key, "review.*");

    // product_events fans in from two exchanges
    assert_eq!(topology.queues["products"].bindings.len(), 2);
}

#[test]
#[serial]
fn test_load_config_without_sources_uses_defaults() {
    let tmp = TempDir::new().expect("create tempdir");
    let missing = tmp.path().join("absent");

    let cfg = temp_env::with_vars_unset(
        ["BUNNYHOP__BROKER__URL", "BUNNYHOP__BACKEND"],
        || load_config_from(&missing).expect("load_config failed"),
    );
    assert_eq!(cfg.broker.url, Settings::default().broker.url);
    assert_eq!(cfg.topology.queues.len(), 4);
}

#[test]
#[serial]
fn test_load_config_from_file_overrides_defaults() {
    let tmp = TempDir::new().expect("create tempdir");
    let path = tmp.path().join("default.toml");
    let toml = r##"
        backend = "kafka"

        [broker]
        url = "memory://test"
        prefetch = 3

        [log]
        level = "debug"

        [topology.exchanges]
        audit = "audit.x"

        [topology.queues.audit]
        name = "audit_events"
        prefetch = 1
        bindings = [{ exchange = "audit", routing_key = "#" }]
    "##;
    fs::write(&path, toml).expect("write config file");

    let cfg = load_config_from(&path).expect("load_config failed");
    assert_eq!(cfg.backend, BackendKind::Kafka);
    assert_eq!(cfg.broker.url, "memory://test");
    assert_eq!(cfg.broker.prefetch, 3);
    // untouched keys keep their defaults
    assert_eq!(cfg.broker.max_reconnect_attempts, 5);
    assert_eq!(cfg.log.level, "debug");
    assert_eq!(cfg.topology.exchanges["audit"], "audit.x");
    assert_eq!(cfg.topology.queues["audit"].prefetch, Some(1));
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    let tmp = TempDir::new().expect("create tempdir");
    let path = tmp.path().join("default.toml");
    fs::write(&path, "[broker]\nreconnect_delay_ms = 100\n").expect("write config file");

    let cfg = temp_env::with_vars(
        [
            ("BUNNYHOP__BROKER__RECONNECT_DELAY_MS", Some("250")),
            ("BUNNYHOP__BROKER__URL", Some("memory://env")),
        ],
        || load_config_from(&path).expect("load_config failed"),
    );
    assert_eq!(cfg.broker.reconnect_delay_ms, 250);
    assert_eq!(cfg.broker.url, "memory://env");
}
