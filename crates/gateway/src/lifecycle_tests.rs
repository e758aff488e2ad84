// SPDX-License-Identifier: Apache-2.0

use super::*;
use crate::client::MockClient;
use crate::intake::ConversionIntake;
use crate::sync::SharedAttributeCache;
use serde_json::json;
use tbgw_connector::TestConnector;
use tbgw_core::SystemClock;

struct Harness {
    lifecycle: Arc<ConnectorLifecycle>,
    created: Arc<Mutex<Vec<Arc<TestConnector>>>>,
    dir: tempfile::TempDir,
    _conversion_rx: mpsc::UnboundedReceiver<crate::intake::ConversionItem>,
    _sync_rx: mpsc::UnboundedReceiver<crate::sync::SyncRequest>,
}

fn harness(grpc_enabled: bool) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(MockClient::connected());
    let (conversion_tx, conversion_rx) = mpsc::unbounded_channel();
    let (sync_tx, sync_rx) = mpsc::unbounded_channel();
    let devices = Arc::new(DeviceRegistry::new(
        dir.path().join("connected_devices.json"),
        client.clone(),
        conversion_tx.clone(),
        sync_tx,
        Arc::new(SharedAttributeCache::default()),
        true,
        true,
    ));
    let intake = Arc::new(ConversionIntake::new(conversion_tx, None, None, false, SystemClock));

    let factories = ConnectorRegistry::new();
    let created: Arc<Mutex<Vec<Arc<TestConnector>>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let created = created.clone();
        factories.register("modbus", move |init| {
            let connector = Arc::new(TestConnector::from_init(init));
            created.lock().push(connector.clone());
            Ok(connector)
        });
    }

    let lifecycle = Arc::new(ConnectorLifecycle::new(
        dir.path().to_path_buf(),
        factories,
        ConnectorIndex::default(),
        devices,
        None,
        intake,
        client,
        grpc_enabled,
    ));
    Harness { lifecycle, created, dir, _conversion_rx: conversion_rx, _sync_rx: sync_rx }
}

fn write_sidecar(harness: &Harness, file: &str, config: &Value) {
    std::fs::write(harness.dir.path().join(file), serde_json::to_string_pretty(config).unwrap())
        .unwrap();
}

fn entry(name: &str, connector_type: &str, file: &str) -> ConnectorEntry {
    ConnectorEntry {
        name: name.to_string(),
        connector_type: connector_type.to_string(),
        configuration: file.to_string(),
        key: None,
    }
}

// ── loading ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn loads_and_opens_a_configured_connector() {
    let harness = harness(false);
    write_sidecar(&harness, "modbus.json", &json!({"master": {"slaves": []}}));

    harness.lifecycle.load_connectors(&[entry("modbusA", "Modbus", "modbus.json")]);
    harness.lifecycle.connect_with_connectors().await;

    let connector = harness.lifecycle.index().get_by_name("modbusA").unwrap();
    assert_eq!(connector.connector_type(), "modbus");
    assert!(!connector.is_stopped());
    assert_eq!(harness.created.lock().len(), 1);
    // The sidecar name is mirrored from the top-level entry.
    assert_eq!(connector.config()["name"], json!("modbusA"));
}

#[tokio::test]
async fn generated_id_is_written_back_to_the_sidecar() {
    let harness = harness(false);
    write_sidecar(&harness, "modbus.json", &json!({"master": {}}));

    harness.lifecycle.load_connectors(&[entry("modbusA", "modbus", "modbus.json")]);

    let raw = std::fs::read_to_string(harness.dir.path().join("modbus.json")).unwrap();
    let parsed: Value = serde_json::from_str(&raw).unwrap();
    let id = parsed["id"].as_str().unwrap().to_string();
    assert!(!id.is_empty());

    // A second load keeps the id stable.
    harness.lifecycle.load_connectors(&[entry("modbusA", "modbus", "modbus.json")]);
    harness.lifecycle.connect_with_connectors().await;
    let connector = harness.lifecycle.index().get_by_name("modbusA").unwrap();
    assert_eq!(connector.id(), id);
}

#[tokio::test]
async fn missing_implementation_is_skipped() {
    let harness = harness(false);
    write_sidecar(&harness, "opcua.json", &json!({"server": {}}));

    harness.lifecycle.load_connectors(&[entry("opcuaA", "opcua", "opcua.json")]);
    harness.lifecycle.connect_with_connectors().await;

    assert!(harness.lifecycle.index().is_empty());
}

#[tokio::test]
async fn missing_sidecar_is_skipped() {
    let harness = harness(false);
    harness.lifecycle.load_connectors(&[entry("modbusA", "modbus", "nope.json")]);
    harness.lifecycle.connect_with_connectors().await;
    assert!(harness.lifecycle.index().is_empty());
}

// ── hot reload ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn touch_without_content_change_does_not_reload() {
    let harness = harness(false);
    let config = json!({"master": {}});
    write_sidecar(&harness, "modbus.json", &config);
    harness.lifecycle.load_connectors(&[entry("modbusA", "modbus", "modbus.json")]);
    harness.lifecycle.connect_with_connectors().await;

    // Rewrite the identical bytes (mtime changes, content does not).
    let raw = std::fs::read_to_string(harness.dir.path().join("modbus.json")).unwrap();
    std::fs::write(harness.dir.path().join("modbus.json"), &raw).unwrap();

    assert!(!harness.lifecycle.check_configuration_updates().await);
    assert_eq!(harness.created.lock().len(), 1);
}

#[tokio::test]
async fn content_change_reloads_exactly_once() {
    let harness = harness(false);
    write_sidecar(&harness, "modbus.json", &json!({"master": {}}));
    harness.lifecycle.load_connectors(&[entry("modbusA", "modbus", "modbus.json")]);
    harness.lifecycle.connect_with_connectors().await;
    let first = harness.created.lock()[0].clone();

    // Keep the generated id so identity is stable across the reload.
    let raw = std::fs::read_to_string(harness.dir.path().join("modbus.json")).unwrap();
    let mut parsed: Value = serde_json::from_str(&raw).unwrap();
    parsed["master"] = json!({"slaves": [1]});
    std::fs::write(
        harness.dir.path().join("modbus.json"),
        serde_json::to_string_pretty(&parsed).unwrap(),
    )
    .unwrap();

    assert!(harness.lifecycle.check_configuration_updates().await);

    // One close + one reopen: the old instance stopped, a new one runs.
    assert!(first.is_stopped());
    assert_eq!(harness.created.lock().len(), 2);
    let current = harness.lifecycle.index().get_by_name("modbusA").unwrap();
    assert!(!current.is_stopped());
    assert_eq!(current.config()["master"], json!({"slaves": [1]}));

    // And the poll settles: no further reloads without another change.
    assert!(!harness.lifecycle.check_configuration_updates().await);
    assert_eq!(harness.created.lock().len(), 2);
}

#[tokio::test]
async fn close_connectors_stops_everything() {
    let harness = harness(false);
    write_sidecar(&harness, "modbus.json", &json!({"master": {}}));
    harness.lifecycle.load_connectors(&[entry("modbusA", "modbus", "modbus.json")]);
    harness.lifecycle.connect_with_connectors().await;

    harness.lifecycle.close_connectors().await;

    assert!(harness.lifecycle.index().is_empty());
    assert!(harness.created.lock()[0].is_stopped());
}

// ── grpc side-channel ────────────────────────────────────────────────────────

#[tokio::test]
async fn grpc_connector_gets_a_persistent_key_and_registers_via_the_control_plane() {
    let harness = harness(true);
    write_sidecar(&harness, "grpc_a.json", &json!({"id": "grpc-1", "someSetting": true}));

    harness
        .lifecycle
        .load_connectors(&[ConnectorEntry {
            name: "grpcA".to_string(),
            connector_type: "grpc".to_string(),
            configuration: "grpc_a.json".to_string(),
            key: Some("auto".to_string()),
        }]);
    harness.lifecycle.connect_with_connectors().await;

    // Not instantiated in-process before registration.
    assert!(harness.lifecycle.index().is_empty());

    let keys_raw =
        std::fs::read_to_string(harness.dir.path().join("persistent_grpc_connectors_key.json"))
            .unwrap();
    let keys: std::collections::HashMap<String, String> = serde_json::from_str(&keys_raw).unwrap();
    let key = keys.get("grpcA").unwrap().clone();
    assert_eq!(key.len(), 10);
    assert!(key.chars().all(|c| c.is_ascii_hexdigit()));

    let (control_tx, mut control_rx) = mpsc::unbounded_channel();
    let stub = harness.lifecycle.register_grpc_connector(&key, control_tx).unwrap();
    assert_eq!(stub.name(), "grpcA");
    assert!(harness.lifecycle.index().get_by_id("grpc-1").is_some());

    // A second registration with the same key is refused.
    let (dup_tx, _dup_rx) = mpsc::unbounded_channel();
    assert!(harness.lifecycle.register_grpc_connector(&key, dup_tx).is_err());

    // Gateway calls travel over the control plane.
    let _ = stub.server_side_rpc_handler(json!({"method": "grpc_do"})).await;
    assert!(matches!(control_rx.try_recv().unwrap(), GrpcCommand::Rpc(_)));

    assert!(harness.lifecycle.unregister_grpc_connector(&key));
    assert!(harness.lifecycle.index().is_empty());
}

#[tokio::test]
async fn persistent_key_is_stable_across_loads() {
    let harness = harness(true);
    write_sidecar(&harness, "grpc_a.json", &json!({"id": "grpc-1"}));
    let entries = [ConnectorEntry {
        name: "grpcA".to_string(),
        connector_type: "grpc".to_string(),
        configuration: "grpc_a.json".to_string(),
        key: Some("auto".to_string()),
    }];

    harness.lifecycle.load_connectors(&entries);
    let keys_path = harness.dir.path().join("persistent_grpc_connectors_key.json");
    let first = std::fs::read_to_string(&keys_path).unwrap();

    harness.lifecycle.load_connectors(&entries);
    assert_eq!(std::fs::read_to_string(&keys_path).unwrap(), first);
}

#[tokio::test]
async fn grpc_disabled_rejects_grpc_entries() {
    let harness = harness(false);
    write_sidecar(&harness, "grpc_a.json", &json!({"id": "grpc-1"}));

    harness
        .lifecycle
        .load_connectors(&[ConnectorEntry {
            name: "grpcA".to_string(),
            connector_type: "grpc".to_string(),
            configuration: "grpc_a.json".to_string(),
            key: Some("auto".to_string()),
        }]);

    assert!(!harness.dir.path().join("persistent_grpc_connectors_key.json").exists());
}
