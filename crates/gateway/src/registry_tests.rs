// SPDX-License-Identifier: Apache-2.0

use super::*;
use crate::client::{MockClient, PlatformRecord};
use serde_json::json;
use tbgw_connector::TestConnector;

struct Fixture {
    registry: Arc<DeviceRegistry>,
    client: Arc<MockClient>,
    conversion_rx: mpsc::UnboundedReceiver<ConversionItem>,
    sync_rx: mpsc::UnboundedReceiver<SyncRequest>,
    snapshot_path: PathBuf,
    _dir: tempfile::TempDir,
}

fn fixture() -> Fixture {
    fixture_with_client(Arc::new(MockClient::connected()))
}

fn fixture_with_client(client: Arc<MockClient>) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let snapshot_path = dir.path().join("connected_devices.json");
    let (conversion_tx, conversion_rx) = mpsc::unbounded_channel();
    let (sync_tx, sync_rx) = mpsc::unbounded_channel();
    let registry = Arc::new(DeviceRegistry::new(
        snapshot_path.clone(),
        client.clone(),
        conversion_tx,
        sync_tx,
        Arc::new(SharedAttributeCache::default()),
        true,
        true,
    ));
    Fixture { registry, client, conversion_rx, sync_rx, snapshot_path, _dir: dir }
}

fn connector(name: &str, id: &str) -> Arc<dyn Connector> {
    Arc::new(TestConnector::new(name, id, "modbus"))
}

// ── add / del ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn add_device_connects_and_publishes_details() {
    let mut fx = fixture();
    let connector = connector("modbusA", "c1");

    assert!(fx.registry.add_device("d1", &connector, Some("pump")).await);

    assert!(fx.registry.contains("d1"));
    assert_eq!(fx.registry.device_type_of("d1").as_deref(), Some("pump"));
    assert_eq!(fx.registry.get_devices(Some("c1")).get("d1").map(String::as_str), Some("pump"));
    assert!(fx.registry.get_devices(Some("other")).is_empty());
    let records = fx.client.records();
    assert_eq!(
        records[0],
        PlatformRecord::ConnectDevice { device: "d1".to_string(), device_type: "pump".to_string() }
    );
    assert_eq!(
        records[1],
        PlatformRecord::GwAttributes {
            device: "d1".to_string(),
            payload: json!({"connectorName": "modbusA", "connectorType": "modbus"}),
        }
    );
    // Shared-attribute sync is enqueued for the new device.
    assert_eq!(fx.sync_rx.try_recv().unwrap().device, "d1");
    assert!(fx.snapshot_path.exists());
}

#[tokio::test]
async fn add_device_is_idempotent() {
    let fx = fixture();
    let connector = connector("modbusA", "c1");

    assert!(fx.registry.add_device("d1", &connector, Some("pump")).await);
    fx.client.clear_records();
    assert!(fx.registry.add_device("d1", &connector, Some("pump")).await);

    // No second connect or details publish.
    assert!(fx.client.records().is_empty());
}

#[tokio::test]
async fn add_device_requires_a_connected_platform() {
    let fx = fixture_with_client(Arc::new(MockClient::disconnected()));
    let connector = connector("modbusA", "c1");

    assert!(!fx.registry.add_device("d1", &connector, None).await);
    assert!(!fx.registry.contains("d1"));
}

#[tokio::test]
async fn del_device_disconnects_and_forgets() {
    let fx = fixture();
    let connector = connector("modbusA", "c1");
    fx.registry.add_device("d1", &connector, None).await;
    fx.client.clear_records();

    fx.registry.del_device("d1", true).await;

    assert!(!fx.registry.contains("d1"));
    assert!(!fx.registry.is_saved("d1"));
    assert_eq!(
        fx.client.records(),
        vec![PlatformRecord::DisconnectDevice { device: "d1".to_string() }]
    );
}

#[tokio::test]
async fn del_of_renamed_device_keeps_identity_for_rename_resolution() {
    let fx = fixture();
    let connector = connector("modbusA", "c1");
    fx.registry.add_device("d1", &connector, None).await;
    fx.registry.rename_event("d1", "d1-prod");

    fx.registry.del_device("d1", false).await;
    assert!(!fx.registry.contains("d1"));

    // The disconnected entry still carries the rename on disk.
    let raw = std::fs::read_to_string(&fx.snapshot_path).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(parsed["d1"]["renaming"], json!("d1-prod"));
    assert_eq!(parsed["d1"]["disconnected"], json!(true));
}

// ── renaming ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn rename_event_rewrites_submissions_and_rpc_targets() {
    let fx = fixture();
    let connector = connector("modbusA", "c1");
    fx.registry.add_device("d1", &connector, None).await;

    assert_eq!(fx.registry.rename_event("d1", "d1-prod"), json!({"success": true}));

    assert_eq!(fx.registry.resolve_current("d1"), "d1-prod");
    assert_eq!(fx.registry.resolve_original("d1-prod"), "d1");
    assert!(fx.registry.is_renamed("d1"));
}

#[tokio::test]
async fn delete_event_purges_both_name_forms() {
    let fx = fixture();
    let connector = connector("modbusA", "c1");
    fx.registry.add_device("d1", &connector, None).await;
    fx.registry.rename_event("d1", "d1-prod");

    assert_eq!(fx.registry.delete_event("d1-prod"), json!({"success": true}));

    assert!(!fx.registry.contains("d1"));
    assert!(!fx.registry.is_renamed("d1"));
    assert_eq!(fx.registry.resolve_current("d1"), "d1");
}

// ── connector rebind ─────────────────────────────────────────────────────────

#[tokio::test]
async fn update_device_connector_emits_attribute_record() {
    let mut fx = fixture();
    let old = connector("modbusA", "c1");
    fx.registry.add_device("d1", &old, None).await;

    let new = connector("modbusA-2", "c2");
    fx.registry.update_device_connector("d1", &new);

    let item = fx.conversion_rx.try_recv().unwrap();
    assert_eq!(item.connector_name, "modbusA-2");
    assert_eq!(item.data.device_name, "d1");
    assert_eq!(item.data.attributes.get("connectorName"), Some(&json!("modbusA-2")));
    assert_eq!(fx.registry.devices_of_connector("c2"), vec!["d1".to_string()]);
}

#[tokio::test]
async fn rebind_matches_by_name_or_id() {
    let fx = fixture();
    let old = connector("modbusA", "c1");
    fx.registry.add_device("d1", &old, None).await;
    drop(old); // connector restarted; the weak reference is dead

    let restarted = connector("modbusA", "c1-new");
    fx.registry.rebind_connector_devices(&restarted);

    assert!(fx.registry.device_connector("d1").is_some());
    assert_eq!(fx.registry.devices_of_connector("c1-new"), vec!["d1".to_string()]);
}

// ── snapshot persistence ─────────────────────────────────────────────────────

#[tokio::test]
async fn snapshot_round_trips_through_disk() {
    let fx = fixture();
    let connector_a = connector("modbusA", "c1");
    fx.registry.add_device("d1", &connector_a, Some("pump")).await;
    fx.registry.add_device("d2", &connector_a, Some("valve")).await;
    fx.registry.rename_event("d1", "d1-prod");

    // A fresh registry on the same snapshot path.
    let restored = fixture_with_path(fx.snapshot_path.clone());
    let index = ConnectorIndex::default();
    index.insert(connector_a.clone());
    restored.registry.load_snapshot(&index);

    assert!(restored.registry.contains("d1"));
    assert!(restored.registry.contains("d2"));
    assert_eq!(restored.registry.resolve_current("d1"), "d1-prod");
    assert_eq!(restored.registry.device_type_of("d1").as_deref(), Some("pump"));
    assert!(restored.registry.device_connector("d1").is_some());
}

#[tokio::test]
async fn snapshot_rebinds_by_id_before_name() {
    let fx = fixture();
    let original = connector("modbusA", "c1");
    fx.registry.add_device("d1", &original, None).await;

    let restored = fixture_with_path(fx.snapshot_path.clone());
    let index = ConnectorIndex::default();
    // Same id under a new name wins over a same-name impostor.
    let by_id = connector("renamed-connector", "c1");
    let by_name: Arc<dyn Connector> = Arc::new(TestConnector::new("modbusA", "other-id", "modbus"));
    index.insert(by_id.clone());
    index.insert(by_name);
    restored.registry.load_snapshot(&index);

    let bound = restored.registry.device_connector("d1").unwrap();
    assert_eq!(bound.id(), "c1");
}

#[tokio::test]
async fn legacy_array_snapshot_form_is_accepted() {
    let restored = fixture();
    std::fs::write(&restored.snapshot_path, r#"{"d1": ["modbusA", "pump", "d1-prod"]}"#).unwrap();

    let index = ConnectorIndex::default();
    index.insert(connector("modbusA", "c1"));
    restored.registry.load_snapshot(&index);

    assert!(restored.registry.contains("d1"));
    assert_eq!(restored.registry.device_type_of("d1").as_deref(), Some("pump"));
    assert_eq!(restored.registry.resolve_current("d1"), "d1-prod");
}

#[tokio::test]
async fn snapshot_entry_with_unknown_connector_is_skipped() {
    let restored = fixture();
    std::fs::write(
        &restored.snapshot_path,
        r#"{"d1": {"connectorName": "gone", "connectorId": "x", "deviceType": "pump", "renaming": null, "disconnected": false}}"#,
    )
    .unwrap();

    restored.registry.load_snapshot(&ConnectorIndex::default());
    assert!(!restored.registry.contains("d1"));
}

// ── idle tracking ────────────────────────────────────────────────────────────

#[tokio::test]
async fn renamed_device_stays_known_and_tracks_activity() {
    let fx = fixture();
    let connector = connector("modbusA", "c1");
    fx.registry.add_device("d1", &connector, None).await;
    fx.registry.rename_event("d1", "d1-prod");

    // The connected map is keyed by the original name; both forms resolve.
    assert!(fx.registry.is_known("d1"));
    assert!(fx.registry.is_known("d1-prod"));
    assert!(!fx.registry.is_known("ghost"));
    assert!(!fx.registry.contains("d1-prod"));

    // Activity stamped under the renamed form lands on the original entry.
    fx.registry.mark_data_received("d1-prod", 9_000);
    assert!(fx.registry.idle_devices(5_000, 10_000).is_empty());
    assert_eq!(fx.registry.idle_devices(5_000, 20_000), vec!["d1".to_string()]);
}

#[tokio::test]
async fn idle_devices_are_reported_after_the_timeout() {
    let fx = fixture();
    let connector = connector("modbusA", "c1");
    fx.registry.add_device("d1", &connector, None).await;

    fx.registry.mark_data_received("d1", 1_000);
    assert!(fx.registry.idle_devices(5_000, 2_000).is_empty());
    assert_eq!(fx.registry.idle_devices(5_000, 7_000), vec!["d1".to_string()]);
}

fn fixture_with_path(snapshot_path: PathBuf) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(MockClient::connected());
    let (conversion_tx, conversion_rx) = mpsc::unbounded_channel();
    let (sync_tx, sync_rx) = mpsc::unbounded_channel();
    let registry = Arc::new(DeviceRegistry::new(
        snapshot_path.clone(),
        client.clone(),
        conversion_tx,
        sync_tx,
        Arc::new(SharedAttributeCache::default()),
        true,
        true,
    ));
    Fixture { registry, client, conversion_rx, sync_rx, snapshot_path, _dir: dir }
}
