// SPDX-License-Identifier: Apache-2.0

use super::*;
use serde_json::json;
use tbgw_core::TelemetryEntry;

fn section(kind: &str) -> ReportStrategySection {
    ReportStrategySection { kind: kind.to_string(), report_period: None }
}

fn record(device: &str, key: &str, value: Value) -> ConvertedData {
    let mut data = ConvertedData::new(device, "default");
    let mut values = tbgw_core::ValueMap::new();
    values.insert(key.to_string(), value);
    data.telemetry.push(TelemetryEntry { ts: 1_000, values });
    data
}

#[test]
fn disabled_section_yields_no_service() {
    assert!(ReportStrategyService::from_section(Some(&section("DISABLED"))).is_none());
    assert!(ReportStrategyService::from_section(None).is_none());
}

#[test]
fn on_received_forwards_everything() {
    let service = ReportStrategyService::from_section(Some(&section("ON_RECEIVED"))).unwrap();
    let data = record("d1", "p", json!(1));

    assert!(service.filter("c1", data.clone()).is_some());
    assert!(service.filter("c1", data).is_some());
}

#[test]
fn on_change_suppresses_repeats() {
    let service = ReportStrategyService::from_section(Some(&section("ON_CHANGE"))).unwrap();

    assert!(service.filter("c1", record("d1", "p", json!(1))).is_some());
    assert!(service.filter("c1", record("d1", "p", json!(1))).is_none());
    assert!(service.filter("c1", record("d1", "p", json!(2))).is_some());
    // Different device has its own history.
    assert!(service.filter("c1", record("d2", "p", json!(2))).is_some());
}

#[test]
fn on_change_keeps_the_changed_subset() {
    let service = ReportStrategyService::from_section(Some(&section("ON_CHANGE"))).unwrap();
    let mut first = record("d1", "p", json!(1));
    first.attributes.insert("loc".to_string(), json!("x"));
    assert!(service.filter("c1", first).is_some());

    let mut second = record("d1", "p", json!(2));
    second.attributes.insert("loc".to_string(), json!("x"));
    let filtered = service.filter("c1", second).unwrap();

    assert_eq!(filtered.telemetry.len(), 1);
    assert!(filtered.attributes.is_empty(), "unchanged attribute must be suppressed");
}

#[test]
fn per_connector_override_wins() {
    let service = ReportStrategyService::from_section(Some(&section("ON_CHANGE"))).unwrap();
    service.register_connector_strategy("c2", ReportStrategyKind::OnReceived);

    assert!(service.filter("c2", record("d1", "p", json!(1))).is_some());
    assert!(service.filter("c2", record("d1", "p", json!(1))).is_some());
}

#[test]
fn forget_device_resets_history() {
    let service = ReportStrategyService::from_section(Some(&section("ON_CHANGE"))).unwrap();
    assert!(service.filter("c1", record("d1", "p", json!(1))).is_some());
    service.forget_device("d1");
    assert!(service.filter("c1", record("d1", "p", json!(1))).is_some());
}
