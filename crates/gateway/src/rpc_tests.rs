// SPDX-License-Identifier: Apache-2.0

use super::*;
use crate::client::{MockClient, PlatformRecord};
use crate::registry::DeviceRegistry;
use crate::sync::SharedAttributeCache;
use serde_json::json;
use tbgw_connector::test_support::RpcScript;
use tbgw_connector::{Connector, TestConnector};
use tbgw_core::ManualClock;

struct Harness {
    router: Arc<RpcRouter<ManualClock>>,
    clock: ManualClock,
    client: Arc<MockClient>,
    registry: Arc<DeviceRegistry>,
    connectors: ConnectorIndex,
    device_rx: Option<mpsc::UnboundedReceiver<DeviceRpc>>,
    reply_rx: Option<mpsc::UnboundedReceiver<ReplyJob>>,
    stop: CancellationToken,
    _conversion_rx: mpsc::UnboundedReceiver<crate::intake::ConversionItem>,
    _sync_rx: mpsc::UnboundedReceiver<crate::sync::SyncRequest>,
    _dir: tempfile::TempDir,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::default();
    let client = Arc::new(MockClient::connected());
    let (conversion_tx, conversion_rx) = mpsc::unbounded_channel();
    let (sync_tx, sync_rx) = mpsc::unbounded_channel();
    let registry = Arc::new(DeviceRegistry::new(
        dir.path().join("connected_devices.json"),
        client.clone(),
        conversion_tx,
        sync_tx,
        Arc::new(SharedAttributeCache::default()),
        true,
        true,
    ));
    let connectors = ConnectorIndex::default();
    let (reply_tx, reply_rx) = mpsc::unbounded_channel();
    let (device_tx, device_rx) = mpsc::unbounded_channel();
    let router = Arc::new(RpcRouter::new(
        clock.clone(),
        client.clone(),
        registry.clone(),
        connectors.clone(),
        reply_tx,
        device_tx,
        Arc::new(AtomicBool::new(false)),
        Arc::new(Mutex::new(HashMap::new())),
    ));
    Harness {
        router,
        clock,
        client,
        registry,
        connectors,
        device_rx: Some(device_rx),
        reply_rx: Some(reply_rx),
        stop: CancellationToken::new(),
        _conversion_rx: conversion_rx,
        _sync_rx: sync_rx,
        _dir: dir,
    }
}

impl Harness {
    /// Spawn both RPC workers so replies reach the mock client.
    fn spawn_workers(&mut self) {
        let device_rx = self.device_rx.take().unwrap();
        let reply_rx = self.reply_rx.take().unwrap();
        tokio::spawn(self.router.clone().run_device_worker(device_rx, self.stop.clone()));
        tokio::spawn(self.router.clone().run_reply_worker(reply_rx, self.stop.clone()));
    }

    async fn add_device(&self, device: &str, connector: &Arc<TestConnector>) {
        let as_dyn: Arc<dyn Connector> = connector.clone();
        self.connectors.insert(as_dyn.clone());
        assert!(self.registry.add_device(device, &as_dyn, None).await);
        self.client.clear_records();
    }

    async fn wait_for_reply(&self) -> Option<PlatformRecord> {
        for _ in 0..400 {
            let reply = self
                .client
                .records()
                .into_iter()
                .find(|record| matches!(record, PlatformRecord::RpcReply { .. }));
            if reply.is_some() {
                return reply;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        None
    }
}

// ── device queue ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn device_rpc_reply_is_relayed() {
    let mut harness = harness();
    let connector = Arc::new(TestConnector::new("modbusA", "c1", "modbus"));
    harness.add_device("d1", &connector).await;
    connector.script_rpc(RpcScript::Reply(json!({"v": 7})));
    harness.spawn_workers();

    harness
        .router
        .handle_request(RpcRequest::new(
            1,
            json!({"device": "d1", "method": "get_value", "params": {"timeout": 500}}),
        ))
        .await;

    let reply = harness.wait_for_reply().await.unwrap();
    assert_eq!(
        reply,
        PlatformRecord::RpcReply {
            device: Some("d1".to_string()),
            request_id: 1,
            payload: json!({"v": 7}),
        }
    );
    // The connector saw the request with its id stamped in.
    let calls = connector.rpc_calls();
    assert_eq!(calls[0]["id"], json!(1));
}

#[tokio::test]
async fn rpc_for_unknown_device_requeues_until_the_deadline() {
    let mut harness = harness();
    harness.spawn_workers();

    harness
        .router
        .handle_request(RpcRequest::new(
            6,
            json!({"device": "ghost", "method": "get", "params": {"timeout": 300}}),
        ))
        .await;

    // Requeued with a timed wait until the queue deadline passes; the
    // ManualClock never advances, so drive it past the timeout by hand.
    tokio::time::sleep(Duration::from_millis(150)).await;
    harness.clock.advance(Duration::from_millis(400));

    let reply = harness.wait_for_reply().await.unwrap();
    let PlatformRecord::RpcReply { payload, .. } = reply else { panic!("expected reply") };
    assert_eq!(payload, json!({"error": "Request timeout", "code": 408}));
}

#[tokio::test]
async fn delayed_reply_within_the_deadline_succeeds() {
    let mut harness = harness();
    let connector = Arc::new(TestConnector::new("modbusA", "c1", "modbus"));
    harness.add_device("d1", &connector).await;
    connector.script_rpc(RpcScript::DelayedReply(json!({"v": 7}), Duration::from_millis(100)));
    harness.spawn_workers();

    harness
        .router
        .handle_request(RpcRequest::new(
            2,
            json!({"device": "d1", "method": "get_value", "params": {"timeout": 500}}),
        ))
        .await;

    let reply = harness.wait_for_reply().await.unwrap();
    assert!(matches!(
        reply,
        PlatformRecord::RpcReply { request_id: 2, ref payload, .. } if payload == &json!({"v": 7})
    ));
}

#[tokio::test]
async fn stalled_connector_gets_a_408_reply() {
    let mut harness = harness();
    let connector = Arc::new(TestConnector::new("modbusA", "c1", "modbus"));
    harness.add_device("d1", &connector).await;
    connector.script_rpc(RpcScript::Stall);
    harness.spawn_workers();

    harness
        .router
        .handle_request(RpcRequest::new(
            3,
            json!({"device": "d1", "method": "get_value", "params": {"timeout": 200}}),
        ))
        .await;

    let reply = harness.wait_for_reply().await.unwrap();
    let PlatformRecord::RpcReply { request_id, payload, .. } = reply else {
        panic!("expected an RPC reply");
    };
    assert_eq!(request_id, 3);
    assert_eq!(payload, json!({"error": "Request timeout", "code": 408}));

    // Exactly one failure reply per request id.
    let replies = harness
        .client
        .records()
        .into_iter()
        .filter(|record| matches!(record, PlatformRecord::RpcReply { .. }))
        .count();
    assert_eq!(replies, 1);
}

#[tokio::test]
async fn error_results_are_relayed_verbatim() {
    let mut harness = harness();
    let connector = Arc::new(TestConnector::new("modbusA", "c1", "modbus"));
    harness.add_device("d1", &connector).await;
    connector.script_rpc(RpcScript::Reply(json!({"error": "no such register", "code": 400})));
    harness.spawn_workers();

    harness
        .router
        .handle_request(RpcRequest::new(4, json!({"device": "d1", "method": "read"})))
        .await;

    let reply = harness.wait_for_reply().await.unwrap();
    let PlatformRecord::RpcReply { payload, .. } = reply else { panic!("expected a reply") };
    assert_eq!(payload["error"], json!("no such register"));
    assert_eq!(payload["success"], json!(false));
}

#[tokio::test]
async fn rpc_to_renamed_device_reaches_the_original_connector() {
    let mut harness = harness();
    let connector = Arc::new(TestConnector::new("modbusA", "c1", "modbus"));
    harness.add_device("d1", &connector).await;
    harness.registry.rename_event("d1", "d1-prod");
    connector.script_rpc(RpcScript::Reply(json!({"v": 1})));
    harness.spawn_workers();

    harness
        .router
        .handle_request(RpcRequest::new(5, json!({"device": "d1-prod", "method": "get"})))
        .await;

    let reply = harness.wait_for_reply().await.unwrap();
    // The connector was addressed by the original name...
    assert_eq!(connector.rpc_calls()[0]["device"], json!("d1"));
    // ...and the platform reply goes to the renamed form.
    assert!(matches!(
        reply,
        PlatformRecord::RpcReply { ref device, .. } if device.as_deref() == Some("d1-prod")
    ));
}

// ── gateway queue ────────────────────────────────────────────────────────────

#[tokio::test]
async fn unknown_gateway_method_replies_404() {
    let mut harness = harness();
    harness.spawn_workers();

    harness.router.handle_request(RpcRequest::new(10, json!({"method": "gateway_foo"}))).await;

    let reply = harness.wait_for_reply().await.unwrap();
    let PlatformRecord::RpcReply { device, payload, .. } = reply else { panic!("expected reply") };
    assert_eq!(device, None);
    assert_eq!(payload["error"], json!("Method not found"));
    assert_eq!(payload["code"], json!(404));
}

#[tokio::test]
async fn ping_replies_pong() {
    let mut harness = harness();
    harness.spawn_workers();

    harness.router.handle_request(RpcRequest::new(11, json!({"method": "gateway_ping"}))).await;

    let reply = harness.wait_for_reply().await.unwrap();
    let PlatformRecord::RpcReply { payload, .. } = reply else { panic!("expected reply") };
    assert_eq!(payload["resp"], json!("pong"));
}

#[tokio::test]
async fn devices_method_lists_connected_devices() {
    let mut harness = harness();
    let connector = Arc::new(TestConnector::new("modbusA", "c1", "modbus"));
    harness.add_device("d1", &connector).await;
    harness.spawn_workers();

    harness.router.handle_request(RpcRequest::new(12, json!({"method": "gateway_devices"}))).await;

    let reply = harness.wait_for_reply().await.unwrap();
    let PlatformRecord::RpcReply { payload, .. } = reply else { panic!("expected reply") };
    assert_eq!(payload["resp"]["d1"], json!("modbusA"));
}

#[tokio::test]
async fn method_prefix_fans_out_to_connectors_of_that_type() {
    let mut harness = harness();
    let connector = Arc::new(TestConnector::new("modbusA", "c1", "modbus"));
    let as_dyn: Arc<dyn Connector> = connector.clone();
    harness.connectors.insert(as_dyn);
    connector.script_rpc(RpcScript::Reply(json!({"scanned": true})));
    harness.spawn_workers();

    harness
        .router
        .handle_request(RpcRequest::new(13, json!({"method": "modbus_scan"})))
        .await;

    let reply = harness.wait_for_reply().await.unwrap();
    let PlatformRecord::RpcReply { payload, .. } = reply else { panic!("expected reply") };
    assert_eq!(payload, json!({"scanned": true}));
    assert_eq!(connector.rpc_calls().len(), 1);
}

#[tokio::test]
async fn unknown_module_replies_connector_not_found() {
    let mut harness = harness();
    harness.spawn_workers();

    harness.router.handle_request(RpcRequest::new(14, json!({"method": "opcua_scan"}))).await;

    let reply = harness.wait_for_reply().await.unwrap();
    let PlatformRecord::RpcReply { payload, .. } = reply else { panic!("expected reply") };
    assert_eq!(payload["code"], json!(404));
}

#[tokio::test]
async fn custom_methods_are_dispatchable() {
    let mut harness = harness();
    harness.router.register_custom_method("echo", |params| {
        json!({"code": 200, "resp": params.cloned().unwrap_or(Value::Null)})
    });
    harness.spawn_workers();

    harness
        .router
        .handle_request(RpcRequest::new(15, json!({"method": "gateway_echo", "params": {"a": 1}})))
        .await;

    let reply = harness.wait_for_reply().await.unwrap();
    let PlatformRecord::RpcReply { payload, .. } = reply else { panic!("expected reply") };
    assert_eq!(payload["resp"], json!({"a": 1}));
}

#[tokio::test]
async fn device_renamed_method_updates_the_registry() {
    let mut harness = harness();
    let connector = Arc::new(TestConnector::new("modbusA", "c1", "modbus"));
    harness.add_device("d1", &connector).await;
    harness.spawn_workers();

    harness
        .router
        .handle_request(RpcRequest::new(
            16,
            json!({"method": "gateway_device_renamed", "params": {"d1": "d1-prod"}}),
        ))
        .await;

    let reply = harness.wait_for_reply().await.unwrap();
    let PlatformRecord::RpcReply { payload, .. } = reply else { panic!("expected reply") };
    assert_eq!(payload["success"], json!(true));
    assert_eq!(harness.registry.resolve_current("d1"), "d1-prod");
}

// ── scheduled methods ────────────────────────────────────────────────────────

#[tokio::test]
async fn scheduled_method_fires_after_its_delay() {
    let mut harness = harness();
    let fired = Arc::new(AtomicBool::new(false));
    {
        let fired = fired.clone();
        harness.router.register_scheduled_method("restart", move || {
            fired.store(true, Ordering::SeqCst);
        });
    }
    harness.spawn_workers();

    harness
        .router
        .handle_request(RpcRequest::new(17, json!({"method": "gateway_restart", "params": 2})))
        .await;
    let reply = harness.wait_for_reply().await.unwrap();
    let PlatformRecord::RpcReply { payload, .. } = reply else { panic!("expected reply") };
    assert_eq!(payload, json!({"success": true}));

    // Not due yet.
    harness.router.fire_due_scheduled();
    assert!(!fired.load(Ordering::SeqCst));

    harness.clock.advance(Duration::from_millis(2_100));
    harness.router.fire_due_scheduled();
    assert!(fired.load(Ordering::SeqCst));
}

// ── in-flight expiry ─────────────────────────────────────────────────────────

#[tokio::test]
async fn in_flight_requests_expire_with_a_failure_reply() {
    let mut harness = harness();
    harness.spawn_workers();
    let cancelled = Arc::new(AtomicBool::new(false));
    let cancel_flag = cancelled.clone();
    harness.router.register_rpc_request_timeout(
        "v1/rpc/9",
        Some("d1".to_string()),
        9,
        1_000,
        Some(Box::new(move || cancel_flag.store(true, Ordering::SeqCst))),
    );
    harness.router.drain_registrations();
    assert!(harness.router.is_rpc_in_progress("v1/rpc/9"));

    harness.router.expire_in_flight();
    assert!(harness.router.is_rpc_in_progress("v1/rpc/9"), "deadline not reached yet");

    harness.clock.advance(Duration::from_millis(1_100));
    harness.router.expire_in_flight();

    assert!(cancelled.load(Ordering::SeqCst));
    assert!(!harness.router.is_rpc_in_progress("v1/rpc/9"));
    let reply = harness.wait_for_reply().await.unwrap();
    let PlatformRecord::RpcReply { payload, .. } = reply else { panic!("expected reply") };
    assert_eq!(payload, json!({"success": false}));
}

// ── reply normalization ──────────────────────────────────────────────────────

#[test]
fn raw_bodies_pass_through_and_results_unwrap() {
    assert_eq!(normalize_reply(Some(json!({"v": 7})), None), json!({"v": 7}));
    assert_eq!(normalize_reply(Some(json!({"result": {"v": 7}})), None), json!({"v": 7}));
    assert_eq!(normalize_reply(None, Some(true)), json!({"success": true}));
    assert_eq!(normalize_reply(None, None), json!({"success": false}));
    assert_eq!(
        normalize_reply(Some(json!({"error": "boom"})), Some(false)),
        json!({"error": "boom", "success": false})
    );
    // A status-free body with an explicit success flag collapses to the flag.
    assert_eq!(normalize_reply(Some(json!({"other": 1})), Some(true)), json!({"success": true}));
}
