// SPDX-License-Identifier: Apache-2.0

//! Scriptable platform client for tests: records every publish in order,
//! supports manual confirmation and injected inbound traffic.

use super::{ClientError, InboundMessage, PlatformClient, PublishConfirmer, PublishHandle, PublishResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// One publish observed by the platform side, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum PlatformRecord {
    ConnectDevice { device: String, device_type: String },
    DisconnectDevice { device: String },
    GwTelemetry { device: String, payload: Value },
    GwAttributes { device: String, payload: Value },
    SelfTelemetry { payload: Value },
    SelfAttributes { payload: Value },
    RpcReply { device: Option<String>, request_id: u64, payload: Value },
    AttributeRequest { device: Option<String>, shared_keys: Vec<String> },
    Subscribed,
}

#[derive(Default)]
pub struct MockClient {
    connected: AtomicBool,
    stopped: AtomicBool,
    auto_confirm: AtomicBool,
    records: Mutex<Vec<PlatformRecord>>,
    pending: Mutex<Vec<PublishConfirmer>>,
    replied: Mutex<HashSet<u64>>,
    inbound: Mutex<Option<mpsc::UnboundedSender<InboundMessage>>>,
}

impl MockClient {
    pub fn connected() -> Self {
        let client = Self { auto_confirm: AtomicBool::new(true), ..Self::default() };
        client.connected.store(true, Ordering::SeqCst);
        client
    }

    pub fn disconnected() -> Self {
        Self { auto_confirm: AtomicBool::new(true), ..Self::default() }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Switch to manual confirmation: publishes stay unresolved until
    /// [`MockClient::confirm_pending`].
    pub fn hold_confirmations(&self) {
        self.auto_confirm.store(false, Ordering::SeqCst);
    }

    /// Resolve all held publishes with `result`; returns how many there were.
    pub fn confirm_pending(&self, result: PublishResult) -> usize {
        let pending: Vec<_> = self.pending.lock().drain(..).collect();
        let count = pending.len();
        for confirmer in pending {
            confirmer.confirm(result);
        }
        count
    }

    pub fn records(&self) -> Vec<PlatformRecord> {
        self.records.lock().clone()
    }

    pub fn clear_records(&self) {
        self.records.lock().clear();
    }

    /// Deliver a platform-originated message to the gateway.
    pub fn inject(&self, message: InboundMessage) {
        if let Some(tx) = self.inbound.lock().as_ref() {
            let _ = tx.send(message);
        }
    }

    fn record(&self, record: PlatformRecord) -> PublishHandle {
        self.records.lock().push(record);
        if !self.connected.load(Ordering::SeqCst) {
            return PublishHandle::ready(PublishResult::Disconnected);
        }
        if self.auto_confirm.load(Ordering::SeqCst) {
            PublishHandle::ready(PublishResult::Success)
        } else {
            let (confirmer, handle) = PublishHandle::pending();
            self.pending.lock().push(confirmer);
            handle
        }
    }
}

#[async_trait]
impl PlatformClient for MockClient {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn is_subscribed_to_service_attributes(&self) -> bool {
        self.is_connected()
    }

    async fn connect(&self) -> Result<(), ClientError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn stop(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn set_inbound(&self, tx: mpsc::UnboundedSender<InboundMessage>) {
        *self.inbound.lock() = Some(tx);
    }

    fn subscribe_to_required_topics(&self) {
        self.records.lock().push(PlatformRecord::Subscribed);
    }

    fn send_telemetry(&self, telemetry: Value) -> PublishHandle {
        self.record(PlatformRecord::SelfTelemetry { payload: telemetry })
    }

    fn send_attributes(&self, attributes: Value) -> PublishHandle {
        self.record(PlatformRecord::SelfAttributes { payload: attributes })
    }

    fn gw_send_telemetry(&self, device: &str, telemetry: Value) -> PublishHandle {
        self.record(PlatformRecord::GwTelemetry { device: device.to_string(), payload: telemetry })
    }

    fn gw_send_attributes(&self, device: &str, attributes: Value) -> PublishHandle {
        self.record(PlatformRecord::GwAttributes { device: device.to_string(), payload: attributes })
    }

    async fn gw_connect_device(&self, device: &str, device_type: &str) -> PublishResult {
        self.record(PlatformRecord::ConnectDevice {
            device: device.to_string(),
            device_type: device_type.to_string(),
        })
        .get()
        .await
    }

    async fn gw_disconnect_device(&self, device: &str) -> PublishResult {
        self.record(PlatformRecord::DisconnectDevice { device: device.to_string() }).get().await
    }

    fn send_rpc_reply(&self, request_id: u64, body: Value, _qos: u8) -> PublishHandle {
        if !self.replied.lock().insert(request_id) {
            return PublishHandle::ready(PublishResult::Success);
        }
        self.record(PlatformRecord::RpcReply { device: None, request_id, payload: body })
    }

    fn gw_send_rpc_reply(&self, device: &str, request_id: u64, body: Value) -> PublishHandle {
        if !self.replied.lock().insert(request_id) {
            return PublishHandle::ready(PublishResult::Success);
        }
        self.record(PlatformRecord::RpcReply {
            device: Some(device.to_string()),
            request_id,
            payload: body,
        })
    }

    fn request_attributes(&self, shared_keys: &[String], _client_keys: &[String]) -> PublishHandle {
        self.record(PlatformRecord::AttributeRequest {
            device: None,
            shared_keys: shared_keys.to_vec(),
        })
    }

    fn gw_request_shared_attributes(&self, device: &str, keys: &[String]) -> PublishHandle {
        self.record(PlatformRecord::AttributeRequest {
            device: Some(device.to_string()),
            shared_keys: keys.to_vec(),
        })
    }

    fn gw_request_client_attributes(&self, _device: &str, _keys: &[String]) -> PublishHandle {
        PublishHandle::ready(PublishResult::Success)
    }
}
