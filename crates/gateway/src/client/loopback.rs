// SPDX-License-Identifier: Apache-2.0

//! Loopback client: confirms every publish locally and drops the payload
//! after logging it. Backs `tbgwd`'s offline mode, where no platform
//! transport is wired in.

use super::{ClientError, InboundMessage, PlatformClient, PublishHandle, PublishResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Default)]
pub struct LoopbackClient {
    connected: AtomicBool,
    stopped: AtomicBool,
    replied: Mutex<HashSet<u64>>,
}

impl LoopbackClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn confirm(&self) -> PublishHandle {
        if self.connected.load(Ordering::SeqCst) {
            PublishHandle::ready(PublishResult::Success)
        } else {
            PublishHandle::ready(PublishResult::Disconnected)
        }
    }
}

#[async_trait]
impl PlatformClient for LoopbackClient {
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

    fn set_inbound(&self, _tx: mpsc::UnboundedSender<InboundMessage>) {}

    fn subscribe_to_required_topics(&self) {}

    fn send_telemetry(&self, telemetry: Value) -> PublishHandle {
        debug!(%telemetry, "loopback: gateway telemetry");
        self.confirm()
    }

    fn send_attributes(&self, attributes: Value) -> PublishHandle {
        debug!(%attributes, "loopback: gateway attributes");
        self.confirm()
    }

    fn gw_send_telemetry(&self, device: &str, telemetry: Value) -> PublishHandle {
        debug!(device, %telemetry, "loopback: device telemetry");
        self.confirm()
    }

    fn gw_send_attributes(&self, device: &str, attributes: Value) -> PublishHandle {
        debug!(device, %attributes, "loopback: device attributes");
        self.confirm()
    }

    async fn gw_connect_device(&self, device: &str, device_type: &str) -> PublishResult {
        debug!(device, device_type, "loopback: device connected");
        self.confirm().get().await
    }

    async fn gw_disconnect_device(&self, device: &str) -> PublishResult {
        debug!(device, "loopback: device disconnected");
        self.confirm().get().await
    }

    fn send_rpc_reply(&self, request_id: u64, body: Value, _qos: u8) -> PublishHandle {
        if !self.replied.lock().insert(request_id) {
            debug!(request_id, "loopback: duplicate RPC reply dropped");
            return PublishHandle::ready(PublishResult::Success);
        }
        debug!(request_id, %body, "loopback: RPC reply");
        self.confirm()
    }

    fn gw_send_rpc_reply(&self, device: &str, request_id: u64, body: Value) -> PublishHandle {
        if !self.replied.lock().insert(request_id) {
            debug!(request_id, "loopback: duplicate RPC reply dropped");
            return PublishHandle::ready(PublishResult::Success);
        }
        debug!(device, request_id, %body, "loopback: device RPC reply");
        self.confirm()
    }

    fn request_attributes(&self, shared_keys: &[String], client_keys: &[String]) -> PublishHandle {
        debug!(?shared_keys, ?client_keys, "loopback: attribute request");
        self.confirm()
    }

    fn gw_request_shared_attributes(&self, device: &str, keys: &[String]) -> PublishHandle {
        debug!(device, ?keys, "loopback: shared attribute request");
        self.confirm()
    }

    fn gw_request_client_attributes(&self, device: &str, keys: &[String]) -> PublishHandle {
        debug!(device, ?keys, "loopback: client attribute request");
        self.confirm()
    }
}
