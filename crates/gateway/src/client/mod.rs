// SPDX-License-Identifier: Apache-2.0

//! North-bound platform client seam.
//!
//! The transport (keep-alive, reconnection, wire encoding) lives outside
//! this repo; the gateway only depends on [`PlatformClient`]. Every send
//! returns a [`PublishHandle`] whose `get()` resolves once the platform
//! confirmed (or the transport gave up). Inbound traffic, meaning
//! server-side RPC requests and attribute updates, arrives over a channel
//! installed with [`PlatformClient::set_inbound`].

mod loopback;
#[cfg(any(test, feature = "test-support"))]
mod mock;

pub use loopback::LoopbackClient;
#[cfg(any(test, feature = "test-support"))]
pub use mock::{MockClient, PlatformRecord};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

/// Outcome of one publish at the configured QoS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishResult {
    Success,
    /// The link dropped before the confirmation arrived.
    Disconnected,
    Failure,
}

impl PublishResult {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Confirmation handle for one in-flight publish.
pub struct PublishHandle {
    rx: Option<oneshot::Receiver<PublishResult>>,
    immediate: PublishResult,
}

impl PublishHandle {
    /// A handle the transport confirms later.
    pub fn pending() -> (PublishConfirmer, PublishHandle) {
        let (tx, rx) = oneshot::channel();
        (PublishConfirmer { tx }, PublishHandle { rx: Some(rx), immediate: PublishResult::Failure })
    }

    /// A handle that is already resolved.
    pub fn ready(result: PublishResult) -> PublishHandle {
        PublishHandle { rx: None, immediate: result }
    }

    /// Wait for the confirmation. A dropped confirmer counts as failure.
    pub async fn get(self) -> PublishResult {
        match self.rx {
            Some(rx) => rx.await.unwrap_or(PublishResult::Failure),
            None => self.immediate,
        }
    }
}

pub struct PublishConfirmer {
    tx: oneshot::Sender<PublishResult>,
}

impl PublishConfirmer {
    pub fn confirm(self, result: PublishResult) {
        let _ = self.tx.send(result);
    }
}

/// Traffic pushed down from the platform.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    /// A server-side RPC request; device-targeted requests carry `device`
    /// inside the content.
    ServerRpc { request_id: u64, content: Value },
    /// A shared-attribute update or attribute-request response. Updates for
    /// a device carry `device`; gateway-scoped payloads do not.
    AttributeUpdate { content: Value },
}

/// Uniform facade over the north-bound publisher.
#[async_trait]
pub trait PlatformClient: Send + Sync + 'static {
    fn is_connected(&self) -> bool;
    fn is_stopped(&self) -> bool;
    fn is_subscribed_to_service_attributes(&self) -> bool;

    async fn connect(&self) -> Result<(), ClientError>;
    async fn disconnect(&self);
    async fn stop(&self);

    /// Install the channel inbound traffic is delivered on. Called once at
    /// gateway startup.
    fn set_inbound(&self, tx: mpsc::UnboundedSender<InboundMessage>);

    /// (Re)issue the platform-side subscriptions for RPC and attribute
    /// topics. Safe to call repeatedly; the watchdog calls it after every
    /// reconnect.
    fn subscribe_to_required_topics(&self);

    // -- gateway self device --
    fn send_telemetry(&self, telemetry: Value) -> PublishHandle;
    fn send_attributes(&self, attributes: Value) -> PublishHandle;

    // -- gateway-scoped device publishes --
    fn gw_send_telemetry(&self, device: &str, telemetry: Value) -> PublishHandle;
    fn gw_send_attributes(&self, device: &str, attributes: Value) -> PublishHandle;

    async fn gw_connect_device(&self, device: &str, device_type: &str) -> PublishResult;
    async fn gw_disconnect_device(&self, device: &str) -> PublishResult;

    /// Reply to a gateway-scoped RPC request. Duplicate replies for one
    /// request id are dropped.
    fn send_rpc_reply(&self, request_id: u64, body: Value, qos: u8) -> PublishHandle;
    /// Reply to a device-scoped RPC request. Duplicate replies for one
    /// request id are dropped.
    fn gw_send_rpc_reply(&self, device: &str, request_id: u64, body: Value) -> PublishHandle;

    /// Request the gateway's own attributes; the response arrives on the
    /// inbound channel as an [`InboundMessage::AttributeUpdate`].
    fn request_attributes(&self, shared_keys: &[String], client_keys: &[String]) -> PublishHandle;
    fn gw_request_shared_attributes(&self, device: &str, keys: &[String]) -> PublishHandle;
    fn gw_request_client_attributes(&self, device: &str, keys: &[String]) -> PublishHandle;

    fn quality_of_service(&self) -> u8 {
        1
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to connect to the platform: {0}")]
    ConnectFailed(String),
}
