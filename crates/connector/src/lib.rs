// SPDX-License-Identifier: Apache-2.0

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! tbgw-connector: the south-bound plug-in contract.
//!
//! A connector adapts one device protocol to the gateway. The gateway holds
//! connectors behind `Arc<dyn Connector>` and never owns their protocol
//! state; a connector owns its own tasks and pushes parsed data through the
//! [`DataSink`] it received at construction time.

pub mod device_filter;
pub mod report_strategy;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
#[cfg(any(test, feature = "test-support"))]
pub use test_support::TestConnector;

pub use device_filter::DeviceFilter;
pub use report_strategy::{ReportStrategyKind, ReportStrategyService};

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tbgw_core::{ConvertedData, SubmitStatus, ValueMap};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("no connector implementation for type: {0}")]
    UnknownType(String),
    #[error("invalid connector configuration: {0}")]
    InvalidConfig(String),
    #[error("connector failed to open: {0}")]
    OpenFailed(String),
}

/// Message counters surfaced through the gateway `stats` RPC.
#[derive(Debug, Default)]
pub struct ConnectorStats {
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
}

impl ConnectorStats {
    pub fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    pub fn sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }
}

/// A shared-attribute update (or request response) for one device.
#[derive(Debug, Clone)]
pub struct AttributesUpdate {
    pub device: String,
    pub data: ValueMap,
}

/// Which shared attributes a connector wants synced for a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SharedAttributeKeys {
    /// Subscribe to everything the platform has.
    All,
    Keys(Vec<String>),
}

/// South-bound protocol plug-in.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    fn name(&self) -> String;
    fn id(&self) -> String;
    fn connector_type(&self) -> String;
    fn config(&self) -> Value;
    fn is_connected(&self) -> bool;
    fn is_stopped(&self) -> bool;

    /// Start the connector's own workers. Called once by the lifecycle
    /// controller after registration.
    async fn open(&self) -> Result<(), ConnectorError>;

    /// Stop workers and release protocol state. Must be idempotent; the
    /// gateway allows 5 s of grace before moving on.
    async fn close(&self);

    /// Handle a server-side RPC addressed to one of this connector's
    /// devices (or to the connector type itself). `None` means the
    /// connector will reply out-of-line, a mapping containing `error` is
    /// relayed to the platform as-is.
    async fn server_side_rpc_handler(&self, content: Value) -> Option<Value>;

    /// Deliver a shared-attribute update for one of this connector's
    /// devices.
    async fn on_attributes_update(&self, update: AttributesUpdate);

    /// Shared-attribute keys to sync when a device of this connector is
    /// added. `None` disables syncing for this connector.
    fn device_shared_attribute_keys(&self, _device: &str) -> Option<SharedAttributeKeys> {
        None
    }

    fn stats(&self) -> &ConnectorStats;
}

/// Where a connector pushes converted data.
pub trait DataSink: Send + Sync {
    fn submit(&self, connector_name: &str, connector_id: &str, data: DataEvent) -> SubmitStatus;
}

/// A submission: the canonical record or the legacy JSON mapping.
#[derive(Debug, Clone)]
pub enum DataEvent {
    Converted(ConvertedData),
    Legacy(Value),
}

/// Everything a connector constructor receives.
pub struct ConnectorInit {
    pub name: String,
    pub id: String,
    pub connector_type: String,
    /// Deep copy of the sidecar configuration.
    pub config: Value,
    pub sink: Arc<dyn DataSink>,
}

pub type ConnectorFactory =
    Arc<dyn Fn(ConnectorInit) -> Result<Arc<dyn Connector>, ConnectorError> + Send + Sync>;

/// Constructor registry keyed by lowercased connector type.
///
/// Populated at startup by the host; replaces dynamic module loading.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    factories: Arc<parking_lot::RwLock<HashMap<String, ConnectorFactory>>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, connector_type: &str, factory: F)
    where
        F: Fn(ConnectorInit) -> Result<Arc<dyn Connector>, ConnectorError> + Send + Sync + 'static,
    {
        self.factories.write().insert(connector_type.to_lowercase(), Arc::new(factory));
    }

    pub fn contains(&self, connector_type: &str) -> bool {
        self.factories.read().contains_key(&connector_type.to_lowercase())
    }

    pub fn build(&self, init: ConnectorInit) -> Result<Arc<dyn Connector>, ConnectorError> {
        let factory = self
            .factories
            .read()
            .get(&init.connector_type.to_lowercase())
            .cloned()
            .ok_or_else(|| ConnectorError::UnknownType(init.connector_type.clone()))?;
        factory(init)
    }
}
