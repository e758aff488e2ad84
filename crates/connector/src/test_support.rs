// SPDX-License-Identifier: Apache-2.0

//! Scriptable connector for gateway tests.

use crate::{
    AttributesUpdate, Connector, ConnectorError, ConnectorInit, ConnectorStats, DataEvent,
    DataSink, SharedAttributeKeys,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tbgw_core::{ConvertedData, SubmitStatus};

/// How the test connector answers a server-side RPC.
#[derive(Debug, Clone)]
pub enum RpcScript {
    /// Handler returns `None` (reply happens out-of-line, or never).
    NoReply,
    Reply(Value),
    DelayedReply(Value, Duration),
    /// Handler never returns; exercises the caller's deadline.
    Stall,
}

pub struct TestConnector {
    name: String,
    id: String,
    connector_type: String,
    config: Value,
    sink: Mutex<Option<Arc<dyn DataSink>>>,
    connected: AtomicBool,
    stopped: AtomicBool,
    open_count: Mutex<u32>,
    rpc_script: Mutex<RpcScript>,
    rpc_calls: Mutex<Vec<Value>>,
    attribute_updates: Mutex<Vec<AttributesUpdate>>,
    shared_keys: Mutex<Option<SharedAttributeKeys>>,
    stats: ConnectorStats,
}

impl TestConnector {
    pub fn new(name: &str, id: &str, connector_type: &str) -> Self {
        Self {
            name: name.to_string(),
            id: id.to_string(),
            connector_type: connector_type.to_string(),
            config: json!({}),
            sink: Mutex::new(None),
            connected: AtomicBool::new(false),
            stopped: AtomicBool::new(true),
            open_count: Mutex::new(0),
            rpc_script: Mutex::new(RpcScript::NoReply),
            rpc_calls: Mutex::new(Vec::new()),
            attribute_updates: Mutex::new(Vec::new()),
            shared_keys: Mutex::new(None),
            stats: ConnectorStats::default(),
        }
    }

    pub fn from_init(init: ConnectorInit) -> Self {
        let mut connector = Self::new(&init.name, &init.id, &init.connector_type);
        connector.config = init.config;
        *connector.sink.get_mut() = Some(init.sink);
        connector
    }

    /// Push a canonical record into the gateway, as a live connector would.
    pub fn submit(&self, data: ConvertedData) -> SubmitStatus {
        let sink = self.sink.lock().clone();
        match sink {
            Some(sink) => {
                self.stats.record_received();
                sink.submit(&self.name, &self.id, DataEvent::Converted(data))
            }
            None => SubmitStatus::Failure,
        }
    }

    pub fn script_rpc(&self, script: RpcScript) {
        *self.rpc_script.lock() = script;
    }

    pub fn set_shared_keys(&self, keys: SharedAttributeKeys) {
        *self.shared_keys.lock() = Some(keys);
    }

    pub fn rpc_calls(&self) -> Vec<Value> {
        self.rpc_calls.lock().clone()
    }

    pub fn attribute_updates(&self) -> Vec<AttributesUpdate> {
        self.attribute_updates.lock().clone()
    }

    pub fn open_count(&self) -> u32 {
        *self.open_count.lock()
    }
}

#[async_trait]
impl Connector for TestConnector {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn id(&self) -> String {
        self.id.clone()
    }

    fn connector_type(&self) -> String {
        self.connector_type.clone()
    }

    fn config(&self) -> Value {
        self.config.clone()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn open(&self) -> Result<(), ConnectorError> {
        self.stopped.store(false, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        *self.open_count.lock() += 1;
        Ok(())
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.stopped.store(true, Ordering::SeqCst);
    }

    async fn server_side_rpc_handler(&self, content: Value) -> Option<Value> {
        self.rpc_calls.lock().push(content);
        let script = self.rpc_script.lock().clone();
        match script {
            RpcScript::NoReply => None,
            RpcScript::Reply(reply) => Some(reply),
            RpcScript::DelayedReply(reply, delay) => {
                tokio::time::sleep(delay).await;
                Some(reply)
            }
            RpcScript::Stall => loop {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
            },
        }
    }

    async fn on_attributes_update(&self, update: AttributesUpdate) {
        self.attribute_updates.lock().push(update);
    }

    fn device_shared_attribute_keys(&self, _device: &str) -> Option<SharedAttributeKeys> {
        self.shared_keys.lock().clone()
    }

    fn stats(&self) -> &ConnectorStats {
        &self.stats
    }
}
