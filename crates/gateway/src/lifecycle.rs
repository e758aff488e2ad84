// SPDX-License-Identifier: Apache-2.0

//! Connector lifecycle: sidecar configuration loading, instantiation
//! through the constructor registry, hot reload, and the GRPC
//! registration side-channel.

use crate::client::PlatformClient;
use crate::registry::DeviceRegistry;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tbgw_core::ConnectorEntry;
use tbgw_connector::{
    AttributesUpdate, Connector, ConnectorError, ConnectorInit, ConnectorRegistry, ConnectorStats,
    DataSink, ReportStrategyKind, ReportStrategyService,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const GRPC_KEYS_FILE: &str = "persistent_grpc_connectors_key.json";
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Live connectors, addressable by name and by id.
#[derive(Clone, Default)]
pub struct ConnectorIndex {
    inner: Arc<RwLock<IndexInner>>,
}

#[derive(Default)]
struct IndexInner {
    by_name: HashMap<String, Arc<dyn Connector>>,
    by_id: HashMap<String, Arc<dyn Connector>>,
}

impl ConnectorIndex {
    pub fn insert(&self, connector: Arc<dyn Connector>) {
        let mut inner = self.inner.write();
        inner.by_name.insert(connector.name(), connector.clone());
        inner.by_id.insert(connector.id(), connector);
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<dyn Connector>> {
        self.inner.read().by_name.get(name).cloned()
    }

    pub fn get_by_id(&self, id: &str) -> Option<Arc<dyn Connector>> {
        self.inner.read().by_id.get(id).cloned()
    }

    pub fn remove_by_id(&self, id: &str) -> Option<Arc<dyn Connector>> {
        let mut inner = self.inner.write();
        let connector = inner.by_id.remove(id)?;
        inner.by_name.remove(&connector.name());
        Some(connector)
    }

    pub fn all(&self) -> Vec<Arc<dyn Connector>> {
        self.inner.read().by_id.values().cloned().collect()
    }

    pub fn of_type(&self, connector_type: &str) -> Vec<Arc<dyn Connector>> {
        self.inner
            .read()
            .by_id
            .values()
            .filter(|connector| connector.connector_type().eq_ignore_ascii_case(connector_type))
            .cloned()
            .collect()
    }

    /// Drop connectors that already stopped on their own.
    pub fn cleanup_stopped(&self) {
        let mut inner = self.inner.write();
        inner.by_id.retain(|_, connector| !connector.is_stopped());
        inner.by_name.retain(|_, connector| !connector.is_stopped());
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.by_id.clear();
        inner.by_name.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One loaded connector configuration.
#[derive(Clone)]
pub struct ConnectorSlot {
    pub name: String,
    pub id: String,
    pub connector_type: String,
    pub config: Value,
    pub config_path: PathBuf,
    /// Sidecar content at load time; hot reload compares against it, so
    /// touching a file without changing it does not trigger a reload.
    pub raw: String,
    pub grpc_key: Option<String>,
    pub report_strategy: Option<ReportStrategyKind>,
}

pub struct ConnectorLifecycle {
    config_dir: PathBuf,
    factories: ConnectorRegistry,
    index: ConnectorIndex,
    devices: Arc<DeviceRegistry>,
    report_strategy: Option<Arc<ReportStrategyService>>,
    sink: Arc<dyn DataSink>,
    client: Arc<dyn PlatformClient>,
    entries: Mutex<Vec<ConnectorEntry>>,
    slots: Mutex<Vec<ConnectorSlot>>,
    grpc_slots: Mutex<HashMap<String, ConnectorSlot>>,
    grpc_enabled: bool,
}

impl ConnectorLifecycle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config_dir: PathBuf,
        factories: ConnectorRegistry,
        index: ConnectorIndex,
        devices: Arc<DeviceRegistry>,
        report_strategy: Option<Arc<ReportStrategyService>>,
        sink: Arc<dyn DataSink>,
        client: Arc<dyn PlatformClient>,
        grpc_enabled: bool,
    ) -> Self {
        Self {
            config_dir,
            factories,
            index,
            devices,
            report_strategy,
            sink,
            client,
            entries: Mutex::new(Vec::new()),
            slots: Mutex::new(Vec::new()),
            grpc_slots: Mutex::new(HashMap::new()),
            grpc_enabled,
        }
    }

    pub fn index(&self) -> &ConnectorIndex {
        &self.index
    }

    /// Load every configured connector's sidecar into a slot. Missing
    /// implementations and broken sidecars are skipped, not fatal.
    pub fn load_connectors(&self, entries: &[ConnectorEntry]) {
        *self.entries.lock() = entries.to_vec();
        let mut slots = Vec::new();
        let mut grpc_slots = HashMap::new();
        let mut grpc_keys = self.load_grpc_keys();
        let mut keys_dirty = false;

        for entry in entries {
            let connector_type = entry.connector_type.to_lowercase();
            let is_grpc = connector_type == "grpc";
            if is_grpc && !self.grpc_enabled {
                error!(
                    connector = %entry.name,
                    "cannot load grpc connector, the grpc server is disabled"
                );
                continue;
            }
            if !is_grpc && !self.factories.contains(&connector_type) {
                error!(connector = %entry.name, r#type = %connector_type, "connector implementation not found");
                continue;
            }

            let slot = match self.load_slot(entry, &connector_type) {
                Some(slot) => slot,
                None => continue,
            };

            if is_grpc {
                let key = match entry.key.as_deref() {
                    Some(key) if key != "auto" => key.to_string(),
                    _ => match grpc_keys.get(&entry.name) {
                        Some(key) => key.clone(),
                        None => {
                            let key = generate_persistent_key();
                            grpc_keys.insert(entry.name.clone(), key.clone());
                            keys_dirty = true;
                            key
                        }
                    },
                };
                info!(connector = %entry.name, key = %key, "grpc connector key resolved");
                grpc_slots.insert(key.clone(), ConnectorSlot { grpc_key: Some(key), ..slot });
            } else {
                slots.push(slot);
            }
        }

        if keys_dirty {
            self.save_grpc_keys(&grpc_keys);
        }
        *self.slots.lock() = slots;
        *self.grpc_slots.lock() = grpc_slots;
    }

    fn load_slot(&self, entry: &ConnectorEntry, connector_type: &str) -> Option<ConnectorSlot> {
        let config_path = self.config_dir.join(&entry.configuration);
        let raw = match std::fs::read_to_string(&config_path) {
            Ok(raw) => raw,
            Err(_) => {
                error!(connector = %entry.name, path = %config_path.display(), "connector configuration file not found");
                return None;
            }
        };
        let mut config: Value = match serde_json::from_str(&raw) {
            Ok(config) => config,
            Err(e) => {
                warn!(connector = %entry.name, "cannot parse connector configuration: {e}");
                return None;
            }
        };

        // A stable id is generated once and written back to the sidecar.
        let (id, raw) = match config.get("id").and_then(Value::as_str) {
            Some(id) => (id.to_string(), raw),
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                if let Value::Object(map) = &mut config {
                    map.insert("id".to_string(), Value::String(id.clone()));
                }
                let rewritten =
                    serde_json::to_string_pretty(&config).unwrap_or_else(|_| raw.clone());
                if let Err(e) = std::fs::write(&config_path, &rewritten) {
                    warn!(connector = %entry.name, "cannot write generated connector id back: {e}");
                    (id, raw)
                } else {
                    (id, rewritten)
                }
            }
        };

        if let Value::Object(map) = &mut config {
            map.insert("name".to_string(), Value::String(entry.name.clone()));
        }
        let report_strategy = config
            .get("reportStrategy")
            .and_then(|section| section.get("type"))
            .and_then(Value::as_str)
            .and_then(ReportStrategyKind::parse);

        Some(ConnectorSlot {
            name: entry.name.clone(),
            id,
            connector_type: connector_type.to_string(),
            config,
            config_path,
            raw,
            grpc_key: None,
            report_strategy,
        })
    }

    /// Instantiate and open every loaded regular connector.
    pub async fn connect_with_connectors(&self) {
        let slots: Vec<ConnectorSlot> = self.slots.lock().clone();
        for slot in slots {
            if let Some(existing) = self.index.get_by_id(&slot.id) {
                if !existing.is_stopped() {
                    debug!(connector = %slot.name, "connector already running, refreshing report strategy only");
                    self.register_report_strategy(&slot);
                    continue;
                }
            }

            let init = ConnectorInit {
                name: slot.name.clone(),
                id: slot.id.clone(),
                connector_type: slot.connector_type.clone(),
                config: slot.config.clone(),
                sink: self.sink.clone(),
            };
            let connector = match self.factories.build(init) {
                Ok(connector) => connector,
                Err(e) => {
                    error!(connector = %slot.name, "error on loading connector: {e}");
                    continue;
                }
            };
            self.index.cleanup_stopped();
            self.index.insert(connector.clone());
            self.register_report_strategy(&slot);
            self.devices.rebind_connector_devices(&connector);
            if let Err(e) = connector.open().await {
                error!(connector = %slot.name, "connector failed to open: {e}");
                self.index.remove_by_id(&slot.id);
                connector.close().await;
            } else {
                info!(connector = %slot.name, r#type = %slot.connector_type, "connector started");
            }
        }
    }

    fn register_report_strategy(&self, slot: &ConnectorSlot) {
        let Some(service) = &self.report_strategy else { return };
        match slot.report_strategy {
            Some(kind) => service.register_connector_strategy(&slot.id, kind),
            None => debug!(
                connector = %slot.name,
                "no separate report strategy, the main strategy will be used"
            ),
        }
    }

    /// Close every connector with a per-connector grace period, releasing
    /// its devices without erasing their identity.
    pub async fn close_connectors(&self) {
        for connector in self.index.all() {
            let name = connector.name();
            if tokio::time::timeout(CLOSE_GRACE, connector.close()).await.is_err() {
                error!(connector = %name, "connector close timeout");
            }
            if self.client.is_connected() {
                for device in self.devices.devices_of_connector(&connector.id()) {
                    self.devices.del_device(&device, false).await;
                }
            }
            debug!(connector = %name, "connector closed");
        }
        self.index.clear();
    }

    /// Hot-reload poll: reload when any sidecar's content differs from the
    /// loaded snapshot. Returns `true` when a reload happened.
    pub async fn check_configuration_updates(&self) -> bool {
        let changed = {
            let slots = self.slots.lock();
            let grpc_slots = self.grpc_slots.lock();
            slots
                .iter()
                .chain(grpc_slots.values())
                .any(|slot| match std::fs::read_to_string(&slot.config_path) {
                    Ok(raw) => raw != slot.raw,
                    Err(_) => true,
                })
        };
        if !changed {
            return false;
        }

        info!("connector configuration changed on disk, reloading connectors");
        let entries = self.entries.lock().clone();
        self.close_connectors().await;
        if let Some(service) = &self.report_strategy {
            service.clear_connector_strategies();
        }
        self.load_connectors(&entries);
        self.connect_with_connectors().await;
        true
    }

    // -- GRPC registration side-channel --

    /// Join a GRPC connector that registered over the control plane.
    pub fn register_grpc_connector(
        &self,
        key: &str,
        control_tx: mpsc::UnboundedSender<GrpcCommand>,
    ) -> Result<Arc<dyn Connector>, ConnectorError> {
        let slot = self
            .grpc_slots
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| ConnectorError::UnknownType(format!("grpc key {key} not configured")))?;
        if self.index.get_by_id(&slot.id).is_some() {
            return Err(ConnectorError::OpenFailed(format!(
                "grpc connector {} already registered",
                slot.name
            )));
        }
        let connector: Arc<dyn Connector> = Arc::new(GrpcStubConnector::new(&slot, control_tx));
        self.index.insert(connector.clone());
        self.devices.rebind_connector_devices(&connector);
        info!(connector = %slot.name, key = %key, "grpc connector registered");
        Ok(connector)
    }

    pub fn unregister_grpc_connector(&self, key: &str) -> bool {
        let slot = match self.grpc_slots.lock().get(key).cloned() {
            Some(slot) => slot,
            None => return false,
        };
        match self.index.remove_by_id(&slot.id) {
            Some(_) => {
                info!(connector = %slot.name, key = %key, "grpc connector unregistered");
                true
            }
            None => false,
        }
    }

    fn load_grpc_keys(&self) -> HashMap<String, String> {
        let path = self.config_dir.join(GRPC_KEYS_FILE);
        match std::fs::read_to_string(&path) {
            Ok(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw).unwrap_or_else(|e| {
                error!("error while loading persistent keys: {e}");
                HashMap::new()
            }),
            _ => {
                debug!("persistent keys file not found");
                HashMap::new()
            }
        }
    }

    fn save_grpc_keys(&self, keys: &HashMap<String, String>) {
        let sorted: std::collections::BTreeMap<_, _> = keys.iter().collect();
        let raw = match serde_json::to_string_pretty(&sorted) {
            Ok(raw) => raw,
            Err(e) => {
                error!("error while saving persistent keys: {e}");
                return;
            }
        };
        if let Err(e) = std::fs::write(self.config_dir.join(GRPC_KEYS_FILE), raw) {
            error!("error while saving persistent keys: {e}");
        }
    }
}

/// 10 hex characters, stable for the connector's lifetime.
fn generate_persistent_key() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..10].to_string()
}

/// Command forwarded to a GRPC connector subprocess.
#[derive(Debug, Clone)]
pub enum GrpcCommand {
    Rpc(Value),
    AttributesUpdate(AttributesUpdate),
    Close,
}

/// In-process stand-in for a connector running as a GRPC subprocess. It
/// forwards gateway calls over the control-plane channel; replies travel
/// out-of-line through the control plane.
pub struct GrpcStubConnector {
    name: String,
    id: String,
    connector_type: String,
    config: Value,
    control_tx: mpsc::UnboundedSender<GrpcCommand>,
    stopped: AtomicBool,
    stats: ConnectorStats,
}

impl GrpcStubConnector {
    fn new(slot: &ConnectorSlot, control_tx: mpsc::UnboundedSender<GrpcCommand>) -> Self {
        Self {
            name: slot.name.clone(),
            id: slot.id.clone(),
            connector_type: slot.connector_type.clone(),
            config: slot.config.clone(),
            control_tx,
            stopped: AtomicBool::new(false),
            stats: ConnectorStats::default(),
        }
    }
}

#[async_trait]
impl Connector for GrpcStubConnector {
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
        !self.stopped.load(Ordering::SeqCst)
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn open(&self) -> Result<(), ConnectorError> {
        self.stopped.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        let _ = self.control_tx.send(GrpcCommand::Close);
        self.stopped.store(true, Ordering::SeqCst);
    }

    async fn server_side_rpc_handler(&self, content: Value) -> Option<Value> {
        self.stats.record_sent();
        let _ = self.control_tx.send(GrpcCommand::Rpc(content));
        None
    }

    async fn on_attributes_update(&self, update: AttributesUpdate) {
        let _ = self.control_tx.send(GrpcCommand::AttributesUpdate(update));
    }

    fn stats(&self) -> &ConnectorStats {
        &self.stats
    }
}

#[cfg(test)]
#[path = "lifecycle_tests.rs"]
mod tests;
