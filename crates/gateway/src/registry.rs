// SPDX-License-Identifier: Apache-2.0

//! Device registry: connected / saved / disconnected devices, the renaming
//! map, and the persistence snapshot.
//!
//! A device entry holds a weak reference to its connector plus the cached
//! connector name and id, so a closed connector never dangles an entry and
//! the snapshot can still be written. The snapshot file is rewritten
//! atomically on every mutation under a single lock.

use crate::client::PlatformClient;
use crate::intake::ConversionItem;
use crate::lifecycle::ConnectorIndex;
use crate::sync::{SharedAttributeCache, SyncRequest};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tbgw_core::{ConvertedData, DeviceRecord, RenameMap, StoredDeviceRecord};
use tbgw_connector::Connector;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

struct DeviceEntry {
    connector: Weak<dyn Connector>,
    connector_name: String,
    connector_id: String,
    device_type: String,
    last_receiving_data_ms: Option<u64>,
}

impl DeviceEntry {
    fn for_connector(connector: &Arc<dyn Connector>, device_type: &str) -> Self {
        Self {
            connector: Arc::downgrade(connector),
            connector_name: connector.name(),
            connector_id: connector.id(),
            device_type: device_type.to_string(),
            last_receiving_data_ms: None,
        }
    }

    fn to_record(&self, renaming: Option<String>, disconnected: bool) -> DeviceRecord {
        DeviceRecord {
            connector_name: self.connector_name.clone(),
            connector_id: self.connector_id.clone(),
            device_type: self.device_type.clone(),
            renaming,
            disconnected,
        }
    }
}

#[derive(Default)]
struct RegistryState {
    connected: HashMap<String, DeviceEntry>,
    saved: HashMap<String, DeviceEntry>,
    disconnected: HashMap<String, DeviceRecord>,
    /// Device-details attributes already published, per device.
    added: HashMap<String, (String, String)>,
    renamed: RenameMap,
}

pub struct DeviceRegistry {
    state: Mutex<RegistryState>,
    snapshot_path: PathBuf,
    client: Arc<dyn PlatformClient>,
    conversion_tx: mpsc::UnboundedSender<ConversionItem>,
    sync_tx: mpsc::UnboundedSender<SyncRequest>,
    shared_cache: Arc<SharedAttributeCache>,
    sync_on_connect: bool,
    handle_renaming: bool,
}

impl DeviceRegistry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        snapshot_path: PathBuf,
        client: Arc<dyn PlatformClient>,
        conversion_tx: mpsc::UnboundedSender<ConversionItem>,
        sync_tx: mpsc::UnboundedSender<SyncRequest>,
        shared_cache: Arc<SharedAttributeCache>,
        sync_on_connect: bool,
        handle_renaming: bool,
    ) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            snapshot_path,
            client,
            conversion_tx,
            sync_tx,
            shared_cache,
            sync_on_connect,
            handle_renaming,
        }
    }

    /// Add a device under `connector`. Idempotent; returns `false` only
    /// when the platform is not connected (identity operations need it).
    pub async fn add_device(
        &self,
        name: &str,
        connector: &Arc<dyn Connector>,
        device_type: Option<&str>,
    ) -> bool {
        if !self.client.is_connected() {
            self.shared_cache.clear();
            return false;
        }
        let device_type = device_type.unwrap_or("default");

        let details = {
            let mut state = self.state.lock();
            if state.renamed.contains_original(name) {
                // Already known under its renamed form.
                let current = state.renamed.resolve(name).to_string();
                self.enqueue_sync(&current, connector);
                state.disconnected.remove(name);
                self.save_locked(&state);
                return true;
            }
            if state.connected.contains_key(name) || state.renamed.original_name(name).is_some() {
                self.enqueue_sync(name, connector);
                return true;
            }

            state
                .connected
                .insert(name.to_string(), DeviceEntry::for_connector(connector, device_type));
            state
                .saved
                .insert(name.to_string(), DeviceEntry::for_connector(connector, device_type));

            let details = (connector.name(), connector.connector_type());
            let details_changed = state.added.get(name) != Some(&details);
            if details_changed {
                state.added.insert(name.to_string(), details.clone());
            }
            self.save_locked(&state);
            details_changed.then_some(details)
        };

        if !self.client.gw_connect_device(name, device_type).await.is_success() {
            warn!(device = name, "device connect was not confirmed by the platform");
        }
        if let Some((connector_name, connector_type)) = details {
            let _ = self.client.gw_send_attributes(
                name,
                json!({"connectorName": connector_name, "connectorType": connector_type}),
            );
        }
        self.enqueue_sync(name, connector);
        true
    }

    /// Remove a device. With `remove = false` the identity survives for
    /// later rename resolution (connector restart path).
    pub async fn del_device(&self, name: &str, remove: bool) {
        {
            let mut state = self.state.lock();
            let entry = state.connected.remove(name);
            if let Some(entry) = entry {
                if state.renamed.contains_original(name) {
                    let renaming = state.renamed.current_name(name).map(str::to_string);
                    state.disconnected.insert(name.to_string(), entry.to_record(renaming, true));
                }
            } else {
                state.disconnected.remove(name);
            }
            state.saved.remove(name);
            state.added.remove(name);
            self.save_locked(&state);
        }
        if !self.client.gw_disconnect_device(name).await.is_success() {
            debug!(device = name, "device disconnect was not confirmed by the platform");
        }
        if remove {
            self.shared_cache.purge(name);
        }
    }

    /// Rebind a device to a (new) connector instance. Observable through
    /// the pipeline as a `{connectorName}` attribute record.
    pub fn update_device_connector(&self, name: &str, connector: &Arc<dyn Connector>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(entry) = state.connected.get_mut(name) else {
            return;
        };
        let changed = entry.connector_id != connector.id()
            || entry.connector.upgrade().is_none();
        entry.connector = Arc::downgrade(connector);
        entry.connector_name = connector.name();
        entry.connector_id = connector.id();
        let device_type = entry.device_type.clone();
        if let Some(saved) = state.saved.get_mut(name) {
            saved.connector = Arc::downgrade(connector);
            saved.connector_name = connector.name();
            saved.connector_id = connector.id();
        }
        if !changed {
            return;
        }
        self.save_locked(state);
        drop(guard);

        let mut data = ConvertedData::new(name, device_type);
        data.attributes.insert("connectorName".to_string(), json!(connector.name()));
        let _ = self.conversion_tx.send(ConversionItem {
            connector_name: connector.name(),
            connector_id: connector.id(),
            data,
        });
    }

    /// Rebind every device recorded against `connector`'s name or id.
    pub fn rebind_connector_devices(&self, connector: &Arc<dyn Connector>) {
        let names: Vec<String> = {
            let state = self.state.lock();
            state
                .connected
                .iter()
                .filter(|(_, entry)| {
                    entry.connector_name == connector.name()
                        || entry.connector_id == connector.id()
                })
                .map(|(name, _)| name.clone())
                .collect()
        };
        for name in names {
            self.update_device_connector(&name, connector);
        }
    }

    pub fn devices_of_connector(&self, connector_id: &str) -> Vec<String> {
        let state = self.state.lock();
        state
            .connected
            .iter()
            .filter(|(_, entry)| entry.connector_id == connector_id)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state.lock().connected.contains_key(name)
    }

    /// True when the device is registered under this name or, after a
    /// rename, under its original name. The connected map stays keyed by
    /// the original name, so a renamed device must never read as new.
    pub fn is_known(&self, name: &str) -> bool {
        let state = self.state.lock();
        state.connected.contains_key(name)
            || state
                .renamed
                .original_name(name)
                .is_some_and(|original| state.connected.contains_key(original))
    }

    pub fn is_saved(&self, name: &str) -> bool {
        self.state.lock().saved.contains_key(name)
    }

    pub fn device_connector(&self, name: &str) -> Option<Arc<dyn Connector>> {
        self.state.lock().connected.get(name).and_then(|entry| entry.connector.upgrade())
    }

    pub fn device_type_of(&self, name: &str) -> Option<String> {
        let state = self.state.lock();
        if let Some(entry) = state.connected.get(name) {
            return Some(entry.device_type.clone());
        }
        if let Some(entry) = state.saved.get(name) {
            return Some(entry.device_type.clone());
        }
        None
    }

    /// Filtered view: device name → device type.
    pub fn get_devices(&self, connector_id: Option<&str>) -> HashMap<String, String> {
        let state = self.state.lock();
        state
            .connected
            .iter()
            .filter(|(_, entry)| connector_id.is_none_or(|id| entry.connector_id == id))
            .map(|(name, entry)| (name.clone(), entry.device_type.clone()))
            .collect()
    }

    /// Device name → owning connector name, for the `devices` RPC.
    pub fn connected_overview(&self) -> BTreeMap<String, String> {
        let state = self.state.lock();
        state
            .connected
            .iter()
            .map(|(name, entry)| (name.clone(), entry.connector_name.clone()))
            .collect()
    }

    pub fn resolve_current(&self, name: &str) -> String {
        self.state.lock().renamed.resolve(name).to_string()
    }

    pub fn resolve_original(&self, name: &str) -> String {
        let state = self.state.lock();
        state.renamed.original_name(name).unwrap_or(name).to_string()
    }

    pub fn is_renamed(&self, name: &str) -> bool {
        self.state.lock().renamed.contains_original(name)
    }

    /// Handle a platform `device_renamed` notification.
    pub fn rename_event(&self, old: &str, new: &str) -> Value {
        if !self.handle_renaming {
            debug!(old, new, "device renaming is disabled, ignoring notification");
            return json!({"success": true});
        }
        info!(old, new, "device renamed by the platform");
        let mut state = self.state.lock();
        if state.renamed.apply(old, new) {
            self.save_locked(&state);
        }
        json!({"success": true})
    }

    /// Handle a platform `device_deleted` notification.
    pub fn delete_event(&self, name: &str) -> Value {
        info!(device = name, "device deleted by the platform");
        let target = {
            let mut state = self.state.lock();
            // A deleted renamed device is purged under its original name.
            let target = state.renamed.remove_by_current(name).unwrap_or_else(|| name.to_string());
            state.renamed.remove(&target);
            state.connected.remove(&target);
            state.saved.remove(&target);
            state.added.remove(&target);
            state.disconnected.remove(&target);
            self.save_locked(&state);
            target
        };
        self.shared_cache.purge(&target);
        self.shared_cache.purge(name);
        json!({"success": true})
    }

    pub fn mark_data_received(&self, name: &str, now_ms: u64) {
        let mut state = self.state.lock();
        // Callers pass the current (possibly renamed) name; the connected
        // map is keyed by the original.
        let key = if state.connected.contains_key(name) {
            name.to_string()
        } else {
            match state.renamed.original_name(name) {
                Some(original) => original.to_string(),
                None => return,
            }
        };
        if let Some(entry) = state.connected.get_mut(&key) {
            entry.last_receiving_data_ms = Some(now_ms);
        }
    }

    /// Devices idle longer than `timeout_ms`. Devices that never reported
    /// get their idle clock started now.
    pub fn idle_devices(&self, timeout_ms: u64, now_ms: u64) -> Vec<String> {
        let mut state = self.state.lock();
        let mut idle = Vec::new();
        for (name, entry) in state.connected.iter_mut() {
            let last = *entry.last_receiving_data_ms.get_or_insert(now_ms);
            if now_ms.saturating_sub(last) >= timeout_ms {
                idle.push(name.clone());
            }
        }
        idle
    }

    /// Saved devices for the reconnect re-add pass.
    pub fn saved_devices(&self) -> Vec<(String, Option<Arc<dyn Connector>>, String)> {
        let state = self.state.lock();
        state
            .saved
            .iter()
            .map(|(name, entry)| {
                (name.clone(), entry.connector.upgrade(), entry.device_type.clone())
            })
            .collect()
    }

    fn enqueue_sync(&self, device: &str, connector: &Arc<dyn Connector>) {
        if !self.sync_on_connect {
            return;
        }
        let _ = self
            .sync_tx
            .send(SyncRequest { device: device.to_string(), connector: connector.clone() });
    }

    // -- persistence --

    /// Load `connected_devices.json`, rebinding connectors by id first and
    /// name second. Entries whose connector is unknown are skipped with a
    /// warning; the legacy array form is accepted.
    pub fn load_snapshot(&self, index: &ConnectorIndex) {
        let raw = match std::fs::read_to_string(&self.snapshot_path) {
            Ok(raw) if !raw.trim().is_empty() => raw,
            _ => {
                debug!("no persisted devices found");
                return;
            }
        };
        let parsed: HashMap<String, StoredDeviceRecord> = match serde_json::from_str(&raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                error!("failed to parse persisted devices: {e}");
                return;
            }
        };

        let mut state = self.state.lock();
        for (name, stored) in parsed {
            let Some(record) = stored.into_record() else {
                warn!(device = %name, "unreadable persisted device entry, skipping");
                continue;
            };
            if let Some(renamed_to) = &record.renaming {
                state.renamed.insert(name.clone(), renamed_to.clone());
            }
            if record.disconnected {
                state.disconnected.insert(name, record);
                continue;
            }
            let connector = index
                .get_by_id(&record.connector_id)
                .or_else(|| index.get_by_name(&record.connector_name));
            let Some(connector) = connector else {
                warn!(
                    device = %name,
                    connector = %record.connector_name,
                    "connector for persisted device not found, skipping"
                );
                continue;
            };
            let entry = DeviceEntry::for_connector(&connector, &record.device_type);
            state.saved.insert(name.clone(), DeviceEntry::for_connector(&connector, &record.device_type));
            state.connected.insert(name, entry);
        }
        info!(devices = state.connected.len(), "persisted devices loaded");
    }

    fn save_locked(&self, state: &RegistryState) {
        let mut records: BTreeMap<String, DeviceRecord> = BTreeMap::new();
        for (name, entry) in &state.connected {
            let renaming = state.renamed.current_name(name).map(str::to_string);
            records.insert(name.clone(), entry.to_record(renaming, false));
        }
        for (name, record) in &state.disconnected {
            let mut record = record.clone();
            record.renaming = state.renamed.current_name(name).map(str::to_string);
            record.disconnected = true;
            records.entry(name.clone()).or_insert(record);
        }

        let raw = match serde_json::to_string_pretty(&records) {
            Ok(raw) => raw,
            Err(e) => {
                error!("failed to serialize device snapshot: {e}");
                return;
            }
        };
        let tmp = self.snapshot_path.with_extension("tmp");
        let result = std::fs::write(&tmp, raw)
            .and_then(|()| std::fs::rename(&tmp, &self.snapshot_path));
        if let Err(e) = result {
            error!("failed to persist device snapshot: {e}");
        }
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
