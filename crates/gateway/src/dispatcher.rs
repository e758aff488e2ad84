// SPDX-License-Identifier: Apache-2.0

//! Dispatcher (storage reader): pulls event packs, groups them per device,
//! publishes attributes before telemetry, and acknowledges the pack only
//! once every publish confirmed at the configured QoS.

use crate::client::{PlatformClient, PublishHandle};
use crate::registry::DeviceRegistry;
use futures_util::stream::{self, StreamExt};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tbgw_core::GATEWAY_DEVICE;
use tbgw_storage::EventStorage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

const CONFIRMATION_PARALLELISM: usize = 4;
const DISCONNECTED_WAIT: Duration = Duration::from_secs(1);
const REPLY_YIELD: Duration = Duration::from_millis(10);

/// Telemetry and attributes of one device within a pack.
#[derive(Default)]
struct DeviceGroup {
    telemetry: Vec<Value>,
    attributes: Map<String, Value>,
}

pub struct Dispatcher {
    gateway_name: String,
    client: Arc<dyn PlatformClient>,
    storage: Arc<dyn EventStorage>,
    registry: Arc<DeviceRegistry>,
    rpc_reply_in_flight: Arc<AtomicBool>,
    remote_config_in_progress: Arc<AtomicBool>,
    min_pack_send_delay: Duration,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway_name: String,
        client: Arc<dyn PlatformClient>,
        storage: Arc<dyn EventStorage>,
        registry: Arc<DeviceRegistry>,
        rpc_reply_in_flight: Arc<AtomicBool>,
        remote_config_in_progress: Arc<AtomicBool>,
        min_pack_send_delay: Duration,
    ) -> Self {
        Self {
            gateway_name,
            client,
            storage,
            registry,
            rpc_reply_in_flight,
            remote_config_in_progress,
            min_pack_send_delay,
        }
    }

    pub async fn run(self, stop: CancellationToken) {
        while !stop.is_cancelled() {
            if !self.client.is_connected() {
                if wait(&stop, DISCONNECTED_WAIT).await {
                    break;
                }
                continue;
            }
            if self.remote_config_in_progress.load(Ordering::SeqCst) {
                if wait(&stop, self.min_pack_send_delay).await {
                    break;
                }
                continue;
            }

            let events = self.storage.get_event_pack();
            if events.is_empty() {
                if wait(&stop, self.min_pack_send_delay).await {
                    break;
                }
                continue;
            }

            // RPC replies take priority on the out-queue.
            while self.rpc_reply_in_flight.load(Ordering::SeqCst) {
                if wait(&stop, REPLY_YIELD).await {
                    return;
                }
            }
            if !self.client.is_connected() {
                // Abort without acknowledging; the pack will be replayed.
                continue;
            }

            let groups = group_events(&events);
            let handles = self.publish(groups);
            let delivered = self.confirm(handles).await;

            if delivered
                && self.client.is_connected()
                && !self.remote_config_in_progress.load(Ordering::SeqCst)
            {
                self.storage.event_pack_processing_done();
            } else {
                debug!("event pack not confirmed, it will be resent");
            }
        }
        debug!("dispatcher stopped");
    }

    fn publish(&self, groups: Vec<(String, DeviceGroup)>) -> Vec<PublishHandle> {
        let mut handles = Vec::new();
        for (device, group) in groups {
            // A rename may have landed while the pack sat in the store.
            let final_name = self.registry.resolve_current(&device);
            let own_device = device == self.gateway_name || device == GATEWAY_DEVICE;

            if !group.attributes.is_empty() {
                let attributes = Value::Object(group.attributes);
                handles.push(if own_device {
                    self.client.send_attributes(attributes)
                } else {
                    self.client.gw_send_attributes(&final_name, attributes)
                });
            }
            if !group.telemetry.is_empty() {
                let telemetry = Value::Array(group.telemetry);
                handles.push(if own_device {
                    self.client.send_telemetry(telemetry)
                } else {
                    self.client.gw_send_telemetry(&final_name, telemetry)
                });
            }
        }
        handles
    }

    /// A pack counts as delivered only when every publish confirmed
    /// success. With QoS 0 there is nothing to wait for.
    async fn confirm(&self, handles: Vec<PublishHandle>) -> bool {
        if self.client.quality_of_service() == 0 {
            return true;
        }
        let mut confirmations = stream::iter(handles)
            .map(PublishHandle::get)
            .buffer_unordered(CONFIRMATION_PARALLELISM);
        while let Some(result) = confirmations.next().await {
            if !result.is_success() {
                return false;
            }
        }
        true
    }
}

/// Group a pack per device, keeping first-appearance order.
fn group_events(events: &[String]) -> Vec<(String, DeviceGroup)> {
    let mut groups: Vec<(String, DeviceGroup)> = Vec::new();
    for event in events {
        let parsed: Value = match serde_json::from_str(event) {
            Ok(parsed) => parsed,
            Err(e) => {
                error!("error while processing stored event, it will be skipped: {e}");
                continue;
            }
        };
        let Some(device) = parsed.get("deviceName").and_then(Value::as_str) else {
            error!("stored event has no deviceName, it will be skipped");
            continue;
        };

        let index = match groups.iter().position(|(name, _)| name == device) {
            Some(index) => index,
            None => {
                groups.push((device.to_string(), DeviceGroup::default()));
                groups.len() - 1
            }
        };
        let (_, group) = &mut groups[index];

        let metadata = parsed.get("metadata").cloned();
        match parsed.get("telemetry") {
            Some(Value::Array(entries)) => {
                for entry in entries {
                    group.telemetry.push(with_metadata(entry.clone(), &metadata));
                }
            }
            Some(entry @ Value::Object(_)) => {
                group.telemetry.push(with_metadata(entry.clone(), &metadata));
            }
            _ => {}
        }
        match parsed.get("attributes") {
            Some(Value::Object(map)) => group.attributes.extend(map.clone()),
            Some(Value::Array(items)) => {
                for item in items {
                    if let Value::Object(map) = item {
                        group.attributes.extend(map.clone());
                    }
                }
            }
            _ => {}
        }
    }
    groups
}

/// Diagnostic metadata rides along on timestamped telemetry entries.
fn with_metadata(mut entry: Value, metadata: &Option<Value>) -> Value {
    if let (Some(metadata), Value::Object(map)) = (metadata, &mut entry) {
        if map.contains_key("ts") {
            map.insert("metadata".to_string(), metadata.clone());
        }
    }
    entry
}

/// Interruptible sleep; returns `true` when the stop token fired.
async fn wait(stop: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = stop.cancelled() => true,
        () = tokio::time::sleep(duration) => false,
    }
}

#[cfg(test)]
#[path = "dispatcher_tests.rs"]
mod tests;
