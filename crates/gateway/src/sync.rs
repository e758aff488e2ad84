// SPDX-License-Identifier: Apache-2.0

//! Shared-attribute synchronizer.
//!
//! When a device is added or reconnects, its connector may want the
//! device's shared attributes. The sync worker serves them from the local
//! cache when possible and otherwise asks the platform; the response comes
//! back through the inbound attribute path, which populates the cache and
//! forwards to the owning connector.

use crate::client::PlatformClient;
use crate::registry::DeviceRegistry;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tbgw_core::ValueMap;
use tbgw_connector::{AttributesUpdate, Connector, SharedAttributeKeys};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Local cache of platform shared attributes, keyed by original device
/// name. Purged on platform disconnect and when a device is removed.
#[derive(Default)]
pub struct SharedAttributeCache {
    map: Mutex<HashMap<String, ValueMap>>,
}

impl SharedAttributeCache {
    pub fn get(&self, device: &str) -> Option<ValueMap> {
        self.map.lock().get(device).cloned()
    }

    pub fn update(&self, device: &str, data: &ValueMap) {
        self.map.lock().entry(device.to_string()).or_default().extend(data.clone());
    }

    pub fn purge(&self, device: &str) {
        self.map.lock().remove(device);
    }

    pub fn purge_all(&self, devices: &[String]) {
        let mut map = self.map.lock();
        for device in devices {
            map.remove(device);
        }
    }

    pub fn clear(&self) {
        self.map.lock().clear();
    }
}

/// One queued sync request.
pub struct SyncRequest {
    pub device: String,
    pub connector: Arc<dyn Connector>,
}

pub struct SharedAttrSync {
    cache: Arc<SharedAttributeCache>,
    client: Arc<dyn PlatformClient>,
    registry: Arc<DeviceRegistry>,
}

impl SharedAttrSync {
    pub fn new(
        cache: Arc<SharedAttributeCache>,
        client: Arc<dyn PlatformClient>,
        registry: Arc<DeviceRegistry>,
    ) -> Self {
        Self { cache, client, registry }
    }

    pub async fn run(
        self,
        mut rx: mpsc::UnboundedReceiver<SyncRequest>,
        stop: CancellationToken,
    ) {
        loop {
            let request = tokio::select! {
                _ = stop.cancelled() => break,
                request = rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };
            self.process(request).await;
        }
        debug!("shared-attribute sync worker stopped");
    }

    async fn process(&self, request: SyncRequest) {
        // The connector and the cache know the device by its original name.
        let target = self.registry.resolve_original(&request.device);
        let keys = request.connector.device_shared_attribute_keys(&target);

        if let Some(cached) = self.cache.get(&target) {
            request
                .connector
                .on_attributes_update(AttributesUpdate { device: target, data: cached })
                .await;
            return;
        }

        let Some(keys) = keys else {
            // Connector does not take shared attributes.
            return;
        };
        let key_list = match keys {
            SharedAttributeKeys::All => Vec::new(),
            SharedAttributeKeys::Keys(keys) => keys,
        };
        let handle = self.client.gw_request_shared_attributes(&request.device, &key_list);
        if !handle.get().await.is_success() {
            error!(device = %request.device, "shared-attribute request was not accepted");
        }
    }
}
