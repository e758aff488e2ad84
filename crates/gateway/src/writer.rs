// SPDX-License-Identifier: Apache-2.0

//! Storage writer: drains the conversion queue in batches, resolves device
//! identity, splits oversize records, and writes them to the event store.

use crate::client::PlatformClient;
use crate::intake::ConversionItem;
use crate::lifecycle::ConnectorIndex;
use crate::registry::DeviceRegistry;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tbgw_core::{Clock, GATEWAY_DEVICE};
use tbgw_storage::EventStorage;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

const BATCH_SIZE: usize = 1_000;
const BATCH_WINDOW: Duration = Duration::from_millis(500);
const PUT_RETRIES: u32 = 4;
const PUT_RETRY_DELAY: Duration = Duration::from_millis(100);

pub struct StorageWriter<C: Clock> {
    gateway_name: String,
    storage: Arc<dyn EventStorage>,
    registry: Arc<DeviceRegistry>,
    connectors: ConnectorIndex,
    client: Arc<dyn PlatformClient>,
    clock: C,
    payload_limit: usize,
    latency_debug: bool,
    idle_check: bool,
    /// Per-connector incoming-message counters, shared with the stats RPC.
    incoming: Arc<Mutex<HashMap<String, u64>>>,
}

impl<C: Clock> StorageWriter<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway_name: String,
        storage: Arc<dyn EventStorage>,
        registry: Arc<DeviceRegistry>,
        connectors: ConnectorIndex,
        client: Arc<dyn PlatformClient>,
        clock: C,
        payload_limit: usize,
        latency_debug: bool,
        idle_check: bool,
        incoming: Arc<Mutex<HashMap<String, u64>>>,
    ) -> Self {
        Self {
            gateway_name,
            storage,
            registry,
            connectors,
            client,
            clock,
            payload_limit,
            latency_debug,
            idle_check,
            incoming,
        }
    }

    pub async fn run(
        self,
        mut rx: mpsc::UnboundedReceiver<ConversionItem>,
        stop: CancellationToken,
    ) {
        loop {
            let first = tokio::select! {
                _ = stop.cancelled() => break,
                item = rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            let mut batch = vec![first];
            let deadline = self.clock.monotonic() + BATCH_WINDOW;
            while batch.len() < BATCH_SIZE && self.clock.monotonic() < deadline {
                match rx.try_recv() {
                    Ok(item) => batch.push(item),
                    Err(_) => break,
                }
            }

            for item in batch {
                self.process(item, &stop).await;
            }
        }
        debug!("storage writer stopped");
    }

    async fn process(&self, item: ConversionItem, stop: &CancellationToken) {
        let ConversionItem { connector_name, connector_id, mut data } = item;

        if connector_name == self.gateway_name {
            // The gateway's own telemetry bypasses the registry.
            data.device_name = GATEWAY_DEVICE.to_string();
            data.device_type = "gateway".to_string();
        } else {
            if !data.is_valid() {
                error!(connector = %connector_name, "invalid record from connector, dropping");
                return;
            }
            data.device_name = self.registry.resolve_current(&data.device_name);

            // Identity operations need the platform. While disconnected the
            // add is deferred to a later submission and the record still
            // buffers into the store.
            if self.client.is_connected() && !self.registry.is_known(&data.device_name) {
                let connector = self
                    .connectors
                    .get_by_id(&connector_id)
                    .or_else(|| self.connectors.get_by_name(&connector_name));
                match connector {
                    Some(connector) => {
                        self.registry
                            .add_device(&data.device_name, &connector, Some(&data.device_type))
                            .await;
                    }
                    None => {
                        trace!(
                            connector = %connector_name,
                            "connector not available, probably disabled, skipping data"
                        );
                        return;
                    }
                }
            }

            *self.incoming.lock().entry(connector_id.clone()).or_insert(0) += 1;
            if self.idle_check {
                self.registry.mark_data_received(&data.device_name, self.clock.epoch_ms());
            }
        }

        if !self.latency_debug {
            data.metadata.clear();
        }

        for fragment in data.split_to_max_size(self.payload_limit) {
            let json = match serde_json::to_string(&fragment) {
                Ok(json) => json,
                Err(e) => {
                    error!(device = %fragment.device_name, "cannot serialize fragment: {e}");
                    continue;
                }
            };
            self.put_with_retry(&json, &fragment.device_name, &connector_name, stop).await;
        }
    }

    async fn put_with_retry(
        &self,
        json: &str,
        device: &str,
        connector_name: &str,
        stop: &CancellationToken,
    ) {
        let mut saved = self.storage.put(json);
        let mut tries = 0;
        while !saved && tries < PUT_RETRIES {
            tokio::select! {
                _ = stop.cancelled() => return,
                () = tokio::time::sleep(PUT_RETRY_DELAY) => {}
            }
            saved = self.storage.put(json);
            tries += 1;
        }
        if !saved {
            error!(
                device,
                connector = connector_name,
                "data from the device cannot be saved, dropping fragment"
            );
        }
    }
}
