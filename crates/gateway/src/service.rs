// SPDX-License-Identifier: Apache-2.0

//! Gateway service: wires the registries, queues, store, and client
//! together, runs the worker set, and owns the shutdown sequence.

use crate::client::{ClientError, InboundMessage, PlatformClient};
use crate::dispatcher::Dispatcher;
use crate::intake::{ConversionIntake, ConversionItem};
use crate::lifecycle::{ConnectorIndex, ConnectorLifecycle};
use crate::registry::DeviceRegistry;
use crate::rpc::{DeviceRpc, ReplyJob, RpcRouter};
use crate::sync::{SharedAttrSync, SharedAttributeCache, SyncRequest};
use crate::watchdog::{run_idle_checker, Watchdog};
use crate::writer::StorageWriter;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tbgw_core::{Clock, GeneralConfig, SubmitStatus, SystemClock};
use tbgw_connector::{
    AttributesUpdate, ConnectorRegistry, DataEvent, DeviceFilter, ReportStrategyService,
};
use tbgw_storage::{EventStorage, StorageError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const WORKER_JOIN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("client error: {0}")]
    Client(#[from] ClientError),
    #[error("gateway already started")]
    AlreadyStarted,
}

/// Device actions processed out-of-line from connector callbacks.
enum DeviceAction {
    Connect { device: String, connector_name: String, device_type: Option<String> },
    Disconnect { device: String },
}

struct PendingReceivers {
    conversion_rx: mpsc::UnboundedReceiver<ConversionItem>,
    device_rpc_rx: mpsc::UnboundedReceiver<DeviceRpc>,
    reply_rx: mpsc::UnboundedReceiver<ReplyJob>,
    sync_rx: mpsc::UnboundedReceiver<SyncRequest>,
    actions_rx: mpsc::UnboundedReceiver<DeviceAction>,
    inbound_rx: mpsc::UnboundedReceiver<InboundMessage>,
}

pub struct GatewayService<C: Clock = SystemClock> {
    name: String,
    config: GeneralConfig,
    clock: C,
    client: Arc<dyn PlatformClient>,
    storage: Arc<dyn EventStorage>,
    registry: Arc<DeviceRegistry>,
    intake: Arc<ConversionIntake<C>>,
    rpc: Arc<RpcRouter<C>>,
    lifecycle: Arc<ConnectorLifecycle>,
    shared_cache: Arc<SharedAttributeCache>,
    remote_config_in_progress: Arc<AtomicBool>,
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    actions_tx: mpsc::UnboundedSender<DeviceAction>,
    pending: Mutex<Option<PendingReceivers>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stop: CancellationToken,
    stopped: AtomicBool,
}

impl GatewayService<SystemClock> {
    pub fn new(
        config: GeneralConfig,
        config_dir: PathBuf,
        client: Arc<dyn PlatformClient>,
        factories: ConnectorRegistry,
    ) -> Result<Self, GatewayError> {
        Self::with_clock(config, config_dir, client, factories, SystemClock)
    }
}

impl<C: Clock> GatewayService<C> {
    pub fn with_clock(
        config: GeneralConfig,
        config_dir: PathBuf,
        client: Arc<dyn PlatformClient>,
        factories: ConnectorRegistry,
        clock: C,
    ) -> Result<Self, GatewayError> {
        let storage = tbgw_storage::build_storage(&config.storage)?;
        let tb = &config.thingsboard;

        let (conversion_tx, conversion_rx) = mpsc::unbounded_channel();
        let (device_rpc_tx, device_rpc_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let (sync_tx, sync_rx) = mpsc::unbounded_channel();
        let (actions_tx, actions_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let shared_cache = Arc::new(SharedAttributeCache::default());
        let report_strategy =
            ReportStrategyService::from_section(tb.report_strategy.as_ref()).map(Arc::new);
        let device_filter = tb.device_filtering.as_ref().filter(|f| f.enable).and_then(|f| {
            let file = f.filter_file.as_ref()?;
            match DeviceFilter::load(&config_dir.join(file)) {
                Ok(filter) => Some(filter),
                Err(e) => {
                    warn!("cannot load device filter, filtering disabled: {e}");
                    None
                }
            }
        });

        let registry = Arc::new(DeviceRegistry::new(
            config_dir.join("connected_devices.json"),
            client.clone(),
            conversion_tx.clone(),
            sync_tx,
            shared_cache.clone(),
            tb.sync_devices_shared_attributes_on_connect,
            tb.handle_device_renaming,
        ));

        let intake = Arc::new(ConversionIntake::new(
            conversion_tx,
            device_filter,
            report_strategy.clone(),
            tb.latency_debug_mode,
            clock.clone(),
        ));

        let lifecycle = Arc::new(ConnectorLifecycle::new(
            config_dir,
            factories,
            ConnectorIndex::default(),
            registry.clone(),
            report_strategy,
            intake.clone(),
            client.clone(),
            config.grpc.as_ref().is_some_and(|grpc| grpc.enabled),
        ));

        let rpc = Arc::new(RpcRouter::new(
            clock.clone(),
            client.clone(),
            registry.clone(),
            lifecycle.index().clone(),
            reply_tx,
            device_rpc_tx,
            Arc::new(AtomicBool::new(false)),
            Arc::new(Mutex::new(HashMap::new())),
        ));

        let service = Self {
            name: generate_gateway_name(),
            config,
            clock,
            client,
            storage,
            registry,
            intake,
            rpc,
            lifecycle,
            shared_cache,
            remote_config_in_progress: Arc::new(AtomicBool::new(false)),
            inbound_tx,
            actions_tx,
            pending: Mutex::new(Some(PendingReceivers {
                conversion_rx,
                device_rpc_rx,
                reply_rx,
                sync_rx,
                actions_rx,
                inbound_rx,
            })),
            workers: Mutex::new(Vec::new()),
            stop: CancellationToken::new(),
            stopped: AtomicBool::new(false),
        };
        Ok(service)
    }

    /// Load connectors, connect the client, and spawn the worker set.
    pub async fn start(&self) -> Result<(), GatewayError> {
        let Some(receivers) = self.pending.lock().take() else {
            return Err(GatewayError::AlreadyStarted);
        };
        info!("gateway starting...");

        self.lifecycle.load_connectors(&self.config.connectors);
        self.registry.load_snapshot(self.lifecycle.index());
        self.client.set_inbound(self.inbound_tx.clone());
        self.client.connect().await?;
        self.lifecycle.connect_with_connectors().await;

        self.spawn_workers(receivers);
        info!("gateway started");
        Ok(())
    }

    fn spawn_workers(&self, receivers: PendingReceivers) {
        let tb = &self.config.thingsboard;
        let mut workers = self.workers.lock();

        let writer = StorageWriter::new(
            self.name.clone(),
            self.storage.clone(),
            self.registry.clone(),
            self.lifecycle.index().clone(),
            self.client.clone(),
            self.clock.clone(),
            tb.effective_payload_limit(),
            tb.latency_debug_mode,
            tb.checking_device_activity.check_device_inactivity,
            self.rpc.incoming_counters(),
        );
        workers.push(tokio::spawn(writer.run(receivers.conversion_rx, self.stop.clone())));

        let dispatcher = Dispatcher::new(
            self.name.clone(),
            self.client.clone(),
            self.storage.clone(),
            self.registry.clone(),
            self.rpc.reply_in_flight_flag(),
            self.remote_config_in_progress.clone(),
            Duration::from_millis(tb.min_pack_send_delay_ms),
        );
        workers.push(tokio::spawn(dispatcher.run(self.stop.clone())));

        workers.push(tokio::spawn(
            self.rpc.clone().run_device_worker(receivers.device_rpc_rx, self.stop.clone()),
        ));
        workers.push(tokio::spawn(
            self.rpc.clone().run_reply_worker(receivers.reply_rx, self.stop.clone()),
        ));

        let sync = SharedAttrSync::new(
            self.shared_cache.clone(),
            self.client.clone(),
            self.registry.clone(),
        );
        workers.push(tokio::spawn(sync.run(receivers.sync_rx, self.stop.clone())));

        workers.push(tokio::spawn(run_device_actions(
            receivers.actions_rx,
            self.registry.clone(),
            self.lifecycle.index().clone(),
            self.stop.clone(),
        )));

        let router = InboundRouter {
            registry: self.registry.clone(),
            shared_cache: self.shared_cache.clone(),
            rpc: self.rpc.clone(),
            sync_on_connect: tb.sync_devices_shared_attributes_on_connect,
        };
        workers.push(tokio::spawn(router.run(receivers.inbound_rx, self.stop.clone())));

        let watchdog = Watchdog::new(
            self.clock.clone(),
            self.client.clone(),
            self.registry.clone(),
            self.rpc.clone(),
            self.lifecycle.clone(),
            self.shared_cache.clone(),
            self.remote_config_in_progress.clone(),
            Duration::from_secs(tb.check_connectors_configuration_in_seconds),
            None,
        );
        workers.push(tokio::spawn(watchdog.run(self.stop.clone())));

        let activity = &tb.checking_device_activity;
        if activity.check_device_inactivity {
            info!("device idle-time checking enabled");
            workers.push(tokio::spawn(run_idle_checker(
                self.clock.clone(),
                self.registry.clone(),
                Duration::from_secs(activity.inactivity_check_period_seconds.max(1)),
                Duration::from_secs(activity.inactivity_timeout_seconds),
                self.stop.clone(),
            )));
        }
    }

    /// Shutdown sequence: signal stop, close connectors with grace, close
    /// the store, stop the client, then join the workers.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("gateway stopping...");
        self.stop.cancel();
        self.lifecycle.close_connectors().await;
        self.storage.stop();
        self.client.disconnect().await;
        self.client.stop().await;

        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if tokio::time::timeout(WORKER_JOIN_GRACE, worker).await.is_err() {
                warn!("worker did not stop within the grace period");
            }
        }
        info!("gateway stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Submission entry point; connectors normally go through the
    /// [`tbgw_connector::DataSink`] handed to them at construction.
    pub fn submit(&self, connector_name: &str, connector_id: &str, data: DataEvent) -> SubmitStatus {
        self.intake.submit(connector_name, connector_id, data)
    }

    /// Queue a device add to run out-of-line. Fails when already saved.
    pub fn add_device_async(
        &self,
        device: &str,
        connector_name: &str,
        device_type: Option<&str>,
    ) -> SubmitStatus {
        if self.registry.is_saved(device) {
            return SubmitStatus::Failure;
        }
        let action = DeviceAction::Connect {
            device: device.to_string(),
            connector_name: connector_name.to_string(),
            device_type: device_type.map(str::to_string),
        };
        match self.actions_tx.send(action) {
            Ok(()) => SubmitStatus::Success,
            Err(_) => SubmitStatus::Failure,
        }
    }

    /// Queue a device delete to run out-of-line. Fails when unknown.
    pub fn del_device_async(&self, device: &str) -> SubmitStatus {
        if !self.registry.is_saved(device) {
            return SubmitStatus::Failure;
        }
        match self.actions_tx.send(DeviceAction::Disconnect { device: device.to_string() }) {
            Ok(()) => SubmitStatus::Success,
            Err(_) => SubmitStatus::Failure,
        }
    }

    /// Suppresses the dispatcher and the hot-reload poll while a remote
    /// configuration session runs.
    pub fn set_remote_configuration_in_progress(&self, in_progress: bool) {
        self.remote_config_in_progress.store(in_progress, Ordering::SeqCst);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn rpc(&self) -> &Arc<RpcRouter<C>> {
        &self.rpc
    }

    pub fn lifecycle(&self) -> &Arc<ConnectorLifecycle> {
        &self.lifecycle
    }

    pub fn connectors(&self) -> &ConnectorIndex {
        self.lifecycle.index()
    }

    pub fn storage(&self) -> &Arc<dyn EventStorage> {
        &self.storage
    }

    pub fn shared_cache(&self) -> &Arc<SharedAttributeCache> {
        &self.shared_cache
    }
}

/// Routes inbound platform traffic to the RPC queues and the attribute
/// paths.
struct InboundRouter<C: Clock> {
    registry: Arc<DeviceRegistry>,
    shared_cache: Arc<SharedAttributeCache>,
    rpc: Arc<RpcRouter<C>>,
    sync_on_connect: bool,
}

impl<C: Clock> InboundRouter<C> {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<InboundMessage>, stop: CancellationToken) {
        loop {
            let message = tokio::select! {
                _ = stop.cancelled() => break,
                message = rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            match message {
                InboundMessage::ServerRpc { request_id, content } => {
                    self.rpc.handle_request(tbgw_core::RpcRequest::new(request_id, content)).await;
                }
                InboundMessage::AttributeUpdate { content } => {
                    self.handle_attribute_update(content).await;
                }
            }
        }
        debug!("inbound router stopped");
    }

    async fn handle_attribute_update(&self, content: Value) {
        match content.get("device").and_then(Value::as_str).map(str::to_string) {
            Some(device) => self.handle_device_update(&device, &content).await,
            None => self.handle_service_update(&content),
        }
    }

    /// Shared-attribute update (or request response) for one device.
    async fn handle_device_update(&self, device: &str, content: &Value) {
        let data = content
            .get("data")
            .or_else(|| content.get("values"))
            .and_then(Value::as_object)
            .cloned();
        let Some(data) = data else {
            error!(device, "unexpected format of attribute update received");
            return;
        };

        let target = self.registry.resolve_original(device);
        if self.sync_on_connect {
            self.shared_cache.update(&target, &data);
        }
        if let Some(connector) = self.registry.device_connector(&target) {
            connector
                .on_attributes_update(AttributesUpdate { device: target, data })
                .await;
        }
    }

    /// Gateway-scoped attributes: service notifications and the shared
    /// section of attribute-request responses.
    fn handle_service_update(&self, content: &Value) {
        let payload = content.get("shared").unwrap_or(content);

        if let Some(level) = payload.get("RemoteLoggingLevel").and_then(Value::as_str) {
            // The remote log handler lives outside the core.
            info!(level, "remote logging level update received");
        }
        if let Some(renames) = payload.get("device_renamed").and_then(Value::as_object) {
            for (old, new) in renames {
                if let Some(new) = new.as_str() {
                    self.registry.rename_event(old, new);
                }
            }
        }
        match payload.get("device_deleted") {
            Some(Value::String(device)) => {
                self.registry.delete_event(device);
            }
            Some(Value::Array(devices)) => {
                for device in devices.iter().filter_map(Value::as_str) {
                    self.registry.delete_event(device);
                }
            }
            _ => {}
        }
        if payload.get("general_configuration").is_some() {
            debug!("remote configuration update received, deferring to the remote configurator");
        }
    }
}

async fn run_device_actions(
    mut rx: mpsc::UnboundedReceiver<DeviceAction>,
    registry: Arc<DeviceRegistry>,
    connectors: ConnectorIndex,
    stop: CancellationToken,
) {
    loop {
        let action = tokio::select! {
            _ = stop.cancelled() => break,
            action = rx.recv() => match action {
                Some(action) => action,
                None => break,
            },
        };
        match action {
            DeviceAction::Connect { device, connector_name, device_type } => {
                match connectors.get_by_name(&connector_name) {
                    Some(connector) => {
                        registry.add_device(&device, &connector, device_type.as_deref()).await;
                    }
                    None => warn!(device = %device, connector = %connector_name, "cannot add device, connector unknown"),
                }
            }
            DeviceAction::Disconnect { device } => {
                registry.del_device(&device, true).await;
            }
        }
    }
    debug!("device-actions worker stopped");
}

/// The gateway's own submissions are tagged with a random self name.
fn generate_gateway_name() -> String {
    let hex = format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    );
    hex.chars()
        .map(|c| {
            let offset = c.to_digit(16).unwrap_or(0) as u8;
            (b'a' + offset) as char
        })
        .collect()
}
