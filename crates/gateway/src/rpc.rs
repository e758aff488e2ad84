// SPDX-License-Identifier: Apache-2.0

//! RPC router: device-targeted requests with per-request deadlines, and
//! gateway-targeted requests (local methods, scheduled side-effects, and
//! connector fan-out by method prefix).
//!
//! Replies serialize through a single reply-sender worker; the dispatcher
//! observes `rpc_reply_in_flight` and defers data publishes while a reply
//! is on the out-queue.

use crate::client::PlatformClient;
use crate::lifecycle::ConnectorIndex;
use crate::registry::DeviceRegistry;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tbgw_core::rpc::{method_not_found_reply, timeout_reply};
use tbgw_core::{Clock, RpcRequest};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEUE_WAIT: Duration = Duration::from_millis(100);
const MIN_SCHEDULE_DELAY_MS: u64 = 1_000;

/// A device-targeted request waiting for dispatch.
pub struct DeviceRpc {
    pub request: RpcRequest,
    pub received: Instant,
}

/// One outbound reply.
pub struct ReplyJob {
    pub device: Option<String>,
    pub request_id: u64,
    pub body: Option<Value>,
    pub success_sent: Option<bool>,
    pub qos: u8,
}

/// An RPC awaiting an out-of-line reply, keyed by platform topic.
pub struct InFlightRpc {
    pub device: Option<String>,
    pub request_id: u64,
    pub deadline: Instant,
    pub cancel: Option<Box<dyn FnOnce() + Send>>,
}

pub type CustomRpcMethod = Arc<dyn Fn(Option<&Value>) -> Value + Send + Sync>;
pub type ScheduledHook = Arc<dyn Fn() + Send + Sync>;

pub struct RpcRouter<C: Clock> {
    clock: C,
    client: Arc<dyn PlatformClient>,
    registry: Arc<DeviceRegistry>,
    connectors: ConnectorIndex,
    reply_tx: mpsc::UnboundedSender<ReplyJob>,
    device_tx: mpsc::UnboundedSender<DeviceRpc>,
    register_tx: mpsc::UnboundedSender<(String, InFlightRpc)>,
    register_rx: Mutex<mpsc::UnboundedReceiver<(String, InFlightRpc)>>,
    in_flight: Mutex<HashMap<String, InFlightRpc>>,
    /// `(fire_at_epoch_ms, method)`, watchdog-only.
    scheduled: Mutex<Vec<(u64, String)>>,
    scheduled_methods: Mutex<HashMap<String, ScheduledHook>>,
    custom_methods: Mutex<HashMap<String, CustomRpcMethod>>,
    rpc_reply_in_flight: Arc<AtomicBool>,
    /// Per-connector incoming-message counters fed by the storage writer.
    incoming: Arc<Mutex<HashMap<String, u64>>>,
}

impl<C: Clock> RpcRouter<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clock: C,
        client: Arc<dyn PlatformClient>,
        registry: Arc<DeviceRegistry>,
        connectors: ConnectorIndex,
        reply_tx: mpsc::UnboundedSender<ReplyJob>,
        device_tx: mpsc::UnboundedSender<DeviceRpc>,
        rpc_reply_in_flight: Arc<AtomicBool>,
        incoming: Arc<Mutex<HashMap<String, u64>>>,
    ) -> Self {
        let (register_tx, register_rx) = mpsc::unbounded_channel();
        Self {
            clock,
            client,
            registry,
            connectors,
            reply_tx,
            device_tx,
            register_tx,
            register_rx: Mutex::new(register_rx),
            in_flight: Mutex::new(HashMap::new()),
            scheduled: Mutex::new(Vec::new()),
            scheduled_methods: Mutex::new(HashMap::new()),
            custom_methods: Mutex::new(HashMap::new()),
            rpc_reply_in_flight,
            incoming,
        }
    }

    /// Route an inbound server-side RPC to the right queue.
    pub async fn handle_request(&self, request: RpcRequest) {
        if request.device().is_some() {
            let received = self.clock.monotonic();
            let _ = self.device_tx.send(DeviceRpc { request, received });
        } else {
            self.handle_gateway_request(request).await;
        }
    }

    /// Host-registered gateway method, callable as `gateway_<name>`.
    pub fn register_custom_method<F>(&self, name: &str, method: F)
    where
        F: Fn(Option<&Value>) -> Value + Send + Sync + 'static,
    {
        self.custom_methods.lock().insert(name.to_string(), Arc::new(method));
    }

    /// Host-registered process-control hook (`restart`, `reboot`), executed
    /// by the watchdog once its scheduled time arrives.
    pub fn register_scheduled_method<F>(&self, name: &str, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.scheduled_methods.lock().insert(name.to_string(), Arc::new(hook));
    }

    /// Track an RPC whose reply will arrive out-of-line. The watchdog
    /// expires it past `timeout_ms`, invoking `cancel` and sending a
    /// failure reply.
    pub fn register_rpc_request_timeout(
        &self,
        topic: &str,
        device: Option<String>,
        request_id: u64,
        timeout_ms: u64,
        cancel: Option<Box<dyn FnOnce() + Send>>,
    ) {
        let deadline = self.clock.monotonic() + Duration::from_millis(timeout_ms);
        let _ = self
            .register_tx
            .send((topic.to_string(), InFlightRpc { device, request_id, deadline, cancel }));
    }

    pub fn is_rpc_in_progress(&self, topic: &str) -> bool {
        self.in_flight.lock().contains_key(topic)
    }

    /// Resolve an out-of-line reply for a tracked request.
    pub fn rpc_with_reply(&self, topic: &str, content: Value) {
        let Some(in_flight) = self.in_flight.lock().remove(topic) else {
            return;
        };
        info!(device = ?in_flight.device, request_id = in_flight.request_id, "outgoing RPC reply");
        self.send_reply(ReplyJob {
            device: in_flight.device,
            request_id: in_flight.request_id,
            body: Some(content),
            success_sent: None,
            qos: 0,
        });
    }

    /// Move registered requests into the in-flight map. Watchdog-driven.
    pub fn drain_registrations(&self) {
        let mut rx = self.register_rx.lock();
        let mut in_flight = self.in_flight.lock();
        while let Ok((topic, request)) = rx.try_recv() {
            in_flight.insert(topic, request);
        }
    }

    /// Expire in-flight requests past their deadline. Watchdog-driven.
    pub fn expire_in_flight(&self) {
        let now = self.clock.monotonic();
        let expired: Vec<(String, InFlightRpc)> = {
            let mut in_flight = self.in_flight.lock();
            let topics: Vec<String> = in_flight
                .iter()
                .filter(|(_, request)| now >= request.deadline)
                .map(|(topic, _)| topic.clone())
                .collect();
            topics.into_iter().filter_map(|topic| in_flight.remove_entry(&topic)).collect()
        };
        for (topic, mut request) in expired {
            error!(topic = %topic, request_id = request.request_id, "RPC request timed out");
            if let Some(cancel) = request.cancel.take() {
                cancel();
            }
            self.send_reply(ReplyJob {
                device: request.device,
                request_id: request.request_id,
                body: None,
                success_sent: Some(false),
                qos: 0,
            });
        }
    }

    /// Run a due scheduled method. Watchdog-driven.
    pub fn fire_due_scheduled(&self) {
        let now_ms = self.clock.epoch_ms();
        let due: Vec<String> = {
            let mut scheduled = self.scheduled.lock();
            let (fire, keep): (Vec<_>, Vec<_>) =
                scheduled.drain(..).partition(|(fire_at, _)| now_ms >= *fire_at);
            *scheduled = keep;
            fire.into_iter().map(|(_, method)| method).collect()
        };
        for method in due {
            let hook = self.scheduled_methods.lock().get(&method).cloned();
            match hook {
                Some(hook) => {
                    info!(method = %method, "executing scheduled RPC");
                    hook();
                }
                None => error!(method = %method, "scheduled RPC has no registered hook"),
            }
        }
    }

    pub fn send_reply(&self, job: ReplyJob) {
        let _ = self.reply_tx.send(job);
    }

    /// Flag the dispatcher polls to defer data publishes to replies.
    pub fn reply_in_flight_flag(&self) -> Arc<AtomicBool> {
        self.rpc_reply_in_flight.clone()
    }

    /// Per-connector incoming-message counters (writer-fed, stats-read).
    pub fn incoming_counters(&self) -> Arc<Mutex<HashMap<String, u64>>> {
        self.incoming.clone()
    }

    // -- device queue --

    pub async fn run_device_worker(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<DeviceRpc>,
        stop: CancellationToken,
    ) {
        loop {
            let item = tokio::select! {
                _ = stop.cancelled() => break,
                item = rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };
            self.process_device_rpc(item, &stop).await;
        }
        debug!("device RPC worker stopped");
    }

    async fn process_device_rpc(&self, item: DeviceRpc, stop: &CancellationToken) {
        let timeout = Duration::from_millis(item.request.timeout_ms(DEFAULT_TIMEOUT.as_millis() as u64));
        let elapsed = self.clock.monotonic().saturating_duration_since(item.received);
        let device = match item.request.device() {
            Some(device) => device.to_string(),
            None => return,
        };

        if elapsed > timeout {
            error!(request_id = item.request.request_id, "RPC request timed out in queue");
            self.send_reply(ReplyJob {
                device: Some(device),
                request_id: item.request.request_id,
                body: Some(timeout_reply()),
                success_sent: None,
                qos: 0,
            });
            return;
        }

        // Inbound requests address the renamed form; connectors know the
        // original.
        let mut request = item.request;
        let original = self.registry.resolve_original(&device);
        if original != device {
            request.set_device(&original);
        }

        match self.registry.device_connector(&original) {
            Some(connector) => {
                let remaining = timeout - elapsed;
                let invocation = connector.server_side_rpc_handler(request.content_with_id());
                match tokio::time::timeout(remaining, invocation).await {
                    Err(_) => {
                        error!(request_id = request.request_id, device = %original, "RPC request timed out");
                        self.send_reply(ReplyJob {
                            device: Some(original),
                            request_id: request.request_id,
                            body: Some(timeout_reply()),
                            success_sent: None,
                            qos: 0,
                        });
                    }
                    // The connector replies out-of-line (or not at all).
                    Ok(None) => {}
                    Ok(Some(result)) => {
                        let failed = result.get("error").is_some();
                        self.send_reply(ReplyJob {
                            device: Some(original),
                            request_id: request.request_id,
                            body: Some(result),
                            success_sent: failed.then_some(false),
                            qos: 0,
                        });
                    }
                }
            }
            None if self.registry.contains(&original) => {
                error!(
                    device = %original,
                    "received RPC request but the connector for the device is gone"
                );
            }
            None => {
                // The device may be mid-add; requeue with a timed wait so
                // this never spins.
                let _ = self.device_tx.send(DeviceRpc { request, received: item.received });
                tokio::select! {
                    _ = stop.cancelled() => {}
                    () = tokio::time::sleep(REQUEUE_WAIT) => {}
                }
            }
        }
    }

    // -- gateway queue --

    pub async fn handle_gateway_request(&self, request: RpcRequest) {
        let request_id = request.request_id;
        let Some(method) = request.method().map(str::to_string) else {
            self.send_reply(ReplyJob {
                device: None,
                request_id,
                body: Some(json!({"error": "Request has no method", "code": 500})),
                success_sent: None,
                qos: 0,
            });
            return;
        };
        let module = method.split('_').next().unwrap_or_default().to_string();

        let result = if module == "gateway" {
            info!(request_id, method = %method, "received RPC request to the gateway");
            Some(self.local_method(&method, &request))
        } else {
            let fan_out = self.connectors.of_type(&module);
            if fan_out.is_empty() {
                error!(module = %module, "connector not found for RPC request");
                Some(json!({
                    "error": format!("{module} - connector not found in available connectors."),
                    "code": 404,
                }))
            } else {
                debug!(module = %module, method = %method, "fanning RPC out to connectors");
                let mut last = None;
                for connector in fan_out {
                    if let Some(result) =
                        connector.server_side_rpc_handler(request.content_with_id()).await
                    {
                        last = Some(result);
                    }
                }
                last
            }
        };

        match result {
            None => self.send_reply(ReplyJob {
                device: None,
                request_id,
                body: None,
                success_sent: Some(false),
                qos: 0,
            }),
            Some(mut result) => {
                let qos = match result.get("qos").and_then(Value::as_u64) {
                    Some(qos) => {
                        if let Value::Object(map) = &mut result {
                            map.remove("qos");
                        }
                        qos as u8
                    }
                    None => 0,
                };
                self.send_reply(ReplyJob {
                    device: None,
                    request_id,
                    body: Some(result),
                    success_sent: None,
                    qos,
                });
            }
        }
    }

    fn local_method(&self, method: &str, request: &RpcRequest) -> Value {
        let name = method.strip_prefix("gateway_").unwrap_or(method);
        let params = request.params();
        match name {
            "ping" => json!({"code": 200, "resp": "pong"}),
            "stats" => json!({"code": 200, "resp": self.form_statistics()}),
            "devices" => json!({"code": 200, "resp": self.registry.connected_overview()}),
            "version" => json!({"code": 200, "resp": {"current_version": env!("CARGO_PKG_VERSION")}}),
            "update" => json!({
                "code": 200,
                "resp": {
                    "current_version": env!("CARGO_PKG_VERSION"),
                    "detail": "updates are managed externally",
                },
            }),
            "device_renamed" => {
                let renamed = params
                    .and_then(Value::as_object)
                    .and_then(|map| map.iter().next())
                    .and_then(|(old, new)| new.as_str().map(|new| (old.clone(), new.to_string())));
                match renamed {
                    Some((old, new)) => self.registry.rename_event(&old, &new),
                    None => json!({"error": "Malformed rename notification", "code": 400}),
                }
            }
            "device_deleted" => match params.and_then(Value::as_str) {
                Some(device) => self.registry.delete_event(device),
                None => json!({"error": "Malformed delete notification", "code": 400}),
            },
            other => {
                let custom = self.custom_methods.lock().get(other).cloned();
                if let Some(custom) = custom {
                    return custom(params);
                }
                if self.scheduled_methods.lock().contains_key(other) {
                    return self.schedule(other, params);
                }
                error!(method = %method, "RPC method not found");
                method_not_found_reply()
            }
        }
    }

    /// Queue a process-control method at `now + max(args_ms, 1s)`.
    fn schedule(&self, method: &str, params: Option<&Value>) -> Value {
        let delay_ms = params
            .and_then(Value::as_u64)
            .map(|seconds| seconds * 1_000)
            .unwrap_or(MIN_SCHEDULE_DELAY_MS)
            .max(MIN_SCHEDULE_DELAY_MS);
        let fire_at = self.clock.epoch_ms() + delay_ms;
        self.scheduled.lock().push((fire_at, method.to_string()));
        info!(method, delay_s = delay_ms / 1_000, "gateway method scheduled");
        json!({"success": true})
    }

    /// Connector message counters, as the `stats` RPC reports them.
    fn form_statistics(&self) -> Value {
        let mut produced_total = 0u64;
        let mut sent_total = 0u64;
        let mut stats = serde_json::Map::new();
        for connector in self.connectors.all() {
            let name: String = connector.name().split_whitespace().collect();
            let produced = connector.stats().received();
            let sent = connector.stats().sent();
            produced_total += produced;
            sent_total += sent;
            stats.insert(format!("{name}EventsProduced"), json!(produced));
            stats.insert(format!("{name}EventsSent"), json!(sent));
            if let Some(incoming) = self.incoming.lock().get(&connector.id()) {
                stats.insert(format!("{name}MessagesReceived"), json!(incoming));
            }
        }
        stats.insert("eventsProduced".to_string(), json!(produced_total));
        stats.insert("eventsSent".to_string(), json!(sent_total));
        Value::Object(stats)
    }

    // -- reply sender --

    pub async fn run_reply_worker(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<ReplyJob>,
        stop: CancellationToken,
    ) {
        loop {
            let job = tokio::select! {
                _ = stop.cancelled() => break,
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            self.deliver_reply(job).await;
        }
        debug!("RPC reply sender stopped");
    }

    async fn deliver_reply(&self, job: ReplyJob) {
        self.rpc_reply_in_flight.store(true, Ordering::SeqCst);
        let device = job.device.map(|device| self.registry.resolve_current(&device));
        let body = normalize_reply(job.body, job.success_sent);
        let handle = match &device {
            Some(device) => self.client.gw_send_rpc_reply(device, job.request_id, body),
            None => self.client.send_rpc_reply(job.request_id, body, job.qos),
        };
        if !handle.get().await.is_success() {
            error!(request_id = job.request_id, "error while sending RPC reply");
        }
        self.rpc_reply_in_flight.store(false, Ordering::SeqCst);
    }
}

/// Normalize a reply body the way the platform expects it.
fn normalize_reply(body: Option<Value>, success_sent: Option<bool>) -> Value {
    match (body, success_sent) {
        (Some(body), None) => unwrap_result(body),
        (Some(body), Some(success)) => {
            let carries_status = body
                .as_object()
                .is_some_and(|map| {
                    ["success", "error", "response", "result"]
                        .iter()
                        .any(|key| map.contains_key(*key))
                });
            if carries_status {
                let mut body = body;
                if let Value::Object(map) = &mut body {
                    map.insert("success".to_string(), json!(success));
                }
                unwrap_result(body)
            } else {
                json!({"success": success})
            }
        }
        (None, success) => json!({"success": success.unwrap_or(false)}),
    }
}

/// Get/set service RPCs wrap their payload in `result`.
fn unwrap_result(body: Value) -> Value {
    match body {
        Value::Object(mut map) if map.contains_key("result") => {
            map.remove("result").unwrap_or(Value::Null)
        }
        body => body,
    }
}

#[cfg(test)]
#[path = "rpc_tests.rs"]
mod tests;
