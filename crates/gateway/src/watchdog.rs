// SPDX-License-Identifier: Apache-2.0

//! Watchdog: the gateway's single periodic tick.
//!
//! Re-subscribes after a reconnect, dispatches scheduled RPCs, expires
//! in-flight RPC deadlines, polls connector configuration files for
//! changes, and keeps the cached version fresh. A failure inside one tick
//! is logged and the loop continues; only a failure of the loop itself
//! stops the gateway.

use crate::client::PlatformClient;
use crate::lifecycle::ConnectorLifecycle;
use crate::registry::DeviceRegistry;
use crate::rpc::RpcRouter;
use crate::sync::SharedAttributeCache;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tbgw_core::Clock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const TICK: Duration = Duration::from_millis(100);
const VERSION_REFRESH: Duration = Duration::from_secs(300);
const LOG_FLUSH: Duration = Duration::from_secs(1);

/// Gateway shared attributes requested right after the first connect.
const ATTRIBUTES_FOR_REQUEST: [&str; 2] = ["RemoteLoggingLevel", "general_configuration"];

pub type LogFlushHook = Arc<dyn Fn() + Send + Sync>;

pub struct Watchdog<C: Clock> {
    clock: C,
    client: Arc<dyn PlatformClient>,
    registry: Arc<DeviceRegistry>,
    rpc: Arc<RpcRouter<C>>,
    lifecycle: Arc<ConnectorLifecycle>,
    shared_cache: Arc<SharedAttributeCache>,
    remote_config_in_progress: Arc<AtomicBool>,
    connectors_check_period: Duration,
    /// Remote-log handlers hook in here; a no-op by default.
    log_flush_hook: Option<LogFlushHook>,
}

impl<C: Clock> Watchdog<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clock: C,
        client: Arc<dyn PlatformClient>,
        registry: Arc<DeviceRegistry>,
        rpc: Arc<RpcRouter<C>>,
        lifecycle: Arc<ConnectorLifecycle>,
        shared_cache: Arc<SharedAttributeCache>,
        remote_config_in_progress: Arc<AtomicBool>,
        connectors_check_period: Duration,
        log_flush_hook: Option<LogFlushHook>,
    ) -> Self {
        Self {
            clock,
            client,
            registry,
            rpc,
            lifecycle,
            shared_cache,
            remote_config_in_progress,
            connectors_check_period,
            log_flush_hook,
        }
    }

    pub async fn run(self, stop: CancellationToken) {
        let mut subscribed = false;
        let mut requested_shared = false;
        let mut last_config_check = self.clock.monotonic();
        let mut last_version_refresh = self.clock.monotonic();
        let mut last_log_flush = self.clock.monotonic();

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                () = tokio::time::sleep(TICK) => {}
            }
            let now = self.clock.monotonic();

            if !self.client.is_connected() && subscribed {
                subscribed = false;
                requested_shared = false;
                self.shared_cache.clear();
            }

            if self.client.is_connected() && !self.client.is_stopped() && !subscribed {
                self.readd_saved_devices().await;
                self.client.subscribe_to_required_topics();
                subscribed = true;
            }

            self.rpc.fire_due_scheduled();

            if self.client.is_connected() {
                self.rpc.drain_registrations();
                self.rpc.expire_in_flight();
            }

            if !requested_shared
                && self.client.is_connected()
                && self.client.is_subscribed_to_service_attributes()
            {
                requested_shared = true;
                let keys: Vec<String> =
                    ATTRIBUTES_FOR_REQUEST.iter().map(|key| key.to_string()).collect();
                let _ = self.client.request_attributes(&keys, &[]);
            }

            if now.saturating_duration_since(last_config_check) > self.connectors_check_period
                && !self.remote_config_in_progress.load(Ordering::SeqCst)
            {
                last_config_check = now;
                self.lifecycle.check_configuration_updates().await;
            }

            if now.saturating_duration_since(last_version_refresh) >= VERSION_REFRESH {
                last_version_refresh = now;
                debug!(version = env!("CARGO_PKG_VERSION"), "gateway version refreshed");
            }

            if now.saturating_duration_since(last_log_flush) >= LOG_FLUSH {
                last_log_flush = now;
                if let Some(hook) = &self.log_flush_hook {
                    hook();
                }
            }
        }
        debug!("watchdog stopped");
    }

    /// Bring every saved device back after a (re)connect.
    async fn readd_saved_devices(&self) {
        for (device, connector, device_type) in self.registry.saved_devices() {
            match connector {
                Some(connector) => {
                    self.registry.add_device(&device, &connector, Some(&device_type)).await;
                }
                None => warn!(device = %device, "saved device has no live connector, skipping re-add"),
            }
        }
    }
}

/// Optional worker: deletes devices idle past the configured timeout.
pub async fn run_idle_checker<C: Clock>(
    clock: C,
    registry: Arc<DeviceRegistry>,
    check_period: Duration,
    idle_timeout: Duration,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            () = tokio::time::sleep(check_period) => {}
        }
        let now_ms = clock.epoch_ms();
        for device in registry.idle_devices(idle_timeout.as_millis() as u64, now_ms) {
            debug!(device = %device, "deleting device for exceeding the idle timeout");
            registry.del_device(&device, true).await;
        }
    }
    debug!("idle-device checker stopped");
}
