// SPDX-License-Identifier: Apache-2.0

//! Report-strategy filter: decides per datapoint whether a submission is
//! forwarded or suppressed before it reaches the conversion queue.

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use tbgw_core::{ConvertedData, ReportStrategySection};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportStrategyKind {
    /// Forward every datapoint as received.
    #[default]
    OnReceived,
    /// Suppress datapoints whose value is unchanged since the last report.
    OnChange,
}

impl ReportStrategyKind {
    pub fn parse(kind: &str) -> Option<Self> {
        match kind.to_ascii_uppercase().as_str() {
            "ON_RECEIVED" => Some(Self::OnReceived),
            "ON_CHANGE" => Some(Self::OnChange),
            _ => None,
        }
    }
}

/// Global strategy plus per-connector overrides registered by the
/// lifecycle controller.
pub struct ReportStrategyService {
    global: ReportStrategyKind,
    per_connector: RwLock<HashMap<String, ReportStrategyKind>>,
    /// (device, datapoint key) → last reported value.
    last_reported: Mutex<HashMap<(String, String), Value>>,
}

impl ReportStrategyService {
    /// Build from the `thingsboard.reportStrategy` section. `DISABLED` (or
    /// an unrecognized type) yields `None` and the filter is bypassed.
    pub fn from_section(section: Option<&ReportStrategySection>) -> Option<Self> {
        let section = section?;
        let global = ReportStrategyKind::parse(&section.kind)?;
        Some(Self {
            global,
            per_connector: RwLock::new(HashMap::new()),
            last_reported: Mutex::new(HashMap::new()),
        })
    }

    pub fn register_connector_strategy(&self, connector_id: &str, kind: ReportStrategyKind) {
        self.per_connector.write().insert(connector_id.to_string(), kind);
    }

    pub fn clear_connector_strategies(&self) {
        self.per_connector.write().clear();
    }

    fn strategy_for(&self, connector_id: &str) -> ReportStrategyKind {
        self.per_connector.read().get(connector_id).copied().unwrap_or(self.global)
    }

    /// Filter one record. `None` means every datapoint was suppressed.
    pub fn filter(&self, connector_id: &str, data: ConvertedData) -> Option<ConvertedData> {
        match self.strategy_for(connector_id) {
            ReportStrategyKind::OnReceived => Some(data),
            ReportStrategyKind::OnChange => self.filter_changed(data),
        }
    }

    fn filter_changed(&self, mut data: ConvertedData) -> Option<ConvertedData> {
        let mut last = self.last_reported.lock();
        let device = data.device_name.clone();

        data.attributes.retain(|key, value| {
            Self::changed(&mut last, &device, key, value)
        });
        for entry in &mut data.telemetry {
            entry.values.retain(|key, value| Self::changed(&mut last, &device, key, value));
        }
        data.telemetry.retain(|entry| !entry.values.is_empty());

        if data.telemetry.is_empty() && data.attributes.is_empty() {
            debug!(device = %device, "all datapoints unchanged, suppressing record");
            None
        } else {
            Some(data)
        }
    }

    fn changed(
        last: &mut HashMap<(String, String), Value>,
        device: &str,
        key: &str,
        value: &Value,
    ) -> bool {
        let slot = (device.to_string(), key.to_string());
        if last.get(&slot) == Some(value) {
            return false;
        }
        last.insert(slot, value.clone());
        true
    }

    /// Forget the reported values of one device (delete / rename).
    pub fn forget_device(&self, device: &str) {
        self.last_reported.lock().retain(|(name, _), _| name != device);
    }
}

#[cfg(test)]
#[path = "report_strategy_tests.rs"]
mod tests;
