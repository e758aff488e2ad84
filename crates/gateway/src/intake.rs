// SPDX-License-Identifier: Apache-2.0

//! Conversion intake: the submission point connectors push their parsed
//! data into.
//!
//! The intake validates shape, applies the device filter and the
//! report-strategy filter, and enqueues on the conversion queue. It never
//! blocks beyond a lock acquisition; the queue is bounded only by memory.

use serde_json::json;
use std::sync::Arc;
use tbgw_core::{Clock, ConvertedData, SubmitStatus};
use tbgw_connector::{DataEvent, DataSink, DeviceFilter, ReportStrategyService};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// One queued submission, tagged with its origin.
#[derive(Debug)]
pub struct ConversionItem {
    pub connector_name: String,
    pub connector_id: String,
    pub data: ConvertedData,
}

pub struct ConversionIntake<C: Clock> {
    tx: mpsc::UnboundedSender<ConversionItem>,
    device_filter: Option<DeviceFilter>,
    report_strategy: Option<Arc<ReportStrategyService>>,
    latency_debug: bool,
    clock: C,
}

impl<C: Clock> ConversionIntake<C> {
    pub fn new(
        tx: mpsc::UnboundedSender<ConversionItem>,
        device_filter: Option<DeviceFilter>,
        report_strategy: Option<Arc<ReportStrategyService>>,
        latency_debug: bool,
        clock: C,
    ) -> Self {
        Self { tx, device_filter, report_strategy, latency_debug, clock }
    }

    pub fn submit(&self, connector_name: &str, connector_id: &str, data: DataEvent) -> SubmitStatus {
        let mut data = match self.admit(connector_name, data) {
            Ok(data) => data,
            Err(status) => return status,
        };

        if self.latency_debug {
            let now = self.clock.epoch_ms();
            data.add_metadata("sendToStorageTs", json!(now));
            data.add_metadata("connector", json!(connector_name));
        }

        if let Some(strategy) = &self.report_strategy {
            match strategy.filter(connector_id, data) {
                Some(filtered) => data = filtered,
                // Every datapoint suppressed; nothing to enqueue.
                None => return SubmitStatus::Success,
            }
        }

        let item = ConversionItem {
            connector_name: connector_name.to_string(),
            connector_id: connector_id.to_string(),
            data,
        };
        match self.tx.send(item) {
            Ok(()) => SubmitStatus::Success,
            Err(e) => {
                error!("cannot enqueue converted data: {e}");
                SubmitStatus::Failure
            }
        }
    }

    fn admit(&self, connector_name: &str, data: DataEvent) -> Result<ConvertedData, SubmitStatus> {
        if let Some(filter) = &self.device_filter {
            let allowed = match &data {
                DataEvent::Converted(data) => filter.is_allowed(connector_name, &data.device_name),
                DataEvent::Legacy(raw) => filter.validate_submission(connector_name, raw),
            };
            if !allowed {
                warn!(connector = connector_name, "device forbidden by the device filter");
                return Err(SubmitStatus::ForbiddenDevice);
            }
        }

        match data {
            DataEvent::Converted(data) => Ok(data),
            DataEvent::Legacy(raw) => {
                ConvertedData::from_legacy(raw, self.clock.epoch_ms()).map_err(|e| {
                    debug!(connector = connector_name, "invalid legacy submission: {e}");
                    SubmitStatus::Failure
                })
            }
        }
    }
}

impl<C: Clock> DataSink for ConversionIntake<C> {
    fn submit(&self, connector_name: &str, connector_id: &str, data: DataEvent) -> SubmitStatus {
        ConversionIntake::submit(self, connector_name, connector_id, data)
    }
}

#[cfg(test)]
#[path = "intake_tests.rs"]
mod tests;
