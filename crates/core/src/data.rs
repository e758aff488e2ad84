// SPDX-License-Identifier: Apache-2.0

//! Canonical converted-data record and payload splitting.
//!
//! Connectors hand the gateway either a [`ConvertedData`] or a legacy JSON
//! mapping; both normalize to the same shape here. Splitting keeps every
//! stored fragment under the platform payload limit while preserving the
//! multiset of telemetry datapoints and attributes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

/// Pseudo-device name used for the gateway's own telemetry.
pub const GATEWAY_DEVICE: &str = "currentThingsBoardGateway";

/// Attribute/value mapping with preserved insertion order.
pub type ValueMap = serde_json::Map<String, Value>;

/// Outcome of a connector submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitStatus {
    Success,
    ForbiddenDevice,
    Failure,
}

#[derive(Debug, Error)]
pub enum DataError {
    #[error("submission is not a JSON object")]
    NotAnObject,
    #[error("submission has no deviceName")]
    MissingDeviceName,
}

/// One timestamped batch of telemetry values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEntry {
    pub ts: i64,
    pub values: ValueMap,
}

/// Canonical record produced by a connector after parsing device frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvertedData {
    #[serde(rename = "deviceName")]
    pub device_name: String,
    #[serde(rename = "deviceType", default = "default_device_type")]
    pub device_type: String,
    #[serde(default)]
    pub telemetry: Vec<TelemetryEntry>,
    #[serde(default)]
    pub attributes: ValueMap,
    /// Opaque diagnostic bag; serialized only when non-empty.
    #[serde(default, skip_serializing_if = "ValueMap::is_empty")]
    pub metadata: ValueMap,
}

fn default_device_type() -> String {
    "default".to_string()
}

impl ConvertedData {
    pub fn new(device_name: impl Into<String>, device_type: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
            device_type: device_type.into(),
            telemetry: Vec::new(),
            attributes: ValueMap::new(),
            metadata: ValueMap::new(),
        }
    }

    /// Normalize a legacy mapping `{deviceName, deviceType?, telemetry,
    /// attributes}` into the canonical form.
    ///
    /// Telemetry items may carry `{ts, values}` or be bare value maps; bare
    /// items are merged into a single entry stamped with `now_ms`. A
    /// non-integer `ts` is replaced by `now_ms` with a warning. Attributes
    /// accept both a mapping and the legacy list-of-single-key-maps form.
    pub fn from_legacy(value: Value, now_ms: u64) -> Result<Self, DataError> {
        let Value::Object(mut map) = value else {
            return Err(DataError::NotAnObject);
        };
        let device_name = match map.get("deviceName").and_then(Value::as_str) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => return Err(DataError::MissingDeviceName),
        };
        let device_type = map
            .get("deviceType")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(default_device_type);

        let mut data = Self::new(device_name, device_type);
        data.telemetry = normalize_telemetry(map.remove("telemetry"), now_ms);
        data.attributes = normalize_attributes(map.remove("attributes"));
        Ok(data)
    }

    /// A record is publishable when it names a device and carries data.
    pub fn is_valid(&self) -> bool {
        !self.device_name.is_empty() && !(self.telemetry.is_empty() && self.attributes.is_empty())
    }

    pub fn add_metadata(&mut self, key: &str, value: Value) {
        self.metadata.insert(key.to_string(), value);
    }

    pub fn telemetry_datapoints(&self) -> usize {
        self.telemetry.iter().map(|entry| entry.values.len()).sum()
    }

    /// Compact-JSON byte length of this record.
    pub fn estimate_size(&self) -> usize {
        serde_json::to_string(self).map(|json| json.len()).unwrap_or(usize::MAX)
    }

    /// Split into fragments whose compact serialization stays within `limit`.
    ///
    /// Attributes are coalesced into the leading fragment until size;
    /// telemetry splits at datapoint boundaries, merging values with an
    /// identical `ts` into one entry. A single datapoint larger than `limit`
    /// cannot be split further and is emitted alone.
    pub fn split_to_max_size(&self, limit: usize) -> Vec<ConvertedData> {
        if self.estimate_size() <= limit {
            return vec![self.clone()];
        }

        let mut fragments = Vec::new();
        let mut current = self.shell();
        let base_size = current.estimate_size();
        let mut size = base_size;

        for (key, value) in &self.attributes {
            let entry_size = attribute_entry_size(key, value);
            if size + entry_size > limit && !current.is_empty_payload() {
                fragments.push(std::mem::replace(&mut current, self.shell()));
                size = base_size;
            }
            current.attributes.insert(key.clone(), value.clone());
            size += entry_size;
        }

        let mut ts_index: std::collections::HashMap<i64, usize> = std::collections::HashMap::new();
        for entry in &self.telemetry {
            for (key, value) in &entry.values {
                let merged = ts_index.contains_key(&entry.ts);
                let entry_size = if merged {
                    attribute_entry_size(key, value)
                } else {
                    telemetry_entry_size(entry.ts, key, value)
                };
                if size + entry_size > limit && !current.is_empty_payload() {
                    fragments.push(std::mem::replace(&mut current, self.shell()));
                    size = base_size;
                    ts_index.clear();
                }
                match ts_index.get(&entry.ts) {
                    Some(&index) => {
                        current.telemetry[index].values.insert(key.clone(), value.clone());
                        size += attribute_entry_size(key, value);
                    }
                    None => {
                        let mut values = ValueMap::new();
                        values.insert(key.clone(), value.clone());
                        current.telemetry.push(TelemetryEntry { ts: entry.ts, values });
                        ts_index.insert(entry.ts, current.telemetry.len() - 1);
                        size += telemetry_entry_size(entry.ts, key, value);
                    }
                }
            }
        }

        if !current.is_empty_payload() {
            fragments.push(current);
        }
        fragments
    }

    fn shell(&self) -> ConvertedData {
        let mut shell = Self::new(self.device_name.clone(), self.device_type.clone());
        shell.metadata = self.metadata.clone();
        shell
    }

    fn is_empty_payload(&self) -> bool {
        self.telemetry.is_empty() && self.attributes.is_empty()
    }
}

/// Serialized size of one `"key":value` attribute entry plus separator.
fn attribute_entry_size(key: &str, value: &Value) -> usize {
    key.len() + 3 + value.to_string().len() + 1
}

/// Serialized size of a fresh `{"ts":N,"values":{"key":value}}` entry.
fn telemetry_entry_size(ts: i64, key: &str, value: &Value) -> usize {
    let ts_digits = ts.unsigned_abs().max(1).ilog10() as usize + 1 + usize::from(ts < 0);
    18 + ts_digits + attribute_entry_size(key, value) + 1
}

fn normalize_telemetry(telemetry: Option<Value>, now_ms: u64) -> Vec<TelemetryEntry> {
    let items = match telemetry {
        Some(Value::Array(items)) => items,
        Some(item @ Value::Object(_)) => vec![item],
        _ => return Vec::new(),
    };

    let mut entries = Vec::new();
    let mut bare_values = ValueMap::new();
    for item in items {
        let Value::Object(mut map) = item else { continue };
        match map.remove("ts") {
            Some(ts_value) => {
                let ts = match ts_value.as_i64().filter(|ts| *ts > 0) {
                    Some(ts) => ts,
                    None => {
                        warn!("telemetry has an invalid ts, substituting the current time");
                        now_ms as i64
                    }
                };
                let values = match map.remove("values") {
                    Some(Value::Object(values)) => values,
                    _ => ValueMap::new(),
                };
                entries.push(TelemetryEntry { ts, values });
            }
            // Bare value map without a timestamp
            None => match map.remove("values") {
                Some(Value::Object(values)) => bare_values.extend(values),
                _ => bare_values.extend(map),
            },
        }
    }
    if !bare_values.is_empty() {
        entries.push(TelemetryEntry { ts: now_ms as i64, values: bare_values });
    }
    entries
}

fn normalize_attributes(attributes: Option<Value>) -> ValueMap {
    match attributes {
        Some(Value::Object(map)) => map,
        Some(Value::Array(items)) => {
            let mut map = ValueMap::new();
            for item in items {
                if let Value::Object(entry) = item {
                    map.extend(entry);
                }
            }
            map
        }
        _ => ValueMap::new(),
    }
}

#[cfg(test)]
#[path = "data_tests.rs"]
mod tests;
