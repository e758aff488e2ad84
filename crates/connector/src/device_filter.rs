// SPDX-License-Identifier: Apache-2.0

//! Per-connector device allow-lists, loaded from the filter file named by
//! `thingsboard.deviceFiltering.filterFile`.
//!
//! The file maps connector names to allowed device names; `"*"` allows
//! everything and a connector absent from the file is unrestricted.

use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceFilterError {
    #[error("failed to read filter file: {0}")]
    Io(#[from] std::io::Error),
    #[error("filter file is not a JSON object of name lists: {0}")]
    Format(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default)]
pub struct DeviceFilter {
    allowed: HashMap<String, Vec<String>>,
}

impl DeviceFilter {
    pub fn load(path: &Path) -> Result<Self, DeviceFilterError> {
        let raw = std::fs::read_to_string(path)?;
        let parsed: HashMap<String, Vec<String>> = serde_json::from_str(&raw)?;
        Ok(Self { allowed: parsed })
    }

    pub fn from_lists(allowed: HashMap<String, Vec<String>>) -> Self {
        Self { allowed }
    }

    pub fn is_allowed(&self, connector_name: &str, device_name: &str) -> bool {
        match self.allowed.get(connector_name) {
            None => true,
            Some(names) => names.iter().any(|name| name == "*" || name == device_name),
        }
    }

    /// Check a raw submission before normalization; records without a
    /// device name pass here and fail validation later.
    pub fn validate_submission(&self, connector_name: &str, data: &Value) -> bool {
        match data.get("deviceName").and_then(Value::as_str) {
            Some(device) => self.is_allowed(connector_name, device),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn filter() -> DeviceFilter {
        DeviceFilter::from_lists(HashMap::from([
            ("modbusA".to_string(), vec!["d1".to_string(), "d2".to_string()]),
            ("open".to_string(), vec!["*".to_string()]),
        ]))
    }

    #[test]
    fn listed_devices_pass() {
        let filter = filter();
        assert!(filter.is_allowed("modbusA", "d1"));
        assert!(!filter.is_allowed("modbusA", "d3"));
    }

    #[test]
    fn wildcard_and_unlisted_connectors_pass() {
        let filter = filter();
        assert!(filter.is_allowed("open", "anything"));
        assert!(filter.is_allowed("unknown-connector", "anything"));
    }

    #[test]
    fn submission_without_device_name_passes_the_filter() {
        let filter = filter();
        assert!(filter.validate_submission("modbusA", &json!({"telemetry": []})));
        assert!(!filter.validate_submission("modbusA", &json!({"deviceName": "d9"})));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filter.json");
        std::fs::write(&path, r#"{"modbusA": ["d1"]}"#).unwrap();

        let filter = DeviceFilter::load(&path).unwrap();
        assert!(filter.is_allowed("modbusA", "d1"));
        assert!(!filter.is_allowed("modbusA", "d2"));
    }
}
