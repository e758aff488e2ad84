// SPDX-License-Identifier: Apache-2.0

//! Persisted device records and the device renaming map.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One entry of the `connected_devices.json` snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub connector_name: String,
    #[serde(default)]
    pub connector_id: String,
    pub device_type: String,
    pub renaming: Option<String>,
    #[serde(default)]
    pub disconnected: bool,
}

/// Snapshot entry as found on disk. Older gateways wrote a bare array
/// `[connectorName, deviceType, renamedTo?]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StoredDeviceRecord {
    Current(DeviceRecord),
    Legacy(Vec<String>),
}

impl StoredDeviceRecord {
    pub fn into_record(self) -> Option<DeviceRecord> {
        match self {
            Self::Current(record) => Some(record),
            Self::Legacy(fields) => {
                let mut fields = fields.into_iter();
                let connector_name = fields.next()?;
                let device_type = fields.next()?;
                Some(DeviceRecord {
                    connector_name,
                    connector_id: String::new(),
                    device_type,
                    renaming: fields.next(),
                    disconnected: false,
                })
            }
        }
    }
}

/// Mapping `originalName → currentName` with a unique image.
///
/// Renames compose without ever producing two hops: renaming B→C while A→B
/// exists rewrites the mapping to A→C, and renaming back to the original
/// name removes the entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RenameMap {
    map: HashMap<String, String>,
}

impl RenameMap {
    /// Current (external) name for an original, if renamed.
    pub fn current_name(&self, original: &str) -> Option<&str> {
        self.map.get(original).map(String::as_str)
    }

    /// Original name whose current name is `current`.
    pub fn original_name(&self, current: &str) -> Option<&str> {
        self.map
            .iter()
            .find(|(_, renamed)| renamed.as_str() == current)
            .map(|(original, _)| original.as_str())
    }

    /// Rewrite `name` to its current form, or return it unchanged.
    pub fn resolve<'a>(&'a self, name: &'a str) -> &'a str {
        self.current_name(name).unwrap_or(name)
    }

    /// Record a platform-issued rename `old → new`.
    ///
    /// Returns `true` when the mapping changed.
    pub fn apply(&mut self, old: &str, new: &str) -> bool {
        // Keep the image unique: nothing else may already map to `new`.
        let shadowed = self.original_name(new).map(str::to_string);
        if let Some(original) = shadowed {
            if original != old {
                self.map.remove(&original);
            }
        }

        let key = match self.original_name(old).map(str::to_string) {
            Some(original) if original == new => {
                // Renamed back to the original name.
                self.map.remove(&original);
                return true;
            }
            Some(original) => original,
            None => old.to_string(),
        };
        if key == new {
            return false;
        }
        self.map.insert(key, new.to_string());
        true
    }

    /// Drop the mapping whose current name is `current`; returns the
    /// original name it pointed from.
    pub fn remove_by_current(&mut self, current: &str) -> Option<String> {
        let original = self.original_name(current)?.to_string();
        self.map.remove(&original);
        Some(original)
    }

    pub fn remove(&mut self, original: &str) -> Option<String> {
        self.map.remove(original)
    }

    pub fn insert(&mut self, original: String, current: String) {
        self.map.insert(original, current);
    }

    pub fn contains_original(&self, original: &str) -> bool {
        self.map.contains_key(original)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(test)]
#[path = "device_tests.rs"]
mod tests;
