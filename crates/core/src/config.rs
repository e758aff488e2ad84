// SPDX-License-Identifier: Apache-2.0

//! Gateway configuration model (`tb_gateway.json`).
//!
//! Unknown keys are tolerated everywhere so sidecar-managed sections and
//! newer platform options do not break older gateways.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default)]
    pub thingsboard: ThingsboardConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub connectors: Vec<ConnectorEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grpc: Option<GrpcConfig>,
}

impl GeneralConfig {
    /// Apply `TB_GW_HOST` / `TB_GW_PORT` / `TB_GW_ACCESS_TOKEN` overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("TB_GW_HOST") {
            self.thingsboard.host = host;
        }
        if let Some(port) = std::env::var("TB_GW_PORT").ok().and_then(|p| p.parse().ok()) {
            self.thingsboard.port = port;
        }
        if let Ok(token) = std::env::var("TB_GW_ACCESS_TOKEN") {
            self.thingsboard.access_token = Some(token);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThingsboardConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    /// Transport security section, passed through to the platform client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<Value>,
    #[serde(rename = "minPackSendDelayMS", default = "default_min_pack_send_delay_ms")]
    pub min_pack_send_delay_ms: u64,
    #[serde(default = "default_min_pack_size_to_send")]
    pub min_pack_size_to_send: usize,
    #[serde(default = "default_max_payload_size_bytes")]
    pub max_payload_size_bytes: usize,
    #[serde(default)]
    pub latency_debug_mode: bool,
    #[serde(default = "default_true")]
    pub sync_devices_shared_attributes_on_connect: bool,
    #[serde(default = "default_connectors_check_seconds")]
    pub check_connectors_configuration_in_seconds: u64,
    #[serde(default = "default_true")]
    pub handle_device_renaming: bool,
    #[serde(default)]
    pub checking_device_activity: CheckingDeviceActivity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_strategy: Option<ReportStrategySection>,
    #[serde(default)]
    pub remote_configuration: bool,
    #[serde(default)]
    pub remote_shell: bool,
    /// Statistics-service section; consumed by the external service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_filtering: Option<DeviceFilteringConfig>,
}

impl Default for ThingsboardConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            access_token: None,
            security: None,
            min_pack_send_delay_ms: default_min_pack_send_delay_ms(),
            min_pack_size_to_send: default_min_pack_size_to_send(),
            max_payload_size_bytes: default_max_payload_size_bytes(),
            latency_debug_mode: false,
            sync_devices_shared_attributes_on_connect: true,
            check_connectors_configuration_in_seconds: default_connectors_check_seconds(),
            handle_device_renaming: true,
            checking_device_activity: CheckingDeviceActivity::default(),
            report_strategy: None,
            remote_configuration: false,
            remote_shell: false,
            statistics: None,
            device_filtering: None,
        }
    }
}

impl ThingsboardConfig {
    /// Splitting limit: fragments stay within 90% of the payload cap.
    pub fn effective_payload_limit(&self) -> usize {
        self.max_payload_size_bytes * 9 / 10
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckingDeviceActivity {
    #[serde(default)]
    pub check_device_inactivity: bool,
    #[serde(default = "default_inactivity_check_period")]
    pub inactivity_check_period_seconds: u64,
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_seconds: u64,
}

impl Default for CheckingDeviceActivity {
    fn default() -> Self {
        Self {
            check_device_inactivity: false,
            inactivity_check_period_seconds: default_inactivity_check_period(),
            inactivity_timeout_seconds: default_inactivity_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportStrategySection {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_period: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceFilteringConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_file: Option<String>,
}

/// Storage section. Unlike `thingsboard`, this section historically uses
/// snake_case keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(rename = "type", default)]
    pub kind: StorageType,
    /// Upper bound on events returned per pack.
    #[serde(default = "default_read_records_count")]
    pub read_records_count: usize,
    /// Memory store: oldest events are dropped past this count.
    #[serde(default = "default_max_records_count")]
    pub max_records_count: usize,
    /// File store: segment directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_folder_path: Option<PathBuf>,
    #[serde(default = "default_max_records_per_file")]
    pub max_records_per_file: usize,
    /// Sqlite store: database file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_file_path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: StorageType::Memory,
            read_records_count: default_read_records_count(),
            max_records_count: default_max_records_count(),
            data_folder_path: None,
            max_records_per_file: default_max_records_per_file(),
            data_file_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    Memory,
    File,
    Sqlite,
}

/// One entry of the top-level `connectors` array; `configuration` names the
/// sidecar JSON file next to the main config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub connector_type: String,
    pub configuration: String,
    /// GRPC connectors: persistent key, or `"auto"` to generate one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrpcConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_grpc_port")]
    pub server_port: u16,
}

fn default_port() -> u16 {
    1883
}

fn default_min_pack_send_delay_ms() -> u64 {
    50
}

fn default_min_pack_size_to_send() -> usize {
    500
}

fn default_max_payload_size_bytes() -> usize {
    8196
}

fn default_true() -> bool {
    true
}

fn default_connectors_check_seconds() -> u64 {
    60
}

fn default_inactivity_check_period() -> u64 {
    1
}

fn default_inactivity_timeout() -> u64 {
    50
}

fn default_read_records_count() -> usize {
    100
}

fn default_max_records_count() -> usize {
    100_000
}

fn default_max_records_per_file() -> usize {
    10_000
}

fn default_grpc_port() -> u16 {
    9595
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
