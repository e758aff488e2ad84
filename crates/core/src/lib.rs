// SPDX-License-Identifier: Apache-2.0

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! tbgw-core: domain types shared by the gateway crates.
//!
//! Holds the canonical converted-data record and its payload splitting,
//! the device registry records with the renaming map, the configuration
//! model, RPC content helpers, and the clock abstraction.

pub mod clock;
pub mod config;
pub mod data;
pub mod device;
pub mod rpc;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    CheckingDeviceActivity, ConnectorEntry, GeneralConfig, GrpcConfig, ReportStrategySection,
    StorageConfig, StorageType, ThingsboardConfig,
};
pub use data::{ConvertedData, DataError, SubmitStatus, TelemetryEntry, ValueMap, GATEWAY_DEVICE};
pub use device::{DeviceRecord, RenameMap, StoredDeviceRecord};
pub use rpc::RpcRequest;
