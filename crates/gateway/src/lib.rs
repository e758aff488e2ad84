// SPDX-License-Identifier: Apache-2.0

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! tbgw-gateway: the gateway orchestration core.
//!
//! Data flows connector → conversion intake → event store → dispatcher →
//! platform client; control flows platform client → watchdog / RPC router →
//! connectors and the device registry. All workers are long-lived tokio
//! tasks sharing one cancellation token.

pub mod client;
pub mod config_io;
pub mod dispatcher;
pub mod intake;
pub mod lifecycle;
pub mod registry;
pub mod rpc;
pub mod service;
pub mod sync;
pub mod watchdog;
pub mod writer;

pub use client::{InboundMessage, LoopbackClient, PlatformClient, PublishHandle, PublishResult};
#[cfg(any(test, feature = "test-support"))]
pub use client::{MockClient, PlatformRecord};
pub use lifecycle::{ConnectorIndex, ConnectorLifecycle};
pub use registry::DeviceRegistry;
pub use rpc::RpcRouter;
pub use service::{GatewayError, GatewayService};
pub use sync::SharedAttributeCache;
