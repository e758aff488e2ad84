// SPDX-License-Identifier: Apache-2.0

//! Server-side RPC request content helpers.

use serde_json::{json, Value};

/// An RPC request as received from the platform.
#[derive(Debug, Clone)]
pub struct RpcRequest {
    pub request_id: u64,
    pub content: Value,
}

impl RpcRequest {
    pub fn new(request_id: u64, content: Value) -> Self {
        Self { request_id, content }
    }

    /// Target device, absent for gateway-scoped requests.
    pub fn device(&self) -> Option<&str> {
        self.content.get("device").and_then(Value::as_str)
    }

    pub fn set_device(&mut self, device: &str) {
        if let Value::Object(map) = &mut self.content {
            map.insert("device".to_string(), Value::String(device.to_string()));
        }
    }

    pub fn method(&self) -> Option<&str> {
        self.content.get("method").and_then(Value::as_str)
    }

    pub fn params(&self) -> Option<&Value> {
        self.content.get("params")
    }

    /// Per-request deadline override (`params.timeout`, milliseconds).
    pub fn timeout_ms(&self, default_ms: u64) -> u64 {
        self.params()
            .and_then(|params| params.get("timeout"))
            .and_then(Value::as_u64)
            .unwrap_or(default_ms)
    }

    /// Content with the request id stamped in, as connectors expect it.
    pub fn content_with_id(&self) -> Value {
        let mut content = self.content.clone();
        if let Value::Object(map) = &mut content {
            map.insert("id".to_string(), json!(self.request_id));
        }
        content
    }
}

/// The failure reply sent when no handler responded within the deadline.
pub fn timeout_reply() -> Value {
    json!({"error": "Request timeout", "code": 408})
}

/// The failure reply for an unknown gateway method or connector module.
pub fn method_not_found_reply() -> Value {
    json!({"error": "Method not found", "code": 404})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_falls_back_to_default() {
        let request = RpcRequest::new(1, json!({"method": "get_value"}));
        assert_eq!(request.timeout_ms(5_000), 5_000);

        let request = RpcRequest::new(1, json!({"method": "m", "params": {"timeout": 500}}));
        assert_eq!(request.timeout_ms(5_000), 500);
    }

    #[test]
    fn content_with_id_stamps_the_request_id() {
        let request = RpcRequest::new(42, json!({"device": "d1", "method": "m"}));
        let content = request.content_with_id();
        assert_eq!(content["id"], json!(42));
        assert_eq!(request.device(), Some("d1"));
        assert_eq!(request.method(), Some("m"));
    }
}
