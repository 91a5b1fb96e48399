//! Wire types for the local browser-broker RPC.
//!
//! Every broker response is a JSON envelope `{error: {code, message}, data}`.
//! Code `0` means success; the remaining codes the engine reacts to are
//! collected in [`code`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Broker result codes with engine-visible semantics.
pub mod code {
    /// Request succeeded.
    pub const OK: i64 = 0;
    /// Profile is already open in another window.
    pub const ALREADY_OPEN: i64 = 111003;
    /// The browser process backing the profile no longer exists.
    pub const PROCESS_NOT_FOUND: i64 = 1009;
    /// The window/profile does not exist.
    pub const WINDOW_NOT_FOUND: i64 = 2007;
    /// Headless open is unsupported in the profile's current state.
    pub const HEADLESS_UNSUPPORTED: i64 = 2012;
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct BrokerErrorBody {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerEnvelope {
    #[serde(default)]
    pub error: BrokerErrorBody,
    #[serde(default)]
    pub data: Value,
}

impl BrokerEnvelope {
    pub fn is_ok(&self) -> bool {
        self.error.code == code::OK
    }
}

/// Paged listing payload (`group-list`, `profile-list`).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PagedData<T> {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub data: Vec<T>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct GroupItem {
    pub id: i64,
    pub title: String,
}

/// One row of `profile-list`; carries the profile's proxy binding.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ProfileListItem {
    #[serde(default)]
    pub profile_id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub group_id: i64,
    #[serde(default)]
    pub group_name: Option<String>,
    #[serde(default)]
    pub proxy_mode: Option<String>,
    #[serde(default)]
    pub proxy_id: Option<i64>,
    #[serde(default)]
    pub proxy_type: Option<String>,
    #[serde(default)]
    pub proxy_ip: Option<String>,
    #[serde(default)]
    pub proxy_port: Option<String>,
    #[serde(default)]
    pub real_ip: Option<String>,
}

/// `profile-open` payload. Field spelling varies between broker builds, so
/// the websocket endpoint and debugging address both accept aliases.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct OpenData {
    #[serde(
        default,
        alias = "wsEndpoint",
        alias = "browserWSEndpoint",
        alias = "webSocketDebuggerUrl"
    )]
    pub ws: Option<String>,
    #[serde(default, alias = "debuggingAddress", alias = "debug_address")]
    pub debugging_address: Option<String>,
    #[serde(default, alias = "debuggingPort", alias = "debug_port")]
    pub debugging_port: Option<i64>,
}

impl OpenData {
    /// Resolve the CDP endpoint: prefer the explicit websocket URL, then the
    /// debugging address, then a localhost fallback built from the port.
    pub fn debug_endpoint(&self) -> Option<String> {
        if let Some(ws) = self.ws.as_deref()
            && !ws.trim().is_empty()
        {
            return Some(ws.trim().to_string());
        }
        if let Some(addr) = self.debugging_address.as_deref()
            && !addr.trim().is_empty()
        {
            return Some(format!("http://{}", addr.trim()));
        }
        self.debugging_port
            .filter(|port| *port > 0)
            .map(|port| format!("http://127.0.0.1:{port}"))
    }
}

/// One row of `profile-opened-list` / its native-client variant. Only the
/// native variant is authoritative: rows without a debug endpoint are the
/// broker's "recently opened" history and must be discarded.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct OpenedProfileItem {
    #[serde(default)]
    pub profile_id: i64,
    #[serde(flatten)]
    pub open: OpenData,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_decodes_error_and_data() {
        let env: BrokerEnvelope = serde_json::from_value(json!({
            "error": {"code": 111003, "message": "profile already open"},
            "data": {"ws": "ws://127.0.0.1:9222/devtools/browser/abc"},
        }))
        .unwrap();
        assert!(!env.is_ok());
        assert_eq!(env.error.code, code::ALREADY_OPEN);
    }

    #[test]
    fn open_data_endpoint_resolution_order() {
        let from_ws: OpenData = serde_json::from_value(json!({
            "webSocketDebuggerUrl": "ws://127.0.0.1:9222/devtools/browser/x",
            "debugging_address": "127.0.0.1:9222",
        }))
        .unwrap();
        assert_eq!(
            from_ws.debug_endpoint().as_deref(),
            Some("ws://127.0.0.1:9222/devtools/browser/x")
        );

        let from_addr: OpenData =
            serde_json::from_value(json!({"debugging_address": "127.0.0.1:9333"})).unwrap();
        assert_eq!(
            from_addr.debug_endpoint().as_deref(),
            Some("http://127.0.0.1:9333")
        );

        let from_port: OpenData = serde_json::from_value(json!({"debugging_port": 9444})).unwrap();
        assert_eq!(
            from_port.debug_endpoint().as_deref(),
            Some("http://127.0.0.1:9444")
        );

        let empty = OpenData::default();
        assert!(empty.debug_endpoint().is_none());
    }
}
