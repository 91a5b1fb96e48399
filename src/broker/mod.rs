//! Broker adapter: wraps the local browser-broker RPC with idempotent
//! retries and in-memory caches for the group ↔ window ↔ proxy mapping.
//!
//! Layout:
//! - `client.rs`: raw RPC transport (envelope decode, paging, verb helpers)
//! - `cache.rs`: group/window listing + proxy-binding cache
//! - `open.rs`: the open-with-retry discipline and headless degradation

mod cache;
mod client;
mod open;

pub use cache::{BrokerAdapter, GroupWindows, Window};
pub use client::BrokerClient;
pub use open::OpenOutcome;

use serde::{Deserialize, Serialize};

/// Proxy binding of one profile, as reported by `profile-list`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ProxyBinding {
    pub proxy_mode: Option<String>,
    pub proxy_id: Option<i64>,
    pub proxy_type: Option<String>,
    pub proxy_ip: Option<String>,
    pub proxy_port: Option<String>,
    pub real_ip: Option<String>,
    /// Operator-side proxy registry id; populated only when such a registry
    /// exists in front of the broker.
    pub proxy_local_id: Option<i64>,
}

impl ProxyBinding {
    /// `host:port` for an explicit proxy binding, if one is configured.
    pub fn socket_addr(&self) -> Option<String> {
        let ip = self.proxy_ip.as_deref()?.trim();
        let port = self.proxy_port.as_deref()?.trim();
        if ip.is_empty() || port.is_empty() {
            return None;
        }
        Some(format!("{ip}:{port}"))
    }

    /// Proxy URL usable by an HTTP client, when the binding carries enough
    /// information. Unknown proxy types default to `http`.
    pub fn proxy_url(&self) -> Option<String> {
        let addr = self.socket_addr()?;
        let scheme = match self
            .proxy_type
            .as_deref()
            .map(str::to_lowercase)
            .as_deref()
        {
            Some("socks5") | Some("socks") => "socks5",
            _ => "http",
        };
        Some(format!("{scheme}://{addr}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_url_prefers_socks_scheme() {
        let binding = ProxyBinding {
            proxy_type: Some("socks5".to_string()),
            proxy_ip: Some("10.0.0.8".to_string()),
            proxy_port: Some("1080".to_string()),
            ..Default::default()
        };
        assert_eq!(
            binding.proxy_url().as_deref(),
            Some("socks5://10.0.0.8:1080")
        );

        let no_port = ProxyBinding {
            proxy_ip: Some("10.0.0.8".to_string()),
            ..Default::default()
        };
        assert!(no_port.proxy_url().is_none());
    }
}
