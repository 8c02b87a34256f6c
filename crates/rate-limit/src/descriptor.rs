//! The per-request input handed to the engine by the routing layer.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Read-only description of one inbound request.
///
/// Owned by the caller; the engine only borrows it. The bearer credential and
/// bypass token are never logged or serialized.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct RequestDescriptor {
    pub method: String,
    pub path: String,
    pub remote_addr: String,
    #[serde(default)]
    pub caller_id: Option<String>,
    #[serde(default, skip_serializing)]
    pub bearer: Option<String>,
    /// Route pattern the router matched, e.g. `/api/products/:id`.
    #[serde(default)]
    pub route_tag: Option<String>,
    #[serde(default)]
    pub body_size: u64,
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Value of the configured bypass header, if the request carried one.
    #[serde(default, skip_serializing)]
    pub bypass_token: Option<String>,
}

impl RequestDescriptor {
    pub fn new(method: &str, path: &str, remote_addr: &str) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            remote_addr: remote_addr.to_string(),
            ..Self::default()
        }
    }

    pub fn with_caller(mut self, caller_id: &str) -> Self {
        self.caller_id = Some(caller_id.to_string());
        self
    }

    pub fn with_bearer(mut self, credential: &str) -> Self {
        self.bearer = Some(credential.to_string());
        self
    }

    pub fn with_route_tag(mut self, tag: &str) -> Self {
        self.route_tag = Some(tag.to_string());
        self
    }

    pub fn with_body_size(mut self, bytes: u64) -> Self {
        self.body_size = bytes;
        self
    }

    pub fn with_user_agent(mut self, agent: &str) -> Self {
        self.user_agent = Some(agent.to_string());
        self
    }

    pub fn with_bypass_token(mut self, token: &str) -> Self {
        self.bypass_token = Some(token.to_string());
        self
    }

    /// Parse the remote address. Accepts bare addresses, `ip:port`,
    /// `[v6]:port`, and unwraps IPv4-mapped IPv6 addresses.
    pub fn remote_ip(&self) -> Option<IpAddr> {
        let raw = self.remote_addr.trim();
        let ip = raw
            .parse::<IpAddr>()
            .ok()
            .or_else(|| raw.parse::<SocketAddr>().ok().map(|s| s.ip()))?;
        Some(match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
            v4 => v4,
        })
    }

    pub fn has_credential(&self) -> bool {
        self.bearer.as_deref().is_some_and(|b| !b.is_empty())
    }
}

impl fmt::Debug for RequestDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestDescriptor")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("remote_addr", &self.remote_addr)
            .field("caller_id", &self.caller_id)
            .field("bearer", &self.bearer.as_ref().map(|_| "<redacted>"))
            .field("route_tag", &self.route_tag)
            .field("body_size", &self.body_size)
            .field("user_agent", &self.user_agent)
            .field("bypass_token", &self.bypass_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}
