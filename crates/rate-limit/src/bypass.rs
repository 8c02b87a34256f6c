//! Allowlisting: requests that skip admission entirely.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use turnstile_trusted_net::TrustedNetworks;

use crate::decision::BypassKind;
use crate::descriptor::RequestDescriptor;

type HmacSha256 = Hmac<Sha256>;

const SECRET_DOMAIN: &[u8] = b"turnstile-bypass-v1";

fn secret_tag(secret: &[u8]) -> Option<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    mac.update(SECRET_DOMAIN);
    Some(mac)
}

pub struct BypassPolicy {
    /// Tag of the configured secret; presented tokens are tagged the same
    /// way and compared in constant time.
    secret: Option<Vec<u8>>,
    networks: Arc<TrustedNetworks>,
    agents: Vec<String>,
}

impl BypassPolicy {
    pub fn new(secret: Option<&str>, networks: Arc<TrustedNetworks>, agents: &[String]) -> Self {
        let secret = secret
            .filter(|s| !s.is_empty())
            .and_then(|s| secret_tag(s.as_bytes()))
            .map(|mac| mac.finalize().into_bytes().to_vec());
        let agents = agents
            .iter()
            .map(|a| a.trim().to_ascii_lowercase())
            .filter(|a| !a.is_empty())
            .collect();
        Self {
            secret,
            networks,
            agents,
        }
    }

    /// Nothing configured: never bypasses.
    pub fn disabled() -> Self {
        Self::new(None, Arc::new(TrustedNetworks::new()), &[])
    }

    pub fn networks(&self) -> &Arc<TrustedNetworks> {
        &self.networks
    }

    fn secret_matches(&self, token: &str) -> bool {
        let Some(expected) = self.secret.as_deref() else {
            return false;
        };
        secret_tag(token.as_bytes()).is_some_and(|mac| mac.verify_slice(expected).is_ok())
    }

    pub fn check(&self, request: &RequestDescriptor) -> Option<BypassKind> {
        if let Some(token) = request.bypass_token.as_deref() {
            if self.secret_matches(token) {
                return Some(BypassKind::Secret);
            }
        }

        if !self.networks.is_empty() {
            if let Some(ip) = request.remote_ip() {
                if self.networks.contains(ip) {
                    return Some(BypassKind::TrustedNetwork);
                }
            }
        }

        if let Some(agent) = request.user_agent.as_deref() {
            let agent = agent.to_ascii_lowercase();
            if self.agents.iter().any(|marker| agent.contains(marker.as_str())) {
                return Some(BypassKind::TrustedAgent);
            }
        }

        None
    }
}
