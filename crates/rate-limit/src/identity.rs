//! Privacy-preserving rate-limit keys.
//!
//! A key is an ordered list of typed components. Addresses are truncated
//! before they enter a key and bearer credentials are replaced by a keyed
//! hash, so nothing stored in the shared counter store identifies a caller
//! beyond what the limit needs.

use std::fmt;
use std::net::IpAddr;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::descriptor::RequestDescriptor;
use crate::policy::{PolicyProfile, RoutePattern};

type HmacSha256 = Hmac<Sha256>;

/// Address token used when the remote address cannot be parsed.
pub const INVALID_ADDRESS: &str = "invalid";

/// Mask an address down to its network part: `a.b.x.x` for IPv4 and the
/// first two groups followed by `:x:x:x:x` for IPv6.
pub fn anonymize_ip(addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(v4) => {
            let [a, b, _, _] = v4.octets();
            format!("{}.{}.x.x", a, b)
        }
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            format!("{:x}:{:x}:x:x:x:x", segments[0], segments[1])
        }
    }
}

/// Anonymized address of a request, or [`INVALID_ADDRESS`].
pub fn anonymize_remote(request: &RequestDescriptor) -> String {
    match request.remote_ip() {
        Some(ip) => anonymize_ip(ip),
        None => {
            tracing::debug!(
                remote_addr = %request.remote_addr,
                "unparseable remote address, keying as invalid"
            );
            INVALID_ADDRESS.to_string()
        }
    }
}

/// Keyed one-way hash for bearer credentials.
#[derive(Clone)]
pub struct CredentialHasher {
    mac: HmacSha256,
}

impl CredentialHasher {
    pub fn new(salt: &str) -> Result<Self, hmac::digest::InvalidLength> {
        Ok(Self {
            mac: HmacSha256::new_from_slice(salt.as_bytes())?,
        })
    }

    /// First 128 bits of HMAC-SHA256, hex encoded.
    pub fn hash(&self, credential: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(credential.as_bytes());
        let digest = mac.finalize().into_bytes();
        hex::encode(&digest[..16])
    }
}

impl fmt::Debug for CredentialHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialHasher").finish_non_exhaustive()
    }
}

/// One part of a composite key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyComponent {
    Address(String),
    Caller(String),
    Route(String),
    Credential(String),
}

impl KeyComponent {
    fn tag(&self) -> &'static str {
        match self {
            KeyComponent::Address(_) => "ip",
            KeyComponent::Caller(_) => "uid",
            KeyComponent::Route(_) => "route",
            KeyComponent::Credential(_) => "cred",
        }
    }

    fn value(&self) -> &str {
        match self {
            KeyComponent::Address(v)
            | KeyComponent::Caller(v)
            | KeyComponent::Route(v)
            | KeyComponent::Credential(v) => v,
        }
    }
}

/// Ordered, present-only key components. Renders as `tag=value` pairs joined
/// by `;`, with `%`, `;` and `=` percent-escaped inside values.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompositeKey {
    components: Vec<KeyComponent>,
}

impl CompositeKey {
    pub fn components(&self) -> &[KeyComponent] {
        &self.components
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, component) in self.components.iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            write!(f, "{}=", component.tag())?;
            for c in component.value().chars() {
                match c {
                    '%' => f.write_str("%25")?,
                    ';' => f.write_str("%3B")?,
                    '=' => f.write_str("%3D")?,
                    c => write!(f, "{}", c)?,
                }
            }
        }
        Ok(())
    }
}

/// Builds composite keys from requests. Pure apart from debug logging.
#[derive(Debug, Clone)]
pub struct KeyComposer {
    hasher: CredentialHasher,
}

impl KeyComposer {
    pub fn new(hasher: CredentialHasher) -> Self {
        Self { hasher }
    }

    pub fn compose(
        &self,
        request: &RequestDescriptor,
        profile: &PolicyProfile,
        matched: Option<&RoutePattern>,
    ) -> CompositeKey {
        let mut components = vec![KeyComponent::Address(anonymize_remote(request))];

        if let Some(caller) = request.caller_id.as_deref().filter(|c| !c.is_empty()) {
            components.push(KeyComponent::Caller(caller.to_string()));
        }

        if profile.key_on_route {
            let route = request
                .route_tag
                .as_deref()
                .filter(|t| !t.is_empty())
                .or(matched.map(RoutePattern::as_str));
            if let Some(route) = route {
                components.push(KeyComponent::Route(route.to_string()));
            }
        }

        if let Some(bearer) = request.bearer.as_deref().filter(|b| !b.is_empty()) {
            components.push(KeyComponent::Credential(self.hasher.hash(bearer)));
        }

        CompositeKey { components }
    }
}
