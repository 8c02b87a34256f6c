//! Policy profiles and request classification.
//!
//! A [`PolicyRouter`] picks the most specific profile for a request: exact
//! patterns beat parameterised ones, which beat prefixes, and among equals
//! the one with more literal characters wins. Method and credential
//! constraints break remaining ties.

use std::time::Duration;

use serde::Serialize;
use turnstile_common::{ProfileConfig, TurnstileError, TurnstileResult, WeightConfig};

use crate::descriptor::RequestDescriptor;

pub use turnstile_common::{AlgorithmKind as Algorithm, CredentialMatch};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternKind {
    Exact,
    Parameterised(Vec<Segment>),
    Prefix(String),
}

/// A compiled route pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePattern {
    raw: String,
    kind: PatternKind,
}

impl RoutePattern {
    pub fn parse(raw: &str) -> Self {
        let kind = if let Some(prefix) = raw.strip_suffix('*') {
            PatternKind::Prefix(prefix.to_string())
        } else if raw.split('/').any(|s| s.starts_with(':')) {
            PatternKind::Parameterised(
                raw.split('/')
                    .map(|s| {
                        if s.starts_with(':') {
                            Segment::Param
                        } else {
                            Segment::Literal(s.to_string())
                        }
                    })
                    .collect(),
            )
        } else {
            PatternKind::Exact
        };
        Self {
            raw: raw.to_string(),
            kind,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, path: &str) -> bool {
        let path = strip_query(path);
        match &self.kind {
            PatternKind::Exact => path == self.raw,
            PatternKind::Prefix(prefix) => path.starts_with(prefix.as_str()),
            PatternKind::Parameterised(segments) => {
                let parts: Vec<&str> = path.split('/').collect();
                parts.len() == segments.len()
                    && segments.iter().zip(parts).all(|(seg, part)| match seg {
                        Segment::Literal(lit) => lit == part,
                        Segment::Param => !part.is_empty(),
                    })
            }
        }
    }

    /// Ordering key: higher is more specific. Pattern kind first, then
    /// literal length.
    fn specificity(&self) -> (u8, usize) {
        match &self.kind {
            PatternKind::Exact => (2, self.raw.len()),
            PatternKind::Parameterised(segments) => {
                let literal: usize = segments
                    .iter()
                    .map(|s| match s {
                        Segment::Literal(lit) => lit.len() + 1,
                        Segment::Param => 1,
                    })
                    .sum();
                (1, literal)
            }
            PatternKind::Prefix(prefix) => (0, prefix.len()),
        }
    }
}

fn strip_query(path: &str) -> &str {
    path.split(['?', '#']).next().unwrap_or(path)
}

/// Per-call quota cost, derived from path prefixes and body size.
#[derive(Debug, Clone)]
pub struct WeightRule {
    default: u32,
    path_prefixes: Vec<(String, u32)>,
    body_size: Vec<(u64, u32)>,
}

impl WeightRule {
    pub fn uniform() -> Self {
        Self {
            default: 1,
            path_prefixes: vec![],
            body_size: vec![],
        }
    }

    pub fn weight_for(&self, request: &RequestDescriptor) -> u32 {
        let path = strip_query(&request.path);
        let by_path = self
            .path_prefixes
            .iter()
            .filter(|(prefix, _)| path.starts_with(prefix.as_str()))
            .map(|(_, w)| *w);
        let by_body = self
            .body_size
            .iter()
            .filter(|(min, _)| request.body_size >= *min)
            .map(|(_, w)| *w);

        by_path
            .chain(by_body)
            .fold(self.default, u32::max)
            .max(1)
    }
}

impl From<&WeightConfig> for WeightRule {
    fn from(config: &WeightConfig) -> Self {
        Self {
            default: config.default.max(1),
            path_prefixes: config
                .path_prefixes
                .iter()
                .map(|p| (p.prefix.clone(), p.weight))
                .collect(),
            body_size: config
                .body_size
                .iter()
                .map(|b| (b.min_bytes, b.weight))
                .collect(),
        }
    }
}

/// A static admission policy. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct PolicyProfile {
    pub name: String,
    pub window: Duration,
    pub max_requests: u64,
    pub algorithm: Algorithm,
    pub weight: WeightRule,
    pub dynamic_load: bool,
    pub progressive_penalty: bool,
    pub key_on_route: bool,
    pub allow_bypass: bool,
    routes: Vec<RoutePattern>,
    methods: Vec<String>,
    credential: CredentialMatch,
}

impl PolicyProfile {
    pub fn from_config(config: &ProfileConfig) -> TurnstileResult<Self> {
        if config.window_secs == 0 {
            return Err(TurnstileError::profile(&config.name, "window must be non-zero"));
        }
        if config.max_requests == 0 {
            return Err(TurnstileError::profile(&config.name, "max_requests must be non-zero"));
        }
        Ok(Self {
            name: config.name.clone(),
            window: Duration::from_secs(config.window_secs),
            max_requests: config.max_requests,
            algorithm: config.algorithm,
            weight: WeightRule::from(&config.weight),
            dynamic_load: config.dynamic_load,
            progressive_penalty: config.progressive_penalty,
            key_on_route: config.key_on_route,
            allow_bypass: config.allow_bypass,
            routes: config.routes.iter().map(|r| RoutePattern::parse(r)).collect(),
            methods: config.methods.iter().map(|m| m.to_ascii_uppercase()).collect(),
            credential: config.credential,
        })
    }

    pub fn routes(&self) -> &[RoutePattern] {
        &self.routes
    }

    fn accepts_method(&self, method: &str) -> bool {
        self.methods.is_empty() || self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }

    fn accepts_credential(&self, request: &RequestDescriptor) -> bool {
        match self.credential {
            CredentialMatch::Any => true,
            CredentialMatch::Required => request.has_credential(),
            CredentialMatch::Absent => !request.has_credential(),
        }
    }

    fn constraint_count(&self) -> u8 {
        let mut count = 0;
        if !self.methods.is_empty() {
            count += 1;
        }
        if self.credential != CredentialMatch::Any {
            count += 1;
        }
        count
    }

    /// Most specific route of this profile matching `request`, if any.
    fn best_match(&self, request: &RequestDescriptor) -> Option<&RoutePattern> {
        if !self.accepts_method(&request.method) || !self.accepts_credential(request) {
            return None;
        }
        self.routes
            .iter()
            .filter(|r| r.matches(&request.path))
            .max_by_key(|r| r.specificity())
    }
}

/// Serializable summary used by operational tooling.
#[derive(Debug, Clone, Serialize)]
pub struct ProfileSummary {
    pub name: String,
    pub routes: Vec<String>,
    pub window_secs: u64,
    pub max_requests: u64,
    pub algorithm: Algorithm,
    pub dynamic_load: bool,
    pub progressive_penalty: bool,
}

impl From<&PolicyProfile> for ProfileSummary {
    fn from(profile: &PolicyProfile) -> Self {
        Self {
            name: profile.name.clone(),
            routes: profile.routes.iter().map(|r| r.raw.clone()).collect(),
            window_secs: profile.window.as_secs(),
            max_requests: profile.max_requests,
            algorithm: profile.algorithm,
            dynamic_load: profile.dynamic_load,
            progressive_penalty: profile.progressive_penalty,
        }
    }
}

/// Result of classifying one request.
#[derive(Debug, Clone, Copy)]
pub struct Classification<'a> {
    pub profile: &'a PolicyProfile,
    /// The pattern that selected the profile; `None` for the default profile.
    pub route: Option<&'a RoutePattern>,
}

pub struct PolicyRouter {
    profiles: Vec<PolicyProfile>,
    default: PolicyProfile,
}

impl PolicyRouter {
    pub fn new(default: PolicyProfile, profiles: Vec<PolicyProfile>) -> Self {
        Self { profiles, default }
    }

    pub fn from_config(default: &ProfileConfig, profiles: &[ProfileConfig]) -> TurnstileResult<Self> {
        let default = PolicyProfile::from_config(default)?;
        let profiles = profiles
            .iter()
            .map(PolicyProfile::from_config)
            .collect::<TurnstileResult<Vec<_>>>()?;
        Ok(Self::new(default, profiles))
    }

    pub fn classify(&self, request: &RequestDescriptor) -> Classification<'_> {
        self.profiles
            .iter()
            .filter_map(|profile| profile.best_match(request).map(|route| (profile, route)))
            .max_by_key(|(profile, route)| {
                let (rank, len) = route.specificity();
                (rank, len, profile.constraint_count())
            })
            .map(|(profile, route)| Classification {
                profile,
                route: Some(route),
            })
            .unwrap_or(Classification {
                profile: &self.default,
                route: None,
            })
    }

    pub fn default_profile(&self) -> &PolicyProfile {
        &self.default
    }

    pub fn profiles(&self) -> impl Iterator<Item = &PolicyProfile> {
        std::iter::once(&self.default).chain(self.profiles.iter())
    }
}
