use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// Top-level Turnstile configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub penalty: PenaltyConfig,
    #[serde(default)]
    pub load: LoadConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub bypass: BypassConfig,
    /// Upper bound of the random jitter added to every retry-after hint.
    #[serde(default = "default_retry_jitter")]
    pub retry_jitter_secs: u64,
    /// Fraction of the effective limit above which a key is reported as
    /// suspected abuse.
    #[serde(default = "default_suspicious_fraction")]
    pub suspicious_fraction: f64,
    #[serde(default)]
    pub default_profile: ProfileConfig,
    #[serde(default)]
    pub profiles: Vec<ProfileConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            store: StoreConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            penalty: PenaltyConfig::default(),
            load: LoadConfig::default(),
            identity: IdentityConfig::default(),
            bypass: BypassConfig::default(),
            retry_jitter_secs: default_retry_jitter(),
            suspicious_fraction: default_suspicious_fraction(),
            default_profile: ProfileConfig::default(),
            profiles: vec![],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub admin: AdminConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_listen")]
    pub listen: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen: default_admin_listen(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Memory,
    Redis,
}

/// Shared counter store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_kind")]
    pub kind: StoreKind,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Bound on every shared-store round trip. A call exceeding it counts as
    /// a failure for the circuit breaker.
    #[serde(default = "default_store_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: default_store_kind(),
            url: None,
            key_prefix: default_key_prefix(),
            timeout_ms: default_store_timeout(),
            purge_interval_secs: default_purge_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PenaltyConfig {
    #[serde(default = "default_max_penalty_level")]
    pub max_level: u32,
    #[serde(default = "default_penalty_decay")]
    pub decay_secs: u64,
}

impl Default for PenaltyConfig {
    fn default() -> Self {
        Self {
            max_level: default_max_penalty_level(),
            decay_secs: default_penalty_decay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadConfig {
    #[serde(default = "default_load_threshold")]
    pub threshold: f64,
    #[serde(default = "default_min_fraction")]
    pub min_fraction: f64,
    /// Samples older than this are treated as missing. Zero disables the check.
    #[serde(default = "default_load_max_age")]
    pub max_age_secs: u64,
    /// Sample the host load average instead of waiting for pushed values.
    #[serde(default)]
    pub poll_loadavg: bool,
    #[serde(default = "default_load_poll_interval")]
    pub poll_interval_secs: u64,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            threshold: default_load_threshold(),
            min_fraction: default_min_fraction(),
            max_age_secs: default_load_max_age(),
            poll_loadavg: false,
            poll_interval_secs: default_load_poll_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// HMAC key for bearer credential hashing. Every instance sharing a store
    /// must use the same value.
    #[serde(default = "default_credential_salt")]
    pub credential_salt: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            credential_salt: default_credential_salt(),
        }
    }
}

impl IdentityConfig {
    pub fn uses_default_salt(&self) -> bool {
        self.credential_salt == default_credential_salt()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BypassConfig {
    /// Header carrying the bypass secret.
    #[serde(default = "default_bypass_header")]
    pub header: String,
    #[serde(default)]
    pub secret: Option<String>,
    /// CIDR ranges or bare addresses that are never limited.
    #[serde(default)]
    pub trusted_networks: Vec<String>,
    #[serde(default)]
    pub trusted_networks_file: Option<PathBuf>,
    /// Case-insensitive user-agent substrings marking trusted agents.
    #[serde(default)]
    pub trusted_agents: Vec<String>,
}

impl Default for BypassConfig {
    fn default() -> Self {
        Self {
            header: default_bypass_header(),
            secret: None,
            trusted_networks: vec![],
            trusted_networks_file: None,
            trusted_agents: vec![],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmKind {
    Counter,
    TokenBucket,
}

/// Credential presence a profile requires before it matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialMatch {
    Any,
    Required,
    Absent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileConfig {
    pub name: String,
    /// Route patterns: exact (`/api/login`), parameterised (`/api/items/:id`)
    /// or prefix (`/api/search*`).
    #[serde(default)]
    pub routes: Vec<String>,
    /// Restrict to these methods. Empty matches every method.
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default = "default_credential_match")]
    pub credential: CredentialMatch,
    #[serde(default = "default_window")]
    pub window_secs: u64,
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,
    #[serde(default = "default_algorithm")]
    pub algorithm: AlgorithmKind,
    #[serde(default)]
    pub weight: WeightConfig,
    #[serde(default)]
    pub dynamic_load: bool,
    #[serde(default)]
    pub progressive_penalty: bool,
    #[serde(default)]
    pub key_on_route: bool,
    #[serde(default = "default_true")]
    pub allow_bypass: bool,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            routes: vec![],
            methods: vec![],
            credential: CredentialMatch::Any,
            window_secs: default_window(),
            max_requests: default_max_requests(),
            algorithm: default_algorithm(),
            weight: WeightConfig::default(),
            dynamic_load: false,
            progressive_penalty: false,
            key_on_route: false,
            allow_bypass: true,
        }
    }
}

/// How many quota units one call costs. The largest matching rule wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightConfig {
    #[serde(default = "default_weight")]
    pub default: u32,
    #[serde(default)]
    pub path_prefixes: Vec<PathWeight>,
    #[serde(default)]
    pub body_size: Vec<BodyWeight>,
}

impl Default for WeightConfig {
    fn default() -> Self {
        Self {
            default: default_weight(),
            path_prefixes: vec![],
            body_size: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathWeight {
    pub prefix: String,
    pub weight: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BodyWeight {
    pub min_bytes: u64,
    pub weight: u32,
}

// Default value helpers
fn default_admin_listen() -> String {
    "127.0.0.1:9090".to_string()
}
fn default_true() -> bool {
    true
}
fn default_store_kind() -> StoreKind {
    StoreKind::Memory
}
fn default_key_prefix() -> String {
    "turnstile:".to_string()
}
fn default_store_timeout() -> u64 {
    250
}
fn default_purge_interval() -> u64 {
    60
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_cooldown() -> u64 {
    30
}
fn default_max_penalty_level() -> u32 {
    5
}
fn default_penalty_decay() -> u64 {
    3600
}
fn default_load_threshold() -> f64 {
    0.7
}
fn default_min_fraction() -> f64 {
    0.3
}
fn default_load_max_age() -> u64 {
    30
}
fn default_load_poll_interval() -> u64 {
    5
}
fn default_credential_salt() -> String {
    "turnstile-credential-salt".to_string()
}
fn default_bypass_header() -> String {
    "x-turnstile-bypass".to_string()
}
fn default_retry_jitter() -> u64 {
    5
}
fn default_suspicious_fraction() -> f64 {
    0.8
}
fn default_credential_match() -> CredentialMatch {
    CredentialMatch::Any
}
fn default_window() -> u64 {
    60
}
fn default_max_requests() -> u64 {
    100
}
fn default_algorithm() -> AlgorithmKind {
    AlgorithmKind::Counter
}
fn default_weight() -> u32 {
    1
}

/// Highest penalty level whose multiplier still fits the quota arithmetic.
const PENALTY_LEVEL_CEILING: u32 = 32;

impl AppConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        if config.identity.uses_default_salt() {
            tracing::warn!("identity.credential_salt is not set; using the built-in default");
        }
        Ok(config)
    }

    /// Validate the configuration for consistency.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.store.kind == StoreKind::Redis && self.store.url.is_none() {
            anyhow::bail!("store.url is required when store.kind is redis");
        }
        if self.store.timeout_ms == 0 {
            anyhow::bail!("store.timeout_ms must be greater than zero");
        }
        if self.circuit_breaker.failure_threshold == 0 {
            anyhow::bail!("circuit_breaker.failure_threshold must be greater than zero");
        }
        if self.penalty.max_level > PENALTY_LEVEL_CEILING {
            anyhow::bail!(
                "penalty.max_level must be at most {}, got {}",
                PENALTY_LEVEL_CEILING,
                self.penalty.max_level
            );
        }
        if !(self.load.threshold > 0.0 && self.load.threshold <= 1.0) {
            anyhow::bail!("load.threshold must be in (0, 1], got {}", self.load.threshold);
        }
        if !(0.0..=1.0).contains(&self.load.min_fraction) {
            anyhow::bail!(
                "load.min_fraction must be in [0, 1], got {}",
                self.load.min_fraction
            );
        }
        if !(self.suspicious_fraction > 0.0 && self.suspicious_fraction <= 1.0) {
            anyhow::bail!(
                "suspicious_fraction must be in (0, 1], got {}",
                self.suspicious_fraction
            );
        }

        let header = self.bypass.header.trim();
        let valid_header = !header.is_empty()
            && header
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b));
        if !valid_header {
            anyhow::bail!("bypass.header '{}' is not a valid header name", self.bypass.header);
        }

        for entry in &self.bypass.trusted_networks {
            if entry.parse::<ipnet::IpNet>().is_err()
                && entry.parse::<std::net::IpAddr>().is_err()
            {
                anyhow::bail!("bypass.trusted_networks entry '{}' is not a CIDR or IP", entry);
            }
        }

        self.default_profile.validate(true)?;

        let mut names = HashSet::new();
        names.insert(self.default_profile.name.as_str());
        for profile in &self.profiles {
            profile.validate(false)?;
            if !names.insert(profile.name.as_str()) {
                anyhow::bail!("duplicate profile name '{}'", profile.name);
            }
        }

        Ok(())
    }
}

impl ProfileConfig {
    fn validate(&self, is_default: bool) -> anyhow::Result<()> {
        let valid_name = !self.name.is_empty()
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid_name {
            anyhow::bail!(
                "profile name '{}' must be non-empty and use only [A-Za-z0-9_-]",
                self.name
            );
        }
        if self.window_secs == 0 {
            anyhow::bail!("profile '{}': window_secs must be greater than zero", self.name);
        }
        if self.max_requests == 0 {
            anyhow::bail!("profile '{}': max_requests must be greater than zero", self.name);
        }
        if !is_default && self.routes.is_empty() {
            anyhow::bail!("profile '{}' has no routes", self.name);
        }
        for route in &self.routes {
            if !route.starts_with('/') {
                anyhow::bail!("profile '{}': route '{}' must start with '/'", self.name, route);
            }
        }
        let zero_weight = self.weight.default == 0
            || self.weight.path_prefixes.iter().any(|w| w.weight == 0)
            || self.weight.body_size.iter().any(|w| w.weight == 0);
        if zero_weight {
            anyhow::bail!("profile '{}': weights must be greater than zero", self.name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
store:
  kind: memory
bypass:
  secret: "let-me-in"
  trusted_networks: ["10.0.0.0/8", "127.0.0.1"]
default_profile:
  name: default
  window_secs: 60
  max_requests: 100
profiles:
  - name: auth
    routes: ["/api/auth/login", "/api/auth/*"]
    methods: [POST]
    window_secs: 900
    max_requests: 5
    progressive_penalty: true
  - name: search
    routes: ["/api/search*"]
    algorithm: token_bucket
    max_requests: 30
    dynamic_load: true
    weight:
      default: 1
      body_size:
        - min_bytes: 1048576
          weight: 3
"#;

    #[test]
    fn parses_sample_config() {
        let config = AppConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.profiles.len(), 2);
        assert_eq!(config.profiles[0].name, "auth");
        assert_eq!(config.profiles[0].credential, CredentialMatch::Any);
        assert_eq!(config.profiles[1].algorithm, AlgorithmKind::TokenBucket);
        assert_eq!(config.profiles[1].weight.body_size[0].weight, 3);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.penalty.decay_secs, 3600);
        assert_eq!(config.retry_jitter_secs, 5);
    }

    #[test]
    fn shipped_config_is_valid() {
        let config = AppConfig::from_yaml(include_str!("../../../config/turnstile.yaml")).unwrap();
        assert_eq!(config.profiles.len(), 3);
        assert!(!config.identity.uses_default_salt());
        assert_eq!(config.profiles[1].credential, CredentialMatch::Required);
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config = AppConfig::from_yaml("{}").unwrap();
        assert_eq!(config.default_profile.name, "default");
        assert_eq!(config.store.kind, StoreKind::Memory);
        assert_eq!(config.load.threshold, 0.7);
        assert_eq!(config.load.min_fraction, 0.3);
    }

    #[test]
    fn rejects_redis_without_url() {
        let err = AppConfig::from_yaml("store:\n  kind: redis\n").unwrap_err();
        assert!(err.to_string().contains("store.url"));
    }

    #[test]
    fn rejects_duplicate_profile_names() {
        let yaml = r#"
profiles:
  - name: api
    routes: ["/api*"]
  - name: api
    routes: ["/v2*"]
"#;
        let err = AppConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn rejects_zero_window_and_zero_weight() {
        let yaml = "profiles:\n  - name: a\n    routes: [\"/a\"]\n    window_secs: 0\n";
        assert!(AppConfig::from_yaml(yaml).is_err());

        let yaml = "profiles:\n  - name: a\n    routes: [\"/a\"]\n    weight:\n      default: 0\n";
        assert!(AppConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn rejects_bad_trusted_network() {
        let yaml = "bypass:\n  trusted_networks: [\"not-a-network\"]\n";
        assert!(AppConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn rejects_bad_bypass_header() {
        assert!(AppConfig::from_yaml("bypass:\n  header: \"\"\n").is_err());
        assert!(AppConfig::from_yaml("bypass:\n  header: \"x bypass\"\n").is_err());
        let config = AppConfig::from_yaml("bypass:\n  header: X-Ops-Bypass\n").unwrap();
        assert_eq!(config.bypass.header, "X-Ops-Bypass");
    }

    #[test]
    fn rejects_profile_without_routes() {
        let yaml = "profiles:\n  - name: orphan\n";
        assert!(AppConfig::from_yaml(yaml).is_err());
    }
}
