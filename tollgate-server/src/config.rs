//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via TOLLGATE_CONFIG)
//! 3. Environment variables

use crate::endpoint::ExhaustionPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tollgate_auth::{
    BasicAuthModule, BearerTokenModule, ConstraintSet, DigestAlgorithm, SecurityConstraint,
};
use tollgate_core::session::DEFAULT_COOKIE_NAME;
use tollgate_core::SessionConfig;
use tollgate_protocol::{
    Status, DEFAULT_MAX_BODY_SIZE, DEFAULT_MAX_HEADER_SIZE, DEFAULT_MAX_PACKET_SIZE,
};

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listening connectors.
    pub connectors: Vec<ConnectorConfig>,
    /// Virtual hosts.
    pub hosts: Vec<HostConfig>,
    /// Deployed contexts and their routes.
    pub contexts: Vec<ContextConfig>,
    /// Session configuration.
    pub session: SessionSettings,
    /// Users, roles and bearer tokens.
    pub realm: RealmConfig,
    /// Login methods shared by every protected context.
    pub security: SecurityConfig,
    /// Secure host configs used by secure connectors.
    pub tls: Vec<SecureHostConfig>,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connectors: vec![ConnectorConfig::default()],
            hosts: vec![HostConfig {
                name: "localhost".into(),
                aliases: vec!["127.0.0.1".into()],
                default: true,
            }],
            contexts: vec![ContextConfig {
                host: "localhost".into(),
                path: "/".into(),
                routes: vec![RouteConfig {
                    pattern: "/".into(),
                    handler: HandlerKind::Static,
                    status: 200,
                    body: "tollgate\n".into(),
                    content_type: None,
                }],
                constraints: Vec::new(),
            }],
            session: SessionSettings::default(),
            realm: RealmConfig::default(),
            security: SecurityConfig::default(),
            tls: Vec::new(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        // Start with defaults
        let mut config = Self::default();

        // Load from file if specified
        if let Ok(path) = std::env::var("TOLLGATE_CONFIG") {
            config = Self::from_file(&path)?;
        }

        // Apply environment variable overrides
        config.apply_env_overrides();

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Applies `TOLLGATE_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides read through `var`.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(addr) = var("TOLLGATE_BIND").and_then(|a| a.parse().ok()) {
            if let Some(first) = self.connectors.first_mut() {
                first.bind_addr = addr;
            }
        }

        if let Some(max) = var("TOLLGATE_MAX_CONNECTIONS").and_then(|m| m.parse().ok()) {
            for connector in &mut self.connectors {
                connector.max_connections = max;
            }
        }

        if let Some(secs) = var("TOLLGATE_IDLE_TIMEOUT").and_then(|t| t.parse().ok()) {
            for connector in &mut self.connectors {
                connector.idle_timeout_secs = secs;
            }
        }

        if let Some(secs) = var("TOLLGATE_SESSION_TIMEOUT").and_then(|t| t.parse().ok()) {
            self.session.max_inactive_secs = secs;
        }

        if let Some(path) = var("TOLLGATE_SECRETS_FILE") {
            self.realm.secrets_file = Some(PathBuf::from(path));
        }

        if let Some(enabled) = var("TOLLGATE_METRICS_ENABLED") {
            self.metrics.enabled = enabled == "1" || enabled.to_lowercase() == "true";
        }

        if let Some(addr) = var("TOLLGATE_METRICS_BIND").and_then(|a| a.parse().ok()) {
            self.metrics.bind_addr = addr;
        }
    }

    /// Loads secrets from external file if configured.
    pub fn load_secrets(&mut self) -> Result<(), ConfigError> {
        self.realm.load_secrets()
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }

    /// Rejects contradictory settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connectors.is_empty() {
            return Err(invalid("no connectors configured"));
        }
        let mut names = HashSet::new();
        for connector in &self.connectors {
            if !names.insert(connector.name.as_str()) {
                return Err(invalid(format!("duplicate connector name '{}'", connector.name)));
            }
            connector.validate()?;
            if connector.secure && self.tls.is_empty() {
                return Err(invalid(format!(
                    "connector '{}' is secure but no tls host config is set",
                    connector.name
                )));
            }
        }

        if self.hosts.iter().filter(|h| h.default).count() > 1 {
            return Err(invalid("more than one default host"));
        }

        for context in &self.contexts {
            ConstraintSet::new(context.constraints.clone()).map_err(|e| {
                invalid(format!("context {}{}: {}", context.host, context.path, e))
            })?;
            for route in &context.routes {
                if Status::from_u16(route.status).is_none() {
                    return Err(invalid(format!(
                        "route '{}': invalid status {}",
                        route.pattern, route.status
                    )));
                }
            }
        }

        self.realm.validate()?;
        self.security.validate()?;

        let mut tls_names = HashSet::new();
        for host in &self.tls {
            if !tls_names.insert(host.host_name.to_ascii_lowercase()) {
                return Err(invalid(format!("duplicate tls host config '{}'", host.host_name)));
            }
            host.validate()?;
        }

        Ok(())
    }
}

/// Wire protocol spoken by a connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    #[default]
    Http1,
    Relay,
}

impl ProtocolKind {
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolKind::Http1 => "http1",
            ProtocolKind::Relay => "relay",
        }
    }
}

/// One listening connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    pub name: String,
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    pub protocol: ProtocolKind,
    /// Terminate TLS with the configured secure host configs.
    pub secure: bool,
    /// Port of the secure connector plain requests are redirected to.
    pub redirect_port: Option<u16>,
    /// Maximum concurrent connections holding a pooled processor.
    pub max_connections: usize,
    /// Idle connection timeout in seconds.
    pub idle_timeout_secs: u64,
    /// Requests served per connection before it is closed (-1 = unlimited).
    pub max_keep_alive_requests: i32,
    /// Maximum request line plus header block, in bytes.
    pub max_header_size: usize,
    /// Maximum request body, in bytes.
    pub max_payload_size: usize,
    /// Maximum relay packet payload, in bytes.
    pub max_packet_size: usize,
    /// Initial processor pool capacity.
    pub pool_size: usize,
    /// Hard processor pool limit (unbounded when absent).
    pub pool_limit: Option<usize>,
    /// What to do when every connection slot is taken.
    pub exhaustion_policy: ExhaustionPolicy,
    /// Protocols a connection may switch to through `Upgrade`.
    pub upgrades: Vec<ProtocolKind>,
    /// Accept the secure flag a fronting proxy forwards. Relay connectors
    /// always accept it.
    pub trusted_proxy: bool,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            name: "http".into(),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            protocol: ProtocolKind::Http1,
            secure: false,
            redirect_port: None,
            max_connections: 1000,
            idle_timeout_secs: 60,
            max_keep_alive_requests: 100,
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            max_payload_size: DEFAULT_MAX_BODY_SIZE,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            pool_size: 16,
            pool_limit: Some(256),
            exhaustion_policy: ExhaustionPolicy::Transient,
            upgrades: Vec::new(),
            trusted_proxy: false,
        }
    }
}

impl ConnectorConfig {
    /// Whether forwarded requests may claim a secure client transport.
    pub fn trusts_forwarded_secure(&self) -> bool {
        self.trusted_proxy || self.protocol == ProtocolKind::Relay
    }

    /// Returns idle timeout as Duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Keep-alive request limit, `None` when unlimited.
    pub fn keep_alive_limit(&self) -> Option<u32> {
        u32::try_from(self.max_keep_alive_requests)
            .ok()
            .filter(|n| *n > 0)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(invalid(format!("connector '{}': max_connections is 0", self.name)));
        }
        if let Some(limit) = self.pool_limit {
            if self.pool_size > limit {
                return Err(invalid(format!(
                    "connector '{}': pool_size {} exceeds pool_limit {}",
                    self.name, self.pool_size, limit
                )));
            }
        }
        if self.max_header_size == 0 {
            return Err(invalid(format!("connector '{}': max_header_size is 0", self.name)));
        }
        Ok(())
    }
}

/// A virtual host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Host name, or `*.domain` for a wildcard host.
    pub name: String,
    pub aliases: Vec<String>,
    /// Serve requests whose host matches nothing else.
    pub default: bool,
}

/// A deployed context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub host: String,
    /// Context path, `/` for the root context.
    pub path: String,
    pub routes: Vec<RouteConfig>,
    pub constraints: Vec<SecurityConstraint>,
}

/// Built-in request handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    /// Fixed status and body.
    #[default]
    Static,
    /// Describes the request back as JSON.
    Echo,
}

/// A wrapper pattern inside a context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    /// Exact path, `/prefix/*`, `*.ext` or `/` for the default route.
    pub pattern: String,
    pub handler: HandlerKind,
    pub status: u16,
    pub body: String,
    pub content_type: Option<String>,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            pattern: "/".into(),
            handler: HandlerKind::Static,
            status: 200,
            body: String::new(),
            content_type: None,
        }
    }
}

/// Session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub cookie_name: String,
    /// Max inactive interval in seconds.
    pub max_inactive_secs: u64,
    /// Seconds between idle-session sweeps.
    pub reaper_interval_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            cookie_name: DEFAULT_COOKIE_NAME.into(),
            max_inactive_secs: 1800,
            reaper_interval_secs: 60,
        }
    }
}

impl SessionSettings {
    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            cookie_name: self.cookie_name.clone(),
            max_inactive: Duration::from_secs(self.max_inactive_secs),
            reaper_interval: Duration::from_secs(self.reaper_interval_secs.max(1)),
        }
    }
}

/// A realm user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    pub name: String,
    /// Stored credential: `salt$iterations$digest`, `{ALG}base64` or hex.
    pub credential: String,
    pub roles: Vec<String>,
}

/// A bearer token bound to a principal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BearerTokenConfig {
    /// SHA-256 hex hash of the token.
    pub hash: String,
    pub principal: String,
}

/// Lock-out policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockoutConfig {
    pub enabled: bool,
    pub failure_count: u32,
    pub lockout_secs: u64,
    /// Most users with a failure record at once.
    pub cache_size: usize,
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_count: 5,
            lockout_secs: 300,
            cache_size: 1000,
        }
    }
}

impl LockoutConfig {
    pub fn lockout(&self) -> Duration {
        Duration::from_secs(self.lockout_secs)
    }
}

/// Realm configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealmConfig {
    /// Realm name, sent in challenges.
    pub name: String,
    /// Digest used for bare-hex stored credentials.
    pub digest: String,
    pub users: Vec<UserConfig>,
    pub lockout: LockoutConfig,
    pub bearer_tokens: Vec<BearerTokenConfig>,
    /// Optional file of `<sha256-hex> <principal>` lines, one token per line.
    pub secrets_file: Option<PathBuf>,
}

impl Default for RealmConfig {
    fn default() -> Self {
        Self {
            name: "tollgate".into(),
            digest: DigestAlgorithm::Sha256.name().into(),
            users: Vec::new(),
            lockout: LockoutConfig::default(),
            bearer_tokens: Vec::new(),
            secrets_file: None,
        }
    }
}

impl RealmConfig {
    /// Parsed default digest.
    pub fn digest(&self) -> Result<DigestAlgorithm, ConfigError> {
        self.digest
            .parse()
            .map_err(|_| invalid(format!("unknown digest '{}'", self.digest)))
    }

    /// Loads bearer tokens from the secrets file if configured.
    pub fn load_secrets(&mut self) -> Result<(), ConfigError> {
        if let Some(ref path) = self.secrets_file {
            let content =
                std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(path.clone(), e))?;
            for (number, line) in content.lines().enumerate() {
                let line = line.trim();
                // Skip empty lines and comments
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let mut fields = line.split_whitespace();
                match (fields.next(), fields.next(), fields.next()) {
                    (Some(hash), Some(principal), None) => {
                        self.bearer_tokens.push(BearerTokenConfig {
                            hash: hash.to_string(),
                            principal: principal.to_string(),
                        })
                    }
                    _ => {
                        return Err(ConfigError::ParseError(
                            path.clone(),
                            format!("line {}: expected '<hash> <principal>'", number + 1),
                        ))
                    }
                }
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.digest()?;
        if self.lockout.enabled && self.lockout.cache_size == 0 {
            return Err(invalid("realm lockout cache_size is 0"));
        }
        for token in &self.bearer_tokens {
            if token.hash.len() != 64 || !token.hash.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(invalid(format!(
                    "bearer token for '{}' is not a SHA-256 hex hash",
                    token.principal
                )));
            }
        }
        Ok(())
    }
}

/// Authentication settings for protected contexts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Login methods tried in order (`BASIC`, `BEARER`).
    pub login_methods: Vec<String>,
    /// Cache authenticated principals in the session.
    pub cache: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            login_methods: vec![BasicAuthModule::METHOD.into()],
            cache: true,
        }
    }
}

impl SecurityConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        for method in &self.login_methods {
            let known = [BasicAuthModule::METHOD, BearerTokenModule::METHOD]
                .iter()
                .any(|m| m.eq_ignore_ascii_case(method));
            if !known {
                return Err(invalid(format!("unknown login method '{}'", method)));
            }
        }
        Ok(())
    }
}

/// Certificate and key served for one host name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecureHostConfig {
    /// SNI host name, `*.domain` for a wildcard, or `_default_`.
    pub host_name: String,
    /// Path to PEM-encoded certificate chain.
    pub cert_path: PathBuf,
    /// Path to PEM-encoded private key.
    pub key_path: PathBuf,
    /// Path to PEM-encoded CA certificate(s) for verifying client certs.
    /// Setting it requires client certificates (mTLS).
    pub client_ca_path: Option<PathBuf>,
}

impl SecureHostConfig {
    pub const DEFAULT_HOST_NAME: &'static str = "_default_";

    pub fn new(
        host_name: impl Into<String>,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            host_name: host_name.into(),
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            client_ca_path: None,
        }
    }

    pub fn is_default(&self) -> bool {
        self.host_name == Self::DEFAULT_HOST_NAME
    }

    /// Validates TLS configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cert_path.as_os_str().is_empty() {
            return Err(invalid(format!("tls host '{}': cert_path not set", self.host_name)));
        }
        if self.key_path.as_os_str().is_empty() {
            return Err(invalid(format!("tls host '{}': key_path not set", self.host_name)));
        }
        Ok(())
    }
}

impl Default for SecureHostConfig {
    fn default() -> Self {
        Self::new(Self::DEFAULT_HOST_NAME, PathBuf::new(), PathBuf::new())
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics HTTP server.
    pub enabled: bool,
    /// Address to bind the metrics server to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(message.into())
}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use tollgate_auth::TransportGuarantee;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.connectors.len(), 1);
        assert_eq!(config.connectors[0].bind_addr.port(), 8080);
        assert_eq!(config.connectors[0].keep_alive_limit(), Some(100));
        assert_eq!(config.session.cookie_name, "SESSIONID");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.connectors[0].bind_addr, config.connectors[0].bind_addr);
        assert_eq!(parsed.contexts[0].routes[0].body, "tollgate\n");
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(
            br#"
connectors:
  - name: plain
    bind_addr: "127.0.0.1:8080"
    redirect_port: 8443
    exhaustion_policy: defer
    max_keep_alive_requests: -1
  - name: ajp
    bind_addr: "127.0.0.1:8009"
    protocol: relay
hosts:
  - name: shop.example.com
    aliases: [www.shop.example.com]
    default: true
contexts:
  - host: shop.example.com
    path: /admin
    routes:
      - pattern: "/*"
        handler: echo
    constraints:
      - patterns: ["/*"]
        roles: [admin]
        transport: confidential
realm:
  name: Shop
  users:
    - name: alice
      credential: "{SHA-256}K7gNU3sdo+OL0wNhqoVWhr3g6s1xYv72ol/pe/Unols="
      roles: [admin]
  lockout:
    cache_size: 250
security:
  login_methods: [BEARER, BASIC]
"#,
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.connectors.len(), 2);
        assert_eq!(config.connectors[0].redirect_port, Some(8443));
        assert_eq!(config.connectors[0].exhaustion_policy, ExhaustionPolicy::Defer);
        assert_eq!(config.connectors[0].keep_alive_limit(), None);
        assert_eq!(config.connectors[1].protocol, ProtocolKind::Relay);
        assert!(!config.connectors[0].trusts_forwarded_secure());
        assert!(config.connectors[1].trusts_forwarded_secure());
        // Unset fields keep their defaults.
        assert_eq!(config.connectors[1].max_connections, 1000);

        let context = &config.contexts[0];
        assert_eq!(context.routes[0].handler, HandlerKind::Echo);
        assert_eq!(context.constraints[0].transport, TransportGuarantee::Confidential);
        assert!(context.constraints[0].authenticate);
        assert_eq!(config.realm.users[0].roles, vec!["admin"]);
        assert_eq!(config.realm.lockout.cache_size, 250);
        assert_eq!(config.realm.lockout.failure_count, 5);
        assert_eq!(config.session.max_inactive_secs, 1800);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_errors() {
        let err = Config::from_file("/nonexistent/tollgate.yaml").unwrap_err();
        assert!(err.to_string().contains("failed to read"));

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"connectors: 12").unwrap();
        let err = Config::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_, _)));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tollgate.yaml");
        let mut config = Config::default();
        config.connectors[0].name = "saved".into();
        config.save(&path).unwrap();
        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.connectors[0].name, "saved");
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("TOLLGATE_BIND", "0.0.0.0:9000"),
            ("TOLLGATE_MAX_CONNECTIONS", "32"),
            ("TOLLGATE_IDLE_TIMEOUT", "5"),
            ("TOLLGATE_SESSION_TIMEOUT", "120"),
            ("TOLLGATE_METRICS_ENABLED", "true"),
            ("TOLLGATE_METRICS_BIND", "127.0.0.1:9191"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.connectors[0].bind_addr.port(), 9000);
        assert_eq!(config.connectors[0].max_connections, 32);
        assert_eq!(config.connectors[0].idle_timeout(), Duration::from_secs(5));
        assert_eq!(config.session.max_inactive_secs, 120);
        assert!(config.metrics.enabled);
        assert_eq!(config.metrics.bind_addr.port(), 9191);
    }

    #[test]
    fn test_invalid_overrides_ignored() {
        let mut config = Config::default();
        config.apply_overrides(|key| (key == "TOLLGATE_BIND").then(|| "not-an-addr".to_string()));
        assert_eq!(config.connectors[0].bind_addr.port(), 8080);
    }

    #[test]
    fn test_validate_rejects_contradictions() {
        let mut config = Config::default();
        config.connectors[0].pool_size = 10;
        config.connectors[0].pool_limit = Some(4);
        assert!(config.validate().unwrap_err().to_string().contains("pool_size"));

        let mut config = Config::default();
        config.connectors[0].secure = true;
        assert!(config.validate().unwrap_err().to_string().contains("tls"));

        let mut config = Config::default();
        config.realm.digest = "MD5".into();
        assert!(config.validate().unwrap_err().to_string().contains("digest"));

        let mut config = Config::default();
        config.security.login_methods = vec!["FORM".into()];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.connectors.push(ConnectorConfig::default());
        assert!(config.validate().unwrap_err().to_string().contains("duplicate"));

        let mut config = Config::default();
        config.contexts[0].constraints = vec![SecurityConstraint::new(["admin"])];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.realm.lockout.cache_size = 0;
        assert!(config.validate().unwrap_err().to_string().contains("cache_size"));

        let mut config = Config::default();
        config.realm.bearer_tokens.push(BearerTokenConfig {
            hash: "abc".into(),
            principal: "robot".into(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_secrets() {
        let mut secrets = NamedTempFile::new().unwrap();
        let hash = BearerTokenModule::hash_token("tok");
        writeln!(secrets, "# service tokens").unwrap();
        writeln!(secrets).unwrap();
        writeln!(secrets, "{} robot", hash).unwrap();

        let mut config = Config::default();
        config.realm.secrets_file = Some(secrets.path().to_path_buf());
        config.load_secrets().unwrap();
        assert_eq!(config.realm.bearer_tokens.len(), 1);
        assert_eq!(config.realm.bearer_tokens[0].principal, "robot");

        let mut bad = NamedTempFile::new().unwrap();
        writeln!(bad, "only-a-hash").unwrap();
        config.realm.secrets_file = Some(bad.path().to_path_buf());
        assert!(config.load_secrets().is_err());
    }
}
