//! Pluggable authentication modules.
//!
//! Modules are created from factories registered in an
//! [`AuthModuleRegistry`] under a login-method name (`BASIC`, `BEARER`).
//! The registry is populated at startup and handed to whoever builds the
//! [`Authenticator`](crate::Authenticator).

use crate::error::AuthError;
use crate::realm::Realm;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tollgate_core::Principal;
use tollgate_protocol::Request;
use tracing::debug;

/// Result of one module's attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthOutcome {
    /// Credentials were valid.
    Success(Principal),
    /// Credentials were presented and rejected.
    Failure,
    /// No credentials for this module; let the next one try.
    Defer,
}

/// Authenticates a request against a realm by one login method.
#[async_trait]
pub trait AuthModule: Send + Sync {
    /// Login-method name, e.g. `BASIC`.
    fn method(&self) -> &str;

    async fn authenticate(&self, request: &Request, realm: &dyn Realm) -> AuthOutcome;

    /// `WWW-Authenticate` value sent on a challenge, if any.
    fn challenge(&self, realm_name: &str) -> Option<String>;
}

/// Creates [`AuthModule`]s for one login method.
pub trait AuthModuleFactory: Send + Sync {
    fn method(&self) -> &str;

    fn create(&self) -> Arc<dyn AuthModule>;
}

/// Login-method name to factory.
#[derive(Default, Clone)]
pub struct AuthModuleRegistry {
    factories: HashMap<String, Arc<dyn AuthModuleFactory>>,
}

impl AuthModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the modules that need no configuration (`BASIC`).
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(BasicAuthFactory));
        registry
    }

    /// Registers a factory, replacing any factory with the same name.
    pub fn register(&mut self, factory: Arc<dyn AuthModuleFactory>) {
        self.factories
            .insert(factory.method().to_ascii_uppercase(), factory);
    }

    pub fn contains(&self, method: &str) -> bool {
        self.factories.contains_key(&method.to_ascii_uppercase())
    }

    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<_> = self.factories.keys().cloned().collect();
        methods.sort();
        methods
    }

    pub fn create(&self, method: &str) -> Result<Arc<dyn AuthModule>, AuthError> {
        self.factories
            .get(&method.to_ascii_uppercase())
            .map(|f| f.create())
            .ok_or_else(|| AuthError::UnknownLoginMethod(method.to_string()))
    }

    /// Creates one module per login method, in order.
    pub fn create_chain<S: AsRef<str>>(
        &self,
        methods: &[S],
    ) -> Result<Vec<Arc<dyn AuthModule>>, AuthError> {
        methods.iter().map(|m| self.create(m.as_ref())).collect()
    }
}

/// Returns the credentials of an `Authorization` header with `scheme`.
fn authorization<'r>(request: &'r Request, scheme: &str) -> Option<&'r str> {
    let value = request.headers.get("authorization")?.trim();
    let (given, credentials) = value.split_once(' ')?;
    given
        .eq_ignore_ascii_case(scheme)
        .then(|| credentials.trim())
}

/// `Authorization: Basic` username/password authentication.
#[derive(Debug, Default)]
pub struct BasicAuthModule;

impl BasicAuthModule {
    pub const METHOD: &'static str = "BASIC";
}

#[async_trait]
impl AuthModule for BasicAuthModule {
    fn method(&self) -> &str {
        Self::METHOD
    }

    async fn authenticate(&self, request: &Request, realm: &dyn Realm) -> AuthOutcome {
        let Some(encoded) = authorization(request, "basic") else {
            return AuthOutcome::Defer;
        };
        let Some((username, password)) = general_purpose::STANDARD
            .decode(encoded)
            .ok()
            .and_then(|raw| String::from_utf8(raw).ok())
            .and_then(|text| {
                text.split_once(':')
                    .map(|(u, p)| (u.to_string(), p.to_string()))
            })
        else {
            debug!("malformed basic credentials");
            return AuthOutcome::Failure;
        };
        match realm.authenticate(&username, &password).await {
            Some(principal) => AuthOutcome::Success(principal.with_auth_method(Self::METHOD)),
            None => AuthOutcome::Failure,
        }
    }

    fn challenge(&self, realm_name: &str) -> Option<String> {
        Some(format!(
            "Basic realm=\"{}\", charset=\"UTF-8\"",
            escape_quoted(realm_name)
        ))
    }
}

struct BasicAuthFactory;

impl AuthModuleFactory for BasicAuthFactory {
    fn method(&self) -> &str {
        BasicAuthModule::METHOD
    }

    fn create(&self) -> Arc<dyn AuthModule> {
        Arc::new(BasicAuthModule)
    }
}

/// `Authorization: Bearer` token authentication.
///
/// Tokens are validated against SHA-256 hashes stored in configuration,
/// each mapped to a principal name. Roles come from the realm when it knows
/// the principal.
#[derive(Debug, Clone)]
pub struct BearerTokenModule {
    /// SHA-256 hex token hash -> principal name.
    tokens: Arc<HashMap<String, String>>,
}

impl BearerTokenModule {
    pub const METHOD: &'static str = "BEARER";

    pub fn new(tokens: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            tokens: Arc::new(
                tokens
                    .into_iter()
                    .map(|(hash, name)| (hash.to_ascii_lowercase(), name))
                    .collect(),
            ),
        }
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    /// Hashes a token using SHA-256, returning a lowercase hex string.
    pub fn hash_token(token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Returns the principal name bound to a plaintext token.
    pub fn lookup(&self, token: &str) -> Option<&str> {
        self.tokens
            .get(&Self::hash_token(token))
            .map(String::as_str)
    }

    /// A factory sharing this module's token table.
    pub fn factory(&self) -> Arc<dyn AuthModuleFactory> {
        Arc::new(BearerTokenFactory(self.clone()))
    }
}

#[async_trait]
impl AuthModule for BearerTokenModule {
    fn method(&self) -> &str {
        Self::METHOD
    }

    async fn authenticate(&self, request: &Request, realm: &dyn Realm) -> AuthOutcome {
        let Some(token) = authorization(request, "bearer") else {
            return AuthOutcome::Defer;
        };
        let Some(name) = self.lookup(token) else {
            debug!("unknown bearer token");
            return AuthOutcome::Failure;
        };
        let principal = realm
            .find_principal(name)
            .await
            .unwrap_or_else(|| Principal::new(name, Vec::<String>::new()));
        AuthOutcome::Success(
            principal
                .with_auth_method(Self::METHOD)
                .with_credential(Self::hash_token(token)),
        )
    }

    fn challenge(&self, realm_name: &str) -> Option<String> {
        Some(format!("Bearer realm=\"{}\"", escape_quoted(realm_name)))
    }
}

struct BearerTokenFactory(BearerTokenModule);

impl AuthModuleFactory for BearerTokenFactory {
    fn method(&self) -> &str {
        BearerTokenModule::METHOD
    }

    fn create(&self) -> Arc<dyn AuthModule> {
        Arc::new(self.0.clone())
    }
}

fn escape_quoted(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
