//! Identity and role authorities.

use crate::credential::CredentialHandler;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tollgate_core::Principal;
use tracing::{debug, warn};

/// Validates credentials and answers role queries.
#[async_trait]
pub trait Realm: Send + Sync {
    /// Realm name, used in authentication challenges.
    fn name(&self) -> &str;

    /// Returns the principal for `username` if `password` is valid.
    async fn authenticate(&self, username: &str, password: &str) -> Option<Principal>;

    /// Looks up a principal without checking credentials.
    async fn find_principal(&self, name: &str) -> Option<Principal>;

    fn has_role(&self, principal: &Principal, role: &str) -> bool {
        principal.has_role(role)
    }
}

/// A user entry of a [`MemoryRealm`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub name: String,
    /// Stored credential in any form [`CredentialHandler`] accepts.
    pub credential: String,
    pub roles: Vec<String>,
}

impl User {
    pub fn new<I, S>(name: impl Into<String>, credential: impl Into<String>, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            credential: credential.into(),
            roles: roles.into_iter().map(Into::into).collect(),
        }
    }

    fn principal(&self) -> Principal {
        Principal::new(self.name.clone(), self.roles.iter().cloned())
    }
}

/// A realm holding its users in memory.
///
/// Lookups read an immutable snapshot; updates swap in a new one.
pub struct MemoryRealm {
    name: String,
    handler: CredentialHandler,
    users: RwLock<Arc<HashMap<String, User>>>,
}

impl MemoryRealm {
    pub fn new(name: impl Into<String>, handler: CredentialHandler) -> Self {
        Self {
            name: name.into(),
            handler,
            users: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    pub fn with_users(self, users: impl IntoIterator<Item = User>) -> Self {
        self.replace_users(users);
        self
    }

    fn snapshot(&self) -> Arc<HashMap<String, User>> {
        Arc::clone(&self.users.read())
    }

    pub fn add_user(&self, user: User) {
        let mut guard = self.users.write();
        let mut next = HashMap::clone(&guard);
        next.insert(user.name.clone(), user);
        *guard = Arc::new(next);
    }

    pub fn remove_user(&self, name: &str) -> bool {
        let mut guard = self.users.write();
        if !guard.contains_key(name) {
            return false;
        }
        let mut next = HashMap::clone(&guard);
        next.remove(name);
        *guard = Arc::new(next);
        true
    }

    /// Replaces every user at once.
    pub fn replace_users(&self, users: impl IntoIterator<Item = User>) {
        let next: HashMap<_, _> = users.into_iter().map(|u| (u.name.clone(), u)).collect();
        *self.users.write() = Arc::new(next);
    }

    pub fn user_count(&self) -> usize {
        self.snapshot().len()
    }

    pub fn credential_handler(&self) -> &CredentialHandler {
        &self.handler
    }
}

#[async_trait]
impl Realm for MemoryRealm {
    fn name(&self) -> &str {
        &self.name
    }

    async fn authenticate(&self, username: &str, password: &str) -> Option<Principal> {
        let users = self.snapshot();
        let user = users.get(username)?;
        if self.handler.validate(&user.credential, password) {
            Some(user.principal())
        } else {
            debug!("realm {}: bad credentials for {}", self.name, username);
            None
        }
    }

    async fn find_principal(&self, name: &str) -> Option<Principal> {
        self.snapshot().get(name).map(User::principal)
    }
}

#[derive(Debug, Clone, Copy)]
struct Failures {
    count: u32,
    last: Instant,
}

/// Wraps a realm and locks users out after repeated failures.
///
/// After `failure_count` consecutive failures a user is rejected without
/// consulting the inner realm until `lockout` has elapsed since the last
/// failure. A successful login clears the record.
///
/// At most `cache_size` failure records are kept. Records older than the
/// lockout are dropped first, then the oldest remaining record.
pub struct LockOutRealm {
    inner: Arc<dyn Realm>,
    failure_count: u32,
    lockout: Duration,
    cache_size: usize,
    failures: DashMap<String, Failures>,
}

impl LockOutRealm {
    pub const DEFAULT_FAILURE_COUNT: u32 = 5;
    pub const DEFAULT_LOCKOUT: Duration = Duration::from_secs(300);
    pub const DEFAULT_CACHE_SIZE: usize = 1000;

    pub fn new(inner: Arc<dyn Realm>) -> Self {
        Self {
            inner,
            failure_count: Self::DEFAULT_FAILURE_COUNT,
            lockout: Self::DEFAULT_LOCKOUT,
            cache_size: Self::DEFAULT_CACHE_SIZE,
            failures: DashMap::new(),
        }
    }

    pub fn with_policy(mut self, failure_count: u32, lockout: Duration) -> Self {
        self.failure_count = failure_count.max(1);
        self.lockout = lockout;
        self
    }

    /// Caps the number of users with a failure record.
    pub fn with_cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size.max(1);
        self
    }

    /// Number of users with a failure record.
    pub fn record_count(&self) -> usize {
        self.failures.len()
    }

    pub fn is_locked(&self, username: &str) -> bool {
        self.failures.get(username).is_some_and(|f| {
            f.count >= self.failure_count && f.last.elapsed() < self.lockout
        })
    }

    /// Clears the failure record of a user.
    pub fn unlock(&self, username: &str) {
        self.failures.remove(username);
    }

    /// Makes room for one more record.
    fn evict(&self) {
        self.failures.retain(|_, f| f.last.elapsed() < self.lockout);
        if self.failures.len() < self.cache_size {
            return;
        }
        let oldest = self
            .failures
            .iter()
            .min_by_key(|entry| entry.value().last)
            .map(|entry| (entry.key().clone(), entry.value().last));
        if let Some((username, last)) = oldest {
            self.failures.remove(&username);
            warn!(
                "evicted failure record of {} {:?} after its last failure, before the {:?} lockout ran out; the cache size {} may be too small",
                username,
                last.elapsed(),
                self.lockout,
                self.cache_size
            );
        }
    }

    fn register_failure(&self, username: &str) {
        if !self.failures.contains_key(username) && self.failures.len() >= self.cache_size {
            self.evict();
        }
        let mut entry = self.failures.entry(username.to_string()).or_insert(Failures {
            count: 0,
            last: Instant::now(),
        });
        // A lockout that has run out starts a fresh count.
        if entry.count >= self.failure_count && entry.last.elapsed() >= self.lockout {
            entry.count = 0;
        }
        entry.count += 1;
        entry.last = Instant::now();
        if entry.count == self.failure_count {
            warn!(
                "user {} locked out after {} failed attempts",
                username, entry.count
            );
        }
    }
}

#[async_trait]
impl Realm for LockOutRealm {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn authenticate(&self, username: &str, password: &str) -> Option<Principal> {
        if self.is_locked(username) {
            warn!("rejected login for locked user {}", username);
            // Still counts, so repeated attempts extend the lockout.
            self.register_failure(username);
            return None;
        }
        match self.inner.authenticate(username, password).await {
            Some(principal) => {
                self.failures.remove(username);
                Some(principal)
            }
            None => {
                self.register_failure(username);
                None
            }
        }
    }

    async fn find_principal(&self, name: &str) -> Option<Principal> {
        self.inner.find_principal(name).await
    }

    fn has_role(&self, principal: &Principal, role: &str) -> bool {
        self.inner.has_role(principal, role)
    }
}
