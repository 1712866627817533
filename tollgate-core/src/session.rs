//! Server-side sessions.

use crate::principal::Principal;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// Default session cookie name.
pub const DEFAULT_COOKIE_NAME: &str = "SESSIONID";

/// Path parameter carrying the session id when cookies are unavailable.
pub const SESSION_PATH_PARAMETER: &str = "sessionid";

/// Session manager settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub cookie_name: String,
    /// Idle time after which a session expires.
    pub max_inactive: Duration,
    /// How often the reaper scans for expired sessions.
    pub reaper_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: DEFAULT_COOKIE_NAME.to_string(),
            max_inactive: Duration::from_secs(30 * 60),
            reaper_interval: Duration::from_secs(60),
        }
    }
}

/// A server-side session.
#[derive(Debug)]
pub struct Session {
    id: String,
    created_at: Instant,
    last_access: Mutex<Instant>,
    max_inactive: Duration,
    valid: AtomicBool,
    attributes: RwLock<HashMap<String, Value>>,
    principal: RwLock<Option<Arc<Principal>>>,
}

impl Session {
    fn new(id: String, max_inactive: Duration) -> Self {
        let now = Instant::now();
        Self {
            id,
            created_at: now,
            last_access: Mutex::new(now),
            max_inactive,
            valid: AtomicBool::new(true),
            attributes: RwLock::new(HashMap::new()),
            principal: RwLock::new(None),
        }
    }

    /// A copy of `previous` under a new id.
    fn renewed(id: String, previous: &Session) -> Self {
        Self {
            id,
            created_at: previous.created_at,
            last_access: Mutex::new(Instant::now()),
            max_inactive: previous.max_inactive,
            valid: AtomicBool::new(true),
            attributes: RwLock::new(previous.attributes.read().clone()),
            principal: RwLock::new(previous.principal()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_accessed(&self) -> Instant {
        *self.last_access.lock()
    }

    pub fn max_inactive(&self) -> Duration {
        self.max_inactive
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Returns whether the session has been idle longer than its
    /// max-inactive interval at `now`.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_accessed()) > self.max_inactive
    }

    pub fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }

    pub fn attribute(&self, name: &str) -> Option<Value> {
        self.attributes.read().get(name).cloned()
    }

    pub fn set_attribute(&self, name: impl Into<String>, value: Value) {
        self.attributes.write().insert(name.into(), value);
    }

    pub fn remove_attribute(&self, name: &str) -> Option<Value> {
        self.attributes.write().remove(name)
    }

    pub fn attribute_names(&self) -> Vec<String> {
        self.attributes.read().keys().cloned().collect()
    }

    /// Principal cached for single sign-on reuse.
    pub fn principal(&self) -> Option<Arc<Principal>> {
        self.principal.read().clone()
    }

    pub fn set_principal(&self, principal: Option<Arc<Principal>>) {
        *self.principal.write() = principal;
    }

    fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
        self.attributes.write().clear();
        *self.principal.write() = None;
    }
}

/// Owns every live session of the process.
#[derive(Debug)]
pub struct SessionManager {
    config: SessionConfig,
    sessions: DashMap<String, Arc<Session>>,
    created: AtomicU64,
    expired: AtomicU64,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
            created: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn cookie_name(&self) -> &str {
        &self.config.cookie_name
    }

    /// Creates a session with a fresh, unguessable id.
    pub fn create(&self) -> Arc<Session> {
        let session = self.insert_with(|id| Session::new(id, self.config.max_inactive));
        self.created.fetch_add(1, Ordering::Relaxed);
        debug!("created session {}", session.id());
        session
    }

    /// Moves the session `old` to a fresh id, keeping its attributes and
    /// cached principal. The old id no longer resolves and the old handle
    /// is invalidated. Returns `None` when `old` is unknown.
    pub fn change_session_id(&self, old: &str) -> Option<Arc<Session>> {
        let (_, previous) = self.sessions.remove(old)?;
        let renewed = self.insert_with(|id| Session::renewed(id, &previous));
        previous.invalidate();
        debug!("changed session id {} to {}", old, renewed.id());
        Some(renewed)
    }

    fn insert_with(&self, build: impl Fn(String) -> Session) -> Arc<Session> {
        loop {
            let id = Uuid::new_v4().simple().to_string();
            if let dashmap::mapref::entry::Entry::Vacant(entry) = self.sessions.entry(id.clone())
            {
                let session = Arc::new(build(id));
                entry.insert(Arc::clone(&session));
                return session;
            }
        }
    }

    /// Looks up a live session. Expired sessions are removed and reported
    /// as absent.
    pub fn find(&self, id: &str) -> Option<Arc<Session>> {
        let session = self.sessions.get(id).map(|s| Arc::clone(s.value()))?;
        if session.is_expired_at(Instant::now()) {
            self.expire(id);
            return None;
        }
        Some(session)
    }

    /// Invalidates and removes a session. Returns whether it existed.
    pub fn invalidate(&self, id: &str) -> bool {
        match self.sessions.remove(id) {
            Some((_, session)) => {
                session.invalidate();
                debug!("invalidated session {}", id);
                true
            }
            None => false,
        }
    }

    /// Refreshes a session's last-access time. Returns whether it exists.
    pub fn touch(&self, id: &str) -> bool {
        match self.find(id) {
            Some(session) => {
                session.touch();
                true
            }
            None => false,
        }
    }

    /// Removes every session idle past its interval. Returns how many.
    pub fn expire_idle(&self) -> usize {
        self.expire_idle_at(Instant::now())
    }

    pub fn expire_idle_at(&self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_expired_at(now))
            .map(|entry| entry.key().clone())
            .collect();
        for id in &expired {
            self.expire(id);
        }
        expired.len()
    }

    fn expire(&self, id: &str) {
        if let Some((_, session)) = self.sessions.remove(id) {
            session.invalidate();
            self.expired.fetch_add(1, Ordering::Relaxed);
            debug!("expired session {}", id);
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Total sessions created since startup.
    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// Total sessions expired since startup.
    pub fn expired_count(&self) -> u64 {
        self.expired.load(Ordering::Relaxed)
    }

    /// Spawns the periodic reaper. It stops when `shutdown` fires.
    pub fn spawn_reaper(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let period = self.config.reaper_interval.max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = self.expire_idle();
                        if removed > 0 {
                            info!("session reaper expired {} sessions", removed);
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("session reaper stopped");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(max_inactive: Duration) -> SessionManager {
        SessionManager::new(SessionConfig {
            max_inactive,
            ..Default::default()
        })
    }

    #[test]
    fn test_create_find_invalidate() {
        let sessions = manager(Duration::from_secs(60));
        let session = sessions.create();
        assert_eq!(session.id().len(), 32);

        let found = sessions.find(session.id()).unwrap();
        assert!(Arc::ptr_eq(&found, &session));

        session.set_attribute("cart", Value::from(3));
        assert_eq!(found.attribute("cart"), Some(Value::from(3)));

        assert!(sessions.invalidate(session.id()));
        assert!(!session.is_valid());
        assert!(session.attribute("cart").is_none());
        assert!(sessions.find(session.id()).is_none());
        assert!(!sessions.invalidate(session.id()));
    }

    #[test]
    fn test_session_ids_unique() {
        let sessions = manager(Duration::from_secs(60));
        let ids: std::collections::HashSet<_> =
            (0..1000).map(|_| sessions.create().id().to_string()).collect();
        assert_eq!(ids.len(), 1000);
        assert_eq!(sessions.created_count(), 1000);
    }

    #[test]
    fn test_expire_idle() {
        let sessions = manager(Duration::from_secs(10));
        let stale = sessions.create();
        let fresh = sessions.create();

        let later = Instant::now() + Duration::from_secs(11);
        fresh.touch();
        assert_eq!(sessions.expire_idle_at(Instant::now()), 0);
        assert_eq!(sessions.expire_idle_at(later), 2);
        assert!(!stale.is_valid());
        assert_eq!(sessions.expired_count(), 2);
        assert!(sessions.is_empty());
    }

    #[test]
    fn test_find_drops_expired() {
        let sessions = manager(Duration::ZERO);
        let session = sessions.create();
        std::thread::sleep(Duration::from_millis(5));
        assert!(sessions.find(session.id()).is_none());
        assert!(!sessions.touch(session.id()));
        assert_eq!(sessions.len(), 0);
    }

    #[test]
    fn test_cached_principal() {
        let sessions = manager(Duration::from_secs(60));
        let session = sessions.create();
        assert!(session.principal().is_none());
        session.set_principal(Some(Arc::new(Principal::new("alice", ["admin"]))));
        assert_eq!(session.principal().unwrap().name(), "alice");
    }

    #[test]
    fn test_change_session_id() {
        let sessions = manager(Duration::from_secs(60));
        let session = sessions.create();
        session.set_attribute("cart", Value::from(3));
        session.set_principal(Some(Arc::new(Principal::new("alice", ["admin"]))));
        let old = session.id().to_string();

        let renewed = sessions.change_session_id(&old).unwrap();
        assert_ne!(renewed.id(), old);
        assert_eq!(renewed.attribute("cart"), Some(Value::from(3)));
        assert_eq!(renewed.principal().unwrap().name(), "alice");
        assert!(!session.is_valid());
        assert!(session.principal().is_none());

        assert!(sessions.find(&old).is_none());
        assert!(Arc::ptr_eq(&sessions.find(renewed.id()).unwrap(), &renewed));
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions.created_count(), 1);
        assert!(sessions.change_session_id(&old).is_none());
    }

    #[tokio::test]
    async fn test_reaper_expires_and_stops() {
        let sessions = Arc::new(SessionManager::new(SessionConfig {
            max_inactive: Duration::ZERO,
            reaper_interval: Duration::from_millis(20),
            ..Default::default()
        }));
        sessions.create();

        let (tx, rx) = broadcast::channel(1);
        let handle = Arc::clone(&sessions).spawn_reaper(rx);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sessions.is_empty());

        tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
