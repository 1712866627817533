//! Per-request state carried through the pipeline.

use crate::mapper::MappedPath;
use crate::principal::Principal;
use crate::session::{Session, SessionManager};
use std::sync::Arc;
use tollgate_protocol::{Request, Response};

/// One request/response pair on its way through the valves.
#[derive(Debug)]
pub struct Exchange {
    pub request: Request,
    pub response: Response,
    /// Resolved paths, filled in by the container before the pipeline runs.
    pub mapped: MappedPath,
    /// Port to redirect plain requests to when a confidential transport is
    /// required.
    pub redirect_port: Option<u16>,
    principal: Option<Arc<Principal>>,
    session: Option<Arc<Session>>,
    session_created: bool,
    session_renewed: bool,
    sessions: Option<Arc<SessionManager>>,
}

impl Exchange {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            response: Response::new(),
            mapped: MappedPath::default(),
            redirect_port: None,
            principal: None,
            session: None,
            session_created: false,
            session_renewed: false,
            sessions: None,
        }
    }

    /// Attaches the session manager used by [`session_or_create`](Self::session_or_create).
    pub fn with_sessions(mut self, sessions: Arc<SessionManager>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn is_secure(&self) -> bool {
        self.request.secure
    }

    pub fn principal(&self) -> Option<&Arc<Principal>> {
        self.principal.as_ref()
    }

    pub fn set_principal(&mut self, principal: Arc<Principal>) {
        self.principal = Some(principal);
    }

    /// The session bound to this request, if it is still valid.
    pub fn session(&self) -> Option<&Arc<Session>> {
        self.session.as_ref().filter(|s| s.is_valid())
    }

    /// Binds an existing session (looked up from the request's session id).
    pub fn set_session(&mut self, session: Arc<Session>) {
        self.session = Some(session);
    }

    /// Returns the bound session, creating one if none is bound. Returns
    /// `None` when no session manager is attached.
    pub fn session_or_create(&mut self) -> Option<Arc<Session>> {
        if let Some(session) = self.session() {
            return Some(Arc::clone(session));
        }
        let session = self.sessions.as_ref()?.create();
        self.session = Some(Arc::clone(&session));
        self.session_created = true;
        Some(session)
    }

    /// Whether a session was created while handling this request.
    pub fn session_created(&self) -> bool {
        self.session_created
    }

    /// Moves the bound session to a fresh id. A session created during this
    /// request is returned as is. Returns `None` when no live session is
    /// bound or no session manager is attached.
    pub fn change_session_id(&mut self) -> Option<Arc<Session>> {
        let current = Arc::clone(self.session()?);
        if self.session_created {
            return Some(current);
        }
        let renewed = self.sessions.as_ref()?.change_session_id(current.id())?;
        self.session = Some(Arc::clone(&renewed));
        self.session_renewed = true;
        Some(renewed)
    }

    /// Whether the bound session's id changed while handling this request.
    pub fn session_renewed(&self) -> bool {
        self.session_renewed
    }

    /// Context-relative path used for security constraint matching.
    pub fn relative_path(&self) -> String {
        if self.mapped.match_kind.is_none() && self.mapped.context_path.is_empty() {
            return self.request.path.clone();
        }
        self.mapped.relative_path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::MatchKind;
    use crate::session::SessionConfig;
    use tollgate_protocol::Method;

    #[test]
    fn test_session_or_create() {
        let sessions = Arc::new(SessionManager::new(SessionConfig::default()));
        let mut exchange =
            Exchange::new(Request::new(Method::Get, "/")).with_sessions(Arc::clone(&sessions));
        assert!(exchange.session().is_none());

        let created = exchange.session_or_create().unwrap();
        assert!(exchange.session_created());
        let again = exchange.session_or_create().unwrap();
        assert!(Arc::ptr_eq(&created, &again));
        assert_eq!(sessions.len(), 1);
    }

    #[test]
    fn test_no_session_manager() {
        let mut exchange = Exchange::new(Request::new(Method::Get, "/"));
        assert!(exchange.session_or_create().is_none());
        assert!(!exchange.session_created());
    }

    #[test]
    fn test_invalidated_session_not_returned() {
        let sessions = Arc::new(SessionManager::new(SessionConfig::default()));
        let session = sessions.create();
        let mut exchange = Exchange::new(Request::new(Method::Get, "/"));
        exchange.set_session(Arc::clone(&session));
        sessions.invalidate(session.id());
        assert!(exchange.session().is_none());
    }

    #[test]
    fn test_change_session_id() {
        let sessions = Arc::new(SessionManager::new(SessionConfig::default()));
        let planted = sessions.create();
        let mut exchange =
            Exchange::new(Request::new(Method::Get, "/")).with_sessions(Arc::clone(&sessions));
        exchange.set_session(Arc::clone(&planted));

        let renewed = exchange.change_session_id().unwrap();
        assert_ne!(renewed.id(), planted.id());
        assert!(exchange.session_renewed());
        assert!(!exchange.session_created());
        assert!(Arc::ptr_eq(exchange.session().unwrap(), &renewed));
        assert!(sessions.find(planted.id()).is_none());
    }

    #[test]
    fn test_change_session_id_keeps_new_session() {
        let sessions = Arc::new(SessionManager::new(SessionConfig::default()));
        let mut exchange =
            Exchange::new(Request::new(Method::Get, "/")).with_sessions(Arc::clone(&sessions));
        assert!(exchange.change_session_id().is_none());

        let created = exchange.session_or_create().unwrap();
        let same = exchange.change_session_id().unwrap();
        assert!(Arc::ptr_eq(&created, &same));
        assert!(!exchange.session_renewed());
    }

    #[test]
    fn test_relative_path() {
        let mut exchange = Exchange::new(Request::new(Method::Get, "/shop/cart/items"));
        assert_eq!(exchange.relative_path(), "/shop/cart/items");

        exchange.mapped = MappedPath {
            context_path: "/shop".into(),
            wrapper_path: "/cart".into(),
            path_info: Some("/items".into()),
            match_kind: Some(MatchKind::Prefix),
            path_parameters: Vec::new(),
        };
        assert_eq!(exchange.relative_path(), "/cart/items");
    }
}
