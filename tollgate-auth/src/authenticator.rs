//! The authenticator valve.

use crate::constraint::{ConstraintSet, ResolvedConstraint, TransportGuarantee};
use crate::module::{AuthModule, AuthOutcome};
use crate::realm::Realm;
use async_trait::async_trait;
use std::sync::Arc;
use tollgate_core::{Exchange, Next, PipelineError, Principal, Valve};
use tollgate_protocol::Status;
use tracing::debug;

/// Security decisions reported to an observer (metrics).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEvent {
    /// A module authenticated the request.
    Authenticated,
    /// A principal cached in the session was reused.
    Reused,
    /// Authentication failed and a challenge was sent.
    Challenged,
    /// The principal lacked every required role.
    Forbidden,
    /// A plain request was redirected to the secure port.
    Redirected,
    /// A plain request needed confidentiality and no redirect was possible.
    Insecure,
}

impl AuthEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthEvent::Authenticated => "authenticated",
            AuthEvent::Reused => "reused",
            AuthEvent::Challenged => "challenged",
            AuthEvent::Forbidden => "forbidden",
            AuthEvent::Redirected => "redirected",
            AuthEvent::Insecure => "insecure",
        }
    }
}

type Observer = Arc<dyn Fn(AuthEvent) + Send + Sync>;

/// Enforces security constraints before the target handler runs.
pub struct Authenticator {
    realm: Arc<dyn Realm>,
    modules: Vec<Arc<dyn AuthModule>>,
    constraints: ConstraintSet,
    cache: bool,
    observer: Option<Observer>,
}

impl Authenticator {
    /// `modules` are consulted in order; the first success or failure wins.
    pub fn new(
        realm: Arc<dyn Realm>,
        modules: Vec<Arc<dyn AuthModule>>,
        constraints: ConstraintSet,
    ) -> Self {
        Self {
            realm,
            modules,
            constraints,
            cache: true,
            observer: None,
        }
    }

    /// Whether authenticated principals are cached in the session.
    pub fn with_cache(mut self, cache: bool) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_observer(mut self, observer: impl Fn(AuthEvent) + Send + Sync + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    pub fn realm(&self) -> &Arc<dyn Realm> {
        &self.realm
    }

    fn emit(&self, event: AuthEvent) {
        if let Some(observer) = &self.observer {
            observer(event);
        }
    }

    fn permits(&self, principal: &Principal, constraint: &ResolvedConstraint) -> bool {
        !constraint.requires_roles()
            || constraint
                .roles
                .iter()
                .any(|role| self.realm.has_role(principal, role))
    }

    /// Redirects a plain request to the secure port, or refuses it.
    fn require_confidential(&self, exchange: &mut Exchange) {
        let request = &exchange.request;
        let target = match (exchange.redirect_port, request.host()) {
            (Some(port), Some(host)) => {
                let host = if host.contains(':') {
                    format!("[{}]", host)
                } else {
                    host
                };
                let authority = if port == 443 {
                    host
                } else {
                    format!("{}:{}", host, port)
                };
                let mut location = format!("https://{}{}", authority, request.path);
                if let Some(query) = &request.query {
                    location.push('?');
                    location.push_str(query);
                }
                Some(location)
            }
            _ => None,
        };

        match target {
            Some(location) => {
                debug!("redirecting {} to {}", exchange.request.path, location);
                exchange.response.reset();
                exchange.response.set_status(Status::FOUND);
                exchange.response.set_header("Location", location);
                self.emit(AuthEvent::Redirected);
            }
            None => {
                exchange.response.send_error(Status::FORBIDDEN);
                self.emit(AuthEvent::Insecure);
            }
        }
    }

    fn challenge(&self, exchange: &mut Exchange) {
        exchange.response.send_error(Status::UNAUTHORIZED);
        for module in &self.modules {
            if let Some(value) = module.challenge(self.realm.name()) {
                exchange.response.append_header("WWW-Authenticate", value);
            }
        }
        self.emit(AuthEvent::Challenged);
    }

    /// Runs the module chain.
    async fn authenticate(&self, exchange: &Exchange) -> Option<Principal> {
        for module in &self.modules {
            match module.authenticate(&exchange.request, self.realm.as_ref()).await {
                AuthOutcome::Success(principal) => {
                    debug!("{} authenticated {}", module.method(), principal.name());
                    return Some(principal);
                }
                AuthOutcome::Failure => {
                    debug!("{} rejected credentials", module.method());
                    return None;
                }
                AuthOutcome::Defer => continue,
            }
        }
        None
    }

    /// A principal from this request or its session that satisfies
    /// `constraint`.
    fn reusable(&self, exchange: &Exchange, constraint: &ResolvedConstraint) -> Option<Arc<Principal>> {
        let principal = match exchange.principal() {
            Some(p) => Arc::clone(p),
            None if self.cache => exchange.session()?.principal()?,
            None => return None,
        };
        self.permits(&principal, constraint).then_some(principal)
    }
}

#[async_trait]
impl Valve for Authenticator {
    fn name(&self) -> &str {
        "authenticator"
    }

    async fn invoke(&self, exchange: &mut Exchange, next: Next<'_>) -> Result<(), PipelineError> {
        let path = exchange.relative_path();
        let Some(constraint) = self.constraints.find(&path, exchange.request.method) else {
            return next.run(exchange).await;
        };

        if constraint.transport == TransportGuarantee::Confidential && !exchange.is_secure() {
            self.require_confidential(exchange);
            return Ok(());
        }

        if !constraint.authenticate {
            return next.run(exchange).await;
        }

        if let Some(principal) = self.reusable(exchange, &constraint) {
            debug!("reusing principal {} for {}", principal.name(), path);
            exchange.set_principal(principal);
            self.emit(AuthEvent::Reused);
            return next.run(exchange).await;
        }

        let Some(principal) = self.authenticate(exchange).await else {
            self.challenge(exchange);
            return Ok(());
        };
        let principal = Arc::new(principal);
        exchange.set_principal(Arc::clone(&principal));
        if self.cache {
            // A session that existed before the login gets a new id.
            let session = match exchange.change_session_id() {
                Some(session) => Some(session),
                None => exchange.session_or_create(),
            };
            if let Some(session) = session {
                session.set_principal(Some(Arc::clone(&principal)));
            }
        }
        self.emit(AuthEvent::Authenticated);

        if !self.permits(&principal, &constraint) {
            debug!("{} lacks roles {:?} for {}", principal.name(), constraint.roles, path);
            exchange.response.send_error(Status::FORBIDDEN);
            self.emit(AuthEvent::Forbidden);
            return Ok(());
        }

        next.run(exchange).await
    }
}
