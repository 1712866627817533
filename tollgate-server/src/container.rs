//! Request container.
//!
//! The container owns the mapper, the deployed contexts and the session
//! manager. It is the [`Service`] every connector hands its requests to:
//! resolve the target, bind the session, run the context pipeline, and
//! announce new or renewed session ids in a `Set-Cookie` header.

use crate::connection::Service;
use crate::error::ServerError;
use crate::metrics::Metrics;
use async_trait::async_trait;
use std::sync::Arc;
use tollgate_core::session::SESSION_PATH_PARAMETER;
use tollgate_core::{Exchange, Handler, Mapper, MappingData, Pipeline, SessionManager};
use tollgate_protocol::{Response, Status};

/// A deployed application: its path and its valve pipeline.
pub struct Context {
    path: String,
    pipeline: Pipeline,
}

impl Context {
    pub fn new(path: impl Into<String>, pipeline: Pipeline) -> Self {
        Self {
            path: path.into(),
            pipeline,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("path", &self.path)
            .field("valves", &self.pipeline.valve_names())
            .finish()
    }
}

pub type ContainerMapper = Mapper<Arc<Context>, Arc<dyn Handler>>;

pub struct Container {
    mapper: ContainerMapper,
    sessions: Arc<SessionManager>,
    metrics: Option<Arc<Metrics>>,
}

impl Container {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self {
            mapper: Mapper::new(),
            sessions,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Option<Arc<Metrics>>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Registration interface for hosts, contexts and wrappers.
    pub fn mapper(&self) -> &ContainerMapper {
        &self.mapper
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn add_host(&self, name: &str, aliases: &[String]) -> Result<(), ServerError> {
        self.mapper.add_host(name)?;
        for alias in aliases {
            self.mapper.add_host_alias(name, alias)?;
        }
        Ok(())
    }

    pub fn add_context(&self, host: &str, path: &str, pipeline: Pipeline) -> Result<(), ServerError> {
        let context = Arc::new(Context::new(path, pipeline));
        tracing::info!("deployed context {}{} {:?}", host, path, context.pipeline.valve_names());
        self.mapper.add_context(host, path, context)?;
        Ok(())
    }

    pub fn add_wrapper(
        &self,
        host: &str,
        context_path: &str,
        pattern: &str,
        handler: Arc<dyn Handler>,
    ) -> Result<(), ServerError> {
        self.mapper.add_wrapper(host, context_path, pattern, handler)?;
        Ok(())
    }

    /// Binds the session named by the cookie or the `;sessionid=` path
    /// parameter, if it is still alive.
    fn bind_session(&self, exchange: &mut Exchange) {
        let id = exchange
            .request
            .cookie(self.sessions.cookie_name())
            .or_else(|| exchange.mapped.path_parameter(SESSION_PATH_PARAMETER))
            .map(str::to_string);
        let Some(id) = id else {
            return;
        };
        match self.sessions.find(&id) {
            Some(session) => {
                self.sessions.touch(&id);
                exchange.set_session(session);
            }
            None => tracing::debug!("unknown or expired session {}", id),
        }
    }

    fn set_session_cookie(&self, exchange: &mut Exchange) {
        let Some(id) = exchange.session().map(|s| s.id().to_string()) else {
            return;
        };
        let path = if exchange.mapped.context_path.is_empty() {
            "/"
        } else {
            exchange.mapped.context_path.as_str()
        };
        let mut cookie = format!("{}={}; Path={}; HttpOnly", self.sessions.cookie_name(), id, path);
        if exchange.is_secure() {
            cookie.push_str("; Secure");
        }
        exchange.response.append_header("Set-Cookie", cookie);
        if let Some(ref metrics) = self.metrics {
            metrics.sessions_active.set(self.sessions.len() as f64);
        }
    }
}

#[async_trait]
impl Service for Container {
    async fn call(&self, exchange: Exchange) -> Response {
        let mut exchange = exchange.with_sessions(Arc::clone(&self.sessions));
        let host = exchange.request.host();
        let MappingData {
            context,
            wrapper,
            path,
            redirect_to,
            ..
        } = self.mapper.resolve(host.as_deref(), &exchange.request.path);

        if let Some(mut location) = redirect_to {
            if let Some(ref query) = exchange.request.query {
                location.push('?');
                location.push_str(query);
            }
            let mut response = Response::with_status(Status::FOUND);
            response.set_header("Location", location);
            return response;
        }

        let (Some(context), Some(wrapper)) = (context, wrapper) else {
            tracing::debug!("no target for {:?} {}", host, exchange.request.path);
            let mut response = Response::new();
            response.send_error(Status::NOT_FOUND);
            return response;
        };

        exchange.mapped = path;
        self.bind_session(&mut exchange);
        context.pipeline.invoke(&mut exchange, wrapper.as_ref()).await;
        if exchange.session_created() || exchange.session_renewed() {
            self.set_session_cookie(&mut exchange);
        }
        exchange.response
    }
}
