//! Built-in handlers available to configured routes.

use crate::config::{HandlerKind, RouteConfig};
use crate::error::ServerError;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use std::sync::Arc;
use tollgate_core::{Exchange, Handler, PipelineError};
use tollgate_protocol::Status;

/// Answers every request with the same status and body.
#[derive(Debug, Clone)]
pub struct StaticHandler {
    status: Status,
    body: Bytes,
    content_type: String,
}

impl StaticHandler {
    pub fn new(status: Status, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
            content_type: "text/plain; charset=utf-8".into(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }
}

#[async_trait]
impl Handler for StaticHandler {
    async fn handle(&self, exchange: &mut Exchange) -> Result<(), PipelineError> {
        let response = &mut exchange.response;
        response.set_status(self.status);
        response.set_header("Content-Type", self.content_type.as_str());
        response.set_body(&self.body);
        Ok(())
    }
}

/// Describes the request, its mapping and its principal as JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn handle(&self, exchange: &mut Exchange) -> Result<(), PipelineError> {
        let request = &exchange.request;
        let headers: Vec<_> = request
            .headers
            .iter()
            .filter(|(name, _)| !name.eq_ignore_ascii_case("authorization"))
            .map(|(name, value)| json!([name, value]))
            .collect();
        let mapped = &exchange.mapped;
        let body = json!({
            "method": request.method.as_str(),
            "path": request.path,
            "query": request.query,
            "version": request.version.as_str(),
            "scheme": request.scheme(),
            "remote_addr": request.remote_addr.map(|a| a.to_string()),
            "headers": headers,
            "body": String::from_utf8_lossy(&request.body),
            "context_path": mapped.context_path,
            "wrapper_path": mapped.wrapper_path,
            "path_info": mapped.path_info,
            "path_parameters": mapped.path_parameters,
            "principal": exchange.principal().map(|p| json!({
                "name": p.name(),
                "roles": p.roles(),
                "auth_method": p.auth_method(),
            })),
            "session": exchange.session().map(|s| s.id().to_string()),
        });
        let text = serde_json::to_vec_pretty(&body)
            .map_err(|e| PipelineError::handler(format!("cannot encode echo: {}", e)))?;
        exchange
            .response
            .set_header("Content-Type", "application/json");
        exchange.response.set_body(text);
        Ok(())
    }
}

/// Builds the handler a route names.
pub fn from_route(route: &RouteConfig) -> Result<Arc<dyn Handler>, ServerError> {
    match route.handler {
        HandlerKind::Static => {
            let status = Status::from_u16(route.status).ok_or_else(|| {
                crate::config::ConfigError::ValidationError(format!(
                    "route '{}': invalid status {}",
                    route.pattern, route.status
                ))
            })?;
            let mut handler = StaticHandler::new(status, route.body.clone());
            if let Some(ref content_type) = route.content_type {
                handler = handler.with_content_type(content_type.as_str());
            }
            Ok(Arc::new(handler))
        }
        HandlerKind::Echo => Ok(Arc::new(EchoHandler)),
    }
}
