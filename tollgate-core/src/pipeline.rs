//! Valve pipeline.
//!
//! A [`Pipeline`] is an ordered list of [`Valve`]s fixed when it is built.
//! Each valve receives a [`Next`] handle for the rest of the chain and either
//! runs it or writes a response and returns without running it. `Next` is
//! consumed by [`Next::run`], so no valve can run the remainder twice.

use crate::error::{CoreError, PipelineError};
use crate::exchange::Exchange;
use async_trait::async_trait;
use std::sync::Arc;
use tollgate_protocol::Status;
use tracing::{debug, error};

/// Terminal request target.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, exchange: &mut Exchange) -> Result<(), PipelineError>;
}

/// An interceptor in the pipeline.
#[async_trait]
pub trait Valve: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, exchange: &mut Exchange, next: Next<'_>) -> Result<(), PipelineError>;
}

/// The remainder of a pipeline after the current valve.
pub struct Next<'a> {
    valves: &'a [Arc<dyn Valve>],
    handler: &'a dyn Handler,
}

impl<'a> Next<'a> {
    /// Runs the next valve, or the handler when no valves remain.
    pub async fn run(self, exchange: &mut Exchange) -> Result<(), PipelineError> {
        match self.valves.split_first() {
            Some((valve, rest)) => {
                debug!("valve {}", valve.name());
                valve
                    .invoke(
                        exchange,
                        Next {
                            valves: rest,
                            handler: self.handler,
                        },
                    )
                    .await
            }
            None => self.handler.handle(exchange).await,
        }
    }

    /// Number of valves still ahead.
    pub fn remaining(&self) -> usize {
        self.valves.len()
    }
}

/// An ordered, immutable chain of valves.
#[derive(Clone, Default)]
pub struct Pipeline {
    valves: Vec<Arc<dyn Valve>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.valves.iter().map(|v| v.name()))
            .finish()
    }
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.valves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.valves.is_empty()
    }

    pub fn valve_names(&self) -> Vec<&str> {
        self.valves.iter().map(|v| v.name()).collect()
    }

    /// Runs the exchange through every valve and then `handler`.
    ///
    /// An error from a valve or the handler is logged and turned into a
    /// `500` response if nothing has been committed yet.
    pub async fn invoke(&self, exchange: &mut Exchange, handler: &dyn Handler) {
        let next = Next {
            valves: &self.valves,
            handler,
        };
        if let Err(e) = next.run(exchange).await {
            error!("request {} failed: {}", exchange.request.path, e);
            if !exchange.response.is_committed() {
                exchange.response.send_error(Status::INTERNAL_SERVER_ERROR);
            }
        }
    }
}

/// Builds a [`Pipeline`].
#[derive(Default)]
pub struct PipelineBuilder {
    valves: Vec<Arc<dyn Valve>>,
}

impl PipelineBuilder {
    pub fn valve(mut self, valve: impl Valve + 'static) -> Self {
        self.valves.push(Arc::new(valve));
        self
    }

    pub fn shared(mut self, valve: Arc<dyn Valve>) -> Self {
        self.valves.push(valve);
        self
    }

    /// Finishes the chain. The same valve instance may appear only once.
    pub fn build(self) -> Result<Pipeline, CoreError> {
        for (i, valve) in self.valves.iter().enumerate() {
            let ptr = Arc::as_ptr(valve) as *const ();
            if self.valves[..i]
                .iter()
                .any(|v| Arc::as_ptr(v) as *const () == ptr)
            {
                return Err(CoreError::DuplicateValve {
                    name: valve.name().to_string(),
                });
            }
        }
        Ok(Pipeline {
            valves: self.valves,
        })
    }
}

/// A [`Handler`] backed by a synchronous closure.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: Fn(&mut Exchange) -> Result<(), PipelineError> + Send + Sync,
{
    async fn handle(&self, exchange: &mut Exchange) -> Result<(), PipelineError> {
        (self.0)(exchange)
    }
}
