//! Per-endpoint processor recycling.
//!
//! Connections lease a [`Processor`] for their lifetime. When the lease is
//! dropped the processor is recycled and pushed back onto a bounded LIFO
//! stack; over the limit it is simply dropped.

use crate::metrics::Metrics;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tollgate_core::Stack;
use tollgate_protocol::{Processor, ProcessorFactory};

/// Hit/miss counters of a [`ProcessorPool`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    pub idle: usize,
}

/// A bounded pool of recycled processors for one protocol.
pub struct ProcessorPool {
    stack: Stack<Box<dyn Processor>>,
    factory: Arc<dyn ProcessorFactory>,
    hits: AtomicU64,
    misses: AtomicU64,
    metrics: Option<Arc<Metrics>>,
}

impl ProcessorPool {
    pub fn new(
        factory: Arc<dyn ProcessorFactory>,
        size: usize,
        limit: Option<usize>,
    ) -> Result<Self, tollgate_core::CoreError> {
        Ok(Self {
            stack: Stack::new(size, limit)?,
            factory,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn factory(&self) -> &Arc<dyn ProcessorFactory> {
        &self.factory
    }

    /// Takes an idle processor, creating one when the pool is empty.
    pub fn lease(self: &Arc<Self>) -> Lease {
        let processor = match self.stack.pop() {
            Some(processor) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                if let Some(ref metrics) = self.metrics {
                    metrics.pool_hits_total.inc();
                }
                processor
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                if let Some(ref metrics) = self.metrics {
                    metrics.pool_misses_total.inc();
                }
                self.factory.create()
            }
        };
        Lease {
            processor: Some(processor),
            pool: Some(Arc::clone(self)),
        }
    }

    /// A fresh processor that is discarded instead of pooled.
    pub fn transient(&self) -> Lease {
        Lease::unpooled(self.factory.create())
    }

    fn release(&self, mut processor: Box<dyn Processor>) {
        processor.recycle();
        if self.stack.push(processor).is_err() {
            tracing::trace!("{} processor pool full, dropping processor", self.factory.protocol());
        }
    }

    /// Drops every idle processor.
    pub fn clear(&self) {
        self.stack.clear();
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            idle: self.stack.len(),
        }
    }
}

impl std::fmt::Debug for ProcessorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorPool")
            .field("protocol", &self.factory.protocol())
            .field("stats", &self.stats())
            .finish()
    }
}

/// A processor on loan to one connection.
pub struct Lease {
    processor: Option<Box<dyn Processor>>,
    pool: Option<Arc<ProcessorPool>>,
}

impl Lease {
    /// Wraps a processor that is never returned to a pool.
    pub fn unpooled(processor: Box<dyn Processor>) -> Self {
        Self {
            processor: Some(processor),
            pool: None,
        }
    }

    pub fn is_pooled(&self) -> bool {
        self.pool.is_some()
    }

    /// Swaps in the processor of an upgraded protocol. The previous one goes
    /// back to its pool; the replacement is discarded when the lease ends.
    pub fn replace(&mut self, processor: Box<dyn Processor>) {
        let old = self.processor.replace(processor);
        if let (Some(old), Some(pool)) = (old, self.pool.take()) {
            pool.release(old);
        }
    }
}

impl Deref for Lease {
    type Target = dyn Processor;

    fn deref(&self) -> &Self::Target {
        match self.processor {
            Some(ref processor) => processor.as_ref(),
            None => unreachable!("lease emptied before drop"),
        }
    }
}

impl DerefMut for Lease {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self.processor {
            Some(ref mut processor) => processor.as_mut(),
            None => unreachable!("lease emptied before drop"),
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let (Some(processor), Some(pool)) = (self.processor.take(), self.pool.take()) {
            pool.release(processor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use tollgate_protocol::{Consumed, Http1ProcessorFactory, RelayProcessorFactory};

    fn http_pool(limit: Option<usize>) -> Arc<ProcessorPool> {
        Arc::new(ProcessorPool::new(Arc::new(Http1ProcessorFactory::default()), 4, limit).unwrap())
    }

    #[test]
    fn test_lease_reuses_returned_processor() {
        let pool = http_pool(Some(8));
        let lease = pool.lease();
        assert!(lease.is_pooled());
        drop(lease);
        assert_eq!(pool.stats(), PoolStats { hits: 0, misses: 1, idle: 1 });

        let _lease = pool.lease();
        assert_eq!(pool.stats(), PoolStats { hits: 1, misses: 1, idle: 0 });
    }

    #[test]
    fn test_pool_limit_drops_excess() {
        let pool = http_pool(Some(1));
        let a = pool.lease();
        let b = pool.lease();
        drop(a);
        drop(b);
        assert_eq!(pool.stats().idle, 1);
    }

    #[test]
    fn test_returned_processor_is_recycled() {
        let pool = http_pool(None);
        {
            let mut lease = pool.lease();
            // Leave a half-read request in the processor.
            let mut buf = BytesMut::from(&b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 10\r\n\r\nabc"[..]);
            assert!(matches!(lease.consume(&mut buf).unwrap(), Consumed::NeedMore));
        }
        let mut lease = pool.lease();
        let mut buf = BytesMut::from(&b"GET /next HTTP/1.1\r\nHost: a\r\n\r\n"[..]);
        match lease.consume(&mut buf).unwrap() {
            Consumed::Request(request) => assert_eq!(request.path, "/next"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_transient_and_replace() {
        let pool = http_pool(Some(4));
        drop(pool.transient());
        assert_eq!(pool.stats().idle, 0);

        let mut lease = pool.lease();
        lease.replace(RelayProcessorFactory::default().create());
        assert_eq!(lease.protocol(), "relay");
        // The original http1 processor went back; the relay one will not.
        assert_eq!(pool.stats().idle, 1);
        drop(lease);
        assert_eq!(pool.stats().idle, 1);
    }
}
