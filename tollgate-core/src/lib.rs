//! # tollgate-core
//!
//! Request core for tollgate.
//!
//! This crate provides:
//! - Bounded LIFO/FIFO object pools
//! - Host and path mapping with longest-match rules
//! - The valve pipeline and its terminal handler
//! - Principals and server-side sessions

pub mod error;
pub mod exchange;
pub mod mapper;
pub mod pipeline;
pub mod pool;
pub mod principal;
pub mod session;

pub use error::{CoreError, PipelineError};
pub use exchange::Exchange;
pub use mapper::{MappedPath, Mapper, MappingData, MatchKind};
pub use pipeline::{FnHandler, Handler, Next, Pipeline, PipelineBuilder, Valve};
pub use pool::{Queue, Stack};
pub use principal::Principal;
pub use session::{Session, SessionConfig, SessionManager};
