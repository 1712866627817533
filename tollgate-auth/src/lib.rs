//! # tollgate-auth
//!
//! Security for tollgate.
//!
//! This crate provides:
//! - Message-digest credential validation (salted/iterated, prefixed, bare)
//! - The [`Realm`] trait with in-memory and lock-out realms
//! - Security constraint matching and merging
//! - Pluggable authentication modules (`BASIC`, `BEARER`) and their registry
//! - The [`Authenticator`] valve

pub mod authenticator;
pub mod constraint;
pub mod credential;
pub mod error;
pub mod module;
pub mod realm;

pub use authenticator::{AuthEvent, Authenticator};
pub use constraint::{ConstraintSet, ResolvedConstraint, SecurityConstraint, TransportGuarantee};
pub use credential::{CredentialHandler, DigestAlgorithm};
pub use error::AuthError;
pub use module::{
    AuthModule, AuthModuleFactory, AuthModuleRegistry, AuthOutcome, BasicAuthModule,
    BearerTokenModule,
};
pub use realm::{LockOutRealm, MemoryRealm, Realm, User};
