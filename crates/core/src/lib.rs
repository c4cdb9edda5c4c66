//! `tenantflow-core`: shared building blocks for the orchestration layer.
//!
//! This crate contains **pure** primitives (no infrastructure concerns):
//! identifiers, the domain error model, optimistic version expectations and
//! the clock abstraction every time-dependent component is built on.

pub mod clock;
pub mod error;
pub mod id;
pub mod version;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{JobId, TenantId};
pub use version::ExpectedVersion;
