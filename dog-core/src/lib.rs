//! dog-core: framework-agnostic core for DogRS.
//!
//! Shared building blocks for the tenant-scoped crates: the tenant
//! identity every request carries, layered configuration and the
//! request-boundary error type.

pub mod config;
pub mod errors;
pub mod tenant;

pub use config::{DogConfig, DogConfigSnapshot};
pub use errors::{DogError, DogResult, ErrorKind};
pub use tenant::{MissingIdentity, OrganizationId, TenantIdentity, UserId};
