//! Core types, configuration, and the error taxonomy for ObjectStack.
//!
//! This crate provides the foundational building blocks shared across all
//! ObjectStack crates: the renderable [`StorageError`] taxonomy with its
//! HTTP status mapping, the environment-driven [`StorageConfig`], and the
//! small vocabulary of identifiers (tenants, object paths, byte ranges)
//! every other crate speaks.

mod config;
mod error;
mod types;

pub use config::{BackendKind, DatabaseConfig, S3Config, StorageConfig, TusConfig, TusLockType};
pub use error::{ErrorResponse, StorageError, StorageResult};
pub use types::{ByteRange, ObjectPath, TenantId, path_tokens};
