//! Librarium Common Library
//!
//! Shared code for the Librarium services including:
//! - Catalog entities (books, authors, genres) and the import job store
//! - Repository pattern over SeaORM
//! - Error types and handling
//! - Configuration management
//! - Upload storage and import job messages
//! - Metrics and observability

pub mod config;
pub mod db;
pub mod errors;
pub mod metrics;
pub mod queue;
pub mod storage;

// Re-export commonly used types
pub use errors::{AppError, Result};
pub use config::AppConfig;
pub use db::{DbPool, Repository};
pub use queue::{Dispatcher, ImportJobMessage};
pub use storage::UploadStorage;

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Rows persisted per transaction during an import
pub const DEFAULT_CHUNK_SIZE: usize = 100;

/// Largest accepted upload (10 MB)
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;
