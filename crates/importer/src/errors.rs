//! Import pipeline error types
//!
//! Only job-level failures are errors here. A bad row is a
//! [`RowFailure`](crate::parser::RowFailure) value recorded on the job.

use crate::parser::EXPECTED_HEADERS;
use librarium_common::errors::AppError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImportError {
    #[error(
        "Invalid CSV file structure. Expected columns: {}. Received: {received}",
        EXPECTED_HEADERS.join(", ")
    )]
    Schema { received: String },

    #[error("CSV read error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Failed to read import file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Import timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error(transparent)]
    Store(#[from] AppError),
}

impl ImportError {
    pub fn schema(received: &[String]) -> Self {
        let received = if received.is_empty() {
            "(empty file)".to_string()
        } else {
            received.join(", ")
        };
        ImportError::Schema { received }
    }

    /// Errors that end a job with a recorded failure rather than escaping
    /// to the dispatcher
    pub fn is_file_error(&self) -> bool {
        matches!(self, ImportError::Schema { .. } | ImportError::Csv(_) | ImportError::Io(_))
    }
}

impl From<sea_orm::DbErr> for ImportError {
    fn from(e: sea_orm::DbErr) -> Self {
        ImportError::Store(AppError::Database(e))
    }
}
