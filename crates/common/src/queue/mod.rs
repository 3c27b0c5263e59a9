//! Import job dispatch
//!
//! Provides:
//! - The message handed from the upload endpoint to a worker
//! - The `Dispatcher` seam the gateway enqueues through

use crate::errors::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use uuid::Uuid;

/// Import job message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportJobMessage {
    pub job_id: Uuid,
    /// Location of the stored upload
    pub file_path: PathBuf,
    /// Client-supplied file name, for logs
    pub filename: String,
    /// Remove the stored file once the job completes
    pub delete_after: bool,
}

impl ImportJobMessage {
    pub fn new(job_id: Uuid, file_path: impl Into<PathBuf>, filename: impl Into<String>) -> Self {
        Self {
            job_id,
            file_path: file_path.into(),
            filename: filename.into(),
            delete_after: true,
        }
    }

    /// Keep the file after the job completes
    pub fn keep_file(mut self) -> Self {
        self.delete_after = false;
        self
    }
}

/// Hands import jobs to background workers.
///
/// `enqueue` must not wait for the job to run. Delivery is at-least-once:
/// a job may be handed to a worker more than once.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn enqueue(&self, message: ImportJobMessage) -> Result<()>;
}
