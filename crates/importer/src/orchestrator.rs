//! Import orchestrator
//!
//! Drives one import job: claim it, stream the stored file, persist rows in
//! chunks of one transaction each, and write the terminal job state.

use crate::errors::ImportError;
use crate::parser::{ParsedRow, RowFailure, RowReader};
use crate::persister::{persist_row, RowOutcome};
use librarium_common::db::models::{JobStatus, RowError, RowErrors};
use librarium_common::metrics::{record_chunk, record_import_job};
use librarium_common::{ImportJobMessage, Repository, UploadStorage, DEFAULT_CHUNK_SIZE};
use sea_orm::TransactionTrait;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Result of one chunk transaction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkReport {
    pub imported: u32,
    pub failed: u32,
    pub errors: Vec<RowError>,
    pub committed: bool,
}

impl ChunkReport {
    fn reject(&mut self, row: u32, failure: RowFailure) {
        self.failed += 1;
        self.errors.push(RowError::at_row(row, failure.message));
    }

    /// Every row of the chunk failed with the same cause
    fn rolled_back(rows: &[ParsedRow], cause: &dyn std::fmt::Display) -> Self {
        let message = format!("Chunk processing failed: {}", cause);
        Self {
            imported: 0,
            failed: rows.len() as u32,
            errors: rows
                .iter()
                .map(|(row, _)| RowError::at_row(*row, message.clone()))
                .collect(),
            committed: false,
        }
    }
}

/// Final state of a job this orchestrator ran
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSummary {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub imported: u32,
    pub failed: u32,
    pub errors: RowErrors,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The job was claimed and reached a terminal state
    Finished(ImportSummary),
    /// The job was unknown or already claimed by an earlier delivery
    Skipped,
}

#[derive(Debug, Default)]
struct Progress {
    imported: u32,
    failed: u32,
    errors: Vec<RowError>,
}

impl Progress {
    fn absorb(&mut self, report: ChunkReport) {
        self.imported += report.imported;
        self.failed += report.failed;
        self.errors.extend(report.errors);
    }
}

/// Runs import jobs against the catalog
pub struct ImportOrchestrator {
    repository: Repository,
    storage: Option<UploadStorage>,
    chunk_size: usize,
}

impl ImportOrchestrator {
    pub fn new(repository: Repository) -> Self {
        Self {
            repository,
            storage: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Rows per transaction (at least 1)
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Storage that owns uploaded files, used to clean up after completed jobs
    pub fn with_storage(mut self, storage: UploadStorage) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Run a job to completion.
    ///
    /// Problems with the file itself end the job as `failed` and return
    /// `Ok`. An `Err` means the job store failed; the job has been marked
    /// failed where possible and the caller may retry.
    #[instrument(skip(self, message), fields(job_id = %message.job_id, filename = %message.filename))]
    pub async fn run(&self, message: &ImportJobMessage) -> Result<RunOutcome, ImportError> {
        let job_id = message.job_id;

        if !self.repository.claim_import_job(job_id).await? {
            info!("Import job is not pending, skipping");
            return Ok(RunOutcome::Skipped);
        }

        info!("Import job started");
        let started = Instant::now();
        let mut progress = Progress::default();

        let result = self.process_file(message, &mut progress).await;

        let (status, escaped) = match result {
            Ok(()) => (JobStatus::Completed, None),
            Err(e) if e.is_file_error() => {
                warn!(error = %e, "Import file rejected");
                progress.errors.push(RowError::job_level(e.to_string()));
                (JobStatus::Failed, None)
            }
            Err(e) => {
                error!(error = %e, "Import job failed");
                progress.errors.push(RowError::job_level(e.to_string()));
                (JobStatus::Failed, Some(e))
            }
        };

        let summary = ImportSummary {
            job_id,
            status,
            imported: progress.imported,
            failed: progress.failed,
            errors: RowErrors(progress.errors),
        };

        let recorded = self
            .repository
            .finish_import_job(
                job_id,
                summary.status,
                summary.imported,
                summary.failed,
                summary.errors.clone(),
            )
            .await;

        match (recorded, escaped) {
            (Ok(true), None) => {}
            (Ok(false), None) => {
                warn!("Job left processing before it finished, result discarded");
            }
            (Ok(_), Some(e)) => return Err(e),
            (Err(store), escaped) => {
                if let Some(e) = escaped {
                    error!(error = %store, "Could not record job failure");
                    return Err(e);
                }
                return Err(store.into());
            }
        }

        record_import_job(summary.status.as_str(), started.elapsed().as_secs_f64());
        info!(
            status = %summary.status,
            imported = summary.imported,
            failed = summary.failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Import job finished"
        );

        if summary.status == JobStatus::Completed && message.delete_after {
            self.remove_upload(message).await;
        }

        Ok(RunOutcome::Finished(summary))
    }

    async fn process_file(&self, message: &ImportJobMessage, progress: &mut Progress) -> Result<(), ImportError> {
        let reader = RowReader::from_path(&message.file_path)?;
        let mut chunk: Vec<ParsedRow> = Vec::with_capacity(self.chunk_size);

        for parsed in reader {
            chunk.push(parsed?);
            if chunk.len() == self.chunk_size {
                self.flush(message.job_id, &mut chunk, progress).await?;
            }
        }

        if !chunk.is_empty() {
            self.flush(message.job_id, &mut chunk, progress).await?;
        }

        Ok(())
    }

    async fn flush(&self, job_id: Uuid, chunk: &mut Vec<ParsedRow>, progress: &mut Progress) -> Result<(), ImportError> {
        let report = self.process_chunk(chunk).await;
        record_chunk(u64::from(report.imported), u64::from(report.failed), report.committed);
        progress.absorb(report);
        chunk.clear();

        self.repository
            .update_import_progress(job_id, progress.imported, progress.failed)
            .await?;
        Ok(())
    }

    /// Persist one chunk in its own transaction.
    ///
    /// A storage failure anywhere in the chunk rolls all of it back and fails
    /// every row in it.
    pub async fn process_chunk(&self, rows: &[ParsedRow]) -> ChunkReport {
        let txn = match self.repository.pool().write().begin().await {
            Ok(txn) => txn,
            Err(e) => {
                warn!(error = %e, rows = rows.len(), "Could not open chunk transaction");
                return ChunkReport::rolled_back(rows, &e);
            }
        };

        let mut report = ChunkReport::default();

        for (row, parsed) in rows {
            let csv_row = match parsed {
                Ok(csv_row) => csv_row,
                Err(failure) => {
                    report.reject(*row, failure.clone());
                    continue;
                }
            };

            match persist_row(&txn, csv_row).await {
                Ok(RowOutcome::Imported(_)) => report.imported += 1,
                Ok(RowOutcome::Rejected(failure)) => {
                    debug!(row, reason = %failure, "Row rejected");
                    report.reject(*row, failure);
                }
                Err(e) => {
                    warn!(row, error = %e, "Chunk aborted, rolling back");
                    if let Err(rollback) = txn.rollback().await {
                        error!(error = %rollback, "Chunk rollback failed");
                    }
                    return ChunkReport::rolled_back(rows, &e);
                }
            }
        }

        if let Err(e) = txn.commit().await {
            warn!(error = %e, "Chunk commit failed");
            return ChunkReport::rolled_back(rows, &e);
        }

        report.committed = true;
        debug!(imported = report.imported, failed = report.failed, "Chunk committed");
        report
    }

    async fn remove_upload(&self, message: &ImportJobMessage) {
        let Some(ref storage) = self.storage else {
            return;
        };
        if let Err(e) = storage.remove(&message.file_path).await {
            warn!(error = %e, path = %message.file_path.display(), "Failed to remove upload");
        }
    }
}
