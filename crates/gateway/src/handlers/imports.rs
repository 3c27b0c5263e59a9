//! CSV import handlers
//!
//! `POST /api/import` validates and stores the upload, creates a pending job
//! and hands it to the dispatcher. `GET /api/import/{id}` reports the job.

use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        Multipart, Path, State,
    },
    http::StatusCode,
    Json,
};
use librarium_common::{
    db::models::{ImportJob, RowErrors},
    errors::{AppError, Result},
    ImportJobMessage,
};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::AppState;

const FILE_FIELD: &str = "file";
const FILE_REQUIRED: &str = "CSV file is required.";
const NOT_A_FILE: &str = "Uploaded file must be a file.";
const WRONG_FORMAT: &str = "File must be in CSV or TXT format.";

const ACCEPTED_EXTENSIONS: &[&str] = &["csv", "txt"];
const ACCEPTED_MIME_TYPES: &[&str] = &["text/csv", "text/plain", "application/csv"];

/// Response for an accepted upload
#[derive(Debug, Serialize)]
pub struct ImportAccepted {
    pub success: bool,
    pub message: &'static str,
    pub import_id: Uuid,
    pub check_status_url: String,
}

/// Import job status response
#[derive(Debug, Serialize)]
pub struct ImportStatusResponse {
    pub success: bool,
    pub import_id: Uuid,
    pub filename: String,
    pub status: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imported_count: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_count: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<RowErrors>,
}

impl From<ImportJob> for ImportStatusResponse {
    fn from(job: ImportJob) -> Self {
        // Counts are only final once the job is terminal
        let terminal = job.is_terminal();

        Self {
            success: true,
            import_id: job.id,
            filename: job.filename,
            status: job.status,
            started_at: job.started_at.map(|dt| dt.to_rfc3339()),
            completed_at: job.completed_at.map(|dt| dt.to_rfc3339()),
            imported_count: terminal.then_some(job.imported_count),
            failed_count: terminal.then_some(job.failed_count),
            errors: terminal.then_some(job.errors),
        }
    }
}

/// A validated upload, read into memory
struct Upload {
    filename: String,
    contents: Vec<u8>,
}

/// Accept a CSV upload and queue it for import
#[instrument(skip_all)]
pub async fn create_import(
    State(state): State<AppState>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Result<(StatusCode, Json<ImportAccepted>)> {
    let mut multipart = multipart.map_err(|e| {
        debug!(error = %e, "Upload is not a multipart request");
        AppError::invalid_field(FILE_FIELD, FILE_REQUIRED)
    })?;

    let upload = read_upload(&mut multipart, state.config.import.max_upload_bytes).await?;
    let path = state.storage.store(&upload.contents).await?;

    let job = match state.repository.create_import_job(&upload.filename).await {
        Ok(job) => job,
        Err(e) => {
            discard_upload(&state, &path).await;
            return Err(e);
        }
    };

    let message = ImportJobMessage::new(job.id, path.clone(), upload.filename.clone());
    if let Err(e) = state.dispatcher.enqueue(message).await {
        warn!(job_id = %job.id, error = %e, "Import job could not be queued");

        // The client never receives this id, so the job must not outlive the request
        match state.repository.delete_import_job(job.id).await {
            Ok(true) => {}
            Ok(false) => warn!(job_id = %job.id, "Unqueued job was no longer pending"),
            Err(store) => error!(job_id = %job.id, error = %store, "Could not delete unqueued job"),
        }
        discard_upload(&state, &path).await;
        return Err(e);
    }

    info!(
        job_id = %job.id,
        filename = %upload.filename,
        bytes = upload.contents.len(),
        "Import queued"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(ImportAccepted {
            success: true,
            message: "Import started. Use the import_id to check status.",
            import_id: job.id,
            check_status_url: state.config.import_status_url(job.id),
        }),
    ))
}

/// Report the state of an import job
pub async fn get_import(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ImportStatusResponse>> {
    let not_found = || AppError::ImportNotFound { id: id.clone() };

    let import_id = Uuid::parse_str(&id).map_err(|_| not_found())?;
    let job = state
        .repository
        .find_import_job(import_id)
        .await?
        .ok_or_else(not_found)?;

    Ok(Json(ImportStatusResponse::from(job)))
}

/// Find the `file` part and read it, enforcing the upload rules
async fn read_upload(multipart: &mut Multipart, limit: usize) -> Result<Upload> {
    loop {
        let field = multipart
            .next_field()
            .await
            .map_err(|e| multipart_error(e, limit))?;

        let Some(mut field) = field else {
            return Err(AppError::invalid_field(FILE_FIELD, FILE_REQUIRED));
        };
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        // Browsers send an empty filename when no file was picked
        let filename = match field.file_name() {
            Some(name) if name.trim().is_empty() => {
                return Err(AppError::invalid_field(FILE_FIELD, FILE_REQUIRED));
            }
            Some(name) => name.to_string(),
            None => return Err(AppError::invalid_field(FILE_FIELD, NOT_A_FILE)),
        };

        if !is_accepted_format(&filename, field.content_type()) {
            return Err(AppError::invalid_field(FILE_FIELD, WRONG_FORMAT));
        }

        let mut contents = Vec::new();
        while let Some(chunk) = field.chunk().await.map_err(|e| multipart_error(e, limit))? {
            let size = contents.len() + chunk.len();
            if size > limit {
                return Err(AppError::PayloadTooLarge { size, limit });
            }
            contents.extend_from_slice(&chunk);
        }

        return Ok(Upload { filename, contents });
    }
}

fn multipart_error(err: MultipartError, limit: usize) -> AppError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return AppError::PayloadTooLarge {
            size: limit.saturating_add(1),
            limit,
        };
    }
    debug!(error = %err, "Malformed multipart body");
    AppError::invalid_field(FILE_FIELD, NOT_A_FILE)
}

/// A `.csv`/`.txt` name wins; without an extension the declared type decides
fn is_accepted_format(filename: &str, content_type: Option<&str>) -> bool {
    match std::path::Path::new(filename).extension().and_then(|ext| ext.to_str()) {
        Some(ext) => ACCEPTED_EXTENSIONS
            .iter()
            .any(|accepted| accepted.eq_ignore_ascii_case(ext)),
        None => content_type
            .and_then(|ct| ct.split(';').next())
            .map(|essence| {
                ACCEPTED_MIME_TYPES
                    .iter()
                    .any(|accepted| accepted.eq_ignore_ascii_case(essence.trim()))
            })
            .unwrap_or(false),
    }
}

async fn discard_upload(state: &AppState, path: &std::path::Path) {
    if let Err(e) = state.storage.remove(path).await {
        warn!(error = %e, path = %path.display(), "Failed to remove upload");
    }
}
