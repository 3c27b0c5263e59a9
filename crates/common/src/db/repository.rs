//! Repository pattern for database operations
//!
//! Provides a clean interface for the data access the gateway, the importer
//! and the catalog CRUD layer share. Import job transitions are conditional
//! updates so concurrent workers never overwrite each other's terminal state.

use crate::db::models::*;
use crate::db::DbPool;
use crate::errors::{AppError, Result};
use chrono::{DateTime, Utc};
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, ModelTrait,
    PaginatorTrait, QueryFilter, QueryOrder, Set,
};
use tracing::{debug, warn};
use uuid::Uuid;

/// Repository for data access operations
#[derive(Clone)]
pub struct Repository {
    pool: DbPool,
}

impl Repository {
    /// Create a new repository with the given connection pool
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Underlying pool, for callers that manage their own transactions
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    fn read_conn(&self) -> &DatabaseConnection {
        self.pool.read()
    }

    fn write_conn(&self) -> &DatabaseConnection {
        self.pool.write()
    }

    // ========================================================================
    // Health Check
    // ========================================================================

    /// Ping the database
    pub async fn ping(&self) -> Result<()> {
        self.pool.ping().await
    }

    // ========================================================================
    // Import Job Operations
    // ========================================================================

    /// Create an import job in `pending` with zero counts
    pub async fn create_import_job(&self, filename: &str) -> Result<ImportJob> {
        let job = ImportJobActiveModel {
            id: Set(Uuid::new_v4()),
            filename: Set(filename.to_string()),
            status: Set(JobStatus::Pending.into()),
            imported_count: Set(0),
            failed_count: Set(0),
            errors: Set(RowErrors::default()),
            created_at: Set(now()),
            started_at: Set(None),
            completed_at: Set(None),
        };

        job.insert(self.write_conn()).await.map_err(Into::into)
    }

    /// Find import job by ID
    pub async fn find_import_job(&self, id: Uuid) -> Result<Option<ImportJob>> {
        // Polling must see progress written through the primary
        ImportJobEntity::find_by_id(id)
            .one(self.write_conn())
            .await
            .map_err(Into::into)
    }

    /// Move a job from `pending` to `processing`.
    ///
    /// Returns `false` when the job is unknown or was already claimed, which
    /// makes redelivery of the same job a no-op.
    pub async fn claim_import_job(&self, id: Uuid) -> Result<bool> {
        let result = ImportJobEntity::update_many()
            .col_expr(ImportJobColumn::Status, Expr::value(JobStatus::Processing.as_str()))
            .col_expr(ImportJobColumn::StartedAt, Expr::value(now()))
            .filter(ImportJobColumn::Id.eq(id))
            .filter(ImportJobColumn::Status.eq(JobStatus::Pending.as_str()))
            .exec(self.write_conn())
            .await?;

        Ok(result.rows_affected == 1)
    }

    /// Write running counters of a processing job
    pub async fn update_import_progress(
        &self,
        id: Uuid,
        imported_count: u32,
        failed_count: u32,
    ) -> Result<()> {
        ImportJobEntity::update_many()
            .col_expr(ImportJobColumn::ImportedCount, Expr::value(to_count(imported_count)))
            .col_expr(ImportJobColumn::FailedCount, Expr::value(to_count(failed_count)))
            .filter(ImportJobColumn::Id.eq(id))
            .filter(ImportJobColumn::Status.eq(JobStatus::Processing.as_str()))
            .exec(self.write_conn())
            .await?;

        Ok(())
    }

    /// Write the terminal state of a processing job.
    ///
    /// Returns `false` if the job was no longer processing (reaped or timed out).
    pub async fn finish_import_job(
        &self,
        id: Uuid,
        status: JobStatus,
        imported_count: u32,
        failed_count: u32,
        errors: RowErrors,
    ) -> Result<bool> {
        debug_assert!(status.is_terminal());

        let result = ImportJobEntity::update_many()
            .col_expr(ImportJobColumn::Status, Expr::value(status.as_str()))
            .col_expr(ImportJobColumn::ImportedCount, Expr::value(to_count(imported_count)))
            .col_expr(ImportJobColumn::FailedCount, Expr::value(to_count(failed_count)))
            .col_expr(ImportJobColumn::Errors, Expr::value(errors))
            .col_expr(ImportJobColumn::CompletedAt, Expr::value(now()))
            .filter(ImportJobColumn::Id.eq(id))
            .filter(ImportJobColumn::Status.eq(JobStatus::Processing.as_str()))
            .exec(self.write_conn())
            .await?;

        Ok(result.rows_affected == 1)
    }

    /// Fail a processing job, appending a job-level error.
    ///
    /// Counts and earlier errors are kept. Returns `false` if the job is
    /// unknown or not processing: a pending job only ever moves to
    /// `processing`.
    pub async fn fail_import_job(&self, id: Uuid, message: &str) -> Result<bool> {
        let Some(job) = ImportJobEntity::find_by_id(id).one(self.write_conn()).await? else {
            return Ok(false);
        };
        if job.job_status() != JobStatus::Processing {
            return Ok(false);
        }

        let mut errors = job.errors.clone();
        errors.0.push(RowError::job_level(message));

        let result = ImportJobEntity::update_many()
            .col_expr(ImportJobColumn::Status, Expr::value(JobStatus::Failed.as_str()))
            .col_expr(ImportJobColumn::Errors, Expr::value(errors))
            .col_expr(ImportJobColumn::CompletedAt, Expr::value(now()))
            .filter(ImportJobColumn::Id.eq(id))
            .filter(ImportJobColumn::Status.eq(JobStatus::Processing.as_str()))
            .exec(self.write_conn())
            .await?;

        Ok(result.rows_affected == 1)
    }

    /// Delete a job that never left `pending`.
    ///
    /// Used when a freshly created job could not be handed to a worker.
    /// Returns `false` if the job is unknown or was already claimed.
    pub async fn delete_import_job(&self, id: Uuid) -> Result<bool> {
        let result = ImportJobEntity::delete_many()
            .filter(ImportJobColumn::Id.eq(id))
            .filter(ImportJobColumn::Status.eq(JobStatus::Pending.as_str()))
            .exec(self.write_conn())
            .await?;

        Ok(result.rows_affected == 1)
    }

    /// Fail every job stuck in `processing` since before `cutoff`.
    ///
    /// Returns the IDs of the jobs that were failed.
    pub async fn fail_stale_import_jobs(
        &self,
        cutoff: DateTime<Utc>,
        message: &str,
    ) -> Result<Vec<Uuid>> {
        let cutoff: DateTimeWithTimeZone = cutoff.into();

        let stale = ImportJobEntity::find()
            .filter(ImportJobColumn::Status.eq(JobStatus::Processing.as_str()))
            .filter(ImportJobColumn::StartedAt.lt(cutoff))
            .order_by_asc(ImportJobColumn::StartedAt)
            .all(self.write_conn())
            .await?;

        let mut failed = Vec::with_capacity(stale.len());
        for job in stale {
            if self.fail_import_job(job.id, message).await? {
                failed.push(job.id);
            } else {
                debug!(job_id = %job.id, "Stale job finished before it could be failed");
            }
        }

        Ok(failed)
    }

    // ========================================================================
    // Catalog Operations
    // ========================================================================

    /// Find book by ISBN
    pub async fn find_book_by_isbn(&self, isbn: &str) -> Result<Option<Book>> {
        BookEntity::find()
            .filter(BookColumn::Isbn.eq(isbn.trim()))
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Authors attached to a book, by name
    pub async fn book_authors(&self, book: &Book) -> Result<Vec<Author>> {
        book.find_related(AuthorEntity)
            .order_by_asc(AuthorColumn::Name)
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Genres attached to a book, by name
    pub async fn book_genres(&self, book: &Book) -> Result<Vec<Genre>> {
        book.find_related(GenreEntity)
            .order_by_asc(GenreColumn::Name)
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Find author by exact name
    pub async fn find_author_by_name(&self, name: &str) -> Result<Option<Author>> {
        AuthorEntity::find()
            .filter(AuthorColumn::Name.eq(name))
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Find genre by exact name
    pub async fn find_genre_by_name(&self, name: &str) -> Result<Option<Genre>> {
        GenreEntity::find()
            .filter(GenreColumn::Name.eq(name))
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Delete an author no book references. Returns `false` if it did not exist.
    pub async fn delete_author(&self, id: Uuid) -> Result<bool> {
        let Some(author) = AuthorEntity::find_by_id(id).one(self.write_conn()).await? else {
            return Ok(false);
        };

        let references = BookAuthorEntity::find()
            .filter(BookAuthorColumn::AuthorId.eq(id))
            .count(self.write_conn())
            .await?;
        if references > 0 {
            warn!(author_id = %id, references, "Refusing to delete referenced author");
            return Err(AppError::EntityInUse {
                resource_type: "author".to_string(),
                name: author.name,
            });
        }

        let result = author.delete(self.write_conn()).await?;
        Ok(result.rows_affected == 1)
    }

    /// Delete a genre no book references. Returns `false` if it did not exist.
    pub async fn delete_genre(&self, id: Uuid) -> Result<bool> {
        let Some(genre) = GenreEntity::find_by_id(id).one(self.write_conn()).await? else {
            return Ok(false);
        };

        let references = BookGenreEntity::find()
            .filter(BookGenreColumn::GenreId.eq(id))
            .count(self.write_conn())
            .await?;
        if references > 0 {
            warn!(genre_id = %id, references, "Refusing to delete referenced genre");
            return Err(AppError::EntityInUse {
                resource_type: "genre".to_string(),
                name: genre.name,
            });
        }

        let result = genre.delete(self.write_conn()).await?;
        Ok(result.rows_affected == 1)
    }
}

fn now() -> DateTimeWithTimeZone {
    Utc::now().into()
}

fn to_count(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}
