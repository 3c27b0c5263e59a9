//! End-to-end import tests against a throwaway SQLite catalog

use librarium_common::config::{DatabaseConfig, ImportConfig};
use librarium_common::db::models::*;
use librarium_common::db::ensure_schema;
use librarium_common::{DbPool, Dispatcher, ImportJobMessage, Repository, UploadStorage};
use librarium_importer::{
    reap_stale_jobs, resolve, EntityKind, ImportOrchestrator, ImportWorker, LocalDispatcher,
    RunOutcome,
};
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinSet;
use uuid::Uuid;

const HEADER: &str = "Authors,Title,Genre,Description,Edition,Publisher,Year,Format,Pages,Country,ISBN";

struct Fixture {
    repository: Repository,
    dir: TempDir,
}

impl Fixture {
    /// File-backed so a connection dropped mid-query (timeouts) keeps the data
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let pool = connect(&dir, 1).await;
        ensure_schema(pool.write()).await.unwrap();

        Self {
            repository: Repository::new(pool),
            dir,
        }
    }

    /// Another pool on the same catalog file, for concurrent writers
    async fn pool(&self, max_connections: u32) -> DbPool {
        connect(&self.dir, max_connections).await
    }

    fn conn(&self) -> &sea_orm::DatabaseConnection {
        self.repository.pool().write()
    }

    fn orchestrator(&self, chunk_size: usize) -> ImportOrchestrator {
        ImportOrchestrator::new(self.repository.clone()).with_chunk_size(chunk_size)
    }

    fn write_csv(&self, name: &str, body: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    /// Create a pending job for `body` and return the message a worker would receive
    async fn job(&self, body: &str) -> ImportJobMessage {
        let path = self.write_csv(&format!("{}.csv", Uuid::new_v4()), body);
        let job = self.repository.create_import_job("books.csv").await.unwrap();
        ImportJobMessage::new(job.id, path, "books.csv")
    }

    async fn import(&self, body: &str, chunk_size: usize) -> ImportJob {
        let message = self.job(body).await;
        let outcome = self.orchestrator(chunk_size).run(&message).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Finished(_)));
        self.repository.find_import_job(message.job_id).await.unwrap().unwrap()
    }

    async fn book_count(&self) -> u64 {
        BookEntity::find().count(self.conn()).await.unwrap()
    }

    async fn author_count(&self) -> u64 {
        AuthorEntity::find().count(self.conn()).await.unwrap()
    }
}

async fn connect(dir: &TempDir, max_connections: u32) -> DbPool {
    DbPool::new(&DatabaseConfig {
        url: format!("sqlite://{}?mode=rwc", dir.path().join("catalog.db").display()),
        max_connections,
        min_connections: 1,
        ..Default::default()
    })
    .await
    .unwrap()
}

fn csv(rows: &[&str]) -> String {
    let mut body = String::from(HEADER);
    for row in rows {
        body.push('\n');
        body.push_str(row);
    }
    body.push('\n');
    body
}

fn numbered_rows(n: usize) -> String {
    let rows: Vec<String> = (0..n)
        .map(|i| format!("Author {},Book {},Genre,,,,2001,,100,,ISBN-{:05}", i % 7, i, i))
        .collect();
    let refs: Vec<&str> = rows.iter().map(String::as_str).collect();
    csv(&refs)
}

fn assert_counts_cover_rows(job: &ImportJob, data_rows: i32) {
    assert_eq!(job.imported_count + job.failed_count, data_rows);
}

#[tokio::test]
async fn well_formed_rows_are_all_imported() {
    let fx = Fixture::new().await;
    let body = csv(&[
        "J. R. R. Tolkien,The Hobbit,Fantasy,There and back again,1st,Allen & Unwin,1937,Hardcover,310,UK,9780261103344",
        "\"Terry Pratchett; Neil Gaiman\",Good Omens,\"Fantasy; Comedy\",,,,1990-05-01,,,,9780060853983",
        "Frank Herbert,Dune,Science Fiction,,,,,Paperback,412,US,9780441172719",
    ]);

    let job = fx.import(&body, 100).await;

    assert_eq!(job.job_status(), JobStatus::Completed);
    assert_eq!((job.imported_count, job.failed_count), (3, 0));
    assert!(job.errors.0.is_empty());
    assert!(job.started_at.is_some() && job.completed_at.is_some());
    assert_eq!(fx.book_count().await, 3);

    let omens = fx.repository.find_book_by_isbn("9780060853983").await.unwrap().unwrap();
    let authors: Vec<String> = fx
        .repository
        .book_authors(&omens)
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.name)
        .collect();
    assert_eq!(authors, vec!["Neil Gaiman", "Terry Pratchett"]);
    let genres: Vec<String> = fx
        .repository
        .book_genres(&omens)
        .await
        .unwrap()
        .into_iter()
        .map(|g| g.name)
        .collect();
    assert_eq!(genres, vec!["Comedy", "Fantasy"]);
    assert_eq!(omens.year, chrono::NaiveDate::from_ymd_opt(1990, 5, 1));
    assert_eq!(omens.pages, None);

    let hobbit = fx.repository.find_book_by_isbn("9780261103344").await.unwrap().unwrap();
    assert_eq!(hobbit.year, chrono::NaiveDate::from_ymd_opt(1937, 1, 1));
    assert_eq!(hobbit.pages, Some(310));
    assert_eq!(hobbit.publisher.as_deref(), Some("Allen & Unwin"));
}

#[tokio::test]
async fn shared_author_is_created_once() {
    let fx = Fixture::new().await;
    let body = csv(&[
        "J. Tolkien,The Hobbit,Fantasy,,,,,,,,111",
        " J. Tolkien ,The Silmarillion,Fantasy,,,,,,,,222",
    ]);

    let job = fx.import(&body, 100).await;
    assert_eq!(job.imported_count, 2);
    assert_eq!(fx.author_count().await, 1);

    let author = fx.repository.find_author_by_name("J. Tolkien").await.unwrap().unwrap();
    for isbn in ["111", "222"] {
        let book = fx.repository.find_book_by_isbn(isbn).await.unwrap().unwrap();
        let authors = fx.repository.book_authors(&book).await.unwrap();
        assert_eq!(authors, vec![author.clone()]);
    }
}

#[tokio::test]
async fn duplicate_isbn_rows_are_rejected() {
    let fx = Fixture::new().await;
    fx.import(&csv(&["A,Existing,G,,,,,,,,999"]), 100).await;

    let body = csv(&[
        "A,In Database,G,,,,,,,,999",
        "B,First,G,,,,,,,,555",
        "C,Second Copy,G,,,,,,,,555",
    ]);
    let job = fx.import(&body, 100).await;

    assert_eq!(job.job_status(), JobStatus::Completed);
    assert_eq!((job.imported_count, job.failed_count), (1, 2));
    assert_eq!(
        job.errors.0,
        vec![
            RowError::at_row(2, "Book with ISBN 999 already exists in database."),
            RowError::at_row(4, "Book with ISBN 555 already exists in database."),
        ]
    );
    assert_eq!(fx.book_count().await, 2);

    let first = fx.repository.find_book_by_isbn("555").await.unwrap().unwrap();
    assert_eq!(first.title, "First");
    // Rejected rows must not leave authors behind
    assert!(fx.repository.find_author_by_name("C").await.unwrap().is_none());
}

#[tokio::test]
async fn missing_title_or_isbn_is_a_row_error() {
    let fx = Fixture::new().await;
    let body = csv(&[
        "A,,G,,,,,,,,123",
        "A,Untitled ISBN,G,,,,,,,,",
        "A,Fine,G,,,,,,,,124",
        "A,Bad Year,G,,,,around 1990,,,,125",
    ]);

    let job = fx.import(&body, 100).await;

    assert_eq!((job.imported_count, job.failed_count), (1, 3));
    assert_eq!(
        job.errors.0,
        vec![
            RowError::at_row(2, "Title and ISBN are required fields."),
            RowError::at_row(3, "Title and ISBN are required fields."),
            RowError::at_row(5, "Invalid year value: around 1990"),
        ]
    );
}

#[tokio::test]
async fn header_violation_fails_the_job() {
    let fx = Fixture::new().await;
    let body = "Title,Authors,ISBN\nThe Hobbit,Tolkien,111\n";

    let job = fx.import(body, 100).await;

    assert_eq!(job.job_status(), JobStatus::Failed);
    assert_eq!((job.imported_count, job.failed_count), (0, 0));
    assert_eq!(job.errors.0.len(), 1);
    assert_eq!(job.errors.0[0].row, None);
    assert!(job.errors.0[0]
        .error
        .starts_with("Invalid CSV file structure. Expected columns: Authors, Title, Genre"));
    assert_eq!(fx.book_count().await, 0);
}

#[tokio::test]
async fn empty_file_fails_the_job() {
    let fx = Fixture::new().await;
    let job = fx.import("", 100).await;

    assert_eq!(job.job_status(), JobStatus::Failed);
    assert_eq!(job.errors.0.len(), 1);
}

#[tokio::test]
async fn missing_file_fails_the_job() {
    let fx = Fixture::new().await;
    let job = fx.repository.create_import_job("gone.csv").await.unwrap();
    let message = ImportJobMessage::new(job.id, fx.dir.path().join("gone.csv"), "gone.csv");

    fx.orchestrator(100).run(&message).await.unwrap();

    let job = fx.repository.find_import_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.job_status(), JobStatus::Failed);
    assert!(job.errors.0[0].error.starts_with("Failed to read import file"));
}

#[tokio::test]
async fn rows_are_committed_in_chunks() {
    let fx = Fixture::new().await;
    let orchestrator = fx.orchestrator(100);
    let message = fx.job(&numbered_rows(101)).await;

    let outcome = orchestrator.run(&message).await.unwrap();
    let RunOutcome::Finished(summary) = outcome else {
        panic!("job was skipped");
    };

    assert_eq!(summary.status, JobStatus::Completed);
    assert_eq!((summary.imported, summary.failed), (101, 0));
    assert_eq!(fx.book_count().await, 101);
    assert_eq!(fx.author_count().await, 7);

    let job = fx.repository.find_import_job(message.job_id).await.unwrap().unwrap();
    assert_counts_cover_rows(&job, 101);
}

#[tokio::test]
async fn failed_chunk_is_rolled_back_and_later_chunks_continue() {
    let fx = Fixture::new().await;
    fx.conn()
        .execute_unprepared(
            "CREATE TRIGGER explode BEFORE INSERT ON books WHEN NEW.title = 'Explode' \
             BEGIN SELECT RAISE(ABORT, 'simulated storage fault'); END;",
        )
        .await
        .unwrap();

    let body = csv(&[
        "Only In Chunk One,Kept?,G,,,,,,,,001",
        ",,G,,,,,,,,",
        "X,Explode,G,,,,,,,,002",
        "Y,Survivor,G,,,,,,,,003",
    ]);
    let job = fx.import(&body, 3).await;

    assert_eq!(job.job_status(), JobStatus::Completed);
    assert_eq!((job.imported_count, job.failed_count), (1, 3));
    assert_counts_cover_rows(&job, 4);

    let rows: Vec<Option<u32>> = job.errors.0.iter().map(|e| e.row).collect();
    assert_eq!(rows, vec![Some(2), Some(3), Some(4)]);
    assert!(job
        .errors
        .0
        .iter()
        .all(|e| e.error.starts_with("Chunk processing failed: ")));

    // Nothing from the first chunk survives, the second chunk committed
    assert!(fx.repository.find_book_by_isbn("001").await.unwrap().is_none());
    assert!(fx.repository.find_author_by_name("Only In Chunk One").await.unwrap().is_none());
    assert!(fx.repository.find_book_by_isbn("003").await.unwrap().is_some());
}

#[tokio::test]
async fn chunk_with_failed_commit_is_reported_and_later_chunks_continue() {
    let fx = Fixture::new().await;
    // A deferred foreign key is only checked at COMMIT
    for sql in [
        "CREATE TABLE commit_guard (id INTEGER PRIMARY KEY)",
        "CREATE TABLE commit_guard_refs (guard_id INTEGER REFERENCES commit_guard(id) DEFERRABLE INITIALLY DEFERRED)",
        "CREATE TRIGGER unbalanced AFTER INSERT ON books WHEN NEW.title = 'Unbalanced' \
         BEGIN INSERT INTO commit_guard_refs (guard_id) VALUES (-1); END;",
    ] {
        fx.conn().execute_unprepared(sql).await.unwrap();
    }

    let body = csv(&[
        "A,Fine,G,,,,,,,,101",
        "B,Unbalanced,G,,,,,,,,102",
        "C,Later,G,,,,,,,,103",
    ]);
    let job = fx.import(&body, 2).await;

    assert_eq!(job.job_status(), JobStatus::Completed);
    assert_eq!((job.imported_count, job.failed_count), (1, 2));

    let rows: Vec<Option<u32>> = job.errors.0.iter().map(|e| e.row).collect();
    assert_eq!(rows, vec![Some(2), Some(3)]);
    assert!(job
        .errors
        .0
        .iter()
        .all(|e| e.error.starts_with("Chunk processing failed: ")));

    assert!(fx.repository.find_book_by_isbn("101").await.unwrap().is_none());
    assert!(fx.repository.find_author_by_name("A").await.unwrap().is_none());
    assert!(fx.repository.find_book_by_isbn("103").await.unwrap().is_some());
}

#[tokio::test]
async fn row_after_full_chunk_fails_alone() {
    let fx = Fixture::new().await;
    fx.conn()
        .execute_unprepared(
            "CREATE TRIGGER explode BEFORE INSERT ON books WHEN NEW.title = 'Explode' \
             BEGIN SELECT RAISE(ABORT, 'simulated storage fault'); END;",
        )
        .await
        .unwrap();

    let rows: Vec<String> = (0..101)
        .map(|i| {
            let title = if i == 100 { "Explode".to_string() } else { format!("Book {}", i) };
            format!("Author,{},Genre,,,,,,,,ISBN-{:05}", title, i)
        })
        .collect();
    let refs: Vec<&str> = rows.iter().map(String::as_str).collect();
    let job = fx.import(&csv(&refs), 100).await;

    assert_eq!(job.job_status(), JobStatus::Completed);
    assert_eq!((job.imported_count, job.failed_count), (100, 1));
    assert_eq!(job.errors.0.len(), 1);
    assert_eq!(job.errors.0[0].row, Some(102));
    assert!(job.errors.0[0].error.starts_with("Chunk processing failed: "));
    assert_eq!(fx.book_count().await, 100);
}

#[tokio::test]
async fn isbn_claimed_after_the_duplicate_check_is_a_row_error() {
    let fx = Fixture::new().await;
    // Another writer takes the ISBN between the lookup and the insert
    fx.conn()
        .execute_unprepared(
            "CREATE TRIGGER claim_isbn BEFORE INSERT ON books WHEN NEW.title = 'Raced' \
             BEGIN INSERT INTO books (id, title, isbn, created_at, updated_at) \
             VALUES (randomblob(16), 'Winner', NEW.isbn, '2024-01-01T00:00:00+00:00', '2024-01-01T00:00:00+00:00'); END;",
        )
        .await
        .unwrap();

    let body = csv(&["Loser,Raced,Thriller,,,,,,,,race-1", "A,Calm,G,,,,,,,,calm-1"]);
    let job = fx.import(&body, 100).await;

    assert_eq!(job.job_status(), JobStatus::Completed);
    assert_eq!((job.imported_count, job.failed_count), (1, 1));
    assert_eq!(
        job.errors.0,
        vec![RowError::at_row(2, "Book with ISBN race-1 already exists in database.")]
    );

    let claimed = BookEntity::find()
        .filter(BookColumn::Isbn.eq("race-1"))
        .count(fx.conn())
        .await
        .unwrap();
    assert_eq!(claimed, 1);
    assert!(fx.repository.find_author_by_name("Loser").await.unwrap().is_none());
    assert!(fx.repository.find_genre_by_name("Thriller").await.unwrap().is_none());
}

#[tokio::test]
async fn counts_cover_every_data_row() {
    let fx = Fixture::new().await;
    let body = csv(&[
        "A,One,G,,,,,,,,1",
        "too,few",
        "A,,G,,,,,,,,2",
        "A,Two,G,,,,,,,,1",
        "",
        "A,Three,G,,,,,,,,3",
    ]);

    let job = fx.import(&body, 2).await;

    assert_eq!(job.job_status(), JobStatus::Completed);
    assert_counts_cover_rows(&job, 5);
    assert_eq!(job.imported_count, 2);

    // Rows follow file lines, so the blank line before "Three" still counts
    let mut rows: Vec<u32> = job.errors.0.iter().filter_map(|e| e.row).collect();
    rows.sort_unstable();
    assert_eq!(rows, vec![3, 4, 5]);
    assert!(fx.repository.find_book_by_isbn("3").await.unwrap().is_some());
}

#[tokio::test]
async fn resolver_is_idempotent() {
    let fx = Fixture::new().await;

    let first = resolve(fx.conn(), EntityKind::Genre, "Fantasy; Horror ;Fantasy").await.unwrap();
    let second = resolve(fx.conn(), EntityKind::Genre, "Horror;Fantasy").await.unwrap();

    assert_eq!(first.len(), 2);
    assert_eq!(second, vec![first[1], first[0]]);
    assert_eq!(GenreEntity::find().count(fx.conn()).await.unwrap(), 2);
    assert!(resolve(fx.conn(), EntityKind::Author, " ; ").await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_resolvers_share_one_author() {
    let fx = Fixture::new().await;
    let pool = fx.pool(4).await;

    let mut tasks = JoinSet::new();
    for _ in 0..8 {
        let conn = pool.write().clone();
        tasks.spawn(async move { resolve(&conn, EntityKind::Author, "Ursula K. Le Guin").await });
    }

    let mut ids = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        ids.extend(joined.unwrap().unwrap());
    }

    assert_eq!(ids.len(), 8);
    assert!(ids.iter().all(|id| *id == ids[0]));
    let authors = AuthorEntity::find()
        .filter(AuthorColumn::Name.eq("Ursula K. Le Guin"))
        .count(fx.conn())
        .await
        .unwrap();
    assert_eq!(authors, 1);
}

#[tokio::test]
async fn redelivered_job_is_skipped() {
    let fx = Fixture::new().await;
    let orchestrator = fx.orchestrator(100);
    let message = fx.job(&csv(&["A,One,G,,,,,,,,1"])).await;

    assert!(matches!(orchestrator.run(&message).await.unwrap(), RunOutcome::Finished(_)));
    assert_eq!(orchestrator.run(&message).await.unwrap(), RunOutcome::Skipped);

    let unknown = ImportJobMessage::new(Uuid::new_v4(), "nowhere.csv", "nowhere.csv");
    assert_eq!(orchestrator.run(&unknown).await.unwrap(), RunOutcome::Skipped);
    assert_eq!(fx.book_count().await, 1);
}

#[tokio::test]
async fn completed_upload_is_removed_from_storage() {
    let fx = Fixture::new().await;
    let storage = UploadStorage::open(fx.dir.path().join("uploads")).await.unwrap();
    let orchestrator = fx.orchestrator(100).with_storage(storage.clone());

    let ok_path = storage.store(csv(&["A,One,G,,,,,,,,1"]).as_bytes()).await.unwrap();
    let ok_job = fx.repository.create_import_job("ok.csv").await.unwrap();
    orchestrator
        .run(&ImportJobMessage::new(ok_job.id, &ok_path, "ok.csv"))
        .await
        .unwrap();
    assert!(!ok_path.exists());

    // Failed jobs keep their file for inspection
    let bad_path = storage.store(b"not,a,catalog\n").await.unwrap();
    let bad_job = fx.repository.create_import_job("bad.csv").await.unwrap();
    orchestrator
        .run(&ImportJobMessage::new(bad_job.id, &bad_path, "bad.csv"))
        .await
        .unwrap();
    assert!(bad_path.exists());
}

#[tokio::test]
async fn dispatcher_runs_queued_jobs() {
    let fx = Fixture::new().await;
    let orchestrator = Arc::new(fx.orchestrator(100));
    let (dispatcher, worker) = LocalDispatcher::start(orchestrator, &ImportConfig::default());

    let message = fx.job(&csv(&["A,One,G,,,,,,,,1", "B,Two,G,,,,,,,,2"])).await;
    let job_id = message.job_id;
    dispatcher.enqueue(message).await.unwrap();

    // Closing the queue lets the worker finish in-flight jobs and stop
    drop(dispatcher);
    tokio::time::timeout(Duration::from_secs(10), worker)
        .await
        .expect("worker did not stop")
        .unwrap();

    let job = fx.repository.find_import_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.job_status(), JobStatus::Completed);
    assert_eq!(job.imported_count, 2);
}

#[tokio::test]
async fn full_queue_rejects_enqueue() {
    let (dispatcher, _receiver) = LocalDispatcher::new(1);
    let message = ImportJobMessage::new(Uuid::new_v4(), "a.csv", "a.csv");

    dispatcher.enqueue(message.clone()).await.unwrap();
    let err = dispatcher.enqueue(message).await.unwrap_err();
    assert!(err.to_string().contains("queue is full"));
}

#[tokio::test]
async fn timed_out_job_is_marked_failed() {
    let fx = Fixture::new().await;
    let orchestrator = Arc::new(fx.orchestrator(100));
    let config = ImportConfig {
        job_timeout_secs: 0,
        ..Default::default()
    };
    let worker = ImportWorker::from_config(orchestrator, &config);

    let message = fx.job(&numbered_rows(50)).await;
    let job_id = message.job_id;
    worker.execute(message).await;

    let job = fx.repository.find_import_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.job_status(), JobStatus::Failed);
    assert_eq!(
        job.errors.0.last().map(|e| e.error.as_str()),
        Some("Import timed out after 0s")
    );
}

#[tokio::test]
async fn reaper_fails_abandoned_jobs() {
    let fx = Fixture::new().await;
    let abandoned = fx.repository.create_import_job("stuck.csv").await.unwrap();
    fx.repository.claim_import_job(abandoned.id).await.unwrap();
    let queued = fx.repository.create_import_job("queued.csv").await.unwrap();

    assert!(reap_stale_jobs(&fx.repository, Duration::from_secs(3600)).await.unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(20)).await;
    let reaped = reap_stale_jobs(&fx.repository, Duration::from_millis(1)).await.unwrap();
    assert_eq!(reaped, vec![abandoned.id]);

    let abandoned = fx.repository.find_import_job(abandoned.id).await.unwrap().unwrap();
    assert_eq!(abandoned.job_status(), JobStatus::Failed);
    assert_eq!(abandoned.errors.0, vec![RowError::job_level("Import abandoned while processing")]);

    let queued = ImportJobEntity::find()
        .filter(ImportJobColumn::Id.eq(queued.id))
        .one(fx.conn())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(queued.job_status(), JobStatus::Pending);
}
