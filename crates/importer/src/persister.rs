//! Book persistence for a single CSV row
//!
//! Every reason to reject a row is settled before authors, genres or links are
//! written, so a rejected row leaves no trace. The book itself goes in first
//! with `ON CONFLICT (isbn) DO NOTHING`: losing an ISBN race to another job is
//! a row rejection, not a storage failure. Storage failures come back as `Err`
//! and are the caller's signal to roll the chunk back.

use crate::parser::{CsvRow, RowFailure};
use crate::resolver::{resolve, was_inserted, EntityKind};
use chrono::{NaiveDate, Utc};
use librarium_common::db::models::*;
use librarium_common::errors::Result;
use sea_orm::sea_query::OnConflict;
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set};
use tracing::{debug, instrument};
use uuid::Uuid;

/// Validated, typed contents of a row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookDraft {
    pub title: String,
    pub description: Option<String>,
    pub edition: Option<String>,
    pub publisher: Option<String>,
    pub year: Option<NaiveDate>,
    pub format: Option<String>,
    pub pages: Option<i32>,
    pub country: Option<String>,
    pub isbn: String,
    pub authors: String,
    pub genres: String,
}

impl BookDraft {
    pub fn from_row(row: &CsvRow) -> std::result::Result<Self, RowFailure> {
        let title = row.title.trim();
        let isbn = row.isbn.trim();
        if title.is_empty() || isbn.is_empty() {
            return Err(RowFailure::new("Title and ISBN are required fields."));
        }

        Ok(Self {
            title: title.to_string(),
            description: optional(&row.description),
            edition: optional(&row.edition),
            publisher: optional(&row.publisher),
            year: parse_year(&row.year)?,
            format: optional(&row.format),
            pages: parse_pages(&row.pages),
            country: optional(&row.country),
            isbn: isbn.to_string(),
            authors: row.authors.clone(),
            genres: row.genre.clone(),
        })
    }
}

/// What happened to a row
#[derive(Debug, Clone)]
pub enum RowOutcome {
    Imported(Book),
    Rejected(RowFailure),
}

/// Persist one row on `conn`, normally the chunk's transaction
#[instrument(level = "debug", skip(conn, row), fields(isbn = %row.isbn))]
pub async fn persist_row<C: ConnectionTrait>(conn: &C, row: &CsvRow) -> Result<RowOutcome> {
    let draft = match BookDraft::from_row(row) {
        Ok(draft) => draft,
        Err(failure) => return Ok(RowOutcome::Rejected(failure)),
    };

    let duplicate = || {
        RowOutcome::Rejected(RowFailure::new(format!(
            "Book with ISBN {} already exists in database.",
            draft.isbn
        )))
    };

    let existing = BookEntity::find()
        .filter(BookColumn::Isbn.eq(draft.isbn.as_str()))
        .one(conn)
        .await?;
    if existing.is_some() {
        return Ok(duplicate());
    }

    let Some(book) = insert_book(conn, &draft).await? else {
        debug!("ISBN claimed by a concurrent import");
        return Ok(duplicate());
    };

    let author_ids = resolve(conn, EntityKind::Author, &draft.authors).await?;
    let genre_ids = resolve(conn, EntityKind::Genre, &draft.genres).await?;

    if !author_ids.is_empty() {
        let links = author_ids.iter().map(|&author_id| BookAuthorActiveModel {
            book_id: Set(book.id),
            author_id: Set(author_id),
        });
        BookAuthorEntity::insert_many(links).exec_without_returning(conn).await?;
    }

    if !genre_ids.is_empty() {
        let links = genre_ids.iter().map(|&genre_id| BookGenreActiveModel {
            book_id: Set(book.id),
            genre_id: Set(genre_id),
        });
        BookGenreEntity::insert_many(links).exec_without_returning(conn).await?;
    }

    debug!(
        book_id = %book.id,
        authors = author_ids.len(),
        genres = genre_ids.len(),
        "Book persisted"
    );

    Ok(RowOutcome::Imported(book))
}

/// Insert the book unless its ISBN is taken; `None` means it was
async fn insert_book<C: ConnectionTrait>(conn: &C, draft: &BookDraft) -> Result<Option<Book>> {
    let now = Utc::now();
    let book = Book {
        id: Uuid::new_v4(),
        title: draft.title.clone(),
        description: draft.description.clone(),
        edition: draft.edition.clone(),
        publisher: draft.publisher.clone(),
        year: draft.year,
        format: draft.format.clone(),
        pages: draft.pages,
        country: draft.country.clone(),
        isbn: draft.isbn.clone(),
        created_at: now.into(),
        updated_at: now.into(),
    };

    let model = BookActiveModel {
        id: Set(book.id),
        title: Set(book.title.clone()),
        description: Set(book.description.clone()),
        edition: Set(book.edition.clone()),
        publisher: Set(book.publisher.clone()),
        year: Set(book.year),
        format: Set(book.format.clone()),
        pages: Set(book.pages),
        country: Set(book.country.clone()),
        isbn: Set(book.isbn.clone()),
        created_at: Set(book.created_at),
        updated_at: Set(book.updated_at),
    };

    let inserted = BookEntity::insert(model)
        .on_conflict(OnConflict::column(BookColumn::Isbn).do_nothing().to_owned())
        .exec_without_returning(conn)
        .await;

    Ok(was_inserted(inserted)?.then_some(book))
}

/// Empty year is null; `YYYY` is January 1; `YYYY-MM-DD` is taken as is
pub fn parse_year(raw: &str) -> std::result::Result<Option<NaiveDate>, RowFailure> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }

    let invalid = || RowFailure::new(format!("Invalid year value: {}", raw));

    if raw.len() == 4 && raw.bytes().all(|b| b.is_ascii_digit()) {
        let year: i32 = raw.parse().map_err(|_| invalid())?;
        return NaiveDate::from_ymd_opt(year, 1, 1).map(Some).ok_or_else(invalid);
    }

    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(Some)
        .map_err(|_| invalid())
}

/// Page count from the cell's leading integer ("300 pages" is 300, "3.5" is 3).
/// No leading digits, zero or a negative count is null.
pub fn parse_pages(raw: &str) -> Option<i32> {
    let raw = raw.trim();
    let unsigned = raw.strip_prefix('+').unwrap_or(raw);
    let digits = unsigned.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }

    let value: u64 = unsigned[..digits].parse().unwrap_or(u64::MAX);
    i32::try_from(value).ok().filter(|pages| *pages > 0)
}

fn optional(raw: &str) -> Option<String> {
    let value = raw.trim();
    (!value.is_empty()).then(|| value.to_string())
}
