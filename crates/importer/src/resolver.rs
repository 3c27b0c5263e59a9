//! Author and genre resolution
//!
//! Turns a `;`-separated cell into entity IDs, creating missing entities.
//! Creation is insert-or-fetch against the unique `name` column, so two jobs
//! resolving the same new name concurrently end up with one row, and a lost
//! race never aborts the surrounding transaction.

use chrono::Utc;
use librarium_common::db::models::*;
use sea_orm::sea_query::OnConflict;
use sea_orm::{ColumnTrait, ConnectionTrait, DbErr, EntityTrait, QueryFilter, Set, SqlErr};
use std::fmt;
use tracing::trace;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Author,
    Genre,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Author => f.write_str("author"),
            EntityKind::Genre => f.write_str("genre"),
        }
    }
}

/// Split a multi-valued cell: trimmed, non-empty, first occurrence kept
pub fn split_names(raw: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for name in raw.split(';').map(str::trim).filter(|n| !n.is_empty()) {
        if !names.iter().any(|seen| seen == name) {
            names.push(name.to_string());
        }
    }
    names
}

/// Resolve every name in `raw` to an entity ID, in first-seen order
pub async fn resolve<C: ConnectionTrait>(conn: &C, kind: EntityKind, raw: &str) -> Result<Vec<Uuid>, DbErr> {
    let names = split_names(raw);
    let mut ids = Vec::with_capacity(names.len());

    for name in &names {
        let id = match kind {
            EntityKind::Author => author_id(conn, name).await?,
            EntityKind::Genre => genre_id(conn, name).await?,
        };
        trace!(%kind, name = %name, id = %id, "Resolved entity");
        ids.push(id);
    }

    Ok(ids)
}

async fn author_id<C: ConnectionTrait>(conn: &C, name: &str) -> Result<Uuid, DbErr> {
    let id = Uuid::new_v4();
    let model = AuthorActiveModel {
        id: Set(id),
        name: Set(name.to_string()),
        created_at: Set(Utc::now().into()),
    };

    let inserted = AuthorEntity::insert(model)
        .on_conflict(OnConflict::column(AuthorColumn::Name).do_nothing().to_owned())
        .exec_without_returning(conn)
        .await;
    if was_inserted(inserted)? {
        return Ok(id);
    }

    AuthorEntity::find()
        .filter(AuthorColumn::Name.eq(name))
        .one(conn)
        .await?
        .map(|author| author.id)
        .ok_or_else(|| DbErr::RecordNotFound(format!("author '{}'", name)))
}

async fn genre_id<C: ConnectionTrait>(conn: &C, name: &str) -> Result<Uuid, DbErr> {
    let id = Uuid::new_v4();
    let model = GenreActiveModel {
        id: Set(id),
        name: Set(name.to_string()),
        created_at: Set(Utc::now().into()),
    };

    let inserted = GenreEntity::insert(model)
        .on_conflict(OnConflict::column(GenreColumn::Name).do_nothing().to_owned())
        .exec_without_returning(conn)
        .await;
    if was_inserted(inserted)? {
        return Ok(id);
    }

    GenreEntity::find()
        .filter(GenreColumn::Name.eq(name))
        .one(conn)
        .await?
        .map(|genre| genre.id)
        .ok_or_else(|| DbErr::RecordNotFound(format!("genre '{}'", name)))
}

/// `Ok(true)` if our row went in, `Ok(false)` if the unique key already existed
pub(crate) fn was_inserted(inserted: Result<u64, DbErr>) -> Result<bool, DbErr> {
    match inserted {
        Ok(rows) => Ok(rows > 0),
        Err(DbErr::RecordNotInserted) => Ok(false),
        Err(e) if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => Ok(false),
        Err(e) => Err(e),
    }
}
