//! Schema bootstrap from entity definitions

use crate::db::models::*;
use crate::errors::Result;
use sea_orm::{ConnectionTrait, EntityTrait, Schema};
use tracing::{debug, info};

/// Create any missing tables and indexes. Safe to call on every startup.
///
/// Tables are created parents first so foreign keys resolve.
pub async fn ensure_schema<C: ConnectionTrait>(conn: &C) -> Result<()> {
    create_entity(conn, AuthorEntity).await?;
    create_entity(conn, GenreEntity).await?;
    create_entity(conn, BookEntity).await?;
    create_entity(conn, BookAuthorEntity).await?;
    create_entity(conn, BookGenreEntity).await?;
    create_entity(conn, ImportJobEntity).await?;

    info!("Database schema ready");
    Ok(())
}

async fn create_entity<C, E>(conn: &C, entity: E) -> Result<()>
where
    C: ConnectionTrait,
    E: EntityTrait,
{
    let backend = conn.get_database_backend();
    let schema = Schema::new(backend);

    let mut table = schema.create_table_from_entity(entity);
    table.if_not_exists();
    conn.execute(backend.build(&table)).await?;

    for mut index in schema.create_index_from_entity(entity) {
        index.if_not_exists();
        conn.execute(backend.build(&index)).await?;
    }

    debug!(table = entity.table_name(), "Ensured table");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::{ConnectOptions, Database, PaginatorTrait};

    #[tokio::test]
    async fn test_ensure_schema_is_idempotent() {
        let mut opts = ConnectOptions::new("sqlite::memory:");
        opts.max_connections(1).min_connections(1);
        let conn = Database::connect(opts).await.unwrap();

        ensure_schema(&conn).await.unwrap();
        ensure_schema(&conn).await.unwrap();

        assert_eq!(BookEntity::find().count(&conn).await.unwrap(), 0);
        assert_eq!(ImportJobEntity::find().count(&conn).await.unwrap(), 0);
    }
}
