use async_trait::async_trait;
use sqlx::PgPool;
use tablesink_core::storage::{self, Identifier, Storage};
use tracing::debug;

use crate::Error;

/// [Storage] over a Postgres pool. Statements come from the core SQL builders, so names arrive
/// quoted and values are always bound.
#[derive(Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Storage for PgStorage {
    async fn create_table_if_not_exists(
        &self,
        table: &Identifier,
        columns: &[Identifier],
    ) -> tablesink_core::Result<()> {
        let sql = storage::create_table_sql(table, columns);
        debug!(%table, %sql, "Creating table");
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(Error::from)?;
        Ok(())
    }

    async fn insert_row(
        &self,
        table: &Identifier,
        row: &[(Identifier, Option<String>)],
    ) -> tablesink_core::Result<()> {
        let columns: Vec<&Identifier> = row.iter().map(|(column, _)| column).collect();
        let sql = storage::insert_sql(table, &columns);
        let mut query = sqlx::query(&sql);
        for (_, value) in row {
            query = query.bind(value.as_deref());
        }
        query.execute(&self.pool).await.map_err(Error::from)?;
        Ok(())
    }
}
