use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use tablesink_core::metadata::{MetadataLookup, Processor, Route};

const FIND_ROUTE_BY_ID: &str = r#"
    SELECT id::text, processor_id::text
    FROM processor_state
    WHERE id::text = $1
"#;

const FIND_PROCESSOR_BY_ID: &str = r#"
    SELECT id::text, properties
    FROM processor
    WHERE id::text = $1
"#;

/// Route and processor lookup straight from the metadata tables. Wrap it in a
/// [tablesink_core::metadata::CachedLookup] to avoid a round trip per message.
#[derive(Clone)]
pub struct PgMetadataLookup {
    pool: PgPool,
}

impl PgMetadataLookup {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Unreachable database is worth a retry, a row that does not decode is not.
fn lookup_error(entity: &str, id: &str, err: sqlx::Error) -> tablesink_core::Error {
    match err {
        sqlx::Error::RowNotFound => tablesink_core::Error::NotFound(format!("{entity} {id}")),
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::Decode(_) => {
            tablesink_core::Error::Decode(format!("decoding {entity} {id}: {err}"))
        }
        other => tablesink_core::Error::Lookup(format!("fetching {entity} {id}: {other}")),
    }
}

#[async_trait]
impl MetadataLookup for PgMetadataLookup {
    async fn find_route_by_id(&self, id: &str) -> tablesink_core::Result<Route> {
        let row: Option<(String, String)> = sqlx::query_as(FIND_ROUTE_BY_ID)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| lookup_error("route", id, e))?;

        let (id, processor_id) = row.ok_or_else(|| {
            tablesink_core::Error::NotFound(format!("route {id}"))
        })?;
        Ok(Route { id, processor_id })
    }

    async fn find_processor_by_id(&self, id: &str) -> tablesink_core::Result<Processor> {
        let row: Option<(String, Option<Value>)> = sqlx::query_as(FIND_PROCESSOR_BY_ID)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| lookup_error("processor", id, e))?;

        let (id, properties) = row.ok_or_else(|| {
            tablesink_core::Error::NotFound(format!("processor {id}"))
        })?;
        Ok(Processor { id, properties })
    }
}
