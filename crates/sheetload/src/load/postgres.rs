//! PostgreSQL relational sink

use super::{bounded, FailureCause, RelationalSink, SinkError, SinkErrorKind, UpsertCounts};
use async_trait::async_trait;
use sheetload_common::schema::check_identifier;
use sheetload_common::{FieldType, FieldValue, Schema, TypedRecord};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::config::PostgresConfig;

/// Build a lazily connecting pool; nothing touches the network until first use
pub fn connect_lazy(config: &PostgresConfig) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.connect_timeout())
        .connect_lazy_with(config.connect_options()?);
    Ok(pool)
}

/// Upserts batches into one table keyed by `id`
pub struct PgRelationalSink {
    pool: PgPool,
    table: String,
    schema: Schema,
    table_ready: OnceCell<()>,
}

impl PgRelationalSink {
    pub fn new(pool: PgPool, table: impl Into<String>, schema: Schema) -> sheetload_common::Result<Self> {
        let table = table.into();
        check_identifier(&table)?;
        schema.validate()?;

        Ok(Self {
            pool,
            table,
            schema,
            table_ready: OnceCell::new(),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// DDL for the target table
    pub fn create_table_sql(&self) -> String {
        let columns: String = self
            .schema
            .columns
            .iter()
            .map(|c| format!("    {} {},\n", c.name, c.field_type.sql_type()))
            .collect();

        format!(
            "CREATE TABLE IF NOT EXISTS {table} (\n    {id} TEXT PRIMARY KEY,\n{columns}    id_synthesized BOOLEAN NOT NULL DEFAULT FALSE,\n    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),\n    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()\n)",
            table = self.table,
            id = self.schema.id_column,
            columns = columns,
        )
    }

    /// Multi-row upsert for `records`
    pub fn upsert_query<'a>(&self, records: &'a [TypedRecord]) -> QueryBuilder<'a, Postgres> {
        let column_list: Vec<&str> = self.schema.column_names().collect();

        let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {} ({}, id_synthesized, {}) ",
            self.table,
            self.schema.id_column,
            column_list.join(", ")
        ));

        query_builder.push_values(records, |mut b, record| {
            b.push_bind(record.id.as_str()).push_bind(record.id_synthesized);
            for column in &self.schema.columns {
                let value = record.field(&column.name);
                match column.field_type {
                    FieldType::Integer => b.push_bind(value.as_i64()),
                    FieldType::Decimal => b.push_bind(value.as_f64()),
                    FieldType::Boolean => b.push_bind(value.as_bool()),
                    FieldType::Text => b.push_bind(text_value(value)),
                };
            }
        });

        let assignments: Vec<String> = column_list
            .iter()
            .map(|c| format!("{c} = EXCLUDED.{c}"))
            .collect();

        query_builder.push(format!(
            " ON CONFLICT ({}) DO UPDATE SET {}, id_synthesized = EXCLUDED.id_synthesized, updated_at = NOW() RETURNING (xmax = 0) AS inserted",
            self.schema.id_column,
            assignments.join(", ")
        ));

        query_builder
    }

    async fn ensure_table(&self) -> Result<(), SinkError> {
        self.table_ready
            .get_or_try_init(|| async {
                sqlx::query(&self.create_table_sql())
                    .execute(&self.pool)
                    .await
                    .map_err(|e| classify(&e))?;
                info!(table = %self.table, "Ensured target table exists");
                Ok::<(), SinkError>(())
            })
            .await
            .map(|_| ())
    }

    /// Number of rows in the table
    pub async fn count(&self) -> Result<i64, SinkError> {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", self.table))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| classify(&e))
    }

    /// First `limit` rows ordered by id, as JSON objects
    pub async fn preview(&self, limit: i64) -> Result<Vec<serde_json::Value>, SinkError> {
        sqlx::query_scalar(&format!(
            "SELECT to_jsonb(t) FROM {} t ORDER BY {} LIMIT $1",
            self.table, self.schema.id_column
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| classify(&e))
    }

    /// One row by id, as a JSON object
    pub async fn fetch(&self, id: &str) -> Result<Option<serde_json::Value>, SinkError> {
        sqlx::query_scalar(&format!(
            "SELECT to_jsonb(t) FROM {} t WHERE {} = $1",
            self.table, self.schema.id_column
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| classify(&e))
    }
}

fn text_value(value: &FieldValue) -> Option<String> {
    match value {
        FieldValue::Null => None,
        other => Some(other.to_string()),
    }
}

#[async_trait]
impl RelationalSink for PgRelationalSink {
    async fn upsert_batch(&self, records: &[TypedRecord], timeout: Duration) -> Result<UpsertCounts, SinkError> {
        if records.is_empty() {
            return Ok(UpsertCounts::default());
        }

        let (tx, rows) = bounded(timeout, async {
            self.ensure_table().await?;

            let mut tx = self.pool.begin().await.map_err(|e| classify(&e))?;
            let rows = self
                .upsert_query(records)
                .build()
                .fetch_all(&mut *tx)
                .await
                .map_err(|e| classify(&e))?;
            Ok((tx, rows))
        })
        .await?;

        tx.commit().await.map_err(|e| classify(&e))?;

        let mut counts = UpsertCounts::default();
        for row in &rows {
            let inserted: bool = row.try_get("inserted").map_err(|e| classify(&e))?;
            if inserted {
                counts.inserted += 1;
            } else {
                counts.updated += 1;
            }
        }

        debug!(
            table = %self.table,
            inserted = counts.inserted,
            updated = counts.updated,
            "Committed relational batch"
        );

        Ok(counts)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Map a SQLSTATE code to retryability and cause
pub fn classify_sqlstate(code: &str) -> (SinkErrorKind, FailureCause) {
    use FailureCause::*;
    use SinkErrorKind::*;

    match code {
        "40001" | "40P01" => (Transient, Concurrency),
        "53300" => (Transient, ResourceExhausted),
        "57P01" => (Transient, Connectivity),
        c if c.starts_with("08") => (Transient, Connectivity),
        c if c.starts_with("23") => (Permanent, ConstraintViolation),
        c if c.starts_with("22") => (Permanent, DataException),
        c if c.starts_with("42") => (Permanent, SchemaMismatch),
        _ => (Permanent, Other),
    }
}

/// Classify a sqlx error
pub fn classify(err: &sqlx::Error) -> SinkError {
    let (kind, cause) = match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => (SinkErrorKind::Transient, FailureCause::Connectivity),
        sqlx::Error::Database(db) => match db.code() {
            Some(code) => classify_sqlstate(&code),
            None => (SinkErrorKind::Permanent, FailureCause::Other),
        },
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            (SinkErrorKind::Permanent, FailureCause::DataException)
        }
        _ => (SinkErrorKind::Permanent, FailureCause::Other),
    };

    SinkError::new(kind, cause, err.to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use sheetload_common::{Column, ValidationState};
    use std::collections::BTreeMap;

    fn sink() -> PgRelationalSink {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://postgres@localhost/postgres")
            .unwrap();
        let schema = Schema::new(
            "id",
            vec![
                Column::new("name", FieldType::Text),
                Column::new("amount", FieldType::Decimal),
            ],
        );
        PgRelationalSink::new(pool, "sales_data", schema).unwrap()
    }

    #[tokio::test]
    async fn test_rejects_unsafe_table_name() {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://postgres@localhost/postgres")
            .unwrap();
        assert!(PgRelationalSink::new(pool, "x; DROP TABLE y", Schema::sales()).is_err());
    }

    #[tokio::test]
    async fn test_create_table_sql() {
        let sql = sink().create_table_sql();
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS sales_data"));
        assert!(sql.contains("id TEXT PRIMARY KEY"));
        assert!(sql.contains("name TEXT,"));
        assert!(sql.contains("amount DOUBLE PRECISION,"));
        assert!(sql.contains("id_synthesized BOOLEAN"));
        assert!(sql.contains("updated_at TIMESTAMPTZ"));
    }

    #[tokio::test]
    async fn test_upsert_sql() {
        let records = vec![
            TypedRecord {
                row_index: 0,
                id: "a".to_string(),
                id_synthesized: true,
                fields: BTreeMap::new(),
                validation: ValidationState::Valid,
            },
            TypedRecord {
                row_index: 1,
                id: "b".to_string(),
                id_synthesized: false,
                fields: BTreeMap::new(),
                validation: ValidationState::Valid,
            },
        ];
        let sink = sink();
        let query = sink.upsert_query(&records);
        let sql = query.sql();

        assert!(sql.starts_with("INSERT INTO sales_data (id, id_synthesized, name, amount) VALUES"));
        assert!(sql.contains("($1, $2, $3, $4), ($5, $6, $7, $8)"));
        assert!(sql.contains("ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, amount = EXCLUDED.amount"));
        assert!(sql.ends_with("RETURNING (xmax = 0) AS inserted"));
    }

    #[test]
    fn test_classify_sqlstate() {
        assert_eq!(
            classify_sqlstate("23505"),
            (SinkErrorKind::Permanent, FailureCause::ConstraintViolation)
        );
        assert_eq!(
            classify_sqlstate("22003"),
            (SinkErrorKind::Permanent, FailureCause::DataException)
        );
        assert_eq!(
            classify_sqlstate("42P01"),
            (SinkErrorKind::Permanent, FailureCause::SchemaMismatch)
        );
        assert_eq!(
            classify_sqlstate("08006"),
            (SinkErrorKind::Transient, FailureCause::Connectivity)
        );
        assert_eq!(
            classify_sqlstate("40P01"),
            (SinkErrorKind::Transient, FailureCause::Concurrency)
        );
        assert_eq!(
            classify_sqlstate("53300"),
            (SinkErrorKind::Transient, FailureCause::ResourceExhausted)
        );
        assert_eq!(classify_sqlstate("XX000"), (SinkErrorKind::Permanent, FailureCause::Other));
    }

    #[test]
    fn test_classify_pool_errors() {
        let err = classify(&sqlx::Error::PoolTimedOut);
        assert_eq!(err.kind, SinkErrorKind::Transient);
        assert_eq!(err.cause, FailureCause::Connectivity);

        let err = classify(&sqlx::Error::RowNotFound);
        assert_eq!(err.kind, SinkErrorKind::Permanent);
    }
}
