//! Bulk batch writer for PostgreSQL.
//!
//! One batch becomes one multi-row `INSERT` inside one transaction:
//! either every record commits or none do. Deduplication on redelivery
//! is the store's job: the `ON CONFLICT DO NOTHING` clause leans on the
//! unique `(device_id, recorded_at)` index from `schema.sql`.

use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{debug, info};

use siphon_core::config::PostgresConfig;
use siphon_core::{Batch, Record};

use crate::error::{classify, StorageError};

/// Well-known measurement fields mapped to table columns. Records may
/// carry more fields; only these are persisted.
const MEASUREMENT_COLUMNS: &[&str] = &["temperature", "humidity"];

/// PostgreSQL-backed storage writer.
pub struct PgWriter {
    pool: PgPool,
    table: String,
}

fn build_insert<'a>(table: &str, records: &'a [Record]) -> QueryBuilder<'a, Postgres> {
    let mut qb = QueryBuilder::new(format!(
        "INSERT INTO {} (device_id, recorded_at, temperature, humidity) ",
        table
    ));
    qb.push_values(records, |mut row, record| {
        row.push_bind(&record.device_id).push_bind(record.timestamp);
        for column in MEASUREMENT_COLUMNS {
            row.push_bind(record.number(column));
        }
    });
    qb.push(" ON CONFLICT (device_id, recorded_at) DO NOTHING");
    qb
}

impl PgWriter {
    /// Open a connection pool. A failure here is transient; the caller
    /// retries on the reconnect cadence.
    pub async fn connect(cfg: &PostgresConfig) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_connections)
            .connect(&cfg.connection_string())
            .await
            .map_err(classify)?;

        info!(
            host = %cfg.host,
            database = %cfg.database,
            table = %cfg.table,
            max_connections = cfg.max_connections,
            "postgres writer connected"
        );

        Ok(Self {
            pool,
            table: cfg.table.clone(),
        })
    }

    /// Commit one batch, all-or-nothing. Returns rows actually inserted
    /// (redelivered duplicates are absorbed by the conflict clause and
    /// not counted).
    pub async fn write(&self, batch: &Batch) -> Result<u64, StorageError> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await.map_err(classify)?;
        let result = build_insert(&self.table, batch.records())
            .build()
            .execute(&mut *tx)
            .await
            .map_err(classify)?;
        tx.commit().await.map_err(classify)?;

        debug!(
            records = batch.len(),
            inserted = result.rows_affected(),
            "batch committed"
        );
        Ok(result.rows_affected())
    }

    /// Close the pool, waiting for in-flight connections to finish.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
