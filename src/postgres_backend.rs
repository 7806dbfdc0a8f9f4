//! PostgreSQL backend for the durable L3 tier

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{Connection, PgConnection, Row};
use tracing::{debug, info, warn};

use crate::error::CacheError;
use crate::pool::ConnectionManager;
use crate::record::now_ms;
use crate::remote_tier::RecordBackend;

pub const DEFAULT_TABLE: &str = "auth_cache_entries";

/// One row per cached user:
///
/// ```sql
/// cache_key     TEXT PRIMARY KEY
/// payload       BYTEA NOT NULL
/// expires_at_ms BIGINT NOT NULL
/// ```
pub struct PostgresBackend {
    url: String,
    table: String,
    schema_ready: AtomicBool,
}

fn valid_table_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl PostgresBackend {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            table: DEFAULT_TABLE.to_owned(),
            schema_ready: AtomicBool::new(false),
        }
    }

    /// Use a different table; the name is interpolated into SQL so only
    /// plain identifiers are accepted
    pub fn with_table(mut self, table: impl Into<String>) -> Result<Self, CacheError> {
        let table = table.into();
        if !valid_table_name(&table) {
            return Err(CacheError::Backend(
                format!("invalid L3 table name: {table:?}").into(),
            ));
        }
        self.table = table;
        Ok(self)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the cache table and its expiry index if missing
    pub async fn ensure_schema(&self, conn: &mut PgConnection) -> Result<(), CacheError> {
        let create = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                cache_key TEXT PRIMARY KEY,
                payload BYTEA NOT NULL,
                expires_at_ms BIGINT NOT NULL
            )",
            self.table
        );
        sqlx::query(&create).execute(&mut *conn).await?;

        let index = format!(
            "CREATE INDEX IF NOT EXISTS {table}_expires_idx ON {table} (expires_at_ms)",
            table = self.table
        );
        sqlx::query(&index).execute(&mut *conn).await?;

        info!("L3 (PostgreSQL) schema ready in table {}", self.table);
        Ok(())
    }
}

#[async_trait]
impl ConnectionManager for PostgresBackend {
    type Connection = PgConnection;

    fn name(&self) -> &str {
        "postgres"
    }

    async fn connect(&self) -> Result<PgConnection, CacheError> {
        let mut conn = PgConnection::connect(&self.url).await?;
        if !self.schema_ready.load(Ordering::SeqCst) {
            self.ensure_schema(&mut conn).await?;
            self.schema_ready.store(true, Ordering::SeqCst);
        }
        Ok(conn)
    }

    async fn ping(&self, conn: &mut PgConnection) -> Result<(), CacheError> {
        conn.ping().await?;
        Ok(())
    }
}

#[async_trait]
impl RecordBackend for PostgresBackend {
    async fn fetch(
        &self,
        conn: &mut PgConnection,
        key: &str,
    ) -> Result<Option<Vec<u8>>, CacheError> {
        let sql = format!(
            "SELECT payload FROM {} WHERE cache_key = $1 AND expires_at_ms > $2",
            self.table
        );
        let row = sqlx::query(&sql)
            .bind(key)
            .bind(now_ms())
            .fetch_optional(&mut *conn)
            .await
            .inspect_err(|e| warn!("L3 (PostgreSQL) SELECT error for key {}: {}", key, e))?;

        match row {
            Some(row) => Ok(Some(row.try_get::<Vec<u8>, _>("payload")?)),
            None => Ok(None),
        }
    }

    async fn store(
        &self,
        conn: &mut PgConnection,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let sql = format!(
            r#"
            INSERT INTO {} (cache_key, payload, expires_at_ms)
            VALUES ($1, $2, $3)
            ON CONFLICT (cache_key)
            DO UPDATE SET payload = EXCLUDED.payload, expires_at_ms = EXCLUDED.expires_at_ms
            "#,
            self.table
        );
        sqlx::query(&sql)
            .bind(key)
            .bind(value)
            .bind(now_ms().saturating_add(ttl_ms))
            .execute(&mut *conn)
            .await
            .inspect_err(|e| warn!("L3 (PostgreSQL) UPSERT error for key {}: {}", key, e))?;
        Ok(())
    }

    async fn delete(&self, conn: &mut PgConnection, key: &str) -> Result<(), CacheError> {
        let sql = format!("DELETE FROM {} WHERE cache_key = $1", self.table);
        sqlx::query(&sql)
            .bind(key)
            .execute(&mut *conn)
            .await
            .inspect_err(|e| warn!("L3 (PostgreSQL) DELETE error for key {}: {}", key, e))?;
        Ok(())
    }

    async fn purge_expired(&self, conn: &mut PgConnection) -> Result<u64, CacheError> {
        let sql = format!("DELETE FROM {} WHERE expires_at_ms <= $1", self.table);
        let deleted = sqlx::query(&sql)
            .bind(now_ms())
            .execute(&mut *conn)
            .await?
            .rows_affected();
        debug!("L3 (PostgreSQL) purged {} expired rows", deleted);
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name_validation() {
        let backend = PostgresBackend::new("postgres://localhost/auth");
        assert_eq!(backend.table(), DEFAULT_TABLE);

        assert!(
            PostgresBackend::new("postgres://localhost/auth")
                .with_table("auth_cache_v2")
                .is_ok()
        );
        for bad in ["", "1users", "users; DROP TABLE x", "a-b", "\"quoted\""] {
            assert!(
                PostgresBackend::new("postgres://localhost/auth")
                    .with_table(bad)
                    .is_err(),
                "{bad:?} should be rejected"
            );
        }
    }
}
