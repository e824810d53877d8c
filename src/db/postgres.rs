//! PostgreSQL / PostGIS 执行器（feature = "postgres"）

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgDatabaseError, PgPoolOptions};
use sqlx::PgPool;
use tracing::{info, warn};

use crate::core::Record;
use crate::db::{DbError, SchemaProvider, SqlExecutor};

const WRAP_PREFIX: &str = "SELECT to_jsonb(t) AS row FROM (";

/// 建立连接池
pub async fn connect_pool(url: &str, max_connections: u32, acquire_timeout: Duration) -> Result<PgPool, DbError> {
    info!(url = %mask_database_url(url), "connecting to database");
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(acquire_timeout)
        .connect(url)
        .await
        .map_err(|e| {
            warn!(error = %e, "failed to connect to database");
            map_sqlx_error(e)
        })
}

fn mask_database_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => format!("{}://***{}", &url[..scheme], &url[at..]),
        _ => url.to_string(),
    }
}

/// 把任意 SELECT 包装为逐行 jsonb，避免按列类型解码
pub struct PgExecutor {
    pool: PgPool,
}

impl PgExecutor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn wrap(sql: &str) -> String {
        let inner = sql.trim().trim_end_matches(';').trim_end();
        format!("{WRAP_PREFIX}{inner}\n) AS t")
    }
}

#[async_trait]
impl SqlExecutor for PgExecutor {
    async fn execute(&self, sql: &str) -> Result<Vec<Record>, DbError> {
        let wrapped = Self::wrap(sql);
        let rows: Vec<Value> = sqlx::query_scalar(&wrapped)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(rows
            .into_iter()
            .filter_map(|v| match v {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect())
    }
}

fn map_sqlx_error(err: sqlx::Error) -> DbError {
    match err {
        sqlx::Error::Database(db) => {
            let mut out = DbError::new(db.message().to_string());
            if let Some(code) = db.code() {
                out = out.with_sqlstate(code.into_owned());
            }
            if let Some(pg) = db.try_downcast_ref::<PgDatabaseError>() {
                if let Some(sqlx::postgres::PgErrorPosition::Original(pos)) = pg.position() {
                    // 位置相对于用户 SQL，扣除包装前缀
                    if let Some(p) = pos.checked_sub(WRAP_PREFIX.chars().count()) {
                        out = out.with_position(p);
                    }
                }
            }
            if out.sqlstate.as_deref() == Some("57014") {
                out.timed_out = true;
            }
            out
        }
        sqlx::Error::PoolTimedOut => DbError::new("timeout connecting to database: pool timed out"),
        sqlx::Error::Io(e) => DbError::new(format!("connection failed: {e}")),
        sqlx::Error::PoolClosed => DbError::new("connection failed: pool closed"),
        other => DbError::new(other.to_string()),
    }
}

/// 从 information_schema 与 geometry_columns 生成 Schema 描述
pub struct PgSchemaProvider {
    pool: PgPool,
}

impl PgSchemaProvider {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SchemaProvider for PgSchemaProvider {
    async fn fetch_schema(&self) -> Result<String, DbError> {
        let columns: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT table_name::text, column_name::text, data_type::text \
             FROM information_schema.columns \
             WHERE table_schema = 'public' \
             ORDER BY table_name, ordinal_position",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let geometry: Vec<(String, String, String, i32)> = sqlx::query_as(
            "SELECT f_table_name::text, f_geometry_column::text, type::text, srid \
             FROM geometry_columns WHERE f_table_schema = 'public'",
        )
        .fetch_all(&self.pool)
        .await
        .unwrap_or_else(|e| {
            warn!(error = %e, "geometry_columns unavailable");
            Vec::new()
        });

        let mut lines: Vec<(String, Vec<String>)> = Vec::new();
        for (table, column, data_type) in columns {
            let geo = geometry
                .iter()
                .find(|(t, c, _, _)| *t == table && *c == column)
                .map(|(_, _, ty, srid)| format!("({ty}, {srid})"))
                .unwrap_or_default();
            let item = format!("{column} {data_type}{geo}");
            match lines.last_mut() {
                Some((current, items)) if *current == table => items.push(item),
                _ => lines.push((table, vec![item])),
            }
        }
        Ok(lines
            .into_iter()
            .map(|(table, items)| format!("表 {table}: {}", items.join(", ")))
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_strips_semicolon() {
        let wrapped = PgExecutor::wrap("SELECT name FROM a_sight;  ");
        assert!(wrapped.starts_with(WRAP_PREFIX));
        assert!(wrapped.contains("SELECT name FROM a_sight\n) AS t"));
    }

    #[test]
    fn test_mask_url() {
        assert_eq!(
            mask_database_url("postgres://user:pw@localhost/db"),
            "postgres://***@localhost/db"
        );
    }
}
