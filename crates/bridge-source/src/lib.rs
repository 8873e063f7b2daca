//! Relational source of truth: one parameterized read per sync job, plus
//! the synced-flag bookkeeping the verifier gates.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bridge_core::{CanonicalKey, JobSpec, SourceRow};
use chrono::{NaiveDate, NaiveDateTime};
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{Column, Row, TypeInfo};
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "bridge-source";

/// Which slice of the source the run wants: everything, or only rows whose
/// synced flag is still unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchScope {
    All,
    Unsynced,
}

/// Fills the `{where_clause}` placeholder of a job query for the given scope.
pub fn render_query(job: &JobSpec, scope: FetchScope) -> Result<String> {
    let where_clause = match scope {
        FetchScope::All => String::new(),
        FetchScope::Unsynced => match &job.unsynced_filter {
            Some(filter) => format!("WHERE {filter}"),
            None => bail!("job `{}` has no unsynced_filter; run it in full mode", job.job_id),
        },
    };
    Ok(job.query.replace("{where_clause}", &where_clause))
}

#[async_trait]
pub trait SourceRepository: Send + Sync {
    async fn fetch_rows(&self, job: &JobSpec, scope: FetchScope) -> Result<Vec<SourceRow>>;

    /// Sets the source-side synced flag. Returns false when the job does not
    /// track one.
    async fn mark_synced(&self, job: &JobSpec, key: &CanonicalKey) -> Result<bool>;

    async fn reset_synced(&self, job: &JobSpec, key: &CanonicalKey) -> Result<bool>;
}

#[derive(Debug, Clone)]
pub struct MySqlSourceRepository {
    pool: MySqlPool,
}

impl MySqlSourceRepository {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await
            .context("connecting to source database")?;
        Ok(Self { pool })
    }

    async fn set_flag(&self, sql: &str, key: &CanonicalKey) -> Result<()> {
        let mut query = sqlx::query(sql);
        for part in key.parts() {
            query = query.bind(part.as_str());
        }
        let result = query
            .execute(&self.pool)
            .await
            .with_context(|| format!("updating synced flag for key {key}"))?;
        debug!(%key, rows = result.rows_affected(), "synced flag updated");
        Ok(())
    }
}

#[async_trait]
impl SourceRepository for MySqlSourceRepository {
    async fn fetch_rows(&self, job: &JobSpec, scope: FetchScope) -> Result<Vec<SourceRow>> {
        let sql = render_query(job, scope)?;
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("running source query for job `{}`", job.job_id))?;
        debug!(job = %job.job_id, rows = rows.len(), "fetched source rows");
        Ok(rows.iter().map(row_to_source_row).collect())
    }

    async fn mark_synced(&self, job: &JobSpec, key: &CanonicalKey) -> Result<bool> {
        match &job.sync_flag {
            Some(flag) => {
                self.set_flag(&flag.mark_sql, key).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn reset_synced(&self, job: &JobSpec, key: &CanonicalKey) -> Result<bool> {
        match &job.sync_flag {
            Some(flag) => {
                self.set_flag(&flag.reset_sql, key).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

fn row_to_source_row(row: &MySqlRow) -> SourceRow {
    let mut out = SourceRow::new();
    for (idx, column) in row.columns().iter().enumerate() {
        out.insert(column.name().to_string(), column_value(row, idx));
    }
    out
}

/// Decodes one cell into a JSON scalar by column type; the extraction layer
/// in bridge-core handles all further normalization.
fn column_value(row: &MySqlRow, idx: usize) -> JsonValue {
    let column = &row.columns()[idx];
    let type_name = column.type_info().name();
    match type_name {
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => row
            .try_get::<Option<i64>, _>(idx)
            .ok()
            .flatten()
            .map(JsonValue::from)
            .unwrap_or(JsonValue::Null),
        "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED" | "INT UNSIGNED"
        | "BIGINT UNSIGNED" => row
            .try_get::<Option<u64>, _>(idx)
            .ok()
            .flatten()
            .map(JsonValue::from)
            .unwrap_or(JsonValue::Null),
        "FLOAT" | "DOUBLE" => row
            .try_get::<Option<f64>, _>(idx)
            .ok()
            .flatten()
            .and_then(|n| serde_json::Number::from_f64(n).map(JsonValue::Number))
            .unwrap_or(JsonValue::Null),
        "BOOLEAN" => row
            .try_get::<Option<bool>, _>(idx)
            .ok()
            .flatten()
            .map(JsonValue::from)
            .unwrap_or(JsonValue::Null),
        "DATE" => row
            .try_get::<Option<NaiveDate>, _>(idx)
            .ok()
            .flatten()
            .map(|d| JsonValue::String(d.to_string()))
            .unwrap_or(JsonValue::Null),
        "DATETIME" | "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(idx)
            .ok()
            .flatten()
            .map(|dt| JsonValue::String(dt.format("%Y-%m-%d %H:%M:%S").to_string()))
            .unwrap_or(JsonValue::Null),
        _ => match row.try_get::<Option<String>, _>(idx) {
            Ok(Some(s)) => JsonValue::String(s),
            Ok(None) => JsonValue::Null,
            Err(_) => {
                warn!(column = column.name(), type_name, "undecodable column, treating as NULL");
                JsonValue::Null
            }
        },
    }
}
