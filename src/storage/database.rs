//! SQLite-backed run record store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use super::migrations::MigrationRunner;
use super::schema;
use super::{RunRecordSink, StorageError, TaskRunRecord};
use crate::plan::TaskStatus;

/// Run records in a SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteRunStore {
    pool: SqlitePool,
}

impl SqliteRunStore {
    /// Connect to `database_url` (for example `sqlite://runs.db`) and migrate.
    ///
    /// The database file is created if missing. In-memory databases use a
    /// single connection so every query sees the same data.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    /// Open (or create) the database file at `path` and migrate.
    pub async fn open(path: &Path) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool and migrate.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StorageError> {
        MigrationRunner::new(pool.clone()).run_migrations().await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Records of one plan in insertion order. For reporting tools.
    pub async fn records_for_plan(&self, plan_id: Uuid) -> Result<Vec<TaskRunRecord>, StorageError> {
        let rows = sqlx::query(schema::SELECT_TASK_RUNS_FOR_PLAN)
            .bind(plan_id.to_string())
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<TaskRunRecord, StorageError> {
                let plan_id: String = row.try_get("plan_id")?;
                let status: String = row.try_get("status")?;
                let started_at: String = row.try_get("started_at")?;
                let completed_at: String = row.try_get("completed_at")?;
                Ok(TaskRunRecord {
                    plan_id: Uuid::parse_str(&plan_id)
                        .map_err(|e| StorageError::InvalidRecord(format!("plan_id: {}", e)))?,
                    task_id: row.try_get("task_id")?,
                    capability: row.try_get("capability")?,
                    operation: row.try_get("operation")?,
                    status: parse_status(&status)?,
                    started_at: parse_timestamp(&started_at)?,
                    completed_at: parse_timestamp(&completed_at)?,
                    error: row.try_get("error")?,
                })
            })
            .collect()
    }

    /// Number of stored records.
    pub async fn count(&self) -> Result<i64, StorageError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM task_runs")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

fn parse_status(raw: &str) -> Result<TaskStatus, StorageError> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|_| StorageError::InvalidRecord(format!("unknown status '{}'", raw)))
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::InvalidRecord(format!("timestamp '{}': {}", raw, e)))
}

#[async_trait]
impl RunRecordSink for SqliteRunStore {
    async fn append(&self, record: &TaskRunRecord) -> Result<(), StorageError> {
        sqlx::query(schema::INSERT_TASK_RUN)
            .bind(record.plan_id.to_string())
            .bind(&record.task_id)
            .bind(&record.capability)
            .bind(&record.operation)
            .bind(record.status.to_string())
            .bind(record.started_at.to_rfc3339())
            .bind(record.completed_at.to_rfc3339())
            .bind(record.error.as_deref())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(plan_id: Uuid, task_id: &str, status: TaskStatus, error: Option<&str>) -> TaskRunRecord {
        let now = Utc::now();
        TaskRunRecord {
            plan_id,
            task_id: task_id.to_string(),
            capability: "citation-lookup".to_string(),
            operation: "lookup".to_string(),
            status,
            started_at: now,
            completed_at: now + chrono::Duration::milliseconds(40),
            error: error.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_append_and_query_by_plan() {
        let store = SqliteRunStore::connect("sqlite::memory:").await.unwrap();
        let plan = Uuid::new_v4();
        let other = Uuid::new_v4();

        let first = record(plan, "a", TaskStatus::Succeeded, None);
        let second = record(plan, "b", TaskStatus::Failed, Some("Upstream task 'a' failed"));
        store.append(&first).await.unwrap();
        store.append(&record(other, "x", TaskStatus::Succeeded, None)).await.unwrap();
        store.append(&second).await.unwrap();

        let records = store.records_for_plan(plan).await.unwrap();
        assert_eq!(records, vec![first, second]);
        assert_eq!(store.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_open_file_database_twice() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.db");
        let plan = Uuid::new_v4();

        {
            let store = SqliteRunStore::open(&path).await.unwrap();
            store.append(&record(plan, "a", TaskStatus::Succeeded, None)).await.unwrap();
        }
        let reopened = SqliteRunStore::open(&path).await.unwrap();
        assert_eq!(reopened.records_for_plan(plan).await.unwrap().len(), 1);
    }
}
