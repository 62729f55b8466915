//! Append-only run records.
//!
//! The orchestrator emits one [`TaskRunRecord`] per task that reaches a
//! terminal state. Sinks are write-only from the orchestrator's side; the
//! records are consumed by external reporting.
//!
//! Three sinks are provided:
//! - [`InMemoryRunSink`]: keeps records in memory
//! - [`JsonlRunSink`]: appends one JSON object per line to a file
//! - [`SqliteRunStore`]: inserts into a SQLite database (schema managed by [`MigrationRunner`])
//!
//! [`MultiSink`] fans one record out to several sinks.

pub mod database;
pub mod jsonl;
pub mod migrations;
pub mod schema;

pub use database::SqliteRunStore;
pub use jsonl::JsonlRunSink;
pub use migrations::{AppliedMigration, MigrationError, MigrationRunner};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

use crate::orchestrator::TaskOutcome;
use crate::plan::TaskStatus;

/// Errors raised by run-record sinks.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    #[error("Invalid stored record: {0}")]
    InvalidRecord(String),
}

/// One executed (or skipped) task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRunRecord {
    pub plan_id: Uuid,
    pub task_id: String,
    pub capability: String,
    pub operation: String,
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskRunRecord {
    pub fn from_outcome(plan_id: Uuid, outcome: &TaskOutcome) -> Self {
        Self {
            plan_id,
            task_id: outcome.task_id.clone(),
            capability: outcome.capability.clone(),
            operation: outcome.operation.clone(),
            status: outcome.status,
            started_at: outcome.started_at,
            completed_at: outcome.completed_at,
            error: outcome.error.as_ref().map(ToString::to_string),
        }
    }

    /// Whether this record's run interval overlaps `other`'s.
    pub fn overlaps(&self, other: &TaskRunRecord) -> bool {
        self.started_at < other.completed_at && other.started_at < self.completed_at
    }
}

/// Destination for run records.
#[async_trait]
pub trait RunRecordSink: Send + Sync {
    async fn append(&self, record: &TaskRunRecord) -> Result<(), StorageError>;
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct InMemoryRunSink {
    records: Mutex<Vec<TaskRunRecord>>,
}

impl InMemoryRunSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records appended so far, in append order.
    pub fn records(&self) -> Vec<TaskRunRecord> {
        self.records
            .lock()
            .expect("run sink lock poisoned")
            .clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("run sink lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RunRecordSink for InMemoryRunSink {
    async fn append(&self, record: &TaskRunRecord) -> Result<(), StorageError> {
        self.records
            .lock()
            .expect("run sink lock poisoned")
            .push(record.clone());
        Ok(())
    }
}

/// Appends to every inner sink; the first error is returned after all were tried.
#[derive(Default, Clone)]
pub struct MultiSink {
    sinks: Vec<Arc<dyn RunRecordSink>>,
}

impl MultiSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn RunRecordSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl RunRecordSink for MultiSink {
    async fn append(&self, record: &TaskRunRecord) -> Result<(), StorageError> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.append(record).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
