//! SQLite schema for run records.

/// Task run records, one row per terminal task.
pub const CREATE_TASK_RUNS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS task_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    plan_id TEXT NOT NULL,
    task_id TEXT NOT NULL,
    capability TEXT NOT NULL,
    operation TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT NOT NULL,
    error TEXT,
    recorded_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
)
"#;

pub const CREATE_TASK_RUNS_PLAN_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_task_runs_plan ON task_runs(plan_id)";

pub const CREATE_TASK_RUNS_CAPABILITY_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_task_runs_capability ON task_runs(capability, status)";

pub const INSERT_TASK_RUN: &str = r#"
INSERT INTO task_runs (plan_id, task_id, capability, operation, status, started_at, completed_at, error)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
"#;

pub const SELECT_TASK_RUNS_FOR_PLAN: &str = r#"
SELECT plan_id, task_id, capability, operation, status, started_at, completed_at, error
FROM task_runs
WHERE plan_id = ?1
ORDER BY id
"#;

/// Schema statements in application order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_TASK_RUNS_TABLE,
        CREATE_TASK_RUNS_PLAN_INDEX,
        CREATE_TASK_RUNS_CAPABILITY_INDEX,
    ]
}
