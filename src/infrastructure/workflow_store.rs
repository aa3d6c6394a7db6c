//! SQLite-backed `WorkflowStore` (§4.1, §6.3): durable snapshots plus an
//! append-only event log, so a restarted worker can replay a task's
//! history instead of depending solely on in-memory state.
//!
//! Connection/pool setup follows the teacher's
//! `adapters::sqlite::connection` (WAL journal mode, foreign keys on,
//! busy timeout); migrations follow `adapters::sqlite::migrations`'s
//! `Migrator`/`Migration` pair with `include_str!`-embedded SQL.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};

use crate::application::transform_workflow::{WorkflowEvent, WorkflowStore};
use crate::domain::error::{FleetliftError, StorageError};
use crate::domain::models::workflow::WorkflowInstance;

/// One versioned migration, applied at most once per database.
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: i64,
    pub description: String,
    pub sql: String,
}

/// Embedded migrations, in ascending version order.
pub fn all_embedded_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema".to_string(),
        sql: include_str!("../../migrations/001_initial_schema.sql").to_string(),
    }]
}

/// Applies embedded migrations against a pool, tracking applied versions
/// in a `schema_migrations` table.
pub struct Migrator {
    pool: SqlitePool,
}

impl Migrator {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn run_embedded_migrations(&self, migrations: Vec<Migration>) -> Result<usize, StorageError> {
        self.ensure_migrations_table().await?;
        let current_version = self.current_version().await?;
        let pending: Vec<_> = migrations.into_iter().filter(|m| m.version > current_version).collect();

        for migration in &pending {
            self.apply(migration).await?;
        }

        Ok(pending.len())
    }

    async fn ensure_migrations_table(&self) -> Result<(), StorageError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now')),
                description TEXT
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| migration_error("schema_migrations", e))?;
        Ok(())
    }

    async fn current_version(&self) -> Result<i64, StorageError> {
        let row = sqlx::query("SELECT COALESCE(MAX(version), 0) AS v FROM schema_migrations")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| migration_error("schema_migrations", e))?;
        Ok(row.get::<i64, _>("v"))
    }

    async fn apply(&self, migration: &Migration) -> Result<(), StorageError> {
        sqlx::raw_sql(&migration.sql)
            .execute(&self.pool)
            .await
            .map_err(|e| migration_error(&migration.description, e))?;

        sqlx::query("INSERT OR IGNORE INTO schema_migrations (version, description) VALUES (?, ?)")
            .bind(migration.version)
            .bind(&migration.description)
            .execute(&self.pool)
            .await
            .map_err(|e| migration_error(&migration.description, e))?;
        Ok(())
    }
}

fn migration_error(what: &str, source: sqlx::Error) -> StorageError {
    StorageError::WriteFailed {
        path: format!("migration:{what}"),
        reason: source.to_string(),
    }
}

/// Open (creating the parent directory and database file if needed) a
/// WAL-mode SQLite pool and run embedded migrations against it.
pub async fn open_pool(database_path: &str) -> Result<SqlitePool, StorageError> {
    ensure_parent_dir(database_path)?;

    let connect_options = SqliteConnectOptions::from_str(&format!("sqlite://{database_path}"))
        .map_err(|e| connect_error(database_path, e))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(connect_options)
        .await
        .map_err(|e| connect_error(database_path, e))?;

    Migrator::new(pool.clone())
        .run_embedded_migrations(all_embedded_migrations())
        .await?;

    Ok(pool)
}

fn connect_error(path: &str, source: sqlx::Error) -> StorageError {
    StorageError::WriteFailed {
        path: path.to_string(),
        reason: source.to_string(),
    }
}

fn ensure_parent_dir(database_path: &str) -> Result<(), StorageError> {
    if let Some(parent) = Path::new(database_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::WriteFailed {
                path: database_path.to_string(),
                reason: e.to_string(),
            })?;
        }
    }
    Ok(())
}

/// Reference `WorkflowStore` implementation backed by SQLite.
pub struct SqliteWorkflowStore {
    pool: SqlitePool,
}

impl SqliteWorkflowStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_path: &str) -> Result<Self, StorageError> {
        Ok(Self::new(open_pool(database_path).await?))
    }
}

#[async_trait]
impl WorkflowStore for SqliteWorkflowStore {
    async fn save(&self, instance: &WorkflowInstance, new_events: &[WorkflowEvent]) -> Result<(), FleetliftError> {
        let instance_json = serde_json::to_string(instance).map_err(|e| StorageError::WriteFailed {
            path: instance.task_id.clone(),
            reason: e.to_string(),
        })?;

        sqlx::query(
            "INSERT INTO workflow_instances (task_id, state, instance_json, started_at, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(task_id) DO UPDATE SET
                state = excluded.state,
                instance_json = excluded.instance_json,
                updated_at = excluded.updated_at",
        )
        .bind(&instance.task_id)
        .bind(format!("{:?}", instance.state))
        .bind(&instance_json)
        .bind(instance.started_at.to_rfc3339())
        .bind(instance.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| write_failed(&instance.task_id, e))?;

        let next_sequence: i64 = sqlx::query("SELECT COALESCE(MAX(sequence), -1) + 1 AS next FROM workflow_events WHERE task_id = ?")
            .bind(&instance.task_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| write_failed(&instance.task_id, e))?
            .get("next");

        for (offset, event) in new_events.iter().enumerate() {
            let event_json = serde_json::to_string(event).map_err(|e| StorageError::WriteFailed {
                path: instance.task_id.clone(),
                reason: e.to_string(),
            })?;
            sqlx::query(
                "INSERT INTO workflow_events (task_id, sequence, event_json, recorded_at) VALUES (?, ?, ?, ?)",
            )
            .bind(&instance.task_id)
            .bind(next_sequence + offset as i64)
            .bind(event_json)
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(|e| write_failed(&instance.task_id, e))?;
        }

        Ok(())
    }

    async fn load(&self, task_id: &str) -> Result<Option<WorkflowInstance>, FleetliftError> {
        let row = sqlx::query("SELECT instance_json FROM workflow_instances WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| read_failed(task_id, e))?;

        let Some(row) = row else { return Ok(None) };
        let instance_json: String = row.get("instance_json");
        let instance = serde_json::from_str(&instance_json).map_err(|e| StorageError::DecodeFailed {
            path: task_id.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Some(instance))
    }

    async fn load_events(&self, task_id: &str) -> Result<Vec<WorkflowEvent>, FleetliftError> {
        let rows = sqlx::query("SELECT event_json FROM workflow_events WHERE task_id = ? ORDER BY sequence ASC")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| read_failed(task_id, e))?;

        rows.into_iter()
            .map(|row| {
                let event_json: String = row.get("event_json");
                serde_json::from_str(&event_json).map_err(|e| {
                    FleetliftError::from(StorageError::DecodeFailed {
                        path: task_id.to_string(),
                        reason: e.to_string(),
                    })
                })
            })
            .collect()
    }
}

fn write_failed(task_id: &str, source: sqlx::Error) -> FleetliftError {
    StorageError::WriteFailed {
        path: task_id.to_string(),
        reason: source.to_string(),
    }
    .into()
}

fn read_failed(task_id: &str, source: sqlx::Error) -> FleetliftError {
    StorageError::ReadFailed {
        path: task_id.to_string(),
        reason: source.to_string(),
    }
    .into()
}
