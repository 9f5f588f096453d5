use std::path::Path;
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

use crate::config::DatabaseConfig;
use crate::error::{QmsError, Result};

/// Pooled SQLite handle shared across repositories.
///
/// `with_connection` hands out a pooled connection for reads and simple
/// writes; `with_transaction` opens a `BEGIN IMMEDIATE` transaction, the
/// realized analogue of a row-level exclusive lock in a single-writer SQLite
/// deployment, for the multi-table atomic writes the lifecycle engine needs.
#[derive(Clone)]
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
}

impl Database {
    /// Open (or create) the database at `config.url` and initialize schema.
    pub fn new(config: &DatabaseConfig) -> Result<Self> {
        let manager = if config.url == ":memory:" {
            SqliteConnectionManager::memory()
        } else {
            if let Some(parent) = Path::new(&config.url).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| QmsError::FileSystem {
                        path: parent.display().to_string(),
                        message: format!("failed to create database directory: {e}"),
                    })?;
                }
            }
            SqliteConnectionManager::file(&config.url)
        };

        let wal_mode = config.wal_mode && config.url != ":memory:";
        let manager = manager.with_init(move |conn| {
            if wal_mode {
                conn.execute_batch("PRAGMA journal_mode=WAL;")?;
            }
            conn.execute_batch(
                "PRAGMA foreign_keys=ON; PRAGMA synchronous=FULL; PRAGMA secure_delete=ON;",
            )
        });

        let pool = Pool::builder()
            .max_size(config.max_connections)
            .connection_timeout(Duration::from_secs(30))
            .build(manager)
            .map_err(|e| QmsError::Database {
                message: format!("failed to build connection pool: {e}"),
            })?;

        let db = Self { pool };
        db.initialize_schema()?;
        Ok(db)
    }

    /// Open an in-memory database, for tests.
    pub fn in_memory() -> Result<Self> {
        Self::new(&DatabaseConfig {
            url: ":memory:".to_string(),
            max_connections: 1,
            wal_mode: false,
        })
    }

    /// Run `f` with a pooled connection.
    pub fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.pool.get()?;
        f(&conn)
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction, committing on `Ok`
    /// and rolling back on `Err`.
    pub fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction) -> Result<T>,
    {
        let mut conn = self.pool.get()?;
        let tx = conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
            .map_err(QmsError::from)?;
        let result = f(&tx)?;
        tx.commit().map_err(QmsError::from)?;
        Ok(result)
    }

    fn initialize_schema(&self) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS document_types (
                    code TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    number_prefix TEXT NOT NULL,
                    default_periodic_review_months INTEGER
                );

                CREATE TABLE IF NOT EXISTS document_sources (
                    code TEXT PRIMARY KEY,
                    name TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS documents (
                    id TEXT PRIMARY KEY,
                    document_number TEXT UNIQUE NOT NULL,
                    title TEXT NOT NULL,
                    description TEXT,
                    document_type TEXT NOT NULL,
                    source TEXT NOT NULL,
                    version_major INTEGER NOT NULL,
                    version_minor INTEGER NOT NULL,
                    family_key TEXT NOT NULL,
                    status TEXT NOT NULL,
                    effective_date TEXT,
                    obsolescence_date TEXT,
                    next_periodic_review_date TEXT,
                    author_id TEXT NOT NULL,
                    reviewer_id TEXT,
                    approver_id TEXT,
                    file_reference TEXT,
                    reason_for_change TEXT,
                    is_active INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_documents_family ON documents(family_key);
                CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(status);

                CREATE TABLE IF NOT EXISTS document_dependencies (
                    id TEXT PRIMARY KEY,
                    source_document_id TEXT NOT NULL,
                    target_document_id TEXT NOT NULL,
                    dependency_type TEXT NOT NULL,
                    is_critical INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    FOREIGN KEY (source_document_id) REFERENCES documents(id),
                    FOREIGN KEY (target_document_id) REFERENCES documents(id)
                );
                CREATE INDEX IF NOT EXISTS idx_deps_source ON document_dependencies(source_document_id);
                CREATE INDEX IF NOT EXISTS idx_deps_target ON document_dependencies(target_document_id);

                CREATE TABLE IF NOT EXISTS workflow_instances (
                    id TEXT PRIMARY KEY,
                    document_id TEXT NOT NULL,
                    workflow_type TEXT NOT NULL,
                    status TEXT NOT NULL,
                    initiated_by TEXT NOT NULL,
                    initiated_at TEXT NOT NULL,
                    completed_at TEXT,
                    due_at TEXT,
                    FOREIGN KEY (document_id) REFERENCES documents(id)
                );
                CREATE INDEX IF NOT EXISTS idx_workflow_document ON workflow_instances(document_id);
                CREATE INDEX IF NOT EXISTS idx_workflow_status ON workflow_instances(status);

                CREATE TABLE IF NOT EXISTS workflow_transitions (
                    id TEXT PRIMARY KEY,
                    workflow_instance_id TEXT NOT NULL,
                    from_state TEXT NOT NULL,
                    to_state TEXT NOT NULL,
                    actor_id TEXT NOT NULL,
                    comment TEXT,
                    occurred_at TEXT NOT NULL,
                    FOREIGN KEY (workflow_instance_id) REFERENCES workflow_instances(id)
                );
                CREATE INDEX IF NOT EXISTS idx_transitions_workflow ON workflow_transitions(workflow_instance_id);

                CREATE TABLE IF NOT EXISTS audit_entries (
                    id TEXT PRIMARY KEY,
                    sequence_number INTEGER NOT NULL,
                    timestamp TEXT NOT NULL,
                    actor_id TEXT NOT NULL,
                    action TEXT NOT NULL,
                    entity_type TEXT NOT NULL,
                    entity_id TEXT NOT NULL,
                    details TEXT,
                    session_id TEXT,
                    previous_checksum TEXT,
                    checksum TEXT NOT NULL
                );
                CREATE UNIQUE INDEX IF NOT EXISTS idx_audit_sequence ON audit_entries(sequence_number);
                CREATE INDEX IF NOT EXISTS idx_audit_entity ON audit_entries(entity_type, entity_id);

                CREATE TABLE IF NOT EXISTS periodic_reviews (
                    id TEXT PRIMARY KEY,
                    document_id TEXT NOT NULL,
                    due_date TEXT NOT NULL,
                    completed_at TEXT,
                    reviewer_id TEXT,
                    outcome TEXT,
                    comment TEXT,
                    FOREIGN KEY (document_id) REFERENCES documents(id)
                );
                CREATE INDEX IF NOT EXISTS idx_reviews_document ON periodic_reviews(document_id);
                CREATE INDEX IF NOT EXISTS idx_reviews_due ON periodic_reviews(due_date);

                CREATE TABLE IF NOT EXISTS scheduled_tasks (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    scheduled_time TEXT NOT NULL,
                    completed INTEGER NOT NULL DEFAULT 0,
                    result_status TEXT,
                    last_run_at TEXT,
                    total_run_count INTEGER NOT NULL DEFAULT 0
                );
                CREATE INDEX IF NOT EXISTS idx_tasks_name ON scheduled_tasks(name);

                CREATE TABLE IF NOT EXISTS users (
                    id TEXT PRIMARY KEY,
                    username TEXT UNIQUE NOT NULL,
                    display_name TEXT NOT NULL,
                    capabilities TEXT NOT NULL,
                    is_active INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL
                );
                ",
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_initialization() {
        let db = Database::in_memory();
        assert!(db.is_ok());
    }

    #[test]
    fn test_with_connection_queries_schema() {
        let db = Database::in_memory().unwrap();
        let count: i64 = db
            .with_connection(|conn| {
                conn.query_row(
                    "SELECT count(*) FROM sqlite_master WHERE type='table'",
                    [],
                    |row| row.get(0),
                )
                .map_err(QmsError::from)
            })
            .unwrap();
        assert!(count >= 10);
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = Database::in_memory().unwrap();
        let result: Result<()> = db.with_transaction(|tx| {
            tx.execute(
                "INSERT INTO users (id, username, display_name, capabilities, created_at) VALUES ('u1','bob','Bob','read', '2024-01-01T00:00:00Z')",
                [],
            )
            .map_err(QmsError::from)?;
            Err(QmsError::Internal {
                message: "forced rollback".to_string(),
            })
        });
        assert!(result.is_err());

        let count: i64 = db
            .with_connection(|conn| {
                conn.query_row("SELECT count(*) FROM users", [], |row| row.get(0))
                    .map_err(QmsError::from)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_clone_shares_pool() {
        let db = Database::in_memory().unwrap();
        let db2 = db.clone();
        db.with_connection(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, display_name, capabilities, created_at) VALUES ('u1','bob','Bob','read', '2024-01-01T00:00:00Z')",
                [],
            )
            .map_err(QmsError::from)
        })
        .unwrap();
        let count: i64 = db2
            .with_connection(|conn| {
                conn.query_row("SELECT count(*) FROM users", [], |row| row.get(0))
                    .map_err(QmsError::from)
            })
            .unwrap();
        assert_eq!(count, 1);
    }
}
