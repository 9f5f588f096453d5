use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::database::Database;
use crate::error::{QmsError, Result};

/// A scheduler-visible record of one task's most recent run, persisted so
/// the scheduler survives restarts without re-running or double-counting
/// a task that already fired (spec §9's relational storage resolution).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: Uuid,
    pub name: String,
    pub scheduled_time: DateTime<Utc>,
    pub completed: bool,
    pub result_status: Option<String>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub total_run_count: u64,
}

fn row_to_task(row: &Row) -> rusqlite::Result<ScheduledTask> {
    let id: String = row.get("id")?;
    let scheduled_time: String = row.get("scheduled_time")?;
    let last_run_at: Option<String> = row.get("last_run_at")?;

    Ok(ScheduledTask {
        id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::nil()),
        name: row.get("name")?,
        scheduled_time: DateTime::parse_from_rfc3339(&scheduled_time)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        completed: row.get::<_, i64>("completed")? != 0,
        result_status: row.get("result_status")?,
        last_run_at: last_run_at.and_then(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|d| d.with_timezone(&Utc))
                .ok()
        }),
        total_run_count: row.get::<_, i64>("total_run_count")? as u64,
    })
}

pub struct ScheduledTaskRepo<'a> {
    db: &'a Database,
}

impl<'a> ScheduledTaskRepo<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn insert(&self, task: &ScheduledTask) -> Result<()> {
        self.db.with_connection(|conn| {
            conn.execute(
                "INSERT INTO scheduled_tasks (
                    id, name, scheduled_time, completed, result_status, last_run_at, total_run_count
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    task.id.to_string(),
                    task.name,
                    task.scheduled_time.to_rfc3339(),
                    task.completed as i64,
                    task.result_status,
                    task.last_run_at.map(|d| d.to_rfc3339()),
                    task.total_run_count as i64,
                ],
            )?;
            Ok(())
        })
    }

    /// Record that `name` ran just now with `result_status`, bumping its
    /// run counter regardless of outcome.
    pub fn record_run(&self, name: &str, result_status: &str) -> Result<()> {
        self.db.with_connection(|conn| {
            let now = Utc::now().to_rfc3339();
            let updated = conn.execute(
                "UPDATE scheduled_tasks
                 SET completed = 1, result_status = ?1, last_run_at = ?2,
                     total_run_count = total_run_count + 1
                 WHERE name = ?3",
                params![result_status, now, name],
            )?;
            if updated == 0 {
                conn.execute(
                    "INSERT INTO scheduled_tasks (
                        id, name, scheduled_time, completed, result_status, last_run_at, total_run_count
                    ) VALUES (?1, ?2, ?3, 1, ?4, ?5, 1)",
                    params![
                        Uuid::new_v4().to_string(),
                        name,
                        now.clone(),
                        result_status,
                        now,
                    ],
                )?;
            }
            Ok(())
        })
    }

    pub fn get_by_name(&self, name: &str) -> Result<Option<ScheduledTask>> {
        self.db.with_connection(|conn| {
            conn.query_row(
                "SELECT * FROM scheduled_tasks WHERE name = ?1 ORDER BY last_run_at DESC LIMIT 1",
                params![name],
                row_to_task,
            )
            .optional()
            .map_err(QmsError::from)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_run_inserts_when_missing() {
        let db = Database::in_memory().unwrap();
        let repo = ScheduledTaskRepo::new(&db);
        repo.record_run("process-effective-dates", "SUCCESS").unwrap();

        let task = repo.get_by_name("process-effective-dates").unwrap().unwrap();
        assert_eq!(task.total_run_count, 1);
        assert_eq!(task.result_status.as_deref(), Some("SUCCESS"));
    }

    #[test]
    fn test_record_run_increments_existing() {
        let db = Database::in_memory().unwrap();
        let repo = ScheduledTaskRepo::new(&db);
        repo.record_run("daily-integrity-check", "SUCCESS").unwrap();
        repo.record_run("daily-integrity-check", "SUCCESS").unwrap();

        let task = repo.get_by_name("daily-integrity-check").unwrap().unwrap();
        assert_eq!(task.total_run_count, 2);
    }
}
