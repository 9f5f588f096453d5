use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::database::Database;
use crate::error::{QmsError, Result};

/// The kind of workflow instance driving a document between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowType {
    Review,
    Approval,
    UpVersion,
    Obsolescence,
    Termination,
    PeriodicReview,
}

impl WorkflowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowType::Review => "REVIEW",
            WorkflowType::Approval => "APPROVAL",
            WorkflowType::UpVersion => "UP_VERSION",
            WorkflowType::Obsolescence => "OBSOLESCENCE",
            WorkflowType::Termination => "TERMINATION",
            WorkflowType::PeriodicReview => "PERIODIC_REVIEW",
        }
    }

    pub fn from_str(value: &str) -> Result<Self> {
        match value {
            "REVIEW" => Ok(WorkflowType::Review),
            "APPROVAL" => Ok(WorkflowType::Approval),
            "UP_VERSION" => Ok(WorkflowType::UpVersion),
            "OBSOLESCENCE" => Ok(WorkflowType::Obsolescence),
            "TERMINATION" => Ok(WorkflowType::Termination),
            "PERIODIC_REVIEW" => Ok(WorkflowType::PeriodicReview),
            other => Err(QmsError::Internal {
                message: format!("unknown workflow type: {other}"),
            }),
        }
    }
}

/// Status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowStatus {
    Open,
    Completed,
    Cancelled,
    TimedOut,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Open => "OPEN",
            WorkflowStatus::Completed => "COMPLETED",
            WorkflowStatus::Cancelled => "CANCELLED",
            WorkflowStatus::TimedOut => "TIMED_OUT",
        }
    }

    pub fn from_str(value: &str) -> Result<Self> {
        match value {
            "OPEN" => Ok(WorkflowStatus::Open),
            "COMPLETED" => Ok(WorkflowStatus::Completed),
            "CANCELLED" => Ok(WorkflowStatus::Cancelled),
            "TIMED_OUT" => Ok(WorkflowStatus::TimedOut),
            other => Err(QmsError::Internal {
                message: format!("unknown workflow status: {other}"),
            }),
        }
    }
}

/// A single workflow run (one review cycle, one approval cycle, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub document_id: Uuid,
    pub workflow_type: WorkflowType,
    pub status: WorkflowStatus,
    pub initiated_by: Uuid,
    pub initiated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub due_at: Option<DateTime<Utc>>,
}

/// One state change recorded against a workflow instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTransition {
    pub id: Uuid,
    pub workflow_instance_id: Uuid,
    pub from_state: String,
    pub to_state: String,
    pub actor_id: Uuid,
    pub comment: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

fn row_to_workflow(row: &Row) -> rusqlite::Result<WorkflowInstance> {
    let id: String = row.get("id")?;
    let document_id: String = row.get("document_id")?;
    let workflow_type: String = row.get("workflow_type")?;
    let status: String = row.get("status")?;
    let initiated_by: String = row.get("initiated_by")?;
    let initiated_at: String = row.get("initiated_at")?;
    let completed_at: Option<String> = row.get("completed_at")?;
    let due_at: Option<String> = row.get("due_at")?;

    Ok(WorkflowInstance {
        id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::nil()),
        document_id: Uuid::parse_str(&document_id).unwrap_or_else(|_| Uuid::nil()),
        workflow_type: WorkflowType::from_str(&workflow_type).unwrap_or(WorkflowType::Review),
        status: WorkflowStatus::from_str(&status).unwrap_or(WorkflowStatus::Open),
        initiated_by: Uuid::parse_str(&initiated_by).unwrap_or_else(|_| Uuid::nil()),
        initiated_at: DateTime::parse_from_rfc3339(&initiated_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        completed_at: completed_at.and_then(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|d| d.with_timezone(&Utc))
                .ok()
        }),
        due_at: due_at.and_then(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|d| d.with_timezone(&Utc))
                .ok()
        }),
    })
}

/// Repository for workflow instances and their transitions. Writes go
/// through `Database::with_transaction` so an instance create/advance and
/// its transition row land atomically, matching the rest of the engine.
pub struct WorkflowRepo<'a> {
    db: &'a Database,
}

impl<'a> WorkflowRepo<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn insert(&self, tx: &rusqlite::Transaction, wf: &WorkflowInstance) -> Result<()> {
        tx.execute(
            "INSERT INTO workflow_instances (
                id, document_id, workflow_type, status, initiated_by,
                initiated_at, completed_at, due_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                wf.id.to_string(),
                wf.document_id.to_string(),
                wf.workflow_type.as_str(),
                wf.status.as_str(),
                wf.initiated_by.to_string(),
                wf.initiated_at.to_rfc3339(),
                wf.completed_at.map(|d| d.to_rfc3339()),
                wf.due_at.map(|d| d.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn record_transition(
        &self,
        tx: &rusqlite::Transaction,
        transition: &WorkflowTransition,
    ) -> Result<()> {
        tx.execute(
            "INSERT INTO workflow_transitions (
                id, workflow_instance_id, from_state, to_state, actor_id, comment, occurred_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                transition.id.to_string(),
                transition.workflow_instance_id.to_string(),
                transition.from_state,
                transition.to_state,
                transition.actor_id.to_string(),
                transition.comment,
                transition.occurred_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn set_status(
        &self,
        tx: &rusqlite::Transaction,
        id: Uuid,
        status: WorkflowStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        tx.execute(
            "UPDATE workflow_instances SET status = ?1, completed_at = ?2 WHERE id = ?3",
            params![
                status.as_str(),
                completed_at.map(|d| d.to_rfc3339()),
                id.to_string(),
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Result<WorkflowInstance> {
        self.db.with_connection(|conn| {
            conn.query_row(
                "SELECT * FROM workflow_instances WHERE id = ?1",
                params![id.to_string()],
                row_to_workflow,
            )
            .optional()?
            .ok_or_else(|| QmsError::NotFound {
                kind: "WorkflowInstance".to_string(),
                id: id.to_string(),
            })
        })
    }

    pub fn open_for_document(&self, document_id: Uuid) -> Result<Vec<WorkflowInstance>> {
        self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM workflow_instances WHERE document_id = ?1 AND status = 'OPEN'",
            )?;
            let rows = stmt
                .query_map(params![document_id.to_string()], row_to_workflow)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Open workflow instances past their due time (SLA timeout candidates).
    pub fn overdue(&self, as_of: DateTime<Utc>) -> Result<Vec<WorkflowInstance>> {
        self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM workflow_instances
                 WHERE status = 'OPEN' AND due_at IS NOT NULL AND due_at < ?1",
            )?;
            let rows = stmt
                .query_map(params![as_of.to_rfc3339()], row_to_workflow)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }
}
