use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::database::Database;
use crate::error::{QmsError, Result};

/// Closed set of actions the audit trail records. Every lifecycle
/// operation that mutates a document, workflow, dependency, or user
/// capability writes exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditAction {
    DocumentCreated,
    SubmittedForReview,
    ReviewAccepted,
    ReviewCompleted,
    ReviewRejected,
    RoutedForApproval,
    ApprovalAccepted,
    ApprovalGranted,
    ApprovalRejected,
    DocumentEffective,
    VersionWorkflowStarted,
    ObsolescenceScheduled,
    DocumentObsoleted,
    DocumentTerminated,
    DependencyAdded,
    SupersessionRecorded,
    SuperuserGranted,
    SuperuserRevoked,
    PeriodicReviewCompleted,
    DocumentSigned,
    AccessDenied,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::DocumentCreated => "DOCUMENT_CREATED",
            AuditAction::SubmittedForReview => "SUBMITTED_FOR_REVIEW",
            AuditAction::ReviewAccepted => "REVIEW_ACCEPTED",
            AuditAction::ReviewCompleted => "REVIEW_COMPLETED",
            AuditAction::ReviewRejected => "REVIEW_REJECTED",
            AuditAction::RoutedForApproval => "ROUTED_FOR_APPROVAL",
            AuditAction::ApprovalAccepted => "APPROVAL_ACCEPTED",
            AuditAction::ApprovalGranted => "APPROVAL_GRANTED",
            AuditAction::ApprovalRejected => "APPROVAL_REJECTED",
            AuditAction::DocumentEffective => "DOCUMENT_EFFECTIVE",
            AuditAction::VersionWorkflowStarted => "VERSION_WORKFLOW_STARTED",
            AuditAction::ObsolescenceScheduled => "OBSOLESCENCE_SCHEDULED",
            AuditAction::DocumentObsoleted => "DOCUMENT_OBSOLETED",
            AuditAction::DocumentTerminated => "DOCUMENT_TERMINATED",
            AuditAction::DependencyAdded => "DEPENDENCY_ADDED",
            AuditAction::SupersessionRecorded => "SUPERSESSION_RECORDED",
            AuditAction::SuperuserGranted => "SUPERUSER_GRANTED",
            AuditAction::SuperuserRevoked => "SUPERUSER_REVOKED",
            AuditAction::PeriodicReviewCompleted => "PERIODIC_REVIEW_COMPLETED",
            AuditAction::DocumentSigned => "DOC_SIGNED",
            AuditAction::AccessDenied => "ACCESS_DENIED",
        }
    }

    pub fn from_str(value: &str) -> Result<Self> {
        match value {
            "DOCUMENT_CREATED" => Ok(AuditAction::DocumentCreated),
            "SUBMITTED_FOR_REVIEW" => Ok(AuditAction::SubmittedForReview),
            "REVIEW_ACCEPTED" => Ok(AuditAction::ReviewAccepted),
            "REVIEW_COMPLETED" => Ok(AuditAction::ReviewCompleted),
            "REVIEW_REJECTED" => Ok(AuditAction::ReviewRejected),
            "ROUTED_FOR_APPROVAL" => Ok(AuditAction::RoutedForApproval),
            "APPROVAL_ACCEPTED" => Ok(AuditAction::ApprovalAccepted),
            "APPROVAL_GRANTED" => Ok(AuditAction::ApprovalGranted),
            "APPROVAL_REJECTED" => Ok(AuditAction::ApprovalRejected),
            "DOCUMENT_EFFECTIVE" => Ok(AuditAction::DocumentEffective),
            "VERSION_WORKFLOW_STARTED" => Ok(AuditAction::VersionWorkflowStarted),
            "OBSOLESCENCE_SCHEDULED" => Ok(AuditAction::ObsolescenceScheduled),
            "DOCUMENT_OBSOLETED" => Ok(AuditAction::DocumentObsoleted),
            "DOCUMENT_TERMINATED" => Ok(AuditAction::DocumentTerminated),
            "DEPENDENCY_ADDED" => Ok(AuditAction::DependencyAdded),
            "SUPERSESSION_RECORDED" => Ok(AuditAction::SupersessionRecorded),
            "SUPERUSER_GRANTED" => Ok(AuditAction::SuperuserGranted),
            "SUPERUSER_REVOKED" => Ok(AuditAction::SuperuserRevoked),
            "PERIODIC_REVIEW_COMPLETED" => Ok(AuditAction::PeriodicReviewCompleted),
            "DOC_SIGNED" => Ok(AuditAction::DocumentSigned),
            "ACCESS_DENIED" => Ok(AuditAction::AccessDenied),
            other => Err(QmsError::Internal {
                message: format!("unknown audit action: {other}"),
            }),
        }
    }
}

/// One append-only, checksum-chained audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub sequence_number: i64,
    pub timestamp: DateTime<Utc>,
    pub actor_id: Uuid,
    pub action: AuditAction,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub details: Option<serde_json::Value>,
    pub session_id: Option<Uuid>,
    pub previous_checksum: Option<String>,
    pub checksum: String,
}

fn compute_checksum(
    sequence_number: i64,
    timestamp: &DateTime<Utc>,
    actor_id: Uuid,
    action: AuditAction,
    entity_type: &str,
    entity_id: Uuid,
    details: &Option<serde_json::Value>,
    previous_checksum: &Option<String>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sequence_number.to_le_bytes());
    hasher.update(timestamp.to_rfc3339().as_bytes());
    hasher.update(actor_id.as_bytes());
    hasher.update(action.as_str().as_bytes());
    hasher.update(entity_type.as_bytes());
    hasher.update(entity_id.as_bytes());
    if let Some(d) = details {
        hasher.update(d.to_string().as_bytes());
    }
    hasher.update(previous_checksum.as_deref().unwrap_or("").as_bytes());
    format!("{:x}", hasher.finalize())
}

fn row_to_entry(row: &Row) -> rusqlite::Result<AuditEntry> {
    let id: String = row.get("id")?;
    let timestamp: String = row.get("timestamp")?;
    let actor_id: String = row.get("actor_id")?;
    let action: String = row.get("action")?;
    let entity_id: String = row.get("entity_id")?;
    let details: Option<String> = row.get("details")?;
    let session_id: Option<String> = row.get("session_id")?;

    Ok(AuditEntry {
        id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::nil()),
        sequence_number: row.get("sequence_number")?,
        timestamp: DateTime::parse_from_rfc3339(&timestamp)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        actor_id: Uuid::parse_str(&actor_id).unwrap_or_else(|_| Uuid::nil()),
        action: AuditAction::from_str(&action).unwrap_or(AuditAction::DocumentCreated),
        entity_type: row.get("entity_type")?,
        entity_id: Uuid::parse_str(&entity_id).unwrap_or_else(|_| Uuid::nil()),
        details: details.and_then(|d| serde_json::from_str(&d).ok()),
        session_id: session_id.map(|s| Uuid::parse_str(&s).unwrap_or_else(|_| Uuid::nil())),
        previous_checksum: row.get("previous_checksum")?,
        checksum: row.get("checksum")?,
    })
}

/// Report produced by [`AuditLog::verify_chain`].
#[derive(Debug, Serialize)]
pub struct AuditIntegrityReport {
    pub total_entries: u64,
    pub integrity_verified: bool,
    pub first_divergence_sequence: Option<i64>,
    pub details: String,
}

/// Append-only, checksum-chained audit trail. This is the system of
/// record for compliance; `tracing` emission elsewhere is a parallel
/// observability side-channel, never a substitute for this table.
pub struct AuditLog<'a> {
    db: &'a Database,
}

impl<'a> AuditLog<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Append one entry within the caller's transaction, chaining it to
    /// the current head row. Locking the chain head is implicit: the
    /// caller's `BEGIN IMMEDIATE` transaction serializes writers, so the
    /// `MAX(sequence_number)` read-then-insert below cannot race.
    pub fn append(
        &self,
        tx: &rusqlite::Transaction,
        actor_id: Uuid,
        action: AuditAction,
        entity_type: &str,
        entity_id: Uuid,
        details: Option<serde_json::Value>,
        session_id: Option<Uuid>,
    ) -> Result<AuditEntry> {
        let head: Option<(i64, String)> = tx
            .query_row(
                "SELECT sequence_number, checksum FROM audit_entries
                 ORDER BY sequence_number DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (next_sequence, previous_checksum) = match head {
            Some((seq, checksum)) => (seq + 1, Some(checksum)),
            None => (1, None),
        };

        let timestamp = Utc::now();
        let checksum = compute_checksum(
            next_sequence,
            &timestamp,
            actor_id,
            action,
            entity_type,
            entity_id,
            &details,
            &previous_checksum,
        );

        let entry = AuditEntry {
            id: Uuid::new_v4(),
            sequence_number: next_sequence,
            timestamp,
            actor_id,
            action,
            entity_type: entity_type.to_string(),
            entity_id,
            details,
            session_id,
            previous_checksum,
            checksum,
        };

        tx.execute(
            "INSERT INTO audit_entries (
                id, sequence_number, timestamp, actor_id, action, entity_type, entity_id,
                details, session_id, previous_checksum, checksum
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                entry.id.to_string(),
                entry.sequence_number,
                entry.timestamp.to_rfc3339(),
                entry.actor_id.to_string(),
                entry.action.as_str(),
                entry.entity_type,
                entry.entity_id.to_string(),
                entry.details.as_ref().map(|d| d.to_string()),
                entry.session_id.map(|s| s.to_string()),
                entry.previous_checksum,
                entry.checksum,
            ],
        )?;

        tracing::info!(
            audit_action = entry.action.as_str(),
            entity_type = %entry.entity_type,
            entity_id = %entry.entity_id,
            sequence_number = entry.sequence_number,
            "audit entry recorded"
        );

        Ok(entry)
    }

    /// Convenience wrapper that opens its own transaction, for callers
    /// outside an engine operation (e.g. the scheduler's own audit writes).
    pub fn append_standalone(
        &self,
        actor_id: Uuid,
        action: AuditAction,
        entity_type: &str,
        entity_id: Uuid,
        details: Option<serde_json::Value>,
        session_id: Option<Uuid>,
    ) -> Result<AuditEntry> {
        self.db
            .with_transaction(|tx| self.append(tx, actor_id, action, entity_type, entity_id, details, session_id))
    }

    pub fn entries_for_entity(&self, entity_type: &str, entity_id: Uuid) -> Result<Vec<AuditEntry>> {
        self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM audit_entries WHERE entity_type = ?1 AND entity_id = ?2
                 ORDER BY sequence_number ASC",
            )?;
            let rows = stmt
                .query_map(params![entity_type, entity_id.to_string()], row_to_entry)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Walk the entire chain in sequence order, recomputing each checksum
    /// and comparing it against the stored value and the next row's
    /// `previous_checksum`. Reports the first sequence number where the
    /// chain diverges, if any.
    pub fn verify_chain(&self) -> Result<AuditIntegrityReport> {
        self.db.with_connection(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM audit_entries ORDER BY sequence_number ASC")?;
            let entries = stmt
                .query_map([], row_to_entry)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut previous_checksum: Option<String> = None;
            for entry in &entries {
                if entry.previous_checksum != previous_checksum {
                    return Ok(AuditIntegrityReport {
                        total_entries: entries.len() as u64,
                        integrity_verified: false,
                        first_divergence_sequence: Some(entry.sequence_number),
                        details: format!(
                            "chain link broken at sequence {}: expected previous_checksum {:?}, found {:?}",
                            entry.sequence_number, previous_checksum, entry.previous_checksum
                        ),
                    });
                }

                let recomputed = compute_checksum(
                    entry.sequence_number,
                    &entry.timestamp,
                    entry.actor_id,
                    entry.action,
                    &entry.entity_type,
                    entry.entity_id,
                    &entry.details,
                    &entry.previous_checksum,
                );
                if recomputed != entry.checksum {
                    return Ok(AuditIntegrityReport {
                        total_entries: entries.len() as u64,
                        integrity_verified: false,
                        first_divergence_sequence: Some(entry.sequence_number),
                        details: format!(
                            "checksum mismatch at sequence {}: entry has been tampered with",
                            entry.sequence_number
                        ),
                    });
                }

                previous_checksum = Some(entry.checksum.clone());
            }

            Ok(AuditIntegrityReport {
                total_entries: entries.len() as u64,
                integrity_verified: true,
                first_divergence_sequence: None,
                details: "audit chain intact".to_string(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_chains_sequential_entries() {
        let db = Database::in_memory().unwrap();
        let audit = AuditLog::new(&db);
        let actor = Uuid::new_v4();
        let entity = Uuid::new_v4();

        let first = audit
            .append_standalone(actor, AuditAction::DocumentCreated, "Document", entity, None, None)
            .unwrap();
        assert_eq!(first.sequence_number, 1);
        assert!(first.previous_checksum.is_none());

        let second = audit
            .append_standalone(actor, AuditAction::SubmittedForReview, "Document", entity, None, None)
            .unwrap();
        assert_eq!(second.sequence_number, 2);
        assert_eq!(second.previous_checksum, Some(first.checksum));
    }

    #[test]
    fn test_verify_chain_clean() {
        let db = Database::in_memory().unwrap();
        let audit = AuditLog::new(&db);
        let actor = Uuid::new_v4();
        let entity = Uuid::new_v4();

        for _ in 0..5 {
            audit
                .append_standalone(actor, AuditAction::ReviewCompleted, "Document", entity, None, None)
                .unwrap();
        }

        let report = audit.verify_chain().unwrap();
        assert!(report.integrity_verified);
        assert_eq!(report.total_entries, 5);
    }

    #[test]
    fn test_verify_chain_detects_tamper() {
        let db = Database::in_memory().unwrap();
        let audit = AuditLog::new(&db);
        let actor = Uuid::new_v4();
        let entity = Uuid::new_v4();

        audit
            .append_standalone(actor, AuditAction::DocumentCreated, "Document", entity, None, None)
            .unwrap();
        audit
            .append_standalone(actor, AuditAction::SubmittedForReview, "Document", entity, None, None)
            .unwrap();

        db.with_connection(|conn| {
            conn.execute(
                "UPDATE audit_entries SET checksum = 'tampered' WHERE sequence_number = 1",
                [],
            )
            .map_err(QmsError::from)
        })
        .unwrap();

        let report = audit.verify_chain().unwrap();
        assert!(!report.integrity_verified);
        assert_eq!(report.first_divergence_sequence, Some(1));
    }

    #[test]
    fn test_entries_for_entity_filters() {
        let db = Database::in_memory().unwrap();
        let audit = AuditLog::new(&db);
        let actor = Uuid::new_v4();
        let entity_a = Uuid::new_v4();
        let entity_b = Uuid::new_v4();

        audit
            .append_standalone(actor, AuditAction::DocumentCreated, "Document", entity_a, None, None)
            .unwrap();
        audit
            .append_standalone(actor, AuditAction::DocumentCreated, "Document", entity_b, None, None)
            .unwrap();

        let entries = audit.entries_for_entity("Document", entity_a).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entity_id, entity_a);
    }
}
