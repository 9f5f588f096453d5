use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::database::Database;
use crate::error::{QmsError, Result};
use crate::state::DocumentStatus;

/// A controlled document. `family_key` identifies the logical document
/// across versions; `id` identifies this particular version row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub document_number: String,
    pub title: String,
    pub description: Option<String>,
    pub document_type: String,
    pub source: String,
    pub version_major: u32,
    pub version_minor: u32,
    pub family_key: Uuid,
    pub status: DocumentStatus,
    pub effective_date: Option<NaiveDate>,
    pub obsolescence_date: Option<NaiveDate>,
    pub next_periodic_review_date: Option<NaiveDate>,
    pub author_id: Uuid,
    pub reviewer_id: Option<Uuid>,
    pub approver_id: Option<Uuid>,
    pub file_reference: Option<String>,
    pub reason_for_change: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Render the version as the `major.minor` string used on artifacts.
    pub fn version_string(&self) -> String {
        format!("{}.{}", self.version_major, self.version_minor)
    }

    pub fn validate(&self) -> Result<()> {
        if self.document_number.trim().is_empty() {
            return Err(QmsError::MissingRequiredField {
                field: "document_number".to_string(),
            });
        }
        if self.title.trim().is_empty() {
            return Err(QmsError::MissingRequiredField {
                field: "title".to_string(),
            });
        }
        Ok(())
    }
}

/// An administrator-configurable document type (SOP, Work Instruction, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentType {
    pub code: String,
    pub name: String,
    pub number_prefix: String,
    pub default_periodic_review_months: Option<u32>,
}

/// An administrator-configurable document source (internal authoring,
/// vendor-supplied, regulatory template, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentSource {
    pub code: String,
    pub name: String,
}

fn row_to_document(row: &Row) -> rusqlite::Result<Document> {
    let id: String = row.get("id")?;
    let family_key: String = row.get("family_key")?;
    let status: String = row.get("status")?;
    let author_id: String = row.get("author_id")?;
    let reviewer_id: Option<String> = row.get("reviewer_id")?;
    let approver_id: Option<String> = row.get("approver_id")?;
    let effective_date: Option<String> = row.get("effective_date")?;
    let obsolescence_date: Option<String> = row.get("obsolescence_date")?;
    let next_review: Option<String> = row.get("next_periodic_review_date")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(Document {
        id: parse_uuid(&id),
        document_number: row.get("document_number")?,
        title: row.get("title")?,
        description: row.get("description")?,
        document_type: row.get("document_type")?,
        source: row.get("source")?,
        version_major: row.get::<_, i64>("version_major")? as u32,
        version_minor: row.get::<_, i64>("version_minor")? as u32,
        family_key: parse_uuid(&family_key),
        status: DocumentStatus::from_str(&status).unwrap_or(DocumentStatus::Draft),
        effective_date: effective_date.and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok()),
        obsolescence_date: obsolescence_date
            .and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok()),
        next_periodic_review_date: next_review
            .and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok()),
        author_id: parse_uuid(&author_id),
        reviewer_id: reviewer_id.map(|s| parse_uuid(&s)),
        approver_id: approver_id.map(|s| parse_uuid(&s)),
        file_reference: row.get("file_reference")?,
        reason_for_change: row.get("reason_for_change")?,
        is_active: row.get::<_, i64>("is_active")? != 0,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

fn parse_uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).unwrap_or_else(|_| Uuid::nil())
}

/// Repository for documents and their supporting type/source lookups.
pub struct DocumentRepo<'a> {
    db: &'a Database,
}

impl<'a> DocumentRepo<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn insert(&self, doc: &Document) -> Result<()> {
        self.db.with_connection(|conn| {
            conn.execute(
                "INSERT INTO documents (
                    id, document_number, title, description, document_type, source,
                    version_major, version_minor, family_key, status, effective_date,
                    obsolescence_date, next_periodic_review_date, author_id, reviewer_id,
                    approver_id, file_reference, reason_for_change, is_active,
                    created_at, updated_at
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21)",
                params![
                    doc.id.to_string(),
                    doc.document_number,
                    doc.title,
                    doc.description,
                    doc.document_type,
                    doc.source,
                    doc.version_major,
                    doc.version_minor,
                    doc.family_key.to_string(),
                    doc.status.as_str(),
                    doc.effective_date.map(|d| d.format("%Y-%m-%d").to_string()),
                    doc.obsolescence_date.map(|d| d.format("%Y-%m-%d").to_string()),
                    doc.next_periodic_review_date.map(|d| d.format("%Y-%m-%d").to_string()),
                    doc.author_id.to_string(),
                    doc.reviewer_id.map(|u| u.to_string()),
                    doc.approver_id.map(|u| u.to_string()),
                    doc.file_reference,
                    doc.reason_for_change,
                    doc.is_active as i64,
                    doc.created_at.to_rfc3339(),
                    doc.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn insert_tx(&self, tx: &rusqlite::Transaction, doc: &Document) -> Result<()> {
        tx.execute(
            "INSERT INTO documents (
                id, document_number, title, description, document_type, source,
                version_major, version_minor, family_key, status, effective_date,
                obsolescence_date, next_periodic_review_date, author_id, reviewer_id,
                approver_id, file_reference, reason_for_change, is_active,
                created_at, updated_at
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21)",
            params![
                doc.id.to_string(),
                doc.document_number,
                doc.title,
                doc.description,
                doc.document_type,
                doc.source,
                doc.version_major,
                doc.version_minor,
                doc.family_key.to_string(),
                doc.status.as_str(),
                doc.effective_date.map(|d| d.format("%Y-%m-%d").to_string()),
                doc.obsolescence_date.map(|d| d.format("%Y-%m-%d").to_string()),
                doc.next_periodic_review_date.map(|d| d.format("%Y-%m-%d").to_string()),
                doc.author_id.to_string(),
                doc.reviewer_id.map(|u| u.to_string()),
                doc.approver_id.map(|u| u.to_string()),
                doc.file_reference,
                doc.reason_for_change,
                doc.is_active as i64,
                doc.created_at.to_rfc3339(),
                doc.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Result<Document> {
        self.db.with_connection(|conn| {
            conn.query_row(
                "SELECT * FROM documents WHERE id = ?1",
                params![id.to_string()],
                row_to_document,
            )
            .optional()?
            .ok_or_else(|| QmsError::NotFound {
                kind: "Document".to_string(),
                id: id.to_string(),
            })
        })
    }

    /// Fetch a document using the caller's own transaction connection, so
    /// the read observes state under the caller's `BEGIN IMMEDIATE` lock
    /// rather than a separate pooled connection.
    pub fn get_tx(&self, tx: &rusqlite::Transaction, id: Uuid) -> Result<Document> {
        tx.query_row(
            "SELECT * FROM documents WHERE id = ?1",
            params![id.to_string()],
            row_to_document,
        )
        .optional()?
        .ok_or_else(|| QmsError::NotFound {
            kind: "Document".to_string(),
            id: id.to_string(),
        })
    }

    pub fn get_by_number(&self, document_number: &str) -> Result<Document> {
        self.db.with_connection(|conn| {
            conn.query_row(
                "SELECT * FROM documents WHERE document_number = ?1",
                params![document_number],
                row_to_document,
            )
            .optional()?
            .ok_or_else(|| QmsError::NotFound {
                kind: "Document".to_string(),
                id: document_number.to_string(),
            })
        })
    }

    /// All versions belonging to the same logical document, newest first.
    pub fn list_by_family(&self, family_key: Uuid) -> Result<Vec<Document>> {
        self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM documents WHERE family_key = ?1
                 ORDER BY version_major DESC, version_minor DESC",
            )?;
            let rows = stmt
                .query_map(params![family_key.to_string()], row_to_document)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// The current effective version of a family, if any.
    pub fn latest_effective(&self, family_key: Uuid) -> Result<Option<Document>> {
        Ok(self
            .list_by_family(family_key)?
            .into_iter()
            .find(|d| d.status == DocumentStatus::Effective))
    }

    pub fn update_status(&self, id: Uuid, status: DocumentStatus) -> Result<()> {
        self.db.with_connection(|conn| {
            conn.execute(
                "UPDATE documents SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), Utc::now().to_rfc3339(), id.to_string()],
            )?;
            Ok(())
        })
    }

    /// Transaction-scoped status update, for engine operations that must
    /// land atomically alongside workflow/audit writes.
    pub fn set_status_tx(&self, tx: &rusqlite::Transaction, id: Uuid, status: DocumentStatus) -> Result<()> {
        tx.execute(
            "UPDATE documents SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), Utc::now().to_rfc3339(), id.to_string()],
        )?;
        Ok(())
    }

    pub fn set_reviewer_approver_tx(
        &self,
        tx: &rusqlite::Transaction,
        id: Uuid,
        reviewer_id: Option<Uuid>,
        approver_id: Option<Uuid>,
    ) -> Result<()> {
        tx.execute(
            "UPDATE documents SET reviewer_id = ?1, approver_id = ?2, updated_at = ?3 WHERE id = ?4",
            params![
                reviewer_id.map(|u| u.to_string()),
                approver_id.map(|u| u.to_string()),
                Utc::now().to_rfc3339(),
                id.to_string(),
            ],
        )?;
        Ok(())
    }

    pub fn set_effective_date_tx(&self, tx: &rusqlite::Transaction, id: Uuid, date: NaiveDate) -> Result<()> {
        tx.execute(
            "UPDATE documents SET effective_date = ?1, updated_at = ?2 WHERE id = ?3",
            params![date.format("%Y-%m-%d").to_string(), Utc::now().to_rfc3339(), id.to_string()],
        )?;
        Ok(())
    }

    pub fn set_obsolescence_date_tx(&self, tx: &rusqlite::Transaction, id: Uuid, date: NaiveDate) -> Result<()> {
        tx.execute(
            "UPDATE documents SET obsolescence_date = ?1, updated_at = ?2 WHERE id = ?3",
            params![date.format("%Y-%m-%d").to_string(), Utc::now().to_rfc3339(), id.to_string()],
        )?;
        Ok(())
    }

    pub fn set_next_periodic_review_date_tx(
        &self,
        tx: &rusqlite::Transaction,
        id: Uuid,
        date: Option<NaiveDate>,
    ) -> Result<()> {
        tx.execute(
            "UPDATE documents SET next_periodic_review_date = ?1, updated_at = ?2 WHERE id = ?3",
            params![
                date.map(|d| d.format("%Y-%m-%d").to_string()),
                Utc::now().to_rfc3339(),
                id.to_string(),
            ],
        )?;
        Ok(())
    }

    pub fn set_file_reference_tx(&self, tx: &rusqlite::Transaction, id: Uuid, file_reference: &str) -> Result<()> {
        tx.execute(
            "UPDATE documents SET file_reference = ?1, updated_at = ?2 WHERE id = ?3",
            params![file_reference, Utc::now().to_rfc3339(), id.to_string()],
        )?;
        Ok(())
    }

    pub fn set_active_tx(&self, tx: &rusqlite::Transaction, id: Uuid, is_active: bool) -> Result<()> {
        tx.execute(
            "UPDATE documents SET is_active = ?1, updated_at = ?2 WHERE id = ?3",
            params![is_active as i64, Utc::now().to_rfc3339(), id.to_string()],
        )?;
        Ok(())
    }

    pub fn set_active(&self, id: Uuid, is_active: bool) -> Result<()> {
        self.db.with_connection(|conn| {
            conn.execute(
                "UPDATE documents SET is_active = ?1, updated_at = ?2 WHERE id = ?3",
                params![is_active as i64, Utc::now().to_rfc3339(), id.to_string()],
            )?;
            Ok(())
        })
    }

    pub fn get_type(&self, code: &str) -> Result<DocumentType> {
        self.db.with_connection(|conn| {
            conn.query_row(
                "SELECT code, name, number_prefix, default_periodic_review_months
                 FROM document_types WHERE code = ?1",
                params![code],
                |row| {
                    Ok(DocumentType {
                        code: row.get(0)?,
                        name: row.get(1)?,
                        number_prefix: row.get(2)?,
                        default_periodic_review_months: row
                            .get::<_, Option<i64>>(3)?
                            .map(|v| v as u32),
                    })
                },
            )
            .optional()?
            .ok_or_else(|| QmsError::NotFound {
                kind: "DocumentType".to_string(),
                id: code.to_string(),
            })
        })
    }

    pub fn insert_type(&self, doc_type: &DocumentType) -> Result<()> {
        self.db.with_connection(|conn| {
            conn.execute(
                "INSERT INTO document_types (code, name, number_prefix, default_periodic_review_months)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    doc_type.code,
                    doc_type.name,
                    doc_type.number_prefix,
                    doc_type.default_periodic_review_months.map(|v| v as i64),
                ],
            )?;
            Ok(())
        })
    }

    pub fn insert_source(&self, source: &DocumentSource) -> Result<()> {
        self.db.with_connection(|conn| {
            conn.execute(
                "INSERT INTO document_sources (code, name) VALUES (?1, ?2)",
                params![source.code, source.name],
            )?;
            Ok(())
        })
    }

    /// Generate the next document number for a type: `<PREFIX>-<YEAR>-<NNNN>`.
    pub fn next_document_number(&self, type_code: &str, year: i32) -> Result<String> {
        let doc_type = self.get_type(type_code)?;
        let like_pattern = format!("{}-{}-%", doc_type.number_prefix, year);
        let max_suffix: Option<String> = self.db.with_connection(|conn| {
            conn.query_row(
                "SELECT document_number FROM documents
                 WHERE document_number LIKE ?1
                 ORDER BY document_number DESC LIMIT 1",
                params![like_pattern],
                |row| row.get(0),
            )
            .optional()
            .map_err(QmsError::from)
        })?;

        let next_counter = match max_suffix {
            Some(number) => number
                .rsplit('-')
                .next()
                .and_then(|n| n.parse::<u32>().ok())
                .map(|n| n + 1)
                .unwrap_or(1),
            None => 1,
        };

        Ok(format!(
            "{}-{}-{:04}",
            doc_type.number_prefix, year, next_counter
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_type() -> DocumentType {
        DocumentType {
            code: "SOP".to_string(),
            name: "Standard Operating Procedure".to_string(),
            number_prefix: "SOP".to_string(),
            default_periodic_review_months: Some(24),
        }
    }

    fn sample_document(family_key: Uuid, document_number: &str) -> Document {
        let now = Utc::now();
        Document {
            id: Uuid::new_v4(),
            document_number: document_number.to_string(),
            title: "Quality Management System Overview".to_string(),
            description: None,
            document_type: "SOP".to_string(),
            source: "INTERNAL".to_string(),
            version_major: 1,
            version_minor: 0,
            family_key,
            status: DocumentStatus::Draft,
            effective_date: None,
            obsolescence_date: None,
            next_periodic_review_date: None,
            author_id: Uuid::new_v4(),
            reviewer_id: None,
            approver_id: None,
            file_reference: None,
            reason_for_change: None,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_document_validation() {
        let doc = sample_document(Uuid::new_v4(), "SOP-2026-0001");
        assert!(doc.validate().is_ok());

        let mut bad = doc.clone();
        bad.document_number = String::new();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_insert_and_get() {
        let db = Database::in_memory().unwrap();
        let repo = DocumentRepo::new(&db);
        repo.insert_type(&sample_type()).unwrap();
        let family_key = Uuid::new_v4();
        let doc = sample_document(family_key, "SOP-2026-0001");
        repo.insert(&doc).unwrap();

        let fetched = repo.get(doc.id).unwrap();
        assert_eq!(fetched.document_number, "SOP-2026-0001");
        assert_eq!(fetched.status, DocumentStatus::Draft);
    }

    #[test]
    fn test_list_by_family_orders_newest_first() {
        let db = Database::in_memory().unwrap();
        let repo = DocumentRepo::new(&db);
        repo.insert_type(&sample_type()).unwrap();
        let family_key = Uuid::new_v4();

        let mut v1 = sample_document(family_key, "SOP-2026-0001");
        v1.version_major = 1;
        repo.insert(&v1).unwrap();

        let mut v2 = sample_document(family_key, "SOP-2026-0001-v2");
        v2.version_major = 2;
        repo.insert(&v2).unwrap();

        let versions = repo.list_by_family(family_key).unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].version_major, 2);
    }

    #[test]
    fn test_next_document_number_increments() {
        let db = Database::in_memory().unwrap();
        let repo = DocumentRepo::new(&db);
        repo.insert_type(&sample_type()).unwrap();

        let first = repo.next_document_number("SOP", 2026).unwrap();
        assert_eq!(first, "SOP-2026-0001");

        let doc = sample_document(Uuid::new_v4(), &first);
        repo.insert(&doc).unwrap();

        let second = repo.next_document_number("SOP", 2026).unwrap();
        assert_eq!(second, "SOP-2026-0002");
    }

    #[test]
    fn test_latest_effective() {
        let db = Database::in_memory().unwrap();
        let repo = DocumentRepo::new(&db);
        repo.insert_type(&sample_type()).unwrap();
        let family_key = Uuid::new_v4();

        let mut v1 = sample_document(family_key, "SOP-2026-0010");
        v1.status = DocumentStatus::Effective;
        repo.insert(&v1).unwrap();

        let effective = repo.latest_effective(family_key).unwrap();
        assert!(effective.is_some());
        assert_eq!(effective.unwrap().id, v1.id);
    }
}
