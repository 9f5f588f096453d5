use chrono::Utc;
use uuid::Uuid;

use crate::audit::{AuditAction, AuditLog};
use crate::dependency::{DependencyRepo, DependencyType, DocumentDependency};
use crate::document::{Document, DocumentRepo};
use crate::error::Result;
use crate::state::DocumentStatus;

/// Resolves the effective member of a document family and records
/// supersession when a new version becomes effective.
pub struct FamilyResolver<'a> {
    documents: &'a DocumentRepo<'a>,
    dependencies: &'a DependencyRepo<'a>,
}

impl<'a> FamilyResolver<'a> {
    pub fn new(documents: &'a DocumentRepo<'a>, dependencies: &'a DependencyRepo<'a>) -> Self {
        Self {
            documents,
            dependencies,
        }
    }

    /// The currently effective version of `family_key`, if any.
    pub fn latest_effective(&self, family_key: Uuid) -> Result<Option<Document>> {
        self.documents.latest_effective(family_key)
    }

    /// Called transactionally when `new_doc` becomes effective: marks any
    /// previously effective sibling in the same family as superseded and
    /// records a `SUPERSEDES` edge from the new version to the old one.
    pub fn on_new_version_effective(
        &self,
        tx: &rusqlite::Transaction,
        audit: &AuditLog,
        actor_id: Uuid,
        new_doc: &Document,
    ) -> Result<()> {
        let siblings = self.documents.list_by_family(new_doc.family_key)?;
        for sibling in siblings {
            if sibling.id == new_doc.id || sibling.status != DocumentStatus::Effective {
                continue;
            }

            tx.execute(
                "UPDATE documents SET status = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![
                    DocumentStatus::Superseded.as_str(),
                    Utc::now().to_rfc3339(),
                    sibling.id.to_string(),
                ],
            )?;

            let edge = DocumentDependency {
                id: Uuid::new_v4(),
                source_document_id: new_doc.id,
                target_document_id: sibling.id,
                dependency_type: DependencyType::Supersedes,
                is_critical: false,
                created_at: Utc::now(),
            };
            tx.execute(
                "INSERT INTO document_dependencies (
                    id, source_document_id, target_document_id, dependency_type, is_critical, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    edge.id.to_string(),
                    edge.source_document_id.to_string(),
                    edge.target_document_id.to_string(),
                    edge.dependency_type.as_str(),
                    edge.is_critical as i64,
                    edge.created_at.to_rfc3339(),
                ],
            )?;

            audit.append(
                tx,
                actor_id,
                AuditAction::SupersessionRecorded,
                "Document",
                sibling.id,
                Some(serde_json::json!({ "superseded_by": new_doc.id.to_string() })),
                None,
            )?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::document::DocumentType;

    fn make_doc(family_key: Uuid, number: &str, status: DocumentStatus) -> Document {
        let now = Utc::now();
        Document {
            id: Uuid::new_v4(),
            document_number: number.to_string(),
            title: "Doc".to_string(),
            description: None,
            document_type: "SOP".to_string(),
            source: "INTERNAL".to_string(),
            version_major: 1,
            version_minor: 0,
            family_key,
            status,
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
    fn test_on_new_version_effective_supersedes_old() {
        let db = Database::in_memory().unwrap();
        let documents = DocumentRepo::new(&db);
        documents
            .insert_type(&DocumentType {
                code: "SOP".to_string(),
                name: "SOP".to_string(),
                number_prefix: "SOP".to_string(),
                default_periodic_review_months: None,
            })
            .unwrap();
        let dependencies = DependencyRepo::new(&db);
        let audit = AuditLog::new(&db);
        let family_key = Uuid::new_v4();

        let mut old = make_doc(family_key, "SOP-0001", DocumentStatus::Effective);
        old.version_major = 1;
        documents.insert(&old).unwrap();

        let mut new_doc = make_doc(family_key, "SOP-0001-v2", DocumentStatus::Effective);
        new_doc.version_major = 2;
        documents.insert(&new_doc).unwrap();

        let resolver = FamilyResolver::new(&documents, &dependencies);
        let actor = Uuid::new_v4();
        db.with_transaction(|tx| resolver.on_new_version_effective(tx, &audit, actor, &new_doc))
            .unwrap();

        let refreshed_old = documents.get(old.id).unwrap();
        assert_eq!(refreshed_old.status, DocumentStatus::Superseded);

        let edges = dependencies.by_source(new_doc.id).unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].dependency_type, DependencyType::Supersedes);
        assert_eq!(edges[0].target_document_id, old.id);
    }
}
