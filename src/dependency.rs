use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::database::Database;
use crate::document::DocumentRepo;
use crate::error::{QmsError, Result};

/// Relationship a dependency edge expresses between two documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DependencyType {
    Implements,
    Supports,
    Template,
    Reference,
    Incorporates,
    Supersedes,
}

impl DependencyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DependencyType::Implements => "IMPLEMENTS",
            DependencyType::Supports => "SUPPORTS",
            DependencyType::Template => "TEMPLATE",
            DependencyType::Reference => "REFERENCE",
            DependencyType::Incorporates => "INCORPORATES",
            DependencyType::Supersedes => "SUPERSEDES",
        }
    }

    pub fn from_str(value: &str) -> Result<Self> {
        match value {
            "IMPLEMENTS" => Ok(DependencyType::Implements),
            "SUPPORTS" => Ok(DependencyType::Supports),
            "TEMPLATE" => Ok(DependencyType::Template),
            "REFERENCE" => Ok(DependencyType::Reference),
            "INCORPORATES" => Ok(DependencyType::Incorporates),
            "SUPERSEDES" => Ok(DependencyType::Supersedes),
            other => Err(QmsError::Internal {
                message: format!("unknown dependency type: {other}"),
            }),
        }
    }
}

/// A directed edge from a source document to a target document it depends on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentDependency {
    pub id: Uuid,
    pub source_document_id: Uuid,
    pub target_document_id: Uuid,
    pub dependency_type: DependencyType,
    pub is_critical: bool,
    pub created_at: DateTime<Utc>,
}

fn row_to_dependency(row: &Row) -> rusqlite::Result<DocumentDependency> {
    let id: String = row.get("id")?;
    let source: String = row.get("source_document_id")?;
    let target: String = row.get("target_document_id")?;
    let dep_type: String = row.get("dependency_type")?;
    let created_at: String = row.get("created_at")?;

    Ok(DocumentDependency {
        id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::nil()),
        source_document_id: Uuid::parse_str(&source).unwrap_or_else(|_| Uuid::nil()),
        target_document_id: Uuid::parse_str(&target).unwrap_or_else(|_| Uuid::nil()),
        dependency_type: DependencyType::from_str(&dep_type)
            .unwrap_or(DependencyType::Reference),
        is_critical: row.get::<_, i64>("is_critical")? != 0,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

/// Repository plus the cycle-prevention discipline over the family graph.
pub struct DependencyRepo<'a> {
    db: &'a Database,
}

impl<'a> DependencyRepo<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn insert(&self, dep: &DocumentDependency) -> Result<()> {
        self.db.with_connection(|conn| {
            conn.execute(
                "INSERT INTO document_dependencies (
                    id, source_document_id, target_document_id, dependency_type,
                    is_critical, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    dep.id.to_string(),
                    dep.source_document_id.to_string(),
                    dep.target_document_id.to_string(),
                    dep.dependency_type.as_str(),
                    dep.is_critical as i64,
                    dep.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn insert_tx(&self, tx: &rusqlite::Transaction, dep: &DocumentDependency) -> Result<()> {
        tx.execute(
            "INSERT INTO document_dependencies (
                id, source_document_id, target_document_id, dependency_type,
                is_critical, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                dep.id.to_string(),
                dep.source_document_id.to_string(),
                dep.target_document_id.to_string(),
                dep.dependency_type.as_str(),
                dep.is_critical as i64,
                dep.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn by_source(&self, document_id: Uuid) -> Result<Vec<DocumentDependency>> {
        self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM document_dependencies WHERE source_document_id = ?1",
            )?;
            let rows = stmt
                .query_map(params![document_id.to_string()], row_to_dependency)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn by_target(&self, document_id: Uuid) -> Result<Vec<DocumentDependency>> {
        self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM document_dependencies WHERE target_document_id = ?1",
            )?;
            let rows = stmt
                .query_map(params![document_id.to_string()], row_to_dependency)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn exists_direct(&self, source_document_id: Uuid, target_document_id: Uuid) -> Result<bool> {
        self.db.with_connection(|conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM document_dependencies
                     WHERE source_document_id = ?1 AND target_document_id = ?2",
                    params![source_document_id.to_string(), target_document_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?
                .unwrap_or(0);
            Ok(count > 0)
        })
    }

    /// Four-layer cycle discipline before accepting a new edge:
    /// 1. reject a self-edge,
    /// 2. reject when the direct inverse edge already exists,
    /// 3. reject when a path already exists from target's family back to
    ///    source's family (which the new edge would close into a cycle),
    /// 4. otherwise accept.
    ///
    /// Traversal is an explicit iterative DFS (`Vec` stack, `HashSet`
    /// visited set) over family keys, not document IDs, since supersession
    /// makes individual document IDs a moving target within a family.
    pub fn check_cycle(
        &self,
        documents: &DocumentRepo,
        source_document_id: Uuid,
        target_document_id: Uuid,
    ) -> Result<()> {
        if source_document_id == target_document_id {
            return Err(QmsError::CircularDependency {
                from_family: source_document_id.to_string(),
                to_family: target_document_id.to_string(),
            });
        }

        if self.exists_direct(target_document_id, source_document_id)? {
            return Err(QmsError::CircularDependency {
                from_family: source_document_id.to_string(),
                to_family: target_document_id.to_string(),
            });
        }

        let source_doc = documents.get(source_document_id)?;
        let target_doc = documents.get(target_document_id)?;

        if self.family_reaches(documents, target_doc.family_key, source_doc.family_key)? {
            return Err(QmsError::CircularDependency {
                from_family: source_doc.family_key.to_string(),
                to_family: target_doc.family_key.to_string(),
            });
        }

        Ok(())
    }

    /// Whether any document in `from_family` transitively depends on any
    /// document in `to_family`, walking dependency edges family-by-family.
    fn family_reaches(
        &self,
        documents: &DocumentRepo,
        from_family: Uuid,
        to_family: Uuid,
    ) -> Result<bool> {
        let mut stack = vec![from_family];
        let mut visited: HashSet<Uuid> = HashSet::new();

        while let Some(family) = stack.pop() {
            if family == to_family {
                return Ok(true);
            }
            if !visited.insert(family) {
                continue;
            }

            for version in documents.list_by_family(family)? {
                for dep in self.by_source(version.id)? {
                    let target = documents.get(dep.target_document_id)?;
                    if !visited.contains(&target.family_key) {
                        stack.push(target.family_key);
                    }
                }
            }
        }

        Ok(false)
    }

    /// Critical dependencies of `document_id` that are not yet effective.
    pub fn unmet_critical(
        &self,
        documents: &DocumentRepo,
        document_id: Uuid,
    ) -> Result<Vec<String>> {
        let mut offending = Vec::new();
        for dep in self.by_source(document_id)? {
            if !dep.is_critical {
                continue;
            }
            let target = documents.get(dep.target_document_id)?;
            let resolved = matches!(
                target.status,
                crate::state::DocumentStatus::Effective
                    | crate::state::DocumentStatus::ApprovedPendingEffective
            );
            if !resolved {
                offending.push(target.document_number.clone());
            }
        }
        Ok(offending)
    }

    /// Documents that critically depend on `document_id` and are still
    /// active, blocking its obsolescence/termination.
    pub fn active_critical_dependents(
        &self,
        documents: &DocumentRepo,
        document_id: Uuid,
    ) -> Result<Vec<String>> {
        let mut dependents = Vec::new();
        for dep in self.by_target(document_id)? {
            if !dep.is_critical {
                continue;
            }
            let source = documents.get(dep.source_document_id)?;
            if source.status.is_active() {
                dependents.push(source.document_number.clone());
            }
        }
        Ok(dependents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Document, DocumentType};
    use crate::state::DocumentStatus;

    fn make_doc(
        repo: &DocumentRepo,
        family_key: Uuid,
        number: &str,
        status: DocumentStatus,
    ) -> Document {
        let now = Utc::now();
        let doc = Document {
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
        };
        repo.insert(&doc).unwrap();
        doc
    }

    fn setup() -> Database {
        let db = Database::in_memory().unwrap();
        let repo = DocumentRepo::new(&db);
        repo.insert_type(&DocumentType {
            code: "SOP".to_string(),
            name: "SOP".to_string(),
            number_prefix: "SOP".to_string(),
            default_periodic_review_months: None,
        })
        .unwrap();
        db
    }

    #[test]
    fn test_self_edge_rejected() {
        let db = setup();
        let documents = DocumentRepo::new(&db);
        let deps = DependencyRepo::new(&db);
        let doc = make_doc(&documents, Uuid::new_v4(), "SOP-0001", DocumentStatus::Draft);

        assert!(deps.check_cycle(&documents, doc.id, doc.id).is_err());
    }

    #[test]
    fn test_direct_inverse_rejected() {
        let db = setup();
        let documents = DocumentRepo::new(&db);
        let deps = DependencyRepo::new(&db);
        let a = make_doc(&documents, Uuid::new_v4(), "SOP-0001", DocumentStatus::Draft);
        let b = make_doc(&documents, Uuid::new_v4(), "SOP-0002", DocumentStatus::Draft);

        deps.insert(&DocumentDependency {
            id: Uuid::new_v4(),
            source_document_id: b.id,
            target_document_id: a.id,
            dependency_type: DependencyType::Reference,
            is_critical: false,
            created_at: Utc::now(),
        })
        .unwrap();

        assert!(deps.check_cycle(&documents, a.id, b.id).is_err());
    }

    #[test]
    fn test_transitive_cycle_rejected() {
        let db = setup();
        let documents = DocumentRepo::new(&db);
        let deps = DependencyRepo::new(&db);
        let a = make_doc(&documents, Uuid::new_v4(), "SOP-0001", DocumentStatus::Draft);
        let b = make_doc(&documents, Uuid::new_v4(), "SOP-0002", DocumentStatus::Draft);
        let c = make_doc(&documents, Uuid::new_v4(), "SOP-0003", DocumentStatus::Draft);

        deps.insert(&DocumentDependency {
            id: Uuid::new_v4(),
            source_document_id: a.id,
            target_document_id: b.id,
            dependency_type: DependencyType::Reference,
            is_critical: false,
            created_at: Utc::now(),
        })
        .unwrap();
        deps.insert(&DocumentDependency {
            id: Uuid::new_v4(),
            source_document_id: b.id,
            target_document_id: c.id,
            dependency_type: DependencyType::Reference,
            is_critical: false,
            created_at: Utc::now(),
        })
        .unwrap();

        // c -> a would close the cycle a -> b -> c -> a
        assert!(deps.check_cycle(&documents, c.id, a.id).is_err());
    }

    #[test]
    fn test_unmet_critical_dependency() {
        let db = setup();
        let documents = DocumentRepo::new(&db);
        let deps = DependencyRepo::new(&db);
        let a = make_doc(&documents, Uuid::new_v4(), "SOP-0001", DocumentStatus::Draft);
        let b = make_doc(&documents, Uuid::new_v4(), "SOP-0002", DocumentStatus::Draft);

        deps.insert(&DocumentDependency {
            id: Uuid::new_v4(),
            source_document_id: a.id,
            target_document_id: b.id,
            dependency_type: DependencyType::Implements,
            is_critical: true,
            created_at: Utc::now(),
        })
        .unwrap();

        let unmet = deps.unmet_critical(&documents, a.id).unwrap();
        assert_eq!(unmet, vec!["SOP-0002".to_string()]);
    }

    #[test]
    fn test_active_critical_dependents() {
        let db = setup();
        let documents = DocumentRepo::new(&db);
        let deps = DependencyRepo::new(&db);
        let a = make_doc(&documents, Uuid::new_v4(), "SOP-0001", DocumentStatus::Effective);
        let b = make_doc(&documents, Uuid::new_v4(), "SOP-0002", DocumentStatus::Effective);

        deps.insert(&DocumentDependency {
            id: Uuid::new_v4(),
            source_document_id: b.id,
            target_document_id: a.id,
            dependency_type: DependencyType::Implements,
            is_critical: true,
            created_at: Utc::now(),
        })
        .unwrap();

        let dependents = deps.active_critical_dependents(&documents, a.id).unwrap();
        assert_eq!(dependents, vec!["SOP-0002".to_string()]);
    }
}
