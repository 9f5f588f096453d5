use std::sync::Arc;

use chrono::{Datelike, Duration, NaiveDate, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::artifact::{render_and_store, ArtifactRequest};
use crate::audit::{AuditAction, AuditLog};
use crate::database::Database;
use crate::dependency::{DependencyRepo, DocumentDependency};
use crate::document::{Document, DocumentRepo};
use crate::error::{QmsError, Result};
use crate::family::FamilyResolver;
use crate::filestore::FileStore;
use crate::notification::{dispatch_async, NotificationDispatcher, NotificationRequest};
use crate::review::ReviewOutcome;
use crate::state::{DocumentStatus, StateRegistry};
use crate::user::{Capability, User, UserRepo};
use crate::workflow::{WorkflowInstance, WorkflowRepo, WorkflowStatus, WorkflowTransition, WorkflowType};

/// Whether an up-version starts a minor or major revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionType {
    Minor,
    Major,
}

/// Result of a lifecycle operation: the state the document landed in,
/// whichever workflow instance carried it there, and anything the caller
/// should surface without failing the operation.
#[derive(Debug, Clone)]
pub struct EngineOutcome {
    pub success: bool,
    pub new_state: Option<DocumentStatus>,
    pub workflow_id: Option<Uuid>,
    pub warnings: Vec<String>,
    pub requires_upversion: bool,
    pub new_document_id: Option<Uuid>,
}

impl EngineOutcome {
    fn ok(new_state: DocumentStatus, workflow_id: Option<Uuid>) -> Self {
        Self {
            success: true,
            new_state: Some(new_state),
            workflow_id,
            warnings: Vec::new(),
            requires_upversion: false,
            new_document_id: None,
        }
    }
}

/// The document lifecycle core: every state-changing operation on a
/// document runs through here so that authorization, the state machine,
/// dependency gating, the audit chain, and notifications are applied
/// uniformly rather than duplicated at each call site.
pub struct LifecycleEngine<'a> {
    db: &'a Database,
    documents: DocumentRepo<'a>,
    dependencies: DependencyRepo<'a>,
    workflows: WorkflowRepo<'a>,
    users: UserRepo<'a>,
    audit: AuditLog<'a>,
    file_store: &'a dyn FileStore,
    notifier: Arc<dyn NotificationDispatcher>,
}

impl<'a> LifecycleEngine<'a> {
    pub fn new(
        db: &'a Database,
        file_store: &'a dyn FileStore,
        notifier: Arc<dyn NotificationDispatcher>,
    ) -> Self {
        Self {
            db,
            documents: DocumentRepo::new(db),
            dependencies: DependencyRepo::new(db),
            workflows: WorkflowRepo::new(db),
            users: UserRepo::new(db),
            audit: AuditLog::new(db),
            file_store,
            notifier,
        }
    }

    fn notify(&self, template: &str, recipients: Vec<Uuid>, context: serde_json::Value) {
        if recipients.is_empty() {
            return;
        }
        dispatch_async(
            self.notifier.clone(),
            NotificationRequest::new(template, recipients, context),
        );
    }

    /// Record a denied-access audit entry in its own transaction. Best
    /// effort: a failure here is logged, not propagated, since the caller
    /// is already on its way to returning the original denial error.
    fn record_denial(&self, actor_id: Uuid, entity_type: &str, entity_id: Uuid, capability: &str, operation: &str) {
        if let Err(e) = self.audit.append_standalone(
            actor_id,
            AuditAction::AccessDenied,
            entity_type,
            entity_id,
            Some(json!({ "operation": operation, "required": capability })),
            None,
        ) {
            tracing::warn!(error = %e, operation, "failed to record access-denied audit entry");
        }
    }

    fn ensure_identity_or_admin(
        &self,
        actor: &User,
        required: Option<Uuid>,
        actor_id: Uuid,
        document_id: Uuid,
        capability: &str,
        operation: &str,
    ) -> Result<()> {
        if required == Some(actor_id) || actor.has_capability(Capability::Admin) {
            Ok(())
        } else {
            self.record_denial(actor_id, "Document", document_id, capability, operation);
            Err(QmsError::PermissionDenied {
                capability: capability.to_string(),
                operation: operation.to_string(),
            })
        }
    }

    fn ensure_capability(
        &self,
        actor: &User,
        capability: Capability,
        actor_id: Uuid,
        document_id: Uuid,
        operation: &str,
    ) -> Result<()> {
        if actor.has_capability(capability) {
            Ok(())
        } else {
            self.record_denial(actor_id, "Document", document_id, capability.as_str(), operation);
            Err(QmsError::PermissionDenied {
                capability: capability.as_str().to_string(),
                operation: operation.to_string(),
            })
        }
    }

    /// Submit a draft for review, assigning the reviewer and approver who
    /// will carry it through the rest of its lifecycle.
    pub fn submit_for_review(
        &self,
        actor_id: Uuid,
        document_id: Uuid,
        reviewer_id: Uuid,
        approver_id: Uuid,
        comment: Option<String>,
    ) -> Result<EngineOutcome> {
        let doc = self.documents.get(document_id)?;
        let actor = self.users.get(actor_id)?;
        self.ensure_identity_or_admin(&actor, Some(doc.author_id), actor_id, document_id, "author", "submit_for_review")?;

        if doc.file_reference.is_none() {
            return Err(QmsError::MissingRequiredField {
                field: "file_reference".to_string(),
            });
        }

        let mut warnings = Vec::new();
        if reviewer_id == approver_id {
            warnings.push("reviewer and approver are the same user".to_string());
        }

        let workflow_id = self.db.with_transaction(|tx| {
            let current = self.documents.get_tx(tx, document_id)?;
            StateRegistry::validate_transition(current.status, DocumentStatus::PendingReview)?;

            self.documents.set_reviewer_approver_tx(tx, document_id, Some(reviewer_id), Some(approver_id))?;
            self.documents.set_status_tx(tx, document_id, DocumentStatus::PendingReview)?;

            let wf = WorkflowInstance {
                id: Uuid::new_v4(),
                document_id,
                workflow_type: WorkflowType::Review,
                status: WorkflowStatus::Open,
                initiated_by: actor_id,
                initiated_at: Utc::now(),
                completed_at: None,
                due_at: Some(Utc::now() + Duration::days(30)),
            };
            self.workflows.insert(tx, &wf)?;
            self.workflows.record_transition(
                tx,
                &WorkflowTransition {
                    id: Uuid::new_v4(),
                    workflow_instance_id: wf.id,
                    from_state: current.status.as_str().to_string(),
                    to_state: DocumentStatus::PendingReview.as_str().to_string(),
                    actor_id,
                    comment: comment.clone(),
                    occurred_at: Utc::now(),
                },
            )?;
            self.audit.append(
                tx,
                actor_id,
                AuditAction::SubmittedForReview,
                "Document",
                document_id,
                Some(json!({ "reviewer_id": reviewer_id, "approver_id": approver_id })),
                None,
            )?;

            Ok(wf.id)
        })?;

        self.notify(
            "task_assigned",
            vec![reviewer_id],
            json!({ "document_number": doc.document_number, "role": "reviewer" }),
        );

        Ok(EngineOutcome {
            warnings,
            ..EngineOutcome::ok(DocumentStatus::PendingReview, Some(workflow_id))
        })
    }

    /// Reviewer accepts an assigned review, moving it from the queue into
    /// active review. No notification is specified for this hop (§4.9).
    pub fn accept_review(&self, actor_id: Uuid, document_id: Uuid, comment: Option<String>) -> Result<EngineOutcome> {
        let doc = self.documents.get(document_id)?;
        let actor = self.users.get(actor_id)?;
        self.ensure_identity_or_admin(&actor, doc.reviewer_id, actor_id, document_id, "reviewer", "accept_review")?;

        let workflow_id = self.db.with_transaction(|tx| {
            let current = self.documents.get_tx(tx, document_id)?;
            StateRegistry::validate_transition(current.status, DocumentStatus::UnderReview)?;
            self.documents.set_status_tx(tx, document_id, DocumentStatus::UnderReview)?;

            let open_wf = self
                .workflows
                .open_for_document(document_id)?
                .into_iter()
                .find(|w| w.workflow_type == WorkflowType::Review)
                .ok_or_else(|| QmsError::Conflict {
                    message: "no open review workflow".to_string(),
                })?;
            self.workflows.record_transition(
                tx,
                &WorkflowTransition {
                    id: Uuid::new_v4(),
                    workflow_instance_id: open_wf.id,
                    from_state: current.status.as_str().to_string(),
                    to_state: DocumentStatus::UnderReview.as_str().to_string(),
                    actor_id,
                    comment: comment.clone(),
                    occurred_at: Utc::now(),
                },
            )?;
            self.audit.append(
                tx,
                actor_id,
                AuditAction::ReviewAccepted,
                "Document",
                document_id,
                Some(json!({ "comment": comment })),
                None,
            )?;

            Ok(open_wf.id)
        })?;

        Ok(EngineOutcome::ok(DocumentStatus::UnderReview, Some(workflow_id)))
    }

    /// Record the reviewer's decision. On rejection the document returns to
    /// Draft in the same call.
    ///
    /// On approval: exactly one email goes to the author. No `task_assigned`
    /// notification is sent here even though the author still has to call
    /// `route_for_approval` next; that email is `route_for_approval`'s job.
    pub fn complete_review(
        &self,
        actor_id: Uuid,
        document_id: Uuid,
        approved: bool,
        comment: Option<String>,
    ) -> Result<EngineOutcome> {
        let doc = self.documents.get(document_id)?;
        let actor = self.users.get(actor_id)?;
        self.ensure_identity_or_admin(&actor, doc.reviewer_id, actor_id, document_id, "reviewer", "complete_review")?;

        let (final_state, workflow_id) = self.db.with_transaction(|tx| {
            let current = self.documents.get_tx(tx, document_id)?;
            let open_wf = self
                .workflows
                .open_for_document(document_id)?
                .into_iter()
                .find(|w| w.workflow_type == WorkflowType::Review)
                .ok_or_else(|| QmsError::Conflict {
                    message: "no open review workflow".to_string(),
                })?;

            let next_state = if approved {
                DocumentStatus::ReviewCompleted
            } else {
                DocumentStatus::Draft
            };
            StateRegistry::validate_transition(current.status, next_state)?;
            self.documents.set_status_tx(tx, document_id, next_state)?;

            self.workflows.record_transition(
                tx,
                &WorkflowTransition {
                    id: Uuid::new_v4(),
                    workflow_instance_id: open_wf.id,
                    from_state: current.status.as_str().to_string(),
                    to_state: next_state.as_str().to_string(),
                    actor_id,
                    comment: comment.clone(),
                    occurred_at: Utc::now(),
                },
            )?;
            self.workflows.set_status(tx, open_wf.id, WorkflowStatus::Completed, Some(Utc::now()))?;

            self.audit.append(
                tx,
                actor_id,
                if approved {
                    AuditAction::ReviewCompleted
                } else {
                    AuditAction::ReviewRejected
                },
                "Document",
                document_id,
                Some(json!({ "comment": comment })),
                None,
            )?;

            Ok((next_state, open_wf.id))
        })?;

        if approved {
            self.notify(
                "review_approved",
                vec![doc.author_id],
                json!({ "document_number": doc.document_number }),
            );
        } else {
            self.notify(
                "review_rejected",
                vec![doc.author_id],
                json!({ "document_number": doc.document_number }),
            );
        }

        Ok(EngineOutcome::ok(final_state, Some(workflow_id)))
    }

    /// Route a reviewed document for approval; the approver may be
    /// re-selected. This is where the single `task_assigned` email for the
    /// approver is sent.
    pub fn route_for_approval(
        &self,
        actor_id: Uuid,
        document_id: Uuid,
        approver_id: Option<Uuid>,
        comment: Option<String>,
    ) -> Result<EngineOutcome> {
        let doc = self.documents.get(document_id)?;
        let actor = self.users.get(actor_id)?;
        self.ensure_identity_or_admin(&actor, Some(doc.author_id), actor_id, document_id, "author", "route_for_approval")?;

        let workflow_id = self.db.with_transaction(|tx| {
            let current = self.documents.get_tx(tx, document_id)?;
            StateRegistry::validate_transition(current.status, DocumentStatus::PendingApproval)?;
            if let Some(new_approver) = approver_id {
                self.documents.set_reviewer_approver_tx(tx, document_id, current.reviewer_id, Some(new_approver))?;
            }
            self.documents.set_status_tx(tx, document_id, DocumentStatus::PendingApproval)?;

            let wf = WorkflowInstance {
                id: Uuid::new_v4(),
                document_id,
                workflow_type: WorkflowType::Approval,
                status: WorkflowStatus::Open,
                initiated_by: actor_id,
                initiated_at: Utc::now(),
                completed_at: None,
                due_at: Some(Utc::now() + Duration::days(14)),
            };
            self.workflows.insert(tx, &wf)?;
            self.workflows.record_transition(
                tx,
                &WorkflowTransition {
                    id: Uuid::new_v4(),
                    workflow_instance_id: wf.id,
                    from_state: current.status.as_str().to_string(),
                    to_state: DocumentStatus::PendingApproval.as_str().to_string(),
                    actor_id,
                    comment: comment.clone(),
                    occurred_at: Utc::now(),
                },
            )?;
            self.audit.append(
                tx,
                actor_id,
                AuditAction::RoutedForApproval,
                "Document",
                document_id,
                Some(json!({ "approver_id": approver_id })),
                None,
            )?;

            Ok(wf.id)
        })?;

        let target_approver = approver_id.or(doc.approver_id);
        if let Some(approver) = target_approver {
            self.notify(
                "task_assigned",
                vec![approver],
                json!({ "document_number": doc.document_number, "role": "approver" }),
            );
        }

        Ok(EngineOutcome::ok(DocumentStatus::PendingApproval, Some(workflow_id)))
    }

    /// Approver accepts an assigned approval, moving it from the queue into
    /// active approval. No notification is specified for this hop (§4.9).
    pub fn accept_approval(&self, actor_id: Uuid, document_id: Uuid, comment: Option<String>) -> Result<EngineOutcome> {
        let doc = self.documents.get(document_id)?;
        let actor = self.users.get(actor_id)?;
        self.ensure_identity_or_admin(&actor, doc.approver_id, actor_id, document_id, "approver", "accept_approval")?;

        let workflow_id = self.db.with_transaction(|tx| {
            let current = self.documents.get_tx(tx, document_id)?;
            StateRegistry::validate_transition(current.status, DocumentStatus::UnderApproval)?;
            self.documents.set_status_tx(tx, document_id, DocumentStatus::UnderApproval)?;

            let open_wf = self
                .workflows
                .open_for_document(document_id)?
                .into_iter()
                .find(|w| w.workflow_type == WorkflowType::Approval)
                .ok_or_else(|| QmsError::Conflict {
                    message: "no open approval workflow".to_string(),
                })?;
            self.workflows.record_transition(
                tx,
                &WorkflowTransition {
                    id: Uuid::new_v4(),
                    workflow_instance_id: open_wf.id,
                    from_state: current.status.as_str().to_string(),
                    to_state: DocumentStatus::UnderApproval.as_str().to_string(),
                    actor_id,
                    comment: comment.clone(),
                    occurred_at: Utc::now(),
                },
            )?;
            self.audit.append(
                tx,
                actor_id,
                AuditAction::ApprovalAccepted,
                "Document",
                document_id,
                Some(json!({ "comment": comment })),
                None,
            )?;

            Ok(open_wf.id)
        })?;

        Ok(EngineOutcome::ok(DocumentStatus::UnderApproval, Some(workflow_id)))
    }

    /// Approve a document. If `effective_date` is today or earlier the
    /// document is finalized effective in this same call; otherwise it
    /// waits in ApprovedPendingEffective for the scheduler's
    /// `process-effective-dates` task.
    pub fn approve_document(
        &self,
        actor_id: Uuid,
        document_id: Uuid,
        effective_date: NaiveDate,
        comment: Option<String>,
    ) -> Result<EngineOutcome> {
        let doc = self.documents.get(document_id)?;
        let actor = self.users.get(actor_id)?;
        self.ensure_identity_or_admin(&actor, doc.approver_id, actor_id, document_id, "approver", "approve_document")?;

        let unmet = self.dependencies.unmet_critical(&self.documents, document_id)?;
        if !unmet.is_empty() {
            self.record_denial(actor_id, "Document", document_id, "n/a", "approve_document");
            return Err(QmsError::CriticalDependencyUnmet {
                document_number: doc.document_number.clone(),
                offending: unmet,
            });
        }

        let today = Utc::now().date_naive();
        let goes_effective = effective_date <= today;
        let next_state = if goes_effective {
            DocumentStatus::Effective
        } else {
            DocumentStatus::ApprovedPendingEffective
        };

        let (final_state, workflow_id, warnings) = self.db.with_transaction(|tx| {
            let current = self.documents.get_tx(tx, document_id)?;
            StateRegistry::validate_transition(current.status, next_state)?;

            let open_wf = self
                .workflows
                .open_for_document(document_id)?
                .into_iter()
                .find(|w| w.workflow_type == WorkflowType::Approval)
                .ok_or_else(|| QmsError::Conflict {
                    message: "no open approval workflow".to_string(),
                })?;

            self.documents.set_effective_date_tx(tx, document_id, effective_date)?;
            self.audit.append(
                tx,
                actor_id,
                AuditAction::ApprovalGranted,
                "Document",
                document_id,
                Some(json!({ "effective_date": effective_date.to_string() })),
                None,
            )?;

            if goes_effective {
                self.workflows.record_transition(
                    tx,
                    &WorkflowTransition {
                        id: Uuid::new_v4(),
                        workflow_instance_id: open_wf.id,
                        from_state: current.status.as_str().to_string(),
                        to_state: DocumentStatus::Effective.as_str().to_string(),
                        actor_id,
                        comment: comment.clone(),
                        occurred_at: Utc::now(),
                    },
                )?;
                let approved_doc = self.documents.get_tx(tx, document_id)?;
                let (state, warnings) = self.finalize_effective_tx(tx, &approved_doc, actor_id, Some(open_wf.id))?;
                Ok((state, Some(open_wf.id), warnings))
            } else {
                self.documents.set_status_tx(tx, document_id, DocumentStatus::ApprovedPendingEffective)?;
                self.workflows.record_transition(
                    tx,
                    &WorkflowTransition {
                        id: Uuid::new_v4(),
                        workflow_instance_id: open_wf.id,
                        from_state: current.status.as_str().to_string(),
                        to_state: DocumentStatus::ApprovedPendingEffective.as_str().to_string(),
                        actor_id,
                        comment: comment.clone(),
                        occurred_at: Utc::now(),
                    },
                )?;
                self.workflows.set_status(tx, open_wf.id, WorkflowStatus::Completed, Some(Utc::now()))?;
                Ok((DocumentStatus::ApprovedPendingEffective, Some(open_wf.id), Vec::new()))
            }
        })?;

        self.notify(
            "approval_recorded",
            vec![doc.author_id],
            json!({ "document_number": doc.document_number, "new_state": final_state.as_str() }),
        );

        Ok(EngineOutcome {
            warnings,
            ..EngineOutcome::ok(final_state, workflow_id)
        })
    }

    /// Reject an approval, returning the document to Draft in one call.
    pub fn reject_approval(&self, actor_id: Uuid, document_id: Uuid, reason: String) -> Result<EngineOutcome> {
        let doc = self.documents.get(document_id)?;
        let actor = self.users.get(actor_id)?;
        self.ensure_identity_or_admin(&actor, doc.approver_id, actor_id, document_id, "approver", "reject_approval")?;

        let workflow_id = self.db.with_transaction(|tx| {
            let current = self.documents.get_tx(tx, document_id)?;
            StateRegistry::validate_transition(current.status, DocumentStatus::Draft)?;

            let open_wf = self
                .workflows
                .open_for_document(document_id)?
                .into_iter()
                .find(|w| w.workflow_type == WorkflowType::Approval);

            self.documents.set_status_tx(tx, document_id, DocumentStatus::Draft)?;
            self.documents.set_reviewer_approver_tx(tx, document_id, None, None)?;

            if let Some(wf) = &open_wf {
                self.workflows.record_transition(
                    tx,
                    &WorkflowTransition {
                        id: Uuid::new_v4(),
                        workflow_instance_id: wf.id,
                        from_state: current.status.as_str().to_string(),
                        to_state: DocumentStatus::Draft.as_str().to_string(),
                        actor_id,
                        comment: Some(reason.clone()),
                        occurred_at: Utc::now(),
                    },
                )?;
                self.workflows.set_status(tx, wf.id, WorkflowStatus::Completed, Some(Utc::now()))?;
            }

            self.audit.append(
                tx,
                actor_id,
                AuditAction::ApprovalRejected,
                "Document",
                document_id,
                Some(json!({ "reason": reason })),
                None,
            )?;

            Ok(open_wf.map(|w| w.id))
        })?;

        self.notify(
            "approval_rejected",
            vec![doc.author_id],
            json!({ "document_number": doc.document_number }),
        );

        Ok(EngineOutcome::ok(DocumentStatus::Draft, workflow_id))
    }

    /// Start a new version off an Effective document, copying its
    /// dependency edges with "smart copy" resolution: each copied edge
    /// points at the target family's current effective member, or is
    /// flagged unresolved if the family has none.
    pub fn start_version_workflow(
        &self,
        actor_id: Uuid,
        existing_document_id: Uuid,
        version_type: VersionType,
        reason_for_change: String,
        summary_of_changes: String,
        new_reviewer_id: Option<Uuid>,
        new_approver_id: Option<Uuid>,
    ) -> Result<EngineOutcome> {
        let existing = self.documents.get(existing_document_id)?;
        let actor = self.users.get(actor_id)?;
        self.ensure_capability(&actor, Capability::Write, actor_id, existing_document_id, "start_version_workflow")?;

        if existing.status != DocumentStatus::Effective {
            return Err(QmsError::InvalidTransition {
                from_state: existing.status.as_str().to_string(),
                to_state: DocumentStatus::Draft.as_str().to_string(),
            });
        }
        if reason_for_change.trim().is_empty() {
            return Err(QmsError::MissingRequiredField {
                field: "reason_for_change".to_string(),
            });
        }
        if summary_of_changes.trim().is_empty() {
            return Err(QmsError::MissingRequiredField {
                field: "summary_of_changes".to_string(),
            });
        }

        let (new_version_major, new_version_minor) = match version_type {
            VersionType::Major => (existing.version_major + 1, 0),
            VersionType::Minor => (existing.version_major, existing.version_minor + 1),
        };

        let new_document_id = Uuid::new_v4();
        let mut warnings = Vec::new();

        self.db.with_transaction(|tx| {
            let existing = self.documents.get_tx(tx, existing_document_id)?;
            let now = Utc::now();
            let document_number = self.documents.next_document_number(&existing.document_type, now.year())?;

            let new_doc = Document {
                id: new_document_id,
                document_number,
                title: existing.title.clone(),
                description: existing.description.clone(),
                document_type: existing.document_type.clone(),
                source: existing.source.clone(),
                version_major: new_version_major,
                version_minor: new_version_minor,
                family_key: existing.family_key,
                status: DocumentStatus::Draft,
                effective_date: None,
                obsolescence_date: None,
                next_periodic_review_date: None,
                author_id: actor_id,
                reviewer_id: new_reviewer_id,
                approver_id: new_approver_id,
                file_reference: existing.file_reference.clone(),
                reason_for_change: Some(reason_for_change.clone()),
                is_active: true,
                created_at: now,
                updated_at: now,
            };
            new_doc.validate()?;
            self.documents.insert_tx(tx, &new_doc)?;

            for dep in self.dependencies.by_source(existing_document_id)? {
                let target = self.documents.get_tx(tx, dep.target_document_id)?;
                let resolved_target = match self.documents.latest_effective(target.family_key)? {
                    Some(effective_target) => effective_target.id,
                    None => {
                        warnings.push(format!(
                            "UNRESOLVED_DEPENDENCY: {} has no effective member to copy forward",
                            target.document_number
                        ));
                        dep.target_document_id
                    }
                };

                self.dependencies.insert_tx(
                    tx,
                    &DocumentDependency {
                        id: Uuid::new_v4(),
                        source_document_id: new_document_id,
                        target_document_id: resolved_target,
                        dependency_type: dep.dependency_type,
                        is_critical: dep.is_critical,
                        created_at: now,
                    },
                )?;
            }

            self.audit.append(
                tx,
                actor_id,
                AuditAction::VersionWorkflowStarted,
                "Document",
                new_document_id,
                Some(json!({
                    "source_document_id": existing_document_id,
                    "version": format!("{new_version_major}.{new_version_minor}"),
                    "summary_of_changes": summary_of_changes,
                })),
                None,
            )?;

            Ok(())
        })?;

        Ok(EngineOutcome {
            success: true,
            new_state: Some(DocumentStatus::Draft),
            workflow_id: None,
            warnings,
            requires_upversion: false,
            new_document_id: Some(new_document_id),
        })
    }

    /// Schedule a document for obsolescence. If `target_date` is today or
    /// earlier the obsolescence is applied immediately in this call,
    /// otherwise it waits for the scheduler's `process-obsoletion-dates`
    /// task (see [`Self::mark_obsolete`]).
    pub fn schedule_obsolescence(
        &self,
        actor_id: Uuid,
        document_id: Uuid,
        target_date: NaiveDate,
        reason: String,
    ) -> Result<EngineOutcome> {
        let doc = self.documents.get(document_id)?;
        let actor = self.users.get(actor_id)?;
        self.ensure_identity_or_admin(&actor, doc.approver_id, actor_id, document_id, "approver", "schedule_obsolescence")?;

        if doc.status != DocumentStatus::Effective {
            return Err(QmsError::InvalidTransition {
                from_state: doc.status.as_str().to_string(),
                to_state: DocumentStatus::ScheduledForObsolescence.as_str().to_string(),
            });
        }

        let dependents = self.dependencies.active_critical_dependents(&self.documents, document_id)?;
        if !dependents.is_empty() {
            self.record_denial(actor_id, "Document", document_id, "n/a", "schedule_obsolescence");
            return Err(QmsError::DependentStillActive {
                document_number: doc.document_number.clone(),
                dependents,
            });
        }

        let today = Utc::now().date_naive();
        let goes_now = target_date <= today;

        let target_state = if goes_now {
            DocumentStatus::Obsolete
        } else {
            DocumentStatus::ScheduledForObsolescence
        };

        let final_state = self.db.with_transaction(|tx| {
            let current = self.documents.get_tx(tx, document_id)?;
            StateRegistry::validate_transition(current.status, target_state)?;
            self.documents.set_status_tx(tx, document_id, target_state)?;
            self.documents.set_obsolescence_date_tx(tx, document_id, target_date)?;
            self.audit.append(
                tx,
                actor_id,
                AuditAction::ObsolescenceScheduled,
                "Document",
                document_id,
                Some(json!({ "target_date": target_date.to_string(), "reason": reason.clone() })),
                None,
            )?;

            if goes_now {
                for wf in self.workflows.open_for_document(document_id)? {
                    self.workflows.set_status(tx, wf.id, WorkflowStatus::Cancelled, Some(Utc::now()))?;
                }
                self.audit.append(
                    tx,
                    actor_id,
                    AuditAction::DocumentObsoleted,
                    "Document",
                    document_id,
                    Some(json!({ "reason": reason })),
                    None,
                )?;
            }
            Ok(target_state)
        })?;

        self.notify(
            "obsolescence_scheduled",
            vec![doc.author_id],
            json!({ "document_number": doc.document_number, "new_state": final_state.as_str() }),
        );

        Ok(EngineOutcome::ok(final_state, None))
    }

    /// Finalize a document already in ScheduledForObsolescence to Obsolete.
    /// Invoked by the scheduler; idempotent against an already-obsolete
    /// document so a retried run is harmless.
    pub fn mark_obsolete(&self, actor_id: Uuid, document_id: Uuid) -> Result<EngineOutcome> {
        let final_state = self.db.with_transaction(|tx| {
            let current = self.documents.get_tx(tx, document_id)?;
            if current.status == DocumentStatus::Obsolete {
                return Ok(DocumentStatus::Obsolete);
            }
            StateRegistry::validate_transition(current.status, DocumentStatus::Obsolete)?;
            self.documents.set_status_tx(tx, document_id, DocumentStatus::Obsolete)?;
            for wf in self.workflows.open_for_document(document_id)? {
                self.workflows.set_status(tx, wf.id, WorkflowStatus::Cancelled, Some(Utc::now()))?;
            }
            self.audit.append(tx, actor_id, AuditAction::DocumentObsoleted, "Document", document_id, None, None)?;
            Ok(DocumentStatus::Obsolete)
        })?;

        Ok(EngineOutcome::ok(final_state, None))
    }

    /// Finalize an ApprovedPendingEffective document to Effective. Shared by
    /// the synchronous path inside `approve_document` (when the effective
    /// date has already arrived) and the scheduler's `process-effective-dates`
    /// task.
    fn finalize_effective_tx(
        &self,
        tx: &rusqlite::Transaction,
        doc: &Document,
        actor_id: Uuid,
        approval_workflow_id: Option<Uuid>,
    ) -> Result<(DocumentStatus, Vec<String>)> {
        let mut warnings = Vec::new();
        StateRegistry::validate_transition(doc.status, DocumentStatus::Effective)?;

        let unmet = self.dependencies.unmet_critical(&self.documents, doc.id)?;
        if !unmet.is_empty() {
            return Err(QmsError::CriticalDependencyUnmet {
                document_number: doc.document_number.clone(),
                offending: unmet,
            });
        }

        self.documents.set_status_tx(tx, doc.id, DocumentStatus::Effective)?;

        if let Some(wf_id) = approval_workflow_id {
            self.workflows.set_status(tx, wf_id, WorkflowStatus::Completed, Some(Utc::now()))?;
        }

        let refreshed = self.documents.get_tx(tx, doc.id)?;
        let resolver = FamilyResolver::new(&self.documents, &self.dependencies);
        resolver.on_new_version_effective(tx, &self.audit, actor_id, &refreshed)?;

        self.audit.append(tx, actor_id, AuditAction::DocumentEffective, "Document", doc.id, None, None)?;

        if let Some(file_reference) = refreshed.file_reference.clone() {
            let version_history: Vec<String> = self
                .documents
                .list_by_family(refreshed.family_key)?
                .into_iter()
                .map(|d| {
                    format!(
                        "{} effective {}",
                        d.version_string(),
                        d.effective_date.map(|date| date.to_string()).unwrap_or_default()
                    )
                })
                .collect();

            let approver_name = match refreshed.approver_id {
                Some(id) => self.users.get_tx(tx, id)?.display_name,
                None => "Unknown".to_string(),
            };

            let request = ArtifactRequest {
                document: &refreshed,
                approver_name: &approver_name,
                approval_time: Utc::now(),
                version_history,
                extra_placeholders: Default::default(),
            };
            let rendered = render_and_store(&request, self.file_store)?;
            self.documents.set_file_reference_tx(tx, doc.id, &rendered.storage_key)?;
            self.audit.append(
                tx,
                actor_id,
                AuditAction::DocumentSigned,
                "Document",
                doc.id,
                Some(json!({ "checksum": rendered.checksum, "storage_key": rendered.storage_key, "original": file_reference })),
                None,
            )?;
        } else {
            warnings.push("no file_reference present; artifact pipeline skipped".to_string());
        }

        Ok((DocumentStatus::Effective, warnings))
    }

    /// Scheduler entry point: finalize a document whose effective date has
    /// arrived but which is still sitting in ApprovedPendingEffective.
    pub fn process_effective_date(&self, actor_id: Uuid, document_id: Uuid) -> Result<EngineOutcome> {
        let (state, warnings) = self.db.with_transaction(|tx| {
            let doc = self.documents.get_tx(tx, document_id)?;
            if doc.status == DocumentStatus::Effective {
                return Ok((DocumentStatus::Effective, Vec::new()));
            }
            self.finalize_effective_tx(tx, &doc, actor_id, None)
        })?;

        Ok(EngineOutcome {
            warnings,
            ..EngineOutcome::ok(state, None)
        })
    }

    /// Terminate a document outside the normal obsolescence path (e.g. a
    /// draft that will never be finished, an in-flight document that fails
    /// review or approval, or a live document pulled for cause). Obsolete,
    /// Superseded, and already-Terminated documents cannot be terminated
    /// this way; legality of every other source state is decided by
    /// `StateRegistry`.
    pub fn terminate_document(&self, actor_id: Uuid, document_id: Uuid, reason: String) -> Result<EngineOutcome> {
        let doc = self.documents.get(document_id)?;
        let actor = self.users.get(actor_id)?;
        self.ensure_identity_or_admin(&actor, Some(doc.author_id), actor_id, document_id, "author", "terminate_document")?;

        if StateRegistry::validate_transition(doc.status, DocumentStatus::Terminated).is_err() {
            self.record_denial(actor_id, "Document", document_id, "n/a", "terminate_document");
            return Err(QmsError::InvalidTransition {
                from_state: doc.status.as_str().to_string(),
                to_state: DocumentStatus::Terminated.as_str().to_string(),
            });
        }

        self.db.with_transaction(|tx| {
            let current = self.documents.get_tx(tx, document_id)?;
            StateRegistry::validate_transition(current.status, DocumentStatus::Terminated)?;
            self.documents.set_status_tx(tx, document_id, DocumentStatus::Terminated)?;
            self.documents.set_active_tx(tx, document_id, false)?;

            for wf in self.workflows.open_for_document(document_id)? {
                self.workflows.set_status(tx, wf.id, WorkflowStatus::Cancelled, Some(Utc::now()))?;
            }

            self.audit.append(
                tx,
                actor_id,
                AuditAction::DocumentTerminated,
                "Document",
                document_id,
                Some(json!({ "reason": reason })),
                None,
            )?;
            Ok(())
        })?;

        let mut recipients = Vec::new();
        if let Some(r) = doc.reviewer_id {
            recipients.push(r);
        }
        if let Some(a) = doc.approver_id {
            recipients.push(a);
        }
        self.notify(
            "workflow_cancelled",
            recipients,
            json!({ "document_number": doc.document_number }),
        );

        Ok(EngineOutcome::ok(DocumentStatus::Terminated, None))
    }

    /// Record the outcome of a periodic review. `MinorUpVersion` and
    /// `MajorUpVersion` set `requires_upversion` on the outcome so the
    /// caller knows to follow up with `start_version_workflow`; the review
    /// itself does not start one, since the author chooses the reason and
    /// summary of changes.
    pub fn record_periodic_review_outcome(
        &self,
        actor_id: Uuid,
        document_id: Uuid,
        review_id: Uuid,
        outcome: ReviewOutcome,
        comment: Option<String>,
        next_review_date: Option<NaiveDate>,
    ) -> Result<EngineOutcome> {
        let doc = self.documents.get(document_id)?;
        let actor = self.users.get(actor_id)?;
        self.ensure_capability(&actor, Capability::Review, actor_id, document_id, "record_periodic_review_outcome")?;

        self.db.with_transaction(|tx| {
            use crate::review::PeriodicReviewRepo;
            let reviews = PeriodicReviewRepo::new(self.db);
            reviews.complete_tx(tx, review_id, actor_id, outcome, comment.clone())?;
            self.documents.set_next_periodic_review_date_tx(tx, document_id, next_review_date)?;
            self.audit.append(
                tx,
                actor_id,
                AuditAction::PeriodicReviewCompleted,
                "Document",
                document_id,
                Some(json!({ "review_id": review_id, "outcome": outcome.as_str(), "comment": comment })),
                None,
            )?;
            Ok(())
        })?;

        let requires_upversion = matches!(outcome, ReviewOutcome::MinorUpVersion | ReviewOutcome::MajorUpVersion);
        if requires_upversion {
            self.notify(
                "task_assigned",
                vec![doc.author_id],
                json!({ "document_number": doc.document_number, "role": "author", "reason": "periodic review requires up-version" }),
            );
        }

        Ok(EngineOutcome {
            success: true,
            new_state: Some(doc.status),
            workflow_id: None,
            warnings: Vec::new(),
            requires_upversion,
            new_document_id: None,
        })
    }

    /// Grant the admin capability to a user.
    pub fn grant_superuser(&self, actor_id: Uuid, target_id: Uuid) -> Result<EngineOutcome> {
        let actor = self.users.get(actor_id)?;
        if !actor.has_capability(Capability::Admin) {
            self.record_denial(actor_id, "User", target_id, "admin", "grant_superuser");
            return Err(QmsError::PermissionDenied {
                capability: "admin".to_string(),
                operation: "grant_superuser".to_string(),
            });
        }

        self.db.with_transaction(|tx| {
            let mut target = self.users.get_tx(tx, target_id)?;
            target.capabilities.insert(Capability::Admin);
            self.users.set_capabilities_tx(tx, target_id, &target.capabilities)?;
            self.audit.append(tx, actor_id, AuditAction::SuperuserGranted, "User", target_id, None, None)?;
            Ok(())
        })?;

        Ok(EngineOutcome {
            success: true,
            new_state: None,
            workflow_id: None,
            warnings: Vec::new(),
            requires_upversion: false,
            new_document_id: None,
        })
    }

    /// Revoke the admin capability from a user, refusing if it would leave
    /// zero active superusers. The last-superuser check runs both before
    /// acquiring the write lock (so the common case gets a denial audit
    /// entry even though the protecting transaction never opens) and again
    /// inside it, to close the race against a concurrent grant/revoke.
    pub fn revoke_superuser(&self, actor_id: Uuid, target_id: Uuid) -> Result<EngineOutcome> {
        let actor = self.users.get(actor_id)?;
        if !actor.has_capability(Capability::Admin) {
            self.record_denial(actor_id, "User", target_id, "admin", "revoke_superuser");
            return Err(QmsError::PermissionDenied {
                capability: "admin".to_string(),
                operation: "revoke_superuser".to_string(),
            });
        }

        let target = self.users.get(target_id)?;
        if target.capabilities.contains(&Capability::Admin) && self.users.active_admin_count()? <= 1 {
            self.record_denial(actor_id, "User", target_id, "n/a", "revoke_superuser");
            return Err(QmsError::LastSuperuserProtected {
                user_id: target_id.to_string(),
            });
        }

        self.db.with_transaction(|tx| {
            let mut target = self.users.get_tx(tx, target_id)?;
            if target.capabilities.contains(&Capability::Admin) && self.users.active_admin_count_tx(tx)? <= 1 {
                return Err(QmsError::LastSuperuserProtected {
                    user_id: target_id.to_string(),
                });
            }
            target.capabilities.remove(&Capability::Admin);
            self.users.set_capabilities_tx(tx, target_id, &target.capabilities)?;
            self.audit.append(tx, actor_id, AuditAction::SuperuserRevoked, "User", target_id, None, None)?;
            Ok(())
        })?;

        Ok(EngineOutcome {
            success: true,
            new_state: None,
            workflow_id: None,
            warnings: Vec::new(),
            requires_upversion: false,
            new_document_id: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentType;
    use crate::filestore::LocalFileStore;
    use crate::notification::LoggingNotificationDispatcher;
    use std::collections::HashSet;
    use tempfile::TempDir;

    struct Fixture {
        db: Database,
        _dir: TempDir,
        author: Uuid,
        reviewer: Uuid,
        approver: Uuid,
        admin: Uuid,
    }

    fn setup() -> Fixture {
        let db = Database::in_memory().unwrap();
        let documents = DocumentRepo::new(&db);
        documents
            .insert_type(&DocumentType {
                code: "SOP".to_string(),
                name: "Standard Operating Procedure".to_string(),
                number_prefix: "SOP".to_string(),
                default_periodic_review_months: Some(24),
            })
            .unwrap();

        let users = UserRepo::new(&db);
        let mut make_user = |name: &str, caps: &[Capability]| -> Uuid {
            let id = Uuid::new_v4();
            users
                .insert(&User {
                    id,
                    username: name.to_string(),
                    display_name: name.to_string(),
                    capabilities: caps.iter().copied().collect::<HashSet<_>>(),
                    is_active: true,
                    created_at: Utc::now(),
                })
                .unwrap();
            id
        };

        let author = make_user("author", &[Capability::Write]);
        let reviewer = make_user("reviewer", &[Capability::Review]);
        let approver = make_user("approver", &[Capability::Approve]);
        let admin = make_user("admin", &[Capability::Admin]);

        let dir = TempDir::new().unwrap();
        Fixture {
            db,
            _dir: dir,
            author,
            reviewer,
            approver,
            admin,
        }
    }

    fn make_draft(fixture: &Fixture, number: &str) -> Document {
        let documents = DocumentRepo::new(&fixture.db);
        let now = Utc::now();
        let doc = Document {
            id: Uuid::new_v4(),
            document_number: number.to_string(),
            title: "Quality Management System Overview".to_string(),
            description: None,
            document_type: "SOP".to_string(),
            source: "INTERNAL".to_string(),
            version_major: 1,
            version_minor: 0,
            family_key: Uuid::new_v4(),
            status: DocumentStatus::Draft,
            effective_date: None,
            obsolescence_date: None,
            next_periodic_review_date: None,
            author_id: fixture.author,
            reviewer_id: None,
            approver_id: None,
            file_reference: Some("documents/placeholder/1.0/original".to_string()),
            reason_for_change: None,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        documents.insert(&doc).unwrap();
        doc
    }

    fn engine(fixture: &Fixture, store: &LocalFileStore) -> LifecycleEngine<'_> {
        LifecycleEngine::new(&fixture.db, store, Arc::new(LoggingNotificationDispatcher))
    }

    #[test]
    fn test_happy_path_to_effective() {
        let fixture = setup();
        let store = LocalFileStore::new(fixture._dir.path());
        let engine = engine(&fixture, &store);
        let doc = make_draft(&fixture, "SOP-2026-0001");

        engine
            .submit_for_review(fixture.author, doc.id, fixture.reviewer, fixture.approver, None)
            .unwrap();
        engine.accept_review(fixture.reviewer, doc.id, None).unwrap();

        let after_review = engine
            .complete_review(fixture.reviewer, doc.id, true, Some("looks good".to_string()))
            .unwrap();
        assert_eq!(after_review.new_state, Some(DocumentStatus::ReviewCompleted));

        engine.route_for_approval(fixture.author, doc.id, None, None).unwrap();
        engine.accept_approval(fixture.approver, doc.id, None).unwrap();

        let past_date = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let outcome = engine
            .approve_document(fixture.approver, doc.id, past_date, None)
            .unwrap();
        assert_eq!(outcome.new_state, Some(DocumentStatus::Effective));

        let documents = DocumentRepo::new(&fixture.db);
        let fetched = documents.get(doc.id).unwrap();
        assert_eq!(fetched.status, DocumentStatus::Effective);
        assert!(fetched.file_reference.unwrap().ends_with("signed.pdf"));
    }

    #[test]
    fn test_review_rejection_returns_to_draft() {
        let fixture = setup();
        let store = LocalFileStore::new(fixture._dir.path());
        let engine = engine(&fixture, &store);
        let doc = make_draft(&fixture, "SOP-2026-0002");

        engine
            .submit_for_review(fixture.author, doc.id, fixture.reviewer, fixture.approver, None)
            .unwrap();
        engine.accept_review(fixture.reviewer, doc.id, None).unwrap();
        let outcome = engine
            .complete_review(fixture.reviewer, doc.id, false, Some("needs rework".to_string()))
            .unwrap();
        assert_eq!(outcome.new_state, Some(DocumentStatus::Draft));
    }

    #[test]
    fn test_critical_dependency_blocks_approval() {
        let fixture = setup();
        let store = LocalFileStore::new(fixture._dir.path());
        let engine = engine(&fixture, &store);

        let dependency_target = make_draft(&fixture, "SOP-2026-0010");
        let doc = make_draft(&fixture, "SOP-2026-0011");

        let deps = DependencyRepo::new(&fixture.db);
        deps.insert(&DocumentDependency {
            id: Uuid::new_v4(),
            source_document_id: doc.id,
            target_document_id: dependency_target.id,
            dependency_type: crate::dependency::DependencyType::Implements,
            is_critical: true,
            created_at: Utc::now(),
        })
        .unwrap();

        engine
            .submit_for_review(fixture.author, doc.id, fixture.reviewer, fixture.approver, None)
            .unwrap();
        engine.accept_review(fixture.reviewer, doc.id, None).unwrap();
        engine.complete_review(fixture.reviewer, doc.id, true, None).unwrap();
        engine.route_for_approval(fixture.author, doc.id, None, None).unwrap();
        engine.accept_approval(fixture.approver, doc.id, None).unwrap();

        let past_date = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let result = engine.approve_document(fixture.approver, doc.id, past_date, None);
        assert!(matches!(result, Err(QmsError::CriticalDependencyUnmet { .. })));
    }

    #[test]
    fn test_last_superuser_protected() {
        let fixture = setup();
        let store = LocalFileStore::new(fixture._dir.path());
        let engine = engine(&fixture, &store);

        let result = engine.revoke_superuser(fixture.admin, fixture.admin);
        assert!(matches!(result, Err(QmsError::LastSuperuserProtected { .. })));

        let audit = AuditLog::new(&fixture.db);
        let entries = audit.entries_for_entity("User", fixture.admin).unwrap();
        assert!(entries.iter().any(|e| e.action == AuditAction::AccessDenied));
    }

    #[test]
    fn test_permission_denied_records_access_denied_audit() {
        let fixture = setup();
        let store = LocalFileStore::new(fixture._dir.path());
        let engine = engine(&fixture, &store);
        let doc = make_draft(&fixture, "SOP-2026-0020");

        let result = engine.submit_for_review(fixture.reviewer, doc.id, fixture.reviewer, fixture.approver, None);
        assert!(matches!(result, Err(QmsError::PermissionDenied { .. })));

        let audit = AuditLog::new(&fixture.db);
        let entries = audit.entries_for_entity("Document", doc.id).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, AuditAction::AccessDenied);
    }

    #[test]
    fn test_start_version_workflow_creates_draft() {
        let fixture = setup();
        let store = LocalFileStore::new(fixture._dir.path());
        let engine = engine(&fixture, &store);
        let doc = make_draft(&fixture, "SOP-2026-0030");

        engine
            .submit_for_review(fixture.author, doc.id, fixture.reviewer, fixture.approver, None)
            .unwrap();
        engine.accept_review(fixture.reviewer, doc.id, None).unwrap();
        engine.complete_review(fixture.reviewer, doc.id, true, None).unwrap();
        engine.route_for_approval(fixture.author, doc.id, None, None).unwrap();
        engine.accept_approval(fixture.approver, doc.id, None).unwrap();
        let past_date = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        engine.approve_document(fixture.approver, doc.id, past_date, None).unwrap();

        let outcome = engine
            .start_version_workflow(
                fixture.author,
                doc.id,
                VersionType::Minor,
                "clarify step 3".to_string(),
                "reworded ambiguous instruction".to_string(),
                Some(fixture.reviewer),
                Some(fixture.approver),
            )
            .unwrap();

        let new_id = outcome.new_document_id.unwrap();
        let documents = DocumentRepo::new(&fixture.db);
        let new_doc = documents.get(new_id).unwrap();
        assert_eq!(new_doc.status, DocumentStatus::Draft);
        assert_eq!(new_doc.version_major, 1);
        assert_eq!(new_doc.version_minor, 1);
    }
}
