use serde::{Deserialize, Serialize};

use crate::error::{QmsError, Result};

/// Lifecycle states a document can occupy. The complete closed set; every
/// persisted status code must be one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentStatus {
    Draft,
    PendingReview,
    UnderReview,
    ReviewCompleted,
    PendingApproval,
    UnderApproval,
    ApprovedPendingEffective,
    Effective,
    ScheduledForObsolescence,
    Obsolete,
    Superseded,
    Rejected,
    Terminated,
    Cancelled,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Draft => "DRAFT",
            DocumentStatus::PendingReview => "PENDING_REVIEW",
            DocumentStatus::UnderReview => "UNDER_REVIEW",
            DocumentStatus::ReviewCompleted => "REVIEW_COMPLETED",
            DocumentStatus::PendingApproval => "PENDING_APPROVAL",
            DocumentStatus::UnderApproval => "UNDER_APPROVAL",
            DocumentStatus::ApprovedPendingEffective => "APPROVED_PENDING_EFFECTIVE",
            DocumentStatus::Effective => "EFFECTIVE",
            DocumentStatus::ScheduledForObsolescence => "SCHEDULED_FOR_OBSOLESCENCE",
            DocumentStatus::Obsolete => "OBSOLETE",
            DocumentStatus::Superseded => "SUPERSEDED",
            DocumentStatus::Rejected => "REJECTED",
            DocumentStatus::Terminated => "TERMINATED",
            DocumentStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn from_str(value: &str) -> Result<Self> {
        match value {
            "DRAFT" => Ok(DocumentStatus::Draft),
            "PENDING_REVIEW" => Ok(DocumentStatus::PendingReview),
            "UNDER_REVIEW" => Ok(DocumentStatus::UnderReview),
            "REVIEW_COMPLETED" => Ok(DocumentStatus::ReviewCompleted),
            "PENDING_APPROVAL" => Ok(DocumentStatus::PendingApproval),
            "UNDER_APPROVAL" => Ok(DocumentStatus::UnderApproval),
            "APPROVED_PENDING_EFFECTIVE" => Ok(DocumentStatus::ApprovedPendingEffective),
            "EFFECTIVE" => Ok(DocumentStatus::Effective),
            "SCHEDULED_FOR_OBSOLESCENCE" => Ok(DocumentStatus::ScheduledForObsolescence),
            "OBSOLETE" => Ok(DocumentStatus::Obsolete),
            "SUPERSEDED" => Ok(DocumentStatus::Superseded),
            "REJECTED" => Ok(DocumentStatus::Rejected),
            "TERMINATED" => Ok(DocumentStatus::Terminated),
            "CANCELLED" => Ok(DocumentStatus::Cancelled),
            other => Err(QmsError::Internal {
                message: format!("unknown document status: {other}"),
            }),
        }
    }

    /// Whether this state has no outgoing transitions. EFFECTIVE is
    /// deliberately excluded: it is quasi-terminal (only the scheduler and
    /// the family resolver move a document out of it), not fully closed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DocumentStatus::Obsolete
                | DocumentStatus::Superseded
                | DocumentStatus::Rejected
                | DocumentStatus::Terminated
                | DocumentStatus::Cancelled
        )
    }

    /// Whether a document in this state counts as "active" for dependency
    /// and supersession checks.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            DocumentStatus::Draft
                | DocumentStatus::PendingReview
                | DocumentStatus::UnderReview
                | DocumentStatus::ReviewCompleted
                | DocumentStatus::PendingApproval
                | DocumentStatus::UnderApproval
                | DocumentStatus::ApprovedPendingEffective
                | DocumentStatus::Effective
        )
    }
}

/// Exhaustive transition table for the document lifecycle. Mirrors the
/// spec's state diagram one arm at a time rather than a generic graph, so
/// an invalid arm is a compile-time omission, not a runtime lookup miss.
pub struct StateRegistry;

impl StateRegistry {
    /// Whether moving from `from` to `to` is a legal transition.
    pub fn can_transition(from: DocumentStatus, to: DocumentStatus) -> bool {
        use DocumentStatus::*;
        matches!(
            (from, to),
            (Draft, PendingReview)
                | (PendingReview, UnderReview)
                | (UnderReview, ReviewCompleted)
                | (UnderReview, Draft)
                | (ReviewCompleted, PendingApproval)
                | (PendingApproval, UnderApproval)
                | (UnderApproval, ApprovedPendingEffective)
                | (UnderApproval, Effective)
                | (UnderApproval, Draft)
                | (ApprovedPendingEffective, Effective)
                | (Effective, ScheduledForObsolescence)
                | (Effective, Obsolete)
                | (ScheduledForObsolescence, Obsolete)
                | (Effective, Superseded)
                | (Draft, Terminated)
                | (PendingReview, Terminated)
                | (UnderReview, Terminated)
                | (ReviewCompleted, Terminated)
                | (PendingApproval, Terminated)
                | (UnderApproval, Terminated)
                | (ApprovedPendingEffective, Terminated)
        )
    }

    /// Validate a transition, producing the closed error variant on failure.
    pub fn validate_transition(from: DocumentStatus, to: DocumentStatus) -> Result<()> {
        if Self::can_transition(from, to) {
            Ok(())
        } else {
            Err(QmsError::InvalidTransition {
                from_state: from.as_str().to_string(),
                to_state: to.as_str().to_string(),
            })
        }
    }
}
