use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::database::Database;
use crate::error::{QmsError, Result};

/// Outcome recorded when a periodic review completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewOutcome {
    Confirmed,
    MinorUpVersion,
    MajorUpVersion,
}

impl ReviewOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewOutcome::Confirmed => "CONFIRMED",
            ReviewOutcome::MinorUpVersion => "MINOR_UPVERSION",
            ReviewOutcome::MajorUpVersion => "MAJOR_UPVERSION",
        }
    }

    pub fn from_str(value: &str) -> Result<Self> {
        match value {
            "CONFIRMED" => Ok(ReviewOutcome::Confirmed),
            "MINOR_UPVERSION" => Ok(ReviewOutcome::MinorUpVersion),
            "MAJOR_UPVERSION" => Ok(ReviewOutcome::MajorUpVersion),
            other => Err(QmsError::Internal {
                message: format!("unknown review outcome: {other}"),
            }),
        }
    }
}

/// A scheduled (or completed) periodic review of an effective document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodicReview {
    pub id: Uuid,
    pub document_id: Uuid,
    pub due_date: NaiveDate,
    pub completed_at: Option<DateTime<Utc>>,
    pub reviewer_id: Option<Uuid>,
    pub outcome: Option<ReviewOutcome>,
    pub comment: Option<String>,
}

fn row_to_review(row: &Row) -> rusqlite::Result<PeriodicReview> {
    let id: String = row.get("id")?;
    let document_id: String = row.get("document_id")?;
    let due_date: String = row.get("due_date")?;
    let completed_at: Option<String> = row.get("completed_at")?;
    let reviewer_id: Option<String> = row.get("reviewer_id")?;
    let outcome: Option<String> = row.get("outcome")?;

    Ok(PeriodicReview {
        id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::nil()),
        document_id: Uuid::parse_str(&document_id).unwrap_or_else(|_| Uuid::nil()),
        due_date: NaiveDate::parse_from_str(&due_date, "%Y-%m-%d").unwrap_or_default(),
        completed_at: completed_at.and_then(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|d| d.with_timezone(&Utc))
                .ok()
        }),
        reviewer_id: reviewer_id.map(|s| Uuid::parse_str(&s).unwrap_or_else(|_| Uuid::nil())),
        outcome: outcome.and_then(|s| ReviewOutcome::from_str(&s).ok()),
        comment: row.get("comment")?,
    })
}

pub struct PeriodicReviewRepo<'a> {
    db: &'a Database,
}

impl<'a> PeriodicReviewRepo<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn insert(&self, review: &PeriodicReview) -> Result<()> {
        self.db.with_connection(|conn| {
            conn.execute(
                "INSERT INTO periodic_reviews (id, document_id, due_date, completed_at, reviewer_id, outcome, comment)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    review.id.to_string(),
                    review.document_id.to_string(),
                    review.due_date.format("%Y-%m-%d").to_string(),
                    review.completed_at.map(|d| d.to_rfc3339()),
                    review.reviewer_id.map(|u| u.to_string()),
                    review.outcome.map(|o| o.as_str().to_string()),
                    review.comment,
                ],
            )?;
            Ok(())
        })
    }

    pub fn complete(
        &self,
        id: Uuid,
        reviewer_id: Uuid,
        outcome: ReviewOutcome,
        comment: Option<String>,
    ) -> Result<()> {
        self.db.with_connection(|conn| {
            conn.execute(
                "UPDATE periodic_reviews
                 SET completed_at = ?1, reviewer_id = ?2, outcome = ?3, comment = ?4
                 WHERE id = ?5",
                params![
                    Utc::now().to_rfc3339(),
                    reviewer_id.to_string(),
                    outcome.as_str(),
                    comment,
                    id.to_string(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn complete_tx(
        &self,
        tx: &rusqlite::Transaction,
        id: Uuid,
        reviewer_id: Uuid,
        outcome: ReviewOutcome,
        comment: Option<String>,
    ) -> Result<()> {
        tx.execute(
            "UPDATE periodic_reviews
             SET completed_at = ?1, reviewer_id = ?2, outcome = ?3, comment = ?4
             WHERE id = ?5",
            params![
                Utc::now().to_rfc3339(),
                reviewer_id.to_string(),
                outcome.as_str(),
                comment,
                id.to_string(),
            ],
        )?;
        Ok(())
    }

    pub fn insert_tx(&self, tx: &rusqlite::Transaction, review: &PeriodicReview) -> Result<()> {
        tx.execute(
            "INSERT INTO periodic_reviews (id, document_id, due_date, completed_at, reviewer_id, outcome, comment)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                review.id.to_string(),
                review.document_id.to_string(),
                review.due_date.format("%Y-%m-%d").to_string(),
                review.completed_at.map(|d| d.to_rfc3339()),
                review.reviewer_id.map(|u| u.to_string()),
                review.outcome.map(|o| o.as_str().to_string()),
                review.comment.clone(),
            ],
        )?;
        Ok(())
    }

    /// Reviews due on or before `as_of` that have not yet been completed.
    pub fn due(&self, as_of: NaiveDate) -> Result<Vec<PeriodicReview>> {
        self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM periodic_reviews WHERE completed_at IS NULL AND due_date <= ?1",
            )?;
            let rows = stmt
                .query_map(
                    params![as_of.format("%Y-%m-%d").to_string()],
                    row_to_review,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn get(&self, id: Uuid) -> Result<PeriodicReview> {
        self.db.with_connection(|conn| {
            conn.query_row(
                "SELECT * FROM periodic_reviews WHERE id = ?1",
                params![id.to_string()],
                row_to_review,
            )
            .optional()?
            .ok_or_else(|| QmsError::NotFound {
                kind: "PeriodicReview".to_string(),
                id: id.to_string(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_due_lookup() {
        let db = Database::in_memory().unwrap();
        let repo = PeriodicReviewRepo::new(&db);
        let review = PeriodicReview {
            id: Uuid::new_v4(),
            document_id: Uuid::new_v4(),
            due_date: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            completed_at: None,
            reviewer_id: None,
            outcome: None,
            comment: None,
        };
        repo.insert(&review).unwrap();

        let due = repo
            .due(NaiveDate::from_ymd_opt(2026, 6, 1).unwrap())
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, review.id);
    }

    #[test]
    fn test_complete_review() {
        let db = Database::in_memory().unwrap();
        let repo = PeriodicReviewRepo::new(&db);
        let review = PeriodicReview {
            id: Uuid::new_v4(),
            document_id: Uuid::new_v4(),
            due_date: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            completed_at: None,
            reviewer_id: None,
            outcome: None,
            comment: None,
        };
        repo.insert(&review).unwrap();

        let reviewer = Uuid::new_v4();
        repo.complete(review.id, reviewer, ReviewOutcome::Confirmed, None)
            .unwrap();

        let fetched = repo.get(review.id).unwrap();
        assert!(fetched.completed_at.is_some());
        assert_eq!(fetched.outcome, Some(ReviewOutcome::Confirmed));

        let due = repo
            .due(NaiveDate::from_ymd_opt(2026, 6, 1).unwrap())
            .unwrap();
        assert!(due.is_empty());
    }
}
