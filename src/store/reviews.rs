//! Review cards and comments.
//!
//! Each review round produces one card per workflow, unique on
//! (workflow, round). Comments accumulate on the open card and are
//! resolved individually; completing the card stamps the reviewer's
//! recommendation and summary.

use std::str::FromStr;

use anyhow::Context as _;
use rusqlite::params;
use tracing::info;

use super::EngineDb;
use crate::errors::{EngineError, EngineResult};
use crate::ids;
use crate::models::{
    CommentKind, NewReviewComment, Recommendation, ReviewCard, ReviewComment, Severity,
};

const CARD_COLUMNS: &str =
    "id, workflow_id, round_number, recommendation, summary, created_at, completed_at";

const COMMENT_COLUMNS: &str =
    "id, card_id, kind, file_path, line, content, severity, category, resolved, created_at";

impl EngineDb {
    pub fn create_review_card(
        &self,
        workflow_id: &str,
        round_number: i64,
    ) -> EngineResult<ReviewCard> {
        self.require_workflow(workflow_id)?;
        let id = ids::new_id(ids::REVIEW);
        self.conn
            .execute(
                "INSERT INTO review_cards (id, workflow_id, round_number) VALUES (?1, ?2, ?3)",
                params![id, workflow_id, round_number],
            )
            .context("Failed to insert review card")?;
        info!(workflow_id, round_number, "opened review card");
        self.require_review_card(&id)
    }

    pub fn add_review_comment(
        &self,
        card_id: &str,
        comment: &NewReviewComment,
    ) -> EngineResult<ReviewComment> {
        self.require_review_card(card_id)?;
        let id = ids::new_id(ids::COMMENT);
        self.conn
            .execute(
                "INSERT INTO review_comments (id, card_id, kind, file_path, line, content,
                     severity, category)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    id,
                    card_id,
                    comment.kind.as_str(),
                    comment.file_path,
                    comment.line,
                    comment.content,
                    comment.severity.as_ref().map(|s| s.as_str()),
                    comment.category
                ],
            )
            .context("Failed to insert review comment")?;
        self.require_review_comment(&id)
    }

    pub fn resolve_review_comment(&self, id: &str) -> EngineResult<ReviewComment> {
        let changed = self
            .conn
            .execute(
                "UPDATE review_comments SET resolved = 1 WHERE id = ?1",
                params![id],
            )
            .context("Failed to resolve review comment")?;
        if changed == 0 {
            return Err(EngineError::Other(anyhow::anyhow!(
                "Review comment {id} not found"
            )));
        }
        self.require_review_comment(id)
    }

    /// Stamp the card with the reviewer's verdict and close it.
    pub fn complete_review(
        &self,
        card_id: &str,
        recommendation: &Recommendation,
        summary: &str,
    ) -> EngineResult<ReviewCard> {
        let changed = self
            .conn
            .execute(
                "UPDATE review_cards
                 SET recommendation = ?1, summary = ?2, completed_at = datetime('now')
                 WHERE id = ?3",
                params![recommendation.as_str(), summary, card_id],
            )
            .context("Failed to complete review")?;
        if changed == 0 {
            return Err(EngineError::ReviewCardNotFound { id: card_id.to_string() });
        }
        self.require_review_card(card_id)
    }

    /// The highest-round card for a workflow, if any review has started.
    pub fn get_latest_review_card(&self, workflow_id: &str) -> EngineResult<Option<ReviewCard>> {
        let sql = format!(
            "SELECT {CARD_COLUMNS} FROM review_cards
             WHERE workflow_id = ?1 ORDER BY round_number DESC LIMIT 1"
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare get_latest_review_card")?;
        let mut rows = stmt
            .query_map(params![workflow_id], CardRow::from_row)
            .context("Failed to query review card")?;
        match rows.next() {
            Some(row) => {
                let r = row.context("Failed to read review card row")?;
                Ok(Some(r.into_card()?))
            }
            None => Ok(None),
        }
    }

    pub fn get_all_review_cards(&self, workflow_id: &str) -> EngineResult<Vec<ReviewCard>> {
        let sql = format!(
            "SELECT {CARD_COLUMNS} FROM review_cards
             WHERE workflow_id = ?1 ORDER BY round_number"
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare get_all_review_cards")?;
        let rows = stmt
            .query_map(params![workflow_id], CardRow::from_row)
            .context("Failed to query review cards")?;
        let mut cards = Vec::new();
        for row in rows {
            let r = row.context("Failed to read review card row")?;
            cards.push(r.into_card()?);
        }
        Ok(cards)
    }

    pub fn get_review_comments(&self, card_id: &str) -> EngineResult<Vec<ReviewComment>> {
        let sql = format!(
            "SELECT {COMMENT_COLUMNS} FROM review_comments WHERE card_id = ?1 ORDER BY rowid"
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare get_review_comments")?;
        let rows = stmt
            .query_map(params![card_id], CommentRow::from_row)
            .context("Failed to query review comments")?;
        let mut comments = Vec::new();
        for row in rows {
            let r = row.context("Failed to read review comment row")?;
            comments.push(r.into_comment()?);
        }
        Ok(comments)
    }

    fn require_review_card(&self, id: &str) -> EngineResult<ReviewCard> {
        let sql = format!("SELECT {CARD_COLUMNS} FROM review_cards WHERE id = ?1");
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare review card read-back")?;
        let mut rows = stmt
            .query_map(params![id], CardRow::from_row)
            .context("Failed to query review card")?;
        match rows.next() {
            Some(row) => row.context("Failed to read review card row")?.into_card(),
            None => Err(EngineError::ReviewCardNotFound { id: id.to_string() }),
        }
    }

    fn require_review_comment(&self, id: &str) -> EngineResult<ReviewComment> {
        let sql = format!("SELECT {COMMENT_COLUMNS} FROM review_comments WHERE id = ?1");
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare review comment read-back")?;
        let mut rows = stmt
            .query_map(params![id], CommentRow::from_row)
            .context("Failed to query review comment")?;
        match rows.next() {
            Some(row) => row.context("Failed to read review comment row")?.into_comment(),
            None => Err(EngineError::Other(anyhow::anyhow!(
                "Review comment {id} not found"
            ))),
        }
    }
}

struct CardRow {
    id: String,
    workflow_id: String,
    round_number: i64,
    recommendation: Option<String>,
    summary: Option<String>,
    created_at: String,
    completed_at: Option<String>,
}

impl CardRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            workflow_id: row.get(1)?,
            round_number: row.get(2)?,
            recommendation: row.get(3)?,
            summary: row.get(4)?,
            created_at: row.get(5)?,
            completed_at: row.get(6)?,
        })
    }

    fn into_card(self) -> EngineResult<ReviewCard> {
        let recommendation = self
            .recommendation
            .as_deref()
            .map(Recommendation::from_str)
            .transpose()
            .map_err(|message| EngineError::InvalidField { field: "recommendation", message })?;
        Ok(ReviewCard {
            id: self.id,
            workflow_id: self.workflow_id,
            round_number: self.round_number,
            recommendation,
            summary: self.summary,
            created_at: self.created_at,
            completed_at: self.completed_at,
        })
    }
}

struct CommentRow {
    id: String,
    card_id: String,
    kind: String,
    file_path: Option<String>,
    line: Option<i64>,
    content: String,
    severity: Option<String>,
    category: Option<String>,
    resolved: bool,
    created_at: String,
}

impl CommentRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            card_id: row.get(1)?,
            kind: row.get(2)?,
            file_path: row.get(3)?,
            line: row.get(4)?,
            content: row.get(5)?,
            severity: row.get(6)?,
            category: row.get(7)?,
            resolved: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    fn into_comment(self) -> EngineResult<ReviewComment> {
        let kind = CommentKind::from_str(&self.kind)
            .map_err(|message| EngineError::InvalidField { field: "kind", message })?;
        let severity = self
            .severity
            .as_deref()
            .map(Severity::from_str)
            .transpose()
            .map_err(|message| EngineError::InvalidField { field: "severity", message })?;
        Ok(ReviewComment {
            id: self.id,
            card_id: self.card_id,
            kind,
            file_path: self.file_path,
            line: self.line,
            content: self.content,
            severity,
            category: self.category,
            resolved: self.resolved,
            created_at: self.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Priority;

    fn db_with_workflow() -> (EngineDb, String) {
        let db = EngineDb::new_in_memory().unwrap();
        let wf = db
            .create_workflow("t", "", &Priority::Medium, None)
            .unwrap();
        (db, wf.id)
    }

    fn line_comment(content: &str) -> NewReviewComment {
        NewReviewComment {
            kind: CommentKind::Line,
            file_path: Some("src/auth.rs".into()),
            line: Some(42),
            content: content.into(),
            severity: Some(Severity::High),
            category: Some("correctness".into()),
        }
    }

    #[test]
    fn test_review_round_lifecycle() {
        let (db, wf) = db_with_workflow();
        let card = db.create_review_card(&wf, 1).unwrap();
        assert!(card.recommendation.is_none());
        assert!(card.completed_at.is_none());

        let comment = db.add_review_comment(&card.id, &line_comment("missing error path")).unwrap();
        assert!(!comment.resolved);
        assert_eq!(comment.severity, Some(Severity::High));

        let resolved = db.resolve_review_comment(&comment.id).unwrap();
        assert!(resolved.resolved);

        let done = db
            .complete_review(&card.id, &Recommendation::RequestChanges, "one blocker")
            .unwrap();
        assert_eq!(done.recommendation, Some(Recommendation::RequestChanges));
        assert_eq!(done.summary.as_deref(), Some("one blocker"));
        assert!(done.completed_at.is_some());
    }

    #[test]
    fn test_latest_card_is_highest_round() {
        let (db, wf) = db_with_workflow();
        db.create_review_card(&wf, 1).unwrap();
        db.create_review_card(&wf, 2).unwrap();
        let latest = db.get_latest_review_card(&wf).unwrap().unwrap();
        assert_eq!(latest.round_number, 2);
        assert_eq!(db.get_all_review_cards(&wf).unwrap().len(), 2);
    }

    #[test]
    fn test_duplicate_round_rejected() {
        let (db, wf) = db_with_workflow();
        db.create_review_card(&wf, 1).unwrap();
        assert!(db.create_review_card(&wf, 1).is_err());
    }

    #[test]
    fn test_comment_on_missing_card_fails() {
        let (db, _wf) = db_with_workflow();
        let err = db
            .add_review_comment("review_missing", &line_comment("x"))
            .unwrap_err();
        assert!(matches!(err, EngineError::ReviewCardNotFound { .. }));
    }

    #[test]
    fn test_minimal_review_level_comment() {
        let (db, wf) = db_with_workflow();
        let card = db.create_review_card(&wf, 1).unwrap();
        let comment = db
            .add_review_comment(
                &card.id,
                &NewReviewComment {
                    kind: CommentKind::Review,
                    file_path: None,
                    line: None,
                    content: "looks solid overall".into(),
                    severity: None,
                    category: None,
                },
            )
            .unwrap();
        assert!(comment.file_path.is_none());
        assert!(comment.severity.is_none());

        let comments = db.get_review_comments(&card.id).unwrap();
        assert_eq!(comments.len(), 1);
    }
}
