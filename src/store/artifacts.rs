//! Stage artifact storage.
//!
//! Each approval-gated stage produces one JSON artifact (scope, research,
//! plan, review). Artifacts are append-only: re-running a stage writes a
//! new row, and readers take the latest per type. Plan artifacts are
//! validated structurally on save so the pulse seeder never reads garbage.

use std::str::FromStr;

use anyhow::Context as _;
use rusqlite::params;
use tracing::info;

use super::{EngineDb, parse_json_field, to_json_field};
use crate::errors::{EngineError, EngineResult};
use crate::ids;
use crate::models::{ArtifactType, PlannedPulse, StageArtifact};

impl EngineDb {
    /// Persist a stage artifact. Plan content must deserialize to a list of
    /// planned pulses; a malformed plan is rejected before it is written.
    pub fn save_artifact(
        &self,
        workflow_id: &str,
        artifact_type: &ArtifactType,
        content: &serde_json::Value,
    ) -> EngineResult<StageArtifact> {
        self.require_workflow(workflow_id)?;
        if *artifact_type == ArtifactType::Plan {
            let raw = to_json_field("content", content)?;
            parse_json_field::<Vec<PlannedPulse>>("content", &raw)?;
        }
        let id = ids::new_id(ids::ARTIFACT);
        let content_json = to_json_field("content", content)?;
        self.conn
            .execute(
                "INSERT INTO artifacts (id, workflow_id, artifact_type, content)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, workflow_id, artifact_type.as_str(), content_json],
            )
            .context("Failed to insert artifact")?;
        info!(workflow_id, artifact_type = %artifact_type.as_str(), "saved stage artifact");
        self.require_artifact(&id)
    }

    /// Most recent artifact of a type for a workflow, if any.
    pub fn get_latest_artifact(
        &self,
        workflow_id: &str,
        artifact_type: &ArtifactType,
    ) -> EngineResult<Option<StageArtifact>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, workflow_id, artifact_type, content, created_at
                 FROM artifacts WHERE workflow_id = ?1 AND artifact_type = ?2
                 ORDER BY rowid DESC LIMIT 1",
            )
            .context("Failed to prepare get_latest_artifact")?;
        let mut rows = stmt
            .query_map(params![workflow_id, artifact_type.as_str()], ArtifactRow::from_row)
            .context("Failed to query artifact")?;
        match rows.next() {
            Some(row) => {
                let r = row.context("Failed to read artifact row")?;
                Ok(Some(r.into_artifact()?))
            }
            None => Ok(None),
        }
    }

    /// All artifacts for a workflow in creation order, every revision
    /// included.
    pub fn get_artifacts(&self, workflow_id: &str) -> EngineResult<Vec<StageArtifact>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, workflow_id, artifact_type, content, created_at
                 FROM artifacts WHERE workflow_id = ?1 ORDER BY rowid",
            )
            .context("Failed to prepare get_artifacts")?;
        let rows = stmt
            .query_map(params![workflow_id], ArtifactRow::from_row)
            .context("Failed to query artifacts")?;
        let mut artifacts = Vec::new();
        for row in rows {
            let r = row.context("Failed to read artifact row")?;
            artifacts.push(r.into_artifact()?);
        }
        Ok(artifacts)
    }

    fn require_artifact(&self, id: &str) -> EngineResult<StageArtifact> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, workflow_id, artifact_type, content, created_at
                 FROM artifacts WHERE id = ?1",
            )
            .context("Failed to prepare artifact read-back")?;
        let mut rows = stmt
            .query_map(params![id], ArtifactRow::from_row)
            .context("Failed to query artifact")?;
        match rows.next() {
            Some(row) => row.context("Failed to read artifact row")?.into_artifact(),
            None => Err(EngineError::Other(anyhow::anyhow!(
                "Artifact {id} not found after insert"
            ))),
        }
    }
}

struct ArtifactRow {
    id: String,
    workflow_id: String,
    artifact_type: String,
    content: String,
    created_at: String,
}

impl ArtifactRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            workflow_id: row.get(1)?,
            artifact_type: row.get(2)?,
            content: row.get(3)?,
            created_at: row.get(4)?,
        })
    }

    fn into_artifact(self) -> EngineResult<StageArtifact> {
        let artifact_type = ArtifactType::from_str(&self.artifact_type)
            .map_err(|message| EngineError::InvalidField { field: "artifact_type", message })?;
        let content = parse_json_field("content", &self.content)?;
        Ok(StageArtifact {
            id: self.id,
            workflow_id: self.workflow_id,
            artifact_type,
            content,
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

    #[test]
    fn test_save_and_latest_roundtrip() {
        let (db, wf) = db_with_workflow();
        let content = serde_json::json!({"summary": "add auth", "risks": ["token expiry"]});
        let saved = db.save_artifact(&wf, &ArtifactType::Scope, &content).unwrap();
        assert!(saved.id.starts_with("artifact_"));

        let latest = db.get_latest_artifact(&wf, &ArtifactType::Scope).unwrap().unwrap();
        assert_eq!(latest.content, content);
        assert!(db.get_latest_artifact(&wf, &ArtifactType::Plan).unwrap().is_none());
    }

    #[test]
    fn test_latest_wins_over_revisions() {
        let (db, wf) = db_with_workflow();
        db.save_artifact(&wf, &ArtifactType::Research, &serde_json::json!({"v": 1})).unwrap();
        db.save_artifact(&wf, &ArtifactType::Research, &serde_json::json!({"v": 2})).unwrap();

        let latest = db.get_latest_artifact(&wf, &ArtifactType::Research).unwrap().unwrap();
        assert_eq!(latest.content, serde_json::json!({"v": 2}));
        // Both revisions remain on record.
        assert_eq!(db.get_artifacts(&wf).unwrap().len(), 2);
    }

    #[test]
    fn test_plan_content_is_validated() {
        let (db, wf) = db_with_workflow();
        let bad = serde_json::json!({"not": "a plan"});
        let err = db.save_artifact(&wf, &ArtifactType::Plan, &bad).unwrap_err();
        assert!(matches!(err, EngineError::SchemaValidation { field: "content", .. }));

        let good = serde_json::json!([
            {"id": "step-1", "description": "wire up the schema"},
            {"id": "step-2", "description": "implement the endpoint"}
        ]);
        db.save_artifact(&wf, &ArtifactType::Plan, &good).unwrap();
    }

    #[test]
    fn test_save_for_missing_workflow_fails() {
        let (db, _wf) = db_with_workflow();
        let err = db
            .save_artifact("workflow_missing", &ArtifactType::Scope, &serde_json::json!({}))
            .unwrap_err();
        assert!(matches!(err, EngineError::WorkflowNotFound { .. }));
    }
}
