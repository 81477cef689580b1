//! Workflow Stage Controller.
//!
//! Owns workflow status, the awaiting-approval gate, pending-artifact
//! routing, and stage transitions. The controller does not validate stage
//! order — callers choose the next stage; `skipped_stages` records the
//! quick-path elisions as data.

use std::str::FromStr;

use anyhow::Context as _;
use rusqlite::params;
use tracing::info;

use super::{EngineDb, parse_json_field, to_json_field};
use crate::errors::{EngineError, EngineResult};
use crate::ids;
use crate::models::{ArtifactType, Priority, Workflow, WorkflowStatus};

const WORKFLOW_COLUMNS: &str = "id, title, description, status, priority, current_session_id, \
     awaiting_approval, pending_artifact_type, base_branch, skipped_stages, archived, \
     created_at, updated_at";

impl EngineDb {
    pub fn create_workflow(
        &self,
        title: &str,
        description: &str,
        priority: &Priority,
        base_branch: Option<&str>,
    ) -> EngineResult<Workflow> {
        let id = ids::new_id(ids::WORKFLOW);
        self.conn
            .execute(
                "INSERT INTO workflows (id, title, description, priority, base_branch)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, title, description, priority.as_str(), base_branch],
            )
            .context("Failed to insert workflow")?;
        info!(workflow_id = %id, %title, "created workflow");
        self.require_workflow(&id)
    }

    pub fn get_workflow(&self, id: &str) -> EngineResult<Option<Workflow>> {
        let sql = format!("SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = ?1");
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare get_workflow")?;
        let mut rows = stmt
            .query_map(params![id], WorkflowRow::from_row)
            .context("Failed to query workflow")?;
        match rows.next() {
            Some(row) => {
                let r = row.context("Failed to read workflow row")?;
                Ok(Some(r.into_workflow()?))
            }
            None => Ok(None),
        }
    }

    /// Default listing excludes archived workflows; archived ones are only
    /// visible when explicitly requested.
    pub fn list_workflows(&self, include_archived: bool) -> EngineResult<Vec<Workflow>> {
        let sql = if include_archived {
            format!("SELECT {WORKFLOW_COLUMNS} FROM workflows ORDER BY rowid")
        } else {
            format!("SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE archived = 0 ORDER BY rowid")
        };
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_workflows")?;
        let rows = stmt
            .query_map([], WorkflowRow::from_row)
            .context("Failed to query workflows")?;
        let mut workflows = Vec::new();
        for row in rows {
            let r = row.context("Failed to read workflow row")?;
            workflows.push(r.into_workflow()?);
        }
        Ok(workflows)
    }

    pub fn update_workflow(
        &self,
        id: &str,
        title: Option<&str>,
        description: Option<&str>,
        priority: Option<&Priority>,
        base_branch: Option<&str>,
    ) -> EngineResult<Workflow> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        if let Some(t) = title {
            tx.execute(
                "UPDATE workflows SET title = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![t, id],
            )
            .context("Failed to update workflow title")?;
        }
        if let Some(d) = description {
            tx.execute(
                "UPDATE workflows SET description = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![d, id],
            )
            .context("Failed to update workflow description")?;
        }
        if let Some(p) = priority {
            tx.execute(
                "UPDATE workflows SET priority = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![p.as_str(), id],
            )
            .context("Failed to update workflow priority")?;
        }
        if let Some(b) = base_branch {
            tx.execute(
                "UPDATE workflows SET base_branch = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![b, id],
            )
            .context("Failed to update workflow base_branch")?;
        }
        tx.commit().context("Failed to commit workflow update")?;
        self.require_workflow(id)
    }

    /// Move a workflow to its next stage. Atomic: sets the status, replaces
    /// the current session reference, and unconditionally clears the
    /// approval gate — a transition always supersedes any pending approval
    /// from the prior stage.
    pub fn transition_stage(
        &self,
        id: &str,
        next_stage: &WorkflowStatus,
        new_session_id: Option<&str>,
    ) -> EngineResult<Workflow> {
        let changed = self
            .conn
            .execute(
                "UPDATE workflows
                 SET status = ?1, current_session_id = ?2,
                     awaiting_approval = 0, pending_artifact_type = NULL,
                     updated_at = datetime('now')
                 WHERE id = ?3",
                params![next_stage.as_str(), new_session_id, id],
            )
            .context("Failed to transition workflow stage")?;
        if changed == 0 {
            return Err(EngineError::WorkflowNotFound { id: id.to_string() });
        }
        info!(workflow_id = %id, stage = %next_stage, "workflow stage transition");
        self.require_workflow(id)
    }

    /// Raise the approval gate: the named artifact is waiting on a human.
    pub fn set_awaiting_approval(
        &self,
        id: &str,
        artifact_type: &ArtifactType,
    ) -> EngineResult<Workflow> {
        let changed = self
            .conn
            .execute(
                "UPDATE workflows
                 SET awaiting_approval = 1, pending_artifact_type = ?1,
                     updated_at = datetime('now')
                 WHERE id = ?2",
                params![artifact_type.as_str(), id],
            )
            .context("Failed to set awaiting_approval")?;
        if changed == 0 {
            return Err(EngineError::WorkflowNotFound { id: id.to_string() });
        }
        self.require_workflow(id)
    }

    pub fn clear_awaiting_approval(&self, id: &str) -> EngineResult<Workflow> {
        let changed = self
            .conn
            .execute(
                "UPDATE workflows
                 SET awaiting_approval = 0, pending_artifact_type = NULL,
                     updated_at = datetime('now')
                 WHERE id = ?1",
                params![id],
            )
            .context("Failed to clear awaiting_approval")?;
        if changed == 0 {
            return Err(EngineError::WorkflowNotFound { id: id.to_string() });
        }
        self.require_workflow(id)
    }

    /// Terminal soft-delete. Archived workflows never appear in default
    /// listings; there is no unarchive.
    pub fn archive_workflow(&self, id: &str) -> EngineResult<Workflow> {
        let changed = self
            .conn
            .execute(
                "UPDATE workflows SET archived = 1, updated_at = datetime('now') WHERE id = ?1",
                params![id],
            )
            .context("Failed to archive workflow")?;
        if changed == 0 {
            return Err(EngineError::WorkflowNotFound { id: id.to_string() });
        }
        info!(workflow_id = %id, "archived workflow");
        self.require_workflow(id)
    }

    pub fn set_skipped_stages(
        &self,
        id: &str,
        stages: &[WorkflowStatus],
    ) -> EngineResult<Workflow> {
        let json = to_json_field("skipped_stages", &stages)?;
        let changed = self
            .conn
            .execute(
                "UPDATE workflows SET skipped_stages = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![json, id],
            )
            .context("Failed to set skipped stages")?;
        if changed == 0 {
            return Err(EngineError::WorkflowNotFound { id: id.to_string() });
        }
        self.require_workflow(id)
    }

    /// Hard-delete a workflow and everything it owns: pulses, preflight
    /// rows, artifacts, review cards/comments (via FK cascade), plus the
    /// polymorphic session trees, subtasks, and cost records (explicit, in
    /// one transaction).
    pub fn delete_workflow(&self, id: &str) -> EngineResult<bool> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let subtask_ids = {
            let mut stmt = tx
                .prepare("SELECT id FROM subtasks WHERE workflow_id = ?1")
                .context("Failed to prepare subtask id query")?;
            let rows = stmt
                .query_map(params![id], |row| row.get::<_, String>(0))
                .context("Failed to query subtask ids")?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row.context("Failed to read subtask id")?);
            }
            ids
        };

        let mut session_ids = Vec::new();
        {
            let mut stmt = tx
                .prepare(
                    "SELECT id FROM sessions
                     WHERE (context_type = 'workflow' AND context_id = ?1)
                        OR (context_type = 'subtask'
                            AND context_id IN (SELECT id FROM subtasks WHERE workflow_id = ?1))",
                )
                .context("Failed to prepare session id query")?;
            let rows = stmt
                .query_map(params![id], |row| row.get::<_, String>(0))
                .context("Failed to query session ids")?;
            for row in rows {
                session_ids.push(row.context("Failed to read session id")?);
            }
        }

        for session_id in &session_ids {
            super::sessions::delete_session_tree(&tx, session_id)?;
        }

        tx.execute(
            "DELETE FROM cost_records
             WHERE (context_type = 'workflow' AND context_id = ?1)
                OR (context_type = 'subtask'
                    AND context_id IN (SELECT id FROM subtasks WHERE workflow_id = ?1))",
            params![id],
        )
        .context("Failed to delete workflow cost records")?;

        // Subtasks not already removed via their parent session's tree.
        for subtask_id in &subtask_ids {
            tx.execute("DELETE FROM subtasks WHERE id = ?1", params![subtask_id])
                .context("Failed to delete subtask")?;
        }

        let count = tx
            .execute("DELETE FROM workflows WHERE id = ?1", params![id])
            .context("Failed to delete workflow")?;
        tx.commit().context("Failed to commit workflow delete")?;
        if count > 0 {
            info!(workflow_id = %id, "deleted workflow");
        }
        Ok(count > 0)
    }

    pub(crate) fn require_workflow(&self, id: &str) -> EngineResult<Workflow> {
        self.get_workflow(id)?
            .ok_or_else(|| EngineError::WorkflowNotFound { id: id.to_string() })
    }
}

pub(crate) struct WorkflowRow {
    id: String,
    title: String,
    description: String,
    status: String,
    priority: String,
    current_session_id: Option<String>,
    awaiting_approval: bool,
    pending_artifact_type: Option<String>,
    base_branch: Option<String>,
    skipped_stages: String,
    archived: bool,
    created_at: String,
    updated_at: String,
}

impl WorkflowRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            description: row.get(2)?,
            status: row.get(3)?,
            priority: row.get(4)?,
            current_session_id: row.get(5)?,
            awaiting_approval: row.get(6)?,
            pending_artifact_type: row.get(7)?,
            base_branch: row.get(8)?,
            skipped_stages: row.get(9)?,
            archived: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }

    fn into_workflow(self) -> EngineResult<Workflow> {
        let status = WorkflowStatus::from_str(&self.status)
            .map_err(|message| EngineError::InvalidField { field: "status", message })?;
        let priority = Priority::from_str(&self.priority)
            .map_err(|message| EngineError::InvalidField { field: "priority", message })?;
        let pending_artifact_type = self
            .pending_artifact_type
            .as_deref()
            .map(ArtifactType::from_str)
            .transpose()
            .map_err(|message| EngineError::InvalidField {
                field: "pending_artifact_type",
                message,
            })?;
        let skipped_stages: Vec<WorkflowStatus> =
            parse_json_field("skipped_stages", &self.skipped_stages)?;

        Ok(Workflow {
            id: self.id,
            title: self.title,
            description: self.description,
            status,
            priority,
            current_session_id: self.current_session_id,
            awaiting_approval: self.awaiting_approval,
            pending_artifact_type,
            base_branch: self.base_branch,
            skipped_stages,
            archived: self.archived,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
