//! Pulse Lifecycle Manager.
//!
//! State machine: proposed → running → {succeeded | failed | stopped}.
//! Terminal states absorb. Transitions use conditional updates (`WHERE
//! status = …`) so a lost race surfaces as an invalid-transition error
//! instead of a second running pulse. Also owns the preflight sub-lifecycle
//! and the baseline matcher that separates pre-existing issues from newly
//! introduced ones.

use std::str::FromStr;

use anyhow::Context as _;
use rusqlite::params;
use tracing::{debug, info, warn};

use super::{EngineDb, parse_json_field, to_json_field};
use crate::errors::{EngineError, EngineResult};
use crate::ids;
use crate::models::{
    PlannedPulse, PreflightBaseline, PreflightCommandBaseline, PreflightSetup, PreflightStatus,
    Pulse, PulseStatus,
};

const PULSE_COLUMNS: &str = "id, workflow_id, planned_pulse_id, description, status, \
     pulse_branch, worktree_path, checkpoint_commit_sha, has_unresolved_issues, \
     is_recovery_checkpoint, rejection_count, failure_reason, started_at, ended_at, created_at";

impl EngineDb {
    // ── Pulse lifecycle ───────────────────────────────────────────────

    pub fn create_pulse(&self, workflow_id: &str, description: &str) -> EngineResult<Pulse> {
        self.require_workflow(workflow_id)?;
        let id = ids::new_id(ids::PULSE);
        self.conn
            .execute(
                "INSERT INTO pulses (id, workflow_id, description) VALUES (?1, ?2, ?3)",
                params![id, workflow_id, description],
            )
            .context("Failed to insert pulse")?;
        self.require_pulse(&id)
    }

    /// Materialize an approved plan into concrete execution units. All
    /// pulses are created in plan order inside one transaction: a workflow
    /// is never left with some but not all of its planned pulses.
    pub fn create_pulses_from_plan(
        &self,
        workflow_id: &str,
        planned: &[PlannedPulse],
    ) -> EngineResult<Vec<Pulse>> {
        self.require_workflow(workflow_id)?;
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let mut ids_created = Vec::with_capacity(planned.len());
        for p in planned {
            let id = ids::new_id(ids::PULSE);
            tx.execute(
                "INSERT INTO pulses (id, workflow_id, planned_pulse_id, description)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, workflow_id, p.id, p.description],
            )
            .context("Failed to insert planned pulse")?;
            ids_created.push(id);
        }
        tx.commit().context("Failed to commit plan materialization")?;
        info!(workflow_id, count = planned.len(), "materialized plan into pulses");

        let mut pulses = Vec::with_capacity(ids_created.len());
        for id in &ids_created {
            pulses.push(self.require_pulse(id)?);
        }
        Ok(pulses)
    }

    /// proposed → running. Rejects a pulse that is not `proposed` and a
    /// workflow that already has a running pulse.
    pub fn start_pulse(
        &self,
        id: &str,
        branch: &str,
        worktree_path: &str,
    ) -> EngineResult<Pulse> {
        let pulse = self.require_pulse(id)?;
        if let Some(running) = self.get_running_pulse(&pulse.workflow_id)? {
            if running.id != id {
                return Err(EngineError::PulseAlreadyRunning {
                    workflow_id: pulse.workflow_id,
                    pulse_id: running.id,
                });
            }
        }
        // Conditional update: the transition only lands if the pulse is
        // still proposed at write time.
        let changed = self
            .conn
            .execute(
                "UPDATE pulses
                 SET status = 'running', pulse_branch = ?1, worktree_path = ?2,
                     started_at = datetime('now')
                 WHERE id = ?3 AND status = 'proposed'",
                params![branch, worktree_path, id],
            )
            .context("Failed to start pulse")?;
        if changed == 0 {
            return Err(self.invalid_pulse_transition(id, PulseStatus::Running));
        }
        info!(pulse_id = %id, %branch, "pulse started");
        self.require_pulse(id)
    }

    /// running → succeeded. Records the checkpoint commit and end time.
    pub fn complete_pulse(
        &self,
        id: &str,
        commit_sha: &str,
        has_unresolved_issues: bool,
    ) -> EngineResult<Pulse> {
        let changed = self
            .conn
            .execute(
                "UPDATE pulses
                 SET status = 'succeeded', checkpoint_commit_sha = ?1,
                     has_unresolved_issues = ?2, ended_at = datetime('now')
                 WHERE id = ?3 AND status = 'running'",
                params![commit_sha, has_unresolved_issues, id],
            )
            .context("Failed to complete pulse")?;
        if changed == 0 {
            return Err(self.invalid_pulse_transition(id, PulseStatus::Succeeded));
        }
        info!(pulse_id = %id, commit_sha, "pulse succeeded");
        self.require_pulse(id)
    }

    /// running → failed. A recovery commit captures partial progress made
    /// before the failure so a retry can resume from it.
    pub fn fail_pulse(
        &self,
        id: &str,
        reason: &str,
        recovery_commit_sha: Option<&str>,
    ) -> EngineResult<Pulse> {
        let changed = match recovery_commit_sha {
            Some(sha) => self
                .conn
                .execute(
                    "UPDATE pulses
                     SET status = 'failed', failure_reason = ?1,
                         checkpoint_commit_sha = ?2, is_recovery_checkpoint = 1,
                         ended_at = datetime('now')
                     WHERE id = ?3 AND status = 'running'",
                    params![reason, sha, id],
                )
                .context("Failed to fail pulse")?,
            None => self
                .conn
                .execute(
                    "UPDATE pulses
                     SET status = 'failed', failure_reason = ?1, ended_at = datetime('now')
                     WHERE id = ?2 AND status = 'running'",
                    params![reason, id],
                )
                .context("Failed to fail pulse")?,
        };
        if changed == 0 {
            return Err(self.invalid_pulse_transition(id, PulseStatus::Failed));
        }
        warn!(pulse_id = %id, reason, "pulse failed");
        self.require_pulse(id)
    }

    /// running → stopped (user-initiated, cooperative). Same recovery
    /// checkpoint semantics as failure.
    pub fn stop_pulse(&self, id: &str, recovery_commit_sha: Option<&str>) -> EngineResult<Pulse> {
        let changed = match recovery_commit_sha {
            Some(sha) => self
                .conn
                .execute(
                    "UPDATE pulses
                     SET status = 'stopped', checkpoint_commit_sha = ?1,
                         is_recovery_checkpoint = 1, ended_at = datetime('now')
                     WHERE id = ?2 AND status = 'running'",
                    params![sha, id],
                )
                .context("Failed to stop pulse")?,
            None => self
                .conn
                .execute(
                    "UPDATE pulses
                     SET status = 'stopped', ended_at = datetime('now')
                     WHERE id = ?1 AND status = 'running'",
                    params![id],
                )
                .context("Failed to stop pulse")?,
        };
        if changed == 0 {
            return Err(self.invalid_pulse_transition(id, PulseStatus::Stopped));
        }
        info!(pulse_id = %id, "pulse stopped");
        self.require_pulse(id)
    }

    /// Bump the rejection counter; returns the new count. Used when a human
    /// rejects the pulse's diff during review, to detect rejection loops.
    pub fn increment_rejection_count(&self, id: &str) -> EngineResult<i64> {
        let changed = self
            .conn
            .execute(
                "UPDATE pulses SET rejection_count = rejection_count + 1 WHERE id = ?1",
                params![id],
            )
            .context("Failed to increment rejection count")?;
        if changed == 0 {
            return Err(EngineError::PulseNotFound { id: id.to_string() });
        }
        let count = self
            .conn
            .query_row(
                "SELECT rejection_count FROM pulses WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .context("Failed to read rejection count")?;
        Ok(count)
    }

    // ── Pulse queries ─────────────────────────────────────────────────

    pub fn get_pulse(&self, id: &str) -> EngineResult<Option<Pulse>> {
        let sql = format!("SELECT {PULSE_COLUMNS} FROM pulses WHERE id = ?1");
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare get_pulse")?;
        let mut rows = stmt
            .query_map(params![id], PulseRow::from_row)
            .context("Failed to query pulse")?;
        match rows.next() {
            Some(row) => {
                let r = row.context("Failed to read pulse row")?;
                Ok(Some(r.into_pulse()?))
            }
            None => Ok(None),
        }
    }

    /// Oldest proposed pulse for a workflow (FIFO over insertion order).
    pub fn get_next_proposed_pulse(&self, workflow_id: &str) -> EngineResult<Option<Pulse>> {
        let sql = format!(
            "SELECT {PULSE_COLUMNS} FROM pulses
             WHERE workflow_id = ?1 AND status = 'proposed'
             ORDER BY rowid LIMIT 1"
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare get_next_proposed_pulse")?;
        let mut rows = stmt
            .query_map(params![workflow_id], PulseRow::from_row)
            .context("Failed to query proposed pulse")?;
        match rows.next() {
            Some(row) => {
                let r = row.context("Failed to read pulse row")?;
                Ok(Some(r.into_pulse()?))
            }
            None => Ok(None),
        }
    }

    /// The single running pulse for a workflow, if any. More than one is an
    /// invariant violation; the newest is returned and a warning logged.
    pub fn get_running_pulse(&self, workflow_id: &str) -> EngineResult<Option<Pulse>> {
        let sql = format!(
            "SELECT {PULSE_COLUMNS} FROM pulses
             WHERE workflow_id = ?1 AND status = 'running'
             ORDER BY rowid DESC"
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare get_running_pulse")?;
        let rows = stmt
            .query_map(params![workflow_id], PulseRow::from_row)
            .context("Failed to query running pulse")?;
        let mut pulses = Vec::new();
        for row in rows {
            let r = row.context("Failed to read pulse row")?;
            pulses.push(r.into_pulse()?);
        }
        if pulses.len() > 1 {
            warn!(
                workflow_id,
                count = pulses.len(),
                "multiple running pulses observed for one workflow"
            );
        }
        Ok(pulses.into_iter().next())
    }

    /// All pulses for a workflow in chronological (insertion) order.
    pub fn get_pulses_for_workflow(&self, workflow_id: &str) -> EngineResult<Vec<Pulse>> {
        let sql = format!(
            "SELECT {PULSE_COLUMNS} FROM pulses WHERE workflow_id = ?1 ORDER BY rowid"
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare get_pulses_for_workflow")?;
        let rows = stmt
            .query_map(params![workflow_id], PulseRow::from_row)
            .context("Failed to query pulses")?;
        let mut pulses = Vec::new();
        for row in rows {
            let r = row.context("Failed to read pulse row")?;
            pulses.push(r.into_pulse()?);
        }
        Ok(pulses)
    }

    fn require_pulse(&self, id: &str) -> EngineResult<Pulse> {
        self.get_pulse(id)?
            .ok_or_else(|| EngineError::PulseNotFound { id: id.to_string() })
    }

    fn invalid_pulse_transition(&self, id: &str, to: PulseStatus) -> EngineError {
        match self.get_pulse(id) {
            Ok(Some(pulse)) => EngineError::InvalidTransition {
                entity: "pulse",
                id: id.to_string(),
                from: pulse.status.as_str().to_string(),
                to: to.as_str().to_string(),
            },
            Ok(None) => EngineError::PulseNotFound { id: id.to_string() },
            Err(e) => e,
        }
    }

    // ── Preflight setup ───────────────────────────────────────────────

    /// Create the workflow's preflight setup row. Upsert-once: if a row
    /// already exists for the workflow, it is returned unchanged.
    pub fn create_preflight_setup(&self, workflow_id: &str) -> EngineResult<PreflightSetup> {
        self.require_workflow(workflow_id)?;
        let id = ids::new_id(ids::PREFLIGHT);
        self.conn
            .execute(
                "INSERT INTO preflight_setups (id, workflow_id) VALUES (?1, ?2)
                 ON CONFLICT(workflow_id) DO NOTHING",
                params![id, workflow_id],
            )
            .context("Failed to insert preflight setup")?;
        self.get_preflight_setup(workflow_id)?
            .context("Preflight setup not found after insert")
            .map_err(EngineError::from)
    }

    pub fn update_preflight_progress(
        &self,
        workflow_id: &str,
        message: &str,
    ) -> EngineResult<PreflightSetup> {
        self.conn
            .execute(
                "UPDATE preflight_setups
                 SET progress_message = ?1, updated_at = datetime('now')
                 WHERE workflow_id = ?2",
                params![message, workflow_id],
            )
            .context("Failed to update preflight progress")?;
        self.get_preflight_setup(workflow_id)?
            .context("Preflight setup not found for progress update")
            .map_err(EngineError::from)
    }

    pub fn complete_preflight_setup(
        &self,
        workflow_id: &str,
        verification_commands: &[String],
    ) -> EngineResult<PreflightSetup> {
        let json = to_json_field("verification_commands", &verification_commands)?;
        self.conn
            .execute(
                "UPDATE preflight_setups
                 SET status = 'completed', verification_commands = ?1,
                     updated_at = datetime('now')
                 WHERE workflow_id = ?2",
                params![json, workflow_id],
            )
            .context("Failed to complete preflight setup")?;
        self.get_preflight_setup(workflow_id)?
            .context("Preflight setup not found for completion")
            .map_err(EngineError::from)
    }

    pub fn fail_preflight_setup(
        &self,
        workflow_id: &str,
        error_message: &str,
    ) -> EngineResult<PreflightSetup> {
        self.conn
            .execute(
                "UPDATE preflight_setups
                 SET status = 'failed', error_message = ?1, updated_at = datetime('now')
                 WHERE workflow_id = ?2",
                params![error_message, workflow_id],
            )
            .context("Failed to fail preflight setup")?;
        self.get_preflight_setup(workflow_id)?
            .context("Preflight setup not found for failure")
            .map_err(EngineError::from)
    }

    pub fn get_preflight_setup(&self, workflow_id: &str) -> EngineResult<Option<PreflightSetup>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, workflow_id, status, progress_message, verification_commands,
                        error_message, created_at, updated_at
                 FROM preflight_setups WHERE workflow_id = ?1",
            )
            .context("Failed to prepare get_preflight_setup")?;
        let mut rows = stmt
            .query_map(params![workflow_id], |row| {
                Ok(PreflightSetupRow {
                    id: row.get(0)?,
                    workflow_id: row.get(1)?,
                    status: row.get(2)?,
                    progress_message: row.get(3)?,
                    verification_commands: row.get(4)?,
                    error_message: row.get(5)?,
                    created_at: row.get(6)?,
                    updated_at: row.get(7)?,
                })
            })
            .context("Failed to query preflight setup")?;
        match rows.next() {
            Some(row) => {
                let r = row.context("Failed to read preflight setup row")?;
                Ok(Some(r.into_setup()?))
            }
            None => Ok(None),
        }
    }

    // ── Baselines ─────────────────────────────────────────────────────

    /// Append one pre-existing issue to the workflow's baseline snapshot.
    pub fn record_baseline(
        &self,
        workflow_id: &str,
        issue_type: &str,
        source: &str,
        pattern: &str,
        file_path: Option<&str>,
    ) -> EngineResult<PreflightBaseline> {
        let id = ids::new_id(ids::BASELINE);
        self.conn
            .execute(
                "INSERT INTO preflight_baselines (id, workflow_id, issue_type, source, pattern, file_path)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![id, workflow_id, issue_type, source, pattern, file_path],
            )
            .context("Failed to insert baseline")?;
        self.conn
            .query_row(
                "SELECT id, workflow_id, issue_type, source, pattern, file_path, created_at
                 FROM preflight_baselines WHERE id = ?1",
                params![id],
                |row| {
                    Ok(PreflightBaseline {
                        id: row.get(0)?,
                        workflow_id: row.get(1)?,
                        issue_type: row.get(2)?,
                        source: row.get(3)?,
                        pattern: row.get(4)?,
                        file_path: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                },
            )
            .context("Baseline not found after insert")
            .map_err(EngineError::from)
    }

    /// Snapshot a verification command's pre-existing output.
    pub fn record_command_baseline(
        &self,
        workflow_id: &str,
        command: &str,
        stdout: &str,
        stderr: &str,
        exit_code: i64,
    ) -> EngineResult<PreflightCommandBaseline> {
        let id = ids::new_id(ids::BASELINE);
        self.conn
            .execute(
                "INSERT INTO preflight_command_baselines
                     (id, workflow_id, command, stdout, stderr, exit_code)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![id, workflow_id, command, stdout, stderr, exit_code],
            )
            .context("Failed to insert command baseline")?;
        self.conn
            .query_row(
                "SELECT id, workflow_id, command, stdout, stderr, exit_code, created_at
                 FROM preflight_command_baselines WHERE id = ?1",
                params![id],
                |row| {
                    Ok(PreflightCommandBaseline {
                        id: row.get(0)?,
                        workflow_id: row.get(1)?,
                        command: row.get(2)?,
                        stdout: row.get(3)?,
                        stderr: row.get(4)?,
                        exit_code: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                },
            )
            .context("Command baseline not found after insert")
            .map_err(EngineError::from)
    }

    pub fn get_baselines(&self, workflow_id: &str) -> EngineResult<Vec<PreflightBaseline>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, workflow_id, issue_type, source, pattern, file_path, created_at
                 FROM preflight_baselines WHERE workflow_id = ?1 ORDER BY rowid",
            )
            .context("Failed to prepare get_baselines")?;
        let rows = stmt
            .query_map(params![workflow_id], |row| {
                Ok(PreflightBaseline {
                    id: row.get(0)?,
                    workflow_id: row.get(1)?,
                    issue_type: row.get(2)?,
                    source: row.get(3)?,
                    pattern: row.get(4)?,
                    file_path: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })
            .context("Failed to query baselines")?;
        let mut baselines = Vec::new();
        for row in rows {
            baselines.push(row.context("Failed to read baseline row")?);
        }
        Ok(baselines)
    }

    pub fn get_command_baselines(
        &self,
        workflow_id: &str,
    ) -> EngineResult<Vec<PreflightCommandBaseline>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, workflow_id, command, stdout, stderr, exit_code, created_at
                 FROM preflight_command_baselines WHERE workflow_id = ?1 ORDER BY rowid",
            )
            .context("Failed to prepare get_command_baselines")?;
        let rows = stmt
            .query_map(params![workflow_id], |row| {
                Ok(PreflightCommandBaseline {
                    id: row.get(0)?,
                    workflow_id: row.get(1)?,
                    command: row.get(2)?,
                    stdout: row.get(3)?,
                    stderr: row.get(4)?,
                    exit_code: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })
            .context("Failed to query command baselines")?;
        let mut baselines = Vec::new();
        for row in rows {
            baselines.push(row.context("Failed to read command baseline row")?);
        }
        Ok(baselines)
    }

    /// Classify an issue against the workflow's baseline snapshot: true iff
    /// some baseline for the same source has its `pattern` as a substring of
    /// `message`, and, when the baseline is file-scoped, the caller supplied
    /// the exact same file path. An absent caller path never matches a
    /// file-scoped baseline.
    ///
    /// Deliberately a permissive, ordering-independent scan over all
    /// baselines for the source — substring matching rules out an indexed
    /// lookup.
    pub fn matches_baseline(
        &self,
        workflow_id: &str,
        source: &str,
        message: &str,
        file_path: Option<&str>,
    ) -> EngineResult<bool> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT pattern, file_path FROM preflight_baselines
                 WHERE workflow_id = ?1 AND source = ?2",
            )
            .context("Failed to prepare matches_baseline")?;
        let rows = stmt
            .query_map(params![workflow_id, source], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
            })
            .context("Failed to query baselines for match")?;
        for row in rows {
            let (pattern, baseline_file) = row.context("Failed to read baseline row")?;
            if !message.contains(&pattern) {
                continue;
            }
            match (&baseline_file, file_path) {
                (None, _) => {
                    debug!(workflow_id, source, pattern, "issue matches baseline");
                    return Ok(true);
                }
                (Some(bf), Some(cf)) if bf == cf => {
                    debug!(workflow_id, source, pattern, file = cf, "issue matches file-scoped baseline");
                    return Ok(true);
                }
                _ => {}
            }
        }
        Ok(false)
    }
}

struct PulseRow {
    id: String,
    workflow_id: String,
    planned_pulse_id: Option<String>,
    description: String,
    status: String,
    pulse_branch: Option<String>,
    worktree_path: Option<String>,
    checkpoint_commit_sha: Option<String>,
    has_unresolved_issues: bool,
    is_recovery_checkpoint: bool,
    rejection_count: i64,
    failure_reason: Option<String>,
    started_at: Option<String>,
    ended_at: Option<String>,
    created_at: String,
}

impl PulseRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            workflow_id: row.get(1)?,
            planned_pulse_id: row.get(2)?,
            description: row.get(3)?,
            status: row.get(4)?,
            pulse_branch: row.get(5)?,
            worktree_path: row.get(6)?,
            checkpoint_commit_sha: row.get(7)?,
            has_unresolved_issues: row.get(8)?,
            is_recovery_checkpoint: row.get(9)?,
            rejection_count: row.get(10)?,
            failure_reason: row.get(11)?,
            started_at: row.get(12)?,
            ended_at: row.get(13)?,
            created_at: row.get(14)?,
        })
    }

    fn into_pulse(self) -> EngineResult<Pulse> {
        let status = PulseStatus::from_str(&self.status)
            .map_err(|message| EngineError::InvalidField { field: "status", message })?;
        Ok(Pulse {
            id: self.id,
            workflow_id: self.workflow_id,
            planned_pulse_id: self.planned_pulse_id,
            description: self.description,
            status,
            pulse_branch: self.pulse_branch,
            worktree_path: self.worktree_path,
            checkpoint_commit_sha: self.checkpoint_commit_sha,
            has_unresolved_issues: self.has_unresolved_issues,
            is_recovery_checkpoint: self.is_recovery_checkpoint,
            rejection_count: self.rejection_count,
            failure_reason: self.failure_reason,
            started_at: self.started_at,
            ended_at: self.ended_at,
            created_at: self.created_at,
        })
    }
}

struct PreflightSetupRow {
    id: String,
    workflow_id: String,
    status: String,
    progress_message: Option<String>,
    verification_commands: String,
    error_message: Option<String>,
    created_at: String,
    updated_at: String,
}

impl PreflightSetupRow {
    fn into_setup(self) -> EngineResult<PreflightSetup> {
        let status = PreflightStatus::from_str(&self.status)
            .map_err(|message| EngineError::InvalidField { field: "status", message })?;
        let verification_commands: Vec<String> =
            parse_json_field("verification_commands", &self.verification_commands)?;
        Ok(PreflightSetup {
            id: self.id,
            workflow_id: self.workflow_id,
            status,
            progress_message: self.progress_message,
            verification_commands,
            error_message: self.error_message,
            created_at: self.created_at,
            updated_at: self.updated_at,
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
    fn test_create_pulse_is_proposed() {
        let (db, wf) = db_with_workflow();
        let pulse = db.create_pulse(&wf, "add login endpoint").unwrap();
        assert!(pulse.id.starts_with("pulse_"));
        assert_eq!(pulse.status, PulseStatus::Proposed);
        assert!(pulse.checkpoint_commit_sha.is_none());
        assert!(pulse.started_at.is_none());
        assert_eq!(pulse.rejection_count, 0);
    }

    #[test]
    fn test_create_pulses_from_plan_preserves_order() {
        let (db, wf) = db_with_workflow();
        let planned = vec![
            PlannedPulse { id: "pp-1".into(), description: "first".into() },
            PlannedPulse { id: "pp-2".into(), description: "second".into() },
            PlannedPulse { id: "pp-3".into(), description: "third".into() },
        ];
        let created = db.create_pulses_from_plan(&wf, &planned).unwrap();
        assert_eq!(created.len(), 3);

        let fetched = db.get_pulses_for_workflow(&wf).unwrap();
        assert_eq!(fetched.len(), 3);
        let plan_ids: Vec<_> = fetched
            .iter()
            .map(|p| p.planned_pulse_id.as_deref().unwrap())
            .collect();
        assert_eq!(plan_ids, vec!["pp-1", "pp-2", "pp-3"]);
        assert!(fetched.iter().all(|p| p.status == PulseStatus::Proposed));
    }

    #[test]
    fn test_start_complete_lifecycle() {
        let (db, wf) = db_with_workflow();
        let pulse = db.create_pulse(&wf, "work").unwrap();
        let started = db
            .start_pulse(&pulse.id, "pulse/p1", "/tmp/wt/p1")
            .unwrap();
        assert_eq!(started.status, PulseStatus::Running);
        assert!(started.started_at.is_some());
        assert_eq!(started.pulse_branch.as_deref(), Some("pulse/p1"));

        let done = db.complete_pulse(&pulse.id, "abc123", false).unwrap();
        assert_eq!(done.status, PulseStatus::Succeeded);
        assert_eq!(done.checkpoint_commit_sha.as_deref(), Some("abc123"));
        assert!(done.ended_at.is_some());
        assert!(!done.has_unresolved_issues);
    }

    #[test]
    fn test_start_rejects_non_proposed() {
        let (db, wf) = db_with_workflow();
        let pulse = db.create_pulse(&wf, "work").unwrap();
        db.start_pulse(&pulse.id, "b", "/wt").unwrap();
        db.complete_pulse(&pulse.id, "sha", false).unwrap();

        let err = db.start_pulse(&pulse.id, "b", "/wt").unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[test]
    fn test_at_most_one_running_pulse_per_workflow() {
        let (db, wf) = db_with_workflow();
        let p1 = db.create_pulse(&wf, "first").unwrap();
        let p2 = db.create_pulse(&wf, "second").unwrap();
        db.start_pulse(&p1.id, "b1", "/wt1").unwrap();

        let err = db.start_pulse(&p2.id, "b2", "/wt2").unwrap_err();
        assert!(matches!(err, EngineError::PulseAlreadyRunning { .. }));

        // Exactly one pulse is running.
        let running = db.get_running_pulse(&wf).unwrap().unwrap();
        assert_eq!(running.id, p1.id);
        let all = db.get_pulses_for_workflow(&wf).unwrap();
        assert_eq!(
            all.iter().filter(|p| p.status == PulseStatus::Running).count(),
            1
        );
    }

    #[test]
    fn test_fail_with_recovery_checkpoint() {
        let (db, wf) = db_with_workflow();
        let pulse = db.create_pulse(&wf, "risky").unwrap();
        db.start_pulse(&pulse.id, "b", "/wt").unwrap();

        let failed = db
            .fail_pulse(&pulse.id, "build broke", Some("recov42"))
            .unwrap();
        assert_eq!(failed.status, PulseStatus::Failed);
        assert_eq!(failed.failure_reason.as_deref(), Some("build broke"));
        assert_eq!(failed.checkpoint_commit_sha.as_deref(), Some("recov42"));
        assert!(failed.is_recovery_checkpoint);
        assert!(failed.ended_at.is_some());
    }

    #[test]
    fn test_fail_without_recovery_leaves_checkpoint_unset() {
        let (db, wf) = db_with_workflow();
        let pulse = db.create_pulse(&wf, "risky").unwrap();
        db.start_pulse(&pulse.id, "b", "/wt").unwrap();

        let failed = db.fail_pulse(&pulse.id, "no progress", None).unwrap();
        assert!(failed.checkpoint_commit_sha.is_none());
        assert!(!failed.is_recovery_checkpoint);
    }

    #[test]
    fn test_stop_pulse_with_recovery() {
        let (db, wf) = db_with_workflow();
        let pulse = db.create_pulse(&wf, "abortable").unwrap();
        db.start_pulse(&pulse.id, "b", "/wt").unwrap();

        let stopped = db.stop_pulse(&pulse.id, Some("partial7")).unwrap();
        assert_eq!(stopped.status, PulseStatus::Stopped);
        assert!(stopped.is_recovery_checkpoint);
        assert_eq!(stopped.checkpoint_commit_sha.as_deref(), Some("partial7"));

        // Terminal: cannot stop or complete again.
        assert!(db.stop_pulse(&pulse.id, None).is_err());
        assert!(db.complete_pulse(&pulse.id, "x", false).is_err());
    }

    #[test]
    fn test_rejection_count_is_monotonic() {
        let (db, wf) = db_with_workflow();
        let pulse = db.create_pulse(&wf, "contested").unwrap();
        for expected in 1..=4 {
            let count = db.increment_rejection_count(&pulse.id).unwrap();
            assert_eq!(count, expected);
        }
        let fetched = db.get_pulse(&pulse.id).unwrap().unwrap();
        assert_eq!(fetched.rejection_count, 4);
    }

    #[test]
    fn test_next_proposed_is_fifo() {
        let (db, wf) = db_with_workflow();
        let p1 = db.create_pulse(&wf, "first").unwrap();
        let _p2 = db.create_pulse(&wf, "second").unwrap();

        let next = db.get_next_proposed_pulse(&wf).unwrap().unwrap();
        assert_eq!(next.id, p1.id);

        db.start_pulse(&p1.id, "b", "/wt").unwrap();
        db.complete_pulse(&p1.id, "sha", false).unwrap();
        let next = db.get_next_proposed_pulse(&wf).unwrap().unwrap();
        assert_eq!(next.description, "second");
    }

    #[test]
    fn test_preflight_setup_upsert_once() {
        let (db, wf) = db_with_workflow();
        let first = db.create_preflight_setup(&wf).unwrap();
        assert_eq!(first.status, PreflightStatus::Running);

        // Second create returns the existing row.
        let again = db.create_preflight_setup(&wf).unwrap();
        assert_eq!(again.id, first.id);
    }

    #[test]
    fn test_preflight_lifecycle() {
        let (db, wf) = db_with_workflow();
        db.create_preflight_setup(&wf).unwrap();
        db.update_preflight_progress(&wf, "installing deps").unwrap();

        let commands = vec!["cargo check".to_string(), "cargo test".to_string()];
        let done = db.complete_preflight_setup(&wf, &commands).unwrap();
        assert_eq!(done.status, PreflightStatus::Completed);
        assert_eq!(done.verification_commands, commands);
        assert_eq!(done.progress_message.as_deref(), Some("installing deps"));
    }

    #[test]
    fn test_preflight_failure_carries_error() {
        let (db, wf) = db_with_workflow();
        db.create_preflight_setup(&wf).unwrap();
        let failed = db.fail_preflight_setup(&wf, "npm install failed").unwrap();
        assert_eq!(failed.status, PreflightStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("npm install failed"));
    }

    #[test]
    fn test_matches_baseline_substring() {
        let (db, wf) = db_with_workflow();
        db.record_baseline(&wf, "type_error", "build", "error TS2345", None)
            .unwrap();

        assert!(db
            .matches_baseline(&wf, "build", "src/x.ts(3,1): error TS2345: bad arg", None)
            .unwrap());
        assert!(!db
            .matches_baseline(&wf, "build", "error TS9999: other", None)
            .unwrap());
        // Different source never matches.
        assert!(!db
            .matches_baseline(&wf, "lint", "error TS2345", None)
            .unwrap());
    }

    #[test]
    fn test_matches_baseline_file_scoping() {
        let (db, wf) = db_with_workflow();
        db.record_baseline(&wf, "lint_error", "lint", "unused variable", Some("src/a.rs"))
            .unwrap();

        // Exact file match required.
        assert!(db
            .matches_baseline(&wf, "lint", "warning: unused variable `x`", Some("src/a.rs"))
            .unwrap());
        assert!(!db
            .matches_baseline(&wf, "lint", "warning: unused variable `x`", Some("src/b.rs"))
            .unwrap());
        // Absent caller path never matches a file-scoped baseline.
        assert!(!db
            .matches_baseline(&wf, "lint", "warning: unused variable `x`", None)
            .unwrap());
    }

    #[test]
    fn test_command_baseline_roundtrip() {
        let (db, wf) = db_with_workflow();
        db.record_command_baseline(&wf, "cargo test", "2 passed", "warning: unused", 0)
            .unwrap();
        let baselines = db.get_command_baselines(&wf).unwrap();
        assert_eq!(baselines.len(), 1);
        assert_eq!(baselines[0].command, "cargo test");
        assert_eq!(baselines[0].exit_code, 0);
    }
}
