//! Async engine facade.
//!
//! `Engine` is the one type embedders hold: it owns the database handle and
//! the event hub, exposes async versions of the store operations, and
//! publishes an [`EngineEvent`] after each state-changing write commits.
//! Reads pass straight through. All parameters are owned because the work
//! runs on a blocking thread.

use std::path::Path;

use tracing::instrument;

use crate::context::Context;
use crate::errors::EngineResult;
use crate::events::{EngineEvent, EventHub};
use crate::models::{
    AgentRole, ArtifactType, CostRecord, ModelRate, NewCostRecord, NewReviewComment, PlannedPulse,
    PreflightSetup, Priority, Pulse, Recommendation, ReviewCard, ReviewComment, Session,
    StageArtifact, Subtask, Turn, TurnHistory, TurnRole, TurnUsage, Workflow, WorkflowStatus,
};
use crate::store::{DbHandle, EngineDb};

#[derive(Clone)]
pub struct Engine {
    db: DbHandle,
    events: EventHub,
}

impl Engine {
    /// Open the engine over a SQLite file, applying migrations.
    pub fn open(path: &Path) -> EngineResult<Self> {
        Ok(Self {
            db: DbHandle::new(EngineDb::new(path)?),
            events: EventHub::new(),
        })
    }

    /// In-memory engine for tests.
    pub fn in_memory() -> EngineResult<Self> {
        Ok(Self {
            db: DbHandle::new(EngineDb::new_in_memory()?),
            events: EventHub::new(),
        })
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    /// Direct access to the database handle, for callers composing their
    /// own store calls.
    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    // ── Workflows ─────────────────────────────────────────────────────

    #[instrument(skip(self, description))]
    pub async fn create_workflow(
        &self,
        title: String,
        description: String,
        priority: Priority,
        base_branch: Option<String>,
    ) -> EngineResult<Workflow> {
        let workflow = self
            .db
            .call(move |db| {
                db.create_workflow(&title, &description, &priority, base_branch.as_deref())
            })
            .await?;
        self.events.publish(EngineEvent::WorkflowCreated {
            workflow: workflow.clone(),
        });
        Ok(workflow)
    }

    pub async fn get_workflow(&self, id: String) -> EngineResult<Option<Workflow>> {
        self.db.call(move |db| db.get_workflow(&id)).await
    }

    pub async fn list_workflows(&self, include_archived: bool) -> EngineResult<Vec<Workflow>> {
        self.db
            .call(move |db| db.list_workflows(include_archived))
            .await
    }

    #[instrument(skip(self))]
    pub async fn transition_stage(
        &self,
        id: String,
        next_stage: WorkflowStatus,
        new_session_id: Option<String>,
    ) -> EngineResult<Workflow> {
        let workflow = self
            .db
            .call(move |db| db.transition_stage(&id, &next_stage, new_session_id.as_deref()))
            .await?;
        self.events.publish(EngineEvent::WorkflowStageChanged {
            workflow: workflow.clone(),
        });
        Ok(workflow)
    }

    pub async fn set_awaiting_approval(
        &self,
        id: String,
        artifact_type: ArtifactType,
    ) -> EngineResult<Workflow> {
        let workflow = self
            .db
            .call(move |db| db.set_awaiting_approval(&id, &artifact_type))
            .await?;
        self.events.publish(EngineEvent::WorkflowAwaitingApproval {
            workflow: workflow.clone(),
        });
        Ok(workflow)
    }

    pub async fn clear_awaiting_approval(&self, id: String) -> EngineResult<Workflow> {
        self.db.call(move |db| db.clear_awaiting_approval(&id)).await
    }

    pub async fn archive_workflow(&self, id: String) -> EngineResult<Workflow> {
        let workflow = self
            .db
            .call(move |db| db.archive_workflow(&id))
            .await?;
        self.events.publish(EngineEvent::WorkflowArchived {
            workflow_id: workflow.id.clone(),
        });
        Ok(workflow)
    }

    #[instrument(skip(self))]
    pub async fn delete_workflow(&self, id: String) -> EngineResult<bool> {
        let event_id = id.clone();
        let deleted = self.db.call(move |db| db.delete_workflow(&id)).await?;
        if deleted {
            self.events.publish(EngineEvent::WorkflowDeleted {
                workflow_id: event_id,
            });
        }
        Ok(deleted)
    }

    // ── Pulses ────────────────────────────────────────────────────────

    pub async fn create_pulses_from_plan(
        &self,
        workflow_id: String,
        plan: Vec<PlannedPulse>,
    ) -> EngineResult<Vec<Pulse>> {
        let event_workflow_id = workflow_id.clone();
        let pulses = self
            .db
            .call(move |db| db.create_pulses_from_plan(&workflow_id, &plan))
            .await?;
        self.events.publish(EngineEvent::PulsesPlanned {
            workflow_id: event_workflow_id,
            pulse_ids: pulses.iter().map(|p| p.id.clone()).collect(),
        });
        Ok(pulses)
    }

    #[instrument(skip(self))]
    pub async fn start_pulse(
        &self,
        id: String,
        branch: String,
        worktree_path: String,
    ) -> EngineResult<Pulse> {
        let pulse = self
            .db
            .call(move |db| db.start_pulse(&id, &branch, &worktree_path))
            .await?;
        self.events.publish(EngineEvent::PulseStarted {
            pulse: pulse.clone(),
        });
        Ok(pulse)
    }

    pub async fn complete_pulse(
        &self,
        id: String,
        commit_sha: String,
        has_unresolved_issues: bool,
    ) -> EngineResult<Pulse> {
        let pulse = self
            .db
            .call(move |db| db.complete_pulse(&id, &commit_sha, has_unresolved_issues))
            .await?;
        self.events.publish(EngineEvent::PulseCompleted {
            pulse: pulse.clone(),
        });
        Ok(pulse)
    }

    pub async fn fail_pulse(
        &self,
        id: String,
        reason: String,
        recovery_commit_sha: Option<String>,
    ) -> EngineResult<Pulse> {
        let event_reason = reason.clone();
        let pulse = self
            .db
            .call(move |db| db.fail_pulse(&id, &reason, recovery_commit_sha.as_deref()))
            .await?;
        self.events.publish(EngineEvent::PulseFailed {
            pulse: pulse.clone(),
            reason: event_reason,
        });
        Ok(pulse)
    }

    pub async fn stop_pulse(
        &self,
        id: String,
        recovery_commit_sha: Option<String>,
    ) -> EngineResult<Pulse> {
        let pulse = self
            .db
            .call(move |db| db.stop_pulse(&id, recovery_commit_sha.as_deref()))
            .await?;
        self.events.publish(EngineEvent::PulseStopped {
            pulse: pulse.clone(),
        });
        Ok(pulse)
    }

    // ── Preflight ─────────────────────────────────────────────────────

    pub async fn create_preflight_setup(
        &self,
        workflow_id: String,
    ) -> EngineResult<PreflightSetup> {
        self.db
            .call(move |db| db.create_preflight_setup(&workflow_id))
            .await
    }

    pub async fn update_preflight_progress(
        &self,
        workflow_id: String,
        message: String,
    ) -> EngineResult<PreflightSetup> {
        self.db
            .call(move |db| db.update_preflight_progress(&workflow_id, &message))
            .await
    }

    pub async fn complete_preflight_setup(
        &self,
        workflow_id: String,
        verification_commands: Vec<String>,
    ) -> EngineResult<PreflightSetup> {
        let setup = self
            .db
            .call(move |db| db.complete_preflight_setup(&workflow_id, &verification_commands))
            .await?;
        self.events.publish(EngineEvent::PreflightCompleted {
            workflow_id: setup.workflow_id.clone(),
        });
        Ok(setup)
    }

    pub async fn fail_preflight_setup(
        &self,
        workflow_id: String,
        error_message: String,
    ) -> EngineResult<PreflightSetup> {
        let event_error = error_message.clone();
        let setup = self
            .db
            .call(move |db| db.fail_preflight_setup(&workflow_id, &error_message))
            .await?;
        self.events.publish(EngineEvent::PreflightFailed {
            workflow_id: setup.workflow_id.clone(),
            error: event_error,
        });
        Ok(setup)
    }

    pub async fn get_preflight_setup(
        &self,
        workflow_id: String,
    ) -> EngineResult<Option<PreflightSetup>> {
        self.db
            .call(move |db| db.get_preflight_setup(&workflow_id))
            .await
    }

    pub async fn get_next_proposed_pulse(
        &self,
        workflow_id: String,
    ) -> EngineResult<Option<Pulse>> {
        self.db
            .call(move |db| db.get_next_proposed_pulse(&workflow_id))
            .await
    }

    pub async fn get_pulses_for_workflow(&self, workflow_id: String) -> EngineResult<Vec<Pulse>> {
        self.db
            .call(move |db| db.get_pulses_for_workflow(&workflow_id))
            .await
    }

    // ── Sessions & turns ──────────────────────────────────────────────

    pub async fn create_session(
        &self,
        context: Context,
        agent_role: AgentRole,
        parent_session_id: Option<String>,
        pulse_id: Option<String>,
    ) -> EngineResult<Session> {
        let session = self
            .db
            .call(move |db| {
                db.create_session(
                    &context,
                    &agent_role,
                    parent_session_id.as_deref(),
                    pulse_id.as_deref(),
                )
            })
            .await?;
        self.events.publish(EngineEvent::SessionCreated {
            session: session.clone(),
        });
        Ok(session)
    }

    pub async fn complete_session(&self, id: String) -> EngineResult<Session> {
        let session = self.db.call(move |db| db.complete_session(&id)).await?;
        self.events.publish(EngineEvent::SessionCompleted {
            session: session.clone(),
        });
        Ok(session)
    }

    pub async fn get_active_session(&self, context: Context) -> EngineResult<Option<Session>> {
        self.db
            .call(move |db| db.get_active_by_context(&context))
            .await
    }

    pub async fn create_turn(
        &self,
        session_id: String,
        turn_index: i64,
        role: TurnRole,
    ) -> EngineResult<Turn> {
        self.db
            .call(move |db| db.create_turn(&session_id, turn_index, &role))
            .await
    }

    /// Complete a turn and, when the usage is attributable, append a cost
    /// record in the same operation so the ledger never misses a turn.
    pub async fn complete_turn(
        &self,
        id: String,
        usage: TurnUsage,
        cost: Option<NewCostRecord>,
    ) -> EngineResult<Turn> {
        let turn = self
            .db
            .call(move |db| {
                let turn = db.complete_turn(&id, &usage)?;
                if let Some(record) = cost {
                    db.insert_cost_record(&record)?;
                }
                Ok(turn)
            })
            .await?;
        self.events.publish(EngineEvent::TurnCompleted {
            turn: turn.clone(),
        });
        Ok(turn)
    }

    pub async fn get_turn_history(&self, session_id: String) -> EngineResult<Vec<TurnHistory>> {
        self.db
            .call(move |db| db.get_turn_history(&session_id))
            .await
    }

    // ── Subtasks ──────────────────────────────────────────────────────

    pub async fn create_subtask(
        &self,
        parent_session_id: String,
        workflow_id: String,
        task_definition: String,
    ) -> EngineResult<Subtask> {
        self.db
            .call(move |db| db.create_subtask(&parent_session_id, &workflow_id, &task_definition))
            .await
    }

    pub async fn start_subtask(&self, id: String) -> EngineResult<Subtask> {
        let subtask = self.db.call(move |db| db.start_subtask(&id)).await?;
        self.events.publish(EngineEvent::SubtaskStarted {
            subtask: subtask.clone(),
        });
        Ok(subtask)
    }

    pub async fn complete_subtask(&self, id: String, findings: String) -> EngineResult<Subtask> {
        let subtask = self
            .db
            .call(move |db| db.complete_subtask(&id, &findings))
            .await?;
        self.events.publish(EngineEvent::SubtaskCompleted {
            subtask: subtask.clone(),
        });
        Ok(subtask)
    }

    pub async fn fail_subtask(&self, id: String) -> EngineResult<Subtask> {
        let subtask = self.db.call(move |db| db.fail_subtask(&id)).await?;
        self.events.publish(EngineEvent::SubtaskFailed {
            subtask: subtask.clone(),
        });
        Ok(subtask)
    }

    // ── Artifacts & reviews ───────────────────────────────────────────

    pub async fn save_artifact(
        &self,
        workflow_id: String,
        artifact_type: ArtifactType,
        content: serde_json::Value,
    ) -> EngineResult<StageArtifact> {
        let artifact = self
            .db
            .call(move |db| db.save_artifact(&workflow_id, &artifact_type, &content))
            .await?;
        self.events.publish(EngineEvent::ArtifactSaved {
            artifact: artifact.clone(),
        });
        Ok(artifact)
    }

    pub async fn get_latest_artifact(
        &self,
        workflow_id: String,
        artifact_type: ArtifactType,
    ) -> EngineResult<Option<StageArtifact>> {
        self.db
            .call(move |db| db.get_latest_artifact(&workflow_id, &artifact_type))
            .await
    }

    pub async fn create_review_card(
        &self,
        workflow_id: String,
        round_number: i64,
    ) -> EngineResult<ReviewCard> {
        self.db
            .call(move |db| db.create_review_card(&workflow_id, round_number))
            .await
    }

    pub async fn add_review_comment(
        &self,
        card_id: String,
        comment: NewReviewComment,
    ) -> EngineResult<ReviewComment> {
        self.db
            .call(move |db| db.add_review_comment(&card_id, &comment))
            .await
    }

    pub async fn complete_review(
        &self,
        card_id: String,
        recommendation: Recommendation,
        summary: String,
    ) -> EngineResult<ReviewCard> {
        let card = self
            .db
            .call(move |db| db.complete_review(&card_id, &recommendation, &summary))
            .await?;
        self.events.publish(EngineEvent::ReviewCompleted {
            card: card.clone(),
        });
        Ok(card)
    }

    // ── Costs ─────────────────────────────────────────────────────────

    pub async fn record_cost(&self, record: NewCostRecord) -> EngineResult<CostRecord> {
        let record = self
            .db
            .call(move |db| db.insert_cost_record(&record))
            .await?;
        self.events.publish(EngineEvent::CostRecorded {
            record: record.clone(),
        });
        Ok(record)
    }

    /// Workflow spend including every subtask spawned under it.
    pub async fn total_workflow_cost(&self, workflow_id: String) -> EngineResult<f64> {
        self.db
            .call(move |db| {
                let subtask_ids = db.get_subtask_ids_for_workflow(&workflow_id)?;
                db.get_total_workflow_cost(&workflow_id, &subtask_ids)
            })
            .await
    }

    #[instrument(skip(self, rates))]
    pub async fn repair_cost_records(
        &self,
        rates: Vec<ModelRate>,
        min_total_tokens: i64,
    ) -> EngineResult<usize> {
        self.db
            .call(move |db| db.repair_cost_records(&rates, min_total_tokens))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PreflightStatus, PulseStatus};

    #[tokio::test]
    async fn test_workflow_events_published() {
        let engine = Engine::in_memory().unwrap();
        let mut rx = engine.events().subscribe();

        let wf = engine
            .create_workflow("add auth".into(), "".into(), Priority::High, None)
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            EngineEvent::WorkflowCreated { workflow } => assert_eq!(workflow.id, wf.id),
            other => panic!("Unexpected event {other:?}"),
        }

        engine
            .transition_stage(wf.id.clone(), WorkflowStatus::Scoping, None)
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            EngineEvent::WorkflowStageChanged { workflow } => {
                assert_eq!(workflow.status, WorkflowStatus::Scoping);
            }
            other => panic!("Unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_pulse_flow_through_facade() {
        let engine = Engine::in_memory().unwrap();
        let wf = engine
            .create_workflow("t".into(), "".into(), Priority::Medium, None)
            .await
            .unwrap();
        let plan = vec![
            PlannedPulse { id: "p1".into(), description: "first".into() },
            PlannedPulse { id: "p2".into(), description: "second".into() },
        ];
        let pulses = engine
            .create_pulses_from_plan(wf.id.clone(), plan)
            .await
            .unwrap();
        assert_eq!(pulses.len(), 2);

        let next = engine
            .get_next_proposed_pulse(wf.id.clone())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.id, pulses[0].id);

        let mut rx = engine.events().subscribe();
        let started = engine
            .start_pulse(next.id.clone(), "cadence/p1".into(), "/tmp/wt".into())
            .await
            .unwrap();
        assert_eq!(started.status, PulseStatus::Running);
        match rx.recv().await.unwrap() {
            EngineEvent::PulseStarted { pulse } => assert_eq!(pulse.id, started.id),
            other => panic!("Unexpected event {other:?}"),
        }

        let done = engine
            .complete_pulse(next.id, "abc123".into(), false)
            .await
            .unwrap();
        assert_eq!(done.status, PulseStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_preflight_outcomes_publish_events() {
        let engine = Engine::in_memory().unwrap();
        let wf = engine
            .create_workflow("t".into(), "".into(), Priority::Medium, None)
            .await
            .unwrap();
        engine.create_preflight_setup(wf.id.clone()).await.unwrap();
        engine
            .update_preflight_progress(wf.id.clone(), "scanning warnings".into())
            .await
            .unwrap();

        let mut rx = engine.events().subscribe();
        let setup = engine
            .complete_preflight_setup(wf.id.clone(), vec!["cargo test".into()])
            .await
            .unwrap();
        assert_eq!(setup.status, PreflightStatus::Completed);
        match rx.recv().await.unwrap() {
            EngineEvent::PreflightCompleted { workflow_id } => assert_eq!(workflow_id, wf.id),
            other => panic!("Unexpected event {other:?}"),
        }

        // A second workflow whose preflight fails publishes the failure.
        let wf2 = engine
            .create_workflow("t2".into(), "".into(), Priority::Medium, None)
            .await
            .unwrap();
        engine.create_preflight_setup(wf2.id.clone()).await.unwrap();
        let mut rx = engine.events().subscribe();
        engine
            .fail_preflight_setup(wf2.id.clone(), "worktree creation failed".into())
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            EngineEvent::PreflightFailed { workflow_id, error } => {
                assert_eq!(workflow_id, wf2.id);
                assert_eq!(error, "worktree creation failed");
            }
            other => panic!("Unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_complete_turn_records_cost_atomically() {
        let engine = Engine::in_memory().unwrap();
        let wf = engine
            .create_workflow("t".into(), "".into(), Priority::Medium, None)
            .await
            .unwrap();
        let ctx = Context::workflow(&wf.id);
        let session = engine
            .create_session(ctx.clone(), AgentRole::Executor, None, None)
            .await
            .unwrap();
        let turn = engine
            .create_turn(session.id.clone(), 0, TurnRole::Assistant)
            .await
            .unwrap();

        let usage = TurnUsage {
            token_count: 300,
            prompt_tokens: 200,
            completion_tokens: 100,
            model_id: "m1".into(),
        };
        let cost = NewCostRecord {
            context: ctx.clone(),
            turn_id: turn.id.clone(),
            session_id: session.id.clone(),
            model_id: "m1".into(),
            agent_role: AgentRole::Executor,
            prompt_tokens: 200,
            completion_tokens: 100,
            total_tokens: 300,
            cost_usd: 0.01,
        };
        engine
            .complete_turn(turn.id, usage, Some(cost))
            .await
            .unwrap();

        let total = engine.total_workflow_cost(wf.id).await.unwrap();
        assert!((total - 0.01).abs() < 1e-9);
    }
}
