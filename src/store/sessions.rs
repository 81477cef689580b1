//! Session/Subtask Coordinator.
//!
//! Sessions are scoped to a polymorphic context (workflow stage, channel,
//! or subtask) and form a one-level coordinator → subagent tree. The agent
//! runtime streams turns, messages, tool calls, thoughts, and questions
//! through this surface; child rows are upserted by (turn, index) so
//! out-of-order or repeated writes from a streaming producer never violate
//! uniqueness. Deleting a session cascades across nine dependent tables in
//! one transaction.

use std::str::FromStr;

use anyhow::Context as _;
use rusqlite::{Connection, params};
use tracing::{debug, info};

use super::{EngineDb, parse_json_field, to_json_field};
use crate::context::Context;
use crate::errors::{EngineError, EngineResult};
use crate::ids;
use crate::models::{
    AgentRole, Question, QuestionStatus, Session, SessionNote, SessionStatus, SessionTodo,
    Subtask, SubtaskStatus, ToolStatus, Turn, TurnHistory, TurnMessage, TurnRole, TurnStatus,
    TurnThought, TurnTool, TurnUsage,
};

const SESSION_COLUMNS: &str =
    "id, context_type, context_id, agent_role, status, parent_session_id, pulse_id, created_at";

const TURN_COLUMNS: &str = "id, session_id, turn_index, role, status, token_count, \
     prompt_tokens, completion_tokens, model_id, created_at";

/// Delete a session and every dependent row. Runs against the caller's
/// transaction so multi-session deletes stay atomic. Children first, then
/// turns, then the session row itself.
pub(crate) fn delete_session_tree(conn: &Connection, session_id: &str) -> EngineResult<()> {
    for table in ["turn_messages", "turn_tools", "turn_thoughts", "questions"] {
        let sql = format!(
            "DELETE FROM {table} WHERE turn_id IN (SELECT id FROM turns WHERE session_id = ?1)"
        );
        conn.execute(&sql, params![session_id])
            .with_context(|| format!("Failed to delete {table} for session"))?;
    }
    conn.execute("DELETE FROM turns WHERE session_id = ?1", params![session_id])
        .context("Failed to delete turns for session")?;
    conn.execute(
        "DELETE FROM session_notes WHERE session_id = ?1",
        params![session_id],
    )
    .context("Failed to delete session notes")?;
    conn.execute(
        "DELETE FROM session_todos WHERE session_id = ?1",
        params![session_id],
    )
    .context("Failed to delete session todos")?;
    conn.execute(
        "DELETE FROM subtasks WHERE parent_session_id = ?1",
        params![session_id],
    )
    .context("Failed to delete subtasks for session")?;
    conn.execute("DELETE FROM sessions WHERE id = ?1", params![session_id])
        .context("Failed to delete session")?;
    Ok(())
}

impl EngineDb {
    // ── Sessions ──────────────────────────────────────────────────────

    pub fn create_session(
        &self,
        context: &Context,
        agent_role: &AgentRole,
        parent_session_id: Option<&str>,
        pulse_id: Option<&str>,
    ) -> EngineResult<Session> {
        let id = ids::new_id(ids::SESSION);
        self.conn
            .execute(
                "INSERT INTO sessions (id, context_type, context_id, agent_role, parent_session_id, pulse_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id,
                    context.context_type(),
                    context.context_id(),
                    agent_role.as_str(),
                    parent_session_id,
                    pulse_id
                ],
            )
            .context("Failed to insert session")?;
        info!(session_id = %id, context = %context, role = %agent_role, "created session");
        self.require_session(&id)
    }

    pub fn complete_session(&self, id: &str) -> EngineResult<Session> {
        let changed = self
            .conn
            .execute(
                "UPDATE sessions SET status = 'completed' WHERE id = ?1",
                params![id],
            )
            .context("Failed to complete session")?;
        if changed == 0 {
            return Err(EngineError::SessionNotFound { id: id.to_string() });
        }
        self.require_session(id)
    }

    pub fn get_session(&self, id: &str) -> EngineResult<Option<Session>> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1");
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare get_session")?;
        let mut rows = stmt
            .query_map(params![id], SessionRow::from_row)
            .context("Failed to query session")?;
        match rows.next() {
            Some(row) => {
                let r = row.context("Failed to read session row")?;
                Ok(Some(r.into_session()?))
            }
            None => Ok(None),
        }
    }

    /// The single active session for a context. Contexts are expected to be
    /// exclusive; if several are active the newest is returned.
    pub fn get_active_by_context(&self, context: &Context) -> EngineResult<Option<Session>> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions
             WHERE context_type = ?1 AND context_id = ?2 AND status = 'active'
             ORDER BY rowid DESC LIMIT 1"
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare get_active_by_context")?;
        let mut rows = stmt
            .query_map(
                params![context.context_type(), context.context_id()],
                SessionRow::from_row,
            )
            .context("Failed to query active session")?;
        match rows.next() {
            Some(row) => {
                let r = row.context("Failed to read session row")?;
                Ok(Some(r.into_session()?))
            }
            None => Ok(None),
        }
    }

    pub fn get_sessions_by_context(&self, context: &Context) -> EngineResult<Vec<Session>> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions
             WHERE context_type = ?1 AND context_id = ?2 ORDER BY rowid"
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare get_sessions_by_context")?;
        let rows = stmt
            .query_map(
                params![context.context_type(), context.context_id()],
                SessionRow::from_row,
            )
            .context("Failed to query sessions")?;
        let mut sessions = Vec::new();
        for row in rows {
            let r = row.context("Failed to read session row")?;
            sessions.push(r.into_session()?);
        }
        Ok(sessions)
    }

    /// Delete a session and all dependent rows in one transaction. Partial
    /// cascade on crash is a correctness bug, so every statement shares the
    /// transaction.
    pub fn delete_session(&self, id: &str) -> EngineResult<bool> {
        let exists = self.get_session(id)?.is_some();
        if !exists {
            return Ok(false);
        }
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        delete_session_tree(&tx, id)?;
        tx.commit().context("Failed to commit session delete")?;
        info!(session_id = %id, "deleted session");
        Ok(true)
    }

    /// Bulk-remove sessions matching a context and any of the given roles;
    /// returns the count removed. Used when restarting a stage to discard
    /// its prior sessions without touching sibling stages.
    pub fn delete_by_context_and_roles(
        &self,
        context: &Context,
        roles: &[AgentRole],
    ) -> EngineResult<usize> {
        if roles.is_empty() {
            return Ok(0);
        }
        let placeholders = (0..roles.len())
            .map(|i| format!("?{}", i + 3))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT id FROM sessions
             WHERE context_type = ?1 AND context_id = ?2 AND agent_role IN ({placeholders})"
        );
        let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = vec![
            Box::new(context.context_type().to_string()),
            Box::new(context.context_id().to_string()),
        ];
        for role in roles {
            values.push(Box::new(role.as_str().to_string()));
        }

        let session_ids = {
            let mut stmt = self
                .conn
                .prepare(&sql)
                .context("Failed to prepare delete_by_context_and_roles")?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(values.iter()), |row| {
                    row.get::<_, String>(0)
                })
                .context("Failed to query sessions for role delete")?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row.context("Failed to read session id")?);
            }
            ids
        };

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        for session_id in &session_ids {
            delete_session_tree(&tx, session_id)?;
        }
        tx.commit().context("Failed to commit role-scoped delete")?;
        Ok(session_ids.len())
    }

    fn require_session(&self, id: &str) -> EngineResult<Session> {
        self.get_session(id)?
            .ok_or_else(|| EngineError::SessionNotFound { id: id.to_string() })
    }

    // ── Turns ─────────────────────────────────────────────────────────

    pub fn create_turn(
        &self,
        session_id: &str,
        turn_index: i64,
        role: &TurnRole,
    ) -> EngineResult<Turn> {
        self.require_session(session_id)?;
        let id = ids::new_id(ids::TURN);
        self.conn
            .execute(
                "INSERT INTO turns (id, session_id, turn_index, role)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, session_id, turn_index, role.as_str()],
            )
            .context("Failed to insert turn")?;
        self.require_turn(&id)
    }

    /// streaming → completed, attaching token metadata. Completing a turn
    /// that does not exist is a caller-visible error.
    pub fn complete_turn(&self, id: &str, usage: &TurnUsage) -> EngineResult<Turn> {
        let changed = self
            .conn
            .execute(
                "UPDATE turns
                 SET status = 'completed', token_count = ?1, prompt_tokens = ?2,
                     completion_tokens = ?3, model_id = ?4
                 WHERE id = ?5",
                params![
                    usage.token_count,
                    usage.prompt_tokens,
                    usage.completion_tokens,
                    usage.model_id,
                    id
                ],
            )
            .context("Failed to complete turn")?;
        if changed == 0 {
            return Err(EngineError::TurnNotFound { id: id.to_string() });
        }
        self.require_turn(id)
    }

    pub fn error_turn(&self, id: &str) -> EngineResult<Turn> {
        let changed = self
            .conn
            .execute(
                "UPDATE turns SET status = 'error' WHERE id = ?1",
                params![id],
            )
            .context("Failed to mark turn errored")?;
        if changed == 0 {
            return Err(EngineError::TurnNotFound { id: id.to_string() });
        }
        self.require_turn(id)
    }

    pub fn get_turn(&self, id: &str) -> EngineResult<Option<Turn>> {
        let sql = format!("SELECT {TURN_COLUMNS} FROM turns WHERE id = ?1");
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare get_turn")?;
        let mut rows = stmt
            .query_map(params![id], TurnRow::from_row)
            .context("Failed to query turn")?;
        match rows.next() {
            Some(row) => {
                let r = row.context("Failed to read turn row")?;
                Ok(Some(r.into_turn()?))
            }
            None => Ok(None),
        }
    }

    /// Turns in ascending index order.
    pub fn get_turns(&self, session_id: &str) -> EngineResult<Vec<Turn>> {
        let sql = format!(
            "SELECT {TURN_COLUMNS} FROM turns WHERE session_id = ?1 ORDER BY turn_index"
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare get_turns")?;
        let rows = stmt
            .query_map(params![session_id], TurnRow::from_row)
            .context("Failed to query turns")?;
        let mut turns = Vec::new();
        for row in rows {
            let r = row.context("Failed to read turn row")?;
            turns.push(r.into_turn()?);
        }
        Ok(turns)
    }

    /// Full session history: every turn with its child collections
    /// materialized, each in ascending index order.
    pub fn get_turn_history(&self, session_id: &str) -> EngineResult<Vec<TurnHistory>> {
        let turns = self.get_turns(session_id)?;
        let mut history = Vec::with_capacity(turns.len());
        for turn in turns {
            let messages = self.get_turn_messages(&turn.id)?;
            let tools = self.get_turn_tools(&turn.id)?;
            let thoughts = self.get_turn_thoughts(&turn.id)?;
            let questions = self.get_questions(&turn.id)?;
            history.push(TurnHistory { turn, messages, tools, thoughts, questions });
        }
        Ok(history)
    }

    fn require_turn(&self, id: &str) -> EngineResult<Turn> {
        self.get_turn(id)?
            .ok_or_else(|| EngineError::TurnNotFound { id: id.to_string() })
    }

    // ── Turn children (streamed; upsert-by-index) ─────────────────────

    /// Insert or replace the message at (turn, index). Streaming producers
    /// may write the same index repeatedly or out of order.
    pub fn upsert_message(
        &self,
        turn_id: &str,
        message_index: i64,
        content: &str,
    ) -> EngineResult<TurnMessage> {
        self.require_turn(turn_id)?;
        let id = ids::new_id(ids::MESSAGE);
        self.conn
            .execute(
                "INSERT INTO turn_messages (id, turn_id, message_index, content)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(turn_id, message_index)
                 DO UPDATE SET content = excluded.content",
                params![id, turn_id, message_index, content],
            )
            .context("Failed to upsert turn message")?;
        self.conn
            .query_row(
                "SELECT id, turn_id, message_index, content, created_at
                 FROM turn_messages WHERE turn_id = ?1 AND message_index = ?2",
                params![turn_id, message_index],
                |row| {
                    Ok(TurnMessage {
                        id: row.get(0)?,
                        turn_id: row.get(1)?,
                        message_index: row.get(2)?,
                        content: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                },
            )
            .context("Turn message not found after upsert")
            .map_err(EngineError::from)
    }

    pub fn upsert_thought(
        &self,
        turn_id: &str,
        thought_index: i64,
        content: &str,
    ) -> EngineResult<TurnThought> {
        self.require_turn(turn_id)?;
        let id = ids::new_id(ids::THOUGHT);
        self.conn
            .execute(
                "INSERT INTO turn_thoughts (id, turn_id, thought_index, content)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(turn_id, thought_index)
                 DO UPDATE SET content = excluded.content",
                params![id, turn_id, thought_index, content],
            )
            .context("Failed to upsert turn thought")?;
        self.conn
            .query_row(
                "SELECT id, turn_id, thought_index, content, created_at
                 FROM turn_thoughts WHERE turn_id = ?1 AND thought_index = ?2",
                params![turn_id, thought_index],
                |row| {
                    Ok(TurnThought {
                        id: row.get(0)?,
                        turn_id: row.get(1)?,
                        thought_index: row.get(2)?,
                        content: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                },
            )
            .context("Turn thought not found after upsert")
            .map_err(EngineError::from)
    }

    /// Record a tool invocation beginning (status=running). Repeated starts
    /// at the same index replace the name/input.
    pub fn record_tool_start(
        &self,
        turn_id: &str,
        tool_index: i64,
        tool_name: &str,
        input: Option<&serde_json::Value>,
    ) -> EngineResult<TurnTool> {
        self.require_turn(turn_id)?;
        let id = ids::new_id(ids::TOOL);
        let input_json = input.map(|v| to_json_field("input", v)).transpose()?;
        self.conn
            .execute(
                "INSERT INTO turn_tools (id, turn_id, tool_index, tool_name, input)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(turn_id, tool_index)
                 DO UPDATE SET tool_name = excluded.tool_name, input = excluded.input,
                               status = 'running', output = NULL",
                params![id, turn_id, tool_index, tool_name, input_json],
            )
            .context("Failed to record tool start")?;
        self.get_tool_at(turn_id, tool_index)
    }

    /// Close out a tool invocation; `success` selects completed vs error.
    pub fn record_tool_complete(
        &self,
        id: &str,
        output: &str,
        success: bool,
    ) -> EngineResult<TurnTool> {
        let status = if success { ToolStatus::Completed } else { ToolStatus::Error };
        let changed = self
            .conn
            .execute(
                "UPDATE turn_tools SET output = ?1, status = ?2 WHERE id = ?3",
                params![output, status.as_str(), id],
            )
            .context("Failed to record tool completion")?;
        if changed == 0 {
            return Err(EngineError::Other(anyhow::anyhow!(
                "Turn tool {id} not found"
            )));
        }
        let sql = "SELECT id, turn_id, tool_index, tool_name, input, output, status, created_at
             FROM turn_tools WHERE id = ?1";
        let mut stmt = self
            .conn
            .prepare(sql)
            .context("Failed to prepare tool read-back")?;
        let mut rows = stmt
            .query_map(params![id], TurnToolRow::from_row)
            .context("Failed to query tool")?;
        match rows.next() {
            Some(row) => row.context("Failed to read tool row")?.into_tool(),
            None => Err(EngineError::Other(anyhow::anyhow!(
                "Turn tool {id} not found after update"
            ))),
        }
    }

    /// Names of tools that completed successfully in a session, deduplicated,
    /// in first-use order. Errored and still-running tools are excluded.
    pub fn get_succeeded_tool_names(&self, session_id: &str) -> EngineResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT tt.tool_name FROM turn_tools tt
                 JOIN turns t ON t.id = tt.turn_id
                 WHERE t.session_id = ?1 AND tt.status = 'completed'
                 ORDER BY tt.rowid",
            )
            .context("Failed to prepare get_succeeded_tool_names")?;
        let rows = stmt
            .query_map(params![session_id], |row| row.get::<_, String>(0))
            .context("Failed to query tool names")?;
        let mut names: Vec<String> = Vec::new();
        for row in rows {
            let name = row.context("Failed to read tool name")?;
            if !names.contains(&name) {
                names.push(name);
            }
        }
        Ok(names)
    }

    pub fn get_turn_messages(&self, turn_id: &str) -> EngineResult<Vec<TurnMessage>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, turn_id, message_index, content, created_at
                 FROM turn_messages WHERE turn_id = ?1 ORDER BY message_index",
            )
            .context("Failed to prepare get_turn_messages")?;
        let rows = stmt
            .query_map(params![turn_id], |row| {
                Ok(TurnMessage {
                    id: row.get(0)?,
                    turn_id: row.get(1)?,
                    message_index: row.get(2)?,
                    content: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })
            .context("Failed to query turn messages")?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row.context("Failed to read message row")?);
        }
        Ok(messages)
    }

    pub fn get_turn_tools(&self, turn_id: &str) -> EngineResult<Vec<TurnTool>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, turn_id, tool_index, tool_name, input, output, status, created_at
                 FROM turn_tools WHERE turn_id = ?1 ORDER BY tool_index",
            )
            .context("Failed to prepare get_turn_tools")?;
        let rows = stmt
            .query_map(params![turn_id], TurnToolRow::from_row)
            .context("Failed to query turn tools")?;
        let mut tools = Vec::new();
        for row in rows {
            let r = row.context("Failed to read tool row")?;
            tools.push(r.into_tool()?);
        }
        Ok(tools)
    }

    pub fn get_turn_thoughts(&self, turn_id: &str) -> EngineResult<Vec<TurnThought>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, turn_id, thought_index, content, created_at
                 FROM turn_thoughts WHERE turn_id = ?1 ORDER BY thought_index",
            )
            .context("Failed to prepare get_turn_thoughts")?;
        let rows = stmt
            .query_map(params![turn_id], |row| {
                Ok(TurnThought {
                    id: row.get(0)?,
                    turn_id: row.get(1)?,
                    thought_index: row.get(2)?,
                    content: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })
            .context("Failed to query turn thoughts")?;
        let mut thoughts = Vec::new();
        for row in rows {
            thoughts.push(row.context("Failed to read thought row")?);
        }
        Ok(thoughts)
    }

    fn get_tool_at(&self, turn_id: &str, tool_index: i64) -> EngineResult<TurnTool> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, turn_id, tool_index, tool_name, input, output, status, created_at
                 FROM turn_tools WHERE turn_id = ?1 AND tool_index = ?2",
            )
            .context("Failed to prepare tool read-back")?;
        let mut rows = stmt
            .query_map(params![turn_id, tool_index], TurnToolRow::from_row)
            .context("Failed to query tool")?;
        match rows.next() {
            Some(row) => row.context("Failed to read tool row")?.into_tool(),
            None => Err(EngineError::Other(anyhow::anyhow!(
                "Turn tool not found after upsert"
            ))),
        }
    }

    // ── Questions ─────────────────────────────────────────────────────

    pub fn create_question(
        &self,
        turn_id: &str,
        question_index: i64,
        text: &str,
    ) -> EngineResult<Question> {
        self.require_turn(turn_id)?;
        let id = ids::new_id(ids::QUESTION);
        self.conn
            .execute(
                "INSERT INTO questions (id, turn_id, question_index, text)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, turn_id, question_index, text],
            )
            .context("Failed to insert question")?;
        self.require_question(&id)
    }

    pub fn answer_question(&self, id: &str, answer: &str) -> EngineResult<Question> {
        let changed = self
            .conn
            .execute(
                "UPDATE questions SET status = 'answered', answer = ?1 WHERE id = ?2",
                params![answer, id],
            )
            .context("Failed to answer question")?;
        if changed == 0 {
            return Err(EngineError::Other(anyhow::anyhow!(
                "Question {id} not found"
            )));
        }
        self.require_question(id)
    }

    /// Bulk-skip every pending question for a turn; returns the count.
    /// Used when a turn ends without the user answering inline questions.
    pub fn skip_pending_questions(&self, turn_id: &str) -> EngineResult<usize> {
        let changed = self
            .conn
            .execute(
                "UPDATE questions SET status = 'skipped'
                 WHERE turn_id = ?1 AND status = 'pending'",
                params![turn_id],
            )
            .context("Failed to skip pending questions")?;
        debug!(turn_id, skipped = changed, "skipped pending questions");
        Ok(changed)
    }

    pub fn get_questions(&self, turn_id: &str) -> EngineResult<Vec<Question>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, turn_id, question_index, text, status, answer, created_at
                 FROM questions WHERE turn_id = ?1 ORDER BY question_index",
            )
            .context("Failed to prepare get_questions")?;
        let rows = stmt
            .query_map(params![turn_id], QuestionRow::from_row)
            .context("Failed to query questions")?;
        let mut questions = Vec::new();
        for row in rows {
            let r = row.context("Failed to read question row")?;
            questions.push(r.into_question()?);
        }
        Ok(questions)
    }

    fn require_question(&self, id: &str) -> EngineResult<Question> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, turn_id, question_index, text, status, answer, created_at
                 FROM questions WHERE id = ?1",
            )
            .context("Failed to prepare question read-back")?;
        let mut rows = stmt
            .query_map(params![id], QuestionRow::from_row)
            .context("Failed to query question")?;
        match rows.next() {
            Some(row) => row.context("Failed to read question row")?.into_question(),
            None => Err(EngineError::Other(anyhow::anyhow!(
                "Question {id} not found"
            ))),
        }
    }

    // ── Notes & todos ─────────────────────────────────────────────────

    pub fn add_session_note(&self, session_id: &str, content: &str) -> EngineResult<SessionNote> {
        self.require_session(session_id)?;
        let id = ids::new_id(ids::NOTE);
        self.conn
            .execute(
                "INSERT INTO session_notes (id, session_id, content) VALUES (?1, ?2, ?3)",
                params![id, session_id, content],
            )
            .context("Failed to insert session note")?;
        self.conn
            .query_row(
                "SELECT id, session_id, content, created_at FROM session_notes WHERE id = ?1",
                params![id],
                |row| {
                    Ok(SessionNote {
                        id: row.get(0)?,
                        session_id: row.get(1)?,
                        content: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .context("Session note not found after insert")
            .map_err(EngineError::from)
    }

    pub fn get_session_notes(&self, session_id: &str) -> EngineResult<Vec<SessionNote>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, session_id, content, created_at
                 FROM session_notes WHERE session_id = ?1 ORDER BY rowid",
            )
            .context("Failed to prepare get_session_notes")?;
        let rows = stmt
            .query_map(params![session_id], |row| {
                Ok(SessionNote {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    content: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })
            .context("Failed to query session notes")?;
        let mut notes = Vec::new();
        for row in rows {
            notes.push(row.context("Failed to read note row")?);
        }
        Ok(notes)
    }

    /// Replace the session's todo list wholesale, preserving order.
    pub fn set_session_todos(
        &self,
        session_id: &str,
        todos: &[(String, bool)],
    ) -> EngineResult<Vec<SessionTodo>> {
        self.require_session(session_id)?;
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "DELETE FROM session_todos WHERE session_id = ?1",
            params![session_id],
        )
        .context("Failed to clear session todos")?;
        for (index, (content, done)) in todos.iter().enumerate() {
            let id = ids::new_id(ids::TODO);
            tx.execute(
                "INSERT INTO session_todos (id, session_id, todo_index, content, done)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, session_id, index as i64, content, done],
            )
            .context("Failed to insert session todo")?;
        }
        tx.commit().context("Failed to commit todo replacement")?;
        self.get_session_todos(session_id)
    }

    pub fn get_session_todos(&self, session_id: &str) -> EngineResult<Vec<SessionTodo>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, session_id, todo_index, content, done
                 FROM session_todos WHERE session_id = ?1 ORDER BY todo_index",
            )
            .context("Failed to prepare get_session_todos")?;
        let rows = stmt
            .query_map(params![session_id], |row| {
                Ok(SessionTodo {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    todo_index: row.get(2)?,
                    content: row.get(3)?,
                    done: row.get(4)?,
                })
            })
            .context("Failed to query session todos")?;
        let mut todos = Vec::new();
        for row in rows {
            todos.push(row.context("Failed to read todo row")?);
        }
        Ok(todos)
    }

    // ── Subtasks ──────────────────────────────────────────────────────

    pub fn create_subtask(
        &self,
        parent_session_id: &str,
        workflow_id: &str,
        task_definition: &str,
    ) -> EngineResult<Subtask> {
        self.require_session(parent_session_id)?;
        let id = ids::new_id(ids::SUBTASK);
        self.conn
            .execute(
                "INSERT INTO subtasks (id, parent_session_id, workflow_id, task_definition)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, parent_session_id, workflow_id, task_definition],
            )
            .context("Failed to insert subtask")?;
        self.require_subtask(&id)
    }

    pub fn start_subtask(&self, id: &str) -> EngineResult<Subtask> {
        self.transition_subtask(id, SubtaskStatus::Running, None)
    }

    pub fn complete_subtask(&self, id: &str, findings: &str) -> EngineResult<Subtask> {
        self.transition_subtask(id, SubtaskStatus::Completed, Some(findings))
    }

    pub fn fail_subtask(&self, id: &str) -> EngineResult<Subtask> {
        self.transition_subtask(id, SubtaskStatus::Failed, None)
    }

    fn transition_subtask(
        &self,
        id: &str,
        status: SubtaskStatus,
        findings: Option<&str>,
    ) -> EngineResult<Subtask> {
        let changed = match findings {
            Some(f) => self
                .conn
                .execute(
                    "UPDATE subtasks
                     SET status = ?1, findings = ?2, updated_at = datetime('now')
                     WHERE id = ?3",
                    params![status.as_str(), f, id],
                )
                .context("Failed to update subtask")?,
            None => self
                .conn
                .execute(
                    "UPDATE subtasks SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
                    params![status.as_str(), id],
                )
                .context("Failed to update subtask")?,
        };
        if changed == 0 {
            return Err(EngineError::SubtaskNotFound { id: id.to_string() });
        }
        self.require_subtask(id)
    }

    pub fn get_subtask(&self, id: &str) -> EngineResult<Option<Subtask>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, parent_session_id, workflow_id, task_definition, findings, status,
                        created_at, updated_at
                 FROM subtasks WHERE id = ?1",
            )
            .context("Failed to prepare get_subtask")?;
        let mut rows = stmt
            .query_map(params![id], SubtaskRow::from_row)
            .context("Failed to query subtask")?;
        match rows.next() {
            Some(row) => {
                let r = row.context("Failed to read subtask row")?;
                Ok(Some(r.into_subtask()?))
            }
            None => Ok(None),
        }
    }

    pub fn get_subtasks_for_session(&self, parent_session_id: &str) -> EngineResult<Vec<Subtask>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, parent_session_id, workflow_id, task_definition, findings, status,
                        created_at, updated_at
                 FROM subtasks WHERE parent_session_id = ?1 ORDER BY rowid",
            )
            .context("Failed to prepare get_subtasks_for_session")?;
        let rows = stmt
            .query_map(params![parent_session_id], SubtaskRow::from_row)
            .context("Failed to query subtasks")?;
        let mut subtasks = Vec::new();
        for row in rows {
            let r = row.context("Failed to read subtask row")?;
            subtasks.push(r.into_subtask()?);
        }
        Ok(subtasks)
    }

    /// Every subtask id ever issued under a workflow; feeds the cost
    /// ledger's total-spend query.
    pub fn get_subtask_ids_for_workflow(&self, workflow_id: &str) -> EngineResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM subtasks WHERE workflow_id = ?1 ORDER BY rowid")
            .context("Failed to prepare get_subtask_ids_for_workflow")?;
        let rows = stmt
            .query_map(params![workflow_id], |row| row.get::<_, String>(0))
            .context("Failed to query subtask ids")?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.context("Failed to read subtask id")?);
        }
        Ok(ids)
    }

    fn require_subtask(&self, id: &str) -> EngineResult<Subtask> {
        self.get_subtask(id)?
            .ok_or_else(|| EngineError::SubtaskNotFound { id: id.to_string() })
    }
}

struct SessionRow {
    id: String,
    context_type: String,
    context_id: String,
    agent_role: String,
    status: String,
    parent_session_id: Option<String>,
    pulse_id: Option<String>,
    created_at: String,
}

impl SessionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            context_type: row.get(1)?,
            context_id: row.get(2)?,
            agent_role: row.get(3)?,
            status: row.get(4)?,
            parent_session_id: row.get(5)?,
            pulse_id: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn into_session(self) -> EngineResult<Session> {
        let context = Context::from_columns(&self.context_type, &self.context_id)
            .map_err(|message| EngineError::InvalidField { field: "context_type", message })?;
        let agent_role = AgentRole::from_str(&self.agent_role)
            .map_err(|message| EngineError::InvalidField { field: "agent_role", message })?;
        let status = SessionStatus::from_str(&self.status)
            .map_err(|message| EngineError::InvalidField { field: "status", message })?;
        Ok(Session {
            id: self.id,
            context,
            agent_role,
            status,
            parent_session_id: self.parent_session_id,
            pulse_id: self.pulse_id,
            created_at: self.created_at,
        })
    }
}

struct TurnRow {
    id: String,
    session_id: String,
    turn_index: i64,
    role: String,
    status: String,
    token_count: Option<i64>,
    prompt_tokens: Option<i64>,
    completion_tokens: Option<i64>,
    model_id: Option<String>,
    created_at: String,
}

impl TurnRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            session_id: row.get(1)?,
            turn_index: row.get(2)?,
            role: row.get(3)?,
            status: row.get(4)?,
            token_count: row.get(5)?,
            prompt_tokens: row.get(6)?,
            completion_tokens: row.get(7)?,
            model_id: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    fn into_turn(self) -> EngineResult<Turn> {
        let role = TurnRole::from_str(&self.role)
            .map_err(|message| EngineError::InvalidField { field: "role", message })?;
        let status = TurnStatus::from_str(&self.status)
            .map_err(|message| EngineError::InvalidField { field: "status", message })?;
        Ok(Turn {
            id: self.id,
            session_id: self.session_id,
            turn_index: self.turn_index,
            role,
            status,
            token_count: self.token_count,
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            model_id: self.model_id,
            created_at: self.created_at,
        })
    }
}

struct TurnToolRow {
    id: String,
    turn_id: String,
    tool_index: i64,
    tool_name: String,
    input: Option<String>,
    output: Option<String>,
    status: String,
    created_at: String,
}

impl TurnToolRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            turn_id: row.get(1)?,
            tool_index: row.get(2)?,
            tool_name: row.get(3)?,
            input: row.get(4)?,
            output: row.get(5)?,
            status: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn into_tool(self) -> EngineResult<TurnTool> {
        let status = ToolStatus::from_str(&self.status)
            .map_err(|message| EngineError::InvalidField { field: "status", message })?;
        let input = self
            .input
            .as_deref()
            .map(|raw| parse_json_field("input", raw))
            .transpose()?;
        Ok(TurnTool {
            id: self.id,
            turn_id: self.turn_id,
            tool_index: self.tool_index,
            tool_name: self.tool_name,
            input,
            output: self.output,
            status,
            created_at: self.created_at,
        })
    }
}

struct QuestionRow {
    id: String,
    turn_id: String,
    question_index: i64,
    text: String,
    status: String,
    answer: Option<String>,
    created_at: String,
}

impl QuestionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            turn_id: row.get(1)?,
            question_index: row.get(2)?,
            text: row.get(3)?,
            status: row.get(4)?,
            answer: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn into_question(self) -> EngineResult<Question> {
        let status = QuestionStatus::from_str(&self.status)
            .map_err(|message| EngineError::InvalidField { field: "status", message })?;
        Ok(Question {
            id: self.id,
            turn_id: self.turn_id,
            question_index: self.question_index,
            text: self.text,
            status,
            answer: self.answer,
            created_at: self.created_at,
        })
    }
}

struct SubtaskRow {
    id: String,
    parent_session_id: String,
    workflow_id: String,
    task_definition: String,
    findings: Option<String>,
    status: String,
    created_at: String,
    updated_at: String,
}

impl SubtaskRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            parent_session_id: row.get(1)?,
            workflow_id: row.get(2)?,
            task_definition: row.get(3)?,
            findings: row.get(4)?,
            status: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn into_subtask(self) -> EngineResult<Subtask> {
        let status = SubtaskStatus::from_str(&self.status)
            .map_err(|message| EngineError::InvalidField { field: "status", message })?;
        Ok(Subtask {
            id: self.id,
            parent_session_id: self.parent_session_id,
            workflow_id: self.workflow_id,
            task_definition: self.task_definition,
            findings: self.findings,
            status,
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
    fn test_create_session_and_active_lookup() {
        let (db, wf) = db_with_workflow();
        let ctx = Context::workflow(&wf);
        let session = db
            .create_session(&ctx, &AgentRole::Scoper, None, None)
            .unwrap();
        assert!(session.id.starts_with("session_"));
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.context, ctx);

        let active = db.get_active_by_context(&ctx).unwrap().unwrap();
        assert_eq!(active.id, session.id);

        db.complete_session(&session.id).unwrap();
        assert!(db.get_active_by_context(&ctx).unwrap().is_none());
    }

    #[test]
    fn test_context_isolation() {
        let (db, wf) = db_with_workflow();
        let wf_ctx = Context::workflow(&wf);
        let chan_ctx = Context::channel("chan_1");
        db.create_session(&wf_ctx, &AgentRole::Scoper, None, None).unwrap();
        db.create_session(&chan_ctx, &AgentRole::Coordinator, None, None).unwrap();

        // Queries always filter by both type and id.
        assert_eq!(db.get_sessions_by_context(&wf_ctx).unwrap().len(), 1);
        assert_eq!(db.get_sessions_by_context(&chan_ctx).unwrap().len(), 1);
        let cross = Context::channel(&wf);
        assert!(db.get_sessions_by_context(&cross).unwrap().is_empty());
    }

    #[test]
    fn test_turn_lifecycle() {
        let (db, wf) = db_with_workflow();
        let session = db
            .create_session(&Context::workflow(&wf), &AgentRole::Planner, None, None)
            .unwrap();
        let turn = db.create_turn(&session.id, 0, &TurnRole::Assistant).unwrap();
        assert_eq!(turn.status, TurnStatus::Streaming);
        assert!(turn.model_id.is_none());

        let usage = TurnUsage {
            token_count: 1500,
            prompt_tokens: 1000,
            completion_tokens: 500,
            model_id: "model-x".into(),
        };
        let done = db.complete_turn(&turn.id, &usage).unwrap();
        assert_eq!(done.status, TurnStatus::Completed);
        assert_eq!(done.token_count, Some(1500));
        assert_eq!(done.model_id.as_deref(), Some("model-x"));
    }

    #[test]
    fn test_complete_missing_turn_errors() {
        let (db, _wf) = db_with_workflow();
        let usage = TurnUsage {
            token_count: 0,
            prompt_tokens: 0,
            completion_tokens: 0,
            model_id: "m".into(),
        };
        let err = db.complete_turn("turn_missing", &usage).unwrap_err();
        assert!(matches!(err, EngineError::TurnNotFound { .. }));
    }

    #[test]
    fn test_upsert_message_tolerates_replays() {
        let (db, wf) = db_with_workflow();
        let session = db
            .create_session(&Context::workflow(&wf), &AgentRole::Executor, None, None)
            .unwrap();
        let turn = db.create_turn(&session.id, 0, &TurnRole::Assistant).unwrap();

        // Out of order, then a replay of index 0.
        db.upsert_message(&turn.id, 1, "second").unwrap();
        db.upsert_message(&turn.id, 0, "first-draft").unwrap();
        db.upsert_message(&turn.id, 0, "first").unwrap();

        let messages = db.get_turn_messages(&turn.id).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "first");
        assert_eq!(messages[1].content, "second");
    }

    #[test]
    fn test_tool_tracking_and_succeeded_names() {
        let (db, wf) = db_with_workflow();
        let session = db
            .create_session(&Context::workflow(&wf), &AgentRole::Executor, None, None)
            .unwrap();
        let turn = db.create_turn(&session.id, 0, &TurnRole::Assistant).unwrap();

        let input = serde_json::json!({"path": "src/lib.rs"});
        let t0 = db.record_tool_start(&turn.id, 0, "read_file", Some(&input)).unwrap();
        assert_eq!(t0.status, ToolStatus::Running);
        assert_eq!(t0.input, Some(input));

        let t0 = db.record_tool_complete(&t0.id, "file contents", true).unwrap();
        assert_eq!(t0.status, ToolStatus::Completed);

        let t1 = db.record_tool_start(&turn.id, 1, "run_tests", None).unwrap();
        db.record_tool_complete(&t1.id, "boom", false).unwrap();
        let _t2 = db.record_tool_start(&turn.id, 2, "edit_file", None).unwrap();

        // Only completed tools count; running and errored are excluded.
        let names = db.get_succeeded_tool_names(&session.id).unwrap();
        assert_eq!(names, vec!["read_file".to_string()]);
    }

    #[test]
    fn test_question_skip_bulk() {
        let (db, wf) = db_with_workflow();
        let session = db
            .create_session(&Context::workflow(&wf), &AgentRole::Scoper, None, None)
            .unwrap();
        let turn = db.create_turn(&session.id, 0, &TurnRole::Assistant).unwrap();

        let q1 = db.create_question(&turn.id, 0, "Use JWT?").unwrap();
        db.create_question(&turn.id, 1, "Which database?").unwrap();
        db.create_question(&turn.id, 2, "Deploy target?").unwrap();
        db.answer_question(&q1.id, "yes").unwrap();

        let skipped = db.skip_pending_questions(&turn.id).unwrap();
        assert_eq!(skipped, 2);

        let questions = db.get_questions(&turn.id).unwrap();
        assert_eq!(questions[0].status, QuestionStatus::Answered);
        assert_eq!(questions[0].answer.as_deref(), Some("yes"));
        assert_eq!(questions[1].status, QuestionStatus::Skipped);
        assert_eq!(questions[2].status, QuestionStatus::Skipped);

        // Re-running skips nothing further.
        assert_eq!(db.skip_pending_questions(&turn.id).unwrap(), 0);
    }

    #[test]
    fn test_delete_session_cascades_every_table() {
        let (db, wf) = db_with_workflow();
        let session = db
            .create_session(&Context::workflow(&wf), &AgentRole::Coordinator, None, None)
            .unwrap();
        let turn = db.create_turn(&session.id, 0, &TurnRole::Assistant).unwrap();
        db.upsert_message(&turn.id, 0, "hello").unwrap();
        db.record_tool_start(&turn.id, 0, "read_file", None).unwrap();
        db.upsert_thought(&turn.id, 0, "thinking").unwrap();
        db.create_question(&turn.id, 0, "ok?").unwrap();
        db.add_session_note(&session.id, "a note").unwrap();
        db.set_session_todos(&session.id, &[("step one".into(), false)]).unwrap();
        db.create_subtask(&session.id, &wf, "investigate flaky test").unwrap();

        assert!(db.delete_session(&session.id).unwrap());

        assert!(db.get_session(&session.id).unwrap().is_none());
        assert!(db.get_turns(&session.id).unwrap().is_empty());
        assert!(db.get_turn_messages(&turn.id).unwrap().is_empty());
        assert!(db.get_turn_tools(&turn.id).unwrap().is_empty());
        assert!(db.get_turn_thoughts(&turn.id).unwrap().is_empty());
        assert!(db.get_questions(&turn.id).unwrap().is_empty());
        assert!(db.get_session_notes(&session.id).unwrap().is_empty());
        assert!(db.get_session_todos(&session.id).unwrap().is_empty());
        assert!(db.get_subtasks_for_session(&session.id).unwrap().is_empty());
    }

    #[test]
    fn test_delete_missing_session_returns_false() {
        let (db, _wf) = db_with_workflow();
        assert!(!db.delete_session("session_missing").unwrap());
    }

    #[test]
    fn test_delete_by_context_and_roles() {
        let (db, wf) = db_with_workflow();
        let ctx = Context::workflow(&wf);
        let scoper = db.create_session(&ctx, &AgentRole::Scoper, None, None).unwrap();
        let reviewer = db.create_session(&ctx, &AgentRole::Reviewer, None, None).unwrap();

        let removed = db
            .delete_by_context_and_roles(&ctx, &[AgentRole::Scoper])
            .unwrap();
        assert_eq!(removed, 1);
        assert!(db.get_session(&scoper.id).unwrap().is_none());
        assert!(db.get_session(&reviewer.id).unwrap().is_some());

        // Empty role list removes nothing.
        assert_eq!(db.delete_by_context_and_roles(&ctx, &[]).unwrap(), 0);
    }

    #[test]
    fn test_subtask_lifecycle() {
        let (db, wf) = db_with_workflow();
        let coordinator = db
            .create_session(&Context::workflow(&wf), &AgentRole::Coordinator, None, None)
            .unwrap();
        let subtask = db
            .create_subtask(&coordinator.id, &wf, "audit error handling")
            .unwrap();
        assert_eq!(subtask.status, SubtaskStatus::Pending);

        db.start_subtask(&subtask.id).unwrap();
        let done = db
            .complete_subtask(&subtask.id, "three unwraps in hot path")
            .unwrap();
        assert_eq!(done.status, SubtaskStatus::Completed);
        assert_eq!(done.findings.as_deref(), Some("three unwraps in hot path"));

        assert_eq!(db.get_subtask_ids_for_workflow(&wf).unwrap(), vec![subtask.id]);
    }

    #[test]
    fn test_turn_history_is_fully_materialized() {
        let (db, wf) = db_with_workflow();
        let session = db
            .create_session(&Context::workflow(&wf), &AgentRole::Executor, None, None)
            .unwrap();
        let t0 = db.create_turn(&session.id, 0, &TurnRole::User).unwrap();
        db.upsert_message(&t0.id, 0, "fix the bug").unwrap();
        let t1 = db.create_turn(&session.id, 1, &TurnRole::Assistant).unwrap();
        db.upsert_message(&t1.id, 0, "on it").unwrap();
        db.upsert_thought(&t1.id, 0, "check the parser first").unwrap();
        db.record_tool_start(&t1.id, 0, "read_file", None).unwrap();

        let history = db.get_turn_history(&session.id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].turn.turn_index, 0);
        assert_eq!(history[0].messages[0].content, "fix the bug");
        assert_eq!(history[1].thoughts.len(), 1);
        assert_eq!(history[1].tools.len(), 1);
        assert!(history[1].questions.is_empty());
    }

    #[test]
    fn test_session_todos_replace_all() {
        let (db, wf) = db_with_workflow();
        let session = db
            .create_session(&Context::workflow(&wf), &AgentRole::Executor, None, None)
            .unwrap();
        db.set_session_todos(
            &session.id,
            &[("a".into(), false), ("b".into(), false)],
        )
        .unwrap();
        let todos = db
            .set_session_todos(&session.id, &[("b".into(), true), ("c".into(), false)])
            .unwrap();
        assert_eq!(todos.len(), 2);
        assert_eq!(todos[0].content, "b");
        assert!(todos[0].done);
        assert_eq!(todos[1].todo_index, 1);
    }
}
