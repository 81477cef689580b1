//! Versioned migration ledger.
//!
//! Every schema change is a named migration; the `schema_migrations` table
//! records which ids have run. Unapplied migrations execute in declaration
//! order, each inside its own transaction together with its ledger row, so
//! a failure leaves neither a half-applied migration nor a stale ledger
//! entry. Re-opening an already-migrated database applies nothing.

use rusqlite::Connection;

use crate::errors::MigrationError;

/// All migrations, in application order. Ids are immutable once shipped.
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_core",
        "
        CREATE TABLE workflows (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'backlog',
            priority TEXT NOT NULL DEFAULT 'medium',
            current_session_id TEXT,
            awaiting_approval INTEGER NOT NULL DEFAULT 0,
            pending_artifact_type TEXT,
            base_branch TEXT,
            skipped_stages TEXT NOT NULL DEFAULT '[]',
            archived INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE pulses (
            id TEXT PRIMARY KEY,
            workflow_id TEXT NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
            planned_pulse_id TEXT,
            description TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'proposed',
            pulse_branch TEXT,
            worktree_path TEXT,
            checkpoint_commit_sha TEXT,
            has_unresolved_issues INTEGER NOT NULL DEFAULT 0,
            is_recovery_checkpoint INTEGER NOT NULL DEFAULT 0,
            rejection_count INTEGER NOT NULL DEFAULT 0,
            failure_reason TEXT,
            started_at TEXT,
            ended_at TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE preflight_setups (
            id TEXT PRIMARY KEY,
            workflow_id TEXT NOT NULL UNIQUE REFERENCES workflows(id) ON DELETE CASCADE,
            status TEXT NOT NULL DEFAULT 'running',
            progress_message TEXT,
            verification_commands TEXT NOT NULL DEFAULT '[]',
            error_message TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE preflight_baselines (
            id TEXT PRIMARY KEY,
            workflow_id TEXT NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
            issue_type TEXT NOT NULL,
            source TEXT NOT NULL,
            pattern TEXT NOT NULL,
            file_path TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE preflight_command_baselines (
            id TEXT PRIMARY KEY,
            workflow_id TEXT NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
            command TEXT NOT NULL,
            stdout TEXT NOT NULL DEFAULT '',
            stderr TEXT NOT NULL DEFAULT '',
            exit_code INTEGER NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE sessions (
            id TEXT PRIMARY KEY,
            context_type TEXT NOT NULL,
            context_id TEXT NOT NULL,
            agent_role TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            parent_session_id TEXT REFERENCES sessions(id) ON DELETE SET NULL,
            pulse_id TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE turns (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL REFERENCES sessions(id),
            turn_index INTEGER NOT NULL,
            role TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'streaming',
            token_count INTEGER,
            prompt_tokens INTEGER,
            completion_tokens INTEGER,
            model_id TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(session_id, turn_index)
        );

        CREATE TABLE turn_messages (
            id TEXT PRIMARY KEY,
            turn_id TEXT NOT NULL REFERENCES turns(id),
            message_index INTEGER NOT NULL,
            content TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(turn_id, message_index)
        );

        CREATE TABLE turn_tools (
            id TEXT PRIMARY KEY,
            turn_id TEXT NOT NULL REFERENCES turns(id),
            tool_index INTEGER NOT NULL,
            tool_name TEXT NOT NULL,
            input TEXT,
            output TEXT,
            status TEXT NOT NULL DEFAULT 'running',
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(turn_id, tool_index)
        );

        CREATE TABLE turn_thoughts (
            id TEXT PRIMARY KEY,
            turn_id TEXT NOT NULL REFERENCES turns(id),
            thought_index INTEGER NOT NULL,
            content TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(turn_id, thought_index)
        );

        CREATE TABLE questions (
            id TEXT PRIMARY KEY,
            turn_id TEXT NOT NULL REFERENCES turns(id),
            question_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            answer TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE session_notes (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL REFERENCES sessions(id),
            content TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE session_todos (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL REFERENCES sessions(id),
            todo_index INTEGER NOT NULL,
            content TEXT NOT NULL,
            done INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE subtasks (
            id TEXT PRIMARY KEY,
            parent_session_id TEXT NOT NULL REFERENCES sessions(id),
            workflow_id TEXT NOT NULL,
            task_definition TEXT NOT NULL,
            findings TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE artifacts (
            id TEXT PRIMARY KEY,
            workflow_id TEXT NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
            artifact_type TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE cost_records (
            id TEXT PRIMARY KEY,
            context_type TEXT NOT NULL,
            context_id TEXT NOT NULL,
            turn_id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            model_id TEXT NOT NULL,
            agent_role TEXT NOT NULL,
            prompt_tokens INTEGER NOT NULL DEFAULT 0,
            completion_tokens INTEGER NOT NULL DEFAULT 0,
            total_tokens INTEGER NOT NULL DEFAULT 0,
            cost_usd REAL NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX idx_pulses_workflow ON pulses(workflow_id, status);
        CREATE INDEX idx_baselines_workflow ON preflight_baselines(workflow_id, source);
        CREATE INDEX idx_sessions_context ON sessions(context_type, context_id);
        CREATE INDEX idx_turns_session ON turns(session_id, turn_index);
        CREATE INDEX idx_subtasks_parent ON subtasks(parent_session_id);
        CREATE INDEX idx_subtasks_workflow ON subtasks(workflow_id);
        CREATE INDEX idx_costs_context ON cost_records(context_type, context_id);
        CREATE INDEX idx_artifacts_workflow ON artifacts(workflow_id, artifact_type);
        ",
    ),
    (
        "0002_review",
        "
        CREATE TABLE review_cards (
            id TEXT PRIMARY KEY,
            workflow_id TEXT NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
            round_number INTEGER NOT NULL,
            recommendation TEXT,
            summary TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            completed_at TEXT,
            UNIQUE(workflow_id, round_number)
        );

        CREATE TABLE review_comments (
            id TEXT PRIMARY KEY,
            card_id TEXT NOT NULL REFERENCES review_cards(id) ON DELETE CASCADE,
            kind TEXT NOT NULL,
            file_path TEXT,
            line INTEGER,
            content TEXT NOT NULL,
            severity TEXT,
            category TEXT,
            resolved INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX idx_review_cards_workflow ON review_cards(workflow_id, round_number);
        CREATE INDEX idx_review_comments_card ON review_comments(card_id);
        ",
    ),
];

/// Apply every migration not yet recorded in the ledger.
pub fn apply(conn: &Connection) -> Result<(), MigrationError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            id TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .map_err(MigrationError::Ledger)?;

    let done = applied(conn)?;
    for (id, sql) in MIGRATIONS {
        if done.iter().any(|d| d == id) {
            continue;
        }
        tracing::info!(migration = id, "applying schema migration");
        run_one(conn, id, sql)?;
    }
    Ok(())
}

fn run_one(conn: &Connection, id: &'static str, sql: &str) -> Result<(), MigrationError> {
    let wrap = |source| MigrationError::Failed { id, source };
    let tx = conn.unchecked_transaction().map_err(wrap)?;
    tx.execute_batch(sql).map_err(wrap)?;
    tx.execute(
        "INSERT INTO schema_migrations (id) VALUES (?1)",
        rusqlite::params![id],
    )
    .map_err(wrap)?;
    tx.commit().map_err(wrap)
}

/// Ledger contents, in application order.
pub fn applied(conn: &Connection) -> Result<Vec<String>, MigrationError> {
    let mut stmt = conn
        .prepare("SELECT id FROM schema_migrations ORDER BY id")
        .map_err(MigrationError::Ledger)?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(MigrationError::Ledger)?;
    let mut ids = Vec::new();
    for row in rows {
        ids.push(row.map_err(MigrationError::Ledger)?);
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_records_every_migration() {
        let conn = Connection::open_in_memory().unwrap();
        apply(&conn).unwrap();
        let ids = applied(&conn).unwrap();
        assert_eq!(ids.len(), MIGRATIONS.len());
        assert_eq!(ids[0], "0001_core");
    }

    #[test]
    fn test_apply_twice_is_a_noop() {
        let conn = Connection::open_in_memory().unwrap();
        apply(&conn).unwrap();
        apply(&conn).unwrap();
        assert_eq!(applied(&conn).unwrap().len(), MIGRATIONS.len());
    }

    #[test]
    fn test_failed_migration_leaves_no_ledger_entry() {
        let conn = Connection::open_in_memory().unwrap();
        apply(&conn).unwrap();
        let err = run_one(&conn, "9999_broken", "CREATE TABLE nope (").unwrap_err();
        assert!(matches!(err, MigrationError::Failed { id: "9999_broken", .. }));
        assert!(!applied(&conn).unwrap().iter().any(|i| i == "9999_broken"));
    }
}
