//! Typed error hierarchy for the cadence engine.
//!
//! Two top-level enums:
//! - `EngineError` — lifecycle and validation failures surfaced to callers
//! - `MigrationError` — schema ledger failures that abort database open
//!
//! Absence is not an error: read-by-id methods return `Option` and callers
//! treat `None` as normal control flow. `EngineError::*NotFound` variants
//! are raised only when a mutation targets a missing entity.

use thiserror::Error;

/// Errors from engine lifecycle operations and JSON-field validation.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Workflow {id} not found")]
    WorkflowNotFound { id: String },

    #[error("Pulse {id} not found")]
    PulseNotFound { id: String },

    #[error("Session {id} not found")]
    SessionNotFound { id: String },

    #[error("Turn {id} not found")]
    TurnNotFound { id: String },

    #[error("Subtask {id} not found")]
    SubtaskNotFound { id: String },

    #[error("Review card {id} not found")]
    ReviewCardNotFound { id: String },

    #[error("Invalid {entity} transition for {id}: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },

    #[error("Workflow {workflow_id} already has a running pulse ({pulse_id})")]
    PulseAlreadyRunning {
        workflow_id: String,
        pulse_id: String,
    },

    #[error("Invalid value for field '{field}': {source}")]
    SchemaValidation {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid value for field '{field}': {message}")]
    InvalidField { field: &'static str, message: String },

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Shorthand for results carrying an [`EngineError`].
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Errors from the versioned migration ledger.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Migration '{id}' failed: {source}")]
    Failed {
        id: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Failed to read migration ledger: {0}")]
    Ledger(#[source] rusqlite::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_transition_message_names_states() {
        let err = EngineError::InvalidTransition {
            entity: "pulse",
            id: "pulse_abc".into(),
            from: "succeeded".into(),
            to: "running".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("pulse_abc"));
        assert!(msg.contains("succeeded"));
        assert!(msg.contains("running"));
    }

    #[test]
    fn schema_validation_carries_field_name() {
        let source = serde_json::from_str::<Vec<String>>("not json").unwrap_err();
        let err = EngineError::SchemaValidation {
            field: "skipped_stages",
            source,
        };
        assert!(err.to_string().contains("skipped_stages"));
    }

    #[test]
    fn pulse_already_running_is_matchable() {
        let err = EngineError::PulseAlreadyRunning {
            workflow_id: "workflow_1".into(),
            pulse_id: "pulse_1".into(),
        };
        assert!(matches!(err, EngineError::PulseAlreadyRunning { .. }));
        assert!(err.to_string().contains("pulse_1"));
    }

    #[test]
    fn migration_error_names_migration_id() {
        let err = MigrationError::Failed {
            id: "0002_add_review_tables",
            source: rusqlite::Error::InvalidQuery,
        };
        assert!(err.to_string().contains("0002_add_review_tables"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&EngineError::LockPoisoned);
        assert_std_error(&MigrationError::Ledger(rusqlite::Error::InvalidQuery));
    }
}
