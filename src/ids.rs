//! Prefixed opaque entity ids.
//!
//! Every entity id is `<prefix>_<uuid>`: globally unique, and the prefix
//! makes an id self-describing in logs and foreign-key columns. Callers
//! never parse ids; the prefix exists for humans.

use uuid::Uuid;

pub const WORKFLOW: &str = "workflow";
pub const PULSE: &str = "pulse";
pub const PREFLIGHT: &str = "preflight";
pub const BASELINE: &str = "baseline";
pub const SESSION: &str = "session";
pub const TURN: &str = "turn";
pub const MESSAGE: &str = "message";
pub const TOOL: &str = "tool";
pub const THOUGHT: &str = "thought";
pub const QUESTION: &str = "question";
pub const NOTE: &str = "note";
pub const TODO: &str = "todo";
pub const SUBTASK: &str = "subtask";
pub const ARTIFACT: &str = "artifact";
pub const REVIEW: &str = "review";
pub const COMMENT: &str = "comment";
pub const COST: &str = "cost";

/// Generate a fresh id with the given prefix.
pub fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_id_carries_prefix() {
        let id = new_id(WORKFLOW);
        assert!(id.starts_with("workflow_"));
        // 32 hex chars after the prefix and separator.
        assert_eq!(id.len(), "workflow_".len() + 32);
    }

    #[test]
    fn test_new_ids_are_unique() {
        let a = new_id(PULSE);
        let b = new_id(PULSE);
        assert_ne!(a, b);
    }
}
