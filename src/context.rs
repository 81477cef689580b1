//! Polymorphic execution contexts.
//!
//! Sessions, notes, todos, and cost records are scoped to a context — a
//! workflow stage, a chat channel, or a delegated subtask. The store keeps
//! two physical columns (`context_type`, `context_id`); call sites get this
//! sum type so matching on context kinds is exhaustive at compile time.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "context_type", content = "context_id", rename_all = "snake_case")]
pub enum Context {
    Workflow(String),
    Channel(String),
    Subtask(String),
}

impl Context {
    pub fn workflow(id: impl Into<String>) -> Self {
        Self::Workflow(id.into())
    }

    pub fn channel(id: impl Into<String>) -> Self {
        Self::Channel(id.into())
    }

    pub fn subtask(id: impl Into<String>) -> Self {
        Self::Subtask(id.into())
    }

    pub fn context_type(&self) -> &'static str {
        match self {
            Self::Workflow(_) => "workflow",
            Self::Channel(_) => "channel",
            Self::Subtask(_) => "subtask",
        }
    }

    pub fn context_id(&self) -> &str {
        match self {
            Self::Workflow(id) | Self::Channel(id) | Self::Subtask(id) => id,
        }
    }

    /// Rebuild a context from the two physical columns.
    pub fn from_columns(context_type: &str, context_id: &str) -> Result<Self, String> {
        match context_type {
            "workflow" => Ok(Self::Workflow(context_id.to_string())),
            "channel" => Ok(Self::Channel(context_id.to_string())),
            "subtask" => Ok(Self::Subtask(context_id.to_string())),
            _ => Err(format!("Invalid context type: {}", context_type)),
        }
    }
}

impl std::fmt::Display for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.context_type(), self.context_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_column_roundtrip() {
        let ctx = Context::workflow("workflow_abc");
        let rebuilt = Context::from_columns(ctx.context_type(), ctx.context_id()).unwrap();
        assert_eq!(ctx, rebuilt);

        let ctx = Context::channel("chan_7");
        assert_eq!(ctx.context_type(), "channel");
        assert_eq!(ctx.context_id(), "chan_7");

        assert!(Context::from_columns("nonsense", "x").is_err());
    }

    #[test]
    fn test_context_display() {
        let ctx = Context::subtask("subtask_9");
        assert_eq!(ctx.to_string(), "subtask:subtask_9");
    }
}
