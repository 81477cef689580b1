//! Append-only cost ledger.
//!
//! One record per completed turn, attributed to the same polymorphic
//! context as the session that produced it. Records are never updated
//! after insert except by [`EngineDb::repair_cost_records`], which
//! recomputes `cost_usd` from stored token counts under corrected rates.

use std::collections::HashMap;
use std::str::FromStr;

use anyhow::Context as _;
use rusqlite::params;
use tracing::info;

use super::EngineDb;
use crate::context::Context;
use crate::errors::{EngineError, EngineResult};
use crate::ids;
use crate::models::{AgentRole, CostRecord, ModelRate, NewCostRecord};

const COST_COLUMNS: &str = "id, context_type, context_id, turn_id, session_id, model_id, \
     agent_role, prompt_tokens, completion_tokens, total_tokens, cost_usd, created_at";

impl EngineDb {
    pub fn insert_cost_record(&self, record: &NewCostRecord) -> EngineResult<CostRecord> {
        let id = ids::new_id(ids::COST);
        self.conn
            .execute(
                "INSERT INTO cost_records (id, context_type, context_id, turn_id, session_id,
                     model_id, agent_role, prompt_tokens, completion_tokens, total_tokens, cost_usd)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    id,
                    record.context.context_type(),
                    record.context.context_id(),
                    record.turn_id,
                    record.session_id,
                    record.model_id,
                    record.agent_role.as_str(),
                    record.prompt_tokens,
                    record.completion_tokens,
                    record.total_tokens,
                    record.cost_usd
                ],
            )
            .context("Failed to insert cost record")?;
        self.require_cost_record(&id)
    }

    /// Total spend for one context; 0.0 when no records exist.
    pub fn sum_by_context(&self, context: &Context) -> EngineResult<f64> {
        self.conn
            .query_row(
                "SELECT COALESCE(SUM(cost_usd), 0.0) FROM cost_records
                 WHERE context_type = ?1 AND context_id = ?2",
                params![context.context_type(), context.context_id()],
                |row| row.get(0),
            )
            .context("Failed to sum costs by context")
            .map_err(EngineError::from)
    }

    /// Total spend across many ids of one context type, in a single query.
    pub fn sum_by_context_ids(
        &self,
        context_type: &str,
        context_ids: &[String],
    ) -> EngineResult<f64> {
        if context_ids.is_empty() {
            return Ok(0.0);
        }
        let placeholders = (0..context_ids.len())
            .map(|i| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT COALESCE(SUM(cost_usd), 0.0) FROM cost_records
             WHERE context_type = ?1 AND context_id IN ({placeholders})"
        );
        let mut values: Vec<Box<dyn rusqlite::types::ToSql>> =
            vec![Box::new(context_type.to_string())];
        for id in context_ids {
            values.push(Box::new(id.clone()));
        }
        self.conn
            .query_row(&sql, rusqlite::params_from_iter(values.iter()), |row| {
                row.get(0)
            })
            .context("Failed to sum costs by context ids")
            .map_err(EngineError::from)
    }

    /// Full spend attributable to a workflow: the workflow context itself
    /// plus every subtask spawned under it.
    pub fn get_total_workflow_cost(
        &self,
        workflow_id: &str,
        subtask_ids: &[String],
    ) -> EngineResult<f64> {
        let direct = self.sum_by_context(&Context::workflow(workflow_id))?;
        let subtasks = self.sum_by_context_ids("subtask", subtask_ids)?;
        Ok(direct + subtasks)
    }

    /// Records for a context in chronological order.
    pub fn list_cost_records_by_context(&self, context: &Context) -> EngineResult<Vec<CostRecord>> {
        let sql = format!(
            "SELECT {COST_COLUMNS} FROM cost_records
             WHERE context_type = ?1 AND context_id = ?2 ORDER BY rowid"
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_cost_records_by_context")?;
        let rows = stmt
            .query_map(
                params![context.context_type(), context.context_id()],
                CostRow::from_row,
            )
            .context("Failed to query cost records")?;
        let mut records = Vec::new();
        for row in rows {
            let r = row.context("Failed to read cost row")?;
            records.push(r.into_record()?);
        }
        Ok(records)
    }

    /// Recompute `cost_usd` for records whose stored cost disagrees with the
    /// given rates. Only records with at least `min_total_tokens` are
    /// considered; a second pass under the same rates changes nothing.
    /// Returns the number of records corrected.
    pub fn repair_cost_records(
        &self,
        rates: &[ModelRate],
        min_total_tokens: i64,
    ) -> EngineResult<usize> {
        let by_model: HashMap<&str, &ModelRate> =
            rates.iter().map(|r| (r.model_id.as_str(), r)).collect();

        let candidates = {
            let mut stmt = self
                .conn
                .prepare(
                    "SELECT id, model_id, prompt_tokens, completion_tokens, cost_usd
                     FROM cost_records WHERE total_tokens >= ?1",
                )
                .context("Failed to prepare cost repair scan")?;
            let rows = stmt
                .query_map(params![min_total_tokens], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, f64>(4)?,
                    ))
                })
                .context("Failed to scan cost records for repair")?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.context("Failed to read cost row")?);
            }
            out
        };

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let mut repaired = 0usize;
        for (id, model_id, prompt_tokens, completion_tokens, stored_cost) in candidates {
            let Some(rate) = by_model.get(model_id.as_str()) else {
                continue;
            };
            let expected = rate.cost_for(prompt_tokens, completion_tokens);
            if (expected - stored_cost).abs() < f64::EPSILON {
                continue;
            }
            tx.execute(
                "UPDATE cost_records SET cost_usd = ?1 WHERE id = ?2",
                params![expected, id],
            )
            .context("Failed to repair cost record")?;
            repaired += 1;
        }
        tx.commit().context("Failed to commit cost repair")?;
        if repaired > 0 {
            info!(repaired, "repaired cost records");
        }
        Ok(repaired)
    }

    fn require_cost_record(&self, id: &str) -> EngineResult<CostRecord> {
        let sql = format!("SELECT {COST_COLUMNS} FROM cost_records WHERE id = ?1");
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare cost read-back")?;
        let mut rows = stmt
            .query_map(params![id], CostRow::from_row)
            .context("Failed to query cost record")?;
        match rows.next() {
            Some(row) => row.context("Failed to read cost row")?.into_record(),
            None => Err(EngineError::Other(anyhow::anyhow!(
                "Cost record {id} not found after insert"
            ))),
        }
    }
}

struct CostRow {
    id: String,
    context_type: String,
    context_id: String,
    turn_id: String,
    session_id: String,
    model_id: String,
    agent_role: String,
    prompt_tokens: i64,
    completion_tokens: i64,
    total_tokens: i64,
    cost_usd: f64,
    created_at: String,
}

impl CostRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            context_type: row.get(1)?,
            context_id: row.get(2)?,
            turn_id: row.get(3)?,
            session_id: row.get(4)?,
            model_id: row.get(5)?,
            agent_role: row.get(6)?,
            prompt_tokens: row.get(7)?,
            completion_tokens: row.get(8)?,
            total_tokens: row.get(9)?,
            cost_usd: row.get(10)?,
            created_at: row.get(11)?,
        })
    }

    fn into_record(self) -> EngineResult<CostRecord> {
        let context = Context::from_columns(&self.context_type, &self.context_id)
            .map_err(|message| EngineError::InvalidField { field: "context_type", message })?;
        let agent_role = AgentRole::from_str(&self.agent_role)
            .map_err(|message| EngineError::InvalidField { field: "agent_role", message })?;
        Ok(CostRecord {
            id: self.id,
            context,
            turn_id: self.turn_id,
            session_id: self.session_id,
            model_id: self.model_id,
            agent_role,
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            total_tokens: self.total_tokens,
            cost_usd: self.cost_usd,
            created_at: self.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(context: Context, model_id: &str, prompt: i64, completion: i64, cost: f64) -> NewCostRecord {
        NewCostRecord {
            context,
            turn_id: "turn_t".into(),
            session_id: "session_s".into(),
            model_id: model_id.into(),
            agent_role: AgentRole::Executor,
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
            cost_usd: cost,
        }
    }

    #[test]
    fn test_insert_and_sum_by_context() {
        let db = EngineDb::new_in_memory().unwrap();
        let ctx = Context::workflow("workflow_a");
        db.insert_cost_record(&record(ctx.clone(), "m1", 1000, 500, 0.25)).unwrap();
        db.insert_cost_record(&record(ctx.clone(), "m1", 2000, 100, 0.50)).unwrap();
        db.insert_cost_record(&record(Context::workflow("workflow_b"), "m1", 1, 1, 9.0)).unwrap();

        assert!((db.sum_by_context(&ctx).unwrap() - 0.75).abs() < 1e-9);
        assert_eq!(db.sum_by_context(&Context::workflow("workflow_none")).unwrap(), 0.0);
    }

    #[test]
    fn test_context_type_disambiguates() {
        let db = EngineDb::new_in_memory().unwrap();
        // Same id under two context types must not collide.
        db.insert_cost_record(&record(Context::workflow("shared"), "m1", 10, 10, 1.0)).unwrap();
        db.insert_cost_record(&record(Context::channel("shared"), "m1", 10, 10, 2.0)).unwrap();

        assert!((db.sum_by_context(&Context::workflow("shared")).unwrap() - 1.0).abs() < 1e-9);
        assert!((db.sum_by_context(&Context::channel("shared")).unwrap() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_total_workflow_cost_includes_subtasks() {
        let db = EngineDb::new_in_memory().unwrap();
        db.insert_cost_record(&record(Context::workflow("workflow_a"), "m1", 10, 10, 1.0)).unwrap();
        db.insert_cost_record(&record(Context::subtask("subtask_1"), "m1", 10, 10, 0.25)).unwrap();
        db.insert_cost_record(&record(Context::subtask("subtask_2"), "m1", 10, 10, 0.25)).unwrap();
        db.insert_cost_record(&record(Context::subtask("subtask_other"), "m1", 10, 10, 5.0)).unwrap();

        let total = db
            .get_total_workflow_cost("workflow_a", &["subtask_1".into(), "subtask_2".into()])
            .unwrap();
        assert!((total - 1.5).abs() < 1e-9);

        // No subtasks yields the direct spend only.
        let direct = db.get_total_workflow_cost("workflow_a", &[]).unwrap();
        assert!((direct - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_repair_is_targeted_and_idempotent() {
        let db = EngineDb::new_in_memory().unwrap();
        let ctx = Context::workflow("workflow_a");
        // Wrong stored cost, large enough to qualify.
        db.insert_cost_record(&record(ctx.clone(), "m1", 1_000_000, 500_000, 0.0)).unwrap();
        // Already correct under the rate below.
        db.insert_cost_record(&record(ctx.clone(), "m1", 1_000_000, 0, 3.0)).unwrap();
        // Unknown model, left alone.
        db.insert_cost_record(&record(ctx.clone(), "m-unknown", 1_000_000, 0, 0.0)).unwrap();
        // Below the token floor, left alone.
        db.insert_cost_record(&record(ctx.clone(), "m1", 10, 10, 0.0)).unwrap();

        let rates = vec![ModelRate {
            model_id: "m1".into(),
            prompt_cost_per_million: 3.0,
            completion_cost_per_million: 15.0,
        }];
        let repaired = db.repair_cost_records(&rates, 1000).unwrap();
        assert_eq!(repaired, 1);

        // 1M prompt @ 3.0 + 0.5M completion @ 15.0 = 10.5, plus 3.0 + 0 + 0.
        assert!((db.sum_by_context(&ctx).unwrap() - 13.5).abs() < 1e-9);

        // Second pass under the same rates is a no-op.
        assert_eq!(db.repair_cost_records(&rates, 1000).unwrap(), 0);
    }

    #[test]
    fn test_list_is_chronological() {
        let db = EngineDb::new_in_memory().unwrap();
        let ctx = Context::workflow("workflow_a");
        db.insert_cost_record(&record(ctx.clone(), "m1", 1, 1, 0.1)).unwrap();
        db.insert_cost_record(&record(ctx.clone(), "m2", 2, 2, 0.2)).unwrap();
        let records = db.list_cost_records_by_context(&ctx).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].model_id, "m1");
        assert_eq!(records[1].model_id, "m2");
    }
}
