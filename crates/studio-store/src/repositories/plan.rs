//! Coordinator plan rows — the persisted projection of coordinator events.
//!
//! The monotonic merge rules (never shrinking `completed_phases`, clearing
//! `active_phase` on matching completion) live in the runtime's projector;
//! this repo is plain read/write with JSON column handling.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::errors::Result;
use crate::row_types::PlanRow;

/// Plan repository.
pub struct PlanRepo;

impl PlanRepo {
    /// Insert or fully replace the plan row for a conversation.
    pub fn upsert(conn: &Connection, row: &PlanRow) -> Result<()> {
        let plan_json = serde_json::to_string(&row.plan)?;
        let completed_json = serde_json::to_string(&row.completed_phases)?;
        let outputs_json = serde_json::to_string(&row.phase_outputs)?;
        let now = chrono::Utc::now().to_rfc3339();

        let _ = conn.execute(
            "INSERT INTO coordinator_plans
             (conversation_id, objective, plan, active_phase, completed_phases,
              phase_outputs, status, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(conversation_id) DO UPDATE SET
               objective = excluded.objective,
               plan = excluded.plan,
               active_phase = excluded.active_phase,
               completed_phases = excluded.completed_phases,
               phase_outputs = excluded.phase_outputs,
               status = excluded.status,
               updated_at = excluded.updated_at",
            params![
                row.conversation_id,
                row.objective,
                plan_json,
                row.active_phase,
                completed_json,
                outputs_json,
                row.status,
                now,
            ],
        )?;
        Ok(())
    }

    /// Get the plan row for a conversation.
    pub fn get_by_conversation(
        conn: &Connection,
        conversation_id: &str,
    ) -> Result<Option<PlanRow>> {
        let raw = conn
            .query_row(
                "SELECT conversation_id, objective, plan, active_phase, completed_phases,
                        phase_outputs, status, updated_at
                 FROM coordinator_plans WHERE conversation_id = ?1",
                params![conversation_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                    ))
                },
            )
            .optional()?;

        let Some((cid, objective, plan, active_phase, completed, outputs, status, updated_at)) =
            raw
        else {
            return Ok(None);
        };

        Ok(Some(PlanRow {
            conversation_id: cid,
            objective,
            plan: serde_json::from_str::<Value>(&plan)?,
            active_phase,
            completed_phases: serde_json::from_str(&completed)?,
            phase_outputs: serde_json::from_str(&outputs)?,
            status,
            updated_at,
        }))
    }
}
