//! Plan state projection.
//!
//! Applies coordinator events to the persisted plan row for a conversation.
//! Every update is a monotonic, idempotent re-application: `completed_phases`
//! only grows, and replaying an event leaves the row unchanged. Persistence
//! failures are logged and counted but never block the event stream.

use serde_json::{json, Value};
use studio_core::status::PlanStatus;
use studio_store::row_types::PlanRow;
use studio_store::StudioStore;
use tracing::{debug, warn};

/// Applies coordinator events to the durable plan store.
#[derive(Clone)]
pub struct PlanProjector {
    store: StudioStore,
}

impl PlanProjector {
    /// Create a projector over the given store.
    #[must_use]
    pub fn new(store: StudioStore) -> Self {
        Self { store }
    }

    /// Apply one coordinator event. Never fails: errors are absorbed so the
    /// stream to the client keeps priority.
    pub fn apply(&self, conversation_id: &str, event_type: &str, data: &Value) {
        let result = match event_type {
            "plan_created" => self.plan_created(conversation_id, data),
            "phase_started" => self.phase_started(conversation_id, data),
            "phase_completed" => self.phase_completed(conversation_id, data),
            "task_completed" => self.set_status(conversation_id, PlanStatus::Completed),
            "task_failed" | "execution_failed" => {
                self.set_status(conversation_id, PlanStatus::Failed)
            }
            other => {
                debug!(event_type = other, "ignoring coordinator event");
                Ok(())
            }
        };

        if let Err(e) = result {
            metrics::counter!("persistence_failures_total", "target" => "coordinator_plans")
                .increment(1);
            warn!(
                conversation_id,
                event_type,
                error = %e,
                "failed to project coordinator event; stream continues"
            );
        }
    }

    fn plan_created(&self, conversation_id: &str, data: &Value) -> studio_store::Result<()> {
        let Some(plan) = data.get("plan") else {
            warn!(conversation_id, "plan_created without a plan document");
            return Ok(());
        };
        let objective = plan
            .get("objective")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        self.store.upsert_plan(&PlanRow {
            conversation_id: conversation_id.to_string(),
            objective,
            plan: plan.clone(),
            active_phase: None,
            completed_phases: Vec::new(),
            phase_outputs: json!({}),
            status: PlanStatus::Running.as_str().to_string(),
            updated_at: String::new(),
        })
    }

    fn phase_started(&self, conversation_id: &str, data: &Value) -> studio_store::Result<()> {
        let Some(phase) = data.get("phase").and_then(Value::as_i64) else {
            warn!(conversation_id, "phase_started without a phase number");
            return Ok(());
        };
        let Some(mut row) = self.store.get_plan(conversation_id)? else {
            // Out-of-order event before plan_created
            warn!(conversation_id, phase, "phase_started with no plan row, dropping");
            return Ok(());
        };
        row.active_phase = Some(phase);
        row.status = PlanStatus::Running.as_str().to_string();
        self.store.upsert_plan(&row)
    }

    fn phase_completed(&self, conversation_id: &str, data: &Value) -> studio_store::Result<()> {
        let Some(phase) = data.get("phase").and_then(Value::as_i64) else {
            warn!(conversation_id, "phase_completed without a phase number");
            return Ok(());
        };
        let Some(mut row) = self.store.get_plan(conversation_id)? else {
            warn!(conversation_id, phase, "phase_completed with no plan row, dropping");
            return Ok(());
        };

        if !row.completed_phases.contains(&phase) {
            row.completed_phases.push(phase);
        }
        if let Some(evaluation) = data.get("evaluation") {
            row.phase_outputs[format!("phase_{phase}")] = evaluation.clone();
        }
        if row.active_phase == Some(phase) {
            row.active_phase = None;
        }
        self.store.upsert_plan(&row)
    }

    fn set_status(&self, conversation_id: &str, status: PlanStatus) -> studio_store::Result<()> {
        let Some(mut row) = self.store.get_plan(conversation_id)? else {
            warn!(conversation_id, status = %status, "status event with no plan row, dropping");
            return Ok(());
        };
        row.status = status.as_str().to_string();
        self.store.upsert_plan(&row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use studio_store::{new_in_memory, run_migrations, ConnectionConfig};

    fn make_projector() -> (PlanProjector, StudioStore) {
        let pool = new_in_memory(&ConnectionConfig::default()).unwrap();
        {
            let conn = pool.get().unwrap();
            run_migrations(&conn).unwrap();
        }
        let store = StudioStore::new(pool);
        (PlanProjector::new(store.clone()), store)
    }

    fn plan_doc() -> Value {
        json!({
            "objective": "O",
            "phases": [{"phase": 1, "name": "A"}, {"phase": 2, "name": "B"}],
        })
    }

    #[test]
    fn plan_created_upserts_fresh_row() {
        let (projector, store) = make_projector();
        projector.apply("c1", "plan_created", &json!({"plan": plan_doc()}));

        let row = store.get_plan("c1").unwrap().unwrap();
        assert_eq!(row.objective, "O");
        assert!(row.active_phase.is_none());
        assert!(row.completed_phases.is_empty());
        assert_eq!(row.status, "running");
    }

    #[test]
    fn full_plan_lifecycle() {
        // Spec scenario S4
        let (projector, store) = make_projector();
        projector.apply("c1", "plan_created", &json!({"plan": plan_doc()}));
        projector.apply("c1", "phase_started", &json!({"phase": 1}));
        projector.apply(
            "c1",
            "phase_completed",
            &json!({"phase": 1, "evaluation": {"ok": true}}),
        );
        projector.apply("c1", "phase_started", &json!({"phase": 2}));
        projector.apply("c1", "phase_completed", &json!({"phase": 2}));
        projector.apply("c1", "task_completed", &json!({}));

        let row = store.get_plan("c1").unwrap().unwrap();
        assert_eq!(row.objective, "O");
        assert!(row.active_phase.is_none());
        assert_eq!(row.completed_phases, vec![1, 2]);
        assert_eq!(row.phase_outputs["phase_1"]["ok"], true);
        assert!(row.phase_outputs.get("phase_2").is_none());
        assert_eq!(row.status, "completed");
    }

    #[test]
    fn out_of_order_phase_start() {
        // Spec scenario S5: phase 2 starts before phase 1
        let (projector, store) = make_projector();
        projector.apply("c1", "plan_created", &json!({"plan": plan_doc()}));
        projector.apply("c1", "phase_started", &json!({"phase": 2}));

        let row = store.get_plan("c1").unwrap().unwrap();
        assert_eq!(row.active_phase, Some(2));

        projector.apply("c1", "phase_started", &json!({"phase": 1}));
        let row = store.get_plan("c1").unwrap().unwrap();
        assert_eq!(row.active_phase, Some(1));

        // Completing phase 2 leaves phase 1 active
        projector.apply("c1", "phase_completed", &json!({"phase": 2}));
        let row = store.get_plan("c1").unwrap().unwrap();
        assert_eq!(row.active_phase, Some(1));
        assert_eq!(row.completed_phases, vec![2]);

        projector.apply("c1", "phase_completed", &json!({"phase": 1}));
        let row = store.get_plan("c1").unwrap().unwrap();
        assert!(row.active_phase.is_none());
        assert_eq!(row.completed_phases, vec![2, 1]);
    }

    #[test]
    fn phase_started_without_plan_is_dropped() {
        let (projector, store) = make_projector();
        projector.apply("c1", "phase_started", &json!({"phase": 1}));
        assert!(store.get_plan("c1").unwrap().is_none());
    }

    #[test]
    fn phase_completed_is_idempotent() {
        let (projector, store) = make_projector();
        projector.apply("c1", "plan_created", &json!({"plan": plan_doc()}));
        projector.apply("c1", "phase_completed", &json!({"phase": 1}));
        projector.apply("c1", "phase_completed", &json!({"phase": 1}));

        let row = store.get_plan("c1").unwrap().unwrap();
        assert_eq!(row.completed_phases, vec![1]);
    }

    #[test]
    fn completed_phases_never_shrink() {
        let (projector, store) = make_projector();
        projector.apply("c1", "plan_created", &json!({"plan": plan_doc()}));
        projector.apply("c1", "phase_completed", &json!({"phase": 1}));
        projector.apply("c1", "phase_started", &json!({"phase": 2}));

        let row = store.get_plan("c1").unwrap().unwrap();
        assert_eq!(row.completed_phases, vec![1]);
    }

    #[test]
    fn task_failed_sets_failed() {
        let (projector, store) = make_projector();
        projector.apply("c1", "plan_created", &json!({"plan": plan_doc()}));
        projector.apply("c1", "task_failed", &json!({}));
        assert_eq!(store.get_plan("c1").unwrap().unwrap().status, "failed");
    }

    #[test]
    fn execution_failed_sets_failed() {
        let (projector, store) = make_projector();
        projector.apply("c1", "plan_created", &json!({"plan": plan_doc()}));
        projector.apply("c1", "execution_failed", &json!({"error": "boom"}));
        assert_eq!(store.get_plan("c1").unwrap().unwrap().status, "failed");
    }

    #[test]
    fn plan_created_overwrites_previous_run() {
        let (projector, store) = make_projector();
        projector.apply("c1", "plan_created", &json!({"plan": plan_doc()}));
        projector.apply("c1", "phase_completed", &json!({"phase": 1}));
        projector.apply("c1", "task_completed", &json!({}));

        // Re-running a plan in the same conversation starts clean
        projector.apply(
            "c1",
            "plan_created",
            &json!({"plan": {"objective": "O2", "phases": []}}),
        );
        let row = store.get_plan("c1").unwrap().unwrap();
        assert_eq!(row.objective, "O2");
        assert!(row.completed_phases.is_empty());
        assert_eq!(row.status, "running");
    }

    #[test]
    fn unknown_event_types_are_ignored() {
        let (projector, store) = make_projector();
        projector.apply("c1", "worker_heartbeat", &json!({}));
        assert!(store.get_plan("c1").unwrap().is_none());
    }

    #[test]
    fn malformed_payloads_do_not_panic() {
        let (projector, _store) = make_projector();
        projector.apply("c1", "plan_created", &json!({}));
        projector.apply("c1", "phase_started", &json!({"phase": "two"}));
        projector.apply("c1", "phase_completed", &json!({}));
    }
}
