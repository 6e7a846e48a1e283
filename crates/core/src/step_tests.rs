use super::*;
use crate::run::RunId;
use chrono::Utc;
use serde_json::json;

fn step(name: &str, status: StepStatus, output: Option<Value>) -> Step {
    Step {
        run_id: RunId::new(),
        name: name.to_string(),
        index: 0,
        status,
        output,
        error: None,
        started_at: Utc::now(),
        completed_at: Utc::now(),
    }
}

#[test]
fn snapshot_only_keeps_completed_steps() {
    let snapshot = StepSnapshot::from_steps([
        step("a", StepStatus::Completed, Some(json!(1))),
        step("b", StepStatus::Failed, None),
    ]);
    assert_eq!(snapshot.get("a"), Some(&json!(1)));
    assert_eq!(snapshot.get("b"), None);
    assert_eq!(snapshot.len(), 1);
}

#[test]
fn snapshot_null_output_is_distinguishable_from_missing() {
    let snapshot = StepSnapshot::from_steps([step("a", StepStatus::Completed, None)]);
    assert_eq!(snapshot.get("a"), Some(&Value::Null));
    assert_eq!(snapshot.get("missing"), None);
}

#[test]
fn status_round_trips_through_str() {
    assert_eq!(
        StepStatus::from_str(StepStatus::Completed.as_str()),
        Some(StepStatus::Completed)
    );
    assert_eq!(
        StepStatus::from_str(StepStatus::Failed.as_str()),
        Some(StepStatus::Failed)
    );
    assert_eq!(StepStatus::from_str("bogus"), None);
}
