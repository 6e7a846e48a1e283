use super::*;
use serde_json::json;

fn run_id() -> RunId {
    RunId::from_string("run_01913fae-0000-7000-8000-000000000000")
}

#[test]
fn only_run_complete_fail_cancel_are_terminal() {
    let terminal = EventKind::RunComplete {
        run_id: run_id(),
        job_name: "echo".into(),
        output: json!({}),
        duration_ms: 1,
    };
    assert!(terminal.is_terminal());

    let non_terminal = EventKind::RunStart {
        run_id: run_id(),
        job_name: "echo".into(),
        payload: json!({}),
    };
    assert!(!non_terminal.is_terminal());
}

#[test]
fn worker_error_has_no_run_id() {
    let event = EventKind::WorkerError {
        error: "boom".into(),
        context: "poll".into(),
    };
    assert_eq!(event.run_id(), None);
}

#[test]
fn run_events_carry_their_run_id() {
    let id = run_id();
    let event = EventKind::StepFail {
        run_id: id,
        step_name: "a".into(),
        index: 0,
        error: "nope".into(),
    };
    assert_eq!(event.run_id(), Some(id));
}

#[test]
fn serializes_with_tagged_type_field() {
    let event = Event {
        sequence: 7,
        kind: EventKind::RunCancel {
            run_id: run_id(),
            job_name: "echo".into(),
        },
    };
    let value = serde_json::to_value(&event).expect("serialize");
    assert_eq!(value["type"], "run:cancel");
    assert_eq!(value["sequence"], 7);
}
