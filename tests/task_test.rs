//! Task state machine tests.

use serde_json::{Value, json};
use taskq::error::Error;
use taskq::model::*;

fn new_task() -> Task<Value, Value> {
    Task::create(json!({"n": 1}))
}

fn in_progress_task() -> Task<Value, Value> {
    let mut task = new_task();
    task.update_timestamps();
    task.set_in_progress().unwrap();
    task
}

// ---------------------------------------------------------------------------
// Transition table
// ---------------------------------------------------------------------------

#[test]
fn transition_table_matches_lifecycle() {
    use Status::*;
    let all = [Waiting, InProgress, Done, Failed, Canceled];
    let allowed = [
        (Waiting, InProgress),
        (Waiting, Canceled),
        (InProgress, Done),
        (InProgress, Failed),
        (InProgress, Canceled),
    ];

    for from in all {
        for to in all {
            assert_eq!(
                from.can_transition_to(to),
                allowed.contains(&(from, to)),
                "{from} -> {to}"
            );
        }
    }
}

#[test]
fn terminal_states_have_no_exits() {
    for status in [Status::Done, Status::Failed, Status::Canceled] {
        assert!(status.is_terminal());
    }
    assert!(!Status::Waiting.is_terminal());
    assert!(!Status::InProgress.is_terminal());
}

#[test]
fn new_task_is_waiting_without_timestamps() {
    let task = new_task();
    assert_eq!(task.status(), Status::Waiting);
    assert!(task.is_new());
    assert!(!task.is_finished());
    assert!(task.created_at().is_none());
    assert!(task.output().is_none());
}

#[test]
fn task_ids_are_unique() {
    let a = new_task();
    let b = new_task();
    assert_ne!(a.id(), b.id());
    assert!(uuid::Uuid::parse_str(a.id().as_str()).is_ok());
}

#[test]
fn set_in_progress_stamps_taken_at() {
    let task = in_progress_task();
    assert_eq!(task.status(), Status::InProgress);
    assert!(task.taken_at().is_some());
}

#[test]
fn set_done_stores_output() {
    let mut task = in_progress_task();
    task.set_done(json!({"answer": 42})).unwrap();

    assert_eq!(task.status(), Status::Done);
    assert!(task.is_finished());
    assert_eq!(
        task.output().and_then(TaskOutput::data),
        Some(&json!({"answer": 42}))
    );
}

#[test]
fn set_failed_stores_error_and_metadata_copy() {
    let mut task = in_progress_task();
    task.set_failed(TaskError::new("boom")).unwrap();

    assert_eq!(task.status(), Status::Failed);
    assert!(task.output().is_some_and(TaskOutput::is_error));
    assert_eq!(task.metadata().error, Some(TaskError::new("boom")));
}

#[test]
fn done_cannot_be_taken_again() {
    let mut task = in_progress_task();
    task.set_done(json!(1)).unwrap();

    let err = task.set_in_progress().unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidTransition {
            from: Status::Done,
            to: Status::InProgress
        }
    ));
    assert_eq!(task.status(), Status::Done);
}

#[test]
fn waiting_cannot_complete_directly() {
    let mut task = new_task();
    assert!(task.set_done(json!(1)).is_err());
    assert!(task.set_failed(TaskError::new("x")).is_err());
    assert_eq!(task.status(), Status::Waiting);
    assert!(task.output().is_none());
}

#[test]
fn canceled_is_final() {
    let mut task = new_task();
    task.set_canceled().unwrap();
    assert!(task.is_finished());
    assert!(task.set_in_progress().is_err());
    assert!(task.set_canceled().is_err());
}

// ---------------------------------------------------------------------------
// Timestamps and serialization
// ---------------------------------------------------------------------------

#[test]
fn first_update_sets_created_at_later_updates_set_updated_at() {
    let mut task = new_task();
    task.update_timestamps();
    let created = task.created_at();
    assert!(created.is_some());
    assert!(task.updated_at().is_none());

    task.update_timestamps();
    assert_eq!(task.created_at(), created);
    assert!(task.updated_at().is_some());
}

#[test]
fn status_serializes_camel_case() {
    assert_eq!(
        serde_json::to_value(Status::InProgress).unwrap(),
        json!("inProgress")
    );
    assert_eq!(Status::InProgress.to_string(), "inProgress");
}

#[test]
fn priority_parses_and_defaults_to_low() {
    assert_eq!(Priority::default(), Priority::Low);
    assert_eq!("high".parse::<Priority>().unwrap(), Priority::High);
    assert!("urgent".parse::<Priority>().is_err());
    assert_eq!(
        Priority::ALL,
        [Priority::High, Priority::Medium, Priority::Low]
    );
}

#[test]
fn metadata_uses_epoch_millis() {
    let mut task = new_task();
    task.update_timestamps();
    let metadata = serde_json::to_value(task.metadata()).unwrap();

    assert!(metadata["createdAt"].is_i64());
    assert_eq!(metadata["status"], json!("waiting"));
    assert!(metadata.get("error").is_none());
}

#[test]
fn metadata_check_flags_bad_records() {
    let mut task = new_task();
    let id = task.id().clone();

    let errors = task.metadata().check(&id).unwrap_err();
    assert_eq!(errors.fields()[0].field, "createdAt");

    task.update_timestamps();
    assert!(task.metadata().check(&id).is_ok());
    assert!(task.metadata().check(&TaskId::from("other")).is_err());
}
