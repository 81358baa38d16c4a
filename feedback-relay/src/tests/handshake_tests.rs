use std::sync::Arc;

use serde_json::{json, Value};

use super::fakes::{ratings, FakeHandshakePage};
use super::init_tracing;
use crate::channel::{Action, Message, Status};
use crate::config::AppConfig;
use crate::constants::{qa_feedback, tasks};
use crate::errors::RelayError;
use crate::executor::{
    HandshakeExecutor, HandshakeJob, HandshakeRun, HandshakeStage, RatingField,
};
use crate::session::SessionGate;
use crate::types::TaskIdentity;

const LABELS: [&str; 4] = [
    "12-caption-review",
    "4821-label-the-dataset",
    "903-audio-check",
    "Other",
];

fn job(id: &str, slug: &str) -> HandshakeJob {
    HandshakeJob {
        config: AppConfig {
            ep_max_tries: 5,
            ..AppConfig::default()
        },
        task: TaskIdentity {
            id: id.into(),
            slug: slug.into(),
        },
        ratings: ratings(),
    }
}

fn write_message(job: &HandshakeJob) -> Message {
    Message::new(Action::WriteHandshake, job.to_payload().unwrap())
}

#[tokio::test(start_paused = true)]
async fn full_run_writes_six_fields_in_order() {
    init_tracing();
    let page = FakeHandshakePage::new(&LABELS);
    let job = job("4821", "4821-label-the-dataset");
    let gate = SessionGate::new();
    let session = gate.try_begin().unwrap();

    let history = HandshakeRun::new(page.as_ref(), &job, &session)
        .execute()
        .await
        .unwrap();

    let expected = ["X", "4.5", "10", "5", "2", "1"];
    assert_eq!(history.len(), 6);
    assert_eq!(history.written(), expected);
    assert_eq!(history.baseline(), ["4821-label-the-dataset"]);
    assert_eq!(
        page.region(),
        ["4821-label-the-dataset", "X", "4.5", "10", "5", "2", "1"]
    );
    let writes = page.set_values();
    assert_eq!(writes.len(), 6);
    assert_eq!(writes[0].0, tasks::SLUG_INPUT_QUERY_SELECTOR);
    assert!(writes[1..]
        .iter()
        .all(|(selector, _)| selector == qa_feedback::ratings::INPUT_QUERY_SELECTOR));
    let events = page.state.lock().unwrap().events.clone();
    assert_eq!(&events[..2], ["input", "change"]);
}

#[tokio::test(start_paused = true)]
async fn unknown_task_falls_back_to_last_option_and_submits_slug() {
    let page = FakeHandshakePage::new(&LABELS);
    let job = job("999", "999-missing-task");
    let gate = SessionGate::new();
    let session = gate.try_begin().unwrap();

    let history = HandshakeRun::new(page.as_ref(), &job, &session)
        .execute()
        .await
        .unwrap();

    assert_eq!(history.baseline(), ["Other"]);
    assert_eq!(history.written()[0], "999-missing-task");
    let pressed: Vec<bool> = page
        .state
        .lock()
        .unwrap()
        .options
        .iter()
        .map(|(_, p)| *p)
        .collect();
    assert_eq!(pressed, [false, false, false, true]);
}

#[tokio::test(start_paused = true)]
async fn written_field_is_not_rewritten() {
    let page = FakeHandshakePage::with_region(&LABELS, &["X"]);
    let job = job("4821", "4821-label-the-dataset");
    let gate = SessionGate::new();
    let session = gate.try_begin().unwrap();
    let run = HandshakeRun::new(page.as_ref(), &job, &session);

    let done = run.attempt(HandshakeStage::SubmitSlug).await.unwrap();

    assert!(done);
    assert!(page.set_values().is_empty());
}

#[tokio::test(start_paused = true)]
async fn field_write_reports_not_yet_after_mutating() {
    let page = FakeHandshakePage::with_region(&LABELS, &[]);
    let job = job("4821", "4821-label-the-dataset");
    let gate = SessionGate::new();
    let session = gate.try_begin().unwrap();
    let run = HandshakeRun::new(page.as_ref(), &job, &session);

    assert!(!run.attempt(HandshakeStage::SubmitSlug).await.unwrap());
    assert_eq!(page.set_values().len(), 1);
    assert!(run.attempt(HandshakeStage::SubmitSlug).await.unwrap());
    assert_eq!(page.set_values().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn resumed_run_writes_only_the_missing_fields() {
    let page = FakeHandshakePage::with_region(&LABELS, &["4821-label-the-dataset", "X", "4.5"]);
    let job = job("4821", "4821-label-the-dataset");
    let gate = SessionGate::new();
    let session = gate.try_begin().unwrap();

    let history = HandshakeRun::new(page.as_ref(), &job, &session)
        .execute()
        .await
        .unwrap();

    assert_eq!(history.baseline(), ["4821-label-the-dataset"]);
    assert_eq!(history.written(), ["X", "4.5", "10", "5", "2", "1"]);
    assert_eq!(
        page.region(),
        ["4821-label-the-dataset", "X", "4.5", "10", "5", "2", "1"]
    );
    let written: Vec<String> = page.set_values().into_iter().map(|(_, v)| v).collect();
    assert_eq!(written, ["10", "5", "2", "1"]);
}

#[tokio::test(start_paused = true)]
async fn failed_rating_aborts_the_remaining_fields() {
    let page = FakeHandshakePage::new(&LABELS);
    page.state.lock().unwrap().refused = Some("10".into());
    let job = job("4821", "4821-label-the-dataset");
    let gate = SessionGate::new();
    let session = gate.try_begin().unwrap();

    let result = HandshakeRun::new(page.as_ref(), &job, &session)
        .execute()
        .await;

    let err = result.unwrap_err();
    let stage = HandshakeStage::SubmitRating(RatingField::Exceptional).to_string();
    assert!(err.to_string().contains(&stage), "unexpected error: {err}");
    let written: Vec<String> = page.set_values().into_iter().map(|(_, v)| v).collect();
    assert_eq!(&written[..2], ["X", "4.5"]);
    assert!(written[2..].iter().all(|v| v == "10"));
    assert_eq!(page.region(), ["4821-label-the-dataset", "X", "4.5"]);
}

#[tokio::test(start_paused = true)]
async fn limit_section_with_three_buttons_is_still_skipped() {
    let page = FakeHandshakePage::new(&LABELS);
    page.state.lock().unwrap().limit_options = 3;
    let job = job("4821", "4821-label-the-dataset");
    let gate = SessionGate::new();
    let session = gate.try_begin().unwrap();
    let run = HandshakeRun::new(page.as_ref(), &job, &session);

    assert!(!run.attempt(HandshakeStage::SkipLimitSection).await.unwrap());
    assert!(!page.state.lock().unwrap().limit_section);
    assert!(run.attempt(HandshakeStage::SkipLimitSection).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn navigating_away_fails_the_stage() {
    let page = FakeHandshakePage::new(&LABELS);
    page.state.lock().unwrap().location = "https://ai.joinhandshake.com/home".into();
    let job = job("4821", "4821-label-the-dataset");
    let gate = SessionGate::new();
    let session = gate.try_begin().unwrap();
    let result = HandshakeRun::new(page.as_ref(), &job, &session)
        .attempt(HandshakeStage::SkipLimitSection)
        .await;
    assert!(matches!(result, Err(RelayError::StaleState(_))));
}

#[tokio::test(start_paused = true)]
async fn executor_answers_success_for_a_full_run() {
    let page = FakeHandshakePage::new(&LABELS);
    let executor = HandshakeExecutor::new(page.clone());
    let response = executor
        .handle(&write_message(&job("4821", "4821-label-the-dataset")))
        .await;
    assert_eq!(response.status, Status::Success);
    assert_eq!(response.data, json!(true));
    assert!(!executor.gate().is_busy());
}

#[tokio::test]
async fn executor_refuses_overlapping_session() {
    let page = FakeHandshakePage::new(&LABELS);
    let executor = Arc::new(HandshakeExecutor::new(page.clone()));
    let _running = executor.gate().try_begin().unwrap();

    let response = executor
        .handle(&write_message(&job("4821", "4821-label-the-dataset")))
        .await;

    assert_eq!(response.status, Status::Busy);
    assert!(page.set_values().is_empty());
}

#[tokio::test]
async fn executor_rejects_malformed_payload() {
    let page = FakeHandshakePage::new(&LABELS);
    let executor = HandshakeExecutor::new(page);
    let response = executor
        .handle(&Message::new(Action::WriteHandshake, json!(["only", "two"])))
        .await;
    assert_eq!(response.status, Status::Failed);
    assert_eq!(response.error.as_deref(), Some("Invalid data format"));
}

#[tokio::test]
async fn executor_outside_task_page_fails() {
    let page = FakeHandshakePage::new(&LABELS);
    page.state.lock().unwrap().location = "https://www.multimango.com/".into();
    let executor = HandshakeExecutor::new(page);
    let response = executor
        .handle(&Message::new(Action::ShowResult, json!(["hi", 1000])))
        .await;
    assert_eq!(response.status, Status::Failed);
    assert_eq!(response.data, Value::Bool(false));
}

#[tokio::test]
async fn executor_shows_notification() {
    let page = FakeHandshakePage::new(&LABELS);
    let executor = HandshakeExecutor::new(page.clone());
    let response = executor
        .handle(&Message::new(
            Action::ShowResult,
            json!(["Extension Succeeded", 5000]),
        ))
        .await;
    assert!(response.is_success());
    let shown = page.state.lock().unwrap().notifications.clone();
    assert_eq!(shown.len(), 1);
    assert_eq!(shown[0].0, "Extension Succeeded");
    assert_eq!(shown[0].1.as_millis(), 5000);
}
