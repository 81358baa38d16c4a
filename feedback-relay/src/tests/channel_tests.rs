use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use super::fakes::ScriptedTransport;
use crate::channel::{Action, LocalRouter, Message, MessageChannel, Response, Status, Target};
use crate::errors::RelayError;

#[test]
fn message_wire_form() {
    let message = Message::new(Action::ShowResult, json!(["Extension Succeeded", 5000]));
    let wire = serde_json::to_value(&message).unwrap();
    assert_eq!(
        wire,
        json!({"action": "SHOW_RESULT", "value": ["Extension Succeeded", 5000]})
    );
    let response: Response =
        serde_json::from_str(r#"{"status":"failure","data":false,"error":"nope"}"#).unwrap();
    assert_eq!(response.status, Status::Failed);
    assert_eq!(
        response.into_data::<bool>(),
        Err(RelayError::RemoteFailure("nope".into()))
    );
}

#[tokio::test]
async fn router_delivers_to_registered_endpoint() {
    let router = Arc::new(LocalRouter::new());
    let mut endpoint = router.register(Target::Context(3)).await;
    tokio::spawn(async move {
        while let Some(envelope) = endpoint.recv().await {
            let echoed = envelope.message.value.clone();
            envelope.respond(Response::success(echoed));
        }
    });
    let channel = MessageChannel::new(router);
    let response = channel
        .send_to_context(3, Action::ShowResult, json!(["hi", 1]), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(response.into_data::<(String, u64)>().unwrap(), ("hi".into(), 1));
}

#[tokio::test]
async fn unregistered_target_without_fallback_is_not_found() {
    let channel = MessageChannel::new(Arc::new(LocalRouter::new()));
    let result = channel
        .send_to_context(9, Action::ReadFullRatings, Value::Null, Duration::from_secs(1))
        .await;
    assert!(matches!(result, Err(RelayError::ResourceNotFound(_))));
}

#[tokio::test]
async fn unregistered_target_goes_to_fallback() {
    let fallback = ScriptedTransport::new(|_| Ok(Response::success(json!(true))));
    let router = Arc::new(LocalRouter::with_fallback(fallback.clone()));
    let channel = MessageChannel::new(router);
    channel
        .send_to_context(4, Action::ReadRatingsPreview, Value::Null, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(fallback.actions(), vec![Action::ReadRatingsPreview]);
}

#[tokio::test(start_paused = true)]
async fn silent_receiver_times_out() {
    let router = Arc::new(LocalRouter::new());
    let mut endpoint = router.register(Target::Runtime).await;
    // holds envelopes without answering
    let _hold = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Some(envelope) = endpoint.recv().await {
            held.push(envelope);
        }
    });
    let channel = MessageChannel::new(router);
    let result = channel
        .send_runtime(Action::Run, Value::Null, Duration::from_secs(5))
        .await;
    assert!(matches!(result, Err(RelayError::Timeout(_))));
}

#[tokio::test]
async fn dropped_reply_is_stale() {
    let router = Arc::new(LocalRouter::new());
    let mut endpoint = router.register(Target::Context(1)).await;
    tokio::spawn(async move {
        while let Some(envelope) = endpoint.recv().await {
            drop(envelope);
        }
    });
    let channel = MessageChannel::new(router);
    let result = channel
        .send_to_context(1, Action::WriteHandshake, Value::Null, Duration::from_secs(1))
        .await;
    assert!(matches!(result, Err(RelayError::StaleState(_))));
}

#[tokio::test]
async fn busy_reply_surfaces_as_busy() {
    let transport = ScriptedTransport::new(|_| Ok(Response::busy()));
    let channel = MessageChannel::new(transport);
    let response = channel
        .send_to_context(2, Action::WriteHandshake, Value::Null, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(response.status, Status::Busy);
    assert!(matches!(response.into_data::<bool>(), Err(RelayError::Busy(_))));
}

#[tokio::test]
async fn action_scope_must_match_target() {
    let transport = ScriptedTransport::new(|_| Ok(Response::success(Value::Null)));
    let channel = MessageChannel::new(transport.clone());
    let result = channel
        .send_runtime(Action::WriteHandshake, Value::Null, Duration::from_secs(1))
        .await;
    assert!(matches!(result, Err(RelayError::Unsupported(_))));
    let result = channel
        .send_to_context(1, Action::Run, Value::Null, Duration::from_secs(1))
        .await;
    assert!(matches!(result, Err(RelayError::Unsupported(_))));
    assert!(transport.actions().is_empty());
}
