use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use feedback_relay::browser::Browser;
use feedback_relay::channel::{
    Action, Message as RelayMessage, MessageChannel, Status, Target, Transport,
};
use feedback_relay::extension_bridge::{BridgeCommand, BridgeEvent, BridgePage, ExtensionBridge};
use feedback_relay::page::Page;
use feedback_relay::poll::wait_for_condition;
use feedback_relay::RelayError;

type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const HANDSHAKE_PAGE_URL: &str = "https://ai.joinhandshake.com/annotations/fellow/task/77/run";

/// Answers bridge commands the way the extension's background worker would.
fn answer(request: &Value) -> Value {
    let id = request["id"].clone();
    let command = &request["command"];
    let result = match command["action"].as_str() {
        Some("tabs_query") => json!([{
            "id": 2,
            "windowId": 1,
            "url": HANDSHAKE_PAGE_URL,
            "status": "complete",
            "active": true
        }]),
        Some("send_message") => {
            let action = command["message"]["action"].as_str().unwrap_or_default();
            json!({"status": "Success", "data": action == "SHOW_RESULT"})
        }
        Some("dom") => match command["op"]["op"].as_str() {
            Some("location") => json!(HANDSHAKE_PAGE_URL),
            Some("count") => json!(4),
            _ => Value::Null,
        },
        Some("tabs_get") => {
            return json!({"id": id, "ok": false, "error": "No tab with id: 9."});
        }
        _ => Value::Null,
    };
    json!({"id": id, "ok": true, "result": result})
}

#[tokio::test]
async fn extension_bridge_roundtrip() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();

    let bridge = ExtensionBridge::start("127.0.0.1:0")
        .await
        .expect("bridge starts");
    let mut events = bridge.subscribe();
    let url = format!("ws://{}", bridge.local_addr());

    // Connect a fake extension client
    let (ws, _) = connect_async(url.as_str()).await.expect("ws connect");
    let (mut writer, mut reader) = ws.split();
    writer
        .send(Message::Text(r#"{"type":"hello","from":"test"}"#.into()))
        .await
        .expect("send hello");

    let connected = tokio::time::timeout(Duration::from_secs(3), events.recv())
        .await
        .expect("hello event in time")
        .expect("event");
    assert_eq!(
        connected,
        BridgeEvent::Connected {
            from: Some("test".into())
        }
    );
    assert!(bridge.wait_for_client(Duration::from_secs(3)).await);

    let extension = tokio::spawn(async move {
        while let Some(Ok(msg)) = reader.next().await {
            let txt = msg.into_text().unwrap_or_default();
            tracing::info!("Client saw outgoing: {}", txt);
            let request: Value = serde_json::from_str(&txt).expect("json request");
            let reply = answer(&request).to_string();
            if writer.send(Message::Text(reply)).await.is_err() {
                break;
            }
        }
    });

    let contexts = bridge
        .query("https://ai.joinhandshake.com/annotations/fellow/task/*/run")
        .await
        .expect("tabs query");
    assert_eq!(contexts.len(), 1);
    assert_eq!(contexts[0].id, 2);
    assert!(contexts[0].is_ready());

    let response = bridge
        .deliver(
            Target::Context(2),
            RelayMessage::new(Action::ShowResult, json!(["Extension Succeeded", 5000])),
        )
        .await
        .expect("message delivered");
    assert_eq!(response.status, Status::Success);
    assert_eq!(response.data, json!(true));

    let closed = bridge.get(9).await;
    assert!(matches!(closed, Err(RelayError::StaleState(_))));

    let runtime = bridge
        .deliver(Target::Runtime, RelayMessage::new(Action::Run, Value::Null))
        .await;
    assert!(matches!(runtime, Err(RelayError::Unsupported(_))));

    let bridge = Arc::new(bridge);
    let page = BridgePage::new(bridge.clone(), 2);
    assert_eq!(page.location().await.expect("location"), HANDSHAKE_PAGE_URL);
    assert_eq!(page.count("button[aria-pressed]").await.expect("count"), 4);

    extension.abort();
}

#[tokio::test]
async fn request_without_client_is_not_found() {
    let bridge = ExtensionBridge::start("127.0.0.1:0")
        .await
        .expect("bridge starts");
    assert!(!bridge.is_client_connected().await);
    let result = bridge.query("https://www.multimango.com/tasks/*").await;
    assert!(matches!(result, Err(RelayError::ResourceNotFound(_))));
}

/// Connects a client that says hello and then never answers.
async fn silent_client(bridge: &ExtensionBridge) -> ClientStream {
    let url = format!("ws://{}", bridge.local_addr());
    let (mut ws, _) = connect_async(url.as_str()).await.expect("ws connect");
    ws.send(Message::Text(r#"{"type":"hello","from":"silent"}"#.into()))
        .await
        .expect("send hello");
    assert!(bridge.wait_for_client(Duration::from_secs(3)).await);
    ws
}

#[tokio::test]
async fn timed_out_sends_leave_nothing_pending() {
    let bridge = Arc::new(
        ExtensionBridge::start("127.0.0.1:0")
            .await
            .expect("bridge starts"),
    );
    let _client = silent_client(&bridge).await;
    let channel = MessageChannel::new(bridge.clone());

    for _ in 0..5 {
        let result = channel
            .send_to_context(2, Action::ShowResult, Value::Null, Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(RelayError::Timeout(_))));
    }

    assert_eq!(bridge.pending_requests(), 0);
}

#[tokio::test]
async fn disconnect_fails_waiting_requests_at_once() {
    let bridge = Arc::new(
        ExtensionBridge::start("127.0.0.1:0")
            .await
            .expect("bridge starts"),
    );
    let client = silent_client(&bridge).await;

    let waiting = {
        let bridge = bridge.clone();
        tokio::spawn(async move {
            bridge
                .request(
                    BridgeCommand::TabsGet { tab_id: 2 },
                    Duration::from_secs(60),
                )
                .await
        })
    };
    assert!(
        wait_for_condition(
            || async { bridge.pending_requests() == 1 },
            Duration::from_secs(3),
            Duration::from_millis(10)
        )
        .await
    );
    drop(client);

    let result = tokio::time::timeout(Duration::from_secs(3), waiting)
        .await
        .expect("request finishes before its own timeout")
        .expect("request task");
    assert!(matches!(result, Err(RelayError::StaleState(_))));
    assert_eq!(bridge.pending_requests(), 0);
}
