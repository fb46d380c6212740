//! Realtime Adapter Integration Tests
//!
//! Runs the realtime client against a local Phoenix-speaking WebSocket
//! server and routes its changes through the router.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use dashboard_feed::{
    ChangeFeed, ChannelRequest, ChannelStatus, Credentials, EventCallbacks, FeedError,
    RealtimeClient, RealtimeClientConfig, RealtimeRouter, StreamId, SubscriptionError,
};

/// How the fake server answers joins.
#[derive(Clone, Copy)]
enum JoinBehavior {
    /// Reply ok, then push one `decision` insert on the channel.
    AcceptAndPush,
    /// Reply with an error status.
    Reject,
    /// Never reply.
    Ignore,
    /// Reply ok, then close the socket.
    AcceptThenHangUp,
}

/// Start a one-connection Phoenix server; every client frame is forwarded
/// to the returned receiver.
async fn spawn_server(behavior: JoinBehavior) -> (String, mpsc::UnboundedReceiver<Value>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let (mut write, mut read) = ws.split();

        while let Some(Ok(msg)) = read.next().await {
            let Message::Text(text) = msg else { continue };
            let frame: Value = serde_json::from_str(&text).unwrap();
            let _ = seen_tx.send(frame.clone());

            let topic = frame["topic"].as_str().unwrap_or_default().to_string();
            let msg_ref = frame["ref"].clone();
            let reply = |status: &str, response: Value| {
                Message::Text(
                    json!({
                        "topic": topic,
                        "event": "phx_reply",
                        "payload": {"status": status, "response": response},
                        "ref": msg_ref,
                        "join_ref": frame["join_ref"],
                    })
                    .to_string()
                    .into(),
                )
            };

            match frame["event"].as_str() {
                Some("phx_join") => match behavior {
                    JoinBehavior::AcceptAndPush => {
                        write.send(reply("ok", json!({}))).await.unwrap();
                        let change = json!({
                            "topic": topic,
                            "event": "postgres_changes",
                            "payload": {"ids": [1], "data": {
                                "schema": "public",
                                "table": "events",
                                "type": "INSERT",
                                "commit_timestamp": "2026-01-05T14:30:00Z",
                                "record": {
                                    "id": 1,
                                    "session_id": "s1",
                                    "event_type": "decision",
                                    "action": "SELL"
                                }
                            }},
                            "ref": null,
                        });
                        write
                            .send(Message::Text(change.to_string().into()))
                            .await
                            .unwrap();
                    }
                    JoinBehavior::Reject => {
                        write
                            .send(reply("error", json!({"reason": "unauthorized"})))
                            .await
                            .unwrap();
                    }
                    JoinBehavior::Ignore => {}
                    JoinBehavior::AcceptThenHangUp => {
                        write.send(reply("ok", json!({}))).await.unwrap();
                        let _ = write.send(Message::Close(None)).await;
                        return;
                    }
                },
                Some("phx_leave" | "heartbeat") => {
                    write.send(reply("ok", json!({}))).await.unwrap();
                }
                _ => {}
            }
        }
    });

    (
        format!("ws://{addr}/realtime/v1/websocket?apikey=anon&vsn=1.0.0"),
        seen_rx,
    )
}

async fn connect(url: String) -> Arc<RealtimeClient> {
    let mut config = RealtimeClientConfig::new(url, Credentials::new("anon".to_string()));
    config.join_timeout = Duration::from_millis(300);
    RealtimeClient::connect(config, CancellationToken::new())
        .await
        .unwrap()
}

async fn next_frame(seen: &mut mpsc::UnboundedReceiver<Value>, event: &str) -> Value {
    timeout(Duration::from_secs(2), async {
        loop {
            let frame = seen.recv().await.expect("server stopped");
            if frame["event"] == event {
                return frame;
            }
        }
    })
    .await
    .expect("timed out waiting for frame")
}

#[tokio::test]
async fn routes_live_changes_and_leaves_on_close() {
    let (url, mut seen) = spawn_server(JoinBehavior::AcceptAndPush).await;
    let client = connect(url).await;
    let router = RealtimeRouter::new(client.clone(), StreamId::new("default"));

    let decisions = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&decisions);
    let handle = router.open_event_subscription(
        Some(StreamId::new("s1")),
        EventCallbacks::new().on_decision(move |record| {
            assert_eq!(record.field("action"), Some(&json!("SELL")));
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );
    handle.activated().await.unwrap();

    let join = next_frame(&mut seen, "phx_join").await;
    assert!(join["topic"].as_str().unwrap().starts_with("realtime:events:s1"));
    assert_eq!(join["payload"]["access_token"], "anon");
    let binding = &join["payload"]["config"]["postgres_changes"][0];
    assert_eq!(binding["event"], "INSERT");
    assert_eq!(binding["table"], "events");
    assert_eq!(binding["filter"], "session_id=eq.s1");

    timeout(Duration::from_secs(2), async {
        while decisions.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("decision not routed");

    router.close_subscription(&handle).await.unwrap();
    let leave = next_frame(&mut seen, "phx_leave").await;
    assert_eq!(leave["topic"], join["topic"]);
    assert_eq!(client.channel_count(), 0);
}

#[tokio::test]
async fn rejected_join_fails_activation() {
    let (url, _seen) = spawn_server(JoinBehavior::Reject).await;
    let client = connect(url).await;
    let router = RealtimeRouter::new(client.clone(), StreamId::new("default"));

    let handle = router.open_event_subscription(None, EventCallbacks::new());
    let err = handle.activated().await.unwrap_err();

    assert!(matches!(
        err,
        SubscriptionError::Activation { ref reason, .. } if reason.contains("unauthorized")
    ));
    assert_eq!(client.channel_count(), 0);
    router.close_subscription(&handle).await.unwrap();
}

#[tokio::test]
async fn unanswered_join_times_out() {
    let (url, _seen) = spawn_server(JoinBehavior::Ignore).await;
    let client = connect(url).await;

    let err = client
        .subscribe(ChannelRequest::new(1, "events:x"))
        .await
        .unwrap_err();

    assert!(matches!(err, FeedError::JoinTimeout(ref name) if name == "events:x"));
    assert_eq!(client.channel_count(), 0);
}

#[tokio::test]
async fn server_hang_up_ends_streams() {
    let (url, _seen) = spawn_server(JoinBehavior::AcceptThenHangUp).await;
    let client = connect(url).await;
    let router = RealtimeRouter::new(client.clone(), StreamId::new("default"));

    let handle = router.open_event_subscription(None, EventCallbacks::new());
    handle.activated().await.unwrap();

    timeout(Duration::from_secs(2), async {
        while handle.status() != ChannelStatus::Ended {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("stream did not end");
    assert!(!client.is_connected());

    let err = client
        .subscribe(ChannelRequest::new(99, "events:late"))
        .await
        .unwrap_err();
    assert!(matches!(err, FeedError::Disconnected));

    // The channel is already gone server-side; close settles locally.
    router.close_subscription(&handle).await.unwrap();
    assert_eq!(handle.status(), ChannelStatus::Closed);
}
