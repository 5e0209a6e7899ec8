//! End-to-end room channel tests against a loopback WebSocket server

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use switchboard_core::{
    ConnectionState, Error, Notification, NotificationBus, Topic, ToolEvent, ToolEventType,
};
use switchboard_gateway::{
    Delivery, EventEmitter, RoomEnvelope, ToolContext, ToolIntentStore, TransportChannel,
    CommandRouter, register_builtin_handlers,
};

enum ToClient {
    Text(String),
    Close,
}

#[derive(Debug)]
enum Seen {
    Text(String),
    Closed,
}

/// Loopback room server. The first accepted connection is scripted through
/// `to_client`; everything any connection receives lands in `seen`.
struct LoopbackServer {
    url: String,
    accepted: Arc<AtomicUsize>,
    to_client: mpsc::UnboundedSender<ToClient>,
    seen: mpsc::UnboundedReceiver<Seen>,
}

impl LoopbackServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/rooms/ops", listener.local_addr().unwrap());
        let accepted = Arc::new(AtomicUsize::new(0));
        let (to_client, script) = mpsc::unbounded_channel();
        let (seen_tx, seen) = mpsc::unbounded_channel();

        let counter = accepted.clone();
        tokio::spawn(async move {
            let mut script = Some(script);
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let script = script.take().unwrap_or_else(|| mpsc::unbounded_channel().1);
                tokio::spawn(serve(stream, script, seen_tx.clone()));
            }
        });

        Self {
            url,
            accepted,
            to_client,
            seen,
        }
    }

    fn push(&self, text: &str) {
        self.to_client.send(ToClient::Text(text.to_string())).unwrap();
    }

    fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    async fn next_seen(&mut self) -> Seen {
        tokio::time::timeout(Duration::from_secs(5), self.seen.recv())
            .await
            .expect("server saw nothing")
            .expect("server gone")
    }

    /// Collect whatever arrives within `window`
    async fn drain_seen(&mut self, window: Duration) -> Vec<Seen> {
        let mut out = Vec::new();
        while let Ok(Some(seen)) = tokio::time::timeout(window, self.seen.recv()).await {
            out.push(seen);
        }
        out
    }
}

async fn serve(
    stream: tokio::net::TcpStream,
    mut script: mpsc::UnboundedReceiver<ToClient>,
    seen: mpsc::UnboundedSender<Seen>,
) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            Some(cmd) = script.recv() => match cmd {
                ToClient::Text(text) => {
                    if sink.send(Message::text(text)).await.is_err() {
                        break;
                    }
                }
                ToClient::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let _ = seen.send(Seen::Text(text.as_str().to_string()));
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {
                    let _ = seen.send(Seen::Closed);
                    break;
                }
                Some(Ok(_)) => {}
            }
        }
    }
}

/// Poll until `check` holds, for up to five seconds
async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_connect_is_idempotent() {
    let server = LoopbackServer::start().await;
    let channel = TransportChannel::new("ops");

    let (a, b) = tokio::join!(channel.connect(&server.url), channel.connect(&server.url));
    a.unwrap();
    b.unwrap();
    channel.connect(&server.url).await.unwrap();

    assert_eq!(channel.state(), ConnectionState::Connected);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.accepted(), 1);
    channel.disconnect();
}

#[tokio::test]
async fn test_command_before_handler_is_handled_once() {
    let mut server = LoopbackServer::start().await;
    let channel = TransportChannel::new("ops");
    channel.connect(&server.url).await.unwrap();

    let router = CommandRouter::new();
    let _attachment = router.attach(&channel);

    server.push(
        r#"{"type":"tool_command","id":"cmd-1","action":"create_task","parameters":{"title":"Fix bug"}}"#,
    );
    eventually(|| router.pending_len() == 1).await;

    let bus = NotificationBus::new();
    let mut tasks = bus.subscribe(&[Topic::TaskCreate]);
    let ctx = ToolContext {
        intents: Arc::new(ToolIntentStore::new()),
        bus: bus.clone(),
        emitter: EventEmitter::new(channel.clone(), Some("agent-7".to_string())),
    };
    register_builtin_handlers(&router, &ctx).await;
    assert_eq!(router.pending_len(), 0);

    match tasks.try_recv() {
        Some(Notification::TaskCreate(draft)) => assert_eq!(draft.title, "Fix bug"),
        other => panic!("expected task-create, got {:?}", other),
    }
    assert!(tasks.try_recv().is_none());

    let acks: Vec<ToolEvent> = server
        .drain_seen(Duration::from_millis(300))
        .await
        .into_iter()
        .filter_map(|seen| match seen {
            Seen::Text(text) => match RoomEnvelope::decode(&text) {
                Ok(RoomEnvelope::ToolEvent(event)) => Some(event),
                _ => None,
            },
            Seen::Closed => None,
        })
        .collect();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].event_type, ToolEventType::DataChanged);
    assert_eq!(acks[0].correlation_id.as_deref(), Some("cmd-1"));
    assert_eq!(acks[0].room_id.as_deref(), Some("ops"));

    channel.disconnect();
}

#[tokio::test]
async fn test_ack_wire_format_is_camel_case() {
    let mut server = LoopbackServer::start().await;
    let channel = TransportChannel::new("ops");
    channel.connect(&server.url).await.unwrap();

    let router = CommandRouter::new();
    let _attachment = router.attach(&channel);
    let ctx = ToolContext {
        intents: Arc::new(ToolIntentStore::new()),
        bus: NotificationBus::new(),
        emitter: EventEmitter::new(channel.clone(), None),
    };
    register_builtin_handlers(&router, &ctx).await;

    server.push(r#"{"type":"tool_command","action":"open_panel","parameters":{"panel":"metrics"}}"#);
    let Seen::Text(text) = server.next_seen().await else {
        panic!("expected an acknowledgement");
    };
    let raw: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(raw["type"], "tool_event");
    assert_eq!(raw["toolType"], "workspace");
    assert_eq!(raw["eventType"], "state_changed");
    assert_eq!(raw["correlationId"], "open_panel");

    channel.disconnect();
}

#[tokio::test]
async fn test_malformed_frame_keeps_connection() {
    let server = LoopbackServer::start().await;
    let channel = TransportChannel::new("ops");
    let mut inbound = channel.subscribe();
    channel.connect(&server.url).await.unwrap();

    server.push("{not json");
    server.push(r#"{"type":"participant_removed","participant_id":"p1"}"#);

    let envelope = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        envelope,
        RoomEnvelope::ParticipantRemoved {
            participant_id: "p1".to_string()
        }
    );
    assert_eq!(channel.state(), ConnectionState::Connected);
    assert!(matches!(channel.last_error(), Some(Error::Parse(_))));

    channel.disconnect();
}

#[tokio::test]
async fn test_disconnect_closes_and_drops_later_sends() {
    let mut server = LoopbackServer::start().await;
    let channel = TransportChannel::new("ops");
    channel.connect(&server.url).await.unwrap();

    channel.disconnect();
    assert_eq!(channel.state(), ConnectionState::Disconnected);
    assert!(matches!(server.next_seen().await, Seen::Closed));

    let env = RoomEnvelope::ParticipantRemoved {
        participant_id: "p1".to_string(),
    };
    assert_eq!(channel.send(&env), Delivery::Dropped);
    assert_eq!(channel.dropped_count(), 1);
}

#[tokio::test]
async fn test_peer_close_marks_disconnected() {
    let server = LoopbackServer::start().await;
    let channel = TransportChannel::new("ops");
    channel.connect(&server.url).await.unwrap();

    server.to_client.send(ToClient::Close).unwrap();
    eventually(|| channel.state() == ConnectionState::Disconnected).await;

    // No automatic reconnect
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.accepted(), 1);
    assert_eq!(channel.state(), ConnectionState::Disconnected);
}
