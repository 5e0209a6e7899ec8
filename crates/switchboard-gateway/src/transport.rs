//! Transport channel: one duplex WebSocket connection per room
//!
//! The channel never reconnects on its own. Consumers that want resilience
//! watch [`TransportChannel::watch_state`] and call `connect` again.
//! Outbound sends while not connected are dropped and counted, never queued.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use switchboard_core::{ConnectionState, Error, Result};

use crate::protocol::RoomEnvelope;

/// Handshake timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the inbound envelope broadcast
const INBOUND_CAPACITY: usize = 256;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outcome of an outbound send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the connection's writer
    Sent,
    /// Not connected (or not serializable); the message is gone
    Dropped,
}

/// The live half of a connected channel
struct Link {
    generation: u64,
    outbound: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
}

struct Shared {
    room_id: String,
    state_tx: watch::Sender<ConnectionState>,
    inbound_tx: broadcast::Sender<RoomEnvelope>,
    link: Mutex<Option<Link>>,
    last_error: Mutex<Option<Error>>,
    generation: AtomicU64,
    dropped: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn record_error(&self, err: Error) {
        *lock(&self.last_error) = Some(err);
    }

    fn handle_text(&self, text: &str) {
        match RoomEnvelope::decode(text) {
            Ok(envelope) => {
                debug!("Room '{}' received {}", self.room_id, envelope.kind());
                // No subscribers yet
                let _ = self.inbound_tx.send(envelope);
            }
            Err(e) => {
                warn!("Room '{}' dropped malformed frame: {}", self.room_id, e);
                self.record_error(e);
            }
        }
    }

    /// Called by the I/O task when its connection ends. A link that was
    /// already replaced or torn down leaves the channel alone.
    fn link_closed(&self, generation: u64, reason: Option<Error>) {
        let mut link = lock(&self.link);
        if link.as_ref().map(|l| l.generation) != Some(generation) {
            return;
        }
        *link = None;
        drop(link);

        match reason {
            Some(err) => {
                warn!("Room '{}' connection lost: {}", self.room_id, err);
                self.record_error(err);
            }
            None => info!("Room '{}' connection closed by peer", self.room_id),
        }
        self.state_tx.send_replace(ConnectionState::Disconnected);
    }
}

/// A duplex connection for one room. Clones share the same connection.
#[derive(Clone)]
pub struct TransportChannel {
    shared: Arc<Shared>,
}

impl TransportChannel {
    pub fn new(room_id: impl Into<String>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (inbound_tx, _) = broadcast::channel(INBOUND_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                room_id: room_id.into(),
                state_tx,
                inbound_tx,
                link: Mutex::new(None),
                last_error: Mutex::new(None),
                generation: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.shared.room_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// Observe state transitions
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Most recent connection or parse error
    pub fn last_error(&self) -> Option<Error> {
        lock(&self.shared.last_error).clone()
    }

    /// Number of outbound messages dropped because the channel was down
    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Inbound envelopes, in arrival order
    pub fn subscribe(&self) -> broadcast::Receiver<RoomEnvelope> {
        self.shared.inbound_tx.subscribe()
    }

    /// Open the connection. A no-op while connecting or connected.
    ///
    /// A failed handshake leaves the channel Disconnected with the failure
    /// recorded as [`last_error`](Self::last_error).
    pub async fn connect(&self, url: &str) -> Result<()> {
        let claimed = self.shared.state_tx.send_if_modified(|state| {
            if state.is_active() {
                false
            } else {
                *state = ConnectionState::Connecting;
                true
            }
        });
        if !claimed {
            debug!(
                "Room '{}' already {}, ignoring connect",
                self.shared.room_id,
                self.state()
            );
            return Ok(());
        }

        info!("Connecting room '{}' to {}", self.shared.room_id, url);
        let ws = match tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url)).await {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => return Err(self.fail_connect(format!("{}: {}", url, e))),
            Err(_) => return Err(self.fail_connect(format!("{}: handshake timed out", url))),
        };

        // disconnect() may have run while the handshake was in flight
        let promoted = self.shared.state_tx.send_if_modified(|state| {
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Connected;
                true
            } else {
                false
            }
        });
        if !promoted {
            debug!(
                "Room '{}' was torn down during handshake",
                self.shared.room_id
            );
            return Ok(());
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let replaced = lock(&self.shared.link).replace(Link {
            generation,
            outbound,
            cancel: cancel.clone(),
        });
        if let Some(old) = replaced {
            old.cancel.cancel();
        }

        tokio::spawn(run_link(
            self.shared.clone(),
            ws,
            outbound_rx,
            cancel,
            generation,
        ));
        info!("Room '{}' connected", self.shared.room_id);
        Ok(())
    }

    fn fail_connect(&self, message: String) -> Error {
        let err = Error::Connection(message);
        error!("Room '{}' failed to connect: {}", self.shared.room_id, err);
        self.shared.record_error(err.clone());
        self.shared.state_tx.send_if_modified(|state| {
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        });
        err
    }

    /// Serialize and write an envelope if connected; otherwise drop it
    pub fn send(&self, envelope: &RoomEnvelope) -> Delivery {
        if self.state() != ConnectionState::Connected {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Room '{}' is {}, dropping outbound {}",
                self.shared.room_id,
                self.state(),
                envelope.kind()
            );
            return Delivery::Dropped;
        }

        let text = match envelope.encode() {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to serialize {}: {}", envelope.kind(), e);
                return Delivery::Dropped;
            }
        };

        let link = lock(&self.shared.link);
        match link.as_ref() {
            Some(l) if l.outbound.send(Message::text(text)).is_ok() => Delivery::Sent,
            _ => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Room '{}' writer is gone, dropping outbound {}",
                    self.shared.room_id,
                    envelope.kind()
                );
                Delivery::Dropped
            }
        }
    }

    /// Close the connection. Synchronous: the I/O task is cancelled before
    /// this returns and nothing is left scheduled.
    pub fn disconnect(&self) {
        if let Some(link) = lock(&self.shared.link).take() {
            link.cancel.cancel();
        }
        let changed = self.shared.state_tx.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                false
            } else {
                *state = ConnectionState::Disconnected;
                true
            }
        });
        if changed {
            info!("Room '{}' disconnected", self.shared.room_id);
        }
    }
}

async fn run_link(
    shared: Arc<Shared>,
    ws: WsStream,
    mut outbound_rx: mpsc::UnboundedReceiver<Message>,
    cancel: CancellationToken,
    generation: u64,
) {
    let (mut sink, mut stream) = ws.split();

    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                debug!("Room '{}' link {} cancelled", shared.room_id, generation);
                return;
            }
            Some(msg) = outbound_rx.recv() => {
                if let Err(e) = sink.send(msg).await {
                    break Some(Error::Connection(format!("write failed: {}", e)));
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => shared.handle_text(text.as_str()),
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(e) = sink.send(Message::Pong(payload)).await {
                        break Some(Error::Connection(format!("pong failed: {}", e)));
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    debug!("Room '{}' ignoring binary frame", shared.room_id);
                }
                Some(Ok(Message::Close(_))) | None => break None,
                Some(Ok(_)) => {}
                Some(Err(e)) => break Some(Error::Connection(e.to_string())),
            }
        }
    };

    shared.link_closed(generation, reason);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_channel_is_disconnected() {
        let channel = TransportChannel::new("ops");
        assert_eq!(channel.room_id(), "ops");
        assert_eq!(channel.state(), ConnectionState::Disconnected);
        assert!(channel.last_error().is_none());
        assert_eq!(channel.dropped_count(), 0);
    }

    #[test]
    fn test_send_while_disconnected_drops() {
        let channel = TransportChannel::new("ops");
        let env = RoomEnvelope::ParticipantRemoved {
            participant_id: "p1".to_string(),
        };
        assert_eq!(channel.send(&env), Delivery::Dropped);
        assert_eq!(channel.send(&env), Delivery::Dropped);
        assert_eq!(channel.dropped_count(), 2);
    }

    #[tokio::test]
    async fn test_connect_refused_records_error() {
        // Grab a free port, then close it so the connect is refused
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let channel = TransportChannel::new("ops");
        let result = channel.connect(&format!("ws://{}", addr)).await;
        assert!(matches!(result, Err(Error::Connection(_))));
        assert_eq!(channel.state(), ConnectionState::Disconnected);
        assert!(matches!(channel.last_error(), Some(Error::Connection(_))));
    }

    #[test]
    fn test_malformed_frame_records_parse_error() {
        let channel = TransportChannel::new("ops");
        let mut rx = channel.subscribe();
        channel.shared.handle_text("{broken");
        assert!(matches!(channel.last_error(), Some(Error::Parse(_))));

        channel
            .shared
            .handle_text(r#"{"type":"participant_removed","participant_id":"p1"}"#);
        assert!(matches!(
            rx.try_recv(),
            Ok(RoomEnvelope::ParticipantRemoved { .. })
        ));
    }

    #[test]
    fn test_disconnect_when_idle_is_noop() {
        let channel = TransportChannel::new("ops");
        channel.disconnect();
        assert_eq!(channel.state(), ConnectionState::Disconnected);
    }
}
