//! Connection management - wrapper around one live duplex socket
//!
//! Each connection owns a spawned task that drives the socket: inbound frame
//! classification, outbound writes, and the heartbeat timers all live on that
//! single task, so per-connection state needs no locking beyond the shared
//! handle itself. The registry holds the owning `Arc`; the connection keeps a
//! `Weak` back-reference for subscribe/broadcast/close notifications.

use crate::config::HeartbeatConfig;
use crate::dispatch::ConnectContext;
use crate::envelope::{Envelope, Inbound, Payload, CLOSE_EVENT, HEARTBEAT_EVENT};
use crate::errors::HubResult;
use crate::registry::{EmitOptions, RegistryEvent, SocketRegistry};
use axum::extract::ws::{CloseFrame, Message};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, RwLock};
use tokio::time::{self, Sleep};
use tracing::debug;
use uuid::Uuid;

/// WebSocket close codes used by the hub.
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Server going away; used for shutdown-time closures.
    pub const GOING_AWAY: u16 = 1001;
    /// Server-side error while handling the connection.
    pub const ERROR: u16 = 1011;
}

/// Unique identifier for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake complete, events flow both ways.
    Open,
    /// Close initiated, no further sends attempted.
    Closing,
    /// Terminal; socket released, registry entry removed.
    Closed,
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

const ST_OPEN: u8 = 0;
const ST_CLOSING: u8 = 1;
const ST_CLOSED: u8 = 2;

/// Atomic lifecycle cell. The CAS transitions guarantee that close initiation
/// and terminal cleanup each happen exactly once.
#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(ST_OPEN))
    }

    fn get(&self) -> ConnectionState {
        match self.0.load(Ordering::Acquire) {
            ST_OPEN => ConnectionState::Open,
            ST_CLOSING => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    /// `Open -> Closing`; true only for the caller that won the transition.
    fn begin_close(&self) -> bool {
        self.0
            .compare_exchange(ST_OPEN, ST_CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// `* -> Closed`; true only the first time.
    fn set_closed(&self) -> bool {
        self.0.swap(ST_CLOSED, Ordering::AcqRel) != ST_CLOSED
    }
}

enum Outbound {
    Frame(Message),
    Close(Option<CloseFrame<'static>>),
}

type EventCallback = Arc<dyn Fn(Payload) + Send + Sync>;

/// One live duplex socket.
pub struct Connection {
    id: ConnectionId,
    state: StateCell,
    topics: RwLock<HashSet<String>>,
    outbound: mpsc::UnboundedSender<Outbound>,
    context: Arc<ConnectContext>,
    registry: Weak<SocketRegistry>,
    slots: RwLock<HashMap<String, Vec<EventCallback>>>,
}

impl Connection {
    /// Spawn the socket-driving task and return the shared handle. The
    /// registry is the only caller.
    pub(crate) fn spawn<S>(
        socket: S,
        context: Arc<ConnectContext>,
        registry: Weak<SocketRegistry>,
        heartbeat: Option<HeartbeatConfig>,
    ) -> Arc<Self>
    where
        S: Stream<Item = Result<Message, axum::Error>>
            + Sink<Message, Error = axum::Error>
            + Send
            + Unpin
            + 'static,
    {
        let (outbound, commands) = mpsc::unbounded_channel();
        let connection = Arc::new(Self {
            id: ConnectionId::new(),
            state: StateCell::new(),
            topics: RwLock::new(HashSet::new()),
            outbound,
            context,
            registry,
            slots: RwLock::new(HashMap::new()),
        });
        tokio::spawn(run_socket(connection.clone(), socket, commands, heartbeat));
        connection
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn is_open(&self) -> bool {
        self.state.get().is_open()
    }

    /// Non-owning back-reference to the upgrading request; used by broadcast
    /// filters, never for lifecycle decisions.
    pub fn context(&self) -> &ConnectContext {
        &self.context
    }

    /// Snapshot of the connection's topic memberships.
    pub async fn topics(&self) -> HashSet<String> {
        self.topics.read().await.clone()
    }

    /// Register a callback slot for a named inbound event.
    pub async fn on<F>(&self, event: &str, callback: F)
    where
        F: Fn(Payload) + Send + Sync + 'static,
    {
        self.slots
            .write()
            .await
            .entry(event.to_string())
            .or_default()
            .push(Arc::new(callback));
    }

    /// Serialize an envelope and queue it for the socket. Silent no-op when
    /// the connection is not open; writes preserve FIFO order per connection.
    pub fn send<T: Serialize>(&self, event: &str, data: &T) -> HubResult<()> {
        if !self.state.get().is_open() {
            return Ok(());
        }
        let message = Envelope::new(event, serde_json::to_value(data)?).to_message()?;
        let _ = self.outbound.send(Outbound::Frame(message));
        Ok(())
    }

    /// Queue a pre-encoded frame; used by the registry's broadcast loop.
    pub(crate) fn send_frame(&self, message: Message) -> bool {
        if !self.state.get().is_open() {
            return false;
        }
        self.outbound.send(Outbound::Frame(message)).is_ok()
    }

    /// Join a topic. The registry's index is updated before this returns;
    /// joining after the connection has left the live set is a no-op.
    pub async fn subscribe(&self, topic: &str) {
        let admitted = match self.registry.upgrade() {
            Some(registry) => registry.subscribe(topic, self.id).await,
            None => false,
        };
        if admitted {
            self.topics.write().await.insert(topic.to_string());
        }
    }

    /// Leave a topic; unknown topics are a no-op.
    pub async fn unsubscribe(&self, topic: &str) {
        self.topics.write().await.remove(topic);
        if let Some(registry) = self.registry.upgrade() {
            registry.unsubscribe(topic, self.id).await;
        }
    }

    /// Broadcast through the registry. The sender is always excluded: it
    /// already knows it sent the message.
    pub async fn broadcast<T: Serialize>(
        &self,
        event: &str,
        data: &T,
        mut options: EmitOptions,
    ) -> HubResult<usize> {
        options.except = Some(self.id);
        match self.registry.upgrade() {
            Some(registry) => registry.emit_with(event, data, options).await,
            None => Ok(0),
        }
    }

    /// Initiate a graceful close; idempotent.
    pub fn close(&self, code: Option<u16>, reason: Option<String>) {
        if !self.state.begin_close() {
            return;
        }
        let frame = code.map(|code| CloseFrame {
            code,
            reason: reason.unwrap_or_default().into(),
        });
        let _ = self.outbound.send(Outbound::Close(frame));
    }

    /// Run local callback slots, then surface the event upstream tagged with
    /// this connection.
    async fn dispatch(&self, inbound: Inbound) {
        {
            let slots = self.slots.read().await;
            if let Some(callbacks) = slots.get(&inbound.event) {
                for callback in callbacks {
                    callback(inbound.payload.clone());
                }
            }
        }
        if let Some(registry) = self.registry.upgrade() {
            registry
                .notify(RegistryEvent::Message {
                    id: self.id,
                    event: inbound.event,
                    payload: inbound.payload,
                })
                .await;
        }
    }

    /// Terminal cleanup; runs exactly once no matter which side closed.
    async fn finish(connection: &Arc<Connection>) {
        if !connection.state.set_closed() {
            return;
        }
        if let Some(registry) = connection.registry.upgrade() {
            registry.remove(connection.id).await;
        }
        let callbacks = {
            let mut slots = connection.slots.write().await;
            let callbacks = slots.remove(CLOSE_EVENT).unwrap_or_default();
            // dropping the remaining slots breaks Arc cycles with user
            // closures that captured the connection
            slots.clear();
            callbacks
        };
        for callback in &callbacks {
            callback(Payload::Json(Value::Null));
        }
        debug!(id = %connection.id, "connection closed");
    }
}

/// The socket-driving task: inbound frames, outbound commands, and the
/// heartbeat interval/allowance pair all race in one select loop.
async fn run_socket<S>(
    connection: Arc<Connection>,
    mut socket: S,
    mut commands: mpsc::UnboundedReceiver<Outbound>,
    heartbeat: Option<HeartbeatConfig>,
) where
    S: Stream<Item = Result<Message, axum::Error>>
        + Sink<Message, Error = axum::Error>
        + Send
        + Unpin
        + 'static,
{
    let mut ticker = heartbeat
        .as_ref()
        .map(|h| time::interval_at(time::Instant::now() + h.interval, h.interval));
    let mut deadline: Option<Pin<Box<Sleep>>> = None;

    loop {
        tokio::select! {
            frame = socket.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let inbound = Inbound::from_text(&text);
                    if heartbeat.is_some() && inbound.event == HEARTBEAT_EVENT {
                        // any heartbeat from the peer proves liveness
                        deadline = None;
                        if inbound.payload.as_str() == Some("ping")
                            && socket.send(Envelope::heartbeat("pong")).await.is_err()
                        {
                            break;
                        }
                    }
                    connection.dispatch(inbound).await;
                }
                Some(Ok(Message::Binary(bytes))) => {
                    connection.dispatch(Inbound::from_binary(bytes)).await;
                }
                Some(Ok(Message::Close(_))) => {
                    connection.state.begin_close();
                    break;
                }
                // transport-level ping/pong frames are handled by the stack
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    debug!(id = %connection.id, "websocket read error: {}", error);
                    break;
                }
                None => break,
            },
            command = commands.recv() => match command {
                Some(Outbound::Frame(message)) => {
                    if socket.send(message).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Close(frame)) => {
                    let _ = socket.send(Message::Close(frame)).await;
                    break;
                }
                None => break,
            },
            _ = tick(&mut ticker), if ticker.is_some() => {
                if socket.send(Envelope::heartbeat("ping")).await.is_err() {
                    break;
                }
                // replace any still-pending allowance timer: only one timeout
                // timer is ever live per connection
                let allowance = heartbeat.as_ref().map(|h| h.allowance).unwrap_or_default();
                deadline = Some(Box::pin(time::sleep(allowance)));
            },
            _ = expired(&mut deadline), if deadline.is_some() => {
                debug!(id = %connection.id, "heartbeat allowance elapsed, evicting");
                connection.state.begin_close();
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::NORMAL,
                        reason: "heartbeat timeout".into(),
                    })))
                    .await;
                break;
            },
        }
    }

    Connection::finish(&connection).await;
}

async fn tick(ticker: &mut Option<time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn expired(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{fake_socket, test_context};
    use super::*;
    use crate::config::HubConfig;
    use crate::envelope::{BUFFER_EVENT, ERROR_EVENT};
    use std::time::Duration;

    fn heartbeat_config() -> HubConfig {
        HubConfig::new().with_heartbeat(Duration::from_millis(50), Duration::from_millis(20))
    }

    async fn drained(registry: &Arc<SocketRegistry>) -> bool {
        for _ in 0..100 {
            if registry.connection_count().await == 0 {
                return true;
            }
            time::sleep(Duration::from_millis(1)).await;
        }
        false
    }

    #[tokio::test(start_paused = true)]
    async fn unresponsive_peer_is_evicted_within_allowance() {
        let registry = SocketRegistry::new(&heartbeat_config());
        let (socket, mut peer) = fake_socket();
        let connection = registry
            .create_connection(socket, test_context())
            .await
            .unwrap();

        let ping = peer.sent.recv().await.unwrap();
        assert_eq!(ping, Envelope::heartbeat("ping"));

        // no reply: the allowance elapses and the eviction close frame follows
        match peer.sent.recv().await.unwrap() {
            Message::Close(Some(frame)) => {
                assert_eq!(frame.code, close_code::NORMAL);
                assert_eq!(frame.reason, "heartbeat timeout");
            }
            other => panic!("expected close frame, got {:?}", other),
        }

        assert!(drained(&registry).await);
        assert!(!connection.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn responsive_peer_is_never_evicted() {
        let registry = SocketRegistry::new(&heartbeat_config());
        let (socket, mut peer) = fake_socket();
        let connection = registry
            .create_connection(socket, test_context())
            .await
            .unwrap();

        for _ in 0..3 {
            let ping = peer.sent.recv().await.unwrap();
            assert_eq!(ping, Envelope::heartbeat("ping"));
            peer.inject.send(Ok(Envelope::heartbeat("pong"))).unwrap();
        }

        assert!(connection.is_open());
        assert_eq!(registry.connection_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn peer_ping_gets_a_pong_reply() {
        let registry = SocketRegistry::new(&heartbeat_config());
        let (socket, mut peer) = fake_socket();
        let _connection = registry
            .create_connection(socket, test_context())
            .await
            .unwrap();

        peer.inject.send(Ok(Envelope::heartbeat("ping"))).unwrap();
        let reply = peer.sent.recv().await.unwrap();
        assert_eq!(reply, Envelope::heartbeat("pong"));
    }

    #[tokio::test]
    async fn malformed_text_yields_one_error_event_and_stays_open() {
        let registry = SocketRegistry::new(&HubConfig::default());
        let (socket, mut peer) = fake_socket();
        let connection = registry
            .create_connection(socket, test_context())
            .await
            .unwrap();

        let (seen_tx, mut seen) = mpsc::unbounded_channel();
        connection
            .on(ERROR_EVENT, move |payload| {
                let _ = seen_tx.send(payload);
            })
            .await;

        peer.inject
            .send(Ok(Message::Text("not json".to_string())))
            .unwrap();

        let payload = seen.recv().await.unwrap();
        assert_eq!(payload, Payload::Text("not json".to_string()));
        assert!(seen.try_recv().is_err());
        assert!(connection.is_open());

        // the connection still delivers after the bad frame
        connection.send("ok", &1).unwrap();
        assert_eq!(
            peer.sent.recv().await.unwrap(),
            Message::Text(r#"{"event":"ok","data":1}"#.to_string())
        );
    }

    #[tokio::test]
    async fn binary_frames_dispatch_buffer_events_locally_and_upstream() {
        let registry = SocketRegistry::new(&HubConfig::default());
        let (socket, peer) = fake_socket();
        let connection = registry
            .create_connection(socket, test_context())
            .await
            .unwrap();

        let (seen_tx, mut seen) = mpsc::unbounded_channel();
        connection
            .on(BUFFER_EVENT, move |payload| {
                let _ = seen_tx.send(payload);
            })
            .await;

        let (events_tx, mut events) = mpsc::unbounded_channel();
        registry
            .on_event(move |event| {
                if let RegistryEvent::Message { .. } = event {
                    let _ = events_tx.send(event.clone());
                }
            })
            .await;

        peer.inject
            .send(Ok(Message::Binary(vec![1, 2, 3])))
            .unwrap();

        assert_eq!(
            seen.recv().await.unwrap(),
            Payload::Binary(vec![1, 2, 3])
        );
        match events.recv().await.unwrap() {
            RegistryEvent::Message { id, event, payload } => {
                assert_eq!(id, connection.id());
                assert_eq!(event, BUFFER_EVENT);
                assert_eq!(payload, Payload::Binary(vec![1, 2, 3]));
            }
            other => panic!("expected message event, got {:?}", other),
        }
        assert!(connection.is_open());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let registry = SocketRegistry::new(&HubConfig::default());
        let (socket, mut peer) = fake_socket();
        let connection = registry
            .create_connection(socket, test_context())
            .await
            .unwrap();

        connection.close(Some(close_code::NORMAL), Some("bye".to_string()));
        connection.close(Some(close_code::NORMAL), Some("bye again".to_string()));

        match peer.sent.recv().await.unwrap() {
            Message::Close(Some(frame)) => {
                assert_eq!(frame.code, close_code::NORMAL);
                assert_eq!(frame.reason, "bye");
            }
            other => panic!("expected close frame, got {:?}", other),
        }
        // exactly one close frame: the channel ends after the task drops it
        assert!(peer.sent.recv().await.is_none());

        assert!(drained(&registry).await);
        assert_eq!(connection.state(), ConnectionState::Closed);
        // a third close after Closed is still a no-op
        connection.close(None, None);
    }

    #[tokio::test]
    async fn remote_close_runs_cleanup_and_close_slot_once() {
        let registry = SocketRegistry::new(&HubConfig::default());
        let (socket, peer) = fake_socket();
        let connection = registry
            .create_connection(socket, test_context())
            .await
            .unwrap();
        connection.subscribe("room1").await;

        let (closed_tx, mut closed) = mpsc::unbounded_channel();
        connection
            .on(CLOSE_EVENT, move |_| {
                let _ = closed_tx.send(());
            })
            .await;

        peer.inject.send(Ok(Message::Close(None))).unwrap();

        closed.recv().await.unwrap();
        assert!(drained(&registry).await);
        assert!(registry.topics().await.is_empty());
        assert!(closed.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_after_close_is_a_silent_noop() {
        let registry = SocketRegistry::new(&HubConfig::default());
        let (socket, mut peer) = fake_socket();
        let connection = registry
            .create_connection(socket, test_context())
            .await
            .unwrap();

        connection.close(None, None);
        assert!(connection.send("late", &"frame").is_ok());

        match peer.sent.recv().await.unwrap() {
            Message::Close(None) => {}
            other => panic!("expected bare close frame, got {:?}", other),
        }
        assert!(peer.sent.recv().await.is_none());
    }
}
