//! Connection registry and topic broadcast
//!
//! The registry is the authoritative set of live connections plus the topic
//! index over them. Broadcasts serialize the envelope once and fan the frame
//! out to each selected connection's outbound queue; a slow or closed
//! receiver never blocks delivery to the others.

use crate::config::{HeartbeatConfig, HubConfig};
use crate::connection::{close_code, Connection, ConnectionId};
use crate::dispatch::ConnectContext;
use crate::envelope::{Envelope, Payload};
use crate::errors::{HubError, HubResult};
use crate::topic::TopicIndex;
use axum::extract::ws::Message;
use futures_util::{Sink, Stream};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Decides whether a connection's topic set matches a broadcast's requested
/// topics. The default policy matches on any intersection.
pub type TopicComparator = Arc<dyn Fn(&HashSet<String>, &[String]) -> bool + Send + Sync>;

/// Per-recipient predicate applied after topic selection.
pub type ConnectionFilter = Arc<dyn Fn(&ConnectContext, &Connection) -> bool + Send + Sync>;

/// Registry lifecycle notifications surfaced to hub-level listeners.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Connected(ConnectionId),
    Disconnected(ConnectionId),
    /// An inbound frame, after per-connection callback slots have run.
    Message {
        id: ConnectionId,
        event: String,
        payload: Payload,
    },
}

type EventListener = Arc<dyn Fn(&RegistryEvent) + Send + Sync>;

/// Recipient selection for a broadcast.
#[derive(Clone, Default)]
pub struct EmitOptions {
    /// Empty means every live connection.
    pub topics: Vec<String>,
    /// Connection to skip, typically the sender.
    pub except: Option<ConnectionId>,
    /// Applied to each candidate after topic selection.
    pub filter: Option<ConnectionFilter>,
}

impl EmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_topic(topic: impl Into<String>) -> Self {
        Self {
            topics: vec![topic.into()],
            ..Self::default()
        }
    }

    pub fn to_topics(topics: Vec<String>) -> Self {
        Self {
            topics,
            ..Self::default()
        }
    }

    pub fn except(mut self, id: ConnectionId) -> Self {
        self.except = Some(id);
        self
    }

    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&ConnectContext, &Connection) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }
}

/// The live map and the closing flag share one lock so that shutdown can
/// atomically stop the set from growing.
#[derive(Default)]
struct LiveSet {
    connections: HashMap<ConnectionId, Arc<Connection>>,
    closing: bool,
}

/// Registry of live connections.
pub struct SocketRegistry {
    live: RwLock<LiveSet>,
    topics: RwLock<TopicIndex>,
    heartbeat: Option<HeartbeatConfig>,
    comparator: Option<TopicComparator>,
    listeners: RwLock<Vec<EventListener>>,
}

impl SocketRegistry {
    pub fn new(config: &HubConfig) -> Arc<Self> {
        Arc::new(Self {
            live: RwLock::new(LiveSet::default()),
            topics: RwLock::new(TopicIndex::new()),
            heartbeat: config.heartbeat,
            comparator: config.topic_comparator.clone(),
            listeners: RwLock::new(Vec::new()),
        })
    }

    /// Wrap an upgraded socket in a connection and admit it to the live set.
    /// Once shutdown has begun, the socket is closed with "going away" and
    /// admission fails instead.
    pub async fn create_connection<S>(
        self: &Arc<Self>,
        socket: S,
        context: Arc<ConnectContext>,
    ) -> HubResult<Arc<Connection>>
    where
        S: Stream<Item = Result<Message, axum::Error>>
            + Sink<Message, Error = axum::Error>
            + Send
            + Unpin
            + 'static,
    {
        let connection =
            Connection::spawn(socket, context, Arc::downgrade(self), self.heartbeat);
        {
            let mut live = self.live.write().await;
            if live.closing {
                drop(live);
                connection.close(
                    Some(close_code::GOING_AWAY),
                    Some("server going away".to_string()),
                );
                return Err(HubError::ShuttingDown);
            }
            live.connections.insert(connection.id(), connection.clone());
        }
        debug!(id = %connection.id(), path = %connection.context().path(), "websocket connection registered");
        self.notify(RegistryEvent::Connected(connection.id())).await;
        Ok(connection)
    }

    /// Drop a connection from the live set and the topic index. Called by the
    /// connection's own task during terminal cleanup.
    pub(crate) async fn remove(&self, id: ConnectionId) {
        let removed = self.live.write().await.connections.remove(&id);
        if removed.is_some() {
            let left = self.topics.write().await.purge(id);
            debug!(%id, topics_left = left.len(), "websocket connection deregistered");
            self.notify(RegistryEvent::Disconnected(id)).await;
        }
    }

    /// Add a membership, provided the connection is still live. Holding the
    /// live guard across the index write orders this against `remove`'s
    /// purge, so a closing connection can never resurrect an index entry.
    pub(crate) async fn subscribe(&self, topic: &str, id: ConnectionId) -> bool {
        let live = self.live.read().await;
        if !live.connections.contains_key(&id) {
            return false;
        }
        self.topics.write().await.subscribe(topic, id);
        true
    }

    pub(crate) async fn unsubscribe(&self, topic: &str, id: ConnectionId) {
        self.topics.write().await.unsubscribe(topic, id);
    }

    /// Broadcast an event to every live connection.
    pub async fn emit<T: Serialize>(&self, event: &str, data: &T) -> HubResult<usize> {
        self.emit_with(event, data, EmitOptions::default()).await
    }

    /// Broadcast an event to one topic's subscribers.
    pub async fn emit_to_topic<T: Serialize>(
        &self,
        topic: &str,
        event: &str,
        data: &T,
    ) -> HubResult<usize> {
        self.emit_with(event, data, EmitOptions::to_topic(topic)).await
    }

    /// Send an envelope to a single connection by id. Unlike broadcast,
    /// targeted sends report an unreachable recipient instead of skipping
    /// it.
    pub async fn send_to<T: Serialize>(
        &self,
        id: ConnectionId,
        event: &str,
        data: &T,
    ) -> HubResult<()> {
        let connection = self
            .connection(id)
            .await
            .ok_or(HubError::ConnectionNotFound(id))?;
        let message = Envelope::new(event, serde_json::to_value(data)?).to_message()?;
        if !connection.send_frame(message) {
            return Err(HubError::ConnectionClosed);
        }
        Ok(())
    }

    /// Broadcast with full recipient selection. Serializes once, then queues
    /// the same frame on each selected connection. Returns the number of
    /// connections the frame was queued for.
    pub async fn emit_with<T: Serialize>(
        &self,
        event: &str,
        data: &T,
        options: EmitOptions,
    ) -> HubResult<usize> {
        let message = Envelope::new(event, serde_json::to_value(data)?).to_message()?;

        let candidates: Vec<Arc<Connection>> = if options.topics.is_empty() {
            self.connections().await
        } else if let Some(comparator) = &self.comparator {
            // custom policy: sweep live connections against their topic sets
            let mut matched = Vec::new();
            for connection in self.connections().await {
                let topics = connection.topics().await;
                if comparator(&topics, &options.topics) {
                    matched.push(connection);
                }
            }
            matched
        } else {
            let ids = self.topics.read().await.union(&options.topics);
            let live = self.live.read().await;
            ids.iter()
                .filter_map(|id| live.connections.get(id).cloned())
                .collect()
        };

        let mut delivered = 0;
        for connection in candidates {
            if options.except == Some(connection.id()) {
                continue;
            }
            if let Some(filter) = &options.filter {
                if !filter(connection.context(), connection.as_ref()) {
                    continue;
                }
            }
            if connection.send_frame(message.clone()) {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    /// Close every live connection. Setting the closing flag under the same
    /// lock guarantees the set enumerated here cannot grow afterwards.
    pub async fn close_all(&self, code: Option<u16>, reason: Option<&str>) {
        let connections: Vec<Arc<Connection>> = {
            let mut live = self.live.write().await;
            live.closing = true;
            live.connections.values().cloned().collect()
        };
        if !connections.is_empty() {
            info!("closing {} live websocket connections", connections.len());
        }
        for connection in connections {
            connection.close(code, reason.map(str::to_string));
        }
    }

    /// Register a hub-level lifecycle listener.
    pub async fn on_event<F>(&self, listener: F)
    where
        F: Fn(&RegistryEvent) + Send + Sync + 'static,
    {
        self.listeners.write().await.push(Arc::new(listener));
    }

    /// Snapshot the listener list before invoking it, so a listener can
    /// touch the registry (including registering further listeners) without
    /// contending on the lock it was called under.
    pub(crate) async fn notify(&self, event: RegistryEvent) {
        let listeners = self.listeners.read().await.clone();
        for listener in &listeners {
            listener(&event);
        }
    }

    pub async fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.live.read().await.connections.get(&id).cloned()
    }

    pub async fn connections(&self) -> Vec<Arc<Connection>> {
        self.live.read().await.connections.values().cloned().collect()
    }

    pub async fn connection_count(&self) -> usize {
        self.live.read().await.connections.len()
    }

    /// Topics with at least one live subscriber.
    pub async fn topics(&self) -> Vec<String> {
        self.topics.read().await.topics()
    }

    pub async fn is_closing(&self) -> bool {
        self.live.read().await.closing
    }
}
