//! wshub - route-level WebSocket upgrades and topic broadcast for axum
//!
//! The hub attaches a websocket layer to an axum server without claiming the
//! whole listener: each route decides independently whether it serves plain
//! HTTP, websocket handshakes, or both. Accepted sockets become registered
//! [`Connection`]s with topic-based broadcast, an optional ping/pong liveness
//! protocol, and a two-phase graceful shutdown that refuses new handshakes
//! before draining live connections.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wshub::{BoxError, Connection, FnSocketHandler, Hub, HubConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let hub = Hub::new(HubConfig::default())?;
//!     let router = hub.router().ws(
//!         "/chat",
//!         FnSocketHandler::new(|connection: Arc<Connection>| async move {
//!             connection.subscribe("lobby").await;
//!             connection.send("welcome", &"hello")?;
//!             Ok::<(), BoxError>(())
//!         }),
//!     );
//!     hub.listen("127.0.0.1:3000", router).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod envelope;
pub mod errors;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod topic;

pub use config::{HeartbeatConfig, HubConfig, TransportConfig};
pub use connection::{close_code, Connection, ConnectionId, ConnectionState};
pub use dispatch::{
    ConnectContext, FnSocketHandler, SocketErrorHandler, SocketHandler, SocketRouter,
};
pub use envelope::{
    Envelope, Inbound, Payload, BUFFER_EVENT, CLOSE_EVENT, ERROR_EVENT, HEARTBEAT_EVENT,
};
pub use errors::{BoxError, HubError, HubResult};
pub use registry::{
    ConnectionFilter, EmitOptions, RegistryEvent, SocketRegistry, TopicComparator,
};
pub use server::Hub;
pub use shutdown::ShutdownCoordinator;
