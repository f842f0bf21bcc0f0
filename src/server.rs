//! Hub server
//!
//! [`Hub`] owns the shared state and wires the pieces together: it hands out
//! the route builder, exposes the registry for broadcasts, and runs the axum
//! accept loop with graceful shutdown driven by the coordinator.

use crate::config::HubConfig;
use crate::dispatch::{default_error_handler, HubShared, SocketRouter};
use crate::errors::{HubError, HubResult};
use crate::registry::SocketRegistry;
use crate::shutdown::ShutdownCoordinator;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// WebSocket hub bound to one axum server.
pub struct Hub {
    shared: Arc<HubShared>,
    shutdown: ShutdownCoordinator,
    config: HubConfig,
}

impl Hub {
    /// Build a hub from a validated configuration.
    pub fn new(config: HubConfig) -> HubResult<Self> {
        config.validate()?;
        let registry = SocketRegistry::new(&config);
        let closing = Arc::new(AtomicBool::new(false));
        let shared = Arc::new(HubShared {
            registry: registry.clone(),
            transport: config.transport,
            error_handler: config
                .error_handler
                .clone()
                .unwrap_or_else(default_error_handler),
            closing: closing.clone(),
        });
        let shutdown = ShutdownCoordinator::new(closing, registry);
        Ok(Self {
            shared,
            shutdown,
            config,
        })
    }

    /// Start an empty route table bound to this hub.
    pub fn router(&self) -> SocketRouter {
        SocketRouter::new(self.shared.clone())
    }

    /// The connection registry, for broadcasts and lifecycle listeners.
    pub fn registry(&self) -> Arc<SocketRegistry> {
        self.shared.registry.clone()
    }

    /// Handle for triggering graceful shutdown from anywhere.
    pub fn shutdown_handle(&self) -> ShutdownCoordinator {
        self.shutdown.clone()
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Bind the address, wire OS signals into the shutdown coordinator, and
    /// serve until drained.
    pub async fn listen(&self, addr: &str, router: SocketRouter) -> HubResult<()> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|err| HubError::startup(format!("invalid listen address '{}': {}", addr, err)))?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|err| HubError::startup(format!("failed to bind {}: {}", addr, err)))?;

        let coordinator = self.shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            coordinator.shutdown().await;
        });

        self.serve(listener, router).await
    }

    /// Serve on an existing listener until the shutdown coordinator fires
    /// and the accept loop drains.
    pub async fn serve(&self, listener: TcpListener, router: SocketRouter) -> HubResult<()> {
        let addr = listener.local_addr()?;
        info!("🚀 WebSocket hub listening on {}", addr);

        axum::serve(listener, router.into_axum())
            .with_graceful_shutdown(self.shutdown.stop_signal())
            .await?;

        info!("🛑 WebSocket hub stopped on {}", addr);
        Ok(())
    }
}

/// Resolves on SIGINT, or on SIGTERM where that exists.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install ctrl-c handler: {}", err);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!("failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn invalid_config_fails_construction() {
        let config = HubConfig::new().with_heartbeat(Duration::ZERO, Duration::ZERO);
        assert!(matches!(Hub::new(config), Err(HubError::Config { .. })));
    }

    #[tokio::test]
    async fn listen_rejects_malformed_addresses() {
        let hub = Hub::new(HubConfig::default()).unwrap();
        let router = hub.router();
        let result = hub.listen("not-an-address", router).await;
        assert!(matches!(result, Err(HubError::Startup { .. })));
    }
}
