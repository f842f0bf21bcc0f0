//! Two-phase graceful shutdown
//!
//! Phase 1 flips the closing flag: the dispatch layer starts refusing new
//! handshakes and the accept loop is told to stop. Phase 2 closes every live
//! connection with "going away". Admission checks the registry's closing flag
//! under the same lock `close_all` sets it, so the live set cannot grow once
//! phase 2 starts enumerating it.

use crate::connection::close_code;
use crate::registry::SocketRegistry;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::info;

/// Cloneable handle that triggers and observes shutdown.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    closing: Arc<AtomicBool>,
    stop: Arc<Notify>,
    registry: Arc<SocketRegistry>,
}

impl ShutdownCoordinator {
    pub(crate) fn new(closing: Arc<AtomicBool>, registry: Arc<SocketRegistry>) -> Self {
        Self {
            closing,
            stop: Arc::new(Notify::new()),
            registry,
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Run both shutdown phases. Idempotent: only the first caller drains;
    /// later calls return immediately. Not cancellable once started.
    pub async fn shutdown(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutdown phase 1: refusing new websocket upgrades");
        self.stop.notify_one();
        info!("shutdown phase 2: draining live websocket connections");
        self.registry
            .close_all(Some(close_code::GOING_AWAY), Some("server going away"))
            .await;
    }

    /// Resolves once shutdown begins; drives the accept loop's graceful
    /// stop. `notify_one` stores a permit, so the signal is not lost when
    /// shutdown fires before the server starts waiting.
    pub(crate) fn stop_signal(&self) -> impl Future<Output = ()> + Send + 'static {
        let stop = self.stop.clone();
        async move { stop.notified().await }
    }
}
