//! Hub configuration
//!
//! Recognized options: heartbeat (enables the liveness protocol when
//! present), a pluggable topic-match policy, a replaceable socket error
//! handler, and transport passthrough options forwarded verbatim to the
//! handshake. Validation runs once at hub construction; an invalid
//! configuration aborts setup instead of degrading silently.

use crate::dispatch::SocketErrorHandler;
use crate::errors::{HubError, HubResult};
use crate::registry::TopicComparator;
use std::fmt;
use std::time::Duration;

/// Liveness protocol knobs. `interval` controls how often a ping is sent;
/// `allowance` is the grace period awaiting a reply before eviction. Keeping
/// them independent decouples check frequency from jitter tolerance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub allowance: Duration,
}

/// Options forwarded to the transport handshake, opaque to the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    /// Maximum message size in bytes
    pub max_message_size: Option<usize>,
    /// Maximum frame size in bytes
    pub max_frame_size: Option<usize>,
    /// Maximum size of the transport write buffer in bytes
    pub max_write_buffer_size: Option<usize>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_message_size: Some(64 * 1024 * 1024),
            max_frame_size: Some(16 * 1024 * 1024),
            max_write_buffer_size: None,
        }
    }
}

/// Hub configuration
#[derive(Clone, Default)]
pub struct HubConfig {
    /// Heartbeat is disabled entirely when absent: no timers are armed.
    pub heartbeat: Option<HeartbeatConfig>,
    /// Overrides the default "subscribed to any requested topic" policy.
    pub topic_comparator: Option<TopicComparator>,
    /// Overrides the default handler-fault response (log and close).
    pub error_handler: Option<SocketErrorHandler>,
    pub transport: TransportConfig,
}

impl HubConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable the heartbeat monitor.
    pub fn with_heartbeat(mut self, interval: Duration, allowance: Duration) -> Self {
        self.heartbeat = Some(HeartbeatConfig {
            interval,
            allowance,
        });
        self
    }

    /// Replace the topic-match policy used by topic-restricted broadcasts.
    pub fn with_topic_comparator(mut self, comparator: TopicComparator) -> Self {
        self.topic_comparator = Some(comparator);
        self
    }

    /// Replace the handler-fault error handler.
    pub fn with_error_handler(mut self, handler: SocketErrorHandler) -> Self {
        self.error_handler = Some(handler);
        self
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    /// Validate the configuration. Called once by `Hub::new`.
    pub fn validate(&self) -> HubResult<()> {
        if let Some(heartbeat) = &self.heartbeat {
            if heartbeat.interval.is_zero() {
                return Err(HubError::config("heartbeat interval must be greater than zero"));
            }
            if heartbeat.allowance.is_zero() {
                return Err(HubError::config("heartbeat allowance must be greater than zero"));
            }
        }
        if let (Some(message), Some(frame)) = (
            self.transport.max_message_size,
            self.transport.max_frame_size,
        ) {
            if frame > message {
                return Err(HubError::config(
                    "transport max_frame_size cannot exceed max_message_size",
                ));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for HubConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubConfig")
            .field("heartbeat", &self.heartbeat)
            .field("transport", &self.transport)
            .field("topic_comparator", &self.topic_comparator.as_ref().map(|_| "custom"))
            .field("error_handler", &self.error_handler.as_ref().map(|_| "custom"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(HubConfig::default().validate().is_ok());
    }

    #[test]
    fn heartbeat_knobs_must_be_nonzero() {
        let config = HubConfig::new().with_heartbeat(Duration::ZERO, Duration::from_millis(20));
        assert!(matches!(config.validate(), Err(HubError::Config { .. })));

        let config = HubConfig::new().with_heartbeat(Duration::from_millis(50), Duration::ZERO);
        assert!(matches!(config.validate(), Err(HubError::Config { .. })));

        let config =
            HubConfig::new().with_heartbeat(Duration::from_millis(50), Duration::from_millis(20));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn conflicting_transport_limits_are_rejected() {
        let config = HubConfig::new().with_transport(TransportConfig {
            max_message_size: Some(1024),
            max_frame_size: Some(4096),
            max_write_buffer_size: None,
        });
        assert!(matches!(config.validate(), Err(HubError::Config { .. })));
    }
}
