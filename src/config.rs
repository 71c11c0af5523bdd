//! Session configuration.

use std::time::Duration;

/// Default bound on a single transport read.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Default time `connect` waits for the configuration download.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time an acknowledgment-requiring write waits for its ack.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time a request waits for the reply it asked for.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default keep-alive interval.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(300);

/// Default first reconnection delay.
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Default upper bound on the reconnection delay.
pub const DEFAULT_MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(30);

/// Default bound on joining the reader thread during close.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for a [`MeshLink`](crate::MeshLink) session.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Bound on a single transport read; also how quickly the reader sees a stop request.
    pub read_timeout: Duration,
    /// Time `connect` waits for the configuration download to finish.
    pub connect_timeout: Duration,
    /// Time an acknowledgment-requiring write waits for its ack.
    pub ack_timeout: Duration,
    /// Time [`send_with_response`](crate::MeshLink::send_with_response) waits for the reply.
    pub response_timeout: Duration,
    /// Declare the link lost if nothing arrives for this long while live.
    pub liveness_timeout: Option<Duration>,
    /// Send a heartbeat after this much outbound silence while live.
    pub heartbeat_interval: Option<Duration>,
    /// Reconnect automatically after the link is lost.
    pub auto_reconnect: bool,
    /// First reconnection delay; doubled after each failed attempt.
    pub reconnect_backoff: Duration,
    /// Upper bound on the reconnection delay.
    pub max_reconnect_backoff: Duration,
    /// Give up after this many failed attempts (`None` retries forever).
    pub max_reconnect_attempts: Option<u32>,
    /// Bound on joining the reader thread during close.
    pub join_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            liveness_timeout: None,
            heartbeat_interval: Some(DEFAULT_HEARTBEAT_INTERVAL),
            auto_reconnect: false,
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            max_reconnect_backoff: DEFAULT_MAX_RECONNECT_BACKOFF,
            max_reconnect_attempts: None,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }
}

impl LinkConfig {
    /// Creates a configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the read timeout.
    #[must_use]
    pub const fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Sets the connect timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the acknowledgment timeout.
    #[must_use]
    pub const fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Sets the response timeout.
    #[must_use]
    pub const fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Sets the liveness timeout.
    #[must_use]
    pub const fn liveness_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.liveness_timeout = timeout;
        self
    }

    /// Sets the heartbeat interval.
    #[must_use]
    pub const fn heartbeat_interval(mut self, interval: Option<Duration>) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Enables or disables automatic reconnection.
    #[must_use]
    pub const fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Sets the reconnection backoff bounds.
    #[must_use]
    pub const fn reconnect_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_backoff = initial;
        self.max_reconnect_backoff = max;
        self
    }

    /// Limits the number of reconnection attempts.
    #[must_use]
    pub const fn max_reconnect_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Sets the reader join timeout used by close.
    #[must_use]
    pub const fn join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    /// Delay before reconnection attempt `attempt` (zero-based).
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.reconnect_backoff
            .saturating_mul(factor)
            .min(self.max_reconnect_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_config_defaults() {
        let config = LinkConfig::new();
        assert_eq!(config.read_timeout, DEFAULT_READ_TIMEOUT);
        assert!(!config.auto_reconnect);
        assert_eq!(config.liveness_timeout, None);
    }

    #[test]
    fn test_link_config_builder() {
        let config = LinkConfig::new()
            .ack_timeout(Duration::from_secs(2))
            .response_timeout(Duration::from_secs(9))
            .auto_reconnect(true)
            .max_reconnect_attempts(Some(3));
        assert_eq!(config.ack_timeout, Duration::from_secs(2));
        assert_eq!(config.response_timeout, Duration::from_secs(9));
        assert!(config.auto_reconnect);
        assert_eq!(config.max_reconnect_attempts, Some(3));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = LinkConfig::new()
            .reconnect_backoff(Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(config.backoff_for(0), Duration::from_millis(100));
        assert_eq!(config.backoff_for(1), Duration::from_millis(200));
        assert_eq!(config.backoff_for(2), Duration::from_millis(400));
        assert_eq!(config.backoff_for(3), Duration::from_millis(500));
        assert_eq!(config.backoff_for(40), Duration::from_millis(500));
    }
}
