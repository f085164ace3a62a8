//! Client configuration.

use std::time::Duration;

use crate::reconnect::RecreateBackoff;

/// Configuration for a queue stream client.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    // Identity
    /// Broker address, `host:port` for the TCP transport.
    pub address: String,
    /// Client identifier stamped on every envelope.
    pub client_id: String,
    /// Optional bearer token handed to the transport.
    pub auth_token: Option<String>,

    // Reconnection settings
    /// Refuse to recreate the connection after a transport failure.
    pub disable_auto_reconnect: bool,
    /// Delay the channel manager waits before rebuilding a connection.
    pub reconnect_interval: Duration,
    /// Initial delay between failed recreation attempts.
    pub reconnect_initial_delay: Duration,
    /// Maximum delay between failed recreation attempts.
    pub reconnect_max_delay: Duration,
    /// Backoff multiplier for recreation retries.
    pub reconnect_backoff_factor: f64,
    /// Maximum number of recreation attempts (None = infinite).
    pub reconnect_max_attempts: Option<u32>,
    /// Random jitter factor (0.0-1.0) for retry delays.
    pub reconnect_jitter: f64,

    // Request handling
    /// Bounded wait for a send or control response.
    pub request_timeout: Duration,
    /// Maximum number of pending correlations per stream.
    pub max_pending_requests: usize,
    /// Interval for failing stale pending correlations.
    pub pending_cleanup_interval: Duration,
    /// Capacity of each outbound request queue.
    pub outbound_queue_capacity: usize,

    // Connection
    /// Timeout for connecting and for the liveness ping.
    pub connect_timeout: Duration,
    /// Maximum frame size in bytes.
    pub max_frame_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            client_id: String::new(),
            auth_token: None,
            disable_auto_reconnect: false,
            reconnect_interval: Duration::from_secs(1),
            reconnect_initial_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(30),
            reconnect_backoff_factor: 2.0,
            reconnect_max_attempts: None,
            reconnect_jitter: 0.1,
            request_timeout: Duration::from_secs(30),
            max_pending_requests: 1000,
            pending_cleanup_interval: Duration::from_secs(5),
            outbound_queue_capacity: 1024,
            connect_timeout: Duration::from_secs(10),
            max_frame_size: 16 * 1024 * 1024, // 16 MB
        }
    }
}

impl ClientConfig {
    /// Create a new configuration for the given broker address and client id.
    pub fn new(address: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            client_id: client_id.into(),
            ..Default::default()
        }
    }

    /// Set the auth token.
    #[must_use]
    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Disable or enable automatic reconnection.
    #[must_use]
    pub fn disable_auto_reconnect(mut self, disable: bool) -> Self {
        self.disable_auto_reconnect = disable;
        self
    }

    /// Set the delay before a connection is rebuilt.
    #[must_use]
    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Set the initial retry delay.
    #[must_use]
    pub fn reconnect_initial_delay(mut self, delay: Duration) -> Self {
        self.reconnect_initial_delay = delay;
        self
    }

    /// Set the maximum retry delay.
    #[must_use]
    pub fn reconnect_max_delay(mut self, delay: Duration) -> Self {
        self.reconnect_max_delay = delay;
        self
    }

    /// Set the retry backoff factor.
    #[must_use]
    pub fn reconnect_backoff_factor(mut self, factor: f64) -> Self {
        self.reconnect_backoff_factor = factor;
        self
    }

    /// Set the maximum recreation attempts.
    #[must_use]
    pub fn reconnect_max_attempts(mut self, attempts: Option<u32>) -> Self {
        self.reconnect_max_attempts = attempts;
        self
    }

    /// Set the retry jitter.
    #[must_use]
    pub fn reconnect_jitter(mut self, jitter: f64) -> Self {
        self.reconnect_jitter = jitter;
        self
    }

    /// Set the request timeout.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the maximum pending correlations.
    #[must_use]
    pub fn max_pending_requests(mut self, max: usize) -> Self {
        self.max_pending_requests = max;
        self
    }

    /// Set the stale correlation sweep interval.
    #[must_use]
    pub fn pending_cleanup_interval(mut self, interval: Duration) -> Self {
        self.pending_cleanup_interval = interval;
        self
    }

    /// Set the outbound queue capacity.
    #[must_use]
    pub fn outbound_queue_capacity(mut self, capacity: usize) -> Self {
        self.outbound_queue_capacity = capacity;
        self
    }

    /// Set the connect timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the maximum frame size.
    #[must_use]
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    pub(crate) fn backoff(&self) -> RecreateBackoff {
        RecreateBackoff {
            initial_delay: self.reconnect_initial_delay,
            max_delay: self.reconnect_max_delay,
            factor: self.reconnect_backoff_factor,
            jitter: self.reconnect_jitter,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.address.is_empty() {
            return Err("Address cannot be empty".to_string());
        }
        if self.client_id.is_empty() {
            return Err("Client id cannot be empty".to_string());
        }
        self.backoff().validate()?;
        if self.request_timeout.is_zero() {
            return Err("Request timeout must be > 0".to_string());
        }
        if self.pending_cleanup_interval.is_zero() {
            return Err("Pending cleanup interval must be > 0".to_string());
        }
        if self.connect_timeout.is_zero() {
            return Err("Connect timeout must be > 0".to_string());
        }
        if self.max_pending_requests == 0 {
            return Err("Max pending requests must be > 0".to_string());
        }
        if self.outbound_queue_capacity == 0 {
            return Err("Outbound queue capacity must be > 0".to_string());
        }
        if self.max_frame_size == 0 {
            return Err("Max frame size must be > 0".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert!(config.address.is_empty());
        assert!(config.client_id.is_empty());
        assert!(!config.disable_auto_reconnect);
        assert_eq!(config.reconnect_interval, Duration::from_secs(1));
        assert_eq!(config.reconnect_backoff_factor, 2.0);
        assert!(config.reconnect_max_attempts.is_none());
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.max_pending_requests, 1000);
        assert_eq!(config.max_frame_size, 16 * 1024 * 1024);
    }

    #[test]
    fn test_builder_pattern() {
        let config = ClientConfig::new("localhost:50000", "orders-service")
            .auth_token("secret")
            .disable_auto_reconnect(true)
            .request_timeout(Duration::from_secs(5))
            .reconnect_max_attempts(Some(3));

        assert_eq!(config.address, "localhost:50000");
        assert_eq!(config.client_id, "orders-service");
        assert_eq!(config.auth_token.as_deref(), Some("secret"));
        assert!(config.disable_auto_reconnect);
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.reconnect_max_attempts, Some(3));
    }

    #[test]
    fn test_validation_empty_address() {
        let config = ClientConfig::default();
        assert_eq!(config.validate().unwrap_err(), "Address cannot be empty");
    }

    #[test]
    fn test_validation_empty_client_id() {
        let config = ClientConfig::new("localhost:50000", "");
        assert_eq!(config.validate().unwrap_err(), "Client id cannot be empty");
    }

    #[test]
    fn test_validation_invalid_backoff() {
        let config = ClientConfig::new("localhost:50000", "c").reconnect_backoff_factor(0.5);
        assert_eq!(config.validate().unwrap_err(), "Backoff factor must be >= 1.0");
    }

    #[test]
    fn test_validation_zero_queue_capacity() {
        let config = ClientConfig::new("localhost:50000", "c").outbound_queue_capacity(0);
        assert_eq!(
            config.validate().unwrap_err(),
            "Outbound queue capacity must be > 0"
        );
    }

    #[test]
    fn test_validation_valid_config() {
        let config = ClientConfig::new("localhost:50000", "c");
        assert!(config.validate().is_ok());
    }
}
