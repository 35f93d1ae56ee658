//! Configuration for the transport.

/// Base timeout unit in microseconds; the other intervals default to
/// multiples of it.
pub const BASE_TIMEOUT_US: u64 = 2_000;

/// Transport configuration.
///
/// Controls flow-control window sizes and the protocol maintenance
/// intervals. All intervals are in microseconds.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Microseconds without peer activity before a message is failed.
    /// Default: 20 x BASE_TIMEOUT_US
    pub message_timeout_us: u64,
    /// Microseconds without activity before the sender pings an outbound
    /// message. Default: 3 x BASE_TIMEOUT_US
    pub ping_interval_us: u64,
    /// Microseconds without progress before the receiver requests a resend.
    /// Default: 1 x BASE_TIMEOUT_US
    pub resend_interval_us: u64,
    /// Receiver's target unmet-grant window, and the sender's unscheduled
    /// (pre-grant) allowance, in packets. Default: 8
    pub grant_window_packets: usize,
    /// Number of inbound messages granted to concurrently (the SRPT active
    /// set). Default: 4
    pub max_granted_messages: usize,
    /// Maximum packets drained from the driver per poll. Default: 32
    pub max_burst: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            message_timeout_us: 20 * BASE_TIMEOUT_US,
            ping_interval_us: 3 * BASE_TIMEOUT_US,
            resend_interval_us: BASE_TIMEOUT_US,
            grant_window_packets: 8,
            max_granted_messages: 4,
            max_burst: 32,
        }
    }
}

impl TransportConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the message timeout.
    pub fn with_message_timeout_us(mut self, us: u64) -> Self {
        self.message_timeout_us = us;
        self
    }

    /// Set the ping interval.
    pub fn with_ping_interval_us(mut self, us: u64) -> Self {
        self.ping_interval_us = us;
        self
    }

    /// Set the resend interval.
    pub fn with_resend_interval_us(mut self, us: u64) -> Self {
        self.resend_interval_us = us;
        self
    }

    /// Set the grant window in packets.
    pub fn with_grant_window_packets(mut self, packets: usize) -> Self {
        self.grant_window_packets = packets;
        self
    }

    /// Set the number of concurrently granted inbound messages.
    pub fn with_max_granted_messages(mut self, count: usize) -> Self {
        self.max_granted_messages = count;
        self
    }

    /// Set the per-poll receive burst limit.
    pub fn with_max_burst(mut self, count: usize) -> Self {
        self.max_burst = count;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.message_timeout_us, 40_000);
        assert_eq!(config.ping_interval_us, 6_000);
        assert_eq!(config.resend_interval_us, 2_000);
    }

    #[test]
    fn test_builder() {
        let config = TransportConfig::new()
            .with_grant_window_packets(2)
            .with_max_granted_messages(1)
            .with_resend_interval_us(500);
        assert_eq!(config.grant_window_packets, 2);
        assert_eq!(config.max_granted_messages, 1);
        assert_eq!(config.resend_interval_us, 500);
    }
}
