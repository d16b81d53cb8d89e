//! Transport tuning knobs.

use std::time::Duration;

/// Configuration for one transport connection.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Maximum payload bytes drained from a channel into one frame.
    pub chunk_size: usize,
    /// Capacity of each channel's byte buffer. Writers block when full;
    /// this is the only flow control on the connection.
    pub channel_capacity: usize,
    /// Fallback wake interval for the outbound pump, so a missed wake
    /// signal can never stall the connection.
    pub pump_interval: Duration,
    /// How long to wait for the peer's preamble before giving up.
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            chunk_size: 4096,
            channel_capacity: 64 * 1024,
            pump_interval: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl TransportConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes;
        self
    }

    pub fn with_channel_capacity(mut self, bytes: usize) -> Self {
        self.channel_capacity = bytes;
        self
    }

    pub fn with_pump_interval(mut self, interval: Duration) -> Self {
        self.pump_interval = interval;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}
