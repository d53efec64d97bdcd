use std::time::Duration;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// upper bound for a packet's buffer payload in bytes; 0 disables the check.
    ///  Inline files are not counted against this - they are carried by length
    ///  and never buffered in memory as a whole
    pub max_packet_size: u32,

    /// a channel that is *not* connected (handshaking, or draining a disconnect
    ///  that the peer ignores) and has seen no traffic for this long is
    ///  force-closed by the cleanup sweep. ZERO disables the policy
    pub channel_timeout: Duration,
    /// a *connected* channel with no traffic for this long is gracefully
    ///  disconnected by the cleanup sweep. ZERO disables the policy
    pub max_channel_idle_period: Duration,
    /// the cleanup sweep runs at most once per this interval
    pub cleanup_interval: Duration,

    /// inclusive port range a server walks when binding
    pub port_range_start: u16,
    pub port_range_end: u16,

    /// keep files materialized by the receive path on disk instead of deleting
    ///  them when the delivered packet is dropped
    pub keep_received_files: bool,

    /// capacity of the readiness event buffer per poll
    pub poll_capacity: usize,
}

impl TransportConfig {
    pub fn new() -> TransportConfig {
        TransportConfig {
            max_packet_size: 16 * 1024 * 1024,
            channel_timeout: Duration::from_secs(10),
            max_channel_idle_period: Duration::ZERO,
            cleanup_interval: Duration::from_millis(500),
            // the common ephemeral range - binding somewhere in here is what
            //  "no port configured" means
            port_range_start: 32768,
            port_range_end: 60999,
            keep_received_files: false,
            poll_capacity: 256,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::new()
    }
}
