use std::time::Duration;

/// Tunables for every Session registered with a Hub. See spec §6
/// "Configuration surface".
#[derive(Debug, Clone, Copy)]
pub struct HubOptions {
    /// Socket read deadline per frame; reset on every successful read (and on
    /// every pong). Must be strictly greater than `ping_interval` so a single
    /// lost pong doesn't immediately disconnect the peer.
    pub read_timeout: Duration,
    /// Socket write deadline per frame (data, ping, or close).
    pub write_timeout: Duration,
    /// Server-initiated ping cadence.
    pub ping_interval: Duration,
    /// Inbound frames above this size are rejected by the transport before
    /// they reach the Session (enforced on the `WebSocketUpgrade` builder).
    pub max_message_size: usize,
    /// Capacity of each Session's bounded outbound queue.
    pub send_buffer: usize,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            max_message_size: 64 * 1024,
            send_buffer: 256,
        }
    }
}

impl HubOptions {
    /// `true` when `read_timeout` is safely larger than `ping_interval`. The
    /// caller is responsible for acting on this; Hub construction doesn't
    /// refuse an unsafe configuration, it just logs (see `Hub::new`).
    #[must_use]
    pub fn has_safe_heartbeat_margin(&self) -> bool {
        self.read_timeout > self.ping_interval
    }
}
