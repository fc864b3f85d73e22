use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

/// Configuration of the forward proxy.
///
/// `round_trip_timeout` must exceed the long-poll duration of the reverse
/// proxy, or parked requests are torn down before they are answered.
#[derive(Debug, Clone)]
pub struct ForwardProxyOpts {
    /// Local address accepting application connections.
    pub listen: SocketAddr,
    /// Upper bound for a single POST including its long poll.
    pub round_trip_timeout: Duration,
    /// Maximum time to wait when connecting to the reverse proxy.
    pub dial_timeout: Duration,
    /// Tunnels without payload movement for this long are torn down.
    pub inactive_shutdown: Duration,
    /// Largest payload gathered into one POST.
    pub max_request_len: usize,
    /// Size of a single read from the local connection.
    pub read_buf_size: usize,
    /// How many replies may wait for a missing predecessor.
    pub max_reorder_backlog: usize,
    /// After the application closed its side, the tunnel keeps polling for
    /// downstream bytes until one poll stays empty for this long.
    pub eof_linger: Duration,
}

impl Default for ForwardProxyOpts {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            round_trip_timeout: Duration::from_secs(60),
            dial_timeout: Duration::from_secs(1),
            inactive_shutdown: Duration::from_secs(10 * 60),
            max_request_len: 64 * 1024,
            read_buf_size: 4 * 1024,
            max_reorder_backlog: 64,
            eof_linger: Duration::from_millis(500),
        }
    }
}
