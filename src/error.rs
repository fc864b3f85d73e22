use std::{io, net::SocketAddr};

use http::StatusCode;
use n0_error::stack_error;

use crate::addr::Addr;

/// Errors that can occur while running either end of a tunnel.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum TunnelError {
    /// Failed to bind a TCP listener
    #[error("failed to bind tcp socket to {addr}")]
    TcpBind {
        /// The address we tried to bind to
        addr: SocketAddr,
        #[error(source, std_err)]
        source: io::Error,
    },

    /// Failed to accept an incoming TCP connection
    #[error("failed to accept tcp connection")]
    TcpAccept {
        #[error(source, std_err)]
        source: io::Error,
    },

    /// The reverse proxy could not reach the downstream server
    #[error("failed to dial downstream {dest}")]
    Dial {
        /// The downstream server we tried to reach
        dest: Addr,
        #[error(source, std_err)]
        source: io::Error,
    },

    /// Dialing the downstream server took too long
    #[error("dialing downstream {dest} timed out")]
    DialTimeout { dest: Addr },

    /// A key failed the legitimacy check
    #[error("invalid tunnel key")]
    InvalidKey,

    /// A request serial that cannot be reconciled with the ones seen so far
    #[error("request serial {got} cannot follow {last_seen}")]
    SerialMismatch { last_seen: i64, got: i64 },

    /// More than two requests were parked on one tunnel
    #[error("waiter queue overflow ({len} parked requests)")]
    WaiterOverflow { len: usize },

    /// Reading from or writing to the downstream socket failed
    #[error("downstream io failed")]
    DownstreamIo {
        #[error(source, std_err)]
        source: io::Error,
    },

    /// The downstream server closed the connection
    #[error("downstream closed the connection")]
    DownstreamClosed,

    /// An HTTP round trip to the reverse proxy failed
    #[error("round trip to reverse proxy failed")]
    RoundTrip {
        #[error(source, std_err)]
        source: reqwest::Error,
    },

    /// The reverse proxy answered with an unexpected status
    #[error("reverse proxy returned {status}")]
    Status { status: StatusCode },

    /// A reply body too short to carry a reply serial
    #[error("malformed reply of {len} bytes")]
    MalformedReply { len: usize },

    /// Reply serials that cannot be put back in order
    #[error("reply serial {got} cannot follow {expected}")]
    ReplyGap { expected: u64, got: u64 },

    /// Reading from or writing to the local application failed
    #[error("local io failed")]
    LocalIo {
        #[error(source, std_err)]
        source: io::Error,
    },
}

impl TunnelError {
    /// HTTP status the reverse proxy answers with when a request fails
    /// with this error.
    pub fn response_status(&self) -> StatusCode {
        match self {
            TunnelError::Dial { .. } | TunnelError::DialTimeout { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            TunnelError::InvalidKey { .. } => StatusCode::BAD_REQUEST,
            TunnelError::Status { status, .. } => *status,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}
