//! Framing of tunnel bodies on top of HTTP POST.
//!
//! Request body: `key[149] || request_serial[8, LE] || payload`.
//! Response body: `reply_serial[8, LE] || payload`, or empty for a heartbeat.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::oneshot;

use crate::key::{KEY_LEN, TunnelKey};

/// Length of a serial number on the wire.
pub const SERIAL_LEN: usize = 8;

/// Length of the request header preceding the payload.
pub const REQUEST_HEADER_LEN: usize = KEY_LEN + SERIAL_LEN;

/// Path on which tunnels are created.
pub const CREATE_PATH: &str = "/create";

/// Path on which tunnel packets are exchanged.
pub const PACKET_PATH: &str = "/";

/// Marker body sent with a create request. The reverse proxy ignores it.
pub const CREATE_MARKER: &[u8] = b"create";

/// Parsed prefix of a packet POST body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    pub key: TunnelKey,
    pub request_serial: i64,
}

impl RequestHeader {
    /// Splits a POST body into its header and payload.
    ///
    /// Returns `None` if the body is too short or the key is not legitimate.
    pub fn parse(body: &Bytes) -> Option<(Self, Bytes)> {
        if body.len() < REQUEST_HEADER_LEN {
            return None;
        }
        let key = TunnelKey::parse(&body[..KEY_LEN])?;
        let request_serial = read_serial(&body[KEY_LEN..REQUEST_HEADER_LEN]) as i64;
        let header = Self {
            key,
            request_serial,
        };
        Some((header, body.slice(REQUEST_HEADER_LEN..)))
    }
}

/// Builds a packet POST body.
pub fn encode_request(key: &TunnelKey, request_serial: u64, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(REQUEST_HEADER_LEN + payload.len());
    buf.put_slice(key.as_bytes());
    buf.put_u64_le(request_serial);
    buf.put_slice(payload);
    buf.freeze()
}

/// Splits a packet response body into reply serial and payload.
///
/// An empty body is a heartbeat and yields `Ok(None)`. Bodies that are
/// non-empty but too short to hold a serial are rejected with their length.
pub fn decode_reply(body: Bytes) -> Result<Option<(u64, Bytes)>, usize> {
    if body.is_empty() {
        return Ok(None);
    }
    if body.len() < SERIAL_LEN {
        return Err(body.len());
    }
    let serial = read_serial(&body[..SERIAL_LEN]);
    Ok(Some((serial, body.slice(SERIAL_LEN..))))
}

fn read_serial(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; SERIAL_LEN];
    raw.copy_from_slice(bytes);
    u64::from_le_bytes(raw)
}

/// A reply produced by a long poller for one packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    /// Reply serial, `None` for an empty heartbeat.
    pub serial: Option<u64>,
    pub payload: Bytes,
}

impl Reply {
    pub fn heartbeat() -> Self {
        Self::default()
    }

    /// Reply serial as a signed number, `-1` for a heartbeat.
    pub fn reply_serial(&self) -> i64 {
        self.serial.map(|s| s as i64).unwrap_or(-1)
    }

    /// Renders the HTTP response body.
    pub fn into_body(self) -> Bytes {
        match self.serial {
            None => Bytes::new(),
            Some(serial) => {
                let mut buf = BytesMut::with_capacity(SERIAL_LEN + self.payload.len());
                buf.put_u64_le(serial);
                buf.put_slice(&self.payload);
                buf.freeze()
            }
        }
    }
}

/// A client request travelling from the HTTP layer to a long poller.
///
/// Dropping the packet without replying completes the HTTP request with an
/// empty body.
#[derive(derive_more::Debug)]
pub struct Packet {
    pub key: TunnelKey,
    pub request_serial: i64,
    #[debug("{} bytes", req_body.len())]
    pub req_body: Bytes,
    #[debug(skip)]
    done: oneshot::Sender<Reply>,
}

impl Packet {
    /// Creates a packet and the receiver on which its reply arrives.
    pub fn new(
        key: TunnelKey,
        request_serial: i64,
        req_body: Bytes,
    ) -> (Self, oneshot::Receiver<Reply>) {
        let (done, rx) = oneshot::channel();
        let packet = Self {
            key,
            request_serial,
            req_body,
            done,
        };
        (packet, rx)
    }

    /// Completes the request.
    ///
    /// Hands the reply back if the client already went away.
    pub fn reply(self, reply: Reply) -> Result<(), Reply> {
        self.done.send(reply)
    }
}
