use std::time::Duration;

use bytes::Bytes;
use dynosaur::dynosaur;
use http::{Method, StatusCode};
use http_body_util::Full;
use hyper::Response;

/// Timing and buffer configuration of the reverse proxy.
#[derive(Debug, Clone)]
pub struct ReverseProxyOpts {
    /// Longest time a request is parked before it is answered empty.
    pub poll_dur: Duration,
    /// How long an accepted request waits for downstream bytes before the
    /// reply decision is made.
    pub fast_reply_window: Duration,
    /// Read deadline of the downstream reader; bounds its cancel latency.
    pub read_deadline: Duration,
    /// Write deadline of the downstream writer; bounds its cancel latency.
    pub write_deadline: Duration,
    /// Size of a single downstream read.
    pub read_buf_size: usize,
    /// Capacity of the channel towards the downstream writer.
    pub to_down_capacity: usize,
    /// Tunnels without payload movement for this long are torn down.
    pub inactive_shutdown: Duration,
    /// Maximum time to wait when dialing the downstream server.
    pub dial_timeout: Duration,
    /// Largest accepted POST body.
    pub max_body_len: usize,
}

impl Default for ReverseProxyOpts {
    fn default() -> Self {
        Self {
            poll_dur: Duration::from_secs(30),
            fast_reply_window: Duration::from_millis(10),
            read_deadline: Duration::from_millis(10),
            write_deadline: Duration::from_millis(40),
            read_buf_size: 4 * 1024,
            to_down_capacity: 16,
            inactive_shutdown: Duration::from_secs(10 * 60),
            dial_timeout: Duration::from_secs(1),
            max_body_len: 1024 * 1024,
        }
    }
}

/// Body type of reverse proxy responses.
pub type ResponseBody = Full<Bytes>;

/// Builds a response with the given status and body.
pub fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<ResponseBody> {
    let mut res = Response::new(Full::new(body.into()));
    *res.status_mut() = status;
    res
}

#[dynosaur(pub(crate) DynFallbackHandler = dyn(box) FallbackHandler)]
/// Answers requests that are not tunnel traffic.
///
/// The reverse proxy hands every request whose body does not start with a
/// legitimate key (and every request to an unknown path) to this handler, so
/// the tunnel port can double as a plain web server.
pub trait FallbackHandler: Send + Sync {
    /// Produces the response for a non-tunnel request.
    fn respond(
        &self,
        method: Method,
        path: String,
        body: Bytes,
    ) -> impl Future<Output = Response<ResponseBody>> + Send;
}

/// Fallback that answers `/ping` with `pong` and everything else with 404.
#[derive(Debug, Default, Clone)]
pub struct PingPong;

impl FallbackHandler for PingPong {
    async fn respond(
        &self,
        _method: Method,
        path: String,
        _body: Bytes,
    ) -> Response<ResponseBody> {
        match path.as_str() {
            "/ping" => response(StatusCode::OK, "pong"),
            _ => response(StatusCode::NOT_FOUND, Bytes::new()),
        }
    }
}

/// Fallback that answers everything with 404.
#[derive(Debug, Default, Clone)]
pub struct NotFound;

impl FallbackHandler for NotFound {
    async fn respond(
        &self,
        _method: Method,
        _path: String,
        _body: Bytes,
    ) -> Response<ResponseBody> {
        response(StatusCode::NOT_FOUND, Bytes::new())
    }
}
