//! Reverse side of the tunnel.
//!
//! The [`ReverseProxy`] is an HTTP server. `POST /create` dials the
//! downstream TCP server and registers a [`LongPoller`] under a fresh
//! [`TunnelKey`]; `POST /` carries packets for an existing tunnel. Anything
//! else is answered by a [`FallbackHandler`].

use std::{
    collections::HashMap,
    convert::Infallible,
    net::SocketAddr,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use http::{Method, StatusCode};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::{Request, Response, body::Incoming, service::service_fn};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use n0_error::{Result, e};
use n0_future::task::AbortOnDropHandle;
use tokio::{
    net::{TcpListener, TcpStream},
    time::timeout,
};
use tokio_util::{future::FutureExt, sync::CancellationToken, task::TaskTracker};
use tracing::{Instrument, debug, error_span, info, warn};

pub use self::opts::{
    FallbackHandler, NotFound, PingPong, ResponseBody, ReverseProxyOpts, response,
};
use self::{
    long_poll::{LongPoller, LongPollerHandle},
    opts::DynFallbackHandler,
};
use crate::{
    addr::Addr,
    error::TunnelError,
    key::{KEY_LEN, TunnelKey},
    wire::{CREATE_PATH, PACKET_PATH, Packet, RequestHeader},
};

mod drw;
mod long_poll;
mod opts;

/// Longest time [`ReverseProxy::shutdown`] waits for tunnels and connections.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// HTTP server terminating tunnels and relaying them to one downstream
/// TCP server.
///
/// Cloning is cheap, clones share the tunnel registry.
#[derive(Clone, derive_more::Debug)]
pub struct ReverseProxy {
    inner: Arc<Inner>,
    #[debug("DynFallbackHandler")]
    fallback: Arc<DynFallbackHandler<'static>>,
}

#[derive(Debug)]
struct Inner {
    dest: Addr,
    opts: ReverseProxyOpts,
    tunnels: Mutex<HashMap<TunnelKey, LongPollerHandle>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    conn_id: AtomicU64,
    in_flight: AtomicUsize,
}

impl ReverseProxy {
    /// Creates a reverse proxy relaying every tunnel to `dest`.
    ///
    /// Non-tunnel requests are answered by [`PingPong`].
    pub fn new(dest: Addr, opts: ReverseProxyOpts) -> Self {
        let inner = Inner {
            dest,
            opts,
            tunnels: Default::default(),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            conn_id: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
        };
        Self {
            inner: Arc::new(inner),
            fallback: DynFallbackHandler::new_arc(PingPong),
        }
    }

    /// Replaces the handler for non-tunnel requests.
    pub fn with_fallback(mut self, fallback: impl FallbackHandler + 'static) -> Self {
        self.fallback = DynFallbackHandler::new_arc(fallback);
        self
    }

    /// The downstream server tunnels are relayed to.
    pub fn dest(&self) -> &Addr {
        &self.inner.dest
    }

    /// Dials the downstream server and registers a new tunnel for it.
    pub async fn create_tunnel(&self) -> Result<TunnelKey, TunnelError> {
        let dest = self.inner.dest.clone();
        let conn = match timeout(
            self.inner.opts.dial_timeout,
            TcpStream::connect(dest.to_string()),
        )
        .await
        {
            Err(_elapsed) => return Err(e!(TunnelError::DialTimeout { dest })),
            Ok(Err(source)) => return Err(e!(TunnelError::Dial { dest, source })),
            Ok(Ok(conn)) => conn,
        };
        conn.set_nodelay(true).ok();

        let key = TunnelKey::generate();
        let (poller, handle) = LongPoller::new(key.clone(), dest, conn, self.inner.opts.clone());
        self.tunnels().insert(key.clone(), handle.clone());

        let this = self.clone();
        let key2 = key.clone();
        let span = error_span!("tunnel", key = %key.fmt_short());
        self.inner.tasks.spawn(
            async move {
                // The poller logs how it ended.
                poller.run().await.ok();
                this.unregister(&key2, &handle);
            }
            .instrument(span),
        );
        Ok(key)
    }

    /// Closes the tunnel registered under `key`.
    ///
    /// Parked requests complete with empty bodies, later requests see 404.
    /// Returns `false` if no such tunnel exists.
    pub fn close_tunnel(&self, key: &TunnelKey) -> bool {
        let handle = self.tunnels().remove(key);
        match handle {
            Some(handle) => {
                debug!(key = %key.fmt_short(), "closing tunnel");
                handle.close();
                true
            }
            None => false,
        }
    }

    /// Number of registered tunnels.
    pub fn tunnel_count(&self) -> usize {
        self.tunnels().len()
    }

    pub fn has_tunnel(&self, key: &TunnelKey) -> bool {
        self.tunnels().contains_key(key)
    }

    /// Number of requests parked on the tunnel registered under `key`.
    pub fn parked_requests(&self, key: &TunnelKey) -> Option<usize> {
        self.lookup(key).map(|handle| handle.parked())
    }

    /// Number of tunnel packets currently waiting for their reply, across
    /// all tunnels.
    pub fn requests_in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Relaxed)
    }

    /// Removes `key` from the registry if it still maps to `handle`.
    fn unregister(&self, key: &TunnelKey, handle: &LongPollerHandle) {
        let mut tunnels = self.tunnels();
        if tunnels.get(key).is_some_and(|h| h.same_poller(handle)) {
            tunnels.remove(key);
        }
    }

    fn tunnels(&self) -> MutexGuard<'_, HashMap<TunnelKey, LongPollerHandle>> {
        self.inner.tunnels.lock().expect("poisoned")
    }

    fn lookup(&self, key: &TunnelKey) -> Option<LongPollerHandle> {
        self.tunnels().get(key).cloned()
    }

    /// Accepts HTTP connections from the listener and serves each in a new task.
    ///
    /// Runs until [`Self::shutdown`] is called or the listener fails.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), TunnelError> {
        loop {
            let (stream, client_addr) = tokio::select! {
                _ = self.inner.shutdown.cancelled() => {
                    debug!("listener stopped");
                    return Ok(());
                }
                next = listener.accept() => {
                    next.map_err(|source| e!(TunnelError::TcpAccept { source }))?
                }
            };
            let id = self.inner.conn_id.fetch_add(1, Ordering::Relaxed);
            let this = self.clone();
            self.inner.tasks.spawn(
                async move {
                    debug!(%client_addr, "accepted connection");
                    if let Err(err) = this.serve_connection(stream).await {
                        warn!("failed to serve connection: {err:#}");
                    }
                }
                .instrument(error_span!("rev-conn", id)),
            );
        }
    }

    /// Binds `addr` and serves on it in a background task.
    pub async fn spawn(&self, addr: SocketAddr) -> Result<ReverseHandle, TunnelError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| e!(TunnelError::TcpBind { addr, source }))?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| e!(TunnelError::TcpBind { addr, source }))?;
        info!(%local_addr, dest = %self.inner.dest, "reverse proxy listening");
        let this = self.clone();
        let task = tokio::spawn(async move {
            if let Err(err) = this.serve(listener).await {
                warn!("reverse proxy listener failed: {err:#}");
            }
        });
        Ok(ReverseHandle {
            local_addr,
            proxy: self.clone(),
            task: AbortOnDropHandle::new(task),
        })
    }

    /// Stops accepting, closes every tunnel and waits for all tasks.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handles: Vec<_> = self.tunnels().drain().map(|(_, handle)| handle).collect();
        for handle in handles {
            handle.close();
        }
        self.inner.tasks.close();
        if self.inner.tasks.wait().timeout(SHUTDOWN_GRACE).await.is_err() {
            warn!("reverse proxy tasks did not finish in time");
        }
    }

    async fn serve_connection(&self, stream: TcpStream) -> Result<()> {
        let io = TokioIo::new(stream);
        let service = service_fn(|req| {
            let this = self.clone();
            async move { Ok::<_, Infallible>(this.handle_request(req).await) }
        });
        let builder = auto::Builder::new(TokioExecutor::new());
        let conn = builder.serve_connection(io, service);
        tokio::pin!(conn);
        tokio::select! {
            res = conn.as_mut() => res?,
            _ = self.inner.shutdown.cancelled() => {
                conn.as_mut().graceful_shutdown();
                conn.await?
            }
        }
        Ok(())
    }

    async fn handle_request(&self, req: Request<Incoming>) -> Response<ResponseBody> {
        let (parts, body) = req.into_parts();
        let path = parts.uri.path().to_string();
        let body = match Limited::new(body, self.inner.opts.max_body_len)
            .collect()
            .await
        {
            Ok(collected) => collected.to_bytes(),
            Err(err) if err.downcast_ref::<LengthLimitError>().is_some() => {
                debug!(%path, "request body too large");
                return response(StatusCode::PAYLOAD_TOO_LARGE, Bytes::new());
            }
            Err(err) => {
                debug!(%path, "failed to read request body: {err:#}");
                return response(StatusCode::BAD_REQUEST, Bytes::new());
            }
        };

        if parts.method != Method::POST {
            return self.fallback.respond(parts.method, path, body).await;
        }
        match path.as_str() {
            CREATE_PATH => self.handle_create().await,
            PACKET_PATH => self.handle_packet(path, body).await,
            _ => self.fallback.respond(parts.method, path, body).await,
        }
    }

    async fn handle_create(&self) -> Response<ResponseBody> {
        match self.create_tunnel().await {
            Ok(key) => {
                info!(key = %key.fmt_short(), "created tunnel");
                response(StatusCode::OK, Bytes::copy_from_slice(key.as_bytes()))
            }
            Err(err) => {
                warn!("failed to create tunnel: {err:#}");
                response(err.response_status(), Bytes::new())
            }
        }
    }

    async fn handle_packet(&self, path: String, body: Bytes) -> Response<ResponseBody> {
        if body.len() < KEY_LEN {
            return response(StatusCode::BAD_REQUEST, Bytes::new());
        }
        let Some(key) = TunnelKey::parse(&body) else {
            // Not tunnel traffic, look like an ordinary web server.
            return self.fallback.respond(Method::POST, path, body).await;
        };
        // Malformed before unknown: a body without a serial is rejected
        // whether or not its key is registered.
        let Some((header, payload)) = RequestHeader::parse(&body) else {
            debug!(key = %key.fmt_short(), len = body.len(), "packet without serial");
            return response(StatusCode::BAD_REQUEST, Bytes::new());
        };
        let Some(handle) = self.lookup(&key).filter(|handle| !handle.is_closed()) else {
            debug!(key = %key.fmt_short(), "packet for unknown tunnel");
            return response(StatusCode::NOT_FOUND, Bytes::new());
        };
        debug!(
            key = %key.fmt_short(),
            serial = header.request_serial,
            len = payload.len(),
            "packet"
        );
        let _in_flight = InFlight::enter(&self.inner.in_flight);
        let (packet, done) = Packet::new(header.key, header.request_serial, payload);
        if handle.deliver(packet).await.is_err() {
            debug!(key = %key.fmt_short(), "tunnel gone");
            return response(StatusCode::NOT_FOUND, Bytes::new());
        }
        // A dropped packet means the tunnel shut down: answer empty.
        let reply = done.await.unwrap_or_default();
        response(StatusCode::OK, reply.into_body())
    }
}

/// Counts a packet request for as long as it is alive.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::Relaxed);
        Self(count)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Handle to a reverse proxy serving in the background.
///
/// Dropping the handle stops the listener but leaves open tunnels running
/// until they go idle; use [`ReverseHandle::close`] to tear them down too.
#[derive(Debug)]
pub struct ReverseHandle {
    local_addr: SocketAddr,
    proxy: ReverseProxy,
    task: AbortOnDropHandle<()>,
}

impl ReverseHandle {
    /// Address the proxy is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn proxy(&self) -> &ReverseProxy {
        &self.proxy
    }

    /// Stops the listener and tears down all tunnels.
    pub async fn close(self) {
        self.proxy.shutdown().await;
        self.task.abort();
    }
}
