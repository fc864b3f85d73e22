//! Forward side of the tunnel.
//!
//! The [`ForwardProxy`] accepts local TCP connections and carries each one
//! through its own tunnel to the reverse proxy.

use std::{net::SocketAddr, sync::Arc};

use bytes::Bytes;
use http::StatusCode;
use n0_error::{Result, StdResultExt, e};
use n0_future::task::AbortOnDropHandle;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error_span, info, warn};

pub use self::opts::ForwardProxyOpts;
use self::chaser::{Chaser, ChaserConfig};
use crate::{
    addr::Addr,
    error::TunnelError,
    key::TunnelKey,
    wire::{CREATE_MARKER, CREATE_PATH, PACKET_PATH},
};

mod chaser;
mod conn_reader;
mod home;
mod opts;

/// Number of local reads queued towards the workers.
const INCOMING_QUEUE_LEN: usize = 8;

/// Number of replies queued towards the local writer.
const REPLY_QUEUE_LEN: usize = 8;

/// Proxy that accepts local TCP connections and tunnels each one over
/// HTTP to a reverse proxy.
///
/// Cloning is cheap; clones share the HTTP client and its connection pool.
#[derive(Debug, Clone)]
pub struct ForwardProxy {
    reverse: Addr,
    opts: Arc<ForwardProxyOpts>,
    client: reqwest::Client,
    create_url: Arc<str>,
    packet_url: Arc<str>,
}

impl ForwardProxy {
    /// Creates a forward proxy talking to the reverse proxy at `reverse`.
    pub fn new(reverse: Addr, opts: ForwardProxyOpts) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(opts.round_trip_timeout)
            .connect_timeout(opts.dial_timeout)
            .tcp_nodelay(true)
            .build()
            .std_context("Failed to build HTTP client")?;
        let base = reverse.http_base();
        Ok(Self {
            create_url: format!("{base}{CREATE_PATH}").into(),
            packet_url: format!("{base}{PACKET_PATH}").into(),
            reverse,
            opts: Arc::new(opts),
            client,
        })
    }

    /// The reverse proxy this proxy tunnels to.
    pub fn reverse(&self) -> &Addr {
        &self.reverse
    }

    /// Asks the reverse proxy for a new tunnel and returns its key.
    pub async fn create_tunnel(&self) -> Result<TunnelKey, TunnelError> {
        let res = self
            .client
            .post(&*self.create_url)
            .body(Bytes::from_static(CREATE_MARKER))
            .send()
            .await
            .map_err(|source| e!(TunnelError::RoundTrip { source }))?;
        let status = res.status();
        if status != StatusCode::OK {
            return Err(e!(TunnelError::Status { status }));
        }
        let body = res
            .bytes()
            .await
            .map_err(|source| e!(TunnelError::RoundTrip { source }))?;
        TunnelKey::parse(&body).ok_or_else(|| e!(TunnelError::InvalidKey))
    }

    /// Accepts TCP connections from the listener and tunnels each in a new task.
    ///
    /// Runs until the listener errors or the future is dropped; dropping it
    /// tears down every tunnel it started.
    pub async fn forward_tcp_listener(&self, listener: TcpListener) -> Result<(), TunnelError> {
        let cancel_token = CancellationToken::new();
        let _cancel_guard = cancel_token.clone().drop_guard();
        let mut id = 0u64;
        loop {
            let (stream, client_addr) = listener
                .accept()
                .await
                .map_err(|source| e!(TunnelError::TcpAccept { source }))?;
            let this = self.clone();
            tokio::spawn(
                cancel_token
                    .child_token()
                    .run_until_cancelled_owned(async move {
                        debug!(%client_addr, "accepted local connection");
                        if let Err(err) = this.forward_tcp_stream(stream).await {
                            warn!("failed to tunnel local connection: {err:#}");
                        }
                    })
                    .instrument(error_span!("fwd-conn", id)),
            );
            id += 1;
        }
    }

    /// Tunnels a single local connection until either end closes it.
    pub async fn forward_tcp_stream(&self, stream: TcpStream) -> Result<(), TunnelError> {
        let key = self.create_tunnel().await?;
        info!(key = %key.fmt_short(), "tunnel established");
        stream.set_nodelay(true).ok();
        let (read, write) = stream.into_split();
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_QUEUE_LEN);
        let (replies_tx, replies_rx) = mpsc::channel(REPLY_QUEUE_LEN);
        let cancel = CancellationToken::new();

        let config = ChaserConfig {
            client: self.client.clone(),
            url: self.packet_url.to_string(),
            inactive_shutdown: self.opts.inactive_shutdown,
            max_request_len: self.opts.max_request_len,
            eof_linger: self.opts.eof_linger,
        };
        let chaser = Chaser::new(key.clone(), config, incoming_rx, replies_tx, cancel.clone());
        tokio::join!(
            chaser.run(),
            conn_reader::read_local(read, incoming_tx, self.opts.read_buf_size, cancel.clone()),
            conn_reader::write_local(
                write,
                replies_rx,
                self.opts.max_reorder_backlog,
                cancel.clone()
            ),
        );
        info!(key = %key.fmt_short(), "tunnel closed");
        Ok(())
    }

    /// Binds the configured listen address and forwards in a background task.
    pub async fn spawn(&self) -> Result<ForwardHandle, TunnelError> {
        let addr = self.opts.listen;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| e!(TunnelError::TcpBind { addr, source }))?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| e!(TunnelError::TcpBind { addr, source }))?;
        info!(%local_addr, reverse = %self.reverse, "forward proxy listening");
        let this = self.clone();
        let task = tokio::spawn(async move {
            if let Err(err) = this.forward_tcp_listener(listener).await {
                warn!("forward proxy listener failed: {err:#}");
            }
        });
        Ok(ForwardHandle {
            local_addr,
            task: AbortOnDropHandle::new(task),
        })
    }
}

/// Handle to a forward proxy running in the background.
///
/// Dropping the handle stops the listener and all its tunnels.
#[derive(Debug)]
pub struct ForwardHandle {
    local_addr: SocketAddr,
    task: AbortOnDropHandle<()>,
}

impl ForwardHandle {
    /// Address local applications connect to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn close(self) {
        self.task.abort();
    }
}
