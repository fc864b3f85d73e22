//! Client side of one tunnel.
//!
//! Two workers, alpha and beta, take turns POSTing to the reverse proxy.
//! Whenever neither side has anything to say one of them is parked in a
//! long poll; local data goes out with whichever worker is home.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use n0_error::e;
use tokio::{
    sync::{
        Mutex,
        mpsc::{self, error::TryRecvError},
        watch,
    },
    time::Instant,
};
use tokio_util::{future::FutureExt, sync::CancellationToken};
use tracing::{Instrument, debug, error_span, trace, warn};

use crate::{
    error::TunnelError,
    forward::home::{Home, HomeCoordinator, HomeEvent, HomePorts, WorkerId},
    key::TunnelKey,
    wire::{decode_reply, encode_request},
};

/// Local bytes waiting to be sent, shared by both workers.
///
/// Request serials are handed out while the queue is locked, so bytes taken
/// earlier always travel under a lower serial.
#[derive(Debug)]
pub(crate) struct Outbox {
    incoming: Mutex<mpsc::Receiver<Bytes>>,
    next_serial: AtomicU64,
    max_len: usize,
}

impl Outbox {
    pub(crate) fn new(incoming: mpsc::Receiver<Bytes>, max_len: usize) -> Self {
        Self {
            incoming: Mutex::new(incoming),
            next_serial: AtomicU64::new(1),
            max_len,
        }
    }

    /// Waits for local bytes and gathers whatever else is already queued.
    ///
    /// Returns `None` once the local connection has closed and the queue is
    /// drained.
    async fn next(&self) -> Option<(u64, Bytes)> {
        let mut incoming = self.incoming.lock().await;
        let first = incoming.recv().await?;
        let payload = coalesce(first, &mut incoming, self.max_len);
        Some((self.take_serial(), payload))
    }

    /// Takes queued local bytes without waiting. Empty if there are none.
    ///
    /// Returns `None` once the local connection has closed and the queue is
    /// drained.
    fn ready(&self) -> Option<(u64, Bytes)> {
        let Ok(mut incoming) = self.incoming.try_lock() else {
            // The other worker is taking the bytes.
            return Some(self.empty());
        };
        let payload = match incoming.try_recv() {
            Ok(first) => coalesce(first, &mut incoming, self.max_len),
            Err(TryRecvError::Empty) => Bytes::new(),
            Err(TryRecvError::Disconnected) => return None,
        };
        Some((self.take_serial(), payload))
    }

    /// Serial for a poll without payload.
    fn empty(&self) -> (u64, Bytes) {
        (self.take_serial(), Bytes::new())
    }

    fn take_serial(&self) -> u64 {
        self.next_serial.fetch_add(1, Ordering::Relaxed)
    }
}

/// Everything a chaser needs to talk to the reverse proxy.
#[derive(Debug, Clone)]
pub(crate) struct ChaserConfig {
    pub(crate) client: reqwest::Client,
    /// URL of the packet path.
    pub(crate) url: String,
    pub(crate) inactive_shutdown: Duration,
    pub(crate) max_request_len: usize,
    pub(crate) eof_linger: Duration,
}

#[derive(Debug)]
pub(crate) struct Chaser {
    alpha: Worker,
    beta: Worker,
    home: HomeCoordinator,
    cancel: CancellationToken,
}

impl Chaser {
    /// Wires up the workers and their coordinator.
    ///
    /// Local bytes are taken from `incoming`, replies tagged with their
    /// reply serial go to `replies`.
    pub(crate) fn new(
        key: TunnelKey,
        config: ChaserConfig,
        incoming: mpsc::Receiver<Bytes>,
        replies: mpsc::Sender<(u64, Bytes)>,
        cancel: CancellationToken,
    ) -> Self {
        let (home, alpha_ports, beta_ports) =
            HomeCoordinator::new(cancel.clone(), config.inactive_shutdown);
        let outbox = Arc::new(Outbox::new(incoming, config.max_request_len));
        let worker = |id, ports| Worker {
            id,
            key: key.clone(),
            config: config.clone(),
            outbox: outbox.clone(),
            ports,
            replies: replies.clone(),
            cancel: cancel.clone(),
        };
        Self {
            alpha: worker(WorkerId::Alpha, alpha_ports),
            beta: worker(WorkerId::Beta, beta_ports),
            home,
            cancel,
        }
    }

    /// Runs both workers and the coordinator until the chaser stops.
    ///
    /// Returns once both workers are done. Dropping the workers closes the
    /// reply channel, which lets the local writer flush and finish.
    pub(crate) async fn run(self) {
        let Self {
            alpha,
            beta,
            home,
            cancel,
        } = self;
        let workers = async move {
            tokio::join!(
                alpha.run().instrument(error_span!("alpha")),
                beta.run().instrument(error_span!("beta")),
            );
            cancel.cancel();
        };
        tokio::join!(workers, home.run());
    }
}

/// How a worker left its loop without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    /// The chaser was stopped from elsewhere.
    Stopped,
    /// The application closed its side and downstream went quiet.
    Drained,
}

#[derive(Debug)]
struct Worker {
    id: WorkerId,
    key: TunnelKey,
    config: ChaserConfig,
    outbox: Arc<Outbox>,
    ports: HomePorts,
    replies: mpsc::Sender<(u64, Bytes)>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(mut self) {
        // A worker failing or giving up takes the whole chaser down.
        let stop = self.cancel.clone().drop_guard();
        match self.run_inner().await {
            Ok(Exit::Drained) => {
                debug!("worker drained");
                // The other worker finishes its own polls.
                stop.disarm();
            }
            Ok(Exit::Stopped) => debug!("worker stopped"),
            Err(err) => warn!("worker failed: {err:#}"),
        }
    }

    async fn run_inner(&mut self) -> Result<Exit, TunnelError> {
        loop {
            let go_now = self.ports.home.borrow_and_update().go_now(self.id);
            let next = if go_now {
                self.outbox.ready()
            } else {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Ok(Exit::Stopped),
                    told = self.ports.tell.recv() => {
                        if told.is_none() {
                            return Ok(Exit::Stopped);
                        }
                        if !still_current(&self.ports.home, self.id) {
                            trace!("stale go signal");
                            continue;
                        }
                        self.outbox.ready()
                    }
                    next = self.outbox.next() => next,
                }
            };
            let Some((serial, payload)) = next else {
                debug!("local connection closed");
                return self.linger().await;
            };
            // Drop go signals that piled up while we were deciding.
            while self.ports.tell.try_recv().is_ok() {}

            let sent = payload.len();
            self.send_event(HomeEvent::Departs {
                worker: self.id,
                sent,
            })
            .await;
            let start = Instant::now();
            let reply = match self
                .round_trip(serial, payload)
                .with_cancellation_token(&self.cancel)
                .await
            {
                None => return Ok(Exit::Stopped),
                Some(reply) => reply?,
            };
            let rtt = start.elapsed();
            let received = reply.as_ref().map(|(_, bytes)| bytes.len()).unwrap_or(0);
            debug!(serial, sent, received, ?rtt, "round trip");
            self.send_event(HomeEvent::Arrives {
                worker: self.id,
                received,
                rtt,
            })
            .await;

            if let Some(reply) = reply {
                if !self.deliver(reply).await {
                    return Ok(Exit::Stopped);
                }
            }
        }
    }

    /// Keeps polling after the application closed its side, until one poll
    /// stays empty for `eof_linger`.
    async fn linger(&mut self) -> Result<Exit, TunnelError> {
        loop {
            let (serial, payload) = self.outbox.empty();
            let reply = match self
                .round_trip(serial, payload)
                .timeout(self.config.eof_linger)
                .with_cancellation_token(&self.cancel)
                .await
            {
                None => return Ok(Exit::Stopped),
                Some(Err(_elapsed)) => return Ok(Exit::Drained),
                Some(Ok(reply)) => reply?,
            };
            let Some(reply) = reply else {
                return Ok(Exit::Drained);
            };
            trace!(serial, received = reply.1.len(), "late reply");
            if !self.deliver(reply).await {
                return Ok(Exit::Stopped);
            }
        }
    }

    /// Hands a reply to the local writer. `false` once the writer is gone.
    async fn deliver(&self, reply: (u64, Bytes)) -> bool {
        if self.replies.send(reply).await.is_err() {
            debug!("local writer gone");
            return false;
        }
        true
    }

    async fn send_event(&self, event: HomeEvent) {
        // The coordinator only goes away when the chaser stops.
        self.ports.events.send(event).await.ok();
    }

    async fn round_trip(
        &self,
        serial: u64,
        payload: Bytes,
    ) -> Result<Option<(u64, Bytes)>, TunnelError> {
        let body = encode_request(&self.key, serial, &payload);
        let res = self
            .config
            .client
            .post(&self.config.url)
            .body(body)
            .send()
            .await
            .map_err(|source| e!(TunnelError::RoundTrip { source }))?;
        let status = res.status();
        if !status.is_success() {
            return Err(e!(TunnelError::Status { status }));
        }
        let body = res
            .bytes()
            .await
            .map_err(|source| e!(TunnelError::RoundTrip { source }))?;
        decode_reply(body).map_err(|len| e!(TunnelError::MalformedReply { len }))
    }
}

fn still_current(home: &watch::Receiver<Home>, id: WorkerId) -> bool {
    home.borrow().may_leave(id)
}

fn coalesce(first: Bytes, incoming: &mut mpsc::Receiver<Bytes>, max_len: usize) -> Bytes {
    if first.len() >= max_len {
        return first;
    }
    let mut buf: Option<BytesMut> = None;
    while buf.as_ref().map_or(first.len(), BytesMut::len) < max_len {
        let Ok(next) = incoming.try_recv() else {
            break;
        };
        buf.get_or_insert_with(|| BytesMut::from(&first[..]))
            .extend_from_slice(&next);
    }
    match buf {
        Some(buf) => buf.freeze(),
        None => first,
    }
}
