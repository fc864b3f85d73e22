//! Per-tunnel long poller.
//!
//! One task owns all state of a tunnel on the reverse side. It accepts
//! packets from the HTTP layer in request-serial order, writes their payload
//! downstream, parks at most two of them and answers the oldest one as soon
//! as downstream bytes are available, another request pushes it out, or the
//! long-poll timer fires.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use bytes::{Bytes, BytesMut};
use n0_error::e;
use tokio::{
    net::TcpStream,
    sync::mpsc,
    time::{Instant, sleep_until},
};
use tokio_util::{future::FutureExt, sync::CancellationToken};
use tracing::{debug, info, trace, warn};

use crate::{
    addr::Addr,
    error::TunnelError,
    key::TunnelKey,
    reverse::{ReverseProxyOpts, drw::Drw},
    util::reorder::Reorder,
    wire::{Packet, Reply},
};

/// Most requests ever parked on one tunnel.
pub(crate) const MAX_WAITERS: usize = 2;

/// Upper bound of downstream bytes gathered into a single reply.
const REPLY_COALESCE_LIMIT: usize = 64 * 1024;

/// Capacity of the packet channel between the HTTP layer and the poller.
const PACKET_QUEUE_LEN: usize = 4;

/// Cheap handle to a running [`LongPoller`].
#[derive(Debug, Clone)]
pub(crate) struct LongPollerHandle {
    packets: mpsc::Sender<Packet>,
    close: CancellationToken,
    parked: Arc<AtomicUsize>,
}

impl LongPollerHandle {
    /// Hands a packet to the poller.
    ///
    /// Fails with the packet if the poller has already shut down.
    pub(crate) async fn deliver(&self, packet: Packet) -> Result<(), Packet> {
        self.packets.send(packet).await.map_err(|err| err.0)
    }

    /// Forces the poller to shut down. Pending requests complete empty.
    pub(crate) fn close(&self) {
        self.close.cancel();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.close.is_cancelled()
    }

    /// Number of requests currently parked on the tunnel.
    pub(crate) fn parked(&self) -> usize {
        self.parked.load(Ordering::Relaxed)
    }

    /// Whether both handles refer to the same poller.
    pub(crate) fn same_poller(&self, other: &Self) -> bool {
        self.packets.same_channel(&other.packets)
    }
}

#[derive(Debug)]
pub(crate) struct LongPoller {
    key: TunnelKey,
    dest: Addr,
    opts: ReverseProxyOpts,
    packets: mpsc::Receiver<Packet>,
    close: CancellationToken,
    drw: Drw,
    /// Parked requests, oldest at the front.
    waiters: VecDeque<Packet>,
    /// Packets that arrived before their predecessor.
    early: Reorder<Packet>,
    /// Deadline and serial of the oldest packet held in `early`.
    held: Option<(Instant, i64)>,
    poll_deadline: Option<Instant>,
    last_use: Instant,
    next_reply_serial: u64,
    last_request_serial_seen: i64,
    pending_reply: BytesMut,
    parked: Arc<AtomicUsize>,
}

impl LongPoller {
    /// Wraps an established downstream connection.
    pub(crate) fn new(
        key: TunnelKey,
        dest: Addr,
        conn: TcpStream,
        opts: ReverseProxyOpts,
    ) -> (Self, LongPollerHandle) {
        let (packets_tx, packets) = mpsc::channel(PACKET_QUEUE_LEN);
        let close = CancellationToken::new();
        let parked = Arc::new(AtomicUsize::new(0));
        let drw = Drw::spawn(conn, &opts);
        let poller = Self {
            key,
            dest,
            opts,
            packets,
            close: close.clone(),
            drw,
            waiters: VecDeque::with_capacity(MAX_WAITERS + 1),
            // Tolerate exactly one packet overtaking its predecessor.
            early: Reorder::new(1, 2),
            held: None,
            poll_deadline: None,
            last_use: Instant::now(),
            next_reply_serial: 1,
            last_request_serial_seen: 0,
            pending_reply: BytesMut::new(),
            parked: parked.clone(),
        };
        let handle = LongPollerHandle {
            packets: packets_tx,
            close,
            parked,
        };
        (poller, handle)
    }

    /// Runs the owner loop until the tunnel is closed, goes idle, or fails.
    ///
    /// Every parked or queued request is completed before this returns.
    pub(crate) async fn run(mut self) -> Result<(), TunnelError> {
        info!(dest = %self.dest, "tunnel open");
        let res = self.serve().await;
        if let Err(TunnelError::DownstreamClosed { .. }) = &res {
            self.await_flush_request().await;
        }
        match &res {
            Ok(()) => info!("tunnel closed"),
            Err(err) => info!("tunnel failed: {err:#}"),
        }
        self.finish();
        let grace = self.opts.read_deadline.max(self.opts.write_deadline) * 4;
        self.drw.shutdown(grace).await;
        debug!(key = %self.key.fmt_short(), "downstream released");
        res
    }

    async fn serve(&mut self) -> Result<(), TunnelError> {
        loop {
            let poll_deadline = self.poll_deadline;
            let held = self.held;
            let idle_deadline = self.last_use + self.opts.inactive_shutdown;
            let want_downstream = !self.waiters.is_empty()
                || self.pending_reply.len() < self.opts.read_buf_size;
            let drw_stop = self.drw.stop_token();
            tokio::select! {
                biased;
                _ = self.close.cancelled() => {
                    debug!("close requested");
                    return Ok(());
                }
                _ = drw_stop.cancelled(), if !want_downstream => {
                    return Err(e!(TunnelError::DownstreamClosed));
                }
                chunk = self.drw.from_down.recv(), if want_downstream => match chunk {
                    Some(chunk) => {
                        self.absorb(chunk);
                        if !self.waiters.is_empty() {
                            self.reply_oldest();
                        }
                    }
                    None => return Err(e!(TunnelError::DownstreamClosed)),
                },
                packet = self.packets.recv() => match packet {
                    Some(packet) => self.on_packet(packet).await?,
                    None => return Ok(()),
                },
                _ = sleep_until(poll_deadline.unwrap_or(idle_deadline)), if poll_deadline.is_some() => {
                    trace!("long poll expired");
                    self.reply_oldest();
                    if !self.waiters.is_empty() {
                        self.poll_deadline = Some(Instant::now() + self.opts.poll_dur);
                    }
                }
                _ = sleep_until(held.map_or(idle_deadline, |(at, _)| at)), if held.is_some() => {
                    // The predecessor never showed up.
                    let got = held.map_or(0, |(_, serial)| serial);
                    return Err(e!(TunnelError::SerialMismatch {
                        last_seen: self.last_request_serial_seen,
                        got
                    }));
                }
                _ = sleep_until(idle_deadline) => {
                    info!(idle = ?self.opts.inactive_shutdown, "tunnel inactive");
                    return Ok(());
                }
            }
        }
    }

    async fn on_packet(&mut self, packet: Packet) -> Result<(), TunnelError> {
        let got = packet.request_serial;
        let last_seen = self.last_request_serial_seen;
        if got < 1 {
            return Err(e!(TunnelError::SerialMismatch { last_seen, got }));
        }
        let ready = self
            .early
            .push(got as u64, packet)
            .map_err(|_| e!(TunnelError::SerialMismatch { last_seen, got }))?;
        if ready.is_empty() {
            debug!(
                serial = got,
                expected = self.early.next(),
                "packet ahead of predecessor, holding"
            );
            self.held.get_or_insert((Instant::now() + self.opts.poll_dur, got));
            return Ok(());
        }
        if self.early.backlog() == 0 {
            self.held = None;
        }
        for packet in ready {
            self.accept(packet).await?;
        }

        if self.pending_reply.is_empty() && self.waiters.len() == 1 {
            self.fast_reply_window().await;
        }
        if !self.pending_reply.is_empty() || self.waiters.len() > 1 {
            self.reply_oldest();
        }
        Ok(())
    }

    async fn accept(&mut self, packet: Packet) -> Result<(), TunnelError> {
        self.last_request_serial_seen = packet.request_serial;
        trace!(
            serial = packet.request_serial,
            len = packet.req_body.len(),
            "accepted packet"
        );
        if !packet.req_body.is_empty() {
            self.last_use = Instant::now();
            self.write_downstream(packet.req_body.clone()).await?;
        }
        if self.waiters.len() == MAX_WAITERS {
            self.reply_oldest();
        }
        self.waiters.push_back(packet);
        self.sync_parked();
        if self.waiters.len() > MAX_WAITERS {
            return Err(e!(TunnelError::WaiterOverflow {
                len: self.waiters.len()
            }));
        }
        self.poll_deadline = Some(Instant::now() + self.opts.poll_dur);
        Ok(())
    }

    /// Hands request bytes to the downstream writer.
    ///
    /// This is the only back-pressure point. While the writer is behind,
    /// downstream output is still absorbed and handed to parked requests.
    async fn write_downstream(&mut self, bytes: Bytes) -> Result<(), TunnelError> {
        let to_down = self.drw.to_down.clone();
        let send = to_down.send(bytes);
        tokio::pin!(send);
        loop {
            tokio::select! {
                biased;
                _ = self.close.cancelled() => return Ok(()),
                res = &mut send => {
                    return res.map_err(|_| e!(TunnelError::DownstreamClosed));
                }
                chunk = self.drw.from_down.recv() => match chunk {
                    Some(chunk) => {
                        self.absorb(chunk);
                        if !self.waiters.is_empty() {
                            self.reply_oldest();
                        }
                    }
                    None => return Err(e!(TunnelError::DownstreamClosed)),
                },
            }
        }
    }

    fn sync_parked(&self) {
        self.parked.store(self.waiters.len(), Ordering::Relaxed);
    }

    /// Briefly waits for downstream bytes so a prompt answer rides on the
    /// request that triggered it.
    async fn fast_reply_window(&mut self) {
        if self.opts.fast_reply_window.is_zero() {
            return;
        }
        if let Ok(Some(chunk)) = self
            .drw
            .from_down
            .recv()
            .timeout(self.opts.fast_reply_window)
            .await
        {
            self.absorb(chunk);
        }
    }

    /// Appends downstream bytes, plus whatever else is ready right now.
    fn absorb(&mut self, chunk: Bytes) {
        self.last_use = Instant::now();
        self.pending_reply.extend_from_slice(&chunk);
        while self.pending_reply.len() < REPLY_COALESCE_LIMIT {
            match self.drw.from_down.try_recv() {
                Ok(more) => self.pending_reply.extend_from_slice(&more),
                Err(_) => break,
            }
        }
        trace!(pending = self.pending_reply.len(), "buffered downstream bytes");
    }

    /// Answers the oldest parked request with the buffered bytes.
    fn reply_oldest(&mut self) {
        while let Some(packet) = self.waiters.pop_front() {
            let request_serial = packet.request_serial;
            let reply = if self.pending_reply.is_empty() {
                Reply::heartbeat()
            } else {
                let serial = self.next_reply_serial;
                self.next_reply_serial += 1;
                self.last_use = Instant::now();
                Reply {
                    serial: Some(serial),
                    payload: self.pending_reply.split().freeze(),
                }
            };
            let reply_serial = reply.reply_serial();
            let len = reply.payload.len();
            match packet.reply(reply) {
                Ok(()) => {
                    debug!(request_serial, reply_serial, len, "replied");
                    break;
                }
                Err(reply) if reply.serial.is_some() => {
                    // The client hung up. Keep the bytes and the serial for
                    // the next parked request.
                    warn!(request_serial, reply_serial, "client gone before reply");
                    self.next_reply_serial -= 1;
                    self.pending_reply = BytesMut::from(&reply.payload[..]);
                }
                Err(_) => break,
            }
        }
        if self.waiters.is_empty() {
            self.poll_deadline = None;
        }
        self.sync_parked();
    }

    /// Downstream closed while bytes it sent are still buffered and nobody
    /// is parked: give the client one long poll to come and fetch them.
    async fn await_flush_request(&mut self) {
        if self.pending_reply.is_empty() || !self.waiters.is_empty() {
            return;
        }
        if let Some(Ok(Some(packet))) = self
            .packets
            .recv()
            .timeout(self.opts.poll_dur)
            .with_cancellation_token(&self.close)
            .await
        {
            self.waiters.push_back(packet);
            self.sync_parked();
        }
    }

    /// Completes every outstanding request: a parked one gets any bytes
    /// still buffered, the rest an empty reply.
    fn finish(&mut self) {
        self.close.cancel();
        self.packets.close();
        if !self.pending_reply.is_empty() && !self.waiters.is_empty() {
            self.reply_oldest();
        }
        for packet in self.waiters.drain(..) {
            packet.reply(Reply::heartbeat()).ok();
        }
        for packet in self.early.drain() {
            packet.reply(Reply::heartbeat()).ok();
        }
        while let Ok(packet) = self.packets.try_recv() {
            packet.reply(Reply::heartbeat()).ok();
        }
        self.sync_parked();
    }
}
