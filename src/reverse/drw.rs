//! Downstream reader/writer pair.
//!
//! Two tasks shuttle bytes between the TCP socket to the downstream server
//! and a pair of channels owned by the long poller. Both tasks do their I/O
//! under short deadlines and look at the shared stop token between
//! attempts, so a stop request is honored within one deadline interval.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use n0_error::e;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
    time::timeout,
};
use tokio_util::{future::FutureExt, sync::CancellationToken, task::TaskTracker};
use tracing::{Instrument, debug, trace, warn};

use crate::{error::TunnelError, reverse::ReverseProxyOpts};

/// Handle on a running downstream reader/writer pair.
#[derive(Debug)]
pub(crate) struct Drw {
    /// Bytes to be written to the downstream socket.
    pub(crate) to_down: mpsc::Sender<Bytes>,
    /// Bytes read from the downstream socket.
    pub(crate) from_down: mpsc::Receiver<Bytes>,
    stop: CancellationToken,
    tasks: TaskTracker,
}

impl Drw {
    /// Splits `conn` and starts the reader and writer tasks.
    pub(crate) fn spawn(conn: TcpStream, opts: &ReverseProxyOpts) -> Self {
        let (read, write) = conn.into_split();
        let (to_down, to_down_rx) = mpsc::channel(opts.to_down_capacity.max(1));
        // Capacity one: the reader blocks until the long poller takes a
        // buffer, so the consumer sets the pace.
        let (from_down_tx, from_down) = mpsc::channel(1);
        let stop = CancellationToken::new();
        let tasks = TaskTracker::new();

        let reader = Reader {
            read,
            from_down: from_down_tx,
            stop: stop.clone(),
            deadline: opts.read_deadline,
            buf_size: opts.read_buf_size.max(1),
        };
        tasks.spawn(
            async move {
                // Whichever side exits first takes the other one down.
                let _stop = reader.stop.clone().drop_guard();
                match reader.run().await {
                    Ok(total) => debug!(total, "reader finished"),
                    Err(err) => warn!("reader failed: {err:#}"),
                }
            }
            .instrument(tracing::Span::current()),
        );

        let writer = Writer {
            write,
            to_down: to_down_rx,
            stop: stop.clone(),
            deadline: opts.write_deadline,
        };
        tasks.spawn(
            async move {
                let _stop = writer.stop.clone().drop_guard();
                match writer.run().await {
                    Ok(total) => debug!(total, "writer finished"),
                    Err(err) => warn!("writer failed: {err:#}"),
                }
            }
            .instrument(tracing::Span::current()),
        );
        tasks.close();

        Self {
            to_down,
            from_down,
            stop,
            tasks,
        }
    }

    /// Token that is cancelled once either worker has exited or a stop was
    /// requested.
    pub(crate) fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Requests a stop and waits for both workers to exit.
    ///
    /// The socket is closed once both halves are dropped.
    pub(crate) async fn shutdown(self, grace: Duration) {
        let Self {
            to_down,
            from_down,
            stop,
            tasks,
        } = self;
        stop.cancel();
        drop(to_down);
        drop(from_down);
        if tasks.wait().timeout(grace).await.is_err() {
            debug!("downstream workers did not exit in time");
        }
    }
}

struct Reader {
    read: OwnedReadHalf,
    from_down: mpsc::Sender<Bytes>,
    stop: CancellationToken,
    deadline: Duration,
    buf_size: usize,
}

impl Reader {
    async fn run(mut self) -> Result<u64, TunnelError> {
        let mut total = 0u64;
        let mut buf = BytesMut::with_capacity(self.buf_size);
        loop {
            if self.stop.is_cancelled() {
                return Ok(total);
            }
            buf.reserve(self.buf_size);
            let mut limited = (&mut self.read).take(self.buf_size as u64);
            match timeout(self.deadline, limited.read_buf(&mut buf)).await {
                // Deadline passed without data, look at the stop flag again.
                Err(_elapsed) => continue,
                Ok(Ok(0)) => {
                    debug!("downstream closed");
                    return Ok(total);
                }
                Ok(Ok(n)) => {
                    total += n as u64;
                    trace!(n, "read from downstream");
                    let chunk = buf.split().freeze();
                    match self
                        .from_down
                        .send(chunk)
                        .with_cancellation_token(&self.stop)
                        .await
                    {
                        Some(Ok(())) => {}
                        // Stopped, or the long poller is gone.
                        None | Some(Err(_)) => return Ok(total),
                    }
                }
                Ok(Err(source)) => return Err(e!(TunnelError::DownstreamIo { source })),
            }
        }
    }
}

struct Writer {
    write: OwnedWriteHalf,
    to_down: mpsc::Receiver<Bytes>,
    stop: CancellationToken,
    deadline: Duration,
}

impl Writer {
    async fn run(mut self) -> Result<u64, TunnelError> {
        let mut total = 0u64;
        loop {
            let chunk = match self
                .to_down
                .recv()
                .with_cancellation_token(&self.stop)
                .await
            {
                Some(Some(chunk)) => chunk,
                None | Some(None) => break,
            };
            let mut rest = &chunk[..];
            while !rest.is_empty() {
                if self.stop.is_cancelled() {
                    return Ok(total);
                }
                match timeout(self.deadline, self.write.write(rest)).await {
                    // Nothing written before the deadline, retry.
                    Err(_elapsed) => continue,
                    Ok(Ok(0)) => {
                        let source = std::io::Error::from(std::io::ErrorKind::WriteZero);
                        return Err(e!(TunnelError::DownstreamIo { source }));
                    }
                    Ok(Ok(n)) => {
                        total += n as u64;
                        trace!(n, "wrote to downstream");
                        rest = &rest[n..];
                    }
                    Ok(Err(source)) => return Err(e!(TunnelError::DownstreamIo { source })),
                }
            }
        }
        self.write.shutdown().await.ok();
        Ok(total)
    }
}
