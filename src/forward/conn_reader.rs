//! Local side of one tunnel.
//!
//! Reads the application's bytes into the chaser's incoming queue and writes
//! replies back to the application in reply-serial order.

use bytes::{Bytes, BytesMut};
use n0_error::e;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::tcp::{OwnedReadHalf, OwnedWriteHalf},
    sync::mpsc,
};
use tokio_util::{future::FutureExt, sync::CancellationToken};
use tracing::{debug, trace, warn};

use crate::{
    error::TunnelError,
    util::reorder::{Reorder, ReorderError},
};

/// Pumps local bytes into `incoming` until the application closes its side.
///
/// Dropping the sender on return tells the workers that no more bytes come.
pub(crate) async fn read_local(
    mut read: OwnedReadHalf,
    incoming: mpsc::Sender<Bytes>,
    buf_size: usize,
    cancel: CancellationToken,
) {
    let stop = cancel.clone().drop_guard();
    let mut buf = BytesMut::with_capacity(buf_size);
    let mut total = 0u64;
    loop {
        buf.reserve(buf_size);
        let n = match read.read_buf(&mut buf).with_cancellation_token(&cancel).await {
            None => break,
            Some(Ok(0)) => {
                debug!(total, "local connection closed");
                // Let the workers drain what is queued before they stop.
                stop.disarm();
                return;
            }
            Some(Ok(n)) => n,
            Some(Err(source)) => {
                let err = e!(TunnelError::LocalIo { source });
                warn!("failed to read local connection: {err:#}");
                break;
            }
        };
        total += n as u64;
        trace!(n, "read from local connection");
        let chunk = buf.split().freeze();
        match incoming.send(chunk).with_cancellation_token(&cancel).await {
            Some(Ok(())) => {}
            None | Some(Err(_)) => break,
        }
    }
    debug!(total, "local reader finished");
}

/// Writes replies to the application in the order the reverse proxy
/// emitted them.
///
/// Runs until every reply sender is gone, so replies queued before the
/// chaser stopped still reach the application.
pub(crate) async fn write_local(
    mut write: OwnedWriteHalf,
    mut replies: mpsc::Receiver<(u64, Bytes)>,
    max_backlog: usize,
    cancel: CancellationToken,
) {
    let _stop = cancel.clone().drop_guard();
    match write_ordered(&mut write, &mut replies, max_backlog).await {
        Ok(total) => debug!(total, "local writer finished"),
        Err(err) => warn!("local writer failed: {err:#}"),
    }
    write.shutdown().await.ok();
}

async fn write_ordered(
    write: &mut OwnedWriteHalf,
    replies: &mut mpsc::Receiver<(u64, Bytes)>,
    max_backlog: usize,
) -> Result<u64, TunnelError> {
    let mut order = Reorder::new(1, max_backlog as u64 + 1);
    let mut total = 0u64;
    while let Some((serial, bytes)) = replies.recv().await {
        let ready = order.push(serial, bytes).map_err(|err| match err {
            ReorderError::Duplicate { serial, next } | ReorderError::TooFarAhead { serial, next } => {
                e!(TunnelError::ReplyGap {
                    expected: next,
                    got: serial
                })
            }
        })?;
        if ready.is_empty() {
            trace!(serial, backlog = order.backlog(), "reply ahead of predecessor");
        }
        for bytes in ready {
            write
                .write_all(&bytes)
                .await
                .map_err(|source| e!(TunnelError::LocalIo { source }))?;
            total += bytes.len() as u64;
        }
    }
    Ok(total)
}
