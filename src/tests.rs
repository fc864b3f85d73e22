use std::{net::SocketAddr, time::Duration};

use bytes::Bytes;
use http::StatusCode;
use n0_error::{Result, StdResultExt};
use n0_future::task::AbortOnDropHandle;
use n0_tracing_test::traced_test;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time::Instant,
};
use tokio_util::time::FutureExt;
use tracing::debug;

use crate::{
    Addr, ForwardHandle, ForwardProxy, ForwardProxyOpts, KEY_LEN, ReverseHandle, ReverseProxy,
    ReverseProxyOpts, TunnelKey,
    reverse::NotFound,
    wire::{decode_reply, encode_request},
};

// -- Test helpers --

/// Spawns a simple TCP echo server.
async fn spawn_echo_server() -> Result<(SocketAddr, AbortOnDropHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let task = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    Ok((addr, AbortOnDropHandle::new(task)))
}

/// Spawns a server that writes `msg` after `delay` without being asked.
async fn spawn_push_server(
    msg: &'static [u8],
    delay: Duration,
) -> Result<(SocketAddr, AbortOnDropHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let task = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = stream.write_all(msg).await;
                let mut buf = [0u8; 64];
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                }
            });
        }
    });
    Ok((addr, AbortOnDropHandle::new(task)))
}

/// Spawns a server that reports every chunk it reads and never answers.
async fn spawn_recording_server() -> Result<(SocketAddr, mpsc::Receiver<Bytes>, AbortOnDropHandle<()>)>
{
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (tx, rx) = mpsc::channel(16);
    let task = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1024];
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 || tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    Ok((addr, rx, AbortOnDropHandle::new(task)))
}

/// Spawns a server that hangs up `after` accepting each connection.
async fn spawn_hangup_server(after: Duration) -> Result<(SocketAddr, AbortOnDropHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let task = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                drop(stream);
            });
        }
    });
    Ok((addr, AbortOnDropHandle::new(task)))
}

/// Spawns a server that reads `len` bytes, answers with as many, then hangs up.
async fn spawn_exchange_server(len: usize) -> Result<(SocketAddr, AbortOnDropHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let task = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; len];
                if stream.read_exact(&mut buf).await.is_ok() {
                    let _ = stream.write_all(&vec![b'd'; len]).await;
                }
            });
        }
    });
    Ok((addr, AbortOnDropHandle::new(task)))
}

/// Returns a local address nothing listens on.
async fn closed_port() -> Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    Ok(listener.local_addr()?)
}

async fn spawn_reverse_proxy(dest: SocketAddr, opts: ReverseProxyOpts) -> Result<ReverseHandle> {
    let proxy = ReverseProxy::new(dest.into(), opts);
    let handle = proxy.spawn("127.0.0.1:0".parse().anyerr()?).await?;
    debug!(addr = %handle.local_addr(), %dest, "spawned reverse proxy");
    Ok(handle)
}

async fn spawn_forward_proxy(reverse: SocketAddr) -> Result<ForwardHandle> {
    let proxy = ForwardProxy::new(Addr::from(reverse), ForwardProxyOpts::default())?;
    let handle = proxy.spawn().await?;
    debug!(addr = %handle.local_addr(), %reverse, "spawned forward proxy");
    Ok(handle)
}

/// Spawns reverse and forward proxy in front of `dest`.
async fn spawn_tunnel(dest: SocketAddr) -> Result<(ReverseHandle, ForwardHandle)> {
    spawn_tunnel_with(dest, Default::default()).await
}

async fn spawn_tunnel_with(
    dest: SocketAddr,
    opts: ReverseProxyOpts,
) -> Result<(ReverseHandle, ForwardHandle)> {
    let reverse = spawn_reverse_proxy(dest, opts).await?;
    let forward = spawn_forward_proxy(reverse.local_addr()).await?;
    Ok((reverse, forward))
}

/// Polls `cond` until it holds, failing after `within`.
async fn eventually(within: Duration, what: &str, mut cond: impl FnMut() -> bool) -> Result {
    let start = Instant::now();
    while !cond() {
        n0_error::ensure_any!(start.elapsed() <= within, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

async fn post(addr: SocketAddr, path: &str, body: Bytes) -> Result<(StatusCode, Bytes)> {
    let res = reqwest::Client::new()
        .post(format!("http://{addr}{path}"))
        .body(body)
        .send()
        .timeout(Duration::from_secs(5))
        .await
        .anyerr()?
        .anyerr()?;
    let status = res.status();
    let body = res.bytes().await.anyerr()?;
    Ok((status, body))
}

async fn create_raw_tunnel(addr: SocketAddr) -> Result<TunnelKey> {
    let (status, body) = post(addr, "/create", Bytes::from_static(b"create")).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.len(), KEY_LEN);
    Ok(TunnelKey::parse(&body).expect("legit key"))
}

async fn read_exactly(stream: &mut TcpStream, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    stream
        .read_exact(&mut buf)
        .timeout(Duration::from_secs(5))
        .await
        .anyerr()??;
    Ok(buf)
}

// -- Tunnel tests --

#[tokio::test]
#[traced_test]
async fn test_echo_through_tunnel() -> Result {
    let (echo_addr, _echo_task) = spawn_echo_server().await?;
    let (_reverse, forward) = spawn_tunnel(echo_addr).await?;

    let mut conn = TcpStream::connect(forward.local_addr()).await?;
    conn.write_all(b"hello\n").await?;
    assert_eq!(read_exactly(&mut conn, 6).await?, b"hello\n");

    conn.write_all(b"and again\n").await?;
    assert_eq!(read_exactly(&mut conn, 10).await?, b"and again\n");
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_large_transfer_keeps_order() -> Result {
    let (echo_addr, _echo_task) = spawn_echo_server().await?;
    let (_reverse, forward) = spawn_tunnel(echo_addr).await?;

    let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let conn = TcpStream::connect(forward.local_addr()).await?;
    let (mut read, mut write) = conn.into_split();
    let expected = data.clone();
    let writer = tokio::spawn(async move { write.write_all(&data).await.map(|_| write) });
    let mut got = vec![0u8; expected.len()];
    read.read_exact(&mut got)
        .timeout(Duration::from_secs(20))
        .await
        .anyerr()??;
    assert!(got == expected, "echoed bytes differ");
    let _write = writer.await.anyerr()??;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn test_bulk_echo_while_reading() -> Result {
    const LEN: usize = 16 * 1024 * 1024;
    let (echo_addr, _echo_task) = spawn_echo_server().await?;
    let (_reverse, forward) = spawn_tunnel(echo_addr).await?;

    let data: Vec<u8> = (0..LEN).map(|i| (i % 253) as u8).collect();
    let expected = data.clone();
    let (mut read, mut write) = TcpStream::connect(forward.local_addr()).await?.into_split();
    let writer = tokio::spawn(async move { write.write_all(&data).await.map(|_| write) });
    let mut got = vec![0u8; LEN];
    read.read_exact(&mut got)
        .timeout(Duration::from_secs(60))
        .await
        .anyerr()??;
    assert!(got == expected, "echoed bytes differ");
    let _write = writer.await.anyerr()??;
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_half_close_still_gets_reply() -> Result {
    let (echo_addr, _echo_task) = spawn_echo_server().await?;
    let (_reverse, forward) = spawn_tunnel(echo_addr).await?;

    let mut conn = TcpStream::connect(forward.local_addr()).await?;
    conn.write_all(b"hello\n").await?;
    conn.shutdown().await?;
    let mut got = Vec::new();
    conn.read_to_end(&mut got)
        .timeout(Duration::from_secs(5))
        .await
        .anyerr()??;
    assert_eq!(got, b"hello\n");
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_server_push_reaches_client() -> Result {
    let (push_addr, _push_task) =
        spawn_push_server(b"BREAKING NEWS", Duration::from_millis(200)).await?;
    let (_reverse, forward) = spawn_tunnel(push_addr).await?;

    let start = Instant::now();
    let mut conn = TcpStream::connect(forward.local_addr()).await?;
    let mut buf = [0u8; 13];
    conn.read_exact(&mut buf)
        .timeout(Duration::from_secs(2))
        .await
        .anyerr()??;
    assert_eq!(&buf, b"BREAKING NEWS");
    // Delivered by the parked long poll, not by its expiry.
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_millis(400), "push took {elapsed:?}");
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_chaser_keeps_one_request_parked() -> Result {
    let (echo_addr, _echo_task) = spawn_echo_server().await?;
    let (reverse, forward) = spawn_tunnel(echo_addr).await?;
    let proxy = reverse.proxy().clone();

    let mut conn = TcpStream::connect(forward.local_addr()).await?;
    conn.write_all(b"warm").await?;
    assert_eq!(read_exactly(&mut conn, 4).await?, b"warm");

    let sampled = proxy.clone();
    let sampler = tokio::spawn(async move {
        let mut max = 0;
        loop {
            max = max.max(sampled.requests_in_flight());
            tokio::time::sleep(Duration::from_millis(1)).await;
            if max > 2 {
                break max;
            }
        }
    });
    for _ in 0..50 {
        conn.write_all(b"0123456789").await?;
        assert_eq!(read_exactly(&mut conn, 10).await?, b"0123456789");
    }
    assert!(!sampler.is_finished(), "more than two requests in flight");
    sampler.abort();

    // Quiet again: one worker parked at the reverse proxy, one at home.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(proxy.requests_in_flight(), 1);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_two_clients_get_separate_tunnels() -> Result {
    let (echo_addr, _echo_task) = spawn_echo_server().await?;
    let (reverse, forward) = spawn_tunnel(echo_addr).await?;

    let mut a = TcpStream::connect(forward.local_addr()).await?;
    let mut b = TcpStream::connect(forward.local_addr()).await?;
    a.write_all(b"from a").await?;
    b.write_all(b"from b").await?;
    assert_eq!(read_exactly(&mut b, 6).await?, b"from b");
    assert_eq!(read_exactly(&mut a, 6).await?, b"from a");
    assert_eq!(reverse.proxy().tunnel_count(), 2);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_shutdown_closes_open_tunnels() -> Result {
    let (echo_addr, _echo_task) = spawn_echo_server().await?;
    let (reverse, forward) = spawn_tunnel(echo_addr).await?;

    let mut conn = TcpStream::connect(forward.local_addr()).await?;
    conn.write_all(b"ping").await?;
    assert_eq!(read_exactly(&mut conn, 4).await?, b"ping");
    drop(conn);

    // The reverse side only notices on idle timeout or shutdown.
    let proxy = reverse.proxy().clone();
    assert_eq!(proxy.tunnel_count(), 1);
    proxy.shutdown().await;
    assert_eq!(proxy.tunnel_count(), 0);
    Ok(())
}

// -- Reverse proxy endpoint tests --

#[tokio::test]
#[traced_test]
async fn test_create_returns_key() -> Result {
    let (echo_addr, _echo_task) = spawn_echo_server().await?;
    let reverse = spawn_reverse_proxy(echo_addr, Default::default()).await?;

    let key = create_raw_tunnel(reverse.local_addr()).await?;
    assert!(key.as_str().bytes().all(|b| b.is_ascii_digit() || b.is_ascii_lowercase()));
    assert!(reverse.proxy().has_tunnel(&key));

    let other = create_raw_tunnel(reverse.local_addr()).await?;
    assert_ne!(key, other);
    assert_eq!(reverse.proxy().tunnel_count(), 2);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_requests_are_reordered() -> Result {
    let (rec_addr, mut recorded, _rec_task) = spawn_recording_server().await?;
    let opts = ReverseProxyOpts {
        poll_dur: Duration::from_millis(200),
        ..Default::default()
    };
    let reverse = spawn_reverse_proxy(rec_addr, opts).await?;
    let addr = reverse.local_addr();
    let key = create_raw_tunnel(addr).await?;

    // Serial 2 overtakes serial 1.
    let second = tokio::spawn(post(addr, "/", encode_request(&key, 2, b"second ")));
    tokio::time::sleep(Duration::from_millis(50)).await;
    let first = tokio::spawn(post(addr, "/", encode_request(&key, 1, b"first ")));

    let mut got = Vec::new();
    while got.len() < 13 {
        let chunk = recorded
            .recv()
            .timeout(Duration::from_secs(2))
            .await
            .anyerr()?
            .expect("recording server alive");
        got.extend_from_slice(&chunk);
    }
    assert_eq!(got, b"first second ");

    // Nothing came back from downstream, both complete as heartbeats.
    for task in [first, second] {
        let (status, body) = task.await.anyerr()??;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(decode_reply(body), Ok(None));
    }
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_reply_carries_serial() -> Result {
    let (echo_addr, _echo_task) = spawn_echo_server().await?;
    let reverse = spawn_reverse_proxy(echo_addr, Default::default()).await?;
    let addr = reverse.local_addr();
    let key = create_raw_tunnel(addr).await?;

    let (status, body) = post(addr, "/", encode_request(&key, 1, b"echo me")).await?;
    assert_eq!(status, StatusCode::OK);
    let (serial, payload) = decode_reply(body).expect("well formed").expect("not empty");
    assert_eq!(serial, 1);
    assert_eq!(&payload[..], b"echo me");
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_unknown_key_is_not_found() -> Result {
    let (echo_addr, _echo_task) = spawn_echo_server().await?;
    let reverse = spawn_reverse_proxy(echo_addr, Default::default()).await?;

    let key = TunnelKey::generate();
    let (status, _) = post(reverse.local_addr(), "/", encode_request(&key, 1, b"")).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_malformed_bodies() -> Result {
    let (echo_addr, _echo_task) = spawn_echo_server().await?;
    let reverse = spawn_reverse_proxy(echo_addr, Default::default()).await?;
    let addr = reverse.local_addr();

    let (status, _) = post(addr, "/", Bytes::from_static(b"too short")).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // A registered key without a serial.
    let key = create_raw_tunnel(addr).await?;
    let (status, _) = post(addr, "/", Bytes::copy_from_slice(key.as_bytes())).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // A legitimate but unknown key with a truncated serial is malformed.
    let mut body = TunnelKey::generate().as_bytes().to_vec();
    body.extend_from_slice(&[1, 0, 0]);
    let (status, _) = post(addr, "/", Bytes::from(body)).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Long enough but not a key: plain web server behavior.
    let (status, _) = post(addr, "/", Bytes::from(vec![b'z'; KEY_LEN + 8])).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_ping_fallback() -> Result {
    let (echo_addr, _echo_task) = spawn_echo_server().await?;
    let reverse = spawn_reverse_proxy(echo_addr, Default::default()).await?;

    let res = reqwest::get(format!("http://{}/ping", reverse.local_addr()))
        .await
        .anyerr()?;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.anyerr()?, "pong");

    let (status, _) = post(reverse.local_addr(), "/elsewhere", Bytes::new()).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_custom_fallback() -> Result {
    let (echo_addr, _echo_task) = spawn_echo_server().await?;
    let proxy = ReverseProxy::new(echo_addr.into(), Default::default()).with_fallback(NotFound);
    let reverse = proxy.spawn("127.0.0.1:0".parse().anyerr()?).await?;

    let res = reqwest::get(format!("http://{}/ping", reverse.local_addr()))
        .await
        .anyerr()?;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_oversized_body_rejected() -> Result {
    let (echo_addr, _echo_task) = spawn_echo_server().await?;
    let opts = ReverseProxyOpts {
        max_body_len: 1024,
        ..Default::default()
    };
    let reverse = spawn_reverse_proxy(echo_addr, opts).await?;
    let (status, _) = post(reverse.local_addr(), "/", Bytes::from(vec![0u8; 4096])).await?;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_dial_failure() -> Result {
    let dest = closed_port().await?;
    let reverse = spawn_reverse_proxy(dest, Default::default()).await?;

    let (status, body) = post(reverse.local_addr(), "/create", Bytes::new()).await?;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body.is_empty());
    assert_eq!(reverse.proxy().tunnel_count(), 0);

    // The forward side surfaces it as an error too.
    let forward = ForwardProxy::new(reverse.local_addr().into(), Default::default())?;
    assert!(forward.create_tunnel().await.is_err());
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_downstream_death() -> Result {
    let (dest, _dest_task) = spawn_hangup_server(Duration::from_millis(200)).await?;
    let reverse = spawn_reverse_proxy(dest, Default::default()).await?;
    let addr = reverse.local_addr();
    let key = create_raw_tunnel(addr).await?;

    // Parked until downstream goes away, then completed empty.
    let start = Instant::now();
    let parked = tokio::spawn(post(addr, "/", encode_request(&key, 1, b"")));
    let proxy = reverse.proxy().clone();
    eventually(Duration::from_secs(1), "parked request", || {
        parked.is_finished() || proxy.parked_requests(&key) == Some(1)
    })
    .await?;
    let (status, body) = parked.await.anyerr()??;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());
    assert!(start.elapsed() < Duration::from_secs(5));

    // Once the tunnel is unregistered, packets see 404.
    let mut serial = 2;
    loop {
        let (status, body) = post(addr, "/", encode_request(&key, serial, b"late")).await?;
        if status == StatusCode::NOT_FOUND {
            break;
        }
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());
        assert!(start.elapsed() < Duration::from_secs(5), "tunnel never went away");
        serial += 1;
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!reverse.proxy().has_tunnel(&key));
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_downstream_death_closes_local_connection() -> Result {
    let (dest, _dest_task) = spawn_exchange_server(1024).await?;
    let opts = ReverseProxyOpts {
        poll_dur: Duration::from_secs(1),
        ..Default::default()
    };
    let (reverse, forward) = spawn_tunnel_with(dest, opts).await?;

    let mut conn = TcpStream::connect(forward.local_addr()).await?;
    conn.write_all(&[b'u'; 1024]).await?;
    assert_eq!(read_exactly(&mut conn, 1024).await?, vec![b'd'; 1024]);

    let mut buf = [0u8; 16];
    let n = conn
        .read(&mut buf)
        .timeout(Duration::from_secs(5))
        .await
        .anyerr()??;
    assert_eq!(n, 0, "local connection closed after downstream died");
    let proxy = reverse.proxy().clone();
    eventually(Duration::from_secs(5), "tunnel removal", || {
        proxy.tunnel_count() == 0
    })
    .await?;
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_orphaned_serial_completes() -> Result {
    let (rec_addr, _recorded, _rec_task) = spawn_recording_server().await?;
    let opts = ReverseProxyOpts {
        poll_dur: Duration::from_millis(200),
        ..Default::default()
    };
    let reverse = spawn_reverse_proxy(rec_addr, opts).await?;
    let addr = reverse.local_addr();
    let key = create_raw_tunnel(addr).await?;

    // Serial 1 never arrives.
    let start = Instant::now();
    let (status, body) = post(addr, "/", encode_request(&key, 2, b"early")).await?;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());
    assert!(start.elapsed() < Duration::from_secs(1));

    let proxy = reverse.proxy().clone();
    eventually(Duration::from_secs(3), "tunnel removal", || {
        !proxy.has_tunnel(&key)
    })
    .await?;
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_close_tunnel_is_idempotent() -> Result {
    let (echo_addr, _echo_task) = spawn_echo_server().await?;
    let proxy = ReverseProxy::new(echo_addr.into(), Default::default());

    let key = proxy.create_tunnel().await?;
    assert!(proxy.has_tunnel(&key));
    assert!(proxy.close_tunnel(&key));
    assert!(!proxy.close_tunnel(&key));
    assert!(!proxy.has_tunnel(&key));
    assert_eq!(proxy.tunnel_count(), 0);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_idle_tunnel_is_removed() -> Result {
    let (echo_addr, _echo_task) = spawn_echo_server().await?;
    let opts = ReverseProxyOpts {
        inactive_shutdown: Duration::from_millis(100),
        ..Default::default()
    };
    let proxy = ReverseProxy::new(echo_addr.into(), opts);
    let key = proxy.create_tunnel().await?;

    let start = Instant::now();
    while proxy.has_tunnel(&key) {
        assert!(start.elapsed() < Duration::from_secs(3), "idle tunnel kept alive");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}
