use std::{net::SocketAddr, str::FromStr, time::Duration};

use clap::Parser;
use http_chaser::{Addr, ForwardProxy, ForwardProxyOpts, ReverseProxy, ReverseProxyOpts};
use n0_error::Result;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
enum Cli {
    /// Spawn a local TCP echo server.
    Echo {
        #[clap(short, long, default_value_t = 0)]
        port: u16,
    },
    /// Spawn a reverse proxy that relays tunnels to a downstream TCP server.
    Reverse {
        #[clap(short, long, default_value_t = 8080)]
        port: u16,
        /// Downstream address (e.g. "127.0.0.1:22").
        dest: String,
        /// Long-poll duration in seconds.
        #[clap(long, default_value_t = 30)]
        poll_secs: u64,
    },
    /// Spawn a forward proxy that tunnels local connections to a reverse proxy.
    Forward {
        #[clap(short, long, default_value_t = 0)]
        port: u16,
        /// Reverse proxy address (e.g. "example.com:8080").
        reverse: String,
    },
    /// Spawn echo server, reverse proxy and forward proxy in one process.
    Demo {
        #[clap(short, long, default_value_t = 0)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();
    match cli {
        Cli::Echo { port } => cmd_echo(port).await,
        Cli::Reverse {
            port,
            dest,
            poll_secs,
        } => cmd_reverse(port, dest, poll_secs).await,
        Cli::Forward { port, reverse } => cmd_forward(port, reverse).await,
        Cli::Demo { port } => cmd_demo(port).await,
    }
}

async fn cmd_echo(port: u16) -> Result<()> {
    let listener = TcpListener::bind(format!("127.0.0.1:{port}")).await?;
    println!("echo listening on {}", listener.local_addr()?);
    tokio::select! {
        res = echo_server(listener) => res?,
        _ = tokio::signal::ctrl_c() => {}
    }
    Ok(())
}

async fn echo_server(listener: TcpListener) -> Result<()> {
    loop {
        let (mut stream, addr) = listener.accept().await?;
        info!(%addr, "echo connection");
        tokio::spawn(async move {
            let (mut read, mut write) = stream.split();
            if let Err(err) = tokio::io::copy(&mut read, &mut write).await {
                warn!(%addr, "echo failed: {err:#}");
            }
        });
    }
}

async fn cmd_reverse(port: u16, dest: String, poll_secs: u64) -> Result<()> {
    let dest = Addr::from_str(&dest)?;
    let opts = ReverseProxyOpts {
        poll_dur: Duration::from_secs(poll_secs),
        ..Default::default()
    };
    let proxy = ReverseProxy::new(dest, opts);
    let handle = proxy.spawn(SocketAddr::from(([0, 0, 0, 0], port))).await?;
    println!("reverse proxy listening on {}", handle.local_addr());
    tokio::signal::ctrl_c().await?;
    handle.close().await;
    Ok(())
}

async fn cmd_forward(port: u16, reverse: String) -> Result<()> {
    let reverse = Addr::from_str(&reverse)?;
    let opts = ForwardProxyOpts {
        listen: SocketAddr::from(([127, 0, 0, 1], port)),
        ..Default::default()
    };
    let proxy = ForwardProxy::new(reverse, opts)?;
    let handle = proxy.spawn().await?;
    println!("forward proxy listening on {}", handle.local_addr());
    tokio::signal::ctrl_c().await?;
    handle.close();
    Ok(())
}

async fn cmd_demo(port: u16) -> Result<()> {
    let echo = TcpListener::bind("127.0.0.1:0").await?;
    let echo_addr = echo.local_addr()?;
    tokio::spawn(async move {
        if let Err(err) = echo_server(echo).await {
            warn!("echo server failed: {err:#}");
        }
    });

    let reverse = ReverseProxy::new(echo_addr.into(), Default::default());
    let reverse = reverse.spawn(SocketAddr::from(([127, 0, 0, 1], 0))).await?;

    let opts = ForwardProxyOpts {
        listen: SocketAddr::from(([127, 0, 0, 1], port)),
        ..Default::default()
    };
    let forward = ForwardProxy::new(reverse.local_addr().into(), opts)?;
    let forward = forward.spawn().await?;
    println!(
        "connect to {} to talk to the echo server at {echo_addr} via {}",
        forward.local_addr(),
        reverse.local_addr()
    );
    tokio::signal::ctrl_c().await?;
    forward.close();
    reverse.close().await;
    Ok(())
}
