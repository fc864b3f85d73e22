use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    str::FromStr,
};

use n0_error::{Result, StackResultExt, StdResultExt, ensure_any};

/// Host, optional resolved IP and port of a TCP endpoint.
///
/// Renders canonically as `ip:port` once an IP is known, otherwise as
/// `host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Addr {
    /// Hostname or IP literal without brackets.
    pub host: String,
    /// Resolved IP, if any.
    pub ip: Option<IpAddr>,
    /// Port number in host byte order.
    pub port: u16,
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            Some(ip) => fmt::Display::fmt(&SocketAddr::new(ip, self.port), f),
            None => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

impl From<SocketAddr> for Addr {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            ip: Some(addr.ip()),
            port: addr.port(),
        }
    }
}

impl FromStr for Addr {
    type Err = n0_error::AnyError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = SocketAddr::from_str(s) {
            return Ok(addr.into());
        }
        let (host, port) = s.rsplit_once(':').context("Expected host:port")?;
        ensure_any!(!host.is_empty(), "Expected non-empty host");
        let port = u16::from_str(port).std_context("Invalid port")?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        Ok(Self {
            host: host.to_string(),
            ip: IpAddr::from_str(host).ok(),
            port,
        })
    }
}

impl Addr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let ip = IpAddr::from_str(&host).ok();
        Self { host, ip, port }
    }

    /// Returns a socket address if the IP is already known.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.ip.map(|ip| SocketAddr::new(ip, self.port))
    }

    /// Base URL of an HTTP server listening on this address.
    pub(crate) fn http_base(&self) -> String {
        format!("http://{self}")
    }
}
