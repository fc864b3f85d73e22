//! TCP tunnels over long-polled HTTP POST exchanges.
//!
//! A [`ForwardProxy`] accepts local TCP connections and carries each one over
//! a series of HTTP requests to a [`ReverseProxy`], which relays it to a fixed
//! downstream TCP server. Between them only ordinary HTTP/1.1 POSTs travel, so
//! a tunnel survives proxies and firewalls that only pass web traffic.

mod addr;
mod error;
pub mod forward;
mod key;
pub mod reverse;
mod util;
pub mod wire;

#[cfg(test)]
mod tests;

pub use self::{
    addr::Addr,
    error::TunnelError,
    forward::{ForwardHandle, ForwardProxy, ForwardProxyOpts},
    key::{KEY_LEN, TunnelKey},
    reverse::{ReverseHandle, ReverseProxy, ReverseProxyOpts},
};
