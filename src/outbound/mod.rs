//! Outbound transports
//!
//! Every network dial goes through a [`Dialer`]. Proxy handshakes layer on
//! top of a dialed transport through [`OutboundProxy`], and the
//! [`Connector`] decides which route a session takes.

pub mod connector;
mod direct;
mod http;
mod socks5;

pub use connector::{transition, ConnectEvent, ConnectState, Connector, Established, Route};
pub use direct::TcpDialer;
pub use http::HttpConnectProxy;
pub use socks5::Socks5Proxy;

use crate::common::Destination;
use crate::config::{ProxyAccount, ProxyKind};
use crate::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Trait for outbound connections
pub trait ProxyConnection: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> ProxyConnection for T {}

/// Opens raw transports to `host:port`
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, host: &str, port: u16) -> Result<Box<dyn ProxyConnection>>;
}

/// Proxy that tunnels one TCP stream through a dialed transport
#[async_trait]
pub trait OutboundProxy: Send + Sync {
    fn proxy_type(&self) -> ProxyKind;

    /// `host:port` of the proxy itself
    fn server(&self) -> String;

    /// Dial the proxy and ask it for `destination`
    async fn dial_tcp(
        &self,
        dialer: &dyn Dialer,
        destination: &Destination,
    ) -> Result<Box<dyn ProxyConnection>>;
}

/// Build the handshake implementation for a single-hop account
pub fn proxy_for_account(account: &ProxyAccount) -> Box<dyn OutboundProxy> {
    match account.kind {
        ProxyKind::Socks5 => Box::new(Socks5Proxy::from_account(account)),
        ProxyKind::Http => Box::new(HttpConnectProxy::from_account(account)),
    }
}
