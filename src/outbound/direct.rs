//! Direct TCP dialer

use super::{Dialer, ProxyConnection};
use crate::common::net::{configure_tcp_stream, strip_brackets};
use crate::{Error, Result};
use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

/// Plain TCP dialer used in production
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

impl TcpDialer {
    pub fn new() -> Self {
        TcpDialer
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, host: &str, port: u16) -> Result<Box<dyn ProxyConnection>> {
        let host = strip_brackets(host);
        debug!("Dialing {}:{}", host, port);

        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| Error::connection(format!("Failed to connect to {}:{}: {}", host, port, e)))?;
        configure_tcp_stream(&stream);

        debug!("Connected to {}:{}", host, port);
        Ok(Box::new(stream))
    }
}
