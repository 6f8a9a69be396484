//! HTTP CONNECT proxy outbound
//!
//! Used both for single-hop HTTP accounts and for the two-hop intermediary.

use super::{Dialer, OutboundProxy, ProxyConnection};
use crate::common::net::PrefixedStream;
use crate::common::Destination;
use crate::config::{ProxyAccount, ProxyKind, TwoHopProxy};
use crate::{Error, Result};
use async_trait::async_trait;
use base64::Engine;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Upper bound on the CONNECT response header
const MAX_RESPONSE_HEADER: usize = 8192;

const MAX_RESPONSE_HEADERS: usize = 32;

/// HTTP CONNECT proxy outbound
#[derive(Debug, Clone)]
pub struct HttpConnectProxy {
    server: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
}

impl HttpConnectProxy {
    pub fn new(
        server: String,
        port: u16,
        username: Option<String>,
        password: Option<String>,
    ) -> Self {
        HttpConnectProxy {
            server,
            port,
            username,
            password,
        }
    }

    pub fn from_account(account: &ProxyAccount) -> Self {
        let (username, password) = match account.credentials() {
            Some((user, pass)) => (Some(user.to_string()), Some(pass.to_string())),
            None => (None, None),
        };
        Self::new(account.hostname.clone(), account.port, username, password)
    }

    pub fn from_two_hop(proxy: &TwoHopProxy) -> Self {
        let (username, password) = match proxy.credentials() {
            Some((user, pass)) => (Some(user.to_string()), Some(pass.to_string())),
            None => (None, None),
        };
        Self::new(proxy.hostname.clone(), proxy.port, username, password)
    }

    /// Build the Proxy-Authorization header value
    fn auth_header(&self) -> Option<String> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => {
                let credentials = format!("{}:{}", user, pass);
                let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
                Some(format!("Basic {}", encoded))
            }
            _ => None,
        }
    }

    fn connect_request(&self, target: &str) -> String {
        let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", target, target);
        if let Some(auth) = self.auth_header() {
            request.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
        }
        request.push_str("User-Agent: Mozilla/5.0\r\nConnection: keep-alive\r\n\r\n");
        request
    }

    /// Perform the CONNECT handshake.
    ///
    /// Returns whatever the proxy sent past the response header.
    pub async fn http_connect<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        stream: &mut S,
        destination: &Destination,
    ) -> Result<Vec<u8>> {
        let target = destination.to_string();
        debug!("[{}] Sending CONNECT to {}", self.server(), target);

        stream
            .write_all(self.connect_request(&target).as_bytes())
            .await
            .map_err(|e| Error::proxy(format!("Failed to send CONNECT request: {}", e)))?;
        stream.flush().await?;

        let mut response = vec![0u8; MAX_RESPONSE_HEADER];
        let mut total_read = 0;

        loop {
            let n = stream
                .read(&mut response[total_read..])
                .await
                .map_err(|e| Error::proxy(format!("Failed to read CONNECT response: {}", e)))?;

            if n == 0 {
                return Err(Error::proxy("Connection closed during CONNECT"));
            }
            total_read += n;

            if let Some(header_end) = find_header_end(&response[..total_read]) {
                let code = parse_status(&response[..header_end])?;
                if !(200..300).contains(&code) {
                    return Err(Error::proxy(format!("CONNECT failed with status {}", code)));
                }
                debug!("[{}] CONNECT handshake successful ({})", self.server(), code);
                return Ok(response[header_end..total_read].to_vec());
            }

            if total_read >= MAX_RESPONSE_HEADER {
                return Err(Error::proxy("CONNECT response too large"));
            }
        }
    }
}

fn parse_status(header: &[u8]) -> Result<u16> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
    let mut parsed = httparse::Response::new(&mut headers);
    match parsed.parse(header) {
        Ok(httparse::Status::Complete(_)) => parsed
            .code
            .ok_or_else(|| Error::proxy("CONNECT response without status")),
        Ok(httparse::Status::Partial) => Err(Error::proxy("Incomplete CONNECT response")),
        Err(e) => Err(Error::proxy(format!("Invalid CONNECT response: {}", e))),
    }
}

/// Offset just past the first CRLFCRLF
pub fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| i + 4)
}

#[async_trait]
impl OutboundProxy for HttpConnectProxy {
    fn proxy_type(&self) -> ProxyKind {
        ProxyKind::Http
    }

    fn server(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }

    async fn dial_tcp(
        &self,
        dialer: &dyn Dialer,
        destination: &Destination,
    ) -> Result<Box<dyn ProxyConnection>> {
        debug!("HTTP proxy connecting to {} via {}", destination, self.server());

        let mut stream = dialer.dial(&self.server, self.port).await?;
        let leftover = self.http_connect(&mut stream, destination).await?;
        if leftover.is_empty() {
            Ok(stream)
        } else {
            Ok(Box::new(PrefixedStream::new(leftover, stream)))
        }
    }
}
