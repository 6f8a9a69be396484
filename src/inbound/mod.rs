//! Inbound side: WebSocket entry and tunnel header parsing
//!
//! The first client chunk of a session carries either a VLESS-style header
//! or a Trojan-style header. Classification and parsing happen once; later
//! chunks are passed through untouched.

mod trojan;
mod vless;
mod websocket;

pub use trojan::{is_trojan_header, TrojanRequest};
pub use vless::VlessRequest;
pub use websocket::{client_ip, decode_early_data, EntryState, WebSocketListener};

use crate::common::{Credentials, Destination, Network, ProtocolKind};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;

/// Trait for inbound listeners
#[async_trait]
pub trait InboundListener: Send + Sync {
    /// Get listener name
    fn name(&self) -> &str;

    /// Start the listener
    async fn start(&self) -> Result<()>;

    /// Stop the listener
    async fn stop(&self) -> Result<()>;

    /// Check if listener is running
    fn is_running(&self) -> bool;
}

/// Parsed first chunk of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundRequest {
    Vless(VlessRequest),
    Trojan(TrojanRequest),
}

impl InboundRequest {
    pub fn protocol(&self) -> ProtocolKind {
        match self {
            InboundRequest::Vless(_) => ProtocolKind::Vless,
            InboundRequest::Trojan(_) => ProtocolKind::Trojan,
        }
    }

    pub fn network(&self) -> Network {
        match self {
            InboundRequest::Vless(req) => req.network,
            InboundRequest::Trojan(_) => Network::Tcp,
        }
    }

    pub fn destination(&self) -> &Destination {
        match self {
            InboundRequest::Vless(req) => &req.destination,
            InboundRequest::Trojan(req) => &req.destination,
        }
    }

    /// Bytes after the header, destined for the remote
    pub fn payload(&self) -> &Bytes {
        match self {
            InboundRequest::Vless(req) => &req.payload,
            InboundRequest::Trojan(req) => &req.payload,
        }
    }

    /// Header to prefix onto the first response chunk
    pub fn response_header(&self) -> Option<Vec<u8>> {
        match self {
            InboundRequest::Vless(req) => Some(req.response_header().to_vec()),
            InboundRequest::Trojan(_) => None,
        }
    }
}

/// Classify and parse the first chunk of a session
pub fn parse_request(chunk: &Bytes, credentials: &Credentials) -> Result<InboundRequest> {
    if is_trojan_header(chunk) {
        TrojanRequest::parse(chunk, credentials).map(InboundRequest::Trojan)
    } else {
        VlessRequest::parse(chunk, credentials).map(InboundRequest::Vless)
    }
}

/// `host` equals a blocked name or is a subdomain of one
pub fn is_blocked_host(host: &str, blocked: &[String]) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    blocked.iter().any(|b| {
        let b = b.to_ascii_lowercase();
        host == b
            || host
                .strip_suffix(b.as_str())
                .map_or(false, |prefix| prefix.ends_with('.'))
    })
}

/// Address encodings shared by both header formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AddressKind {
    Ipv4,
    Domain,
    Ipv6,
}

/// Bounds-checked cursor over a header
pub(crate) struct HeaderReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> HeaderReader<'a> {
    pub(crate) fn new(buf: &'a [u8], pos: usize) -> Self {
        HeaderReader { buf, pos }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| Error::protocol("Truncated header"))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16_be(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Read an address of `kind`. Empty addresses are rejected.
    pub(crate) fn address(&mut self, kind: AddressKind) -> Result<String> {
        let host = match kind {
            AddressKind::Ipv4 => {
                let b = self.take(4)?;
                format!("{}.{}.{}.{}", b[0], b[1], b[2], b[3])
            }
            AddressKind::Domain => {
                let len = self.u8()? as usize;
                String::from_utf8_lossy(self.take(len)?).into_owned()
            }
            AddressKind::Ipv6 => {
                let b = self.take(16)?;
                b.chunks_exact(2)
                    .map(|pair| format!("{:x}", u16::from_be_bytes([pair[0], pair[1]])))
                    .collect::<Vec<_>>()
                    .join(":")
            }
        };

        if host.is_empty() {
            return Err(Error::protocol("Empty destination address"));
        }
        Ok(host)
    }
}
