//! Trojan-style header
//!
//! ```text
//! +-----------------------+------+-----+------+------+------+------+---------+
//! | hex(SHA224(id)) (56)  | CRLF | cmd | atyp | addr | port | CRLF | payload |
//! +-----------------------+------+-----+------+------+------+------+---------+
//! ```

use super::{AddressKind, HeaderReader};
use crate::common::crypto::DIGEST_HEX_LEN;
use crate::common::{Credentials, Destination};
use crate::{Error, Result};
use bytes::Bytes;

const CMD_CONNECT: u8 = 1;

const ATYP_IPV4: u8 = 1;
const ATYP_DOMAIN: u8 = 3;
const ATYP_IPV6: u8 = 4;

/// cmd, atyp, one address byte, port, CRLF
const MIN_REQUEST_LEN: usize = 6;

/// Digest followed by CRLF
pub fn is_trojan_header(chunk: &[u8]) -> bool {
    chunk.len() >= DIGEST_HEX_LEN + 2
        && chunk[DIGEST_HEX_LEN] == b'\r'
        && chunk[DIGEST_HEX_LEN + 1] == b'\n'
}

/// Parsed Trojan request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrojanRequest {
    pub destination: Destination,
    pub payload: Bytes,
}

impl TrojanRequest {
    pub fn parse(chunk: &Bytes, credentials: &Credentials) -> Result<Self> {
        if !is_trojan_header(chunk) {
            return Err(Error::protocol("Invalid tunnel header"));
        }
        if !credentials.matches_trojan_hash(&chunk[..DIGEST_HEX_LEN]) {
            return Err(Error::protocol("Invalid tunnel header"));
        }

        let request_start = DIGEST_HEX_LEN + 2;
        if chunk.len() - request_start < MIN_REQUEST_LEN {
            return Err(Error::protocol("Invalid tunnel header"));
        }

        let mut reader = HeaderReader::new(chunk, request_start);
        let cmd = reader.u8()?;
        if cmd != CMD_CONNECT {
            return Err(Error::protocol(format!("Unsupported command {}", cmd)));
        }

        let kind = match reader.u8()? {
            ATYP_IPV4 => AddressKind::Ipv4,
            ATYP_DOMAIN => AddressKind::Domain,
            ATYP_IPV6 => AddressKind::Ipv6,
            atyp => {
                return Err(Error::protocol(format!("Invalid address type {}", atyp)));
            }
        };
        let host = reader.address(kind)?;
        let port = reader.u16_be()?;

        // CRLF filler; tolerate a chunk that ends right after the port
        let payload_start = (reader.position() + 2).min(chunk.len());

        Ok(TrojanRequest {
            destination: Destination::new(host, port),
            payload: chunk.slice(payload_start..),
        })
    }
}
