//! VLESS-style header
//!
//! ```text
//! +-----+----------+--------+-----+-----+------+------+------+---------+
//! | ver | id (16)  | optlen | opt | cmd | port | atyp | addr | payload |
//! +-----+----------+--------+-----+-----+------+------+------+---------+
//! ```
//!
//! cmd: 1 TCP, 2 UDP. atyp: 1 IPv4, 2 domain, 3 IPv6.

use super::{AddressKind, HeaderReader};
use crate::common::crypto::format_identifier;
use crate::common::{Credentials, Destination, Network};
use crate::{Error, Result};
use bytes::Bytes;

/// Shortest header that can hold any address
const MIN_HEADER_LEN: usize = 24;

const CMD_TCP: u8 = 1;
const CMD_UDP: u8 = 2;

const ATYP_IPV4: u8 = 1;
const ATYP_DOMAIN: u8 = 2;
const ATYP_IPV6: u8 = 3;

/// Parsed VLESS request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlessRequest {
    pub version: u8,
    pub network: Network,
    pub destination: Destination,
    pub payload: Bytes,
}

impl VlessRequest {
    pub fn parse(chunk: &Bytes, credentials: &Credentials) -> Result<Self> {
        if chunk.len() < MIN_HEADER_LEN {
            return Err(Error::protocol("Invalid tunnel header"));
        }

        let mut reader = HeaderReader::new(chunk, 0);
        let version = reader.u8()?;

        let id: [u8; 16] = reader
            .take(16)?
            .try_into()
            .map_err(|_| Error::protocol("Invalid tunnel header"))?;
        if !credentials.matches_user_id(&format_identifier(&id)) {
            return Err(Error::protocol("Invalid tunnel header"));
        }

        let opt_len = reader.u8()? as usize;
        reader.skip(opt_len)?;

        let network = match reader.u8()? {
            CMD_TCP => Network::Tcp,
            CMD_UDP => Network::Udp,
            cmd => {
                return Err(Error::protocol(format!("Unsupported command {}", cmd)));
            }
        };

        let port = reader.u16_be()?;
        let kind = match reader.u8()? {
            ATYP_IPV4 => AddressKind::Ipv4,
            ATYP_DOMAIN => AddressKind::Domain,
            ATYP_IPV6 => AddressKind::Ipv6,
            atyp => {
                return Err(Error::protocol(format!("Invalid address type {}", atyp)));
            }
        };
        let host = reader.address(kind)?;

        Ok(VlessRequest {
            version,
            network,
            destination: Destination::new(host, port),
            payload: chunk.slice(reader.position()..),
        })
    }

    /// `[version, 0]`
    pub fn response_header(&self) -> [u8; 2] {
        [self.version, 0]
    }
}
