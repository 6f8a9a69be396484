//! SOCKS5 proxy outbound
//!
//! Implements the CONNECT subset of RFC 1928 with RFC 1929 password auth.

use super::{Dialer, OutboundProxy, ProxyConnection};
use crate::common::Destination;
use crate::config::{ProxyAccount, ProxyKind};
use crate::{Error, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// SOCKS5 version
const SOCKS5_VERSION: u8 = 0x05;

/// SOCKS5 authentication methods
const AUTH_NONE: u8 = 0x00;
const AUTH_PASSWORD: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

/// RFC 1929 sub-negotiation version
const AUTH_VERSION: u8 = 0x01;

const CMD_CONNECT: u8 = 0x01;

/// SOCKS5 address types
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// SOCKS5 reply codes
const REP_SUCCESS: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_CONNECTION_NOT_ALLOWED: u8 = 0x02;
const REP_NETWORK_UNREACHABLE: u8 = 0x03;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_CONNECTION_REFUSED: u8 = 0x05;
const REP_TTL_EXPIRED: u8 = 0x06;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// SOCKS5 proxy outbound
#[derive(Debug, Clone)]
pub struct Socks5Proxy {
    server: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
}

impl Socks5Proxy {
    pub fn new(
        server: String,
        port: u16,
        username: Option<String>,
        password: Option<String>,
    ) -> Self {
        Socks5Proxy {
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

    /// Perform the SOCKS5 handshake and CONNECT to `host:port`.
    ///
    /// The destination is always sent as a domain name.
    pub async fn socks5_connect<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        stream: &mut S,
        host: &str,
        port: u16,
    ) -> Result<()> {
        let greeting: &[u8] = if self.username.is_some() && self.password.is_some() {
            &[SOCKS5_VERSION, 2, AUTH_NONE, AUTH_PASSWORD]
        } else {
            &[SOCKS5_VERSION, 1, AUTH_NONE]
        };

        stream
            .write_all(greeting)
            .await
            .map_err(|e| Error::proxy(format!("Failed to send SOCKS5 greeting: {}", e)))?;

        let mut response = [0u8; 2];
        stream
            .read_exact(&mut response)
            .await
            .map_err(|e| Error::proxy(format!("Failed to read SOCKS5 response: {}", e)))?;

        if response[0] != SOCKS5_VERSION {
            return Err(Error::proxy("Invalid SOCKS5 version"));
        }

        match response[1] {
            AUTH_NONE => {
                debug!("[{}] No authentication required", self.server());
            }
            AUTH_PASSWORD => {
                debug!("[{}] Using password authentication", self.server());
                self.authenticate_password(stream).await?;
            }
            AUTH_NO_ACCEPTABLE => {
                return Err(Error::auth("No acceptable authentication method"));
            }
            method => {
                return Err(Error::proxy(format!(
                    "Unsupported authentication method: {}",
                    method
                )));
            }
        }

        if host.len() > 255 {
            return Err(Error::proxy("Domain name too long"));
        }

        let mut request = Vec::with_capacity(7 + host.len());
        request.extend_from_slice(&[SOCKS5_VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN]);
        request.push(host.len() as u8);
        request.extend_from_slice(host.as_bytes());
        request.extend_from_slice(&port.to_be_bytes());

        stream
            .write_all(&request)
            .await
            .map_err(|e| Error::proxy(format!("Failed to send SOCKS5 connect request: {}", e)))?;

        let mut reply = [0u8; 4];
        stream
            .read_exact(&mut reply)
            .await
            .map_err(|e| Error::proxy(format!("Failed to read SOCKS5 reply: {}", e)))?;

        if reply[0] != SOCKS5_VERSION {
            return Err(Error::proxy("Invalid SOCKS5 version in reply"));
        }

        if reply[1] != REP_SUCCESS {
            return Err(Error::proxy(Self::reply_error_message(reply[1])));
        }

        // Skip bound address
        match reply[3] {
            ATYP_IPV4 => {
                let mut buf = [0u8; 4 + 2];
                stream.read_exact(&mut buf).await?;
            }
            ATYP_IPV6 => {
                let mut buf = [0u8; 16 + 2];
                stream.read_exact(&mut buf).await?;
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                let mut buf = vec![0u8; len[0] as usize + 2];
                stream.read_exact(&mut buf).await?;
            }
            _ => {
                return Err(Error::proxy("Invalid address type in reply"));
            }
        }

        debug!("[{}] SOCKS5 connected to {}:{}", self.server(), host, port);
        Ok(())
    }

    async fn authenticate_password<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        stream: &mut S,
    ) -> Result<()> {
        let username = self
            .username
            .as_ref()
            .ok_or_else(|| Error::auth("Username required for authentication"))?;
        let password = self
            .password
            .as_ref()
            .ok_or_else(|| Error::auth("Password required for authentication"))?;

        if username.len() > 255 || password.len() > 255 {
            return Err(Error::auth("Username or password too long"));
        }

        let mut auth_request = Vec::with_capacity(3 + username.len() + password.len());
        auth_request.push(AUTH_VERSION);
        auth_request.push(username.len() as u8);
        auth_request.extend_from_slice(username.as_bytes());
        auth_request.push(password.len() as u8);
        auth_request.extend_from_slice(password.as_bytes());

        stream.write_all(&auth_request).await?;

        let mut response = [0u8; 2];
        stream.read_exact(&mut response).await?;

        if response[1] != 0x00 {
            return Err(Error::auth("SOCKS5 authentication failed"));
        }

        debug!("[{}] Password authentication successful", self.server());
        Ok(())
    }

    fn reply_error_message(code: u8) -> String {
        match code {
            REP_GENERAL_FAILURE => "General SOCKS server failure".to_string(),
            REP_CONNECTION_NOT_ALLOWED => "Connection not allowed by ruleset".to_string(),
            REP_NETWORK_UNREACHABLE => "Network unreachable".to_string(),
            REP_HOST_UNREACHABLE => "Host unreachable".to_string(),
            REP_CONNECTION_REFUSED => "Connection refused".to_string(),
            REP_TTL_EXPIRED => "TTL expired".to_string(),
            REP_COMMAND_NOT_SUPPORTED => "Command not supported".to_string(),
            REP_ADDRESS_TYPE_NOT_SUPPORTED => "Address type not supported".to_string(),
            _ => format!("Unknown error: {}", code),
        }
    }
}

#[async_trait]
impl OutboundProxy for Socks5Proxy {
    fn proxy_type(&self) -> ProxyKind {
        ProxyKind::Socks5
    }

    fn server(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }

    async fn dial_tcp(
        &self,
        dialer: &dyn Dialer,
        destination: &Destination,
    ) -> Result<Box<dyn ProxyConnection>> {
        debug!(
            "SOCKS5 proxy connecting to {} via {}",
            destination,
            self.server()
        );

        let mut stream = dialer.dial(&self.server, self.port).await?;
        self.socks5_connect(&mut stream, &destination.host, destination.port)
            .await?;
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    fn connect_request(host: &str, port: u16) -> Vec<u8> {
        let mut req = vec![5, 1, 0, 3, host.len() as u8];
        req.extend_from_slice(host.as_bytes());
        req.extend_from_slice(&port.to_be_bytes());
        req
    }

    #[test]
    fn test_reply_error_messages() {
        assert_eq!(
            Socks5Proxy::reply_error_message(REP_CONNECTION_REFUSED),
            "Connection refused"
        );
        assert_eq!(
            Socks5Proxy::reply_error_message(REP_NETWORK_UNREACHABLE),
            "Network unreachable"
        );
        assert_eq!(Socks5Proxy::reply_error_message(0x42), "Unknown error: 66");
    }

    #[tokio::test]
    async fn test_connect_without_auth() {
        let mut mock = Builder::new()
            .write(&[5, 1, 0])
            .read(&[5, 0])
            .write(&connect_request("example.org", 443))
            .read(&[5, 0, 0, 1, 127, 0, 0, 1, 0x1f, 0x90])
            .build();

        let proxy = Socks5Proxy::new("proxy.local".into(), 1080, None, None);
        proxy
            .socks5_connect(&mut mock, "example.org", 443)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_connect_with_password() {
        let mut mock = Builder::new()
            .write(&[5, 2, 0, 2])
            .read(&[5, 2])
            .write(&[1, 4, b'u', b's', b'e', b'r', 4, b'p', b'a', b's', b's'])
            .read(&[1, 0])
            .write(&connect_request("1.2.3.4", 80))
            .read(&[5, 0, 0, 3, 3, b'a', b'b', b'c', 0, 80])
            .build();

        let proxy = Socks5Proxy::new(
            "proxy.local".into(),
            1080,
            Some("user".into()),
            Some("pass".into()),
        );
        proxy.socks5_connect(&mut mock, "1.2.3.4", 80).await.unwrap();
    }

    #[tokio::test]
    async fn test_auth_rejected() {
        let mut mock = Builder::new()
            .write(&[5, 2, 0, 2])
            .read(&[5, 2])
            .write(&[1, 1, b'u', 1, b'p'])
            .read(&[1, 1])
            .build();

        let proxy = Socks5Proxy::new("proxy.local".into(), 1080, Some("u".into()), Some("p".into()));
        let err = proxy
            .socks5_connect(&mut mock, "example.org", 443)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }

    #[tokio::test]
    async fn test_password_requested_without_credentials() {
        let mut mock = Builder::new().write(&[5, 1, 0]).read(&[5, 2]).build();

        let proxy = Socks5Proxy::new("proxy.local".into(), 1080, None, None);
        let err = proxy
            .socks5_connect(&mut mock, "example.org", 443)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }

    #[tokio::test]
    async fn test_connect_refused_reply() {
        let mut mock = Builder::new()
            .write(&[5, 1, 0])
            .read(&[5, 0])
            .write(&connect_request("example.org", 443))
            .read(&[5, REP_CONNECTION_REFUSED, 0, 1])
            .build();

        let proxy = Socks5Proxy::new("proxy.local".into(), 1080, None, None);
        let err = proxy
            .socks5_connect(&mut mock, "example.org", 443)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Proxy error: Connection refused");
    }

    #[test]
    fn test_from_account() {
        let account = ProxyAccount {
            kind: ProxyKind::Socks5,
            username: Some("user".into()),
            password: Some(String::new()),
            hostname: "[2001:db8::1]".into(),
            port: 1080,
        };
        let proxy = Socks5Proxy::from_account(&account);
        assert!(proxy.username.is_none());
        assert_eq!(proxy.server(), "[2001:db8::1]:1080");
    }
}
