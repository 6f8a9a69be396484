//! DNS query forwarding
//!
//! UDP/53 sessions carry length-prefixed DNS messages, which is already the
//! DNS-over-TCP framing. Each query chunk is written to a fresh TCP
//! connection to the upstream and every response byte is relayed back.

use crate::outbound::Dialer;
use crate::tunnel::ClientWriter;
use crate::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

const RESPONSE_BUFFER_SIZE: usize = 4096;

/// Forwards raw DNS queries to a fixed TCP upstream
pub struct DnsForwarder {
    upstream: SocketAddr,
    dialer: Arc<dyn Dialer>,
}

impl DnsForwarder {
    pub fn new(upstream: SocketAddr, dialer: Arc<dyn Dialer>) -> Self {
        DnsForwarder { upstream, dialer }
    }

    pub fn upstream(&self) -> SocketAddr {
        self.upstream
    }

    /// One query exchange. Returns the number of response bytes relayed.
    pub async fn forward(&self, query: &[u8], client: &mut ClientWriter) -> Result<u64> {
        let host = self.upstream.ip().to_string();
        let mut stream = self.dialer.dial(&host, self.upstream.port()).await?;
        stream.write_all(query).await?;

        let mut buf = vec![0u8; RESPONSE_BUFFER_SIZE];
        let mut relayed = 0u64;
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            client.send(&buf[..n]).await?;
            relayed += n as u64;
        }

        debug!("DNS exchange via {}: {} -> {} bytes", self.upstream, query.len(), relayed);
        Ok(relayed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::ProxyConnection;
    use crate::tunnel::ClientSink;
    use crate::Error;
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::channel::mpsc;
    use futures::{SinkExt, StreamExt};

    /// Upstream that answers each query with `resp:` + query, then closes
    struct AnsweringDialer;

    #[async_trait]
    impl Dialer for AnsweringDialer {
        async fn dial(&self, host: &str, port: u16) -> Result<Box<dyn ProxyConnection>> {
            assert_eq!((host, port), ("8.8.4.4", 53));
            let (client, mut server) = tokio::io::duplex(1024);
            tokio::spawn(async move {
                let mut buf = [0u8; 256];
                let n = server.read(&mut buf).await.unwrap();
                let mut answer = b"resp:".to_vec();
                answer.extend_from_slice(&buf[..n]);
                server.write_all(&answer).await.unwrap();
            });
            Ok(Box::new(client))
        }
    }

    fn writer(header: Option<Vec<u8>>) -> (ClientWriter, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded::<Bytes>();
        let sink: ClientSink = Box::pin(tx.sink_map_err(|e| Error::connection(e.to_string())));
        (ClientWriter::new(sink, header), rx)
    }

    #[tokio::test]
    async fn test_header_prefixed_on_first_exchange_only() {
        let forwarder = DnsForwarder::new("8.8.4.4:53".parse().unwrap(), Arc::new(AnsweringDialer));
        let (mut client, mut rx) = writer(Some(vec![0, 0]));

        let n = forwarder.forward(b"q1", &mut client).await.unwrap();
        assert_eq!(n, 7);
        forwarder.forward(b"q2", &mut client).await.unwrap();

        assert_eq!(rx.next().await.unwrap(), Bytes::from_static(b"\x00\x00resp:q1"));
        assert_eq!(rx.next().await.unwrap(), Bytes::from_static(b"resp:q2"));
    }

    #[tokio::test]
    async fn test_upstream_failure_is_error() {
        struct Refusing;

        #[async_trait]
        impl Dialer for Refusing {
            async fn dial(&self, _host: &str, _port: u16) -> Result<Box<dyn ProxyConnection>> {
                Err(Error::connection("refused"))
            }
        }

        let forwarder = DnsForwarder::new("8.8.4.4:53".parse().unwrap(), Arc::new(Refusing));
        let (mut client, _rx) = writer(Some(vec![0, 0]));
        assert!(forwarder.forward(b"q", &mut client).await.is_err());
        assert!(client.header_pending());
    }
}
