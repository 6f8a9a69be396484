//! Client/remote stream bridge

use crate::outbound::ProxyConnection;
use crate::statistic::SessionHandle;
use crate::{Error, Result};
use bytes::{Bytes, BytesMut};
use futures::sink::Sink;
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

/// Remote read buffer size
const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Inbound half of a client session: one item per message
pub type ClientStream = BoxStream<'static, Result<Bytes>>;

/// Outbound half of a client session
pub type ClientSink = Pin<Box<dyn Sink<Bytes, Error = Error> + Send>>;

/// How a bridge ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeOutcome {
    /// Client stream ended or the client could not be written to
    ClientClosed,
    /// Remote hit EOF or failed; `relayed` tells whether any byte came back
    RemoteClosed { relayed: bool },
}

/// Client sink that prefixes the protocol response header onto the first
/// chunk sent
pub struct ClientWriter {
    sink: ClientSink,
    header: Option<Vec<u8>>,
}

impl ClientWriter {
    pub fn new(sink: ClientSink, header: Option<Vec<u8>>) -> Self {
        ClientWriter { sink, header }
    }

    pub async fn send(&mut self, chunk: &[u8]) -> Result<()> {
        let frame = match self.header.take() {
            Some(header) => {
                let mut buf = BytesMut::with_capacity(header.len() + chunk.len());
                buf.extend_from_slice(&header);
                buf.extend_from_slice(chunk);
                buf.freeze()
            }
            None => Bytes::copy_from_slice(chunk),
        };
        self.sink.send(frame).await
    }

    /// Whether the header is still waiting for the first chunk
    pub fn header_pending(&self) -> bool {
        self.header.is_some()
    }

    pub async fn close(&mut self) {
        if let Err(e) = self.sink.close().await {
            debug!("Client close failed: {}", e);
        }
    }
}

/// Pump data both ways until either side closes.
///
/// The upload pump writes client chunks to `remote` in order while the
/// download pump sends remote reads to the client in order. The two run
/// concurrently, so a blocked write in one direction never stalls the other.
/// Dropping `remote` on return aborts it.
pub async fn relay(
    client: &mut ClientStream,
    writer: &mut ClientWriter,
    remote: Box<dyn ProxyConnection>,
    handle: &SessionHandle,
) -> BridgeOutcome {
    let (mut remote_rd, mut remote_wr) = tokio::io::split(remote);
    let relayed = AtomicBool::new(false);

    let upload = async {
        while let Some(chunk) = client.next().await {
            let data = match chunk {
                Ok(data) => data,
                Err(e) => {
                    debug!("[{}] client stream error: {}", handle.id(), e);
                    return BridgeOutcome::ClientClosed;
                }
            };
            if let Err(e) = remote_wr.write_all(&data).await {
                debug!("[{}] remote write failed: {}", handle.id(), e);
                return BridgeOutcome::RemoteClosed {
                    relayed: relayed.load(Ordering::Acquire),
                };
            }
            handle.add_upload(data.len() as u64);
        }
        BridgeOutcome::ClientClosed
    };

    let download = async {
        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
        loop {
            match remote_rd.read(&mut buf).await {
                Ok(0) => {
                    return BridgeOutcome::RemoteClosed {
                        relayed: relayed.load(Ordering::Acquire),
                    }
                }
                Ok(n) => {
                    relayed.store(true, Ordering::Release);
                    handle.add_download(n as u64);
                    if let Err(e) = writer.send(&buf[..n]).await {
                        debug!("[{}] client send failed: {}", handle.id(), e);
                        return BridgeOutcome::ClientClosed;
                    }
                }
                Err(e) => {
                    debug!("[{}] remote read failed: {}", handle.id(), e);
                    return BridgeOutcome::RemoteClosed {
                        relayed: relayed.load(Ordering::Acquire),
                    };
                }
            }
        }
    };

    // First pump to finish decides the outcome
    tokio::select! {
        outcome = upload => outcome,
        outcome = download => outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Destination, Metadata, Network, ProtocolKind};
    use crate::statistic::StatisticManager;
    use futures::channel::mpsc;
    use std::sync::Arc;
    use std::time::Duration;

    fn channel_writer(header: Option<Vec<u8>>) -> (ClientWriter, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded::<Bytes>();
        let sink: ClientSink = Box::pin(tx.sink_map_err(|e| Error::connection(e.to_string())));
        (ClientWriter::new(sink, header), rx)
    }

    fn handle() -> SessionHandle {
        let manager = Arc::new(StatisticManager::new());
        manager.open(Metadata::new(
            ProtocolKind::Vless,
            Network::Tcp,
            Destination::new("example.org", 443),
        ))
    }

    #[tokio::test]
    async fn test_header_prefixed_once() {
        let (mut writer, mut rx) = channel_writer(Some(vec![0, 0]));
        assert!(writer.header_pending());

        writer.send(b"ab").await.unwrap();
        writer.send(b"cd").await.unwrap();
        assert!(!writer.header_pending());

        assert_eq!(rx.next().await.unwrap(), Bytes::from_static(&[0, 0, b'a', b'b']));
        assert_eq!(rx.next().await.unwrap(), Bytes::from_static(b"cd"));
    }

    #[tokio::test]
    async fn test_relay_echo_then_client_close() {
        let (mut writer, mut rx) = channel_writer(None);
        let (client_tx, client_rx) = mpsc::unbounded::<Result<Bytes>>();
        let mut client: ClientStream = client_rx.boxed();

        let (remote, mut peer) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let n = peer.read(&mut buf).await.unwrap();
            peer.write_all(&buf[..n]).await.unwrap();
            // keep the peer open until the client is gone
            let _ = peer.read(&mut buf).await;
        });

        client_tx.unbounded_send(Ok(Bytes::from_static(b"ping"))).unwrap();
        let h = handle();
        let relay_task = async {
            relay(&mut client, &mut writer, Box::new(remote), &h).await
        };
        let check = async {
            assert_eq!(rx.next().await.unwrap(), Bytes::from_static(b"ping"));
            drop(client_tx);
        };
        let (outcome, _) = tokio::join!(relay_task, check);

        assert_eq!(outcome, BridgeOutcome::ClientClosed);
        assert_eq!(h.session().upload(), 4);
        assert_eq!(h.session().download(), 4);
    }

    #[tokio::test]
    async fn test_relay_remote_closes_empty() {
        let (mut writer, _rx) = channel_writer(Some(vec![0, 0]));
        let (_client_tx, client_rx) = mpsc::unbounded::<Result<Bytes>>();
        let mut client: ClientStream = client_rx.boxed();

        let (remote, peer) = tokio::io::duplex(1024);
        drop(peer);

        let outcome = relay(&mut client, &mut writer, Box::new(remote), &handle()).await;
        assert_eq!(outcome, BridgeOutcome::RemoteClosed { relayed: false });
        assert!(writer.header_pending());
    }

    #[tokio::test]
    async fn test_relay_large_chunk_to_echo_peer() {
        const CHUNK: usize = 64 * 1024;

        let (mut writer, mut rx) = channel_writer(None);
        let (client_tx, client_rx) = mpsc::unbounded::<Result<Bytes>>();
        let mut client: ClientStream = client_rx.boxed();

        // The peer echoes while it reads, through a pipe far smaller than the chunk
        let (remote, mut peer) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                match peer.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if peer.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        client_tx
            .unbounded_send(Ok(Bytes::from(vec![7u8; CHUNK])))
            .unwrap();
        let h = handle();
        let relay_task = relay(&mut client, &mut writer, Box::new(remote), &h);
        let check = async {
            let mut echoed = 0;
            while echoed < CHUNK {
                echoed += rx.next().await.unwrap().len();
            }
            drop(client_tx);
        };

        let (outcome, _) = tokio::time::timeout(Duration::from_secs(3), async {
            tokio::join!(relay_task, check)
        })
        .await
        .expect("relay stalled on a large upload");

        assert_eq!(outcome, BridgeOutcome::ClientClosed);
        assert_eq!(h.session().upload(), CHUNK as u64);
        assert_eq!(h.session().download(), CHUNK as u64);
    }
}
