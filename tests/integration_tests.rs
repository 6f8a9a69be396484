//! End-to-end session tests
//!
//! A full tunnel is wired up with an in-memory dialer, and the WebSocket is
//! replaced by a pair of channels standing in for the client.

use async_trait::async_trait;
use bytes::Bytes;
use edge_tunnel::common::crypto::password_digest;
use edge_tunnel::common::Credentials;
use edge_tunnel::config::{parse_request_params, Config, SessionConfig};
use edge_tunnel::dns::{DnsForwarder, DnsLookup, RecordKind, RelayPool};
use edge_tunnel::outbound::{Connector, Dialer, ProxyConnection};
use edge_tunnel::statistic::{BroadcastSink, StatisticManager};
use edge_tunnel::tunnel::{ClientSink, ClientStream, Tunnel};
use edge_tunnel::{Error, Result};
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const USER_ID: &str = "02649992-ba8d-4f87-8242-947dbbfd182e";

#[derive(Clone, Copy)]
enum Remote {
    /// Echo everything until the tunnel hangs up
    Echo,
    /// Swallow the first write, then close without a byte
    Silent,
}

/// In-memory dialer keyed by host; unknown hosts are refused
#[derive(Default)]
struct ScriptedDialer {
    remotes: HashMap<String, Remote>,
    dials: Mutex<Vec<(String, u16)>>,
}

impl ScriptedDialer {
    fn with(mut self, host: &str, remote: Remote) -> Self {
        self.remotes.insert(host.to_string(), remote);
        self
    }

    fn dials(&self) -> Vec<(String, u16)> {
        self.dials.lock().clone()
    }
}

#[async_trait]
impl Dialer for ScriptedDialer {
    async fn dial(&self, host: &str, port: u16) -> Result<Box<dyn ProxyConnection>> {
        self.dials.lock().push((host.to_string(), port));
        let remote = self
            .remotes
            .get(host)
            .copied()
            .ok_or_else(|| Error::connection(format!("{}:{} refused", host, port)))?;

        let (tunnel_side, mut peer) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            match remote {
                Remote::Echo => loop {
                    match peer.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if peer.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                },
                Remote::Silent => {
                    let _ = peer.read(&mut buf).await;
                }
            }
        });
        Ok(Box::new(tunnel_side))
    }
}

struct NoLookup;

#[async_trait]
impl DnsLookup for NoLookup {
    async fn lookup(&self, _name: &str, _kind: RecordKind) -> Vec<String> {
        Vec::new()
    }
}

fn tunnel(dialer: Arc<ScriptedDialer>) -> Arc<Tunnel> {
    let config = Config::default();
    let pool = Arc::new(RelayPool::new(Arc::new(NoLookup)));
    Arc::new(Tunnel::new(
        Credentials::from_user_id(USER_ID.to_string()),
        config.blocked_hosts,
        Connector::new(dialer.clone(), pool, USER_ID).with_relay_timeout(Duration::from_millis(200)),
        DnsForwarder::new("8.8.4.4:53".parse().unwrap(), dialer),
        Arc::new(StatisticManager::new()),
        Arc::new(BroadcastSink::new(16)),
    ))
}

/// Client halves: (chunk sender, stream, sink, reply receiver)
fn client() -> (
    mpsc::UnboundedSender<Result<Bytes>>,
    ClientStream,
    ClientSink,
    mpsc::UnboundedReceiver<Bytes>,
) {
    let (chunk_tx, chunk_rx) = mpsc::unbounded::<Result<Bytes>>();
    let (reply_tx, reply_rx) = mpsc::unbounded::<Bytes>();
    let sink: ClientSink = Box::pin(reply_tx.sink_map_err(|e| Error::connection(e.to_string())));
    (chunk_tx, chunk_rx.boxed(), sink, reply_rx)
}

fn vless_domain(host: &str, port: u16, payload: &[u8]) -> Bytes {
    let mut buf = vec![0u8];
    buf.extend_from_slice(uuid::Uuid::parse_str(USER_ID).unwrap().as_bytes());
    buf.extend_from_slice(&[0, 1]);
    buf.extend_from_slice(&port.to_be_bytes());
    buf.push(2);
    buf.push(host.len() as u8);
    buf.extend_from_slice(host.as_bytes());
    buf.extend_from_slice(payload);
    Bytes::from(buf)
}

fn trojan_ipv4(digest: &str, addr: [u8; 4], port: u16, payload: &[u8]) -> Bytes {
    let mut buf = digest.as_bytes().to_vec();
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(&[1, 1]);
    buf.extend_from_slice(&addr);
    buf.extend_from_slice(&port.to_be_bytes());
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(payload);
    Bytes::from(buf)
}

#[tokio::test]
async fn test_vless_session_echoes_with_response_header() {
    let dialer = Arc::new(ScriptedDialer::default().with("example.org", Remote::Echo));
    let tunnel = tunnel(dialer.clone());
    let (chunk_tx, stream, sink, mut replies) = client();

    chunk_tx
        .unbounded_send(Ok(vless_domain("example.org", 443, b"x")))
        .unwrap();
    let session = {
        let tunnel = tunnel.clone();
        tokio::spawn(async move {
            tunnel
                .handle_session(stream, sink, SessionConfig::default(), "203.0.113.7".into())
                .await
        })
    };

    assert_eq!(replies.next().await.unwrap(), Bytes::from_static(&[0, 0, b'x']));

    chunk_tx.unbounded_send(Ok(Bytes::from_static(b"more"))).unwrap();
    assert_eq!(replies.next().await.unwrap(), Bytes::from_static(b"more"));

    drop(chunk_tx);
    session.await.unwrap().unwrap();

    assert_eq!(dialer.dials(), vec![("example.org".to_string(), 443)]);
    assert_eq!(tunnel.statistic().connection_count(), 0);
    assert_eq!(tunnel.statistic().total(), (5, 5));
}

#[tokio::test]
async fn test_trojan_wrong_digest_dials_nothing() {
    let dialer = Arc::new(ScriptedDialer::default().with("93.184.216.34", Remote::Echo));
    let tunnel = tunnel(dialer.clone());
    let (chunk_tx, stream, sink, replies) = client();

    chunk_tx
        .unbounded_send(Ok(trojan_ipv4(
            &password_digest("not-the-user"),
            [93, 184, 216, 34],
            80,
            b"GET / HTTP/1.1\r\n\r\n",
        )))
        .unwrap();
    drop(chunk_tx);

    let err = tunnel
        .handle_session(stream, sink, SessionConfig::default(), String::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
    assert!(dialer.dials().is_empty());
    assert!(replies.collect::<Vec<_>>().await.is_empty());
    assert_eq!(tunnel.statistic().sessions_total(), 0);
}

#[tokio::test]
async fn test_trojan_session_has_no_response_header() {
    let dialer = Arc::new(ScriptedDialer::default().with("93.184.216.34", Remote::Echo));
    let tunnel = tunnel(dialer.clone());
    let (chunk_tx, stream, sink, mut replies) = client();

    chunk_tx
        .unbounded_send(Ok(trojan_ipv4(
            &password_digest(USER_ID),
            [93, 184, 216, 34],
            80,
            b"ping",
        )))
        .unwrap();
    let session = tokio::spawn(async move {
        tunnel
            .handle_session(stream, sink, SessionConfig::default(), String::new())
            .await
    });

    assert_eq!(replies.next().await.unwrap(), Bytes::from_static(b"ping"));
    drop(chunk_tx);
    session.await.unwrap().unwrap();
    assert_eq!(dialer.dials(), vec![("93.184.216.34".to_string(), 80)]);
}

#[tokio::test]
async fn test_blocked_host_never_reaches_connector() {
    let dialer = Arc::new(ScriptedDialer::default().with("speed.cloudflare.com", Remote::Echo));
    let tunnel = tunnel(dialer.clone());
    let (chunk_tx, stream, sink, replies) = client();

    chunk_tx
        .unbounded_send(Ok(vless_domain("down.speed.cloudflare.com", 443, b"x")))
        .unwrap();
    drop(chunk_tx);

    let err = tunnel
        .handle_session(stream, sink, SessionConfig::default(), String::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Blocked(_)));
    assert!(dialer.dials().is_empty());
    assert!(replies.collect::<Vec<_>>().await.is_empty());
}

#[tokio::test]
async fn test_silent_direct_falls_back_to_relay_pool() {
    let dialer = Arc::new(
        ScriptedDialer::default()
            .with("example.org", Remote::Silent)
            .with("192.0.2.10", Remote::Echo),
    );
    let tunnel = tunnel(dialer.clone());
    let (chunk_tx, stream, sink, mut replies) = client();

    let defaults = Config::default().session_defaults(None);
    let session = parse_request_params("/proxyip=192.0.2.10", None, &defaults);
    assert_eq!(session.relay_specifier.as_deref(), Some("192.0.2.10"));

    chunk_tx
        .unbounded_send(Ok(vless_domain("example.org", 443, b"hi")))
        .unwrap();
    let task = {
        let tunnel = tunnel.clone();
        tokio::spawn(async move {
            tunnel
                .handle_session(stream, sink, session, String::new())
                .await
        })
    };

    // The header rides on the first byte that actually comes back
    assert_eq!(replies.next().await.unwrap(), Bytes::from_static(&[0, 0, b'h', b'i']));
    drop(chunk_tx);
    task.await.unwrap().unwrap();

    assert_eq!(
        dialer.dials(),
        vec![
            ("example.org".to_string(), 443),
            ("192.0.2.10".to_string(), 443)
        ]
    );
}

#[tokio::test]
async fn test_direct_refused_without_fallback_fails() {
    let dialer = Arc::new(ScriptedDialer::default());
    let tunnel = tunnel(dialer.clone());
    let (chunk_tx, stream, sink, replies) = client();

    chunk_tx
        .unbounded_send(Ok(vless_domain("example.org", 443, b"x")))
        .unwrap();
    drop(chunk_tx);

    let err = tunnel
        .handle_session(stream, sink, SessionConfig::default(), String::new())
        .await
        .unwrap_err();
    assert!(err.is_recoverable());
    assert_eq!(dialer.dials(), vec![("example.org".to_string(), 443)]);
    assert!(replies.collect::<Vec<_>>().await.is_empty());
}
