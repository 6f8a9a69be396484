//! Route selection for one session
//!
//! Order of attempts:
//!
//! 1. two-hop CONNECT intermediary, when configured; failure falls through
//!    to a direct dial
//! 2. single-hop proxy, when global or the destination is whitelisted;
//!    failure is final
//! 3. direct dial; when it fails or the bridge sees it close without a
//!    single byte, fall back to the single-hop proxy, the relay pool, or the
//!    last-resort relay, in that order of preference
//!
//! The no-data retry is driven by [`transition`], a pure state machine the
//! tunnel feeds with bridge outcomes.

use super::{proxy_for_account, Dialer, HttpConnectProxy, OutboundProxy, ProxyConnection};
use crate::common::Destination;
use crate::config::{ProxyKind, SessionConfig};
use crate::dns::{RelayEntry, RelayPool};
use crate::{Error, Result};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Per relay pool candidate budget covering the dial and the first write
pub const RELAY_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Connection state of a session's outbound side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    Connecting,
    /// Direct transport up, nothing relayed yet
    Direct,
    /// Direct transport has relayed data; no retry from here
    Relaying,
    /// Direct failed or closed empty; fallback pending
    NoData,
    /// Fallback in progress, `n` candidates failed so far
    PoolRetry(usize),
    /// Connected through a route that is never retried
    Established,
    Exhausted,
}

/// Inputs to [`transition`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectEvent {
    ProxyConnected,
    DirectConnected,
    DirectFailed,
    /// Bridge ended after at least one remote byte
    Relayed,
    /// Bridge ended before any remote byte
    ClosedEmpty,
    CandidateFailed,
    FallbackConnected,
    FallbackExhausted,
}

/// Pure transition function. Events that do not apply leave the state as is.
pub fn transition(state: ConnectState, event: ConnectEvent) -> ConnectState {
    use ConnectEvent as E;
    use ConnectState as S;

    match (state, event) {
        (S::Connecting, E::ProxyConnected) => S::Established,
        (S::Connecting, E::DirectConnected) => S::Direct,
        (S::Connecting, E::DirectFailed) => S::NoData,
        (S::Direct, E::Relayed) => S::Relaying,
        (S::Direct, E::ClosedEmpty) => S::NoData,
        (S::NoData, E::CandidateFailed) => S::PoolRetry(1),
        (S::PoolRetry(n), E::CandidateFailed) => S::PoolRetry(n + 1),
        (S::NoData | S::PoolRetry(_), E::FallbackConnected) => S::Established,
        (S::NoData | S::PoolRetry(_), E::FallbackExhausted) => S::Exhausted,
        (state, _) => state,
    }
}

/// Route a session ended up on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    TwoHop,
    SingleHop(ProxyKind),
    Direct,
    Relay(RelayEntry),
    LastResort,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::TwoHop => write!(f, "two-hop"),
            Route::SingleHop(kind) => write!(f, "{}", kind),
            Route::Direct => write!(f, "direct"),
            Route::Relay(entry) => write!(f, "relay {}", entry),
            Route::LastResort => write!(f, "last-resort"),
        }
    }
}

/// Outbound transport with the initial payload already written
pub struct Established {
    pub route: Route,
    pub stream: Box<dyn ProxyConnection>,
    pub state: ConnectState,
}

impl fmt::Debug for Established {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Established")
            .field("route", &self.route)
            .field("state", &self.state)
            .finish()
    }
}

/// Picks and opens the outbound route for a session
pub struct Connector {
    dialer: Arc<dyn Dialer>,
    pool: Arc<RelayPool>,
    /// Seeds the relay shuffle
    session_id: String,
    relay_timeout: Duration,
    /// When off, a failed or empty direct connection is final
    relay_fallback: bool,
}

impl Connector {
    pub fn new(dialer: Arc<dyn Dialer>, pool: Arc<RelayPool>, session_id: impl Into<String>) -> Self {
        Connector {
            dialer,
            pool,
            session_id: session_id.into(),
            relay_timeout: RELAY_CONNECT_TIMEOUT,
            relay_fallback: true,
        }
    }

    pub fn with_relay_timeout(mut self, relay_timeout: Duration) -> Self {
        self.relay_timeout = relay_timeout;
        self
    }

    pub fn with_relay_fallback(mut self, enabled: bool) -> Self {
        self.relay_fallback = enabled;
        self
    }

    /// First connection attempt for a session
    pub async fn establish(
        &self,
        destination: &Destination,
        payload: &[u8],
        session: &SessionConfig,
    ) -> Result<Established> {
        let state = ConnectState::Connecting;

        if let Some(hop) = &session.two_hop {
            let proxy = HttpConnectProxy::from_two_hop(hop);
            match self.through_proxy(&proxy, destination, payload).await {
                Ok(stream) => {
                    info!("{} connected via two-hop {}", destination, proxy.server());
                    return Ok(Established {
                        route: Route::TwoHop,
                        stream,
                        state: transition(state, ConnectEvent::ProxyConnected),
                    });
                }
                Err(e) => {
                    warn!("Two-hop {} failed for {}: {}", proxy.server(), destination, e);
                }
            }
        } else if let Some(account) = session.single_hop_for(&destination.host) {
            let proxy = proxy_for_account(account);
            let stream = self.through_proxy(proxy.as_ref(), destination, payload).await?;
            info!("{} connected via {} {}", destination, proxy.proxy_type(), proxy.server());
            return Ok(Established {
                route: Route::SingleHop(proxy.proxy_type()),
                stream,
                state: transition(state, ConnectEvent::ProxyConnected),
            });
        }

        match self.dial_and_write(&destination.host, destination.port, payload).await {
            Ok(stream) => {
                debug!("{} connected directly", destination);
                Ok(Established {
                    route: Route::Direct,
                    stream,
                    state: transition(state, ConnectEvent::DirectConnected),
                })
            }
            Err(e) => {
                debug!("Direct connect to {} failed: {}", destination, e);
                let state = transition(state, ConnectEvent::DirectFailed);
                self.fallback(state, destination, payload, session).await
            }
        }
    }

    /// Fallback after a failed or empty direct connection.
    ///
    /// `state` is the state the direct attempt ended in. With relay fallback
    /// disabled neither the pool nor the last-resort relay is dialed.
    pub async fn fallback(
        &self,
        state: ConnectState,
        destination: &Destination,
        payload: &[u8],
        session: &SessionConfig,
    ) -> Result<Established> {
        if let Some(account) = &session.proxy {
            let proxy = proxy_for_account(account);
            let stream = self.through_proxy(proxy.as_ref(), destination, payload).await?;
            info!("{} fell back to {} {}", destination, proxy.proxy_type(), proxy.server());
            return Ok(Established {
                route: Route::SingleHop(proxy.proxy_type()),
                stream,
                state: transition(state, ConnectEvent::FallbackConnected),
            });
        }

        if !self.relay_fallback {
            debug!(
                "Relay fallback disabled, {} ends in {:?}",
                destination,
                transition(state, ConnectEvent::FallbackExhausted)
            );
            return Err(Error::connection(format!(
                "Relay fallback disabled for {}",
                destination
            )));
        }

        if let Some(specifier) = &session.relay_specifier {
            return self.through_pool(state, specifier, destination, payload).await;
        }

        if let Some((host, port)) = &session.relay_last_resort {
            let stream = self.dial_and_write(host, *port, payload).await?;
            info!("{} fell back to last-resort relay {}:{}", destination, host, port);
            return Ok(Established {
                route: Route::LastResort,
                stream,
                state: transition(state, ConnectEvent::FallbackConnected),
            });
        }

        Err(Error::connection(format!("No fallback route for {}", destination)))
    }

    async fn through_pool(
        &self,
        mut state: ConnectState,
        specifier: &str,
        destination: &Destination,
        payload: &[u8],
    ) -> Result<Established> {
        let candidates = self
            .pool
            .resolve(specifier, &destination.host, &self.session_id)
            .await;
        if candidates.is_empty() {
            return Err(Error::connection(format!("Relay pool {} is empty", specifier)));
        }

        let start = self.pool.cursor();
        for i in 0..candidates.len() {
            let idx = (start + i) % candidates.len();
            let entry = &candidates[idx];

            let attempt = timeout(self.relay_timeout, self.dial_and_write(&entry.address, entry.port, payload))
                .await
                .map_err(Error::from)
                .and_then(|dialed| dialed);
            match attempt {
                Ok(stream) => {
                    self.pool.record_success(idx);
                    info!("{} fell back to relay {}", destination, entry);
                    return Ok(Established {
                        route: Route::Relay(entry.clone()),
                        stream,
                        state: transition(state, ConnectEvent::FallbackConnected),
                    });
                }
                Err(e) => debug!("Relay {} failed: {}", entry, e),
            }
            state = transition(state, ConnectEvent::CandidateFailed);
        }

        debug!(
            "Relay pool {} ended in {:?}",
            specifier,
            transition(state, ConnectEvent::FallbackExhausted)
        );
        Err(Error::connection(format!(
            "Relay pool {} exhausted after {} candidates",
            specifier,
            candidates.len()
        )))
    }

    async fn through_proxy(
        &self,
        proxy: &dyn OutboundProxy,
        destination: &Destination,
        payload: &[u8],
    ) -> Result<Box<dyn ProxyConnection>> {
        let mut stream = proxy.dial_tcp(self.dialer.as_ref(), destination).await?;
        stream.write_all(payload).await?;
        Ok(stream)
    }

    async fn dial_and_write(
        &self,
        host: &str,
        port: u16,
        payload: &[u8],
    ) -> Result<Box<dyn ProxyConnection>> {
        let mut stream = self.dialer.dial(host, port).await?;
        stream.write_all(payload).await?;
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HostPatterns, ProxyAccount};
    use crate::dns::{DnsLookup, RecordKind};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use tokio::io::{AsyncReadExt, DuplexStream};

    #[derive(Clone, Copy)]
    enum Behavior {
        Refuse,
        Echo,
        /// Accepts the payload, then closes without answering
        Silent,
        Hang,
    }

    struct MockDialer {
        routes: HashMap<String, Behavior>,
        dialed: Mutex<Vec<String>>,
    }

    impl MockDialer {
        fn new(routes: &[(&str, Behavior)]) -> Arc<Self> {
            Arc::new(MockDialer {
                routes: routes.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
                dialed: Mutex::new(Vec::new()),
            })
        }

        fn dialed(&self) -> Vec<String> {
            self.dialed.lock().clone()
        }
    }

    fn spawn_peer(behavior: Behavior) -> DuplexStream {
        let (client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            match behavior {
                Behavior::Echo => loop {
                    match server.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if server.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                },
                Behavior::Silent => {
                    let _ = server.read(&mut buf).await;
                }
                Behavior::Refuse | Behavior::Hang => {}
            }
        });
        client
    }

    #[async_trait]
    impl Dialer for MockDialer {
        async fn dial(&self, host: &str, port: u16) -> Result<Box<dyn ProxyConnection>> {
            let key = format!("{}:{}", host, port);
            self.dialed.lock().push(key.clone());
            match self.routes.get(&key).copied().unwrap_or(Behavior::Refuse) {
                Behavior::Refuse => Err(Error::connection(format!("refused {}", key))),
                Behavior::Hang => std::future::pending().await,
                behavior => Ok(Box::new(spawn_peer(behavior))),
            }
        }
    }

    struct TwoAddresses;

    #[async_trait]
    impl DnsLookup for TwoAddresses {
        async fn lookup(&self, name: &str, kind: RecordKind) -> Vec<String> {
            match (name, kind) {
                ("relay.test", RecordKind::A) => vec!["10.0.0.1".into(), "10.0.0.2".into()],
                _ => Vec::new(),
            }
        }
    }

    fn session(relay: Option<&str>) -> SessionConfig {
        SessionConfig {
            relay_specifier: relay.map(str::to_string),
            ..SessionConfig::default()
        }
    }

    fn pool() -> Arc<RelayPool> {
        Arc::new(RelayPool::new(Arc::new(TwoAddresses)))
    }

    async fn read_some(stream: &mut Box<dyn ProxyConnection>) -> Vec<u8> {
        let mut buf = vec![0u8; 64];
        let n = stream.read(&mut buf).await.unwrap();
        buf.truncate(n);
        buf
    }

    #[test]
    fn test_transition_direct_paths() {
        use ConnectEvent as E;
        use ConnectState as S;

        let direct = transition(S::Connecting, E::DirectConnected);
        assert_eq!(direct, S::Direct);
        assert_eq!(transition(direct, E::Relayed), S::Relaying);
        assert_eq!(transition(direct, E::ClosedEmpty), S::NoData);
        assert_eq!(transition(S::Connecting, E::DirectFailed), S::NoData);
        assert_eq!(transition(S::Connecting, E::ProxyConnected), S::Established);
    }

    #[test]
    fn test_transition_pool_retry() {
        use ConnectEvent as E;
        use ConnectState as S;

        let s = transition(S::NoData, E::CandidateFailed);
        assert_eq!(s, S::PoolRetry(1));
        let s = transition(s, E::CandidateFailed);
        assert_eq!(s, S::PoolRetry(2));
        assert_eq!(transition(s, E::FallbackConnected), S::Established);
        assert_eq!(transition(s, E::FallbackExhausted), S::Exhausted);
    }

    #[test]
    fn test_transition_no_second_retry() {
        use ConnectEvent as E;
        use ConnectState as S;

        assert_eq!(transition(S::Established, E::ClosedEmpty), S::Established);
        assert_eq!(transition(S::Relaying, E::ClosedEmpty), S::Relaying);
        assert_eq!(transition(S::Exhausted, E::FallbackConnected), S::Exhausted);
    }

    #[tokio::test]
    async fn test_direct_success() {
        let dialer = MockDialer::new(&[("example.org:443", Behavior::Echo)]);
        let connector = Connector::new(dialer.clone(), pool(), "id");
        let dest = Destination::new("example.org", 443);

        let mut est = connector.establish(&dest, b"ping", &session(None)).await.unwrap();
        assert_eq!(est.route, Route::Direct);
        assert_eq!(est.state, ConnectState::Direct);
        assert_eq!(read_some(&mut est.stream).await, b"ping");
    }

    #[tokio::test]
    async fn test_silent_direct_then_pool() {
        let relays = pool();
        let order = relays.resolve("relay.test", "example.org", "id").await;
        let healthy = order[0].to_string();

        let dialer = MockDialer::new(&[
            ("example.org:443", Behavior::Silent),
            (healthy.as_str(), Behavior::Echo),
        ]);
        let connector = Connector::new(dialer.clone(), relays, "id");
        let dest = Destination::new("example.org", 443);
        let cfg = session(Some("relay.test"));

        let mut est = connector.establish(&dest, b"hello", &cfg).await.unwrap();
        assert_eq!(est.route, Route::Direct);
        assert!(read_some(&mut est.stream).await.is_empty());

        let state = transition(est.state, ConnectEvent::ClosedEmpty);
        assert_eq!(state, ConnectState::NoData);

        let mut retry = connector.fallback(state, &dest, b"hello", &cfg).await.unwrap();
        assert_eq!(retry.route, Route::Relay(order[0].clone()));
        assert_eq!(retry.state, ConnectState::Established);
        assert_eq!(read_some(&mut retry.stream).await, b"hello");
    }

    #[tokio::test]
    async fn test_failing_first_candidate_skipped() {
        let relays = pool();
        let order = relays.resolve("relay.test", "example.org", "id").await;
        let (first, second) = (order[0].to_string(), order[1].to_string());

        let dialer = MockDialer::new(&[
            (first.as_str(), Behavior::Refuse),
            (second.as_str(), Behavior::Echo),
        ]);
        let connector = Connector::new(dialer.clone(), relays.clone(), "id");
        let dest = Destination::new("example.org", 443);

        let est = connector
            .establish(&dest, b"x", &session(Some("relay.test")))
            .await
            .unwrap();
        assert_eq!(est.route, Route::Relay(order[1].clone()));
        assert_eq!(relays.cursor(), 1);
        assert_eq!(dialer.dialed(), vec!["example.org:443".to_string(), first, second]);
    }

    #[tokio::test]
    async fn test_hanging_candidate_times_out() {
        let relays = pool();
        let order = relays.resolve("relay.test", "example.org", "id").await;
        let (first, second) = (order[0].to_string(), order[1].to_string());

        let dialer = MockDialer::new(&[
            (first.as_str(), Behavior::Hang),
            (second.as_str(), Behavior::Echo),
        ]);
        let connector =
            Connector::new(dialer, relays, "id").with_relay_timeout(Duration::from_millis(50));
        let dest = Destination::new("example.org", 443);

        let est = connector
            .establish(&dest, b"x", &session(Some("relay.test")))
            .await
            .unwrap();
        assert_eq!(est.route, Route::Relay(order[1].clone()));
    }

    #[tokio::test]
    async fn test_pool_exhausted_is_terminal() {
        let dialer = MockDialer::new(&[]);
        let connector = Connector::new(dialer.clone(), pool(), "id");
        let dest = Destination::new("example.org", 443);
        let mut cfg = session(Some("relay.test"));
        cfg.relay_last_resort = Some(("last.example.net".into(), 443));

        let err = connector.establish(&dest, b"x", &cfg).await.unwrap_err();
        assert!(err.to_string().contains("exhausted"));
        assert!(!dialer.dialed().contains(&"last.example.net:443".to_string()));
    }

    #[tokio::test]
    async fn test_last_resort_without_specifier() {
        let dialer = MockDialer::new(&[("last.example.net:443", Behavior::Echo)]);
        let connector = Connector::new(dialer, pool(), "id");
        let dest = Destination::new("example.org", 443);
        let mut cfg = session(None);
        cfg.relay_last_resort = Some(("last.example.net".into(), 443));

        let est = connector.establish(&dest, b"x", &cfg).await.unwrap();
        assert_eq!(est.route, Route::LastResort);

        let err = connector
            .establish(&dest, b"x", &session(None))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("No fallback route"));
    }

    #[tokio::test]
    async fn test_two_hop_failure_falls_back_to_direct() {
        let dialer = MockDialer::new(&[("example.org:443", Behavior::Echo)]);
        let connector = Connector::new(dialer.clone(), pool(), "id");
        let dest = Destination::new("example.org", 443);
        let mut cfg = session(None);
        cfg.two_hop = Some(crate::config::TwoHopProxy {
            hostname: "hop.example.net".into(),
            port: 3128,
            username: String::new(),
            password: String::new(),
        });

        let est = connector.establish(&dest, b"x", &cfg).await.unwrap();
        assert_eq!(est.route, Route::Direct);
        assert_eq!(dialer.dialed()[0], "hop.example.net:3128");
    }

    #[tokio::test]
    async fn test_whitelisted_single_hop_failure_is_fatal() {
        let dialer = MockDialer::new(&[("example.org:443", Behavior::Echo)]);
        let connector = Connector::new(dialer.clone(), pool(), "id");
        let dest = Destination::new("example.org", 443);
        let mut cfg = session(None);
        cfg.proxy = Some(ProxyAccount {
            kind: ProxyKind::Socks5,
            username: None,
            password: None,
            hostname: "socks.example.net".into(),
            port: 1080,
        });
        cfg.whitelist = Arc::new(HostPatterns::new(&["*.org"]));

        assert!(connector.establish(&dest, b"x", &cfg).await.is_err());
        assert_eq!(dialer.dialed(), vec!["socks.example.net:1080".to_string()]);
    }

    #[tokio::test]
    async fn test_relay_fallback_disabled_skips_pool() {
        let relays = pool();
        let order = relays.resolve("relay.test", "example.org", "id").await;
        let healthy = order[0].to_string();

        let dialer = MockDialer::new(&[
            ("example.org:443", Behavior::Silent),
            (healthy.as_str(), Behavior::Echo),
            ("last.example.net:443", Behavior::Echo),
        ]);
        let connector = Connector::new(dialer.clone(), relays, "id").with_relay_fallback(false);
        let dest = Destination::new("example.org", 443);
        let cfg = session(Some("relay.test"));

        let est = connector.establish(&dest, b"hello", &cfg).await.unwrap();
        assert_eq!(est.route, Route::Direct);
        let state = transition(est.state, ConnectEvent::ClosedEmpty);

        let err = connector.fallback(state, &dest, b"hello", &cfg).await.unwrap_err();
        assert!(err.to_string().contains("Relay fallback disabled"));

        // A refused direct dial is final too, last resort included
        let mut cfg = session(None);
        cfg.relay_last_resort = Some(("last.example.net".into(), 443));
        let refused = Destination::new("refused.example.org", 443);
        assert!(connector.establish(&refused, b"x", &cfg).await.is_err());

        assert_eq!(
            dialer.dialed(),
            vec!["example.org:443".to_string(), "refused.example.org:443".to_string()]
        );
    }

    #[test]
    fn test_route_display() {
        assert_eq!(Route::Direct.to_string(), "direct");
        assert_eq!(Route::SingleHop(ProxyKind::Http).to_string(), "HTTP");
        assert_eq!(
            Route::Relay(RelayEntry::new("10.0.0.1", 443)).to_string(),
            "relay 10.0.0.1:443"
        );
    }
}
