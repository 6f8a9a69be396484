//! edge-tunnel - WebSocket tunnel gateway
//!
//! Clients open a WebSocket and send a VLESS-style or Trojan-style header in
//! the first chunk. The gateway authenticates it, connects to the requested
//! destination (directly, through a SOCKS5/HTTP proxy, or through a relay
//! pool as fallback) and bridges bytes both ways.
//!
//! # Architecture
//!
//! ```text
//!                  +--------------------+
//!                  | inbound/ (axum WS) |
//!                  +---------+----------+
//!                            |
//!                  +---------v----------+      +-------------+
//!                  |      tunnel/       +------> statistic/  |
//!                  | (session, bridge)  |      +-------------+
//!                  +---------+----------+
//!                            |
//!         +------------------+------------------+
//!         |                                     |
//! +-------v-------+                     +-------v-------+
//! |   outbound/   |                     |     dns/      |
//! |  (connector,  +--------------------->  (relay pool, |
//! | socks5, http) |                     |   forwarder)  |
//! +---------------+                     +---------------+
//! ```

pub mod common;
pub mod config;
pub mod dns;
pub mod inbound;
pub mod outbound;
pub mod statistic;
pub mod tunnel;

pub use common::error::{Error, Result};
pub use config::Config;

use config::DnsMode;
use inbound::{EntryState, InboundListener, WebSocketListener};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Buffered access records for late subscribers
const ACCESS_LOG_CAPACITY: usize = 1024;

/// Gateway instance managing all components
pub struct Gateway {
    listener: Arc<WebSocketListener>,
    statistic: Arc<statistic::StatisticManager>,
    access_log: Arc<statistic::BroadcastSink>,
}

impl Gateway {
    /// Create a new Gateway from configuration
    pub fn new(config: Config) -> Result<Self> {
        info!("Initializing edge-tunnel v{}", VERSION);

        let listen: SocketAddr = config
            .listen
            .parse()
            .map_err(|e| Error::config(format!("Invalid listen address {}: {}", config.listen, e)))?;
        let upstream: SocketAddr = config
            .dns
            .upstream
            .parse()
            .map_err(|e| Error::config(format!("Invalid DNS upstream {}: {}", config.dns.upstream, e)))?;

        let credentials = config.credentials()?;
        info!("Credentials derived");

        let lookup: Arc<dyn dns::DnsLookup> = match config.dns.mode {
            DnsMode::Doh => Arc::new(dns::DohResolver::new(
                config.dns.doh_url.clone(),
                Duration::from_secs(config.dns.doh_timeout),
            )?),
            DnsMode::System => Arc::new(dns::SystemResolver::new(Duration::from_secs(
                config.dns.doh_timeout,
            ))),
        };
        info!("DNS lookups via {:?}", config.dns.mode);

        let dialer: Arc<dyn outbound::Dialer> = Arc::new(outbound::TcpDialer::new());
        let pool = Arc::new(dns::RelayPool::new(lookup));
        let connector = outbound::Connector::new(dialer.clone(), pool, credentials.user_id.clone())
            .with_relay_fallback(config.relay.fallback);
        if !config.relay.fallback {
            info!("Relay fallback disabled");
        }
        let dns_forwarder = dns::DnsForwarder::new(upstream, dialer);

        let statistic = Arc::new(statistic::StatisticManager::new());
        let access_log = Arc::new(statistic::BroadcastSink::new(ACCESS_LOG_CAPACITY));

        let relay_specifier = config.pick_relay_specifier();
        if let Some(spec) = &relay_specifier {
            info!("Relay specifier: {}", spec);
        }
        let defaults = Arc::new(config.session_defaults(relay_specifier));

        let tunnel = Arc::new(tunnel::Tunnel::new(
            credentials,
            config.blocked_hosts.clone(),
            connector,
            dns_forwarder,
            statistic.clone(),
            access_log.clone(),
        ));

        let state = EntryState {
            tunnel,
            config: Arc::new(config),
            defaults,
        };
        let listener = Arc::new(WebSocketListener::new(listen, state));

        Ok(Gateway {
            listener,
            statistic,
            access_log,
        })
    }

    /// Access records of accepted sessions
    pub fn subscribe_access_log(&self) -> tokio::sync::broadcast::Receiver<statistic::SessionRecord> {
        self.access_log.subscribe()
    }

    /// Serve until ctrl-c or listener failure
    pub async fn run(&self) -> Result<()> {
        info!("Starting gateway...");

        let listener = self.listener.clone();
        let mut handle = tokio::spawn(async move { listener.start().await });

        tokio::select! {
            served = &mut handle => {
                match served {
                    Ok(Err(e)) => warn!("{} listener error: {}", self.listener.name(), e),
                    Err(e) => warn!("{} listener task failed: {}", self.listener.name(), e),
                    Ok(Ok(())) => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                self.listener.stop().await?;
                handle.abort();
            }
        }

        let (up, down) = self.statistic.total();
        info!(
            "{} sessions served, {} bytes up, {} bytes down",
            self.statistic.sessions_total(),
            up,
            down
        );
        Ok(())
    }
}
