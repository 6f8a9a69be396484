//! Tunnel core - drives one client session from header to close

mod bridge;

pub use bridge::*;

use crate::common::{Credentials, Destination, Metadata, Network, ProtocolKind};
use crate::config::SessionConfig;
use crate::dns::DnsForwarder;
use crate::inbound::{is_blocked_host, parse_request};
use crate::outbound::{transition, ConnectEvent, ConnectState, Connector};
use crate::statistic::{LogSink, SessionHandle, SessionRecord, StatisticManager};
use crate::{Error, Result};
use bytes::Bytes;
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One client connection whose header was accepted. Never outlives the
/// client socket.
pub struct Session {
    pub protocol: ProtocolKind,
    pub network: Network,
    pub destination: Destination,
    /// Header leftovers, written to every outbound attempt
    pub payload: Bytes,
    client: ClientStream,
    /// Holds the response header until the first remote chunk
    writer: ClientWriter,
    handle: SessionHandle,
}

impl Session {
    /// Only DNS queries reach this point as UDP
    pub fn is_udp(&self) -> bool {
        self.network == Network::Udp
    }

    pub fn header_pending(&self) -> bool {
        self.writer.header_pending()
    }

    pub fn id(&self) -> &str {
        self.handle.id()
    }
}

/// Tunnel core - parses the first chunk, connects and bridges
pub struct Tunnel {
    credentials: Credentials,
    /// Destination denylist
    blocked_hosts: Vec<String>,
    connector: Connector,
    dns_forwarder: DnsForwarder,
    statistic: Arc<StatisticManager>,
    log_sink: Arc<dyn LogSink>,
}

impl Tunnel {
    pub fn new(
        credentials: Credentials,
        blocked_hosts: Vec<String>,
        connector: Connector,
        dns_forwarder: DnsForwarder,
        statistic: Arc<StatisticManager>,
        log_sink: Arc<dyn LogSink>,
    ) -> Self {
        Tunnel {
            credentials,
            blocked_hosts,
            connector,
            dns_forwarder,
            statistic,
            log_sink,
        }
    }

    pub fn statistic(&self) -> &Arc<StatisticManager> {
        &self.statistic
    }

    /// Run one session to completion.
    ///
    /// The first client chunk must carry a tunnel header. An error return
    /// means the session was refused or its outbound could not be opened;
    /// the caller only ever closes the socket.
    pub async fn handle_session(
        &self,
        mut client: ClientStream,
        sink: ClientSink,
        settings: SessionConfig,
        source_ip: String,
    ) -> Result<()> {
        let first = match client.next().await {
            Some(chunk) => chunk?,
            None => return Ok(()),
        };

        let request = parse_request(&first, &self.credentials)?;
        let destination = request.destination().clone();
        if is_blocked_host(&destination.host, &self.blocked_hosts) {
            return Err(Error::blocked(destination.host));
        }
        if request.network() == Network::Udp && !destination.is_dns_query() {
            return Err(Error::unsupported(format!(
                "UDP is only supported for DNS, got port {}",
                destination.port
            )));
        }

        let metadata = Metadata::new(request.protocol(), request.network(), destination.clone())
            .with_source_ip(source_ip);
        self.log_sink.emit(SessionRecord::from_metadata(&metadata));

        let mut session = Session {
            protocol: request.protocol(),
            network: request.network(),
            destination,
            payload: request.payload().clone(),
            writer: ClientWriter::new(sink, request.response_header()),
            client,
            handle: self.statistic.open(metadata),
        };

        let result = if session.is_udp() {
            self.serve_dns(&mut session).await
        } else {
            self.serve_tcp(&mut session, &settings).await
        };
        session.writer.close().await;

        let tracked = session.handle.session();
        debug!(
            "[{}] {} {} closed: up {} down {} in {}ms",
            session.handle.id(),
            session.protocol,
            session.destination,
            tracked.upload(),
            tracked.download(),
            tracked.elapsed_ms()
        );
        result
    }

    async fn serve_tcp(&self, session: &mut Session, settings: &SessionConfig) -> Result<()> {
        let Session {
            destination,
            payload,
            client,
            writer,
            handle,
            ..
        } = session;

        let established = self.connector.establish(destination, payload, settings).await?;
        handle.add_upload(payload.len() as u64);
        handle.session().set_route(established.route.to_string());
        info!("[{}] {} via {}", handle.id(), destination, established.route);

        let outcome = relay(client, writer, established.stream, handle).await;
        let event = match outcome {
            BridgeOutcome::ClientClosed => return Ok(()),
            BridgeOutcome::RemoteClosed { relayed: true } => ConnectEvent::Relayed,
            BridgeOutcome::RemoteClosed { relayed: false } => ConnectEvent::ClosedEmpty,
        };

        let state = transition(established.state, event);
        if state != ConnectState::NoData {
            return Ok(());
        }

        // Direct transport closed without answering; retry once via fallback
        debug!("[{}] {} closed without data, falling back", handle.id(), destination);
        let retry = self
            .connector
            .fallback(state, destination, payload, settings)
            .await?;
        handle.add_upload(payload.len() as u64);
        handle.session().set_route(retry.route.to_string());
        info!("[{}] {} retried via {}", handle.id(), destination, retry.route);

        relay(client, writer, retry.stream, handle).await;
        Ok(())
    }

    async fn serve_dns(&self, session: &mut Session) -> Result<()> {
        session
            .handle
            .session()
            .set_route(format!("dns {}", self.dns_forwarder.upstream()));

        if !session.payload.is_empty() {
            let query = session.payload.clone();
            self.exchange(&query, session).await;
        }
        while let Some(chunk) = session.client.next().await {
            let chunk = chunk?;
            self.exchange(&chunk, session).await;
        }
        Ok(())
    }

    /// One query; failures are logged and the session carries on
    async fn exchange(&self, query: &[u8], session: &mut Session) {
        session.handle.add_upload(query.len() as u64);
        match self.dns_forwarder.forward(query, &mut session.writer).await {
            Ok(n) => session.handle.add_download(n),
            Err(e) => warn!("[{}] DNS exchange failed: {}", session.handle.id(), e),
        }
    }
}
