//! WebSocket tunnel entry
//!
//! Every path accepts a WebSocket upgrade. Anything else, or a request for a
//! host that is not configured, gets a 404.

use super::InboundListener;
use crate::common::net::host_without_port;
use crate::config::{parse_request_params, Config, SessionDefaults};
use crate::tunnel::{ClientSink, ClientStream, Tunnel};
use crate::{Error, Result};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use bytes::Bytes;
use futures::future::ready;
use futures::{stream, SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

const EARLY_DATA_HEADER: &str = "sec-websocket-protocol";

/// Checked in order; the first present one wins
const CLIENT_IP_HEADERS: &[&str] = &[
    "x-real-ip",
    "cf-connecting-ip",
    "x-forwarded-for",
    "true-client-ip",
];

/// Standard alphabet that accepts input with or without padding
const EARLY_DATA_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Shared by every request
#[derive(Clone)]
pub struct EntryState {
    pub tunnel: Arc<Tunnel>,
    pub config: Arc<Config>,
    pub defaults: Arc<SessionDefaults>,
}

/// Decode URL-safe base64 early data. Empty input or output gives `None`.
pub fn decode_early_data(value: &str) -> Result<Option<Bytes>> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }

    let normalized = value.replace('-', "+").replace('_', "/");
    let data = EARLY_DATA_ENGINE
        .decode(normalized)
        .map_err(|e| Error::protocol(format!("Invalid early data: {}", e)))?;

    Ok((!data.is_empty()).then(|| Bytes::from(data)))
}

/// Client address as reported by the edge, falling back to the peer
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    for name in CLIENT_IP_HEADERS {
        let Some(value) = headers.get(*name).and_then(|v| v.to_str().ok()) else {
            continue;
        };
        let first = value.split(',').next().unwrap_or("").trim();
        if !first.is_empty() {
            return first.to_string();
        }
    }
    peer.map(|addr| addr.ip().to_string()).unwrap_or_default()
}

/// Build the entry router
pub fn router(state: EntryState) -> Router {
    Router::new()
        .fallback(handle_request)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_request(
    State(state): State<EntryState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    uri: Uri,
    upgrade: Option<WebSocketUpgrade>,
) -> Response {
    let Some(ws) = upgrade else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(host_without_port)
        .unwrap_or("");
    if !state.config.is_allowed_host(host) {
        debug!("Rejected upgrade for host {:?}", host);
        return StatusCode::NOT_FOUND.into_response();
    }

    let protocol = headers
        .get(EARLY_DATA_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let early_data = protocol
        .as_deref()
        .map(decode_early_data)
        .unwrap_or(Ok(None));

    let session = parse_request_params(uri.path(), uri.query(), &state.defaults);
    let source_ip = client_ip(&headers, peer.map(|ConnectInfo(addr)| addr));

    let ws = match protocol {
        Some(value) => ws.protocols([value]),
        None => ws,
    };

    ws.on_upgrade(move |socket| async move {
        let (client, sink) = split_socket(socket, early_data);
        if let Err(e) = state
            .tunnel
            .handle_session(client, sink, session, source_ip.clone())
            .await
        {
            debug!("Session from {} ended: {}", source_ip, e);
        }
    })
}

/// Client halves of an upgraded socket. Early data, or its decode error,
/// comes out first.
fn split_socket(socket: WebSocket, early_data: Result<Option<Bytes>>) -> (ClientStream, ClientSink) {
    let (sender, receiver) = socket.split();

    let messages = receiver
        .take_while(|msg| ready(!matches!(msg, Ok(Message::Close(_)))))
        .filter_map(|msg| {
            ready(match msg {
                Ok(Message::Binary(data)) => Some(Ok(Bytes::from(data))),
                Ok(Message::Text(text)) => Some(Ok(Bytes::from(text))),
                Ok(_) => None,
                Err(e) => Some(Err(Error::from(e))),
            })
        });
    let client = stream::iter(early_data.transpose()).chain(messages).boxed();

    let sink = sender
        .with(|data: Bytes| ready(Ok::<_, axum::Error>(Message::Binary(data.to_vec()))))
        .sink_map_err(Error::from);

    (client, Box::pin(sink))
}

/// WebSocket entry listener
pub struct WebSocketListener {
    listen: SocketAddr,
    state: EntryState,
    running: AtomicBool,
    shutdown: Arc<Notify>,
}

impl WebSocketListener {
    pub fn new(listen: SocketAddr, state: EntryState) -> Self {
        WebSocketListener {
            listen,
            state,
            running: AtomicBool::new(false),
            shutdown: Arc::new(Notify::new()),
        }
    }
}

#[async_trait]
impl InboundListener for WebSocketListener {
    fn name(&self) -> &str {
        "WebSocket"
    }

    async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(self.listen).await?;
        info!("Tunnel entry listening on {}", listener.local_addr()?);

        self.running.store(true, Ordering::SeqCst);
        let app = router(self.state.clone());
        let shutdown = self.shutdown.clone();
        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.notified().await })
        .await;
        self.running.store(false, Ordering::SeqCst);
        info!("Tunnel entry on {} stopped", self.listen);

        served.map_err(Error::from)
    }

    /// Stop accepting; open sessions are left to drain. A stop that comes
    /// before `start` is kept and ends the next `start` right away.
    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_one();
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
