//! Access records
//!
//! Each accepted session emits one record. Sinks must not block the
//! session, so `emit` is synchronous and drops on back-pressure.

use crate::common::Metadata;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;

/// One accepted session
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    /// Protocol name
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "sourceIP")]
    pub source_ip: String,
    pub destination: String,
    pub timestamp: DateTime<Utc>,
}

impl SessionRecord {
    pub fn from_metadata(metadata: &Metadata) -> Self {
        SessionRecord {
            kind: metadata.protocol.to_string(),
            source_ip: metadata.source_ip.clone(),
            destination: metadata.destination.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Fire-and-forget record consumer
pub trait LogSink: Send + Sync {
    fn emit(&self, record: SessionRecord);
}

/// Writes records to the `edge_tunnel::access` tracing target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn emit(&self, record: SessionRecord) {
        info!(
            target: "edge_tunnel::access",
            kind = %record.kind,
            source_ip = %record.source_ip,
            destination = %record.destination,
            "session accepted"
        );
    }
}

/// Fans records out to subscribers, also logging them through tracing
pub struct BroadcastSink {
    tx: broadcast::Sender<SessionRecord>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        BroadcastSink { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionRecord> {
        self.tx.subscribe()
    }
}

impl LogSink for BroadcastSink {
    fn emit(&self, record: SessionRecord) {
        TracingSink.emit(record.clone());
        // No subscribers is fine
        let _ = self.tx.send(record);
    }
}
