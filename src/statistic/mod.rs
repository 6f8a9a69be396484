//! Session tracking, traffic statistics and access records

mod sink;
mod tracker;

pub use sink::{BroadcastSink, LogSink, SessionRecord, TracingSink};
pub use tracker::{SessionHandle, TrackedSession};

use crate::common::Metadata;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Statistics manager for sessions and traffic
pub struct StatisticManager {
    /// Active sessions (id -> session)
    sessions: DashMap<String, Arc<TrackedSession>>,
    /// Sessions opened since start
    sessions_total: AtomicU64,
    /// Total upload bytes
    upload_total: AtomicU64,
    /// Total download bytes
    download_total: AtomicU64,
}

impl StatisticManager {
    pub fn new() -> Self {
        StatisticManager {
            sessions: DashMap::new(),
            sessions_total: AtomicU64::new(0),
            upload_total: AtomicU64::new(0),
            download_total: AtomicU64::new(0),
        }
    }

    /// Register a new session; it stays tracked while the handle lives
    pub fn open(self: &Arc<Self>, metadata: Metadata) -> SessionHandle {
        let session = Arc::new(TrackedSession::new(self.generate_id(), metadata));
        self.sessions.insert(session.id.clone(), Arc::clone(&session));
        self.sessions_total.fetch_add(1, Ordering::Relaxed);
        SessionHandle::new(Arc::clone(self), session)
    }

    /// Generate a unique session ID
    pub fn generate_id(&self) -> String {
        Uuid::new_v4().to_string()
    }

    pub fn get(&self, id: &str) -> Option<Arc<TrackedSession>> {
        self.sessions.get(id).map(|r| r.value().clone())
    }

    pub fn close(&self, id: &str) -> bool {
        self.sessions.remove(id).is_some()
    }

    /// Active session count
    pub fn connection_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn sessions_total(&self) -> u64 {
        self.sessions_total.load(Ordering::Relaxed)
    }

    /// Total traffic as (upload, download)
    pub fn total(&self) -> (u64, u64) {
        (
            self.upload_total.load(Ordering::Relaxed),
            self.download_total.load(Ordering::Relaxed),
        )
    }

    pub fn add_upload(&self, bytes: u64) {
        self.upload_total.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_download(&self, bytes: u64) {
        self.download_total.fetch_add(bytes, Ordering::Relaxed);
    }
}

impl Default for StatisticManager {
    fn default() -> Self {
        Self::new()
    }
}
