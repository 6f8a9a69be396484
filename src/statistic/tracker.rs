//! Session tracker implementation

use super::StatisticManager;
use crate::common::Metadata;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Tracked session with statistics
pub struct TrackedSession {
    /// Unique session ID
    pub id: String,
    /// Session metadata
    pub metadata: Metadata,
    /// Start time
    pub start: DateTime<Utc>,
    /// Outbound route, once known
    route: Mutex<Option<String>>,
    /// Client to remote bytes
    upload: AtomicU64,
    /// Remote to client bytes
    download: AtomicU64,
}

impl TrackedSession {
    pub fn new(id: String, metadata: Metadata) -> Self {
        TrackedSession {
            id,
            metadata,
            start: Utc::now(),
            route: Mutex::new(None),
            upload: AtomicU64::new(0),
            download: AtomicU64::new(0),
        }
    }

    pub fn set_route(&self, route: impl Into<String>) {
        *self.route.lock() = Some(route.into());
    }

    pub fn route(&self) -> Option<String> {
        self.route.lock().clone()
    }

    pub fn add_upload(&self, bytes: u64) {
        self.upload.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_download(&self, bytes: u64) {
        self.download.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn upload(&self) -> u64 {
        self.upload.load(Ordering::Relaxed)
    }

    pub fn download(&self) -> u64 {
        self.download.load(Ordering::Relaxed)
    }

    /// Milliseconds since the session started
    pub fn elapsed_ms(&self) -> i64 {
        (Utc::now() - self.start).num_milliseconds()
    }
}

/// Live session registration. Dropping it untracks the session.
pub struct SessionHandle {
    statistic: Arc<StatisticManager>,
    session: Arc<TrackedSession>,
}

impl SessionHandle {
    pub(super) fn new(statistic: Arc<StatisticManager>, session: Arc<TrackedSession>) -> Self {
        SessionHandle { statistic, session }
    }

    pub fn id(&self) -> &str {
        &self.session.id
    }

    pub fn session(&self) -> &TrackedSession {
        &self.session
    }

    pub fn add_upload(&self, bytes: u64) {
        self.session.add_upload(bytes);
        self.statistic.add_upload(bytes);
    }

    pub fn add_download(&self, bytes: u64) {
        self.session.add_download(bytes);
        self.statistic.add_download(bytes);
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        let _ = self.statistic.close(&self.session.id);
    }
}
