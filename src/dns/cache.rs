//! Relay pool cache

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// One relay candidate
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelayEntry {
    /// IPv4, bracketed IPv6 or hostname
    pub address: String,
    pub port: u16,
}

impl RelayEntry {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        RelayEntry {
            address: address.into(),
            port,
        }
    }
}

impl fmt::Display for RelayEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

struct CachedPool {
    specifier: String,
    entries: Arc<Vec<RelayEntry>>,
}

/// Single-slot cache holding the candidate list of the last specifier,
/// plus the round-robin cursor into it
pub struct RelayPoolCache {
    slot: Mutex<Option<CachedPool>>,
    cursor: AtomicUsize,
}

impl RelayPoolCache {
    pub fn new() -> Self {
        RelayPoolCache {
            slot: Mutex::new(None),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Candidates for `specifier` if it is the cached one
    pub fn get(&self, specifier: &str) -> Option<Arc<Vec<RelayEntry>>> {
        let slot = self.slot.lock();
        slot.as_ref()
            .filter(|cached| cached.specifier == specifier)
            .map(|cached| Arc::clone(&cached.entries))
    }

    /// Store candidates, replacing any other specifier.
    ///
    /// The cursor is reset when the specifier changes.
    pub fn put(&self, specifier: &str, entries: Vec<RelayEntry>) -> Arc<Vec<RelayEntry>> {
        let entries = Arc::new(entries);
        let mut slot = self.slot.lock();
        let replaced = slot
            .as_ref()
            .map_or(true, |cached| cached.specifier != specifier);
        if replaced {
            self.cursor.store(0, Ordering::Relaxed);
        }
        *slot = Some(CachedPool {
            specifier: specifier.to_string(),
            entries: Arc::clone(&entries),
        });
        entries
    }

    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Relaxed)
    }

    pub fn set_cursor(&self, idx: usize) {
        self.cursor.store(idx, Ordering::Relaxed);
    }
}

impl Default for RelayPoolCache {
    fn default() -> Self {
        Self::new()
    }
}
