//! Relay address pool
//!
//! Expands a relay specifier into a short, deterministic list of
//! `address:port` candidates. Expansion may go through a TXT record, A/AAAA
//! lookups or nothing at all for IP literals. The result is shuffled with a
//! seed derived from the destination and the session id, so one client keeps
//! hitting the same relays for the same site.

use super::cache::{RelayEntry, RelayPoolCache};
use super::resolver::{DnsLookup, RecordKind};
use crate::common::metadata::root_domain;
use crate::common::net::strip_brackets;
use crate::config::parse_host_port;
use once_cell::sync::Lazy;
use regex::Regex;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

/// Candidates kept per specifier
pub const MAX_CANDIDATES: usize = 8;

/// Port used when a specifier names none
pub const DEFAULT_RELAY_PORT: u16 = 443;

/// Marker label for TXT indirection
const TXT_MARKER: &str = ".william";

static PORT_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\.tp(\d+)").expect("valid port label regex"));

/// Resolves specifiers and tracks the round-robin cursor
pub struct RelayPool {
    lookup: Arc<dyn DnsLookup>,
    cache: RelayPoolCache,
}

impl RelayPool {
    pub fn new(lookup: Arc<dyn DnsLookup>) -> Self {
        RelayPool {
            lookup,
            cache: RelayPoolCache::new(),
        }
    }

    /// Candidate list for `specifier`, read through the cache.
    ///
    /// `target_host` and `session_id` only seed the shuffle.
    pub async fn resolve(
        &self,
        specifier: &str,
        target_host: &str,
        session_id: &str,
    ) -> Arc<Vec<RelayEntry>> {
        if let Some(hit) = self.cache.get(specifier) {
            debug!("Relay pool cache hit for {} ({} candidates)", specifier, hit.len());
            return hit;
        }

        let normalized = specifier.to_ascii_lowercase();
        let mut entries = if normalized.contains(TXT_MARKER) {
            self.expand_txt(&normalized).await
        } else {
            self.expand_host(&normalized).await
        };

        entries.sort_by(|a, b| a.address.cmp(&b.address));
        shuffle_candidates(&mut entries, seed_for(target_host, session_id));
        entries.truncate(MAX_CANDIDATES);

        debug!(
            "Relay pool {} -> [{}]",
            specifier,
            entries
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
        self.cache.put(specifier, entries)
    }

    /// Index to start the next round-robin pass from
    pub fn cursor(&self) -> usize {
        self.cache.cursor()
    }

    /// Remember the candidate that just connected
    pub fn record_success(&self, idx: usize) {
        self.cache.set_cursor(idx);
    }

    async fn expand_txt(&self, specifier: &str) -> Vec<RelayEntry> {
        let records = self.lookup.lookup(specifier, RecordKind::Txt).await;
        let Some(first) = records.first() else {
            debug!("No TXT record for {}", specifier);
            return Vec::new();
        };
        parse_txt_record(first)
    }

    async fn expand_host(&self, specifier: &str) -> Vec<RelayEntry> {
        let (host, mut port) = parse_host_port(specifier, DEFAULT_RELAY_PORT);
        if let Some(caps) = PORT_LABEL.captures(specifier) {
            if let Ok(p) = caps[1].parse() {
                port = p;
            }
        }

        if is_ip_literal(&host) {
            return vec![RelayEntry::new(host, port)];
        }

        let (v4, v6) = tokio::join!(
            self.lookup.lookup(&host, RecordKind::A),
            self.lookup.lookup(&host, RecordKind::Aaaa)
        );

        let mut entries: Vec<RelayEntry> = v4
            .into_iter()
            .map(|ip| RelayEntry::new(ip, port))
            .chain(v6.into_iter().map(|ip| RelayEntry::new(format!("[{}]", ip), port)))
            .collect();

        if entries.is_empty() {
            entries.push(RelayEntry::new(host, port));
        }
        entries
    }
}

/// Sub-specifiers held in a TXT record
pub fn parse_txt_record(data: &str) -> Vec<RelayEntry> {
    let unquoted = data.trim().trim_matches('"');
    unquoted
        .replace("\\010", ",")
        .replace('\n', ",")
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            let (address, port) = parse_host_port(s, DEFAULT_RELAY_PORT);
            RelayEntry::new(address, port)
        })
        .collect()
}

fn is_ip_literal(host: &str) -> bool {
    strip_brackets(host).parse::<IpAddr>().is_ok()
}

/// Shuffle seed: sum of UTF-16 code units of root domain and session id
pub fn seed_for(target_host: &str, session_id: &str) -> u64 {
    root_domain(target_host)
        .encode_utf16()
        .chain(session_id.encode_utf16())
        .map(u64::from)
        .sum()
}

#[inline]
fn next_seed(seed: u64) -> u64 {
    seed.wrapping_mul(1103515245).wrapping_add(12345) & 0x7fff_ffff
}

/// Deterministic Fisher-Yates driven by the LCG
pub fn shuffle_candidates(entries: &mut [RelayEntry], seed: u64) {
    let mut seed = seed;
    for i in (1..entries.len()).rev() {
        seed = next_seed(seed);
        let j = (seed % (i as u64 + 1)) as usize;
        entries.swap(i, j);
    }
}
