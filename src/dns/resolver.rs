//! DNS lookup backends
//!
//! The relay pool only needs raw answer strings, so both backends return
//! `Vec<String>` and swallow failures into an empty answer.

use crate::{Error, Result};
use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// Record types the relay pool asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    A,
    Aaaa,
    Txt,
}

impl RecordKind {
    /// Numeric RR type as used by DNS-JSON
    pub fn code(self) -> u16 {
        match self {
            RecordKind::A => 1,
            RecordKind::Txt => 16,
            RecordKind::Aaaa => 28,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKind::A => write!(f, "A"),
            RecordKind::Aaaa => write!(f, "AAAA"),
            RecordKind::Txt => write!(f, "TXT"),
        }
    }
}

/// Name lookup used by the relay pool
#[async_trait]
pub trait DnsLookup: Send + Sync {
    /// Answer data for `name`. Never fails; errors yield an empty answer.
    async fn lookup(&self, name: &str, kind: RecordKind) -> Vec<String>;
}

#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(rename = "Answer", default)]
    answer: Vec<DohAnswer>,
}

#[derive(Debug, Deserialize)]
struct DohAnswer {
    #[serde(rename = "type")]
    record_type: u16,
    data: String,
}

/// DNS-JSON over HTTPS
pub struct DohResolver {
    client: reqwest::Client,
    endpoint: String,
}

impl DohResolver {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::dns(format!("Failed to build DoH client: {}", e)))?;

        Ok(DohResolver {
            client,
            endpoint: endpoint.into(),
        })
    }

    async fn query(&self, name: &str, kind: RecordKind) -> Result<Vec<String>> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("name", name.to_string()), ("type", kind.code().to_string())])
            .header(ACCEPT, "application/dns-json")
            .send()
            .await
            .map_err(|e| Error::dns(format!("DoH request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::dns(format!("DoH status {}", response.status())));
        }

        let body: DohResponse = response
            .json()
            .await
            .map_err(|e| Error::dns(format!("Invalid DoH response: {}", e)))?;

        Ok(body
            .answer
            .into_iter()
            .filter(|a| a.record_type == kind.code())
            .map(|a| a.data)
            .collect())
    }
}

#[async_trait]
impl DnsLookup for DohResolver {
    async fn lookup(&self, name: &str, kind: RecordKind) -> Vec<String> {
        match self.query(name, kind).await {
            Ok(answers) => {
                debug!("DoH {} {} -> {} answers", kind, name, answers.len());
                answers
            }
            Err(e) => {
                debug!("DoH {} {} failed: {}", kind, name, e);
                Vec::new()
            }
        }
    }
}

/// Resolver backed by the host's resolver configuration
pub struct SystemResolver {
    resolver: TokioAsyncResolver,
}

impl SystemResolver {
    pub fn new(timeout: Duration) -> Self {
        let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(resolver) => resolver,
            Err(e) => {
                warn!("System resolver config unavailable ({}), using Cloudflare", e);
                let mut opts = ResolverOpts::default();
                opts.timeout = timeout;
                opts.attempts = 2;
                TokioAsyncResolver::tokio(ResolverConfig::cloudflare(), opts)
            }
        };
        SystemResolver { resolver }
    }
}

#[async_trait]
impl DnsLookup for SystemResolver {
    async fn lookup(&self, name: &str, kind: RecordKind) -> Vec<String> {
        let answers = match kind {
            RecordKind::A => self
                .resolver
                .ipv4_lookup(name)
                .await
                .map(|r| r.iter().map(|ip| ip.0.to_string()).collect::<Vec<_>>()),
            RecordKind::Aaaa => self
                .resolver
                .ipv6_lookup(name)
                .await
                .map(|r| r.iter().map(|ip| ip.0.to_string()).collect::<Vec<_>>()),
            RecordKind::Txt => self.resolver.txt_lookup(name).await.map(|r| {
                r.iter()
                    .map(|txt| {
                        txt.txt_data()
                            .iter()
                            .map(|part| String::from_utf8_lossy(part).into_owned())
                            .collect::<String>()
                    })
                    .collect::<Vec<_>>()
            }),
        };

        answers.unwrap_or_else(|e| {
            debug!("DNS {} {} failed: {}", kind, name, e);
            Vec::new()
        })
    }
}
