//! Configuration module

mod parser;

pub use parser::*;

use crate::common::crypto::{self, Credentials};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tracing::warn;

/// Hosts that are never tunneled
pub const DEFAULT_BLOCKED_HOSTS: &[&str] = &["speed.cloudflare.com"];

/// Destinations routed through the single-hop proxy even when it is not global
pub const DEFAULT_PROXY_WHITELIST: &[&str] = &[
    "*tapecontent.net",
    "*cloudatacdn.com",
    "*loadshare.org",
    "*cdn-centaurus.com",
    "scholar.google.com",
];

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// WebSocket listen address
    pub listen: String,

    /// Admin secret used to derive the user id
    #[serde(rename = "admin-secret")]
    pub admin_secret: String,

    /// Derivation key
    pub key: String,

    /// Explicit v4 UUID, overrides the derived user id
    pub uuid: Option<String>,

    /// Accepted Host header values (empty accepts any)
    pub hosts: Vec<String>,

    /// Secondary relay pool
    pub relay: RelayConfig,

    /// Default single-hop proxy
    pub proxy: ProxyConfig,

    /// Default two-hop CONNECT proxy, `host:port[:user:pass]`
    #[serde(rename = "two-proxy")]
    pub two_proxy: Option<String>,

    /// Destination denylist (exact host or any subdomain)
    #[serde(rename = "blocked-hosts")]
    pub blocked_hosts: Vec<String>,

    /// DNS configuration
    pub dns: DnsConfig,

    /// Log level
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration from file
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path).await?;
        Self::from_str(&content)
    }

    /// Load from string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.listen
            .parse::<SocketAddr>()
            .map_err(|e| Error::config(format!("Invalid listen address {}: {}", self.listen, e)))?;

        self.dns
            .upstream
            .parse::<SocketAddr>()
            .map_err(|e| Error::config(format!("Invalid DNS upstream {}: {}", self.dns.upstream, e)))?;

        if self.admin_secret.is_empty() {
            return Err(Error::config("admin-secret cannot be empty"));
        }

        if let Some(uuid) = &self.uuid {
            if !crypto::is_valid_uuid_v4(uuid) {
                // Same as an unset override: the derived id is used.
                warn!("Configured uuid {} is not a v4 UUID, ignoring", uuid);
            }
        }

        if let Some(two_proxy) = &self.two_proxy {
            parse_two_hop(two_proxy)?;
        }

        Ok(())
    }

    /// Apply process environment overrides
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup (ADMIN/PASSWORD, KEY, UUID,
    /// PROXYIP, RELAY_FALLBACK, SOCKS5, GO2SOCKS5, TWO_PROXY, HOST)
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(secret) = get("ADMIN").or_else(|| get("PASSWORD")) {
            self.admin_secret = secret;
        }
        if let Some(key) = get("KEY") {
            self.key = key;
        }
        if let Some(uuid) = get("UUID") {
            self.uuid = Some(uuid);
        }
        if let Some(proxy_ip) = get("PROXYIP") {
            self.relay.specifiers = parse_to_array(&proxy_ip);
        }
        if let Some(fallback) = get("RELAY_FALLBACK") {
            self.relay.fallback = !matches!(
                fallback.trim().to_ascii_lowercase().as_str(),
                "false" | "0" | "off" | "no"
            );
        }
        if let Some(account) = get("SOCKS5") {
            self.proxy.account = Some(account);
        }
        if let Some(whitelist) = get("GO2SOCKS5") {
            self.proxy.whitelist = parse_to_array(&whitelist);
        }
        if let Some(two_proxy) = get("TWO_PROXY") {
            self.two_proxy = Some(two_proxy);
        }
        if let Some(hosts) = get("HOST") {
            self.hosts = parse_to_array(&hosts)
                .iter()
                .map(|h| normalize_host(h))
                .collect();
        }
    }

    /// Credentials accepted by the tunnel entry
    pub fn credentials(&self) -> Result<Credentials> {
        Credentials::new(&self.admin_secret, &self.key, self.uuid.as_deref())
    }

    /// Host header check. An empty list accepts any host.
    pub fn is_allowed_host(&self, host: &str) -> bool {
        if self.hosts.is_empty() {
            return true;
        }
        let host = host.to_ascii_lowercase();
        self.hosts.iter().any(|h| normalize_host(h) == host)
    }

    /// Pick one configured relay specifier at random
    pub fn pick_relay_specifier(&self) -> Option<String> {
        let candidates: Vec<String> = self
            .relay
            .specifiers
            .iter()
            .flat_map(|s| parse_to_array(s))
            .collect();
        pick_random(&candidates)
    }

    /// Defaults for request parameter parsing
    pub fn session_defaults(&self, relay_specifier: Option<String>) -> SessionDefaults {
        SessionDefaults {
            relay_specifier,
            proxy_account: self.proxy.account.clone(),
            proxy_kind: self.proxy.kind,
            global_proxy: self.proxy.global,
            two_proxy: self.two_proxy.clone(),
            whitelist: Arc::new(HostPatterns::new(self.proxy.whitelist.as_slice())),
            relay_last_resort: self.relay.last_resort.clone(),
        }
    }

    /// Save configuration to file
    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        fs::write(path, content).await?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: "0.0.0.0:8080".to_string(),
            admin_secret: crypto::DEFAULT_ADMIN_SECRET.to_string(),
            key: crypto::DEFAULT_KEY.to_string(),
            uuid: None,
            hosts: Vec::new(),
            relay: RelayConfig::default(),
            proxy: ProxyConfig::default(),
            two_proxy: None,
            blocked_hosts: DEFAULT_BLOCKED_HOSTS.iter().map(|s| s.to_string()).collect(),
            dns: DnsConfig::default(),
            log_level: Some("info".to_string()),
        }
    }
}

/// Lowercase, drop scheme, path and port
fn normalize_host(host: &str) -> String {
    let host = host.to_ascii_lowercase();
    let host = host
        .strip_prefix("https://")
        .or_else(|| host.strip_prefix("http://"))
        .unwrap_or(&host);
    let host = host.split('/').next().unwrap_or(host);
    crate::common::net::host_without_port(host).to_string()
}

/// Secondary relay pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Relay specifiers; one is picked at random at startup
    pub specifiers: Vec<String>,

    /// `host:port` dialed when no specifier is in effect
    #[serde(rename = "last-resort")]
    pub last_resort: Option<String>,

    /// Retry through the relays when a direct connection fails or stays silent
    pub fallback: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            specifiers: Vec::new(),
            last_resort: None,
            fallback: true,
        }
    }
}

/// Single-hop proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// `[user:pass@]host[:port]`
    pub account: Option<String>,

    /// Proxy protocol for `account`
    pub kind: ProxyKind,

    /// Route every destination through the proxy
    pub global: bool,

    /// Glob patterns routed through the proxy when not global
    pub whitelist: Vec<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            account: None,
            kind: ProxyKind::Socks5,
            global: false,
            whitelist: DEFAULT_PROXY_WHITELIST.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Backend used for relay pool lookups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DnsMode {
    /// DNS-JSON over HTTPS
    #[default]
    Doh,
    /// hickory resolver with the system configuration
    System,
}

/// DNS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    /// Lookup backend
    pub mode: DnsMode,

    /// DoH endpoint
    #[serde(rename = "doh-url")]
    pub doh_url: String,

    /// DoH request timeout in seconds
    #[serde(rename = "doh-timeout")]
    pub doh_timeout: u64,

    /// TCP DNS server used for tunneled port 53 queries
    pub upstream: String,
}

impl Default for DnsConfig {
    fn default() -> Self {
        DnsConfig {
            mode: DnsMode::Doh,
            doh_url: "https://1.1.1.1/dns-query".to_string(),
            doh_timeout: 5,
            upstream: "8.8.4.4:53".to_string(),
        }
    }
}
