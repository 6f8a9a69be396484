//! Request parameter parsing
//!
//! A tunnel request can carry its own proxy settings in the path or query
//! string. They are parsed into an immutable [`SessionConfig`] that is handed
//! to the connector for that one session.

use crate::{Error, Result};
use base64::Engine;
use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

static RELAY_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/(proxyip[.=]|pyip=|ip=)(.+)").expect("valid relay path regex"));

static PROXY_URL_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)/(socks5?|http):/?/?(.+)").expect("valid proxy url path regex")
});

static PROXY_ASSIGN_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)/(g?s5|socks5|g?http)=(.+)").expect("valid proxy assign path regex")
});

static TWO_PROXY_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"two_proxy=([^&]+)").expect("valid two_proxy regex"));

static BASE64_USERINFO: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:[A-Z0-9+/]{4})*(?:[A-Z0-9+/]{2}==|[A-Z0-9+/]{3}=)?$")
        .expect("valid base64 regex")
});

/// Default port of a single-hop proxy account
const DEFAULT_PROXY_PORT: u16 = 80;

/// Single-hop proxy protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    #[default]
    Socks5,
    Http,
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyKind::Socks5 => write!(f, "SOCKS5"),
            ProxyKind::Http => write!(f, "HTTP"),
        }
    }
}

/// Parsed single-hop proxy account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyAccount {
    pub kind: ProxyKind,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Domain, IPv4 or bracketed IPv6
    pub hostname: String,
    pub port: u16,
}

impl ProxyAccount {
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => {
                Some((user.as_str(), pass.as_str()))
            }
            _ => None,
        }
    }
}

/// Parsed two-hop CONNECT proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TwoHopProxy {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl TwoHopProxy {
    pub fn credentials(&self) -> Option<(&str, &str)> {
        if self.username.is_empty() || self.password.is_empty() {
            None
        } else {
            Some((self.username.as_str(), self.password.as_str()))
        }
    }
}

/// Compiled `*` glob patterns, anchored and case-insensitive
#[derive(Debug, Clone, Default)]
pub struct HostPatterns {
    patterns: Vec<Regex>,
}

impl HostPatterns {
    pub fn new<S: AsRef<str>>(globs: &[S]) -> Self {
        let patterns = globs
            .iter()
            .filter_map(|glob| {
                let escaped = regex::escape(glob.as_ref()).replace(r"\*", ".*");
                RegexBuilder::new(&format!("^{}$", escaped))
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| warn!("Skipping whitelist pattern {}: {}", glob.as_ref(), e))
                    .ok()
            })
            .collect();
        HostPatterns { patterns }
    }

    pub fn matches(&self, host: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(host))
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Gateway-wide defaults that request parameters may override
#[derive(Debug, Clone, Default)]
pub struct SessionDefaults {
    pub relay_specifier: Option<String>,
    pub proxy_account: Option<String>,
    pub proxy_kind: ProxyKind,
    pub global_proxy: bool,
    pub two_proxy: Option<String>,
    pub whitelist: Arc<HostPatterns>,
    pub relay_last_resort: Option<String>,
}

/// Proxy settings for one session
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Relay pool specifier in effect
    pub relay_specifier: Option<String>,
    /// Relay dialed when no specifier is in effect
    pub relay_last_resort: Option<(String, u16)>,
    /// Single-hop proxy
    pub proxy: Option<ProxyAccount>,
    /// Route every destination through `proxy`
    pub global_proxy: bool,
    /// Two-hop CONNECT proxy
    pub two_hop: Option<TwoHopProxy>,
    /// Destinations routed through `proxy` when not global
    pub whitelist: Arc<HostPatterns>,
}

impl SessionConfig {
    /// The single-hop proxy when it applies to `host` up front
    pub fn single_hop_for(&self, host: &str) -> Option<&ProxyAccount> {
        self.proxy
            .as_ref()
            .filter(|_| self.global_proxy || self.whitelist.matches(host))
    }
}

/// Split a list separated by commas, newlines, tabs or quotes
pub fn parse_to_array(content: &str) -> Vec<String> {
    content
        .split(|c: char| matches!(c, ',' | '\t' | '"' | '\'' | '\r' | '\n'))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Pick one element at random
pub fn pick_random(items: &[String]) -> Option<String> {
    items.choose(&mut rand::thread_rng()).cloned()
}

fn pick_from_list(list: &str) -> Option<String> {
    pick_random(&list.split(',').map(String::from).collect::<Vec<_>>())
}

/// Decode base64 userinfo (`%3D` allowed for `=`) when it has no `:`
fn decode_userinfo(userinfo: &str) -> String {
    let userinfo = userinfo.replace("%3D", "=");
    if userinfo.contains(':') || !BASE64_USERINFO.is_match(&userinfo) {
        return userinfo;
    }
    base64::engine::general_purpose::STANDARD
        .decode(&userinfo)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or(userinfo)
}

fn parse_port_digits(s: &str) -> Result<u16> {
    let digits: String = s.chars().filter(char::is_ascii_digit).collect();
    digits
        .parse::<u16>()
        .map_err(|_| Error::parse(format!("Port must be a number: {}", s)))
}

/// Parse `[user:pass@]host[:port]`; userinfo may be base64
pub fn parse_proxy_account(address: &str, kind: ProxyKind) -> Result<ProxyAccount> {
    let (host_part, auth_part) = match address.rfind('@') {
        Some(at) => (&address[at + 1..], Some(decode_userinfo(&address[..at]))),
        None => (address, None),
    };

    let (username, password) = match auth_part.as_deref() {
        Some(auth) if !auth.is_empty() => {
            let mut parts = auth.split(':');
            let username = parts.next().unwrap_or_default().to_string();
            let password = parts.next().unwrap_or_default().to_string();
            if password.is_empty() {
                return Err(Error::parse("Proxy auth must be \"username:password\""));
            }
            (Some(username), Some(password))
        }
        _ => (None, None),
    };

    let (hostname, port) = if let Some((host, port)) = host_part.split_once("]:") {
        (format!("{}]", host), parse_port_digits(port)?)
    } else if host_part.starts_with('[') {
        (host_part.to_string(), DEFAULT_PROXY_PORT)
    } else {
        let parts: Vec<&str> = host_part.split(':').collect();
        if parts.len() == 2 {
            (parts[0].to_string(), parse_port_digits(parts[1])?)
        } else {
            (host_part.to_string(), DEFAULT_PROXY_PORT)
        }
    };

    if hostname.is_empty() {
        return Err(Error::parse("Proxy host cannot be empty"));
    }
    if hostname.contains(':') && !(hostname.starts_with('[') && hostname.ends_with(']')) {
        return Err(Error::parse(format!(
            "IPv6 proxy address must be bracketed, like [2001:db8::1]: {}",
            hostname
        )));
    }

    Ok(ProxyAccount {
        kind,
        username,
        password,
        hostname,
        port,
    })
}

/// Parse `host:port[:user:pass]`
pub fn parse_two_hop(s: &str) -> Result<TwoHopProxy> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() < 2 {
        return Err(Error::parse(format!("Two-hop proxy must be host:port[:user:pass]: {}", s)));
    }
    let port = parts[1]
        .trim()
        .parse::<u16>()
        .map_err(|_| Error::parse(format!("Invalid two-hop proxy port: {}", parts[1])))?;

    Ok(TwoHopProxy {
        hostname: parts[0].to_string(),
        port,
        username: parts.get(2).map(|s| s.to_string()).unwrap_or_default(),
        password: parts.get(3).map(|s| s.to_string()).unwrap_or_default(),
    })
}

/// Parse `host[:port]` / `[v6][:port]`
pub fn parse_host_port(s: &str, default_port: u16) -> (String, u16) {
    if let Some((host, port)) = s.split_once("]:") {
        return (format!("{}]", host), port.parse().unwrap_or(default_port));
    }
    if !s.starts_with('[') {
        if let Some(idx) = s.rfind(':') {
            return (s[..idx].to_string(), s[idx + 1..].parse().unwrap_or(default_port));
        }
    }
    (s.to_string(), default_port)
}

fn decode_twice(s: &str) -> String {
    let once = urlencoding::decode(s).map(|c| c.into_owned()).unwrap_or_else(|_| s.to_string());
    urlencoding::decode(&once)
        .map(|c| c.into_owned())
        .unwrap_or(once)
}

/// Build the session's proxy settings from the request path and query
pub fn parse_request_params(
    path: &str,
    query: Option<&str>,
    defaults: &SessionDefaults,
) -> SessionConfig {
    let params: Vec<(String, String)> = query
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect()
        })
        .unwrap_or_default();
    let get = |name: &str| {
        params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    };

    // Relay specifier: query beats path beats the gateway default
    let path_lower = path.to_ascii_lowercase();
    let request_relay = if let Some(list) = get("proxyip").filter(|v| !v.is_empty()) {
        pick_from_list(list)
    } else if let Some(caps) = RELAY_PATH.captures(&path_lower) {
        let value = if &caps[1] == "proxyip." {
            format!("proxyip.{}", &caps[2])
        } else {
            caps[2].to_string()
        };
        pick_from_list(&value)
    } else {
        None
    };
    let relay_explicit = request_relay.is_some();
    let relay_specifier = request_relay.or_else(|| defaults.relay_specifier.clone());
    let relay_last_resort = if relay_explicit || relay_specifier.is_some() {
        None
    } else {
        defaults
            .relay_last_resort
            .as_deref()
            .map(|s| parse_host_port(s, 443))
    };

    // Single-hop proxy
    let mut global_proxy = defaults.global_proxy || params.iter().any(|(k, _)| k == "globalproxy");
    let mut account = None;
    let mut kind = defaults.proxy_kind;

    // A request relay overrides every request-level proxy parameter
    if !relay_explicit {
        if let Some(v) = get("socks5").filter(|v| !v.is_empty()) {
            account = Some(v.to_string());
            kind = ProxyKind::Socks5;
        } else if let Some(v) = get("http").filter(|v| !v.is_empty()) {
            account = Some(v.to_string());
            kind = ProxyKind::Http;
        }

        if let Some(caps) = PROXY_URL_PATH.captures(path) {
            kind = if caps[1].eq_ignore_ascii_case("http") {
                ProxyKind::Http
            } else {
                ProxyKind::Socks5
            };
            account = caps[2].split('#').next().map(String::from);
            global_proxy = true;
        } else if let Some(caps) = PROXY_ASSIGN_PATH.captures(path) {
            let prefix = caps[1].to_ascii_lowercase();
            kind = if prefix.contains("http") {
                ProxyKind::Http
            } else {
                ProxyKind::Socks5
            };
            account = Some(caps[2].to_string());
            global_proxy = global_proxy || prefix.starts_with('g');
        }

        if get("http").is_some_and(|v| !v.is_empty()) {
            kind = ProxyKind::Http;
        }
    }

    let proxy = match account.or_else(|| defaults.proxy_account.clone()) {
        Some(account) => match parse_proxy_account(&account, kind) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!("Ignoring proxy account: {}", e);
                None
            }
        },
        None => None,
    };

    // Two-hop proxy
    let two_proxy = TWO_PROXY_PATH
        .captures(path)
        .map(|caps| decode_twice(&caps[1]))
        .or_else(|| get("two_proxy").map(|v| decode_twice(v)))
        .filter(|v| !v.is_empty())
        .or_else(|| defaults.two_proxy.clone());

    let two_hop = two_proxy.and_then(|s| match parse_two_hop(&s) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!("Ignoring two-hop proxy: {}", e);
            None
        }
    });

    SessionConfig {
        relay_specifier,
        relay_last_resort,
        proxy,
        global_proxy,
        two_hop,
        whitelist: defaults.whitelist.clone(),
    }
}
