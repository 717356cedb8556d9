//! Proxy identity, capability tags and health records.

use crate::error::TransportError;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

/// Protocol spoken by a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyKind {
    Http,
    Socks,
}

impl ProxyKind {
    fn scheme(self) -> &'static str {
        match self {
            ProxyKind::Http => "http",
            ProxyKind::Socks => "socks5",
        }
    }
}

/// Address family a lifecycle may force for its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddressFamily {
    #[default]
    Any,
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    pub fn is_forced(self) -> bool {
        self != AddressFamily::Any
    }

    pub fn matches(self, ip: &IpAddr) -> bool {
        match self {
            AddressFamily::Any => true,
            AddressFamily::Ipv4 => ip.is_ipv4(),
            AddressFamily::Ipv6 => ip.is_ipv6(),
        }
    }
}

/// Representation of a proxy server. Equality covers host, port and kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Proxy {
    pub host: String,
    pub port: u16,
    pub kind: ProxyKind,
}

impl Proxy {
    pub fn new(host: impl Into<String>, port: u16, kind: ProxyKind) -> Self {
        Self {
            host: host.into(),
            port,
            kind,
        }
    }

    pub fn http(host: impl Into<String>, port: u16) -> Self {
        Self::new(host, port, ProxyKind::Http)
    }

    pub fn socks(host: impl Into<String>, port: u16) -> Self {
        Self::new(host, port, ProxyKind::Socks)
    }

    /// The proxy URL (e.g. "socks5://127.0.0.1:1080").
    pub fn url(&self) -> String {
        match self.literal_ip() {
            Some(IpAddr::V6(ip)) => format!("{}://[{}]:{}", self.kind.scheme(), ip, self.port),
            _ => format!("{}://{}:{}", self.kind.scheme(), self.host, self.port),
        }
    }

    /// The host parsed as a literal IP address, without any DNS lookup.
    pub fn literal_ip(&self) -> Option<IpAddr> {
        self.host.trim_matches(|c| c == '[' || c == ']').parse().ok()
    }

    /// Whether the host is a literal address of the given family.
    pub fn is_family(&self, family: AddressFamily) -> bool {
        match family {
            AddressFamily::Any => true,
            _ => self.literal_ip().is_some_and(|ip| family.matches(&ip)),
        }
    }

    /// Convert the proxy to a reqwest::Proxy.
    pub fn to_reqwest_proxy(&self) -> Result<reqwest::Proxy, TransportError> {
        Ok(reqwest::Proxy::all(self.url())?)
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

/// Error returned when a proxy line cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid proxy address: {0}")]
pub struct InvalidProxy(pub String);

impl FromStr for Proxy {
    type Err = InvalidProxy;

    /// Accepts `host:port`, `http://host:port`, `socks5://host:port` and `[v6]:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (kind, rest) = match s.split_once("://") {
            Some(("http" | "https", rest)) => (ProxyKind::Http, rest),
            Some(("socks" | "socks5" | "socks5h" | "socks4", rest)) => (ProxyKind::Socks, rest),
            Some(_) => return Err(InvalidProxy(s.to_string())),
            None => (ProxyKind::Http, s),
        };
        let rest = rest.trim_end_matches('/');
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| InvalidProxy(s.to_string()))?;
        let host = host.trim_matches(|c| c == '[' || c == ']');
        let port = port.parse().map_err(|_| InvalidProxy(s.to_string()))?;
        if host.is_empty() {
            return Err(InvalidProxy(s.to_string()));
        }
        Ok(Proxy::new(host, port, kind))
    }
}

/// Classifier partitioning the proxy universe into independent sub-pools.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProxyTag(Arc<str>);

impl ProxyTag {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ProxyTag {
    fn default() -> Self {
        Self::new("default")
    }
}

impl fmt::Display for ProxyTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProxyTag {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ProxyTag {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

/// Health of one proxy within one tag.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyHealthRecord {
    pub proxy: Proxy,
    /// Failures observed on real requests routed through this proxy.
    pub failure_count: u64,
    /// Times this proxy was handed out by the pool.
    pub usage_count: u64,
    pub average_response_time_millis: f64,
}

impl ProxyHealthRecord {
    pub fn new(
        proxy: Proxy,
        failure_count: u64,
        usage_count: u64,
        average_response_time_millis: f64,
    ) -> Self {
        Self {
            proxy,
            failure_count,
            usage_count,
            average_response_time_millis,
        }
    }

    /// A record with no history.
    pub fn fresh(proxy: Proxy) -> Self {
        Self::new(proxy, 0, 0, 0.0)
    }
}
