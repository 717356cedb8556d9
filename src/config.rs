//! Configuration for the dispatcher.

use crate::proxy::ProxyTag;
use std::time::Duration;

/// Default budget for connecting, receiving headers and reading a body.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Retries after which a lifecycle gets one last unproxied attempt.
pub const RETRY_WARNING_THRESHOLD: u32 = 5;

/// Redirects followed by the transport before giving up.
pub const MAX_REDIRECTS: usize = 5;

/// Routes (proxy and pinned address) whose reqwest client is kept for reuse.
pub const CLIENT_CACHE_CAPACITY: usize = 256;

/// How often the watchdog scans live lifecycles.
pub const WATCHDOG_POLL_INTERVAL: Duration = Duration::from_millis(1_000);

/// Connection pool sizing, derived once from the request timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionPoolSettings {
    /// Maximum transport calls in flight at once.
    pub max_total: usize,
    /// Maximum idle connections kept per host.
    pub max_per_route: usize,
    /// Read timeout applied to every socket.
    pub socket_timeout: Duration,
}

impl ConnectionPoolSettings {
    fn derive(request_timeout: Duration) -> Self {
        let millis = request_timeout.as_millis().max(1) as usize;
        Self {
            max_total: millis,
            max_per_route: millis,
            socket_timeout: request_timeout,
        }
    }
}

/// Configuration for the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Budget for connect, response headers and body read.
    pub request_timeout: Duration,
    /// Tag used for lifecycles that do not name one.
    pub default_tag: ProxyTag,
    /// Connection pool sizing derived from `request_timeout`.
    pub connection_pool: ConnectionPoolSettings,
}

impl DispatcherConfig {
    /// Create a new configuration builder.
    pub fn builder() -> DispatcherConfigBuilder {
        DispatcherConfigBuilder::new()
    }

    pub fn request_timeout_millis(&self) -> u64 {
        self.request_timeout.as_millis() as u64
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfigBuilder::new().build()
    }
}

/// Builder for `DispatcherConfig`.
#[derive(Debug, Default)]
pub struct DispatcherConfigBuilder {
    request_timeout: Option<Duration>,
    default_tag: Option<ProxyTag>,
}

impl DispatcherConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the budget for connecting, receiving headers and reading a body.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Set the tag used for lifecycles that do not name one.
    pub fn default_tag(mut self, tag: impl Into<ProxyTag>) -> Self {
        self.default_tag = Some(tag.into());
        self
    }

    /// Build the configuration.
    pub fn build(self) -> DispatcherConfig {
        let request_timeout = self.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        DispatcherConfig {
            request_timeout,
            default_tag: self.default_tag.unwrap_or_default(),
            connection_pool: ConnectionPoolSettings::derive(request_timeout),
        }
    }
}
