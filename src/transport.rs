//! Transport collaborator: executes one built request.

use crate::config::{ConnectionPoolSettings, DispatcherConfig, CLIENT_CACHE_CAPACITY, MAX_REDIRECTS};
use crate::error::{TransportError, TransportErrorKind};
use crate::proxy::{AddressFamily, Proxy, ProxyKind};
use crate::resolve;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, LOCATION, SET_COOKIE};
use http::{HeaderMap, Method, StatusCode};
use log::{debug, warn};
use parking_lot::Mutex;
use reqwest::cookie::{CookieStore, Jar};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// How a request reaches its target.
#[derive(Debug, Clone)]
pub struct Route {
    pub proxy: Option<Proxy>,
    /// Ignored when a proxy is configured.
    pub forced_family: AddressFamily,
    /// Connect to this IP instead of resolving the URL host. Ignored when a
    /// proxy is configured.
    pub forced_remote: Option<IpAddr>,
    pub cookie_jar: Arc<Jar>,
}

/// A fully built request.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub route: Route,
}

/// Response headers, with the body still to be read.
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    body: BoxFuture<'static, Result<Bytes, TransportError>>,
}

impl TransportResponse {
    pub fn new<F>(status: StatusCode, headers: HeaderMap, body: F) -> Self
    where
        F: Future<Output = Result<Bytes, TransportError>> + Send + 'static,
    {
        Self {
            status,
            headers,
            body: body.boxed(),
        }
    }

    /// A response whose body is already in memory.
    pub fn ready(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        Self::new(status, headers, async move { Ok(body) })
    }

    /// Read the whole body.
    pub async fn bytes(self) -> Result<Bytes, TransportError> {
        self.body.await
    }
}

impl fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Executes requests. Errors must keep transient and fatal failures apart.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    proxy: Option<Proxy>,
    pinned: Option<(String, SocketAddr)>,
}

/// reqwest-backed transport sharing one connection pool per route.
///
/// Redirects are followed here rather than by reqwest so that every hop
/// reads from and writes to the lifecycle's cookie jar.
pub struct ReqwestTransport {
    settings: ConnectionPoolSettings,
    connect_timeout: Duration,
    capacity: usize,
    clients: Mutex<HashMap<ClientKey, reqwest::Client>>,
}

impl ReqwestTransport {
    pub fn new(config: &DispatcherConfig) -> Self {
        Self {
            settings: config.connection_pool,
            connect_timeout: config.request_timeout,
            capacity: CLIENT_CACHE_CAPACITY,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client(&self, key: ClientKey) -> Result<reqwest::Client, TransportError> {
        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .read_timeout(self.settings.socket_timeout)
            .pool_max_idle_per_host(self.settings.max_per_route)
            .redirect(reqwest::redirect::Policy::none());
        builder = match &key.proxy {
            Some(proxy) => builder.proxy(proxy.to_reqwest_proxy()?),
            None => builder.no_proxy(),
        };
        if let Some((host, addr)) = &key.pinned {
            builder = builder.resolve(host, *addr);
        }
        let client = builder.build()?;

        if clients.len() >= self.capacity {
            // proxies rotate out of the pool; drop an arbitrary route to make room
            if let Some(evicted) = clients.keys().next().cloned() {
                clients.remove(&evicted);
                debug!("Evicted cached client for {:?}", evicted);
            }
        }
        clients.insert(key, client.clone());
        Ok(client)
    }

    /// Pin the target host to the forced remote address or to the forced
    /// family, unless a proxy takes precedence.
    async fn pin(&self, request: &TransportRequest) -> Result<Option<(String, SocketAddr)>, TransportError> {
        let route = &request.route;
        if route.forced_remote.is_none() && !route.forced_family.is_forced() {
            return Ok(None);
        }
        if let Some(proxy) = &route.proxy {
            match proxy.kind {
                ProxyKind::Http => warn!(
                    "Forced routing ({:?}, {:?}) requested but HTTP proxy {} is configured, ignoring",
                    route.forced_remote, route.forced_family, proxy
                ),
                ProxyKind::Socks => debug!(
                    "Forced routing ({:?}, {:?}) requested but SOCKS proxy {} is configured, ignoring",
                    route.forced_remote, route.forced_family, proxy
                ),
            }
            return Ok(None);
        }

        let host = request.url.host_str().ok_or_else(|| {
            TransportError::new(TransportErrorKind::Builder, format!("{} has no host", request.url))
        })?;
        let port = request.url.port_or_known_default().unwrap_or(80);
        let addr = match route.forced_remote {
            Some(ip) => {
                if !route.forced_family.matches(&ip) {
                    warn!(
                        "Forced remote address {} is not {:?}, using it anyway",
                        ip, route.forced_family
                    );
                }
                SocketAddr::new(ip, port)
            }
            None => resolve::resolve_family(host, port, route.forced_family).await?,
        };
        Ok(Some((host.to_string(), addr)))
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let pinned = self.pin(&request).await?;
        let client = self.client(ClientKey {
            proxy: request.route.proxy.clone(),
            pinned,
        })?;

        let TransportRequest {
            mut method,
            mut url,
            mut headers,
            mut body,
            route,
        } = request;

        let mut hops = 0;
        loop {
            let mut builder = client.request(method.clone(), url.clone()).headers(headers.clone());
            if let Some(cookies) = route.cookie_jar.cookies(&url) {
                builder = builder.header(COOKIE, cookies);
            }
            if let Some(body) = &body {
                builder = builder.body(body.clone());
            }

            let response = builder.send().await?;
            route
                .cookie_jar
                .set_cookies(&mut response.headers().get_all(SET_COOKIE).iter(), response.url());

            let status = response.status();
            let Some(next) = redirect_target(&url, status, response.headers())? else {
                let headers = response.headers().clone();
                return Ok(TransportResponse::new(status, headers, async move {
                    Ok(response.bytes().await?)
                }));
            };

            if hops == MAX_REDIRECTS {
                return Err(TransportError::new(
                    TransportErrorKind::Redirect,
                    format!("too many redirects, last {} -> {}", url, next),
                ));
            }
            hops += 1;
            debug!("Following {} redirect {} -> {}", status, url, next);

            if status == StatusCode::SEE_OTHER
                || (method == Method::POST
                    && matches!(status, StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND))
            {
                method = Method::GET;
                body = None;
                headers.remove(CONTENT_TYPE);
                headers.remove(CONTENT_LENGTH);
            }
            if next.origin() != url.origin() {
                headers.remove(AUTHORIZATION);
                headers.remove(COOKIE);
            }
            url = next;
        }
    }
}

/// Where a redirect response points, if it is one.
fn redirect_target(
    current: &Url,
    status: StatusCode,
    headers: &HeaderMap,
) -> Result<Option<Url>, TransportError> {
    if !matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    ) {
        return Ok(None);
    }
    let Some(location) = headers.get(LOCATION) else {
        warn!("Redirect status {} for {} but no Location header", status, current);
        return Ok(None);
    };
    let location = location.to_str().map_err(|e| {
        TransportError::new(TransportErrorKind::Redirect, format!("bad Location header: {e}"))
    })?;
    current.join(location).map(Some).map_err(|e| {
        TransportError::new(
            TransportErrorKind::Redirect,
            format!("bad Location {location:?}: {e}"),
        )
    })
}
