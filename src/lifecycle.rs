//! One attempt at one logical HTTP request.
//!
//! A [`RequestLifecycle`] is plain data: what to send, how to route it, and
//! the history carried across retries. The dispatcher wraps it in an
//! [`Attempt`] while it is in flight, which adds the progress timestamps the
//! watchdog inspects.

use crate::config::RETRY_WARNING_THRESHOLD;
use crate::error::{DispatchError, Result};
use crate::proxy::{AddressFamily, Proxy, ProxyTag};
use crate::transport::{Route, TransportRequest};
use crate::utils;
use crate::worker::TaskId;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::{HeaderMap, Method};
use log::warn;
use parking_lot::Mutex;
use reqwest::cookie::Jar;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use url::Url;

/// Methods a lifecycle can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
}

impl From<HttpMethod> for Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
        }
    }
}

/// Caller-chosen key routing notifications to per-request listeners.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(Arc<str>);

impl RequestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self(Arc::from(id))
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        Self(Arc::from(id))
    }
}

impl From<u64> for RequestId {
    fn from(id: u64) -> Self {
        Self::from(id.to_string())
    }
}

/// Arbitrary values passed through to listeners.
pub type Metadata = HashMap<String, String>;

/// One failed attempt of a logical request.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryLedgerEntry {
    pub proxy: Option<Proxy>,
    pub error: String,
}

/// Progress of an attempt through the request state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Dispatched,
    ResponseReceived,
    BodyRead,
    Completed,
    Failed,
}

/// Configuration and carried history of one logical request.
#[derive(Debug, Clone)]
pub struct RequestLifecycle {
    pub request_id: RequestId,
    pub uri: String,
    pub method: HttpMethod,
    pub headers: BTreeMap<String, String>,
    /// Sent URL-encoded when `raw_body` is unset on a POST.
    pub form_params: BTreeMap<String, String>,
    pub raw_body: Option<String>,

    /// Bound proxy; filled from the pool at launch when `random_proxied`.
    pub proxy: Option<Proxy>,
    /// Sub-pool to select from; the dispatcher's default when unset.
    pub tag: Option<ProxyTag>,
    pub random_proxied: bool,
    pub forced_family: AddressFamily,
    /// IP to connect to instead of resolving the URI host. The URI, `Host`
    /// header and TLS name stay those of the URI.
    pub forced_remote_address: Option<String>,

    pub retry_on_connection_failure: bool,
    /// Do not escalate unhandled terminal failures as fatal.
    pub ignore_errors: bool,

    pub retry_count: u32,
    pub retry_ledger: Vec<RetryLedgerEntry>,
    pub cookie_jar: Arc<Jar>,
    pub metadata: Metadata,
}

impl RequestLifecycle {
    pub fn new(request_id: impl Into<RequestId>, uri: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            uri: uri.into(),
            method: HttpMethod::Get,
            headers: BTreeMap::new(),
            form_params: BTreeMap::new(),
            raw_body: None,
            proxy: None,
            tag: None,
            random_proxied: false,
            forced_family: AddressFamily::Any,
            forced_remote_address: None,
            retry_on_connection_failure: true,
            ignore_errors: false,
            retry_count: 0,
            retry_ledger: Vec::new(),
            cookie_jar: Arc::new(Jar::default()),
            metadata: Metadata::new(),
        }
    }

    pub fn get(request_id: impl Into<RequestId>, uri: impl Into<String>) -> Self {
        Self::new(request_id, uri)
    }

    pub fn post(request_id: impl Into<RequestId>, uri: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Post,
            ..Self::new(request_id, uri)
        }
    }

    /// The lifecycle that retries this one after `error`.
    ///
    /// Appends to the ledger and bumps the retry count. From the warning
    /// threshold on, the successor is the final attempt: no proxy, no further
    /// retries. Past it, retries should already have been disabled.
    pub(crate) fn successor(&self, error: &DispatchError) -> Result<RequestLifecycle> {
        if self.retry_count > RETRY_WARNING_THRESHOLD {
            return Err(DispatchError::RetryOverflow {
                retry_count: self.retry_count,
            });
        }

        let mut retry_ledger = self.retry_ledger.clone();
        retry_ledger.push(RetryLedgerEntry {
            proxy: self.proxy.clone(),
            error: error.to_string(),
        });

        let mut next = RequestLifecycle {
            request_id: self.request_id.clone(),
            uri: self.uri.clone(),
            method: self.method,
            headers: self.headers.clone(),
            form_params: self.form_params.clone(),
            raw_body: self.raw_body.clone(),
            proxy: None,
            tag: self.tag.clone(),
            random_proxied: self.random_proxied,
            forced_family: self.forced_family,
            forced_remote_address: self.forced_remote_address.clone(),
            retry_on_connection_failure: self.retry_on_connection_failure,
            ignore_errors: self.ignore_errors,
            retry_count: self.retry_count + 1,
            retry_ledger,
            cookie_jar: Arc::clone(&self.cookie_jar),
            metadata: self.metadata.clone(),
        };

        if self.retry_count >= RETRY_WARNING_THRESHOLD {
            warn!(
                "{} has been retried {} times, retrying a last time without proxy",
                self, self.retry_count
            );
            next.random_proxied = false;
            next.retry_on_connection_failure = false;
        }
        Ok(next)
    }

    /// Build the request handed to the transport.
    pub(crate) fn build_request(&self) -> Result<TransportRequest> {
        let url = Url::parse(&self.uri)?;
        let mut headers = HeaderMap::new();
        let forced_remote = self.forced_remote_ip()?;
        if forced_remote.is_some() && url.domain().is_none() {
            return Err(DispatchError::InvalidRequest(format!(
                "{} has no host name to pin to a forced address",
                self.uri
            )));
        }

        let body = match self.method {
            HttpMethod::Get => None,
            HttpMethod::Post => Some(match &self.raw_body {
                Some(raw) => {
                    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=UTF-8"));
                    Bytes::from(raw.clone())
                }
                None => {
                    headers.insert(
                        CONTENT_TYPE,
                        HeaderValue::from_static("application/x-www-form-urlencoded"),
                    );
                    Bytes::from(utils::encode_form(&self.form_params))
                }
            }),
        };

        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| DispatchError::InvalidRequest(format!("header {name}: {e}")))?;
            headers.insert(name, header_value(value)?);
        }

        Ok(TransportRequest {
            method: self.method.into(),
            url,
            headers,
            body,
            route: Route {
                proxy: self.proxy.clone(),
                forced_family: self.forced_family,
                forced_remote,
                cookie_jar: Arc::clone(&self.cookie_jar),
            },
        })
    }

    /// The forced remote address as a literal IP; brackets around IPv6 are accepted.
    fn forced_remote_ip(&self) -> Result<Option<IpAddr>> {
        let Some(forced) = self.forced_remote_address.as_deref().map(str::trim) else {
            return Ok(None);
        };
        if forced.is_empty() {
            return Ok(None);
        }
        forced
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse()
            .map(Some)
            .map_err(|_| {
                DispatchError::InvalidRequest(format!(
                    "forced remote address {forced:?} is not an IP address"
                ))
            })
    }
}

impl fmt::Display for RequestLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {} [{}]", self.method, self.uri, self.request_id)?;
        if let Some(proxy) = &self.proxy {
            write!(f, " via {}", proxy)?;
        }
        if !self.retry_ledger.is_empty() {
            write!(f, " (retry {})", self.retry_count)?;
        }
        Ok(())
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| DispatchError::InvalidRequest(format!("header value {value:?}: {e}")))
}

/// Timestamps reached by an attempt. Each is set at most once.
#[derive(Debug, Clone, Copy)]
pub struct Progress {
    pub state: LifecycleState,
    pub requested_at: Option<Instant>,
    pub responded_at: Option<Instant>,
    pub read_at: Option<Instant>,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            state: LifecycleState::Created,
            requested_at: None,
            responded_at: None,
            read_at: None,
        }
    }
}

/// A lifecycle while it is owned by the worker pool.
#[derive(Debug)]
pub struct Attempt {
    pub id: TaskId,
    pub lifecycle: RequestLifecycle,
    progress: Mutex<Progress>,
    cancelled: AtomicBool,
    settled: AtomicBool,
}

impl Attempt {
    pub(crate) fn new(id: TaskId, lifecycle: RequestLifecycle) -> Self {
        Self {
            id,
            lifecycle,
            progress: Mutex::new(Progress::default()),
            cancelled: AtomicBool::new(false),
            settled: AtomicBool::new(false),
        }
    }

    pub fn progress(&self) -> Progress {
        *self.progress.lock()
    }

    pub fn state(&self) -> LifecycleState {
        self.progress.lock().state
    }

    pub(crate) fn mark_dispatched(&self) {
        self.progress.lock().state = LifecycleState::Dispatched;
    }

    pub(crate) fn mark_requested(&self) {
        let mut progress = self.progress.lock();
        progress.requested_at.get_or_insert_with(Instant::now);
    }

    pub(crate) fn mark_responded(&self) {
        let mut progress = self.progress.lock();
        progress.responded_at.get_or_insert_with(Instant::now);
        progress.state = LifecycleState::ResponseReceived;
    }

    pub(crate) fn mark_read(&self) {
        let mut progress = self.progress.lock();
        progress.read_at.get_or_insert_with(Instant::now);
        progress.state = LifecycleState::BodyRead;
    }

    pub(crate) fn mark_completed(&self) {
        self.progress.lock().state = LifecycleState::Completed;
    }

    pub(crate) fn mark_failed(&self) {
        self.progress.lock().state = LifecycleState::Failed;
    }

    /// Claim the right to end this attempt, by completion or by failure.
    /// Only the first caller gets `true`.
    pub(crate) fn settle(&self) -> bool {
        !self.settled.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{TransportError, TransportErrorKind};

    fn reset() -> DispatchError {
        TransportError::new(TransportErrorKind::ConnectionReset, "reset").into()
    }

    #[test]
    fn successor_carries_everything_but_proxy() {
        let mut lifecycle = RequestLifecycle::post("req-1", "http://example.com/submit");
        lifecycle.proxy = Some(Proxy::http("10.0.0.1", 8080));
        lifecycle.random_proxied = true;
        lifecycle.tag = Some(ProxyTag::from("svc"));
        lifecycle.form_params.insert("a".into(), "1".into());
        lifecycle.headers.insert("X-Trace".into(), "t".into());
        lifecycle.metadata.insert("page".into(), "3".into());
        lifecycle.ignore_errors = true;
        lifecycle.forced_family = AddressFamily::Ipv4;

        let next = lifecycle.successor(&reset()).unwrap();
        assert_eq!(next.retry_count, 1);
        assert_eq!(next.proxy, None);
        assert!(next.random_proxied);
        assert!(next.retry_on_connection_failure);
        assert_eq!(next.method, HttpMethod::Post);
        assert_eq!(next.form_params, lifecycle.form_params);
        assert_eq!(next.headers, lifecycle.headers);
        assert_eq!(next.metadata, lifecycle.metadata);
        assert_eq!(next.tag, lifecycle.tag);
        assert_eq!(next.forced_family, AddressFamily::Ipv4);
        assert!(next.ignore_errors);
        assert!(Arc::ptr_eq(&next.cookie_jar, &lifecycle.cookie_jar));
        assert_eq!(
            next.retry_ledger,
            vec![RetryLedgerEntry {
                proxy: Some(Proxy::http("10.0.0.1", 8080)),
                error: reset().to_string(),
            }]
        );
    }

    #[test]
    fn threshold_successor_is_final_and_unproxied() {
        let mut lifecycle = RequestLifecycle::get("req", "http://example.com/");
        lifecycle.random_proxied = true;
        lifecycle.retry_count = RETRY_WARNING_THRESHOLD - 1;

        let fifth = lifecycle.successor(&reset()).unwrap();
        assert_eq!(fifth.retry_count, RETRY_WARNING_THRESHOLD);
        assert!(fifth.random_proxied);

        let last = fifth.successor(&reset()).unwrap();
        assert!(!last.random_proxied);
        assert!(!last.retry_on_connection_failure);
        assert_eq!(last.proxy, None);

        let overflow = last.successor(&reset()).unwrap_err();
        assert!(matches!(overflow, DispatchError::RetryOverflow { retry_count } if retry_count == RETRY_WARNING_THRESHOLD + 1));
    }

    #[test]
    fn post_form_body_is_url_encoded() {
        let mut lifecycle = RequestLifecycle::post("req", "http://example.com/form");
        lifecycle.form_params.insert("a".into(), "1".into());
        let request = lifecycle.build_request().unwrap();
        assert_eq!(request.method, Method::POST);
        assert_eq!(request.body.as_deref(), Some(&b"a=1"[..]));
        assert_eq!(
            request.headers[CONTENT_TYPE],
            "application/x-www-form-urlencoded"
        );
    }

    #[test]
    fn raw_body_wins_over_form() {
        let mut lifecycle = RequestLifecycle::post("req", "http://example.com/raw");
        lifecycle.form_params.insert("a".into(), "1".into());
        lifecycle.raw_body = Some("{\"k\":1}".into());
        lifecycle.headers.insert("Content-Type".into(), "application/json".into());
        let request = lifecycle.build_request().unwrap();
        assert_eq!(request.body.as_deref(), Some(&b"{\"k\":1}"[..]));
        assert_eq!(request.headers[CONTENT_TYPE], "application/json");
    }

    #[test]
    fn get_has_no_body() {
        let lifecycle = RequestLifecycle::get("req", "http://example.com/");
        assert!(lifecycle.build_request().unwrap().body.is_none());
    }

    #[test]
    fn forced_remote_address_keeps_url() {
        let mut lifecycle = RequestLifecycle::get("req", "https://api.example.com:8443/v1?q=1");
        lifecycle.forced_remote_address = Some("203.0.113.7".into());
        let request = lifecycle.build_request().unwrap();
        assert_eq!(request.url.as_str(), "https://api.example.com:8443/v1?q=1");
        assert_eq!(request.route.forced_remote, Some("203.0.113.7".parse().unwrap()));
    }

    #[test]
    fn forced_remote_address_accepts_ipv6() {
        let mut lifecycle = RequestLifecycle::get("req", "http://api.example.com:8080/v1");
        lifecycle.forced_remote_address = Some("2001:db8::7".into());
        let request = lifecycle.build_request().unwrap();
        assert_eq!(request.url.as_str(), "http://api.example.com:8080/v1");
        assert_eq!(request.route.forced_remote, Some("2001:db8::7".parse().unwrap()));

        lifecycle.forced_remote_address = Some("[2001:db8::7]".into());
        let request = lifecycle.build_request().unwrap();
        assert_eq!(request.route.forced_remote, Some("2001:db8::7".parse().unwrap()));
    }

    #[test]
    fn malformed_forced_remote_address_is_rejected() {
        for forced in ["10.0.0.1:8080", "backend.internal", "2001:db8::7::1"] {
            let mut lifecycle = RequestLifecycle::get("req", "http://api.example.com/");
            lifecycle.forced_remote_address = Some(forced.into());
            assert!(
                matches!(lifecycle.build_request(), Err(DispatchError::InvalidRequest(_))),
                "{forced}"
            );
        }

        let mut literal_target = RequestLifecycle::get("req", "http://10.0.0.1/");
        literal_target.forced_remote_address = Some("10.0.0.2".into());
        assert!(literal_target.build_request().is_err());

        let mut blank = RequestLifecycle::get("req", "http://api.example.com/");
        blank.forced_remote_address = Some("  ".into());
        assert_eq!(blank.build_request().unwrap().route.forced_remote, None);
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        let lifecycle = RequestLifecycle::get("req", "not a url");
        assert!(matches!(
            lifecycle.build_request(),
            Err(DispatchError::InvalidRequest(_))
        ));

        let mut lifecycle = RequestLifecycle::get("req", "http://example.com/");
        lifecycle.headers.insert("bad header".into(), "v".into());
        assert!(lifecycle.build_request().is_err());
    }

    #[test]
    fn timestamps_are_set_once() {
        let attempt = Attempt::new(TaskId::from_raw(1), RequestLifecycle::get("r", "http://e/"));
        attempt.mark_dispatched();
        assert_eq!(attempt.state(), LifecycleState::Dispatched);
        attempt.mark_requested();
        let first = attempt.progress().requested_at;
        attempt.mark_requested();
        assert_eq!(attempt.progress().requested_at, first);

        assert!(attempt.settle());
        assert!(!attempt.settle());
        attempt.mark_failed();
        assert_eq!(attempt.state(), LifecycleState::Failed);
    }
}
