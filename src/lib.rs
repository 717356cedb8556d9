//! # reqwest-proxy-dispatch
//!
//! A proxy-aware asynchronous request dispatcher built on reqwest.
//!
//! Lifecycles are launched on a bounded worker pool. Each one optionally takes
//! the healthiest proxy of its tag from a [`ProxyPool`], and its outcome is
//! fanned out to registered listeners. Transient failures are retried on
//! another proxy, with one last unproxied attempt once the retry threshold is
//! reached. A watchdog fails attempts stuck past the request timeout.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod lifecycle;
pub mod listener;
pub mod pool;
pub mod proxy;
pub mod resolve;
pub mod transport;
mod utils;
mod watchdog;
pub mod worker;

pub use config::{ConnectionPoolSettings, DispatcherConfig, DispatcherConfigBuilder};
pub use dispatcher::Dispatcher;
pub use error::{DispatchError, Result, TransportError, TransportErrorKind};
pub use lifecycle::{
    Attempt, HttpMethod, LifecycleState, Metadata, Progress, RequestId, RequestLifecycle,
    RetryLedgerEntry,
};
pub use listener::{Event, EventKind, Listener, Notification};
pub use pool::ProxyPool;
pub use proxy::{AddressFamily, InvalidProxy, Proxy, ProxyHealthRecord, ProxyKind, ProxyTag};
pub use transport::{ReqwestTransport, Route, Transport, TransportRequest, TransportResponse};
pub use utils::parse_proxy_list;
pub use worker::{Outcome, TaskHandle, TaskId, WorkerPool};
