//! The dispatcher: launches lifecycles, runs them, retries their failures.

use crate::config::DispatcherConfig;
use crate::error::{DispatchError, Result};
use crate::lifecycle::{Attempt, RequestId, RequestLifecycle};
use crate::listener::{EventKind, Listener, Listeners, Notification};
use crate::pool::ProxyPool;
use crate::transport::{ReqwestTransport, Transport, TransportRequest, TransportResponse};
use crate::watchdog;
use crate::worker::{Outcome, TaskHandle, WorkerPool};

use log::{debug, error, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

/// Where a failure was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureSource {
    /// The attempt's own task caught a transport error.
    Task,
    /// The watchdog found the attempt past its time budget.
    Watchdog,
}

pub(crate) struct Inner {
    pub(crate) config: DispatcherConfig,
    pub(crate) pool: Arc<ProxyPool>,
    pub(crate) workers: Arc<WorkerPool>,
    listeners: Listeners,
    transport: Arc<dyn Transport>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    fatal: broadcast::Sender<DispatchError>,
}

/// Launches request lifecycles on a worker pool, rotating through pooled
/// proxies and retrying transient failures.
///
/// Cloning is cheap and every clone drives the same pool, listeners and
/// watchdog. Must be created inside a tokio runtime: the watchdog is spawned
/// on construction and stops with [`Dispatcher::shutdown`], [`Dispatcher::abort`],
/// or when the last clone is dropped.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Create a dispatcher with its own proxy pool and a reqwest transport.
    pub fn new(config: DispatcherConfig) -> Self {
        let transport = Arc::new(ReqwestTransport::new(&config));
        Self::with_parts(config, Arc::new(ProxyPool::new()), transport)
    }

    /// Create a dispatcher over an existing pool and transport.
    pub fn with_parts(
        config: DispatcherConfig,
        pool: Arc<ProxyPool>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (fatal, _) = broadcast::channel(64);
        let inner = Arc::new(Inner {
            workers: Arc::new(WorkerPool::new(config.connection_pool.max_total)),
            config,
            pool,
            listeners: Listeners::default(),
            transport,
            closed: AtomicBool::new(false),
            shutdown,
            fatal,
        });
        tokio::spawn(watchdog::run(Arc::downgrade(&inner), shutdown_rx));
        info!(
            "Dispatcher started (request timeout {} ms, default tag [{}])",
            inner.config.request_timeout_millis(),
            inner.config.default_tag
        );
        Self { inner }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    pub fn proxy_pool(&self) -> &Arc<ProxyPool> {
        &self.inner.pool
    }

    /// Submit a lifecycle for asynchronous execution.
    ///
    /// Selects a pooled proxy first when the lifecycle is `random_proxied`;
    /// pool exhaustion and malformed requests are reported here, before
    /// anything runs.
    pub fn launch(&self, lifecycle: RequestLifecycle) -> Result<TaskHandle> {
        self.inner.launch(lifecycle)
    }

    /// Build and execute a lifecycle inline, bypassing retries and listeners.
    pub async fn launch_synchronous(&self, lifecycle: RequestLifecycle) -> Result<TransportResponse> {
        let request = lifecycle.build_request()?;
        debug!("Executing {} synchronously", lifecycle);
        Ok(self.inner.transport.send(request).await?)
    }

    /// Listen to every notification of `kind`.
    pub fn register_listener<F>(&self, kind: EventKind, listener: F)
    where
        F: Fn(&Notification<'_>) + Send + Sync + 'static,
    {
        self.inner.listeners.register(kind, Arc::new(listener) as Listener);
    }

    /// Listen to notifications of `kind` for one request id, replacing any
    /// listener already registered for that id and kind.
    pub fn register_step_listener<F>(&self, request_id: impl Into<RequestId>, kind: EventKind, listener: F)
    where
        F: Fn(&Notification<'_>) + Send + Sync + 'static,
    {
        self.inner
            .listeners
            .register_step(request_id.into(), kind, Arc::new(listener) as Listener);
    }

    /// Forget every step listener of a request id.
    pub fn remove_step_listeners(&self, request_id: impl Into<RequestId>) {
        self.inner.listeners.remove_step(&request_id.into());
    }

    /// Fatal errors raised by tasks or the watchdog from now on.
    pub fn fatal_errors(&self) -> broadcast::Receiver<DispatchError> {
        self.inner.fatal.subscribe()
    }

    /// Number of attempts in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.workers.len()
    }

    /// Resolve once no attempt is in flight.
    pub async fn wait_idle(&self) {
        self.inner.workers.wait_idle().await
    }

    /// Stop the watchdog, refuse new launches and let in-flight attempts drain.
    ///
    /// Draining attempts that fail are not retried.
    pub async fn shutdown(&self) {
        self.inner.close();
        self.inner.workers.wait_idle().await;
        info!("Dispatcher shut down");
    }

    /// Stop the watchdog, refuse new launches and interrupt every attempt.
    pub fn abort(&self) {
        self.inner.close();
        self.inner.workers.interrupt_all();
        info!("Dispatcher aborted");
    }
}

impl Inner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.shutdown.send_replace(true);
    }

    pub(crate) fn launch(self: &Arc<Self>, mut lifecycle: RequestLifecycle) -> Result<TaskHandle> {
        if self.is_closed() {
            return Err(DispatchError::ShutDown);
        }

        let tag = lifecycle
            .tag
            .get_or_insert_with(|| self.config.default_tag.clone())
            .clone();
        if lifecycle.random_proxied {
            if !self.pool.exists_eligible(&tag) {
                return Err(DispatchError::NoEligibleProxy { tag });
            }
            lifecycle.proxy = Some(self.pool.select_next(&tag, lifecycle.forced_family)?);
        }

        let request = lifecycle.build_request()?;
        let attempt = Arc::new(Attempt::new(self.workers.next_id(), lifecycle));
        attempt.mark_dispatched();
        debug!("Dispatching {} as {}", attempt.lifecycle, attempt.id);

        let inner = Arc::clone(self);
        let running = Arc::clone(&attempt);
        Ok(self.workers.submit(attempt, async move {
            let result = inner.execute(&running, request).await;
            if let Err(e) = &result {
                inner.report_fatal(&running, e);
            }
            result
        }))
    }

    /// Drive one attempt through the state machine.
    async fn execute(self: &Arc<Self>, attempt: &Arc<Attempt>, request: TransportRequest) -> Result<Outcome> {
        attempt.mark_requested();

        let response = match self.transport.send(request).await {
            Ok(response) => response,
            Err(e) => return self.fail(attempt, e.into(), FailureSource::Task),
        };
        if attempt.is_cancelled() {
            return Ok(Outcome::Discarded);
        }
        attempt.mark_responded();

        let status = response.status;
        let headers = response.headers.clone();
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => return self.fail(attempt, e.into(), FailureSource::Task),
        };
        if attempt.is_cancelled() {
            return Ok(Outcome::Discarded);
        }
        attempt.mark_read();
        if !attempt.settle() {
            return Ok(Outcome::Discarded);
        }

        self.listeners
            .notify_response(&attempt.lifecycle, status, &headers, &body);
        attempt.mark_completed();
        Ok(Outcome::Completed)
    }

    /// Route a failure: transient ones go through the retry strategy, others are fatal.
    pub(crate) fn fail(
        self: &Arc<Self>,
        attempt: &Arc<Attempt>,
        error: DispatchError,
        source: FailureSource,
    ) -> Result<Outcome> {
        if attempt.is_cancelled() && source == FailureSource::Task {
            return Ok(Outcome::Discarded);
        }
        if !error.is_transient() {
            if !attempt.settle() {
                return Ok(Outcome::Discarded);
            }
            attempt.mark_failed();
            self.end(attempt, source);
            return Err(error);
        }
        debug!("{} failed on {}: {}", attempt.id, attempt.lifecycle, error);
        self.retry(attempt, error, source)
    }

    fn retry(
        self: &Arc<Self>,
        attempt: &Arc<Attempt>,
        error: DispatchError,
        source: FailureSource,
    ) -> Result<Outcome> {
        if !attempt.settle() {
            return Ok(Outcome::Discarded);
        }
        attempt.mark_failed();
        let lifecycle = &attempt.lifecycle;

        if lifecycle.random_proxied {
            if let (Some(proxy), Some(tag)) = (&lifecycle.proxy, &lifecycle.tag) {
                self.pool.record_failure(proxy, tag);
            }
        }

        let successor = if lifecycle.retry_on_connection_failure && !self.is_closed() {
            let launched = lifecycle.successor(&error).and_then(|next| self.launch(next));
            match launched {
                Ok(handle) => Some(handle.id()),
                Err(e) => {
                    self.end(attempt, source);
                    return Err(e);
                }
            }
        } else {
            None
        };
        self.end(attempt, source);

        let consumed = self.listeners.notify_error(lifecycle, &error);
        match successor {
            Some(successor) => Ok(Outcome::Retried { successor }),
            None if !consumed && !lifecycle.ignore_errors => Err(error),
            None => Ok(Outcome::Abandoned),
        }
    }

    /// Take a failed attempt out of the live registry.
    fn end(&self, attempt: &Attempt, source: FailureSource) {
        match source {
            FailureSource::Task => self.workers.retire(attempt.id),
            FailureSource::Watchdog => self.workers.interrupt(attempt.id),
        }
    }

    pub(crate) fn report_fatal(&self, attempt: &Attempt, err: &DispatchError) {
        error!("{} on {} failed fatally: {}", attempt.id, attempt.lifecycle, err);
        // nobody listening is fine, the error is logged
        let _ = self.fatal.send(err.clone());
    }
}
