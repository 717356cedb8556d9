//! Listener registration and notification fan-out.
//!
//! Global listeners are kept per [`EventKind`] in registration order. Step
//! listeners are keyed by request id and kind, one slot each: registering
//! again replaces the previous one.

use crate::error::DispatchError;
use crate::lifecycle::{Metadata, RequestId, RequestLifecycle};
use crate::utils;

use http::{HeaderMap, StatusCode};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// The kinds of notification a listener can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    PlainResponse,
    DetailedResponse,
    RawResponse,
    Error,
}

/// Payload of one notification.
#[derive(Debug)]
pub enum Event<'a> {
    /// Body decoded as UTF-8 with whitespace runs collapsed and ends trimmed.
    PlainResponse { status: StatusCode, body: &'a str },
    /// Body decoded as UTF-8, untouched, with the response headers.
    DetailedResponse {
        status: StatusCode,
        body: &'a str,
        headers: &'a HeaderMap,
    },
    RawResponse { status: StatusCode, body: &'a [u8] },
    Error { error: &'a DispatchError },
}

impl Event<'_> {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::PlainResponse { .. } => EventKind::PlainResponse,
            Event::DetailedResponse { .. } => EventKind::DetailedResponse,
            Event::RawResponse { .. } => EventKind::RawResponse,
            Event::Error { .. } => EventKind::Error,
        }
    }
}

/// What a listener receives.
#[derive(Debug)]
pub struct Notification<'a> {
    pub request_id: &'a RequestId,
    pub lifecycle: &'a RequestLifecycle,
    pub metadata: &'a Metadata,
    pub event: Event<'a>,
}

pub type Listener = Arc<dyn Fn(&Notification<'_>) + Send + Sync>;

#[derive(Default)]
pub(crate) struct Listeners {
    global: RwLock<HashMap<EventKind, Vec<Listener>>>,
    step: RwLock<HashMap<(RequestId, EventKind), Listener>>,
}

impl Listeners {
    pub(crate) fn register(&self, kind: EventKind, listener: Listener) {
        self.global.write().entry(kind).or_default().push(listener);
    }

    pub(crate) fn register_step(&self, request_id: RequestId, kind: EventKind, listener: Listener) {
        self.step.write().insert((request_id, kind), listener);
    }

    pub(crate) fn remove_step(&self, request_id: &RequestId) {
        self.step.write().retain(|(id, _), _| id != request_id);
    }

    /// Fan a completed response out: plain, detailed, raw; global before step.
    pub(crate) fn notify_response(
        &self,
        lifecycle: &RequestLifecycle,
        status: StatusCode,
        headers: &HeaderMap,
        body: &[u8],
    ) {
        let decoded = String::from_utf8_lossy(body);

        if self.has(&lifecycle.request_id, EventKind::PlainResponse) {
            let trimmed = utils::collapse_whitespace(&decoded);
            self.fire(lifecycle, Event::PlainResponse { status, body: &trimmed });
        }
        self.fire(
            lifecycle,
            Event::DetailedResponse {
                status,
                body: &decoded,
                headers,
            },
        );
        self.fire(lifecycle, Event::RawResponse { status, body });
    }

    /// Report a failure. Returns whether any listener received it.
    pub(crate) fn notify_error(&self, lifecycle: &RequestLifecycle, error: &DispatchError) -> bool {
        self.fire(lifecycle, Event::Error { error }) > 0
    }

    fn has(&self, request_id: &RequestId, kind: EventKind) -> bool {
        self.global.read().get(&kind).is_some_and(|l| !l.is_empty())
            || self.step.read().contains_key(&(request_id.clone(), kind))
    }

    /// Invoke global listeners of the event's kind, then the step listener.
    ///
    /// Locks are released before any callback runs, so listeners may register
    /// further listeners.
    fn fire(&self, lifecycle: &RequestLifecycle, event: Event<'_>) -> usize {
        let kind = event.kind();
        let request_id = &lifecycle.request_id;
        let global: Vec<Listener> = self.global.read().get(&kind).cloned().unwrap_or_default();
        let step = self.step.read().get(&(request_id.clone(), kind)).cloned();

        let notification = Notification {
            request_id,
            lifecycle,
            metadata: &lifecycle.metadata,
            event,
        };
        let mut invoked = 0;
        for listener in global.iter().chain(step.iter()) {
            listener(&notification);
            invoked += 1;
        }
        invoked
    }
}
