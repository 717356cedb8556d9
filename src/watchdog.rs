//! Timeout watchdog: forces failure on attempts stuck waiting for headers or body.

use crate::config::WATCHDOG_POLL_INTERVAL;
use crate::dispatcher::{FailureSource, Inner};
use crate::error::DispatchError;
use crate::lifecycle::{Attempt, Progress};

use log::{debug, warn};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};

/// Which budget an attempt ran past.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stall {
    /// Requested, no response headers yet.
    Response,
    /// Headers received, body not read yet.
    Read,
}

impl Stall {
    fn into_error(self, budget: Duration) -> DispatchError {
        let millis = budget.as_millis() as u64;
        match self {
            Stall::Response => DispatchError::ResponseTimeExceeded { millis },
            Stall::Read => DispatchError::ReadTimeExceeded { millis },
        }
    }
}

/// Whether `progress` has run past `budget` at `now`.
pub(crate) fn overdue(progress: &Progress, now: Instant, budget: Duration) -> Option<Stall> {
    match (progress.requested_at, progress.responded_at, progress.read_at) {
        (Some(requested), None, _) if now.saturating_duration_since(requested) > budget => {
            Some(Stall::Response)
        }
        (_, Some(responded), None) if now.saturating_duration_since(responded) > budget => {
            Some(Stall::Read)
        }
        _ => None,
    }
}

/// Poll the live attempts until shutdown or until the dispatcher is dropped.
pub(crate) async fn run(dispatcher: Weak<Inner>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = time::interval(WATCHDOG_POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!("Watchdog started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }
        let Some(inner) = dispatcher.upgrade() else {
            break;
        };
        sweep(&inner, Instant::now());
    }

    debug!("Watchdog stopped");
}

/// Fail every attempt over budget at `now`.
pub(crate) fn sweep(inner: &Arc<Inner>, now: Instant) {
    let budget = inner.config.request_timeout;
    let stalled: Vec<(Arc<Attempt>, Stall)> = inner.workers.scan(|attempt| {
        overdue(&attempt.progress(), now, budget).map(|stall| (Arc::clone(attempt), stall))
    });

    for (attempt, stall) in stalled {
        let error = stall.into_error(budget);
        warn!("{} on {}: {}", attempt.id, attempt.lifecycle, error);
        if let Err(e) = inner.fail(&attempt, error, FailureSource::Watchdog) {
            inner.report_fatal(&attempt, &e);
        }
    }
}
