//! Task execution: spawns attempts, tracks the live ones, interrupts them.

use crate::error::{DispatchError, Result};
use crate::lifecycle::Attempt;

use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};
use tokio::task::{AbortHandle, JoinHandle};

/// Identity of one submitted attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// How an attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The response was read and fanned out to listeners.
    Completed,
    /// The attempt failed and a successor took over.
    Retried { successor: TaskId },
    /// The attempt failed, was reported, and nothing retries it.
    Abandoned,
    /// The attempt was cancelled and dropped silently.
    Discarded,
}

/// Handle on a submitted attempt. Dropping it does not cancel the attempt.
#[derive(Debug)]
pub struct TaskHandle {
    id: TaskId,
    join: JoinHandle<Result<Outcome>>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Wait for the attempt to end.
    pub async fn outcome(self) -> Result<Outcome> {
        match self.join.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(Outcome::Discarded),
            Err(e) => std::panic::resume_unwind(e.into_panic()),
        }
    }
}

struct LiveTask {
    attempt: Arc<Attempt>,
    abort: AbortHandle,
}

/// Pool of in-flight attempts running on the tokio runtime.
///
/// The registry lock is taken before any attempt's progress lock, never after.
pub struct WorkerPool {
    next_id: AtomicU64,
    live: Mutex<HashMap<TaskId, LiveTask>>,
    permits: Arc<Semaphore>,
    idle: Notify,
}

impl WorkerPool {
    /// `max_in_flight` bounds attempts running their transport call at once.
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            live: Mutex::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(max_in_flight.clamp(1, Semaphore::MAX_PERMITS))),
            idle: Notify::new(),
        }
    }

    pub(crate) fn next_id(&self) -> TaskId {
        TaskId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Spawn `work` for `attempt` and register it as live until it ends.
    pub(crate) fn submit<F>(self: &Arc<Self>, attempt: Arc<Attempt>, work: F) -> TaskHandle
    where
        F: Future<Output = Result<Outcome>> + Send + 'static,
    {
        let id = attempt.id;
        let pool = Arc::clone(self);
        let permits = Arc::clone(&self.permits);
        let task = async move {
            let result = match permits.acquire_owned().await {
                Ok(_permit) => work.await,
                Err(_) => Err(DispatchError::ShutDown),
            };
            pool.finish(id);
            result
        };

        // Registered under the lock so the task cannot finish before it is live.
        let mut live = self.live.lock();
        let join = tokio::spawn(task);
        live.insert(
            id,
            LiveTask {
                attempt,
                abort: join.abort_handle(),
            },
        );
        TaskHandle { id, join }
    }

    /// Run `f` over every live attempt while holding the registry lock.
    pub(crate) fn scan<T>(&self, mut f: impl FnMut(&Arc<Attempt>) -> Option<T>) -> Vec<T> {
        let live = self.live.lock();
        live.values().filter_map(|task| f(&task.attempt)).collect()
    }

    /// Drop an attempt from the registry and mark it cancelled.
    pub(crate) fn retire(&self, id: TaskId) {
        if let Some(task) = self.remove(id) {
            task.attempt.cancel();
        }
    }

    /// Retire an attempt and abort its task at its next suspension point.
    pub(crate) fn interrupt(&self, id: TaskId) {
        if let Some(task) = self.remove(id) {
            task.attempt.cancel();
            task.abort.abort();
            debug!("Interrupted {}", id);
        }
    }

    /// Interrupt every live attempt.
    pub(crate) fn interrupt_all(&self) {
        let drained: Vec<LiveTask> = {
            let mut live = self.live.lock();
            live.drain().map(|(_, task)| task).collect()
        };
        for task in drained {
            task.attempt.cancel();
            task.abort.abort();
        }
        self.idle.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.live.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve once no attempt is live.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    fn finish(&self, id: TaskId) {
        self.remove(id);
    }

    fn remove(&self, id: TaskId) -> Option<LiveTask> {
        let mut live = self.live.lock();
        let task = live.remove(&id);
        if live.is_empty() {
            self.idle.notify_waiters();
        }
        task
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::RequestLifecycle;
    use std::time::Duration;
    use tokio_test::assert_ok;

    fn attempt(pool: &WorkerPool) -> Arc<Attempt> {
        Arc::new(Attempt::new(
            pool.next_id(),
            RequestLifecycle::get("req", "http://example.com/"),
        ))
    }

    #[tokio::test]
    async fn finished_tasks_leave_the_registry() {
        let pool = Arc::new(WorkerPool::new(4));
        let handle = pool.submit(attempt(&pool), async { Ok(Outcome::Completed) });
        assert_eq!(assert_ok!(handle.outcome().await), Outcome::Completed);
        pool.wait_idle().await;
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn interrupt_aborts_and_cancels() {
        let pool = Arc::new(WorkerPool::new(4));
        let stuck = attempt(&pool);
        let handle = pool.submit(Arc::clone(&stuck), futures::future::pending());
        assert_eq!(pool.len(), 1);

        let ids = pool.scan(|a| Some(a.id));
        assert_eq!(ids, vec![handle.id()]);

        pool.interrupt(handle.id());
        assert!(stuck.is_cancelled());
        assert!(pool.is_empty());
        assert_eq!(handle.outcome().await.unwrap(), Outcome::Discarded);
    }

    #[tokio::test]
    async fn permits_bound_concurrency() {
        let pool = Arc::new(WorkerPool::new(1));
        let first = pool.submit(attempt(&pool), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(Outcome::Completed)
        });
        let started = Arc::new(AtomicU64::new(0));
        let observed = Arc::clone(&started);
        let second = pool.submit(attempt(&pool), async move {
            observed.store(1, Ordering::SeqCst);
            Ok(Outcome::Completed)
        });

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(started.load(Ordering::SeqCst), 0);
        first.outcome().await.unwrap();
        second.outcome().await.unwrap();
        assert_eq!(started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn interrupt_all_wakes_idle_waiters() {
        let pool = Arc::new(WorkerPool::new(4));
        for _ in 0..3 {
            pool.submit(attempt(&pool), futures::future::pending());
        }
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.wait_idle().await })
        };
        tokio::task::yield_now().await;
        pool.interrupt_all();
        waiter.await.unwrap();
        assert!(pool.is_empty());
    }
}
