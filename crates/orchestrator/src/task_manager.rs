//! Generic bounded-concurrency executor.
//!
//! Work items are admitted under a semaphore ceiling, run on the tokio
//! runtime and tracked by id until their result is collected. The manager
//! knows nothing about tasks or workflows; the Queen translates results into
//! state transitions.

use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use std::any::Any;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::futures::Notified;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    /// The work ran past its deadline. Distinct from `Failed` so callers can
    /// route timeouts separately.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,

    /// The work itself returned an error.
    #[error("{0}")]
    Failed(String),

    #[error("panicked: {0}")]
    Panicked(String),

    #[error("id '{0}' is already active")]
    DuplicateId(String),

    #[error("unknown id '{0}'")]
    UnknownId(String),

    #[error("task manager is shut down")]
    Closed,
}

/// Outcome of one unit of work.
#[derive(Debug, Clone)]
pub struct TaskResult<T> {
    pub id: String,
    pub outcome: Result<T, TaskError>,
    pub duration: Duration,
}

impl<T> TaskResult<T> {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    fn cancelled(id: &str) -> Self {
        Self {
            id: id.to_string(),
            outcome: Err(TaskError::Cancelled),
            duration: Duration::ZERO,
        }
    }
}

struct Entry<T> {
    cancel: CancellationToken,
    result: watch::Receiver<Option<TaskResult<T>>>,
    abort: AbortHandle,
}

impl<T: Clone> Entry<T> {
    /// The cached result, or a cancellation if the work was aborted before
    /// it could report.
    fn finished(&self, id: &str) -> Option<TaskResult<T>> {
        let reported = self.result.borrow().clone();
        match reported {
            Some(result) => Some(result),
            None if self.abort.is_finished() => Some(TaskResult::cancelled(id)),
            None => None,
        }
    }

    fn is_active(&self) -> bool {
        self.result.borrow().is_none() && !self.abort.is_finished()
    }
}

pub struct TaskManager<T> {
    max_concurrent: usize,
    semaphore: Arc<Semaphore>,
    entries: Mutex<HashMap<String, Entry<T>>>,
    completed: Arc<Notify>,
    next_id: AtomicU64,
}

impl<T> TaskManager<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            max_concurrent,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            entries: Mutex::new(HashMap::new()),
            completed: Arc::new(Notify::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry<T>>> {
        match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Registers and starts a unit of work.
    ///
    /// Waits for a free slot when the ceiling is reached. `work` receives a
    /// token that is cancelled by [`cancel`](Self::cancel); the manager also
    /// stops polling the work once that happens.
    pub async fn submit<F, Fut, E>(
        &self,
        work: F,
        id: Option<String>,
        timeout: Option<Duration>,
    ) -> Result<String, TaskError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let id = id.unwrap_or_else(|| format!("work-{}", self.next_id.fetch_add(1, Ordering::Relaxed)));
        self.ensure_inactive(&id)?;

        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| TaskError::Closed)?;

        // Another submit may have taken the id while we waited for a slot.
        let mut entries = self.entries();
        if entries.get(&id).is_some_and(Entry::is_active) {
            return Err(TaskError::DuplicateId(id));
        }

        let cancel = CancellationToken::new();
        let (sender, receiver) = watch::channel(None);
        let token = cancel.clone();
        let completed = Arc::clone(&self.completed);
        let work_id = id.clone();

        let handle = tokio::spawn(async move {
            let started = Instant::now();
            let outcome = execute(work, token, timeout).await;
            drop(permit);

            debug!(id = %work_id, success = outcome.is_ok(), "Work finished");
            sender.send_replace(Some(TaskResult {
                id: work_id,
                outcome,
                duration: started.elapsed(),
            }));
            completed.notify_one();
        });

        entries.insert(
            id.clone(),
            Entry {
                cancel,
                result: receiver,
                abort: handle.abort_handle(),
            },
        );
        Ok(id)
    }

    fn ensure_inactive(&self, id: &str) -> Result<(), TaskError> {
        if self.entries().get(id).is_some_and(Entry::is_active) {
            return Err(TaskError::DuplicateId(id.to_string()));
        }
        Ok(())
    }

    /// Waits for the work to finish. Once finished, repeated calls return
    /// the same cached result until it is taken.
    pub async fn wait(&self, id: &str) -> Result<TaskResult<T>, TaskError> {
        let mut receiver = {
            let entries = self.entries();
            let entry = entries
                .get(id)
                .ok_or_else(|| TaskError::UnknownId(id.to_string()))?;
            entry.result.clone()
        };

        let reported = match receiver.wait_for(Option::is_some).await {
            Ok(result) => result.clone(),
            // Sender dropped without reporting: the work was aborted.
            Err(_) => None,
        };
        Ok(reported.unwrap_or_else(|| TaskResult::cancelled(id)))
    }

    /// Non-blocking peek at a result.
    pub fn try_result(&self, id: &str) -> Option<TaskResult<T>> {
        self.entries().get(id).and_then(|entry| entry.finished(id))
    }

    /// Requests cancellation. Returns false if the id is unknown or the work
    /// already finished.
    pub fn cancel(&self, id: &str) -> bool {
        match self.entries().get(id) {
            Some(entry) if entry.is_active() => {
                entry.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let entries = self.entries();
        let mut cancelled = 0;
        for entry in entries.values().filter(|entry| entry.is_active()) {
            entry.cancel.cancel();
            cancelled += 1;
        }
        cancelled
    }

    /// Removes and returns every finished result.
    pub fn take_finished(&self) -> Vec<TaskResult<T>> {
        let mut entries = self.entries();
        let done: Vec<(String, TaskResult<T>)> = entries
            .iter()
            .filter_map(|(id, entry)| entry.finished(id).map(|result| (id.clone(), result)))
            .collect();

        done.into_iter()
            .map(|(id, result)| {
                entries.remove(&id);
                result
            })
            .collect()
    }

    /// Removes a finished result. Active work is left alone.
    pub fn remove(&self, id: &str) -> Option<TaskResult<T>> {
        let mut entries = self.entries();
        let result = entries.get(id).and_then(|entry| entry.finished(id))?;
        entries.remove(id);
        Some(result)
    }

    pub fn active_count(&self) -> usize {
        self.entries().values().filter(|entry| entry.is_active()).count()
    }

    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Resolves after some work finishes. A completion that happens while
    /// nobody is waiting is remembered for the next call.
    pub fn completed(&self) -> Notified<'_> {
        self.completed.notified()
    }

    /// Stops admitting work, cancels everything in flight and waits up to
    /// `grace` for it to wind down. Work still running after that is
    /// aborted. Returns how many items had to be aborted.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        self.semaphore.close();

        let (ids, receivers): (Vec<String>, Vec<_>) = {
            let entries = self.entries();
            entries
                .iter()
                .filter(|(_, entry)| entry.is_active())
                .map(|(id, entry)| {
                    entry.cancel.cancel();
                    (id.clone(), entry.result.clone())
                })
                .unzip()
        };

        let drained = futures::future::join_all(receivers.into_iter().map(|mut receiver| async move {
            let _ = receiver.wait_for(Option::is_some).await;
        }));
        if tokio::time::timeout(grace, drained).await.is_ok() {
            return 0;
        }

        let entries = self.entries();
        let mut forced = 0;
        for id in ids {
            if let Some(entry) = entries.get(&id).filter(|entry| entry.is_active()) {
                entry.abort.abort();
                forced += 1;
            }
        }
        warn!(forced, "Aborted work still running after the shutdown grace period");
        forced
    }
}

async fn execute<T, F, Fut, E>(
    work: F,
    token: CancellationToken,
    timeout: Option<Duration>,
) -> Result<T, TaskError>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let guarded = AssertUnwindSafe(work(token.clone())).catch_unwind();

    let run = async move {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, guarded).await {
                Ok(caught) => settle(caught),
                Err(_) => Err(TaskError::Timeout(limit)),
            },
            None => settle(guarded.await),
        }
    };

    tokio::select! {
        biased;
        _ = token.cancelled() => Err(TaskError::Cancelled),
        outcome = run => outcome,
    }
}

fn settle<T, E: Display>(
    caught: Result<Result<T, E>, Box<dyn Any + Send>>,
) -> Result<T, TaskError> {
    match caught {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(TaskError::Failed(err.to_string())),
        Err(panic) => Err(TaskError::Panicked(panic_message(panic.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs `items` with at most `max_concurrent` in progress at once, without
/// registering them individually. Results come back in input order, each
/// with its index as id.
pub async fn gather_bounded<T, E, Fut>(items: Vec<Fut>, max_concurrent: usize) -> Vec<TaskResult<T>>
where
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));

    let mut pending: FuturesUnordered<_> = items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = semaphore.acquire().await;
                let started = Instant::now();
                let outcome = settle(AssertUnwindSafe(item).catch_unwind().await);
                (
                    index,
                    TaskResult {
                        id: index.to_string(),
                        outcome,
                        duration: started.elapsed(),
                    },
                )
            }
        })
        .collect();

    let mut results = Vec::with_capacity(pending.len());
    while let Some(result) = pending.next().await {
        results.push(result);
    }

    results.sort_by_key(|(index, _)| *index);
    results.into_iter().map(|(_, result)| result).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Tracks how many units run at once and the highest value seen.
    #[derive(Default)]
    struct InFlight {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl InFlight {
        fn enter(&self) {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
        }

        fn exit(&self) {
            self.current.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_submit_and_wait() {
        let manager: TaskManager<u32> = TaskManager::new(2);

        let id = manager
            .submit(|_| async { Ok::<_, String>(42) }, None, None)
            .await
            .unwrap();

        let first = manager.wait(&id).await.unwrap();
        assert_eq!(first.outcome, Ok(42));
        assert_eq!(first.id, id);

        let second = manager.wait(&id).await.unwrap();
        assert_eq!(second.outcome, Ok(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_ceiling() {
        let manager: TaskManager<()> = TaskManager::new(2);
        let in_flight = Arc::new(InFlight::default());

        let mut ids = Vec::new();
        for _ in 0..6 {
            let in_flight = Arc::clone(&in_flight);
            let id = manager
                .submit(
                    move |_| async move {
                        in_flight.enter();
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        in_flight.exit();
                        Ok::<_, String>(())
                    },
                    None,
                    None,
                )
                .await
                .unwrap();
            assert!(manager.active_count() <= 2);
            ids.push(id);
        }

        for id in &ids {
            assert!(manager.wait(id).await.unwrap().is_success());
        }
        assert_eq!(in_flight.peak.load(Ordering::SeqCst), 2);
        assert_eq!(manager.available_slots(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_id_rejected_while_active() {
        let manager: TaskManager<()> = TaskManager::new(4);
        let slow = |_| async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok::<_, String>(())
        };

        manager.submit(slow, Some("job".into()), None).await.unwrap();
        let err = manager.submit(slow, Some("job".into()), None).await.unwrap_err();
        assert_eq!(err, TaskError::DuplicateId("job".into()));

        manager.wait("job").await.unwrap();
        assert!(manager.submit(slow, Some("job".into()), None).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_reports_cancelled() {
        let manager: TaskManager<()> = TaskManager::new(1);
        let id = manager
            .submit(
                |_| async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok::<_, String>(())
                },
                None,
                None,
            )
            .await
            .unwrap();

        assert!(manager.cancel(&id));
        let result = manager.wait(&id).await.unwrap();
        assert_eq!(result.outcome, Err(TaskError::Cancelled));
        assert!(!manager.cancel(&id));
        assert_eq!(manager.available_slots(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_distinct_from_failure() {
        let manager: TaskManager<()> = TaskManager::new(2);

        let slow = manager
            .submit(
                |_| async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok::<_, String>(())
                },
                None,
                Some(Duration::from_secs(1)),
            )
            .await
            .unwrap();
        let failing = manager
            .submit(|_| async { Err::<(), _>("exit code 1") }, None, None)
            .await
            .unwrap();

        let slow = manager.wait(&slow).await.unwrap();
        assert_eq!(slow.outcome, Err(TaskError::Timeout(Duration::from_secs(1))));

        let failing = manager.wait(&failing).await.unwrap();
        assert_eq!(failing.outcome, Err(TaskError::Failed("exit code 1".into())));
    }

    #[tokio::test]
    async fn test_panic_is_captured() {
        let manager: TaskManager<u32> = TaskManager::new(1);
        let id = manager
            .submit(
                |_| async {
                    if true {
                        panic!("worker exploded");
                    }
                    Ok::<_, String>(1)
                },
                None,
                None,
            )
            .await
            .unwrap();

        let result = manager.wait(&id).await.unwrap();
        assert_eq!(
            result.outcome,
            Err(TaskError::Panicked("worker exploded".into()))
        );
        assert_eq!(manager.available_slots(), 1);
    }

    #[tokio::test]
    async fn test_unknown_id() {
        let manager: TaskManager<()> = TaskManager::new(1);
        assert_eq!(
            manager.wait("nope").await.unwrap_err(),
            TaskError::UnknownId("nope".into())
        );
        assert!(manager.try_result("nope").is_none());
        assert!(!manager.cancel("nope"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_finished_drains_results() {
        let manager: TaskManager<u32> = TaskManager::new(2);
        manager
            .submit(|_| async { Ok::<_, String>(1) }, Some("a".into()), None)
            .await
            .unwrap();
        manager
            .submit(
                |_| async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok::<_, String>(2)
                },
                Some("b".into()),
                None,
            )
            .await
            .unwrap();

        manager.completed().await;
        let finished = manager.take_finished();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].id, "a");
        assert_eq!(manager.active_count(), 1);
        assert!(manager.try_result("a").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_and_closes() {
        let manager: TaskManager<()> = TaskManager::new(2);
        let id = manager
            .submit(
                |_| async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok::<_, String>(())
                },
                None,
                None,
            )
            .await
            .unwrap();

        let forced = manager.shutdown(Duration::from_secs(5)).await;
        assert_eq!(forced, 0);
        assert_eq!(
            manager.wait(&id).await.unwrap().outcome,
            Err(TaskError::Cancelled)
        );

        let err = manager
            .submit(|_| async { Ok::<_, String>(()) }, None, None)
            .await
            .unwrap_err();
        assert_eq!(err, TaskError::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gather_bounded_keeps_input_order() {
        let in_flight = Arc::new(InFlight::default());

        let items: Vec<_> = (0..5u64)
            .map(|i| {
                let in_flight = Arc::clone(&in_flight);
                async move {
                    in_flight.enter();
                    // Later items finish first.
                    tokio::time::sleep(Duration::from_millis(100 - i * 10)).await;
                    in_flight.exit();
                    if i == 3 {
                        Err(format!("item {} failed", i))
                    } else {
                        Ok(i * 10)
                    }
                }
            })
            .collect();

        let results = gather_bounded(items, 2).await;

        let ids: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["0", "1", "2", "3", "4"]);
        assert_eq!(results[2].outcome, Ok(20));
        assert_eq!(
            results[3].outcome,
            Err(TaskError::Failed("item 3 failed".into()))
        );
        assert_eq!(in_flight.peak.load(Ordering::SeqCst), 2);
    }
}
