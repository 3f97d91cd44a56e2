//! Worker driver: owns one background task and its shutdown

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How a worker ended when it was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The task observed cancellation and exited in time.
    Joined,
    /// The task ignored cancellation and was aborted; its resources were dropped.
    Aborted,
    /// `stop` had already been called.
    AlreadyStopped,
}

/// Handle to a background task.
///
/// The task receives a [`CancellationToken`] and must check it between
/// iterations. Sockets and child processes are created inside the task and
/// never leave it, so aborting the task releases them.
pub struct Worker {
    name: &'static str,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn a named worker task.
    pub fn spawn<F, Fut>(name: &'static str, task: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(task(cancel.clone()));
        debug!(worker = name, "Worker spawned");
        Self { name, cancel, handle: Some(handle) }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Token that is cancelled when the worker is asked to stop.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether the task is still executing.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Stop the worker, waiting at most `timeout` for it to exit.
    ///
    /// Idempotent: later calls return [`StopOutcome::AlreadyStopped`].
    pub async fn stop(&mut self, timeout: Duration) -> StopOutcome {
        let Some(mut handle) = self.handle.take() else {
            return StopOutcome::AlreadyStopped;
        };
        self.cancel.cancel();

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => {
                debug!(worker = self.name, "Worker stopped");
                StopOutcome::Joined
            }
            Ok(Err(e)) => {
                warn!(worker = self.name, "Worker ended abnormally: {}", e);
                StopOutcome::Joined
            }
            Err(_) => {
                warn!(worker = self.name, ?timeout, "Worker did not exit in time, aborting");
                handle.abort();
                StopOutcome::Aborted
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Sleep for `duration` unless cancelled first. Returns false on cancellation.
pub(crate) async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn cooperative_task_joins() {
        let mut worker = Worker::spawn("cooperative", |cancel| async move {
            cancel.cancelled().await;
        });
        assert!(worker.is_running());
        assert_eq!(worker.stop(Duration::from_secs(1)).await, StopOutcome::Joined);
        assert_eq!(worker.stop(Duration::from_secs(1)).await, StopOutcome::AlreadyStopped);
        assert!(!worker.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn stubborn_task_is_aborted() {
        let mut worker = Worker::spawn("stubborn", |_cancel| async move {
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
        });
        assert_eq!(worker.stop(Duration::from_millis(100)).await, StopOutcome::Aborted);
    }

    #[tokio::test(start_paused = true)]
    async fn drop_cancels_task() {
        let worker = Worker::spawn("dropped", |cancel| async move {
            cancel.cancelled().await;
        });
        let token = worker.cancel_token();
        drop(worker);
        assert!(token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_or_cancel_reports_cancellation() {
        let token = CancellationToken::new();
        assert!(sleep_or_cancel(&token, Duration::from_millis(10)).await);
        token.cancel();
        assert!(!sleep_or_cancel(&token, Duration::from_secs(10)).await);
    }
}
