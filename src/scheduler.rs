//! Cancellable periodic tasks.
//!
//! A [`PeriodicTask`] owns one spawned tokio task that calls a tick closure
//! every `period`. It is the only timer primitive in the crate:
//!
//! - the first tick fires one full `period` after arming;
//! - a tick returning [`ControlFlow::Break`] ends the task from the inside;
//! - [`PeriodicTask::cancel`] aborts the task and waits for it to be gone;
//! - dropping the handle aborts the task, so it never outlives its owner.
//!
//! Ticks run one at a time. A tick that overruns delays the next one instead
//! of producing a burst of catch-up ticks.

use futures::future::BoxFuture;
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::error::{StageError, StageResult};

/// Handle to a spawned periodic task.
#[derive(Debug)]
pub struct PeriodicTask {
    name: &'static str,
    period: Duration,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    /// Arm a periodic task on the current tokio runtime.
    ///
    /// # Errors
    /// `StageError::Resource` if `period` is zero or no runtime is running.
    pub fn spawn<F>(name: &'static str, period: Duration, mut tick: F) -> StageResult<Self>
    where
        F: FnMut() -> BoxFuture<'static, ControlFlow<()>> + Send + 'static,
    {
        if period.is_zero() {
            return Err(StageError::Resource(format!(
                "{name}: timer period must be non-zero"
            )));
        }
        let runtime = Handle::try_current().map_err(|e| {
            StageError::Resource(format!("{name}: no async runtime available ({e})"))
        })?;

        let handle = runtime.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                trace!(task = name, "tick");
                if tick().await.is_break() {
                    debug!(task = name, "periodic task finished");
                    break;
                }
            }
        });

        debug!(task = name, period_ms = period.as_millis() as u64, "periodic task armed");
        Ok(Self {
            name,
            period,
            handle: Some(handle),
        })
    }

    /// Task name used in logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Tick period.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Whether the task has stopped on its own (or was cancelled).
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Abort the task and wait until it has fully terminated.
    ///
    /// When this returns, no further tick can run.
    pub async fn cancel(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            // Cancelled or finished; either way the task is gone.
            let _ = handle.await;
            debug!(task = self.name, "periodic task cancelled");
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn counting(counter: Arc<AtomicU32>, stop_after: u32) -> PeriodicTask {
        PeriodicTask::spawn("test", Duration::from_millis(5), move || {
            let counter = counter.clone();
            Box::pin(async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n >= stop_after {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
        })
        .unwrap()
    }

    #[tokio::test]
    async fn break_ends_the_task() {
        let counter = Arc::new(AtomicU32::new(0));
        let task = counting(counter.clone(), 3);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(task.is_finished());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancel_stops_ticks_before_returning() {
        let counter = Arc::new(AtomicU32::new(0));
        let task = counting(counter.clone(), u32::MAX);

        tokio::time::sleep(Duration::from_millis(30)).await;
        task.cancel().await;
        let after_cancel = counter.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(counter.load(Ordering::SeqCst), after_cancel);
    }

    #[tokio::test]
    async fn drop_aborts_the_task() {
        let counter = Arc::new(AtomicU32::new(0));
        drop(counting(counter.clone(), u32::MAX));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn zero_period_is_a_resource_error() {
        let err = PeriodicTask::spawn("bad", Duration::ZERO, || {
            Box::pin(async { ControlFlow::Break(()) })
        })
        .unwrap_err();
        assert!(matches!(err, StageError::Resource(_)));
    }

    #[test]
    fn spawning_outside_a_runtime_is_a_resource_error() {
        let err = PeriodicTask::spawn("no-runtime", Duration::from_millis(1), || {
            Box::pin(async { ControlFlow::Break(()) })
        })
        .unwrap_err();
        assert!(matches!(err, StageError::Resource(_)));
    }
}
