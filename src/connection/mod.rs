//! Connection lifecycle of the external stage control surface.
//!
//! The [`ConnectionManager`] owns the link to the hardware backend and decides
//! which backend (hardware or simulator) the motion controller should use.
//! Connection problems never escape as errors: they are logged, turned into a
//! state transition, and the simulator takes over.
//!
//! # State Machine
//!
//! ```text
//! ┌──────────────┐ connect  ┌────────────┐  ok   ┌───────────┐
//! │ Disconnected │─────────▶│ Connecting │──────▶│ Connected │
//! └──────────────┘          └─────┬──────┘       └─────┬─────┘
//!        ▲                        │ fail               │ health probe fails
//!        │                        ▼                    ▼
//!        │                  ┌────────────┐  retry ┌────────┐
//!        │                  │ Simulation │◀───────│ Failed │──▶ Connecting
//!        │                  └────────────┘ exhaust└────────┘
//!        └──────────── disconnect() from any state
//! ```

mod retry;

pub use retry::{Backoff, RetryPolicy};

use parking_lot::RwLock;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::config::{HealthConfig, StageConfig};
use crate::error::{StageError, StageResult};
use crate::events::{EventBus, StageEvent};
use crate::scheduler::PeriodicTask;

/// Link state of the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No connection attempted yet, or explicitly disconnected
    Disconnected,
    /// A connection attempt is in flight
    Connecting,
    /// Hardware backend is live
    Connected,
    /// Hardware unreachable; the simulator is active
    Simulation,
    /// Last attempt or health probe failed; a retry may follow
    Failed,
}

impl ConnectionState {
    /// Whether the state machine permits `self -> next`.
    ///
    /// Transitions only move forward, except the retry loop
    /// `Failed -> Connecting`, reconnecting out of `Simulation`, and
    /// `disconnect()`, which is allowed from anywhere.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        if self == next || next == Disconnected {
            return true;
        }
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connecting, Simulation)
                | (Connected, Failed)
                | (Failed, Connecting)
                | (Failed, Simulation)
                | (Simulation, Connecting)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Simulation => "simulation",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Final result of a retry cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOutcome {
    /// Whether the hardware ended up connected
    pub success: bool,
    /// Connection attempts made
    pub attempts: u32,
    /// Human-readable summary
    pub message: String,
}

/// Handle to a background retry cycle started by
/// [`ConnectionManager::connect_with_retry`].
///
/// Dropping the handle does not stop the cycle.
#[derive(Debug)]
pub struct RetryTask {
    outcome: oneshot::Receiver<RetryOutcome>,
    abort: AbortHandle,
}

impl RetryTask {
    /// Wait for the cycle to finish.
    ///
    /// A cancelled cycle reports `success = false`.
    pub async fn wait(self) -> RetryOutcome {
        self.outcome.await.unwrap_or_else(|_| RetryOutcome {
            success: false,
            attempts: 0,
            message: "connection retry cancelled".to_string(),
        })
    }

    /// Stop the cycle at its next suspension point.
    ///
    /// A cycle stopped mid-way leaves the manager in `Simulation`.
    pub fn cancel(&self) {
        self.abort.abort();
    }

    /// Whether the cycle has ended.
    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

/// Snapshot returned by [`ConnectionManager::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    /// Current state
    pub state: ConnectionState,
    /// Reason for the last transition
    pub message: String,
    /// Failed attempts in the current retry cycle
    pub failed_attempts: u32,
    /// Whether a retry cycle is in flight
    pub retrying: bool,
}

struct Shared {
    status: RwLock<(ConnectionState, String)>,
    hardware: Arc<dyn Backend>,
    simulator: Arc<dyn Backend>,
    policy: RetryPolicy,
    health: HealthConfig,
    events: EventBus,
    failed_attempts: AtomicU32,
    /// Serialises connection attempts
    connect_gate: Mutex<()>,
    retry_task: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        self.status.read().0
    }

    /// Apply a transition, publish it, and log it.
    fn transition(&self, next: ConnectionState, message: impl Into<String>) -> bool {
        self.transition_if(|_| true, next, message)
    }

    fn transition_if(
        &self,
        expected: impl Fn(ConnectionState) -> bool,
        next: ConnectionState,
        message: impl Into<String>,
    ) -> bool {
        let message = message.into();
        {
            let mut status = self.status.write();
            let current = status.0;
            if !expected(current) {
                return false;
            }
            if !current.can_transition_to(next) {
                warn!(from = %current, to = %next, "ignoring invalid connection transition");
                return false;
            }
            *status = (next, message.clone());
            info!(from = %current, to = %next, backend = self.hardware.name(), "{message}");
            // Published under the lock so subscribers see transitions in order.
            self.events.publish(StageEvent::ConnectionStateChanged {
                state: next,
                message,
            });
        }
        true
    }

    /// One attempt against the hardware backend.
    async fn attempt(&self) -> StageResult<()> {
        self.transition(
            ConnectionState::Connecting,
            format!("Connecting to {}", self.hardware.name()),
        );
        match self.hardware.connect().await {
            Ok(()) => {
                self.failed_attempts.store(0, Ordering::SeqCst);
                self.transition(
                    ConnectionState::Connected,
                    format!("Connected to {}", self.hardware.name()),
                );
                Ok(())
            }
            Err(e) => {
                warn!(backend = self.hardware.name(), error = %format!("{e:#}"), "connection attempt failed");
                Err(StageError::Connection(format!("{e:#}")))
            }
        }
    }

    async fn connect(&self) -> (ConnectionState, String) {
        let _gate = self.connect_gate.lock().await;
        if self.state() == ConnectionState::Connected {
            return self.status.read().clone();
        }
        if let Err(e) = self.attempt().await {
            self.failed_attempts.fetch_add(1, Ordering::SeqCst);
            self.transition(
                ConnectionState::Simulation,
                format!("Hardware unavailable, running in simulation mode ({e})"),
            );
        }
        self.status.read().clone()
    }

    async fn run_retry(&self, policy: RetryPolicy) -> RetryOutcome {
        let mut backoff = policy.backoff();
        loop {
            let result = {
                let _gate = self.connect_gate.lock().await;
                if self.state() == ConnectionState::Connected {
                    Ok(())
                } else {
                    self.attempt().await
                }
            };

            match result {
                Ok(()) => {
                    let attempts = backoff.attempt() + 1;
                    backoff.reset();
                    return RetryOutcome {
                        success: true,
                        attempts,
                        message: format!(
                            "Connected to {} after {attempts} attempt(s)",
                            self.hardware.name()
                        ),
                    };
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    self.failed_attempts.store(backoff.attempt(), Ordering::SeqCst);

                    if !backoff.can_retry() {
                        let message = format!(
                            "Hardware unavailable after {} attempt(s), running in simulation mode ({e})",
                            backoff.attempt()
                        );
                        self.transition(ConnectionState::Simulation, message.clone());
                        return RetryOutcome {
                            success: false,
                            attempts: backoff.attempt(),
                            message,
                        };
                    }

                    self.transition(
                        ConnectionState::Failed,
                        format!(
                            "Attempt {} of {} failed ({e}); retrying in {}ms",
                            backoff.attempt(),
                            policy.max_attempts,
                            delay.as_millis()
                        ),
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    async fn spawn_retry<F>(
        self: &Arc<Self>,
        policy: RetryPolicy,
        on_complete: F,
    ) -> StageResult<RetryTask>
    where
        F: FnOnce(&RetryOutcome) + Send + 'static,
    {
        policy.validate()?;
        let runtime = Handle::try_current()
            .map_err(|e| StageError::Resource(format!("connection retry: no async runtime ({e})")))?;

        let mut slot = self.retry_task.lock().await;
        if let Some(previous) = slot.take() {
            previous.abort();
            let _ = previous.await;
            debug!("previous connection retry cycle cancelled");
        }

        let (tx, rx) = oneshot::channel();
        let shared = Arc::clone(self);
        let mut guard = RetryGuard {
            shared: Arc::clone(self),
            armed: true,
        };
        let handle = runtime.spawn(async move {
            let outcome = shared.run_retry(policy).await;
            guard.armed = false;
            on_complete(&outcome);
            let _ = tx.send(outcome);
        });
        let abort = handle.abort_handle();
        *slot = Some(handle);

        Ok(RetryTask { outcome: rx, abort })
    }

    async fn is_retrying(&self) -> bool {
        self.retry_task
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    async fn probe(&self, backend: &Arc<dyn Backend>) -> StageResult<()> {
        match timeout(self.health.probe_timeout, backend.probe()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(StageError::Connection(format!("{e:#}"))),
            Err(_) => Err(StageError::Connection(format!(
                "probe timed out after {}ms",
                self.health.probe_timeout.as_millis()
            ))),
        }
    }

    async fn health_check(self: &Arc<Self>) -> bool {
        match self.state() {
            ConnectionState::Connected => {
                let Err(e) = self.probe(&self.hardware).await else {
                    return true;
                };
                let lost = self.transition_if(
                    |state| state == ConnectionState::Connected,
                    ConnectionState::Failed,
                    format!("Health check failed: {e}"),
                );
                if lost && !self.is_retrying().await {
                    if let Err(err) = self.spawn_retry(self.policy, |_| {}).await {
                        warn!(error = %err, "could not start reconnection cycle");
                    }
                }
                false
            }
            ConnectionState::Simulation => match self.probe(&self.simulator).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "simulator probe failed");
                    false
                }
            },
            ConnectionState::Disconnected
            | ConnectionState::Connecting
            | ConnectionState::Failed => false,
        }
    }
}

/// Settles an aborted retry cycle into `Simulation`.
///
/// Moved into the retry task, so it also fires when the task is aborted
/// before its first poll.
struct RetryGuard {
    shared: Arc<Shared>,
    armed: bool,
}

impl Drop for RetryGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let settled = self.shared.transition_if(
            |state| matches!(state, ConnectionState::Failed | ConnectionState::Connecting),
            ConnectionState::Simulation,
            "Connection retry cancelled, running in simulation mode",
        );
        if settled {
            debug!("aborted retry cycle settled in simulation");
        }
    }
}

/// Owns the link to the stage control surface.
///
/// # Example
///
/// ```rust,ignore
/// let manager = ConnectionManager::new(hardware, simulator, policy, health, events)?;
/// let (state, message) = manager.connect().await;
/// let backend = manager.active_backend();
/// ```
pub struct ConnectionManager {
    shared: Arc<Shared>,
    health_task: Mutex<Option<PeriodicTask>>,
}

impl ConnectionManager {
    /// Create a manager in the `Disconnected` state.
    ///
    /// # Errors
    /// `StageError::Config` if the retry policy or health settings are invalid.
    pub fn new(
        hardware: Arc<dyn Backend>,
        simulator: Arc<dyn Backend>,
        policy: RetryPolicy,
        health: HealthConfig,
        events: EventBus,
    ) -> StageResult<Self> {
        policy
            .validate()
            .map_err(|e| StageError::Config(e.to_string()))?;
        if health.interval.is_zero() || health.probe_timeout.is_zero() {
            return Err(StageError::Config(
                "health.interval and health.probe_timeout must be non-zero".to_string(),
            ));
        }

        Ok(Self {
            shared: Arc::new(Shared {
                status: RwLock::new((
                    ConnectionState::Disconnected,
                    "Not connected".to_string(),
                )),
                hardware,
                simulator,
                policy,
                health,
                events,
                failed_attempts: AtomicU32::new(0),
                connect_gate: Mutex::new(()),
                retry_task: Mutex::new(None),
            }),
            health_task: Mutex::new(None),
        })
    }

    /// Create a manager using the retry and health sections of `config`.
    pub fn from_config(
        config: &StageConfig,
        hardware: Arc<dyn Backend>,
        simulator: Arc<dyn Backend>,
        events: EventBus,
    ) -> StageResult<Self> {
        Self::new(hardware, simulator, config.retry, config.health, events)
    }

    /// Try the hardware once; on failure settle into simulation mode.
    ///
    /// Never fails: the returned state and message describe the outcome.
    pub async fn connect(&self) -> (ConnectionState, String) {
        self.shared.connect().await
    }

    /// Retry the hardware with exponential backoff in the background.
    ///
    /// Returns immediately. After `policy.max_attempts` failures the manager
    /// settles into `Simulation`. `on_complete` runs on the background task
    /// once the cycle ends. Starting a new cycle cancels the previous one.
    ///
    /// # Errors
    /// `Validation` for an invalid policy, `Resource` outside a runtime.
    pub async fn connect_with_retry<F>(
        &self,
        policy: RetryPolicy,
        on_complete: F,
    ) -> StageResult<RetryTask>
    where
        F: FnOnce(&RetryOutcome) + Send + 'static,
    {
        self.shared.spawn_retry(policy, on_complete).await
    }

    /// Probe the active link once.
    ///
    /// A failed probe while `Connected` moves to `Failed` and starts a
    /// reconnection cycle with the configured policy.
    pub async fn health_check(&self) -> bool {
        self.shared.health_check().await
    }

    /// Run [`health_check`](Self::health_check) every `health.interval`.
    ///
    /// Calling it while the monitor is already running is a no-op.
    pub async fn start_health_monitor(&self) -> StageResult<()> {
        let mut slot = self.health_task.lock().await;
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        let task = PeriodicTask::spawn("health-monitor", self.shared.health.interval, move || {
            let shared = Arc::clone(&shared);
            Box::pin(async move {
                let healthy = shared.health_check().await;
                debug!(healthy, "health check");
                ControlFlow::Continue(())
            })
        })?;
        *slot = Some(task);
        Ok(())
    }

    /// Stop the periodic health check; returns once the timer is released.
    pub async fn stop_health_monitor(&self) {
        let task = self.health_task.lock().await.take();
        if let Some(task) = task {
            task.cancel().await;
        }
    }

    /// Cancel all background work and return to `Disconnected`.
    pub async fn disconnect(&self) {
        self.stop_health_monitor().await;
        let retry = self.shared.retry_task.lock().await.take();
        if let Some(handle) = retry {
            handle.abort();
            let _ = handle.await;
        }
        self.shared.failed_attempts.store(0, Ordering::SeqCst);
        self.shared
            .transition(ConnectionState::Disconnected, "Disconnected");
    }

    /// The backend valid for the current state.
    ///
    /// Hardware while `Connected`, the simulator otherwise. Fetch it per
    /// operation; it can change at any health-check boundary.
    pub fn active_backend(&self) -> Arc<dyn Backend> {
        if self.shared.state() == ConnectionState::Connected {
            Arc::clone(&self.shared.hardware)
        } else {
            Arc::clone(&self.shared.simulator)
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Reason given for the last transition.
    pub fn status_message(&self) -> String {
        self.shared.status.read().1.clone()
    }

    /// Full status snapshot.
    pub async fn status(&self) -> ConnectionStatus {
        let (state, message) = self.shared.status.read().clone();
        ConnectionStatus {
            state,
            message,
            failed_attempts: self.shared.failed_attempts.load(Ordering::SeqCst),
            retrying: self.shared.is_retrying().await,
        }
    }

    /// Policy used for reconnection after a failed health check.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.shared.policy
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.shared.retry_task.try_lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}
