//! Service lifecycle: cooperative start/run/stop ordering for long-lived units.
//!
//! A unit implements [`Service`] (startup hook, body, shutdown hook) and is driven by a
//! [`Lifecycle`], which owns the state machine:
//!
//! ```text
//! Created --start--> Started --run--> Running --stop--> Stopping --> Stopped
//!                                        |                             ^
//!                                        +--- body ends (linear) ------+
//! ```
//!
//! `stop()` is idempotent and a no-op before `start()`. A unit may be started again once it
//! has reached `Stopped`.

use crate::error::LifecycleError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Lifecycle state of a long-lived unit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Started,
    Running,
    Stopping,
    Stopped,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Created => write!(f, "created"),
            LifecycleState::Started => write!(f, "started"),
            LifecycleState::Running => write!(f, "running"),
            LifecycleState::Stopping => write!(f, "stopping"),
            LifecycleState::Stopped => write!(f, "stopped"),
        }
    }
}

/// One-shot "stop requested" signal handed to a service body.
#[derive(Debug, Clone)]
pub struct StopSignal {
    token: CancellationToken,
}

impl StopSignal {
    /// Whether a stop has already been requested.
    pub fn is_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolve once a stop has been requested.
    pub async fn requested(&self) {
        self.token.cancelled().await
    }

    /// The underlying token, for use in `tokio::select!`.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// A startable, runnable, stoppable unit.
///
/// `on_start` failing is fatal and propagates to the caller of [`Lifecycle::start`].
/// A failing `body` is logged and unwinds the unit to `Stopped`.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Name used to tag log events.
    fn name(&self) -> &str {
        "service"
    }

    /// Startup hook, run once per `start()`.
    async fn on_start(&self) -> Result<(), LifecycleError>;

    /// Main routine. The default waits until a stop is requested.
    async fn body(&self, stop: StopSignal) -> Result<(), LifecycleError> {
        stop.requested().await;
        Ok(())
    }

    /// Shutdown hook, run once per stop sequence after the body has exited.
    async fn on_stop(&self) -> Result<(), LifecycleError>;
}

/// Handle returned by [`Lifecycle::run`]; resolves when the unit reaches `Stopped`.
#[derive(Debug)]
pub struct RunHandle {
    state: watch::Receiver<LifecycleState>,
}

impl RunHandle {
    /// Wait for the unit to complete its run and stop sequence.
    pub async fn wait(mut self) -> LifecycleState {
        let result = self
            .state
            .wait_for(|state| *state == LifecycleState::Stopped)
            .await
            .map(|state| *state);
        result.unwrap_or(LifecycleState::Stopped)
    }
}

struct Shared<S> {
    service: Arc<S>,
    state: watch::Sender<LifecycleState>,
    finish_lock: tokio::sync::Mutex<()>,
}

impl<S: Service> Shared<S> {
    fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Atomically move `from -> to`; returns whether the transition happened.
    fn transition(&self, from: &[LifecycleState], to: LifecycleState) -> bool {
        self.state.send_if_modified(|state| {
            if from.contains(state) {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// Run the shutdown hook exactly once per start.
    async fn finish(&self) -> Result<(), LifecycleError> {
        let _guard = self.finish_lock.lock().await;
        if matches!(
            self.state(),
            LifecycleState::Created | LifecycleState::Stopped
        ) {
            return Ok(());
        }
        self.state.send_replace(LifecycleState::Stopping);
        let result = self.service.on_stop().await;
        self.state.send_replace(LifecycleState::Stopped);
        match &result {
            Ok(()) => info!(service = self.service.name(), "Service stopped"),
            Err(e) => error!(service = self.service.name(), error = %e, "Shutdown hook failed"),
        }
        result
    }

    async fn run_body(self: Arc<Self>, token: CancellationToken, linear: bool) {
        let name = self.service.name().to_string();
        debug!(service = %name, "Service body started");
        let signal = StopSignal {
            token: token.clone(),
        };
        let failed = match self.service.body(signal).await {
            Ok(()) => false,
            Err(e) => {
                error!(service = %name, error = %e, "Service body failed");
                true
            }
        };
        if linear || failed {
            token.cancel();
            // Errors are already logged inside `finish`.
            let _ = self.finish().await;
        } else {
            token.cancelled().await;
        }
        debug!(service = %name, "Service body exited");
    }
}

/// Drives a [`Service`] through its lifecycle.
pub struct Lifecycle<S: Service> {
    shared: Arc<Shared<S>>,
    linear: bool,
    stop_token: Mutex<CancellationToken>,
    run_task: Mutex<Option<JoinHandle<()>>>,
    transition_lock: tokio::sync::Mutex<()>,
}

impl<S: Service> std::fmt::Debug for Lifecycle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("service", &self.shared.service.name())
            .field("state", &self.state())
            .field("linear", &self.linear)
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<S: Service> Lifecycle<S> {
    /// Wrap a service that keeps running until `stop()` is called.
    pub fn new(service: S) -> Self {
        Self::build(Arc::new(service), false)
    }

    /// Wrap a service that stops automatically once its body completes.
    pub fn linear(service: S) -> Self {
        Self::build(Arc::new(service), true)
    }

    /// Wrap an already shared service.
    pub fn from_arc(service: Arc<S>, linear: bool) -> Self {
        Self::build(service, linear)
    }

    fn build(service: Arc<S>, linear: bool) -> Self {
        let (state, _) = watch::channel(LifecycleState::Created);
        Self {
            shared: Arc::new(Shared {
                service,
                state,
                finish_lock: tokio::sync::Mutex::new(()),
            }),
            linear,
            stop_token: Mutex::new(CancellationToken::new()),
            run_task: Mutex::new(None),
            transition_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// The wrapped service.
    pub fn service(&self) -> &Arc<S> {
        &self.shared.service
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.shared.state()
    }

    /// Whether the body stops the unit on completion.
    pub fn is_linear(&self) -> bool {
        self.linear
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.shared.state.subscribe()
    }

    fn invalid(&self, operation: &'static str) -> LifecycleError {
        LifecycleError::InvalidState {
            name: self.shared.service.name().to_string(),
            state: self.state().to_string(),
            operation,
        }
    }

    /// Run the startup hook and move `Created`/`Stopped` → `Started`.
    pub async fn start(&self) -> Result<(), LifecycleError> {
        let _guard = self.transition_lock.lock().await;
        if !matches!(
            self.state(),
            LifecycleState::Created | LifecycleState::Stopped
        ) {
            return Err(self.invalid("start"));
        }

        *lock(&self.stop_token) = CancellationToken::new();
        let name = self.shared.service.name().to_string();
        self.shared
            .service
            .on_start()
            .await
            .map_err(|e| LifecycleError::StartFailed {
                name: name.clone(),
                message: e.to_string(),
            })?;

        self.shared.state.send_replace(LifecycleState::Started);
        info!(service = %name, linear = self.linear, "Service started");
        Ok(())
    }

    /// Schedule the body and move `Started` → `Running`.
    ///
    /// Must be called from within a tokio runtime, at most once per start.
    pub fn run(&self) -> Result<RunHandle, LifecycleError> {
        if !self
            .shared
            .transition(&[LifecycleState::Started], LifecycleState::Running)
        {
            return Err(self.invalid("run"));
        }

        let token = lock(&self.stop_token).clone();
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(shared.run_body(token, self.linear));
        *lock(&self.run_task) = Some(handle);

        Ok(RunHandle {
            state: self.shared.state.subscribe(),
        })
    }

    /// Request the body to end, wait for it, then run the shutdown hook.
    ///
    /// Safe to call repeatedly; a no-op before `start()` or once stopped.
    pub async fn stop(&self) -> Result<(), LifecycleError> {
        let _guard = self.transition_lock.lock().await;
        if matches!(
            self.state(),
            LifecycleState::Created | LifecycleState::Stopped
        ) {
            debug!(service = self.shared.service.name(), state = %self.state(), "Stop ignored");
            return Ok(());
        }

        self.shared.transition(
            &[LifecycleState::Started, LifecycleState::Running],
            LifecycleState::Stopping,
        );
        lock(&self.stop_token).cancel();

        let task = lock(&self.run_task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(service = self.shared.service.name(), error = %e, "Service body task failed");
            }
        }

        self.shared.finish().await
    }
}
