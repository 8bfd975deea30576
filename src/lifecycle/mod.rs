//! Start/stop wrapper around a long-running service loop.
//!
//! Each service owns one tokio task. Stopping cancels the service's
//! [`CancellationToken`]; loop bodies race their blocking waits against it and
//! return. Other components can block their own startup on a service reaching
//! [`ServiceState::Running`] through a [`ServiceWatch`].

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceState {
    New,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl ServiceState {
    fn is_terminal(self) -> bool {
        matches!(self, ServiceState::Stopped | ServiceState::Failed)
    }
}

/// Lifecycle errors callers may need to match on.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleError {
    AlreadyStarted(String),
    DependencyNotRunning { service: String, state: ServiceState },
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleError::AlreadyStarted(name) => {
                write!(f, "service '{}' has already been started", name)
            }
            LifecycleError::DependencyNotRunning { service, state } => {
                write!(f, "dependency '{}' is not running (state: {:?})", service, state)
            }
        }
    }
}

impl std::error::Error for LifecycleError {}

/// Owns the task, cancellation token and published state of one service.
pub struct ServiceLifecycle {
    name: String,
    state_tx: Arc<watch::Sender<ServiceState>>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceLifecycle {
    pub fn new(name: impl Into<String>) -> Self {
        let (state_tx, _) = watch::channel(ServiceState::New);
        Self {
            name: name.into(),
            state_tx: Arc::new(state_tx),
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ServiceState {
        *self.state_tx.borrow()
    }

    /// Returns a handle other components can use to wait for this service.
    pub fn watch(&self) -> ServiceWatch {
        ServiceWatch {
            name: self.name.clone(),
            rx: self.state_tx.subscribe(),
        }
    }

    /// Spawns the service loop.
    ///
    /// `body` receives the token that [`stop`](Self::stop) cancels. An `Err`
    /// returned by the loop moves the service to [`ServiceState::Failed`].
    pub fn start<F, Fut>(&self, body: F) -> Result<(), LifecycleError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if self.state() != ServiceState::New {
            return Err(LifecycleError::AlreadyStarted(self.name.clone()));
        }
        self.state_tx.send_replace(ServiceState::Starting);

        let fut = body(self.cancel.clone());
        let state_tx = Arc::clone(&self.state_tx);
        let name = self.name.clone();

        *handle = Some(tokio::spawn(async move {
            state_tx.send_replace(ServiceState::Running);
            info!(service = %name, "Service running");

            match fut.await {
                Ok(()) => {
                    state_tx.send_replace(ServiceState::Stopped);
                    info!(service = %name, "Service stopped");
                }
                Err(e) => {
                    state_tx.send_replace(ServiceState::Failed);
                    error!(service = %name, error = %format!("{:#}", e), "Service loop failed");
                }
            }
        }));

        Ok(())
    }

    /// Cancels the loop and waits for its task to finish.
    pub async fn stop(&self) {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(handle) = handle else {
            if self.state() == ServiceState::New {
                self.state_tx.send_replace(ServiceState::Stopped);
            }
            return;
        };

        if !self.state().is_terminal() {
            self.state_tx.send_replace(ServiceState::Stopping);
        }
        self.cancel.cancel();

        if let Err(e) = handle.await {
            warn!(service = %self.name, error = %e, "Service task did not exit cleanly");
            self.state_tx.send_replace(ServiceState::Failed);
        }
    }
}

impl Drop for ServiceLifecycle {
    fn drop(&mut self) {
        // Non-async: cancel and let the task wind down on its own
        self.cancel.cancel();
    }
}

/// Read-only view of a service's state, used for dependency waits.
#[derive(Clone)]
pub struct ServiceWatch {
    name: String,
    rx: watch::Receiver<ServiceState>,
}

impl ServiceWatch {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ServiceState {
        *self.rx.borrow()
    }

    /// Blocks until the service is running.
    ///
    /// Fails if the service stops or fails first, or if `timeout` elapses.
    pub async fn wait_until_running(&self, timeout: Duration) -> Result<(), LifecycleError> {
        let mut rx = self.rx.clone();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|state| *state == ServiceState::Running || state.is_terminal()),
        )
        .await;

        let state = match waited {
            Ok(Ok(state)) => *state,
            // Sender dropped: the owning lifecycle is gone
            Ok(Err(_)) => ServiceState::Stopped,
            Err(_) => self.state(),
        };

        if state == ServiceState::Running {
            Ok(())
        } else {
            Err(LifecycleError::DependencyNotRunning {
                service: self.name.clone(),
                state,
            })
        }
    }
}
