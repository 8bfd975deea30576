//! Single-consumer async queue worker.
//!
//! An unbounded FIFO feeding one processing loop. Producers never block and
//! never see an error; the loop applies a [`QueueHandler`] to one item at a
//! time and keeps going when the handler fails or panics.

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[cfg(test)]
mod tests;

/// Processes items taken off an [`AsyncQueueWorker`].
#[async_trait]
pub trait QueueHandler<T>: Send + Sync {
    async fn handle(&self, item: T) -> Result<()>;
}

/// Queue depth warning settings.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Depth above which a warning is logged
    pub warn_threshold: usize,
    /// Minimum time between two depth warnings
    pub warn_cooldown: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            warn_threshold: 100,
            warn_cooldown: Duration::from_secs(60),
        }
    }
}

struct QueueShared {
    name: String,
    depth: AtomicUsize,
    config: WorkerConfig,
    last_warning: Mutex<Option<Instant>>,
    #[cfg(test)]
    warnings: AtomicUsize,
}

impl QueueShared {
    fn check_depth(&self, depth: usize) {
        if depth <= self.config.warn_threshold {
            return;
        }

        let now = Instant::now();
        let mut last = self
            .last_warning
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let due = match *last {
            Some(at) => now.duration_since(at) >= self.config.warn_cooldown,
            None => true,
        };
        if due {
            *last = Some(now);
            #[cfg(test)]
            self.warnings.fetch_add(1, Ordering::SeqCst);
            warn!(
                worker = %self.name,
                depth = depth,
                threshold = self.config.warn_threshold,
                "Queue depth above threshold, consumer may be stalled"
            );
        }
    }

    #[cfg(test)]
    fn warnings(&self) -> usize {
        self.warnings.load(Ordering::SeqCst)
    }
}

/// Producer side of a queue worker. Cheap to clone.
pub struct QueueSender<T> {
    tx: mpsc::UnboundedSender<T>,
    shared: Arc<QueueShared>,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> QueueSender<T> {
    /// Enqueues an item. Never blocks; items sent after the worker stopped are dropped.
    pub fn accept(&self, item: T) {
        let depth = self.shared.depth.fetch_add(1, Ordering::SeqCst) + 1;
        if self.tx.send(item).is_err() {
            self.shared.depth.fetch_sub(1, Ordering::SeqCst);
            debug!(worker = %self.shared.name, "Worker stopped, dropping item");
            return;
        }
        self.shared.check_depth(depth);
    }

    /// Number of items waiting to be processed.
    pub fn depth(&self) -> usize {
        self.shared.depth.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }
}

/// Unbounded FIFO plus a single processing loop.
///
/// The loop is not spawned by the worker itself; callers run [`run`](Self::run)
/// inside a [`ServiceLifecycle`](crate::lifecycle::ServiceLifecycle) so start and
/// stop go through the same cancellation path as every other service.
pub struct AsyncQueueWorker<T> {
    sender: QueueSender<T>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<T>>>,
}

impl<T: Send + 'static> AsyncQueueWorker<T> {
    pub fn new(name: impl Into<String>, config: WorkerConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(QueueShared {
            name: name.into(),
            depth: AtomicUsize::new(0),
            config,
            last_warning: Mutex::new(None),
            #[cfg(test)]
            warnings: AtomicUsize::new(0),
        });

        Self {
            sender: QueueSender { tx, shared },
            rx: Mutex::new(Some(rx)),
        }
    }

    pub fn accept(&self, item: T) {
        self.sender.accept(item);
    }

    pub fn sender(&self) -> QueueSender<T> {
        self.sender.clone()
    }

    pub fn depth(&self) -> usize {
        self.sender.depth()
    }

    /// Runs the processing loop until `cancel` fires or every sender is gone.
    ///
    /// Can only be called once per worker. Items still queued at cancellation
    /// are not drained.
    pub async fn run(
        &self,
        handler: Arc<dyn QueueHandler<T>>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(mut rx) = rx else {
            bail!("queue worker '{}' is already running", self.sender.name());
        };
        let shared = Arc::clone(&self.sender.shared);

        info!(worker = %shared.name, "Queue worker started");

        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(item) => item,
                    None => break,
                },
            };
            shared.depth.fetch_sub(1, Ordering::SeqCst);

            match AssertUnwindSafe(handler.handle(item)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(worker = %shared.name, error = %format!("{:#}", e), "Queue handler failed, continuing");
                }
                Err(_) => {
                    error!(worker = %shared.name, "Queue handler panicked, continuing");
                }
            }
        }

        info!(
            worker = %shared.name,
            remaining = shared.depth.load(Ordering::SeqCst),
            "Queue worker stopped"
        );
        Ok(())
    }

    #[cfg(test)]
    fn warnings(&self) -> usize {
        self.sender.shared.warnings()
    }
}
