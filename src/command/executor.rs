use super::{CommandResult, CommandTicket};
use crate::lifecycle::{LifecycleError, ServiceLifecycle, ServiceWatch};
use crate::worker::{AsyncQueueWorker, QueueHandler, QueueSender, WorkerConfig};
use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

/// One unit of device I/O waiting for its turn.
struct CommandJob {
    label: String,
    work: BoxFuture<'static, CommandResult>,
    reply: oneshot::Sender<CommandResult>,
}

struct JobRunner;

#[async_trait]
impl QueueHandler<CommandJob> for JobRunner {
    async fn handle(&self, job: CommandJob) -> Result<()> {
        let result = job.work.await;
        debug!(job = %job.label, result = ?result, "Command job finished");
        // Receiver gone means the caller stopped caring
        let _ = job.reply.send(result);
        Ok(())
    }
}

/// Runs command jobs one at a time so a family's devices never see
/// overlapping requests.
///
/// A job that panics is logged by the worker and its ticket resolves to
/// [`CommandResult::ConnectorError`]. Jobs submitted before [`start`](Self::start)
/// wait in the queue.
pub struct CommandExecutor {
    worker: Arc<AsyncQueueWorker<CommandJob>>,
    lifecycle: ServiceLifecycle,
}

impl CommandExecutor {
    pub fn new(name: impl Into<String>, config: WorkerConfig) -> Self {
        let name = name.into();
        Self {
            worker: Arc::new(AsyncQueueWorker::new(format!("{}-commands", name), config)),
            lifecycle: ServiceLifecycle::new(format!("{}-commands", name)),
        }
    }

    pub fn handle(&self) -> ExecutorHandle {
        ExecutorHandle {
            sender: self.worker.sender(),
        }
    }

    pub fn start(&self) -> Result<(), LifecycleError> {
        let worker = Arc::clone(&self.worker);
        self.lifecycle
            .start(move |cancel| async move { worker.run(Arc::new(JobRunner), cancel).await })
    }

    pub async fn stop(&self) {
        self.lifecycle.stop().await;
    }

    pub fn watch(&self) -> ServiceWatch {
        self.lifecycle.watch()
    }
}

/// Clonable submission side of a [`CommandExecutor`], held by connectors.
#[derive(Clone)]
pub struct ExecutorHandle {
    sender: QueueSender<CommandJob>,
}

impl ExecutorHandle {
    /// Queues `work` behind every job already submitted.
    pub fn submit<F>(&self, label: impl Into<String>, work: F) -> CommandTicket
    where
        F: Future<Output = CommandResult> + Send + 'static,
    {
        let (reply, ticket) = CommandTicket::pending();
        self.sender.accept(CommandJob {
            label: label.into(),
            work: Box::pin(work),
            reply,
        });
        ticket
    }

    /// Runs arbitrary device I/O (status reads, probes) in the same queue as
    /// commands and returns its output.
    ///
    /// Returns `None` if the job panicked or the executor dropped it.
    pub async fn run<T, F>(&self, label: impl Into<String>, work: F) -> Option<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let _ticket = self.submit(label, async move {
            let _ = tx.send(work.await);
            CommandResult::Success
        });
        rx.await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_jobs_never_overlap() {
        let executor = CommandExecutor::new("test", WorkerConfig::default());
        executor.start().unwrap();
        let handle = executor.handle();

        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));

        let tickets: Vec<CommandTicket> = (0..5)
            .map(|i| {
                let active = Arc::clone(&active);
                let max_active = Arc::clone(&max_active);
                handle.submit(format!("job-{}", i), async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    CommandResult::Success
                })
            })
            .collect();

        for ticket in tickets {
            assert_eq!(ticket.wait(Duration::from_secs(5)).await, CommandResult::Success);
        }
        assert_eq!(max_active.load(Ordering::SeqCst), 1);

        executor.stop().await;
    }

    #[tokio::test]
    async fn test_panicking_job_resolves_to_connector_error() {
        let executor = CommandExecutor::new("test", WorkerConfig::default());
        executor.start().unwrap();
        let handle = executor.handle();

        fn explode() -> CommandResult {
            panic!("device exploded")
        }

        let bad = handle.submit("bad", async { explode() });
        let good = handle.submit("good", async { CommandResult::DeviceError });

        assert_eq!(bad.wait(Duration::from_secs(5)).await, CommandResult::ConnectorError);
        assert_eq!(good.wait(Duration::from_secs(5)).await, CommandResult::DeviceError);

        executor.stop().await;
    }

    #[tokio::test]
    async fn test_run_shares_the_queue_with_commands() {
        let executor = CommandExecutor::new("test", WorkerConfig::default());
        executor.start().unwrap();
        let handle = executor.handle();

        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let io = |active: Arc<AtomicUsize>, max_active: Arc<AtomicUsize>| async move {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            active.fetch_sub(1, Ordering::SeqCst);
        };

        let command = {
            let work = io(Arc::clone(&active), Arc::clone(&max_active));
            handle.submit("command", async move {
                work.await;
                CommandResult::Success
            })
        };
        let read = {
            let work = io(Arc::clone(&active), Arc::clone(&max_active));
            handle.run("read", async move {
                work.await;
                42
            })
        };

        assert_eq!(read.await, Some(42));
        assert_eq!(command.wait(Duration::from_secs(5)).await, CommandResult::Success);
        assert_eq!(max_active.load(Ordering::SeqCst), 1);

        executor.stop().await;
    }

    #[tokio::test]
    async fn test_run_on_dropped_executor_returns_none() {
        let handle = CommandExecutor::new("gone", WorkerConfig::default()).handle();
        assert_eq!(handle.run("read", async { 1 }).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unstarted_executor_leaves_ticket_pending() {
        let executor = CommandExecutor::new("idle", WorkerConfig::default());
        let ticket = executor.handle().submit("queued", async { CommandResult::Success });
        assert_eq!(ticket.wait(Duration::from_secs(1)).await, CommandResult::Pending);
    }
}
