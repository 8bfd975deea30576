use super::*;
use std::sync::Mutex as StdMutex;

struct Recorder {
    seen: StdMutex<Vec<u32>>,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            seen: StdMutex::new(Vec::new()),
        })
    }

    fn seen(&self) -> Vec<u32> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl QueueHandler<u32> for Recorder {
    async fn handle(&self, item: u32) -> Result<()> {
        self.seen.lock().unwrap().push(item);
        match item {
            13 => anyhow::bail!("unlucky item"),
            99 => panic!("handler blew up"),
            _ => Ok(()),
        }
    }
}

async fn wait_for_len(recorder: &Recorder, len: usize) {
    for _ in 0..200 {
        if recorder.seen().len() >= len {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("handler saw {:?}, expected {} items", recorder.seen(), len);
}

#[tokio::test]
async fn test_items_processed_in_fifo_order() {
    let worker = Arc::new(AsyncQueueWorker::new("fifo", WorkerConfig::default()));
    let recorder = Recorder::new();
    let cancel = CancellationToken::new();

    for i in 0..5 {
        worker.accept(i);
    }

    let task = {
        let worker = Arc::clone(&worker);
        let handler: Arc<dyn QueueHandler<u32>> = recorder.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { worker.run(handler, cancel).await })
    };

    wait_for_len(&recorder, 5).await;
    assert_eq!(recorder.seen(), vec![0, 1, 2, 3, 4]);
    assert_eq!(worker.depth(), 0);

    cancel.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_handler_errors_and_panics_do_not_stop_worker() {
    let worker = Arc::new(AsyncQueueWorker::new("resilient", WorkerConfig::default()));
    let recorder = Recorder::new();
    let cancel = CancellationToken::new();

    let task = {
        let worker = Arc::clone(&worker);
        let handler: Arc<dyn QueueHandler<u32>> = recorder.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { worker.run(handler, cancel).await })
    };

    let sender = worker.sender();
    sender.accept(1);
    sender.accept(13);
    sender.accept(99);
    sender.accept(2);

    wait_for_len(&recorder, 4).await;
    assert_eq!(recorder.seen(), vec![1, 13, 99, 2]);

    cancel.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_cancel_stops_loop_and_later_items_are_dropped() {
    let worker = Arc::new(AsyncQueueWorker::new("cancel", WorkerConfig::default()));
    let recorder = Recorder::new();
    let cancel = CancellationToken::new();

    let task = {
        let worker = Arc::clone(&worker);
        let handler: Arc<dyn QueueHandler<u32>> = recorder.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { worker.run(handler, cancel).await })
    };

    cancel.cancel();
    task.await.unwrap().unwrap();

    // Receiver is gone: accept must neither block nor count the item.
    worker.accept(7);
    assert_eq!(worker.depth(), 0);
    assert!(recorder.seen().is_empty());
}

#[tokio::test]
async fn test_run_twice_is_rejected() {
    let worker = Arc::new(AsyncQueueWorker::<u32>::new("twice", WorkerConfig::default()));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let handler: Arc<dyn QueueHandler<u32>> = Recorder::new();
    worker.run(Arc::clone(&handler), cancel.clone()).await.unwrap();

    let second = worker.run(handler, cancel).await;
    assert!(second.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_depth_warning_fires_above_threshold_once_per_cooldown() {
    let config = WorkerConfig {
        warn_threshold: 2,
        warn_cooldown: Duration::from_secs(60),
    };
    let worker = AsyncQueueWorker::<u32>::new("stalled", config);

    worker.accept(1);
    worker.accept(2);
    assert_eq!(worker.warnings(), 0);

    worker.accept(3);
    assert_eq!(worker.depth(), 3);
    assert_eq!(worker.warnings(), 1);

    // Still above threshold, but inside the cooldown window
    tokio::time::advance(Duration::from_secs(30)).await;
    worker.accept(4);
    worker.accept(5);
    assert_eq!(worker.warnings(), 1);

    tokio::time::advance(Duration::from_secs(31)).await;
    worker.accept(6);
    assert_eq!(worker.warnings(), 2);
    worker.accept(7);
    assert_eq!(worker.warnings(), 2);
}
