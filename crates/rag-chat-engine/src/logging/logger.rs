use anyhow::Result;
use async_trait::async_trait;
use flume::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::types::ActivityLog;
use crate::config::ActivityLogConfig;

/// Destination for batched activity logs.
#[async_trait]
pub trait ActivitySink: Send + Sync {
    async fn insert_batch(&self, logs: &[ActivityLog]) -> Result<usize>;
}

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// Queue capacity (max logs in memory before dropping)
    pub queue_capacity: usize,

    /// Batch size for sink inserts
    pub batch_size: usize,

    /// Max wait time before flushing batch (milliseconds)
    pub batch_timeout_ms: u64,

    pub worker_count: usize,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            batch_size: 100,
            batch_timeout_ms: 1000,
            worker_count: 2,
        }
    }
}

impl From<&ActivityLogConfig> for LoggerConfig {
    fn from(cfg: &ActivityLogConfig) -> Self {
        Self {
            queue_capacity: cfg.queue_capacity.max(1),
            batch_size: cfg.batch_size.max(1),
            batch_timeout_ms: cfg.batch_timeout_ms.max(1),
            worker_count: cfg.worker_count.max(1),
        }
    }
}

/// Async activity logger with queue mechanism
#[derive(Clone)]
pub struct ActivityLogger {
    sender: Option<Sender<ActivityLog>>,
    stop: Option<Arc<watch::Sender<bool>>>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

enum Next {
    Log(ActivityLog),
    Flush,
    Stop,
}

impl ActivityLogger {
    /// Initialize logger with background workers. Must be called inside a tokio runtime.
    pub fn new(sink: Arc<dyn ActivitySink>, config: LoggerConfig) -> Self {
        let (sender, receiver) = bounded(config.queue_capacity);
        let (stop, stop_rx) = watch::channel(false);

        info!(
            "Initializing ActivityLogger: queue={}, batch={}, timeout={}ms, workers={}",
            config.queue_capacity, config.batch_size, config.batch_timeout_ms, config.worker_count
        );

        let workers = (0..config.worker_count)
            .map(|worker_id| {
                let sink = sink.clone();
                let receiver = receiver.clone();
                let stop_rx = stop_rx.clone();
                let config = config.clone();

                tokio::spawn(async move {
                    Self::worker_loop(worker_id, sink, receiver, stop_rx, config).await;
                })
            })
            .collect();

        Self {
            sender: Some(sender),
            stop: Some(Arc::new(stop)),
            workers: Arc::new(Mutex::new(workers)),
        }
    }

    /// Logger that drops every entry; tracing output is unaffected.
    pub fn disabled() -> Self {
        Self {
            sender: None,
            stop: None,
            workers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Log activity (non-blocking, fire-and-forget). Entries logged after
    /// `shutdown` are dropped.
    pub fn log(&self, activity: ActivityLog) {
        let Some(sender) = &self.sender else {
            return;
        };
        if self.stop.as_ref().is_some_and(|stop| *stop.borrow()) {
            return;
        }
        if let Err(e) = sender.try_send(activity) {
            warn!("Failed to enqueue activity log (queue full?): {}", e);
        }
    }

    /// Stop the workers and wait until every queued entry reached the sink.
    pub async fn shutdown(&self) {
        let Some(stop) = &self.stop else {
            return;
        };
        stop.send_replace(true);

        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return;
        }
        let pending = self.queue_len();
        for handle in workers {
            if let Err(e) = handle.await {
                error!("Activity log worker panicked during shutdown: {}", e);
            }
        }
        info!("ActivityLogger drained ({} queued entries at shutdown)", pending);
    }

    async fn worker_loop(
        worker_id: usize,
        sink: Arc<dyn ActivitySink>,
        receiver: Receiver<ActivityLog>,
        mut stop_rx: watch::Receiver<bool>,
        config: LoggerConfig,
    ) {
        debug!("Activity log worker {} started", worker_id);

        let mut batch: Vec<ActivityLog> = Vec::with_capacity(config.batch_size);
        let batch_timeout = Duration::from_millis(config.batch_timeout_ms);

        loop {
            let deadline = tokio::time::Instant::now() + batch_timeout;

            while batch.len() < config.batch_size {
                let stopping = *stop_rx.borrow();
                let next = if stopping {
                    Next::Stop
                } else {
                    tokio::select! {
                        res = tokio::time::timeout_at(deadline, receiver.recv_async()) => match res {
                            Ok(Ok(log)) => Next::Log(log),
                            // Channel closed
                            Ok(Err(_)) => Next::Stop,
                            Err(_) => Next::Flush,
                        },
                        _ = stop_rx.changed() => Next::Stop,
                    }
                };

                match next {
                    Next::Log(log) => batch.push(log),
                    Next::Flush => break,
                    Next::Stop => {
                        batch.extend(receiver.try_iter());
                        for chunk in batch.chunks(config.batch_size) {
                            Self::flush_batch(sink.as_ref(), chunk, worker_id).await;
                        }
                        debug!("Activity log worker {} shutting down", worker_id);
                        return;
                    }
                }
            }

            if !batch.is_empty() {
                Self::flush_batch(sink.as_ref(), &batch, worker_id).await;
                batch.clear();
            } else {
                sleep(Duration::from_millis(100)).await;
            }
        }
    }

    async fn flush_batch(sink: &dyn ActivitySink, batch: &[ActivityLog], worker_id: usize) {
        let start = std::time::Instant::now();

        match sink.insert_batch(batch).await {
            Ok(inserted) => {
                debug!(
                    "Worker {} inserted {} activity logs in {:?}",
                    worker_id,
                    inserted,
                    start.elapsed()
                );
            }
            Err(e) => {
                error!("Worker {} failed to insert activity batch: {}", worker_id, e);
            }
        }
    }

    pub fn queue_len(&self) -> usize {
        self.sender.as_ref().map(|s| s.len()).unwrap_or(0)
    }
}
