// Bounded worker pool with retries
//
// A batch spawns min(max_concurrent, n) workers that pull from one shared
// queue. Items enter the queue up front or as a stream yields them. Every
// suspension point (queue wait, handler, backoff sleep) is raced against the
// batch token, which is a child of the caller's token.

use async_trait::async_trait;
use futures::{stream, FutureExt, Stream, StreamExt};
use parking_lot::Mutex;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::backoff::Backoff;
use super::classify::{classify, ErrorClass};
use super::config::SchedulerConfig;
use super::progress::{ProgressSink, TaskProgress};
use super::task::{TaskFailure, TaskResult, TaskStatus};

/// Passed to the handler on every attempt
#[derive(Debug, Clone)]
pub struct AttemptContext {
    /// Position of the task in the batch
    pub index: usize,
    /// 1-based attempt number
    pub attempt: u32,
    /// Fires when the batch is cancelled
    pub cancel: CancellationToken,
}

/// One unit of work, run once per attempt
#[async_trait]
pub trait TaskHandler<W>: Send + Sync {
    type Output: Send + 'static;

    async fn run(&self, item: Arc<W>, ctx: AttemptContext) -> anyhow::Result<Self::Output>;
}

/// Adapter so closures returning futures can be used as handlers
pub struct FnHandler<F>(F);

pub fn handler_fn<W, O, F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Arc<W>, AttemptContext) -> Fut,
    Fut: Future<Output = anyhow::Result<O>>,
{
    FnHandler(f)
}

#[async_trait]
impl<W, F, Fut, O> TaskHandler<W> for FnHandler<F>
where
    W: Send + Sync + 'static,
    F: Fn(Arc<W>, AttemptContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<O>> + Send,
    O: Send + 'static,
{
    type Output = O;

    async fn run(&self, item: Arc<W>, ctx: AttemptContext) -> anyhow::Result<O> {
        (self.0)(item, ctx).await
    }
}

/// Executes batches of independent tasks
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    config: SchedulerConfig,
    progress: ProgressSink,
}

type Queued<W> = (usize, Arc<W>);

struct Batch<W, O> {
    queue: AsyncMutex<mpsc::UnboundedReceiver<Queued<W>>>,
    results: Mutex<Vec<Option<TaskResult<O>>>>,
    token: CancellationToken,
    config: SchedulerConfig,
    backoff: Backoff,
    progress: ProgressSink,
}

enum Attempt<O> {
    Done(O),
    Failed(anyhow::Error),
    Panicked(String),
    Cancelled,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            progress: ProgressSink::default(),
        }
    }

    /// Report task progress on `tx`
    pub fn with_progress(mut self, tx: mpsc::Sender<TaskProgress>) -> Self {
        self.progress = ProgressSink::new(Some(tx));
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run every item through `handler` and return results in submission order.
    ///
    /// Returns once every task is terminal. Cancelling `cancel` stops queued
    /// and in-flight work; finished results are kept and the rest are
    /// reported as `Cancelled`.
    pub async fn execute<W, H>(
        &self,
        cancel: &CancellationToken,
        items: Vec<W>,
        handler: Arc<H>,
    ) -> Vec<TaskResult<H::Output>>
    where
        W: Send + Sync + 'static,
        H: TaskHandler<W> + 'static,
    {
        let total = items.len();
        let ready = stream::iter(items.into_iter().enumerate());
        self.execute_ready(cancel, total, ready, handler).await
    }

    /// Run a batch of `total` tasks whose items become ready over time.
    ///
    /// `ready` yields `(index, item)` pairs with unique indices below
    /// `total`; a task is only queued, and only takes a worker, once its item
    /// is yielded. Returns when the stream has ended and every queued task is
    /// terminal. Indices never yielded are reported as `Cancelled` with zero
    /// attempts.
    #[instrument(skip_all, fields(tasks = total, workers = tracing::field::Empty))]
    pub async fn execute_ready<W, H, S>(
        &self,
        cancel: &CancellationToken,
        total: usize,
        ready: S,
        handler: Arc<H>,
    ) -> Vec<TaskResult<H::Output>>
    where
        W: Send + Sync + 'static,
        H: TaskHandler<W> + 'static,
        S: Stream<Item = (usize, W)>,
    {
        if total == 0 {
            return Vec::new();
        }

        let workers = self.config.max_concurrent.max(1).min(total);
        tracing::Span::current().record("workers", workers);
        info!("Executing {} task(s) with {} worker(s)", total, workers);

        let (tx, rx) = mpsc::unbounded_channel();
        let batch = Arc::new(Batch {
            queue: AsyncMutex::new(rx),
            results: Mutex::new((0..total).map(|_| None).collect()),
            token: cancel.child_token(),
            config: self.config.clone(),
            backoff: Backoff::from_config(&self.config),
            progress: self.progress.clone(),
        });

        let mut pool = JoinSet::new();
        for worker_id in 0..workers {
            let batch = batch.clone();
            let handler = handler.clone();
            pool.spawn(async move { batch.work(worker_id, handler.as_ref()).await });
        }

        let drain = async {
            while let Some(joined) = pool.join_next().await {
                if let Err(e) = joined {
                    error!("Scheduler worker failed: {}", e);
                }
            }
        };
        tokio::join!(batch.feed(ready, tx, total), drain);

        let results: Vec<TaskResult<H::Output>> = std::mem::take(&mut *batch.results.lock())
            .into_iter()
            .enumerate()
            .map(|(index, slot)| slot.unwrap_or_else(|| TaskResult::not_started(index)))
            .collect();

        // The batch token is a child of the caller's; release it either way.
        batch.token.cancel();
        results
    }
}

impl<W, O> Batch<W, O>
where
    W: Send + Sync + 'static,
    O: Send + 'static,
{
    /// Move ready items into the queue until the stream ends or the batch is cancelled
    async fn feed<S>(&self, ready: S, tx: mpsc::UnboundedSender<Queued<W>>, total: usize)
    where
        S: Stream<Item = (usize, W)>,
    {
        tokio::pin!(ready);
        loop {
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => None,
                next = ready.next() => next,
            };
            let Some((index, item)) = next else {
                break;
            };
            if index >= total {
                warn!(index, total, "Ready item outside the batch, skipped");
                continue;
            }
            if tx.send((index, Arc::new(item))).is_err() {
                break;
            }
        }
        // Dropping `tx` lets idle workers exit once the queue is drained.
    }

    async fn work<H>(&self, worker_id: usize, handler: &H)
    where
        H: TaskHandler<W, Output = O>,
    {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => None,
                next = async { self.queue.lock().await.recv().await } => next,
            };
            let Some((index, item)) = next else {
                debug!(worker_id, "Worker exiting");
                return;
            };

            let result = self.run_task(index, item, handler).await;
            let failed = result.status == TaskStatus::Failed;
            self.results.lock()[index] = Some(result);

            if failed && self.config.fail_fast {
                warn!(index, "Task failed, cancelling remaining batch (fail fast)");
                self.token.cancel();
            }
        }
    }

    async fn run_task<H>(&self, index: usize, item: Arc<W>, handler: &H) -> TaskResult<O>
    where
        H: TaskHandler<W, Output = O>,
    {
        let started = Instant::now();
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempts = 0;
        let mut last_failure: Option<TaskFailure> = None;

        let finish = |status: TaskStatus,
                      output: Option<O>,
                      error: Option<TaskFailure>,
                      attempts: u32,
                      exhausted_retries: bool| {
            self.progress.send(TaskProgress::Finished {
                index,
                status,
                attempts,
            });
            TaskResult {
                index,
                status,
                output,
                error,
                attempts,
                duration: started.elapsed(),
                exhausted_retries,
            }
        };

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = self.backoff.delay(attempt - 1);
                let class = last_failure
                    .as_ref()
                    .map(|f| f.class)
                    .unwrap_or(ErrorClass::Unknown);
                debug!(index, attempt, ?delay, %class, "Retrying task");
                self.progress.send(TaskProgress::Retrying {
                    index,
                    attempt,
                    delay,
                    class,
                });
                if !self.sleep(delay).await {
                    return finish(TaskStatus::Cancelled, None, last_failure, attempts, false);
                }
            }

            attempts = attempt;
            self.progress.send(TaskProgress::Started { index, attempt });
            let ctx = AttemptContext {
                index,
                attempt,
                cancel: self.token.clone(),
            };

            let failure = match self.attempt(handler, item.clone(), ctx).await {
                Attempt::Done(output) => {
                    debug!(index, attempt, "Task succeeded");
                    return finish(TaskStatus::Succeeded, Some(output), None, attempts, false);
                }
                Attempt::Cancelled => {
                    return finish(TaskStatus::Cancelled, None, last_failure, attempts, false);
                }
                Attempt::Failed(err) => {
                    let class = classify(&err);
                    warn!(index, attempt, %class, "Task attempt failed: {:#}", err);
                    TaskFailure {
                        class,
                        message: format!("{:#}", err),
                    }
                }
                Attempt::Panicked(message) => {
                    error!(index, attempt, "Task panicked: {}", message);
                    TaskFailure {
                        class: ErrorClass::Panic,
                        message: format!("task panicked: {}", message),
                    }
                }
            };

            let retryable = failure.class.is_retryable();
            last_failure = Some(failure);
            if !retryable {
                break;
            }
        }

        let exhausted = attempts == max_attempts
            && last_failure
                .as_ref()
                .map(|f| f.class.is_retryable())
                .unwrap_or(false);
        finish(TaskStatus::Failed, None, last_failure, attempts, exhausted)
    }

    async fn attempt<H>(&self, handler: &H, item: Arc<W>, ctx: AttemptContext) -> Attempt<O>
    where
        H: TaskHandler<W, Output = O>,
    {
        let run = AssertUnwindSafe(handler.run(item, ctx)).catch_unwind();
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Attempt::Cancelled,
            result = run => match result {
                Ok(Ok(output)) => Attempt::Done(output),
                // A handler that bails because the batch was cancelled is not a failure.
                Ok(Err(_)) if self.token.is_cancelled() => Attempt::Cancelled,
                Ok(Err(err)) => Attempt::Failed(err),
                Err(payload) => Attempt::Panicked(panic_message(payload.as_ref())),
            },
        }
    }

    /// Sleep unless the batch is cancelled first. Returns false on cancellation.
    async fn sleep(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.token.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
