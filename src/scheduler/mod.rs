// Retrying batch scheduler
//
// Runs independent units of work on a bounded worker pool. Transient
// failures are retried with jittered exponential backoff; auth and
// validation failures are not. A batch can be cancelled from outside or,
// with fail_fast, by its first failure.

mod backoff;
mod classify;
mod config;
mod pool;
mod progress;
mod task;

pub use backoff::Backoff;
pub use classify::{classify, ErrorClass};
pub use config::SchedulerConfig;
pub use pool::{handler_fn, AttemptContext, FnHandler, Scheduler, TaskHandler};
pub use progress::TaskProgress;
pub use task::{BatchSummary, TaskFailure, TaskResult, TaskStatus};
