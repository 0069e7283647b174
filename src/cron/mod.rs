//! Cron subsystem
//!
//! File locks, overdue tracking and the scheduled jobs that drive node
//! synchronization.

pub mod jobs;
pub mod lock;
pub mod notify;
pub mod runnable;
pub mod scheduler;

pub use jobs::{LogClear, Retrieval, Synchronizer};
pub use lock::LockManager;
pub use notify::{LogNotifier, Notifier, WebhookNotifier};
pub use runnable::{CronContext, CronRunnable, CronStore, CronTask, ReleaseOutcome, RunOutcome};
pub use scheduler::{CronDaemon, CronScheduler, JobSelector, JobStatus, TickReport};
