//! Scheduler tick and in-process daemon
//!
//! A tick evaluates the configured jobs in order for one point in time. The tick
//! itself is triggered from outside: the `tick` CLI command (OS cron) or the
//! `CronDaemon`, which fires it at the top of every minute.

use crate::{
    config::{CronConfig, CronJobConfig},
    cron::{
        jobs::builtin_task,
        lock::LockManager,
        notify::Notifier,
        runnable::{epoch_minutes, CronContext, CronRunnable, CronStore, CronTask, ReleaseOutcome, RunOutcome},
    },
    error::{SyncError, SyncResult},
    logging::LogService,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

/// Which jobs a tick considers
#[derive(Debug, Clone, PartialEq)]
pub enum JobSelector {
    /// Every job that is due, in configuration order
    All,
    /// One job, run regardless of its schedule (still under its lock)
    Named(String),
}

impl JobSelector {
    /// `"all"` or a job name
    pub fn parse(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("all") {
            JobSelector::All
        } else {
            JobSelector::Named(raw.to_string())
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job: String,
    pub outcome: RunOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    /// Correlates the log records of one tick
    pub run_id: String,
    pub at: DateTime<Utc>,
    pub jobs: Vec<JobReport>,
}

impl TickReport {
    pub fn outcome(&self, job: &str) -> Option<&RunOutcome> {
        self.jobs.iter().find(|r| r.job == job).map(|r| &r.outcome)
    }
}

/// Live view of one job for operators
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub name: String,
    pub interval: u32,
    pub offset: u32,
    pub lock_time: u32,
    pub locked: bool,
    pub locked_since: Option<DateTime<Utc>>,
    pub overdue: bool,
}

pub struct CronScheduler {
    jobs: Vec<CronRunnable>,
    ctx: CronContext,
    locks: LockManager,
    store: CronStore,
    notifier: Arc<dyn Notifier>,
    log: LogService,
}

impl CronScheduler {
    /// Scheduler without jobs
    pub fn new(ctx: CronContext, locks: LockManager, notifier: Arc<dyn Notifier>, log: LogService) -> Self {
        Self {
            jobs: Vec::new(),
            store: CronStore::new(ctx.pool.clone()),
            ctx,
            locks,
            notifier,
            log,
        }
    }

    /// Scheduler with every configured job bound to its built-in body
    pub fn from_config(
        config: &CronConfig,
        ctx: CronContext,
        notifier: Arc<dyn Notifier>,
        log: LogService,
    ) -> SyncResult<Self> {
        let mut scheduler = Self::new(ctx, LockManager::new(&config.lock_dir), notifier, log);
        for job in &config.jobs {
            let task = builtin_task(&job.name)
                .ok_or_else(|| SyncError::config(format!("Unknown cron job '{}'", job.name)))?;
            scheduler.add_job(job.clone(), task);
        }
        Ok(scheduler)
    }

    /// Append a job; ticks evaluate jobs in the order they were added
    pub fn add_job(&mut self, config: CronJobConfig, task: Arc<dyn CronTask>) {
        tracing::debug!(
            "⏰ Registered job {} (every {} min, offset {})",
            config.name,
            config.interval,
            config.offset
        );
        self.jobs.push(CronRunnable::new(
            config,
            task,
            self.locks.clone(),
            self.store.clone(),
            self.notifier.clone(),
            self.log.clone(),
        ));
    }

    pub fn job(&self, name: &str) -> Option<&CronRunnable> {
        self.jobs.iter().find(|job| job.name() == name)
    }

    fn require_job(&self, name: &str) -> SyncResult<&CronRunnable> {
        self.job(name)
            .ok_or_else(|| SyncError::config(format!("Unknown cron job '{}'", name)))
    }

    pub fn context(&self) -> &CronContext {
        &self.ctx
    }

    /// One scheduler pass for `now`
    ///
    /// A job that fails is reported and the pass continues with the next one.
    pub async fn tick(&self, now: DateTime<Utc>, selector: &JobSelector) -> SyncResult<TickReport> {
        let mut report = TickReport {
            run_id: Uuid::new_v4().to_string(),
            at: now,
            jobs: Vec::new(),
        };

        match selector {
            JobSelector::Named(name) => {
                let job = self.require_job(name)?;
                let outcome = job.cron_run(&self.ctx, now).await;
                report.jobs.push(JobReport {
                    job: name.clone(),
                    outcome,
                });
            }
            JobSelector::All => {
                let minutes = epoch_minutes(now);
                for job in &self.jobs {
                    let outcome = match job.cron_check(minutes).await {
                        Ok(true) => job.cron_run(&self.ctx, now).await,
                        Ok(false) => RunOutcome::NotDue,
                        Err(e) => {
                            tracing::error!("❌ Schedule check for {} failed: {}", job.name(), e);
                            RunOutcome::Failed {
                                code: e.code().to_string(),
                                message: e.to_string(),
                                runtime_ms: 0,
                            }
                        }
                    };
                    report.jobs.push(JobReport {
                        job: job.name().to_string(),
                        outcome,
                    });
                }
            }
        }

        let ran = report
            .jobs
            .iter()
            .filter(|r| !matches!(r.outcome, RunOutcome::NotDue))
            .count();
        tracing::debug!(
            "⏱️ Tick {} at {}: {} of {} jobs acted",
            report.run_id,
            now,
            ran,
            report.jobs.len()
        );
        Ok(report)
    }

    /// Operator unlock of the named job (see `CronRunnable::admin_release_lock`)
    pub async fn admin_release_lock(&self, name: &str, now: DateTime<Utc>) -> SyncResult<ReleaseOutcome> {
        Ok(self.require_job(name)?.admin_release_lock(now).await)
    }

    /// Schedule, lock and overdue state of every job, in configuration order
    pub async fn status(&self) -> SyncResult<Vec<JobStatus>> {
        let mut statuses = Vec::with_capacity(self.jobs.len());
        for job in &self.jobs {
            let name = job.name();
            statuses.push(JobStatus {
                name: name.to_string(),
                interval: job.config().interval,
                offset: job.config().offset,
                lock_time: job.config().lock_time(),
                locked: !job.locks().check_if_unlocked(name),
                locked_since: job.locks().locked_since(name),
                overdue: job.store().is_overdue(name).await?,
            });
        }
        Ok(statuses)
    }
}

/// Runs `tick(now, All)` at the top of every minute inside the server process
pub struct CronDaemon {
    scheduler: Arc<RwLock<JobScheduler>>,
    cron: Arc<CronScheduler>,
}

impl CronDaemon {
    pub async fn new(cron: Arc<CronScheduler>) -> Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Arc::new(RwLock::new(scheduler)),
            cron,
        })
    }

    /// Register the per-minute tick and start the underlying scheduler
    pub async fn start(&self) -> Result<()> {
        tracing::info!("⏰ Starting cron daemon");

        let cron = Arc::clone(&self.cron);
        let job = Job::new_async("0 * * * * *", move |_uuid, _l| {
            let cron = Arc::clone(&cron);
            Box::pin(async move {
                match cron.tick(Utc::now(), &JobSelector::All).await {
                    Ok(report) => tracing::debug!("🔔 Tick finished ({} jobs)", report.jobs.len()),
                    Err(e) => tracing::error!("❌ Tick failed: {}", e),
                }
            })
        })?;

        {
            let scheduler = self.scheduler.write().await;
            scheduler.add(job).await?;
            scheduler.start().await?;
        }

        tracing::info!("✅ Cron daemon started");
        Ok(())
    }

    /// Shut the underlying scheduler down
    pub async fn stop(&self) -> Result<()> {
        tracing::info!("⏹️ Stopping cron daemon");
        let mut scheduler = self.scheduler.write().await;
        scheduler.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cron::{notify::LogNotifier, runnable::test_context},
        node::GatewayRegistry,
        store::Database,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter(AtomicUsize);

    #[async_trait]
    impl CronTask for Counter {
        async fn run(&self, _ctx: &CronContext) -> SyncResult<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn scheduler(dir: &tempfile::TempDir) -> (CronScheduler, Arc<Counter>, Arc<Counter>) {
        let db = Database::in_memory().await.unwrap();
        let ctx = test_context(&db, GatewayRegistry::new());
        let log = LogService::new(db.pool().clone(), &[]);
        let mut cron = CronScheduler::new(ctx, LockManager::new(dir.path()), Arc::new(LogNotifier), log);

        let every_five = Arc::new(Counter::default());
        let hourly = Arc::new(Counter::default());
        cron.add_job(CronJobConfig::new("five", 5, 0), every_five.clone());
        cron.add_job(CronJobConfig::new("hourly", 60, 15), hourly.clone());
        (cron, every_five, hourly)
    }

    fn at_minute(minute: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(minute * 60, 0).unwrap()
    }

    #[tokio::test]
    async fn test_tick_runs_only_due_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let (cron, five, hourly) = scheduler(&dir).await;

        let report = cron.tick(at_minute(15), &JobSelector::All).await.unwrap();
        assert!(matches!(report.outcome("five"), Some(RunOutcome::Completed { .. })));
        assert!(matches!(report.outcome("hourly"), Some(RunOutcome::Completed { .. })));

        let report = cron.tick(at_minute(20), &JobSelector::All).await.unwrap();
        assert_eq!(report.outcome("hourly"), Some(&RunOutcome::NotDue));

        cron.tick(at_minute(21), &JobSelector::All).await.unwrap();
        assert_eq!(five.0.load(Ordering::SeqCst), 2);
        assert_eq!(hourly.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_named_tick_ignores_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let (cron, _five, hourly) = scheduler(&dir).await;

        let report = cron
            .tick(at_minute(1), &JobSelector::parse("hourly"))
            .await
            .unwrap();
        assert_eq!(report.jobs.len(), 1);
        assert_eq!(hourly.0.load(Ordering::SeqCst), 1);

        let err = cron
            .tick(at_minute(1), &JobSelector::parse("missing"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }

    #[test]
    fn test_selector_parse() {
        assert_eq!(JobSelector::parse("ALL"), JobSelector::All);
        assert_eq!(
            JobSelector::parse("logclear"),
            JobSelector::Named("logclear".to_string())
        );
    }
}
