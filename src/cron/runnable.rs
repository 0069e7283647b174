//! Lock-guarded execution of one scheduled job
//!
//! `CronRunnable` wraps a job body (`CronTask`) with its schedule, its lock file and
//! its persistent overdue flag. A due job whose lock is still held is a stall: it is
//! flagged overdue and, once the lock is old enough, reported to the operator. The
//! flag makes the job due again as soon as the lock disappears.

use crate::{
    config::{CronJobConfig, SyncConfig},
    cron::{lock::LockManager, notify::Notifier},
    error::{ErrorKind, SyncResult},
    logging::{LogService, Related},
    node::{GatewayContext, GatewayRegistry},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use sqlx::{sqlite::SqlitePool, Row};
use std::{sync::Arc, time::Instant};

/// Services available to job bodies
#[derive(Clone)]
pub struct CronContext {
    pub pool: SqlitePool,
    pub services: GatewayContext,
    pub gateways: Arc<GatewayRegistry>,
    pub sync: SyncConfig,
}

/// `minutes mod interval == offset`
pub fn on_schedule(job: &CronJobConfig, minutes: i64) -> bool {
    job.interval > 0 && minutes.rem_euclid(i64::from(job.interval)) == i64::from(job.offset)
}

/// Minutes since the unix epoch
pub fn epoch_minutes(now: DateTime<Utc>) -> i64 {
    now.timestamp().div_euclid(60)
}

#[async_trait]
pub trait CronTask: Send + Sync {
    /// Schedule predicate; the standard interval/offset rule unless overridden
    fn is_due(&self, job: &CronJobConfig, minutes: i64) -> bool {
        on_schedule(job, minutes)
    }

    async fn run(&self, ctx: &CronContext) -> SyncResult<()>;
}

// ============================================================================
// Persistent job state
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct CronState {
    pub job_name: String,
    pub overdue: bool,
    pub updated_at: i64,
}

/// Access to the `cron` table
#[derive(Debug, Clone)]
pub struct CronStore {
    pool: SqlitePool,
}

impl CronStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn is_overdue(&self, job: &str) -> SyncResult<bool> {
        let row = sqlx::query("SELECT overdue FROM cron WHERE job_name = ?")
            .bind(job)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<bool, _>("overdue")).unwrap_or(false))
    }

    /// Upsert the overdue flag for `job`, stamped with `now`
    pub async fn set_overdue(&self, job: &str, overdue: bool, now: DateTime<Utc>) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO cron (job_name, overdue, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(job_name) DO UPDATE SET overdue = excluded.overdue, updated_at = excluded.updated_at
            "#,
        )
        .bind(job)
        .bind(overdue)
        .bind(now.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, job: &str) -> SyncResult<Option<CronState>> {
        let row = sqlx::query("SELECT job_name, overdue, updated_at FROM cron WHERE job_name = ?")
            .bind(job)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| CronState {
            job_name: r.get("job_name"),
            overdue: r.get("overdue"),
            updated_at: r.get("updated_at"),
        }))
    }
}

// ============================================================================
// Outcomes
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    NotDue,
    Completed {
        runtime_ms: u64,
    },
    Failed {
        code: String,
        message: String,
        runtime_ms: u64,
    },
    /// Lock still held by an earlier run; the body did not run
    Stalled {
        locked_since: Option<DateTime<Utc>>,
        notified: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReleaseOutcome {
    NotLocked,
    Released,
    Refused {
        locked_since: Option<DateTime<Utc>>,
        lock_time_minutes: u32,
    },
    Failed,
}

// ============================================================================
// Runnable
// ============================================================================

pub struct CronRunnable {
    config: CronJobConfig,
    task: Arc<dyn CronTask>,
    locks: LockManager,
    store: CronStore,
    notifier: Arc<dyn Notifier>,
    log: LogService,
}

impl CronRunnable {
    pub fn new(
        config: CronJobConfig,
        task: Arc<dyn CronTask>,
        locks: LockManager,
        store: CronStore,
        notifier: Arc<dyn Notifier>,
        log: LogService,
    ) -> Self {
        Self {
            config,
            task,
            locks,
            store,
            notifier,
            log,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CronJobConfig {
        &self.config
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn store(&self) -> &CronStore {
        &self.store
    }

    /// Due on schedule, or overdue and no longer locked
    pub async fn cron_check(&self, minutes: i64) -> SyncResult<bool> {
        if self.task.is_due(&self.config, minutes) {
            return Ok(true);
        }
        if self.config.overdue
            && self.store.is_overdue(&self.config.name).await?
            && self.locks.check_if_unlocked(&self.config.name)
        {
            tracing::info!("⏰ Job {} is overdue and unlocked, running now", self.config.name);
            return Ok(true);
        }
        Ok(false)
    }

    /// Run the body under the job lock
    pub async fn cron_run(&self, ctx: &CronContext, now: DateTime<Utc>) -> RunOutcome {
        let name = self.config.name.as_str();
        if !self.locks.check_if_unlocked(name) || !self.locks.acquire_lock_at(name, now) {
            return self.stall(now).await;
        }

        if let Err(e) = self.store.set_overdue(name, false, now).await {
            tracing::warn!("⚠️ Could not clear overdue flag of {}: {}", name, e);
        }

        tracing::info!("🚀 Running job {}", name);
        let started = Instant::now();
        let result = self.task.run(ctx).await;
        let runtime_ms = started.elapsed().as_millis() as u64;

        if !self.locks.release_lock(name).await {
            self.log
                .error(
                    "cron_release",
                    &format!("Lock of job {} could not be released", name),
                    json!({ "job": name }),
                    Related::default(),
                )
                .await;
        }

        match result {
            Ok(()) => {
                tracing::info!("✅ Job {} finished in {} ms", name, runtime_ms);
                RunOutcome::Completed { runtime_ms }
            }
            Err(e) => {
                let message = format!("Job {} failed: {}", name, e);
                let data = json!({ "job": name, "runtime_ms": runtime_ms, "kind": e.code() });
                match e.kind() {
                    ErrorKind::Node | ErrorKind::Sync => {
                        self.log.warn("cron_job_failed", &message, data, Related::default()).await
                    }
                    ErrorKind::Config | ErrorKind::Integrity | ErrorKind::Persistence => {
                        self.log.error("cron_job_failed", &message, data, Related::default()).await
                    }
                }
                RunOutcome::Failed {
                    code: e.code().to_string(),
                    message: e.to_string(),
                    runtime_ms,
                }
            }
        }
    }

    async fn stall(&self, now: DateTime<Utc>) -> RunOutcome {
        let name = self.config.name.as_str();
        if let Err(e) = self.store.set_overdue(name, true, now).await {
            tracing::warn!("⚠️ Could not flag {} overdue: {}", name, e);
        }

        let locked_since = self.locks.locked_since(name);
        let threshold =
            self.config.interval_seconds() * i64::from(self.config.notify_after_intervals);
        let stalled_for = locked_since.map(|since| (now - since).num_seconds());

        let mut notified = false;
        if stalled_for.is_some_and(|secs| secs > threshold) {
            let body = format!(
                "Job {} has been locked since {} and missed its schedule",
                name,
                locked_since.map(|t| t.to_rfc3339()).unwrap_or_default()
            );
            match self.notifier.notify(&format!("Cron job {} is stuck", name), &body).await {
                Ok(()) => notified = true,
                Err(e) => tracing::warn!("⚠️ Stall notification for {} failed: {}", name, e),
            }
        }

        self.log
            .warn(
                "cron_overdue",
                &format!("Job {} is still locked, flagged overdue", name),
                json!({ "job": name, "locked_for_secs": stalled_for, "notified": notified }),
                Related::default(),
            )
            .await;

        RunOutcome::Stalled {
            locked_since,
            notified,
        }
    }

    /// Forced unlock, allowed once the lock is older than `lock_time` minutes
    pub async fn admin_release_lock(&self, now: DateTime<Utc>) -> ReleaseOutcome {
        let name = self.config.name.as_str();
        if self.locks.check_if_unlocked(name) {
            return ReleaseOutcome::NotLocked;
        }

        let lock_time = self.config.lock_time();
        let locked_since = self.locks.locked_since(name);
        let old_enough = locked_since
            .is_some_and(|since| (now - since).num_seconds() >= i64::from(lock_time) * 60);
        if !old_enough {
            self.log
                .warn(
                    "cron_admin_release",
                    &format!("Refused to release {}: locked for less than {} minutes", name, lock_time),
                    json!({ "job": name, "locked_since": locked_since }),
                    Related::default(),
                )
                .await;
            return ReleaseOutcome::Refused {
                locked_since,
                lock_time_minutes: lock_time,
            };
        }

        if self.locks.release_lock(name).await {
            self.log
                .info(
                    "cron_admin_release",
                    &format!("Lock of {} released by operator", name),
                    json!({ "job": name, "locked_since": locked_since }),
                    Related::default(),
                )
                .await;
            ReleaseOutcome::Released
        } else {
            ReleaseOutcome::Failed
        }
    }
}

/// Context over an in-memory database, for unit tests of job bodies
#[cfg(test)]
pub(crate) fn test_context(db: &crate::store::Database, gateways: GatewayRegistry) -> CronContext {
    use crate::{
        node::{NodeService, SubscriptionCache},
        router::{FilterRegistry, RouterRepository, RouterService, TransformRegistry},
        store::{EntityStore, RetryPolicy, SqliteEntityStore},
    };

    let pool = db.pool().clone();
    let entities: Arc<dyn EntityStore> = Arc::new(SqliteEntityStore::new(pool.clone()));
    let log = LogService::new(pool.clone(), &[]);
    let retry = RetryPolicy::new(1, 1);
    let nodes = Arc::new(NodeService::new(
        pool.clone(),
        entities.clone(),
        Arc::new(SubscriptionCache::new()),
        retry,
    ));
    let router = Arc::new(RouterService::new(
        RouterRepository::new(pool.clone()),
        entities.clone(),
        TransformRegistry::with_builtin(),
        FilterRegistry::with_builtin(),
        log.clone(),
        retry,
    ));
    CronContext {
        pool,
        services: GatewayContext {
            nodes,
            router,
            entities,
            log,
        },
        gateways: Arc::new(gateways),
        sync: SyncConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cron::notify::LogNotifier, error::SyncError, store::Database};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        runs: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl CronTask for Counting {
        async fn run(&self, _ctx: &CronContext) -> SyncResult<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(SyncError::sync("boom"))
            } else {
                Ok(())
            }
        }
    }

    fn context(db: &Database) -> CronContext {
        test_context(db, GatewayRegistry::new())
    }

    fn runnable(db: &Database, dir: &tempfile::TempDir, task: Arc<Counting>) -> CronRunnable {
        CronRunnable::new(
            CronJobConfig::new("retrieval", 15, 5),
            task,
            LockManager::new(dir.path()).with_release_backoff(std::time::Duration::from_millis(1)),
            CronStore::new(db.pool().clone()),
            Arc::new(LogNotifier),
            LogService::new(db.pool().clone(), &[]),
        )
    }

    fn counting(fail: bool) -> Arc<Counting> {
        Arc::new(Counting {
            runs: AtomicUsize::new(0),
            fail,
        })
    }

    #[test]
    fn test_on_schedule_is_pure_modulo() {
        let job = CronJobConfig::new("retrieval", 15, 5);
        let due: Vec<i64> = (0..60).filter(|m| on_schedule(&job, *m)).collect();
        assert_eq!(due, vec![5, 20, 35, 50]);
        assert_eq!(on_schedule(&job, 20), on_schedule(&job, 20));
        assert_eq!(epoch_minutes(DateTime::from_timestamp(3_599, 0).unwrap()), 59);
    }

    #[tokio::test]
    async fn test_run_releases_lock_and_reports_failure() {
        let db = Database::in_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let task = counting(true);
        let job = runnable(&db, &dir, task.clone());

        let outcome = job.cron_run(&context(&db), Utc::now()).await;
        assert!(matches!(outcome, RunOutcome::Failed { ref code, .. } if code == "sync"));
        assert_eq!(task.runs.load(Ordering::SeqCst), 1);
        assert!(job.locks().check_if_unlocked("retrieval"));
    }

    #[tokio::test]
    async fn test_stall_notifies_after_threshold() {
        let db = Database::in_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let task = counting(false);
        let job = runnable(&db, &dir, task.clone());
        let now = Utc::now();

        // 15 minute interval, notify after 3 intervals
        assert!(job.locks().acquire_lock_at("retrieval", now - chrono::Duration::minutes(10)));
        let outcome = job.cron_run(&context(&db), now).await;
        assert!(matches!(outcome, RunOutcome::Stalled { notified: false, .. }));

        job.locks().release_lock("retrieval").await;
        assert!(job.locks().acquire_lock_at("retrieval", now - chrono::Duration::minutes(50)));
        let outcome = job.cron_run(&context(&db), now).await;
        assert!(matches!(outcome, RunOutcome::Stalled { notified: true, .. }));

        assert_eq!(task.runs.load(Ordering::SeqCst), 0);
        assert!(job.store().is_overdue("retrieval").await.unwrap());
    }

    #[tokio::test]
    async fn test_admin_release_respects_lock_time() {
        let db = Database::in_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let job = runnable(&db, &dir, counting(false));
        let now = Utc::now();

        assert_eq!(job.admin_release_lock(now).await, ReleaseOutcome::NotLocked);

        // lock_time = 15 × 4 = 60 minutes
        assert!(job.locks().acquire_lock_at("retrieval", now - chrono::Duration::minutes(30)));
        assert!(matches!(
            job.admin_release_lock(now).await,
            ReleaseOutcome::Refused { lock_time_minutes: 60, .. }
        ));
        assert!(!job.locks().check_if_unlocked("retrieval"));

        let later = now + chrono::Duration::minutes(31);
        assert_eq!(job.admin_release_lock(later).await, ReleaseOutcome::Released);
        assert!(job.locks().check_if_unlocked("retrieval"));
    }

    #[tokio::test]
    async fn test_overdue_and_unlocked_makes_job_due() {
        let db = Database::in_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let job = runnable(&db, &dir, counting(false));

        assert!(!job.cron_check(6).await.unwrap());
        job.store().set_overdue("retrieval", true, Utc::now()).await.unwrap();
        assert!(job.cron_check(6).await.unwrap());

        assert!(job.locks().acquire_lock("retrieval"));
        assert!(!job.cron_check(6).await.unwrap());
    }
}
