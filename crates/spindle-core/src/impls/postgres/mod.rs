//! PostgreSQL-backed job store.
//!
//! 複数の worker プロセスが同じ DB を共有しても正しく動くように、調停はすべて
//! SQL の原子的操作に任せる。
//!
//! - fetch: `FOR UPDATE SKIP LOCKED` で候補 1 行を claim し、同じ文の中で
//!   `running` へ更新して `started` イベントを書く
//! - lock: `spindle_jobs_lock_idx`（`status IN ('running','aborting')` の部分 unique index）
//!   が最終防衛線。並行 fetch が同じ lock の別 job を同時に claim しようとすると
//!   片方が unique violation になり、その fetch は最新状態で再評価される
//! - queueing_lock: `spindle_jobs_queueing_lock_idx`（`status = 'pending'`）
//! - 通知: INSERT trigger の `pg_notify` を `PgListener` で受ける
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (unique violation on `spindle_jobs_queueing_lock_idx`) | `23505` | `QueueingLockConflict` | defer / retry while another job is pending with the same queueing lock |
//! | Database (unique violation on `spindle_jobs_lock_idx`) | `23505` | (retried inside `fetch`) | two fetches raced for the same lock |
//! | anything else | any | `Database` | connectivity, pool closed, ... (propagated to the caller) |

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::domain::{
    EventType, Job, JobArgs, JobEvent, JobId, JobStatus, NewJob, RetryDecision, StoreError,
};
use crate::ports::{Channel, GroupBy, GroupStats, JobFilter, JobStore, WakeSignal};

const SCHEMA: &str = include_str!("schema.sql");

const UNIQUE_VIOLATION: &str = "23505";
const QUEUEING_LOCK_INDEX: &str = "spindle_jobs_queueing_lock_idx";
const LOCK_INDEX: &str = "spindle_jobs_lock_idx";

/// How many times a fetch re-runs after losing a lock race.
const FETCH_ATTEMPTS: usize = 3;

const JOB_COLUMNS: &str =
    "id, queue_name, task_name, priority, lock, queueing_lock, args, status, scheduled_at, attempts";

#[derive(Debug, FromRow)]
struct JobRow {
    id: i64,
    queue_name: String,
    task_name: String,
    priority: i32,
    lock: Option<String>,
    queueing_lock: Option<String>,
    args: Json<JobArgs>,
    status: String,
    scheduled_at: Option<DateTime<Utc>>,
    attempts: i32,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<JobStatus>()
            .map_err(|e| StoreError::Corrupt(format!("job {}: {e}", row.id)))?;
        let attempts = u32::try_from(row.attempts)
            .map_err(|_| StoreError::Corrupt(format!("job {}: negative attempts", row.id)))?;
        Ok(Job {
            id: JobId::new(row.id),
            queue_name: row.queue_name,
            task_name: row.task_name,
            priority: row.priority,
            lock: row.lock,
            queueing_lock: row.queueing_lock,
            args: row.args.0,
            status,
            scheduled_at: row.scheduled_at,
            attempts,
        })
    }
}

fn unique_violation_on(err: &sqlx::Error, index: &str) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            db.code().as_deref() == Some(UNIQUE_VIOLATION) && db.constraint() == Some(index)
        }
        _ => false,
    }
}

fn map_write_error(err: sqlx::Error, queueing_lock: Option<&str>) -> StoreError {
    if unique_violation_on(&err, QUEUEING_LOCK_INDEX) {
        return StoreError::QueueingLockConflict(queueing_lock.unwrap_or_default().to_string());
    }
    StoreError::Database(err)
}

fn seconds(duration: Duration) -> f64 {
    duration.as_secs_f64()
}

fn group_column(group_by: GroupBy) -> &'static str {
    match group_by {
        GroupBy::Queue => "queue_name",
        GroupBy::Task => "task_name",
        GroupBy::Lock => "lock",
    }
}

/// Fold `(group, status, count)` rows into sorted `GroupStats`.
fn fold_stats(rows: Vec<(Option<String>, String, i64)>) -> Result<Vec<GroupStats>, StoreError> {
    let mut groups: std::collections::BTreeMap<Option<String>, GroupStats> = Default::default();
    for (name, status, count) in rows {
        let status = status
            .parse::<JobStatus>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let count = u64::try_from(count).unwrap_or(0);
        let group = groups.entry(name.clone()).or_insert_with(|| GroupStats {
            name,
            ..GroupStats::default()
        });
        group.jobs_count += count;
        *group.stats.entry(status).or_insert(0) += count;
    }
    Ok(groups.into_values().collect())
}

/// `JobStore` on PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables, indexes and the notify trigger.
    #[instrument(skip(self), err)]
    pub async fn apply_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        tracing::info!("schema applied");
        Ok(())
    }

    async fn try_fetch(&self, queues: Option<&[String]>) -> Result<Option<JobRow>, sqlx::Error> {
        let sql = format!(
            r#"
            WITH candidate AS (
                SELECT jobs.id
                FROM spindle_jobs AS jobs
                WHERE jobs.status = 'pending'
                  AND ($1::text[] IS NULL OR jobs.queue_name = ANY($1))
                  AND (jobs.scheduled_at IS NULL OR jobs.scheduled_at <= now())
                  AND (jobs.lock IS NULL OR NOT EXISTS (
                        SELECT 1 FROM spindle_jobs AS holders
                        WHERE holders.lock = jobs.lock
                          AND holders.status IN ('running', 'aborting')
                  ))
                ORDER BY jobs.priority DESC, jobs.id ASC
                LIMIT 1
                FOR UPDATE OF jobs SKIP LOCKED
            ),
            claimed AS (
                UPDATE spindle_jobs
                SET status = 'running'
                FROM candidate
                WHERE spindle_jobs.id = candidate.id
                RETURNING spindle_jobs.*
            ),
            started AS (
                INSERT INTO spindle_events (job_id, type)
                SELECT id, 'started' FROM claimed
            )
            SELECT {JOB_COLUMNS} FROM claimed
            "#
        );
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(queues.map(<[String]>::to_vec))
            .fetch_optional(&self.pool)
            .await
    }

    /// `None` if the job does not exist.
    async fn current_status(&self, id: JobId) -> Result<Option<JobStatus>, StoreError> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM spindle_jobs WHERE id = $1")
                .bind(id.get())
                .fetch_optional(&self.pool)
                .await?;
        status
            .map(|s| s.parse::<JobStatus>())
            .transpose()
            .map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    async fn transition_error(&self, id: JobId, to: JobStatus) -> StoreError {
        match self.current_status(id).await {
            Ok(Some(from)) => StoreError::InvalidTransition { id, from, to },
            Ok(None) => StoreError::NotFound(id),
            Err(err) => err,
        }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    #[instrument(skip(self, job), fields(task = %job.task_name, queue = %job.queue_name), err)]
    async fn defer(&self, job: NewJob) -> Result<JobId, StoreError> {
        let mut tx = self.pool.begin().await?;
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO spindle_jobs
                (queue_name, task_name, priority, lock, queueing_lock, args, scheduled_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(&job.queue_name)
        .bind(&job.task_name)
        .bind(job.priority)
        .bind(&job.lock)
        .bind(&job.queueing_lock)
        .bind(Json(&job.args))
        .bind(job.scheduled_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_write_error(e, job.queueing_lock.as_deref()))?;

        if job.scheduled_at.is_some() {
            insert_event(&mut tx, id, EventType::Scheduled).await?;
        }
        insert_event(&mut tx, id, EventType::Deferred).await?;
        tx.commit().await?;
        Ok(JobId::new(id))
    }

    #[instrument(skip(self, job), fields(task = %job.task_name), err)]
    async fn defer_periodic(
        &self,
        job: NewJob,
        periodic_id: &str,
        tick_timestamp: i64,
    ) -> Result<Option<JobId>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let defer_id: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO spindle_periodic_defers (task_name, periodic_id, defer_timestamp)
            VALUES ($1, $2, $3)
            ON CONFLICT DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&job.task_name)
        .bind(periodic_id)
        .bind(tick_timestamp)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(defer_id) = defer_id else {
            return Ok(None);
        };

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO spindle_jobs
                (queue_name, task_name, priority, lock, queueing_lock, args)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(&job.queue_name)
        .bind(&job.task_name)
        .bind(job.priority)
        .bind(&job.lock)
        .bind(&job.queueing_lock)
        .bind(Json(&job.args))
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_write_error(e, job.queueing_lock.as_deref()))?;
        insert_event(&mut tx, id, EventType::Deferred).await?;

        sqlx::query("UPDATE spindle_periodic_defers SET job_id = $1 WHERE id = $2")
            .bind(id)
            .bind(defer_id)
            .execute(&mut *tx)
            .await?;
        // 古い tick の記録は最新のもの以外不要
        sqlx::query(
            r#"
            DELETE FROM spindle_periodic_defers
            WHERE task_name = $1 AND periodic_id = $2 AND defer_timestamp < $3
            "#,
        )
        .bind(&job.task_name)
        .bind(periodic_id)
        .bind(tick_timestamp)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(JobId::new(id)))
    }

    #[instrument(skip(self), err)]
    async fn fetch(&self, queues: Option<&[String]>) -> Result<Option<Job>, StoreError> {
        for _ in 0..FETCH_ATTEMPTS {
            match self.try_fetch(queues).await {
                Ok(row) => return row.map(Job::try_from).transpose(),
                Err(err) if unique_violation_on(&err, LOCK_INDEX) => {
                    tracing::debug!("lost a lock race during fetch, retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(None)
    }

    #[instrument(skip(self), fields(job_id = id.get()), err)]
    async fn finish(&self, id: JobId, status: JobStatus, delete: bool) -> Result<(), StoreError> {
        if !status.is_finish_status() {
            return Err(self.transition_error(id, status).await);
        }

        let mut tx = self.pool.begin().await?;
        let affected = if delete {
            sqlx::query(
                "DELETE FROM spindle_jobs WHERE id = $1 AND status IN ('running', 'aborting')",
            )
            .bind(id.get())
            .execute(&mut *tx)
            .await?
            .rows_affected()
        } else {
            let affected = sqlx::query(
                r#"
                UPDATE spindle_jobs
                SET status = $2, attempts = attempts + 1
                WHERE id = $1 AND status IN ('running', 'aborting')
                "#,
            )
            .bind(id.get())
            .bind(status.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if affected > 0
                && let Some(kind) = EventType::for_status(status)
            {
                insert_event(&mut tx, id.get(), kind).await?;
            }
            affected
        };

        if affected == 0 {
            tx.rollback().await?;
            return Err(self.transition_error(id, status).await);
        }
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self, decision), fields(job_id = id.get(), retry_at = %decision.retry_at), err)]
    async fn retry(&self, id: JobId, decision: &RetryDecision) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let updated: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE spindle_jobs
            SET status = 'pending',
                attempts = attempts + 1,
                scheduled_at = $2,
                priority = COALESCE($3, priority),
                queue_name = COALESCE($4, queue_name),
                lock = COALESCE($5, lock)
            WHERE id = $1 AND status IN ('running', 'aborting', 'failed', 'pending')
            RETURNING queueing_lock
            "#,
        )
        .bind(id.get())
        .bind(decision.retry_at)
        .bind(decision.priority)
        .bind(&decision.queue)
        .bind(&decision.lock)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_write_error(e, None))?;

        if updated.is_none() {
            tx.rollback().await?;
            return Err(self.transition_error(id, JobStatus::Pending).await);
        }
        insert_event(&mut tx, id.get(), EventType::Scheduled).await?;
        insert_event(&mut tx, id.get(), EventType::DeferredForRetry).await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = id.get()), err)]
    async fn cancel(
        &self,
        id: JobId,
        abort: bool,
        delete: bool,
    ) -> Result<Option<JobId>, StoreError> {
        let mut tx = self.pool.begin().await?;

        if delete {
            let deleted: Option<i64> = sqlx::query_scalar(
                "DELETE FROM spindle_jobs WHERE id = $1 AND status = 'pending' RETURNING id",
            )
            .bind(id.get())
            .fetch_optional(&mut *tx)
            .await?;
            if deleted.is_some() {
                tx.commit().await?;
                return Ok(Some(id));
            }
        }

        let new_status: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE spindle_jobs
            SET status = CASE status WHEN 'pending' THEN 'cancelled' ELSE 'aborting' END
            WHERE id = $1 AND (status = 'pending' OR ($2 AND status = 'running'))
            RETURNING status
            "#,
        )
        .bind(id.get())
        .bind(abort)
        .fetch_optional(&mut *tx)
        .await?;

        let result = match new_status.as_deref() {
            Some("cancelled") => {
                insert_event(&mut tx, id.get(), EventType::Cancelled).await?;
                Some(id)
            }
            Some(_) => Some(id),
            None => None,
        };
        tx.commit().await?;
        Ok(result)
    }

    async fn status(&self, id: JobId) -> Result<Option<JobStatus>, StoreError> {
        self.current_status(id).await
    }

    #[instrument(skip(self), fields(job_id = id.get()), err)]
    async fn set_status(&self, id: JobId, status: JobStatus) -> Result<(), StoreError> {
        let sources: Vec<&str> = JobStatus::ALL
            .into_iter()
            .filter(|from| from.can_transition_to(status))
            .map(JobStatus::as_str)
            .collect();
        let mut tx = self.pool.begin().await?;
        let affected = sqlx::query(
            "UPDATE spindle_jobs SET status = $2 WHERE id = $1 AND status = ANY($3::text[])",
        )
        .bind(id.get())
        .bind(status.as_str())
        .bind(sources)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_write_error(e, None))?
        .rows_affected();

        if affected == 0 {
            tx.rollback().await?;
            return Err(self.transition_error(id, status).await);
        }
        if let Some(kind) = EventType::for_status(status) {
            insert_event(&mut tx, id.get(), kind).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn events(&self, id: JobId) -> Result<Vec<JobEvent>, StoreError> {
        let rows: Vec<(String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT type, at FROM spindle_events WHERE job_id = $1 ORDER BY at, id",
        )
        .bind(id.get())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(kind, at)| {
                EventType::parse(&kind)
                    .map(|kind| JobEvent::new(kind, at))
                    .map_err(|e| StoreError::Corrupt(e.to_string()))
            })
            .collect()
    }

    #[instrument(skip(self), err)]
    async fn stalled(
        &self,
        threshold: Duration,
        queue: Option<&str>,
        task: Option<&str>,
    ) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM spindle_jobs AS jobs
            WHERE jobs.status = 'running'
              AND ($2::text IS NULL OR jobs.queue_name = $2)
              AND ($3::text IS NULL OR jobs.task_name = $3)
              AND (SELECT max(at) FROM spindle_events AS e WHERE e.job_id = jobs.id)
                  < now() - make_interval(secs => $1)
            ORDER BY jobs.id
            "#
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(seconds(threshold))
            .bind(queue)
            .bind(task)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Job::try_from).collect()
    }

    #[instrument(skip(self), err)]
    async fn purge(
        &self,
        retention: Duration,
        queue: Option<&str>,
        statuses: &[JobStatus],
    ) -> Result<u64, StoreError> {
        let statuses: Vec<&str> = statuses
            .iter()
            .filter(|s| s.is_terminal())
            .map(|s| s.as_str())
            .collect();
        let deleted = sqlx::query(
            r#"
            DELETE FROM spindle_jobs AS jobs
            WHERE jobs.status = ANY($1::text[])
              AND ($2::text IS NULL OR jobs.queue_name = $2)
              AND (SELECT max(at) FROM spindle_events AS e WHERE e.job_id = jobs.id)
                  < now() - make_interval(secs => $3)
            "#,
        )
        .bind(statuses)
        .bind(queue)
        .bind(seconds(retention))
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(deleted)
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM spindle_jobs
            WHERE ($1::bigint IS NULL OR id = $1)
              AND ($2::text IS NULL OR queue_name = $2)
              AND ($3::text IS NULL OR task_name = $3)
              AND ($4::text IS NULL OR lock = $4)
              AND ($5::text IS NULL OR status = $5)
            ORDER BY id
            "#
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(filter.id.map(JobId::get))
            .bind(&filter.queue)
            .bind(&filter.task)
            .bind(&filter.lock)
            .bind(filter.status.map(JobStatus::as_str))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Job::try_from).collect()
    }

    async fn stats(
        &self,
        filter: &JobFilter,
        group_by: GroupBy,
    ) -> Result<Vec<GroupStats>, StoreError> {
        let column = group_column(group_by);
        let sql = format!(
            r#"
            SELECT {column} AS name, status, count(*) AS jobs
            FROM spindle_jobs
            WHERE ($1::bigint IS NULL OR id = $1)
              AND ($2::text IS NULL OR queue_name = $2)
              AND ($3::text IS NULL OR task_name = $3)
              AND ($4::text IS NULL OR lock = $4)
              AND ($5::text IS NULL OR status = $5)
            GROUP BY {column}, status
            "#
        );
        let rows: Vec<(Option<String>, String, i64)> = sqlx::query_as(&sql)
            .bind(filter.id.map(JobId::get))
            .bind(&filter.queue)
            .bind(&filter.task)
            .bind(&filter.lock)
            .bind(filter.status.map(JobStatus::as_str))
            .fetch_all(&self.pool)
            .await?;
        fold_stats(rows)
    }

    async fn listen(
        &self,
        signal: WakeSignal,
        channels: Vec<Channel>,
        stop: CancellationToken,
    ) -> Result<(), StoreError> {
        let names: Vec<String> = channels.iter().map(Channel::name).collect();
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener
            .listen_all(names.iter().map(String::as_str))
            .await?;
        tracing::debug!(channels = ?names, "listening for new jobs");

        // 接続直後は取りこぼしがあり得るので一度起こしておく
        signal.notify();

        loop {
            tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                notification = listener.recv() => {
                    let notification = notification?;
                    tracing::trace!(channel = notification.channel(), "job notification");
                    signal.notify();
                }
            }
        }
    }

    async fn check_connection(&self) -> Result<bool, StoreError> {
        let present: bool =
            sqlx::query_scalar("SELECT to_regclass('spindle_jobs') IS NOT NULL")
                .fetch_one(&self.pool)
                .await?;
        Ok(present)
    }
}

async fn insert_event(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    job_id: i64,
    kind: EventType,
) -> Result<(), StoreError> {
    sqlx::query("INSERT INTO spindle_events (job_id, type) VALUES ($1, $2)")
        .bind(job_id)
        .bind(kind.as_str())
        .execute(&mut **tx)
        .await?;
    Ok(())
}
