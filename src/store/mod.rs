use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::error::{DagsError, Result};
use crate::protocol::message::GroupMessage;
use crate::sched::group::{GroupRecord, GroupStatus, JobSlot};
use crate::sched::state::SchedulingState;

/// Durable mirror of groups and jobs. Writes are eventual and idempotent;
/// the scheduler never waits on this store inside a lock.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) the database and verify its schema. A schema
    /// mismatch is fatal: refusing to start beats silently corrupting a
    /// universe file.
    pub async fn open(path: &str) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .map_err(DagsError::Store)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS groups (
                groupid       INTEGER PRIMARY KEY,
                environment   TEXT NOT NULL,
                generation    INTEGER NOT NULL,
                nbjobs        INTEGER NOT NULL,
                distributeenv INTEGER NOT NULL,
                appname       TEXT NOT NULL,
                version       TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS jobs (
                groupid      INTEGER NOT NULL,
                jobid        INTEGER NOT NULL,
                jobdata      TEXT NOT NULL,
                jobscore     TEXT,
                invalidscore INTEGER NOT NULL DEFAULT 0,
                UNIQUE (groupid, jobid)
            )",
        )
        .execute(&pool)
        .await?;

        let store = Self { pool };
        store.verify_schema().await?;
        Ok(store)
    }

    async fn verify_schema(&self) -> Result<()> {
        for (table, expected) in [
            (
                "groups",
                vec![
                    "groupid",
                    "environment",
                    "generation",
                    "nbjobs",
                    "distributeenv",
                    "appname",
                    "version",
                ],
            ),
            (
                "jobs",
                vec!["groupid", "jobid", "jobdata", "jobscore", "invalidscore"],
            ),
        ] {
            let rows = sqlx::query(&format!("PRAGMA table_info({table})"))
                .fetch_all(&self.pool)
                .await?;
            let found: Vec<String> = rows
                .iter()
                .map(|r| r.get::<String, _>("name"))
                .collect();
            for col in &expected {
                if !found.iter().any(|f| f == col) {
                    return Err(DagsError::Schema(format!(
                        "table {table} is missing column {col} (found: {})",
                        found.join(", ")
                    )));
                }
            }
        }
        Ok(())
    }

    /// Wholesale write of a submitted group: the row is upserted and the
    /// job set replaced in one transaction. Jobs awaiting a score are
    /// persisted with a NULL score and the invalid flag raised, which is
    /// exactly what the recovery scan looks for.
    pub async fn replace_group(
        &self,
        msg: &GroupMessage,
        app_name: &str,
        version: &str,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO groups (groupid, environment, generation, nbjobs, distributeenv, appname, version)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (groupid) DO UPDATE SET
                environment = excluded.environment,
                generation = excluded.generation,
                nbjobs = excluded.nbjobs,
                distributeenv = excluded.distributeenv,
                appname = excluded.appname,
                version = excluded.version",
        )
        .bind(msg.group_id)
        .bind(&msg.environment)
        .bind(msg.generation)
        .bind(msg.jobs.len() as i64)
        .bind(msg.distribute_env as i64)
        .bind(app_name)
        .bind(version)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM jobs WHERE groupid = ?")
            .bind(msg.group_id)
            .execute(&mut *tx)
            .await?;
        for job in &msg.jobs {
            let wants_score = job.evaluate && job.score.is_none();
            sqlx::query(
                "INSERT INTO jobs (groupid, jobid, jobdata, jobscore, invalidscore)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(msg.group_id)
            .bind(job.id)
            .bind(job.data.as_deref().unwrap_or_default())
            .bind(if wants_score { None } else { job.score.as_deref() })
            .bind(wants_score as i64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        tracing::debug!(group_id = msg.group_id, jobs = msg.jobs.len(), "group persisted");
        Ok(())
    }

    /// Flush a batch of scores. Replaying the same write is harmless.
    pub async fn write_scores(&self, group_id: i64, scores: &[(i64, String)]) -> Result<()> {
        if scores.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for (job_id, score) in scores {
            sqlx::query(
                "UPDATE jobs SET jobscore = ?, invalidscore = 0 WHERE groupid = ? AND jobid = ?",
            )
            .bind(score)
            .bind(group_id)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        tracing::debug!(group_id, count = scores.len(), "scores flushed to store");
        Ok(())
    }

    pub async fn update_environment(&self, group_id: i64, environment: &str) -> Result<()> {
        sqlx::query("UPDATE groups SET environment = ? WHERE groupid = ?")
            .bind(environment)
            .bind(group_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Job rows of one group, id order.
    pub async fn load_job_rows(&self, group_id: i64) -> Result<Vec<JobSlot>> {
        let rows = sqlx::query(
            "SELECT jobdata, jobscore, invalidscore FROM jobs
             WHERE groupid = ? ORDER BY jobid",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| {
                let score: Option<String> = r.get("jobscore");
                let invalid: i64 = r.get("invalidscore");
                let needs = score.is_none() || invalid != 0;
                JobSlot {
                    data: r.get("jobdata"),
                    score: if needs { None } else { score },
                    needs_score: needs,
                }
            })
            .collect())
    }

    /// Ids whose scores never made it to disk; the recovery set.
    pub async fn unscored_ids(&self, group_id: i64) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT jobid FROM jobs
             WHERE groupid = ? AND (jobscore IS NULL OR invalidscore != 0)
             ORDER BY jobid",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get::<i64, _>("jobid")).collect())
    }

    /// Rebuild the scheduling state from disk. Jobs whose scores were not
    /// durably written re-enter the evaluation pool. Under `memory_short`
    /// only bookkeeping is loaded; job payloads page in on demand.
    pub async fn load_into(&self, state: &SchedulingState, memory_short: bool) -> Result<usize> {
        let groups = sqlx::query(
            "SELECT groupid, environment, generation, nbjobs, distributeenv, appname, version
             FROM groups ORDER BY groupid",
        )
        .fetch_all(&self.pool)
        .await?;
        let count = groups.len();

        for row in groups {
            let group_id: i64 = row.get("groupid");
            let need_ids = self.unscored_ids(group_id).await?;
            let jobs = if memory_short {
                None
            } else {
                Some(self.load_job_rows(group_id).await?)
            };
            let job_count = row.get::<i64, _>("nbjobs") as usize;
            let status = if need_ids.is_empty() {
                GroupStatus::Ready
            } else {
                GroupStatus::ReadyForEval
            };
            let meta = GroupRecord {
                id: group_id,
                app_name: row.get("appname"),
                generation: row.get("generation"),
                environment: row.get("environment"),
                distribute_env: row.get::<i64, _>("distributeenv") != 0,
                status,
                counter: 0,
                last_dispatch: None,
                job_count,
                score_needed: need_ids.len(),
                version: row.get("version"),
            };
            tracing::info!(
                group_id,
                generation = meta.generation,
                job_count,
                recovering = need_ids.len(),
                status = %status,
                "group loaded from store"
            );
            state.install_loaded_group(meta, jobs, &need_ids);
        }
        Ok(count)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
