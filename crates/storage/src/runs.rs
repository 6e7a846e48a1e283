// SPDX-License-Identifier: MIT

use crate::error::{StorageError, StorageResult};
use crate::row::RunRow;
use crate::Storage;
use chrono::{DateTime, Utc};
use durably_core::{Run, RunFilter, RunId, RunStatus, TriggerOptions};
use serde_json::Value;
use sqlx::Row;

const RUN_COLUMNS: &str = r#"
    id, job_name, status, payload, output, error, idempotency_key,
    concurrency_key, progress_current, progress_total, progress_message,
    heartbeat_at, created_at, started_at, completed_at, step_count
"#;

impl Storage {
    /// Insert a new Run. If `options.idempotency_key` collides on
    /// `(job_name, key)`, returns the existing Run without inserting.
    ///
    /// The `bool` reports whether this call actually inserted a new row
    /// (`false` means an idempotency-key collision returned a pre-existing
    /// Run) — the caller's only reliable way to tell "we created it" from
    /// "we found it" without guessing from timestamps, mirroring
    /// [`insert_runs_batch`](Self::insert_runs_batch)'s `Vec<(Run, bool)>`.
    pub async fn insert_run(
        &self,
        job_name: &str,
        payload: Value,
        options: &TriggerOptions,
        now: DateTime<Utc>,
    ) -> StorageResult<(Run, bool)> {
        if let Some(key) = options.idempotency_key.as_deref() {
            if let Some(existing) = self.find_by_idempotency_key(job_name, key).await? {
                return Ok((existing, false));
            }
        }

        let id = RunId::new();
        let payload_json =
            serde_json::to_string(&payload).map_err(|e| StorageError::Corrupt(e.to_string()))?;
        let now_str = now.to_rfc3339();

        let result = sqlx::query(
            r#"
INSERT INTO durably_runs (
    id, job_name, status, payload, output, error, idempotency_key,
    concurrency_key, progress_current, progress_total, progress_message,
    heartbeat_at, created_at, started_at, completed_at, step_count
) VALUES (?, ?, ?, ?, NULL, NULL, ?, ?, NULL, NULL, NULL, NULL, ?, NULL, NULL, 0)
            "#,
        )
        .bind(id.as_str())
        .bind(job_name)
        .bind(RunStatus::Pending.as_str())
        .bind(&payload_json)
        .bind(options.idempotency_key.as_deref())
        .bind(options.concurrency_key.as_deref())
        .bind(&now_str)
        .execute(self.pool.as_ref())
        .await;

        match result {
            Ok(_) => {}
            Err(e) => {
                let key = options.idempotency_key.as_deref().unwrap_or_default();
                let classified = StorageError::from_sqlx(e, job_name, key);
                if let StorageError::DuplicateIdempotencyKey { .. } = classified {
                    // Lost a race against a concurrent insert with the same key.
                    if let Some(existing) = self.find_by_idempotency_key(job_name, key).await? {
                        return Ok((existing, false));
                    }
                }
                return Err(classified);
            }
        }

        let run = self
            .get_run(id)
            .await?
            .ok_or_else(|| StorageError::Corrupt(format!("run {id} vanished after insert")))?;
        Ok((run, true))
    }

    /// `batchTrigger(items)` (spec §4.G): every item inserted inside one
    /// transaction. Returns each Run alongside whether it was freshly
    /// inserted (`false` means an idempotency-key collision returned a
    /// pre-existing Run) so the caller knows which ones to emit
    /// `run:trigger` events for.
    pub async fn insert_runs_batch(
        &self,
        items: &[(String, Value, TriggerOptions)],
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<(Run, bool)>> {
        let mut tx = self.pool.begin().await.map_err(StorageError::Transient)?;
        let mut results = Vec::with_capacity(items.len());

        for (job_name, payload, options) in items {
            if let Some(key) = options.idempotency_key.as_deref() {
                let existing = Self::find_by_idempotency_key_tx(&mut tx, job_name, key).await?;
                if let Some(existing) = existing {
                    results.push((existing, false));
                    continue;
                }
            }

            let id = RunId::new();
            let payload_json = serde_json::to_string(payload)
                .map_err(|e| StorageError::Corrupt(e.to_string()))?;
            let now_str = now.to_rfc3339();

            sqlx::query(
                r#"
INSERT INTO durably_runs (
    id, job_name, status, payload, output, error, idempotency_key,
    concurrency_key, progress_current, progress_total, progress_message,
    heartbeat_at, created_at, started_at, completed_at, step_count
) VALUES (?, ?, ?, ?, NULL, NULL, ?, ?, NULL, NULL, NULL, NULL, ?, NULL, NULL, 0)
                "#,
            )
            .bind(id.as_str())
            .bind(job_name)
            .bind(RunStatus::Pending.as_str())
            .bind(&payload_json)
            .bind(options.idempotency_key.as_deref())
            .bind(options.concurrency_key.as_deref())
            .bind(&now_str)
            // Unlike `insert_run`, a unique-constraint loss here is not
            // retried against a concurrent writer — the pre-check above
            // already ran inside this same transaction, and an external
            // racing insert landing between that check and this one is a
            // narrow enough window to accept as a hard error for a batch.
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::from_sqlx(e, job_name, options.idempotency_key.as_deref().unwrap_or_default()))?;

            let row: RunRow = sqlx::query_as(&format!(
                "SELECT {RUN_COLUMNS} FROM durably_runs WHERE id = ?"
            ))
            .bind(id.as_str())
            .fetch_one(&mut *tx)
            .await
            .map_err(StorageError::Transient)?;
            results.push((Run::try_from(row)?, true));
        }

        tx.commit().await.map_err(StorageError::Transient)?;
        Ok(results)
    }

    async fn find_by_idempotency_key_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        job_name: &str,
        key: &str,
    ) -> StorageResult<Option<Run>> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM durably_runs WHERE job_name = ? AND idempotency_key = ?"
        ))
        .bind(job_name)
        .bind(key)
        .fetch_optional(&mut **tx)
        .await
        .map_err(StorageError::Transient)?;
        row.map(Run::try_from).transpose()
    }

    async fn find_by_idempotency_key(
        &self,
        job_name: &str,
        key: &str,
    ) -> StorageResult<Option<Run>> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM durably_runs WHERE job_name = ? AND idempotency_key = ?"
        ))
        .bind(job_name)
        .bind(key)
        .fetch_optional(self.pool.as_ref())
        .await
        .map_err(StorageError::Transient)?;
        row.map(Run::try_from).transpose()
    }

    pub async fn get_run(&self, run_id: RunId) -> StorageResult<Option<Run>> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM durably_runs WHERE id = ?"
        ))
        .bind(run_id.as_str())
        .fetch_optional(self.pool.as_ref())
        .await
        .map_err(StorageError::Transient)?;
        row.map(Run::try_from).transpose()
    }

    /// `getRuns(filter)` (spec §4.B): stable pagination ordered by
    /// `created_at DESC, id DESC`.
    pub async fn get_runs(&self, filter: &RunFilter) -> StorageResult<Vec<Run>> {
        let mut builder = sqlx::QueryBuilder::<sqlx::Sqlite>::new(format!(
            "SELECT {RUN_COLUMNS} FROM durably_runs WHERE 1 = 1"
        ));
        if let Some(job_name) = filter.job_name.as_deref() {
            builder.push(" AND job_name = ");
            builder.push_bind(job_name.to_string());
        }
        if let Some(status) = filter.status {
            builder.push(" AND status = ");
            builder.push_bind(status.as_str());
        }
        builder.push(" ORDER BY created_at DESC, id DESC");
        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ");
            builder.push_bind(limit);
        }
        if let Some(offset) = filter.offset {
            builder.push(" OFFSET ");
            builder.push_bind(offset);
        }

        let rows: Vec<RunRow> = builder
            .build_query_as()
            .fetch_all(self.pool.as_ref())
            .await
            .map_err(StorageError::Transient)?;
        rows.into_iter().map(Run::try_from).collect()
    }

    /// `claimNextPending` (spec §4.B): atomically selects and claims one
    /// eligible Run inside a single `BEGIN IMMEDIATE` transaction so two
    /// concurrent pollers cannot both claim the same row.
    pub async fn claim_next_pending(&self, now: DateTime<Utc>) -> StorageResult<Option<Run>> {
        let mut tx = self
            .pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(StorageError::Transient)?;

        let candidate: Option<(String,)> = sqlx::query_as(
            r#"
SELECT id FROM durably_runs
WHERE status = 'pending'
  AND (
      concurrency_key IS NULL
      OR NOT EXISTS (
          SELECT 1 FROM durably_runs other
          WHERE other.concurrency_key = durably_runs.concurrency_key
            AND other.status = 'running'
      )
  )
ORDER BY created_at ASC, id ASC
LIMIT 1
            "#,
        )
        .fetch_optional(&mut *tx)
        .await
        .map_err(StorageError::Transient)?;

        let Some((id,)) = candidate else {
            tx.commit().await.map_err(StorageError::Transient)?;
            return Ok(None);
        };

        let now_str = now.to_rfc3339();
        let updated = sqlx::query(
            r#"
UPDATE durably_runs
SET status = 'running', started_at = ?, heartbeat_at = ?
WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(&now_str)
        .bind(&now_str)
        .bind(&id)
        .execute(&mut *tx)
        .await
        .map_err(StorageError::Transient)?;

        if updated.rows_affected() == 0 {
            // Lost the race to another claimant within the same
            // transaction window; nothing to claim this tick.
            tx.commit().await.map_err(StorageError::Transient)?;
            return Ok(None);
        }

        let row: RunRow = sqlx::query_as(&format!(
            "SELECT {RUN_COLUMNS} FROM durably_runs WHERE id = ?"
        ))
        .bind(&id)
        .fetch_one(&mut *tx)
        .await
        .map_err(StorageError::Transient)?;

        tx.commit().await.map_err(StorageError::Transient)?;
        Run::try_from(row).map(Some)
    }

    /// Returns whether the row was updated, i.e. the Run is still
    /// `running` (used by the worker's heartbeat ticker to detect that a
    /// cancellation has taken the run out from under it).
    pub async fn heartbeat(&self, run_id: RunId, now: DateTime<Utc>) -> StorageResult<bool> {
        let result = sqlx::query(
            "UPDATE durably_runs SET heartbeat_at = ? WHERE id = ? AND status = 'running'",
        )
        .bind(now.to_rfc3339())
        .bind(run_id.as_str())
        .execute(self.pool.as_ref())
        .await
        .map_err(StorageError::Transient)?;
        Ok(result.rows_affected() > 0)
    }

    /// `recoverStale` (spec §4.B): resets timed-out `running` Runs back to
    /// `pending` so a crashed worker's claims are eventually retried.
    pub async fn recover_stale(&self, stale_before: DateTime<Utc>) -> StorageResult<u64> {
        let result = sqlx::query(
            r#"
UPDATE durably_runs
SET status = 'pending', started_at = NULL, heartbeat_at = NULL
WHERE status = 'running' AND heartbeat_at < ?
            "#,
        )
        .bind(stale_before.to_rfc3339())
        .execute(self.pool.as_ref())
        .await
        .map_err(StorageError::Transient)?;
        Ok(result.rows_affected())
    }

    pub async fn complete_run(
        &self,
        run_id: RunId,
        output: Value,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        let output_json =
            serde_json::to_string(&output).map_err(|e| StorageError::Corrupt(e.to_string()))?;
        self.terminal_transition(
            run_id,
            &["running"],
            RunStatus::Completed,
            "complete",
            |q| {
                q.push(", output = ")
                    .push_bind(output_json)
                    .push(", completed_at = ")
                    .push_bind(now.to_rfc3339());
            },
        )
        .await
    }

    pub async fn fail_run(
        &self,
        run_id: RunId,
        error: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.terminal_transition(
            run_id,
            &["running"],
            RunStatus::Failed,
            "fail",
            |q| {
                q.push(", error = ")
                    .push_bind(error.to_string())
                    .push(", completed_at = ")
                    .push_bind(now.to_rfc3339());
            },
        )
        .await
    }

    pub async fn cancel_run(&self, run_id: RunId, now: DateTime<Utc>) -> StorageResult<()> {
        self.terminal_transition(
            run_id,
            &["pending", "running"],
            RunStatus::Cancelled,
            "cancel",
            |q| {
                q.push(", completed_at = ").push_bind(now.to_rfc3339());
            },
        )
        .await
    }

    /// `retryRun` (spec §4.B): requires `failed|cancelled`, transitions back
    /// to `pending` and clears `error`. Completed Step rows are untouched —
    /// they are exactly what makes the replay on the next claim meaningful.
    /// Failed Step rows are deleted in the same transaction: `(run_id, name)`
    /// is a bare unique key with no upsert handling in `insert_step`, so
    /// leaving a failed row behind would make the re-executed step's insert
    /// collide with it on the next attempt.
    pub async fn retry_run(&self, run_id: RunId) -> StorageResult<()> {
        let mut tx = self.pool.begin().await.map_err(StorageError::Transient)?;

        let result = sqlx::query(
            r#"
UPDATE durably_runs
SET status = 'pending', error = NULL, started_at = NULL, heartbeat_at = NULL, completed_at = NULL
WHERE id = ? AND status IN ('failed', 'cancelled')
            "#,
        )
        .bind(run_id.as_str())
        .execute(&mut *tx)
        .await
        .map_err(StorageError::Transient)?;

        if result.rows_affected() == 0 {
            drop(tx);
            return self.invalid_transition_error(run_id, "retry").await;
        }

        sqlx::query("DELETE FROM durably_steps WHERE run_id = ? AND status = 'failed'")
            .bind(run_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(StorageError::Transient)?;

        tx.commit().await.map_err(StorageError::Transient)?;
        Ok(())
    }

    /// `deleteRun` (spec §4.B): requires a terminal status; cascades to
    /// Steps and Logs.
    pub async fn delete_run(&self, run_id: RunId) -> StorageResult<()> {
        let mut tx = self.pool.begin().await.map_err(StorageError::Transient)?;

        let status: Option<(String,)> =
            sqlx::query_as("SELECT status FROM durably_runs WHERE id = ?")
                .bind(run_id.as_str())
                .fetch_optional(&mut *tx)
                .await
                .map_err(StorageError::Transient)?;

        let Some((status,)) = status else {
            return Err(StorageError::NotFound(run_id));
        };

        if RunStatus::from_str(&status).map(|s| !s.is_terminal()).unwrap_or(true) {
            return Err(StorageError::InvalidTransition {
                run_id,
                from: status,
                attempted: "delete",
            });
        }

        sqlx::query("DELETE FROM durably_logs WHERE run_id = ?")
            .bind(run_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(StorageError::Transient)?;
        sqlx::query("DELETE FROM durably_steps WHERE run_id = ?")
            .bind(run_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(StorageError::Transient)?;
        sqlx::query("DELETE FROM durably_runs WHERE id = ?")
            .bind(run_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(StorageError::Transient)?;

        tx.commit().await.map_err(StorageError::Transient)?;
        Ok(())
    }

    /// Shared guarded-transition helper for `completeRun`/`failRun`/`cancelRun`:
    /// `UPDATE ... WHERE id = ? AND status IN (from_statuses)`; zero rows
    /// affected means the transition wasn't legal from the row's current
    /// status, so it fails with `invalid_transition`.
    async fn terminal_transition(
        &self,
        run_id: RunId,
        from_statuses: &[&str],
        to: RunStatus,
        attempted: &'static str,
        extra: impl FnOnce(&mut sqlx::QueryBuilder<'_, sqlx::Sqlite>),
    ) -> StorageResult<()> {
        let mut builder =
            sqlx::QueryBuilder::<sqlx::Sqlite>::new("UPDATE durably_runs SET status = ");
        builder.push_bind(to.as_str());
        extra(&mut builder);
        builder.push(" WHERE id = ");
        builder.push_bind(run_id.as_str());
        builder.push(" AND status IN (");
        let mut separated = builder.separated(", ");
        for status in from_statuses {
            separated.push_bind(*status);
        }
        builder.push(")");

        let result = builder
            .build()
            .execute(self.pool.as_ref())
            .await
            .map_err(StorageError::Transient)?;

        if result.rows_affected() == 0 {
            return self.invalid_transition_error(run_id, attempted).await;
        }
        Ok(())
    }

    async fn invalid_transition_error<T>(
        &self,
        run_id: RunId,
        attempted: &'static str,
    ) -> StorageResult<T> {
        let row = sqlx::query("SELECT status FROM durably_runs WHERE id = ?")
            .bind(run_id.as_str())
            .fetch_optional(self.pool.as_ref())
            .await
            .map_err(StorageError::Transient)?;
        match row {
            Some(row) => {
                let from: String = row
                    .try_get("status")
                    .map_err(StorageError::Transient)?;
                Err(StorageError::InvalidTransition {
                    run_id,
                    from,
                    attempted,
                })
            }
            None => Err(StorageError::NotFound(run_id)),
        }
    }
}
