// SPDX-License-Identifier: MIT

use crate::error::{StorageError, StorageResult};
use crate::row::StepRow;
use crate::Storage;
use chrono::{DateTime, Utc};
use durably_core::{RunId, Step, StepStatus};
use serde_json::Value;

const STEP_COLUMNS: &str =
    "run_id, name, idx, status, output, error, started_at, completed_at";

impl Storage {
    /// `findStep(run_id, name)` (spec §4.B): called on every `step.run`
    /// invocation to decide whether to replay or execute.
    pub async fn find_step(&self, run_id: RunId, name: &str) -> StorageResult<Option<Step>> {
        let row = sqlx::query_as::<_, StepRow>(&format!(
            "SELECT {STEP_COLUMNS} FROM durably_steps WHERE run_id = ? AND name = ?"
        ))
        .bind(run_id.as_str())
        .bind(name)
        .fetch_optional(self.pool.as_ref())
        .await
        .map_err(StorageError::Transient)?;
        row.map(Step::try_from).transpose()
    }

    /// All completed/failed Steps for a Run, in execution order — used to
    /// build the replay snapshot at executor startup (spec §4.D).
    pub async fn list_steps(&self, run_id: RunId) -> StorageResult<Vec<Step>> {
        let rows: Vec<StepRow> = sqlx::query_as(&format!(
            "SELECT {STEP_COLUMNS} FROM durably_steps WHERE run_id = ? ORDER BY idx ASC"
        ))
        .bind(run_id.as_str())
        .fetch_all(self.pool.as_ref())
        .await
        .map_err(StorageError::Transient)?;
        rows.into_iter().map(Step::try_from).collect()
    }

    /// `insertStep` (spec §4.B). `(run_id, name)` is unique; this is the
    /// only write for a Step — rows are never updated after insertion.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_step(
        &self,
        run_id: RunId,
        name: &str,
        index: i64,
        status: StepStatus,
        output: Option<Value>,
        error: Option<&str>,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let output_json = output
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StorageError::Corrupt(e.to_string()))?;

        sqlx::query(
            r#"
INSERT INTO durably_steps (run_id, name, idx, status, output, error, started_at, completed_at)
VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(run_id.as_str())
        .bind(name)
        .bind(index)
        .bind(status.as_str())
        .bind(output_json)
        .bind(error)
        .bind(started_at.to_rfc3339())
        .bind(completed_at.to_rfc3339())
        .execute(self.pool.as_ref())
        .await
        .map_err(StorageError::Transient)?;
        Ok(())
    }

    /// Best-effort progress update (spec §4.D: "NOT transactional with step
    /// writes"). Silently a no-op if the Run no longer exists.
    pub async fn update_progress(
        &self,
        run_id: RunId,
        current: f64,
        total: Option<f64>,
        message: Option<&str>,
    ) -> StorageResult<()> {
        sqlx::query(
            r#"
UPDATE durably_runs
SET progress_current = ?, progress_total = ?, progress_message = ?
WHERE id = ?
            "#,
        )
        .bind(current)
        .bind(total)
        .bind(message)
        .bind(run_id.as_str())
        .execute(self.pool.as_ref())
        .await
        .map_err(StorageError::Transient)?;
        Ok(())
    }
}
