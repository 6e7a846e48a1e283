// SPDX-License-Identifier: MIT

use crate::error::{StorageError, StorageResult};
use crate::Storage;
use chrono::{DateTime, Utc};
use durably_core::{LogLevel, RunId};
use serde_json::Value;

impl Storage {
    /// Persist one `log:write` event. Spec §4.D: "Persistence to
    /// `durably_logs` is optional and performed by an observer if enabled" —
    /// the bus always emits the event regardless of whether this is called.
    pub async fn insert_log(
        &self,
        run_id: RunId,
        step_name: Option<&str>,
        level: LogLevel,
        message: &str,
        data: &Value,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        let level_str = match level {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        let data_json =
            serde_json::to_string(data).map_err(|e| StorageError::Corrupt(e.to_string()))?;

        sqlx::query(
            r#"
INSERT INTO durably_logs (run_id, step_name, level, message, data, created_at)
VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(run_id.as_str())
        .bind(step_name)
        .bind(level_str)
        .bind(message)
        .bind(data_json)
        .bind(now.to_rfc3339())
        .execute(self.pool.as_ref())
        .await
        .map_err(StorageError::Transient)?;
        Ok(())
    }

    pub async fn list_logs(&self, run_id: RunId) -> StorageResult<Vec<crate::LogRecord>> {
        let rows = sqlx::query_as::<_, crate::row::LogRow>(
            r#"
SELECT id, run_id, step_name, level, message, data, created_at
FROM durably_logs
WHERE run_id = ?
ORDER BY id ASC
            "#,
        )
        .bind(run_id.as_str())
        .fetch_all(self.pool.as_ref())
        .await
        .map_err(StorageError::Transient)?;
        rows.into_iter().map(crate::LogRecord::try_from).collect()
    }
}
