// SPDX-License-Identifier: MIT

//! Raw `sqlx::FromRow` row shapes and their conversion into the public
//! `durably-core` entities. SQLite has no native timestamp or JSON type, so
//! everything crosses the boundary as TEXT and is parsed here.

use crate::error::{StorageError, StorageResult};
use crate::LogRecord;
use chrono::{DateTime, Utc};
use durably_core::{LogLevel, Progress, Run, RunId, RunStatus, Step, StepStatus};
use serde_json::Value;

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct RunRow {
    pub id: String,
    pub job_name: String,
    pub status: String,
    pub payload: String,
    pub output: Option<String>,
    pub error: Option<String>,
    pub idempotency_key: Option<String>,
    pub concurrency_key: Option<String>,
    pub progress_current: Option<f64>,
    pub progress_total: Option<f64>,
    pub progress_message: Option<String>,
    pub heartbeat_at: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub step_count: i64,
}

impl TryFrom<RunRow> for Run {
    type Error = StorageError;

    fn try_from(row: RunRow) -> StorageResult<Self> {
        let status = RunStatus::from_str(&row.status)
            .ok_or_else(|| StorageError::Corrupt(format!("unknown run status {:?}", row.status)))?;
        let progress = row.progress_current.map(|current| Progress {
            current,
            total: row.progress_total,
            message: row.progress_message,
        });
        Ok(Run {
            id: RunId::from_string(row.id),
            job_name: row.job_name,
            status,
            payload: parse_json(&row.payload)?,
            output: row.output.as_deref().map(parse_json).transpose()?,
            error: row.error,
            idempotency_key: row.idempotency_key,
            concurrency_key: row.concurrency_key,
            progress,
            heartbeat_at: row.heartbeat_at.as_deref().map(parse_timestamp).transpose()?,
            created_at: parse_timestamp(&row.created_at)?,
            started_at: row.started_at.as_deref().map(parse_timestamp).transpose()?,
            completed_at: row.completed_at.as_deref().map(parse_timestamp).transpose()?,
            step_count: row.step_count,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct StepRow {
    pub run_id: String,
    pub name: String,
    pub idx: i64,
    pub status: String,
    pub output: Option<String>,
    pub error: Option<String>,
    pub started_at: String,
    pub completed_at: String,
}

impl TryFrom<StepRow> for Step {
    type Error = StorageError;

    fn try_from(row: StepRow) -> StorageResult<Self> {
        let status = StepStatus::from_str(&row.status)
            .ok_or_else(|| StorageError::Corrupt(format!("unknown step status {:?}", row.status)))?;
        Ok(Step {
            run_id: RunId::from_string(row.run_id),
            name: row.name,
            index: row.idx,
            status,
            output: row.output.as_deref().map(parse_json).transpose()?,
            error: row.error,
            started_at: parse_timestamp(&row.started_at)?,
            completed_at: parse_timestamp(&row.completed_at)?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct LogRow {
    pub id: i64,
    pub run_id: String,
    pub step_name: Option<String>,
    pub level: String,
    pub message: String,
    pub data: String,
    pub created_at: String,
}

impl TryFrom<LogRow> for LogRecord {
    type Error = StorageError;

    fn try_from(row: LogRow) -> StorageResult<Self> {
        let level = match row.level.as_str() {
            "info" => LogLevel::Info,
            "warn" => LogLevel::Warn,
            "error" => LogLevel::Error,
            other => return Err(StorageError::Corrupt(format!("unknown log level {other:?}"))),
        };
        Ok(LogRecord {
            id: row.id,
            run_id: RunId::from_string(row.run_id),
            step_name: row.step_name,
            level,
            message: row.message,
            data: parse_json(&row.data)?,
            created_at: parse_timestamp(&row.created_at)?,
        })
    }
}

pub(crate) fn parse_json(raw: &str) -> StorageResult<Value> {
    serde_json::from_str(raw).map_err(|e| StorageError::Corrupt(format!("invalid JSON: {e}")))
}

pub(crate) fn parse_timestamp(raw: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt(format!("invalid timestamp {raw:?}: {e}")))
}
