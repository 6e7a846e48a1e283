// SPDX-License-Identifier: MIT

//! The `Run` entity (spec §3) and its state machine (spec §4.F).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

crate::define_id! {
    /// Unique identifier for a single invocation of a Job.
    pub struct RunId("run_");
}

/// Status of a [`Run`]. See spec §4.F for the full transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

crate::simple_display! {
    RunStatus {
        Pending => "pending",
        Running => "running",
        Completed => "completed",
        Failed => "failed",
        Cancelled => "cancelled",
    }
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => RunStatus::Pending,
            "running" => RunStatus::Running,
            "completed" => RunStatus::Completed,
            "failed" => RunStatus::Failed,
            "cancelled" => RunStatus::Cancelled,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// Coarse progress report (spec §4.D `progress`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub current: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Options accepted by [`trigger`](crate) when creating a new [`Run`].
#[derive(Debug, Clone, Default)]
pub struct TriggerOptions {
    pub idempotency_key: Option<String>,
    pub concurrency_key: Option<String>,
}

/// A single invocation of a registered Job (spec §3 `Run`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub job_name: String,
    pub status: RunStatus,
    pub payload: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub idempotency_key: Option<String>,
    pub concurrency_key: Option<String>,
    pub progress: Option<Progress>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub step_count: i64,
}

impl Run {
    /// `output ≠ null` iff `status = completed`; `error ≠ null` iff `status = failed`
    /// (spec §3 invariants). Debug-only: storage is the real enforcement point.
    pub fn debug_assert_invariants(&self) {
        debug_assert!(
            (self.status == RunStatus::Completed) == self.output.is_some(),
            "run {}: output presence must match status=completed",
            self.id
        );
        debug_assert!(
            (self.status == RunStatus::Failed) == self.error.is_some(),
            "run {}: error presence must match status=failed",
            self.id
        );
    }
}

crate::builder! {
    pub struct RunBuilder => Run {
        into {
            id: RunId = RunId::new(),
            job_name: String = "test-job",
        }
        set {
            status: RunStatus = RunStatus::Pending,
            payload: Value = Value::Null,
            output: Option<Value> = None,
            error: Option<String> = None,
            idempotency_key: Option<String> = None,
            concurrency_key: Option<String> = None,
            progress: Option<Progress> = None,
            heartbeat_at: Option<DateTime<Utc>> = None,
            created_at: DateTime<Utc> = Utc::now(),
            started_at: Option<DateTime<Utc>> = None,
            completed_at: Option<DateTime<Utc>> = None,
            step_count: i64 = 0,
        }
    }
}

/// Filter accepted by `Storage::get_runs` / `Durably::get_runs` (spec §4.B).
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub job_name: Option<String>,
    pub status: Option<RunStatus>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[cfg(test)]
#[path = "run_tests.rs"]
mod tests;
