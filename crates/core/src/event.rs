// SPDX-License-Identifier: MIT

//! Event bus payloads (spec §4.C). These are the stable contract consumed
//! by `durably-bus`'s subscribers, the subscription stream (spec §4.H),
//! and (outside this core) any HTTP/SSE transport.

use crate::run::{Progress, RunId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One event plus the monotonically increasing sequence number the bus
/// assigned it at publish time (spec §4.C "Events carry a monotonically
/// increasing per-process sequence for subscription replay").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub sequence: u64,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    #[serde(rename = "run:trigger")]
    RunTrigger {
        run_id: RunId,
        job_name: String,
        payload: Value,
    },

    #[serde(rename = "run:start")]
    RunStart {
        run_id: RunId,
        job_name: String,
        payload: Value,
    },

    #[serde(rename = "run:complete")]
    RunComplete {
        run_id: RunId,
        job_name: String,
        output: Value,
        duration_ms: u64,
    },

    #[serde(rename = "run:fail")]
    RunFail {
        run_id: RunId,
        job_name: String,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failed_step_name: Option<String>,
    },

    #[serde(rename = "run:cancel")]
    RunCancel { run_id: RunId, job_name: String },

    #[serde(rename = "run:retry")]
    RunRetry { run_id: RunId, job_name: String },

    #[serde(rename = "run:progress")]
    RunProgress {
        run_id: RunId,
        #[serde(flatten)]
        progress: Progress,
    },

    #[serde(rename = "step:start")]
    StepStart {
        run_id: RunId,
        step_name: String,
        index: i64,
    },

    #[serde(rename = "step:complete")]
    StepComplete {
        run_id: RunId,
        step_name: String,
        index: i64,
        output: Value,
    },

    #[serde(rename = "step:fail")]
    StepFail {
        run_id: RunId,
        step_name: String,
        index: i64,
        error: String,
    },

    #[serde(rename = "log:write")]
    LogWrite {
        run_id: RunId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step_name: Option<String>,
        level: LogLevel,
        message: String,
        #[serde(default)]
        data: Value,
    },

    #[serde(rename = "worker:error")]
    WorkerError { error: String, context: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl EventKind {
    /// Name used in `worker:error` context strings and tracing fields.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::RunTrigger { .. } => "run:trigger",
            EventKind::RunStart { .. } => "run:start",
            EventKind::RunComplete { .. } => "run:complete",
            EventKind::RunFail { .. } => "run:fail",
            EventKind::RunCancel { .. } => "run:cancel",
            EventKind::RunRetry { .. } => "run:retry",
            EventKind::RunProgress { .. } => "run:progress",
            EventKind::StepStart { .. } => "step:start",
            EventKind::StepComplete { .. } => "step:complete",
            EventKind::StepFail { .. } => "step:fail",
            EventKind::LogWrite { .. } => "log:write",
            EventKind::WorkerError { .. } => "worker:error",
        }
    }

    /// The Run this event pertains to, if any (`worker:error` has none —
    /// it is a worker-infrastructure event, not tied to one run).
    pub fn run_id(&self) -> Option<RunId> {
        match self {
            EventKind::RunTrigger { run_id, .. }
            | EventKind::RunStart { run_id, .. }
            | EventKind::RunComplete { run_id, .. }
            | EventKind::RunFail { run_id, .. }
            | EventKind::RunCancel { run_id, .. }
            | EventKind::RunRetry { run_id, .. }
            | EventKind::RunProgress { run_id, .. }
            | EventKind::StepStart { run_id, .. }
            | EventKind::StepComplete { run_id, .. }
            | EventKind::StepFail { run_id, .. }
            | EventKind::LogWrite { run_id, .. } => Some(*run_id),
            EventKind::WorkerError { .. } => None,
        }
    }

    /// True for the three events that close a Run's subscription stream
    /// (spec §4.H).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::RunComplete { .. } | EventKind::RunFail { .. } | EventKind::RunCancel { .. }
        )
    }
}

#[cfg(test)]
#[path = "event_tests.rs"]
mod tests;
