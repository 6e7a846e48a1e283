// SPDX-License-Identifier: MIT

//! The `Step` entity (spec §3): one row per successful (or failed)
//! `step.run(name, fn)` invocation.

use crate::run::RunId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "completed" => StepStatus::Completed,
            "failed" => StepStatus::Failed,
            _ => return None,
        })
    }
}

/// A persisted Step row (spec §3 `Step`). Append-only: `(run_id, name)` is
/// unique and, once written, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub run_id: RunId,
    pub name: String,
    pub index: i64,
    pub status: StepStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// The in-memory replay cache built once at executor startup (spec §4.D,
/// §9 "Step output cache" redesign note): `name -> output` for every
/// already-completed step of the current Run.
#[derive(Debug, Clone, Default)]
pub struct StepSnapshot {
    completed: std::collections::HashMap<String, Value>,
}

impl StepSnapshot {
    pub fn from_steps(steps: impl IntoIterator<Item = Step>) -> Self {
        let mut completed = std::collections::HashMap::new();
        for step in steps {
            if step.status == StepStatus::Completed {
                completed.insert(step.name, step.output.unwrap_or(Value::Null));
            }
        }
        Self { completed }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.completed.get(name)
    }

    pub fn insert(&mut self, name: String, output: Value) {
        self.completed.insert(name, output);
    }

    pub fn len(&self) -> usize {
        self.completed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
    }
}

#[cfg(test)]
#[path = "step_tests.rs"]
mod tests;
