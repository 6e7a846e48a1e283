// SPDX-License-Identifier: MIT

//! The Run Executor (spec §4.E): drives one claimed Run from `running` to
//! a terminal state.

use crate::context::StepContext;
use crate::job::{ErasedJob, Job};
use chrono::Utc;
use durably_bus::EventBus;
use durably_core::{Clock, DurablyError, EventKind, Run, StepSnapshot};
use durably_storage::Storage;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// What happened to a claimed Run after one pass through the executor.
/// Distinct from [`DurablyError`]: this is the Worker-facing summary, not
/// the raw handler error (spec §4.E point 5 / §4.F step 5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed,
    Cancelled,
    /// Executor-level failure (e.g. storage unreachable). Not a Run
    /// failure — the Run stays `running` and is recovered by
    /// `recover_stale` once its heartbeat lapses (spec §4.E, last
    /// paragraph).
    TransientError,
}

pub struct RunExecutor<C: Clock> {
    storage: Arc<Storage>,
    bus: Arc<EventBus>,
    clock: C,
}

impl<C: Clock> RunExecutor<C> {
    pub fn new(storage: Arc<Storage>, bus: Arc<EventBus>, clock: C) -> Self {
        Self { storage, bus, clock }
    }

    /// Drive `run` (already `claimed`/`running`) to completion using `job`.
    pub async fn drive(&self, run: &Run, job: &Job<C>) -> RunOutcome {
        let steps = match self.storage.list_steps(run.id).await {
            Ok(steps) => steps,
            Err(e) => {
                self.worker_error(e.to_string(), "load_steps");
                return RunOutcome::TransientError;
            }
        };
        let mut replayed_indices = HashMap::with_capacity(steps.len());
        let mut next_index = 0i64;
        for step in &steps {
            replayed_indices.insert(step.name.clone(), step.index);
            next_index = next_index.max(step.index + 1);
        }
        let snapshot = StepSnapshot::from_steps(steps);

        let ctx = StepContext::new(
            run.id,
            run.job_name.clone(),
            Arc::clone(&self.storage),
            Arc::clone(&self.bus),
            self.clock.clone(),
            snapshot,
            replayed_indices,
            next_index,
        );

        self.bus.publish(EventKind::RunStart {
            run_id: run.id,
            job_name: run.job_name.clone(),
            payload: run.payload.clone(),
        });

        let result = job.inner.run(ctx, run.payload.clone()).await;
        let now = self.clock.utc_now();

        self.finish(run, result, now).await
    }

    async fn finish(
        &self,
        run: &Run,
        result: Result<serde_json::Value, DurablyError>,
        now: chrono::DateTime<Utc>,
    ) -> RunOutcome {
        match result {
            Ok(output) => match self.storage.complete_run(run.id, output.clone(), now).await {
                Ok(()) => {
                    let duration_ms = run
                        .started_at
                        .map(|started| (now - started).num_milliseconds().max(0) as u64)
                        .unwrap_or(0);
                    self.bus.publish(EventKind::RunComplete {
                        run_id: run.id,
                        job_name: run.job_name.clone(),
                        output,
                        duration_ms,
                    });
                    RunOutcome::Completed
                }
                Err(e) => {
                    self.worker_error(e.to_string(), "complete_run");
                    RunOutcome::TransientError
                }
            },
            Err(DurablyError::Cancelled) => {
                // Storage already reflects `cancelled`; nothing to write.
                self.bus.publish(EventKind::RunCancel {
                    run_id: run.id,
                    job_name: run.job_name.clone(),
                });
                RunOutcome::Cancelled
            }
            Err(DurablyError::StepFailed { step, error }) => {
                self.fail(run, &error, Some(step), now).await
            }
            Err(DurablyError::TransientStorage(error)) => {
                self.worker_error(error, "step_storage");
                RunOutcome::TransientError
            }
            Err(other) => self.fail(run, &other.to_string(), None, now).await,
        }
    }

    async fn fail(
        &self,
        run: &Run,
        error: &str,
        failed_step_name: Option<String>,
        now: chrono::DateTime<Utc>,
    ) -> RunOutcome {
        match self.storage.fail_run(run.id, error, now).await {
            Ok(()) => {
                self.bus.publish(EventKind::RunFail {
                    run_id: run.id,
                    job_name: run.job_name.clone(),
                    error: error.to_string(),
                    failed_step_name,
                });
                RunOutcome::Failed
            }
            Err(e) => {
                self.worker_error(e.to_string(), "fail_run");
                RunOutcome::TransientError
            }
        }
    }

    fn worker_error(&self, error: String, context: &str) {
        warn!(error, context, "worker error while driving run");
        self.bus.publish(EventKind::WorkerError {
            error,
            context: context.to_string(),
        });
    }
}
