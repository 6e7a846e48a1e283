// SPDX-License-Identifier: MIT

//! The Step Context (spec §4.D): what user handler code is actually given
//! to call `step.run(name, fn)`, `progress(..)` and `log.{info,warn,error}`.

use durably_bus::EventBus;
use durably_core::{Clock, DurablyError, DurablyResult, EventKind, LogLevel, Progress, RunId, RunStatus, StepSnapshot, StepStatus};
use durably_storage::Storage;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;


#[derive(Clone)]
pub struct StepContext<C: Clock> {
    run_id: RunId,
    job_name: String,
    storage: Arc<Storage>,
    bus: Arc<EventBus>,
    clock: C,
    snapshot: Arc<Mutex<StepSnapshot>>,
    /// `name -> index` for steps that already exist in `snapshot`, so a
    /// replayed step re-emits its original index rather than being
    /// renumbered on each resume.
    replayed_indices: Arc<HashMap<String, i64>>,
    next_index: Arc<AtomicI64>,
}

impl<C: Clock> StepContext<C> {
    pub(crate) fn new(
        run_id: RunId,
        job_name: String,
        storage: Arc<Storage>,
        bus: Arc<EventBus>,
        clock: C,
        snapshot: StepSnapshot,
        replayed_indices: HashMap<String, i64>,
        next_index: i64,
    ) -> Self {
        Self {
            run_id,
            job_name,
            storage,
            bus,
            clock,
            snapshot: Arc::new(Mutex::new(snapshot)),
            replayed_indices: Arc::new(replayed_indices),
            next_index: Arc::new(AtomicI64::new(next_index)),
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// `step.run(name, fn)` (spec §4.D).
    ///
    /// Replay: if a completed Step named `name` exists in the snapshot,
    /// `step:start`/`step:complete` are still emitted (a progress UI needs
    /// a start/stop pair to render a timeline) but `fn` is never invoked and
    /// the cached output is returned directly.
    pub async fn run<Out, F, Fut>(&self, name: &str, fn_: F) -> DurablyResult<Out>
    where
        Out: Serialize + serde::de::DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Out, String>>,
    {
        if self.is_cancelled().await {
            return Err(DurablyError::Cancelled);
        }

        if let Some(cached) = self.snapshot.lock().get(name).cloned() {
            let index = self.replayed_indices.get(name).copied().unwrap_or(0);
            self.emit(EventKind::StepStart {
                run_id: self.run_id,
                step_name: name.to_string(),
                index,
            });
            self.emit(EventKind::StepComplete {
                run_id: self.run_id,
                step_name: name.to_string(),
                index,
                output: cached.clone(),
            });
            return serde_json::from_value(cached)
                .map_err(|e| DurablyError::StepOutputNotSerializable(e.to_string()));
        }

        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        self.emit(EventKind::StepStart {
            run_id: self.run_id,
            step_name: name.to_string(),
            index,
        });

        let started_at = self.clock.utc_now();
        let outcome = fn_().await;
        let completed_at = self.clock.utc_now();

        match outcome {
            Ok(value) => {
                let serialized = serde_json::to_value(&value).map_err(|e| {
                    DurablyError::StepOutputNotSerializable(e.to_string())
                })?;
                self.storage
                    .insert_step(
                        self.run_id,
                        name,
                        index,
                        StepStatus::Completed,
                        Some(serialized.clone()),
                        None,
                        started_at,
                        completed_at,
                    )
                    .await
                    .map_err(|e| DurablyError::TransientStorage(e.to_string()))?;
                self.snapshot.lock().insert(name.to_string(), serialized.clone());
                self.emit(EventKind::StepComplete {
                    run_id: self.run_id,
                    step_name: name.to_string(),
                    index,
                    output: serialized,
                });
                Ok(value)
            }
            Err(error) => {
                self.storage
                    .insert_step(
                        self.run_id,
                        name,
                        index,
                        StepStatus::Failed,
                        None,
                        Some(&error),
                        started_at,
                        completed_at,
                    )
                    .await
                    .map_err(|e| DurablyError::TransientStorage(e.to_string()))?;
                self.emit(EventKind::StepFail {
                    run_id: self.run_id,
                    step_name: name.to_string(),
                    index,
                    error: error.clone(),
                });
                Err(DurablyError::StepFailed { step: name.to_string(), error })
            }
        }
    }

    /// `progress(current, total?, message?)` (spec §4.D): best-effort,
    /// NOT transactional with step writes.
    pub async fn progress(&self, progress: Progress) {
        let _ = self
            .storage
            .update_progress(
                self.run_id,
                progress.current,
                progress.total,
                progress.message.as_deref(),
            )
            .await;
        self.emit(EventKind::RunProgress { run_id: self.run_id, progress });
    }

    pub fn log(&self) -> LogHandle<'_, C> {
        LogHandle { ctx: self }
    }

    async fn is_cancelled(&self) -> bool {
        matches!(
            self.storage.get_run(self.run_id).await,
            Ok(Some(run)) if run.status == RunStatus::Cancelled
        )
    }

    fn emit(&self, kind: EventKind) {
        self.bus.publish(kind);
    }

    pub(crate) fn job_name(&self) -> &str {
        &self.job_name
    }
}

pub struct LogHandle<'a, C: Clock> {
    ctx: &'a StepContext<C>,
}

impl<C: Clock> LogHandle<'_, C> {
    pub fn info(&self, message: impl Into<String>, data: Value) {
        self.write(LogLevel::Info, message.into(), data);
    }

    pub fn warn(&self, message: impl Into<String>, data: Value) {
        self.write(LogLevel::Warn, message.into(), data);
    }

    pub fn error(&self, message: impl Into<String>, data: Value) {
        self.write(LogLevel::Error, message.into(), data);
    }

    fn write(&self, level: LogLevel, message: String, data: Value) {
        self.ctx.emit(EventKind::LogWrite {
            run_id: self.ctx.run_id,
            step_name: None,
            level,
            message,
            data,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use durably_core::{SystemClock, TriggerOptions};
    use serde_json::json;

    async fn running_ctx(storage: Arc<Storage>, bus: Arc<EventBus>) -> (RunId, StepContext<SystemClock>) {
        let now = SystemClock.utc_now();
        let (run, _) = storage
            .insert_run("echo", json!({}), &TriggerOptions::default(), now)
            .await
            .expect("insert run");
        storage.claim_next_pending(now).await.expect("claim");

        let ctx = StepContext::new(
            run.id,
            "echo".to_string(),
            storage,
            bus,
            SystemClock,
            StepSnapshot::default(),
            HashMap::new(),
            0,
        );
        (run.id, ctx)
    }

    #[tokio::test]
    async fn first_run_executes_and_persists_the_step() {
        let storage = Arc::new(Storage::connect_in_memory().await.expect("connect"));
        let bus = Arc::new(EventBus::new());
        let (run_id, ctx) = running_ctx(Arc::clone(&storage), bus).await;

        let out: i64 = ctx
            .run("double", || async { Ok::<i64, String>(21 * 2) })
            .await
            .expect("step ok");
        assert_eq!(out, 42);

        let steps = storage.list_steps(run_id).await.expect("list steps");
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].name, "double");
        assert_eq!(steps[0].output, Some(json!(42)));
    }

    #[tokio::test]
    async fn replayed_step_returns_cached_output_without_calling_the_closure() {
        let storage = Arc::new(Storage::connect_in_memory().await.expect("connect"));
        let bus = Arc::new(EventBus::new());
        let now = SystemClock.utc_now();
        let (run, _) = storage
            .insert_run("echo", json!({}), &TriggerOptions::default(), now)
            .await
            .expect("insert run");
        storage.claim_next_pending(now).await.expect("claim");
        storage
            .insert_step(
                run.id,
                "double",
                0,
                StepStatus::Completed,
                Some(json!(42)),
                None,
                now,
                now,
            )
            .await
            .expect("seed step");

        let steps = storage.list_steps(run.id).await.expect("list steps");
        let snapshot = StepSnapshot::from_steps(steps);
        let mut replayed_indices = HashMap::new();
        replayed_indices.insert("double".to_string(), 0);

        let ctx = StepContext::new(
            run.id,
            "echo".to_string(),
            Arc::clone(&storage),
            Arc::clone(&bus),
            SystemClock,
            snapshot,
            replayed_indices,
            1,
        );

        let called = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let called_clone = Arc::clone(&called);
        let out: i64 = ctx
            .run("double", || async move {
                called_clone.store(true, Ordering::SeqCst);
                Ok::<i64, String>(999)
            })
            .await
            .expect("step ok");

        assert_eq!(out, 42);
        assert!(!called.load(Ordering::SeqCst));
        // replay must not write a second row for the same step name
        assert_eq!(storage.list_steps(run.id).await.expect("list steps").len(), 1);
    }

    #[tokio::test]
    async fn failed_step_is_persisted_and_returns_step_failed() {
        let storage = Arc::new(Storage::connect_in_memory().await.expect("connect"));
        let bus = Arc::new(EventBus::new());
        let (run_id, ctx) = running_ctx(Arc::clone(&storage), bus).await;

        let err = ctx
            .run("boom", || async { Err::<i64, String>("kaboom".to_string()) })
            .await
            .unwrap_err();
        assert!(matches!(err, DurablyError::StepFailed { ref step, ref error } if step == "boom" && error == "kaboom"));

        let steps = storage.list_steps(run_id).await.expect("list steps");
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn cancelled_run_short_circuits_before_the_closure_runs() {
        let storage = Arc::new(Storage::connect_in_memory().await.expect("connect"));
        let bus = Arc::new(EventBus::new());
        let (run_id, ctx) = running_ctx(Arc::clone(&storage), bus).await;
        storage.cancel_run(run_id, SystemClock.utc_now()).await.expect("cancel");

        let called = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let called_clone = Arc::clone(&called);
        let err = ctx
            .run("never", || async move {
                called_clone.store(true, Ordering::SeqCst);
                Ok::<i64, String>(1)
            })
            .await
            .unwrap_err();

        assert!(matches!(err, DurablyError::Cancelled));
        assert!(!called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn progress_updates_storage_and_emits_an_event() {
        let storage = Arc::new(Storage::connect_in_memory().await.expect("connect"));
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe();
        let (run_id, ctx) = running_ctx(Arc::clone(&storage), Arc::clone(&bus)).await;

        ctx.progress(Progress {
            current: 3.0,
            total: Some(10.0),
            message: Some("working".to_string()),
        })
        .await;

        let event = rx.recv().await.expect("progress event");
        assert!(matches!(event.kind, EventKind::RunProgress { run_id: id, .. } if id == run_id));

        let run = storage.get_run(run_id).await.expect("get run").expect("exists");
        let progress = run.progress.expect("progress recorded");
        assert_eq!(progress.current, 3.0);
        assert_eq!(progress.total, Some(10.0));
    }

    #[tokio::test]
    async fn log_handle_emits_without_touching_storage() {
        let storage = Arc::new(Storage::connect_in_memory().await.expect("connect"));
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe();
        let (run_id, ctx) = running_ctx(Arc::clone(&storage), Arc::clone(&bus)).await;

        ctx.log().warn("careful", json!({"n": 1}));

        let event = rx.recv().await.expect("log event");
        assert!(matches!(event.kind, EventKind::LogWrite { run_id: id, level: LogLevel::Warn, .. } if id == run_id));
        assert!(storage.list_logs(run_id).await.expect("list logs").is_empty());
    }
}
