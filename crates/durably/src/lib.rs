// SPDX-License-Identifier: MIT

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! The `Durably` façade (spec §4.G): the one type application code talks
//! to. Owns storage, the event bus, the job registry, and the worker.

mod log_sink;

pub use log_sink::LogSink;

use chrono::Duration as ChronoDuration;
use durably_bus::{EventBus, RunSubscription};
use durably_core::{
    Clock, DurablyError, DurablyResult, EventKind, Run, RunFilter, RunId, RunStatus, SystemClock,
    TriggerOptions,
};
use durably_engine::{Job, Registry};
use durably_storage::{Storage, StorageError};
use durably_worker::{Worker, WorkerConfig};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

fn map_storage_err(err: StorageError) -> DurablyError {
    match err {
        StorageError::NotFound(id) => DurablyError::RunNotFound(id),
        StorageError::InvalidTransition { from, attempted, .. } => {
            DurablyError::InvalidTransition {
                from: RunStatus::from_str(&from).unwrap_or(RunStatus::Failed),
                attempted,
            }
        }
        other => DurablyError::TransientStorage(other.to_string()),
    }
}

/// The running worker's handle, present only between `start()` and `stop()`.
struct WorkerHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// Entry point for registering jobs, triggering runs, and observing their
/// progress (spec §4.G).
pub struct Durably<C: Clock + 'static = SystemClock> {
    storage: Arc<Storage>,
    bus: Arc<EventBus>,
    registry: Arc<Registry<C>>,
    clock: C,
    worker_config: WorkerConfig,
    worker: tokio::sync::Mutex<Option<WorkerHandle>>,
    log_sink: tokio::sync::Mutex<Option<LogSink>>,
}

impl Durably<SystemClock> {
    /// Open (and migrate) a durable SQLite-backed instance at `path`.
    pub async fn connect(path: impl AsRef<Path>) -> DurablyResult<Self> {
        Self::connect_with_clock(path, SystemClock).await
    }

    /// An ephemeral, process-local instance. Does not survive restarts —
    /// intended for tests and short-lived tooling.
    pub async fn connect_in_memory() -> DurablyResult<Self> {
        let storage = Storage::connect_in_memory().await.map_err(map_storage_err)?;
        Ok(Self::from_parts(storage, SystemClock))
    }
}

impl<C: Clock + 'static> Durably<C> {
    pub async fn connect_with_clock(path: impl AsRef<Path>, clock: C) -> DurablyResult<Self> {
        let storage = Storage::connect(path).await.map_err(map_storage_err)?;
        Ok(Self::from_parts(storage, clock))
    }

    fn from_parts(storage: Storage, clock: C) -> Self {
        Self {
            storage: Arc::new(storage),
            bus: Arc::new(EventBus::new()),
            registry: Arc::new(Registry::new()),
            clock,
            worker_config: WorkerConfig::default(),
            worker: tokio::sync::Mutex::new(None),
            log_sink: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_worker_config(mut self, config: WorkerConfig) -> Self {
        self.worker_config = config;
        self
    }

    /// Start persisting `log:write` events to `durably_logs`. A no-op if
    /// already attached (spec §4.D: persistence is opt-in, the event itself
    /// is always emitted regardless).
    pub async fn enable_log_persistence(&self) {
        let mut guard = self.log_sink.lock().await;
        if guard.is_some() {
            return;
        }
        *guard = Some(LogSink::spawn(Arc::clone(&self.bus), Arc::clone(&self.storage)));
    }

    /// `register(name, definition)` (spec §4.G): idempotent for the same
    /// definition object, fails with `already_registered` otherwise.
    pub fn register(&self, job: Job<C>) -> DurablyResult<()> {
        self.registry.register(job)
    }

    pub fn get_job(&self, job_name: &str) -> Option<Job<C>> {
        self.registry.get(job_name)
    }

    /// `trigger(job_name, input, opts) -> Run` (spec §4.G).
    pub async fn trigger(
        &self,
        job_name: &str,
        payload: Value,
        options: TriggerOptions,
    ) -> DurablyResult<Run> {
        let job = self
            .registry
            .get(job_name)
            .ok_or_else(|| DurablyError::InvalidInput(format!("job {job_name:?} is not registered")))?;
        let payload = job.validate_input(payload)?;

        let now = self.clock.utc_now();
        let (run, is_fresh) = self
            .storage
            .insert_run(job_name, payload.clone(), &options, now)
            .await
            .map_err(map_storage_err)?;

        if is_fresh {
            self.bus.publish(EventKind::RunTrigger {
                run_id: run.id,
                job_name: job_name.to_string(),
                payload,
            });
        }
        Ok(run)
    }

    /// `triggerAndWait` (spec §4.G): triggers, then races the run's
    /// terminal event against an optional timeout. A timeout fails only
    /// the waiter — the Run keeps running in the background.
    pub async fn trigger_and_wait(
        &self,
        job_name: &str,
        payload: Value,
        options: TriggerOptions,
        timeout: Option<Duration>,
    ) -> DurablyResult<Value> {
        let run = self.trigger(job_name, payload, options).await?;
        let wait = self.wait_for_terminal(run.id);
        let outcome = match timeout {
            Some(duration) => tokio::time::timeout(duration, wait)
                .await
                .map_err(|_| DurablyError::Timeout)?,
            None => wait.await,
        };
        outcome
    }

    async fn wait_for_terminal(&self, run_id: RunId) -> DurablyResult<Value> {
        use futures::StreamExt;

        let mut sub = self.subscribe(run_id).await?;
        while let Some(event) = sub.next().await {
            match event.kind {
                EventKind::RunComplete { output, .. } => return Ok(output),
                EventKind::RunFail { error, .. } => return Err(DurablyError::HandlerFailed(error)),
                EventKind::RunCancel { .. } => return Err(DurablyError::Cancelled),
                _ => continue,
            }
        }
        Err(DurablyError::RunNotFound(run_id))
    }

    /// `batchTrigger(items)` (spec §4.G): one storage transaction, N
    /// `run:trigger` events emitted after it commits — only for items that
    /// were actually inserted, not ones that hit an idempotency-key
    /// collision with a pre-existing Run.
    pub async fn batch_trigger(
        &self,
        items: Vec<(String, Value, TriggerOptions)>,
    ) -> DurablyResult<Vec<Run>> {
        let mut validated = Vec::with_capacity(items.len());
        for (job_name, payload, options) in items {
            let job = self.registry.get(&job_name).ok_or_else(|| {
                DurablyError::InvalidInput(format!("job {job_name:?} is not registered"))
            })?;
            let payload = job.validate_input(payload)?;
            validated.push((job_name, payload, options));
        }

        let now = self.clock.utc_now();
        let inserted = self
            .storage
            .insert_runs_batch(&validated, now)
            .await
            .map_err(map_storage_err)?;

        let mut runs = Vec::with_capacity(inserted.len());
        for ((job_name, payload, _options), (run, is_fresh)) in validated.into_iter().zip(inserted) {
            if is_fresh {
                self.bus.publish(EventKind::RunTrigger {
                    run_id: run.id,
                    job_name,
                    payload,
                });
            }
            runs.push(run);
        }
        Ok(runs)
    }

    pub async fn retry(&self, run_id: RunId) -> DurablyResult<()> {
        self.storage.retry_run(run_id).await.map_err(map_storage_err)?;
        let run = self.get_run(run_id).await?.ok_or(DurablyError::RunNotFound(run_id))?;
        self.bus.publish(EventKind::RunRetry {
            run_id,
            job_name: run.job_name,
        });
        Ok(())
    }

    pub async fn cancel(&self, run_id: RunId) -> DurablyResult<()> {
        let now = self.clock.utc_now();
        self.storage.cancel_run(run_id, now).await.map_err(map_storage_err)
    }

    pub async fn delete_run(&self, run_id: RunId) -> DurablyResult<()> {
        self.storage.delete_run(run_id).await.map_err(map_storage_err)
    }

    pub async fn get_run(&self, run_id: RunId) -> DurablyResult<Option<Run>> {
        self.storage.get_run(run_id).await.map_err(map_storage_err)
    }

    pub async fn get_runs(&self, filter: RunFilter) -> DurablyResult<Vec<Run>> {
        self.storage.get_runs(&filter).await.map_err(map_storage_err)
    }

    /// `subscribe(run_id)` (spec §4.H): a bounded, per-run event stream.
    pub async fn subscribe(&self, run_id: RunId) -> DurablyResult<RunSubscription> {
        if self.get_run(run_id).await?.is_none() {
            return Err(DurablyError::RunNotFound(run_id));
        }
        RunSubscription::new(run_id, &self.storage, &self.bus)
            .await
            .map_err(map_storage_err)
    }

    /// Start the polling worker loop as a background task. A no-op if
    /// already started.
    pub async fn start(&self) {
        let mut guard = self.worker.lock().await;
        if guard.is_some() {
            return;
        }
        let worker = Worker::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.bus),
            Arc::clone(&self.registry),
            self.clock.clone(),
            self.worker_config,
        );
        let (cancel, join) = worker.start();
        *guard = Some(WorkerHandle { cancel, join });
        info!("worker started");
    }

    /// Signal the worker to stop and wait for its current Run (if any) to
    /// reach a terminal state.
    pub async fn stop(&self) {
        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            handle.cancel.cancel();
            let _ = handle.join.await;
            info!("worker stopped");
        }
    }

    /// Reset timed-out `running` Runs back to `pending` without starting
    /// the worker loop. Exposed for tooling/tests that want recovery
    /// semantics without a full polling loop.
    pub async fn recover_stale(&self, stale_threshold: Duration) -> DurablyResult<u64> {
        let delta = ChronoDuration::from_std(stale_threshold)
            .unwrap_or_else(|_| ChronoDuration::milliseconds(30_000));
        self.storage
            .recover_stale(self.clock.utc_now() - delta)
            .await
            .map_err(map_storage_err)
    }
}
