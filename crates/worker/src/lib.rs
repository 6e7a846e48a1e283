// SPDX-License-Identifier: MIT

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! The polling worker loop (spec §4.F): `recover_stale` once at startup,
//! then `claim_next_pending` / sleep in a single-threaded loop, driving
//! every claimed Run through a [`RunExecutor`] with a heartbeat ticker
//! running alongside it.

use chrono::Duration as ChronoDuration;
use durably_bus::EventBus;
use durably_core::{Clock, EventKind, RunId, SystemClock};
use durably_engine::{Registry, RunExecutor};
use durably_storage::Storage;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Polling cadence (spec §6), defaults matching spec §4.F / §6.
#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub polling_interval: Duration,
    pub heartbeat_interval: Duration,
    pub stale_threshold: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_millis(1000),
            heartbeat_interval: Duration::from_millis(5000),
            stale_threshold: Duration::from_millis(30_000),
        }
    }
}

impl WorkerConfig {
    durably_core::setters! {
        set {
            polling_interval: Duration,
            heartbeat_interval: Duration,
            stale_threshold: Duration,
        }
    }
}

/// The single-threaded cooperative polling loop.
///
/// Owns no job definitions itself — the [`Registry`] it's given is shared
/// with whatever registered the jobs (the `durably` façade), so
/// registering a job after `start()` is still visible to the next claim.
pub struct Worker<C: Clock = SystemClock> {
    storage: Arc<Storage>,
    bus: Arc<EventBus>,
    registry: Arc<Registry<C>>,
    executor: RunExecutor<C>,
    clock: C,
    config: WorkerConfig,
    cancel: CancellationToken,
}

impl<C: Clock + 'static> Worker<C> {
    pub fn new(
        storage: Arc<Storage>,
        bus: Arc<EventBus>,
        registry: Arc<Registry<C>>,
        clock: C,
        config: WorkerConfig,
    ) -> Self {
        let executor = RunExecutor::new(Arc::clone(&storage), Arc::clone(&bus), clock.clone());
        Self {
            storage,
            bus,
            registry,
            executor,
            clock,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Spawn the loop as a background task. The returned `JoinHandle`
    /// resolves once `stop()` is called and the in-flight Run (if any)
    /// reaches a terminal state.
    pub fn start(self) -> (CancellationToken, JoinHandle<()>) {
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(self.run_loop());
        (cancel, handle)
    }

    /// Signal the loop to stop after its current iteration. Does not
    /// interrupt an in-flight Run; `step.run` boundaries observe
    /// cancellation independently, per-Run, via `cancel(run_id)`.
    pub fn stop(cancel: &CancellationToken) {
        cancel.cancel();
    }

    async fn run_loop(self) {
        let stale_before_delta = ChronoDuration::from_std(self.config.stale_threshold)
            .unwrap_or_else(|_| ChronoDuration::milliseconds(30_000));

        match self
            .storage
            .recover_stale(self.clock.utc_now() - stale_before_delta)
            .await
        {
            Ok(0) => {}
            Ok(n) => info!(recovered = n, "recovered stale runs on startup"),
            Err(e) => warn!(error = %e, "recover_stale failed on startup"),
        }

        let mut ticker = tokio::time::interval(self.config.polling_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            match self.storage.recover_stale(self.clock.utc_now() - stale_before_delta).await {
                Ok(n) if n > 0 => info!(recovered = n, "recovered stale runs"),
                Ok(_) => {}
                Err(e) => {
                    self.bus.publish(EventKind::WorkerError {
                        error: e.to_string(),
                        context: "recover_stale".to_string(),
                    });
                }
            }

            let claimed = match self.storage.claim_next_pending(self.clock.utc_now()).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    self.bus.publish(EventKind::WorkerError {
                        error: e.to_string(),
                        context: "claim_next_pending".to_string(),
                    });
                    continue;
                }
            };

            let Some(run) = claimed else { continue };

            let Some(job) = self.registry.get(&run.job_name) else {
                warn!(job = %run.job_name, run_id = %run.id, "claimed run for unregistered job");
                let now = self.clock.utc_now();
                let error = format!("job {:?} is not registered", run.job_name);
                if self.storage.fail_run(run.id, &error, now).await.is_ok() {
                    self.bus.publish(EventKind::RunFail {
                        run_id: run.id,
                        job_name: run.job_name.clone(),
                        error,
                        failed_step_name: None,
                    });
                }
                continue;
            };

            let heartbeat = self.spawn_heartbeat(run.id);
            self.executor.drive(&run, &job).await;
            heartbeat.abort();
        }
    }

    fn spawn_heartbeat(&self, run_id: RunId) -> JoinHandle<()> {
        let storage = Arc::clone(&self.storage);
        let clock = self.clock.clone();
        let interval = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                if let Ok(false) = storage.heartbeat(run_id, clock.utc_now()).await {
                    return;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use durably_core::{NoopValidator, TriggerOptions};
    use durably_engine::{Job, JobDefinition, StepContext};
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::time::Duration as StdDuration;

    #[derive(Deserialize)]
    struct In {
        n: i64,
    }
    #[derive(Serialize)]
    struct Out {
        doubled: i64,
    }

    fn double_job() -> Job<SystemClock> {
        JobDefinition::new("double", |_ctx: StepContext<SystemClock>, input: In| async move {
            Ok(Out { doubled: input.n * 2 })
        })
        .input_validator(NoopValidator)
        .build()
    }

    #[tokio::test]
    async fn claimed_run_is_driven_to_completion() {
        let storage = Arc::new(Storage::connect_in_memory().await.unwrap());
        let bus = Arc::new(EventBus::new());
        let registry: Arc<Registry<SystemClock>> = Arc::new(Registry::new());
        registry.register(double_job()).unwrap();

        let (run, _) = storage
            .insert_run("double", json!({"n": 10}), &TriggerOptions::default(), SystemClock.utc_now())
            .await
            .unwrap();

        let worker = Worker::new(
            Arc::clone(&storage),
            Arc::clone(&bus),
            Arc::clone(&registry),
            SystemClock,
            WorkerConfig {
                polling_interval: StdDuration::from_millis(10),
                heartbeat_interval: StdDuration::from_secs(5),
                stale_threshold: StdDuration::from_secs(30),
            },
        );
        let (cancel, handle) = worker.start();

        for _ in 0..50 {
            tokio::time::sleep(StdDuration::from_millis(20)).await;
            if let Some(found) = storage.get_run(run.id).await.unwrap() {
                if found.status.is_terminal() {
                    break;
                }
            }
        }

        let finished = storage.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(finished.status, durably_core::RunStatus::Completed);
        assert_eq!(finished.output, Some(json!({"doubled": 20})));

        cancel.cancel();
        let _ = handle.await;
    }
}
