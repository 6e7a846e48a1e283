// SPDX-License-Identifier: MIT

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! durably-storage: sole owner of SQL (spec §4.A/§4.B). Everything above
//! this crate talks to runs, steps and logs through [`Storage`]; no other
//! crate in the workspace issues a query directly.

pub mod error;
mod logs;
mod pool;
mod row;
mod runs;
mod steps;

pub use error::{StorageError, StorageResult};

use chrono::{DateTime, Utc};
use durably_core::{LogLevel, RunId};
use serde_json::Value;
use sqlx::SqlitePool;
use std::path::Path;
use std::sync::Arc;

/// Thin, cheaply-cloneable handle around a `sqlx::SqlitePool`. Every public
/// method runs in its own transaction unless documented otherwise (spec
/// §4.B "each method executes in one transaction unless noted").
#[derive(Clone)]
pub struct Storage {
    pool: Arc<SqlitePool>,
}

impl Storage {
    /// Open (and migrate) the database file at `path`, creating it if it
    /// doesn't exist.
    pub async fn connect(path: impl AsRef<Path>) -> StorageResult<Self> {
        let pool = pool::open_sqlite(path.as_ref()).await?;
        Ok(Self { pool: Arc::new(pool) })
    }

    /// Open an ephemeral, process-local database. Intended for tests and
    /// short-lived tooling, not for a Durably instance meant to resume
    /// across restarts.
    pub async fn connect_in_memory() -> StorageResult<Self> {
        let pool = pool::open_sqlite_in_memory().await?;
        Ok(Self { pool: Arc::new(pool) })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// A persisted row from `durably_logs`, returned by [`Storage::list_logs`].
/// Distinct from the bus's `EventKind::LogWrite`: this is what an operator
/// querying history sees after the fact, not the live event.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub id: i64,
    pub run_id: RunId,
    pub step_name: Option<String>,
    pub level: LogLevel,
    pub message: String,
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use durably_core::{RunFilter, RunStatus, StepStatus, TriggerOptions};
    use serde_json::json;

    async fn memory_storage() -> Storage {
        Storage::connect_in_memory().await.expect("connect")
    }

    #[tokio::test]
    async fn insert_and_get_run_round_trips() {
        let storage = memory_storage().await;
        let now = Utc::now();
        let (run, _) = storage
            .insert_run("echo", json!({"x": 1}), &TriggerOptions::default(), now)
            .await
            .expect("insert");
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.payload, json!({"x": 1}));

        let fetched = storage.get_run(run.id).await.expect("get").expect("exists");
        assert_eq!(fetched.id, run.id);
        assert_eq!(fetched.job_name, "echo");
    }

    #[tokio::test]
    async fn idempotency_key_collision_returns_existing_run() {
        let storage = memory_storage().await;
        let now = Utc::now();
        let options = TriggerOptions {
            idempotency_key: Some("K".into()),
            concurrency_key: None,
        };
        let (first, _) = storage
            .insert_run("noop", json!({}), &options, now)
            .await
            .expect("first insert");
        let (second, _) = storage
            .insert_run("noop", json!({}), &options, now)
            .await
            .expect("second insert");
        assert_eq!(first.id, second.id);

        let all = storage
            .get_runs(&RunFilter {
                job_name: Some("noop".into()),
                ..Default::default()
            })
            .await
            .expect("list");
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn insert_run_reports_freshness_without_relying_on_timestamps() {
        let storage = memory_storage().await;
        let now = Utc::now();
        let options = TriggerOptions {
            idempotency_key: Some("K".into()),
            concurrency_key: None,
        };
        let (first, first_fresh) = storage
            .insert_run("noop", json!({}), &options, now)
            .await
            .expect("first insert");
        assert!(first_fresh);

        // A second call at the exact same timestamp must still report
        // `false` — the caller can no longer mistake this for a fresh
        // insert by comparing `created_at` against `now`.
        let (second, second_fresh) = storage
            .insert_run("noop", json!({}), &options, now)
            .await
            .expect("second insert");
        assert_eq!(first.id, second.id);
        assert!(!second_fresh);
    }

    #[tokio::test]
    async fn claim_next_pending_excludes_concurrency_key_in_use() {
        let storage = memory_storage().await;
        let now = Utc::now();
        let options = TriggerOptions {
            idempotency_key: None,
            concurrency_key: Some("tenant-a".into()),
        };
        storage
            .insert_run("sync-job", json!({}), &options, now)
            .await
            .expect("insert 1");
        storage
            .insert_run("sync-job", json!({}), &options, now)
            .await
            .expect("insert 2");

        let first_claim = storage
            .claim_next_pending(now)
            .await
            .expect("claim 1")
            .expect("a run was pending");
        assert_eq!(first_claim.status, RunStatus::Running);

        let second_claim = storage.claim_next_pending(now).await.expect("claim 2");
        assert!(
            second_claim.is_none(),
            "second run shares a concurrency_key with a running run"
        );
    }

    #[tokio::test]
    async fn claim_next_pending_orders_by_created_at_then_id() {
        let storage = memory_storage().await;
        let now = Utc::now();
        let (first, _) = storage
            .insert_run("a", json!({}), &TriggerOptions::default(), now)
            .await
            .expect("insert a");
        let (second, _) = storage
            .insert_run(
                "b",
                json!({}),
                &TriggerOptions::default(),
                now + chrono::Duration::seconds(1),
            )
            .await
            .expect("insert b");

        let claimed = storage
            .claim_next_pending(now)
            .await
            .expect("claim")
            .expect("pending run");
        assert_eq!(claimed.id, first.id);
        assert_ne!(claimed.id, second.id);
    }

    #[tokio::test]
    async fn recover_stale_resets_lapsed_heartbeats() {
        let storage = memory_storage().await;
        let now = Utc::now();
        storage
            .insert_run("job", json!({}), &TriggerOptions::default(), now)
            .await
            .expect("insert");
        let claimed = storage
            .claim_next_pending(now)
            .await
            .expect("claim")
            .expect("pending");

        let recovered = storage
            .recover_stale(now + chrono::Duration::seconds(1))
            .await
            .expect("recover");
        assert_eq!(recovered, 1);

        let run = storage.get_run(claimed.id).await.expect("get").expect("exists");
        assert_eq!(run.status, RunStatus::Pending);
        assert!(run.heartbeat_at.is_none());
    }

    #[tokio::test]
    async fn complete_run_requires_running_status() {
        let storage = memory_storage().await;
        let now = Utc::now();
        let (run, _) = storage
            .insert_run("job", json!({}), &TriggerOptions::default(), now)
            .await
            .expect("insert");

        let result = storage.complete_run(run.id, json!({"ok": true}), now).await;
        assert!(matches!(result, Err(StorageError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn retry_run_clears_error_and_preserves_steps() {
        let storage = memory_storage().await;
        let now = Utc::now();
        let (run, _) = storage
            .insert_run("job", json!({}), &TriggerOptions::default(), now)
            .await
            .expect("insert");
        storage.claim_next_pending(now).await.expect("claim");
        storage
            .insert_step(run.id, "step-1", 0, StepStatus::Completed, Some(json!(1)), None, now, now)
            .await
            .expect("insert step");
        storage.fail_run(run.id, "boom", now).await.expect("fail");

        storage.retry_run(run.id).await.expect("retry");
        let retried = storage.get_run(run.id).await.expect("get").expect("exists");
        assert_eq!(retried.status, RunStatus::Pending);
        assert!(retried.error.is_none());

        let steps = storage.list_steps(run.id).await.expect("list steps");
        assert_eq!(steps.len(), 1);
    }

    #[tokio::test]
    async fn retry_run_deletes_failed_steps_so_a_retry_can_reinsert_them() {
        let storage = memory_storage().await;
        let now = Utc::now();
        let (run, _) = storage
            .insert_run("job", json!({}), &TriggerOptions::default(), now)
            .await
            .expect("insert");
        storage.claim_next_pending(now).await.expect("claim");
        storage
            .insert_step(run.id, "ok", 0, StepStatus::Completed, Some(json!(1)), None, now, now)
            .await
            .expect("insert completed step");
        storage
            .insert_step(run.id, "bad", 1, StepStatus::Failed, None, Some("boom"), now, now)
            .await
            .expect("insert failed step");
        storage.fail_run(run.id, "boom", now).await.expect("fail");

        storage.retry_run(run.id).await.expect("retry");
        let steps = storage.list_steps(run.id).await.expect("list steps");
        assert_eq!(steps.len(), 1, "only the completed step should survive a retry");
        assert_eq!(steps[0].name, "ok");

        // The re-executed step must be insertable again without hitting the
        // (run_id, name) primary key.
        storage.claim_next_pending(now).await.expect("reclaim");
        storage
            .insert_step(run.id, "bad", 1, StepStatus::Completed, Some(json!(2)), None, now, now)
            .await
            .expect("reinsert step after retry");
        let steps = storage.list_steps(run.id).await.expect("list steps");
        assert_eq!(steps.len(), 2);
    }

    #[tokio::test]
    async fn delete_run_requires_terminal_status() {
        let storage = memory_storage().await;
        let now = Utc::now();
        let (run, _) = storage
            .insert_run("job", json!({}), &TriggerOptions::default(), now)
            .await
            .expect("insert");
        assert!(storage.delete_run(run.id).await.is_err());

        storage.claim_next_pending(now).await.expect("claim");
        storage.complete_run(run.id, json!({}), now).await.expect("complete");
        storage.delete_run(run.id).await.expect("delete");
        assert!(storage.get_run(run.id).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn insert_runs_batch_commits_all_in_one_transaction() {
        let storage = memory_storage().await;
        let now = Utc::now();
        let items = vec![
            ("a".to_string(), json!({"n": 1}), TriggerOptions::default()),
            ("b".to_string(), json!({"n": 2}), TriggerOptions::default()),
        ];
        let results = storage.insert_runs_batch(&items, now).await.expect("batch insert");
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, fresh)| *fresh));

        let all = storage.get_runs(&RunFilter::default()).await.expect("list");
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn insert_runs_batch_reports_idempotency_collision_as_not_fresh() {
        let storage = memory_storage().await;
        let now = Utc::now();
        let opts = TriggerOptions {
            idempotency_key: Some("K".to_string()),
            concurrency_key: None,
        };
        let (first, _) = storage
            .insert_run("job", json!({}), &opts, now)
            .await
            .expect("seed");

        let items = vec![("job".to_string(), json!({}), opts)];
        let results = storage.insert_runs_batch(&items, now).await.expect("batch insert");
        assert_eq!(results.len(), 1);
        let (run, fresh) = &results[0];
        assert_eq!(run.id, first.id);
        assert!(!fresh);

        let all = storage.get_runs(&RunFilter::default()).await.expect("list");
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn insert_and_list_logs() {
        let storage = memory_storage().await;
        let now = Utc::now();
        let (run, _) = storage
            .insert_run("job", json!({}), &TriggerOptions::default(), now)
            .await
            .expect("insert");
        storage
            .insert_log(run.id, Some("step-1"), LogLevel::Info, "hello", &json!({}), now)
            .await
            .expect("insert log");
        let logs = storage.list_logs(run.id).await.expect("list logs");
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message, "hello");
    }
}
