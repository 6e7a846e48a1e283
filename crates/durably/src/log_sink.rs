// SPDX-License-Identifier: MIT

//! Optional persistence of `log:write` events to `durably_logs` (spec §4.D:
//! "Persisted only when a `LogSink` observer is attached to the façade" —
//! the core emits the event regardless of whether anything is listening).

use durably_bus::EventBus;
use durably_core::{Clock, EventKind, SystemClock};
use durably_storage::Storage;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::warn;

/// Subscribes to the bus and writes every `log:write` event to storage.
///
/// Dropping the `LogSink` (or calling [`LogSink::stop`]) aborts the
/// background task; it holds no state of its own beyond the handle.
pub struct LogSink {
    task: JoinHandle<()>,
}

impl LogSink {
    /// Spawn the sink. `bus` and `storage` are cloned handles, not owned —
    /// the façade keeps using its own copies independently.
    pub fn spawn(bus: Arc<EventBus>, storage: Arc<Storage>) -> Self {
        let mut rx = bus.subscribe();
        let task = tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                };
                let EventKind::LogWrite {
                    run_id,
                    step_name,
                    level,
                    message,
                    data,
                } = event.kind
                else {
                    continue;
                };
                let now = SystemClock.utc_now();
                if let Err(e) = storage
                    .insert_log(run_id, step_name.as_deref(), level, &message, &data, now)
                    .await
                {
                    warn!(error = %e, run_id = %run_id, "failed to persist log event");
                }
            }
        });
        Self { task }
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for LogSink {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use durably_core::{LogLevel, RunId};
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn log_write_events_are_persisted() {
        let storage = Arc::new(Storage::connect_in_memory().await.unwrap());
        let bus = Arc::new(EventBus::new());
        let sink = LogSink::spawn(Arc::clone(&bus), Arc::clone(&storage));

        let run_id = RunId::new();
        bus.publish(EventKind::LogWrite {
            run_id,
            step_name: Some("fetch".to_string()),
            level: LogLevel::Info,
            message: "hello".to_string(),
            data: json!({}),
        });

        let mut logs = Vec::new();
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            logs = storage.list_logs(run_id).await.unwrap();
            if !logs.is_empty() {
                break;
            }
        }
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message, "hello");

        sink.stop();
    }
}
