// SPDX-License-Identifier: MIT

use crate::EventBus;
use durably_core::{Event, EventKind, Run, RunId};
use durably_storage::{Storage, StorageResult};
use futures::stream::{self, Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

/// A bounded per-run view over the event bus (spec §4.H).
///
/// If the Run is already terminal at construction time, yields one
/// synthesized terminal event and closes without ever touching the bus.
/// Otherwise it forwards live events for this `run_id`, closing right
/// after the first terminal event it sees.
pub struct RunSubscription {
    inner: Pin<Box<dyn Stream<Item = Event> + Send>>,
}

impl RunSubscription {
    pub async fn new(run_id: RunId, storage: &Storage, bus: &EventBus) -> StorageResult<Self> {
        let run = storage.get_run(run_id).await?;

        let inner: Pin<Box<dyn Stream<Item = Event> + Send>> = match run {
            Some(run) if run.status.is_terminal() => {
                let event = synthesize_terminal_event(&run);
                Box::pin(stream::once(async move { event }))
            }
            _ => Box::pin(live_stream(run_id, bus)),
        };

        Ok(Self { inner })
    }
}

impl Stream for RunSubscription {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.inner.as_mut().poll_next(cx)
    }
}

fn live_stream(run_id: RunId, bus: &EventBus) -> impl Stream<Item = Event> + Send {
    BroadcastStream::new(bus.subscribe())
        .filter_map(|received| async move {
            match received {
                Ok(event) => Some(event),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "run subscription lagged behind the event bus");
                    None
                }
            }
        })
        .filter(move |event| {
            let matches = event.kind.run_id() == Some(run_id);
            async move { matches }
        })
        // Close the stream right after forwarding the first terminal event
        // for this run, rather than dropping it (spec §4.H "closing after
        // forwarding a terminal event").
        .scan(false, |closed, event| {
            if *closed {
                return futures::future::ready(None);
            }
            if event.kind.is_terminal() {
                *closed = true;
            }
            futures::future::ready(Some(event))
        })
}

/// Reconstruct the terminal event a Run's own storage row implies, for a
/// subscriber that attaches after the Run has already finished. `sequence`
/// is `0` since this event never passed through the bus.
fn synthesize_terminal_event(run: &Run) -> Event {
    use durably_core::RunStatus;

    let kind = match run.status {
        RunStatus::Completed => EventKind::RunComplete {
            run_id: run.id,
            job_name: run.job_name.clone(),
            output: run.output.clone().unwrap_or(serde_json::Value::Null),
            duration_ms: duration_ms(run),
        },
        RunStatus::Failed => EventKind::RunFail {
            run_id: run.id,
            job_name: run.job_name.clone(),
            error: run.error.clone().unwrap_or_default(),
            failed_step_name: None,
        },
        RunStatus::Cancelled => EventKind::RunCancel {
            run_id: run.id,
            job_name: run.job_name.clone(),
        },
        RunStatus::Pending | RunStatus::Running => {
            unreachable!("synthesize_terminal_event called on a non-terminal run")
        }
    };
    Event { sequence: 0, kind }
}

fn duration_ms(run: &Run) -> u64 {
    match (run.started_at, run.completed_at) {
        (Some(started), Some(completed)) => {
            (completed - started).num_milliseconds().max(0) as u64
        }
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use durably_core::TriggerOptions;
    use serde_json::json;

    #[tokio::test]
    async fn terminal_run_yields_one_synthesized_event_and_closes() {
        let storage = Storage::connect_in_memory().await.expect("connect");
        let bus = EventBus::new();
        let now = chrono::Utc::now();
        let (run, _) = storage
            .insert_run("echo", json!({}), &TriggerOptions::default(), now)
            .await
            .expect("insert");
        storage.claim_next_pending(now).await.expect("claim");
        storage
            .complete_run(run.id, json!({"ok": true}), now)
            .await
            .expect("complete");

        let mut subscription = RunSubscription::new(run.id, &storage, &bus)
            .await
            .expect("subscribe");
        let event = subscription.next().await.expect("one event");
        assert_eq!(event.kind.name(), "run:complete");
        assert!(subscription.next().await.is_none());
    }

    #[tokio::test]
    async fn live_run_forwards_events_and_closes_after_terminal() {
        let storage = Storage::connect_in_memory().await.expect("connect");
        let bus = EventBus::new();
        let now = chrono::Utc::now();
        let (run, _) = storage
            .insert_run("echo", json!({}), &TriggerOptions::default(), now)
            .await
            .expect("insert");

        let mut subscription = RunSubscription::new(run.id, &storage, &bus)
            .await
            .expect("subscribe");

        bus.publish(EventKind::RunStart {
            run_id: run.id,
            job_name: "echo".into(),
            payload: json!({}),
        });
        bus.publish(EventKind::RunComplete {
            run_id: run.id,
            job_name: "echo".into(),
            output: json!({}),
            duration_ms: 5,
        });
        bus.publish(EventKind::RunStart {
            run_id: RunId::new(),
            job_name: "other".into(),
            payload: json!({}),
        });

        let first = subscription.next().await.expect("run:start");
        assert_eq!(first.kind.name(), "run:start");
        let second = subscription.next().await.expect("run:complete");
        assert_eq!(second.kind.name(), "run:complete");
        assert!(subscription.next().await.is_none());
    }
}
