use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub sequence_no: u64,
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub kind: RunEventKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum RunEventKind {
    Pipeline(PipelineEvent),
    Stage(StageEvent),
    Checkpoint(CheckpointEvent),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineEvent {
    Started {
        stage_count: usize,
        resumed_from: Option<String>,
    },
    Completed {
        executed_stages: usize,
    },
    Failed {
        stage: String,
        reason: String,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageEvent {
    Started { stage: String, index: usize },
    Completed { stage: String, index: usize },
    Failed { stage: String, index: usize, reason: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckpointEvent {
    Loaded { last_completed_stage: String },
    Expired { last_completed_stage: String },
    Rejected { reason: String },
    Declined,
    Restored {
        restored: Vec<String>,
        dropped: Vec<String>,
    },
    Saved { stage: String },
}

/// Synchronous consumer of run events, called inline on the runner's task.
pub trait RunEventObserver: Send + Sync {
    fn observe(&self, event: &RunEvent);
}

impl<F> RunEventObserver for F
where
    F: Fn(&RunEvent) + Send + Sync,
{
    fn observe(&self, event: &RunEvent) {
        self(event);
    }
}

pub type SharedRunEventObserver = Arc<dyn RunEventObserver>;
pub type RunEventSender = mpsc::UnboundedSender<RunEvent>;
pub type RunEventReceiver = mpsc::UnboundedReceiver<RunEvent>;

#[derive(Clone)]
enum EventTarget {
    Observer(SharedRunEventObserver),
    Stream(RunEventSender),
}

/// Fan-out of run events to any number of observers and streams, in the
/// order they were attached. An empty sink drops events.
#[derive(Clone, Default)]
pub struct RunEventSink {
    targets: Vec<EventTarget>,
}

impl RunEventSink {
    pub fn with_observer(observer: SharedRunEventObserver) -> Self {
        Self::default().also_observe(observer)
    }

    pub fn with_sender(sender: RunEventSender) -> Self {
        Self::default().also_stream(sender)
    }

    pub fn also_observe(mut self, observer: SharedRunEventObserver) -> Self {
        self.targets.push(EventTarget::Observer(observer));
        self
    }

    pub fn also_stream(mut self, sender: RunEventSender) -> Self {
        self.targets.push(EventTarget::Stream(sender));
        self
    }

    pub fn is_enabled(&self) -> bool {
        !self.targets.is_empty()
    }

    pub fn emit(&self, event: RunEvent) {
        for target in &self.targets {
            match target {
                EventTarget::Observer(observer) => observer.observe(&event),
                EventTarget::Stream(sender) => {
                    if sender.send(event.clone()).is_err() {
                        debug!(
                            sequence_no = event.sequence_no,
                            "run event receiver is gone; event dropped"
                        );
                    }
                }
            }
        }
    }
}

pub fn run_event_channel() -> (RunEventSender, RunEventReceiver) {
    mpsc::unbounded_channel()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn run_event_sink_observer_and_sender_expected_both_receive_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let observer_seen = Arc::clone(&seen);
        let observer: SharedRunEventObserver = Arc::new(move |event: &RunEvent| {
            observer_seen
                .lock()
                .expect("observer mutex should lock")
                .push(event.sequence_no);
        });
        let (tx, mut rx) = run_event_channel();
        let sink = RunEventSink::with_observer(observer).also_stream(tx);
        sink.emit(RunEvent {
            sequence_no: 7,
            timestamp: 1_000,
            kind: RunEventKind::Checkpoint(CheckpointEvent::Saved {
                stage: "bump".to_string(),
            }),
        });

        let streamed = rx.try_recv().expect("channel should receive one event");
        assert_eq!(streamed.sequence_no, 7);
        assert_eq!(
            seen.lock().expect("observer mutex should lock").as_slice(),
            &[7]
        );
    }

    #[test]
    fn run_event_serializes_with_category_and_kind_tags() {
        let event = RunEvent {
            sequence_no: 1,
            timestamp: 5,
            kind: RunEventKind::Stage(StageEvent::Started {
                stage: "bump".to_string(),
                index: 0,
            }),
        };
        let value = serde_json::to_value(&event).expect("event should serialize");
        assert_eq!(value["kind"]["category"], "stage");
        assert_eq!(value["kind"]["kind"], "started");
        assert_eq!(value["kind"]["stage"], "bump");
    }

    #[test]
    fn run_event_sink_dropped_receiver_expected_observers_still_called() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let first_seen = Arc::clone(&seen);
        let second_seen = Arc::clone(&seen);
        let (tx, rx) = run_event_channel();
        drop(rx);
        let sink = RunEventSink::with_sender(tx)
            .also_observe(Arc::new(move |_: &RunEvent| {
                first_seen.lock().expect("observer mutex should lock").push("first");
            }))
            .also_observe(Arc::new(move |_: &RunEvent| {
                second_seen.lock().expect("observer mutex should lock").push("second");
            }));

        sink.emit(RunEvent {
            sequence_no: 1,
            timestamp: 0,
            kind: RunEventKind::Checkpoint(CheckpointEvent::Declined),
        });

        assert_eq!(
            seen.lock().expect("observer mutex should lock").as_slice(),
            &["first", "second"]
        );
    }

    #[test]
    fn run_event_sink_default_is_disabled() {
        assert!(!RunEventSink::default().is_enabled());
    }
}
