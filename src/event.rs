//! Event feed (§6): the small synchronous publish contract the acquisition
//! pipeline uses to notify subscribers. Subscribers must not block the
//! iteration thread; anything heavier (persistence) hands off to its own
//! task, as the acquisition controller does for `SavedEpoch`.

use crate::sample::ConfigurationSpan;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::broadcast;

/// An epoch identifier as carried on events; epochs themselves are not
/// `Clone`, so events carry just enough to correlate them.
pub type EpochId = uuid::Uuid;

/// Every event produced by the pipeline, each timestamped from the
/// controller's own clock.
#[derive(Debug, Clone)]
pub enum Event {
    Started { at: DateTime<Utc> },
    Stopped { at: DateTime<Utc> },
    ExceptionalStop { at: DateTime<Utc>, reason: String },
    ProcessIteration { at: DateTime<Utc>, deficit: Duration },
    StimulusOutput { at: DateTime<Utc>, stream: String, spans: Vec<ConfigurationSpan> },
    NextEpochRequested { at: DateTime<Utc>, epoch_id: EpochId },
    SavedEpoch { at: DateTime<Utc>, epoch_id: EpochId },
    DiscardedEpoch { at: DateTime<Utc>, epoch_id: EpochId },
}

/// A broadcast-backed event bus: many subscribers, lossy under backpressure
/// rather than blocking the publisher.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publishes an event. Errors only when there are no subscribers, which
    /// is not itself a failure of the pipeline.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }
}
