//! In-process fan-out of `WorkerEvent`s.
//!
//! Every worker owns one bus; durable contexts get a clone so suspensions
//! and resumptions show up next to the worker's own lifecycle events.
//! Events published while nobody listens are dropped.

use taskloom_types::event::WorkerEvent;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<WorkerEvent>,
}

impl EventBus {
    /// `capacity` bounds how far a slow subscriber may fall behind before it
    /// starts losing events. Zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to the events of a single run.
    pub fn subscribe_run(&self, run_id: Uuid) -> RunEvents {
        RunEvents {
            run_id,
            receiver: self.sender.subscribe(),
        }
    }

    /// Returns how many subscribers received the event.
    pub fn publish(&self, event: WorkerEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

/// Events of one run, in publication order.
///
/// Lagging skips the lost events with a warning instead of failing.
pub struct RunEvents {
    run_id: Uuid,
    receiver: broadcast::Receiver<WorkerEvent>,
}

impl RunEvents {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Next event for this run, or `None` once the bus is gone.
    pub async fn next(&mut self) -> Option<WorkerEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.run_id() == Some(self.run_id) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(run_id = %self.run_id, skipped, "run event subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}
