//! Execution-timeout accounting that stops while a durable task is parked.
//!
//! The worker owns one `ExecutionBudget` per attempt and races the handler
//! against [`ExecutionBudget::exhausted`]. A `DurableContext` holding the
//! same budget pauses it for the time spent waiting on the engine, so only
//! RUNNING stretches count against `execution_timeout`.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Usage {
    /// Running time accumulated before `running_since`.
    used: Duration,
    /// `None` while paused.
    running_since: Option<Instant>,
    /// Nested pauses; the clock restarts when this drops back to zero.
    pauses: u32,
}

#[derive(Debug)]
pub struct ExecutionBudget {
    limit: Duration,
    usage: watch::Sender<Usage>,
}

impl ExecutionBudget {
    /// A running budget of `limit`.
    pub fn new(limit: Duration) -> Self {
        let (usage, _) = watch::channel(Usage {
            used: Duration::ZERO,
            running_since: Some(Instant::now()),
            pauses: 0,
        });
        Self { limit, usage }
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    /// Running time consumed so far.
    pub fn used(&self) -> Duration {
        let usage = *self.usage.borrow();
        usage.used + usage.running_since.map(|s| s.elapsed()).unwrap_or_default()
    }

    pub fn is_paused(&self) -> bool {
        self.usage.borrow().running_since.is_none()
    }

    /// Stop the clock. Pauses nest.
    pub fn pause(&self) {
        self.usage.send_modify(|usage| {
            if let Some(since) = usage.running_since.take() {
                usage.used += since.elapsed();
            }
            usage.pauses += 1;
        });
    }

    /// Undo one `pause`; the clock restarts after the outermost one.
    pub fn resume(&self) {
        self.usage.send_modify(|usage| {
            usage.pauses = usage.pauses.saturating_sub(1);
            if usage.pauses == 0 && usage.running_since.is_none() {
                usage.running_since = Some(Instant::now());
            }
        });
    }

    /// Pause until the returned guard is dropped.
    pub fn paused(&self) -> PauseGuard<'_> {
        self.pause();
        PauseGuard { budget: self }
    }

    /// Resolves once the running time reaches the limit.
    pub async fn exhausted(&self) {
        let mut changes = self.usage.subscribe();
        loop {
            let usage = *changes.borrow_and_update();
            match usage.running_since {
                Some(since) => {
                    let left = self.limit.saturating_sub(usage.used);
                    if since.elapsed() >= left {
                        return;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep_until(since + left) => {}
                        _ = changes.changed() => {}
                    }
                }
                None => {
                    // The sender lives in `self`, so this only errors after drop.
                    if changes.changed().await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// Keeps an [`ExecutionBudget`] paused while alive.
pub struct PauseGuard<'a> {
    budget: &'a ExecutionBudget,
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        self.budget.resume();
    }
}
