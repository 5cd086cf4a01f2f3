//! Debounced topology-change notification
//!
//! Bulk operations (mass link flaps, teardown) produce bursts of topology
//! changes; external consumers only care about the settled state. The
//! debouncer keeps the most recent change and emits it once no further
//! change arrives for a full quiet window. Any change within the window
//! resets the timer and replaces the pending payload.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

pub const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_secs(3);

/// Payload handed to the external notification sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopologyChange {
    pub entity_id: String,
    pub change: String,
}

impl TopologyChange {
    pub fn new(entity_id: impl Into<String>, change: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            change: change.into(),
        }
    }
}

pub type NotificationSink = Arc<dyn Fn(TopologyChange) + Send + Sync>;

/// Pending change and timer bookkeeping, under one lock: changes arrive from
/// the sequential startup path and from concurrent hot-add callers alike.
#[derive(Default)]
struct DebounceState {
    pending: Option<TopologyChange>,
    generation: u64,
    timer_alive: bool,
}

pub struct ChangeDebouncer {
    window: Duration,
    state: Arc<Mutex<DebounceState>>,
    sink: NotificationSink,
}

impl ChangeDebouncer {
    pub fn new(window: Duration, sink: impl Fn(TopologyChange) + Send + Sync + 'static) -> Self {
        Self {
            window,
            state: Arc::new(Mutex::new(DebounceState::default())),
            sink: Arc::new(sink),
        }
    }

    /// Record a change, (re)starting the quiet-window timer.
    ///
    /// Callable from any thread. Without an async runtime on the calling
    /// thread there is no timer to arm, so the change is delivered
    /// immediately instead.
    pub fn notify(&self, change: TopologyChange) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(entity = %change.entity_id, "no async runtime on this thread, emitting undebounced");
            (self.sink)(change);
            return;
        };
        let mut state = self.state.lock();
        state.pending = Some(change);
        state.generation += 1;
        if state.timer_alive {
            return;
        }
        state.timer_alive = true;
        let seen = state.generation;
        drop(state);

        let window = self.window;
        let state = self.state.clone();
        let sink = self.sink.clone();
        runtime.spawn(async move {
            let mut seen = seen;
            loop {
                tokio::time::sleep(window).await;
                let payload = {
                    let mut state = state.lock();
                    if state.generation != seen {
                        // Another change arrived; wait out a fresh window.
                        seen = state.generation;
                        continue;
                    }
                    state.timer_alive = false;
                    state.pending.take()
                };
                if let Some(change) = payload {
                    debug!(entity = %change.entity_id, change = %change.change, "flushing topology change");
                    sink(change);
                }
                return;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collecting_debouncer(
        window: Duration,
    ) -> (ChangeDebouncer, Arc<Mutex<Vec<TopologyChange>>>) {
        let emitted: Arc<Mutex<Vec<TopologyChange>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_target = emitted.clone();
        let debouncer = ChangeDebouncer::new(window, move |change| {
            sink_target.lock().push(change);
        });
        (debouncer, emitted)
    }

    #[tokio::test(start_paused = true)]
    async fn burst_emits_only_last_change() {
        let (debouncer, emitted) = collecting_debouncer(Duration::from_secs(3));
        for i in 0..10 {
            debouncer.notify(TopologyChange::new(format!("l{i}"), "link_changed"));
        }
        tokio::time::sleep(Duration::from_secs(4)).await;
        let emitted = emitted.lock();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0], TopologyChange::new("l9", "link_changed"));
    }

    #[tokio::test(start_paused = true)]
    async fn changes_within_window_reset_the_timer() {
        let (debouncer, emitted) = collecting_debouncer(Duration::from_secs(3));
        debouncer.notify(TopologyChange::new("h1", "node_added"));
        tokio::time::sleep(Duration::from_secs(2)).await;
        debouncer.notify(TopologyChange::new("h2", "node_added"));
        // First window would have elapsed here, but the timer was reset.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(emitted.lock().is_empty());
        tokio::time::sleep(Duration::from_secs(3)).await;
        let emitted = emitted.lock();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0], TopologyChange::new("h2", "node_added"));
    }

    #[test]
    fn emits_synchronously_without_a_runtime() {
        let (debouncer, emitted) = collecting_debouncer(Duration::from_secs(3));
        debouncer.notify(TopologyChange::new("h1", "node_added"));
        let emitted = emitted.lock();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0], TopologyChange::new("h1", "node_added"));
    }

    #[tokio::test(start_paused = true)]
    async fn separate_quiet_periods_emit_separately() {
        let (debouncer, emitted) = collecting_debouncer(Duration::from_secs(3));
        debouncer.notify(TopologyChange::new("h1", "node_added"));
        tokio::time::sleep(Duration::from_secs(4)).await;
        debouncer.notify(TopologyChange::new("h2", "node_added"));
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(emitted.lock().len(), 2);
    }
}
