//! Observability events emitted by the Dispatcher.
//!
//! The bus is an explicit handle with a start/reset lifecycle tied to
//! Dispatcher startup, not ambient global state: the cycle publishes one event
//! per plan change, a bounded ring keeps recent history for `status` output,
//! and subscribers receive live events over a channel.

use std::collections::VecDeque;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::core::command::CommandKind;
use crate::core::status::PlanStatus;

/// One observable plan change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchEvent {
    WorkerLaunched { plan_id: String, todo: usize },
    TodoCompleted { plan_id: String, todo: usize },
    TodoFailed { plan_id: String, todo: usize, exit_code: i32, retry_count: u32 },
    StatusChanged { plan_id: String, from: PlanStatus, to: PlanStatus },
    CommandApplied { plan_id: String, kind: CommandKind },
    ReviewItemsReceived { plan_id: String, count: usize },
}

#[derive(Debug)]
struct Inner {
    ring: VecDeque<DispatchEvent>,
    capacity: usize,
    subscribers: Vec<Sender<DispatchEvent>>,
}

/// Bounded event bus. Cheap to clone; clones share the ring.
#[derive(Debug, Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Inner>>,
}

impl EventBus {
    /// Start a fresh bus with an empty ring.
    pub fn start(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                ring: VecDeque::with_capacity(capacity),
                capacity,
                subscribers: Vec::new(),
            })),
        }
    }

    /// Drop history and subscribers, as on Dispatcher restart.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.ring.clear();
        inner.subscribers.clear();
    }

    /// Publish one event: appended to the ring (evicting the oldest past
    /// capacity) and fanned out to live subscribers.
    pub fn publish(&self, event: DispatchEvent) {
        debug!(?event, "dispatch event");
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.ring.len() == inner.capacity {
            inner.ring.pop_front();
        }
        inner.ring.push_back(event.clone());
        // Disconnected receivers are dropped on the way through.
        inner.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Subscribe to events published after this call.
    pub fn subscribe(&self) -> Receiver<DispatchEvent> {
        let (tx, rx) = channel();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.subscribers.push(tx);
        rx
    }

    /// Snapshot of the retained history, oldest first.
    pub fn recent(&self) -> Vec<DispatchEvent> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.ring.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(plan_id: &str) -> DispatchEvent {
        DispatchEvent::WorkerLaunched {
            plan_id: plan_id.to_string(),
            todo: 0,
        }
    }

    #[test]
    fn ring_is_bounded_and_evicts_oldest() {
        let bus = EventBus::start(2);
        bus.publish(event("p1"));
        bus.publish(event("p2"));
        bus.publish(event("p3"));

        let recent = bus.recent();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0], event("p2"));
        assert_eq!(recent[1], event("p3"));
    }

    #[test]
    fn subscribers_receive_events_published_after_subscribe() {
        let bus = EventBus::start(8);
        bus.publish(event("before"));
        let rx = bus.subscribe();
        bus.publish(event("after"));

        assert_eq!(rx.try_recv().expect("event"), event("after"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn reset_clears_history_and_subscribers() {
        let bus = EventBus::start(8);
        let rx = bus.subscribe();
        bus.publish(event("p1"));
        bus.reset();
        bus.publish(event("p2"));

        assert!(bus.recent().len() == 1);
        // The pre-reset subscriber got p1 but is detached afterwards.
        assert_eq!(rx.try_recv().expect("event"), event("p1"));
        assert!(rx.try_recv().is_err());
    }
}
