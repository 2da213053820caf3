use std::sync::{Arc, Mutex, MutexGuard};

use ap_core::task_store::{ChangeKind, StoreObserver, TaskChange};

use crate::protocol::{events, BridgeMessage, EventPayload};

/// Internal, unbounded broadcast of state-change events.
///
/// Producers (store observer, executors, loops) never block. The snapshot
/// driver is the main consumer; it forwards each event to the bounded
/// [`Hub`](crate::hub::Hub) and schedules a refresh.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<flume::Sender<BridgeMessage>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Receives every message published from this point forward.
    pub fn subscribe(&self) -> flume::Receiver<BridgeMessage> {
        let (tx, rx) = flume::unbounded();
        self.senders().push(tx);
        rx
    }

    /// Publish to all subscribers, pruning the ones whose receiver is gone.
    pub fn publish(&self, msg: BridgeMessage) {
        self.senders().retain(|tx| tx.send(msg.clone()).is_ok());
    }

    pub fn emit(&self, payload: EventPayload) {
        self.publish(BridgeMessage::Event(payload));
    }

    pub fn subscriber_count(&self) -> usize {
        self.senders().len()
    }

    fn senders(&self) -> MutexGuard<'_, Vec<flume::Sender<BridgeMessage>>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreObserver for EventBus {
    fn on_change(&self, change: &TaskChange) {
        let message = match change.kind {
            ChangeKind::Created => "created".to_string(),
            ChangeKind::StateChanged { from, to } => format!("{from} -> {to}"),
            ChangeKind::Updated => "updated".to_string(),
        };
        self.emit(EventPayload::for_task(events::TASK_CHANGED, &change.task, message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ap_core::types::{Priority, Task, TaskState};

    #[test]
    fn dropped_receivers_are_pruned() {
        let bus = EventBus::new();
        let keep = bus.subscribe();
        drop(bus.subscribe());
        assert_eq!(bus.subscriber_count(), 2);

        bus.emit(EventPayload::for_project(events::LOOP_STARTED, "demo", "start"));
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(keep.try_recv().unwrap().event_type(), Some("loop_started"));
    }

    #[test]
    fn store_changes_become_task_events() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let change = TaskChange {
            kind: ChangeKind::StateChanged {
                from: TaskState::Running,
                to: TaskState::Done,
            },
            task: Task::new(3, "demo", "x", Priority::Med),
        };
        bus.on_change(&change);

        match rx.try_recv().unwrap() {
            BridgeMessage::Event(e) => {
                assert_eq!(e.event_type, events::TASK_CHANGED);
                assert_eq!(e.task_id, Some(3));
                assert_eq!(e.message, "running -> done");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
