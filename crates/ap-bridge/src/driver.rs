//! Drives snapshot publication: on a timer, on explicit request, and after
//! state-change events, coalescing bursts into a single publish.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::event_bus::EventBus;
use crate::hub::Hub;
use crate::protocol::BridgeMessage;
use crate::snapshot::SnapshotAssembler;

/// Requests an out-of-band snapshot refresh. Cheap to clone.
#[derive(Clone)]
pub struct RefreshHandle {
    tx: flume::Sender<()>,
}

impl RefreshHandle {
    pub fn request(&self) {
        let _ = self.tx.try_send(());
    }
}

pub struct SnapshotDriver {
    assembler: Arc<SnapshotAssembler>,
    hub: Hub,
    bus: EventBus,
    interval: Duration,
    coalesce: Duration,
    refresh_rx: flume::Receiver<()>,
}

impl SnapshotDriver {
    pub fn new(assembler: Arc<SnapshotAssembler>, hub: Hub, bus: EventBus) -> (Self, RefreshHandle) {
        let (tx, refresh_rx) = flume::bounded(1);
        let driver = Self {
            assembler,
            hub,
            bus,
            interval: Duration::from_secs(5),
            coalesce: Duration::from_millis(200),
            refresh_rx,
        };
        (driver, RefreshHandle { tx })
    }

    /// Periodic refresh interval, floored at five seconds.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(Duration::from_secs(5));
        self
    }

    pub fn with_coalesce(mut self, window: Duration) -> Self {
        self.coalesce = window;
        self
    }

    pub async fn run(self, cancel: CancellationToken) {
        let events = self.bus.subscribe();
        let mut schedule = Schedule::new(self.interval, self.coalesce, Instant::now());
        info!(interval_secs = self.interval.as_secs(), "snapshot driver started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(schedule.wake_at()) => {
                    self.publish().await;
                    schedule.published(Instant::now());
                }
                Ok(()) = self.refresh_rx.recv_async() => schedule.changed(Instant::now()),
                Ok(msg) = events.recv_async() => {
                    self.hub.broadcast(msg);
                    schedule.changed(Instant::now());
                }
            }
        }
        info!("snapshot driver stopped");
    }

    async fn publish(&self) {
        let assembler = self.assembler.clone();
        match tokio::task::spawn_blocking(move || assembler.refresh()).await {
            Ok(snapshot) => {
                let stats = self
                    .hub
                    .broadcast(BridgeMessage::Snapshot(Box::new((*snapshot).clone())));
                debug!(delivered = stats.delivered, dropped = stats.dropped, "snapshot published");
            }
            Err(e) => warn!(error = %e, "snapshot refresh task failed"),
        }
    }
}

/// When the next snapshot goes out. Changes arm a coalesce deadline; with no
/// changes the periodic tick fires. Every publish clears the deadline and
/// pushes the tick a full interval out, so the two never publish back to back.
#[derive(Debug)]
struct Schedule {
    interval: Duration,
    coalesce: Duration,
    next_tick: Instant,
    deadline: Option<Instant>,
}

impl Schedule {
    /// The first tick is due immediately.
    fn new(interval: Duration, coalesce: Duration, now: Instant) -> Self {
        Self {
            interval,
            coalesce,
            next_tick: now,
            deadline: None,
        }
    }

    fn changed(&mut self, now: Instant) {
        self.deadline.get_or_insert(now + self.coalesce);
    }

    fn wake_at(&self) -> Instant {
        match self.deadline {
            Some(at) => at.min(self.next_tick),
            None => self.next_tick,
        }
    }

    fn published(&mut self, now: Instant) {
        self.deadline = None;
        self.next_tick = now + self.interval;
    }
}
