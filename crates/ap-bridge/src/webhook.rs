//! Fire-and-forget outbound webhook for task lifecycle events.

use ap_core::task_store::{StoreObserver, TaskChange};
use ap_core::types::Task;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload {
    pub event: String,
    pub task: Task,
    pub time: DateTime<Utc>,
}

pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            url: url.into(),
            client,
        }
    }

    pub fn payload(change: &TaskChange) -> Option<WebhookPayload> {
        change.webhook_event().map(|event| WebhookPayload {
            event: event.to_string(),
            task: change.task.clone(),
            time: Utc::now(),
        })
    }
}

impl StoreObserver for WebhookNotifier {
    fn on_change(&self, change: &TaskChange) {
        let Some(payload) = Self::payload(change) else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(event = %payload.event, "no runtime available, webhook skipped");
            return;
        };
        let client = self.client.clone();
        let url = self.url.clone();
        runtime.spawn(async move {
            match client.post(&url).json(&payload).send().await {
                Ok(resp) if !resp.status().is_success() => {
                    warn!(status = %resp.status(), event = %payload.event, "webhook rejected");
                }
                Ok(_) => debug!(event = %payload.event, task_id = payload.task.id, "webhook delivered"),
                Err(e) => warn!(error = %e, event = %payload.event, "webhook delivery failed"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ap_core::task_store::ChangeKind;
    use ap_core::types::{Priority, TaskState};

    fn change(kind: ChangeKind) -> TaskChange {
        TaskChange {
            kind,
            task: Task::new(5, "demo", "ship it", Priority::High),
        }
    }

    #[test]
    fn only_lifecycle_events_produce_payloads() {
        assert!(WebhookNotifier::payload(&change(ChangeKind::Updated)).is_none());
        assert!(WebhookNotifier::payload(&change(ChangeKind::StateChanged {
            from: TaskState::Pending,
            to: TaskState::Planned,
        }))
        .is_none());

        let created = WebhookNotifier::payload(&change(ChangeKind::Created)).unwrap();
        let json = serde_json::to_value(&created).unwrap();
        assert_eq!(json["event"], "task_created");
        assert_eq!(json["task"]["id"], 5);
        assert!(json["time"].is_string());
    }

    #[test]
    fn notifying_outside_a_runtime_is_harmless() {
        let notifier = WebhookNotifier::new("http://127.0.0.1:9/hook");
        notifier.on_change(&change(ChangeKind::Created));
    }
}
