//! HTTP transport against an in-memory control surface.

use std::sync::{Arc, Mutex};

use ap_bridge::control::{ControlError, ControlSurface, Result};
use ap_bridge::http::router;
use ap_bridge::hub::{Hub, Subscription};
use ap_bridge::snapshot::Snapshot;
use ap_core::types::{Priority, Task, TaskId, TaskState};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

// ===========================================================================
// Helpers
// ===========================================================================

#[derive(Default)]
struct FakeSurface {
    tasks: Mutex<Vec<Task>>,
    hub: Hub,
    refreshes: Mutex<usize>,
}

impl FakeSurface {
    fn find(&self, id: TaskId) -> Result<Task> {
        self.tasks
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or(ControlError::NotFound(id))
    }
}

#[async_trait]
impl ControlSurface for FakeSurface {
    async fn add_task(&self, project: &str, description: &str, priority: Priority) -> Result<Task> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = Task::new(tasks.len() as u64 + 1, project, description, priority);
        tasks.push(task.clone());
        Ok(task)
    }
    async fn mark_done(&self, id: TaskId) -> Result<Task> {
        let mut task = self.find(id)?;
        task.state = Some(TaskState::Done);
        Ok(task)
    }
    async fn archive(&self, id: TaskId) -> Result<Task> {
        self.find(id)
    }
    async fn replan(&self, id: TaskId) -> Result<Task> {
        self.find(id)
    }
    async fn stop_task(&self, id: TaskId) -> Result<()> {
        self.find(id).map(|_| ())
    }
    async fn toggle_autopilot(&self, id: TaskId) -> Result<Task> {
        self.find(id)
    }
    async fn set_all_autopilot(&self, _enabled: bool) -> Result<usize> {
        Ok(self.tasks.lock().unwrap().len())
    }
    async fn start_project(&self, project: &str) -> Result<()> {
        if project == "busy" {
            return Err(ControlError::Conflict("capacity exhausted".into()));
        }
        Ok(())
    }
    async fn stop_project(&self, _project: &str) -> Result<()> {
        Ok(())
    }
    fn snapshot(&self) -> Arc<Snapshot> {
        Arc::new(Snapshot::default())
    }
    fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }
    fn request_refresh(&self) {
        *self.refreshes.lock().unwrap() += 1;
    }
    fn task_log(&self, id: TaskId) -> Result<Vec<String>> {
        self.find(id).map(|t| vec![format!("log for #{}", t.id)])
    }
}

async fn send(app: axum::Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
    let resp = app.oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

fn control(body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/control")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

// ===========================================================================
// Tests
// ===========================================================================

#[tokio::test]
async fn add_task_then_fetch_its_log() {
    let surface = Arc::new(FakeSurface::default());
    let app = router(surface.clone(), None);

    let (status, json) = send(
        app.clone(),
        control(r#"{"type":"add_task","payload":{"project":"demo","description":"hello","priority":"high"}}"#),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["id"], 1);
    assert_eq!(json["priority"], "high");
    assert!(*surface.refreshes.lock().unwrap() >= 1);

    let req = Request::builder().uri("/api/tasks/1/log").body(Body::empty()).unwrap();
    let (status, json) = send(app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json[0], "log for #1");
}

#[tokio::test]
async fn errors_map_to_status_codes() {
    let app = router(Arc::new(FakeSurface::default()), None);

    let (status, _) = send(app.clone(), control(r#"{"type":"mark_done","payload":{"task_id":9}}"#)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, json) = send(
        app.clone(),
        control(r#"{"type":"start_project","payload":{"project":"busy"}}"#),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(json["error"].as_str().unwrap().contains("capacity exhausted"));

    let (status, _) = send(
        app,
        control(r#"{"type":"add_task","payload":{"project":"demo","description":"  "}}"#),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn snapshot_requires_password_when_configured() {
    let app = router(Arc::new(FakeSurface::default()), Some("pw".into()));

    let req = Request::builder().uri("/api/snapshot").body(Body::empty()).unwrap();
    let (status, _) = send(app.clone(), req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let req = Request::builder()
        .uri("/api/snapshot")
        .header("x-autopilot-password", "pw")
        .body(Body::empty())
        .unwrap();
    let (status, json) = send(app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert!(json["tasks"].as_array().unwrap().is_empty());
}
