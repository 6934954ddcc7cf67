use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

pub fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

// ========================= Session Model =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApplicationSession {
    pub id: String,
    pub job_url: String,
    pub status: SessionStatus,
    #[serde(default)]
    pub current_step: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub tab_index: Option<usize>,
    #[serde(default)]
    pub screenshot_dir: Option<String>,
    pub created_at_ms: u128,
    pub updated_at_ms: u128,
}

impl ApplicationSession {
    pub fn new(id: impl Into<String>, job_url: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id: id.into(),
            job_url: job_url.into(),
            status: SessionStatus::Queued,
            current_step: None,
            error: None,
            tab_index: None,
            screenshot_dir: None,
            created_at_ms: now,
            updated_at_ms: now,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct TimelineEvent {
    pub session_id: String,
    pub event_type: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub timestamp_ms: u128,
}

impl TimelineEvent {
    pub fn new(
        session_id: impl Into<String>,
        event_type: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            event_type: event_type.into(),
            content: content.into(),
            screenshot_path: None,
            metadata: None,
            timestamp_ms: now_ms(),
        }
    }

    pub fn with_screenshot(mut self, path: impl Into<String>) -> Self {
        self.screenshot_path = Some(path.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

// ========================= Stream Events =========================

/// One event on a session's live activity feed.
#[derive(Clone, Debug, Serialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
    pub session_id: String,
    pub timestamp_ms: u128,
}

impl StreamEvent {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            session_id: String::new(),
            timestamp_ms: now_ms(),
        }
    }
}

// ========================= Seams =========================

/// Where live events go. The broker below fans them out to subscribers;
/// tests collect them in a Vec.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send(&self, session_id: &str, event: StreamEvent) -> anyhow::Result<()>;
}

/// Durable session state. All writes from the supervisor are best-effort:
/// a store failure is logged and never interrupts a run.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, session: ApplicationSession) -> anyhow::Result<()>;
    async fn get_session(&self, id: &str) -> anyhow::Result<Option<ApplicationSession>>;
    async fn update_status(
        &self,
        id: &str,
        status: SessionStatus,
        error: Option<String>,
    ) -> anyhow::Result<()>;
    async fn update_step(&self, id: &str, step: &str) -> anyhow::Result<()>;
    async fn update_tab_index(&self, id: &str, tab_index: usize) -> anyhow::Result<()>;
    async fn insert_timeline_event(&self, event: TimelineEvent) -> anyhow::Result<()>;
}

// ========================= In-Memory Store =========================

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, ApplicationSession>>,
    timeline: Mutex<Vec<TimelineEvent>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn timeline(&self) -> Vec<TimelineEvent> {
        self.timeline.lock().await.clone()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create_session(&self, session: ApplicationSession) -> anyhow::Result<()> {
        self.sessions
            .lock()
            .await
            .insert(session.id.clone(), session);
        Ok(())
    }

    async fn get_session(&self, id: &str) -> anyhow::Result<Option<ApplicationSession>> {
        Ok(self.sessions.lock().await.get(id).cloned())
    }

    async fn update_status(
        &self,
        id: &str,
        status: SessionStatus,
        error: Option<String>,
    ) -> anyhow::Result<()> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("session {id} not found"))?;
        session.status = status;
        if error.is_some() {
            session.error = error;
        }
        session.updated_at_ms = now_ms();
        Ok(())
    }

    async fn update_step(&self, id: &str, step: &str) -> anyhow::Result<()> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("session {id} not found"))?;
        session.current_step = Some(step.to_string());
        session.updated_at_ms = now_ms();
        Ok(())
    }

    async fn update_tab_index(&self, id: &str, tab_index: usize) -> anyhow::Result<()> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("session {id} not found"))?;
        session.tab_index = Some(tab_index);
        session.updated_at_ms = now_ms();
        Ok(())
    }

    async fn insert_timeline_event(&self, event: TimelineEvent) -> anyhow::Result<()> {
        self.timeline.lock().await.push(event);
        Ok(())
    }
}

// ========================= Stream Broker =========================

/// Fan-out point for live events. Each session gets one unbounded
/// channel; `None` on the channel is the end-of-stream sentinel sent
/// when the session is removed.
#[derive(Default)]
pub struct StreamBroker {
    streams: Mutex<HashMap<String, mpsc::UnboundedSender<Option<StreamEvent>>>>,
}

impl StreamBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, session_id: &str) -> mpsc::UnboundedReceiver<Option<StreamEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams
            .lock()
            .await
            .insert(session_id.to_string(), tx);
        debug!(session_id, "stream subscribed");
        rx
    }

    pub async fn remove(&self, session_id: &str) {
        if let Some(tx) = self.streams.lock().await.remove(session_id) {
            let _ = tx.send(None);
            debug!(session_id, "stream closed");
        }
    }

    pub async fn active_streams(&self) -> Vec<String> {
        self.streams.lock().await.keys().cloned().collect()
    }
}

#[async_trait]
impl EventSink for StreamBroker {
    async fn send(&self, session_id: &str, mut event: StreamEvent) -> anyhow::Result<()> {
        event.session_id = session_id.to_string();
        let streams = self.streams.lock().await;
        match streams.get(session_id) {
            Some(tx) => {
                if tx.send(Some(event)).is_err() {
                    warn!(session_id, "subscriber dropped, event discarded");
                }
            }
            None => warn!(session_id, "no active stream for session"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(SessionStatus::Paused).unwrap(),
            json!("paused")
        );
        let status: SessionStatus = serde_json::from_value(json!("running")).unwrap();
        assert_eq!(status, SessionStatus::Running);
    }

    #[test]
    fn stream_event_wire_shape() {
        let mut ev = StreamEvent::new("pause", json!({"reason": "review"}));
        ev.session_id = "abc".into();
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "pause");
        assert_eq!(v["session_id"], "abc");
        assert_eq!(v["data"]["reason"], "review");
    }

    #[tokio::test]
    async fn broker_delivers_then_signals_end() {
        let broker = StreamBroker::new();
        let mut rx = broker.subscribe("s1").await;

        broker
            .send("s1", StreamEvent::new("tool_call", json!({"tool": "click"})))
            .await
            .unwrap();
        let ev = rx.recv().await.unwrap().unwrap();
        assert_eq!(ev.event_type, "tool_call");
        assert_eq!(ev.session_id, "s1");

        broker.remove("s1").await;
        assert!(rx.recv().await.unwrap().is_none());
        assert!(broker.active_streams().await.is_empty());
    }

    #[tokio::test]
    async fn sending_without_subscriber_is_not_an_error() {
        let broker = StreamBroker::new();
        broker
            .send("ghost", StreamEvent::new("pause", json!({})))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn memory_store_updates_fields() {
        let store = MemorySessionStore::new();
        store
            .create_session(ApplicationSession::new("s1", "https://example.com/job"))
            .await
            .unwrap();

        store
            .update_status("s1", SessionStatus::Running, None)
            .await
            .unwrap();
        store.update_step("s1", "Clicking Apply").await.unwrap();
        store.update_tab_index("s1", 2).await.unwrap();

        let session = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Running);
        assert_eq!(session.current_step.as_deref(), Some("Clicking Apply"));
        assert_eq!(session.tab_index, Some(2));
        assert!(session.error.is_none());

        store
            .update_status("s1", SessionStatus::Paused, Some("boom".into()))
            .await
            .unwrap();
        let session = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(session.error.as_deref(), Some("boom"));

        assert!(store.get_session("missing").await.unwrap().is_none());
        assert!(store
            .update_step("missing", "nope")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn timeline_events_accumulate() {
        let store = MemorySessionStore::new();
        store
            .insert_timeline_event(
                TimelineEvent::new("s1", "pause", "paused for review")
                    .with_metadata(json!({"tool": "browser_click"})),
            )
            .await
            .unwrap();
        store
            .insert_timeline_event(
                TimelineEvent::new("s1", "screenshot", "captured").with_screenshot("shots/a.png"),
            )
            .await
            .unwrap();
        let timeline = store.timeline().await;
        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline[0].event_type, "pause");
        assert_eq!(timeline[1].screenshot_path.as_deref(), Some("shots/a.png"));
    }
}
