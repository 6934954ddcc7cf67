use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::agent::{AgentResult, ToolSupervisor};
use crate::agents::{apply_agent, apply_query, CandidateData};
use crate::browser::TabPool;
use crate::llm::ChatBackend;
use crate::session::{
    ApplicationSession, EventSink, SessionStatus, SessionStore, StreamEvent, TimelineEvent,
};
use crate::tools::BrowserTools;

/// Element descriptions that trigger a review pause before the click is
/// executed.
pub const SUBMIT_KEYWORDS: &[&str] = &["submit", "apply", "send application"];

pub fn is_submission_click(tool_name: &str, args: &Value) -> bool {
    if tool_name != "browser_click" {
        return false;
    }
    let element = args
        .get("element")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_lowercase();
    SUBMIT_KEYWORDS.iter().any(|kw| element.contains(kw))
}

/// Plain-English rendering of a tool call for the activity feed.
pub fn describe(tool_name: &str, args: &Value) -> String {
    let arg = |key: &str, fallback: &str| {
        args.get(key)
            .and_then(Value::as_str)
            .unwrap_or(fallback)
            .to_string()
    };
    match tool_name {
        "browser_navigate" => format!("Navigating to {}", arg("url", "page")),
        "browser_click" => format!("Clicking {}", arg("element", "element")),
        "browser_type" => format!("Typing into {}", arg("element", "field")),
        "browser_fill_form" => {
            let count = args
                .get("fields")
                .and_then(Value::as_array)
                .map(Vec::len)
                .unwrap_or(0);
            format!("Filling form with {count} fields")
        }
        "browser_file_upload" => "Uploading file".into(),
        "browser_select_option" => format!("Selecting option in {}", arg("element", "dropdown")),
        "browser_wait_for" => "Waiting for page to load".into(),
        "get_page_state" => "Analyzing page structure".into(),
        "browser_press_key" => format!("Pressing {}", arg("key", "key")),
        "browser_hover" => format!("Hovering over {}", arg("element", "element")),
        "browser_drag" => "Dragging element".into(),
        "browser_evaluate" => "Executing JavaScript".into(),
        "browser_take_screenshot" => "Taking screenshot".into(),
        "browser_console_messages" => "Reading console messages".into(),
        "browser_resize" => "Resizing browser window".into(),
        "browser_tabs" => "Managing browser tabs".into(),
        "browser_navigate_back" => "Going back to previous page".into(),
        other => format!("Executing {other}"),
    }
}

// ========================= Supervisor =========================

/// Wraps an agent run with live telemetry: tool-call events, a screenshot
/// after every successful action, and automatic pauses that block until
/// the session is externally set back to running.
pub struct StreamingSupervisor {
    session_id: String,
    sink: Arc<dyn EventSink>,
    store: Arc<dyn SessionStore>,
    /// Screenshot source; absent in contexts with no live page.
    tools: Option<Arc<BrowserTools>>,
    screenshot_dir: PathBuf,
    step_counter: AtomicUsize,
    poll_interval: Duration,
}

impl StreamingSupervisor {
    pub fn new(
        session_id: impl Into<String>,
        sink: Arc<dyn EventSink>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            sink,
            store,
            tools: None,
            screenshot_dir: PathBuf::from("screenshots"),
            step_counter: AtomicUsize::new(0),
            poll_interval: Duration::from_secs(2),
        }
    }

    pub fn with_tools(mut self, tools: Arc<BrowserTools>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_screenshot_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.screenshot_dir = dir.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn emit(&self, event_type: &str, data: Value) {
        if let Err(e) = self
            .sink
            .send(&self.session_id, StreamEvent::new(event_type, data))
            .await
        {
            warn!(session_id = %self.session_id, error = %e, "failed to emit event");
        }
    }

    async fn record_timeline(&self, event: TimelineEvent) {
        if let Err(e) = self.store.insert_timeline_event(event).await {
            warn!(session_id = %self.session_id, error = %e, "failed to insert timeline event");
        }
    }

    /// Saves `step_NNN_<tool>.png` plus a `latest.png` copy and returns
    /// the URL the frontend fetches it from.
    async fn capture_screenshot(&self, tool_name: &str) -> Option<String> {
        let tools = self.tools.as_ref()?;
        let step = self.step_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let filename = format!("step_{step:03}_{tool_name}.png");
        let bytes = match tools.screenshot_png(false).await {
            Ok(b) => b,
            Err(e) => {
                error!(session_id = %self.session_id, error = %e, "failed to capture screenshot");
                return None;
            }
        };
        let filepath = self.screenshot_dir.join(&filename);
        if let Err(e) = async {
            tokio::fs::create_dir_all(&self.screenshot_dir).await?;
            tokio::fs::write(&filepath, &bytes).await?;
            // Plain copy rather than a symlink so the pointer works on
            // every filesystem the screenshots land on.
            tokio::fs::write(self.screenshot_dir.join("latest.png"), &bytes).await?;
            anyhow::Ok(())
        }
        .await
        {
            error!(session_id = %self.session_id, error = %e, "failed to save screenshot");
            return None;
        }
        self.record_timeline(
            TimelineEvent::new(
                &self.session_id,
                "screenshot",
                format!("Screenshot captured after {tool_name}"),
            )
            .with_screenshot(filepath.to_string_lossy()),
        )
        .await;
        Some(format!(
            "/api/screenshots/{}/{}",
            self.session_id, filename
        ))
    }

    async fn pause_for_review(&self, reason: &str) {
        info!(session_id = %self.session_id, reason, "pausing agent");
        if let Err(e) = self
            .store
            .update_status(&self.session_id, SessionStatus::Paused, None)
            .await
        {
            error!(session_id = %self.session_id, error = %e, "failed to update session on pause");
        }
        self.record_timeline(TimelineEvent::new(&self.session_id, "pause", reason))
            .await;
        self.emit("pause", json!({"reason": reason})).await;
        self.wait_for_resume().await;
    }

    async fn handle_error(&self, tool_name: &str, error_text: &str) {
        let error_msg = format!("Error in {tool_name}: {error_text}");
        error!(session_id = %self.session_id, "{error_msg}");
        if let Err(e) = self
            .store
            .update_status(
                &self.session_id,
                SessionStatus::Paused,
                Some(error_msg.clone()),
            )
            .await
        {
            error!(session_id = %self.session_id, error = %e, "failed to update session on error");
        }
        self.record_timeline(
            TimelineEvent::new(&self.session_id, "error", &error_msg)
                .with_metadata(json!({"tool": tool_name})),
        )
        .await;
        self.emit("error", json!({"error": error_msg, "tool": tool_name}))
            .await;
        self.wait_for_resume().await;
    }

    /// Blocks until the session status is externally set back to running.
    /// A missing session ends the wait so the run can fail normally.
    async fn wait_for_resume(&self) {
        info!(session_id = %self.session_id, "waiting for resume signal");
        loop {
            sleep(self.poll_interval).await;
            match self.store.get_session(&self.session_id).await {
                Ok(None) => {
                    error!(session_id = %self.session_id, "session not found");
                    break;
                }
                Ok(Some(session)) if session.status == SessionStatus::Running => {
                    info!(session_id = %self.session_id, "session resumed");
                    self.emit("resume", json!({"message": "Agent resumed by user"}))
                        .await;
                    self.record_timeline(TimelineEvent::new(
                        &self.session_id,
                        "resume",
                        "Agent resumed",
                    ))
                    .await;
                    break;
                }
                Ok(Some(_)) => {}
                Err(e) => {
                    error!(session_id = %self.session_id, error = %e, "error checking resume status");
                    // Longer delay when the store itself is unhealthy.
                    sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }
}

#[async_trait]
impl ToolSupervisor for StreamingSupervisor {
    async fn before_tool(&self, name: &str, args: &Value) {
        let description = describe(name, args);
        let step = self.step_counter.load(Ordering::SeqCst) + 1;
        self.emit(
            "tool_call",
            json!({
                "tool": name,
                "description": description,
                "step": format!("Step {step}: {description}"),
                "arguments": args,
            }),
        )
        .await;
        if let Err(e) = self.store.update_step(&self.session_id, &description).await {
            warn!(session_id = %self.session_id, error = %e, "failed to update session step");
        }
        // The review gate sits before the click lands, so a paused user
        // can still stop the submission.
        if is_submission_click(name, args) {
            self.pause_for_review("Ready to submit application - paused for final review")
                .await;
        }
    }

    async fn after_tool(&self, name: &str, _args: &Value, result: &Value) {
        if let Some(err) = result.get("error").and_then(Value::as_str) {
            self.handle_error(name, err).await;
            return;
        }
        if let Some(url) = self.capture_screenshot(name).await {
            let step = self.step_counter.load(Ordering::SeqCst);
            self.emit(
                "screenshot",
                json!({"url": url, "step_number": step, "tool": name}),
            )
            .await;
        }
        // Honor a pause requested externally while the tool was running.
        match self.store.get_session(&self.session_id).await {
            Ok(Some(session)) if session.status == SessionStatus::Paused => {
                self.wait_for_resume().await;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "failed to check pause status");
            }
        }
    }
}

// ========================= Orchestration =========================

/// Runs one supervised application session end to end: session row,
/// dedicated tab, tool layer, supervised agent, final status.
pub async fn run_supervised(
    backend: Arc<dyn ChatBackend>,
    pool: &TabPool,
    store: Arc<dyn SessionStore>,
    sink: Arc<dyn EventSink>,
    session_id: &str,
    job_url: &str,
    candidate: &CandidateData,
    screenshot_root: impl Into<PathBuf>,
) -> anyhow::Result<AgentResult> {
    let screenshot_dir = screenshot_root.into().join(session_id);

    let mut session = ApplicationSession::new(session_id, job_url);
    session.status = SessionStatus::Running;
    session.screenshot_dir = Some(screenshot_dir.to_string_lossy().into_owned());
    store.create_session(session).await?;
    sink.send(
        session_id,
        StreamEvent::new(
            "status_update",
            json!({"status": "running", "message": "Starting application"}),
        ),
    )
    .await?;

    let (page, tab_index) = pool.create_for_session(session_id).await?;
    if let Err(e) = store.update_tab_index(session_id, tab_index).await {
        warn!(session_id, error = %e, "failed to record tab index");
    }

    let tools = Arc::new(
        BrowserTools::new(page, session_id)
            .await
            .with_browser(pool.browser())
            .with_artifact_dir(&screenshot_dir),
    );
    let supervisor = Arc::new(
        StreamingSupervisor::new(session_id, sink.clone(), store.clone())
            .with_tools(tools.clone())
            .with_screenshot_dir(&screenshot_dir),
    );

    let mut agent = apply_agent(backend, &tools).with_supervisor(supervisor);
    let result = agent.run(&apply_query(job_url, candidate)).await;

    if result.success {
        info!(session_id, iterations = result.iterations, "application run completed");
        if let Err(e) = store
            .update_status(session_id, SessionStatus::Completed, None)
            .await
        {
            warn!(session_id, error = %e, "failed to mark session completed");
        }
        sink.send(
            session_id,
            StreamEvent::new(
                "complete",
                json!({"report": result.output, "iterations": result.iterations}),
            ),
        )
        .await?;
    } else {
        let error_msg = result
            .error
            .clone()
            .unwrap_or_else(|| "Application run failed".into());
        error!(session_id, error = %error_msg, "application run failed");
        if let Err(e) = store
            .update_status(session_id, SessionStatus::Failed, Some(error_msg.clone()))
            .await
        {
            warn!(session_id, error = %e, "failed to mark session failed");
        }
        sink.send(session_id, StreamEvent::new("error", json!({"error": error_msg})))
            .await?;
    }

    pool.close_for_session(session_id).await;
    Ok(result)
}
