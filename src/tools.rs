use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::dom::SetFileInputFilesParams;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::cdp::js_protocol::runtime::{ConsoleApiCalledType, EventConsoleApiCalled};
use chromiumoxide::Page;
use futures::StreamExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::agent::{Tool, ToolHandler};
use crate::browser::{
    click_at, drag, modifier_mask, mouse_button, screenshot_b64, screenshot_bytes, set_viewport,
    Browser,
};
use crate::refs::PageIndex;
use crate::schema::schema_for;

const INTERACTION_TIMEOUT: Duration = Duration::from_secs(15);
const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(60);

// ========================= Tool Arguments =========================

fn default_button() -> String {
    "left".into()
}

fn default_level() -> String {
    "info".into()
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GetPageStateArgs {}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct NavigateArgs {
    pub url: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct NavigateBackArgs {}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ClickArgs {
    #[serde(rename = "ref")]
    pub ref_id: String,
    /// Human-readable description of the target, for the activity feed.
    #[serde(default)]
    pub element: Option<String>,
    #[serde(default, rename = "doubleClick")]
    pub double_click: bool,
    #[serde(default = "default_button")]
    pub button: String,
    #[serde(default)]
    pub modifiers: Vec<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct TypeArgs {
    #[serde(rename = "ref")]
    pub ref_id: String,
    #[serde(default)]
    pub element: Option<String>,
    pub text: String,
    /// Press Enter after typing.
    #[serde(default)]
    pub submit: bool,
    /// Type character by character for inputs with per-key handlers.
    #[serde(default)]
    pub slowly: bool,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct FormField {
    pub name: String,
    #[serde(rename = "ref")]
    pub ref_id: String,
    /// One of: textbox, checkbox, radio, combobox, slider.
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct FillFormArgs {
    pub fields: Vec<FormField>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SelectOptionArgs {
    #[serde(rename = "ref")]
    pub ref_id: String,
    #[serde(default)]
    pub element: Option<String>,
    pub values: Vec<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct HoverArgs {
    #[serde(rename = "ref")]
    pub ref_id: String,
    #[serde(default)]
    pub element: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DragArgs {
    #[serde(rename = "startRef")]
    pub start_ref: String,
    #[serde(rename = "endRef")]
    pub end_ref: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct PressKeyArgs {
    pub key: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct FileUploadArgs {
    pub paths: Vec<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct WaitForArgs {
    /// Seconds to sleep unconditionally.
    #[serde(default)]
    pub time: Option<f64>,
    /// Wait until this text is present on the page.
    #[serde(default)]
    pub text: Option<String>,
    /// Wait until this text disappears from the page.
    #[serde(default, rename = "textGone")]
    pub text_gone: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct TakeScreenshotArgs {
    #[serde(default, rename = "ref")]
    pub ref_id: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default, rename = "fullPage")]
    pub full_page: bool,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct EvaluateArgs {
    /// JavaScript function body, e.g. `() => document.title` or
    /// `(el) => el.textContent` when a ref is given.
    pub function: String,
    #[serde(default, rename = "ref")]
    pub ref_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ResizeArgs {
    pub width: i64,
    pub height: i64,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct TabsArgs {
    /// One of: list, new, select, close.
    pub action: String,
    #[serde(default)]
    pub index: Option<usize>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ConsoleMessagesArgs {
    /// Minimum severity: error, warning, info, or debug.
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CloseArgs {}

// ========================= Console Capture =========================

#[derive(Clone, Debug, Serialize)]
pub struct ConsoleEntry {
    pub level: String,
    pub text: String,
}

fn severity(level: &str) -> usize {
    match level {
        "error" => 0,
        "warning" => 1,
        "info" | "log" => 2,
        _ => 3,
    }
}

pub fn console_filter(entries: &[ConsoleEntry], level: &str) -> Vec<ConsoleEntry> {
    let cutoff = severity(level);
    entries
        .iter()
        .filter(|e| severity(&e.level) <= cutoff)
        .cloned()
        .collect()
}

fn console_level(kind: &ConsoleApiCalledType) -> &'static str {
    match kind {
        ConsoleApiCalledType::Error => "error",
        ConsoleApiCalledType::Warning => "warning",
        ConsoleApiCalledType::Info => "info",
        ConsoleApiCalledType::Debug => "debug",
        _ => "log",
    }
}

// ========================= Pure Helpers =========================

/// First upload path that does not exist on disk, if any. Checked before
/// touching the page so a bad path never consumes a file input.
pub fn missing_upload_path(paths: &[String]) -> Option<&str> {
    paths
        .iter()
        .map(String::as_str)
        .find(|p| !Path::new(p).exists())
}

/// Expression wrapper for the evaluate tool: the model supplies a JS
/// function; we invoke it, optionally with the ref's element as argument.
pub fn build_eval_expr(function: &str, selector: Option<&str>) -> String {
    match selector {
        Some(sel) => {
            let sel_lit = serde_json::to_string(sel).unwrap_or_else(|_| "\"\"".into());
            format!("(() => ({function})(document.querySelector({sel_lit})))()")
        }
        None => format!("(() => ({function})())()"),
    }
}

fn js_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".into())
}

// ========================= Browser Tools =========================

/// Uniform action layer over one page. Every operation returns a JSON
/// value; failures come back as `{"error": ..., "screenshot_base64": ...}`
/// instead of propagating, so the agent loop can always continue.
pub struct BrowserTools {
    page: Mutex<Page>,
    index: Mutex<PageIndex>,
    console: Arc<StdMutex<Vec<ConsoleEntry>>>,
    session_id: String,
    browser: Option<Arc<Browser>>,
    artifact_dir: PathBuf,
}

impl BrowserTools {
    pub async fn new(page: Page, session_id: impl Into<String>) -> Self {
        let console: Arc<StdMutex<Vec<ConsoleEntry>>> = Arc::default();
        match page.event_listener::<EventConsoleApiCalled>().await {
            Ok(mut events) => {
                let sink = console.clone();
                tokio::spawn(async move {
                    while let Some(ev) = events.next().await {
                        let text = ev
                            .args
                            .iter()
                            .filter_map(|a| a.value.as_ref().map(|v| v.to_string()))
                            .collect::<Vec<_>>()
                            .join(" ");
                        if let Ok(mut logs) = sink.lock() {
                            logs.push(ConsoleEntry {
                                level: console_level(&ev.r#type).into(),
                                text,
                            });
                        }
                    }
                });
            }
            Err(e) => warn!(error = %e, "console listener unavailable"),
        }
        Self {
            page: Mutex::new(page),
            index: Mutex::new(PageIndex::default()),
            console,
            session_id: session_id.into(),
            browser: None,
            artifact_dir: PathBuf::from("screenshots"),
        }
    }

    /// Enables the tabs tool; without a browser handle tab management
    /// reports itself unavailable.
    pub fn with_browser(mut self, browser: Arc<Browser>) -> Self {
        self.browser = Some(browser);
        self
    }

    pub fn with_artifact_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifact_dir = dir.into();
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn page(&self) -> Page {
        self.page.lock().await.clone()
    }

    pub async fn screenshot_png(&self, full_page: bool) -> anyhow::Result<Vec<u8>> {
        let page = self.page().await;
        screenshot_bytes(&page, full_page).await
    }

    async fn fail(&self, prefix: &str, detail: impl std::fmt::Display) -> Value {
        let page = self.page().await;
        let screenshot = screenshot_b64(&page, false).await.unwrap_or_default();
        warn!(session_id = %self.session_id, "{prefix}: {detail}");
        json!({
            "error": format!("{prefix}: {detail}"),
            "screenshot_base64": screenshot,
        })
    }

    async fn resolve_ref(&self, ref_id: &str) -> Result<String, Value> {
        let resolved = {
            let index = self.index.lock().await;
            index.selector(ref_id).map(str::to_string)
        };
        match resolved {
            Ok(s) => Ok(s),
            Err(e) => Err(self.fail("Invalid reference", e).await),
        }
    }

    // ----- snapshot -----

    pub async fn get_page_state(&self, _args: GetPageStateArgs) -> Value {
        let page = self.page().await;
        // Settle time so snapshots taken right after an action do not
        // observe a page mid-transition.
        sleep(Duration::from_millis(500)).await;
        let mut index = self.index.lock().await;
        match index.snapshot(&page).await {
            Ok(report) => Value::String(report.page_state_text()),
            Err(e) => Value::String(format!("Failed to get page state: {e}")),
        }
    }

    // ----- navigation -----

    pub async fn navigate(&self, args: NavigateArgs) -> Value {
        let page = self.page().await;
        let nav = async {
            page.goto(args.url.as_str()).await?;
            page.wait_for_navigation().await?;
            anyhow::Ok(())
        };
        match timeout(NAVIGATION_TIMEOUT, nav).await {
            Ok(Ok(())) => {
                info!(session_id = %self.session_id, url = %args.url, "navigated");
                json!({"message": format!("Navigated to {}", args.url)})
            }
            Ok(Err(e)) => self.fail("Navigation failed", e).await,
            Err(_) => self.fail("Navigation failed", "timed out after 60s").await,
        }
    }

    pub async fn navigate_back(&self, _args: NavigateBackArgs) -> Value {
        let page = self.page().await;
        let nav = async {
            page.evaluate("history.back()").await?;
            page.wait_for_navigation().await?;
            anyhow::Ok(())
        };
        match timeout(NAVIGATION_TIMEOUT, nav).await {
            Ok(Ok(())) => json!({"message": "Navigated back"}),
            Ok(Err(e)) => self.fail("Go back failed", e).await,
            Err(_) => self.fail("Go back failed", "timed out after 60s").await,
        }
    }

    // ----- interaction -----

    pub async fn click(&self, args: ClickArgs) -> Value {
        let selector = match self.resolve_ref(&args.ref_id).await {
            Ok(s) => s,
            Err(e) => return e,
        };
        let page = self.page().await;
        let count = if args.double_click { 2 } else { 1 };
        let button = mouse_button(&args.button);
        let modifiers = modifier_mask(&args.modifiers);
        let action = async {
            let element = page.find_element(selector.as_str()).await?;
            let point = element.clickable_point().await?;
            click_at(&page, point.x, point.y, button, count, modifiers).await?;
            anyhow::Ok(())
        };
        match timeout(INTERACTION_TIMEOUT, action).await {
            Ok(Ok(())) => {
                // Give potential navigation or dynamic updates a moment so
                // the next snapshot is not racing the click.
                sleep(Duration::from_millis(300)).await;
                json!({"message": format!("Clicked element {}", args.ref_id)})
            }
            Ok(Err(e)) => self.fail("Click failed", e).await,
            Err(_) => self.fail("Click failed", "timed out after 15s").await,
        }
    }

    pub async fn hover(&self, args: HoverArgs) -> Value {
        let selector = match self.resolve_ref(&args.ref_id).await {
            Ok(s) => s,
            Err(e) => return e,
        };
        let page = self.page().await;
        let action = async {
            let element = page.find_element(selector.as_str()).await?;
            let point = element.clickable_point().await?;
            page.move_mouse(point).await?;
            anyhow::Ok(())
        };
        match timeout(INTERACTION_TIMEOUT, action).await {
            Ok(Ok(())) => json!({"message": format!("Hovered over element {}", args.ref_id)}),
            Ok(Err(e)) => self.fail("Hover failed", e).await,
            Err(_) => self.fail("Hover failed", "timed out after 15s").await,
        }
    }

    pub async fn type_text(&self, args: TypeArgs) -> Value {
        let selector = match self.resolve_ref(&args.ref_id).await {
            Ok(s) => s,
            Err(e) => return e,
        };
        let page = self.page().await;
        let action = async {
            let element = page.find_element(selector.as_str()).await?;
            element.click().await?;
            // Clear any existing content so typing replaces rather than appends.
            page.evaluate(format!(
                "(() => {{ const el = document.querySelector({}); if (el) {{ el.value = ''; \
                 el.dispatchEvent(new Event('input', {{bubbles: true}})); }} }})()",
                js_string(&selector)
            ))
            .await?;
            if args.slowly {
                for ch in args.text.chars() {
                    element.type_str(ch.to_string()).await?;
                    sleep(Duration::from_millis(100)).await;
                }
            } else {
                element.type_str(args.text.as_str()).await?;
            }
            if args.submit {
                element.press_key("Enter").await?;
                sleep(Duration::from_millis(300)).await;
            }
            anyhow::Ok(())
        };
        match timeout(INTERACTION_TIMEOUT, action).await {
            Ok(Ok(())) => json!({"message": format!("Typed into element {}", args.ref_id)}),
            Ok(Err(e)) => self.fail("Type failed", e).await,
            Err(_) => self.fail("Type failed", "timed out after 15s").await,
        }
    }

    pub async fn fill_form(&self, args: FillFormArgs) -> Value {
        let page = self.page().await;
        let mut results = Vec::new();
        for field in &args.fields {
            let resolved = {
                let index = self.index.lock().await;
                index.selector(&field.ref_id).map(str::to_string)
            };
            let selector = match resolved {
                Ok(s) => s,
                Err(_) => {
                    results.push(format!(
                        "Field '{}': Invalid reference {}",
                        field.name, field.ref_id
                    ));
                    continue;
                }
            };
            let outcome = timeout(
                Duration::from_secs(5),
                self.set_field(&page, &selector, &field.kind, &field.value),
            )
            .await;
            match outcome {
                Ok(Ok(())) => results.push(format!("Field '{}': Success", field.name)),
                Ok(Err(e)) => {
                    let mut res = self.fail("Fill form failed", e).await;
                    res["partial_results"] = json!(results);
                    return res;
                }
                Err(_) => {
                    let mut res = self.fail("Fill form failed", "timed out after 5s").await;
                    res["partial_results"] = json!(results);
                    return res;
                }
            }
            // Small delay between fields for stability.
            sleep(Duration::from_millis(500)).await;
        }
        json!({"message": results.join("\n")})
    }

    async fn set_field(
        &self,
        page: &Page,
        selector: &str,
        kind: &str,
        value: &str,
    ) -> anyhow::Result<()> {
        let sel = js_string(selector);
        let val = js_string(value);
        let script = match kind {
            "textbox" | "slider" => format!(
                "(() => {{ const el = document.querySelector({sel}); if (!el) return 'missing'; \
                 el.value = {val}; \
                 el.dispatchEvent(new Event('input', {{bubbles: true}})); \
                 el.dispatchEvent(new Event('change', {{bubbles: true}})); return 'ok'; }})()"
            ),
            "checkbox" | "radio" => format!(
                "(() => {{ const el = document.querySelector({sel}); if (!el) return 'missing'; \
                 el.checked = {val} === 'true'; \
                 el.dispatchEvent(new Event('change', {{bubbles: true}})); return 'ok'; }})()"
            ),
            "combobox" => format!(
                "(() => {{ const el = document.querySelector({sel}); if (!el) return 'missing'; \
                 const v = {val}; \
                 for (const opt of el.options) {{ \
                   opt.selected = opt.value === v || opt.textContent.trim() === v; }} \
                 el.dispatchEvent(new Event('change', {{bubbles: true}})); return 'ok'; }})()"
            ),
            other => anyhow::bail!("unsupported field type '{other}'"),
        };
        let status: String = page.evaluate(script).await?.into_value()?;
        if status == "missing" {
            anyhow::bail!("element not found for selector {selector}");
        }
        Ok(())
    }

    pub async fn select_option(&self, args: SelectOptionArgs) -> Value {
        let selector = match self.resolve_ref(&args.ref_id).await {
            Ok(s) => s,
            Err(e) => return e,
        };
        let page = self.page().await;
        let sel = js_string(&selector);
        let values = serde_json::to_string(&args.values).unwrap_or_else(|_| "[]".into());
        let script = format!(
            "(() => {{ const el = document.querySelector({sel}); if (!el) return 'missing'; \
             const values = {values}; \
             for (const opt of el.options) {{ \
               opt.selected = values.includes(opt.value) || values.includes(opt.textContent.trim()); }} \
             el.dispatchEvent(new Event('change', {{bubbles: true}})); return 'ok'; }})()"
        );
        let action = async {
            let status: String = page.evaluate(script).await?.into_value()?;
            if status == "missing" {
                anyhow::bail!("element not found for selector {selector}");
            }
            anyhow::Ok(())
        };
        match timeout(INTERACTION_TIMEOUT, action).await {
            Ok(Ok(())) => json!({"message": format!("Selected options for element {}", args.ref_id)}),
            Ok(Err(e)) => self.fail("Select failed", e).await,
            Err(_) => self.fail("Select failed", "timed out after 15s").await,
        }
    }

    pub async fn drag_element(&self, args: DragArgs) -> Value {
        let start = match self.resolve_ref(&args.start_ref).await {
            Ok(s) => s,
            Err(e) => return e,
        };
        let end = match self.resolve_ref(&args.end_ref).await {
            Ok(s) => s,
            Err(e) => return e,
        };
        let page = self.page().await;
        let action = async {
            let from = page
                .find_element(start.as_str())
                .await?
                .clickable_point()
                .await?;
            let to = page
                .find_element(end.as_str())
                .await?
                .clickable_point()
                .await?;
            drag(&page, from, to).await?;
            anyhow::Ok(())
        };
        match timeout(INTERACTION_TIMEOUT, action).await {
            Ok(Ok(())) => {
                json!({"message": format!("Dragged {} to {}", args.start_ref, args.end_ref)})
            }
            Ok(Err(e)) => self.fail("Drag failed", e).await,
            Err(_) => self.fail("Drag failed", "timed out after 15s").await,
        }
    }

    pub async fn press_key(&self, args: PressKeyArgs) -> Value {
        let page = self.page().await;
        let key = js_string(&args.key);
        let script = format!(
            "(() => {{ const el = document.activeElement || document.body; \
             const opts = {{key: {key}, code: {key}, bubbles: true}}; \
             el.dispatchEvent(new KeyboardEvent('keydown', opts)); \
             el.dispatchEvent(new KeyboardEvent('keyup', opts)); }})()"
        );
        match page.evaluate(script).await {
            Ok(_) => json!({"message": format!("Pressed key: {}", args.key)}),
            Err(e) => self.fail("Press key failed", e).await,
        }
    }

    pub async fn file_upload(&self, args: FileUploadArgs) -> Value {
        if args.paths.is_empty() {
            return json!({"message": "File chooser cancelled (no paths provided)"});
        }
        // Validate before touching the page.
        if let Some(path) = missing_upload_path(&args.paths) {
            return self.fail("File not found", path).await;
        }
        let page = self.page().await;
        let inputs = match page.find_elements("input[type=\"file\"]").await {
            Ok(els) => els,
            Err(e) => return self.fail("File upload failed", e).await,
        };
        if inputs.is_empty() {
            return self
                .fail("File upload failed", "no file input elements found on the page")
                .await;
        }
        for input in &inputs {
            let params = SetFileInputFilesParams::builder()
                .files(args.paths.clone())
                .node_id(input.node_id)
                .build();
            let params = match params {
                Ok(p) => p,
                Err(e) => return self.fail("File upload failed", e).await,
            };
            if page.execute(params).await.is_ok() {
                let names: Vec<&str> = args
                    .paths
                    .iter()
                    .map(|p| {
                        Path::new(p)
                            .file_name()
                            .and_then(|n| n.to_str())
                            .unwrap_or(p.as_str())
                    })
                    .collect();
                info!(session_id = %self.session_id, files = ?names, "files uploaded");
                return json!({
                    "message": format!(
                        "Successfully uploaded {} file(s): {}",
                        args.paths.len(),
                        names.join(", ")
                    )
                });
            }
        }
        self.fail(
            "File upload failed",
            "could not attach files to any file input element",
        )
        .await
    }

    pub async fn wait_for(&self, args: WaitForArgs) -> Value {
        if let Some(secs) = args.time {
            sleep(Duration::from_secs_f64(secs.max(0.0))).await;
        }
        let page = self.page().await;
        if let Some(text) = &args.text {
            if let Err(e) = wait_for_text(&page, text, true).await {
                return self.fail("Wait failed", e).await;
            }
        }
        if let Some(text) = &args.text_gone {
            if let Err(e) = wait_for_text(&page, text, false).await {
                return self.fail("Wait failed", e).await;
            }
        }
        json!({"message": "Wait complete"})
    }

    pub async fn take_screenshot(&self, args: TakeScreenshotArgs) -> Value {
        let page = self.page().await;
        let bytes = if let Some(ref_id) = &args.ref_id {
            let selector = match self.resolve_ref(ref_id).await {
                Ok(s) => s,
                Err(e) => return e,
            };
            let shot = async {
                let element = page.find_element(selector.as_str()).await?;
                anyhow::Ok(element.screenshot(CaptureScreenshotFormat::Png).await?)
            };
            match shot.await {
                Ok(b) => b,
                Err(e) => return json!({"error": format!("Screenshot failed: {e}")}),
            }
        } else {
            match screenshot_bytes(&page, args.full_page).await {
                Ok(b) => b,
                Err(e) => return json!({"error": format!("Screenshot failed: {e}")}),
            }
        };
        let b64 = {
            use base64::{engine::general_purpose::STANDARD, Engine};
            STANDARD.encode(&bytes)
        };
        if let Some(filename) = &args.filename {
            let path = self.artifact_dir.join(filename);
            if let Err(e) = write_artifact(&path, &bytes).await {
                return json!({"error": format!("Screenshot failed: {e}")});
            }
            return json!({
                "message": format!("Screenshot saved to {}", path.display()),
                "screenshot_base64": b64,
            });
        }
        json!({"message": "Screenshot taken", "screenshot_base64": b64})
    }

    pub async fn evaluate(&self, args: EvaluateArgs) -> Value {
        let selector = match &args.ref_id {
            Some(ref_id) => match self.resolve_ref(ref_id).await {
                Ok(s) => Some(s),
                Err(e) => return e,
            },
            None => None,
        };
        let page = self.page().await;
        let expr = build_eval_expr(&args.function, selector.as_deref());
        match page.evaluate(expr).await {
            Ok(result) => {
                let value = result.into_value::<Value>().unwrap_or(Value::Null);
                json!({"result": value})
            }
            Err(e) => self.fail("Evaluate failed", e).await,
        }
    }

    pub async fn resize(&self, args: ResizeArgs) -> Value {
        let page = self.page().await;
        match set_viewport(&page, args.width, args.height).await {
            Ok(()) => json!({"message": format!("Resized to {}x{}", args.width, args.height)}),
            Err(e) => self.fail("Resize failed", e).await,
        }
    }

    pub async fn tabs(&self, args: TabsArgs) -> Value {
        let Some(browser) = &self.browser else {
            return json!({"error": "Tab management is not available in this context"});
        };
        let pages = match browser.pages().await {
            Ok(p) => p,
            Err(e) => return json!({"error": format!("Tabs action failed: {e}")}),
        };
        match args.action.as_str() {
            "list" => {
                let mut listing = Vec::new();
                for (i, p) in pages.iter().enumerate() {
                    let url = p.url().await.ok().flatten().unwrap_or_default();
                    let title = p.get_title().await.ok().flatten().unwrap_or_default();
                    listing.push(json!({"index": i, "url": url, "title": title}));
                }
                json!({"pages": listing})
            }
            "new" => match browser.new_page().await {
                Ok(_) => json!({"message": "New tab opened", "index": pages.len()}),
                Err(e) => json!({"error": format!("Tabs action failed: {e}")}),
            },
            "select" => {
                let Some(index) = args.index.filter(|i| *i < pages.len()) else {
                    return json!({"error": "Invalid index"});
                };
                let target = pages[index].clone();
                if let Err(e) = target.bring_to_front().await {
                    return json!({"error": format!("Tabs action failed: {e}")});
                }
                *self.page.lock().await = target;
                json!({"message": format!("Selected tab {index}")})
            }
            "close" => {
                let current = self.page().await;
                let index = match args.index {
                    Some(i) if i < pages.len() => i,
                    Some(_) => return json!({"error": "Invalid index"}),
                    None => {
                        let current_id = current.target_id().clone();
                        match pages.iter().position(|p| *p.target_id() == current_id) {
                            Some(i) => i,
                            None => return json!({"error": "Invalid index"}),
                        }
                    }
                };
                match pages[index].clone().close().await {
                    Ok(()) => json!({"message": format!("Closed tab {index}")}),
                    Err(e) => json!({"error": format!("Tabs action failed: {e}")}),
                }
            }
            other => json!({"error": format!("Unknown tabs action '{other}'")}),
        }
    }

    pub async fn console_messages(&self, args: ConsoleMessagesArgs) -> Value {
        let filtered = {
            let logs = match self.console.lock() {
                Ok(l) => l,
                Err(_) => return json!({"error": "Console log unavailable"}),
            };
            console_filter(&logs, &args.level)
        };
        if let Some(filename) = &args.filename {
            let path = self.artifact_dir.join(filename);
            let body = serde_json::to_vec(&filtered).unwrap_or_default();
            if let Err(e) = write_artifact(&path, &body).await {
                return json!({"error": format!("Failed to save logs: {e}")});
            }
            return json!({"message": format!("Logs saved to {}", path.display())});
        }
        json!({"messages": filtered})
    }

    pub async fn close(&self, _args: CloseArgs) -> Value {
        let page = self.page().await;
        match page.close().await {
            Ok(()) => json!({"message": "Browser closed"}),
            // No screenshot for close failure as the page may be gone.
            Err(e) => json!({"error": format!("Close failed: {e}")}),
        }
    }
}

async fn wait_for_text(page: &Page, text: &str, want_present: bool) -> anyhow::Result<()> {
    let needle = js_string(text);
    let script =
        format!("(() => (document.body ? document.body.innerText : '').includes({needle}))()");
    let deadline = tokio::time::Instant::now() + INTERACTION_TIMEOUT;
    loop {
        let present: bool = page
            .evaluate(script.as_str())
            .await?
            .into_value()
            .unwrap_or(false);
        if present == want_present {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            if want_present {
                anyhow::bail!("text '{text}' did not appear within 15s");
            }
            anyhow::bail!("text '{text}' did not disappear within 15s");
        }
        sleep(Duration::from_millis(500)).await;
    }
}

async fn write_artifact(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, bytes).await?;
    Ok(())
}

// ========================= Registry =========================

#[derive(Clone, Copy)]
enum ToolOp {
    GetPageState,
    Navigate,
    NavigateBack,
    Click,
    Type,
    FillForm,
    SelectOption,
    Hover,
    Drag,
    PressKey,
    FileUpload,
    WaitFor,
    TakeScreenshot,
    Evaluate,
    Resize,
    Tabs,
    ConsoleMessages,
    Close,
}

struct OpHandler {
    tools: Arc<BrowserTools>,
    op: ToolOp,
}

macro_rules! run_op {
    ($tools:expr, $args:expr, $ty:ty, $method:ident) => {
        match serde_json::from_value::<$ty>($args) {
            Ok(parsed) => $tools.$method(parsed).await,
            Err(e) => json!({"error": format!("Invalid arguments: {e}")}),
        }
    };
}

#[async_trait]
impl ToolHandler for OpHandler {
    async fn call(&self, args: Value) -> Value {
        let t = &self.tools;
        debug!(session_id = %t.session_id, "browser tool invoked");
        match self.op {
            ToolOp::GetPageState => run_op!(t, args, GetPageStateArgs, get_page_state),
            ToolOp::Navigate => run_op!(t, args, NavigateArgs, navigate),
            ToolOp::NavigateBack => run_op!(t, args, NavigateBackArgs, navigate_back),
            ToolOp::Click => run_op!(t, args, ClickArgs, click),
            ToolOp::Type => run_op!(t, args, TypeArgs, type_text),
            ToolOp::FillForm => run_op!(t, args, FillFormArgs, fill_form),
            ToolOp::SelectOption => run_op!(t, args, SelectOptionArgs, select_option),
            ToolOp::Hover => run_op!(t, args, HoverArgs, hover),
            ToolOp::Drag => run_op!(t, args, DragArgs, drag_element),
            ToolOp::PressKey => run_op!(t, args, PressKeyArgs, press_key),
            ToolOp::FileUpload => run_op!(t, args, FileUploadArgs, file_upload),
            ToolOp::WaitFor => run_op!(t, args, WaitForArgs, wait_for),
            ToolOp::TakeScreenshot => run_op!(t, args, TakeScreenshotArgs, take_screenshot),
            ToolOp::Evaluate => run_op!(t, args, EvaluateArgs, evaluate),
            ToolOp::Resize => run_op!(t, args, ResizeArgs, resize),
            ToolOp::Tabs => run_op!(t, args, TabsArgs, tabs),
            ToolOp::ConsoleMessages => run_op!(t, args, ConsoleMessagesArgs, console_messages),
            ToolOp::Close => run_op!(t, args, CloseArgs, close),
        }
    }
}

impl BrowserTools {
    /// The full tool table handed to the agent.
    pub fn registry(self: &Arc<Self>) -> Vec<Tool> {
        let specs: Vec<(ToolOp, &str, &str, Value)> = vec![
            (
                ToolOp::GetPageState,
                "get_page_state",
                "Snapshot the current page: title, URL, and interactive elements with refs. \
                 Call this before interacting with any element.",
                schema_for::<GetPageStateArgs>(),
            ),
            (
                ToolOp::Navigate,
                "browser_navigate",
                "Navigate the page to a URL",
                schema_for::<NavigateArgs>(),
            ),
            (
                ToolOp::NavigateBack,
                "browser_navigate_back",
                "Go back to the previous page",
                schema_for::<NavigateBackArgs>(),
            ),
            (
                ToolOp::Click,
                "browser_click",
                "Click an element by ref. Supports double click, right/middle button, and modifiers.",
                schema_for::<ClickArgs>(),
            ),
            (
                ToolOp::Type,
                "browser_type",
                "Type text into an element by ref, replacing existing content. \
                 Set submit=true to press Enter afterwards.",
                schema_for::<TypeArgs>(),
            ),
            (
                ToolOp::FillForm,
                "browser_fill_form",
                "Fill multiple form fields in one call. Supported field types: \
                 textbox, checkbox, radio, combobox, slider.",
                schema_for::<FillFormArgs>(),
            ),
            (
                ToolOp::SelectOption,
                "browser_select_option",
                "Select options in a dropdown by value or visible text",
                schema_for::<SelectOptionArgs>(),
            ),
            (
                ToolOp::Hover,
                "browser_hover",
                "Hover the mouse over an element by ref",
                schema_for::<HoverArgs>(),
            ),
            (
                ToolOp::Drag,
                "browser_drag",
                "Drag one element onto another by refs",
                schema_for::<DragArgs>(),
            ),
            (
                ToolOp::PressKey,
                "browser_press_key",
                "Press a keyboard key (e.g. Enter, Tab, Escape)",
                schema_for::<PressKeyArgs>(),
            ),
            (
                ToolOp::FileUpload,
                "browser_file_upload",
                "Attach local files to a file input on the page",
                schema_for::<FileUploadArgs>(),
            ),
            (
                ToolOp::WaitFor,
                "browser_wait_for",
                "Wait for a duration, for text to appear, or for text to disappear",
                schema_for::<WaitForArgs>(),
            ),
            (
                ToolOp::TakeScreenshot,
                "browser_take_screenshot",
                "Capture a screenshot of the page or a single element",
                schema_for::<TakeScreenshotArgs>(),
            ),
            (
                ToolOp::Evaluate,
                "browser_evaluate",
                "Run a JavaScript function on the page, optionally against a ref's element",
                schema_for::<EvaluateArgs>(),
            ),
            (
                ToolOp::Resize,
                "browser_resize",
                "Resize the viewport",
                schema_for::<ResizeArgs>(),
            ),
            (
                ToolOp::Tabs,
                "browser_tabs",
                "Manage tabs: list, new, select, close",
                schema_for::<TabsArgs>(),
            ),
            (
                ToolOp::ConsoleMessages,
                "browser_console_messages",
                "Return captured console messages at or above a severity level",
                schema_for::<ConsoleMessagesArgs>(),
            ),
            (
                ToolOp::Close,
                "browser_close",
                "Close the current page",
                schema_for::<CloseArgs>(),
            ),
        ];
        specs
            .into_iter()
            .map(|(op, name, desc, params)| {
                Tool::new(
                    name,
                    desc,
                    params,
                    Arc::new(OpHandler {
                        tools: self.clone(),
                        op,
                    }),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_upload_path_flags_first_absent_file() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("resume.pdf");
        std::fs::write(&real, b"pdf").unwrap();
        let real = real.to_string_lossy().to_string();

        assert!(missing_upload_path(&[real.clone()]).is_none());
        let paths = vec![real, "/definitely/not/here.pdf".to_string()];
        assert_eq!(missing_upload_path(&paths), Some("/definitely/not/here.pdf"));
    }

    #[test]
    fn click_args_apply_defaults() {
        let args: ClickArgs = serde_json::from_value(json!({"ref": "3"})).unwrap();
        assert_eq!(args.ref_id, "3");
        assert!(!args.double_click);
        assert_eq!(args.button, "left");
        assert!(args.modifiers.is_empty());

        let args: ClickArgs = serde_json::from_value(json!({
            "ref": "3", "doubleClick": true, "button": "right", "modifiers": ["Shift"]
        }))
        .unwrap();
        assert!(args.double_click);
        assert_eq!(args.button, "right");
    }

    #[test]
    fn form_field_uses_wire_names() {
        let field: FormField = serde_json::from_value(json!({
            "name": "Email", "ref": "7", "type": "textbox", "value": "a@b.c"
        }))
        .unwrap();
        assert_eq!(field.kind, "textbox");
        assert_eq!(field.ref_id, "7");
    }

    #[test]
    fn wait_for_args_accept_text_gone() {
        let args: WaitForArgs =
            serde_json::from_value(json!({"textGone": "Loading..."})).unwrap();
        assert_eq!(args.text_gone.as_deref(), Some("Loading..."));
        assert!(args.time.is_none());
    }

    #[test]
    fn console_filter_is_cumulative_by_severity() {
        let entries = vec![
            ConsoleEntry {
                level: "error".into(),
                text: "boom".into(),
            },
            ConsoleEntry {
                level: "warning".into(),
                text: "careful".into(),
            },
            ConsoleEntry {
                level: "log".into(),
                text: "hello".into(),
            },
            ConsoleEntry {
                level: "debug".into(),
                text: "noise".into(),
            },
        ];
        let errors = console_filter(&entries, "error");
        assert_eq!(errors.len(), 1);
        let warnings = console_filter(&entries, "warning");
        assert_eq!(warnings.len(), 2);
        // "log" counts as info-level output.
        let info = console_filter(&entries, "info");
        assert_eq!(info.len(), 3);
        let all = console_filter(&entries, "debug");
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn eval_expr_wraps_function_with_and_without_ref() {
        let bare = build_eval_expr("() => document.title", None);
        assert_eq!(bare, "(() => (() => document.title)())()");

        let with_ref = build_eval_expr("(el) => el.textContent", Some("[data-agent-ref=\"4\"]"));
        assert!(with_ref.contains("document.querySelector"));
        assert!(with_ref.contains("data-agent-ref"));
    }

    #[test]
    fn click_schema_exposes_wire_field_names() {
        let schema = schema_for::<ClickArgs>();
        let props = schema["properties"].as_object().unwrap();
        assert!(props.contains_key("ref"));
        assert!(props.contains_key("doubleClick"));
        assert!(!props.contains_key("ref_id"));
    }
}
