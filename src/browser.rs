use anyhow::Result;
use base64::{engine::general_purpose::STANDARD, Engine};
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchMouseEventParams, DispatchMouseEventType, MouseButton,
};
use chromiumoxide::layout::Point;
use chromiumoxide::page::{Page, ScreenshotParamsBuilder};
use futures::StreamExt;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{info, warn};

// ========================= Configuration =========================

#[derive(Clone)]
pub struct BrowserConfig {
    pub headless: bool,
    pub user_agent: Option<String>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            user_agent: None,
        }
    }
}

const VIEWPORT_WIDTH: i64 = 1280;
const VIEWPORT_HEIGHT: i64 = 800;

// ========================= Browser =========================

/// Shared Chromium instance. Pages are created per application session
/// through [`TabPool`]; the event handler runs on a background task for
/// the life of the process.
pub struct Browser {
    inner: OxideBrowser,
    user_agent: Option<String>,
}

impl Browser {
    pub async fn launch(cfg: BrowserConfig) -> Result<Self> {
        let mut builder = chromiumoxide::browser::BrowserConfig::builder();
        if !cfg.headless {
            builder = builder.with_head();
        }
        // Use a unique user data dir per run to avoid ProcessSingleton profile lock
        // conflicts when Chromium is restarted rapidly or multiple instances spawn.
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let mut profile_dir: PathBuf = std::env::temp_dir();
        profile_dir.push(format!("chromiumoxide-profile-{}-{}", std::process::id(), ts));
        let _ = std::fs::create_dir_all(&profile_dir);
        builder = builder.user_data_dir(profile_dir.clone());
        builder = builder
            .arg(format!("--user-data-dir={}", profile_dir.display()))
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        let bcfg = builder.build().map_err(|e| anyhow::anyhow!(e))?;
        let (browser, mut handler) = OxideBrowser::launch(bcfg).await?;
        tokio::spawn(async move { while let Some(_ev) = handler.next().await {} });
        info!(headless = cfg.headless, "browser launched");
        Ok(Self {
            inner: browser,
            user_agent: cfg.user_agent,
        })
    }

    /// Attach to an already-running Chromium over its devtools websocket.
    pub async fn connect(ws_url: &str, cfg: BrowserConfig) -> Result<Self> {
        let (browser, mut handler) = OxideBrowser::connect(ws_url).await?;
        tokio::spawn(async move { while let Some(_ev) = handler.next().await {} });
        info!(ws_url, "attached to running browser");
        Ok(Self {
            inner: browser,
            user_agent: cfg.user_agent,
        })
    }

    /// New blank page with the standard viewport and user agent applied.
    pub async fn new_page(&self) -> Result<Page> {
        let page = self.inner.new_page("about:blank").await?;
        if let Some(ua) = &self.user_agent {
            page.set_user_agent(ua.as_str()).await?;
        }
        // Non-zero viewport up front so screenshots never hit 0-width errors.
        let _ = page
            .execute(viewport_override(VIEWPORT_WIDTH, VIEWPORT_HEIGHT))
            .await;
        Ok(page)
    }

    pub async fn pages(&self) -> Result<Vec<Page>> {
        Ok(self.inner.pages().await?)
    }
}

fn viewport_override(width: i64, height: i64) -> SetDeviceMetricsOverrideParams {
    SetDeviceMetricsOverrideParams::builder()
        .width(width)
        .height(height)
        .device_scale_factor(1.0)
        .mobile(false)
        .build()
        .unwrap()
}

/// Resize a page's viewport. Used by the resize tool.
pub async fn set_viewport(page: &Page, width: i64, height: i64) -> Result<()> {
    page.execute(viewport_override(width, height)).await?;
    Ok(())
}

// ========================= Input Dispatch =========================

pub fn mouse_button(name: &str) -> MouseButton {
    match name {
        "right" => MouseButton::Right,
        "middle" => MouseButton::Middle,
        _ => MouseButton::Left,
    }
}

/// CDP modifier bitmask: Alt=1, Ctrl=2, Meta=4, Shift=8.
pub fn modifier_mask(names: &[String]) -> i64 {
    names
        .iter()
        .map(|m| match m.as_str() {
            "Alt" => 1,
            "Control" | "Ctrl" => 2,
            "Meta" | "Command" => 4,
            "Shift" => 8,
            _ => 0,
        })
        .sum()
}

/// Raw mouse click at viewport coordinates. Used when a tagged element
/// exposes a clickable point; honors button, double-click, and modifiers.
pub async fn click_at(
    page: &Page,
    x: f64,
    y: f64,
    button: MouseButton,
    click_count: i64,
    modifiers: i64,
) -> Result<()> {
    let cmd = DispatchMouseEventParams::builder()
        .x(x)
        .y(y)
        .button(button)
        .click_count(click_count)
        .modifiers(modifiers);
    page.move_mouse(Point { x, y })
        .await?
        .execute(
            cmd.clone()
                .r#type(DispatchMouseEventType::MousePressed)
                .build()
                .unwrap(),
        )
        .await?;
    page.execute(
        cmd.r#type(DispatchMouseEventType::MouseReleased)
            .build()
            .unwrap(),
    )
    .await?;
    Ok(())
}

/// Press at the start point, glide through to the end, release.
pub async fn drag(page: &Page, from: Point, to: Point) -> Result<()> {
    let down = DispatchMouseEventParams::builder()
        .x(from.x)
        .y(from.y)
        .button(MouseButton::Left);
    page.move_mouse(from)
        .await?
        .execute(
            down.clone()
                .r#type(DispatchMouseEventType::MousePressed)
                .build()
                .unwrap(),
        )
        .await?;
    // Intermediate hop so drag handlers that watch mousemove fire.
    page.move_mouse(Point {
        x: (from.x + to.x) / 2.0,
        y: (from.y + to.y) / 2.0,
    })
    .await?;
    page.move_mouse(to).await?;
    page.execute(
        DispatchMouseEventParams::builder()
            .x(to.x)
            .y(to.y)
            .button(MouseButton::Left)
            .r#type(DispatchMouseEventType::MouseReleased)
            .build()
            .unwrap(),
    )
    .await?;
    Ok(())
}

// ========================= Screenshots =========================

pub async fn screenshot_bytes(page: &Page, full_page: bool) -> Result<Vec<u8>> {
    let take = || async {
        page.screenshot(
            ScreenshotParamsBuilder::default()
                .full_page(full_page)
                .omit_background(true)
                .build(),
        )
        .await
    };
    match take().await {
        Ok(bytes) => Ok(bytes),
        Err(e) => {
            let msg = format!("{e}");
            if msg.contains("0 width") || msg.contains("0 height") {
                // Force viewport and retry once.
                let _ = page
                    .execute(viewport_override(VIEWPORT_WIDTH, VIEWPORT_HEIGHT))
                    .await;
                sleep(Duration::from_millis(50)).await;
                return Ok(take().await?);
            }
            Err(anyhow::anyhow!(e))
        }
    }
}

pub async fn screenshot_b64(page: &Page, full_page: bool) -> Result<String> {
    Ok(STANDARD.encode(screenshot_bytes(page, full_page).await?))
}

// ========================= Tab Pool =========================

/// One tab per application session, keyed by session id. The pool hands
/// out clones of the Page handle; closing a session's tab drops it from
/// the pool so later lookups fail loudly.
pub struct TabPool {
    browser: Arc<Browser>,
    tabs: Mutex<HashMap<String, (Page, usize)>>,
    next_index: Mutex<usize>,
}

impl TabPool {
    pub fn new(browser: Arc<Browser>) -> Self {
        Self {
            browser,
            tabs: Mutex::new(HashMap::new()),
            next_index: Mutex::new(0),
        }
    }

    pub fn browser(&self) -> Arc<Browser> {
        self.browser.clone()
    }

    pub async fn create_for_session(&self, session_id: &str) -> Result<(Page, usize)> {
        let page = self.browser.new_page().await?;
        let mut next = self.next_index.lock().await;
        let index = *next;
        *next += 1;
        drop(next);
        self.tabs
            .lock()
            .await
            .insert(session_id.to_string(), (page.clone(), index));
        info!(session_id, tab_index = index, "tab created for session");
        Ok((page, index))
    }

    pub async fn get(&self, session_id: &str) -> Option<Page> {
        self.tabs
            .lock()
            .await
            .get(session_id)
            .map(|(page, _)| page.clone())
    }

    pub async fn tab_index(&self, session_id: &str) -> Option<usize> {
        self.tabs
            .lock()
            .await
            .get(session_id)
            .map(|(_, index)| *index)
    }

    pub async fn focus(&self, session_id: &str) -> Result<()> {
        let page = self
            .get(session_id)
            .await
            .ok_or_else(|| anyhow::anyhow!("no tab for session {session_id}"))?;
        page.bring_to_front().await?;
        Ok(())
    }

    pub async fn close_for_session(&self, session_id: &str) {
        if let Some((page, index)) = self.tabs.lock().await.remove(session_id) {
            info!(session_id, tab_index = index, "closing session tab");
            if let Err(e) = page.close().await {
                warn!(session_id, error = %e, "failed to close tab");
            }
        }
    }

    pub async fn active_sessions(&self) -> Vec<String> {
        self.tabs.lock().await.keys().cloned().collect()
    }

    /// Close every pooled tab. The browser itself stays up.
    pub async fn shutdown(&self) {
        let sessions = self.active_sessions().await;
        for session_id in sessions {
            self.close_for_session(&session_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modifier_mask_combines_bits() {
        let mask = modifier_mask(&["Control".into(), "Shift".into()]);
        assert_eq!(mask, 10);
        assert_eq!(modifier_mask(&["Alt".into()]), 1);
        assert_eq!(modifier_mask(&["Meta".into()]), 4);
        assert_eq!(modifier_mask(&["Bogus".into()]), 0);
        assert_eq!(modifier_mask(&[]), 0);
    }

    #[test]
    fn mouse_button_defaults_to_left() {
        assert!(matches!(mouse_button("right"), MouseButton::Right));
        assert!(matches!(mouse_button("middle"), MouseButton::Middle));
        assert!(matches!(mouse_button("left"), MouseButton::Left));
        assert!(matches!(mouse_button("anything"), MouseButton::Left));
    }
}
