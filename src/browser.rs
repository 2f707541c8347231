//! Thin façade over the external Chromium instance.
//!
//! Everything the rest of the service knows about the browser goes through
//! here: launching or attaching, page setup, the CDP screencast channel, and
//! the individual page operations. The session layer never touches
//! chromiumoxide types other than `Page`.

pub mod cmp;
pub mod stealth;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType, DispatchMouseEventParams,
    DispatchMouseEventType, MouseButton,
};
use chromiumoxide::cdp::browser_protocol::inspector;
use chromiumoxide::cdp::browser_protocol::page::{
    CaptureScreenshotFormat, CaptureScreenshotParams, EventScreencastFrame,
    ScreencastFrameAckParams, StartScreencastFormat, StartScreencastParams, StopScreencastParams,
};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::error::CdpError;
use chromiumoxide::listeners::EventStream;
use chromiumoxide::Page;
use futures::StreamExt;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config::{BrowserConfig, NavConfig};
use crate::fabric::{self, FabricError};
use crate::pump::{AckError, FrameAcker};

/// Solid-black page shown until the first real navigation, so the client
/// canvas never flashes white while the stream spins up.
pub const BLACK_PAGE: &str =
    "data:text/html,<html><body style=\"background:%23000;margin:0\"></body></html>";

/// Per-char delay while typing, so pages see human-ish keystroke pacing.
const TYPE_CHAR_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("failed to launch browser: {0}")]
    Launch(String),

    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("browser operation failed: {0}")]
    Operation(String),

    #[error("browser disconnected")]
    Disconnected,
}

impl From<CdpError> for BrowserError {
    fn from(e: CdpError) -> Self {
        BrowserError::Operation(e.to_string())
    }
}

impl<E: std::fmt::Display> From<FabricError<E>> for BrowserError {
    fn from(e: FabricError<E>) -> Self {
        BrowserError::Operation(e.to_string())
    }
}

/// Page dimensions, persisted per session so recovery and degradation can
/// rebuild the screencast with identical geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1440,
            height: 1880,
        }
    }
}

/// Screencast parameters handed to `Page.startScreencast`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreencastProfile {
    pub quality: i64,
    pub max_width: i64,
    pub max_height: i64,
    pub every_nth_frame: i64,
}

impl ScreencastProfile {
    /// Standard profile at the given dimensions.
    pub fn standard(width: u32, height: u32) -> Self {
        Self {
            quality: 60,
            max_width: i64::from(width),
            max_height: i64::from(height),
            every_nth_frame: 2,
        }
    }

    /// Profile used under memory emergency.
    pub const DEGRADED: Self = Self {
        quality: 30,
        max_width: 1024,
        max_height: 768,
        every_nth_frame: 2,
    };
}

impl Default for ScreencastProfile {
    fn default() -> Self {
        Self {
            quality: 60,
            max_width: 1280,
            max_height: 1024,
            every_nth_frame: 2,
        }
    }
}

/// Ownership of one external browser: the instance, its event-handler task,
/// and the connected flag the handler clears when the CDP transport ends.
pub struct BrowserHandle {
    browser: tokio::sync::Mutex<Browser>,
    handler: std::sync::Mutex<Option<JoinHandle<()>>>,
    connected: Arc<AtomicBool>,
}

impl BrowserHandle {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub async fn new_page(&self) -> Result<Page, BrowserError> {
        let browser = self.browser.lock().await;
        Ok(browser.new_page("about:blank").await?)
    }

    /// Close the browser process and stop its handler task.
    ///
    /// Both the close command and the process wait are best-effort; by the
    /// time cleanup runs the process may already be gone.
    pub async fn close(&self) {
        {
            let mut browser = self.browser.lock().await;
            if let Err(e) = browser.close().await {
                tracing::warn!(error = %e, "failed to close browser cleanly");
            }
            if let Err(e) = browser.wait().await {
                tracing::warn!(error = %e, "failed to wait for browser exit");
            }
        }
        if let Some(task) = self
            .handler
            .lock()
            .expect("handler lock poisoned")
            .take()
        {
            task.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// CDP channel scoped to one page: screencast control, frame acks, and the
/// raw evaluate used by health probes.
#[derive(Clone)]
pub struct CdpChannel {
    page: Page,
}

impl CdpChannel {
    pub fn new(page: Page) -> Self {
        Self { page }
    }

    /// `Page.enable` — required before any screencast call.
    pub async fn enable(&self) -> Result<(), BrowserError> {
        self.page
            .execute(chromiumoxide::cdp::browser_protocol::page::EnableParams::default())
            .await?;
        Ok(())
    }

    pub async fn start_screencast(&self, profile: ScreencastProfile) -> Result<(), BrowserError> {
        let params = StartScreencastParams::builder()
            .format(StartScreencastFormat::Jpeg)
            .quality(profile.quality)
            .max_width(profile.max_width)
            .max_height(profile.max_height)
            .every_nth_frame(profile.every_nth_frame)
            .build();
        self.page.execute(params).await?;
        Ok(())
    }

    pub async fn stop_screencast(&self) -> Result<(), BrowserError> {
        self.page.execute(StopScreencastParams::default()).await?;
        Ok(())
    }

    /// Subscribe to screencast frames.
    pub async fn frames(&self) -> Result<EventStream<EventScreencastFrame>, BrowserError> {
        Ok(self.page.event_listener::<EventScreencastFrame>().await?)
    }

    /// Raw CDP round-trip used by the health probe (`Runtime.evaluate 1+1`).
    pub async fn probe(&self) -> Result<(), BrowserError> {
        let params = EvaluateParams::builder()
            .expression("1+1")
            .return_by_value(true)
            .build()
            .map_err(BrowserError::Operation)?;
        self.page.execute(params).await?;
        Ok(())
    }
}

#[async_trait]
impl FrameAcker for CdpChannel {
    async fn ack(&self, session_id: i64) -> Result<(), AckError> {
        self.page
            .execute(ScreencastFrameAckParams::new(session_id))
            .await
            .map(|_| ())
            .map_err(|e| AckError(e.to_string()))
    }
}

/// Prepend `https://` when the input has no usable scheme.
///
/// A bare parse is not enough: WHATWG parsing accepts `localhost:8080` with
/// `localhost` as the scheme, which the browser cannot navigate to. Only a
/// scheme the driver actually understands counts as already absolute.
pub fn normalize_url(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https" | "file" | "about" | "data") => {
            url.to_string()
        }
        _ => format!("https://{url}"),
    }
}

/// Launch-or-attach façade. The mode is fixed at construction; everything
/// above this type is identical for both.
pub struct BrowserDriver {
    cfg: BrowserConfig,
}

impl BrowserDriver {
    pub fn new(cfg: BrowserConfig) -> Arc<Self> {
        Arc::new(Self { cfg })
    }

    /// Launch a local browser or attach to the configured remote endpoint.
    pub async fn open(&self) -> Result<BrowserHandle, BrowserError> {
        let (browser, mut handler) = match &self.cfg.remote_ws_url {
            Some(ws_url) => {
                tracing::info!(ws_url, "attaching to remote browser");
                Browser::connect(ws_url.clone())
                    .await
                    .map_err(|e| BrowserError::Launch(e.to_string()))?
            }
            None => {
                tracing::info!(headless = self.cfg.headless, "launching browser");
                let config = stealth::launch_config(self.cfg.headless)?;
                Browser::launch(config)
                    .await
                    .map_err(|e| BrowserError::Launch(e.to_string()))?
            }
        };

        let connected = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&connected);
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::debug!(error = %e, "browser handler event error");
                }
            }
            // Stream end means the CDP transport is gone: crash, kill, or
            // remote disconnect. Health probes pick this flag up.
            flag.store(false, Ordering::SeqCst);
            tracing::warn!("browser event handler ended, marking disconnected");
        });

        Ok(BrowserHandle {
            browser: tokio::sync::Mutex::new(browser),
            handler: std::sync::Mutex::new(Some(handler_task)),
            connected,
        })
    }

    /// Create a page with the requested viewport, the stealth init script,
    /// and a crash listener that clears `healthy`.
    pub async fn new_page(
        &self,
        handle: &BrowserHandle,
        viewport: Viewport,
        healthy: Arc<AtomicBool>,
    ) -> Result<Page, BrowserError> {
        let page = handle.new_page().await?;
        set_viewport(&page, viewport).await?;
        stealth::install(&page).await?;

        page.execute(inspector::EnableParams::default()).await?;
        let mut crashes = page.event_listener::<inspector::EventTargetCrashed>().await?;
        tokio::spawn(async move {
            if crashes.next().await.is_some() {
                tracing::warn!("page target crashed");
                healthy.store(false, Ordering::SeqCst);
            }
        });

        Ok(page)
    }
}

/// Apply `Emulation.setDeviceMetricsOverride`.
pub async fn set_viewport(page: &Page, viewport: Viewport) -> Result<(), BrowserError> {
    let params = SetDeviceMetricsOverrideParams::builder()
        .width(i64::from(viewport.width))
        .height(i64::from(viewport.height))
        .device_scale_factor(1.0)
        .mobile(false)
        .build()
        .map_err(BrowserError::Operation)?;
    page.execute(params).await?;
    Ok(())
}

/// Navigate with a two-strategy fallback.
///
/// The primary strategy waits for the page's navigation to settle; when it
/// blows its budget (heavy pages that never go network-quiet), a bare
/// navigation under the fallback budget is accepted instead. The final
/// failure is surfaced with the normalized URL.
pub async fn navigate(page: &Page, url: &str, nav: &NavConfig) -> Result<String, BrowserError> {
    let target = normalize_url(url);

    let primary = async {
        page.goto(target.as_str()).await?;
        page.wait_for_navigation().await?;
        Ok::<(), CdpError>(())
    };
    match fabric::with_timeout(primary, nav.primary_timeout, "navigate:primary").await {
        Ok(()) => return Ok(target),
        Err(e) => {
            tracing::warn!(url = %target, error = %e, "primary navigation failed, falling back");
        }
    }

    let fallback = async { page.goto(target.as_str()).await.map(|_| ()) };
    fabric::with_timeout(fallback, nav.fallback_timeout, "navigate:fallback")
        .await
        .map(|()| target.clone())
        .map_err(|e| BrowserError::Navigation {
            url: target,
            reason: e.to_string(),
        })
}

pub async fn click(page: &Page, x: f64, y: f64) -> Result<(), BrowserError> {
    for kind in [
        DispatchMouseEventType::MousePressed,
        DispatchMouseEventType::MouseReleased,
    ] {
        let params = DispatchMouseEventParams::builder()
            .r#type(kind)
            .x(x)
            .y(y)
            .button(MouseButton::Left)
            .click_count(1)
            .build()
            .map_err(BrowserError::Operation)?;
        page.execute(params).await?;
    }
    Ok(())
}

pub async fn hover(page: &Page, x: f64, y: f64) -> Result<(), BrowserError> {
    let params = DispatchMouseEventParams::builder()
        .r#type(DispatchMouseEventType::MouseMoved)
        .x(x)
        .y(y)
        .build()
        .map_err(BrowserError::Operation)?;
    page.execute(params).await?;
    Ok(())
}

/// Scroll by injecting `window.scrollBy` — portable across remote browsers
/// where synthesized wheel events are unreliable.
pub async fn scroll(page: &Page, delta_y: f64) -> Result<(), BrowserError> {
    page.evaluate(format!("window.scrollBy(0, {delta_y})"))
        .await?;
    Ok(())
}

pub async fn type_text(page: &Page, text: &str) -> Result<(), BrowserError> {
    for ch in text.chars() {
        let ch = ch.to_string();
        for kind in [DispatchKeyEventType::KeyDown, DispatchKeyEventType::KeyUp] {
            let is_down = matches!(kind, DispatchKeyEventType::KeyDown);
            let mut builder = DispatchKeyEventParams::builder()
                .r#type(kind)
                .key(ch.clone());
            if is_down {
                builder = builder.text(ch.clone());
            }
            let params = builder.build().map_err(BrowserError::Operation)?;
            page.execute(params).await?;
        }
        tokio::time::sleep(TYPE_CHAR_DELAY).await;
    }
    Ok(())
}

/// JPEG screenshot, base64-encoded by the protocol.
pub async fn screenshot(page: &Page) -> Result<String, BrowserError> {
    let params = CaptureScreenshotParams::builder()
        .format(CaptureScreenshotFormat::Jpeg)
        .build();
    let response = page.execute(params).await?;
    Ok(response.data.clone().into())
}

/// Current page HTML.
pub async fn content(page: &Page) -> Result<String, BrowserError> {
    Ok(page.content().await?)
}

/// Script evaluation failure, carrying the page-side error string.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct EvalError(pub String);

/// Evaluate `code` as an async function body in page context.
///
/// Returns the JSON-serialized result on success and the error string on
/// failure; never panics on unserializable values.
pub async fn eval(page: &Page, code: &str) -> Result<String, EvalError> {
    let wrapped = format!("(async () => {{ {code} }})()");
    match page.evaluate(wrapped).await {
        Ok(result) => match result.value() {
            Some(value) => {
                Ok(serde_json::to_string(value).unwrap_or_else(|_| "null".to_string()))
            }
            None => Ok("undefined".to_string()),
        },
        Err(e) => Err(EvalError(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_url_prepends_https_when_scheme_missing() {
        assert_eq!(normalize_url("example.com"), "https://example.com");
        assert_eq!(normalize_url("example.com/path?q=1"), "https://example.com/path?q=1");
    }

    #[test]
    fn normalize_url_treats_host_port_as_schemeless() {
        // `localhost:8080` parses with `localhost` as the scheme; it still
        // needs the https prefix to be navigable.
        assert_eq!(normalize_url("localhost:8080"), "https://localhost:8080");
        assert_eq!(
            normalize_url("localhost:8080/admin"),
            "https://localhost:8080/admin"
        );
    }

    #[test]
    fn normalize_url_preserves_existing_scheme() {
        assert_eq!(normalize_url("http://example.com"), "http://example.com");
        assert_eq!(normalize_url("https://example.com"), "https://example.com");
        assert_eq!(
            normalize_url("data:text/html,<h1>x</h1>"),
            "data:text/html,<h1>x</h1>"
        );
    }

    #[test]
    fn default_viewport_dimensions() {
        let v = Viewport::default();
        assert_eq!((v.width, v.height), (1440, 1880));
    }

    #[test]
    fn standard_profile_tracks_viewport() {
        let p = ScreencastProfile::standard(800, 600);
        assert_eq!(p.quality, 60);
        assert_eq!(p.max_width, 800);
        assert_eq!(p.max_height, 600);
        assert_eq!(p.every_nth_frame, 2);
    }

    #[test]
    fn degraded_profile_matches_emergency_settings() {
        let p = ScreencastProfile::DEGRADED;
        assert_eq!(p.quality, 30);
        assert_eq!(p.max_width, 1024);
        assert_eq!(p.max_height, 768);
        assert_eq!(p.every_nth_frame, 2);
    }

    #[test]
    fn black_page_is_a_data_url() {
        assert!(BLACK_PAGE.starts_with("data:text/html,"));
        assert!(BLACK_PAGE.contains("background:%23000"));
    }
}
