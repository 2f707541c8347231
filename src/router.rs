//! Per-client command dispatch.
//!
//! Decodes inbound messages into the closed command union and maps each
//! command to a driver operation wrapped in the fabric. Handlers never
//! propagate: every failure becomes a command-specific error envelope and the
//! channel keeps going.

use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

use crate::browser;
use crate::config::Config;
use crate::fabric::{self, RetryPolicy};
use crate::session::SessionManager;
use crate::wire::{ClientMessage, OutboundChannel, ServerMessage, Status};

const CLICK_TIMEOUT: Duration = Duration::from_secs(5);
/// Hover retries stay at one so repeated synthetic moves don't jitter menus.
const HOVER_RETRIES: u32 = 1;

const KNOWN_TYPES: &[&str] = &[
    "navigate",
    "click",
    "scroll",
    "hover",
    "type",
    "evaluate",
    "heartbeat",
    "request_screenshot_and_html",
    "set_viewport",
];

pub struct MessageRouter {
    sessions: Arc<SessionManager>,
    config: Arc<Config>,
}

impl MessageRouter {
    pub fn new(sessions: Arc<SessionManager>, config: Arc<Config>) -> Self {
        Self { sessions, config }
    }

    /// Decode and dispatch one inbound text message, replying on `out`.
    pub async fn dispatch(&self, client_id: &str, raw: &str, out: &OutboundChannel) {
        let reply = self.handle(client_id, raw).await;
        out.send(&reply);
    }

    async fn handle(&self, client_id: &str, raw: &str) -> ServerMessage {
        let value: serde_json::Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => {
                return ServerMessage::Error {
                    kind: Some("protocol".to_string()),
                    requested: None,
                    message: format!("Invalid message JSON: {e}"),
                }
            }
        };

        let tag = value
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string();

        let message: ClientMessage = match serde_json::from_value(value) {
            Ok(message) => message,
            Err(e) => {
                if KNOWN_TYPES.contains(&tag.as_str()) {
                    return ServerMessage::Error {
                        kind: Some("protocol".to_string()),
                        requested: Some(tag.clone()),
                        message: format!("Invalid payload for {tag}: {e}"),
                    };
                }
                return ServerMessage::unknown_type(&tag);
            }
        };

        match message {
            ClientMessage::Heartbeat => ServerMessage::Heartbeat {
                timestamp: chrono::Utc::now().timestamp_millis(),
            },
            ClientMessage::Navigate { url } => self.navigate(client_id, &url).await,
            ClientMessage::Click { x, y } => self.click(client_id, x, y).await,
            ClientMessage::Scroll { delta_y } => self.scroll(client_id, delta_y).await,
            ClientMessage::Hover { x, y } => self.hover(client_id, x, y).await,
            ClientMessage::Type { text } => self.type_text(client_id, &text).await,
            ClientMessage::Evaluate { code } => self.evaluate(client_id, &code).await,
            ClientMessage::RequestScreenshotAndHtml => {
                self.screenshot_and_html(client_id).await
            }
            ClientMessage::SetViewport { width, height } => {
                self.set_viewport(client_id, width, height).await
            }
        }
    }

    async fn navigate(&self, client_id: &str, url: &str) -> ServerMessage {
        let Some(session) = self.sessions.get(client_id).await else {
            return ServerMessage::Navigation {
                status: Status::Error,
                url: None,
                error: Some("session unavailable".to_string()),
                recoverable: true,
            };
        };

        let nav = &self.config.nav;
        let policy = RetryPolicy {
            retries: nav.retries,
            backoff: nav.backoff,
            // One attempt may run both navigation strategies back to back.
            timeout: nav.primary_timeout + nav.fallback_timeout,
        };

        let result = fabric::with_retry(
            || browser::navigate(&session.page, url, nav),
            policy,
            "navigate",
        )
        .await;

        match result {
            Ok(final_url) => ServerMessage::Navigation {
                status: Status::Success,
                url: Some(final_url),
                error: None,
                recoverable: true,
            },
            Err(e) => {
                // Leave the page in a known state for the next command.
                let page = session.page.clone();
                fabric::safe(
                    async move { page.goto("about:blank").await.map(|_| ()) },
                    (),
                    |reset_err| {
                        tracing::debug!(client_id, error = %reset_err, "about:blank reset failed");
                    },
                )
                .await;

                ServerMessage::Navigation {
                    status: Status::Error,
                    url: None,
                    error: Some(e.to_string()),
                    recoverable: true,
                }
            }
        }
    }

    async fn click(&self, client_id: &str, x: f64, y: f64) -> ServerMessage {
        let Some(session) = self.sessions.get(client_id).await else {
            return ServerMessage::Click {
                status: Status::Error,
                x,
                y,
                error: Some("session unavailable".to_string()),
                recoverable: Some(true),
            };
        };

        let policy = RetryPolicy {
            retries: self.config.ops.default_retries,
            backoff: self.config.nav.backoff,
            timeout: CLICK_TIMEOUT,
        };
        match fabric::with_retry(|| browser::click(&session.page, x, y), policy, "click").await {
            Ok(()) => ServerMessage::Click {
                status: Status::Success,
                x,
                y,
                error: None,
                recoverable: None,
            },
            Err(e) => ServerMessage::Click {
                status: Status::Error,
                x,
                y,
                error: Some(e.to_string()),
                recoverable: Some(true),
            },
        }
    }

    async fn scroll(&self, client_id: &str, delta_y: f64) -> ServerMessage {
        let Some(session) = self.sessions.get(client_id).await else {
            return ServerMessage::Scroll {
                status: Status::Error,
                delta_y,
                error: Some("session unavailable".to_string()),
                recoverable: Some(true),
            };
        };

        let result = fabric::with_timeout(
            browser::scroll(&session.page, delta_y),
            self.config.ops.default_timeout,
            "scroll",
        )
        .await;
        match result {
            Ok(()) => ServerMessage::Scroll {
                status: Status::Success,
                delta_y,
                error: None,
                recoverable: None,
            },
            Err(e) => ServerMessage::Scroll {
                status: Status::Error,
                delta_y,
                error: Some(e.to_string()),
                recoverable: Some(true),
            },
        }
    }

    async fn hover(&self, client_id: &str, x: f64, y: f64) -> ServerMessage {
        let Some(session) = self.sessions.get(client_id).await else {
            return ServerMessage::Hover {
                status: Status::Error,
                x,
                y,
                error: Some("session unavailable".to_string()),
                recoverable: Some(true),
            };
        };

        let policy = RetryPolicy {
            retries: HOVER_RETRIES,
            backoff: self.config.nav.backoff,
            timeout: CLICK_TIMEOUT,
        };
        match fabric::with_retry(|| browser::hover(&session.page, x, y), policy, "hover").await {
            Ok(()) => ServerMessage::Hover {
                status: Status::Success,
                x,
                y,
                error: None,
                recoverable: None,
            },
            Err(e) => ServerMessage::Hover {
                status: Status::Error,
                x,
                y,
                error: Some(e.to_string()),
                recoverable: Some(true),
            },
        }
    }

    async fn type_text(&self, client_id: &str, text: &str) -> ServerMessage {
        let Some(session) = self.sessions.get(client_id).await else {
            return ServerMessage::Type {
                status: Status::Error,
                error: Some("session unavailable".to_string()),
                recoverable: Some(true),
            };
        };

        // Typing paces itself at 50ms per char; the deadline scales with it.
        let budget = self.config.ops.default_timeout
            + Duration::from_millis(100 * text.chars().count() as u64);
        let result = fabric::with_timeout(
            browser::type_text(&session.page, text),
            budget,
            "type",
        )
        .await;
        match result {
            Ok(()) => ServerMessage::Type {
                status: Status::Success,
                error: None,
                recoverable: None,
            },
            Err(e) => ServerMessage::Type {
                status: Status::Error,
                error: Some(e.to_string()),
                recoverable: Some(true),
            },
        }
    }

    async fn evaluate(&self, client_id: &str, code: &str) -> ServerMessage {
        let Some(session) = self.sessions.get(client_id).await else {
            return ServerMessage::Evaluate {
                status: Status::Error,
                result: None,
                error: Some("session unavailable".to_string()),
            };
        };

        let result = fabric::with_timeout(
            browser::eval(&session.page, code),
            self.config.ops.default_timeout,
            "evaluate",
        )
        .await;
        match result {
            Ok(serialized) => ServerMessage::Evaluate {
                status: Status::Success,
                result: Some(serialized),
                error: None,
            },
            Err(e) => ServerMessage::Evaluate {
                status: Status::Error,
                result: None,
                error: Some(e.to_string()),
            },
        }
    }

    async fn screenshot_and_html(&self, client_id: &str) -> ServerMessage {
        let Some(session) = self.sessions.get(client_id).await else {
            return ServerMessage::ScreenshotAndHtml {
                status: Status::Error,
                screenshot: None,
                html: None,
                error: Some("session unavailable".to_string()),
                recoverable: Some(true),
            };
        };

        let deadline = self.config.ops.default_timeout;
        let shot = fabric::with_timeout(browser::screenshot(&session.page), deadline, "screenshot");
        let html = fabric::with_timeout(browser::content(&session.page), deadline, "content");
        let (shot, html) = tokio::join!(shot, html);

        match (shot, html) {
            (Ok(screenshot), Ok(html)) => ServerMessage::ScreenshotAndHtml {
                status: Status::Success,
                screenshot: Some(screenshot),
                html: Some(strip_svg(&html)),
                error: None,
                recoverable: None,
            },
            (shot, html) => {
                let error = shot
                    .err()
                    .map(|e| e.to_string())
                    .or_else(|| html.err().map(|e| e.to_string()))
                    .unwrap_or_else(|| "unknown".to_string());
                ServerMessage::ScreenshotAndHtml {
                    status: Status::Error,
                    screenshot: None,
                    html: None,
                    error: Some(error),
                    recoverable: Some(true),
                }
            }
        }
    }

    async fn set_viewport(&self, client_id: &str, width: u32, height: u32) -> ServerMessage {
        match self.sessions.update_viewport(client_id, width, height).await {
            Ok(()) => ServerMessage::ViewportUpdated {
                status: Status::Success,
                width,
                height,
                error: None,
                recoverable: None,
            },
            Err(e) => ServerMessage::ViewportUpdated {
                status: Status::Error,
                width,
                height,
                error: Some(e.to_string()),
                recoverable: Some(true),
            },
        }
    }
}

/// Drop `<svg>…</svg>` blocks from captured HTML. Inline vector art bloats
/// the payload and the canvas renderer discards it anyway.
pub fn strip_svg(html: &str) -> String {
    static SVG: OnceLock<Regex> = OnceLock::new();
    let re = SVG.get_or_init(|| {
        Regex::new(r"(?is)<svg\b[^>]*(?:/>|>.*?</svg>)").expect("svg pattern is valid")
    });
    re.replace_all(html, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::BrowserDriver;
    use crate::wire::OutboundChannel;

    fn test_router() -> MessageRouter {
        let config = Arc::new(Config::from_env());
        let driver = BrowserDriver::new(config.browser.clone());
        let sessions = SessionManager::new(driver, Arc::clone(&config));
        MessageRouter::new(sessions, config)
    }

    async fn roundtrip(router: &MessageRouter, raw: &str) -> serde_json::Value {
        let (out, mut rx) = OutboundChannel::new();
        router.dispatch("client-1", raw, &out).await;
        let payload = rx.recv().await.expect("reply expected");
        serde_json::from_str(&payload.text).unwrap()
    }

    #[tokio::test]
    async fn unknown_type_gets_protocol_error_and_channel_survives() {
        let router = test_router();
        let reply = roundtrip(&router, r#"{"type":"teleport"}"#).await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["requested"], "teleport");
        assert_eq!(reply["message"], "Unknown message type: teleport");

        // A heartbeat afterwards still round-trips.
        let reply = roundtrip(&router, r#"{"type":"heartbeat"}"#).await;
        assert_eq!(reply["type"], "heartbeat");
        assert!(reply["timestamp"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn malformed_json_is_reported_not_fatal() {
        let router = test_router();
        let reply = roundtrip(&router, "{not json").await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["kind"], "protocol");
    }

    #[tokio::test]
    async fn known_type_with_bad_payload_names_the_command() {
        let router = test_router();
        let reply = roundtrip(&router, r#"{"type":"navigate"}"#).await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["requested"], "navigate");
    }

    #[tokio::test]
    async fn commands_without_a_session_reply_recoverable_errors() {
        let router = test_router();

        let reply = roundtrip(&router, r#"{"type":"click","x":5.0,"y":6.0}"#).await;
        assert_eq!(reply["type"], "click");
        assert_eq!(reply["status"], "error");
        assert_eq!(reply["recoverable"], true);
        assert_eq!(reply["x"], 5.0);

        let reply = roundtrip(&router, r#"{"type":"navigate","url":"example.com"}"#).await;
        assert_eq!(reply["type"], "navigation");
        assert_eq!(reply["status"], "error");
        assert_eq!(reply["recoverable"], true);

        let reply = roundtrip(&router, r#"{"type":"scroll","deltaY":10.0}"#).await;
        assert_eq!(reply["type"], "scroll");
        assert_eq!(reply["status"], "error");

        let reply = roundtrip(&router, r#"{"type":"type","text":"abc"}"#).await;
        assert_eq!(reply["type"], "type");
        assert_eq!(reply["status"], "error");

        let reply = roundtrip(&router, r#"{"type":"request_screenshot_and_html"}"#).await;
        assert_eq!(reply["type"], "screenshot_and_html");
        assert_eq!(reply["status"], "error");
        assert_eq!(reply["recoverable"], true);

        let reply = roundtrip(&router, r#"{"type":"set_viewport","width":800,"height":600}"#).await;
        assert_eq!(reply["type"], "viewport_updated");
        assert_eq!(reply["status"], "error");
        assert_eq!(reply["width"], 800);
        assert_eq!(reply["recoverable"], true);
    }

    #[test]
    fn strip_svg_removes_paired_and_self_closing_blocks() {
        let html = r#"<div><svg width="10"><path d="M0 0"/></svg><p>keep</p><svg/></div>"#;
        assert_eq!(strip_svg(html), "<div><p>keep</p></div>");
    }

    #[test]
    fn strip_svg_handles_multiple_blocks_case_insensitively() {
        let html = "<SVG>a</SVG>text<svg attr=\"x\">b</svg>";
        assert_eq!(strip_svg(html), "text");
    }

    #[test]
    fn strip_svg_leaves_plain_html_alone() {
        let html = "<html><body><h1>hello</h1></body></html>";
        assert_eq!(strip_svg(html), html);
    }
}
