//! Control-channel message types.
//!
//! Both directions are closed tagged unions; an inbound message with an
//! unrecognized tag is a recoverable protocol error handled by the router,
//! not a parse failure that kills the connection.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Client → server commands.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Navigate {
        url: String,
    },
    Click {
        x: f64,
        y: f64,
    },
    Scroll {
        #[serde(rename = "deltaY")]
        delta_y: f64,
    },
    Hover {
        x: f64,
        y: f64,
    },
    #[serde(rename = "type")]
    Type {
        text: String,
    },
    Evaluate {
        code: String,
    },
    Heartbeat,
    RequestScreenshotAndHtml,
    SetViewport {
        width: u32,
        height: u32,
    },
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

/// Server → client messages.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Frame {
        data: String,
        #[serde(rename = "sessionId")]
        session_id: i64,
    },
    Navigation {
        status: Status,
        #[serde(skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        recoverable: bool,
    },
    Click {
        status: Status,
        x: f64,
        y: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        recoverable: Option<bool>,
    },
    Scroll {
        status: Status,
        #[serde(rename = "deltaY")]
        delta_y: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        recoverable: Option<bool>,
    },
    Hover {
        status: Status,
        x: f64,
        y: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        recoverable: Option<bool>,
    },
    #[serde(rename = "type")]
    Type {
        status: Status,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        recoverable: Option<bool>,
    },
    Evaluate {
        status: Status,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ScreenshotAndHtml {
        status: Status,
        #[serde(skip_serializing_if = "Option::is_none")]
        screenshot: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        html: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        recoverable: Option<bool>,
    },
    Heartbeat {
        timestamp: i64,
    },
    ViewportUpdated {
        status: Status,
        width: u32,
        height: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        recoverable: Option<bool>,
    },
    SessionRecovered,
    Connected {
        #[serde(rename = "clientId")]
        client_id: String,
    },
    SessionReady,
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        kind: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        requested: Option<String>,
        message: String,
    },
}

impl ServerMessage {
    pub fn auth_error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            kind: Some("auth".to_string()),
            requested: None,
            message: message.into(),
        }
    }

    pub fn unknown_type(requested: &str) -> Self {
        ServerMessage::Error {
            kind: None,
            requested: Some(requested.to_string()),
            message: format!("Unknown message type: {requested}"),
        }
    }

    pub fn connection_error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            kind: Some("connection".to_string()),
            requested: None,
            message: message.into(),
        }
    }
}

/// A serialized message handed to the socket writer together with its size,
/// so the writer can settle the buffered-byte gauge after the actual send.
#[derive(Debug)]
pub struct OutboundPayload {
    pub text: String,
    pub bytes: usize,
}

/// Per-client outbound channel with a buffered-byte gauge.
///
/// WebSocket implementations on this stack do not expose the socket's
/// `bufferedAmount`, so flow control works off bytes enqueued here minus
/// bytes the writer task has pushed onto the wire.
#[derive(Debug, Clone)]
pub struct OutboundChannel {
    tx: mpsc::UnboundedSender<OutboundPayload>,
    buffered: Arc<AtomicUsize>,
    open: Arc<AtomicBool>,
}

impl OutboundChannel {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundPayload>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                buffered: Arc::new(AtomicUsize::new(0)),
                open: Arc::new(AtomicBool::new(true)),
            },
            rx,
        )
    }

    /// Serialize and enqueue a message. Returns false when the channel is
    /// closed (the message is dropped; callers treat this as a dead client).
    pub fn send(&self, msg: &ServerMessage) -> bool {
        if !self.is_open() {
            return false;
        }
        let text = match serde_json::to_string(msg) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize outbound message");
                return false;
            }
        };
        let bytes = text.len();
        self.buffered.fetch_add(bytes, Ordering::SeqCst);
        if self.tx.send(OutboundPayload { text, bytes }).is_err() {
            self.buffered.fetch_sub(bytes, Ordering::SeqCst);
            self.mark_closed();
            return false;
        }
        true
    }

    /// Called by the socket writer after a payload reached the wire.
    pub fn settle(&self, bytes: usize) {
        self.buffered.fetch_sub(bytes, Ordering::SeqCst);
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Result<ClientMessage, serde_json::Error> {
        serde_json::from_str(raw)
    }

    #[test]
    fn client_commands_decode() {
        assert_eq!(
            parse(r#"{"type":"navigate","url":"example.com"}"#).unwrap(),
            ClientMessage::Navigate {
                url: "example.com".into()
            }
        );
        assert_eq!(
            parse(r#"{"type":"click","x":10.0,"y":20.0}"#).unwrap(),
            ClientMessage::Click { x: 10.0, y: 20.0 }
        );
        assert_eq!(
            parse(r#"{"type":"scroll","deltaY":-120.0}"#).unwrap(),
            ClientMessage::Scroll { delta_y: -120.0 }
        );
        assert_eq!(
            parse(r#"{"type":"type","text":"hello"}"#).unwrap(),
            ClientMessage::Type {
                text: "hello".into()
            }
        );
        assert_eq!(parse(r#"{"type":"heartbeat"}"#).unwrap(), ClientMessage::Heartbeat);
        assert_eq!(
            parse(r#"{"type":"request_screenshot_and_html"}"#).unwrap(),
            ClientMessage::RequestScreenshotAndHtml
        );
        assert_eq!(
            parse(r#"{"type":"set_viewport","width":800,"height":600}"#).unwrap(),
            ClientMessage::SetViewport {
                width: 800,
                height: 600
            }
        );
    }

    #[test]
    fn unknown_tag_is_a_parse_error_not_a_variant() {
        assert!(parse(r#"{"type":"teleport"}"#).is_err());
    }

    #[test]
    fn frame_envelope_shape() {
        let msg = ServerMessage::Frame {
            data: "deadbeef".into(),
            session_id: 42,
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(json["type"], "frame");
        assert_eq!(json["data"], "deadbeef");
        assert_eq!(json["sessionId"], 42);
    }

    #[test]
    fn error_envelopes_skip_absent_fields() {
        let msg = ServerMessage::unknown_type("teleport");
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["requested"], "teleport");
        assert_eq!(json["message"], "Unknown message type: teleport");
        assert!(json.get("kind").is_none());

        let ok = ServerMessage::Click {
            status: Status::Success,
            x: 1.0,
            y: 2.0,
            error: None,
            recoverable: None,
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&ok).unwrap()).unwrap();
        assert_eq!(json["status"], "success");
        assert!(json.get("error").is_none());
        assert!(json.get("recoverable").is_none());
    }

    #[test]
    fn screenshot_and_viewport_replies_carry_command_status() {
        let ok = ServerMessage::ScreenshotAndHtml {
            status: Status::Success,
            screenshot: Some("jpegdata".into()),
            html: Some("<p>x</p>".into()),
            error: None,
            recoverable: None,
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&ok).unwrap()).unwrap();
        assert_eq!(json["type"], "screenshot_and_html");
        assert_eq!(json["status"], "success");
        assert_eq!(json["screenshot"], "jpegdata");
        assert!(json.get("error").is_none());

        let err = ServerMessage::ViewportUpdated {
            status: Status::Error,
            width: 800,
            height: 600,
            error: Some("session unavailable".into()),
            recoverable: Some(true),
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&err).unwrap()).unwrap();
        assert_eq!(json["type"], "viewport_updated");
        assert_eq!(json["status"], "error");
        assert_eq!(json["width"], 800);
        assert_eq!(json["recoverable"], true);
    }

    #[test]
    fn type_reply_uses_the_reserved_tag() {
        let msg = ServerMessage::Type {
            status: Status::Success,
            error: None,
            recoverable: None,
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(json["type"], "type");
    }

    #[tokio::test]
    async fn outbound_channel_tracks_buffered_bytes() {
        let (channel, mut rx) = OutboundChannel::new();
        assert_eq!(channel.buffered_bytes(), 0);

        assert!(channel.send(&ServerMessage::SessionReady));
        let queued = channel.buffered_bytes();
        assert!(queued > 0);

        let payload = rx.recv().await.unwrap();
        assert_eq!(payload.bytes, queued);
        channel.settle(payload.bytes);
        assert_eq!(channel.buffered_bytes(), 0);
    }

    #[tokio::test]
    async fn outbound_channel_send_after_close_is_dropped() {
        let (channel, rx) = OutboundChannel::new();
        drop(rx);
        assert!(!channel.send(&ServerMessage::SessionReady));
        assert!(!channel.is_open());
        assert_eq!(channel.buffered_bytes(), 0);
    }
}
