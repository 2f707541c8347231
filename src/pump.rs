//! Per-client frame pump.
//!
//! Sits between the CDP screencast event stream and the client's outbound
//! channel. The queue is bounded; overflow always drops the oldest pending
//! frame so the picture on the wire stays as fresh as possible. Every CDP
//! frame is acked exactly once per event, whether or not it ever reaches the
//! client — screencasting stalls otherwise.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;

use crate::wire::{OutboundChannel, ServerMessage};

pub const FRAME_QUEUE_MAX: usize = 10;
/// Outbound buffered bytes above which draining yields.
pub const BUFFER_HIGH_WATERMARK: usize = 5 * 1024 * 1024;
/// Base64 payload length above which a single frame is worth a warning.
const LARGE_FRAME_BYTES: usize = 100 * 1024;
const DRAIN_RETRY_DELAY: Duration = Duration::from_millis(100);

/// One screencast frame: base64 JPEG plus the CDP per-frame session id.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRecord {
    pub data: String,
    pub session_id: i64,
}

/// Shared with the memory governor, which trims or clears it under pressure.
pub type SharedFrameQueue = Arc<Mutex<VecDeque<FrameRecord>>>;

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct AckError(pub String);

impl AckError {
    /// Ack failures carrying these markers mean the CDP channel is gone and
    /// the owning session needs recovery.
    pub fn is_channel_broken(&self) -> bool {
        self.0.contains("Session closed") || self.0.contains("Target closed")
    }
}

/// Seam over `Page.screencastFrameAck` so the pump is testable without a
/// browser.
#[async_trait]
pub trait FrameAcker: Send + Sync {
    async fn ack(&self, session_id: i64) -> Result<(), AckError>;
}

/// Push a frame into a bounded queue, evicting from the front.
/// Returns how many frames were dropped.
fn enqueue_bounded(queue: &mut VecDeque<FrameRecord>, frame: FrameRecord, max: usize) -> usize {
    queue.push_back(frame);
    let mut dropped = 0;
    while queue.len() > max {
        queue.pop_front();
        dropped += 1;
    }
    dropped
}

pub struct StreamPump {
    client_id: String,
    queue: SharedFrameQueue,
    draining: AtomicBool,
    channel: OutboundChannel,
    acker: Arc<dyn FrameAcker>,
    /// Shared with the owning session; flipped off on a broken ack channel.
    session_healthy: Arc<AtomicBool>,
    /// Self-handle for spawning drain tasks.
    weak_self: Weak<StreamPump>,
}

impl StreamPump {
    pub fn new(
        client_id: String,
        channel: OutboundChannel,
        acker: Arc<dyn FrameAcker>,
        session_healthy: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            client_id,
            queue: Arc::new(Mutex::new(VecDeque::with_capacity(FRAME_QUEUE_MAX))),
            draining: AtomicBool::new(false),
            channel,
            acker,
            session_healthy,
            weak_self: weak_self.clone(),
        })
    }

    /// Handle for the governor's frame-buffer registry.
    pub fn queue_handle(&self) -> SharedFrameQueue {
        Arc::clone(&self.queue)
    }

    /// Enqueue a frame, kick the drain, and ack the CDP event.
    ///
    /// The ack happens regardless of queue or channel state.
    pub async fn on_frame(&self, frame: FrameRecord) {
        let session_id = frame.session_id;

        if frame.data.len() > LARGE_FRAME_BYTES {
            tracing::warn!(
                client_id = %self.client_id,
                bytes = frame.data.len(),
                "large screencast frame"
            );
        }

        let dropped = {
            let mut queue = self.queue.lock().expect("frame queue lock poisoned");
            enqueue_bounded(&mut queue, frame, FRAME_QUEUE_MAX)
        };
        if dropped > 0 {
            tracing::debug!(client_id = %self.client_id, dropped, "frame queue overflow");
        }

        self.spawn_drain();

        if let Err(e) = self.acker.ack(session_id).await {
            if e.is_channel_broken() {
                tracing::warn!(
                    client_id = %self.client_id,
                    error = %e,
                    "screencast ack channel broken, marking session unhealthy"
                );
                self.session_healthy.store(false, Ordering::SeqCst);
            } else {
                tracing::debug!(client_id = %self.client_id, error = %e, "frame ack failed");
            }
        }
    }

    /// Start a drain task unless one is already running.
    pub fn spawn_drain(&self) {
        if self.draining.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(pump) = self.weak_self.upgrade() else {
            self.draining.store(false, Ordering::SeqCst);
            return;
        };
        tokio::spawn(async move {
            pump.drain().await;
        });
    }

    async fn drain(self: Arc<Self>) {
        loop {
            if !self.channel.is_open() {
                break;
            }
            if self.channel.buffered_bytes() > BUFFER_HIGH_WATERMARK {
                // Yield under backpressure; try again shortly. The frame
                // stays at the head of the queue so ordering is preserved.
                self.draining.store(false, Ordering::SeqCst);
                let pump = Arc::clone(&self);
                tokio::spawn(async move {
                    tokio::time::sleep(DRAIN_RETRY_DELAY).await;
                    pump.spawn_drain();
                });
                return;
            }

            let frame = {
                let mut queue = self.queue.lock().expect("frame queue lock poisoned");
                queue.pop_front()
            };
            let Some(frame) = frame else { break };

            if !self.channel.send(&ServerMessage::Frame {
                data: frame.data,
                session_id: frame.session_id,
            }) {
                break;
            }
        }

        self.draining.store(false, Ordering::SeqCst);

        // A frame may have been enqueued between the final pop and the flag
        // reset; re-arm so it is not stranded.
        let pending = !self.queue.lock().expect("frame queue lock poisoned").is_empty();
        if pending && self.channel.is_open() {
            self.spawn_drain();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct CountingAcker {
        acks: AtomicU32,
        fail_with: Option<String>,
    }

    impl CountingAcker {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                acks: AtomicU32::new(0),
                fail_with: None,
            })
        }

        fn failing(message: &str) -> Arc<Self> {
            Arc::new(Self {
                acks: AtomicU32::new(0),
                fail_with: Some(message.to_string()),
            })
        }

        fn count(&self) -> u32 {
            self.acks.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl FrameAcker for CountingAcker {
        async fn ack(&self, _session_id: i64) -> Result<(), AckError> {
            self.acks.fetch_add(1, Ordering::SeqCst);
            match &self.fail_with {
                Some(message) => Err(AckError(message.clone())),
                None => Ok(()),
            }
        }
    }

    fn frame(tag: char, session_id: i64) -> FrameRecord {
        FrameRecord {
            data: tag.to_string(),
            session_id,
        }
    }

    fn healthy_flag() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(true))
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_acks_everything() {
        let (channel, _rx) = OutboundChannel::new();
        // Park the channel above the watermark so nothing drains.
        channel.send(&ServerMessage::Frame {
            data: "x".repeat(BUFFER_HIGH_WATERMARK + 1),
            session_id: 0,
        });

        let acker = CountingAcker::ok();
        let healthy = healthy_flag();
        let pump = StreamPump::new(
            "client-1".into(),
            channel,
            acker.clone() as Arc<dyn FrameAcker>,
            healthy.clone(),
        );

        for (i, tag) in ('A'..='L').enumerate() {
            pump.on_frame(frame(tag, i as i64)).await;
        }

        let queue = pump.queue_handle();
        let retained: Vec<String> = queue
            .lock()
            .unwrap()
            .iter()
            .map(|f| f.data.clone())
            .collect();
        assert_eq!(retained.len(), FRAME_QUEUE_MAX);
        // A and B (the two oldest) are gone; C..L retained in order.
        let expected: Vec<String> = ('C'..='L').map(|c| c.to_string()).collect();
        assert_eq!(retained, expected);

        assert_eq!(acker.count(), 12);
        assert!(healthy.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn ack_is_issued_even_when_channel_is_closed() {
        let (channel, rx) = OutboundChannel::new();
        drop(rx);
        channel.mark_closed();

        let acker = CountingAcker::ok();
        let pump = StreamPump::new(
            "client-2".into(),
            channel,
            acker.clone() as Arc<dyn FrameAcker>,
            healthy_flag(),
        );

        pump.on_frame(frame('A', 1)).await;
        assert_eq!(acker.count(), 1);
    }

    #[tokio::test]
    async fn broken_ack_channel_marks_session_unhealthy() {
        let (channel, _rx) = OutboundChannel::new();
        let acker = CountingAcker::failing("Protocol error: Session closed.");
        let healthy = healthy_flag();
        let pump = StreamPump::new(
            "client-3".into(),
            channel,
            acker.clone() as Arc<dyn FrameAcker>,
            healthy.clone(),
        );

        pump.on_frame(frame('A', 1)).await;
        assert!(!healthy.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn plain_ack_failure_does_not_mark_unhealthy() {
        let (channel, _rx) = OutboundChannel::new();
        let acker = CountingAcker::failing("some transient error");
        let healthy = healthy_flag();
        let pump = StreamPump::new(
            "client-4".into(),
            channel,
            acker.clone() as Arc<dyn FrameAcker>,
            healthy.clone(),
        );

        pump.on_frame(frame('A', 1)).await;
        assert!(healthy.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn frames_drain_in_order_when_channel_is_clear() {
        let (channel, mut rx) = OutboundChannel::new();
        let acker = CountingAcker::ok();
        let pump = StreamPump::new(
            "client-5".into(),
            channel.clone(),
            acker as Arc<dyn FrameAcker>,
            healthy_flag(),
        );

        pump.on_frame(frame('A', 1)).await;
        pump.on_frame(frame('B', 2)).await;

        let mut seen = Vec::new();
        for _ in 0..2 {
            let payload = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("drain should deliver")
                .expect("channel open");
            channel.settle(payload.bytes);
            let json: serde_json::Value = serde_json::from_str(&payload.text).unwrap();
            seen.push(json["data"].as_str().unwrap().to_string());
        }
        assert_eq!(seen, vec!["A".to_string(), "B".to_string()]);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn queue_never_exceeds_max_and_drops_are_oldest(pushes in 1usize..40) {
                let mut queue = VecDeque::new();
                let mut dropped_total = 0;
                for i in 0..pushes {
                    dropped_total += enqueue_bounded(
                        &mut queue,
                        FrameRecord { data: i.to_string(), session_id: i as i64 },
                        FRAME_QUEUE_MAX,
                    );
                    prop_assert!(queue.len() <= FRAME_QUEUE_MAX);
                }
                prop_assert_eq!(dropped_total, pushes.saturating_sub(FRAME_QUEUE_MAX));
                // Retained entries are exactly the most recent ones, in order.
                let start = pushes.saturating_sub(FRAME_QUEUE_MAX);
                let retained: Vec<i64> = queue.iter().map(|f| f.session_id).collect();
                let expected: Vec<i64> = (start..pushes).map(|i| i as i64).collect();
                prop_assert_eq!(retained, expected);
            }
        }
    }
}
