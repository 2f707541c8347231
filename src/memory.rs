//! Process-wide memory governor.
//!
//! Samples resident set size on a fixed interval and reacts in two stages:
//! above the cleanup threshold every registered frame queue is trimmed to its
//! two most recent entries; above the emergency threshold all queues are
//! dropped and every live screencast is restarted at the degraded profile.
//! Rust has no collector to nudge, so queue pressure relief and screencast
//! degradation carry the whole mechanism.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::task::JoinHandle;

use async_trait::async_trait;

use crate::config::MemoryConfig;
use crate::pump::SharedFrameQueue;

/// Entries kept per queue during a cleanup pass.
const CLEANUP_KEEP: usize = 2;

/// What the governor asks of the session layer under emergency pressure.
#[async_trait]
pub trait QualityDegrader: Send + Sync {
    /// Restart every live screencast at the degraded profile.
    async fn degrade_all(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pressure {
    None,
    Cleanup,
    Emergency,
}

fn classify(percent: f64, cfg: &MemoryConfig) -> Pressure {
    if percent >= cfg.emergency_percent {
        Pressure::Emergency
    } else if percent >= cfg.cleanup_percent {
        Pressure::Cleanup
    } else {
        Pressure::None
    }
}

fn sample_process_rss_bytes() -> Option<u64> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut sys = sysinfo::System::new();
    sys.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid).map(|p| p.memory())
}

pub struct MemoryGovernor {
    cfg: MemoryConfig,
    queues: Mutex<HashMap<String, SharedFrameQueue>>,
    sampler: Mutex<Option<JoinHandle<()>>>,
    weak_self: Weak<MemoryGovernor>,
}

impl MemoryGovernor {
    pub fn new(cfg: MemoryConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            cfg,
            queues: Mutex::new(HashMap::new()),
            sampler: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    /// Start the sampling task. The task holds only weak references so it
    /// never keeps the governor or the session layer alive on its own.
    pub fn start(&self, degrader: Weak<dyn QualityDegrader>) {
        let weak = self.weak_self.clone();
        let interval = self.cfg.sample_interval;
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(governor) = weak.upgrade() else { break };
                let percent = governor.usage_percent();
                governor.apply_pressure(percent, &degrader).await;
            }
        });
        *self.sampler.lock().expect("sampler lock poisoned") = Some(task);
    }

    /// Current RSS as a percentage of the configured ceiling.
    fn usage_percent(&self) -> f64 {
        let limit_bytes = self.cfg.limit_mb.saturating_mul(1024 * 1024);
        if limit_bytes == 0 {
            return 0.0;
        }
        match sample_process_rss_bytes() {
            Some(rss) => (rss as f64 / limit_bytes as f64) * 100.0,
            None => 0.0,
        }
    }

    async fn apply_pressure(&self, percent: f64, degrader: &Weak<dyn QualityDegrader>) {
        match classify(percent, &self.cfg) {
            Pressure::None => {}
            Pressure::Cleanup => {
                let trimmed = self.trim_queues(CLEANUP_KEEP);
                tracing::warn!(
                    percent = format!("{percent:.1}"),
                    trimmed_frames = trimmed,
                    "memory pressure: trimmed frame queues"
                );
            }
            Pressure::Emergency => {
                let dropped = self.trim_queues(0);
                tracing::error!(
                    percent = format!("{percent:.1}"),
                    dropped_frames = dropped,
                    "memory emergency: dropped frame queues, degrading screencasts"
                );
                if let Some(degrader) = degrader.upgrade() {
                    degrader.degrade_all().await;
                }
            }
        }
    }

    /// Trim every registered queue down to `keep` most-recent entries.
    /// Returns the total number of frames discarded.
    fn trim_queues(&self, keep: usize) -> usize {
        let queues = self.queues.lock().expect("queue registry lock poisoned");
        let mut discarded = 0;
        for queue in queues.values() {
            let mut queue = queue.lock().expect("frame queue lock poisoned");
            while queue.len() > keep {
                queue.pop_front();
                discarded += 1;
            }
        }
        discarded
    }

    pub fn register_client(&self, client_id: &str, queue: SharedFrameQueue) {
        self.queues
            .lock()
            .expect("queue registry lock poisoned")
            .insert(client_id.to_string(), queue);
    }

    pub fn clear_client(&self, client_id: &str) {
        self.queues
            .lock()
            .expect("queue registry lock poisoned")
            .remove(client_id);
    }

    /// Stop the sampling task during graceful shutdown.
    pub fn shutdown(&self) {
        if let Some(task) = self.sampler.lock().expect("sampler lock poisoned").take() {
            task.abort();
        }
        self.queues
            .lock()
            .expect("queue registry lock poisoned")
            .clear();
    }
}
