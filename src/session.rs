//! Per-client session lifecycle.
//!
//! A session owns exactly one browser, one page, and one CDP channel; the
//! manager owns the `clientId → Session` map and is the only code that
//! mutates it. Probe tasks and the stale sweeper hold weak references keyed
//! by client id, never back-pointers inside the session itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chromiumoxide::Page;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::browser::{
    self, BrowserDriver, BrowserError, BrowserHandle, CdpChannel, ScreencastProfile, Viewport,
    BLACK_PAGE,
};
use crate::config::Config;
use crate::fabric;
use crate::memory::QualityDegrader;
use crate::wire::{OutboundChannel, ServerMessage};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session create failed: {0}")]
    CreateFailed(String),

    #[error("session unavailable")]
    Unavailable,

    #[error(transparent)]
    Browser(#[from] BrowserError),
}

/// Liveness bookkeeping, separated out so the counting rules are testable
/// without a browser. `failures` only ever increments or resets to zero.
#[derive(Debug)]
pub struct HealthState {
    failures: AtomicU32,
    healthy: Arc<AtomicBool>,
}

impl HealthState {
    fn new() -> Self {
        Self {
            failures: AtomicU32::new(0),
            healthy: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Shared flag handed to the crash listener and the frame pump.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.healthy)
    }

    pub fn record_success(&self) {
        self.failures.store(0, Ordering::SeqCst);
        self.healthy.store(true, Ordering::SeqCst);
    }

    /// Record a failed probe. Returns true when the failure streak has
    /// reached `max` and the session must be marked unhealthy.
    pub fn record_failure(&self, max: u32) -> bool {
        let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= max {
            self.healthy.store(false, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::SeqCst);
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

/// One client's browser triple plus liveness state.
pub struct Session {
    pub client_id: String,
    pub browser: BrowserHandle,
    pub page: Page,
    pub cdp: CdpChannel,
    pub health: HealthState,
    viewport: StdMutex<Viewport>,
    last_activity: StdMutex<Instant>,
}

impl Session {
    pub fn viewport(&self) -> Viewport {
        *self.viewport.lock().expect("viewport lock poisoned")
    }

    fn record_viewport(&self, viewport: Viewport) {
        *self.viewport.lock().expect("viewport lock poisoned") = viewport;
    }

    pub fn touch(&self) {
        *self.last_activity.lock().expect("activity lock poisoned") = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .expect("activity lock poisoned")
            .elapsed()
    }

    /// Healthy means the probe streak is clean and the browser transport is
    /// still up.
    pub fn is_healthy(&self) -> bool {
        self.health.is_healthy() && self.browser.is_connected()
    }
}

pub struct SessionManager {
    driver: Arc<BrowserDriver>,
    config: Arc<Config>,
    sessions: tokio::sync::Mutex<HashMap<String, Arc<Session>>>,
    probes: StdMutex<HashMap<String, JoinHandle<()>>>,
    sweeper: StdMutex<Option<JoinHandle<()>>>,
    /// Outbound channels for recovery notices, attached by the gateway.
    channels: StdMutex<HashMap<String, OutboundChannel>>,
    /// Serializes recover() so concurrent unhealthy detections for the same
    /// client do not race the map.
    recovery_lock: tokio::sync::Mutex<()>,
    /// Self-handle for the probe and sweeper tasks.
    weak_self: Weak<SessionManager>,
}

impl SessionManager {
    pub fn new(driver: Arc<BrowserDriver>, config: Arc<Config>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            driver,
            config,
            sessions: tokio::sync::Mutex::new(HashMap::new()),
            probes: StdMutex::new(HashMap::new()),
            sweeper: StdMutex::new(None),
            channels: StdMutex::new(HashMap::new()),
            recovery_lock: tokio::sync::Mutex::new(()),
            weak_self: weak_self.clone(),
        })
    }

    pub fn attach_channel(&self, client_id: &str, channel: OutboundChannel) {
        self.channels
            .lock()
            .expect("channels lock poisoned")
            .insert(client_id.to_string(), channel);
    }

    pub fn detach_channel(&self, client_id: &str) {
        self.channels
            .lock()
            .expect("channels lock poisoned")
            .remove(client_id);
    }

    /// Create a session for `client_id`, retrying with linear backoff.
    pub async fn create(
        &self,
        client_id: &str,
        viewport: Viewport,
    ) -> Result<Arc<Session>, SessionError> {
        let attempts = self.config.session.max_create_retries.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.create_once(client_id, viewport).await {
                Ok(session) => {
                    self.sessions
                        .lock()
                        .await
                        .insert(client_id.to_string(), Arc::clone(&session));
                    self.start_probe(&session);
                    tracing::info!(client_id, attempt, "session created");
                    return Ok(session);
                }
                Err(e) => {
                    tracing::warn!(client_id, attempt, error = %e, "session create attempt failed");
                    last_error = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_secs(u64::from(attempt))).await;
                    }
                }
            }
        }

        Err(SessionError::CreateFailed(last_error))
    }

    async fn create_once(
        &self,
        client_id: &str,
        viewport: Viewport,
    ) -> Result<Arc<Session>, BrowserError> {
        let handle = self.driver.open().await?;
        let health = HealthState::new();

        let page = self
            .driver
            .new_page(&handle, viewport, health.flag())
            .await?;

        // Consent-management blocking is best-effort; a page must never fail
        // to open because interception could not be enabled.
        if let Err(e) = browser::cmp::install(&page).await {
            tracing::warn!(client_id, error = %e, "consent blocking unavailable");
        }

        // Show solid black before the CDP channel exists so the first
        // screencast frame is never a white flash.
        page.goto(BLACK_PAGE).await?;

        let cdp = CdpChannel::new(page.clone());
        cdp.enable().await?;

        Ok(Arc::new(Session {
            client_id: client_id.to_string(),
            browser: handle,
            page,
            cdp,
            health,
            viewport: StdMutex::new(viewport),
            last_activity: StdMutex::new(Instant::now()),
        }))
    }

    /// Look up a session, refreshing its activity stamp. Unhealthy sessions
    /// are recovered in place; `None` means there is nothing usable.
    pub async fn get(&self, client_id: &str) -> Option<Arc<Session>> {
        let session = self.sessions.lock().await.get(client_id).cloned()?;
        session.touch();
        if session.is_healthy() {
            return Some(session);
        }
        tracing::warn!(client_id, "session unhealthy on access, recovering");
        self.recover(client_id).await
    }

    /// Tear down the client's handles and build fresh ones under the same id.
    ///
    /// Old handles are fully closed before the replacement lands in the map,
    /// so there is never a moment with two browsers for one client. When the
    /// rebuild fails the entry is removed entirely.
    pub async fn recover(&self, client_id: &str) -> Option<Arc<Session>> {
        let _guard = self.recovery_lock.lock().await;

        // A competing recovery may have already replaced the session.
        let existing = self.sessions.lock().await.get(client_id).cloned()?;
        if existing.is_healthy() {
            return Some(existing);
        }
        let viewport = existing.viewport();
        drop(existing);

        self.cleanup(client_id, false).await;

        match self.create(client_id, viewport).await {
            Ok(session) => {
                tracing::info!(client_id, "session recovered");
                let channel = self
                    .channels
                    .lock()
                    .expect("channels lock poisoned")
                    .get(client_id)
                    .cloned();
                if let Some(channel) = channel {
                    channel.send(&ServerMessage::SessionRecovered);
                }
                Some(session)
            }
            Err(e) => {
                tracing::error!(client_id, error = %e, "session recovery failed, dropping entry");
                self.sessions.lock().await.remove(client_id);
                None
            }
        }
    }

    /// `Page.enable` + `Page.startScreencast` at the session's viewport.
    pub async fn start_screencast(&self, session: &Session) -> Result<(), BrowserError> {
        session.cdp.enable().await?;
        let viewport = session.viewport();
        session
            .cdp
            .start_screencast(ScreencastProfile::standard(viewport.width, viewport.height))
            .await
    }

    /// Apply a new viewport and restart the screencast at the new geometry.
    pub async fn update_viewport(
        &self,
        client_id: &str,
        width: u32,
        height: u32,
    ) -> Result<(), SessionError> {
        let session = self.get(client_id).await.ok_or(SessionError::Unavailable)?;
        let viewport = Viewport { width, height };

        browser::set_viewport(&session.page, viewport).await?;
        fabric::safe(session.cdp.stop_screencast(), (), |e| {
            tracing::debug!(client_id, error = %e, "screencast stop before restart failed");
        })
        .await;
        session
            .cdp
            .start_screencast(ScreencastProfile::standard(width, height))
            .await?;

        session.record_viewport(viewport);
        Ok(())
    }

    /// Stop the probe, close all three handles (errors swallowed), and
    /// optionally drop the map entry.
    pub async fn cleanup(&self, client_id: &str, remove_from_map: bool) {
        if let Some(task) = self
            .probes
            .lock()
            .expect("probes lock poisoned")
            .remove(client_id)
        {
            task.abort();
        }

        let session = self.sessions.lock().await.get(client_id).cloned();
        if let Some(session) = session {
            fabric::safe(session.cdp.stop_screencast(), (), |e| {
                tracing::debug!(client_id, error = %e, "screencast stop during cleanup failed");
            })
            .await;
            let page = session.page.clone();
            fabric::safe(page.close(), (), |e| {
                tracing::debug!(client_id, error = %e, "page close during cleanup failed");
            })
            .await;
            session.browser.close().await;
            tracing::info!(client_id, "session handles closed");
        }

        if remove_from_map {
            self.sessions.lock().await.remove(client_id);
            self.detach_channel(client_id);
        }
    }

    /// Graceful-shutdown path: close every session in parallel.
    pub async fn cleanup_all(&self) {
        if let Some(task) = self.sweeper.lock().expect("sweeper lock poisoned").take() {
            task.abort();
        }
        let ids: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        let count = ids.len();
        futures::future::join_all(
            ids.into_iter()
                .map(|id| async move { self.cleanup(&id, true).await }),
        )
        .await;
        if count > 0 {
            tracing::info!(count, "all sessions cleaned up");
        }
    }

    fn start_probe(&self, session: &Arc<Session>) {
        let weak_manager = self.weak_self.clone();
        let weak_session = Arc::downgrade(session);
        let cfg = self.config.session.clone();
        let client_id = session.client_id.clone();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(cfg.health_check_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await; // immediate first tick is not a probe

            loop {
                interval.tick().await;
                let Some(session) = weak_session.upgrade() else { break };

                if run_health_probe(&session, cfg.health_probe_timeout).await {
                    session.health.record_success();
                    continue;
                }

                if session.health.record_failure(cfg.max_health_failures) {
                    tracing::warn!(
                        client_id = %session.client_id,
                        failures = session.health.failures(),
                        "health probe threshold reached, recovering session"
                    );
                    drop(session);
                    let Some(manager) = weak_manager.upgrade() else { break };
                    // Recovery tears this probe down (cleanup aborts it), so
                    // it must run outside the probe task.
                    let client_id = client_id.clone();
                    tokio::spawn(async move {
                        let _ = manager.recover(&client_id).await;
                    });
                    break;
                }
            }
        });

        let mut probes = self.probes.lock().expect("probes lock poisoned");
        if let Some(previous) = probes.insert(session.client_id.clone(), task) {
            previous.abort();
        }
    }

    /// Periodically drop sessions idle beyond the configured timeout.
    pub fn start_sweeper(&self) {
        let weak = self.weak_self.clone();
        let idle_limit = self.config.session.session_timeout;
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                let Some(manager) = weak.upgrade() else { break };
                let stale: Vec<String> = manager
                    .sessions
                    .lock()
                    .await
                    .iter()
                    .filter(|(_, s)| s.idle_for() > idle_limit)
                    .map(|(id, _)| id.clone())
                    .collect();
                for client_id in stale {
                    tracing::info!(client_id, "sweeping stale session");
                    manager.cleanup(&client_id, true).await;
                }
            }
        });
        *self.sweeper.lock().expect("sweeper lock poisoned") = Some(task);
    }
}

/// One probe pass: transport up, page responsive, CDP channel responsive.
async fn run_health_probe(session: &Session, timeout: Duration) -> bool {
    // The connected flag also covers process exit: the handler stream ends
    // when the browser process dies.
    if !session.browser.is_connected() {
        return false;
    }

    let page_ok = fabric::with_timeout(
        session.page.evaluate("true"),
        timeout,
        "health:page-eval",
    )
    .await;
    match page_ok {
        Ok(result) => {
            if result.value().and_then(serde_json::Value::as_bool) != Some(true) {
                return false;
            }
        }
        Err(_) => return false,
    }

    fabric::with_timeout(session.cdp.probe(), timeout, "health:cdp-evaluate")
        .await
        .is_ok()
}

#[async_trait]
impl QualityDegrader for SessionManager {
    /// Memory emergency: restart every screencast at the degraded profile.
    async fn degrade_all(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.lock().await.values().cloned().collect();
        for session in sessions {
            fabric::safe(session.cdp.stop_screencast(), (), |e| {
                tracing::debug!(client_id = %session.client_id, error = %e, "degrade stop failed");
            })
            .await;
            if let Err(e) = session.cdp.start_screencast(ScreencastProfile::DEGRADED).await {
                tracing::warn!(client_id = %session.client_id, error = %e, "degraded restart failed");
            } else {
                tracing::info!(client_id = %session.client_id, "screencast degraded");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_failures_accumulate_and_trip_at_threshold() {
        let health = HealthState::new();
        assert!(health.is_healthy());

        assert!(!health.record_failure(3));
        assert!(!health.record_failure(3));
        assert_eq!(health.failures(), 2);
        assert!(health.is_healthy());

        assert!(health.record_failure(3));
        assert_eq!(health.failures(), 3);
        assert!(!health.is_healthy());
    }

    #[test]
    fn probe_success_resets_streak_and_health() {
        let health = HealthState::new();
        for _ in 0..3 {
            health.record_failure(3);
        }
        assert!(!health.is_healthy());

        health.record_success();
        assert_eq!(health.failures(), 0);
        assert!(health.is_healthy());
    }

    #[test]
    fn failures_never_decrease_except_reset() {
        // The counter only moves up or snaps to zero; partial decrements
        // would let a flapping session dodge recovery forever.
        let health = HealthState::new();
        let mut last = 0;
        for _ in 0..10 {
            health.record_failure(100);
            let now = health.failures();
            assert!(now == last + 1);
            last = now;
        }
        health.record_success();
        assert_eq!(health.failures(), 0);
    }

    #[test]
    fn external_unhealthy_mark_sticks_until_success() {
        let health = HealthState::new();
        health.mark_unhealthy();
        assert!(!health.is_healthy());
        health.record_success();
        assert!(health.is_healthy());
    }

    #[test]
    fn shared_flag_propagates_pump_detection() {
        let health = HealthState::new();
        let flag = health.flag();
        flag.store(false, Ordering::SeqCst);
        assert!(!health.is_healthy());
    }
}
