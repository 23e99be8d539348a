use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::clock::{Clock, duration_millis};
use crate::codec::SessionCodec;
use crate::errors::RefreshError;
use crate::refresher::TokenRefresher;
use crate::session::Session;

/// Result of a freshness check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Freshness {
    /// Far enough from expiry, nothing was done
    Fresh,
    /// The session was refreshed and persisted
    Refreshed(Session),
}

/// Decides whether a session needs a proactive refresh and performs it
pub struct SessionGuard {
    refresher: Arc<TokenRefresher>,
    clock: Arc<dyn Clock>,
    refresh_margin: Duration,
}

impl SessionGuard {
    pub fn new(
        refresher: Arc<TokenRefresher>,
        clock: Arc<dyn Clock>,
        refresh_margin: Duration,
    ) -> Self {
        Self {
            refresher,
            clock,
            refresh_margin,
        }
    }

    pub fn needs_refresh(&self, session: &Session) -> bool {
        session.millis_until_expiry(self.clock.now_millis()) < duration_millis(self.refresh_margin)
    }

    #[instrument(skip_all, fields(user_id = %session.user.id))]
    pub async fn ensure_fresh(&self, session: &Session) -> Result<Freshness, RefreshError> {
        if !self.needs_refresh(session) {
            return Ok(Freshness::Fresh);
        }

        debug!(
            "Session expires in {}s, refreshing proactively",
            session.millis_until_expiry(self.clock.now_millis()) / 1000
        );
        self.refresher
            .refresh(session)
            .await
            .map(Freshness::Refreshed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Stopped,
    Running,
}

/// Background timer that keeps the persisted session fresh while signed in
pub struct SessionMonitor {
    guard: Arc<SessionGuard>,
    codec: SessionCodec,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionMonitor {
    pub fn new(guard: Arc<SessionGuard>, codec: SessionCodec, interval: Duration) -> Self {
        Self {
            guard,
            codec,
            interval,
            task: Mutex::new(None),
        }
    }

    /// Start the timer, replacing any running one. Must be called inside a tokio runtime.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = task.take() {
            debug!("Session monitor already running, restarting it");
            previous.abort();
        }

        let guard = self.guard.clone();
        let codec = self.codec.clone();
        let period = self.interval;

        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                check_session(&guard, &codec).await;
            }
        }));

        info!("Session monitor started ({}s interval)", period.as_secs());
    }

    /// Stop the timer. A check already in flight is aborted at its next await point.
    pub fn stop(&self) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = task.take() {
            handle.abort();
            info!("Session monitor stopped");
        }
    }

    pub fn state(&self) -> MonitorState {
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        match task.as_ref() {
            Some(handle) if !handle.is_finished() => MonitorState::Running,
            _ => MonitorState::Stopped,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == MonitorState::Running
    }

    /// Run one monitor check immediately
    pub async fn check_now(&self) {
        check_session(&self.guard, &self.codec).await;
    }
}

impl Drop for SessionMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn check_session(guard: &SessionGuard, codec: &SessionCodec) {
    let Some(session) = codec.load_session().await else {
        debug!("No persisted session to monitor");
        return;
    };

    match guard.ensure_fresh(&session).await {
        Ok(Freshness::Fresh) => {}
        Ok(Freshness::Refreshed(_)) => debug!("Session monitor refreshed the session"),
        Err(e) => warn!("Session monitor could not refresh the session: {}", e),
    }
}
