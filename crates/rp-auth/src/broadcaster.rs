use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::errors::AuthError;
use crate::profile::Profile;
use crate::session::User;

/// What listeners are told about the signed-in user
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AuthSnapshot {
    pub user: Option<User>,
    pub profile: Option<Profile>,
}

impl AuthSnapshot {
    pub fn signed_out() -> Self {
        Self::default()
    }

    pub fn is_signed_out(&self) -> bool {
        self.user.is_none()
    }

    /// Listeners are only notified when this changes
    fn observation(&self) -> (Option<&str>, bool) {
        (
            self.user.as_ref().map(|user| user.id.as_str()),
            self.profile.is_some(),
        )
    }
}

/// Resolves the current auth state for the broadcaster
#[async_trait::async_trait]
pub trait AuthStateSource: Send + Sync {
    async fn current_state(&self) -> Result<AuthSnapshot, AuthError>;
}

pub type Listener = Arc<dyn Fn(&AuthSnapshot) + Send + Sync>;

/// Result of one poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nobody is listening
    Idle,
    /// Another check was still running
    Skipped,
    Unchanged,
    Notified,
    /// The check failed but the threshold was not reached (or sign-out was already sent)
    Failed { consecutive: u32 },
    /// Too many consecutive failures; listeners were told the user is signed out
    SignedOut,
}

#[derive(Default)]
struct PollState {
    last: Option<AuthSnapshot>,
    failures: u32,
}

struct Shared {
    source: Arc<dyn AuthStateSource>,
    poll_interval: Duration,
    failure_threshold: u32,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_id: AtomicU64,
    state: Mutex<PollState>,
    checking: AtomicBool,
    poller: Mutex<Option<JoinHandle<()>>>,
}

/// Notifies subscribers when the signed-in user or their profile changes.
///
/// The identity provider has no local event stream, so one shared task polls
/// the [`AuthStateSource`] while anybody is subscribed.
pub struct AuthStateBroadcaster {
    shared: Arc<Shared>,
}

impl AuthStateBroadcaster {
    pub fn new(
        source: Arc<dyn AuthStateSource>,
        poll_interval: Duration,
        failure_threshold: u32,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                source,
                poll_interval,
                failure_threshold: failure_threshold.max(1),
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                state: Mutex::new(PollState::default()),
                checking: AtomicBool::new(false),
                poller: Mutex::new(None),
            }),
        }
    }

    /// Register `listener`, call it once with the current state and make sure polling runs.
    ///
    /// Must be called inside a tokio runtime. The listener stays registered
    /// until the returned [`Subscription`] is dropped.
    #[instrument(skip_all)]
    pub async fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&AuthSnapshot) + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(listener);
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);

        let initial = match self.shared.source.current_state().await {
            Ok(snapshot) => {
                let mut state = lock(&self.shared.state);
                if state.last.is_none() {
                    state.last = Some(snapshot.clone());
                }
                Some(snapshot)
            }
            Err(e) => {
                warn!("Could not resolve auth state for new subscriber: {}", e);
                lock(&self.shared.state).last.clone()
            }
        };
        if let Some(snapshot) = initial {
            listener(&snapshot);
        }

        lock(&self.shared.listeners).push((id, listener));
        debug!("Auth state listener {} subscribed", id);
        ensure_polling(&self.shared);

        Subscription {
            shared: Arc::downgrade(&self.shared),
            id,
        }
    }

    /// Run one check now, exactly as the poller would
    pub async fn tick(&self) -> TickOutcome {
        tick(&self.shared).await
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.shared.listeners).len()
    }

    pub fn is_polling(&self) -> bool {
        lock(&self.shared.poller)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for AuthStateBroadcaster {
    fn drop(&mut self) {
        stop_polling(&self.shared);
    }
}

/// Keeps a listener registered; dropping it unsubscribes
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    shared: Weak<Shared>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };

        let remaining = {
            let mut listeners = lock(&shared.listeners);
            listeners.retain(|(id, _)| *id != self.id);
            listeners.len()
        };
        debug!("Auth state listener {} unsubscribed", self.id);

        if remaining == 0 {
            stop_polling(&shared);
        }
    }
}

fn ensure_polling(shared: &Arc<Shared>) {
    let mut poller = lock(&shared.poller);
    if poller.as_ref().is_some_and(|handle| !handle.is_finished()) {
        return;
    }

    let weak = Arc::downgrade(shared);
    let period = shared.poll_interval;
    *poller = Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let Some(shared) = weak.upgrade() else {
                break;
            };
            tick(&shared).await;
        }
    }));

    info!("Auth state polling started ({}s interval)", period.as_secs());
}

fn stop_polling(shared: &Shared) {
    if let Some(handle) = lock(&shared.poller).take() {
        handle.abort();
        info!("Auth state polling stopped");
    }
}

/// Clears the in-flight flag even if the check is aborted
struct CheckInFlight<'a>(&'a AtomicBool);

impl Drop for CheckInFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

async fn tick(shared: &Shared) -> TickOutcome {
    if lock(&shared.listeners).is_empty() {
        return TickOutcome::Idle;
    }
    if shared.checking.swap(true, Ordering::SeqCst) {
        debug!("Auth state check already in flight, skipping");
        return TickOutcome::Skipped;
    }
    let _in_flight = CheckInFlight(&shared.checking);

    let result = shared.source.current_state().await;

    let (snapshot, outcome) = {
        let mut state = lock(&shared.state);
        match result {
            Ok(snapshot) => {
                state.failures = 0;
                let unchanged = state
                    .last
                    .as_ref()
                    .is_some_and(|last| last.observation() == snapshot.observation());
                if unchanged {
                    return TickOutcome::Unchanged;
                }
                state.last = Some(snapshot.clone());
                (snapshot, TickOutcome::Notified)
            }
            Err(e) => {
                state.failures = state.failures.saturating_add(1);
                let consecutive = state.failures;
                warn!("Auth state check failed ({} in a row): {}", consecutive, e);

                let already_signed_out = state
                    .last
                    .as_ref()
                    .is_some_and(AuthSnapshot::is_signed_out);
                if consecutive < shared.failure_threshold || already_signed_out {
                    return TickOutcome::Failed { consecutive };
                }

                warn!("Giving up on auth state after {} failures, reporting sign-out", consecutive);
                let snapshot = AuthSnapshot::signed_out();
                state.last = Some(snapshot.clone());
                (snapshot, TickOutcome::SignedOut)
            }
        }
    };

    notify(shared, &snapshot);
    outcome
}

fn notify(shared: &Shared, snapshot: &AuthSnapshot) {
    // listeners may subscribe or unsubscribe from inside the callback
    let listeners: Vec<Listener> = lock(&shared.listeners)
        .iter()
        .map(|(_, listener)| listener.clone())
        .collect();

    debug!("Notifying {} auth state listeners", listeners.len());
    for listener in listeners {
        listener(snapshot);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
