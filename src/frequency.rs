//! Frequency policy store: caps and spacing for ad displays.
//!
//! Owns the persisted [`FrequencyState`] behind a write-behind cache: the
//! in-memory state is authoritative for the process lifetime, every
//! mutation enqueues a best-effort persist through the key-value store,
//! and persistence failures are logged and swallowed. `can_show` is a
//! synchronous read with a deterministic denial precedence: interaction
//! threshold, then session cap, then minimum interval.

use crate::config::FrequencyConfig;
use crate::ports::KeyValueStore;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

const STORAGE_KEY: &str = "ad_governor.frequency.v1";

/// Persisted frequency accounting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FrequencyState {
    pub last_shown_at: Option<DateTime<Utc>>,
    pub session_count: u32,
    pub lifetime_count: u64,
    pub user_interactions: u32,
    pub session_started_at: DateTime<Utc>,
}

impl FrequencyState {
    fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            last_shown_at: None,
            session_count: 0,
            lifetime_count: 0,
            user_interactions: 0,
            session_started_at: now,
        }
    }
}

/// Outcome of a `can_show` check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShowPermission {
    pub allowed: bool,
    pub reason: Option<String>,
    /// Remaining wait when denied by the minimum interval.
    pub wait_ms: Option<u64>,
}

impl ShowPermission {
    fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
            wait_ms: None,
        }
    }

    fn denied(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            wait_ms: None,
        }
    }

    fn denied_with_wait(reason: impl Into<String>, wait_ms: u64) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            wait_ms: Some(wait_ms),
        }
    }
}

/// The frequency policy store. No method returns an error; durability is
/// best-effort.
pub struct FrequencyPolicyStore {
    config: FrequencyConfig,
    store: Arc<dyn KeyValueStore>,
    state: Mutex<FrequencyState>,
}

impl FrequencyPolicyStore {
    /// Creates a store with fresh state, ignoring anything persisted.
    pub fn new(config: FrequencyConfig, store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            config,
            store,
            state: Mutex::new(FrequencyState::fresh(Utc::now())),
        }
    }

    /// Creates a store from persisted state, applying the staleness check:
    /// a session window older than the inactivity threshold restarts with
    /// zeroed session counters while lifetime accounting is preserved.
    /// Missing or corrupt stored state falls back to fresh state.
    pub async fn load(config: FrequencyConfig, store: Arc<dyn KeyValueStore>) -> Self {
        let now = Utc::now();
        let state = match store.get(STORAGE_KEY).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<FrequencyState>(&bytes) {
                Ok(state) => state,
                Err(e) => {
                    warn!(error = %e, "stored frequency state is corrupt, starting fresh");
                    FrequencyState::fresh(now)
                }
            },
            Ok(None) => FrequencyState::fresh(now),
            Err(e) => {
                warn!(error = %e, "failed to read frequency state, starting fresh");
                FrequencyState::fresh(now)
            }
        };

        let this = Self {
            config,
            store,
            state: Mutex::new(state),
        };
        {
            let mut state = this.state.lock().expect("frequency lock poisoned");
            this.roll_session_window(&mut state, now);
        }
        this
    }

    /// Whether a new display is currently allowed. Synchronous; never
    /// blocks on I/O.
    pub fn can_show(&self) -> ShowPermission {
        self.can_show_at(Utc::now())
    }

    pub(crate) fn can_show_at(&self, now: DateTime<Utc>) -> ShowPermission {
        let mut state = self.state.lock().expect("frequency lock poisoned");
        self.roll_session_window(&mut state, now);

        if state.user_interactions < self.config.min_interactions_before_first {
            return ShowPermission::denied(format!(
                "not enough interactions yet ({}/{})",
                state.user_interactions, self.config.min_interactions_before_first
            ));
        }

        if state.session_count >= self.config.max_per_session {
            return ShowPermission::denied(format!(
                "session cap reached ({})",
                self.config.max_per_session
            ));
        }

        if let Some(last_shown_at) = state.last_shown_at {
            let elapsed_ms = (now - last_shown_at).num_milliseconds().max(0) as u64;
            if elapsed_ms < self.config.min_interval_ms {
                let wait_ms = self.config.min_interval_ms - elapsed_ms;
                return ShowPermission::denied_with_wait("too soon since last ad", wait_ms);
            }
        }

        ShowPermission::allowed()
    }

    /// Records a completed display and persists.
    pub fn record_shown(&self) {
        self.record_shown_at(Utc::now());
    }

    pub(crate) fn record_shown_at(&self, now: DateTime<Utc>) {
        let snapshot = {
            let mut state = self.state.lock().expect("frequency lock poisoned");
            self.roll_session_window(&mut state, now);
            // Clamped so the cap invariant holds even for misbehaving callers.
            state.session_count = (state.session_count + 1).min(self.config.max_per_session);
            state.lifetime_count += 1;
            state.last_shown_at = Some(now);
            state.clone()
        };
        debug!(
            session_count = snapshot.session_count,
            lifetime_count = snapshot.lifetime_count,
            "recorded ad display"
        );
        self.persist(&snapshot);
    }

    /// Records a meaningful user interaction and persists.
    pub fn record_interaction(&self) {
        self.record_interaction_at(Utc::now());
    }

    pub(crate) fn record_interaction_at(&self, now: DateTime<Utc>) {
        let snapshot = {
            let mut state = self.state.lock().expect("frequency lock poisoned");
            self.roll_session_window(&mut state, now);
            state.user_interactions += 1;
            state.clone()
        };
        self.persist(&snapshot);
    }

    /// Restarts the session window: session counter and interactions drop
    /// to zero, lifetime accounting is untouched.
    pub fn reset_session(&self) {
        let now = Utc::now();
        let snapshot = {
            let mut state = self.state.lock().expect("frequency lock poisoned");
            state.session_count = 0;
            state.user_interactions = 0;
            state.session_started_at = now;
            state.clone()
        };
        self.persist(&snapshot);
    }

    /// Wipes all accounting, lifetime counters included.
    pub fn reset_all(&self) {
        let snapshot = {
            let mut state = self.state.lock().expect("frequency lock poisoned");
            *state = FrequencyState::fresh(Utc::now());
            state.clone()
        };
        self.persist(&snapshot);
    }

    /// Milliseconds since the last recorded display, if any.
    pub fn ms_since_last_shown(&self) -> Option<u64> {
        self.ms_since_last_shown_at(Utc::now())
    }

    pub(crate) fn ms_since_last_shown_at(&self, now: DateTime<Utc>) -> Option<u64> {
        let state = self.state.lock().expect("frequency lock poisoned");
        state
            .last_shown_at
            .map(|last| (now - last).num_milliseconds().max(0) as u64)
    }

    /// Interactions recorded in the current session window.
    pub fn interactions(&self) -> u32 {
        self.state
            .lock()
            .expect("frequency lock poisoned")
            .user_interactions
    }

    /// A copy of the current state, for statistics and tests.
    pub fn state_snapshot(&self) -> FrequencyState {
        self.state.lock().expect("frequency lock poisoned").clone()
    }

    fn roll_session_window(&self, state: &mut FrequencyState, now: DateTime<Utc>) {
        let inactivity = Duration::minutes(self.config.session_inactivity_mins);
        if now - state.session_started_at > inactivity {
            debug!("session window expired, resetting session counters");
            state.session_count = 0;
            state.user_interactions = 0;
            state.session_started_at = now;
        }
    }

    fn persist(&self, state: &FrequencyState) {
        let bytes = match serde_json::to_vec(state) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to serialize frequency state");
                return;
            }
        };

        // Fire-and-forget: the in-memory state stays authoritative.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let store = self.store.clone();
            handle.spawn(async move {
                if let Err(e) = store.set(STORAGE_KEY, bytes).await {
                    warn!(error = %e, "failed to persist frequency state");
                }
            });
        } else {
            warn!("no async runtime available, skipping frequency persist");
        }
    }
}


#[cfg(test)]
#[path = "tests/frequency_prop_tests.rs"]
mod prop_tests;
