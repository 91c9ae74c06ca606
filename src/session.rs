//! Per-surface session tracking.
//!
//! Each tracker counts "meaningful" activity on one surface and feeds the
//! timing decision engine. The ad-opportunity threshold re-randomizes in a
//! small range every time an opportunity is consumed, so users never learn
//! a fixed cadence; the random source is injectable for deterministic
//! tests.

use crate::config::SessionConfig;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Surfaces the governor tracks independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Surface {
    /// Voice interactions: an active-session surface.
    Voice,
    /// Profile browsing: a passive surface.
    Profile,
    /// App foreground/background cycles.
    AppShell,
}

impl Surface {
    pub fn display_name(&self) -> &'static str {
        match self {
            Surface::Voice => "voice",
            Surface::Profile => "profile",
            Surface::AppShell => "app_shell",
        }
    }
}

/// Source of the randomized opportunity threshold. Injectable so tests can
/// pin exact values.
pub trait ThresholdSource: Send + Sync {
    /// Returns a threshold in `[min, max]`.
    fn next_threshold(&self, min: u32, max: u32) -> u32;
}

/// Production source backed by the thread-local RNG.
#[derive(Default)]
pub struct RandomThreshold;

impl ThresholdSource for RandomThreshold {
    fn next_threshold(&self, min: u32, max: u32) -> u32 {
        rand::thread_rng().gen_range(min..=max)
    }
}

/// Deterministic source for tests.
pub struct FixedThreshold(pub u32);

impl ThresholdSource for FixedThreshold {
    fn next_threshold(&self, min: u32, max: u32) -> u32 {
        self.0.clamp(min, max)
    }
}

/// Aggregated statistics for one tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    pub total_sessions: u64,
    pub average_duration_ms: u64,
    pub average_interactions: f64,
    pub sessions_since_last_ad_opportunity: u32,
    pub next_opportunity_threshold: u32,
}

#[derive(Debug, Clone)]
struct ActiveSession {
    started_at: DateTime<Utc>,
    interactions: u32,
}

#[derive(Debug, Clone)]
struct FinishedSession {
    duration_ms: u64,
    interactions: u32,
}

struct TrackerState {
    active: Option<ActiveSession>,
    total_sessions: u64,
    sessions_since_opportunity: u32,
    next_threshold: u32,
    recent: VecDeque<FinishedSession>,
}

/// Tracks sessions on a single surface.
pub struct SessionTracker {
    surface: Surface,
    config: SessionConfig,
    thresholds: Arc<dyn ThresholdSource>,
    state: Mutex<TrackerState>,
}

impl SessionTracker {
    pub fn new(
        surface: Surface,
        config: SessionConfig,
        thresholds: Arc<dyn ThresholdSource>,
    ) -> Self {
        let next_threshold =
            thresholds.next_threshold(config.threshold_min, config.threshold_max);
        Self {
            surface,
            config,
            thresholds,
            state: Mutex::new(TrackerState {
                active: None,
                total_sessions: 0,
                sessions_since_opportunity: 0,
                next_threshold,
                recent: VecDeque::new(),
            }),
        }
    }

    /// Starts a session. A no-op while a session is already active.
    pub fn start_session(&self) {
        self.start_session_at(Utc::now());
    }

    pub(crate) fn start_session_at(&self, now: DateTime<Utc>) {
        let mut state = self.state.lock().expect("tracker lock poisoned");
        if state.active.is_some() {
            debug!(surface = self.surface.display_name(), "session already active");
            return;
        }
        state.active = Some(ActiveSession {
            started_at: now,
            interactions: 0,
        });
    }

    /// Ends the active session. Idempotent: ending with no active session
    /// is a no-op.
    pub fn end_session(&self) {
        self.end_session_at(Utc::now());
    }

    pub(crate) fn end_session_at(&self, now: DateTime<Utc>) {
        let mut state = self.state.lock().expect("tracker lock poisoned");
        let Some(active) = state.active.take() else {
            return;
        };

        let duration_ms = (now - active.started_at).num_milliseconds().max(0) as u64;
        state.total_sessions += 1;

        // Accidental taps never advance the ad cadence.
        if duration_ms >= self.config.meaningful_session_ms {
            state.sessions_since_opportunity += 1;
        }

        state.recent.push_front(FinishedSession {
            duration_ms,
            interactions: active.interactions,
        });
        while state.recent.len() > self.config.history_cap {
            state.recent.pop_back();
        }
    }

    /// Records an interaction within the active session, if any.
    pub fn record_interaction(&self) {
        let mut state = self.state.lock().expect("tracker lock poisoned");
        if let Some(active) = state.active.as_mut() {
            active.interactions += 1;
        }
    }

    /// Whether a session is currently in progress.
    pub fn session_active(&self) -> bool {
        self.state
            .lock()
            .expect("tracker lock poisoned")
            .active
            .is_some()
    }

    /// Aggregated statistics over the bounded recent history.
    pub fn stats(&self) -> SessionStats {
        let state = self.state.lock().expect("tracker lock poisoned");
        let (average_duration_ms, average_interactions) = if state.recent.is_empty() {
            (0, 0.0)
        } else {
            let total_ms: u64 = state.recent.iter().map(|s| s.duration_ms).sum();
            let total_interactions: u64 =
                state.recent.iter().map(|s| u64::from(s.interactions)).sum();
            let n = state.recent.len() as u64;
            (total_ms / n, total_interactions as f64 / n as f64)
        };

        SessionStats {
            total_sessions: state.total_sessions,
            average_duration_ms,
            average_interactions,
            sessions_since_last_ad_opportunity: state.sessions_since_opportunity,
            next_opportunity_threshold: state.next_threshold,
        }
    }

    /// Consumes an ad opportunity: the cadence counter resets and the next
    /// threshold is re-randomized.
    pub fn on_ad_opportunity_consumed(&self) {
        let mut state = self.state.lock().expect("tracker lock poisoned");
        state.sessions_since_opportunity = 0;
        state.next_threshold = self
            .thresholds
            .next_threshold(self.config.threshold_min, self.config.threshold_max);
        debug!(
            surface = self.surface.display_name(),
            next_threshold = state.next_threshold,
            "ad opportunity consumed"
        );
    }

    pub fn surface(&self) -> Surface {
        self.surface
    }
}
