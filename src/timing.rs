//! Context-aware timing decisions.
//!
//! The engine blends the frequency policy store with the session tracker
//! for the requesting surface. The `should_show` boolean is the only
//! actionable output; `confidence` exists for telemetry.

use crate::config::GovernorConfig;
use crate::frequency::FrequencyPolicyStore;
use crate::session::{SessionTracker, Surface};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// What prompted the decision request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerAction {
    SessionEnd,
    Navigation,
    Interaction,
}

/// Context for one decision request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecisionContext {
    pub surface: Surface,
    pub trigger: TriggerAction,
}

/// The decision. Ephemeral; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingDecision {
    pub should_show: bool,
    pub reason: String,
    /// Heuristic certainty in `[0, 1]`, telemetry only.
    pub confidence: f64,
    pub suggested_delay_ms: Option<u64>,
}

impl TimingDecision {
    fn show(reason: impl Into<String>, confidence: f64) -> Self {
        Self {
            should_show: true,
            reason: reason.into(),
            confidence: confidence.clamp(0.0, 1.0),
            suggested_delay_ms: None,
        }
    }

    fn show_after(reason: impl Into<String>, confidence: f64, delay_ms: u64) -> Self {
        Self {
            suggested_delay_ms: Some(delay_ms),
            ..Self::show(reason, confidence)
        }
    }

    fn hold(reason: impl Into<String>, confidence: f64) -> Self {
        Self {
            should_show: false,
            reason: reason.into(),
            confidence: confidence.clamp(0.0, 1.0),
            suggested_delay_ms: None,
        }
    }
}

/// Decides whether the caller should show an ad right now.
pub struct TimingDecisionEngine {
    config: Arc<GovernorConfig>,
    frequency: Arc<FrequencyPolicyStore>,
    trackers: HashMap<Surface, Arc<SessionTracker>>,
}

impl TimingDecisionEngine {
    pub fn new(
        config: Arc<GovernorConfig>,
        frequency: Arc<FrequencyPolicyStore>,
        trackers: HashMap<Surface, Arc<SessionTracker>>,
    ) -> Self {
        Self {
            config,
            frequency,
            trackers,
        }
    }

    /// Synchronous; never blocks.
    pub fn decide(&self, context: DecisionContext) -> TimingDecision {
        let permission = self.frequency.can_show();
        if !permission.allowed {
            let reason = permission
                .reason
                .unwrap_or_else(|| "frequency policy denied".to_string());
            let mut decision = TimingDecision::hold(reason, 1.0);
            decision.suggested_delay_ms = permission.wait_ms;
            return decision;
        }

        match context.surface {
            Surface::Voice => self.decide_active_session(context),
            Surface::Profile | Surface::AppShell => self.decide_passive(context),
        }
    }

    /// Active-session surfaces never interrupt an in-progress session; the
    /// natural moment is the session end.
    fn decide_active_session(&self, context: DecisionContext) -> TimingDecision {
        let Some(tracker) = self.trackers.get(&context.surface) else {
            return TimingDecision::hold("no tracker for surface", 1.0);
        };

        if tracker.session_active() {
            return TimingDecision::hold("session in progress", 1.0);
        }

        if context.trigger != TriggerAction::SessionEnd {
            return TimingDecision::hold("waiting for a session boundary", 0.8);
        }

        let stats = tracker.stats();
        if stats.sessions_since_last_ad_opportunity >= stats.next_opportunity_threshold {
            tracker.on_ad_opportunity_consumed();
            return TimingDecision::show("session cadence reached", 0.9);
        }

        // Softer heuristic: a run of long sessions suggests an engaged
        // user who can absorb one interruption early.
        if stats.average_duration_ms >= self.config.sessions.long_session_ms
            && stats.sessions_since_last_ad_opportunity > 0
        {
            tracker.on_ad_opportunity_consumed();
            return TimingDecision::show("long recent sessions", 0.6);
        }

        TimingDecision::hold(
            format!(
                "cadence not reached ({}/{})",
                stats.sessions_since_last_ad_opportunity, stats.next_opportunity_threshold
            ),
            0.7,
        )
    }

    /// Passive browsing surfaces: require spacing from the last ad and
    /// enough accumulated interaction, and suggest a short delay so an
    /// in-flight user action is not interrupted.
    fn decide_passive(&self, _context: DecisionContext) -> TimingDecision {
        let sessions = &self.config.sessions;

        if let Some(elapsed_ms) = self.frequency.ms_since_last_shown() {
            if elapsed_ms < sessions.passive_min_elapsed_ms {
                return TimingDecision::hold("too close to the previous ad", 0.75);
            }
        }

        if self.frequency.interactions() < sessions.passive_min_interactions {
            return TimingDecision::hold("not enough browsing activity", 0.65);
        }

        TimingDecision::show_after(
            "passive surface settled",
            0.7,
            sessions.passive_suggested_delay_ms,
        )
    }
}

#[cfg(test)]
#[path = "tests/timing_tests.rs"]
mod tests;
