//! Tests for the timing decision engine.

use super::*;
use crate::config::{FrequencyConfig, GovernorConfig};
use crate::ports::MemoryKeyValueStore;
use crate::session::FixedThreshold;
use chrono::Utc;

fn engine_parts(
    min_interactions: u32,
) -> (
    Arc<GovernorConfig>,
    Arc<FrequencyPolicyStore>,
    Arc<SessionTracker>,
) {
    let config = Arc::new(GovernorConfig {
        frequency: FrequencyConfig {
            min_interactions_before_first: min_interactions,
            max_per_session: 5,
            min_interval_ms: 60_000,
            session_inactivity_mins: 30,
        },
        ..GovernorConfig::default()
    });
    let frequency = Arc::new(FrequencyPolicyStore::new(
        config.frequency.clone(),
        Arc::new(MemoryKeyValueStore::new()),
    ));
    let tracker = Arc::new(SessionTracker::new(
        Surface::Voice,
        config.sessions.clone(),
        Arc::new(FixedThreshold(2)),
    ));
    (config, frequency, tracker)
}

fn engine_with(
    config: Arc<GovernorConfig>,
    frequency: Arc<FrequencyPolicyStore>,
    tracker: Arc<SessionTracker>,
) -> TimingDecisionEngine {
    let mut trackers = HashMap::new();
    trackers.insert(Surface::Voice, tracker);
    trackers.insert(
        Surface::Profile,
        Arc::new(SessionTracker::new(
            Surface::Profile,
            config.sessions.clone(),
            Arc::new(FixedThreshold(2)),
        )),
    );
    TimingDecisionEngine::new(config, frequency, trackers)
}

fn voice_session_end() -> DecisionContext {
    DecisionContext {
        surface: Surface::Voice,
        trigger: TriggerAction::SessionEnd,
    }
}

#[tokio::test]
async fn frequency_denial_short_circuits_with_full_confidence() {
    let (config, frequency, tracker) = engine_parts(3);
    let engine = engine_with(config, frequency, tracker);

    let decision = engine.decide(voice_session_end());
    assert!(!decision.should_show);
    assert!(decision.reason.contains("interactions"));
    assert!((decision.confidence - 1.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn active_session_always_holds() {
    let (config, frequency, tracker) = engine_parts(0);
    tracker.start_session();
    let engine = engine_with(config, frequency, tracker);

    let decision = engine.decide(voice_session_end());
    assert!(!decision.should_show);
    assert_eq!(decision.reason, "session in progress");
}

#[tokio::test]
async fn cadence_reached_shows_and_consumes_opportunity() {
    let (config, frequency, tracker) = engine_parts(0);
    let t0 = Utc::now();

    // Three 5s sessions with threshold 2: cadence reached (Scenario D).
    for i in 0..3 {
        let start = t0 + chrono::Duration::seconds(i * 20);
        tracker.start_session_at(start);
        tracker.end_session_at(start + chrono::Duration::seconds(5));
    }

    let engine = engine_with(config, frequency, tracker.clone());
    let decision = engine.decide(voice_session_end());
    assert!(decision.should_show);
    assert_eq!(decision.reason, "session cadence reached");
    assert!(decision.confidence > 0.8);

    // The opportunity was consumed: counter reset, threshold still in range.
    let stats = tracker.stats();
    assert_eq!(stats.sessions_since_last_ad_opportunity, 0);
    assert!((2..=3).contains(&stats.next_opportunity_threshold));

    // Immediately after, cadence is no longer reached.
    let decision = engine.decide(voice_session_end());
    assert!(!decision.should_show);
    assert!(decision.reason.contains("cadence not reached"));
}

#[tokio::test]
async fn short_sessions_do_not_reach_cadence() {
    let (config, frequency, tracker) = engine_parts(0);
    let t0 = Utc::now();

    // Sub-meaningful sessions never advance the counter.
    for i in 0..5 {
        let start = t0 + chrono::Duration::seconds(i * 20);
        tracker.start_session_at(start);
        tracker.end_session_at(start + chrono::Duration::seconds(1));
    }

    let engine = engine_with(config, frequency, tracker);
    let decision = engine.decide(voice_session_end());
    assert!(!decision.should_show);
}

#[tokio::test]
async fn non_session_end_trigger_holds_on_voice() {
    let (config, frequency, tracker) = engine_parts(0);
    let engine = engine_with(config, frequency, tracker);

    let decision = engine.decide(DecisionContext {
        surface: Surface::Voice,
        trigger: TriggerAction::Navigation,
    });
    assert!(!decision.should_show);
    assert_eq!(decision.reason, "waiting for a session boundary");
}

#[tokio::test]
async fn passive_surface_requires_activity_and_spacing() {
    let (config, frequency, tracker) = engine_parts(0);
    let engine = engine_with(config.clone(), frequency.clone(), tracker);
    let context = DecisionContext {
        surface: Surface::Profile,
        trigger: TriggerAction::Navigation,
    };

    // No interactions yet: hold.
    let decision = engine.decide(context);
    assert!(!decision.should_show);
    assert_eq!(decision.reason, "not enough browsing activity");

    // Enough interactions and no prior ad: show with a short delay.
    for _ in 0..config.sessions.passive_min_interactions {
        frequency.record_interaction();
    }
    let decision = engine.decide(context);
    assert!(decision.should_show);
    assert_eq!(
        decision.suggested_delay_ms,
        Some(config.sessions.passive_suggested_delay_ms)
    );
}

#[tokio::test]
async fn passive_surface_holds_right_after_an_ad() {
    let (config, frequency, tracker) = engine_parts(0);
    for _ in 0..config.sessions.passive_min_interactions {
        frequency.record_interaction();
    }
    frequency.record_shown_at(Utc::now() - chrono::Duration::milliseconds(90_000));

    let engine = engine_with(config, frequency, tracker);
    let decision = engine.decide(DecisionContext {
        surface: Surface::Profile,
        trigger: TriggerAction::Navigation,
    });
    // 90s since the ad: past min_interval (60s) but inside the passive
    // spacing window (120s).
    assert!(!decision.should_show);
    assert_eq!(decision.reason, "too close to the previous ad");
}
