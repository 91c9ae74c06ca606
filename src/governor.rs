//! The ad governor facade.
//!
//! Owns every service and background task: the frequency policy store, one
//! ad unit per placement, the per-surface session trackers, the timing
//! decision engine, the health monitor with its periodic and event-driven
//! checks, and the scheduler that makes teardown a single call.

use crate::ad_unit::{AdUnit, ShowOutcome, UnitSnapshot};
use crate::classifier::{ErrorHistory, ErrorRecord};
use crate::config::GovernorConfig;
use crate::event_log::EventLog;
use crate::frequency::FrequencyPolicyStore;
use crate::health::{HealthMonitor, HealthSnapshot};
use crate::ports::{
    AdServingSdk, AppLifecycleNotifier, AppLifecycleState, ConsentGate, KeyValueStore,
    NetworkReporter, Placement,
};
use crate::scheduler::TaskScheduler;
use crate::session::{SessionStats, SessionTracker, Surface, ThresholdSource};
use crate::timing::{DecisionContext, TimingDecision, TimingDecisionEngine};
use anyhow::Result;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

/// External collaborators injected at startup. Everything the governor
/// cannot own arrives here; nothing is reached through globals.
pub struct Collaborators {
    pub sdk: Arc<dyn AdServingSdk>,
    pub store: Arc<dyn KeyValueStore>,
    pub network: Arc<dyn NetworkReporter>,
    pub lifecycle: Arc<dyn AppLifecycleNotifier>,
    pub consent: Arc<dyn ConsentGate>,
    /// Source of the randomized session-cadence thresholds.
    pub thresholds: Arc<dyn ThresholdSource>,
}

/// Outcome of a show request, flattened for callers that only need a
/// boolean and a reason.
#[derive(Debug, Clone, PartialEq)]
pub struct ShowResult {
    pub success: bool,
    pub reason: Option<String>,
}

impl From<ShowOutcome> for ShowResult {
    fn from(outcome: ShowOutcome) -> Self {
        match outcome {
            ShowOutcome::Shown => Self {
                success: true,
                reason: None,
            },
            ShowOutcome::Denied { reason } => Self {
                success: false,
                reason: Some(reason),
            },
            ShowOutcome::Failed { error } => Self {
                success: false,
                reason: Some(error.message),
            },
        }
    }
}

/// The assembled subsystem. One instance per process; dropping it (after
/// [`AdGovernor::shutdown`]) cancels every background task.
pub struct AdGovernor {
    config: Arc<GovernorConfig>,
    scheduler: Arc<TaskScheduler>,
    frequency: Arc<FrequencyPolicyStore>,
    history: Arc<ErrorHistory>,
    health: Arc<HealthMonitor>,
    units: HashMap<Placement, Arc<AdUnit>>,
    trackers: HashMap<Surface, Arc<SessionTracker>>,
    engine: TimingDecisionEngine,
    events: Arc<EventLog>,
}

impl AdGovernor {
    /// Builds the subsystem, restores persisted policy state, and starts
    /// the background tasks (periodic health check, event pumps, initial
    /// preloads).
    pub async fn start(
        config: GovernorConfig,
        collaborators: Collaborators,
        logs_dir: &Path,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let events = Arc::new(EventLog::new(logs_dir)?);
        let scheduler = Arc::new(TaskScheduler::new());
        let history = Arc::new(ErrorHistory::new());
        let frequency = Arc::new(
            FrequencyPolicyStore::load(config.frequency.clone(), collaborators.store.clone())
                .await,
        );
        let health = Arc::new(HealthMonitor::new(
            config.health.clone(),
            collaborators.sdk.clone(),
            collaborators.network.clone(),
            history.clone(),
            events.clone(),
        ));

        let mut units = HashMap::new();
        for placement in [Placement::Interstitial, Placement::Rewarded] {
            let unit = Arc::new(AdUnit::new(
                placement,
                config.loading.clone(),
                collaborators.sdk.clone(),
                collaborators.network.clone(),
                collaborators.consent.clone(),
                frequency.clone(),
                health.clone(),
                history.clone(),
                scheduler.clone(),
                events.clone(),
            ));
            health.register_unit(placement, unit.snapshots());
            units.insert(placement, unit);
        }

        let mut trackers = HashMap::new();
        for surface in [Surface::Voice, Surface::Profile, Surface::AppShell] {
            trackers.insert(
                surface,
                Arc::new(SessionTracker::new(
                    surface,
                    config.sessions.clone(),
                    collaborators.thresholds.clone(),
                )),
            );
        }

        let engine =
            TimingDecisionEngine::new(config.clone(), frequency.clone(), trackers.clone());

        let governor = Self {
            config,
            scheduler,
            frequency,
            history,
            health,
            units,
            trackers,
            engine,
            events,
        };
        governor.start_background_tasks(&collaborators);
        info!(session_id = governor.events.session_id(), "ad governor started");
        Ok(governor)
    }

    fn start_background_tasks(&self, collaborators: &Collaborators) {
        // Periodic health check.
        let health = self.health.clone();
        self.scheduler.schedule_repeating(
            Duration::from_secs(self.config.health.check_interval_secs),
            move || {
                let health = health.clone();
                async move {
                    health.perform_health_check().await;
                }
            },
        );

        // Event-driven health checks are debounced through one channel so
        // a burst of transitions collapses into a single recomputation.
        let (trigger_tx, trigger_rx) = mpsc::channel::<()>(16);
        self.start_debounce_loop(trigger_rx);
        self.start_network_pump(collaborators.network.subscribe(), trigger_tx.clone());
        self.start_lifecycle_pump(collaborators.lifecycle.subscribe(), trigger_tx);

        // Warm both placements so the first opportunity finds an ad ready.
        for unit in self.units.values() {
            let unit = unit.clone();
            self.scheduler.spawn(async move {
                let _ = unit.preload(false).await;
            });
        }
    }

    fn start_debounce_loop(&self, mut trigger_rx: mpsc::Receiver<()>) {
        let health = self.health.clone();
        let debounce = Duration::from_millis(self.config.health.debounce_ms);
        self.scheduler.spawn(async move {
            loop {
                if trigger_rx.recv().await.is_none() {
                    return;
                }
                // Absorb follow-up triggers until the burst goes quiet.
                loop {
                    match tokio::time::timeout(debounce, trigger_rx.recv()).await {
                        Ok(Some(())) => {}
                        Ok(None) => return,
                        Err(_) => break,
                    }
                }
                health.perform_health_check().await;
            }
        });
    }

    fn start_network_pump(
        &self,
        mut rx: broadcast::Receiver<crate::ports::NetworkSuitability>,
        trigger_tx: mpsc::Sender<()>,
    ) {
        self.scheduler.spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(suitability) => {
                        debug!(suitable = suitability.suitable, "network transition");
                        if trigger_tx.send(()).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    fn start_lifecycle_pump(
        &self,
        mut rx: broadcast::Receiver<AppLifecycleState>,
        trigger_tx: mpsc::Sender<()>,
    ) {
        let Some(tracker) = self.trackers.get(&Surface::AppShell).cloned() else {
            return;
        };
        self.scheduler.spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(AppLifecycleState::Foreground) => {
                        tracker.start_session();
                        if trigger_tx.send(()).await.is_err() {
                            return;
                        }
                    }
                    Ok(AppLifecycleState::Background) => tracker.end_session(),
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    /// Asks whether now is a good moment to show an ad. Synchronous and
    /// side-effect free apart from cadence accounting and logging.
    pub fn request_decision(&self, context: DecisionContext) -> TimingDecision {
        let decision = self.engine.decide(context);
        debug!(
            surface = context.surface.display_name(),
            should_show = decision.should_show,
            reason = %decision.reason,
            "timing decision"
        );
        self.events.log_decision(&context, &decision);
        decision
    }

    /// Attempts to show the placement right now, re-checking every policy
    /// gate on the way.
    pub async fn try_show(&self, placement: Placement) -> ShowResult {
        match self.units.get(&placement) {
            Some(unit) => unit.show().await.into(),
            None => ShowResult {
                success: false,
                reason: Some("unknown placement".to_string()),
            },
        }
    }

    /// Preloads the placement ahead of the next opportunity.
    pub async fn preload(&self, placement: Placement, test_mode: bool) {
        if let Some(unit) = self.units.get(&placement) {
            let _ = unit.preload(test_mode).await;
        }
    }

    /// Latest cached health snapshot.
    pub fn get_health(&self) -> HealthSnapshot {
        self.health.get_health()
    }

    /// Forces a fresh health computation.
    pub async fn check_health(&self) -> HealthSnapshot {
        self.health.perform_health_check().await
    }

    /// Records a meaningful user interaction on a surface. Feeds both the
    /// frequency policy and the surface's session tracker.
    pub fn record_interaction(&self, surface: Surface) {
        self.frequency.record_interaction();
        if let Some(tracker) = self.trackers.get(&surface) {
            tracker.record_interaction();
        }
    }

    pub fn start_session(&self, surface: Surface) {
        if let Some(tracker) = self.trackers.get(&surface) {
            tracker.start_session();
        }
    }

    pub fn end_session(&self, surface: Surface) {
        if let Some(tracker) = self.trackers.get(&surface) {
            tracker.end_session();
        }
    }

    pub fn session_stats(&self, surface: Surface) -> Option<SessionStats> {
        self.trackers.get(&surface).map(|t| t.stats())
    }

    /// Current snapshot of one ad unit.
    pub fn unit_snapshot(&self, placement: Placement) -> Option<UnitSnapshot> {
        self.units.get(&placement).map(|u| u.snapshot())
    }

    /// Recent classified failures, most recent first.
    pub fn recent_errors(&self, limit: usize) -> Vec<ErrorRecord> {
        self.history.recent(limit)
    }

    /// Kill switch: blocks all ad delivery until explicitly cleared.
    pub fn emergency_disable(&self, reason: impl Into<String>) {
        self.health.emergency_disable(reason);
    }

    pub fn clear_emergency(&self) {
        self.health.clear_emergency();
    }

    /// Cancels every background task and destroys the ad units. The
    /// governor is inert afterwards.
    pub fn shutdown(&self) {
        info!("ad governor shutting down");
        for unit in self.units.values() {
            unit.destroy();
        }
        self.scheduler.cancel_all();
    }
}

#[cfg(test)]
#[path = "tests/governor_tests.rs"]
mod tests;
