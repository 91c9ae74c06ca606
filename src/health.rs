//! Health aggregation for the ad subsystem.
//!
//! Combines SDK readiness, network suitability, the rolling error rate,
//! and per-unit error phases into a single grade with a recommended
//! action. The computed snapshot is cached so `get_health` and
//! `can_globally_show` stay synchronous; only `perform_health_check`
//! touches the network.

use crate::ad_unit::{UnitPhase, UnitSnapshot};
use crate::classifier::ErrorHistory;
use crate::config::HealthConfig;
use crate::event_log::EventLog;
use crate::ports::{AdServingSdk, NetworkReporter, NetworkSuitability, Placement};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Coarse classification of subsystem health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthGrade {
    Healthy,
    Degraded,
    Critical,
}

/// What the caller should do about the current health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    Continue,
    ReduceFrequency,
    DisableAds,
    CheckNetwork,
}

/// One health computation. Each new computation supersedes the previous
/// snapshot entirely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub grade: HealthGrade,
    pub issues: Vec<String>,
    pub recommended_action: RecommendedAction,
    pub computed_at: DateTime<Utc>,
}

impl HealthSnapshot {
    fn healthy(now: DateTime<Utc>) -> Self {
        Self {
            grade: HealthGrade::Healthy,
            issues: Vec::new(),
            recommended_action: RecommendedAction::Continue,
            computed_at: now,
        }
    }

    fn emergency(reason: &str, now: DateTime<Utc>) -> Self {
        Self {
            grade: HealthGrade::Critical,
            issues: vec![format!("emergency disable active: {}", reason)],
            recommended_action: RecommendedAction::DisableAds,
            computed_at: now,
        }
    }
}

/// Aggregates health signals and can force-disable ad delivery.
pub struct HealthMonitor {
    config: HealthConfig,
    sdk: Arc<dyn AdServingSdk>,
    network: Arc<dyn NetworkReporter>,
    history: Arc<ErrorHistory>,
    events: Arc<EventLog>,
    units: Mutex<Vec<(Placement, watch::Receiver<UnitSnapshot>)>>,
    emergency: Mutex<Option<String>>,
    last: Mutex<HealthSnapshot>,
    network_ok: AtomicBool,
}

impl HealthMonitor {
    pub fn new(
        config: HealthConfig,
        sdk: Arc<dyn AdServingSdk>,
        network: Arc<dyn NetworkReporter>,
        history: Arc<ErrorHistory>,
        events: Arc<EventLog>,
    ) -> Self {
        Self {
            config,
            sdk,
            network,
            history,
            events,
            units: Mutex::new(Vec::new()),
            emergency: Mutex::new(None),
            last: Mutex::new(HealthSnapshot::healthy(Utc::now())),
            network_ok: AtomicBool::new(true),
        }
    }

    /// Registers an ad unit's snapshot channel so unresolved error phases
    /// surface as health issues.
    pub fn register_unit(&self, placement: Placement, snapshots: watch::Receiver<UnitSnapshot>) {
        self.units
            .lock()
            .expect("health units lock poisoned")
            .push((placement, snapshots));
    }

    /// Probes the network, recomputes the snapshot, and caches it.
    pub async fn perform_health_check(&self) -> HealthSnapshot {
        let probe_timeout = StdDuration::from_secs(self.config.network_probe_timeout_secs);
        let network = match tokio::time::timeout(probe_timeout, self.network.is_suitable()).await {
            Ok(suitability) => suitability,
            Err(_) => NetworkSuitability::unsuitable("network probe timed out"),
        };
        self.network_ok.store(network.suitable, Ordering::SeqCst);

        let snapshot = self.compute(&network, Utc::now());
        if snapshot.grade != HealthGrade::Healthy {
            warn!(
                grade = ?snapshot.grade,
                action = ?snapshot.recommended_action,
                issues = ?snapshot.issues,
                "ad subsystem health degraded"
            );
        }

        *self.last.lock().expect("health snapshot lock poisoned") = snapshot.clone();
        self.events.log_health(&snapshot);
        snapshot
    }

    fn compute(&self, network: &NetworkSuitability, now: DateTime<Utc>) -> HealthSnapshot {
        if let Some(reason) = self
            .emergency
            .lock()
            .expect("emergency lock poisoned")
            .as_deref()
        {
            return HealthSnapshot::emergency(reason, now);
        }

        let mut grade = HealthGrade::Healthy;
        let mut issues = Vec::new();

        if !self.sdk.is_initialized() {
            grade = HealthGrade::Critical;
            issues.push("ad SDK is not initialized".to_string());
        }

        if !network.suitable {
            grade = grade.max(HealthGrade::Degraded);
            let reason = network.reason.as_deref().unwrap_or("unspecified");
            issues.push(format!("network unsuitable: {}", reason));
        }

        let window = Duration::hours(self.config.error_window_hours);
        let total_errors = self.history.count_since(window);
        let network_errors = self.history.network_count_since(window);

        if total_errors >= self.config.critical_error_threshold {
            grade = HealthGrade::Critical;
            issues.push(format!(
                "{} ad errors in the last {}h",
                total_errors, self.config.error_window_hours
            ));
        } else if total_errors >= self.config.degraded_error_threshold {
            grade = grade.max(HealthGrade::Degraded);
            issues.push(format!(
                "elevated ad error rate: {} in the last {}h",
                total_errors, self.config.error_window_hours
            ));
        }

        for (placement, snapshots) in self
            .units
            .lock()
            .expect("health units lock poisoned")
            .iter()
        {
            let unit = snapshots.borrow();
            if unit.phase == UnitPhase::Error {
                grade = grade.max(HealthGrade::Degraded);
                let detail = unit
                    .last_error
                    .as_ref()
                    .map(|e| e.detail.clone())
                    .unwrap_or_else(|| "unknown error".to_string());
                issues.push(format!(
                    "{} unit in error state: {}",
                    placement.display_name(),
                    detail
                ));
            }
        }

        // Action precedence: a critical error rate always disables;
        // network-heavy failure profiles point at the connection first
        // otherwise.
        let recommended_action = if total_errors >= self.config.critical_error_threshold {
            RecommendedAction::DisableAds
        } else if network_errors >= self.config.network_error_threshold {
            RecommendedAction::CheckNetwork
        } else if total_errors >= self.config.degraded_error_threshold {
            RecommendedAction::ReduceFrequency
        } else {
            RecommendedAction::Continue
        };

        HealthSnapshot {
            grade,
            issues,
            recommended_action,
            computed_at: now,
        }
    }

    /// The most recent snapshot. Synchronous.
    pub fn get_health(&self) -> HealthSnapshot {
        self.last
            .lock()
            .expect("health snapshot lock poisoned")
            .clone()
    }

    /// Whether ads may be shown at all right now. Synchronous.
    pub fn can_globally_show(&self) -> bool {
        if self
            .emergency
            .lock()
            .expect("emergency lock poisoned")
            .is_some()
        {
            return false;
        }
        let grade = self
            .last
            .lock()
            .expect("health snapshot lock poisoned")
            .grade;
        grade != HealthGrade::Critical
            && self.network_ok.load(Ordering::SeqCst)
            && self.sdk.is_initialized()
    }

    /// Operator kill-switch: forces Critical/DisableAds immediately,
    /// regardless of computed signals. Reversed only by
    /// [`HealthMonitor::clear_emergency`] or a fresh monitor.
    pub fn emergency_disable(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(reason = %reason, "ad subsystem emergency disable");
        self.events.log_emergency(true, &reason);

        let now = Utc::now();
        *self.last.lock().expect("health snapshot lock poisoned") =
            HealthSnapshot::emergency(&reason, now);
        *self.emergency.lock().expect("emergency lock poisoned") = Some(reason);
    }

    /// Explicitly lifts an emergency disable. The cached snapshot stays
    /// Critical until the next health check recomputes it.
    pub fn clear_emergency(&self) {
        let mut emergency = self.emergency.lock().expect("emergency lock poisoned");
        if emergency.take().is_some() {
            info!("ad subsystem emergency disable cleared");
            self.events.log_emergency(false, "cleared");
        }
    }
}

#[cfg(test)]
#[path = "tests/health_tests.rs"]
mod tests;
