//! Per-placement ad unit state machine.
//!
//! This is the ONLY place load/show transitions happen. Each unit owns its
//! state, absorbs SDK failures through the classifier, self-schedules
//! bounded retries, and broadcasts snapshots on a watch channel for the
//! health aggregator. Callers only ever see outcome enums with reasons;
//! no SDK failure propagates past this module.
//!
//! Transitions:
//! `Idle --preload--> Loading --success--> Loaded --show--> Showing
//! --close--> Idle (+scheduled preload)`; `Loading --failure--> Error
//! --retry after backoff--> Loading`, bounded by the attempt cap and a
//! cooldown after exhaustion.

use crate::classifier::{self, ErrorHistory, ErrorRecord, DEFAULT_RETRY_DELAY_MS};
use crate::config::LoadConfig;
use crate::event_log::EventLog;
use crate::frequency::FrequencyPolicyStore;
use crate::health::HealthMonitor;
use crate::ports::{
    AdEvent, AdServingSdk, ConsentGate, LoadRequest, NetworkReporter, NetworkSuitability,
    Placement, SdkError,
};
use crate::scheduler::TaskScheduler;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

/// Bound on the preload-path network probe.
const NETWORK_PROBE_TIMEOUT: StdDuration = StdDuration::from_secs(5);

/// Lifecycle phase of an ad unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitPhase {
    Idle,
    Loading,
    Loaded,
    Showing,
    Error,
}

impl UnitPhase {
    pub fn display_name(&self) -> &'static str {
        match self {
            UnitPhase::Idle => "Idle",
            UnitPhase::Loading => "Loading",
            UnitPhase::Loaded => "Loaded",
            UnitPhase::Showing => "Showing",
            UnitPhase::Error => "Error",
        }
    }
}

/// Read-only view of a unit, broadcast after every mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitSnapshot {
    pub placement: Placement,
    pub phase: UnitPhase,
    pub load_attempts: u32,
    pub last_load_at: Option<DateTime<Utc>>,
    pub last_error: Option<ErrorRecord>,
}

/// Outcome of a preload request.
#[derive(Debug, Clone, PartialEq)]
pub enum PreloadOutcome {
    /// An ad is loaded and ready to show.
    Ready,
    /// Another preload is already in flight; this call was a no-op.
    AlreadyInFlight,
    /// Policy denied the load before the SDK was involved.
    Denied { reason: String },
    /// The SDK load failed; the record says whether a retry is scheduled.
    Failed { error: ErrorRecord },
}

/// Outcome of a show request.
#[derive(Debug, Clone, PartialEq)]
pub enum ShowOutcome {
    Shown,
    Denied { reason: String },
    Failed { error: ErrorRecord },
}

struct UnitState {
    phase: UnitPhase,
    load_attempts: u32,
    last_load_at: Option<DateTime<Utc>>,
    last_error: Option<ErrorRecord>,
    exhausted_at: Option<DateTime<Utc>>,
    test_mode: bool,
    destroyed: bool,
}

/// One ad placement's load/show state machine.
pub struct AdUnit {
    placement: Placement,
    config: LoadConfig,
    sdk: Arc<dyn AdServingSdk>,
    network: Arc<dyn NetworkReporter>,
    consent: Arc<dyn ConsentGate>,
    frequency: Arc<FrequencyPolicyStore>,
    health: Arc<HealthMonitor>,
    history: Arc<ErrorHistory>,
    scheduler: Arc<TaskScheduler>,
    events: Arc<EventLog>,
    state: Mutex<UnitState>,
    snapshot_tx: watch::Sender<UnitSnapshot>,
}

impl AdUnit {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        placement: Placement,
        config: LoadConfig,
        sdk: Arc<dyn AdServingSdk>,
        network: Arc<dyn NetworkReporter>,
        consent: Arc<dyn ConsentGate>,
        frequency: Arc<FrequencyPolicyStore>,
        health: Arc<HealthMonitor>,
        history: Arc<ErrorHistory>,
        scheduler: Arc<TaskScheduler>,
        events: Arc<EventLog>,
    ) -> Self {
        let initial = UnitSnapshot {
            placement,
            phase: UnitPhase::Idle,
            load_attempts: 0,
            last_load_at: None,
            last_error: None,
        };
        let (snapshot_tx, _) = watch::channel(initial);

        Self {
            placement,
            config,
            sdk,
            network,
            consent,
            frequency,
            health,
            history,
            scheduler,
            events,
            state: Mutex::new(UnitState {
                phase: UnitPhase::Idle,
                load_attempts: 0,
                last_load_at: None,
                last_error: None,
                exhausted_at: None,
                test_mode: false,
                destroyed: false,
            }),
            snapshot_tx,
        }
    }

    pub fn placement(&self) -> Placement {
        self.placement
    }

    /// Current read-only view of the unit.
    pub fn snapshot(&self) -> UnitSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    /// Subscribes to snapshot updates.
    pub fn snapshots(&self) -> watch::Receiver<UnitSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Fetches the next ad ahead of time. Idempotent: a call while a load
    /// is in flight (or an ad is already loaded) issues no duplicate load.
    pub async fn preload(self: &Arc<Self>, test_mode: bool) -> PreloadOutcome {
        if !self.consent.can_request_ads() {
            return PreloadOutcome::Denied {
                reason: "consent withheld".to_string(),
            };
        }

        // Gate and claim the Loading phase in one critical section so
        // concurrent preloads stay single-flight.
        {
            let mut state = self.state.lock().expect("unit lock poisoned");
            if state.destroyed {
                return PreloadOutcome::Denied {
                    reason: "unit destroyed".to_string(),
                };
            }
            match state.phase {
                UnitPhase::Loading => return PreloadOutcome::AlreadyInFlight,
                UnitPhase::Loaded => return PreloadOutcome::Ready,
                UnitPhase::Showing => {
                    return PreloadOutcome::Denied {
                        reason: "show in progress".to_string(),
                    }
                }
                UnitPhase::Idle | UnitPhase::Error => {}
            }

            if state.load_attempts >= self.config.max_load_attempts {
                let cooldown = Duration::seconds(self.config.exhaustion_cooldown_secs as i64);
                match state.exhausted_at {
                    Some(exhausted_at) if Utc::now() - exhausted_at < cooldown => {
                        return PreloadOutcome::Denied {
                            reason: "cooling down after repeated load failures".to_string(),
                        };
                    }
                    _ => {
                        debug!(
                            placement = self.placement.display_name(),
                            "load cooldown elapsed, resetting attempt counter"
                        );
                        state.load_attempts = 0;
                        state.exhausted_at = None;
                    }
                }
            }

            state.test_mode = test_mode;
            self.set_phase(&mut state, UnitPhase::Loading);
        }

        // The SDK is pointless without a usable network; fail fast with a
        // non-retryable record so nothing hammers a dead connection.
        let suitability = self.probe_network().await;
        if !suitability.suitable {
            let reason = suitability.reason.as_deref().unwrap_or("network unsuitable");
            let record = classifier::network_unavailable(self.placement, reason);
            return self.fail_load(record, false);
        }

        {
            let mut state = self.state.lock().expect("unit lock poisoned");
            state.load_attempts += 1;
            state.last_load_at = Some(Utc::now());
        }

        let load_timeout = StdDuration::from_secs(self.config.load_timeout_secs);
        let request = LoadRequest { test_mode };
        match tokio::time::timeout(load_timeout, self.sdk.load(self.placement, request)).await {
            Ok(Ok(())) => {
                let mut state = self.state.lock().expect("unit lock poisoned");
                state.load_attempts = 0;
                state.exhausted_at = None;
                state.last_error = None;
                self.set_phase(&mut state, UnitPhase::Loaded);
                PreloadOutcome::Ready
            }
            Ok(Err(sdk_error)) => {
                let record = classifier::classify(&sdk_error, self.placement);
                self.fail_load(record, true)
            }
            Err(_) => {
                let timed_out = SdkError::new(
                    None,
                    format!("load timed out after {}s", self.config.load_timeout_secs),
                );
                let record = classifier::classify(&timed_out, self.placement);
                self.fail_load(record, true)
            }
        }
    }

    fn fail_load(self: &Arc<Self>, record: ErrorRecord, allow_retry: bool) -> PreloadOutcome {
        let retry = {
            let mut state = self.state.lock().expect("unit lock poisoned");
            state.last_error = Some(record.clone());
            self.set_phase(&mut state, UnitPhase::Error);

            let attempts_remaining = state.load_attempts < self.config.max_load_attempts;
            if allow_retry && record.retryable && attempts_remaining {
                // Escalating backoff: the category's suggested delay,
                // floored, scaled by the attempt number.
                let delay_ms = record.suggested_delay_ms.max(DEFAULT_RETRY_DELAY_MS)
                    * u64::from(state.load_attempts.max(1));
                Some((StdDuration::from_millis(delay_ms), state.test_mode))
            } else {
                if !attempts_remaining && state.exhausted_at.is_none() {
                    state.exhausted_at = Some(Utc::now());
                    warn!(
                        placement = self.placement.display_name(),
                        attempts = state.load_attempts,
                        "load attempts exhausted, entering cooldown"
                    );
                }
                None
            }
        };

        self.history.record(record.clone());
        self.events.log_classified_error(self.placement, &record);

        if let Some((delay, test_mode)) = retry {
            debug!(
                placement = self.placement.display_name(),
                delay_ms = delay.as_millis() as u64,
                "scheduling load retry"
            );
            let unit = Arc::clone(self);
            self.scheduler.schedule_once(delay, async move {
                let _ = unit.preload(test_mode).await;
            });
        }

        PreloadOutcome::Failed { error: record }
    }

    /// Presents the loaded ad. Never issues an SDK show unless the unit is
    /// `Loaded`; a unit that is idle or errored gets one transparent
    /// preload attempt first.
    pub async fn show(self: &Arc<Self>) -> ShowOutcome {
        if !self.sdk.is_initialized() {
            return ShowOutcome::Denied {
                reason: "ad SDK not initialized".to_string(),
            };
        }
        if !self.consent.can_request_ads() {
            return ShowOutcome::Denied {
                reason: "consent withheld".to_string(),
            };
        }
        if !self.health.can_globally_show() {
            return ShowOutcome::Denied {
                reason: "ads disabled by health policy".to_string(),
            };
        }

        let suitability = self.probe_network().await;
        if !suitability.suitable {
            let reason = suitability
                .reason
                .unwrap_or_else(|| "network unsuitable".to_string());
            return ShowOutcome::Denied { reason };
        }

        // The state machine re-checks policy; the caller's earlier timing
        // decision may have gone stale.
        let permission = self.frequency.can_show();
        if !permission.allowed {
            let reason = permission
                .reason
                .unwrap_or_else(|| "frequency policy denied".to_string());
            debug!(
                placement = self.placement.display_name(),
                reason = %reason,
                "show denied by frequency policy"
            );
            return ShowOutcome::Denied { reason };
        }

        if !self.ensure_loaded().await {
            return ShowOutcome::Denied {
                reason: "no ad loaded".to_string(),
            };
        }

        {
            let mut state = self.state.lock().expect("unit lock poisoned");
            if state.destroyed {
                return ShowOutcome::Denied {
                    reason: "unit destroyed".to_string(),
                };
            }
            if state.phase != UnitPhase::Loaded {
                return ShowOutcome::Denied {
                    reason: "no ad loaded".to_string(),
                };
            }
            self.set_phase(&mut state, UnitPhase::Showing);
        }

        // Subscribe before the show call so the close event cannot be
        // missed; dropping the receiver unsubscribes.
        let events_rx = self.sdk.events();
        let show_timeout = StdDuration::from_secs(self.config.show_timeout_secs);
        match tokio::time::timeout(show_timeout, self.sdk.show(self.placement)).await {
            Ok(Ok(())) => {
                self.watch_for_close(events_rx);
                ShowOutcome::Shown
            }
            Ok(Err(sdk_error)) => {
                let record = classifier::classify(&sdk_error, self.placement);
                self.fail_show(record)
            }
            Err(_) => {
                let timed_out = SdkError::new(
                    None,
                    format!("show timed out after {}s", self.config.show_timeout_secs),
                );
                let record = classifier::classify(&timed_out, self.placement);
                self.fail_show(record)
            }
        }
    }

    /// Show failures revert to Idle without a frequency record and are
    /// never retried automatically.
    fn fail_show(&self, record: ErrorRecord) -> ShowOutcome {
        {
            let mut state = self.state.lock().expect("unit lock poisoned");
            state.last_error = Some(record.clone());
            self.set_phase(&mut state, UnitPhase::Idle);
        }
        self.history.record(record.clone());
        self.events.log_classified_error(self.placement, &record);
        ShowOutcome::Failed { error: record }
    }

    /// Makes one transparent attempt to reach `Loaded`, waiting a short
    /// bounded window if a load is already in flight.
    async fn ensure_loaded(self: &Arc<Self>) -> bool {
        let (phase, test_mode) = {
            let state = self.state.lock().expect("unit lock poisoned");
            (state.phase, state.test_mode)
        };

        match phase {
            UnitPhase::Loaded => return true,
            UnitPhase::Showing => return false,
            UnitPhase::Idle | UnitPhase::Error => {
                let _ = self.preload(test_mode).await;
            }
            UnitPhase::Loading => {}
        }

        let fallback = StdDuration::from_millis(self.config.show_fallback_wait_ms);
        let mut snapshots = self.snapshot_tx.subscribe();
        let loaded = matches!(
            tokio::time::timeout(
                fallback,
                snapshots.wait_for(|s| s.phase == UnitPhase::Loaded)
            )
            .await,
            Ok(Ok(_))
        );
        loaded
    }

    /// Waits for the SDK's close event, then records the display, returns
    /// the unit to Idle, and schedules the next preload so the following
    /// opportunity is ready quickly. Bounded so a lost close event can
    /// never park the unit in Showing.
    fn watch_for_close(self: &Arc<Self>, mut events_rx: broadcast::Receiver<AdEvent>) {
        let unit = Arc::clone(self);
        let close_timeout = StdDuration::from_secs(self.config.close_timeout_secs);
        let preload_delay = StdDuration::from_millis(self.config.preload_after_close_ms);

        self.scheduler.spawn(async move {
            let closed = tokio::time::timeout(close_timeout, async {
                loop {
                    match events_rx.recv().await {
                        Ok(AdEvent::Closed { placement }) if placement == unit.placement => break,
                        Ok(AdEvent::RewardEarned {
                            placement,
                            amount,
                            kind,
                        }) if placement == unit.placement => {
                            unit.events.log_reward(placement, amount, &kind);
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
            .await;

            if closed.is_err() {
                warn!(
                    placement = unit.placement.display_name(),
                    "close event never arrived, forcing unit back to idle"
                );
            }

            let test_mode = {
                let mut state = unit.state.lock().expect("unit lock poisoned");
                if state.phase == UnitPhase::Showing {
                    unit.set_phase(&mut state, UnitPhase::Idle);
                }
                state.test_mode
            };

            unit.frequency.record_shown();
            unit.events.log_ad_shown(unit.placement);

            let next = Arc::clone(&unit);
            unit.scheduler.schedule_once(preload_delay, async move {
                let _ = next.preload(test_mode).await;
            });
        });
    }

    /// Drops any loaded ad and attempt accounting, then preloads afresh.
    pub async fn force_reload(self: &Arc<Self>) -> PreloadOutcome {
        let test_mode = {
            let mut state = self.state.lock().expect("unit lock poisoned");
            if state.destroyed {
                return PreloadOutcome::Denied {
                    reason: "unit destroyed".to_string(),
                };
            }
            if state.phase == UnitPhase::Showing {
                return PreloadOutcome::Denied {
                    reason: "show in progress".to_string(),
                };
            }
            state.load_attempts = 0;
            state.exhausted_at = None;
            state.last_error = None;
            self.set_phase(&mut state, UnitPhase::Idle);
            state.test_mode
        };
        self.preload(test_mode).await
    }

    /// Marks the unit destroyed. Pending scheduled work is cancelled with
    /// the owning scheduler; anything that still fires becomes a no-op.
    pub fn destroy(&self) {
        let mut state = self.state.lock().expect("unit lock poisoned");
        state.destroyed = true;
        self.set_phase(&mut state, UnitPhase::Idle);
    }

    async fn probe_network(&self) -> NetworkSuitability {
        match tokio::time::timeout(NETWORK_PROBE_TIMEOUT, self.network.is_suitable()).await {
            Ok(suitability) => suitability,
            Err(_) => NetworkSuitability::unsuitable("network probe timed out"),
        }
    }

    fn set_phase(&self, state: &mut UnitState, to: UnitPhase) {
        if state.phase != to {
            self.events.log_phase_transition(
                self.placement,
                state.phase.display_name(),
                to.display_name(),
            );
        }
        state.phase = to;
        let _ = self.snapshot_tx.send(UnitSnapshot {
            placement: self.placement,
            phase: state.phase,
            load_attempts: state.load_attempts,
            last_load_at: state.last_load_at,
            last_error: state.last_error.clone(),
        });
    }
}

#[cfg(test)]
#[path = "tests/ad_unit_tests.rs"]
mod tests;
