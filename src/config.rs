//! Configuration for the ad governor.
//!
//! All fields carry serde defaults so a partial YAML file (or none at all)
//! yields a working configuration. Durations are plain integers with a unit
//! suffix in the field name.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct GovernorConfig {
    #[serde(default)]
    pub frequency: FrequencyConfig,
    #[serde(default)]
    pub loading: LoadConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
}

/// Caps and intervals enforced by the frequency policy store.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FrequencyConfig {
    /// Interactions required before the first ad of a session. Default: 3
    #[serde(default = "default_min_interactions_before_first")]
    pub min_interactions_before_first: u32,
    /// Maximum ads shown per session window. Default: 2
    #[serde(default = "default_max_per_session")]
    pub max_per_session: u32,
    /// Minimum spacing between two shown ads. Default: 180000 (3 min)
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    /// Inactivity after which the session window resets. Default: 30
    #[serde(default = "default_session_inactivity_mins")]
    pub session_inactivity_mins: i64,
}

/// Load/show lifecycle timing for the ad unit state machine.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoadConfig {
    /// Consecutive failed loads before the unit cools down. Default: 3
    #[serde(default = "default_max_load_attempts")]
    pub max_load_attempts: u32,
    /// SDK load call timeout. Default: 30
    #[serde(default = "default_load_timeout_secs")]
    pub load_timeout_secs: u64,
    /// SDK show call timeout. Default: 10
    #[serde(default = "default_show_timeout_secs")]
    pub show_timeout_secs: u64,
    /// Cooldown after attempt exhaustion before loads resume. Default: 300
    #[serde(default = "default_exhaustion_cooldown_secs")]
    pub exhaustion_cooldown_secs: u64,
    /// Delay between ad close and the next preload. Default: 2000
    #[serde(default = "default_preload_after_close_ms")]
    pub preload_after_close_ms: u64,
    /// How long `show` waits for an in-flight load to finish. Default: 1500
    #[serde(default = "default_show_fallback_wait_ms")]
    pub show_fallback_wait_ms: u64,
    /// Upper bound on how long a shown ad may stay open before the unit
    /// is forced back to idle. Default: 300
    #[serde(default = "default_close_timeout_secs")]
    pub close_timeout_secs: u64,
}

/// Thresholds and cadence for the health aggregator.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthConfig {
    /// Periodic health check interval. Default: 30
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    /// Debounce for event-driven health checks. Default: 2000
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Rolling window for error-rate computation. Default: 24
    #[serde(default = "default_error_window_hours")]
    pub error_window_hours: i64,
    /// Errors within the window that degrade the grade. Default: 8
    #[serde(default = "default_degraded_error_threshold")]
    pub degraded_error_threshold: u32,
    /// Errors within the window that make the grade critical. Default: 15
    #[serde(default = "default_critical_error_threshold")]
    pub critical_error_threshold: u32,
    /// Network-category errors that recommend a network check. Default: 5
    #[serde(default = "default_network_error_threshold")]
    pub network_error_threshold: u32,
    /// Timeout for the health check's network probe. Default: 5
    #[serde(default = "default_network_probe_timeout_secs")]
    pub network_probe_timeout_secs: u64,
}

/// Session tracking and passive-surface heuristics.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Minimum duration for a session to count toward cadence. Default: 3000
    #[serde(default = "default_meaningful_session_ms")]
    pub meaningful_session_ms: u64,
    /// Recent sessions retained for statistics. Default: 20
    #[serde(default = "default_history_cap")]
    pub history_cap: usize,
    /// Lower bound for the randomized opportunity threshold. Default: 2
    #[serde(default = "default_threshold_min")]
    pub threshold_min: u32,
    /// Upper bound for the randomized opportunity threshold. Default: 3
    #[serde(default = "default_threshold_max")]
    pub threshold_max: u32,
    /// Sessions counted as "long" by the soft voice heuristic. Default: 30000
    #[serde(default = "default_long_session_ms")]
    pub long_session_ms: u64,
    /// Passive surfaces: minimum elapsed time since the last shown ad.
    /// Default: 120000 (2 min)
    #[serde(default = "default_passive_min_elapsed_ms")]
    pub passive_min_elapsed_ms: u64,
    /// Passive surfaces: minimum recorded interactions. Default: 5
    #[serde(default = "default_passive_min_interactions")]
    pub passive_min_interactions: u32,
    /// Passive surfaces: suggested delay before actually showing. Default: 750
    #[serde(default = "default_passive_suggested_delay_ms")]
    pub passive_suggested_delay_ms: u64,
}

fn default_min_interactions_before_first() -> u32 {
    3
}

fn default_max_per_session() -> u32 {
    2
}

fn default_min_interval_ms() -> u64 {
    180_000
}

fn default_session_inactivity_mins() -> i64 {
    30
}

fn default_max_load_attempts() -> u32 {
    3
}

fn default_load_timeout_secs() -> u64 {
    30
}

fn default_show_timeout_secs() -> u64 {
    10
}

fn default_exhaustion_cooldown_secs() -> u64 {
    300
}

fn default_preload_after_close_ms() -> u64 {
    2_000
}

fn default_show_fallback_wait_ms() -> u64 {
    1_500
}

fn default_close_timeout_secs() -> u64 {
    300
}

fn default_check_interval_secs() -> u64 {
    30
}

fn default_debounce_ms() -> u64 {
    2_000
}

fn default_error_window_hours() -> i64 {
    24
}

fn default_degraded_error_threshold() -> u32 {
    8
}

fn default_critical_error_threshold() -> u32 {
    15
}

fn default_network_error_threshold() -> u32 {
    5
}

fn default_network_probe_timeout_secs() -> u64 {
    5
}

fn default_meaningful_session_ms() -> u64 {
    3_000
}

fn default_history_cap() -> usize {
    20
}

fn default_threshold_min() -> u32 {
    2
}

fn default_threshold_max() -> u32 {
    3
}

fn default_long_session_ms() -> u64 {
    30_000
}

fn default_passive_min_elapsed_ms() -> u64 {
    120_000
}

fn default_passive_min_interactions() -> u32 {
    5
}

fn default_passive_suggested_delay_ms() -> u64 {
    750
}

impl Default for FrequencyConfig {
    fn default() -> Self {
        Self {
            min_interactions_before_first: default_min_interactions_before_first(),
            max_per_session: default_max_per_session(),
            min_interval_ms: default_min_interval_ms(),
            session_inactivity_mins: default_session_inactivity_mins(),
        }
    }
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            max_load_attempts: default_max_load_attempts(),
            load_timeout_secs: default_load_timeout_secs(),
            show_timeout_secs: default_show_timeout_secs(),
            exhaustion_cooldown_secs: default_exhaustion_cooldown_secs(),
            preload_after_close_ms: default_preload_after_close_ms(),
            show_fallback_wait_ms: default_show_fallback_wait_ms(),
            close_timeout_secs: default_close_timeout_secs(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            debounce_ms: default_debounce_ms(),
            error_window_hours: default_error_window_hours(),
            degraded_error_threshold: default_degraded_error_threshold(),
            critical_error_threshold: default_critical_error_threshold(),
            network_error_threshold: default_network_error_threshold(),
            network_probe_timeout_secs: default_network_probe_timeout_secs(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            meaningful_session_ms: default_meaningful_session_ms(),
            history_cap: default_history_cap(),
            threshold_min: default_threshold_min(),
            threshold_max: default_threshold_max(),
            long_session_ms: default_long_session_ms(),
            passive_min_elapsed_ms: default_passive_min_elapsed_ms(),
            passive_min_interactions: default_passive_min_interactions(),
            passive_suggested_delay_ms: default_passive_suggested_delay_ms(),
        }
    }
}

impl GovernorConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file as YAML: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Returns the built-in default configuration.
    pub fn default_config() -> Self {
        const DEFAULT_GOVERNOR_YAML: &str = include_str!("../governor.yaml");

        serde_yaml::from_str(DEFAULT_GOVERNOR_YAML)
            .expect("Failed to parse embedded governor.yaml - this is a bug in the governor.yaml file")
    }

    pub fn validate(&self) -> Result<()> {
        if self.frequency.max_per_session == 0 {
            anyhow::bail!("frequency.max_per_session must be at least 1");
        }

        if self.loading.max_load_attempts == 0 {
            anyhow::bail!("loading.max_load_attempts must be at least 1");
        }

        if self.sessions.threshold_min > self.sessions.threshold_max {
            anyhow::bail!(
                "sessions.threshold_min ({}) must not exceed sessions.threshold_max ({})",
                self.sessions.threshold_min,
                self.sessions.threshold_max
            );
        }

        if self.sessions.history_cap == 0 {
            anyhow::bail!("sessions.history_cap must be at least 1");
        }

        if self.health.critical_error_threshold < self.health.degraded_error_threshold {
            anyhow::bail!(
                "health.critical_error_threshold ({}) must not be below health.degraded_error_threshold ({})",
                self.health.critical_error_threshold,
                self.health.degraded_error_threshold
            );
        }

        Ok(())
    }
}
