//! Error classification for ad SDK failures.
//!
//! [`classify`] is a pure function mapping a raw SDK failure to a typed
//! [`ErrorRecord`]: a category, a short user-facing message (raw SDK text
//! never reaches end users), whether a retry is worthwhile, and a suggested
//! retry delay. Callers append records to the bounded [`ErrorHistory`],
//! which the health aggregator reads for rolling error rates.

use crate::ports::{Placement, SdkError};
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, OnceLock};

/// Maximum number of error records kept in the rolling history.
pub const MAX_ERROR_HISTORY: usize = 100;

/// Default retry delay floor.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 20_000;
/// Delay for failures that usually need operator or mediation attention.
pub const MEDIUM_RETRY_DELAY_MS: u64 = 60_000;
/// Delay for failures where hammering the network makes things worse.
pub const LONG_RETRY_DELAY_MS: u64 = 120_000;

// AdMob-style numeric error codes.
const CODE_INTERNAL: i32 = 0;
const CODE_INVALID_REQUEST: i32 = 1;
const CODE_NETWORK: i32 = 2;
const CODE_NO_FILL: i32 = 3;
const CODE_INVALID_AD_SIZE: i32 = 8;
const CODE_MEDIATION_NO_FILL: i32 = 9;

/// Canonical failure categories for ad delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdErrorCategory {
    Internal,
    InvalidRequest,
    Network,
    NoFill,
    InvalidConfig,
    MediationNoFill,
    Unknown,
}

impl AdErrorCategory {
    /// Returns true if a retry has a realistic chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AdErrorCategory::Network
                | AdErrorCategory::NoFill
                | AdErrorCategory::MediationNoFill
                | AdErrorCategory::Unknown
        )
    }

    /// Returns a human-readable name for this category.
    pub fn display_name(&self) -> &'static str {
        match self {
            AdErrorCategory::Internal => "Internal",
            AdErrorCategory::InvalidRequest => "Invalid Request",
            AdErrorCategory::Network => "Network",
            AdErrorCategory::NoFill => "No Fill",
            AdErrorCategory::InvalidConfig => "Invalid Config",
            AdErrorCategory::MediationNoFill => "Mediation No Fill",
            AdErrorCategory::Unknown => "Unknown",
        }
    }

    fn user_message(&self) -> &'static str {
        match self {
            AdErrorCategory::Internal => "Ads are temporarily unavailable",
            AdErrorCategory::InvalidRequest => "Ads are not available right now",
            AdErrorCategory::Network => "Check your internet connection",
            AdErrorCategory::NoFill => "No ad is available at the moment",
            AdErrorCategory::InvalidConfig => "Ads are not available right now",
            AdErrorCategory::MediationNoFill => "No ad is available at the moment",
            AdErrorCategory::Unknown => "Something went wrong loading the ad",
        }
    }

    fn suggested_delay_ms(&self) -> u64 {
        match self {
            AdErrorCategory::Internal => LONG_RETRY_DELAY_MS,
            AdErrorCategory::InvalidRequest => 0,
            AdErrorCategory::Network => LONG_RETRY_DELAY_MS,
            AdErrorCategory::NoFill => LONG_RETRY_DELAY_MS,
            AdErrorCategory::InvalidConfig => 0,
            AdErrorCategory::MediationNoFill => MEDIUM_RETRY_DELAY_MS,
            AdErrorCategory::Unknown => DEFAULT_RETRY_DELAY_MS,
        }
    }
}

/// A classified failure. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub category: AdErrorCategory,
    /// Short user-facing message. Never contains raw SDK text.
    pub message: String,
    /// Raw SDK text plus placement, for logs only.
    pub detail: String,
    pub retryable: bool,
    pub suggested_delay_ms: u64,
    pub occurred_at: DateTime<Utc>,
}

fn network_message_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)network|offline|unreachable|connection").expect("invalid network pattern")
    })
}

fn timeout_message_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)timeout|timed\s+out").expect("invalid timeout pattern"))
}

fn initialization_message_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)initializ|not\s+ready").expect("invalid initialization pattern")
    })
}

/// Classifies a raw SDK failure. Pure: no side effects, no history append.
pub fn classify(raw: &SdkError, placement: Placement) -> ErrorRecord {
    let category = match raw.code {
        Some(CODE_INTERNAL) => AdErrorCategory::Internal,
        Some(CODE_INVALID_REQUEST) => AdErrorCategory::InvalidRequest,
        Some(CODE_NETWORK) => AdErrorCategory::Network,
        Some(CODE_NO_FILL) => AdErrorCategory::NoFill,
        Some(CODE_INVALID_AD_SIZE) => AdErrorCategory::InvalidConfig,
        Some(CODE_MEDIATION_NO_FILL) => AdErrorCategory::MediationNoFill,
        Some(_) => classify_by_message(&raw.message),
        None => classify_by_message(&raw.message),
    };

    record_for(category, placement, &raw.message)
}

fn classify_by_message(message: &str) -> AdErrorCategory {
    if network_message_pattern().is_match(message) || timeout_message_pattern().is_match(message) {
        AdErrorCategory::Network
    } else if initialization_message_pattern().is_match(message) {
        AdErrorCategory::Internal
    } else {
        AdErrorCategory::Unknown
    }
}

/// Builds the fail-fast record used when the network is unsuitable before a
/// load is even issued. Network category, but not retryable: the retry is
/// pointless until a reachability transition arrives.
pub fn network_unavailable(placement: Placement, reason: &str) -> ErrorRecord {
    let mut record = record_for(AdErrorCategory::Network, placement, reason);
    record.retryable = false;
    record
}

fn record_for(category: AdErrorCategory, placement: Placement, raw_message: &str) -> ErrorRecord {
    ErrorRecord {
        category,
        message: category.user_message().to_string(),
        detail: format!("{}: {}", placement.display_name(), raw_message),
        retryable: category.is_retryable(),
        suggested_delay_ms: category.suggested_delay_ms(),
        occurred_at: Utc::now(),
    }
}

/// Bounded rolling history of classified errors, most recent first.
#[derive(Default)]
pub struct ErrorHistory {
    records: Mutex<VecDeque<ErrorRecord>>,
}

impl ErrorHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a record, evicting the oldest once the cap is reached.
    pub fn record(&self, record: ErrorRecord) {
        let mut records = self.records.lock().expect("error history lock poisoned");
        records.push_front(record);
        while records.len() > MAX_ERROR_HISTORY {
            records.pop_back();
        }
    }

    /// Returns up to `limit` records, most recent first.
    pub fn recent(&self, limit: usize) -> Vec<ErrorRecord> {
        let records = self.records.lock().expect("error history lock poisoned");
        records.iter().take(limit).cloned().collect()
    }

    /// Counts records newer than `window` before now.
    pub fn count_since(&self, window: Duration) -> u32 {
        self.count_matching_since(window, |_| true)
    }

    /// Counts network-category records newer than `window` before now.
    pub fn network_count_since(&self, window: Duration) -> u32 {
        self.count_matching_since(window, |r| r.category == AdErrorCategory::Network)
    }

    fn count_matching_since(&self, window: Duration, keep: impl Fn(&ErrorRecord) -> bool) -> u32 {
        let cutoff = Utc::now() - window;
        let records = self.records.lock().expect("error history lock poisoned");
        records
            .iter()
            .filter(|r| r.occurred_at >= cutoff && keep(r))
            .count() as u32
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("error history lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(code: Option<i32>, message: &str) -> SdkError {
        SdkError::new(code, message)
    }

    #[test]
    fn code_table_maps_categories() {
        let cases = [
            (0, AdErrorCategory::Internal, false),
            (1, AdErrorCategory::InvalidRequest, false),
            (2, AdErrorCategory::Network, true),
            (3, AdErrorCategory::NoFill, true),
            (8, AdErrorCategory::InvalidConfig, false),
            (9, AdErrorCategory::MediationNoFill, true),
        ];

        for (code, category, retryable) in cases {
            let record = classify(&raw(Some(code), "sdk detail"), Placement::Interstitial);
            assert_eq!(record.category, category, "code {}", code);
            assert_eq!(record.retryable, retryable, "code {}", code);
        }
    }

    #[test]
    fn network_and_no_fill_get_long_delays() {
        let network = classify(&raw(Some(2), "x"), Placement::Interstitial);
        let no_fill = classify(&raw(Some(3), "x"), Placement::Interstitial);
        let mediation = classify(&raw(Some(9), "x"), Placement::Interstitial);

        assert_eq!(network.suggested_delay_ms, LONG_RETRY_DELAY_MS);
        assert_eq!(no_fill.suggested_delay_ms, LONG_RETRY_DELAY_MS);
        assert_eq!(mediation.suggested_delay_ms, MEDIUM_RETRY_DELAY_MS);
    }

    #[test]
    fn unknown_code_falls_back_to_message() {
        let record = classify(
            &raw(Some(42), "The Network request failed"),
            Placement::Rewarded,
        );
        assert_eq!(record.category, AdErrorCategory::Network);
    }

    #[test]
    fn message_classification_covers_timeout_and_init() {
        let timeout = classify(&raw(None, "load timed out after 30s"), Placement::Interstitial);
        assert_eq!(timeout.category, AdErrorCategory::Network);
        assert!(timeout.retryable);

        let init = classify(
            &raw(None, "SDK initialization incomplete"),
            Placement::Interstitial,
        );
        assert_eq!(init.category, AdErrorCategory::Internal);
        assert!(!init.retryable);
    }

    #[test]
    fn unclassifiable_message_is_unknown_and_retryable() {
        let record = classify(&raw(None, "weird failure"), Placement::Interstitial);
        assert_eq!(record.category, AdErrorCategory::Unknown);
        assert!(record.retryable);
        assert_eq!(record.suggested_delay_ms, DEFAULT_RETRY_DELAY_MS);
    }

    #[test]
    fn user_message_never_leaks_sdk_text() {
        let record = classify(
            &raw(Some(0), "internal gmob stack trace: 0xDEADBEEF"),
            Placement::Interstitial,
        );
        assert!(!record.message.contains("0xDEADBEEF"));
        assert!(record.detail.contains("0xDEADBEEF"));
    }

    #[test]
    fn network_unavailable_is_not_retryable() {
        let record = network_unavailable(Placement::Interstitial, "airplane mode");
        assert_eq!(record.category, AdErrorCategory::Network);
        assert!(!record.retryable);
    }

    #[test]
    fn history_is_bounded_and_most_recent_first() {
        let history = ErrorHistory::new();
        for i in 0..(MAX_ERROR_HISTORY + 10) {
            let record = classify(
                &raw(Some(3), &format!("fill miss {}", i)),
                Placement::Interstitial,
            );
            history.record(record);
        }

        assert_eq!(history.len(), MAX_ERROR_HISTORY);
        let recent = history.recent(2);
        assert!(recent[0].detail.contains("fill miss 109"));
        assert!(recent[1].detail.contains("fill miss 108"));
    }

    #[test]
    fn windowed_counts_ignore_old_records() {
        let history = ErrorHistory::new();

        let mut old = classify(&raw(Some(2), "stale"), Placement::Interstitial);
        old.occurred_at = Utc::now() - Duration::hours(30);
        history.record(old);

        history.record(classify(&raw(Some(2), "fresh"), Placement::Interstitial));
        history.record(classify(&raw(Some(3), "fresh fill"), Placement::Interstitial));

        assert_eq!(history.count_since(Duration::hours(24)), 2);
        assert_eq!(history.network_count_since(Duration::hours(24)), 1);
    }
}
