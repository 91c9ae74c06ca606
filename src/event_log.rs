//! Structured JSONL event log for decisions and ad lifecycle events.
//!
//! Machine-parseable telemetry with monotonic sequence numbers, ISO 8601
//! timestamps with microsecond precision, and a session id for correlation.
//! Best-effort: a failed write never propagates to the ad path.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::classifier::ErrorRecord;
use crate::health::HealthSnapshot;
use crate::ports::Placement;
use crate::timing::{DecisionContext, TimingDecision};

/// Structured JSONL logger for the governor.
pub struct EventLog {
    session_id: String,
    seq: AtomicU64,
    log_file: Mutex<File>,
    log_path: PathBuf,
}

/// A single log entry in JSONL format.
#[derive(Serialize, serde::Deserialize)]
pub struct LogEntry {
    /// Monotonic sequence number (unique across the process lifetime)
    pub seq: u64,
    /// ISO 8601 timestamp with microseconds
    pub ts: String,
    /// Process session id
    pub session_id: String,
    /// Component that emitted the entry
    pub component: String,
    /// Structured event data
    pub event: Value,
}

impl EventLog {
    /// Creates a new event log writing to `<logs_dir>/ad-events.jsonl`.
    ///
    /// # Errors
    ///
    /// Returns an error if the logs directory cannot be created or the log
    /// file cannot be opened.
    pub fn new(logs_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(logs_dir)?;
        let log_path = logs_dir.join("ad-events.jsonl");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        Ok(Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            seq: AtomicU64::new(0),
            log_file: Mutex::new(file),
            log_path,
        })
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Logs a structured event. Thread-safe; failures are swallowed.
    pub fn log(&self, component: &str, event: impl Serialize) {
        let entry = LogEntry {
            seq: self.next_seq(),
            ts: Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string(),
            session_id: self.session_id.clone(),
            component: component.to_string(),
            event: serde_json::to_value(event).unwrap_or(Value::Null),
        };

        if let Ok(mut file) = self.log_file.lock() {
            if let Ok(line) = serde_json::to_string(&entry) {
                let _ = writeln!(file, "{}", line);
                let _ = file.flush();
            }
        }
    }

    /// Logs a timing decision together with its context.
    pub fn log_decision(&self, context: &DecisionContext, decision: &TimingDecision) {
        self.log(
            "Timing",
            serde_json::json!({
                "type": "Decision",
                "surface": context.surface,
                "trigger": context.trigger,
                "should_show": decision.should_show,
                "reason": decision.reason,
                "confidence": decision.confidence,
                "suggested_delay_ms": decision.suggested_delay_ms,
            }),
        );
    }

    /// Logs an ad unit phase transition.
    pub fn log_phase_transition(&self, placement: Placement, from: &str, to: &str) {
        self.log(
            "AdUnit",
            serde_json::json!({
                "type": "PhaseTransition",
                "placement": placement,
                "from": from,
                "to": to
            }),
        );
    }

    /// Logs a classified failure.
    pub fn log_classified_error(&self, placement: Placement, record: &ErrorRecord) {
        self.log(
            "AdUnit",
            serde_json::json!({
                "type": "ClassifiedError",
                "placement": placement,
                "record": record
            }),
        );
    }

    /// Logs a completed display.
    pub fn log_ad_shown(&self, placement: Placement) {
        self.log(
            "AdUnit",
            serde_json::json!({
                "type": "AdShown",
                "placement": placement
            }),
        );
    }

    /// Logs an earned reward.
    pub fn log_reward(&self, placement: Placement, amount: u32, kind: &str) {
        self.log(
            "AdUnit",
            serde_json::json!({
                "type": "RewardEarned",
                "placement": placement,
                "amount": amount,
                "kind": kind
            }),
        );
    }

    /// Logs a health snapshot.
    pub fn log_health(&self, snapshot: &HealthSnapshot) {
        self.log(
            "Health",
            serde_json::json!({
                "type": "Snapshot",
                "snapshot": snapshot
            }),
        );
    }

    /// Logs an emergency disable or its clearing.
    pub fn log_emergency(&self, active: bool, reason: &str) {
        self.log(
            "Health",
            serde_json::json!({
                "type": "EmergencyDisable",
                "active": active,
                "reason": reason
            }),
        );
    }

    /// Returns the path to the log file.
    pub fn path(&self) -> &PathBuf {
        &self.log_path
    }

    /// Returns the session id stamped on every entry.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}
