//! Ad governor: decides when an interstitial or rewarded ad may be shown.
//!
//! The host application never talks to the ad SDK directly. It injects its
//! platform collaborators (SDK, storage, network, lifecycle, consent)
//! through the traits in [`ports`], asks the governor for timing decisions,
//! and calls [`governor::AdGovernor::try_show`] when a decision says yes.
//! Every show re-checks the frequency policy, consent, network suitability,
//! and subsystem health before the SDK is touched.

pub mod ad_unit;
pub mod classifier;
pub mod config;
pub mod event_log;
pub mod frequency;
pub mod governor;
pub mod health;
pub mod ports;
pub mod scheduler;
pub mod session;
pub mod timing;

#[cfg(test)]
pub mod testkit;

pub use ad_unit::{AdUnit, PreloadOutcome, ShowOutcome, UnitPhase, UnitSnapshot};
pub use classifier::{AdErrorCategory, ErrorHistory, ErrorRecord};
pub use config::GovernorConfig;
pub use frequency::{FrequencyPolicyStore, FrequencyState, ShowPermission};
pub use governor::{AdGovernor, Collaborators, ShowResult};
pub use health::{HealthGrade, HealthMonitor, HealthSnapshot, RecommendedAction};
pub use ports::{
    AdEvent, AdServingSdk, AppLifecycleNotifier, AppLifecycleState, ConsentGate, KeyValueStore,
    NetworkReporter, NetworkSuitability, Placement, SdkError,
};
pub use session::{SessionStats, SessionTracker, Surface, ThresholdSource};
pub use timing::{DecisionContext, TimingDecision, TimingDecisionEngine, TriggerAction};
