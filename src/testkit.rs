//! Shared mock collaborators for tests.

use crate::classifier::ErrorHistory;
use crate::config::{FrequencyConfig, GovernorConfig};
use crate::event_log::EventLog;
use crate::frequency::FrequencyPolicyStore;
use crate::health::HealthMonitor;
use crate::ports::{
    AdEvent, AdServingSdk, AppLifecycleNotifier, AppLifecycleState, ConsentGate, LoadRequest,
    MemoryKeyValueStore, NetworkReporter, NetworkSuitability, Placement, SdkError,
};
use crate::scheduler::TaskScheduler;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Programmable SDK double. Queued results are consumed front-to-back;
/// an empty queue means success.
pub struct MockSdk {
    initialized: AtomicBool,
    load_results: Mutex<VecDeque<Result<(), SdkError>>>,
    show_results: Mutex<VecDeque<Result<(), SdkError>>>,
    hang_loads: AtomicBool,
    hang_shows: AtomicBool,
    load_calls: AtomicU32,
    show_calls: AtomicU32,
    events_tx: broadcast::Sender<AdEvent>,
}

impl Default for MockSdk {
    fn default() -> Self {
        let (events_tx, _) = broadcast::channel(16);
        Self {
            initialized: AtomicBool::new(true),
            load_results: Mutex::new(VecDeque::new()),
            show_results: Mutex::new(VecDeque::new()),
            hang_loads: AtomicBool::new(false),
            hang_shows: AtomicBool::new(false),
            load_calls: AtomicU32::new(0),
            show_calls: AtomicU32::new(0),
            events_tx,
        }
    }
}

impl MockSdk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_initialized(&self, initialized: bool) {
        self.initialized.store(initialized, Ordering::SeqCst);
    }

    pub fn queue_load_result(&self, result: Result<(), SdkError>) {
        self.load_results
            .lock()
            .expect("mock lock poisoned")
            .push_back(result);
    }

    pub fn queue_show_result(&self, result: Result<(), SdkError>) {
        self.show_results
            .lock()
            .expect("mock lock poisoned")
            .push_back(result);
    }

    /// Makes every load call pend forever, so timeouts can be exercised.
    pub fn hang_loads(&self) {
        self.hang_loads.store(true, Ordering::SeqCst);
    }

    pub fn hang_shows(&self) {
        self.hang_shows.store(true, Ordering::SeqCst);
    }

    pub fn emit(&self, event: AdEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn load_calls(&self) -> u32 {
        self.load_calls.load(Ordering::SeqCst)
    }

    pub fn show_calls(&self) -> u32 {
        self.show_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AdServingSdk for MockSdk {
    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    async fn load(&self, _placement: Placement, _request: LoadRequest) -> Result<(), SdkError> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        if self.hang_loads.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.load_results
            .lock()
            .expect("mock lock poisoned")
            .pop_front()
            .unwrap_or(Ok(()))
    }

    async fn show(&self, _placement: Placement) -> Result<(), SdkError> {
        self.show_calls.fetch_add(1, Ordering::SeqCst);
        if self.hang_shows.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.show_results
            .lock()
            .expect("mock lock poisoned")
            .pop_front()
            .unwrap_or(Ok(()))
    }

    fn events(&self) -> broadcast::Receiver<AdEvent> {
        self.events_tx.subscribe()
    }
}

/// Network double with a settable answer and a broadcast for transitions.
pub struct StaticNetwork {
    current: Mutex<NetworkSuitability>,
    tx: broadcast::Sender<NetworkSuitability>,
}

impl Default for StaticNetwork {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self {
            current: Mutex::new(NetworkSuitability::suitable()),
            tx,
        }
    }
}

impl StaticNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, suitability: NetworkSuitability) {
        *self.current.lock().expect("mock lock poisoned") = suitability.clone();
        let _ = self.tx.send(suitability);
    }
}

#[async_trait]
impl NetworkReporter for StaticNetwork {
    async fn is_suitable(&self) -> NetworkSuitability {
        self.current.lock().expect("mock lock poisoned").clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<NetworkSuitability> {
        self.tx.subscribe()
    }
}

/// Consent double.
pub struct StaticConsent(AtomicBool);

impl Default for StaticConsent {
    fn default() -> Self {
        Self(AtomicBool::new(true))
    }
}

impl StaticConsent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, granted: bool) {
        self.0.store(granted, Ordering::SeqCst);
    }
}

impl ConsentGate for StaticConsent {
    fn can_request_ads(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Lifecycle double that replays transitions to subscribers.
pub struct TestLifecycle {
    tx: broadcast::Sender<AppLifecycleState>,
}

impl Default for TestLifecycle {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self { tx }
    }
}

impl TestLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&self, state: AppLifecycleState) {
        let _ = self.tx.send(state);
    }
}

impl AppLifecycleNotifier for TestLifecycle {
    fn subscribe(&self) -> broadcast::Receiver<AppLifecycleState> {
        self.tx.subscribe()
    }
}

/// A fully wired ad unit with mock collaborators and permissive frequency
/// policy. The tempdir must stay alive for the event log to keep writing.
pub struct UnitHarness {
    pub unit: Arc<crate::ad_unit::AdUnit>,
    pub sdk: Arc<MockSdk>,
    pub network: Arc<StaticNetwork>,
    pub consent: Arc<StaticConsent>,
    pub frequency: Arc<FrequencyPolicyStore>,
    pub health: Arc<HealthMonitor>,
    pub history: Arc<ErrorHistory>,
    pub scheduler: Arc<TaskScheduler>,
    pub events: Arc<EventLog>,
    _logs: tempfile::TempDir,
}

impl Default for UnitHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl UnitHarness {
    pub fn new() -> Self {
        Self::with_config(permissive_config())
    }

    pub fn with_config(config: GovernorConfig) -> Self {
        let logs = tempfile::tempdir().expect("tempdir");
        let events = Arc::new(EventLog::new(logs.path()).expect("event log"));
        let sdk = Arc::new(MockSdk::new());
        let network = Arc::new(StaticNetwork::new());
        let consent = Arc::new(StaticConsent::new());
        let history = Arc::new(ErrorHistory::new());
        let scheduler = Arc::new(TaskScheduler::new());
        let frequency = Arc::new(FrequencyPolicyStore::new(
            config.frequency.clone(),
            Arc::new(MemoryKeyValueStore::new()),
        ));
        let health = Arc::new(HealthMonitor::new(
            config.health.clone(),
            sdk.clone(),
            network.clone(),
            history.clone(),
            events.clone(),
        ));
        let unit = Arc::new(crate::ad_unit::AdUnit::new(
            Placement::Interstitial,
            config.loading.clone(),
            sdk.clone(),
            network.clone(),
            consent.clone(),
            frequency.clone(),
            health.clone(),
            history.clone(),
            scheduler.clone(),
            events.clone(),
        ));

        Self {
            unit,
            sdk,
            network,
            consent,
            frequency,
            health,
            history,
            scheduler,
            events,
            _logs: logs,
        }
    }
}

/// Default config with the frequency gates opened so unit tests exercise
/// the state machine rather than the policy store.
pub fn permissive_config() -> GovernorConfig {
    GovernorConfig {
        frequency: FrequencyConfig {
            min_interactions_before_first: 0,
            max_per_session: 100,
            min_interval_ms: 0,
            ..FrequencyConfig::default()
        },
        ..GovernorConfig::default()
    }
}
