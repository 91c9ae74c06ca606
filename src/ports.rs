//! Interface boundary to external collaborators.
//!
//! The governor never talks to a concrete ad SDK, storage layer, or
//! platform notifier directly; everything arrives through the traits in
//! this module so the whole subsystem can be exercised against mocks.
//! Reference key-value stores (in-memory and file-backed) are provided
//! because the frequency policy store needs a durable default.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Ad placement types managed by the governor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    Interstitial,
    Rewarded,
}

impl Placement {
    /// Returns a human-readable name for this placement.
    pub fn display_name(&self) -> &'static str {
        match self {
            Placement::Interstitial => "interstitial",
            Placement::Rewarded => "rewarded",
        }
    }
}

/// Raw failure surfaced by the ad serving SDK.
///
/// `code` follows the SDK's numeric error codes when present; `message`
/// is the SDK's own text and is never shown to end users.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdkError {
    pub code: Option<i32>,
    pub message: String,
}

impl SdkError {
    pub fn new(code: Option<i32>, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Parameters for an SDK load call.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadRequest {
    /// Request a test creative instead of a live one.
    pub test_mode: bool,
}

/// Events emitted by the ad serving SDK during an ad's lifetime.
#[derive(Debug, Clone, PartialEq)]
pub enum AdEvent {
    Loaded {
        placement: Placement,
    },
    Opened {
        placement: Placement,
    },
    Closed {
        placement: Placement,
    },
    Clicked {
        placement: Placement,
    },
    RewardEarned {
        placement: Placement,
        amount: u32,
        kind: String,
    },
}

/// The ad serving SDK boundary.
#[async_trait]
pub trait AdServingSdk: Send + Sync {
    /// Whether the SDK finished its own initialization.
    fn is_initialized(&self) -> bool;

    /// Fetches an ad for the placement. Resolves once the ad is ready.
    async fn load(&self, placement: Placement, request: LoadRequest) -> Result<(), SdkError>;

    /// Presents a previously loaded ad. Resolves once the ad is on screen;
    /// dismissal is signalled by a later [`AdEvent::Closed`].
    async fn show(&self, placement: Placement) -> Result<(), SdkError>;

    /// Subscribes to the SDK's lifecycle event stream. Dropping the
    /// receiver unsubscribes.
    fn events(&self) -> broadcast::Receiver<AdEvent>;
}

/// Persistent key-value storage used for policy durability.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

/// Network suitability as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSuitability {
    pub suitable: bool,
    pub reason: Option<String>,
}

impl NetworkSuitability {
    pub fn suitable() -> Self {
        Self {
            suitable: true,
            reason: None,
        }
    }

    pub fn unsuitable(reason: impl Into<String>) -> Self {
        Self {
            suitable: false,
            reason: Some(reason.into()),
        }
    }
}

/// Reports whether the network is currently fit for ad traffic.
#[async_trait]
pub trait NetworkReporter: Send + Sync {
    async fn is_suitable(&self) -> NetworkSuitability;

    /// Subscribes to suitability transitions. Dropping the receiver
    /// unsubscribes.
    fn subscribe(&self) -> broadcast::Receiver<NetworkSuitability>;
}

/// App foreground/background state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppLifecycleState {
    Foreground,
    Background,
}

/// Delivers app foreground/background transitions.
pub trait AppLifecycleNotifier: Send + Sync {
    /// Subscribes to lifecycle transitions. Dropping the receiver
    /// unsubscribes.
    fn subscribe(&self) -> broadcast::Receiver<AppLifecycleState>;
}

/// The consent/privacy gate. Consulted before any load or show; the
/// governor never caches its answer.
pub trait ConsentGate: Send + Sync {
    fn can_request_ads(&self) -> bool;
}

/// In-memory key-value store. Durable only for the process lifetime;
/// useful as a default and in tests.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.lock().expect("kv store lock poisoned");
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut entries = self.entries.lock().expect("kv store lock poisoned");
        entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().expect("kv store lock poisoned");
        entries.remove(key);
        Ok(())
    }
}

/// File-backed key-value store: one file per key under a base directory,
/// written atomically via a temp file and rename.
pub struct FileKeyValueStore {
    dir: PathBuf,
}

impl FileKeyValueStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Keys are dotted identifiers; keep the filename flat.
        let name: String = key
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.bin", name))
    }
}

#[async_trait]
impl KeyValueStore for FileKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create directory: {}", self.dir.display()))?;
        let path = self.path_for(key);
        let temp_path = path.with_extension("bin.tmp");
        tokio::fs::write(&temp_path, &value)
            .await
            .with_context(|| format!("Failed to write temp file: {}", temp_path.display()))?;
        tokio::fs::rename(&temp_path, &path)
            .await
            .with_context(|| format!("Failed to rename temp file to: {}", path.display()))?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }
}
