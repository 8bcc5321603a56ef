//! Application stores
//!
//! Each packaging format is a store that can enumerate and verify
//! applications. Lookups run through the stores in a fixed order and the
//! first store that knows the application wins.

mod legacy;
mod libertine;
mod snap;

pub use legacy::LegacyStore;
pub use libertine::LibertineStore;
pub use snap::SnapStore;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use tokio::sync::broadcast;

use crate::appid::AppID;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Application not found: {0}")]
    NotFound(String),

    #[error("Malformed application: {0}")]
    Malformed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which store an application record came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreId {
    Legacy,
    Libertine,
    Snap,
}

impl StoreId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::Libertine => "libertine",
            Self::Snap => "snap",
        }
    }

    /// The job that units launched from this store run under
    pub fn job(&self) -> &'static str {
        match self {
            Self::Legacy | Self::Libertine => "application-legacy",
            Self::Snap => "application-snap",
        }
    }
}

/// Everything needed to launch one application
#[derive(Debug, Clone)]
pub struct AppRecord {
    pub appid: AppID,
    pub store: StoreId,
    /// Unexpanded desktop Exec template
    pub exec_template: String,
    pub working_dir: Option<PathBuf>,
    pub apparmor_profile: Option<String>,
    pub extra_env: HashMap<String, String>,
}

/// Discovery event pushed when a store's app set changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Added(AppID),
    Removed(AppID),
}

/// A store can be any of the supported packaging formats
pub enum AppStore {
    Legacy(LegacyStore),
    Libertine(LibertineStore),
    Snap(SnapStore),
}

impl AppStore {
    pub fn store_id(&self) -> StoreId {
        match self {
            Self::Legacy(_) => StoreId::Legacy,
            Self::Libertine(_) => StoreId::Libertine,
            Self::Snap(_) => StoreId::Snap,
        }
    }

    /// All applications this store currently advertises
    pub async fn list(&self) -> Vec<AppRecord> {
        match self {
            Self::Legacy(s) => s.list().await,
            Self::Libertine(s) => s.list().await,
            Self::Snap(s) => s.list().await,
        }
    }

    pub async fn has_app(&self, appid: &AppID) -> bool {
        match self {
            Self::Legacy(s) => s.has_app(appid).await,
            Self::Libertine(s) => s.has_app(appid).await,
            Self::Snap(s) => s.has_app(appid).await,
        }
    }

    /// Resolve an AppID to a launchable record
    pub async fn verify(&self, appid: &AppID) -> Result<AppRecord, StoreError> {
        match self {
            Self::Legacy(s) => s.verify(appid).await,
            Self::Libertine(s) => s.verify(appid).await,
            Self::Snap(s) => s.verify(appid).await,
        }
    }

    /// Complete a wildcard-version identifier
    ///
    /// Picks the lexically-newest version this store advertises for the
    /// package/app pair, or None when the pair is unknown here.
    pub async fn resolve(&self, package: &str, app: &str) -> Option<AppID> {
        match self {
            Self::Legacy(s) => s.resolve(package, app).await,
            Self::Libertine(s) => s.resolve(package, app).await,
            Self::Snap(s) => s.resolve(package, app).await,
        }
    }

    /// Subscribe to this store's discovery events
    pub fn events(&self) -> broadcast::Receiver<StoreEvent> {
        match self {
            Self::Legacy(s) => s.events(),
            Self::Libertine(s) => s.events(),
            Self::Snap(s) => s.events(),
        }
    }

    /// Diff the advertised app set against the last scan, pushing
    /// discovery events for anything that changed
    pub async fn rescan(&self) -> Vec<StoreEvent> {
        match self {
            Self::Legacy(s) => s.rescan().await,
            Self::Libertine(s) => s.rescan().await,
            Self::Snap(s) => s.rescan().await,
        }
    }
}

/// The stores in their fixed lookup order
pub fn default_stores() -> Vec<AppStore> {
    vec![
        AppStore::Legacy(LegacyStore::new()),
        AppStore::Libertine(LibertineStore::new()),
        AppStore::Snap(SnapStore::new()),
    ]
}

/// Query the stores in order; the first store that does not answer
/// NotFound settles the lookup.
pub async fn verify_in_order(
    stores: &[AppStore],
    appid: &AppID,
) -> Result<AppRecord, StoreError> {
    for store in stores {
        match store.verify(appid).await {
            Err(StoreError::NotFound(_)) => continue,
            other => return other,
        }
    }
    Err(StoreError::NotFound(appid.to_string()))
}

/// Per-store bookkeeping for discovery events
pub(crate) struct Discovery {
    events: broadcast::Sender<StoreEvent>,
    seen: std::sync::Mutex<HashSet<AppID>>,
}

impl Discovery {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            events,
            seen: std::sync::Mutex::new(HashSet::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Compare a fresh scan against the previous one and emit the delta
    pub fn diff(&self, current: HashSet<AppID>) -> Vec<StoreEvent> {
        let mut seen = self.seen.lock().unwrap();
        let mut delta = Vec::new();
        for appid in current.difference(&seen) {
            delta.push(StoreEvent::Added(appid.clone()));
        }
        for appid in seen.difference(&current) {
            delta.push(StoreEvent::Removed(appid.clone()));
        }
        *seen = current;
        for event in &delta {
            let _ = self.events.send(event.clone());
        }
        delta
    }
}

/// The per-user data directory
pub(crate) fn user_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("XDG_DATA_HOME") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/".to_string());
    PathBuf::from(home).join(".local/share")
}

/// The system data directories, in search order
pub(crate) fn system_data_dirs() -> Vec<PathBuf> {
    match std::env::var("XDG_DATA_DIRS") {
        Ok(dirs) if !dirs.is_empty() => dirs.split(':').map(PathBuf::from).collect(),
        _ => vec![
            PathBuf::from("/usr/local/share"),
            PathBuf::from("/usr/share"),
        ],
    }
}
