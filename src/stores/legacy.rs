//! Legacy desktop-file store
//!
//! Applications installed as plain desktop files under the XDG data
//! directories. Legacy identifiers have no package and no version, just
//! the desktop file basename.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use tokio::sync::broadcast;

use super::{AppRecord, Discovery, StoreError, StoreEvent, StoreId};
use crate::appid::AppID;
use crate::keyfile::{self, KeyFile};

const DESKTOP_GROUP: &str = "Desktop Entry";
const APPARMOR_KEY: &str = "X-Canonical-AppArmor-Profile";

pub struct LegacyStore {
    user_dir: PathBuf,
    system_dirs: Vec<PathBuf>,
    discovery: Discovery,
}

impl LegacyStore {
    pub fn new() -> Self {
        Self::with_dirs(super::user_data_dir(), super::system_data_dirs())
    }

    /// Build a store over explicit data directories
    pub fn with_dirs(user_dir: PathBuf, system_dirs: Vec<PathBuf>) -> Self {
        Self {
            user_dir,
            system_dirs,
            discovery: Discovery::new(),
        }
    }

    /// Data directories in search order, user first
    fn data_dirs(&self) -> impl Iterator<Item = &PathBuf> {
        std::iter::once(&self.user_dir).chain(self.system_dirs.iter())
    }

    /// Find the first qualifying desktop file for an app name
    ///
    /// A file qualifies when it parses and its Desktop Entry group has an
    /// Exec key; anything else is skipped so a later directory can win.
    async fn load_desktop(&self, app: &str) -> Option<KeyFile> {
        for dir in self.data_dirs() {
            let path = dir.join("applications").join(format!("{}.desktop", app));
            let keyfile = match keyfile::load_keyfile(&path).await {
                Ok(keyfile) => keyfile,
                Err(_) => continue,
            };
            if keyfile.has_key(DESKTOP_GROUP, "Exec") {
                return Some(keyfile);
            }
            log::debug!("Desktop file '{}' is not usable", path.display());
        }
        None
    }

    fn record_from_keyfile(&self, appid: AppID, keyfile: &KeyFile) -> AppRecord {
        AppRecord {
            appid,
            store: StoreId::Legacy,
            exec_template: keyfile
                .get(DESKTOP_GROUP, "Exec")
                .unwrap_or_default()
                .to_string(),
            working_dir: keyfile.get(DESKTOP_GROUP, "Path").map(PathBuf::from),
            apparmor_profile: keyfile.get(DESKTOP_GROUP, APPARMOR_KEY).map(String::from),
            extra_env: HashMap::new(),
        }
    }

    /// True when an AppID has the shape this store owns
    fn owns(appid: &AppID) -> bool {
        appid.package.is_empty() && appid.version.is_empty() && !appid.app_name.is_empty()
    }

    pub async fn list(&self) -> Vec<AppRecord> {
        let mut records: Vec<AppRecord> = Vec::new();
        let mut names = HashSet::new();

        for dir in self.data_dirs() {
            let applications = dir.join("applications");
            let mut entries = match tokio::fs::read_dir(&applications).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let Some(name) = desktop_basename(&entry.path()) else {
                    continue;
                };
                // Earlier directories shadow later ones
                if !names.insert(name.clone()) {
                    continue;
                }
                let Ok(appid) = AppID::new("", &name, "") else {
                    continue;
                };
                if let Some(keyfile) = self.load_desktop(&name).await {
                    records.push(self.record_from_keyfile(appid, &keyfile));
                }
            }
        }

        records
    }

    pub async fn has_app(&self, appid: &AppID) -> bool {
        Self::owns(appid) && self.load_desktop(&appid.app_name).await.is_some()
    }

    pub async fn verify(&self, appid: &AppID) -> Result<AppRecord, StoreError> {
        if !Self::owns(appid) {
            return Err(StoreError::NotFound(appid.to_string()));
        }
        match self.load_desktop(&appid.app_name).await {
            Some(keyfile) => Ok(self.record_from_keyfile(appid.clone(), &keyfile)),
            None => Err(StoreError::NotFound(appid.to_string())),
        }
    }

    pub async fn resolve(&self, package: &str, app: &str) -> Option<AppID> {
        if !package.is_empty() {
            return None;
        }
        if self.load_desktop(app).await.is_some() {
            AppID::new("", app, "").ok()
        } else {
            None
        }
    }

    pub fn events(&self) -> broadcast::Receiver<StoreEvent> {
        self.discovery.subscribe()
    }

    pub async fn rescan(&self) -> Vec<StoreEvent> {
        let current = self.list().await.into_iter().map(|r| r.appid).collect();
        self.discovery.diff(current)
    }
}

impl Default for LegacyStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Basename of a `.desktop` file, None for anything else
pub(crate) fn desktop_basename(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    name.strip_suffix(".desktop").map(String::from)
}
