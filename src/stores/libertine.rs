//! Libertine container store
//!
//! Applications living inside libertine containers. The container id is
//! the package field and the version is pinned to "0.0" since containers
//! carry no revisions of their own. The exec line is wrapped with
//! libertine-launch so the app starts inside its container.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use tokio::sync::broadcast;

use super::legacy::desktop_basename;
use super::{AppRecord, Discovery, StoreError, StoreEvent, StoreId};
use crate::appid::AppID;
use crate::keyfile::{self, KeyFile};

const DESKTOP_GROUP: &str = "Desktop Entry";

/// All libertine apps report this version
pub const LIBERTINE_VERSION: &str = "0.0";

pub struct LibertineStore {
    containers_dir: PathBuf,
    discovery: Discovery,
}

impl LibertineStore {
    pub fn new() -> Self {
        Self::with_dir(
            super::user_data_dir()
                .join("libertine-container")
                .join("user-data"),
        )
    }

    pub fn with_dir(containers_dir: PathBuf) -> Self {
        Self {
            containers_dir,
            discovery: Discovery::new(),
        }
    }

    /// Application directories inside one container, in search order
    fn app_dirs(&self, container: &str) -> [PathBuf; 2] {
        let root = self.containers_dir.join(container);
        [
            root.join("usr/share/applications"),
            root.join(".local/share/applications"),
        ]
    }

    async fn load_desktop(&self, container: &str, app: &str) -> Option<KeyFile> {
        for dir in self.app_dirs(container) {
            let path = dir.join(format!("{}.desktop", app));
            let keyfile = match keyfile::load_keyfile(&path).await {
                Ok(keyfile) => keyfile,
                Err(_) => continue,
            };
            if keyfile.has_key(DESKTOP_GROUP, "Exec") {
                return Some(keyfile);
            }
            log::debug!("Container desktop file '{}' is not usable", path.display());
        }
        None
    }

    fn record_from_keyfile(&self, appid: AppID, keyfile: &KeyFile) -> AppRecord {
        let exec = keyfile.get(DESKTOP_GROUP, "Exec").unwrap_or_default();
        AppRecord {
            store: StoreId::Libertine,
            // The launch wrapper puts the command inside its container
            exec_template: format!("libertine-launch \"--id={}\" {}", appid.package, exec),
            working_dir: None,
            apparmor_profile: None,
            extra_env: HashMap::new(),
            appid,
        }
    }

    fn owns(appid: &AppID) -> bool {
        !appid.package.is_empty()
            && !appid.app_name.is_empty()
            && appid.version == LIBERTINE_VERSION
    }

    /// Container ids present on disk
    async fn containers(&self) -> Vec<String> {
        let mut containers = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.containers_dir).await {
            Ok(entries) => entries,
            Err(_) => return containers,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                if let Some(name) = entry.file_name().to_str() {
                    containers.push(name.to_string());
                }
            }
        }
        containers
    }

    pub async fn list(&self) -> Vec<AppRecord> {
        let mut records = Vec::new();
        for container in self.containers().await {
            let mut names = HashSet::new();
            for dir in self.app_dirs(&container) {
                let mut entries = match tokio::fs::read_dir(&dir).await {
                    Ok(entries) => entries,
                    Err(_) => continue,
                };
                while let Ok(Some(entry)) = entries.next_entry().await {
                    let Some(name) = desktop_basename(&entry.path()) else {
                        continue;
                    };
                    if !names.insert(name.clone()) {
                        continue;
                    }
                    let Ok(appid) = AppID::new(&container, &name, LIBERTINE_VERSION) else {
                        continue;
                    };
                    if let Some(keyfile) = self.load_desktop(&container, &name).await {
                        records.push(self.record_from_keyfile(appid, &keyfile));
                    }
                }
            }
        }
        records
    }

    pub async fn has_app(&self, appid: &AppID) -> bool {
        Self::owns(appid)
            && self
                .load_desktop(&appid.package, &appid.app_name)
                .await
                .is_some()
    }

    pub async fn verify(&self, appid: &AppID) -> Result<AppRecord, StoreError> {
        if !Self::owns(appid) {
            return Err(StoreError::NotFound(appid.to_string()));
        }
        match self.load_desktop(&appid.package, &appid.app_name).await {
            Some(keyfile) => Ok(self.record_from_keyfile(appid.clone(), &keyfile)),
            None => Err(StoreError::NotFound(appid.to_string())),
        }
    }

    pub async fn resolve(&self, package: &str, app: &str) -> Option<AppID> {
        if package.is_empty() {
            return None;
        }
        if self.load_desktop(package, app).await.is_some() {
            AppID::new(package, app, LIBERTINE_VERSION).ok()
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

impl Default for LibertineStore {
    fn default() -> Self {
        Self::new()
    }
}
